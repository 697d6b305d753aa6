//! Object records held by the object manager

use crate::security::{AccountObject, GroupObject, UserObject};
use crate::transaction::TransactionObject;
use cellmaster_common::{AccountId, ObjectId, ObjectType, TransactionId};
use serde::{Deserialize, Serialize};

/// The universal part of every object: identity and lifetime counters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectBase {
    id: ObjectId,
    ref_counter: i32,
    /// Locks are held by in-flight operations of the local replica and are
    /// never part of the replicated state.
    #[serde(skip)]
    lock_counter: i32,
}

impl ObjectBase {
    pub const fn new(id: ObjectId) -> Self {
        Self {
            id,
            ref_counter: 0,
            lock_counter: 0,
        }
    }

    pub const fn id(&self) -> ObjectId {
        self.id
    }

    pub const fn ref_counter(&self) -> i32 {
        self.ref_counter
    }

    pub const fn lock_counter(&self) -> i32 {
        self.lock_counter
    }

    pub const fn is_alive(&self) -> bool {
        self.ref_counter > 0
    }

    pub const fn is_locked(&self) -> bool {
        self.lock_counter > 0
    }

    /// Returns the new reference count.
    pub(crate) fn increment_ref(&mut self) -> i32 {
        self.ref_counter += 1;
        self.ref_counter
    }

    pub(crate) fn decrement_ref(&mut self) -> i32 {
        assert!(
            self.ref_counter > 0,
            "reference counter of {} drops below zero",
            self.id
        );
        self.ref_counter -= 1;
        self.ref_counter
    }

    pub(crate) fn increment_lock(&mut self) -> i32 {
        self.lock_counter += 1;
        self.lock_counter
    }

    pub(crate) fn decrement_lock(&mut self) -> i32 {
        assert!(
            self.lock_counter > 0,
            "lock counter of {} drops below zero",
            self.id
        );
        self.lock_counter -= 1;
        self.lock_counter
    }

    pub(crate) fn reset_locks(&mut self) {
        self.lock_counter = 0;
    }
}

/// Kind-specific payload of an object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectBody {
    /// The cell's master object; the target of creation verbs.
    Master,
    /// Per-type permission anchor for creation.
    Schema,
    Transaction(TransactionObject),
    Account(AccountObject),
    User(UserObject),
    Group(GroupObject),
    /// Attribute-only objects (documents, tags).
    Plain,
}

/// An object together with its ownership edges.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterObject {
    pub base: ObjectBase,
    /// Account charged for the object; the object holds a reference to it.
    pub account: Option<AccountId>,
    /// Transaction the object is staged in until it commits or aborts.
    pub staging_transaction: Option<TransactionId>,
    /// The object holds one reference on behalf of whoever may remove it.
    pub owned: bool,
    /// Created by the cell itself; cannot be removed.
    pub builtin: bool,
    pub body: ObjectBody,
}

impl MasterObject {
    pub const fn new(id: ObjectId, body: ObjectBody) -> Self {
        Self {
            base: ObjectBase::new(id),
            account: None,
            staging_transaction: None,
            owned: false,
            builtin: false,
            body,
        }
    }

    pub const fn id(&self) -> ObjectId {
        self.base.id()
    }

    /// Type of the object; schema objects report the type they describe.
    pub fn object_type(&self) -> ObjectType {
        self.base.id().object_type().unwrap_or(ObjectType::Null)
    }

    pub const fn is_alive(&self) -> bool {
        self.base.is_alive()
    }

    pub const fn is_schema(&self) -> bool {
        matches!(self.body, ObjectBody::Schema)
    }

    pub const fn as_transaction(&self) -> Option<&TransactionObject> {
        match &self.body {
            ObjectBody::Transaction(transaction) => Some(transaction),
            _ => None,
        }
    }

    pub fn as_transaction_mut(&mut self) -> Option<&mut TransactionObject> {
        match &mut self.body {
            ObjectBody::Transaction(transaction) => Some(transaction),
            _ => None,
        }
    }

    pub const fn as_user(&self) -> Option<&UserObject> {
        match &self.body {
            ObjectBody::User(user) => Some(user),
            _ => None,
        }
    }

    pub const fn as_group(&self) -> Option<&GroupObject> {
        match &self.body {
            ObjectBody::Group(group) => Some(group),
            _ => None,
        }
    }

    pub fn as_group_mut(&mut self) -> Option<&mut GroupObject> {
        match &mut self.body {
            ObjectBody::Group(group) => Some(group),
            _ => None,
        }
    }

    /// Security name of an account, user or group.
    pub fn name(&self) -> Option<&str> {
        match &self.body {
            ObjectBody::Account(account) => Some(&account.name),
            ObjectBody::User(user) => Some(&user.name),
            ObjectBody::Group(group) => Some(&group.name),
            _ => None,
        }
    }

    /// Groups this user or group belongs to.
    pub fn member_of(&self) -> Option<&std::collections::BTreeSet<ObjectId>> {
        match &self.body {
            ObjectBody::User(user) => Some(&user.member_of),
            ObjectBody::Group(group) => Some(&group.member_of),
            _ => None,
        }
    }

    pub fn member_of_mut(&mut self) -> Option<&mut std::collections::BTreeSet<ObjectId>> {
        match &mut self.body {
            ObjectBody::User(user) => Some(&mut user.member_of),
            ObjectBody::Group(group) => Some(&mut group.member_of),
            _ => None,
        }
    }
}
