//! Accounts, users and groups
//!
//! Security subjects are ordinary objects with a unique name. The name
//! indices are derived state: they are rebuilt from the object map after a
//! snapshot is loaded. Group membership edges do not hold references; they
//! are cleaned up when either side is destroyed.

use crate::object::{MasterObject, ObjectBody};
use crate::object_manager::ObjectManager;
use crate::proto::{Permission, Verb, VerbRequest, VerbResponse};
use crate::type_handler::{
    AccountMode, CreateAttributes, TransactionMode, TypeHandler, verb_not_supported,
};
use cellmaster_common::{Error, ObjectId, ObjectType, Result, UserId};
use cellmaster_meta_state::MutationContext;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::info;

/// Attribute carrying the name of a security subject.
pub const NAME_ATTRIBUTE: &str = "name";

pub const ROOT_USER_NAME: &str = "root";
pub const SUPERUSERS_GROUP_NAME: &str = "superusers";
pub const SYS_ACCOUNT_NAME: &str = "sys";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountObject {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserObject {
    pub name: String,
    pub member_of: BTreeSet<ObjectId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupObject {
    pub name: String,
    pub members: BTreeSet<ObjectId>,
    pub member_of: BTreeSet<ObjectId>,
}

/// Name to id maps of accounts, users and groups.
#[derive(Debug, Default)]
pub struct SecurityIndex {
    names: HashMap<ObjectType, HashMap<String, ObjectId>>,
}

impl SecurityIndex {
    pub fn clear(&mut self) {
        self.names.clear();
    }

    pub fn find(&self, object_type: ObjectType, name: &str) -> Option<ObjectId> {
        self.names.get(&object_type)?.get(name).copied()
    }

    pub fn insert(&mut self, object_type: ObjectType, name: &str, id: ObjectId) {
        let previous = self
            .names
            .entry(object_type)
            .or_default()
            .insert(name.to_string(), id);
        assert!(
            previous.is_none(),
            "{object_type} name {name:?} is registered twice"
        );
    }

    pub fn remove(&mut self, object_type: ObjectType, name: &str) {
        let removed = self
            .names
            .get_mut(&object_type)
            .and_then(|names| names.remove(name));
        assert!(removed.is_some(), "{object_type} name {name:?} is not registered");
    }

    /// Rebuild from every named object, dead ones included: a name stays
    /// taken until its object is destroyed.
    pub fn rebuild<'a>(&mut self, objects: impl Iterator<Item = &'a MasterObject>) {
        self.clear();
        for object in objects {
            if let Some(name) = object.name() {
                self.insert(object.object_type(), name, object.id());
            }
        }
    }
}

const fn is_security_type(object_type: ObjectType) -> bool {
    matches!(
        object_type,
        ObjectType::Account | ObjectType::User | ObjectType::Group
    )
}

impl ObjectManager {
    /// Fail with `AuthorizationError` unless `user_id` holds `permission`
    /// on `object_id`.
    pub fn check_permission(
        &self,
        user_id: UserId,
        object_id: ObjectId,
        permission: Permission,
    ) -> Result<()> {
        if self.is_permitted(user_id, object_id, permission) {
            Ok(())
        } else {
            Err(Error::AuthorizationError {
                user_id,
                object_id,
                permission: permission.to_string(),
            })
        }
    }

    pub fn is_permitted(&self, user_id: UserId, object_id: ObjectId, permission: Permission) -> bool {
        let Some(user) = self.find_alive_object(user_id) else {
            return false;
        };
        if user.as_user().is_none() {
            return false;
        }
        let Some(object) = self.find_alive_object(object_id) else {
            return false;
        };
        if !self
            .object_handler(object)
            .supported_permissions()
            .contains(&permission)
        {
            return false;
        }
        if self.is_superuser(user_id) {
            return true;
        }

        let object_type = object.object_type();
        match permission {
            Permission::Read => true,
            Permission::Write | Permission::Remove => {
                !object.is_schema()
                    && !is_security_type(object_type)
                    && object_type != ObjectType::Master
            }
            Permission::Create => {
                object_type == ObjectType::Master
                    || (object.is_schema() && !is_security_type(object_type))
            }
            Permission::Administer => false,
        }
    }

    /// Root and every transitive member of the superusers group.
    pub fn is_superuser(&self, user_id: UserId) -> bool {
        user_id == self.root_user_id() || self.transitive_groups(user_id).contains(&self.superusers_id())
    }

    /// Groups `subject` belongs to, directly or through other groups.
    pub fn transitive_groups(&self, subject: ObjectId) -> BTreeSet<ObjectId> {
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([subject]);
        while let Some(id) = queue.pop_front() {
            let Some(groups) = self.find_object(id).and_then(MasterObject::member_of) else {
                continue;
            };
            for group in groups {
                if visited.insert(*group) {
                    queue.push_back(*group);
                }
            }
        }
        visited
    }

    pub fn find_account(&self, name: &str) -> Option<ObjectId> {
        self.security().find(ObjectType::Account, name)
    }

    pub fn find_user(&self, name: &str) -> Option<ObjectId> {
        self.security().find(ObjectType::User, name)
    }

    pub fn find_group(&self, name: &str) -> Option<ObjectId> {
        self.security().find(ObjectType::Group, name)
    }

    fn validate_membership(&self, group_id: ObjectId, member: ObjectId, add: bool) -> Result<()> {
        let group = self
            .find_alive_object(group_id)
            .and_then(MasterObject::as_group)
            .ok_or(Error::NoSuchObject(group_id))?;
        let subject = self
            .find_alive_object(member)
            .ok_or(Error::NoSuchObject(member))?;
        if subject.member_of().is_none() {
            return Err(Error::invalid_argument(format!(
                "{member} is a {} and cannot be a group member",
                subject.object_type()
            )));
        }

        if !add {
            if !group.members.contains(&member) {
                return Err(Error::invalid_argument(format!(
                    "{member} is not a member of group {:?}",
                    group.name
                )));
            }
            return Ok(());
        }
        if group.members.contains(&member) {
            return Err(Error::invalid_argument(format!(
                "{member} is already a member of group {:?}",
                group.name
            )));
        }
        if member == group_id || self.transitive_groups(group_id).contains(&member) {
            return Err(Error::invalid_argument(format!(
                "adding {member} to group {:?} would create a cycle",
                group.name
            )));
        }
        Ok(())
    }

    fn add_member(&mut self, group_id: ObjectId, member: ObjectId) {
        self.get_object_mut(group_id)
            .as_group_mut()
            .unwrap_or_else(|| panic!("object {group_id} is not a group"))
            .members
            .insert(member);
        self.get_object_mut(member)
            .member_of_mut()
            .unwrap_or_else(|| panic!("object {member} cannot be a group member"))
            .insert(group_id);
    }

    fn remove_member(&mut self, group_id: ObjectId, member: ObjectId) {
        if let Some(group) = self.find_object_mut(group_id).and_then(MasterObject::as_group_mut) {
            group.members.remove(&member);
        }
        if let Some(groups) = self.find_object_mut(member).and_then(MasterObject::member_of_mut) {
            groups.remove(&group_id);
        }
    }
}

/// Handler shared by accounts, users and groups.
pub struct SecurityHandler {
    object_type: ObjectType,
}

impl SecurityHandler {
    pub const fn account() -> Self {
        Self {
            object_type: ObjectType::Account,
        }
    }

    pub const fn user() -> Self {
        Self {
            object_type: ObjectType::User,
        }
    }

    pub const fn group() -> Self {
        Self {
            object_type: ObjectType::Group,
        }
    }

    fn name(attributes: &CreateAttributes) -> Result<&str> {
        let name = attributes
            .get(NAME_ATTRIBUTE)
            .ok_or_else(|| Error::invalid_argument("attribute \"name\" is required"))?;
        let name = std::str::from_utf8(name)
            .map_err(|_| Error::invalid_argument("attribute \"name\" must be UTF-8"))?;
        if name.is_empty() {
            return Err(Error::invalid_argument("attribute \"name\" must not be empty"));
        }
        Ok(name)
    }
}

impl TypeHandler for SecurityHandler {
    fn object_type(&self) -> ObjectType {
        self.object_type
    }

    fn transaction_mode(&self) -> TransactionMode {
        TransactionMode::Forbidden
    }

    fn account_mode(&self) -> AccountMode {
        AccountMode::Forbidden
    }

    fn supported_permissions(&self) -> &'static [Permission] {
        match self.object_type {
            ObjectType::Group => &[
                Permission::Read,
                Permission::Write,
                Permission::Remove,
                Permission::Administer,
            ],
            _ => &[Permission::Read, Permission::Write, Permission::Remove],
        }
    }

    fn validate_create(&self, objects: &ObjectManager, attributes: &CreateAttributes) -> Result<()> {
        let name = Self::name(attributes)?;
        if objects.security().find(self.object_type, name).is_some() {
            return Err(Error::invalid_argument(format!(
                "{} {name:?} already exists",
                self.object_type
            )));
        }
        Ok(())
    }

    fn create_body(&self, attributes: &CreateAttributes) -> ObjectBody {
        let name = attributes
            .get(NAME_ATTRIBUTE)
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .unwrap_or_default();
        match self.object_type {
            ObjectType::Account => ObjectBody::Account(AccountObject { name }),
            ObjectType::User => ObjectBody::User(UserObject {
                name,
                member_of: BTreeSet::new(),
            }),
            _ => ObjectBody::Group(GroupObject {
                name,
                members: BTreeSet::new(),
                member_of: BTreeSet::new(),
            }),
        }
    }

    fn on_created(&self, objects: &mut ObjectManager, object: &MasterObject) {
        if let Some(name) = object.name() {
            objects.security_mut().insert(self.object_type, name, object.id());
            if !objects.is_recovery() {
                info!(object_id = %object.id(), name, "{} created", self.object_type);
            }
        }
    }

    fn destroy(&self, objects: &mut ObjectManager, object: &MasterObject) {
        if let Some(name) = object.name() {
            objects.security_mut().remove(self.object_type, name);
        }
        if let Some(groups) = object.member_of() {
            for group in groups {
                objects.remove_member(*group, object.id());
            }
        }
        if let Some(group) = object.as_group() {
            for member in &group.members {
                objects.remove_member(object.id(), *member);
            }
        }
    }

    fn validate_set(&self, key: &str) -> Result<()> {
        if key == NAME_ATTRIBUTE {
            return Err(Error::invalid_argument(format!(
                "attribute \"name\" of a {} cannot be changed",
                self.object_type
            )));
        }
        Ok(())
    }

    fn validate_verb(&self, objects: &ObjectManager, request: &VerbRequest) -> Result<()> {
        match request.verb {
            Verb::AddMember { member } if self.object_type == ObjectType::Group => {
                objects.validate_membership(request.object_id, member, true)
            }
            Verb::RemoveMember { member } if self.object_type == ObjectType::Group => {
                objects.validate_membership(request.object_id, member, false)
            }
            ref verb => Err(verb_not_supported(verb, self.object_type)),
        }
    }

    fn invoke(
        &self,
        objects: &mut ObjectManager,
        _context: &mut MutationContext,
        request: &VerbRequest,
    ) -> Result<VerbResponse> {
        match request.verb {
            Verb::AddMember { member } if self.object_type == ObjectType::Group => {
                objects.add_member(request.object_id, member);
            }
            Verb::RemoveMember { member } if self.object_type == ObjectType::Group => {
                objects.remove_member(request.object_id, member);
            }
            ref verb => return Err(verb_not_supported(verb, self.object_type)),
        }
        Ok(VerbResponse::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestMaster;

    fn membership(master: &mut TestMaster, group: ObjectId, verb: Verb) -> Result<VerbResponse> {
        let root = master.root();
        master.execute(VerbRequest::new(group, root, verb))
    }

    #[test]
    fn test_names_are_unique() {
        let mut master = TestMaster::new();
        let alice = master.create_user("alice");
        assert_eq!(master.objects().find_user("alice"), Some(alice));

        let root = master.root();
        let duplicate = VerbRequest::new(
            master.objects().master_id(),
            root,
            Verb::Create {
                object_type: ObjectType::User,
                account: None,
                attributes: [(NAME_ATTRIBUTE.to_string(), b"alice".to_vec())].into(),
            },
        );
        let err = master.execute(duplicate).unwrap_err();
        assert!(err.to_string().contains("already exists"));

        // Same name, different kind.
        master.create_group("alice");
    }

    #[test]
    fn test_name_is_required_and_immutable() {
        let mut master = TestMaster::new();
        let root = master.root();
        let nameless = VerbRequest::new(
            master.objects().master_id(),
            root,
            Verb::Create {
                object_type: ObjectType::Account,
                account: None,
                attributes: CreateAttributes::new(),
            },
        );
        assert!(matches!(master.execute(nameless).unwrap_err(), Error::InvalidArgument(_)));

        let account = master.create_account("ops");
        let rename = VerbRequest::new(
            account,
            root,
            Verb::Set {
                key: NAME_ATTRIBUTE.into(),
                value: b"dev".to_vec(),
            },
        );
        assert!(matches!(master.execute(rename).unwrap_err(), Error::InvalidArgument(_)));
    }

    #[test]
    fn test_membership_and_cycles() {
        let mut master = TestMaster::new();
        let alice = master.create_user("alice");
        let admins = master.create_group("admins");
        let staff = master.create_group("staff");

        membership(&mut master, staff, Verb::AddMember { member: admins }).unwrap();
        membership(&mut master, admins, Verb::AddMember { member: alice }).unwrap();
        assert!(master.objects().transitive_groups(alice).contains(&staff));

        let err = membership(&mut master, admins, Verb::AddMember { member: staff }).unwrap_err();
        assert!(err.to_string().contains("cycle"));
        let err = membership(&mut master, admins, Verb::AddMember { member: alice }).unwrap_err();
        assert!(err.to_string().contains("already a member"));

        membership(&mut master, admins, Verb::RemoveMember { member: alice }).unwrap();
        assert!(master.objects().transitive_groups(alice).is_empty());
        let err = membership(&mut master, admins, Verb::RemoveMember { member: alice }).unwrap_err();
        assert!(err.to_string().contains("not a member"));
    }

    #[test]
    fn test_membership_verbs_only_on_groups() {
        let mut master = TestMaster::new();
        let alice = master.create_user("alice");
        let bob = master.create_user("bob");
        // Users do not support `Administer`, so the check fails before dispatch.
        let err = membership(&mut master, alice, Verb::AddMember { member: bob }).unwrap_err();
        assert!(matches!(err, Error::AuthorizationError { .. }));
    }

    #[test]
    fn test_destroy_cleans_up_membership_and_name() {
        let mut master = TestMaster::new();
        let alice = master.create_user("alice");
        let admins = master.create_group("admins");
        membership(&mut master, admins, Verb::AddMember { member: alice }).unwrap();

        master.remove_object(alice);
        // Dead but not destroyed: the name stays taken.
        assert_eq!(master.objects().find_user("alice"), Some(alice));
        master.sweep();

        assert_eq!(master.objects().find_user("alice"), None);
        let group = master.objects().get_object(admins).as_group().unwrap();
        assert!(group.members.is_empty());
        master.create_user("alice");
    }

    #[test]
    fn test_superuser_membership_grants_everything() {
        let mut master = TestMaster::new();
        let alice = master.create_user("alice");
        let sys = master.objects().sys_account_id();
        assert!(!master.objects().is_permitted(alice, sys, Permission::Write));

        let superusers = master.objects().superusers_id();
        membership(&mut master, superusers, Verb::AddMember { member: alice }).unwrap();
        assert!(master.objects().is_superuser(alice));
        assert!(master.objects().is_permitted(alice, sys, Permission::Write));
        // Still bounded by what the type supports.
        assert!(!master.objects().is_permitted(alice, sys, Permission::Administer));
    }

    #[test]
    fn test_index_rebuild() {
        let mut master = TestMaster::new();
        let alice = master.create_user("alice");
        let mut index = SecurityIndex::default();
        index.rebuild(master.objects().objects());
        assert_eq!(index.find(ObjectType::User, "alice"), Some(alice));
        assert_eq!(index.find(ObjectType::User, ROOT_USER_NAME), Some(master.objects().root_user_id()));
        assert_eq!(index.find(ObjectType::Account, "alice"), None);
    }
}
