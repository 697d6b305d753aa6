//! Transactions
//!
//! A transaction is an object referenced by itself for as long as it is
//! active. Finishing it drops that reference and leaves the object to the
//! GC. Writes under a transaction go to branched attribute sets; objects
//! created under it are staged and hold a reference owned by it.

use crate::object::{MasterObject, ObjectBody};
use crate::object_manager::ObjectManager;
use crate::proto::{Permission, Verb, VerbRequest, VerbResponse};
use crate::type_handler::{
    AccountMode, CreateAttributes, TransactionMode, TypeHandler, verb_not_supported,
};
use cellmaster_common::{
    Error, NULL_TRANSACTION_ID, ObjectId, ObjectType, Result, TransactionId, UserId,
    VersionedObjectId,
};
use cellmaster_meta_state::MutationContext;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum TransactionState {
    #[display("active")]
    Active,
    #[display("committed")]
    Committed,
    #[display("aborted")]
    Aborted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionObject {
    pub parent: Option<TransactionId>,
    pub nested: BTreeSet<TransactionId>,
    /// Objects created under this transaction, in creation order.
    pub staged_objects: Vec<ObjectId>,
    /// Objects with an attribute delta in this transaction.
    pub branched_objects: BTreeSet<ObjectId>,
    pub start_time_ms: u64,
    pub timeout_ms: u64,
    pub state: TransactionState,
}

impl TransactionObject {
    pub const fn new(parent: Option<TransactionId>, start_time_ms: u64, timeout_ms: u64) -> Self {
        Self {
            parent,
            nested: BTreeSet::new(),
            staged_objects: Vec::new(),
            branched_objects: BTreeSet::new(),
            start_time_ms,
            timeout_ms,
            state: TransactionState::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    pub const fn deadline_ms(&self) -> u64 {
        self.start_time_ms.saturating_add(self.timeout_ms)
    }
}

impl ObjectManager {
    /// An active transaction, or the reason it cannot be used.
    pub fn active_transaction(&self, id: TransactionId) -> Result<&TransactionObject> {
        let transaction = self
            .find_alive_object(id)
            .and_then(MasterObject::as_transaction)
            .ok_or(Error::NoSuchObject(id))?;
        if !transaction.is_active() {
            return Err(Error::InvalidObjectState {
                object_id: id,
                reason: format!("transaction is {}", transaction.state),
            });
        }
        Ok(transaction)
    }

    /// Transactions a read under `transaction_id` looks through, innermost
    /// first and ending with the trunk.
    pub fn transaction_chain(&self, transaction_id: TransactionId) -> Result<Vec<TransactionId>> {
        let mut chain = Vec::new();
        let mut current = Some(transaction_id).filter(|id| !id.is_null());
        while let Some(id) = current {
            chain.push(id);
            current = self.active_transaction(id)?.parent;
        }
        chain.push(NULL_TRANSACTION_ID);
        Ok(chain)
    }

    pub(crate) fn validate_start_transaction(
        &self,
        user_id: UserId,
        parent: Option<TransactionId>,
    ) -> Result<()> {
        self.check_permission(user_id, self.schema_id(ObjectType::Transaction), Permission::Create)?;
        if let Some(parent) = parent {
            self.active_transaction(parent)?;
        }
        Ok(())
    }

    pub(crate) fn start_transaction(
        &mut self,
        context: &mut MutationContext,
        parent: Option<TransactionId>,
        timeout_ms: Option<u64>,
    ) -> TransactionId {
        let id = self.generate_id(ObjectType::Transaction, context);
        let timeout_ms = self.transaction_config().effective_timeout_ms(timeout_ms);
        let transaction = TransactionObject::new(parent, context.timestamp_ms(), timeout_ms);
        self.insert_object(MasterObject::new(id, ObjectBody::Transaction(transaction)));
        self.ref_object(id);

        if let Some(parent) = parent {
            self.transaction_mut(parent).nested.insert(id);
        }
        if !self.is_recovery() {
            info!(transaction_id = %id, parent_id = ?parent, timeout_ms, "Transaction started");
        }
        id
    }

    pub(crate) fn validate_finish_transaction(&self, id: TransactionId, commit: bool) -> Result<()> {
        let transaction = self.active_transaction(id)?;
        if commit && !transaction.nested.is_empty() {
            return Err(Error::InvalidObjectState {
                object_id: id,
                reason: format!(
                    "transaction has {} active nested transaction(s)",
                    transaction.nested.len()
                ),
            });
        }
        Ok(())
    }

    /// Merge the transaction into its parent (or the trunk) and release it.
    pub(crate) fn commit_transaction(&mut self, id: TransactionId) {
        let transaction = self.finish(id, TransactionState::Committed);
        assert!(
            transaction.nested.is_empty(),
            "committing transaction {id} with active nested transactions"
        );
        let parent_chain = match transaction.parent {
            Some(parent) => self
                .transaction_chain(parent)
                .unwrap_or_else(|e| panic!("parent of committed transaction {id} is unusable: {e}")),
            None => vec![NULL_TRANSACTION_ID],
        };

        for object_id in &transaction.branched_objects {
            self.attributes_mut().merge(*object_id, id, &parent_chain);
        }
        match transaction.parent {
            Some(parent) => {
                let parent_transaction = self.transaction_mut(parent);
                parent_transaction
                    .branched_objects
                    .extend(transaction.branched_objects.iter().copied());
                parent_transaction
                    .staged_objects
                    .extend(transaction.staged_objects.iter().copied());
                for object_id in &transaction.staged_objects {
                    self.get_object_mut(*object_id).staging_transaction = Some(parent);
                }
            }
            None => {
                // The staging reference becomes the object's owner edge.
                for object_id in &transaction.staged_objects {
                    let object = self.get_object_mut(*object_id);
                    object.staging_transaction = None;
                    object.owned = true;
                }
            }
        }

        self.release(id, transaction.parent);
        if !self.is_recovery() {
            info!(
                transaction_id = %id,
                staged = transaction.staged_objects.len(),
                branched = transaction.branched_objects.len(),
                "Transaction committed"
            );
        }
    }

    /// Abort nested transactions, discard deltas and drop staged objects.
    pub(crate) fn abort_transaction(&mut self, id: TransactionId) {
        let nested: Vec<TransactionId> = self.transaction(id).nested.iter().copied().collect();
        for nested_id in nested {
            self.abort_transaction(nested_id);
        }

        let transaction = self.finish(id, TransactionState::Aborted);
        for object_id in &transaction.branched_objects {
            self.attributes_mut()
                .remove(VersionedObjectId::branched(*object_id, id));
        }
        for object_id in &transaction.staged_objects {
            self.get_object_mut(*object_id).staging_transaction = None;
            self.unref_object(*object_id);
        }

        self.release(id, transaction.parent);
        if !self.is_recovery() {
            info!(
                transaction_id = %id,
                staged = transaction.staged_objects.len(),
                "Transaction aborted"
            );
        }
    }

    /// Active transactions whose lease ran out by `now_ms`.
    pub fn expired_transactions(&self, now_ms: u64) -> Vec<TransactionId> {
        let mut expired: Vec<TransactionId> = self
            .objects()
            .filter(|object| object.is_alive())
            .filter_map(|object| {
                let transaction = object.as_transaction()?;
                (transaction.is_active() && transaction.deadline_ms() <= now_ms).then(|| object.id())
            })
            .collect();
        expired.sort_unstable();
        expired
    }

    fn transaction(&self, id: TransactionId) -> &TransactionObject {
        self.get_object(id)
            .as_transaction()
            .unwrap_or_else(|| panic!("object {id} is not a transaction"))
    }

    pub(crate) fn transaction_mut(&mut self, id: TransactionId) -> &mut TransactionObject {
        self.get_object_mut(id)
            .as_transaction_mut()
            .unwrap_or_else(|| panic!("object {id} is not a transaction"))
    }

    /// Mark the transaction finished and take its working sets.
    fn finish(&mut self, id: TransactionId, state: TransactionState) -> TransactionObject {
        let transaction = self.transaction_mut(id);
        assert!(
            transaction.is_active(),
            "transaction {id} is finished twice"
        );
        transaction.state = state;
        TransactionObject {
            parent: transaction.parent,
            nested: std::mem::take(&mut transaction.nested),
            staged_objects: std::mem::take(&mut transaction.staged_objects),
            branched_objects: std::mem::take(&mut transaction.branched_objects),
            start_time_ms: transaction.start_time_ms,
            timeout_ms: transaction.timeout_ms,
            state,
        }
    }

    fn release(&mut self, id: TransactionId, parent: Option<TransactionId>) {
        if let Some(parent) = parent {
            self.transaction_mut(parent).nested.remove(&id);
        }
        self.unref_object(id);
    }
}

pub struct TransactionHandler;

impl TypeHandler for TransactionHandler {
    fn object_type(&self) -> ObjectType {
        ObjectType::Transaction
    }

    fn transaction_mode(&self) -> TransactionMode {
        TransactionMode::Optional
    }

    fn account_mode(&self) -> AccountMode {
        AccountMode::Forbidden
    }

    /// Started through `StartTransaction`, never through `Create`.
    fn is_creatable(&self) -> bool {
        false
    }

    fn supported_permissions(&self) -> &'static [Permission] {
        &[Permission::Read, Permission::Write]
    }

    fn create_body(&self, _attributes: &CreateAttributes) -> ObjectBody {
        unreachable!("transactions are started, not created")
    }

    fn destroy(&self, _objects: &mut ObjectManager, object: &MasterObject) {
        let transaction = object.as_transaction();
        assert!(
            transaction.is_some_and(|transaction| !transaction.is_active()),
            "destroying active transaction {}",
            object.id()
        );
        debug!(transaction_id = %object.id(), "Transaction destroyed");
    }

    fn validate_verb(&self, objects: &ObjectManager, request: &VerbRequest) -> Result<()> {
        match request.verb {
            Verb::CommitTransaction => objects.validate_finish_transaction(request.object_id, true),
            Verb::AbortTransaction => objects.validate_finish_transaction(request.object_id, false),
            ref verb => Err(verb_not_supported(verb, self.object_type())),
        }
    }

    fn invoke(
        &self,
        objects: &mut ObjectManager,
        _context: &mut MutationContext,
        request: &VerbRequest,
    ) -> Result<VerbResponse> {
        match request.verb {
            Verb::CommitTransaction => objects.commit_transaction(request.object_id),
            Verb::AbortTransaction => objects.abort_transaction(request.object_id),
            ref verb => return Err(verb_not_supported(verb, self.object_type())),
        }
        Ok(VerbResponse::Ok)
    }
}
