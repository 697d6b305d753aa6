//! Object manager
//!
//! The registry of every master object of the cell. All state here is
//! mutated on the state thread while applying logged mutations, with the
//! single exception of lock counters, which belong to the local leader and
//! are never replicated.

use crate::attributes::{AttributeSet, AttributeStore};
use crate::garbage_collector::GarbageCollector;
use crate::object::{MasterObject, ObjectBody};
use crate::proto::{MutationId, Permission, ReqDestroyObjects, ReqExecute, encode_response};
use crate::response_keeper::ResponseKeeper;
use crate::security::{
    AccountObject, GroupObject, NAME_ATTRIBUTE, ROOT_USER_NAME, SUPERUSERS_GROUP_NAME,
    SYS_ACCOUNT_NAME, SecurityHandler, SecurityIndex, UserObject,
};
use crate::transaction::TransactionHandler;
use crate::type_handler::{
    AccountMode, CreateAttributes, MasterHandler, PlainHandler, SchemaHandler, TransactionMode,
    TypeHandler,
};
use cellmaster_common::config::{ObjectManagerConfig, TransactionManagerConfig};
use cellmaster_common::{
    AccountId, CellId, Error, MasterConfig, ObjectId, ObjectType, Result, TransactionId, UserId,
    VersionedObjectId,
};
use cellmaster_meta_state::{AutomatonState, MutationContext};
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

pub struct ObjectManager {
    cell_id: CellId,
    config: ObjectManagerConfig,
    transaction_config: TransactionManagerConfig,
    handlers: HashMap<ObjectType, Arc<dyn TypeHandler>>,
    schema_handler: Arc<dyn TypeHandler>,
    objects: HashMap<ObjectId, MasterObject>,
    attributes: AttributeStore,
    gc: GarbageCollector,
    security: SecurityIndex,
    responses: ResponseKeeper,
    recovery: bool,
    leading: bool,
    lock_generation: u64,
    snapshot_keys: Option<Vec<ObjectId>>,
}

impl ObjectManager {
    /// Create the manager with every built-in type registered and the
    /// built-in objects in place.
    pub fn new(config: &MasterConfig) -> Self {
        let mut manager = Self {
            cell_id: config.cell_id,
            config: config.object_manager.clone(),
            transaction_config: config.transaction_manager.clone(),
            handlers: HashMap::new(),
            schema_handler: Arc::new(SchemaHandler),
            objects: HashMap::new(),
            attributes: AttributeStore::new(),
            gc: GarbageCollector::new(),
            security: SecurityIndex::default(),
            responses: ResponseKeeper::new(config.object_manager.response_keeper_capacity),
            recovery: false,
            leading: false,
            lock_generation: 0,
            snapshot_keys: None,
        };
        manager.register_handler(Arc::new(TransactionHandler));
        manager.register_handler(Arc::new(MasterHandler));
        manager.register_handler(Arc::new(SecurityHandler::account()));
        manager.register_handler(Arc::new(SecurityHandler::user()));
        manager.register_handler(Arc::new(SecurityHandler::group()));
        manager.register_handler(Arc::new(PlainHandler::document()));
        manager.register_handler(Arc::new(PlainHandler::tag()));
        manager.create_builtins();
        manager
    }

    /// Register the handler of a type. Only allowed before any object of
    /// that type exists.
    pub fn register_handler(&mut self, handler: Arc<dyn TypeHandler>) {
        let object_type = handler.object_type();
        let previous = self.handlers.insert(object_type, handler);
        assert!(previous.is_none(), "handler for {object_type} registered twice");
    }

    pub fn find_handler(&self, object_type: ObjectType) -> Option<Arc<dyn TypeHandler>> {
        self.handlers.get(&object_type).cloned()
    }

    pub fn handler(&self, object_type: ObjectType) -> Arc<dyn TypeHandler> {
        self.find_handler(object_type)
            .unwrap_or_else(|| panic!("no handler for type {object_type}"))
    }

    /// Handler responsible for an existing object.
    pub fn object_handler(&self, object: &MasterObject) -> Arc<dyn TypeHandler> {
        if object.is_schema() {
            self.schema_handler.clone()
        } else {
            self.handler(object.object_type())
        }
    }

    pub const fn cell_id(&self) -> CellId {
        self.cell_id
    }

    pub const fn config(&self) -> &ObjectManagerConfig {
        &self.config
    }

    pub const fn transaction_config(&self) -> &TransactionManagerConfig {
        &self.transaction_config
    }

    pub const fn is_recovery(&self) -> bool {
        self.recovery
    }

    /// Set once leader recovery completes; only then may locks be taken.
    pub const fn is_leading(&self) -> bool {
        self.leading
    }

    pub const fn gc(&self) -> &GarbageCollector {
        &self.gc
    }

    pub const fn responses(&self) -> &ResponseKeeper {
        &self.responses
    }

    pub const fn attributes(&self) -> &AttributeStore {
        &self.attributes
    }

    pub(crate) fn attributes_mut(&mut self) -> &mut AttributeStore {
        &mut self.attributes
    }

    pub const fn security(&self) -> &SecurityIndex {
        &self.security
    }

    pub(crate) fn security_mut(&mut self) -> &mut SecurityIndex {
        &mut self.security
    }

    /// Bumped whenever every lock is dropped at once; lock holders from an
    /// older generation must not unlock.
    pub const fn lock_generation(&self) -> u64 {
        self.lock_generation
    }

    pub const fn master_id(&self) -> ObjectId {
        ObjectId::well_known(ObjectType::Master, self.cell_id, 0)
    }

    pub const fn root_user_id(&self) -> UserId {
        ObjectId::well_known(ObjectType::User, self.cell_id, 1)
    }

    pub const fn superusers_id(&self) -> ObjectId {
        ObjectId::well_known(ObjectType::Group, self.cell_id, 2)
    }

    pub const fn sys_account_id(&self) -> AccountId {
        ObjectId::well_known(ObjectType::Account, self.cell_id, 3)
    }

    pub const fn schema_id(&self, object_type: ObjectType) -> ObjectId {
        ObjectId::schema(object_type, self.cell_id)
    }

    /// Derive a fresh id from the mutation's random stream and log position.
    pub fn generate_id(&self, object_type: ObjectType, context: &mut MutationContext) -> ObjectId {
        let counter = context.version().to_revision();
        loop {
            let hash: u32 = context.random_generator().r#gen();
            let id = ObjectId::make(object_type.value(), self.cell_id, counter, hash);
            if !self.objects.contains_key(&id) {
                return id;
            }
        }
    }

    pub(crate) fn insert_object(&mut self, object: MasterObject) {
        let id = object.id();
        let previous = self.objects.insert(id, object);
        assert!(previous.is_none(), "object {id} is registered twice");
    }

    pub fn find_object(&self, id: ObjectId) -> Option<&MasterObject> {
        self.objects.get(&id)
    }

    pub(crate) fn find_object_mut(&mut self, id: ObjectId) -> Option<&mut MasterObject> {
        self.objects.get_mut(&id)
    }

    /// The object if it still has references.
    pub fn find_alive_object(&self, id: ObjectId) -> Option<&MasterObject> {
        self.find_object(id).filter(|object| object.is_alive())
    }

    pub fn get_object(&self, id: ObjectId) -> &MasterObject {
        self.find_object(id)
            .unwrap_or_else(|| panic!("no such object {id}"))
    }

    pub(crate) fn get_object_mut(&mut self, id: ObjectId) -> &mut MasterObject {
        self.find_object_mut(id)
            .unwrap_or_else(|| panic!("no such object {id}"))
    }

    pub fn objects(&self) -> impl Iterator<Item = &MasterObject> {
        self.objects.values()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Returns the new reference count.
    pub fn ref_object(&mut self, id: ObjectId) -> i32 {
        assert!(
            !self.gc.is_zombie(id) && !self.gc.is_locked_zombie(id),
            "zombie {id} is resurrected"
        );
        let counter = self.get_object_mut(id).base.increment_ref();
        if !self.recovery {
            debug!(object_id = %id, ref_counter = counter, "Object referenced");
        }
        counter
    }

    /// Returns the new reference count. Dropping the last reference hands
    /// the object to the GC.
    pub fn unref_object(&mut self, id: ObjectId) -> i32 {
        let object = self.get_object_mut(id);
        let counter = object.base.decrement_ref();
        let locked = object.base.is_locked();
        if !self.recovery {
            debug!(object_id = %id, ref_counter = counter, "Object unreferenced");
        }
        if counter == 0 {
            self.gc.enqueue(id, locked);
        }
        counter
    }

    /// Keep a live object from being destroyed while an in-flight operation
    /// uses it.
    pub fn lock_object(&mut self, id: ObjectId) -> Result<i32> {
        if !self.leading {
            return Err(Error::unavailable(format!(
                "cannot lock object {id}: replica is not leading"
            )));
        }
        let object = self
            .objects
            .get_mut(&id)
            .filter(|object| object.is_alive())
            .ok_or(Error::NoSuchObject(id))?;
        Ok(object.base.increment_lock())
    }

    pub fn unlock_object(&mut self, id: ObjectId) -> i32 {
        let object = self.get_object_mut(id);
        let counter = object.base.decrement_lock();
        if counter == 0 && !object.is_alive() {
            self.gc.unlock(id);
        }
        counter
    }

    /// Drop every lock of the replica: locks taken before a failover are
    /// abandoned.
    fn release_locks(&mut self) {
        for id in self.gc.unlock_all() {
            if let Some(object) = self.objects.get_mut(&id) {
                object.base.reset_locks();
            }
        }
        for object in self.objects.values_mut() {
            object.base.reset_locks();
        }
        self.lock_generation += 1;
    }

    /// Check a `Create` without changing anything.
    pub fn validate_create(
        &self,
        user_id: UserId,
        transaction_id: TransactionId,
        account: Option<AccountId>,
        object_type: ObjectType,
        attributes: &CreateAttributes,
    ) -> Result<()> {
        let handler = self
            .find_handler(object_type)
            .filter(|handler| handler.is_creatable())
            .ok_or_else(|| {
                Error::invalid_argument(format!("objects of type {object_type} cannot be created"))
            })?;
        self.check_permission(user_id, self.schema_id(object_type), Permission::Create)?;

        match (handler.transaction_mode(), transaction_id.is_null()) {
            (TransactionMode::Required, true) => {
                return Err(Error::TransactionModeViolation {
                    object_type,
                    reason: "a transaction is required".into(),
                });
            }
            (TransactionMode::Forbidden, false) => {
                return Err(Error::TransactionModeViolation {
                    object_type,
                    reason: format!("cannot be created under transaction {transaction_id}"),
                });
            }
            _ => {}
        }
        if !transaction_id.is_null() {
            self.active_transaction(transaction_id)?;
        }

        match (handler.account_mode(), account) {
            (AccountMode::Required, None) => {
                return Err(Error::AccountModeViolation {
                    object_type,
                    reason: "an account is required".into(),
                });
            }
            (AccountMode::Forbidden, Some(account)) => {
                return Err(Error::AccountModeViolation {
                    object_type,
                    reason: format!("cannot be charged to account {account}"),
                });
            }
            _ => {}
        }
        if let Some(account) = account {
            self.find_alive_object(account)
                .filter(|object| matches!(object.body, ObjectBody::Account(_)))
                .ok_or(Error::NoSuchObject(account))?;
        }

        handler.validate_create(self, attributes)
    }

    /// Create an object from validated arguments and return its id.
    pub(crate) fn create_object(
        &mut self,
        context: &mut MutationContext,
        transaction_id: TransactionId,
        account: Option<AccountId>,
        object_type: ObjectType,
        attributes: &CreateAttributes,
    ) -> ObjectId {
        let handler = self.handler(object_type);
        let id = self.generate_id(object_type, context);
        let mut object = MasterObject::new(id, handler.create_body(attributes));
        object.account = account;

        let staged = !transaction_id.is_null() && handler.supports_staging();
        if staged {
            object.staging_transaction = Some(transaction_id);
        } else {
            object.owned = true;
        }
        let created = object.clone();
        self.insert_object(object);
        self.ref_object(id);
        if let Some(account) = account {
            self.ref_object(account);
        }
        if staged {
            self.transaction_mut(transaction_id).staged_objects.push(id);
        }

        let trunk = VersionedObjectId::trunk(id);
        for (key, value) in attributes {
            self.attributes.write(trunk, key, Some(value.clone()));
        }
        handler.on_created(self, &created);

        if !self.recovery {
            info!(
                object_id = %id,
                %object_type,
                transaction_id = %transaction_id,
                staged,
                "Object created"
            );
        }
        id
    }

    /// Destroy an unlocked zombie.
    fn destroy_object(&mut self, id: ObjectId) {
        self.gc.dequeue(id);
        let Some(object) = self.objects.remove(&id) else {
            panic!("destroyed object {id} is not registered");
        };
        assert!(!object.is_alive(), "destroyed object {id} is alive");

        let handler = self.object_handler(&object);
        handler.destroy(self, &object);
        self.attributes.remove_object(id);
        if let Some(account) = object.account {
            self.unref_object(account);
        }
        if !self.recovery {
            debug!(object_id = %id, object_type = %object.object_type(), "Object destroyed");
        }
    }

    /// Apply a `DestroyObjects` mutation.
    pub fn destroy_objects(&mut self, context: &mut MutationContext) {
        let request = ReqDestroyObjects::from_bytes(context.data())
            .unwrap_or_else(|e| panic!("malformed destroy mutation at {}: {e}", context.version()));
        for id in &request.object_ids {
            self.destroy_object(*id);
        }
        self.gc.check_empty();
        if !context.is_recovery() {
            debug!(
                version = %context.version(),
                count = request.object_ids.len(),
                "Objects destroyed"
            );
        }
    }

    /// Apply an `ExecuteVerb` mutation. The response bytes are kept when
    /// the request carries a mutation id.
    pub fn replay_verb(&mut self, context: &mut MutationContext) {
        let request = ReqExecute::from_bytes(context.data())
            .and_then(|execute| execute.to_request())
            .unwrap_or_else(|e| panic!("malformed execute mutation at {}: {e}", context.version()));

        if let Some(kept) = request.mutation_id.and_then(|id| self.responses.find(&id)) {
            context.set_response(kept);
            return;
        }

        let result = self
            .validate_write(&request)
            .and_then(|()| self.apply_write(context, &request));
        if !context.is_recovery() {
            debug!(
                version = %context.version(),
                object_id = %request.object_id,
                verb = request.verb.name(),
                ok = result.is_ok(),
                "Verb applied"
            );
        }
        let response = encode_response(&result)
            .unwrap_or_else(|e| panic!("cannot encode verb response: {e}"));
        if let Some(mutation_id) = request.mutation_id {
            self.responses.keep(mutation_id, response.clone());
        }
        context.set_response(response);
    }

    /// Create the cell's own objects: the master, the root user, the
    /// superusers group, the system account and one schema per type.
    fn create_builtins(&mut self) {
        let master_id = self.master_id();
        let root_id = self.root_user_id();
        let superusers_id = self.superusers_id();
        let sys_id = self.sys_account_id();

        self.create_builtin(master_id, ObjectBody::Master, None);
        self.create_builtin(
            root_id,
            ObjectBody::User(UserObject {
                name: ROOT_USER_NAME.into(),
                member_of: BTreeSet::from([superusers_id]),
            }),
            Some(ROOT_USER_NAME),
        );
        self.create_builtin(
            superusers_id,
            ObjectBody::Group(GroupObject {
                name: SUPERUSERS_GROUP_NAME.into(),
                members: BTreeSet::from([root_id]),
                member_of: BTreeSet::new(),
            }),
            Some(SUPERUSERS_GROUP_NAME),
        );
        self.create_builtin(
            sys_id,
            ObjectBody::Account(AccountObject {
                name: SYS_ACCOUNT_NAME.into(),
            }),
            Some(SYS_ACCOUNT_NAME),
        );
        for object_type in ObjectType::ALL {
            self.create_builtin(self.schema_id(object_type), ObjectBody::Schema, None);
        }
    }

    fn create_builtin(&mut self, id: ObjectId, body: ObjectBody, name: Option<&str>) {
        let mut object = MasterObject::new(id, body);
        object.builtin = true;
        object.owned = true;
        self.insert_object(object);
        self.ref_object(id);
        if let (Some(name), Some(object_type)) = (name, id.object_type()) {
            self.security.insert(object_type, name, id);
            self.attributes
                .write(VersionedObjectId::trunk(id), NAME_ATTRIBUTE, Some(name.as_bytes().to_vec()));
        }
    }

    pub(crate) fn save_keys(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self.objects.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Start loading a snapshot: drop whatever `clear` created and remember
    /// the key set the values must match.
    pub(crate) fn load_keys(&mut self, ids: Vec<ObjectId>) {
        self.objects.clear();
        self.objects.reserve(ids.len());
        self.snapshot_keys = Some(ids);
    }

    pub(crate) fn save_values(&self) -> Vec<MasterObject> {
        let mut objects: Vec<MasterObject> = self.objects.values().cloned().collect();
        objects.sort_unstable_by_key(MasterObject::id);
        objects
    }

    pub(crate) fn load_values(&mut self, objects: Vec<MasterObject>) {
        for object in objects {
            self.insert_object(object);
        }
        if let Some(mut keys) = self.snapshot_keys.take() {
            keys.sort_unstable();
            assert_eq!(
                keys,
                self.save_keys(),
                "snapshot values diverge from the key section"
            );
        }
    }

    pub(crate) fn save_attributes(&self) -> Vec<(VersionedObjectId, AttributeSet)> {
        self.attributes.entries()
    }

    pub(crate) fn load_attributes(&mut self, entries: Vec<(VersionedObjectId, AttributeSet)>) {
        self.attributes.load(entries);
    }

    pub(crate) fn save_zombies(&self) -> Vec<ObjectId> {
        self.gc.save()
    }

    pub(crate) fn load_zombies(&mut self, ids: Vec<ObjectId>) {
        self.gc.load(ids);
    }

    pub(crate) fn save_responses(&self) -> Vec<(MutationId, Vec<u8>)> {
        self.responses.save()
    }

    pub(crate) fn load_responses(&mut self, entries: Vec<(MutationId, Vec<u8>)>) {
        self.responses.load(entries);
    }

    /// Check that every zombie is registered and dead, and every dead
    /// object is a zombie.
    fn check_zombies(&self) {
        for object in self.objects.values() {
            let id = object.id();
            let tracked = self.gc.is_zombie(id) || self.gc.is_locked_zombie(id);
            assert_eq!(
                !object.is_alive(),
                tracked,
                "object {id} with {} references is misfiled in the GC",
                object.base.ref_counter()
            );
        }
        assert_eq!(
            self.gc.zombie_count() + self.gc.locked_zombie_count(),
            self.objects.values().filter(|object| !object.is_alive()).count(),
            "GC tracks unregistered objects"
        );
    }
}

impl AutomatonState for ObjectManager {
    fn clear(&mut self) {
        self.leading = false;
        self.snapshot_keys = None;
        self.objects.clear();
        self.attributes.clear();
        self.gc.clear();
        self.security.clear();
        self.responses.clear();
        self.create_builtins();
    }

    fn on_loaded(&mut self) {
        self.security.rebuild(self.objects.values());
        self.check_zombies();
        info!(
            objects = self.objects.len(),
            zombies = self.gc.zombie_count(),
            "Object manager loaded"
        );
    }

    fn on_recovery_started(&mut self) {
        self.recovery = true;
        self.leading = false;
        self.gc.set_profiling(false);
    }

    fn on_recovery_complete(&mut self) {
        self.recovery = false;
        self.gc.set_profiling(true);
        self.release_locks();
    }

    fn on_leader_recovery_complete(&mut self) {
        self.leading = true;
    }

    fn on_stop_leading(&mut self) {
        self.leading = false;
        self.release_locks();
    }

    fn on_start_following(&mut self) {
        self.leading = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{Verb, VerbRequest, VerbResponse};
    use crate::testing::{TestMaster, document_account};

    #[test]
    fn test_builtins() {
        let master = TestMaster::new();
        let objects = master.objects();
        for id in [
            objects.master_id(),
            objects.root_user_id(),
            objects.superusers_id(),
            objects.sys_account_id(),
        ] {
            let object = objects.find_alive_object(id).unwrap();
            assert!(object.builtin);
            assert!(object.owned);
            assert_eq!(object.base.ref_counter(), 1);
        }
        for object_type in ObjectType::ALL {
            assert!(objects.find_alive_object(objects.schema_id(object_type)).unwrap().is_schema());
        }
        assert_eq!(objects.find_user(ROOT_USER_NAME), Some(objects.root_user_id()));
        assert_eq!(objects.find_account(SYS_ACCOUNT_NAME), Some(objects.sys_account_id()));
        assert!(objects.is_superuser(objects.root_user_id()));
    }

    #[test]
    fn test_generate_id_is_deterministic() {
        let master = TestMaster::new();
        let objects = master.objects();
        let mut first = TestMaster::context(7, 42);
        let mut second = TestMaster::context(7, 42);
        let a = objects.generate_id(ObjectType::Document, &mut first);
        let b = objects.generate_id(ObjectType::Document, &mut second);
        assert_eq!(a, b);
        assert_eq!(a.object_type(), Some(ObjectType::Document));
        assert_eq!(a.cell_id(), objects.cell_id());

        let mut other_seed = TestMaster::context(7, 43);
        assert_ne!(a, objects.generate_id(ObjectType::Document, &mut other_seed));
    }

    #[test]
    fn test_forbidden_account_is_rejected_before_logging() {
        let master = TestMaster::new();
        let objects = master.objects();
        let request = VerbRequest::new(
            objects.master_id(),
            objects.root_user_id(),
            Verb::Create {
                object_type: ObjectType::User,
                account: Some(objects.sys_account_id()),
                attributes: [(NAME_ATTRIBUTE.to_string(), b"alice".to_vec())].into(),
            },
        );
        let before = objects.object_count();
        let err = objects.validate_write(&request).unwrap_err();
        assert!(matches!(err, Error::AccountModeViolation { object_type: ObjectType::User, .. }));
        assert!(err.to_string().contains("cannot be charged to account"));
        assert_eq!(objects.object_count(), before);
    }

    #[test]
    fn test_transaction_mode_violations() {
        let mut master = TestMaster::new();
        let root = master.objects().root_user_id();
        let tag = Verb::Create {
            object_type: ObjectType::Tag,
            account: None,
            attributes: CreateAttributes::new(),
        };
        let err = master.execute(VerbRequest::new(master.objects().master_id(), root, tag)).unwrap_err();
        assert!(matches!(err, Error::TransactionModeViolation { .. }));

        let tx = master.start_transaction(None);
        let user = Verb::Create {
            object_type: ObjectType::User,
            account: None,
            attributes: [(NAME_ATTRIBUTE.to_string(), b"bob".to_vec())].into(),
        };
        let err = master
            .execute(VerbRequest::new(master.objects().master_id(), root, user).with_transaction(tx))
            .unwrap_err();
        assert!(matches!(err, Error::TransactionModeViolation { object_type: ObjectType::User, .. }));
    }

    #[test]
    fn test_create_refs_account_until_destroyed() {
        let mut master = TestMaster::new();
        let account = master.create_account("dev");
        let document = master.create_document(account, None);
        assert_eq!(master.objects().get_object(account).base.ref_counter(), 2);
        assert_eq!(master.objects().get_object(document).account, Some(account));

        master.remove_object(document);
        assert!(master.objects().gc().is_zombie(document));
        assert_eq!(master.objects().get_object(account).base.ref_counter(), 2);

        master.sweep();
        assert!(master.objects().find_object(document).is_none());
        assert_eq!(master.objects().get_object(account).base.ref_counter(), 1);
        assert!(master.objects().attributes().find(VersionedObjectId::trunk(document)).is_none());
    }

    #[test]
    fn test_ref_counting_invariant() {
        let mut master = TestMaster::new();
        let account = document_account(&mut master);
        let documents: Vec<ObjectId> = (0..5).map(|_| master.create_document(account, None)).collect();
        for id in &documents[..3] {
            master.remove_object(*id);
        }
        master.objects().check_zombies();
        for id in &documents[..3] {
            let object = master.objects().get_object(*id);
            assert_eq!(object.base.ref_counter(), 0);
            assert!(master.objects().gc().is_zombie(*id) ^ master.objects().gc().is_locked_zombie(*id));
        }
        master.sweep();
        master.objects().check_zombies();
        assert_eq!(master.objects().gc().zombie_count(), 0);
    }

    #[test]
    fn test_locked_zombie_scenario() {
        let mut master = TestMaster::new();
        let account = document_account(&mut master);
        let document = master.create_document(account, None);
        master.objects_mut().on_leader_recovery_complete();

        master.objects_mut().lock_object(document).unwrap();
        master.objects_mut().lock_object(document).unwrap();
        master.remove_object(document);
        assert!(master.objects().gc().is_locked_zombie(document));
        assert!(master.objects_mut().lock_object(document).is_err());

        let collect = master.objects().gc().collect();
        assert_eq!(master.objects_mut().unlock_object(document), 1);
        assert!(master.objects().gc().is_locked_zombie(document));
        assert_eq!(master.objects_mut().unlock_object(document), 0);
        assert!(master.objects().gc().is_zombie(document));

        assert_eq!(master.sweep(), 1);
        assert!(master.objects().find_object(document).is_none());
        assert!(futures::FutureExt::now_or_never(collect).is_some());
    }

    #[test]
    fn test_recovery_releases_locks() {
        let mut master = TestMaster::new();
        let account = document_account(&mut master);
        let document = master.create_document(account, None);
        master.objects_mut().on_leader_recovery_complete();
        master.objects_mut().lock_object(document).unwrap();
        master.remove_object(document);
        let generation = master.objects().lock_generation();

        master.objects_mut().on_recovery_started();
        assert!(master.objects().is_recovery());
        assert!(!master.objects().is_leading());
        master.objects_mut().on_recovery_complete();
        assert!(master.objects().gc().is_zombie(document));
        assert_eq!(master.objects().get_object(document).base.lock_counter(), 0);
        assert_eq!(master.objects().lock_generation(), generation + 1);
    }

    #[test]
    fn test_no_locks_after_stop_leading() {
        let mut master = TestMaster::new();
        let account = document_account(&mut master);
        let document = master.create_document(account, None);
        assert!(master.objects_mut().lock_object(document).unwrap_err().is_retryable());

        master.objects_mut().on_leader_recovery_complete();
        master.objects_mut().lock_object(document).unwrap();
        master.objects_mut().on_stop_leading();
        master.objects_mut().on_recovery_started();

        let err = master.objects_mut().lock_object(document).unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
        assert_eq!(master.objects().get_object(document).base.lock_counter(), 0);

        // A replicated removal and destroy must find an unlocked zombie.
        master.remove_object(document);
        assert!(master.objects().gc().is_zombie(document));
        master.destroy(&[document]);
        assert!(master.objects().find_object(document).is_none());
    }

    #[test]
    fn test_kept_response_is_returned_verbatim() {
        let mut master = TestMaster::new();
        let root = master.objects().root_user_id();
        let mutation_id = uuid::Uuid::new_v4();
        let create = VerbRequest::new(
            master.objects().master_id(),
            root,
            Verb::Create {
                object_type: ObjectType::Account,
                account: None,
                attributes: [(NAME_ATTRIBUTE.to_string(), b"ops".to_vec())].into(),
            },
        )
        .with_mutation_id(mutation_id);

        let first = master.execute(create.clone()).unwrap();
        let count = master.objects().object_count();
        let second = master.apply(&create).unwrap();
        assert_eq!(first, second);
        assert!(matches!(first, VerbResponse::Created(_)));
        assert_eq!(master.objects().object_count(), count);
    }

    #[test]
    #[should_panic(expected = "not an unlocked zombie")]
    fn test_destroying_live_object_is_fatal() {
        let mut master = TestMaster::new();
        let account = document_account(&mut master);
        let document = master.create_document(account, None);
        master.destroy(&[document]);
    }
}
