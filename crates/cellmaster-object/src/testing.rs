//! In-memory driver applying verbs the way the log would.

use crate::object_manager::ObjectManager;
use crate::proto::{
    DESTROY_OBJECTS_MUTATION, EXECUTE_VERB_MUTATION, ReqDestroyObjects, ReqExecute, Verb,
    VerbRequest, VerbResponse, decode_response,
};
use crate::security::NAME_ATTRIBUTE;
use cellmaster_common::{
    AccountId, MasterConfig, MetaVersion, ObjectId, ObjectType, Result, TransactionId, UserId,
};
use cellmaster_meta_state::{MutationContext, MutationRecord};

pub struct TestMaster {
    objects: ObjectManager,
    version: MetaVersion,
    pub now_ms: u64,
}

impl TestMaster {
    pub fn new() -> Self {
        Self {
            objects: ObjectManager::new(&MasterConfig::default()),
            version: MetaVersion::new(0, 0),
            now_ms: 1_000,
        }
    }

    pub const fn objects(&self) -> &ObjectManager {
        &self.objects
    }

    pub fn objects_mut(&mut self) -> &mut ObjectManager {
        &mut self.objects
    }

    /// A context at record `record_count` of segment 0.
    pub fn context(record_count: u32, seed: u64) -> MutationContext {
        let record = MutationRecord {
            mutation_type: EXECUTE_VERB_MUTATION.into(),
            random_seed: seed,
            timestamp_ms: 0,
            data: Vec::new(),
        };
        MutationContext::new(MetaVersion::new(0, record_count), record, false)
    }

    fn next_context(&mut self, mutation_type: &str, data: Vec<u8>) -> MutationContext {
        let record = MutationRecord {
            mutation_type: mutation_type.into(),
            random_seed: self.version.to_revision().wrapping_mul(0x9e37_79b9_7f4a_7c15),
            timestamp_ms: self.now_ms,
            data,
        };
        let context = MutationContext::new(self.version, record, false);
        self.version = self.version.advance();
        context
    }

    /// Apply a write as a logged mutation, skipping the leader-side check.
    pub fn apply(&mut self, request: &VerbRequest) -> Result<VerbResponse> {
        let data = ReqExecute::from_request(request)?.to_bytes()?;
        let mut context = self.next_context(EXECUTE_VERB_MUTATION, data.to_vec());
        self.objects.replay_verb(&mut context);
        let response = context.take_response().expect("execute mutation sets a response");
        decode_response(&response)
    }

    /// Run a verb the way the object service does.
    pub fn execute(&mut self, request: VerbRequest) -> Result<VerbResponse> {
        if !request.verb.is_mutating() {
            return self.objects.execute_read(&request);
        }
        self.objects.validate_write(&request)?;
        self.apply(&request)
    }

    pub fn root(&self) -> UserId {
        self.objects.root_user_id()
    }

    fn create(&mut self, request: VerbRequest) -> ObjectId {
        match self.execute(request).unwrap() {
            VerbResponse::Created(id) => id,
            other => panic!("unexpected response {other:?}"),
        }
    }

    fn create_named(&mut self, object_type: ObjectType, name: &str) -> ObjectId {
        let request = VerbRequest::new(
            self.objects.master_id(),
            self.root(),
            Verb::Create {
                object_type,
                account: None,
                attributes: [(NAME_ATTRIBUTE.to_string(), name.as_bytes().to_vec())].into(),
            },
        );
        self.create(request)
    }

    pub fn create_account(&mut self, name: &str) -> AccountId {
        self.create_named(ObjectType::Account, name)
    }

    pub fn create_user(&mut self, name: &str) -> UserId {
        self.create_named(ObjectType::User, name)
    }

    pub fn create_group(&mut self, name: &str) -> ObjectId {
        self.create_named(ObjectType::Group, name)
    }

    /// A document with a `title` attribute.
    pub fn create_document(&mut self, account: AccountId, transaction: Option<TransactionId>) -> ObjectId {
        let request = VerbRequest::new(
            self.objects.master_id(),
            self.root(),
            Verb::Create {
                object_type: ObjectType::Document,
                account: Some(account),
                attributes: [("title".to_string(), b"untitled".to_vec())].into(),
            },
        )
        .with_transaction(transaction.unwrap_or(ObjectId::NULL));
        self.create(request)
    }

    pub fn start_transaction(&mut self, parent: Option<TransactionId>) -> TransactionId {
        let request = VerbRequest::new(
            self.objects.master_id(),
            self.root(),
            Verb::StartTransaction {
                parent,
                timeout_ms: None,
            },
        );
        self.create(request)
    }

    pub fn commit(&mut self, transaction: TransactionId) {
        let root = self.root();
        self.execute(VerbRequest::new(transaction, root, Verb::CommitTransaction))
            .unwrap();
    }

    pub fn abort(&mut self, transaction: TransactionId) {
        let root = self.root();
        self.execute(VerbRequest::new(transaction, root, Verb::AbortTransaction))
            .unwrap();
    }

    /// Drop the owner edge of an object.
    pub fn remove_object(&mut self, id: ObjectId) {
        let root = self.root();
        self.execute(VerbRequest::new(id, root, Verb::Remove { key: None }))
            .unwrap();
    }

    /// Apply a destroy mutation for `ids`.
    pub fn destroy(&mut self, ids: &[ObjectId]) {
        let data = ReqDestroyObjects {
            object_ids: ids.to_vec(),
        }
        .to_bytes()
        .unwrap();
        let mut context = self.next_context(DESTROY_OBJECTS_MUTATION, data.to_vec());
        self.objects.destroy_objects(&mut context);
    }

    /// Destroy unlocked zombies until none are left; returns how many.
    pub fn sweep(&mut self) -> usize {
        let mut destroyed = 0;
        loop {
            let ids = self.objects.gc().select(usize::MAX);
            if ids.is_empty() {
                return destroyed;
            }
            destroyed += ids.len();
            self.destroy(&ids);
        }
    }
}

/// An account to charge documents to.
pub fn document_account(master: &mut TestMaster) -> AccountId {
    master.create_account("docs")
}
