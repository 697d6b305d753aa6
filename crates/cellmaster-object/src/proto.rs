//! Verbs and mutation messages of the object layer
//!
//! A write verb travels through the log as a [`ReqExecute`] carrying the
//! serialized request verbatim, so replaying the record reproduces the
//! original response byte for byte.

use bytes::Bytes;
use cellmaster_common::{
    Error, NULL_TRANSACTION_ID, ObjectId, ObjectType, Result, TransactionId, UserId, WireError,
};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Mutation applying one write verb.
pub const EXECUTE_VERB_MUTATION: &str = "ObjectManager.ExecuteVerb";

/// Mutation destroying a batch of zombies.
pub const DESTROY_OBJECTS_MUTATION: &str = "ObjectManager.DestroyObjects";

/// Client-chosen id of a write; retransmissions reuse it.
pub type MutationId = Uuid;

/// Permissions checked against objects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum Permission {
    #[display("read")]
    Read,
    #[display("write")]
    Write,
    #[display("remove")]
    Remove,
    #[display("create")]
    Create,
    #[display("administer")]
    Administer,
}

/// Operation invoked on one object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verb {
    GetId,
    /// `None` returns every visible attribute.
    Get { key: Option<String> },
    List,
    /// `None` tests the object itself.
    Exists { key: Option<String> },
    CheckPermission { permission: Permission },
    Set { key: String, value: Vec<u8> },
    /// `None` drops the owner edge of the object.
    Remove { key: Option<String> },
    Create {
        object_type: ObjectType,
        account: Option<ObjectId>,
        attributes: BTreeMap<String, Vec<u8>>,
    },
    StartTransaction {
        parent: Option<TransactionId>,
        timeout_ms: Option<u64>,
    },
    CommitTransaction,
    AbortTransaction,
    AddMember { member: ObjectId },
    RemoveMember { member: ObjectId },
}

impl Verb {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::GetId => "GetId",
            Self::Get { .. } => "Get",
            Self::List => "List",
            Self::Exists { .. } => "Exists",
            Self::CheckPermission { .. } => "CheckPermission",
            Self::Set { .. } => "Set",
            Self::Remove { .. } => "Remove",
            Self::Create { .. } => "Create",
            Self::StartTransaction { .. } => "StartTransaction",
            Self::CommitTransaction => "CommitTransaction",
            Self::AbortTransaction => "AbortTransaction",
            Self::AddMember { .. } => "AddMember",
            Self::RemoveMember { .. } => "RemoveMember",
        }
    }

    /// Whether the verb changes state and must go through a mutation.
    pub const fn is_mutating(&self) -> bool {
        !matches!(
            self,
            Self::GetId
                | Self::Get { .. }
                | Self::List
                | Self::Exists { .. }
                | Self::CheckPermission { .. }
        )
    }

    /// Permission the caller needs on the target object.
    pub const fn required_permission(&self) -> Permission {
        match self {
            Self::GetId
            | Self::Get { .. }
            | Self::List
            | Self::Exists { .. }
            | Self::CheckPermission { .. } => Permission::Read,
            Self::Set { .. }
            | Self::CommitTransaction
            | Self::AbortTransaction => Permission::Write,
            Self::Remove { .. } => Permission::Remove,
            Self::Create { .. } | Self::StartTransaction { .. } => Permission::Create,
            Self::AddMember { .. } | Self::RemoveMember { .. } => Permission::Administer,
        }
    }
}

/// Result of a verb.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerbResponse {
    Id(ObjectId),
    Value(Vec<u8>),
    Attributes(BTreeMap<String, Vec<u8>>),
    Keys(Vec<String>),
    Exists(bool),
    Allowed(bool),
    Created(ObjectId),
    Ok,
}

/// A verb addressed to an object on behalf of a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerbRequest {
    pub object_id: ObjectId,
    pub transaction_id: TransactionId,
    pub user_id: UserId,
    pub mutation_id: Option<MutationId>,
    pub verb: Verb,
}

impl VerbRequest {
    pub const fn new(object_id: ObjectId, user_id: UserId, verb: Verb) -> Self {
        Self {
            object_id,
            transaction_id: NULL_TRANSACTION_ID,
            user_id,
            mutation_id: None,
            verb,
        }
    }

    #[must_use]
    pub const fn with_transaction(mut self, transaction_id: TransactionId) -> Self {
        self.transaction_id = transaction_id;
        self
    }

    #[must_use]
    pub const fn with_mutation_id(mut self, mutation_id: MutationId) -> Self {
        self.mutation_id = Some(mutation_id);
        self
    }
}

/// Logged form of a write verb.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqExecute {
    pub object_id: ObjectId,
    pub transaction_id: TransactionId,
    pub user_id: UserId,
    pub mutation_id: Option<MutationId>,
    pub request_parts: Vec<Vec<u8>>,
}

impl ReqExecute {
    pub fn from_request(request: &VerbRequest) -> Result<Self> {
        Ok(Self {
            object_id: request.object_id,
            transaction_id: request.transaction_id,
            user_id: request.user_id,
            mutation_id: request.mutation_id,
            request_parts: vec![bincode::serialize(&request.verb)?],
        })
    }

    pub fn to_request(&self) -> Result<VerbRequest> {
        let body = self
            .request_parts
            .first()
            .ok_or_else(|| Error::Serialization("execute request has no parts".into()))?;
        Ok(VerbRequest {
            object_id: self.object_id,
            transaction_id: self.transaction_id,
            user_id: self.user_id,
            mutation_id: self.mutation_id,
            verb: bincode::deserialize(body)?,
        })
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Logged batch of objects to destroy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqDestroyObjects {
    pub object_ids: Vec<ObjectId>,
}

impl ReqDestroyObjects {
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Response of an applied verb, as stored in the mutation response and
/// the response keeper.
pub type ExecuteResult = std::result::Result<VerbResponse, WireError>;

pub fn encode_response(result: &Result<VerbResponse>) -> Result<Bytes> {
    let wire: ExecuteResult = match result {
        Ok(response) => Ok(response.clone()),
        Err(e) => Err(WireError::from(e)),
    };
    Ok(Bytes::from(bincode::serialize(&wire)?))
}

pub fn decode_response(bytes: &[u8]) -> Result<VerbResponse> {
    let wire: ExecuteResult = bincode::deserialize(bytes)?;
    wire.map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellmaster_common::ErrorCode;

    #[test]
    fn test_verb_classification() {
        assert!(!Verb::GetId.is_mutating());
        assert!(!Verb::Exists { key: None }.is_mutating());
        assert!(Verb::Set { key: "k".into(), value: vec![] }.is_mutating());
        assert!(Verb::CommitTransaction.is_mutating());
        assert_eq!(Verb::Remove { key: None }.required_permission(), Permission::Remove);
        assert_eq!(
            Verb::AddMember { member: ObjectId::NULL }.required_permission(),
            Permission::Administer
        );
    }

    #[test]
    fn test_execute_request_carries_verb_verbatim() {
        let request = VerbRequest::new(
            ObjectId::from_parts([1, 2, 3, 4]),
            ObjectId::from_parts([5, 101, 0, 0]),
            Verb::Set { key: "k".into(), value: b"v".to_vec() },
        )
        .with_mutation_id(Uuid::new_v4());
        let logged = ReqExecute::from_bytes(&ReqExecute::from_request(&request).unwrap().to_bytes().unwrap()).unwrap();
        assert_eq!(logged.to_request().unwrap(), request);
    }

    #[test]
    fn test_error_response_keeps_code() {
        let bytes = encode_response(&Err(Error::NoSuchObject(ObjectId::from_parts([1, 2, 3, 4])))).unwrap();
        let err = decode_response(&bytes).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ResolveError);
        assert!(err.is_resolve_error());
        assert!(err.to_string().contains("1-2-3-4"));
    }
}
