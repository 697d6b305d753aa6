//! Per-type object behavior
//!
//! Every object kind registers one [`TypeHandler`] with the object manager.
//! Handlers are stateless; the state they act on is passed in.

use crate::object::{MasterObject, ObjectBody};
use crate::object_manager::ObjectManager;
use crate::proto::{Permission, Verb, VerbRequest, VerbResponse};
use cellmaster_common::{Error, ObjectType, Result};
use cellmaster_meta_state::MutationContext;
use std::collections::BTreeMap;

/// Whether creating an object requires, forbids or allows a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    Required,
    Forbidden,
    Optional,
}

/// Whether creating an object requires, forbids or allows an account.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccountMode {
    Required,
    Forbidden,
    Optional,
}

/// Creation arguments after validation.
pub type CreateAttributes = BTreeMap<String, Vec<u8>>;

pub trait TypeHandler: Send + Sync {
    fn object_type(&self) -> ObjectType;

    fn transaction_mode(&self) -> TransactionMode;

    fn account_mode(&self) -> AccountMode;

    /// Whether the `Create` verb may instantiate this type.
    fn is_creatable(&self) -> bool {
        true
    }

    /// Objects created under a transaction are staged in it.
    fn supports_staging(&self) -> bool {
        false
    }

    fn supported_permissions(&self) -> &'static [Permission];

    /// Type-specific checks of creation arguments.
    fn validate_create(&self, _objects: &ObjectManager, _attributes: &CreateAttributes) -> Result<()> {
        Ok(())
    }

    /// Payload of a new object.
    fn create_body(&self, attributes: &CreateAttributes) -> ObjectBody;

    /// Runs once the new object is registered.
    fn on_created(&self, _objects: &mut ObjectManager, _object: &MasterObject) {}

    /// Release whatever the object holds. It is already gone from the
    /// object map when this runs.
    fn destroy(&self, _objects: &mut ObjectManager, _object: &MasterObject) {}

    /// Check a write of a user attribute.
    fn validate_set(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    /// Check a type-specific verb without changing anything.
    fn validate_verb(&self, _objects: &ObjectManager, request: &VerbRequest) -> Result<()> {
        Err(verb_not_supported(&request.verb, self.object_type()))
    }

    /// Apply a type-specific verb; only called after `validate_verb` passed.
    fn invoke(
        &self,
        _objects: &mut ObjectManager,
        _context: &mut MutationContext,
        request: &VerbRequest,
    ) -> Result<VerbResponse> {
        Err(verb_not_supported(&request.verb, self.object_type()))
    }
}

pub fn verb_not_supported(verb: &Verb, object_type: impl ToString) -> Error {
    Error::VerbNotSupported {
        verb: verb.name().to_string(),
        object_type: object_type.to_string(),
    }
}

/// The cell's master object: creates objects and starts transactions.
pub struct MasterHandler;

impl TypeHandler for MasterHandler {
    fn object_type(&self) -> ObjectType {
        ObjectType::Master
    }

    fn transaction_mode(&self) -> TransactionMode {
        TransactionMode::Forbidden
    }

    fn account_mode(&self) -> AccountMode {
        AccountMode::Forbidden
    }

    fn is_creatable(&self) -> bool {
        false
    }

    fn supported_permissions(&self) -> &'static [Permission] {
        &[Permission::Read, Permission::Create]
    }

    fn create_body(&self, _attributes: &CreateAttributes) -> ObjectBody {
        ObjectBody::Master
    }

    fn validate_verb(&self, objects: &ObjectManager, request: &VerbRequest) -> Result<()> {
        match &request.verb {
            Verb::Create {
                object_type,
                account,
                attributes,
            } => objects.validate_create(
                request.user_id,
                request.transaction_id,
                *account,
                *object_type,
                attributes,
            ),
            Verb::StartTransaction { parent, .. } => {
                objects.validate_start_transaction(request.user_id, *parent)
            }
            verb => Err(verb_not_supported(verb, self.object_type())),
        }
    }

    fn invoke(
        &self,
        objects: &mut ObjectManager,
        context: &mut MutationContext,
        request: &VerbRequest,
    ) -> Result<VerbResponse> {
        match &request.verb {
            Verb::Create {
                object_type,
                account,
                attributes,
            } => {
                let id = objects.create_object(
                    context,
                    request.transaction_id,
                    *account,
                    *object_type,
                    attributes,
                );
                Ok(VerbResponse::Created(id))
            }
            Verb::StartTransaction { parent, timeout_ms } => {
                let id = objects.start_transaction(context, *parent, *timeout_ms);
                Ok(VerbResponse::Created(id))
            }
            verb => Err(verb_not_supported(verb, self.object_type())),
        }
    }
}

/// Schema objects: permission anchors for creating objects of one type.
pub struct SchemaHandler;

impl TypeHandler for SchemaHandler {
    fn object_type(&self) -> ObjectType {
        ObjectType::Null
    }

    fn transaction_mode(&self) -> TransactionMode {
        TransactionMode::Forbidden
    }

    fn account_mode(&self) -> AccountMode {
        AccountMode::Forbidden
    }

    fn is_creatable(&self) -> bool {
        false
    }

    fn supported_permissions(&self) -> &'static [Permission] {
        &[Permission::Read, Permission::Create]
    }

    fn create_body(&self, _attributes: &CreateAttributes) -> ObjectBody {
        ObjectBody::Schema
    }

    fn validate_set(&self, key: &str) -> Result<()> {
        Err(Error::invalid_argument(format!(
            "attribute {key:?} cannot be set on a schema object"
        )))
    }
}

/// Attribute-only objects such as documents and tags.
pub struct PlainHandler {
    object_type: ObjectType,
    transaction_mode: TransactionMode,
    account_mode: AccountMode,
}

impl PlainHandler {
    pub const fn new(
        object_type: ObjectType,
        transaction_mode: TransactionMode,
        account_mode: AccountMode,
    ) -> Self {
        Self {
            object_type,
            transaction_mode,
            account_mode,
        }
    }

    /// Documents are charged to an account and may be created under a transaction.
    pub const fn document() -> Self {
        Self::new(ObjectType::Document, TransactionMode::Optional, AccountMode::Required)
    }

    /// Tags only exist as part of a transaction's work.
    pub const fn tag() -> Self {
        Self::new(ObjectType::Tag, TransactionMode::Required, AccountMode::Optional)
    }
}

impl TypeHandler for PlainHandler {
    fn object_type(&self) -> ObjectType {
        self.object_type
    }

    fn transaction_mode(&self) -> TransactionMode {
        self.transaction_mode
    }

    fn account_mode(&self) -> AccountMode {
        self.account_mode
    }

    fn supports_staging(&self) -> bool {
        true
    }

    fn supported_permissions(&self) -> &'static [Permission] {
        &[Permission::Read, Permission::Write, Permission::Remove]
    }

    fn create_body(&self, _attributes: &CreateAttributes) -> ObjectBody {
        ObjectBody::Plain
    }
}
