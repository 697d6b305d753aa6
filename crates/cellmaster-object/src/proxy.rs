//! Verb execution against resolved objects
//!
//! Reads run directly against the local state. Writes are validated first
//! (without touching anything, so a rejected write is never logged) and
//! then applied while the `ExecuteVerb` mutation is applied.

use crate::object::MasterObject;
use crate::object_manager::ObjectManager;
use crate::proto::{Verb, VerbRequest, VerbResponse};
use crate::type_handler::verb_not_supported;
use cellmaster_common::{Error, ObjectId, Result, TransactionId, VersionedObjectId};
use cellmaster_meta_state::MutationContext;

impl ObjectManager {
    /// The object as seen under `chain`: alive, and if staged, staged in a
    /// transaction of the chain.
    fn visible_object(&self, id: ObjectId, chain: &[TransactionId]) -> Option<&MasterObject> {
        self.find_alive_object(id).filter(|object| {
            object
                .staging_transaction
                .is_none_or(|transaction_id| chain.contains(&transaction_id))
        })
    }

    fn resolve(&self, request: &VerbRequest) -> Result<(&MasterObject, Vec<TransactionId>)> {
        let chain = self.transaction_chain(request.transaction_id)?;
        let object = self
            .visible_object(request.object_id, &chain)
            .ok_or(Error::NoSuchObject(request.object_id))?;
        self.check_permission(request.user_id, object.id(), request.verb.required_permission())?;
        Ok((object, chain))
    }

    /// Execute a non-mutating verb.
    pub fn execute_read(&self, request: &VerbRequest) -> Result<VerbResponse> {
        if request.verb.is_mutating() {
            return Err(Error::invalid_argument(format!(
                "verb {} mutates state",
                request.verb.name()
            )));
        }
        if let Verb::Exists { key: None } = request.verb {
            let chain = self.transaction_chain(request.transaction_id)?;
            return Ok(VerbResponse::Exists(
                self.visible_object(request.object_id, &chain).is_some(),
            ));
        }

        let (object, chain) = self.resolve(request)?;
        let id = object.id();
        match &request.verb {
            Verb::GetId => Ok(VerbResponse::Id(id)),
            Verb::Get { key: Some(key) } => self
                .attributes()
                .lookup(id, &chain, key)
                .map(|value| VerbResponse::Value(value.to_vec()))
                .ok_or_else(|| Error::NoSuchAttribute {
                    object_id: id,
                    key: key.clone(),
                }),
            Verb::Get { key: None } => Ok(VerbResponse::Attributes(
                self.attributes().list(id, &chain),
            )),
            Verb::List => Ok(VerbResponse::Keys(
                self.attributes().list(id, &chain).into_keys().collect(),
            )),
            Verb::Exists { key: Some(key) } => Ok(VerbResponse::Exists(
                self.attributes().lookup(id, &chain, key).is_some(),
            )),
            Verb::CheckPermission { permission } => Ok(VerbResponse::Allowed(
                self.is_permitted(request.user_id, id, *permission),
            )),
            verb => Err(verb_not_supported(verb, object.object_type())),
        }
    }

    /// Check a mutating verb without changing anything.
    pub fn validate_write(&self, request: &VerbRequest) -> Result<()> {
        if !request.verb.is_mutating() {
            return Err(Error::invalid_argument(format!(
                "verb {} does not mutate state",
                request.verb.name()
            )));
        }
        let (object, chain) = self.resolve(request)?;
        let handler = self.object_handler(object);
        match &request.verb {
            Verb::Set { key, .. } => {
                if key.is_empty() {
                    return Err(Error::invalid_argument("attribute key must not be empty"));
                }
                handler.validate_set(key)
            }
            Verb::Remove { key: Some(key) } => {
                handler.validate_set(key)?;
                if self.attributes().lookup(object.id(), &chain, key).is_none() {
                    return Err(Error::NoSuchAttribute {
                        object_id: object.id(),
                        key: key.clone(),
                    });
                }
                Ok(())
            }
            Verb::Remove { key: None } => {
                if object.builtin {
                    return Err(Error::InvalidObjectState {
                        object_id: object.id(),
                        reason: "built-in objects cannot be removed".into(),
                    });
                }
                if !request.transaction_id.is_null() {
                    return Err(Error::invalid_argument(
                        "objects can only be removed outside of transactions",
                    ));
                }
                if !object.owned {
                    return Err(Error::InvalidObjectState {
                        object_id: object.id(),
                        reason: "object has no owner to remove it".into(),
                    });
                }
                Ok(())
            }
            _ => handler.validate_verb(self, request),
        }
    }

    /// Apply a validated mutating verb.
    pub(crate) fn apply_write(
        &mut self,
        context: &mut MutationContext,
        request: &VerbRequest,
    ) -> Result<VerbResponse> {
        let handler = self.object_handler(self.get_object(request.object_id));
        match &request.verb {
            Verb::Set { key, value } => {
                self.write_attribute(request, key, Some(value.clone()));
                Ok(VerbResponse::Ok)
            }
            Verb::Remove { key: Some(key) } => {
                self.write_attribute(request, key, None);
                Ok(VerbResponse::Ok)
            }
            Verb::Remove { key: None } => {
                self.get_object_mut(request.object_id).owned = false;
                self.unref_object(request.object_id);
                Ok(VerbResponse::Ok)
            }
            _ => handler.invoke(self, context, request),
        }
    }

    fn write_attribute(&mut self, request: &VerbRequest, key: &str, value: Option<Vec<u8>>) {
        let id = VersionedObjectId::branched(request.object_id, request.transaction_id);
        self.attributes_mut().write(id, key, value);
        if id.is_branched() {
            self.transaction_mut(request.transaction_id)
                .branched_objects
                .insert(request.object_id);
        }
    }
}
