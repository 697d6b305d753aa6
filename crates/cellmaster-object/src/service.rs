//! Object service
//!
//! The entry point for object verbs on one replica. Reads run against the
//! local state; writes are checked on the leader and then committed as
//! `ExecuteVerb` mutations, and the caller gets the response computed while
//! the mutation was applied.

use crate::automaton::MasterAutomaton;
use crate::garbage_collector::GcStats;
use crate::object_manager::ObjectManager;
use crate::proto::{
    DESTROY_OBJECTS_MUTATION, EXECUTE_VERB_MUTATION, ReqDestroyObjects, ReqExecute, Verb,
    VerbRequest, VerbResponse, decode_response,
};
use cellmaster_common::config::ObjectManagerConfig;
use cellmaster_common::{Error, MetaVersion, ObjectId, Result, TransactionId};
use cellmaster_meta_state::{MetaStateManager, MutationRequest};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

pub struct ObjectService {
    manager: Arc<MetaStateManager<MasterAutomaton>>,
    config: ObjectManagerConfig,
    sweep_lock: tokio::sync::Mutex<()>,
}

impl ObjectService {
    pub fn new(manager: Arc<MetaStateManager<MasterAutomaton>>, config: ObjectManagerConfig) -> Self {
        Self {
            manager,
            config,
            sweep_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub const fn manager(&self) -> &Arc<MetaStateManager<MasterAutomaton>> {
        &self.manager
    }

    pub const fn config(&self) -> &ObjectManagerConfig {
        &self.config
    }

    /// Run `f` against the object manager under the state lock.
    pub fn with_objects<R>(&self, f: impl FnOnce(&ObjectManager) -> R) -> R {
        let state = self.manager.state().lock();
        f(state.automaton().state())
    }

    fn with_objects_mut<R>(&self, f: impl FnOnce(&mut ObjectManager) -> R) -> R {
        let mut state = self.manager.state().lock();
        f(state.automaton_mut().state_mut())
    }

    fn check_leader(&self) -> Result<()> {
        if self.manager.is_active_leader() {
            Ok(())
        } else {
            Err(Error::unavailable(format!(
                "peer {} is not an active leader",
                self.manager.self_id()
            )))
        }
    }

    /// Execute one verb.
    pub async fn execute(&self, request: VerbRequest) -> Result<VerbResponse> {
        if !request.verb.is_mutating() {
            let state = self.manager.state().lock();
            if state.is_recovery() {
                return Err(Error::unavailable("replica is recovering"));
            }
            return state.automaton().state().execute_read(&request);
        }

        if let Err(e) = self.check_leader() {
            debug!(verb = request.verb.name(), "Write rejected: {e}");
            return Err(e);
        }
        let data = {
            let state = self.manager.state().lock();
            let objects = state.automaton().state();
            if let Some(kept) = request.mutation_id.and_then(|id| objects.responses().find(&id)) {
                debug!(object_id = %request.object_id, "Returning kept response");
                return decode_response(&kept);
            }
            objects.validate_write(&request)?;
            ReqExecute::from_request(&request)?.to_bytes()?
        };

        let response = self
            .manager
            .commit_mutation(MutationRequest::new(EXECUTE_VERB_MUTATION, data))
            .await?;
        let bytes = response
            .data
            .ok_or_else(|| Error::internal("execute mutation produced no response"))?;
        decode_response(&bytes)
    }

    /// Execute verbs one after another; each gets its own result.
    pub async fn execute_batch(&self, requests: Vec<VerbRequest>) -> Vec<Result<VerbResponse>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.execute(request).await);
        }
        results
    }

    /// Resolves once the cell has no garbage left.
    pub async fn gc_collect(&self) -> Result<()> {
        self.check_leader()?;
        let collect = self.with_objects(|objects| objects.gc().collect());
        collect.await;
        Ok(())
    }

    /// Keep a live object from being destroyed until the guard is dropped.
    pub fn lock_object(self: &Arc<Self>, id: ObjectId) -> Result<ObjectLockGuard> {
        self.check_leader()?;
        let generation = self.with_objects_mut(|objects| {
            objects.lock_object(id)?;
            Ok::<_, Error>(objects.lock_generation())
        })?;
        Ok(ObjectLockGuard {
            service: self.clone(),
            id,
            generation,
        })
    }

    fn unlock_object(&self, id: ObjectId, generation: u64) {
        self.with_objects_mut(|objects| {
            if objects.lock_generation() == generation {
                objects.unlock_object(id);
            }
        });
    }

    /// Destroy one batch of unlocked zombies. Does nothing unless this
    /// replica is an active leader with garbage to collect.
    pub async fn sweep_garbage(&self) -> Result<usize> {
        let _sweep = self.sweep_lock.lock().await;
        if !self.manager.is_active_leader() {
            return Ok(0);
        }
        let object_ids = self.with_objects(|objects| {
            objects.gc().select(self.config.max_objects_per_gc_sweep)
        });
        if object_ids.is_empty() {
            return Ok(0);
        }

        let count = object_ids.len();
        let data = ReqDestroyObjects { object_ids }.to_bytes()?;
        self.manager
            .commit_mutation(MutationRequest::new(DESTROY_OBJECTS_MUTATION, data))
            .await?;
        debug!(count, "GC sweep committed");
        Ok(count)
    }

    /// Abort every transaction whose lease ran out. Returns how many were
    /// aborted.
    pub async fn abort_expired_transactions(&self) -> Result<usize> {
        if !self.manager.is_active_leader() {
            return Ok(0);
        }
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        let (expired, root): (Vec<TransactionId>, _) = self.with_objects(|objects| {
            (objects.expired_transactions(now_ms), objects.root_user_id())
        });

        let mut aborted = 0;
        for transaction_id in expired {
            let request = VerbRequest::new(transaction_id, root, Verb::AbortTransaction);
            match self.execute(request).await {
                Ok(_) => {
                    aborted += 1;
                    info!(%transaction_id, "Expired transaction aborted");
                }
                // Finished or aborted along with its parent in the meantime.
                Err(e) if e.is_resolve_error() || matches!(e, Error::InvalidObjectState { .. }) => {}
                Err(e) => {
                    warn!(%transaction_id, "Failed to abort expired transaction: {e}");
                    return Err(e);
                }
            }
        }
        Ok(aborted)
    }

    pub fn gc_stats(&self) -> Arc<GcStats> {
        self.with_objects(|objects| objects.gc().stats())
    }

    /// Rotate the changelog and snapshot the state cell-wide.
    pub async fn build_snapshot(&self) -> Result<MetaVersion> {
        self.manager.build_snapshot().await
    }
}

/// Lock on an object held by an in-flight operation.
///
/// Locks taken before the replica lost leadership or went through recovery
/// are dropped wholesale; releasing such a guard does nothing.
pub struct ObjectLockGuard {
    service: Arc<ObjectService>,
    id: ObjectId,
    generation: u64,
}

impl std::fmt::Debug for ObjectLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectLockGuard")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl ObjectLockGuard {
    pub const fn id(&self) -> ObjectId {
        self.id
    }
}

impl Drop for ObjectLockGuard {
    fn drop(&mut self) {
        self.service.unlock_object(self.id, self.generation);
    }
}
