//! Cellmaster Object - the object layer of a master cell
//!
//! This crate implements the replicated object model on top of the meta state:
//! - Object registry with reference and lock counting
//! - Garbage collection of unreferenced objects in logged batches
//! - Attributes with transactional branching
//! - Transactions, accounts, users and groups
//! - The object service and its background sweeper

pub mod attributes;
pub mod automaton;
pub mod garbage_collector;
pub mod object;
pub mod object_manager;
pub mod proto;
pub mod proxy;
pub mod response_keeper;
pub mod security;
pub mod service;
pub mod sweeper;
pub mod transaction;
pub mod type_handler;

#[cfg(test)]
mod testing;

// Re-exports
pub use attributes::{AttributeSet, AttributeStore};
pub use automaton::{MasterAutomaton, master_automaton};
pub use garbage_collector::{CollectFuture, GarbageCollector, GcStats};
pub use object::{MasterObject, ObjectBase, ObjectBody};
pub use object_manager::ObjectManager;
pub use proto::{
    MutationId, Permission, ReqDestroyObjects, ReqExecute, Verb, VerbRequest, VerbResponse,
};
pub use service::{ObjectLockGuard, ObjectService};
pub use sweeper::GarbageSweeper;
pub use transaction::{TransactionObject, TransactionState};
pub use type_handler::{AccountMode, TransactionMode, TypeHandler};
