//! Cellmaster Meta State - replicated state machine
//!
//! This crate implements the replication core of a master cell:
//! - Changelog segments with a background durable writer
//! - Snapshots in a redb store
//! - A deterministic automaton applied in `MetaVersion` order
//! - Quorum commit on the leader, version-gated apply on followers
//! - Follower catch-up from the leader's changelogs

pub mod async_changelog;
pub mod automaton;
pub mod changelog;
pub mod committer;
pub mod decorated;
pub mod follower_tracker;
pub mod manager;
pub mod mutation;
pub mod peer;
pub mod recovery;
pub mod snapshot;

// Re-exports
pub use automaton::{Automaton, AutomatonState, CompositeAutomaton};
pub use committer::{FollowerCommitter, LeaderCommitter, SharedState};
pub use decorated::DecoratedMetaState;
pub use manager::MetaStateManager;
pub use mutation::{MutationContext, MutationRecord, MutationRequest, MutationResponse};
pub use peer::{CommitResult, LocalPeerChannel, PeerChannel, PeerState, PeerStatus, quorum};
pub use snapshot::{SavePriority, SnapshotSection};
