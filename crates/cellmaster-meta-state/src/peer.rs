//! Replica-to-replica channel
//!
//! The transport itself is out of scope; a peer is reached through the
//! [`PeerChannel`] trait. [`LocalPeerChannel`] connects replicas living in
//! one process and can be disconnected to simulate network failures.

use async_trait::async_trait;
use bytes::Bytes;
use cellmaster_common::{Epoch, Error, MetaVersion, PeerId, Result};
use derive_more::Display;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Outcome of replicating a batch of changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum CommitResult {
    /// Durably applied by a quorum (leader) or locally (follower)
    Committed,
    /// Quorum was not confirmed; the outcome is unknown
    MaybeCommitted,
    /// The follower is already past these changes
    LateChanges,
    /// The follower is missing earlier changes and must resync
    OutOfOrderChanges,
}

/// Replica status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum PeerStatus {
    Stopped,
    FollowerRecovery,
    Following,
    LeaderRecovery,
    Leading,
}

/// Status report of a replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerState {
    pub status: PeerStatus,
    pub epoch: Epoch,
    pub version: MetaVersion,
    pub leader_id: Option<PeerId>,
}

/// Requests one replica serves to another.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Leader -> follower: apply `changes` starting at `start_version`.
    async fn apply_changes(
        &self,
        epoch: Epoch,
        start_version: MetaVersion,
        changes: Vec<Bytes>,
    ) -> Result<CommitResult>;

    /// Leader -> follower: rotate the changelog at `version`.
    async fn advance_segment(
        &self,
        epoch: Epoch,
        version: MetaVersion,
        create_snapshot: bool,
    ) -> Result<CommitResult>;

    /// Leader -> follower: liveness probe; returns the follower status.
    async fn ping_follower(&self, epoch: Epoch, leader_version: MetaVersion) -> Result<PeerStatus>;

    /// Status of the replica.
    async fn get_state(&self) -> Result<PeerState>;

    /// Follower -> leader: read logged records.
    async fn read_changes(
        &self,
        segment_id: u32,
        first_record: u32,
        max_records: usize,
    ) -> Result<Vec<Bytes>>;

    /// Follower -> leader: record count of a changelog segment, if present.
    async fn get_changelog_info(&self, segment_id: u32) -> Result<Option<u32>>;
}

/// In-process channel to another replica.
pub struct LocalPeerChannel {
    peer_id: PeerId,
    target: RwLock<Option<Weak<dyn PeerChannel>>>,
    connected: AtomicBool,
}

impl LocalPeerChannel {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            target: RwLock::new(None),
            connected: AtomicBool::new(true),
        }
    }

    /// Attach the replica this channel delivers to.
    pub fn bind(&self, target: &Arc<dyn PeerChannel>) {
        *self.target.write() = Some(Arc::downgrade(target));
    }

    /// Simulate a network partition (`false`) or its healing (`true`).
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub const fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn target(&self) -> Result<Arc<dyn PeerChannel>> {
        if !self.is_connected() {
            return Err(Error::unavailable(format!("peer {} is unreachable", self.peer_id)));
        }
        self.target
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::unavailable(format!("peer {} is not running", self.peer_id)))
    }
}

#[async_trait]
impl PeerChannel for LocalPeerChannel {
    async fn apply_changes(
        &self,
        epoch: Epoch,
        start_version: MetaVersion,
        changes: Vec<Bytes>,
    ) -> Result<CommitResult> {
        self.target()?
            .apply_changes(epoch, start_version, changes)
            .await
    }

    async fn advance_segment(
        &self,
        epoch: Epoch,
        version: MetaVersion,
        create_snapshot: bool,
    ) -> Result<CommitResult> {
        self.target()?
            .advance_segment(epoch, version, create_snapshot)
            .await
    }

    async fn ping_follower(&self, epoch: Epoch, leader_version: MetaVersion) -> Result<PeerStatus> {
        self.target()?.ping_follower(epoch, leader_version).await
    }

    async fn get_state(&self) -> Result<PeerState> {
        self.target()?.get_state().await
    }

    async fn read_changes(
        &self,
        segment_id: u32,
        first_record: u32,
        max_records: usize,
    ) -> Result<Vec<Bytes>> {
        self.target()?
            .read_changes(segment_id, first_record, max_records)
            .await
    }

    async fn get_changelog_info(&self, segment_id: u32) -> Result<Option<u32>> {
        self.target()?.get_changelog_info(segment_id).await
    }
}

/// Number of replicas that must confirm a change.
pub const fn quorum(peer_count: usize) -> usize {
    peer_count / 2 + 1
}
