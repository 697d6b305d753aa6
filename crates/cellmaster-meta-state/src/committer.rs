//! Leader and follower committers
//!
//! The leader applies every mutation locally, groups the logged records
//! into batches and replicates each batch to its followers. A batch is
//! committed once a quorum of replicas (the leader's own durable append
//! counting as one vote) has confirmed it. Followers accept a batch only
//! when it starts exactly at their current version.

use crate::async_changelog::FlushFuture;
use crate::automaton::Automaton;
use crate::decorated::DecoratedMetaState;
use crate::follower_tracker::FollowerTracker;
use crate::mutation::{MutationRecord, MutationRequest, MutationResponse};
use crate::peer::{CommitResult, PeerChannel, quorum};
use bytes::Bytes;
use cellmaster_common::config::MetaStateConfig;
use cellmaster_common::{Epoch, Error, MetaVersion, PeerId, Result};
use futures::future::{BoxFuture, Shared, try_join_all};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The state thread: every access to the decorated state is serialized by this lock.
pub type SharedState<A> = Arc<Mutex<DecoratedMetaState<A>>>;

type BatchResult = Shared<BoxFuture<'static, CommitResult>>;

enum FollowerCommand {
    Apply {
        start_version: MetaVersion,
        changes: Arc<Vec<Bytes>>,
        ack: oneshot::Sender<bool>,
    },
    AdvanceSegment {
        version: MetaVersion,
        create_snapshot: bool,
    },
}

struct Batch {
    id: u64,
    start_version: MetaVersion,
    changes: Vec<Bytes>,
    local_flushes: Vec<FlushFuture>,
    result_tx: oneshot::Sender<CommitResult>,
    result: BatchResult,
}

struct FollowerQueue {
    peer_id: PeerId,
    tx: mpsc::UnboundedSender<FollowerCommand>,
    task: JoinHandle<()>,
}

/// Leader side of the replication protocol.
pub struct LeaderCommitter<A: Automaton> {
    epoch: Epoch,
    config: MetaStateConfig,
    state: SharedState<A>,
    tracker: Arc<FollowerTracker>,
    quorum: usize,
    followers: Vec<FollowerQueue>,
    batch: Mutex<Option<Batch>>,
    next_batch_id: AtomicU64,
    ping_version: watch::Sender<MetaVersion>,
}

impl<A: Automaton> LeaderCommitter<A> {
    /// Create the committer and spawn one ordered sender task per follower.
    pub fn new(
        self_id: PeerId,
        epoch: Epoch,
        config: MetaStateConfig,
        state: SharedState<A>,
        peers: &[Arc<dyn PeerChannel>],
        tracker: Arc<FollowerTracker>,
        ping_version: watch::Sender<MetaVersion>,
    ) -> Arc<Self> {
        let followers = peers
            .iter()
            .enumerate()
            .filter(|(id, _)| *id as PeerId != self_id)
            .map(|(id, peer)| {
                let peer_id = id as PeerId;
                let (tx, rx) = mpsc::unbounded_channel();
                let task = tokio::spawn(run_follower_sender(
                    peer_id,
                    peer.clone(),
                    epoch,
                    config.rpc_timeout(),
                    rx,
                ));
                FollowerQueue { peer_id, tx, task }
            })
            .collect();

        Arc::new(Self {
            epoch,
            quorum: quorum(peers.len()),
            config,
            state,
            tracker,
            followers,
            batch: Mutex::new(None),
            next_batch_id: AtomicU64::new(0),
            ping_version,
        })
    }

    pub const fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Log and apply a mutation locally, then wait for its batch to reach a quorum.
    ///
    /// Resolves with the response computed while applying. If the quorum is
    /// not confirmed the outcome is ambiguous and `Error::MaybeCommitted` is
    /// returned.
    pub async fn commit(self: &Arc<Self>, request: MutationRequest) -> Result<MutationResponse> {
        let record = MutationRecord::stamp(&request).to_bytes()?;

        let (response, result) = {
            let mut state = self.state.lock();
            let version = state.version();
            let (flushed, response) = state.log_and_apply(record.clone());
            let result = self.batch_change(version, record, flushed);
            if self.needs_rotation(&state) {
                if let Err(e) = self.advance_segment_locked(&mut state, true) {
                    warn!(error = %e, "Automatic changelog rotation failed");
                }
            }
            (response, result)
        };

        match result.await {
            CommitResult::Committed => Ok(response),
            result => {
                debug!(version = %response.version, %result, "Mutation is not confirmed by quorum");
                Err(Error::MaybeCommitted)
            }
        }
    }

    fn needs_rotation(&self, state: &DecoratedMetaState<A>) -> bool {
        self.config
            .max_changes_between_snapshots
            .is_some_and(|max| state.version().record_count >= max)
    }

    fn batch_change(self: &Arc<Self>, version: MetaVersion, change: Bytes, flushed: FlushFuture) -> BatchResult {
        let mut guard = self.batch.lock();
        let batch = guard.get_or_insert_with(|| self.open_batch(version));
        assert_eq!(
            batch.start_version.advance_by(batch.changes.len() as u32),
            version,
            "batch change out of order"
        );
        batch.changes.push(change);
        batch.local_flushes.push(flushed);
        let result = batch.result.clone();

        if batch.changes.len() >= self.config.max_batch_size {
            if let Some(batch) = guard.take() {
                self.flush(batch);
            }
        }
        result
    }

    fn open_batch(self: &Arc<Self>, start_version: MetaVersion) -> Batch {
        let id = self.next_batch_id.fetch_add(1, Ordering::Relaxed);
        let (result_tx, result_rx) = oneshot::channel();
        let result = result_rx
            .map(|result| result.unwrap_or(CommitResult::MaybeCommitted))
            .boxed()
            .shared();

        let committer = Arc::downgrade(self);
        let delay = self.config.max_batch_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(committer) = committer.upgrade() {
                committer.flush_batch_if_current(id);
            }
        });

        Batch {
            id,
            start_version,
            changes: Vec::new(),
            local_flushes: Vec::new(),
            result_tx,
            result,
        }
    }

    fn flush_batch_if_current(&self, id: u64) {
        let mut guard = self.batch.lock();
        if guard.as_ref().is_some_and(|batch| batch.id == id) {
            if let Some(batch) = guard.take() {
                self.flush(batch);
            }
        }
    }

    /// Flush the open batch, if any, without waiting for its delay.
    pub fn flush_pending(&self) {
        if let Some(batch) = self.batch.lock().take() {
            self.flush(batch);
        }
    }

    /// Replicate a batch. Called with the batch lock held so batches are
    /// queued to followers in version order.
    fn flush(&self, batch: Batch) {
        let Batch {
            start_version,
            changes,
            local_flushes,
            result_tx,
            ..
        } = batch;
        let count = changes.len();
        let next_version = start_version.advance_by(count as u32);
        self.ping_version.send_replace(next_version);
        debug!(start_version = %start_version, count, "Flushing batch");

        let changes = Arc::new(changes);
        let mut votes: FuturesUnordered<BoxFuture<'static, bool>> = FuturesUnordered::new();
        votes.push(
            async move {
                match try_join_all(local_flushes).await {
                    Ok(_) => true,
                    Err(e) => {
                        warn!(error = %e, "Local changelog append failed");
                        false
                    }
                }
            }
            .boxed(),
        );

        for follower in &self.followers {
            if !self.tracker.is_follower_active(follower.peer_id) {
                continue;
            }
            let (ack, ack_rx) = oneshot::channel();
            let command = FollowerCommand::Apply {
                start_version,
                changes: changes.clone(),
                ack,
            };
            if follower.tx.send(command).is_ok() {
                votes.push(ack_rx.map(|ack| ack.unwrap_or(false)).boxed());
            }
        }

        let quorum = self.quorum;
        tokio::spawn(async move {
            let mut acks = 0;
            while let Some(ack) = votes.next().await {
                if ack {
                    acks += 1;
                    if acks >= quorum {
                        break;
                    }
                }
            }
            // Remaining votes are dropped here; stragglers are not waited for.
            let result = if acks >= quorum {
                CommitResult::Committed
            } else {
                warn!(start_version = %start_version, count, acks, quorum, "Batch is maybe committed");
                CommitResult::MaybeCommitted
            };
            let _ = result_tx.send(result);
        });
    }

    /// Rotate the changelog on the leader and every active follower,
    /// optionally saving a snapshot at the start of the new segment.
    pub fn advance_segment(&self, create_snapshot: bool) -> Result<(MetaVersion, FlushFuture)> {
        let mut state = self.state.lock();
        self.advance_segment_locked(&mut state, create_snapshot)
    }

    fn advance_segment_locked(
        &self,
        state: &mut DecoratedMetaState<A>,
        create_snapshot: bool,
    ) -> Result<(MetaVersion, FlushFuture)> {
        let version = state.version();
        {
            let mut guard = self.batch.lock();
            if let Some(batch) = guard.take() {
                self.flush(batch);
            }
            for follower in &self.followers {
                if !self.tracker.is_follower_active(follower.peer_id) {
                    continue;
                }
                let _ = follower.tx.send(FollowerCommand::AdvanceSegment {
                    version,
                    create_snapshot,
                });
            }
        }

        let sealed = state.rotate_changelog()?;
        if create_snapshot {
            state.save_snapshot()?;
        }
        let next = state.version();
        self.ping_version.send_replace(next);
        info!(from = %version, to = %next, create_snapshot, "Segment advanced");
        Ok((next, sealed))
    }
}

impl<A: Automaton> Drop for LeaderCommitter<A> {
    fn drop(&mut self) {
        for follower in &self.followers {
            follower.task.abort();
        }
    }
}

/// Deliver commands to one follower strictly in order.
async fn run_follower_sender(
    peer_id: PeerId,
    peer: Arc<dyn PeerChannel>,
    epoch: Epoch,
    rpc_timeout: Duration,
    mut rx: mpsc::UnboundedReceiver<FollowerCommand>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            FollowerCommand::Apply {
                start_version,
                changes,
                ack,
            } => {
                let count = changes.len();
                let result = tokio::time::timeout(
                    rpc_timeout,
                    peer.apply_changes(epoch, start_version, changes.to_vec()),
                )
                .await;
                let committed = match result {
                    Ok(Ok(CommitResult::Committed)) => true,
                    Ok(Ok(result)) => {
                        debug!(peer_id, start_version = %start_version, count, %result, "Follower did not commit changes");
                        false
                    }
                    Ok(Err(e)) => {
                        warn!(peer_id, start_version = %start_version, error = %e, "Error committing changes at follower");
                        false
                    }
                    Err(_) => {
                        warn!(peer_id, start_version = %start_version, "Timed out committing changes at follower");
                        false
                    }
                };
                let _ = ack.send(committed);
            }
            FollowerCommand::AdvanceSegment {
                version,
                create_snapshot,
            } => {
                let result = tokio::time::timeout(
                    rpc_timeout,
                    peer.advance_segment(epoch, version, create_snapshot),
                )
                .await;
                match result {
                    Ok(Ok(CommitResult::Committed)) => {
                        debug!(peer_id, version = %version, "Follower advanced segment");
                    }
                    Ok(Ok(result)) => {
                        debug!(peer_id, version = %version, %result, "Follower did not advance segment");
                    }
                    Ok(Err(e)) => {
                        warn!(peer_id, version = %version, error = %e, "Error advancing segment at follower");
                    }
                    Err(_) => {
                        warn!(peer_id, version = %version, "Timed out advancing segment at follower");
                    }
                }
            }
        }
    }
}

/// Follower side of the replication protocol.
pub struct FollowerCommitter<A: Automaton> {
    state: SharedState<A>,
}

impl<A: Automaton> FollowerCommitter<A> {
    pub const fn new(state: SharedState<A>) -> Self {
        Self { state }
    }

    /// Apply a batch that must start exactly at the current version.
    pub async fn commit(&self, start_version: MetaVersion, changes: Vec<Bytes>) -> Result<CommitResult> {
        let flushes = {
            let mut state = self.state.lock();
            match Self::check_version(state.version(), start_version) {
                CommitResult::Committed => {}
                result => return Ok(result),
            }
            changes
                .into_iter()
                .map(|change| state.log_and_apply(change).0)
                .collect::<Vec<_>>()
        };
        try_join_all(flushes).await?;
        Ok(CommitResult::Committed)
    }

    /// Rotate the changelog at exactly `version`.
    pub fn advance_segment(&self, version: MetaVersion, create_snapshot: bool) -> Result<CommitResult> {
        let mut state = self.state.lock();
        match Self::check_version(state.version(), version) {
            CommitResult::Committed => {}
            result => return Ok(result),
        }
        // The seal completes in the background; its outcome only matters for the next open.
        drop(state.rotate_changelog()?);
        if create_snapshot {
            state.save_snapshot()?;
        }
        Ok(CommitResult::Committed)
    }

    fn check_version(current: MetaVersion, expected: MetaVersion) -> CommitResult {
        match current.cmp(&expected) {
            CmpOrdering::Greater => {
                debug!(current = %current, expected = %expected, "Late changes received");
                CommitResult::LateChanges
            }
            CmpOrdering::Less => {
                warn!(current = %current, expected = %expected, "Out-of-order changes received");
                CommitResult::OutOfOrderChanges
            }
            CmpOrdering::Equal => CommitResult::Committed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automaton::CompositeAutomaton;
    use crate::automaton::tests::{Register, push_record, register_automaton};
    use cellmaster_common::config::ChangeLogSyncMode;
    use tempfile::TempDir;

    fn config() -> MetaStateConfig {
        MetaStateConfig {
            changelog_sync: ChangeLogSyncMode::Never,
            max_batch_delay_ms: 1,
            ..MetaStateConfig::default()
        }
    }

    fn open_state(dir: &TempDir) -> SharedState<CompositeAutomaton<Register>> {
        let mut state =
            DecoratedMetaState::open("test", dir.path(), &config(), register_automaton()).unwrap();
        state.recover().unwrap();
        Arc::new(Mutex::new(state))
    }

    fn single_peer_leader(
        state: SharedState<CompositeAutomaton<Register>>,
        config: MetaStateConfig,
    ) -> Arc<LeaderCommitter<CompositeAutomaton<Register>>> {
        let peers: Vec<Arc<dyn PeerChannel>> = vec![Arc::new(crate::peer::LocalPeerChannel::new(0))];
        let (ping_tx, ping_rx) = watch::channel(MetaVersion::default());
        let tracker = Arc::new(FollowerTracker::new(0, Epoch::new(), peers.clone(), &config, ping_rx));
        LeaderCommitter::new(0, Epoch::new(), config, state, &peers, tracker, ping_tx)
    }

    fn request(key: &str) -> MutationRequest {
        MutationRequest::new("Register.Push", key.as_bytes().to_vec())
    }

    #[test]
    fn test_follower_version_gating() {
        let current = MetaVersion::new(2, 5);
        assert_eq!(
            FollowerCommitter::<CompositeAutomaton<Register>>::check_version(current, MetaVersion::new(2, 4)),
            CommitResult::LateChanges
        );
        assert_eq!(
            FollowerCommitter::<CompositeAutomaton<Register>>::check_version(current, MetaVersion::new(2, 6)),
            CommitResult::OutOfOrderChanges
        );
        assert_eq!(
            FollowerCommitter::<CompositeAutomaton<Register>>::check_version(current, MetaVersion::new(3, 0)),
            CommitResult::OutOfOrderChanges
        );
        assert_eq!(
            FollowerCommitter::<CompositeAutomaton<Register>>::check_version(current, current),
            CommitResult::Committed
        );
    }

    #[tokio::test]
    async fn test_follower_applies_matching_batch() {
        let dir = tempfile::tempdir().unwrap();
        let state = open_state(&dir);
        let follower = FollowerCommitter::new(state.clone());
        let changes: Vec<Bytes> = ["a", "b"]
            .iter()
            .map(|k| push_record(k).to_bytes().unwrap())
            .collect();

        let result = follower.commit(MetaVersion::new(0, 0), changes.clone()).await.unwrap();
        assert_eq!(result, CommitResult::Committed);
        assert_eq!(state.lock().version(), MetaVersion::new(0, 2));

        let late = follower.commit(MetaVersion::new(0, 0), changes.clone()).await.unwrap();
        assert_eq!(late, CommitResult::LateChanges);
        let gap = follower.commit(MetaVersion::new(0, 5), changes).await.unwrap();
        assert_eq!(gap, CommitResult::OutOfOrderChanges);
        assert_eq!(state.lock().version(), MetaVersion::new(0, 2));
    }

    #[tokio::test]
    async fn test_follower_advance_segment() {
        let dir = tempfile::tempdir().unwrap();
        let state = open_state(&dir);
        let follower = FollowerCommitter::new(state.clone());
        assert_eq!(
            follower.advance_segment(MetaVersion::new(0, 1), false).unwrap(),
            CommitResult::OutOfOrderChanges
        );
        assert_eq!(
            follower.advance_segment(MetaVersion::new(0, 0), true).unwrap(),
            CommitResult::Committed
        );
        assert_eq!(state.lock().version(), MetaVersion::new(1, 0));
    }

    #[tokio::test]
    async fn test_single_peer_leader_commits_alone() {
        let dir = tempfile::tempdir().unwrap();
        let state = open_state(&dir);
        let leader = single_peer_leader(state.clone(), config());

        let first = leader.commit(request("a")).await.unwrap();
        let second = leader.commit(request("b")).await.unwrap();
        assert_eq!(first.version, MetaVersion::new(0, 0));
        assert_eq!(second.version, MetaVersion::new(0, 1));
        assert_eq!(second.data, Some(Bytes::from(2usize.to_le_bytes().to_vec())));
        assert_eq!(state.lock().automaton().state().entries.len(), 2);
    }

    #[tokio::test]
    async fn test_batch_size_triggers_flush() {
        let dir = tempfile::tempdir().unwrap();
        let state = open_state(&dir);
        let config = MetaStateConfig {
            max_batch_size: 3,
            max_batch_delay_ms: 60_000,
            ..config()
        };
        let leader = single_peer_leader(state.clone(), config);

        let commits: Vec<_> = ["a", "b", "c"].iter().map(|k| leader.commit(request(k))).collect();
        let responses = futures::future::try_join_all(commits).await.unwrap();
        assert_eq!(responses.len(), 3);
        assert_eq!(state.lock().version(), MetaVersion::new(0, 3));
    }

    #[tokio::test]
    async fn test_automatic_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let state = open_state(&dir);
        let config = MetaStateConfig {
            max_changes_between_snapshots: Some(2),
            ..config()
        };
        let leader = single_peer_leader(state.clone(), config);

        leader.commit(request("a")).await.unwrap();
        assert_eq!(state.lock().version(), MetaVersion::new(0, 1));
        leader.commit(request("b")).await.unwrap();
        assert_eq!(state.lock().version(), MetaVersion::new(1, 0));
        leader.commit(request("c")).await.unwrap();
        assert_eq!(state.lock().version(), MetaVersion::new(1, 1));
    }

    #[tokio::test]
    async fn test_manual_advance_segment() {
        let dir = tempfile::tempdir().unwrap();
        let state = open_state(&dir);
        let leader = single_peer_leader(state.clone(), config());
        leader.commit(request("a")).await.unwrap();

        let (version, sealed) = leader.advance_segment(true).unwrap();
        sealed.await.unwrap();
        assert_eq!(version, MetaVersion::new(1, 0));
        let next = leader.commit(request("b")).await.unwrap();
        assert_eq!(next.version, MetaVersion::new(1, 0));
    }
}
