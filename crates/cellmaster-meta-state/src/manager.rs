//! Meta state manager
//!
//! Owns one replica: its decorated state, its role in the cell and the
//! committer for that role. Elections are external; the embedding process
//! calls `start_leading`/`start_following` and the `stop_*` counterparts.
//!
//! Status transitions:
//! ```text
//! Stopped -> LeaderRecovery -> Leading -> Stopped
//! Stopped -> FollowerRecovery <-> Following -> Stopped
//! ```

use crate::automaton::Automaton;
use crate::committer::{FollowerCommitter, LeaderCommitter, SharedState};
use crate::decorated::DecoratedMetaState;
use crate::follower_tracker::FollowerTracker;
use crate::mutation::{MutationRequest, MutationResponse};
use crate::peer::{CommitResult, PeerChannel, PeerState, PeerStatus};
use crate::recovery::FollowerRecovery;
use async_trait::async_trait;
use bytes::Bytes;
use cellmaster_common::config::MetaStateConfig;
use cellmaster_common::{Epoch, Error, MetaVersion, PeerId, Result};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct LeaderSession<A: Automaton> {
    committer: Arc<LeaderCommitter<A>>,
    tracker: Arc<FollowerTracker>,
    tracker_task: JoinHandle<()>,
}

impl<A: Automaton> Drop for LeaderSession<A> {
    fn drop(&mut self) {
        self.tracker_task.abort();
    }
}

struct ControlState<A: Automaton> {
    status: PeerStatus,
    epoch: Epoch,
    leader_id: Option<PeerId>,
    leader: Option<LeaderSession<A>>,
}

/// One replica of the replicated meta state.
pub struct MetaStateManager<A: Automaton> {
    self_id: PeerId,
    config: MetaStateConfig,
    peers: Vec<Arc<dyn PeerChannel>>,
    state: SharedState<A>,
    follower: FollowerCommitter<A>,
    control: Mutex<ControlState<A>>,
    recovery_lock: tokio::sync::Mutex<()>,
    weak_self: Weak<Self>,
}

impl<A: Automaton> MetaStateManager<A> {
    /// Open the replica's storage under `data_dir` and replay it.
    ///
    /// `peers` is indexed by peer id; the entry for `self_id` is never used.
    /// The replica starts `Stopped`, in recovery mode.
    pub fn open(
        self_id: PeerId,
        config: MetaStateConfig,
        data_dir: impl AsRef<Path>,
        peers: Vec<Arc<dyn PeerChannel>>,
        automaton: A,
    ) -> Result<Arc<Self>> {
        assert!(
            (self_id as usize) < peers.len(),
            "peer {self_id} is not a member of a {}-peer cell",
            peers.len()
        );
        let name = format!("peer-{self_id}");
        let mut decorated = DecoratedMetaState::open(&name, data_dir, &config, automaton)?;
        decorated.start_recovery();
        decorated.recover()?;
        let state = Arc::new(Mutex::new(decorated));

        Ok(Arc::new_cyclic(|weak_self| Self {
            self_id,
            config,
            peers,
            follower: FollowerCommitter::new(state.clone()),
            state,
            control: Mutex::new(ControlState {
                status: PeerStatus::Stopped,
                epoch: Epoch::NIL,
                leader_id: None,
                leader: None,
            }),
            recovery_lock: tokio::sync::Mutex::new(()),
            weak_self: weak_self.clone(),
        }))
    }

    pub const fn self_id(&self) -> PeerId {
        self.self_id
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn status(&self) -> PeerStatus {
        self.control.lock().status
    }

    pub fn epoch(&self) -> Epoch {
        self.control.lock().epoch
    }

    pub fn leader_id(&self) -> Option<PeerId> {
        self.control.lock().leader_id
    }

    pub fn version(&self) -> MetaVersion {
        self.state.lock().version()
    }

    /// The state thread. Readers lock it to inspect the automaton.
    pub const fn state(&self) -> &SharedState<A> {
        &self.state
    }

    pub fn subscribe_applied(&self) -> watch::Receiver<MetaVersion> {
        self.state.lock().subscribe_applied()
    }

    /// True while the replica's state is being recovered (including `Stopped`).
    pub fn is_recovery(&self) -> bool {
        self.state.lock().is_recovery()
    }

    /// Leading with an active quorum of followers.
    pub fn is_active_leader(&self) -> bool {
        let control = self.control.lock();
        control.status == PeerStatus::Leading
            && control
                .leader
                .as_ref()
                .is_some_and(|session| session.tracker.has_active_quorum())
    }

    fn active_committer(&self) -> Result<Arc<LeaderCommitter<A>>> {
        let control = self.control.lock();
        if control.status != PeerStatus::Leading {
            return Err(Error::unavailable(format!(
                "peer {} is {}, not leading",
                self.self_id, control.status
            )));
        }
        match &control.leader {
            Some(session) if session.tracker.has_active_quorum() => Ok(session.committer.clone()),
            Some(_) => Err(Error::unavailable("no active quorum")),
            None => Err(Error::unavailable("leader session is not established")),
        }
    }

    /// Commit a mutation through the leader pipeline.
    pub async fn commit_mutation(&self, request: MutationRequest) -> Result<MutationResponse> {
        let committer = self.active_committer()?;
        committer.commit(request).await
    }

    /// Rotate the changelog cell-wide and save a snapshot at the new segment.
    pub async fn build_snapshot(&self) -> Result<MetaVersion> {
        let committer = self.active_committer()?;
        let (version, sealed) = committer.advance_segment(true)?;
        sealed.await?;
        Ok(version)
    }

    /// Ping followers now instead of waiting for the next period.
    pub async fn refresh_followers(&self) {
        let tracker = self
            .control
            .lock()
            .leader
            .as_ref()
            .map(|session| session.tracker.clone());
        if let Some(tracker) = tracker {
            tracker.ping_once().await;
        }
    }

    /// Become the leader of `epoch`.
    pub async fn start_leading(&self, epoch: Epoch) -> Result<()> {
        {
            let mut control = self.control.lock();
            if control.status != PeerStatus::Stopped {
                return Err(Error::internal(format!(
                    "cannot start leading while {}",
                    control.status
                )));
            }
            control.status = PeerStatus::LeaderRecovery;
            control.epoch = epoch;
            control.leader_id = Some(self.self_id);
        }
        info!(peer_id = self.self_id, %epoch, "Starting leader recovery");

        let version = {
            let mut state = self.state.lock();
            state.start_recovery();
            state.automaton_mut().on_start_leading();
            state.version()
        };

        let (ping_tx, ping_rx) = watch::channel(version);
        let tracker = Arc::new(FollowerTracker::new(
            self.self_id,
            epoch,
            self.peers.clone(),
            &self.config,
            ping_rx,
        ));
        let committer = LeaderCommitter::new(
            self.self_id,
            epoch,
            self.config.clone(),
            self.state.clone(),
            &self.peers,
            tracker.clone(),
            ping_tx,
        );
        tracker.ping_once().await;
        let tracker_task = tokio::spawn(tracker.clone().run());
        let session = LeaderSession {
            committer,
            tracker,
            tracker_task,
        };

        {
            let mut control = self.control.lock();
            if control.status != PeerStatus::LeaderRecovery || control.epoch != epoch {
                return Err(Error::unavailable("leadership was lost during recovery"));
            }
            {
                let mut state = self.state.lock();
                state.finish_recovery();
                state.automaton_mut().on_leader_recovery_complete();
            }
            control.status = PeerStatus::Leading;
            control.leader = Some(session);
        }
        info!(peer_id = self.self_id, %epoch, version = %version, "Leader recovery complete");
        Ok(())
    }

    pub fn stop_leading(&self) {
        let session = {
            let mut control = self.control.lock();
            if !matches!(
                control.status,
                PeerStatus::Leading | PeerStatus::LeaderRecovery
            ) {
                return;
            }
            control.status = PeerStatus::Stopped;
            control.epoch = Epoch::NIL;
            control.leader_id = None;
            control.leader.take()
        };
        if let Some(session) = &session {
            session.committer.flush_pending();
        }
        drop(session);

        let mut state = self.state.lock();
        state.automaton_mut().on_stop_leading();
        state.start_recovery();
        info!(peer_id = self.self_id, "Stopped leading");
    }

    /// Follow `leader_id` in `epoch`, catching up with it first.
    ///
    /// If catch-up fails the replica stays in `FollowerRecovery` and retries
    /// when the leader pings it.
    pub async fn start_following(&self, leader_id: PeerId, epoch: Epoch) -> Result<()> {
        if leader_id as usize >= self.peers.len() || leader_id == self.self_id {
            return Err(Error::invalid_argument(format!("invalid leader id {leader_id}")));
        }
        {
            let mut control = self.control.lock();
            if control.status != PeerStatus::Stopped {
                return Err(Error::internal(format!(
                    "cannot start following while {}",
                    control.status
                )));
            }
            control.status = PeerStatus::FollowerRecovery;
            control.epoch = epoch;
            control.leader_id = Some(leader_id);
        }
        {
            let mut state = self.state.lock();
            state.start_recovery();
            state.automaton_mut().on_start_following();
        }
        info!(peer_id = self.self_id, leader_id, %epoch, "Starting follower recovery");
        self.recover_follower().await
    }

    pub fn stop_following(&self) {
        {
            let mut control = self.control.lock();
            if !matches!(
                control.status,
                PeerStatus::Following | PeerStatus::FollowerRecovery
            ) {
                return;
            }
            control.status = PeerStatus::Stopped;
            control.epoch = Epoch::NIL;
            control.leader_id = None;
        }
        let mut state = self.state.lock();
        state.automaton_mut().on_stop_following();
        state.start_recovery();
        info!(peer_id = self.self_id, "Stopped following");
    }

    /// Stop whatever role the replica has.
    pub fn stop(&self) {
        self.stop_leading();
        self.stop_following();
    }

    async fn recover_follower(&self) -> Result<()> {
        let _guard = self.recovery_lock.lock().await;
        let (leader_id, epoch) = {
            let control = self.control.lock();
            match (control.status, control.leader_id) {
                (PeerStatus::FollowerRecovery, Some(leader_id)) => (leader_id, control.epoch),
                (PeerStatus::Following, _) => return Ok(()),
                (status, _) => {
                    return Err(Error::unavailable(format!("cannot recover while {status}")));
                }
            }
        };

        let leader = self.peers[leader_id as usize].clone();
        let recovery = FollowerRecovery::new(self.state.clone(), leader, epoch, self.config.rpc_timeout());
        let version = match recovery.run().await {
            Ok(version) => version,
            Err(e) => {
                warn!(peer_id = self.self_id, error = %e, "Follower recovery failed");
                return Err(e);
            }
        };

        let mut control = self.control.lock();
        if control.status != PeerStatus::FollowerRecovery || control.epoch != epoch {
            return Err(Error::unavailable("following was stopped during recovery"));
        }
        {
            let mut state = self.state.lock();
            state.finish_recovery();
            state.automaton_mut().on_follower_recovery_complete();
        }
        control.status = PeerStatus::Following;
        info!(peer_id = self.self_id, version = %version, "Follower recovery complete");
        Ok(())
    }

    /// Drop back to `FollowerRecovery` and resync in the background.
    fn restart_follower_recovery(&self) {
        {
            let mut control = self.control.lock();
            if control.status == PeerStatus::Following {
                control.status = PeerStatus::FollowerRecovery;
                self.state.lock().start_recovery();
            } else if control.status != PeerStatus::FollowerRecovery {
                return;
            }
        }
        self.spawn_follower_recovery();
    }

    fn spawn_follower_recovery(&self) {
        if self.recovery_lock.try_lock().is_err() {
            return;
        }
        if let Some(this) = self.weak_self.upgrade() {
            tokio::spawn(async move {
                if let Err(e) = this.recover_follower().await {
                    debug!(peer_id = this.self_id, error = %e, "Background follower recovery did not complete");
                }
            });
        }
    }

    fn check_follower_epoch(&self, epoch: Epoch) -> Result<PeerStatus> {
        let control = self.control.lock();
        if control.epoch != epoch {
            return Err(Error::InvalidEpoch {
                expected: control.epoch,
                actual: epoch,
            });
        }
        Ok(control.status)
    }
}

#[async_trait]
impl<A: Automaton> PeerChannel for MetaStateManager<A> {
    async fn apply_changes(
        &self,
        epoch: Epoch,
        start_version: MetaVersion,
        changes: Vec<Bytes>,
    ) -> Result<CommitResult> {
        match self.check_follower_epoch(epoch)? {
            PeerStatus::Following => {}
            status => {
                return Err(Error::unavailable(format!(
                    "peer {} is {status}",
                    self.self_id
                )));
            }
        }
        let result = self.follower.commit(start_version, changes).await?;
        if result == CommitResult::OutOfOrderChanges {
            self.restart_follower_recovery();
        }
        Ok(result)
    }

    async fn advance_segment(
        &self,
        epoch: Epoch,
        version: MetaVersion,
        create_snapshot: bool,
    ) -> Result<CommitResult> {
        match self.check_follower_epoch(epoch)? {
            PeerStatus::Following => {}
            status => {
                return Err(Error::unavailable(format!(
                    "peer {} is {status}",
                    self.self_id
                )));
            }
        }
        let result = self.follower.advance_segment(version, create_snapshot)?;
        if result == CommitResult::OutOfOrderChanges {
            self.restart_follower_recovery();
        }
        Ok(result)
    }

    async fn ping_follower(&self, epoch: Epoch, leader_version: MetaVersion) -> Result<PeerStatus> {
        let status = self.check_follower_epoch(epoch)?;
        if status == PeerStatus::FollowerRecovery {
            self.spawn_follower_recovery();
        } else if status == PeerStatus::Following && self.version() < leader_version {
            // Behind the last flushed batch with nothing in flight: a batch was lost.
            debug!(peer_id = self.self_id, leader_version = %leader_version, "Follower lags behind ping version");
        }
        Ok(status)
    }

    async fn get_state(&self) -> Result<PeerState> {
        let (status, epoch, leader_id) = {
            let control = self.control.lock();
            (control.status, control.epoch, control.leader_id)
        };
        Ok(PeerState {
            status,
            epoch,
            version: self.version(),
            leader_id,
        })
    }

    async fn read_changes(
        &self,
        segment_id: u32,
        first_record: u32,
        max_records: usize,
    ) -> Result<Vec<Bytes>> {
        self.state
            .lock()
            .read_changes(segment_id, first_record, max_records)
    }

    async fn get_changelog_info(&self, segment_id: u32) -> Result<Option<u32>> {
        self.state.lock().changelog_record_count(segment_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automaton::CompositeAutomaton;
    use crate::automaton::tests::{Register, register_automaton};
    use crate::peer::LocalPeerChannel;
    use cellmaster_common::config::ChangeLogSyncMode;
    use tempfile::tempdir;

    fn config() -> MetaStateConfig {
        MetaStateConfig {
            changelog_sync: ChangeLogSyncMode::Never,
            max_batch_delay_ms: 1,
            ..MetaStateConfig::default()
        }
    }

    fn single(dir: &Path) -> Arc<MetaStateManager<CompositeAutomaton<Register>>> {
        let peers: Vec<Arc<dyn PeerChannel>> = vec![Arc::new(LocalPeerChannel::new(0))];
        MetaStateManager::open(0, config(), dir, peers, register_automaton()).unwrap()
    }

    fn push(key: &str) -> MutationRequest {
        MutationRequest::new("Register.Push", key.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_commit_requires_leading() {
        let dir = tempdir().unwrap();
        let manager = single(dir.path());
        assert_eq!(manager.status(), PeerStatus::Stopped);
        assert!(manager.is_recovery());

        let err = manager.commit_mutation(push("a")).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_single_replica_lifecycle() {
        let dir = tempdir().unwrap();
        let manager = single(dir.path());
        manager.start_leading(Epoch::new()).await.unwrap();
        assert_eq!(manager.status(), PeerStatus::Leading);
        assert!(manager.is_active_leader());
        assert!(!manager.is_recovery());

        let response = manager.commit_mutation(push("a")).await.unwrap();
        assert_eq!(response.version, MetaVersion::new(0, 0));
        assert_eq!(manager.version(), MetaVersion::new(0, 1));

        let snapshot = manager.build_snapshot().await.unwrap();
        assert_eq!(snapshot, MetaVersion::new(1, 0));

        manager.stop_leading();
        assert_eq!(manager.status(), PeerStatus::Stopped);
        assert!(manager.is_recovery());
        assert!(manager.commit_mutation(push("b")).await.is_err());
    }

    #[tokio::test]
    async fn test_restart_replays_state() {
        let dir = tempdir().unwrap();
        {
            let manager = single(dir.path());
            manager.start_leading(Epoch::new()).await.unwrap();
            manager.commit_mutation(push("a")).await.unwrap();
            manager.build_snapshot().await.unwrap();
            manager.commit_mutation(push("b")).await.unwrap();
            manager.stop();
        }
        let manager = single(dir.path());
        assert_eq!(manager.version(), MetaVersion::new(1, 1));
        assert_eq!(manager.state().lock().automaton().state().entries.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let dir = tempdir().unwrap();
        let manager = single(dir.path());
        assert!(manager.start_following(0, Epoch::new()).await.is_err());
        manager.start_leading(Epoch::new()).await.unwrap();
        assert!(manager.start_leading(Epoch::new()).await.is_err());
    }
}
