//! Common test utilities for cellmaster-meta-state tests.

#![allow(dead_code)]

use cellmaster_common::config::{ChangeLogSyncMode, MetaStateConfig};
use cellmaster_common::{Epoch, MetaVersion, PeerId};
use cellmaster_meta_state::{
    AutomatonState, CompositeAutomaton, LocalPeerChannel, MetaStateManager, MutationRecord,
    MutationRequest, PeerChannel, SavePriority,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Append-only journal of keys, the automaton replicated in these tests.
#[derive(Default)]
pub struct Journal {
    pub keys: Vec<String>,
}

impl AutomatonState for Journal {
    fn clear(&mut self) {
        self.keys.clear();
    }
}

pub type JournalAutomaton = CompositeAutomaton<Journal>;
pub type Peer = MetaStateManager<JournalAutomaton>;

pub fn journal_automaton() -> JournalAutomaton {
    let mut automaton = CompositeAutomaton::new(Journal::default());
    automaton.register_method("Journal.Append", |state: &mut Journal, context| {
        state
            .keys
            .push(String::from_utf8_lossy(context.data()).into_owned());
        context.set_response(state.keys.len().to_le_bytes().to_vec());
    });
    automaton.register_saver(SavePriority::Values, "Journal.Keys", |state| {
        Ok(bincode::serialize(&state.keys)?)
    });
    automaton.register_loader("Journal.Keys", |state, data| {
        state.keys = bincode::deserialize(data)?;
        Ok(())
    });
    automaton
}

pub fn append(key: &str) -> MutationRequest {
    MutationRequest::new("Journal.Append", key.as_bytes().to_vec())
}

/// Logged form of an append, for writing straight into a replica's log.
pub fn append_record(key: &str) -> bytes::Bytes {
    MutationRecord {
        mutation_type: "Journal.Append".into(),
        random_seed: 0,
        timestamp_ms: 0,
        data: key.as_bytes().to_vec(),
    }
    .to_bytes()
    .unwrap()
}

pub fn test_config() -> MetaStateConfig {
    MetaStateConfig {
        max_batch_delay_ms: 1,
        rpc_timeout_ms: 500,
        // Pings are driven explicitly through `refresh_followers`.
        follower_ping_period_ms: 60_000,
        max_changes_between_snapshots: None,
        changelog_sync: ChangeLogSyncMode::Never,
        ..MetaStateConfig::default()
    }
}

/// Test context that holds temp directories and replicas.
pub struct TestCell {
    /// Temp directories for each replica (kept alive for the test duration).
    _temp_dirs: Vec<TempDir>,
    /// `channels[i]` delivers to replica `i`.
    pub channels: Vec<Arc<LocalPeerChannel>>,
    pub peers: Vec<Arc<Peer>>,
    pub epoch: Epoch,
}

impl TestCell {
    /// Open `peer_count` stopped replicas connected in process.
    pub fn new(peer_count: usize) -> Self {
        let channels: Vec<Arc<LocalPeerChannel>> = (0..peer_count)
            .map(|id| Arc::new(LocalPeerChannel::new(id as PeerId)))
            .collect();
        let mut temp_dirs = Vec::with_capacity(peer_count);
        let mut peers = Vec::with_capacity(peer_count);

        for id in 0..peer_count {
            let temp_dir = TempDir::new().expect("Failed to create temp dir");
            let links: Vec<Arc<dyn PeerChannel>> = channels
                .iter()
                .map(|channel| channel.clone() as Arc<dyn PeerChannel>)
                .collect();
            let peer = MetaStateManager::open(
                id as PeerId,
                test_config(),
                temp_dir.path(),
                links,
                journal_automaton(),
            )
            .expect("Failed to open peer");
            let target: Arc<dyn PeerChannel> = peer.clone();
            channels[id].bind(&target);
            temp_dirs.push(temp_dir);
            peers.push(peer);
        }

        Self {
            _temp_dirs: temp_dirs,
            channels,
            peers,
            epoch: Epoch::new(),
        }
    }

    /// Peer 0 leads, every other peer follows it.
    pub async fn start(peer_count: usize) -> Self {
        let cell = Self::new(peer_count);
        cell.leader().start_leading(cell.epoch).await.unwrap();
        for peer in &cell.peers[1..] {
            peer.start_following(0, cell.epoch).await.unwrap();
        }
        cell.leader().refresh_followers().await;
        cell
    }

    pub fn leader(&self) -> &Arc<Peer> {
        &self.peers[0]
    }

    /// Cut replica `id` off from every other replica.
    pub fn partition(&self, id: usize) {
        self.channels[id].set_connected(false);
    }

    pub fn heal(&self, id: usize) {
        self.channels[id].set_connected(true);
    }

    /// Wait until replica `id` has applied up to `version`.
    pub async fn wait_for_version(&self, id: usize, version: MetaVersion) {
        let mut applied = self.peers[id].subscribe_applied();
        tokio::time::timeout(Duration::from_secs(5), async {
            while *applied.borrow_and_update() < version {
                applied.changed().await.unwrap();
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "peer {id} did not reach {version}, stuck at {}",
                self.peers[id].version()
            )
        });
    }

    pub fn keys(&self, id: usize) -> Vec<String> {
        self.peers[id].state().lock().automaton().state().keys.clone()
    }

    pub fn shutdown(&self) {
        for peer in &self.peers {
            peer.stop();
        }
    }
}
