//! Common test utilities for cellmaster-object tests.

#![allow(dead_code)]

use cellmaster_common::config::{ChangeLogSyncMode, MetaStateConfig, ObjectManagerConfig};
use cellmaster_common::{AccountId, Epoch, MasterConfig, MetaVersion, ObjectId, ObjectType, PeerId};
use cellmaster_meta_state::{LocalPeerChannel, MetaStateManager, PeerChannel};
use cellmaster_object::security::NAME_ATTRIBUTE;
use cellmaster_object::{MasterAutomaton, ObjectManager, ObjectService, Verb, VerbRequest, VerbResponse, master_automaton};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub type Peer = MetaStateManager<MasterAutomaton>;

pub fn test_config() -> MasterConfig {
    MasterConfig {
        meta_state: MetaStateConfig {
            max_batch_delay_ms: 1,
            rpc_timeout_ms: 500,
            follower_ping_period_ms: 60_000,
            max_changes_between_snapshots: None,
            changelog_sync: ChangeLogSyncMode::Never,
            ..MetaStateConfig::default()
        },
        object_manager: ObjectManagerConfig {
            gc_sweep_period_ms: 10,
            max_objects_per_gc_sweep: 2,
            ..ObjectManagerConfig::default()
        },
        ..MasterConfig::default()
    }
}

/// A cell of master replicas, each with its own object service.
pub struct TestCell {
    _temp_dirs: Vec<TempDir>,
    pub channels: Vec<Arc<LocalPeerChannel>>,
    pub peers: Vec<Arc<Peer>>,
    pub services: Vec<Arc<ObjectService>>,
    pub config: MasterConfig,
    pub epoch: Epoch,
}

impl TestCell {
    pub fn new(peer_count: usize) -> Self {
        let config = test_config();
        let channels: Vec<Arc<LocalPeerChannel>> = (0..peer_count)
            .map(|id| Arc::new(LocalPeerChannel::new(id as PeerId)))
            .collect();
        let mut temp_dirs = Vec::with_capacity(peer_count);
        let mut peers = Vec::with_capacity(peer_count);
        let mut services = Vec::with_capacity(peer_count);

        for id in 0..peer_count {
            let temp_dir = TempDir::new().expect("Failed to create temp dir");
            let links: Vec<Arc<dyn PeerChannel>> = channels
                .iter()
                .map(|channel| channel.clone() as Arc<dyn PeerChannel>)
                .collect();
            let peer = MetaStateManager::open(
                id as PeerId,
                config.meta_state.clone(),
                temp_dir.path(),
                links,
                master_automaton(&config),
            )
            .expect("Failed to open peer");
            let target: Arc<dyn PeerChannel> = peer.clone();
            channels[id].bind(&target);
            services.push(Arc::new(ObjectService::new(
                peer.clone(),
                config.object_manager.clone(),
            )));
            temp_dirs.push(temp_dir);
            peers.push(peer);
        }

        Self {
            _temp_dirs: temp_dirs,
            channels,
            peers,
            services,
            config,
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

    pub fn service(&self) -> &Arc<ObjectService> {
        &self.services[0]
    }

    pub fn root(&self) -> ObjectId {
        self.service().with_objects(ObjectManager::root_user_id)
    }

    pub fn master(&self) -> ObjectId {
        self.service().with_objects(ObjectManager::master_id)
    }

    pub async fn create_account(&self, name: &str) -> AccountId {
        let request = VerbRequest::new(
            self.master(),
            self.root(),
            Verb::Create {
                object_type: ObjectType::Account,
                account: None,
                attributes: [(NAME_ATTRIBUTE.to_string(), name.as_bytes().to_vec())].into(),
            },
        );
        created(self.service().execute(request).await.unwrap())
    }

    pub async fn create_document(&self, account: AccountId, title: &str) -> ObjectId {
        let request = VerbRequest::new(
            self.master(),
            self.root(),
            Verb::Create {
                object_type: ObjectType::Document,
                account: Some(account),
                attributes: [("title".to_string(), title.as_bytes().to_vec())].into(),
            },
        );
        created(self.service().execute(request).await.unwrap())
    }

    /// Drop the owner edge of `id`, leaving it to the GC.
    pub async fn remove_object(&self, id: ObjectId) {
        let request = VerbRequest::new(id, self.root(), Verb::Remove { key: None });
        self.service().execute(request).await.unwrap();
    }

    /// Sweep on the leader until nothing is left; returns how many were
    /// destroyed.
    pub async fn sweep(&self) -> usize {
        let mut destroyed = 0;
        loop {
            match self.service().sweep_garbage().await.unwrap() {
                0 => return destroyed,
                count => destroyed += count,
            }
        }
    }

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

    /// Wait for every follower to apply what the leader has.
    pub async fn sync_followers(&self) {
        let version = self.leader().version();
        for id in 1..self.peers.len() {
            self.wait_for_version(id, version).await;
        }
    }

    pub fn object_count(&self, id: usize) -> usize {
        self.services[id].with_objects(ObjectManager::object_count)
    }

    pub fn shutdown(&self) {
        for peer in &self.peers {
            peer.stop();
        }
    }
}

pub fn created(response: VerbResponse) -> ObjectId {
    match response {
        VerbResponse::Created(id) => id,
        other => panic!("unexpected response {other:?}"),
    }
}
