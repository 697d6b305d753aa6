//! Leader-side liveness tracking of followers.

use crate::peer::{PeerChannel, PeerStatus, quorum};
use cellmaster_common::config::MetaStateConfig;
use cellmaster_common::{Epoch, MetaVersion, PeerId};
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Pings followers and records which of them are actively following the
/// current leader epoch.
pub struct FollowerTracker {
    self_id: PeerId,
    epoch: Epoch,
    peers: Vec<Arc<dyn PeerChannel>>,
    ping_period: Duration,
    rpc_timeout: Duration,
    ping_version: watch::Receiver<MetaVersion>,
    active: Mutex<Vec<bool>>,
}

impl FollowerTracker {
    pub fn new(
        self_id: PeerId,
        epoch: Epoch,
        peers: Vec<Arc<dyn PeerChannel>>,
        config: &MetaStateConfig,
        ping_version: watch::Receiver<MetaVersion>,
    ) -> Self {
        let active = vec![false; peers.len()];
        Self {
            self_id,
            epoch,
            peers,
            ping_period: config.follower_ping_period(),
            rpc_timeout: config.rpc_timeout(),
            ping_version,
            active: Mutex::new(active),
        }
    }

    /// Ping every follower once and update their activity flags.
    pub async fn ping_once(&self) {
        let version = *self.ping_version.borrow();
        let pings = self
            .peers
            .iter()
            .enumerate()
            .filter(|(id, _)| *id as PeerId != self.self_id)
            .map(|(id, peer)| async move {
                let status =
                    tokio::time::timeout(self.rpc_timeout, peer.ping_follower(self.epoch, version))
                        .await;
                let active = match status {
                    Ok(Ok(PeerStatus::Following)) => true,
                    Ok(Ok(status)) => {
                        debug!(peer_id = id, %status, "Follower is not following yet");
                        false
                    }
                    Ok(Err(e)) => {
                        debug!(peer_id = id, error = %e, "Follower ping failed");
                        false
                    }
                    Err(_) => {
                        debug!(peer_id = id, "Follower ping timed out");
                        false
                    }
                };
                (id, active)
            });
        let results = join_all(pings).await;

        let mut flags = self.active.lock();
        for (id, active) in results {
            if flags[id] != active {
                info!(peer_id = id, active, epoch = %self.epoch, "Follower activity changed");
            }
            flags[id] = active;
        }
    }

    /// Long-running background task: ping followers every `ping_period`.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.ping_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.ping_once().await;
        }
    }

    pub fn is_follower_active(&self, peer_id: PeerId) -> bool {
        self.active
            .lock()
            .get(peer_id as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Number of replicas, the leader included, currently known to be active.
    pub fn active_count(&self) -> usize {
        1 + self.active.lock().iter().filter(|active| **active).count()
    }

    /// Whether the leader plus its active followers form a quorum.
    pub fn has_active_quorum(&self) -> bool {
        self.active_count() >= quorum(self.peers.len())
    }
}
