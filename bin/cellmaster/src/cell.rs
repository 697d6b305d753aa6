//! In-process master cell.

use anyhow::{Context, Result, bail};
use cellmaster_common::{Epoch, MasterConfig, MetaVersion, PeerId};
use cellmaster_meta_state::{LocalPeerChannel, MetaStateManager, PeerChannel};
use cellmaster_object::{GarbageSweeper, MasterAutomaton, ObjectService, master_automaton};
use std::sync::Arc;
use tracing::{info, warn};

struct Replica {
    manager: Arc<MetaStateManager<MasterAutomaton>>,
    service: Arc<ObjectService>,
}

pub struct MasterCell {
    replicas: Vec<Replica>,
    sweepers: parking_lot::Mutex<Vec<GarbageSweeper>>,
    epoch: Epoch,
}

impl MasterCell {
    /// Open every replica under `<data_dir>/peer-<id>`.
    pub fn open(config: &MasterConfig, peer_count: usize) -> Result<Self> {
        if peer_count == 0 {
            bail!("a cell needs at least one replica");
        }
        let channels: Vec<Arc<LocalPeerChannel>> = (0..peer_count)
            .map(|id| Arc::new(LocalPeerChannel::new(id as PeerId)))
            .collect();

        let mut replicas = Vec::with_capacity(peer_count);
        for (id, channel) in channels.iter().enumerate() {
            let links: Vec<Arc<dyn PeerChannel>> = channels
                .iter()
                .map(|channel| channel.clone() as Arc<dyn PeerChannel>)
                .collect();
            let data_dir = config.data_dir.join(format!("peer-{id}"));
            let manager = MetaStateManager::open(
                id as PeerId,
                config.meta_state.clone(),
                &data_dir,
                links,
                master_automaton(config),
            )
            .with_context(|| format!("failed to open replica {id} at {}", data_dir.display()))?;
            let target: Arc<dyn PeerChannel> = manager.clone();
            channel.bind(&target);

            let service = Arc::new(ObjectService::new(
                manager.clone(),
                config.object_manager.clone(),
            ));
            replicas.push(Replica { manager, service });
        }

        Ok(Self {
            replicas,
            sweepers: parking_lot::Mutex::new(Vec::new()),
            epoch: Epoch::new(),
        })
    }

    /// Elect replica 0, bring the others up as followers and start the
    /// sweepers.
    pub async fn start(&self) -> Result<()> {
        let leader = &self.replicas[0].manager;
        leader
            .start_leading(self.epoch)
            .await
            .context("leader recovery failed")?;
        for (id, replica) in self.replicas.iter().enumerate().skip(1) {
            // A follower that fails to catch up retries on the next ping.
            if let Err(e) = replica.manager.start_following(0, self.epoch).await {
                warn!(peer_id = id, "Follower recovery failed: {e}");
            }
        }
        leader.refresh_followers().await;
        info!(epoch = %self.epoch, "Replica 0 is leading");

        let mut sweepers = self.sweepers.lock();
        for replica in &self.replicas {
            sweepers.push(GarbageSweeper::spawn(replica.service.clone()));
        }
        Ok(())
    }

    pub fn leader_version(&self) -> MetaVersion {
        self.replicas[0].manager.version()
    }

    /// Stop the sweepers first, then the replicas followers first.
    pub fn shutdown(&self) {
        for sweeper in self.sweepers.lock().drain(..) {
            sweeper.stop();
        }
        for replica in self.replicas.iter().rev() {
            info!(
                peer_id = replica.manager.self_id(),
                version = %replica.manager.version(),
                "{}",
                replica.service.gc_stats().render().trim_end()
            );
            replica.manager.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cell_starts_and_stops() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = MasterConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..MasterConfig::default()
        };
        let cell = MasterCell::open(&config, 3).unwrap();
        cell.start().await.unwrap();
        assert!(cell.replicas[0].manager.is_active_leader());
        assert!(temp_dir.path().join("peer-2").exists());
        cell.shutdown();
    }

    #[test]
    fn test_empty_cell_is_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = MasterConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..MasterConfig::default()
        };
        assert!(MasterCell::open(&config, 0).is_err());
    }
}
