//! Follower catch-up
//!
//! A follower brings its log to the leader's version by reading the
//! records it is missing from the leader's changelogs. Segments are rotated
//! locally as they are crossed. Records the leader never had are truncated
//! away and the state is rebuilt from the remaining log.

use crate::automaton::Automaton;
use crate::committer::SharedState;
use crate::peer::{PeerChannel, PeerStatus};
use cellmaster_common::{Epoch, Error, MetaVersion, Result};
use futures::future::try_join_all;
use std::cmp::Ordering;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Records requested from the leader per read.
pub const MAX_RECORDS_PER_READ: usize = 1024;

/// Catch-up of one follower against one leader epoch.
pub struct FollowerRecovery<A: Automaton> {
    state: SharedState<A>,
    leader: Arc<dyn PeerChannel>,
    epoch: Epoch,
    rpc_timeout: Duration,
}

impl<A: Automaton> FollowerRecovery<A> {
    pub fn new(
        state: SharedState<A>,
        leader: Arc<dyn PeerChannel>,
        epoch: Epoch,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            state,
            leader,
            epoch,
            rpc_timeout,
        }
    }

    async fn call<T>(&self, what: &str, request: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.rpc_timeout, request)
            .await
            .map_err(|_| Error::unavailable(format!("{what} request to leader timed out")))?
    }

    /// Catch up with the leader; returns the version reached.
    pub async fn run(&self) -> Result<MetaVersion> {
        loop {
            let leader_state = self.call("state", self.leader.get_state()).await?;
            if leader_state.epoch != self.epoch {
                return Err(Error::InvalidEpoch {
                    expected: self.epoch,
                    actual: leader_state.epoch,
                });
            }
            if leader_state.status != PeerStatus::Leading {
                return Err(Error::unavailable(format!(
                    "leader is {}, not leading",
                    leader_state.status
                )));
            }

            let target = leader_state.version;
            let local = self.state.lock().version();
            if local == target {
                info!(version = %local, "Follower caught up with leader");
                return Ok(local);
            }
            self.step(local, target).await?;
        }
    }

    async fn step(&self, local: MetaVersion, target: MetaVersion) -> Result<()> {
        match local.segment_id.cmp(&target.segment_id) {
            Ordering::Greater => self.truncate(target).await,
            Ordering::Equal => match local.record_count.cmp(&target.record_count) {
                Ordering::Greater => self.truncate(target).await,
                Ordering::Less => self.fetch(local, target.record_count).await,
                Ordering::Equal => Ok(()),
            },
            Ordering::Less => {
                let leader_count = self
                    .call("changelog info", self.leader.get_changelog_info(local.segment_id))
                    .await?
                    .ok_or_else(|| {
                        Error::ChangeLog(format!(
                            "leader has no changelog {}",
                            local.segment_id
                        ))
                    })?;
                match local.record_count.cmp(&leader_count) {
                    Ordering::Greater => {
                        self.truncate(MetaVersion::new(local.segment_id, leader_count))
                            .await
                    }
                    Ordering::Less => self.fetch(local, leader_count).await,
                    Ordering::Equal => self.rotate(local).await,
                }
            }
        }
    }

    /// Apply leader records `[local.record_count, up_to)` of the local segment.
    async fn fetch(&self, local: MetaVersion, up_to: u32) -> Result<()> {
        let wanted = ((up_to - local.record_count) as usize).min(MAX_RECORDS_PER_READ);
        let records = self
            .call(
                "read changes",
                self.leader
                    .read_changes(local.segment_id, local.record_count, wanted),
            )
            .await?;
        if records.is_empty() {
            return Err(Error::unavailable(format!(
                "leader returned no records at {local}"
            )));
        }
        debug!(from = %local, count = records.len(), "Applying records read from leader");

        let flushes = {
            let mut state = self.state.lock();
            if state.version() != local {
                return Err(Error::InvalidVersion {
                    expected: local,
                    actual: state.version(),
                });
            }
            records
                .into_iter()
                .map(|record| state.log_and_apply(record).0)
                .collect::<Vec<_>>()
        };
        try_join_all(flushes).await?;
        Ok(())
    }

    async fn rotate(&self, local: MetaVersion) -> Result<()> {
        let sealed = {
            let mut state = self.state.lock();
            if state.version() != local {
                return Err(Error::InvalidVersion {
                    expected: local,
                    actual: state.version(),
                });
            }
            state.rotate_changelog()?
        };
        sealed.await
    }

    async fn truncate(&self, version: MetaVersion) -> Result<()> {
        warn!(leader_version = %version, "Follower log diverged from leader");
        let truncated = self.state.lock().truncate_changelogs(version)?;
        truncated.await?;
        self.state.lock().recover()
    }
}
