//! Decorated meta state
//!
//! Wraps an [`Automaton`] with the replicated log position, the changelog
//! and the snapshot store. Every state change on a replica goes through
//! `log_mutation` + `apply_mutation` here, in version order.

use crate::async_changelog::{AsyncChangeLogWriter, FlushFuture};
use crate::automaton::Automaton;
use crate::changelog::{ChangeLogHandle, ChangeLogStore};
use crate::mutation::{MutationContext, MutationRecord, MutationResponse};
use crate::snapshot::{Snapshot, SnapshotStore};
use bytes::Bytes;
use cellmaster_common::config::MetaStateConfig;
use cellmaster_common::{Error, MetaVersion, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Records read per changelog access while replaying.
const REPLAY_BATCH_RECORDS: usize = 1024;

pub struct DecoratedMetaState<A: Automaton> {
    automaton: A,
    version: MetaVersion,
    recovery: bool,
    changelogs: Arc<ChangeLogStore>,
    current_log: Option<ChangeLogHandle>,
    writer: AsyncChangeLogWriter,
    snapshots: SnapshotStore,
    applied: watch::Sender<MetaVersion>,
}

impl<A: Automaton> DecoratedMetaState<A> {
    /// Open the changelog directory and snapshot store under `data_dir`.
    /// The state is empty until [`recover`](Self::recover) is called.
    pub fn open(
        name: &str,
        data_dir: impl AsRef<Path>,
        config: &MetaStateConfig,
        mut automaton: A,
    ) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let changelogs = Arc::new(ChangeLogStore::open(data_dir.join("changelogs"))?);
        let snapshots = SnapshotStore::open(data_dir.join("snapshots.redb"))?;
        let writer = AsyncChangeLogWriter::start(name, config.changelog_sync)?;
        automaton.clear();
        let (applied, _) = watch::channel(MetaVersion::default());
        Ok(Self {
            automaton,
            version: MetaVersion::default(),
            recovery: false,
            changelogs,
            current_log: None,
            writer,
            snapshots,
            applied,
        })
    }

    /// Current applied version.
    pub const fn version(&self) -> MetaVersion {
        self.version
    }

    pub const fn automaton(&self) -> &A {
        &self.automaton
    }

    pub fn automaton_mut(&mut self) -> &mut A {
        &mut self.automaton
    }

    pub const fn is_recovery(&self) -> bool {
        self.recovery
    }

    /// Watch the applied version; updated after every mutation and rotation.
    pub fn subscribe_applied(&self) -> watch::Receiver<MetaVersion> {
        self.applied.subscribe()
    }

    pub const fn changelogs(&self) -> &Arc<ChangeLogStore> {
        &self.changelogs
    }

    pub fn start_recovery(&mut self) {
        if !self.recovery {
            self.recovery = true;
            self.automaton.on_recovery_started();
        }
    }

    pub fn finish_recovery(&mut self) {
        if self.recovery {
            self.recovery = false;
            self.automaton.on_recovery_complete();
        }
    }

    /// Rebuild the state from the latest snapshot plus every later
    /// changelog record, then open a changelog for appending.
    pub fn recover(&mut self) -> Result<()> {
        self.automaton.clear();
        self.version = MetaVersion::default();
        self.current_log = None;

        if let Some(snapshot_id) = self.snapshots.latest_id()? {
            let snapshot = self
                .snapshots
                .load(snapshot_id)?
                .ok_or_else(|| Error::Snapshot(format!("snapshot {snapshot_id} vanished")))?;
            self.automaton.load(&snapshot.sections)?;
            self.version = snapshot.version;
            info!(snapshot_id, version = %self.version, "Snapshot loaded");
        }

        let segment_ids: Vec<u32> = self
            .changelogs
            .segment_ids()?
            .into_iter()
            .filter(|id| *id >= self.version.segment_id)
            .collect();
        for segment_id in segment_ids {
            let log = self.changelogs.find(segment_id)?.ok_or_else(|| {
                Error::ChangeLog(format!("changelog {segment_id} vanished"))
            })?;
            if segment_id != self.version.segment_id {
                if segment_id != self.version.segment_id + 1 {
                    return Err(Error::ChangeLog(format!(
                        "changelog gap: version {} is followed by segment {segment_id}",
                        self.version
                    )));
                }
                let prev_record_count = log.lock().prev_record_count();
                if prev_record_count != self.version.record_count {
                    return Err(Error::ChangeLog(format!(
                        "changelog {segment_id} expects {prev_record_count} records in the previous segment, found {}",
                        self.version.record_count
                    )));
                }
                self.version = self.version.rotate();
            }
            self.replay(&log)?;
            self.current_log = Some(log);
        }

        let reusable = self
            .current_log
            .as_ref()
            .is_some_and(|log| !log.lock().is_sealed());
        if !reusable {
            if self.current_log.is_some() {
                let prev_record_count = self.version.record_count;
                self.version = self.version.rotate();
                self.current_log = Some(
                    self.changelogs
                        .create(self.version.segment_id, prev_record_count)?,
                );
            } else {
                self.current_log = Some(self.changelogs.create(self.version.segment_id, 0)?);
            }
        }

        self.applied.send_replace(self.version);
        info!(version = %self.version, "Meta state recovered");
        Ok(())
    }

    fn replay(&mut self, log: &ChangeLogHandle) -> Result<()> {
        loop {
            let records = log
                .lock()
                .read(self.version.record_count, REPLAY_BATCH_RECORDS)?;
            if records.is_empty() {
                return Ok(());
            }
            for record in records {
                self.apply_mutation(&record);
            }
        }
    }

    /// Append a record at `version` to the active changelog. The returned
    /// future resolves once the record is durable.
    pub fn log_mutation(&self, version: MetaVersion, data: Bytes) -> FlushFuture {
        assert_eq!(
            version, self.version,
            "mutation logged at {version} while state is at {}",
            self.version
        );
        match &self.current_log {
            Some(log) => self.writer.append(log, version.record_count, data),
            None => Box::pin(futures::future::ready(Err(Error::ChangeLog(
                "no changelog is open".into(),
            )))),
        }
    }

    /// Apply a logged record and advance the version by one.
    pub fn apply_mutation(&mut self, data: &[u8]) -> MutationResponse {
        let record = MutationRecord::from_bytes(data).unwrap_or_else(|e| {
            panic!("undecodable mutation at {}: {e}", self.version);
        });
        let version = self.version;
        let mut context = MutationContext::new(version, record, self.recovery);
        if !self.recovery {
            debug!(version = %version, mutation_type = context.mutation_type(), "Applying mutation");
        }
        self.automaton.apply(&mut context);
        self.version = version.advance();
        self.applied.send_replace(self.version);
        MutationResponse {
            version,
            data: context.take_response(),
        }
    }

    /// Log and apply a record at the current version.
    pub fn log_and_apply(&mut self, data: Bytes) -> (FlushFuture, MutationResponse) {
        let flushed = self.log_mutation(self.version, data.clone());
        let response = self.apply_mutation(&data);
        (flushed, response)
    }

    /// Seal the active changelog and start the next segment.
    pub fn rotate_changelog(&mut self) -> Result<FlushFuture> {
        let sealed = match &self.current_log {
            Some(log) => self.writer.seal(log),
            None => return Err(Error::ChangeLog("no changelog is open".into())),
        };
        let prev_record_count = self.version.record_count;
        let next = self.version.rotate();
        self.current_log = Some(self.changelogs.create(next.segment_id, prev_record_count)?);
        self.version = next;
        self.applied.send_replace(self.version);
        info!(version = %self.version, "Changelog rotated");
        Ok(sealed)
    }

    /// Save a snapshot of the current state; only valid at a segment start.
    pub fn save_snapshot(&self) -> Result<MetaVersion> {
        if self.version.record_count != 0 {
            return Err(Error::Snapshot(format!(
                "snapshot requested at {}, not at a segment start",
                self.version
            )));
        }
        let snapshot = Snapshot {
            version: self.version,
            sections: self.automaton.save()?,
        };
        self.snapshots.save(&snapshot)?;
        Ok(self.version)
    }

    /// Drop every logged record after `version`. The caller must await the
    /// returned future and then [`recover`](Self::recover).
    pub fn truncate_changelogs(&mut self, version: MetaVersion) -> Result<FlushFuture> {
        warn!(from = %self.version, to = %version, "Discarding diverged changelog records");
        self.changelogs.remove_after(version.segment_id)?;
        self.snapshots.remove_after(version.segment_id)?;
        let log = self.changelogs.find(version.segment_id)?;
        self.current_log = None;
        Ok(match log {
            Some(log) => self.writer.truncate(&log, version.record_count),
            None => Box::pin(futures::future::ready(Ok(()))),
        })
    }

    /// Read up to `max_records` logged records of a segment.
    pub fn read_changes(
        &self,
        segment_id: u32,
        first_record: u32,
        max_records: usize,
    ) -> Result<Vec<Bytes>> {
        match self.changelogs.find(segment_id)? {
            Some(log) => log.lock().read(first_record, max_records),
            None => Err(Error::ChangeLog(format!("no changelog {segment_id}"))),
        }
    }

    /// Record count of a segment, if it exists.
    pub fn changelog_record_count(&self, segment_id: u32) -> Result<Option<u32>> {
        Ok(self
            .changelogs
            .find(segment_id)?
            .map(|log| log.lock().record_count()))
    }
}
