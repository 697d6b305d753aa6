//! Configuration types for cellmaster
//!
//! This module defines configuration structures shared by the meta-state,
//! object and transaction layers. Every section deserializes from a partial
//! document; absent fields take their defaults.

use crate::error::{Error, Result};
use crate::types::CellId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration of a master replica
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Cell identifier embedded into every generated object id
    pub cell_id: CellId,
    /// Directory holding changelogs and snapshots
    pub data_dir: PathBuf,
    /// Replication and changelog settings
    pub meta_state: MetaStateConfig,
    /// Object manager and GC settings
    pub object_manager: ObjectManagerConfig,
    /// Transaction manager settings
    pub transaction_manager: TransactionManagerConfig,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            cell_id: 0,
            data_dir: PathBuf::from("/var/lib/cellmaster"),
            meta_state: MetaStateConfig::default(),
            object_manager: ObjectManagerConfig::default(),
            transaction_manager: TransactionManagerConfig::default(),
        }
    }
}

impl MasterConfig {
    /// Reject settings that would stall the commit pipeline or the GC.
    pub fn validate(&self) -> Result<()> {
        if self.meta_state.max_batch_size == 0 {
            return Err(Error::Configuration(
                "meta_state.max_batch_size must be positive".into(),
            ));
        }
        if self.meta_state.rpc_timeout_ms == 0 {
            return Err(Error::Configuration(
                "meta_state.rpc_timeout_ms must be positive".into(),
            ));
        }
        if self.meta_state.max_changes_between_snapshots == Some(0) {
            return Err(Error::Configuration(
                "meta_state.max_changes_between_snapshots must be positive when set".into(),
            ));
        }
        if self.object_manager.max_objects_per_gc_sweep == 0 {
            return Err(Error::Configuration(
                "object_manager.max_objects_per_gc_sweep must be positive".into(),
            ));
        }
        if self.object_manager.gc_sweep_period_ms == 0 {
            return Err(Error::Configuration(
                "object_manager.gc_sweep_period_ms must be positive".into(),
            ));
        }
        let tx = &self.transaction_manager;
        if tx.default_transaction_timeout_ms > tx.max_transaction_timeout_ms {
            return Err(Error::Configuration(format!(
                "transaction_manager.default_transaction_timeout_ms ({}) exceeds max_transaction_timeout_ms ({})",
                tx.default_transaction_timeout_ms, tx.max_transaction_timeout_ms
            )));
        }
        Ok(())
    }
}

/// Changelog synchronization mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeLogSyncMode {
    /// fsync once per drained append batch (durable)
    #[default]
    OnFlush,
    /// Leave syncing to the OS (tests, throwaway cells)
    Never,
}

/// Replication settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaStateConfig {
    /// Changes per batch before an early flush
    pub max_batch_size: usize,
    /// Delay after the first change of a batch before it is flushed (milliseconds)
    pub max_batch_delay_ms: u64,
    /// Timeout of replication RPCs to followers (milliseconds)
    pub rpc_timeout_ms: u64,
    /// Period of leader->follower pings (milliseconds)
    pub follower_ping_period_ms: u64,
    /// Rotate the changelog (and snapshot) after this many records; `None` disables
    pub max_changes_between_snapshots: Option<u32>,
    /// Changelog durability
    pub changelog_sync: ChangeLogSyncMode,
}

impl Default for MetaStateConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10_000,
            max_batch_delay_ms: 10,
            rpc_timeout_ms: 3_000,
            follower_ping_period_ms: 1_000,
            max_changes_between_snapshots: Some(1_000_000),
            changelog_sync: ChangeLogSyncMode::OnFlush,
        }
    }
}

impl MetaStateConfig {
    #[must_use]
    pub const fn max_batch_delay(&self) -> Duration {
        Duration::from_millis(self.max_batch_delay_ms)
    }

    #[must_use]
    pub const fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    #[must_use]
    pub const fn follower_ping_period(&self) -> Duration {
        Duration::from_millis(self.follower_ping_period_ms)
    }
}

/// Object manager settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectManagerConfig {
    /// Period of the GC sweep (milliseconds)
    pub gc_sweep_period_ms: u64,
    /// Upper bound of object ids in one destroy mutation
    pub max_objects_per_gc_sweep: usize,
    /// Number of mutation responses kept for retransmission
    pub response_keeper_capacity: usize,
}

impl Default for ObjectManagerConfig {
    fn default() -> Self {
        Self {
            gc_sweep_period_ms: 1_000,
            max_objects_per_gc_sweep: 1_000,
            response_keeper_capacity: 10_000,
        }
    }
}

impl ObjectManagerConfig {
    #[must_use]
    pub const fn gc_sweep_period(&self) -> Duration {
        Duration::from_millis(self.gc_sweep_period_ms)
    }
}

/// Transaction manager settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionManagerConfig {
    /// Timeout of transactions started without an explicit one (milliseconds)
    pub default_transaction_timeout_ms: u64,
    /// Upper bound for requested timeouts (milliseconds)
    pub max_transaction_timeout_ms: u64,
}

impl Default for TransactionManagerConfig {
    fn default() -> Self {
        Self {
            default_transaction_timeout_ms: 15_000,
            max_transaction_timeout_ms: 600_000,
        }
    }
}

impl TransactionManagerConfig {
    /// Effective timeout for a transaction requesting `requested_ms`.
    #[must_use]
    pub fn effective_timeout_ms(&self, requested_ms: Option<u64>) -> u64 {
        requested_ms
            .unwrap_or(self.default_transaction_timeout_ms)
            .min(self.max_transaction_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MasterConfig::default();
        assert_eq!(config.meta_state.max_batch_size, 10_000);
        assert_eq!(config.meta_state.max_batch_delay(), Duration::from_millis(10));
        assert_eq!(config.object_manager.gc_sweep_period(), Duration::from_secs(1));
        assert_eq!(config.object_manager.max_objects_per_gc_sweep, 1_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = MasterConfig::default();
        config.meta_state.max_batch_size = 0;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let mut config = MasterConfig::default();
        config.object_manager.max_objects_per_gc_sweep = 0;
        assert!(config.validate().is_err());

        let mut config = MasterConfig::default();
        config.transaction_manager.default_transaction_timeout_ms = 700_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_transaction_timeout_clamped() {
        let config = TransactionManagerConfig::default();
        assert_eq!(config.effective_timeout_ms(None), 15_000);
        assert_eq!(config.effective_timeout_ms(Some(1_000)), 1_000);
        assert_eq!(config.effective_timeout_ms(Some(u64::MAX)), 600_000);
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let config: MasterConfig =
            serde_json::from_str(r#"{"cell_id": 7, "meta_state": {"max_batch_size": 5}}"#).unwrap();
        assert_eq!(config.cell_id, 7);
        assert_eq!(config.meta_state.max_batch_size, 5);
        assert_eq!(config.meta_state.rpc_timeout_ms, 3_000);
        assert_eq!(config.meta_state.changelog_sync, ChangeLogSyncMode::OnFlush);
    }
}
