//! Cellmaster Common - Shared types and utilities
//!
//! This crate provides the identifiers, the replicated log clock, the
//! error taxonomy and the configuration types used by every cellmaster
//! component.

pub mod config;
pub mod error;
pub mod types;
pub mod version;

pub use config::MasterConfig;
pub use error::{Error, ErrorCode, Result, WireError};
pub use types::*;
pub use version::MetaVersion;
