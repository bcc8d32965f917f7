//! Core domain types and shared logic for the roost fleet control plane.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Command queue lifecycle states
//! - Upgrade stages and per-repo commit maps
//! - Release-set fingerprints for exact-set deduplication
//! - Store configuration

pub mod command;
pub mod config;
pub mod error;
pub mod release;

pub use command::CommandState;
pub use config::{FleetDbConfig, PgSslMode};
pub use error::{Error, Result};
pub use release::{CommitMap, KvMap, UpgradeStage, advisory_lock_key, canonical_artifact_set};
