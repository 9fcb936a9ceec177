//! # waggle-backup
//!
//! The config backup engine: deduplicated snapshots of external system
//! configs, synchronous unified diffs, table-driven drift scoring with
//! severity buckets, idempotent alerts, and atomic restores that append to
//! the audit trail instead of rewriting it.
//!
//! The relational store behind it (`BackupDb`) also carries the durability
//! tables for agents and delegated tasks.

pub mod db;
pub mod diff;
pub mod drift;
pub mod engine;

pub use db::{
    AgentTaskRow, BackupDb, ConfigAlert, ConfigDiff, ConfigSnapshot, ConfigSystem,
};
pub use diff::{unified_diff, DiffStats};
pub use drift::{DriftAnalyzer, DriftPattern, DriftSeverity};
pub use engine::{
    BackupEngine, BackupError, DriftFinding, RestoreOutcome, SnapshotOutcome,
    DEFAULT_DRIFT_THRESHOLD,
};
