//! The backup engine facade: snapshot dedup, diff + drift on write, window
//! queries, alerts, restore.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use waggle_types::{now_ms, AlertId, DiffId, SnapshotId, HOUR_MS};

use crate::db::{BackupDb, ConfigAlert, ConfigDiff, ConfigSnapshot, ConfigSystem};
use crate::diff::unified_diff;
use crate::drift::{DriftAnalyzer, DriftSeverity};

/// Diffs scoring at or above this threshold count as drift.
pub const DEFAULT_DRIFT_THRESHOLD: f64 = 0.2;

/// Errors raised by the backup engine.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("relational store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("unknown snapshot: {0}")]
    UnknownSnapshot(SnapshotId),

    #[error("unknown system: {0}")]
    UnknownSystem(String),

    #[error("restore write failed: {0}")]
    RestoreIo(#[from] std::io::Error),
}

/// Result of a snapshot create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotOutcome {
    pub snapshot_id: SnapshotId,
    /// True when the content matched the latest snapshot and no row was
    /// inserted.
    pub deduplicated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<ConfigDiff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<ConfigAlert>,
}

/// One drift hit, joined with system metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftFinding {
    pub diff: ConfigDiff,
    pub severity: DriftSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_type: Option<String>,
}

/// Result of a restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub content: String,
    /// The audit snapshot appended by the restore.
    pub audit_snapshot_id: SnapshotId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub written_to: Option<PathBuf>,
}

/// The config backup engine.
pub struct BackupEngine {
    db: BackupDb,
    analyzer: DriftAnalyzer,
    drift_threshold: f64,
}

impl BackupEngine {
    pub fn new(db: BackupDb, analyzer: DriftAnalyzer, drift_threshold: f64) -> Self {
        Self {
            db,
            analyzer,
            drift_threshold,
        }
    }

    pub fn in_memory() -> Result<Self, BackupError> {
        Ok(Self::new(
            BackupDb::in_memory()?,
            DriftAnalyzer::default(),
            DEFAULT_DRIFT_THRESHOLD,
        ))
    }

    pub fn db(&self) -> &BackupDb {
        &self.db
    }

    /// Register (or update) a monitored system.
    pub fn register_system(
        &self,
        system_id: &str,
        name: &str,
        system_type: &str,
        backup_frequency_s: Option<i64>,
        metadata: BTreeMap<String, String>,
    ) -> Result<ConfigSystem, BackupError> {
        let system = ConfigSystem {
            system_id: system_id.to_string(),
            name: name.to_string(),
            system_type: system_type.to_string(),
            backup_frequency_s,
            metadata,
            created_at: now_ms(),
        };
        self.db.upsert_system(&system)?;
        Ok(system)
    }

    pub fn list_systems(&self) -> Result<Vec<ConfigSystem>, BackupError> {
        Ok(self.db.list_systems()?)
    }

    /// Create a snapshot.
    ///
    /// If the latest snapshot for the system carries the same content hash,
    /// nothing is inserted and the prior id comes back. Otherwise the new
    /// row is written and a diff against the previous snapshot is computed
    /// synchronously; a severity of high or above auto-creates an alert.
    pub fn create_snapshot(
        &self,
        system_id: &str,
        content: &str,
        config_type: &str,
        file_path: Option<&str>,
        agent_id: &str,
        tags: Vec<String>,
    ) -> Result<SnapshotOutcome, BackupError> {
        // Snapshots may arrive before anyone registered the system; record
        // a minimal row so joins stay intact.
        if self.db.get_system(system_id)?.is_none() {
            self.register_system(system_id, system_id, config_type, None, BTreeMap::new())?;
        }

        let hash = hash_content(content);
        let previous = self.db.latest_snapshot(system_id)?;

        if let Some(prev) = &previous {
            if prev.content_hash == hash {
                debug!(system = system_id, snapshot = %prev.id, "snapshot deduplicated");
                return Ok(SnapshotOutcome {
                    snapshot_id: prev.id,
                    deduplicated: true,
                    diff: None,
                    alert: None,
                });
            }
        }

        let snapshot = ConfigSnapshot {
            id: SnapshotId::new(),
            system_id: system_id.to_string(),
            config_type: config_type.to_string(),
            content: content.to_string(),
            content_hash: hash,
            file_path: file_path.map(str::to_string),
            agent_id: agent_id.to_string(),
            timestamp: now_ms(),
            size: content.len() as i64,
            tags,
        };
        self.db.insert_snapshot(&snapshot)?;

        let (diff, alert) = match previous {
            Some(prev) => {
                let diff = self.diff_snapshots(&prev, &snapshot, "modified")?;
                let alert = self.maybe_alert(&diff)?;
                (Some(diff), alert)
            }
            None => (None, None),
        };

        info!(
            system = system_id,
            snapshot = %snapshot.id,
            diffed = diff.is_some(),
            "snapshot created"
        );
        Ok(SnapshotOutcome {
            snapshot_id: snapshot.id,
            deduplicated: false,
            diff,
            alert,
        })
    }

    pub fn get_snapshot(&self, id: SnapshotId) -> Result<ConfigSnapshot, BackupError> {
        self.db
            .get_snapshot(id)?
            .ok_or(BackupError::UnknownSnapshot(id))
    }

    pub fn list_snapshots(
        &self,
        system_id: &str,
        limit: usize,
    ) -> Result<Vec<ConfigSnapshot>, BackupError> {
        Ok(self.db.list_snapshots(system_id, limit)?)
    }

    /// Latest config content for a system.
    pub fn get_current_config(&self, system_id: &str) -> Result<ConfigSnapshot, BackupError> {
        self.db
            .latest_snapshot(system_id)?
            .ok_or_else(|| BackupError::UnknownSystem(system_id.to_string()))
    }

    pub fn get_diff(&self, id: DiffId) -> Result<Option<ConfigDiff>, BackupError> {
        Ok(self.db.get_diff(id)?)
    }

    /// Every diff in the window scoring at or above the drift threshold,
    /// sorted by severity then recency.
    pub fn detect_drift(
        &self,
        system_id: Option<&str>,
        hours_back: i64,
    ) -> Result<Vec<DriftFinding>, BackupError> {
        let since = now_ms() - hours_back.max(0) * HOUR_MS;
        let rows = self
            .db
            .diffs_in_window(system_id, since, self.drift_threshold)?;
        Ok(rows
            .into_iter()
            .map(|(diff, system)| DriftFinding {
                severity: DriftSeverity::from_score(diff.risk_score),
                system_name: system.as_ref().map(|s| s.name.clone()),
                system_type: system.map(|s| s.system_type),
                diff,
            })
            .collect())
    }

    /// Create an alert for a diff. Idempotent on `(system_id, diff_id)`.
    pub fn create_alert(&self, diff: &ConfigDiff) -> Result<ConfigAlert, BackupError> {
        let severity = DriftSeverity::from_score(diff.risk_score);
        let score = self.analyzer.score(&diff.diff_text, 1);
        let drift_type = if score.matched.is_empty() {
            "change-volume".to_string()
        } else {
            score.matched.join(",")
        };
        let alert = ConfigAlert {
            id: AlertId::new(),
            system_id: diff.system_id.clone(),
            diff_id: diff.id,
            severity,
            drift_type,
            description: format!(
                "config drift on '{}': +{} -{} lines, risk {:.2}",
                diff.system_id, diff.lines_added, diff.lines_removed, diff.risk_score
            ),
            created_at: now_ms(),
            acknowledged_at: None,
        };
        Ok(self.db.insert_alert(&alert)?)
    }

    pub fn get_alerts(
        &self,
        system_id: Option<&str>,
        include_acknowledged: bool,
    ) -> Result<Vec<ConfigAlert>, BackupError> {
        Ok(self.db.list_alerts(system_id, include_acknowledged)?)
    }

    pub fn acknowledge_alert(&self, id: AlertId) -> Result<bool, BackupError> {
        Ok(self.db.acknowledge_alert(id)?)
    }

    /// Restore a snapshot's content.
    ///
    /// When `target_path` is set the content is written atomically (temp
    /// file in the target directory, then rename). A restore always appends
    /// a new audit snapshot; it never rewrites history, so dedup is skipped
    /// for that row.
    pub fn restore(
        &self,
        snapshot_id: SnapshotId,
        target_path: Option<&Path>,
        agent_id: &str,
    ) -> Result<RestoreOutcome, BackupError> {
        let snapshot = self.get_snapshot(snapshot_id)?;

        let written_to = match target_path {
            Some(path) => {
                let dir = match path.parent() {
                    Some(parent) if !parent.as_os_str().is_empty() => parent,
                    _ => Path::new("."),
                };
                let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
                tmp.write_all(snapshot.content.as_bytes())?;
                tmp.flush()?;
                tmp.persist(path).map_err(|e| e.error)?;
                Some(path.to_path_buf())
            }
            None => None,
        };

        let audit = ConfigSnapshot {
            id: SnapshotId::new(),
            system_id: snapshot.system_id.clone(),
            config_type: snapshot.config_type.clone(),
            content: snapshot.content.clone(),
            content_hash: snapshot.content_hash.clone(),
            file_path: written_to.as_ref().map(|p| p.display().to_string()),
            agent_id: agent_id.to_string(),
            timestamp: now_ms(),
            size: snapshot.size,
            tags: vec!["restore".into(), format!("restored_from:{}", snapshot.id)],
        };
        self.db.insert_snapshot(&audit)?;

        if written_to.is_some() {
            warn!(
                system = %snapshot.system_id,
                snapshot = %snapshot.id,
                "config restored to disk"
            );
        }

        Ok(RestoreOutcome {
            content: snapshot.content,
            audit_snapshot_id: audit.id,
            written_to,
        })
    }

    fn diff_snapshots(
        &self,
        before: &ConfigSnapshot,
        after: &ConfigSnapshot,
        change_type: &str,
    ) -> Result<ConfigDiff, BackupError> {
        let stats = unified_diff(&before.content, &after.content);
        let score = self
            .analyzer
            .score(&stats.text, before.content.lines().count());

        let diff = ConfigDiff {
            id: DiffId::new(),
            system_id: after.system_id.clone(),
            snapshot_before: before.id,
            snapshot_after: after.id,
            diff_text: stats.text,
            lines_added: stats.added as i64,
            lines_removed: stats.removed as i64,
            change_type: change_type.to_string(),
            risk_score: score.risk,
            created_at: now_ms(),
        };
        self.db.insert_diff(&diff)?;
        Ok(diff)
    }

    fn maybe_alert(&self, diff: &ConfigDiff) -> Result<Option<ConfigAlert>, BackupError> {
        if DriftSeverity::from_score(diff.risk_score) >= DriftSeverity::High {
            Ok(Some(self.create_alert(diff)?))
        } else {
            Ok(None)
        }
    }
}

/// Sha-256 hex of a snapshot's content.
pub fn hash_content(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}
