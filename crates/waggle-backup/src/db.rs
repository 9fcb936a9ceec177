//! SQLite layer for config backups and coordination durability.
//!
//! One connection behind a mutex; statements are short and reads clone rows
//! out before returning.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

use waggle_types::{now_ms, AlertId, DiffId, SnapshotId, TaskId};

use crate::drift::DriftSeverity;

/// A monitored external system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSystem {
    pub system_id: String,
    pub name: String,
    pub system_type: String,
    #[serde(default)]
    pub backup_frequency_s: Option<i64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: i64,
}

/// One content-hashed snapshot of a system's config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub id: SnapshotId,
    pub system_id: String,
    pub config_type: String,
    pub content: String,
    pub content_hash: String,
    #[serde(default)]
    pub file_path: Option<String>,
    pub agent_id: String,
    pub timestamp: i64,
    pub size: i64,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// The computed difference between two consecutive snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigDiff {
    pub id: DiffId,
    pub system_id: String,
    pub snapshot_before: SnapshotId,
    pub snapshot_after: SnapshotId,
    pub diff_text: String,
    pub lines_added: i64,
    pub lines_removed: i64,
    pub change_type: String,
    pub risk_score: f64,
    pub created_at: i64,
}

/// A drift alert, idempotent on `(system_id, diff_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigAlert {
    pub id: AlertId,
    pub system_id: String,
    pub diff_id: DiffId,
    pub severity: DriftSeverity,
    pub drift_type: String,
    pub description: String,
    pub created_at: i64,
    #[serde(default)]
    pub acknowledged_at: Option<i64>,
}

/// Durability row for a delegated task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTaskRow {
    pub task_id: TaskId,
    pub task: String,
    pub assignee: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub deadline: Option<i64>,
    pub delegated_at: i64,
    pub status: String,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS config_systems (
    system_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    system_type TEXT NOT NULL,
    backup_frequency_s INTEGER,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS config_snapshots (
    id TEXT PRIMARY KEY,
    system_id TEXT NOT NULL REFERENCES config_systems(system_id),
    config_type TEXT NOT NULL,
    content TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    file_path TEXT,
    agent_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    size INTEGER NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]'
);
CREATE INDEX IF NOT EXISTS idx_snapshots_system_time
    ON config_snapshots(system_id, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_snapshots_hash ON config_snapshots(content_hash);

CREATE TABLE IF NOT EXISTS config_diffs (
    id TEXT PRIMARY KEY,
    system_id TEXT NOT NULL REFERENCES config_systems(system_id),
    snapshot_before TEXT NOT NULL,
    snapshot_after TEXT NOT NULL,
    diff_text TEXT NOT NULL,
    lines_added INTEGER NOT NULL,
    lines_removed INTEGER NOT NULL,
    change_type TEXT NOT NULL,
    risk_score REAL NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_diffs_system_time ON config_diffs(system_id, created_at);
CREATE INDEX IF NOT EXISTS idx_diffs_risk ON config_diffs(risk_score);

CREATE TABLE IF NOT EXISTS config_alerts (
    id TEXT PRIMARY KEY,
    system_id TEXT NOT NULL,
    diff_id TEXT NOT NULL,
    severity TEXT NOT NULL,
    drift_type TEXT NOT NULL,
    description TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    acknowledged_at INTEGER,
    UNIQUE(system_id, diff_id)
);
CREATE INDEX IF NOT EXISTS idx_alerts_system ON config_alerts(system_id);

CREATE TABLE IF NOT EXISTS agent_registry (
    agent_id TEXT PRIMARY KEY,
    machine_id TEXT NOT NULL,
    role TEXT NOT NULL,
    capabilities TEXT NOT NULL DEFAULT '[]',
    registered_at INTEGER NOT NULL,
    last_seen INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_tasks (
    task_id TEXT PRIMARY KEY,
    task TEXT NOT NULL,
    assignee TEXT NOT NULL,
    priority TEXT,
    deadline INTEGER,
    delegated_at INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'assigned'
);
CREATE INDEX IF NOT EXISTS idx_tasks_assignee ON agent_tasks(assignee);

CREATE TABLE IF NOT EXISTS task_dependencies (
    task_id TEXT NOT NULL,
    depends_on TEXT NOT NULL,
    PRIMARY KEY (task_id, depends_on)
);
"#;

/// Database handle for the backup engine and coordination durability.
pub struct BackupDb {
    conn: Mutex<Connection>,
}

impl BackupDb {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqliteResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database (tests, ephemeral hubs).
    pub fn in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // =========================================================================
    // Systems
    // =========================================================================

    /// Insert or update a system row.
    pub fn upsert_system(&self, system: &ConfigSystem) -> SqliteResult<()> {
        let metadata = serde_json::to_string(&system.metadata).unwrap_or_else(|_| "{}".into());
        self.conn.lock().execute(
            "INSERT INTO config_systems (system_id, name, system_type, backup_frequency_s, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(system_id) DO UPDATE SET
                 name = excluded.name,
                 system_type = excluded.system_type,
                 backup_frequency_s = excluded.backup_frequency_s,
                 metadata = excluded.metadata",
            params![
                system.system_id,
                system.name,
                system.system_type,
                system.backup_frequency_s,
                metadata,
                system.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_system(&self, system_id: &str) -> SqliteResult<Option<ConfigSystem>> {
        self.conn
            .lock()
            .query_row(
                "SELECT system_id, name, system_type, backup_frequency_s, metadata, created_at
                 FROM config_systems WHERE system_id = ?1",
                params![system_id],
                row_to_system,
            )
            .optional()
    }

    pub fn list_systems(&self) -> SqliteResult<Vec<ConfigSystem>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT system_id, name, system_type, backup_frequency_s, metadata, created_at
             FROM config_systems ORDER BY system_id",
        )?;
        let rows = stmt.query_map([], row_to_system)?;
        rows.collect()
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    pub fn insert_snapshot(&self, snapshot: &ConfigSnapshot) -> SqliteResult<()> {
        let tags = serde_json::to_string(&snapshot.tags).unwrap_or_else(|_| "[]".into());
        self.conn.lock().execute(
            "INSERT INTO config_snapshots
                 (id, system_id, config_type, content, content_hash, file_path, agent_id, timestamp, size, tags)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                snapshot.id.to_hex(),
                snapshot.system_id,
                snapshot.config_type,
                snapshot.content,
                snapshot.content_hash,
                snapshot.file_path,
                snapshot.agent_id,
                snapshot.timestamp,
                snapshot.size,
                tags,
            ],
        )?;
        Ok(())
    }

    pub fn get_snapshot(&self, id: SnapshotId) -> SqliteResult<Option<ConfigSnapshot>> {
        self.conn
            .lock()
            .query_row(
                "SELECT id, system_id, config_type, content, content_hash, file_path, agent_id, timestamp, size, tags
                 FROM config_snapshots WHERE id = ?1",
                params![id.to_hex()],
                row_to_snapshot,
            )
            .optional()
    }

    /// Most recent snapshot for a system.
    pub fn latest_snapshot(&self, system_id: &str) -> SqliteResult<Option<ConfigSnapshot>> {
        self.conn
            .lock()
            .query_row(
                "SELECT id, system_id, config_type, content, content_hash, file_path, agent_id, timestamp, size, tags
                 FROM config_snapshots WHERE system_id = ?1
                 ORDER BY timestamp DESC, id DESC LIMIT 1",
                params![system_id],
                row_to_snapshot,
            )
            .optional()
    }

    pub fn list_snapshots(&self, system_id: &str, limit: usize) -> SqliteResult<Vec<ConfigSnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, system_id, config_type, content, content_hash, file_path, agent_id, timestamp, size, tags
             FROM config_snapshots WHERE system_id = ?1
             ORDER BY timestamp DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![system_id, limit as i64], row_to_snapshot)?;
        rows.collect()
    }

    // =========================================================================
    // Diffs
    // =========================================================================

    pub fn insert_diff(&self, diff: &ConfigDiff) -> SqliteResult<()> {
        self.conn.lock().execute(
            "INSERT INTO config_diffs
                 (id, system_id, snapshot_before, snapshot_after, diff_text, lines_added, lines_removed, change_type, risk_score, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                diff.id.to_hex(),
                diff.system_id,
                diff.snapshot_before.to_hex(),
                diff.snapshot_after.to_hex(),
                diff.diff_text,
                diff.lines_added,
                diff.lines_removed,
                diff.change_type,
                diff.risk_score,
                diff.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_diff(&self, id: DiffId) -> SqliteResult<Option<ConfigDiff>> {
        self.conn
            .lock()
            .query_row(
                "SELECT id, system_id, snapshot_before, snapshot_after, diff_text, lines_added, lines_removed, change_type, risk_score, created_at
                 FROM config_diffs WHERE id = ?1",
                params![id.to_hex()],
                row_to_diff,
            )
            .optional()
    }

    /// Diffs at or above a risk floor inside a time window, joined with
    /// their system rows.
    pub fn diffs_in_window(
        &self,
        system_id: Option<&str>,
        since_ms: i64,
        min_risk: f64,
    ) -> SqliteResult<Vec<(ConfigDiff, Option<ConfigSystem>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT d.id, d.system_id, d.snapshot_before, d.snapshot_after, d.diff_text,
                    d.lines_added, d.lines_removed, d.change_type, d.risk_score, d.created_at,
                    s.system_id, s.name, s.system_type, s.backup_frequency_s, s.metadata, s.created_at
             FROM config_diffs d
             LEFT JOIN config_systems s ON s.system_id = d.system_id
             WHERE d.created_at >= ?1
               AND d.risk_score >= ?2
               AND (?3 IS NULL OR d.system_id = ?3)
             ORDER BY d.risk_score DESC, d.created_at DESC",
        )?;
        let rows = stmt.query_map(params![since_ms, min_risk, system_id], |row| {
            let diff = row_to_diff(row)?;
            let system = match row.get::<_, Option<String>>(10)? {
                Some(sid) => Some(ConfigSystem {
                    system_id: sid,
                    name: row.get(11)?,
                    system_type: row.get(12)?,
                    backup_frequency_s: row.get(13)?,
                    metadata: serde_json::from_str(&row.get::<_, String>(14)?)
                        .unwrap_or_default(),
                    created_at: row.get(15)?,
                }),
                None => None,
            };
            Ok((diff, system))
        })?;
        rows.collect()
    }

    // =========================================================================
    // Alerts
    // =========================================================================

    /// Insert an alert unless one already exists for `(system_id, diff_id)`.
    /// Returns the alert now present in the table.
    pub fn insert_alert(&self, alert: &ConfigAlert) -> SqliteResult<ConfigAlert> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO config_alerts
                 (id, system_id, diff_id, severity, drift_type, description, created_at, acknowledged_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                alert.id.to_hex(),
                alert.system_id,
                alert.diff_id.to_hex(),
                alert.severity.as_str(),
                alert.drift_type,
                alert.description,
                alert.created_at,
                alert.acknowledged_at,
            ],
        )?;
        conn.query_row(
            "SELECT id, system_id, diff_id, severity, drift_type, description, created_at, acknowledged_at
             FROM config_alerts WHERE system_id = ?1 AND diff_id = ?2",
            params![alert.system_id, alert.diff_id.to_hex()],
            row_to_alert,
        )
    }

    pub fn list_alerts(
        &self,
        system_id: Option<&str>,
        include_acknowledged: bool,
    ) -> SqliteResult<Vec<ConfigAlert>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, system_id, diff_id, severity, drift_type, description, created_at, acknowledged_at
             FROM config_alerts
             WHERE (?1 IS NULL OR system_id = ?1)
               AND (?2 OR acknowledged_at IS NULL)
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![system_id, include_acknowledged], row_to_alert)?;
        rows.collect()
    }

    /// Stamp an alert acknowledged. Returns false for unknown ids.
    pub fn acknowledge_alert(&self, id: AlertId) -> SqliteResult<bool> {
        let changed = self.conn.lock().execute(
            "UPDATE config_alerts SET acknowledged_at = ?1 WHERE id = ?2 AND acknowledged_at IS NULL",
            params![now_ms(), id.to_hex()],
        )?;
        Ok(changed > 0)
    }

    // =========================================================================
    // Coordination durability
    // =========================================================================

    /// Mirror an agent registration for restart recovery.
    pub fn record_agent(
        &self,
        agent_id: &str,
        machine_id: &str,
        role: &str,
        capabilities: &[String],
        registered_at: i64,
        last_seen: i64,
    ) -> SqliteResult<()> {
        let caps = serde_json::to_string(capabilities).unwrap_or_else(|_| "[]".into());
        self.conn.lock().execute(
            "INSERT INTO agent_registry (agent_id, machine_id, role, capabilities, registered_at, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(agent_id) DO UPDATE SET
                 machine_id = excluded.machine_id,
                 role = excluded.role,
                 capabilities = excluded.capabilities,
                 last_seen = excluded.last_seen",
            params![agent_id, machine_id, role, caps, registered_at, last_seen],
        )?;
        Ok(())
    }

    /// Mirror a delegation.
    pub fn record_task(&self, task: &AgentTaskRow) -> SqliteResult<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO agent_tasks
                 (task_id, task, assignee, priority, deadline, delegated_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                task.task_id.to_hex(),
                task.task,
                task.assignee,
                task.priority,
                task.deadline,
                task.delegated_at,
                task.status,
            ],
        )?;
        Ok(())
    }

    /// Record a dependency edge between two tasks.
    pub fn record_task_dependency(&self, task_id: TaskId, depends_on: TaskId) -> SqliteResult<()> {
        self.conn.lock().execute(
            "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on) VALUES (?1, ?2)",
            params![task_id.to_hex(), depends_on.to_hex()],
        )?;
        Ok(())
    }

    pub fn tasks_for_assignee(&self, assignee: &str) -> SqliteResult<Vec<AgentTaskRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT task_id, task, assignee, priority, deadline, delegated_at, status
             FROM agent_tasks WHERE assignee = ?1 ORDER BY delegated_at DESC",
        )?;
        let rows = stmt.query_map(params![assignee], |row| {
            Ok(AgentTaskRow {
                task_id: parse_id(row.get::<_, String>(0)?),
                task: row.get(1)?,
                assignee: row.get(2)?,
                priority: row.get(3)?,
                deadline: row.get(4)?,
                delegated_at: row.get(5)?,
                status: row.get(6)?,
            })
        })?;
        rows.collect()
    }
}

fn parse_id<T: From<uuid::Uuid>>(hex: String) -> T {
    uuid::Uuid::parse_str(&hex).unwrap_or(uuid::Uuid::nil()).into()
}

fn row_to_system(row: &rusqlite::Row<'_>) -> SqliteResult<ConfigSystem> {
    Ok(ConfigSystem {
        system_id: row.get(0)?,
        name: row.get(1)?,
        system_type: row.get(2)?,
        backup_frequency_s: row.get(3)?,
        metadata: serde_json::from_str(&row.get::<_, String>(4)?).unwrap_or_default(),
        created_at: row.get(5)?,
    })
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> SqliteResult<ConfigSnapshot> {
    Ok(ConfigSnapshot {
        id: parse_id(row.get::<_, String>(0)?),
        system_id: row.get(1)?,
        config_type: row.get(2)?,
        content: row.get(3)?,
        content_hash: row.get(4)?,
        file_path: row.get(5)?,
        agent_id: row.get(6)?,
        timestamp: row.get(7)?,
        size: row.get(8)?,
        tags: serde_json::from_str(&row.get::<_, String>(9)?).unwrap_or_default(),
    })
}

fn row_to_diff(row: &rusqlite::Row<'_>) -> SqliteResult<ConfigDiff> {
    Ok(ConfigDiff {
        id: parse_id(row.get::<_, String>(0)?),
        system_id: row.get(1)?,
        snapshot_before: parse_id(row.get::<_, String>(2)?),
        snapshot_after: parse_id(row.get::<_, String>(3)?),
        diff_text: row.get(4)?,
        lines_added: row.get(5)?,
        lines_removed: row.get(6)?,
        change_type: row.get(7)?,
        risk_score: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn row_to_alert(row: &rusqlite::Row<'_>) -> SqliteResult<ConfigAlert> {
    Ok(ConfigAlert {
        id: parse_id(row.get::<_, String>(0)?),
        system_id: row.get(1)?,
        diff_id: parse_id(row.get::<_, String>(2)?),
        severity: row
            .get::<_, String>(3)?
            .parse()
            .unwrap_or(DriftSeverity::Low),
        drift_type: row.get(4)?,
        description: row.get(5)?,
        created_at: row.get(6)?,
        acknowledged_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system(id: &str) -> ConfigSystem {
        ConfigSystem {
            system_id: id.into(),
            name: format!("System {id}"),
            system_type: "firewall".into(),
            backup_frequency_s: Some(3600),
            metadata: BTreeMap::new(),
            created_at: now_ms(),
        }
    }

    fn snapshot(system_id: &str, content: &str) -> ConfigSnapshot {
        ConfigSnapshot {
            id: SnapshotId::new(),
            system_id: system_id.into(),
            config_type: "rules".into(),
            content: content.into(),
            content_hash: format!("hash-{content}"),
            file_path: None,
            agent_id: "drone-1".into(),
            timestamp: now_ms(),
            size: content.len() as i64,
            tags: vec!["auto".into()],
        }
    }

    #[test]
    fn test_system_upsert() {
        let db = BackupDb::in_memory().unwrap();
        db.upsert_system(&system("s1")).unwrap();

        let mut updated = system("s1");
        updated.name = "Renamed".into();
        db.upsert_system(&updated).unwrap();

        let systems = db.list_systems().unwrap();
        assert_eq!(systems.len(), 1);
        assert_eq!(systems[0].name, "Renamed");
    }

    #[test]
    fn test_snapshot_roundtrip_and_latest() {
        let db = BackupDb::in_memory().unwrap();
        db.upsert_system(&system("s1")).unwrap();

        let mut first = snapshot("s1", "v1");
        first.timestamp = 100;
        let mut second = snapshot("s1", "v2");
        second.timestamp = 200;
        db.insert_snapshot(&first).unwrap();
        db.insert_snapshot(&second).unwrap();

        let loaded = db.get_snapshot(first.id).unwrap().unwrap();
        assert_eq!(loaded.content, "v1");
        assert_eq!(loaded.tags, vec!["auto"]);

        let latest = db.latest_snapshot("s1").unwrap().unwrap();
        assert_eq!(latest.id, second.id);

        let all = db.list_snapshots("s1", 10).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, second.id);
    }

    #[test]
    fn test_alert_idempotent_on_system_and_diff() {
        let db = BackupDb::in_memory().unwrap();
        let diff_id = DiffId::new();
        let alert = ConfigAlert {
            id: AlertId::new(),
            system_id: "s1".into(),
            diff_id,
            severity: DriftSeverity::High,
            drift_type: "security".into(),
            description: "allow-all rule added".into(),
            created_at: now_ms(),
            acknowledged_at: None,
        };

        let first = db.insert_alert(&alert).unwrap();
        let duplicate = ConfigAlert {
            id: AlertId::new(),
            ..alert.clone()
        };
        let second = db.insert_alert(&duplicate).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(db.list_alerts(Some("s1"), true).unwrap().len(), 1);
    }

    #[test]
    fn test_acknowledge_alert() {
        let db = BackupDb::in_memory().unwrap();
        let alert = ConfigAlert {
            id: AlertId::new(),
            system_id: "s1".into(),
            diff_id: DiffId::new(),
            severity: DriftSeverity::Critical,
            drift_type: "network".into(),
            description: "port change".into(),
            created_at: now_ms(),
            acknowledged_at: None,
        };
        let stored = db.insert_alert(&alert).unwrap();

        assert!(db.acknowledge_alert(stored.id).unwrap());
        assert!(!db.acknowledge_alert(stored.id).unwrap());
        assert!(db.list_alerts(Some("s1"), false).unwrap().is_empty());
        assert_eq!(db.list_alerts(Some("s1"), true).unwrap().len(), 1);
    }

    #[test]
    fn test_diff_window_query() {
        let db = BackupDb::in_memory().unwrap();
        db.upsert_system(&system("s1")).unwrap();
        let now = now_ms();

        for (risk, age_ms) in [(0.9, 0i64), (0.1, 0), (0.7, 10_000_000)] {
            let diff = ConfigDiff {
                id: DiffId::new(),
                system_id: "s1".into(),
                snapshot_before: SnapshotId::new(),
                snapshot_after: SnapshotId::new(),
                diff_text: "+x".into(),
                lines_added: 1,
                lines_removed: 0,
                change_type: "modified".into(),
                risk_score: risk,
                created_at: now - age_ms,
            };
            db.insert_diff(&diff).unwrap();
        }

        let hits = db.diffs_in_window(Some("s1"), now - 1_000_000, 0.2).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].0.risk_score > 0.8);
        assert_eq!(hits[0].1.as_ref().unwrap().system_id, "s1");
    }

    #[test]
    fn test_task_durability() {
        let db = BackupDb::in_memory().unwrap();
        let task = AgentTaskRow {
            task_id: TaskId::new(),
            task: "reindex".into(),
            assignee: "drone-2".into(),
            priority: Some("high".into()),
            deadline: None,
            delegated_at: now_ms(),
            status: "assigned".into(),
        };
        db.record_task(&task).unwrap();
        db.record_task_dependency(task.task_id, TaskId::new()).unwrap();

        let rows = db.tasks_for_assignee("drone-2").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].task, "reindex");
    }
}
