//! The local SQLite board. Keeps the hub useful with no external tracker.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use waggle_types::{now_ms, TicketId};

use crate::board::{
    AuditRecord, BoardComment, NewTicket, Ticket, TicketBoard, TicketError, TicketFilter,
    TicketPriority, TicketStatus, TicketUpdate,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tickets (
    ticket_id TEXT PRIMARY KEY,
    ticket_number INTEGER NOT NULL,
    project_id TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    ticket_type TEXT NOT NULL,
    priority TEXT NOT NULL,
    status TEXT NOT NULL,
    assignee TEXT,
    reporter TEXT NOT NULL,
    labels TEXT NOT NULL DEFAULT '[]',
    due_date INTEGER,
    time_estimate INTEGER,
    parent_ticket TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(project_id, ticket_number)
);
CREATE INDEX IF NOT EXISTS idx_tickets_project ON tickets(project_id, status);
CREATE INDEX IF NOT EXISTS idx_tickets_assignee ON tickets(assignee);

CREATE TABLE IF NOT EXISTS ticket_comments (
    comment_id INTEGER PRIMARY KEY,
    ticket_id TEXT NOT NULL REFERENCES tickets(ticket_id),
    author TEXT NOT NULL,
    text TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_comments_ticket ON ticket_comments(ticket_id, comment_id);

CREATE TABLE IF NOT EXISTS ticket_audit (
    id INTEGER PRIMARY KEY,
    ticket_id TEXT NOT NULL,
    from_status TEXT NOT NULL,
    to_status TEXT NOT NULL,
    actor TEXT NOT NULL,
    changed_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_ticket ON ticket_audit(ticket_id, id);
"#;

/// SQLite-backed board.
pub struct LocalBoard {
    conn: Mutex<Connection>,
}

impl LocalBoard {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TicketError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, TicketError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn load(&self, id: TicketId) -> Result<Option<Ticket>, TicketError> {
        Ok(self
            .conn
            .lock()
            .query_row(
                "SELECT ticket_id, ticket_number, project_id, title, description, ticket_type,
                        priority, status, assignee, reporter, labels, due_date, time_estimate,
                        parent_ticket, created_at, updated_at
                 FROM tickets WHERE ticket_id = ?1",
                params![id.to_hex()],
                row_to_ticket,
            )
            .optional()?)
    }
}

#[async_trait]
impl TicketBoard for LocalBoard {
    async fn create(&self, new: NewTicket) -> Result<Ticket, TicketError> {
        let now = now_ms();
        let ticket_id = TicketId::new();
        let labels = serde_json::to_string(&new.labels).unwrap_or_else(|_| "[]".into());

        let conn = self.conn.lock();
        // Per-project monotonic numbering.
        let ticket_number: i64 = conn.query_row(
            "SELECT COALESCE(MAX(ticket_number), 0) + 1 FROM tickets WHERE project_id = ?1",
            params![new.project_id],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO tickets
                 (ticket_id, ticket_number, project_id, title, description, ticket_type, priority,
                  status, assignee, reporter, labels, due_date, time_estimate, parent_ticket,
                  created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                ticket_id.to_hex(),
                ticket_number,
                new.project_id,
                new.title,
                new.description,
                new.ticket_type,
                new.priority.as_ref(),
                TicketStatus::New.as_ref(),
                new.assignee,
                new.reporter,
                labels,
                new.due_date,
                new.time_estimate,
                new.parent_ticket.map(|p| p.to_hex()),
                now,
                now,
            ],
        )?;
        drop(conn);

        self.load(ticket_id)?
            .ok_or(TicketError::NotFound(ticket_id))
    }

    async fn get(&self, id: TicketId) -> Result<Option<Ticket>, TicketError> {
        self.load(id)
    }

    async fn update(&self, id: TicketId, update: TicketUpdate) -> Result<Ticket, TicketError> {
        let mut ticket = self.load(id)?.ok_or(TicketError::NotFound(id))?;

        if let Some(title) = update.title {
            ticket.title = title;
        }
        if let Some(description) = update.description {
            ticket.description = description;
        }
        if let Some(priority) = update.priority {
            ticket.priority = priority;
        }
        if let Some(assignee) = update.assignee {
            ticket.assignee = Some(assignee);
        }
        if let Some(labels) = update.labels {
            ticket.labels = labels;
        }
        if let Some(due) = update.due_date {
            ticket.due_date = Some(due);
        }
        if let Some(estimate) = update.time_estimate {
            ticket.time_estimate = Some(estimate);
        }
        ticket.updated_at = now_ms();

        let labels = serde_json::to_string(&ticket.labels).unwrap_or_else(|_| "[]".into());
        self.conn.lock().execute(
            "UPDATE tickets SET title = ?2, description = ?3, priority = ?4, assignee = ?5,
                    labels = ?6, due_date = ?7, time_estimate = ?8, updated_at = ?9
             WHERE ticket_id = ?1",
            params![
                id.to_hex(),
                ticket.title,
                ticket.description,
                ticket.priority.as_ref(),
                ticket.assignee,
                labels,
                ticket.due_date,
                ticket.time_estimate,
                ticket.updated_at,
            ],
        )?;
        Ok(ticket)
    }

    async fn set_status(
        &self,
        id: TicketId,
        status: TicketStatus,
        actor: &str,
    ) -> Result<Ticket, TicketError> {
        let ticket = self.load(id)?.ok_or(TicketError::NotFound(id))?;
        let now = now_ms();

        let conn = self.conn.lock();
        conn.execute(
            "UPDATE tickets SET status = ?2, updated_at = ?3 WHERE ticket_id = ?1",
            params![id.to_hex(), status.as_ref(), now],
        )?;
        conn.execute(
            "INSERT INTO ticket_audit (ticket_id, from_status, to_status, actor, changed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.to_hex(),
                ticket.status.as_ref(),
                status.as_ref(),
                actor,
                now
            ],
        )?;
        drop(conn);

        self.load(id)?.ok_or(TicketError::NotFound(id))
    }

    async fn list(&self, filter: TicketFilter) -> Result<Vec<Ticket>, TicketError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT ticket_id, ticket_number, project_id, title, description, ticket_type,
                    priority, status, assignee, reporter, labels, due_date, time_estimate,
                    parent_ticket, created_at, updated_at
             FROM tickets
             WHERE (?1 IS NULL OR project_id = ?1)
               AND (?2 IS NULL OR status = ?2)
               AND (?3 IS NULL OR assignee = ?3)
             ORDER BY project_id, ticket_number
             LIMIT ?4 OFFSET ?5",
        )?;
        let rows = stmt.query_map(
            params![
                filter.project_id,
                filter.status.map(|s| s.as_ref().to_string()),
                filter.assignee,
                filter.limit as i64,
                filter.offset as i64,
            ],
            row_to_ticket,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn add_comment(
        &self,
        id: TicketId,
        author: &str,
        text: &str,
    ) -> Result<BoardComment, TicketError> {
        if self.load(id)?.is_none() {
            return Err(TicketError::NotFound(id));
        }
        let now = now_ms();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO ticket_comments (ticket_id, author, text, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![id.to_hex(), author, text, now],
        )?;
        let comment_id = conn.last_insert_rowid();
        Ok(BoardComment {
            comment_id,
            ticket_id: id,
            author: author.to_string(),
            text: text.to_string(),
            created_at: now,
        })
    }

    async fn comments(&self, id: TicketId) -> Result<Vec<BoardComment>, TicketError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT comment_id, ticket_id, author, text, created_at
             FROM ticket_comments WHERE ticket_id = ?1 ORDER BY comment_id",
        )?;
        let rows = stmt.query_map(params![id.to_hex()], |row| {
            Ok(BoardComment {
                comment_id: row.get(0)?,
                ticket_id: parse_ticket_id(row.get::<_, String>(1)?),
                author: row.get(2)?,
                text: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn audit(&self, id: TicketId) -> Result<Vec<AuditRecord>, TicketError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT ticket_id, from_status, to_status, actor, changed_at
             FROM ticket_audit WHERE ticket_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![id.to_hex()], |row| {
            Ok(AuditRecord {
                ticket_id: parse_ticket_id(row.get::<_, String>(0)?),
                from_status: parse_status(row.get::<_, String>(1)?),
                to_status: parse_status(row.get::<_, String>(2)?),
                actor: row.get(3)?,
                changed_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn parse_ticket_id(hex: String) -> TicketId {
    uuid::Uuid::parse_str(&hex).unwrap_or(uuid::Uuid::nil()).into()
}

fn parse_status(s: String) -> TicketStatus {
    s.parse().unwrap_or_default()
}

fn row_to_ticket(row: &rusqlite::Row<'_>) -> rusqlite::Result<Ticket> {
    Ok(Ticket {
        ticket_id: parse_ticket_id(row.get::<_, String>(0)?),
        ticket_number: row.get(1)?,
        project_id: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        ticket_type: row.get(5)?,
        priority: row
            .get::<_, String>(6)?
            .parse()
            .unwrap_or(TicketPriority::Medium),
        status: parse_status(row.get::<_, String>(7)?),
        assignee: row.get(8)?,
        reporter: row.get(9)?,
        labels: serde_json::from_str(&row.get::<_, String>(10)?).unwrap_or_default(),
        due_date: row.get(11)?,
        time_estimate: row.get(12)?,
        parent_ticket: row
            .get::<_, Option<String>>(13)?
            .map(parse_ticket_id),
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_ticket(project: &str, title: &str) -> NewTicket {
        NewTicket {
            project_id: project.into(),
            title: title.into(),
            description: "desc".into(),
            ticket_type: "task".into(),
            priority: TicketPriority::Medium,
            assignee: None,
            reporter: "drone-1".into(),
            labels: vec!["infra".into()],
            due_date: None,
            time_estimate: None,
            parent_ticket: None,
        }
    }

    #[tokio::test]
    async fn test_numbers_are_monotonic_per_project() {
        let board = LocalBoard::in_memory().unwrap();
        let a1 = board.create(new_ticket("alpha", "first")).await.unwrap();
        let a2 = board.create(new_ticket("alpha", "second")).await.unwrap();
        let b1 = board.create(new_ticket("beta", "other project")).await.unwrap();

        assert_eq!(a1.ticket_number, 1);
        assert_eq!(a2.ticket_number, 2);
        assert_eq!(b1.ticket_number, 1);
    }

    #[tokio::test]
    async fn test_update_preserves_untouched_fields() {
        let board = LocalBoard::in_memory().unwrap();
        let ticket = board.create(new_ticket("alpha", "original")).await.unwrap();

        let updated = board
            .update(
                ticket.ticket_id,
                TicketUpdate {
                    priority: Some(TicketPriority::High),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.title, "original");
        assert_eq!(updated.priority, TicketPriority::High);
        assert_eq!(updated.labels, vec!["infra"]);
    }

    #[tokio::test]
    async fn test_status_change_writes_audit() {
        let board = LocalBoard::in_memory().unwrap();
        let ticket = board.create(new_ticket("alpha", "t")).await.unwrap();

        board
            .set_status(ticket.ticket_id, TicketStatus::InProgress, "drone-1")
            .await
            .unwrap();
        let audit = board.audit(ticket.ticket_id).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].from_status, TicketStatus::New);
        assert_eq!(audit[0].to_status, TicketStatus::InProgress);
    }

    #[tokio::test]
    async fn test_comments_in_creation_order() {
        let board = LocalBoard::in_memory().unwrap();
        let ticket = board.create(new_ticket("alpha", "t")).await.unwrap();

        board.add_comment(ticket.ticket_id, "a", "first").await.unwrap();
        board.add_comment(ticket.ticket_id, "b", "second").await.unwrap();

        let comments = board.comments(ticket.ticket_id).await.unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].text, "first");
        assert_eq!(comments[1].text, "second");
    }

    #[tokio::test]
    async fn test_list_filters() {
        let board = LocalBoard::in_memory().unwrap();
        let t1 = board.create(new_ticket("alpha", "one")).await.unwrap();
        board.create(new_ticket("alpha", "two")).await.unwrap();
        board.create(new_ticket("beta", "three")).await.unwrap();
        board
            .set_status(t1.ticket_id, TicketStatus::InProgress, "x")
            .await
            .unwrap();

        let alpha = board
            .list(TicketFilter {
                project_id: Some("alpha".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(alpha.len(), 2);

        let in_progress = board
            .list(TicketFilter {
                status: Some(TicketStatus::InProgress),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(in_progress.len(), 1);
        assert_eq!(in_progress[0].title, "one");
    }
}
