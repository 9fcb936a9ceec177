//! Ticket types, the status state machine, and the board contract.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

use waggle_types::TicketId;

/// Errors raised by ticket operations.
#[derive(Debug, Clone, Error)]
pub enum TicketError {
    #[error("ticket not found: {0}")]
    NotFound(TicketId),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: TicketStatus,
        to: TicketStatus,
    },

    #[error("board error: {0}")]
    Board(String),
}

impl From<rusqlite::Error> for TicketError {
    fn from(e: rusqlite::Error) -> Self {
        TicketError::Board(e.to_string())
    }
}

/// Ticket lifecycle states.
///
/// The main chain is `new -> in_progress -> review -> done`. `blocked` and
/// `cancelled` branch off any non-terminal state; a blocked ticket resumes
/// into `in_progress`. `done` and `cancelled` are terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
    Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TicketStatus {
    #[default]
    New,
    InProgress,
    Review,
    Done,
    Blocked,
    Cancelled,
}

impl TicketStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TicketStatus::Done | TicketStatus::Cancelled)
    }

    /// Whether the state machine admits `self -> next`.
    pub fn can_transition_to(self, next: TicketStatus) -> bool {
        if self.is_terminal() || self == next {
            return false;
        }
        match next {
            TicketStatus::Blocked => self != TicketStatus::Blocked,
            TicketStatus::Cancelled => true,
            TicketStatus::InProgress => {
                matches!(self, TicketStatus::New | TicketStatus::Blocked)
            }
            TicketStatus::Review => self == TicketStatus::InProgress,
            TicketStatus::Done => self == TicketStatus::Review,
            TicketStatus::New => false,
        }
    }
}

/// Ticket priority.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
    Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TicketPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// One ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub ticket_id: TicketId,
    /// Monotonic per project, board-assigned.
    pub ticket_number: i64,
    pub project_id: String,
    pub title: String,
    pub description: String,
    pub ticket_type: String,
    pub priority: TicketPriority,
    pub status: TicketStatus,
    #[serde(default)]
    pub assignee: Option<String>,
    pub reporter: String,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Unix epoch milliseconds.
    #[serde(default)]
    pub due_date: Option<i64>,
    /// Estimated effort in minutes.
    #[serde(default)]
    pub time_estimate: Option<i64>,
    #[serde(default)]
    pub parent_ticket: Option<TicketId>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields for ticket creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTicket {
    pub project_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_ticket_type")]
    pub ticket_type: String,
    #[serde(default)]
    pub priority: TicketPriority,
    #[serde(default)]
    pub assignee: Option<String>,
    pub reporter: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub due_date: Option<i64>,
    #[serde(default)]
    pub time_estimate: Option<i64>,
    #[serde(default)]
    pub parent_ticket: Option<TicketId>,
}

fn default_ticket_type() -> String {
    "task".into()
}

/// Mutable fields for ticket updates. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TicketUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<TicketPriority>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub labels: Option<Vec<String>>,
    #[serde(default)]
    pub due_date: Option<i64>,
    #[serde(default)]
    pub time_estimate: Option<i64>,
}

/// Listing filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TicketFilter {
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub status: Option<TicketStatus>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default = "default_list_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_list_limit() -> usize {
    50
}

/// One comment as the board stores it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardComment {
    pub comment_id: i64,
    pub ticket_id: TicketId,
    pub author: String,
    pub text: String,
    pub created_at: i64,
}

/// One status-change audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub ticket_id: TicketId,
    pub from_status: TicketStatus,
    pub to_status: TicketStatus,
    pub actor: String,
    pub changed_at: i64,
}

/// Aggregated project metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TicketMetrics {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
    pub by_type: BTreeMap<String, usize>,
    /// Mean `updated_at - created_at` across done tickets, milliseconds.
    pub avg_resolution_ms: Option<i64>,
    /// Open tickets at critical priority.
    pub critical_open: usize,
    /// Open tickets past their due date.
    pub overdue: usize,
}

/// The board contract. The shipped implementation is [`crate::LocalBoard`];
/// a remote tracker adapter implements the same trait.
///
/// The board is deliberately dumb: the state machine and memory mirroring
/// live in the coordinator so every board behaves identically.
#[async_trait]
pub trait TicketBoard: Send + Sync {
    async fn create(&self, new: NewTicket) -> Result<Ticket, TicketError>;

    async fn get(&self, id: TicketId) -> Result<Option<Ticket>, TicketError>;

    async fn update(&self, id: TicketId, update: TicketUpdate) -> Result<Ticket, TicketError>;

    /// Write the new status and append an audit record. Legality was
    /// already checked by the coordinator.
    async fn set_status(
        &self,
        id: TicketId,
        status: TicketStatus,
        actor: &str,
    ) -> Result<Ticket, TicketError>;

    async fn list(&self, filter: TicketFilter) -> Result<Vec<Ticket>, TicketError>;

    async fn add_comment(
        &self,
        id: TicketId,
        author: &str,
        text: &str,
    ) -> Result<BoardComment, TicketError>;

    async fn comments(&self, id: TicketId) -> Result<Vec<BoardComment>, TicketError>;

    async fn audit(&self, id: TicketId) -> Result<Vec<AuditRecord>, TicketError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_main_chain() {
        assert!(TicketStatus::New.can_transition_to(TicketStatus::InProgress));
        assert!(TicketStatus::InProgress.can_transition_to(TicketStatus::Review));
        assert!(TicketStatus::Review.can_transition_to(TicketStatus::Done));
    }

    #[test]
    fn test_chain_cannot_skip() {
        assert!(!TicketStatus::New.can_transition_to(TicketStatus::Review));
        assert!(!TicketStatus::New.can_transition_to(TicketStatus::Done));
        assert!(!TicketStatus::InProgress.can_transition_to(TicketStatus::Done));
    }

    #[test]
    fn test_side_branches() {
        for from in [TicketStatus::New, TicketStatus::InProgress, TicketStatus::Review] {
            assert!(from.can_transition_to(TicketStatus::Blocked), "{from} -> blocked");
            assert!(from.can_transition_to(TicketStatus::Cancelled), "{from} -> cancelled");
        }
        assert!(TicketStatus::Blocked.can_transition_to(TicketStatus::InProgress));
        assert!(TicketStatus::Blocked.can_transition_to(TicketStatus::Cancelled));
    }

    #[test]
    fn test_terminal_states_frozen() {
        for terminal in [TicketStatus::Done, TicketStatus::Cancelled] {
            for target in [
                TicketStatus::New,
                TicketStatus::InProgress,
                TicketStatus::Review,
                TicketStatus::Done,
                TicketStatus::Blocked,
                TicketStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(target), "{terminal} -> {target}");
            }
        }
    }

    #[test]
    fn test_no_self_transition() {
        assert!(!TicketStatus::InProgress.can_transition_to(TicketStatus::InProgress));
    }
}
