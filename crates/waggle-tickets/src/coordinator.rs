//! The coordinator: state machine enforcement, memory mirroring, metrics.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use waggle_memory::{SearchRequest, SharedMemoryStore, StoreRequest};
use waggle_types::{now_ms, MemoryCategory, MemoryId, MemoryScope, TicketId};

use crate::board::{
    AuditRecord, NewTicket, Ticket, TicketBoard, TicketError, TicketFilter, TicketMetrics,
    TicketPriority, TicketStatus, TicketUpdate,
};

/// A comment joined with its mirror memory id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketComment {
    pub comment_id: i64,
    pub ticket_id: TicketId,
    pub author: String,
    pub text: String,
    pub created_at: i64,
    /// Mirror memory for downstream correlation, when the store accepted it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_id: Option<MemoryId>,
}

/// The ticket coordinator.
///
/// Every create/update/comment also lands a mirror memory in the `tickets`
/// category with stable tags, so ticket search rides the semantic index.
pub struct TicketCoordinator {
    board: Arc<dyn TicketBoard>,
    memory: SharedMemoryStore,
    machine_id: String,
}

impl TicketCoordinator {
    pub fn new(board: Arc<dyn TicketBoard>, memory: SharedMemoryStore, machine_id: String) -> Self {
        Self {
            board,
            memory,
            machine_id,
        }
    }

    pub fn board(&self) -> &Arc<dyn TicketBoard> {
        &self.board
    }

    pub async fn create_ticket(&self, new: NewTicket) -> Result<Ticket, TicketError> {
        let reporter = new.reporter.clone();
        let ticket = self.board.create(new).await?;
        self.mirror_ticket(&ticket, &reporter, "created").await;
        Ok(ticket)
    }

    pub async fn get_ticket(&self, id: TicketId) -> Result<Option<Ticket>, TicketError> {
        self.board.get(id).await
    }

    pub async fn update_ticket(
        &self,
        id: TicketId,
        update: TicketUpdate,
        actor: &str,
    ) -> Result<Ticket, TicketError> {
        let ticket = self.board.update(id, update).await?;
        self.mirror_ticket(&ticket, actor, "updated").await;
        Ok(ticket)
    }

    /// Change a ticket's status.
    ///
    /// Transitions outside the state machine are rejected before the board
    /// sees them, so illegal calls never mutate state.
    pub async fn transition(
        &self,
        id: TicketId,
        to: TicketStatus,
        actor: &str,
    ) -> Result<Ticket, TicketError> {
        let current = self.board.get(id).await?.ok_or(TicketError::NotFound(id))?;
        if !current.status.can_transition_to(to) {
            return Err(TicketError::InvalidStateTransition {
                from: current.status,
                to,
            });
        }
        let ticket = self.board.set_status(id, to, actor).await?;
        self.mirror_ticket(&ticket, actor, "status-changed").await;
        Ok(ticket)
    }

    pub async fn assign(
        &self,
        id: TicketId,
        assignee: &str,
        actor: &str,
    ) -> Result<Ticket, TicketError> {
        self.update_ticket(
            id,
            TicketUpdate {
                assignee: Some(assignee.to_string()),
                ..Default::default()
            },
            actor,
        )
        .await
    }

    pub async fn list_tickets(&self, filter: TicketFilter) -> Result<Vec<Ticket>, TicketError> {
        self.board.list(filter).await
    }

    pub async fn audit(&self, id: TicketId) -> Result<Vec<AuditRecord>, TicketError> {
        self.board.audit(id).await
    }

    /// Add a comment: board first, then the mirror memory.
    pub async fn add_comment(
        &self,
        id: TicketId,
        text: &str,
        author: &str,
    ) -> Result<TicketComment, TicketError> {
        let comment = self.board.add_comment(id, author, text).await?;

        let memory_id = self
            .memory
            .store(StoreRequest {
                content: format!("Comment on ticket {}: {}", id.short(), text),
                category: MemoryCategory::Tickets,
                scope: MemoryScope::Project,
                tags: vec![
                    "ticket-comment".into(),
                    id.to_hex(),
                    comment_tag(comment.comment_id),
                ],
                metadata: Default::default(),
                context: None,
                machine_id: self.machine_id.clone(),
                agent_id: author.to_string(),
                project: None,
            })
            .await
            .map_err(|e| {
                warn!(ticket = %id, error = %e, "comment mirror memory failed");
                e
            })
            .ok();

        Ok(TicketComment {
            comment_id: comment.comment_id,
            ticket_id: comment.ticket_id,
            author: comment.author,
            text: comment.text,
            created_at: comment.created_at,
            memory_id,
        })
    }

    /// Comments in creation order, each carrying its mirror memory id.
    pub async fn get_comments(&self, id: TicketId) -> Result<Vec<TicketComment>, TicketError> {
        let comments = self.board.comments(id).await?;
        let mut out = Vec::with_capacity(comments.len());
        for comment in comments {
            let memory_id = self.find_comment_memory(comment.comment_id).await;
            out.push(TicketComment {
                comment_id: comment.comment_id,
                ticket_id: comment.ticket_id,
                author: comment.author,
                text: comment.text,
                created_at: comment.created_at,
                memory_id,
            });
        }
        Ok(out)
    }

    /// Aggregate metrics over a project's tickets created in the window.
    pub async fn get_metrics(
        &self,
        project_id: &str,
        days: i64,
    ) -> Result<TicketMetrics, TicketError> {
        let tickets = self
            .board
            .list(TicketFilter {
                project_id: Some(project_id.to_string()),
                status: None,
                assignee: None,
                limit: i64::MAX as usize,
                offset: 0,
            })
            .await?;

        let cutoff = now_ms() - days.max(0) * 24 * 3_600_000;
        let now = now_ms();
        let mut metrics = TicketMetrics::default();
        let mut resolution_total: i64 = 0;
        let mut resolution_count: i64 = 0;

        for ticket in tickets.iter().filter(|t| t.created_at >= cutoff) {
            metrics.total += 1;
            *metrics
                .by_status
                .entry(ticket.status.to_string())
                .or_default() += 1;
            *metrics
                .by_priority
                .entry(ticket.priority.to_string())
                .or_default() += 1;
            *metrics
                .by_type
                .entry(ticket.ticket_type.clone())
                .or_default() += 1;

            if ticket.status == TicketStatus::Done {
                resolution_total += ticket.updated_at - ticket.created_at;
                resolution_count += 1;
            }
            if !ticket.status.is_terminal() {
                if ticket.priority == TicketPriority::Critical {
                    metrics.critical_open += 1;
                }
                if ticket.due_date.map(|due| due < now).unwrap_or(false) {
                    metrics.overdue += 1;
                }
            }
        }

        if resolution_count > 0 {
            metrics.avg_resolution_ms = Some(resolution_total / resolution_count);
        }
        Ok(metrics)
    }

    /// Write the ticket's mirror memory. Mirrors are append-style: the most
    /// recent memory tagged with the ticket id reflects the current state.
    /// A failing memory store degrades search, not ticket correctness.
    async fn mirror_ticket(&self, ticket: &Ticket, actor: &str, event: &str) {
        let content = format!(
            "[{}#{}] {} ({}): {} | priority {} | status {}",
            ticket.project_id,
            ticket.ticket_number,
            ticket.title,
            ticket.ticket_type,
            ticket.description,
            ticket.priority,
            ticket.status,
        );
        let result = self
            .memory
            .store(StoreRequest {
                content,
                category: MemoryCategory::Tickets,
                scope: MemoryScope::Project,
                tags: vec![
                    "ticket".into(),
                    ticket.ticket_id.to_hex(),
                    ticket.ticket_type.clone(),
                    ticket.priority.to_string(),
                    ticket.status.to_string(),
                ],
                metadata: Default::default(),
                context: Some(format!("ticket {event}")),
                machine_id: self.machine_id.clone(),
                agent_id: actor.to_string(),
                project: Some(ticket.project_id.clone()),
            })
            .await;
        match result {
            Ok(memory_id) => {
                debug!(ticket = %ticket.ticket_id, memory = %memory_id, event, "ticket mirrored")
            }
            Err(e) => warn!(ticket = %ticket.ticket_id, error = %e, "ticket mirror failed"),
        }
    }

    async fn find_comment_memory(&self, comment_id: i64) -> Option<MemoryId> {
        let tag = comment_tag(comment_id);
        let mut search = SearchRequest::new(tag.clone());
        search.category = Some(MemoryCategory::Tickets);
        search.semantic = false;
        search.limit = 10;
        self.memory
            .search(search)
            .await
            .ok()
            .and_then(|page| {
                // Substring search oversamples; correlation needs the exact tag.
                page.items
                    .into_iter()
                    .find(|item| item.tags.iter().any(|t| *t == tag))
            })
            .map(|item| item.id)
    }
}

fn comment_tag(comment_id: i64) -> String {
    format!("comment:{comment_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalBoard;
    use std::sync::Arc;
    use waggle_memory::{MemoryStore, NgramEmbedder};

    fn coordinator() -> TicketCoordinator {
        let board = Arc::new(LocalBoard::in_memory().unwrap());
        let memory = Arc::new(MemoryStore::new(Arc::new(NgramEmbedder::default())));
        TicketCoordinator::new(board, memory, "m1".into())
    }

    fn new_ticket(title: &str) -> NewTicket {
        NewTicket {
            project_id: "alpha".into(),
            title: title.into(),
            description: "does a thing".into(),
            ticket_type: "task".into(),
            priority: TicketPriority::Medium,
            assignee: None,
            reporter: "drone-1".into(),
            labels: Vec::new(),
            due_date: None,
            time_estimate: None,
            parent_ticket: None,
        }
    }

    #[tokio::test]
    async fn test_create_writes_mirror_memory() {
        let coordinator = coordinator();
        let ticket = coordinator.create_ticket(new_ticket("fix ingress")).await.unwrap();

        let mut search = SearchRequest::new(ticket.ticket_id.to_hex());
        search.category = Some(MemoryCategory::Tickets);
        search.semantic = false;
        let page = coordinator.memory.search(search).await.unwrap();
        assert_eq!(page.total, 1);
        assert!(page.items[0].tags.contains(&"ticket".to_string()));
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected_without_mutation() {
        let coordinator = coordinator();
        let ticket = coordinator.create_ticket(new_ticket("t")).await.unwrap();

        let err = coordinator
            .transition(ticket.ticket_id, TicketStatus::Done, "drone-1")
            .await
            .unwrap_err();
        assert!(matches!(err, TicketError::InvalidStateTransition { .. }));

        let unchanged = coordinator.get_ticket(ticket.ticket_id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, TicketStatus::New);
        assert!(coordinator.audit(ticket.ticket_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let coordinator = coordinator();
        let ticket = coordinator.create_ticket(new_ticket("t")).await.unwrap();
        let id = ticket.ticket_id;

        for status in [TicketStatus::InProgress, TicketStatus::Review, TicketStatus::Done] {
            coordinator.transition(id, status, "drone-1").await.unwrap();
        }
        let done = coordinator.get_ticket(id).await.unwrap().unwrap();
        assert_eq!(done.status, TicketStatus::Done);
        assert_eq!(coordinator.audit(id).await.unwrap().len(), 3);

        // Terminal: nothing moves anymore.
        let err = coordinator
            .transition(id, TicketStatus::InProgress, "drone-1")
            .await
            .unwrap_err();
        assert!(matches!(err, TicketError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_comments_carry_memory_ids() {
        let coordinator = coordinator();
        let ticket = coordinator.create_ticket(new_ticket("t")).await.unwrap();

        let first = coordinator
            .add_comment(ticket.ticket_id, "looked into it", "drone-1")
            .await
            .unwrap();
        assert!(first.memory_id.is_some());

        coordinator
            .add_comment(ticket.ticket_id, "fixed upstream", "drone-2")
            .await
            .unwrap();

        let comments = coordinator.get_comments(ticket.ticket_id).await.unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].text, "looked into it");
        assert_eq!(comments[0].memory_id, first.memory_id);
        assert!(comments[1].memory_id.is_some());
    }

    #[tokio::test]
    async fn test_metrics() {
        let coordinator = coordinator();
        let t1 = coordinator.create_ticket(new_ticket("one")).await.unwrap();
        let mut critical = new_ticket("two");
        critical.priority = TicketPriority::Critical;
        critical.due_date = Some(now_ms() - 1000);
        coordinator.create_ticket(critical).await.unwrap();

        for status in [TicketStatus::InProgress, TicketStatus::Review, TicketStatus::Done] {
            coordinator.transition(t1.ticket_id, status, "x").await.unwrap();
        }

        let metrics = coordinator.get_metrics("alpha", 7).await.unwrap();
        assert_eq!(metrics.total, 2);
        assert_eq!(metrics.by_status.get("done"), Some(&1));
        assert_eq!(metrics.critical_open, 1);
        assert_eq!(metrics.overdue, 1);
        assert!(metrics.avg_resolution_ms.is_some());
    }
}
