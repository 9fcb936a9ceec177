//! # waggle-tickets
//!
//! The ticket coordinator: a facade over a board service (local SQLite by
//! default, any [`TicketBoard`] implementation otherwise) that enforces the
//! status state machine, writes a searchable mirror of every ticket and
//! comment into the collective memory, and aggregates project metrics.

pub mod board;
pub mod coordinator;
pub mod local;

pub use board::{
    AuditRecord, BoardComment, NewTicket, Ticket, TicketBoard, TicketError, TicketFilter,
    TicketMetrics, TicketPriority, TicketStatus, TicketUpdate,
};
pub use coordinator::{TicketComment, TicketCoordinator};
pub use local::LocalBoard;
