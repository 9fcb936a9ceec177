//! Service-error to wire-error mapping.
//!
//! Domain failures surface with their own kinds; infrastructure failures
//! collapse into the backend/unavailable kinds so nothing internal leaks.

use waggle_backup::BackupError;
use waggle_bridge::BridgeError;
use waggle_memory::MemoryError;
use waggle_swarm::SwarmError;
use waggle_tickets::TicketError;
use waggle_types::HubError;

pub(crate) fn memory_err(e: MemoryError) -> HubError {
    match e {
        MemoryError::EmptyContent => HubError::BadArgument("content must not be empty".into()),
        MemoryError::Unavailable(msg) => HubError::MemoryStoreUnavailable(msg),
    }
}

pub(crate) fn swarm_err(e: SwarmError) -> HubError {
    HubError::Tool(e.to_string())
}

pub(crate) fn bridge_err(e: BridgeError) -> HubError {
    match e {
        BridgeError::Timeout { .. } => HubError::BridgeTimeout(e.to_string()),
        BridgeError::Exhausted(_) => HubError::ResourceExhausted(e.to_string()),
        BridgeError::NotFound(_)
        | BridgeError::NotUp { .. }
        | BridgeError::ConnectionLost => HubError::BridgeDown(e.to_string()),
        BridgeError::AlreadyExists(_) | BridgeError::Config(_) => {
            HubError::BadArgument(e.to_string())
        }
        BridgeError::Spawn(_) | BridgeError::Init(_) | BridgeError::Service(_) => {
            HubError::Tool(e.to_string())
        }
    }
}

pub(crate) fn backup_err(e: BackupError) -> HubError {
    match e {
        BackupError::Store(inner) => HubError::BackendUnavailable(inner.to_string()),
        BackupError::UnknownSnapshot(_) | BackupError::UnknownSystem(_) => {
            HubError::Tool(e.to_string())
        }
        BackupError::RestoreIo(inner) => HubError::Tool(format!("restore failed: {inner}")),
    }
}

pub(crate) fn ticket_err(e: TicketError) -> HubError {
    match e {
        TicketError::Board(msg) => HubError::BackendUnavailable(msg),
        domain => HubError::Tool(domain.to_string()),
    }
}
