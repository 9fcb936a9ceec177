//! The session arena.
//!
//! Sessions are indexed by id; handlers carry the id, never a pointer. Each
//! live session owns a bounded outbound channel whose single consumer is the
//! SSE response stream. Producers (result delivery, broadcast fan-out) block
//! up to a send timeout on a full buffer; on timeout the session transitions
//! to closing and the frame is dropped with a log entry.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use waggle_swarm::Broadcast;
use waggle_types::{now_ms, HubError, HubResult, ResultFrame, SessionId};

use crate::config::SessionSection;

/// One outbound frame on a session's stream.
#[derive(Debug, Clone)]
pub enum Frame {
    /// First frame on every stream: the session id.
    Session(SessionId),
    Result(ResultFrame),
    Broadcast(Broadcast),
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Minted but no stream attached yet (recovery pre-creation).
    New,
    Live,
    Closing,
    Terminated,
}

struct Session {
    tx: Option<mpsc::Sender<Frame>>,
    state: SessionState,
    created_at: i64,
    last_activity: i64,
    /// Highest broadcast id delivered on this session.
    last_broadcast: u64,
    /// Role reported by the agent bound to this session, for targeted
    /// broadcasts.
    agent_role: Option<String>,
    cancel: CancellationToken,
}

impl Session {
    fn new(now: i64) -> Self {
        Self {
            tx: None,
            state: SessionState::New,
            created_at: now,
            last_activity: now,
            last_broadcast: 0,
            agent_role: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Outcome of attaching a stream.
#[derive(Debug)]
pub struct StreamAttach {
    pub session_id: SessionId,
    pub rx: mpsc::Receiver<Frame>,
    /// Broadcast high-water mark at the time the previous stream dropped;
    /// used to replay missed broadcasts before any new one.
    pub replay_after: u64,
    /// True when an existing session was resumed rather than minted.
    pub resumed: bool,
}

/// The session arena.
pub struct SessionTable {
    sessions: DashMap<SessionId, Session>,
    max_sessions: usize,
    idle_ttl: Duration,
    send_timeout: Duration,
    grace: Duration,
    buffer_frames: usize,
}

impl SessionTable {
    pub fn new(section: &SessionSection) -> Self {
        Self {
            sessions: DashMap::new(),
            max_sessions: section.max_sessions,
            idle_ttl: Duration::from_secs(section.idle_ttl_s),
            send_timeout: Duration::from_secs(section.send_timeout_s),
            grace: Duration::from_secs(section.grace_s),
            buffer_frames: section.buffer_frames.max(16),
        }
    }

    /// Attach an SSE stream.
    ///
    /// A missing or unknown id mints a fresh session. A known, non-terminated
    /// id is resumed: it gets a new channel and its broadcast high-water mark
    /// is reported so the caller can replay. The session frame is already
    /// queued on the returned receiver.
    pub fn attach_stream(&self, requested: Option<SessionId>) -> HubResult<StreamAttach> {
        let now = now_ms();

        let (session_id, resumed) = match requested {
            Some(id) => {
                let known_alive = self
                    .sessions
                    .get(&id)
                    .map(|s| s.state != SessionState::Terminated)
                    .unwrap_or(false);
                if known_alive {
                    (id, true)
                } else {
                    (self.mint(now)?, false)
                }
            }
            None => (self.mint(now)?, false),
        };

        let (tx, rx) = mpsc::channel(self.buffer_frames);
        let replay_after = {
            let mut entry = self
                .sessions
                .get_mut(&session_id)
                .ok_or_else(|| HubError::SessionExpired(session_id.to_hex()))?;
            // A fresh stream replaces any previous one.
            entry.tx = Some(tx.clone());
            entry.state = SessionState::Live;
            entry.last_activity = now;
            entry.last_broadcast
        };

        // First frame, per the wire contract.
        tx.try_send(Frame::Session(session_id))
            .map_err(|_| HubError::Internal("session-frame-enqueue".into()))?;

        debug!(session = %session_id.short(), resumed, "stream attached");
        Ok(StreamAttach {
            session_id,
            rx,
            replay_after,
            resumed,
        })
    }

    /// Pre-create a session in `new` state (stale-session recovery mints the
    /// suggested id before the drone reconnects).
    pub fn precreate(&self) -> HubResult<SessionId> {
        self.mint(now_ms())
    }

    fn mint(&self, now: i64) -> HubResult<SessionId> {
        if self.sessions.len() >= self.max_sessions {
            return Err(HubError::ResourceExhausted(format!(
                "open session cap ({}) reached",
                self.max_sessions
            )));
        }
        let id = SessionId::new();
        self.sessions.insert(id, Session::new(now));
        Ok(id)
    }

    /// Whether a session accepts ingress messages.
    pub fn is_live(&self, id: SessionId) -> bool {
        self.sessions
            .get(&id)
            .map(|s| s.state == SessionState::Live)
            .unwrap_or(false)
    }

    /// Refresh activity (message ingress).
    pub fn touch(&self, id: SessionId) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.last_activity = now_ms();
        }
    }

    /// The cancellation token handed to `requires_session` handlers.
    pub fn cancel_token(&self, id: SessionId) -> Option<CancellationToken> {
        self.sessions.get(&id).map(|s| s.cancel.clone())
    }

    /// Bind the registering agent's role to its session.
    pub fn set_agent_role(&self, id: SessionId, role: &str) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.agent_role = Some(role.to_string());
        }
    }

    /// Deliver a result frame in completion order. Blocks up to the send
    /// timeout on a congested stream; a timeout closes the session and the
    /// frame is dropped.
    pub async fn deliver_result(&self, id: SessionId, frame: ResultFrame) {
        self.deliver(id, Frame::Result(frame), "result").await;
    }

    /// Fan one broadcast out to every live session whose role matches.
    pub async fn fan_out(&self, broadcast: &Broadcast) {
        let targets: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry.state == SessionState::Live
                    && entry
                        .agent_role
                        .as_deref()
                        .map(|role| broadcast.targets_role(role))
                        .unwrap_or(broadcast.target_roles.is_none())
            })
            .map(|entry| *entry.key())
            .collect();

        for session_id in targets {
            self.deliver(session_id, Frame::Broadcast(broadcast.clone()), "broadcast")
                .await;
            if let Some(mut session) = self.sessions.get_mut(&session_id) {
                if session.last_broadcast < broadcast.broadcast_id {
                    session.last_broadcast = broadcast.broadcast_id;
                }
            }
        }
    }

    /// Replay broadcasts onto a just-attached stream, in order.
    pub async fn replay(&self, id: SessionId, missed: Vec<Broadcast>) {
        for broadcast in missed {
            let highest = broadcast.broadcast_id;
            self.deliver(id, Frame::Broadcast(broadcast), "replay").await;
            if let Some(mut session) = self.sessions.get_mut(&id) {
                if session.last_broadcast < highest {
                    session.last_broadcast = highest;
                }
            }
        }
    }

    async fn deliver(&self, id: SessionId, frame: Frame, kind: &str) {
        let tx = match self.sessions.get(&id) {
            Some(session) if session.state == SessionState::Live => session.tx.clone(),
            _ => None,
        };
        let Some(tx) = tx else {
            debug!(session = %id.short(), kind, "dropping frame for non-live session");
            return;
        };

        match tokio::time::timeout(self.send_timeout, tx.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(_receiver_gone)) => {
                debug!(session = %id.short(), kind, "stream consumer gone");
                self.close(id);
            }
            Err(_elapsed) => {
                warn!(session = %id.short(), kind, "session buffer full past deadline, closing");
                self.close(id);
            }
        }
    }

    /// Transition a session to closing: cancel in-flight handlers bound to
    /// it and drop the outbound channel.
    pub fn close(&self, id: SessionId) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            if session.state == SessionState::Terminated {
                return;
            }
            session.state = SessionState::Closing;
            session.cancel.cancel();
            session.tx = None;
            session.state = SessionState::Terminated;
            session.last_activity = now_ms();
            info!(session = %id.short(), "session terminated");
        }
    }

    /// Called by the stream when the client disconnects. The session lingers
    /// in the table so a reconnect inside the grace window can resume it and
    /// replay missed broadcasts.
    pub fn stream_dropped(&self, id: SessionId) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            if session.state == SessionState::Live {
                session.state = SessionState::Closing;
                session.tx = None;
                session.last_activity = now_ms();
                debug!(session = %id.short(), "stream dropped, session closing");
            }
        }
    }

    /// One sweep: close idle sessions, drop terminated ones past the grace
    /// period. Returns the ids removed so callers can release per-session
    /// resources (dispatch locks).
    pub fn sweep(&self) -> Vec<SessionId> {
        let now = now_ms();
        let idle_cutoff = now - self.idle_ttl.as_millis() as i64;
        let grace_cutoff = now - self.grace.as_millis() as i64;

        let mut to_close = Vec::new();
        let mut to_remove = Vec::new();
        for entry in self.sessions.iter() {
            match entry.state {
                SessionState::Live | SessionState::New if entry.last_activity < idle_cutoff => {
                    to_close.push(*entry.key());
                }
                SessionState::Closing | SessionState::Terminated
                    if entry.last_activity < grace_cutoff =>
                {
                    to_remove.push(*entry.key());
                }
                _ => {}
            }
        }

        for id in to_close {
            debug!(session = %id.short(), "closing idle session");
            self.close(id);
        }
        for id in &to_remove {
            self.sessions.remove(id);
        }
        to_remove
    }

    /// Live session count.
    pub fn live_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.state == SessionState::Live)
            .count()
    }

    /// Total table size, any state.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Shared handle used across the hub.
pub type SharedSessionTable = Arc<SessionTable>;

#[cfg(test)]
mod tests {
    use super::*;
    use waggle_swarm::{BroadcastBus, Severity};

    fn table() -> SessionTable {
        SessionTable::new(&SessionSection::default())
    }

    fn tiny_table(idle_ttl_s: u64, grace_s: u64) -> SessionTable {
        SessionTable::new(&SessionSection {
            max_sessions: 4,
            idle_ttl_s,
            buffer_frames: 16,
            send_timeout_s: 1,
            grace_s,
        })
    }

    #[tokio::test]
    async fn test_first_frame_is_session() {
        let table = table();
        let mut attach = table.attach_stream(None).unwrap();
        match attach.rx.recv().await.unwrap() {
            Frame::Session(id) => assert_eq!(id, attach.session_id),
            other => panic!("expected session frame, got {other:?}"),
        }
        assert!(table.is_live(attach.session_id));
    }

    #[tokio::test]
    async fn test_unknown_id_mints_fresh() {
        let table = table();
        let ghost = SessionId::new();
        let attach = table.attach_stream(Some(ghost)).unwrap();
        assert_ne!(attach.session_id, ghost);
        assert!(!attach.resumed);
    }

    #[tokio::test]
    async fn test_result_delivery() {
        let table = table();
        let mut attach = table.attach_stream(None).unwrap();
        let _session_frame = attach.rx.recv().await.unwrap();

        table
            .deliver_result(
                attach.session_id,
                ResultFrame::ok("a1", serde_json::json!("done")),
            )
            .await;
        match attach.rx.recv().await.unwrap() {
            Frame::Result(frame) => {
                assert_eq!(frame.id, "a1");
                assert!(frame.ok);
            }
            other => panic!("expected result frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_session_cap() {
        let table = tiny_table(300, 60);
        for _ in 0..4 {
            table.attach_stream(None).unwrap();
        }
        let err = table.attach_stream(None).unwrap_err();
        assert!(matches!(err, HubError::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn test_reconnect_replays_after_high_water() {
        let bus = BroadcastBus::default();
        let table = table();

        // Connect and observe two broadcasts.
        let mut attach = table.attach_stream(None).unwrap();
        let session_id = attach.session_id;
        let _ = attach.rx.recv().await.unwrap();
        for text in ["seven", "eight"] {
            let b = bus.publish("a1", "m1", "ops", Severity::Info, text, None);
            table.fan_out(&b).await;
        }
        let mut seen = Vec::new();
        for _ in 0..2 {
            if let Frame::Broadcast(b) = attach.rx.recv().await.unwrap() {
                seen.push(b.broadcast_id);
            }
        }
        assert_eq!(seen, vec![1, 2]);

        // Stream drops; two more broadcasts fire while disconnected.
        drop(attach.rx);
        table.stream_dropped(session_id);
        bus.publish("a1", "m1", "ops", Severity::Info, "nine", None);
        bus.publish("a1", "m1", "ops", Severity::Info, "ten", None);

        // Reconnect with the known id: session frame, then replayed 3 and 4.
        let mut resumed = table.attach_stream(Some(session_id)).unwrap();
        assert!(resumed.resumed);
        assert_eq!(resumed.session_id, session_id);
        assert_eq!(resumed.replay_after, 2);

        table
            .replay(session_id, bus.replay_after(resumed.replay_after))
            .await;

        match resumed.rx.recv().await.unwrap() {
            Frame::Session(id) => assert_eq!(id, session_id),
            other => panic!("expected session frame, got {other:?}"),
        }
        let mut replayed = Vec::new();
        for _ in 0..2 {
            if let Frame::Broadcast(b) = resumed.rx.recv().await.unwrap() {
                replayed.push(b.broadcast_id);
            }
        }
        assert_eq!(replayed, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_role_targeted_fan_out() {
        let bus = BroadcastBus::default();
        let table = table();

        let mut dba = table.attach_stream(None).unwrap();
        let _ = dba.rx.recv().await.unwrap();
        table.set_agent_role(dba.session_id, "dba");

        let mut web = table.attach_stream(None).unwrap();
        let _ = web.rx.recv().await.unwrap();
        table.set_agent_role(web.session_id, "web");

        let targeted = bus.publish(
            "a1",
            "m1",
            "ops",
            Severity::Warn,
            "db failover",
            Some(["dba".to_string()].into()),
        );
        table.fan_out(&targeted).await;

        match dba.rx.recv().await.unwrap() {
            Frame::Broadcast(b) => assert_eq!(b.message, "db failover"),
            other => panic!("unexpected {other:?}"),
        }
        // The web session got nothing.
        assert!(web.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_cancels_handlers() {
        let table = table();
        let attach = table.attach_stream(None).unwrap();
        let token = table.cancel_token(attach.session_id).unwrap();
        assert!(!token.is_cancelled());

        table.close(attach.session_id);
        assert!(token.is_cancelled());
        assert!(!table.is_live(attach.session_id));
    }

    #[tokio::test]
    async fn test_sweep_removes_after_grace() {
        let table = tiny_table(0, 0);
        let attach = table.attach_stream(None).unwrap();
        let id = attach.session_id;
        // Let last_activity fall behind the zero-width windows.
        tokio::time::sleep(Duration::from_millis(5)).await;

        // First sweep closes the idle session, second removes it.
        assert!(table.sweep().is_empty());
        tokio::time::sleep(Duration::from_millis(5)).await;
        let removed = table.sweep();
        assert_eq!(removed, vec![id]);
        assert_eq!(table.len(), 0);
    }
}
