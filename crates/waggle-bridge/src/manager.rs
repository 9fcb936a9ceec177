//! The bridge manager: connection lifecycle, supervision, health, proxying.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rmcp::model::{CallToolRequestParams, CallToolResult, ClientInfo, Tool as McpTool};
use rmcp::service::RunningService;
use rmcp::transport::{ConfigureCommandExt, StreamableHttpClientTransport, TokioChildProcess};
use rmcp::{ClientHandler, Peer, RoleClient};

use waggle_types::now_ms;

use crate::config::{BridgeConfig, BridgeTransport};

/// Maximum concurrent proxy calls per bridge.
pub const DEFAULT_INFLIGHT_CAP: usize = 64;

/// Per-call proxy deadline.
pub const DEFAULT_PROXY_DEADLINE: Duration = Duration::from_secs(30);

/// Restart backoff ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Consecutive connect failures before a bridge parks in `error`.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Consecutive ping failures before a bridge is marked down.
const MAX_PING_FAILURES: u32 = 3;

/// Deadline for one health ping.
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised by bridge operations.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("bridge not found: {0}")]
    NotFound(String),

    #[error("bridge already registered: {0}")]
    AlreadyExists(String),

    #[error("invalid bridge config: {0}")]
    Config(String),

    #[error("bridge '{server}' is {status}, not accepting calls")]
    NotUp { server: String, status: BridgeStatus },

    #[error("bridge '{0}' in-flight limit reached")]
    Exhausted(String),

    #[error("bridge '{server}' timed out calling '{tool}'")]
    Timeout { server: String, tool: String },

    #[error("failed to spawn bridge process: {0}")]
    Spawn(String),

    #[error("failed to initialize bridge: {0}")]
    Init(String),

    #[error("bridge service error: {0}")]
    Service(String),

    #[error("bridge connection lost mid-call")]
    ConnectionLost,
}

/// Lifecycle state of one bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeStatus {
    Down,
    Starting,
    Up,
    /// Gave up restarting; manual intervention required.
    Error,
}

impl std::fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BridgeStatus::Down => "down",
            BridgeStatus::Starting => "starting",
            BridgeStatus::Up => "up",
            BridgeStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// One remote tool, as enumerated by the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeToolInfo {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: JsonValue,
}

impl From<McpTool> for BridgeToolInfo {
    fn from(tool: McpTool) -> Self {
        Self {
            name: tool.name.to_string(),
            description: tool.description.map(|s| s.to_string()),
            input_schema: JsonValue::Object(tool.input_schema.as_ref().clone()),
        }
    }
}

/// Snapshot of one bridge, for listings and the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeInfo {
    pub server_id: String,
    pub transport: BridgeTransport,
    pub status: BridgeStatus,
    pub last_ping: Option<i64>,
    pub tools: Vec<BridgeToolInfo>,
    pub in_flight: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Result of one proxied call, flattened to text the way tool results are.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyOutput {
    pub text: String,
    pub is_error: bool,
}

impl From<CallToolResult> for ProxyOutput {
    fn from(result: CallToolResult) -> Self {
        let text = result
            .content
            .iter()
            .filter_map(|c| c.as_text().map(|t| t.text.clone()))
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            text,
            is_error: result.is_error.unwrap_or(false),
        }
    }
}

/// Client handler for the hub's outbound MCP connections.
#[derive(Debug, Clone)]
pub struct HubClientHandler {
    client_info: ClientInfo,
}

impl Default for HubClientHandler {
    fn default() -> Self {
        let mut info = ClientInfo::default();
        info.client_info.name = "waggle-hub".into();
        info.client_info.version = env!("CARGO_PKG_VERSION").into();
        Self { client_info: info }
    }
}

impl ClientHandler for HubClientHandler {
    fn get_info(&self) -> ClientInfo {
        self.client_info.clone()
    }

    fn on_tool_list_changed(
        &self,
        _context: rmcp::service::NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        async move {
            // The next health ping refreshes the cached tool list.
            info!("bridge reported a tool list change");
        }
    }
}

struct BridgeState {
    config: BridgeConfig,
    status: BridgeStatus,
    last_ping: Option<i64>,
    ping_failures: u32,
    tools: Vec<BridgeToolInfo>,
    peer: Option<Peer<RoleClient>>,
    semaphore: Arc<Semaphore>,
    /// Fired by the health loop to force a reconnect.
    restart: CancellationToken,
    /// Fired on unregister/shutdown; the supervisor exits.
    closed: CancellationToken,
    last_error: Option<String>,
}

type SharedBridge = Arc<Mutex<BridgeState>>;

/// The bridge manager. One supervisor task per stdio bridge owns its child.
pub struct BridgeManager {
    bridges: RwLock<HashMap<String, SharedBridge>>,
    handler: HubClientHandler,
    /// Correlation id -> server id for calls still awaited by a proxy caller.
    pending: Arc<DashMap<u64, String>>,
    next_correlation: AtomicU64,
    inflight_cap: usize,
    proxy_deadline: Duration,
    shutdown: CancellationToken,
}

impl BridgeManager {
    pub fn new(inflight_cap: usize, proxy_deadline: Duration) -> Self {
        Self {
            bridges: RwLock::new(HashMap::new()),
            handler: HubClientHandler::default(),
            pending: Arc::new(DashMap::new()),
            next_correlation: AtomicU64::new(0),
            inflight_cap,
            proxy_deadline,
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a bridge and bring it up.
    ///
    /// The first connection attempt happens inline so callers get a tool
    /// list when the server is reachable. For stdio bridges a supervisor
    /// task then owns the child and restarts it on exit; a failed first
    /// attempt leaves the supervisor retrying with backoff.
    pub async fn register(&self, config: BridgeConfig) -> Result<BridgeInfo, BridgeError> {
        config.validate().map_err(BridgeError::Config)?;
        let server_id = config.server_id.clone();

        if self.bridges.read().contains_key(&server_id) {
            return Err(BridgeError::AlreadyExists(server_id));
        }

        info!(server = %server_id, transport = ?config.transport, "registering bridge");

        let bridge: SharedBridge = Arc::new(Mutex::new(BridgeState {
            config: config.clone(),
            status: BridgeStatus::Starting,
            last_ping: None,
            ping_failures: 0,
            tools: Vec::new(),
            peer: None,
            semaphore: Arc::new(Semaphore::new(self.inflight_cap)),
            restart: CancellationToken::new(),
            closed: CancellationToken::new(),
            last_error: None,
        }));
        self.bridges.write().insert(server_id.clone(), bridge.clone());

        let initial = match Self::connect(&self.handler, &config).await {
            Ok((service, tools)) => {
                let mut state = bridge.lock();
                state.status = BridgeStatus::Up;
                state.peer = Some(service.peer().clone());
                state.tools = tools;
                state.last_ping = Some(now_ms());
                Some(service)
            }
            Err(e) => {
                warn!(server = %server_id, error = %e, "initial bridge connection failed");
                let mut state = bridge.lock();
                state.status = if config.transport == BridgeTransport::Stdio {
                    BridgeStatus::Down
                } else {
                    BridgeStatus::Error
                };
                state.last_error = Some(e.to_string());
                None
            }
        };

        let restartable = config.transport == BridgeTransport::Stdio;
        if restartable || initial.is_some() {
            let handler = self.handler.clone();
            let supervised = bridge.clone();
            let closed = {
                let state = bridge.lock();
                state.closed.clone()
            };
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                Self::supervise(supervised, handler, initial, closed, shutdown, restartable).await;
            });
        }

        Ok(self.snapshot(&server_id, &bridge))
    }

    /// Unregister a bridge. Its supervisor exits and the child (if any) is
    /// dropped with the service.
    pub fn unregister(&self, server_id: &str) -> Result<(), BridgeError> {
        let bridge = self
            .bridges
            .write()
            .remove(server_id)
            .ok_or_else(|| BridgeError::NotFound(server_id.to_string()))?;
        info!(server = %server_id, "unregistering bridge");
        bridge.lock().closed.cancel();
        Ok(())
    }

    /// Snapshot every registered bridge, sorted by id.
    pub fn list(&self) -> Vec<BridgeInfo> {
        let mut infos: Vec<BridgeInfo> = self
            .bridges
            .read()
            .iter()
            .map(|(id, bridge)| self.snapshot(id, bridge))
            .collect();
        infos.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        infos
    }

    /// Snapshot one bridge.
    pub fn info(&self, server_id: &str) -> Result<BridgeInfo, BridgeError> {
        let bridges = self.bridges.read();
        let bridge = bridges
            .get(server_id)
            .ok_or_else(|| BridgeError::NotFound(server_id.to_string()))?;
        Ok(self.snapshot(server_id, bridge))
    }

    /// Proxy one tool call to a bridge.
    ///
    /// Fails fast unless the bridge is up. A transient service failure gets
    /// one in-process retry with jittered backoff before surfacing; timeouts
    /// and state errors do not.
    pub async fn proxy(
        &self,
        server_id: &str,
        tool: &str,
        params: JsonValue,
    ) -> Result<ProxyOutput, BridgeError> {
        match self.proxy_once(server_id, tool, params.clone()).await {
            Err(BridgeError::Service(first)) => {
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(50..250));
                debug!(server = %server_id, tool, error = %first, "transient bridge failure, retrying once");
                tokio::time::sleep(jitter).await;
                self.proxy_once(server_id, tool, params).await
            }
            outcome => outcome,
        }
    }

    /// One proxy attempt. A correlation id tracks the call until its awaiter
    /// is satisfied or evicted by the deadline; responses arriving after
    /// eviction are logged and dropped.
    async fn proxy_once(
        &self,
        server_id: &str,
        tool: &str,
        params: JsonValue,
    ) -> Result<ProxyOutput, BridgeError> {
        let (peer, semaphore) = {
            let bridges = self.bridges.read();
            let bridge = bridges
                .get(server_id)
                .ok_or_else(|| BridgeError::NotFound(server_id.to_string()))?;
            let state = bridge.lock();
            if state.status != BridgeStatus::Up {
                return Err(BridgeError::NotUp {
                    server: server_id.to_string(),
                    status: state.status,
                });
            }
            let peer = state.peer.clone().ok_or(BridgeError::ConnectionLost)?;
            (peer, state.semaphore.clone())
        };

        let permit = semaphore
            .try_acquire_owned()
            .map_err(|_| BridgeError::Exhausted(server_id.to_string()))?;

        let correlation = self.next_correlation.fetch_add(1, Ordering::Relaxed) + 1;
        self.pending.insert(correlation, server_id.to_string());

        let (tx, rx) = oneshot::channel();
        let pending = Arc::clone(&self.pending);
        let tool_name = tool.to_string();
        let mut call_params = CallToolRequestParams::new(tool_name.clone());
        if let Some(arguments) = params.as_object().cloned() {
            call_params = call_params.with_arguments(arguments);
        }
        tokio::spawn(async move {
            // The permit spans the remote call, including late completions.
            let _permit = permit;
            let result = peer.call_tool(call_params).await;
            if pending.remove(&correlation).is_some() {
                let _ = tx.send(result);
            } else {
                debug!(correlation, tool = %tool_name, "late bridge response dropped");
            }
        });

        match tokio::time::timeout(self.proxy_deadline, rx).await {
            Ok(Ok(Ok(result))) => Ok(ProxyOutput::from(result)),
            Ok(Ok(Err(e))) => Err(BridgeError::Service(e.to_string())),
            Ok(Err(_sender_dropped)) => Err(BridgeError::ConnectionLost),
            Err(_elapsed) => {
                self.pending.remove(&correlation);
                warn!(server = %server_id, tool, correlation, "bridge call evicted at deadline");
                Err(BridgeError::Timeout {
                    server: server_id.to_string(),
                    tool: tool.to_string(),
                })
            }
        }
    }

    /// Calls currently awaited by proxy callers, across all bridges.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Spawn the periodic health loop. Three consecutive ping failures mark
    /// a bridge down; stdio bridges are then bounced for reconnect.
    pub fn spawn_health_task(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                manager.ping_all().await;
            }
        })
    }

    async fn ping_all(&self) {
        let bridges: Vec<(String, SharedBridge)> = self
            .bridges
            .read()
            .iter()
            .map(|(id, bridge)| (id.clone(), bridge.clone()))
            .collect();

        for (server_id, bridge) in bridges {
            let peer = {
                let state = bridge.lock();
                if state.status != BridgeStatus::Up {
                    continue;
                }
                state.peer.clone()
            };
            let Some(peer) = peer else { continue };

            match tokio::time::timeout(PING_TIMEOUT, peer.list_all_tools()).await {
                Ok(Ok(tools)) => {
                    let mut state = bridge.lock();
                    state.last_ping = Some(now_ms());
                    state.ping_failures = 0;
                    state.tools = tools.into_iter().map(BridgeToolInfo::from).collect();
                }
                _ => {
                    let mut state = bridge.lock();
                    state.ping_failures += 1;
                    warn!(server = %server_id, failures = state.ping_failures, "bridge ping failed");
                    if state.ping_failures >= MAX_PING_FAILURES {
                        state.status = BridgeStatus::Down;
                        state.peer = None;
                        // Stdio supervisors reconnect when bounced; http
                        // bridges stay down until re-registered.
                        state.restart.cancel();
                    }
                }
            }
        }
    }

    /// Stop every supervisor and health task.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for bridge in self.bridges.read().values() {
            bridge.lock().closed.cancel();
        }
    }

    fn snapshot(&self, server_id: &str, bridge: &SharedBridge) -> BridgeInfo {
        let state = bridge.lock();
        BridgeInfo {
            server_id: server_id.to_string(),
            transport: state.config.transport,
            status: state.status,
            last_ping: state.last_ping,
            tools: state.tools.clone(),
            in_flight: self
                .inflight_cap
                .saturating_sub(state.semaphore.available_permits()),
            last_error: state.last_error.clone(),
        }
    }

    async fn connect(
        handler: &HubClientHandler,
        config: &BridgeConfig,
    ) -> Result<
        (
            RunningService<RoleClient, HubClientHandler>,
            Vec<BridgeToolInfo>,
        ),
        BridgeError,
    > {
        let service = match config.transport {
            BridgeTransport::Stdio => {
                let mut cmd = Command::new(&config.command);
                cmd.args(&config.args);
                for (key, value) in &config.env {
                    cmd.env(key, value);
                }
                if let Some(cwd) = &config.cwd {
                    cmd.current_dir(cwd);
                }
                let transport = TokioChildProcess::new(cmd.configure(|_| {}))
                    .map_err(|e| BridgeError::Spawn(e.to_string()))?;
                rmcp::serve_client(handler.clone(), transport)
                    .await
                    .map_err(|e| BridgeError::Init(e.to_string()))?
            }
            BridgeTransport::HttpSse => {
                let url = config
                    .url
                    .clone()
                    .ok_or_else(|| BridgeError::Config("http_sse bridge without url".into()))?;
                let transport = StreamableHttpClientTransport::from_uri(url);
                rmcp::serve_client(handler.clone(), transport)
                    .await
                    .map_err(|e| BridgeError::Init(e.to_string()))?
            }
        };

        let tools = service
            .peer()
            .list_all_tools()
            .await
            .map_err(|e| BridgeError::Service(e.to_string()))?
            .into_iter()
            .map(BridgeToolInfo::from)
            .collect();

        Ok((service, tools))
    }

    /// Supervisor loop. Owns the running service; on exit marks the bridge
    /// down and, for stdio, reconnects with exponential backoff. Five
    /// consecutive connect failures park the bridge in `error`.
    async fn supervise(
        bridge: SharedBridge,
        handler: HubClientHandler,
        initial: Option<RunningService<RoleClient, HubClientHandler>>,
        closed: CancellationToken,
        shutdown: CancellationToken,
        restartable: bool,
    ) {
        let mut service = initial;
        let mut failures: u32 = 0;

        loop {
            match service.take() {
                Some(running) => {
                    let restart = CancellationToken::new();
                    {
                        let mut state = bridge.lock();
                        state.restart = restart.clone();
                    }
                    tokio::select! {
                        _ = closed.cancelled() => return,
                        _ = shutdown.cancelled() => return,
                        _ = restart.cancelled() => {
                            info!("bridge bounced by health check");
                        }
                        quit = running.waiting() => {
                            warn!(reason = ?quit, "bridge service exited");
                        }
                    }
                    {
                        let mut state = bridge.lock();
                        state.status = BridgeStatus::Down;
                        state.peer = None;
                    }
                    if !restartable {
                        return;
                    }
                }
                None => {
                    failures += 1;
                    if failures > MAX_CONSECUTIVE_FAILURES {
                        let mut state = bridge.lock();
                        state.status = BridgeStatus::Error;
                        error!(
                            server = %state.config.server_id,
                            "bridge failed {MAX_CONSECUTIVE_FAILURES} consecutive restarts, giving up"
                        );
                        return;
                    }
                    let delay = backoff_delay(failures);
                    debug!(attempt = failures, delay_ms = delay.as_millis() as u64, "bridge restart backoff");
                    tokio::select! {
                        _ = closed.cancelled() => return,
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }

                    let config = {
                        let mut state = bridge.lock();
                        state.status = BridgeStatus::Starting;
                        state.config.clone()
                    };
                    match Self::connect(&handler, &config).await {
                        Ok((running, tools)) => {
                            let mut state = bridge.lock();
                            state.status = BridgeStatus::Up;
                            state.peer = Some(running.peer().clone());
                            state.tools = tools;
                            state.ping_failures = 0;
                            state.last_ping = Some(now_ms());
                            state.last_error = None;
                            failures = 0;
                            drop(state);
                            info!(server = %config.server_id, "bridge reconnected");
                            service = Some(running);
                        }
                        Err(e) => {
                            let mut state = bridge.lock();
                            state.status = BridgeStatus::Down;
                            state.last_error = Some(e.to_string());
                        }
                    }
                }
            }
        }
    }
}

impl Default for BridgeManager {
    fn default() -> Self {
        Self::new(DEFAULT_INFLIGHT_CAP, DEFAULT_PROXY_DEADLINE)
    }
}

/// Exponential backoff with jitter: 1s, 2s, 4s, ... capped at 60s.
fn backoff_delay(attempt: u32) -> Duration {
    let base = Duration::from_secs(1 << attempt.saturating_sub(1).min(6));
    let capped = base.min(BACKOFF_CAP);
    let jitter = rand::thread_rng().gen_range(0..500);
    capped + Duration::from_millis(jitter)
}
