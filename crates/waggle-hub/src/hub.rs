//! The composition root. Owns every singleton and the background tasks.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use waggle_backup::{BackupDb, BackupEngine, DriftAnalyzer};
use waggle_bridge::BridgeManager;
use waggle_memory::{MemoryStore, NgramEmbedder};
use waggle_swarm::{AgentRegistry, BroadcastBus};
use waggle_tickets::{LocalBoard, TicketBoard, TicketCoordinator};
use waggle_tools::{CallContext, Dispatcher};
use waggle_types::{now_ms, ResultFrame, SessionId, ToolInvocation};

use crate::auth::AuthService;
use crate::config::HubConfig;
use crate::session::SessionTable;
use crate::tools::{self, Services};

/// How often idle sessions are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// The hub. One per process; handlers reach it through `Arc`.
pub struct Hub {
    pub config: HubConfig,
    pub services: Arc<Services>,
    pub dispatcher: Arc<Dispatcher>,
    pub auth: Arc<AuthService>,
    shutdown: CancellationToken,
}

impl Hub {
    /// Wire every component from configuration. No network activity yet;
    /// call [`Hub::spawn_background`] after.
    pub fn build(config: HubConfig) -> anyhow::Result<Arc<Self>> {
        let machine_id = config.machine_id();

        let embedder = Arc::new(NgramEmbedder::new(config.memory.embedding_dim));
        let memory = Arc::new(MemoryStore::new(embedder));

        let swarm = Arc::new(AgentRegistry::new(
            (config.swarm.liveness_window_s as i64) * 1000,
        ));
        let bus = Arc::new(BroadcastBus::new(config.swarm.broadcast_replay));

        let bridges = Arc::new(BridgeManager::new(
            config.bridges.inflight_cap,
            Duration::from_secs(config.bridges.proxy_deadline_s),
        ));

        let db = match &config.backup.db_path {
            Some(path) => BackupDb::open(path)?,
            None => BackupDb::in_memory()?,
        };
        let analyzer = match &config.backup.drift_patterns {
            Some(patterns) => DriftAnalyzer::from_patterns(patterns.clone())?,
            None => DriftAnalyzer::default(),
        };
        let backup = Arc::new(BackupEngine::new(
            db,
            analyzer,
            config.backup.drift_threshold,
        ));

        let board: Arc<dyn TicketBoard> = match &config.tickets.db_path {
            Some(path) => Arc::new(LocalBoard::open(path)?),
            None => Arc::new(LocalBoard::in_memory()?),
        };
        let tickets = Arc::new(TicketCoordinator::new(
            board,
            memory.clone(),
            machine_id.clone(),
        ));

        let sessions = Arc::new(SessionTable::new(&config.sessions));

        let services = Arc::new(Services {
            machine_id: machine_id.clone(),
            started_at: now_ms(),
            memory,
            swarm,
            bus,
            bridges,
            backup,
            tickets,
            sessions,
            bridge_discovery_paths: config.bridges.discovery_paths.clone(),
        });

        let registry = tools::build_registry(&services, &config.tools)
            .map_err(|e| anyhow::anyhow!("tool registration failed: {e}"))?;
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(registry)));
        let auth = Arc::new(AuthService::new(&config.auth));

        info!(
            machine = %machine_id,
            tools = dispatcher.registry().len(),
            "hub wired"
        );
        Ok(Arc::new(Self {
            config,
            services,
            dispatcher,
            auth,
            shutdown: CancellationToken::new(),
        }))
    }

    /// Start the long-lived tasks: broadcast pump, session sweeper, bridge
    /// health loop, and startup bridge registration.
    pub fn spawn_background(self: &Arc<Self>) {
        // Broadcast pump: the bus is the single source of ordering; this
        // task is the only writer of broadcast frames into sessions.
        let hub = self.clone();
        tokio::spawn(async move {
            let mut rx = hub.services.bus.subscribe();
            loop {
                tokio::select! {
                    _ = hub.shutdown.cancelled() => return,
                    received = rx.recv() => match received {
                        Ok(broadcast) => hub.services.sessions.fan_out(&broadcast).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "broadcast pump lagged; sessions rely on replay");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });

        // Session sweeper.
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = hub.shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                for session_id in hub.services.sessions.sweep() {
                    hub.dispatcher.forget_session(session_id);
                }
            }
        });

        // Bridge health.
        let _health = self
            .services
            .bridges
            .spawn_health_task(Duration::from_secs(self.config.bridges.health_interval_s));

        // Configured bridges come up in the background so a dead server
        // cannot stall startup.
        let hub = self.clone();
        tokio::spawn(async move {
            for (server_id, mut config) in hub.config.bridges.servers.clone() {
                config.server_id = server_id;
                if !config.enabled {
                    continue;
                }
                let id = config.server_id.clone();
                match hub.services.bridges.register(config).await {
                    Ok(info) => info!(server = %id, status = %info.status, "bridge registered"),
                    Err(e) => warn!(server = %id, error = %e, "bridge registration failed"),
                }
            }
        });
    }

    /// Accept one invocation from a session. Dispatch runs on its own task;
    /// the result lands on the session's stream in completion order.
    pub fn submit(self: &Arc<Self>, session_id: SessionId, invocation: ToolInvocation) {
        let hub = self.clone();
        tokio::spawn(async move {
            let cancel = hub
                .services
                .sessions
                .cancel_token(session_id)
                .unwrap_or_default();
            let ctx = CallContext::for_session(session_id, cancel);
            let frame = match hub
                .dispatcher
                .dispatch(&invocation.tool, invocation.args, ctx)
                .await
            {
                Ok(payload) => ResultFrame::ok(invocation.id, payload),
                Err(e) => ResultFrame::err(invocation.id, e.to_payload()),
            };
            hub.services.sessions.deliver_result(session_id, frame).await;
        });
    }

    /// Health payload.
    pub fn health(&self) -> serde_json::Value {
        let degraded = !self.services.memory.is_available();
        json!({
            "status": if degraded { "degraded" } else { "ok" },
            "version": env!("CARGO_PKG_VERSION"),
            "machine_id": self.services.machine_id,
            "ssl_enabled": self.config.security.tls.enabled,
        })
    }

    /// Session-plane liveness hints.
    pub fn session_info(&self) -> serde_json::Value {
        json!({
            "live_sessions": self.services.sessions.live_count(),
            "max_sessions": self.config.sessions.max_sessions,
            "sse_url": "/sse",
            "recover_url": "/api/session/recover",
        })
    }

    /// Stop background tasks and bridges.
    pub fn shutdown(&self) {
        info!("hub shutting down");
        self.shutdown.cancel();
        self.services.bridges.shutdown();
    }
}
