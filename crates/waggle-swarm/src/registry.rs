//! Agent registry: identity, liveness, workload accounting, delegation.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tracing::{debug, info};

use waggle_types::{now_ms, MetaValue, TaskId};

/// An agent is considered active when `last_seen` falls inside this window.
pub const DEFAULT_LIVENESS_WINDOW_MS: i64 = 5 * 60 * 1000;

/// Workload ceiling applied when registration does not name one.
pub const DEFAULT_MAX_WORKLOAD: u32 = 5;

/// Errors raised by registry operations.
#[derive(Debug, Clone, Error)]
pub enum SwarmError {
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("target agent unavailable: {0}")]
    TargetUnavailable(String),

    #[error("no active agent satisfies capabilities {0:?}")]
    NoCapableAgent(BTreeSet<String>),
}

/// Reported agent status. Liveness for delegation is computed from
/// `last_seen`, not from this field.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
    Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Active,
    Idle,
    Offline,
}

/// One registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub machine_id: String,
    pub role: String,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    pub current_workload: u32,
    pub max_workload: u32,
    /// Unix epoch milliseconds.
    pub registered_at: i64,
    /// Unix epoch milliseconds.
    pub last_seen: i64,
    #[serde(default)]
    pub metadata: BTreeMap<String, MetaValue>,
}

impl AgentRecord {
    /// Liveness check against the registry's window.
    pub fn is_active(&self, now: i64, window_ms: i64) -> bool {
        self.status != AgentStatus::Offline && now - self.last_seen <= window_ms
    }

    fn has_headroom(&self) -> bool {
        self.current_workload < self.max_workload
    }

    fn load_ratio(&self) -> f64 {
        if self.max_workload == 0 {
            return 1.0;
        }
        self.current_workload as f64 / self.max_workload as f64
    }
}

/// Parameters for [`AgentRegistry::register`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub agent_id: String,
    pub machine_id: String,
    pub role: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, MetaValue>,
    #[serde(default)]
    pub max_workload: Option<u32>,
}

/// Parameters for [`AgentRegistry::roster`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RosterRequest {
    #[serde(default)]
    pub include_inactive: bool,
    #[serde(default = "default_roster_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_roster_limit() -> usize {
    50
}

/// One roster page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterPage {
    pub agents: Vec<AgentRecord>,
    pub total: usize,
    pub has_more: bool,
}

/// Parameters for [`AgentRegistry::delegate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegateRequest {
    pub task: String,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    #[serde(default)]
    pub target_agent: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    /// Unix epoch milliseconds.
    #[serde(default)]
    pub deadline: Option<i64>,
}

/// The outcome of a delegation. The caller records this as a task memory;
/// the registry only owns the workload counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delegation {
    pub task_id: TaskId,
    pub task: String,
    pub assignee: String,
    pub assignee_machine: String,
    pub required_capabilities: BTreeSet<String>,
    pub priority: Option<String>,
    pub deadline: Option<i64>,
    pub delegated_at: i64,
}

/// The process-wide agent registry. One mutex guards the whole roster.
pub struct AgentRegistry {
    agents: Mutex<HashMap<String, AgentRecord>>,
    liveness_window_ms: i64,
}

impl AgentRegistry {
    pub fn new(liveness_window_ms: i64) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            liveness_window_ms,
        }
    }

    /// Register an agent. Idempotent: a second call with the same id updates
    /// the mutable fields and refreshes `last_seen`.
    pub fn register(&self, req: RegisterRequest) -> AgentRecord {
        use std::collections::hash_map::Entry;

        let now = now_ms();
        let mut agents = self.agents.lock();
        match agents.entry(req.agent_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                existing.machine_id = req.machine_id;
                existing.role = req.role;
                existing.capabilities = req.capabilities;
                existing.metadata = req.metadata;
                if let Some(max) = req.max_workload {
                    existing.max_workload = max;
                    existing.current_workload = existing.current_workload.min(max);
                }
                existing.status = AgentStatus::Active;
                existing.last_seen = now;
                existing.clone()
            }
            Entry::Vacant(vacant) => {
                info!(agent = %req.agent_id, machine = %req.machine_id, role = %req.role, "agent registered");
                vacant
                    .insert(AgentRecord {
                        agent_id: req.agent_id,
                        machine_id: req.machine_id,
                        role: req.role,
                        capabilities: req.capabilities,
                        status: AgentStatus::Active,
                        current_workload: 0,
                        max_workload: req.max_workload.unwrap_or(DEFAULT_MAX_WORKLOAD),
                        registered_at: now,
                        last_seen: now,
                        metadata: req.metadata,
                    })
                    .clone()
            }
        }
    }

    /// Refresh `last_seen` and optionally the reported status.
    pub fn touch(&self, agent_id: &str, status: Option<AgentStatus>) -> Result<(), SwarmError> {
        let mut agents = self.agents.lock();
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| SwarmError::UnknownAgent(agent_id.to_string()))?;
        record.last_seen = now_ms();
        if let Some(status) = status {
            record.status = status;
        }
        Ok(())
    }

    /// Look up one agent.
    pub fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        self.agents.lock().get(agent_id).cloned()
    }

    /// Paginated roster, stable order: `registered_at` then id.
    pub fn roster(&self, req: RosterRequest) -> RosterPage {
        let now = now_ms();
        let mut entries: Vec<AgentRecord> = {
            let agents = self.agents.lock();
            agents
                .values()
                .filter(|a| req.include_inactive || a.is_active(now, self.liveness_window_ms))
                .cloned()
                .collect()
        };
        entries.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });

        let total = entries.len();
        let agents: Vec<AgentRecord> = entries
            .into_iter()
            .skip(req.offset)
            .take(req.limit)
            .collect();
        let has_more = req.offset + agents.len() < total;
        RosterPage {
            agents,
            total,
            has_more,
        }
    }

    /// Number of registered agents, active or not.
    pub fn len(&self) -> usize {
        self.agents.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delegate a task.
    ///
    /// Target resolution: an explicitly named agent wins when it is active
    /// and has headroom; otherwise the least-loaded active agent whose
    /// capabilities cover the requirement takes it, ties broken by earliest
    /// `last_seen`. The winner's workload counter is incremented under the
    /// roster lock.
    pub fn delegate(&self, req: DelegateRequest) -> Result<Delegation, SwarmError> {
        let now = now_ms();
        let mut agents = self.agents.lock();

        let assignee_id = if let Some(target) = &req.target_agent {
            let record = agents
                .get(target)
                .ok_or_else(|| SwarmError::UnknownAgent(target.clone()))?;
            if !record.is_active(now, self.liveness_window_ms) || !record.has_headroom() {
                return Err(SwarmError::TargetUnavailable(target.clone()));
            }
            target.clone()
        } else {
            let mut best: Option<&AgentRecord> = None;
            for record in agents.values() {
                if !record.is_active(now, self.liveness_window_ms)
                    || !record.has_headroom()
                    || !req.required_capabilities.is_subset(&record.capabilities)
                {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some(current) => {
                        let by_ratio = record
                            .load_ratio()
                            .partial_cmp(&current.load_ratio())
                            .unwrap_or(std::cmp::Ordering::Equal);
                        match by_ratio {
                            std::cmp::Ordering::Less => true,
                            std::cmp::Ordering::Greater => false,
                            std::cmp::Ordering::Equal => record.last_seen < current.last_seen,
                        }
                    }
                };
                if better {
                    best = Some(record);
                }
            }
            best.map(|r| r.agent_id.clone())
                .ok_or(SwarmError::NoCapableAgent(req.required_capabilities.clone()))?
        };

        // Present and validated above while the lock was held.
        let record = agents
            .get_mut(&assignee_id)
            .ok_or_else(|| SwarmError::UnknownAgent(assignee_id.clone()))?;
        record.current_workload += 1;
        debug!(
            agent = %record.agent_id,
            workload = record.current_workload,
            max = record.max_workload,
            "task delegated"
        );

        Ok(Delegation {
            task_id: TaskId::new(),
            task: req.task,
            assignee: record.agent_id.clone(),
            assignee_machine: record.machine_id.clone(),
            required_capabilities: req.required_capabilities,
            priority: req.priority,
            deadline: req.deadline,
            delegated_at: now,
        })
    }

    /// Release one unit of workload, e.g. on completion or cancellation.
    pub fn release(&self, agent_id: &str) -> Result<u32, SwarmError> {
        let mut agents = self.agents.lock();
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| SwarmError::UnknownAgent(agent_id.to_string()))?;
        record.current_workload = record.current_workload.saturating_sub(1);
        Ok(record.current_workload)
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_LIVENESS_WINDOW_MS)
    }
}
