//! The broadcast bus: totally ordered fan-out with bounded replay.
//!
//! Ids are assigned under the ring's write lock, so the replay ring and the
//! live channel always agree on order. Delivery to sessions is at-least-once;
//! drones dedupe by `broadcast_id`.

use std::collections::{BTreeSet, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use tokio::sync::broadcast as channel;

use waggle_types::now_ms;

/// How many past broadcasts are kept for reconnect replay.
pub const REPLAY_CAP: usize = 1000;

/// Broadcast severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
    Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    #[default]
    Info,
    Warn,
    Critical,
}

/// One append-only broadcast record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Broadcast {
    /// Monotonic, bus-assigned. All recipients observe the same order.
    pub broadcast_id: u64,
    pub source_agent: String,
    pub source_machine: String,
    pub category: String,
    pub severity: Severity,
    pub message: String,
    /// When set, only agents whose role is in the set receive the fan-out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_roles: Option<BTreeSet<String>>,
    pub created_at: i64,
}

impl Broadcast {
    /// Whether a recipient with `role` should see this broadcast.
    pub fn targets_role(&self, role: &str) -> bool {
        match &self.target_roles {
            Some(roles) => roles.contains(role),
            None => true,
        }
    }
}

struct Ring {
    next_id: u64,
    entries: VecDeque<Broadcast>,
}

/// The process-wide broadcast bus.
pub struct BroadcastBus {
    ring: RwLock<Ring>,
    cap: usize,
    live: channel::Sender<Broadcast>,
}

impl BroadcastBus {
    pub fn new(cap: usize) -> Self {
        let (live, _) = channel::channel(cap.max(16));
        Self {
            ring: RwLock::new(Ring {
                next_id: 1,
                entries: VecDeque::new(),
            }),
            cap,
            live,
        }
    }

    /// Append a broadcast and fan it out to live subscribers.
    pub fn publish(
        &self,
        source_agent: impl Into<String>,
        source_machine: impl Into<String>,
        category: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
        target_roles: Option<BTreeSet<String>>,
    ) -> Broadcast {
        let mut ring = self.ring.write();
        let broadcast = Broadcast {
            broadcast_id: ring.next_id,
            source_agent: source_agent.into(),
            source_machine: source_machine.into(),
            category: category.into(),
            severity,
            message: message.into(),
            target_roles,
            created_at: now_ms(),
        };
        ring.next_id += 1;
        ring.entries.push_back(broadcast.clone());
        while ring.entries.len() > self.cap {
            ring.entries.pop_front();
        }
        // Send while the lock is held so channel order matches ring order.
        let _ = self.live.send(broadcast.clone());
        broadcast
    }

    /// Subscribe to live broadcasts.
    pub fn subscribe(&self) -> channel::Receiver<Broadcast> {
        self.live.subscribe()
    }

    /// Every retained broadcast with id greater than `high_water`, in order.
    pub fn replay_after(&self, high_water: u64) -> Vec<Broadcast> {
        let ring = self.ring.read();
        ring.entries
            .iter()
            .filter(|b| b.broadcast_id > high_water)
            .cloned()
            .collect()
    }

    /// The most recently assigned id, 0 when nothing was published yet.
    pub fn last_id(&self) -> u64 {
        self.ring.read().next_id - 1
    }

    /// Number of retained broadcasts.
    pub fn len(&self) -> usize {
        self.ring.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(REPLAY_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish_n(bus: &BroadcastBus, n: usize) {
        for i in 0..n {
            bus.publish("a1", "m1", "ops", Severity::Info, format!("msg {i}"), None);
        }
    }

    #[test]
    fn test_ids_are_monotonic() {
        let bus = BroadcastBus::default();
        publish_n(&bus, 5);
        let all = bus.replay_after(0);
        let ids: Vec<u64> = all.iter().map(|b| b.broadcast_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(bus.last_id(), 5);
    }

    #[test]
    fn test_replay_after_high_water() {
        let bus = BroadcastBus::default();
        publish_n(&bus, 10);
        let replay = bus.replay_after(8);
        let ids: Vec<u64> = replay.iter().map(|b| b.broadcast_id).collect();
        assert_eq!(ids, vec![9, 10]);
    }

    #[test]
    fn test_ring_cap_drops_oldest() {
        let bus = BroadcastBus::new(3);
        publish_n(&bus, 5);
        let ids: Vec<u64> = bus.replay_after(0).iter().map(|b| b.broadcast_id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn test_role_targeting() {
        let bus = BroadcastBus::default();
        let roles: BTreeSet<String> = ["dba".to_string()].into();
        let targeted = bus.publish("a1", "m1", "ops", Severity::Warn, "db down", Some(roles));
        assert!(targeted.targets_role("dba"));
        assert!(!targeted.targets_role("web"));

        let open = bus.publish("a1", "m1", "ops", Severity::Info, "all hands", None);
        assert!(open.targets_role("anyone"));
    }

    #[tokio::test]
    async fn test_live_channel_preserves_order() {
        let bus = BroadcastBus::default();
        let mut rx = bus.subscribe();
        publish_n(&bus, 3);

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await.unwrap().broadcast_id);
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }
}
