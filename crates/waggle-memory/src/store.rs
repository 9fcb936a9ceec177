//! The memory store: category collections, content-hash dedup, filtered
//! semantic search with stable pagination, and the recent/delete paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anndists::dist::{DistCosine, Distance};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::IntoEnumIterator;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use waggle_types::{
    now_ms, MemoryCategory, MemoryId, MemoryItem, MemoryScope, MetaValue, Page, HOUR_MS,
};

use crate::collection::Collection;
use crate::embed::Embedder;

/// Two stores of the same `(content, category, machine_id)` inside this
/// window return the same id.
pub const DEDUP_WINDOW_MS: i64 = 24 * HOUR_MS;

/// Scores closer than this are considered tied and fall back to recency.
const SCORE_EPSILON: f32 = 1e-6;

/// Errors raised by the memory store.
#[derive(Debug, Clone, Error)]
pub enum MemoryError {
    #[error("memory content must not be empty")]
    EmptyContent,

    #[error("memory store unavailable: {0}")]
    Unavailable(String),
}

/// Internal event emitted on successful stores.
#[derive(Debug, Clone)]
pub enum MemoryEvent {
    Stored {
        id: MemoryId,
        category: MemoryCategory,
    },
    Deleted {
        id: MemoryId,
        category: MemoryCategory,
    },
}

/// Parameters for [`MemoryStore::store`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreRequest {
    pub content: String,
    pub category: MemoryCategory,
    #[serde(default)]
    pub scope: MemoryScope,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, MetaValue>,
    #[serde(default)]
    pub context: Option<String>,
    pub machine_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub project: Option<String>,
}

/// Parameters for [`MemoryStore::search`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub category: Option<MemoryCategory>,
    #[serde(default)]
    pub scope: Option<MemoryScope>,
    /// When a scope filter is set, also admit global-scope items.
    #[serde(default = "default_true")]
    pub include_global: bool,
    #[serde(default)]
    pub machine_filter_in: Vec<String>,
    #[serde(default)]
    pub machine_filter_out: Vec<String>,
    /// Restrict to items issued by this agent.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Rank by cosine similarity; false means substring matching.
    #[serde(default = "default_true")]
    pub semantic: bool,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_true() -> bool {
    true
}

fn default_limit() -> usize {
    20
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            category: None,
            scope: None,
            include_global: true,
            machine_filter_in: Vec::new(),
            machine_filter_out: Vec::new(),
            user_id: None,
            semantic: true,
            limit: default_limit(),
            offset: 0,
        }
    }
}

/// Parameters for [`MemoryStore::recent`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentRequest {
    #[serde(default = "default_hours")]
    pub hours: i64,
    #[serde(default)]
    pub category: Option<MemoryCategory>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_hours() -> i64 {
    24
}

/// Deterministic content hash over `(content, category, machine_id)`.
pub fn content_hash(content: &str, category: MemoryCategory, machine_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher.update(b"\n");
    hasher.update(category.as_ref().as_bytes());
    hasher.update(b"\n");
    hasher.update(machine_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Shared handle type used across the hub.
pub type SharedMemoryStore = Arc<MemoryStore>;

/// The process-wide memory store singleton.
pub struct MemoryStore {
    collections: BTreeMap<&'static str, Collection>,
    /// id -> category, for O(1) retrieve across collections.
    locations: Mutex<std::collections::HashMap<MemoryId, MemoryCategory>>,
    embedder: Arc<dyn Embedder>,
    events: broadcast::Sender<MemoryEvent>,
    available: AtomicBool,
    dedup_window_ms: i64,
}

impl MemoryStore {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        let mut collections = BTreeMap::new();
        for category in MemoryCategory::iter() {
            let key: &'static str = category.into();
            collections.insert(key, Collection::new(category));
        }
        let (events, _) = broadcast::channel(256);
        Self {
            collections,
            locations: Mutex::new(std::collections::HashMap::new()),
            embedder,
            events,
            available: AtomicBool::new(true),
            dedup_window_ms: DEDUP_WINDOW_MS,
        }
    }

    #[cfg(test)]
    fn with_dedup_window(mut self, window_ms: i64) -> Self {
        self.dedup_window_ms = window_ms;
        self
    }

    fn collection(&self, category: MemoryCategory) -> &Collection {
        let key: &'static str = category.into();
        // Every enum variant gets a collection in new(); missing would be a
        // construction bug, not a runtime condition.
        &self.collections[key]
    }

    /// Subscribe to store events.
    pub fn subscribe(&self) -> broadcast::Receiver<MemoryEvent> {
        self.events.subscribe()
    }

    /// Mark the store unavailable (index corruption path). Reads and writes
    /// fail fast until `set_available(true)`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> Result<(), MemoryError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(MemoryError::Unavailable("index offline".into()))
        }
    }

    /// Store a memory. Idempotent on `(content, category, machine_id)`
    /// within the dedup window: the prior id is returned and refreshed.
    pub async fn store(&self, req: StoreRequest) -> Result<MemoryId, MemoryError> {
        self.ensure_available()?;
        if req.content.trim().is_empty() {
            return Err(MemoryError::EmptyContent);
        }

        let now = now_ms();
        let hash = content_hash(&req.content, req.category, &req.machine_id);
        let collection = self.collection(req.category);

        if let Some(existing) = collection.dedup_hit(&hash, self.dedup_window_ms, now) {
            debug!(id = %existing, category = %req.category, "dedup hit, returning prior id");
            return Ok(existing);
        }

        // Embedder failure downgrades the item to keyword-only; the store
        // itself still succeeds.
        let embedding = match self.embedder.embed(&req.content).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                warn!(error = %e, category = %req.category, "embedding failed, storing without vector");
                None
            }
        };

        let item = MemoryItem {
            id: MemoryId::new(),
            content: req.content,
            category: req.category,
            scope: req.scope,
            machine_id: req.machine_id,
            agent_id: req.agent_id,
            project: req.project,
            tags: req.tags,
            metadata: req.metadata,
            context: req.context,
            created_at: now,
            updated_at: now,
            embedding,
        };
        let id = item.id;
        collection.insert(item, hash);
        self.locations.lock().insert(id, req.category);

        let _ = self.events.send(MemoryEvent::Stored {
            id,
            category: req.category,
        });
        Ok(id)
    }

    /// O(1) lookup by id.
    pub fn retrieve(&self, id: MemoryId) -> Option<MemoryItem> {
        if !self.is_available() {
            return None;
        }
        let category = *self.locations.lock().get(&id)?;
        self.collection(category).get(id)
    }

    /// Tombstone an item. Returns false for unknown or already-deleted ids.
    pub fn delete(&self, id: MemoryId) -> bool {
        let Some(category) = self.locations.lock().remove(&id) else {
            return false;
        };
        let removed = self.collection(category).tombstone(id);
        if removed {
            let _ = self.events.send(MemoryEvent::Deleted { id, category });
        }
        removed
    }

    /// Search with every predicate applied before ranking.
    pub async fn search(&self, req: SearchRequest) -> Result<Page<MemoryItem>, MemoryError> {
        self.ensure_available()?;

        let candidates = self.filtered_candidates(&req);

        let (mut scored, degraded) = if req.semantic {
            match self.embedder.embed(&req.query).await {
                Ok(query_vec) => (Self::rank_semantic(candidates, &query_vec), false),
                Err(e) => {
                    warn!(error = %e, "query embedding failed, downgrading to keyword search");
                    (Self::rank_keyword(candidates, &req.query), true)
                }
            }
        } else {
            (Self::rank_keyword(candidates, &req.query), false)
        };

        // Total order: score desc, then created_at desc, then id. Ties in
        // score fall to recency so pagination is stable across calls.
        scored.sort_by(|a, b| {
            let by_score = b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal);
            if (a.0 - b.0).abs() > SCORE_EPSILON {
                return by_score;
            }
            b.1.created_at
                .cmp(&a.1.created_at)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });

        let total = scored.len();
        let items: Vec<MemoryItem> = scored
            .into_iter()
            .skip(req.offset)
            .take(req.limit)
            .map(|(_, item)| item)
            .collect();
        let has_more = req.offset + items.len() < total;

        Ok(Page {
            items,
            total,
            has_more,
            degraded,
        })
    }

    /// Items stored in the last `hours`, newest first.
    pub fn recent(&self, req: RecentRequest) -> Result<Vec<MemoryItem>, MemoryError> {
        self.ensure_available()?;
        let cutoff = now_ms() - req.hours.max(0) * HOUR_MS;

        let mut items: Vec<MemoryItem> = self
            .target_collections(req.category)
            .flat_map(|coll| {
                coll.matching(|item| {
                    item.created_at >= cutoff
                        && req
                            .user_id
                            .as_deref()
                            .map(|uid| item.agent_id == uid)
                            .unwrap_or(true)
                })
            })
            .collect();

        items.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        items.truncate(req.limit);
        Ok(items)
    }

    /// Live item count across all collections.
    pub fn len(&self) -> usize {
        self.collections.values().map(|c| c.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn target_collections(
        &self,
        category: Option<MemoryCategory>,
    ) -> Box<dyn Iterator<Item = &Collection> + '_> {
        match category {
            Some(cat) => Box::new(std::iter::once(self.collection(cat))),
            None => Box::new(self.collections.values()),
        }
    }

    fn filtered_candidates(&self, req: &SearchRequest) -> Vec<MemoryItem> {
        self.target_collections(req.category)
            .flat_map(|coll| {
                coll.matching(|item| {
                    if let Some(scope) = req.scope {
                        let scope_ok = item.scope == scope
                            || (req.include_global && item.scope == MemoryScope::Global);
                        if !scope_ok {
                            return false;
                        }
                    }
                    if !req.machine_filter_in.is_empty()
                        && !req.machine_filter_in.contains(&item.machine_id)
                    {
                        return false;
                    }
                    if req.machine_filter_out.contains(&item.machine_id) {
                        return false;
                    }
                    if let Some(uid) = req.user_id.as_deref() {
                        if item.agent_id != uid {
                            return false;
                        }
                    }
                    true
                })
            })
            .collect()
    }

    fn rank_semantic(candidates: Vec<MemoryItem>, query_vec: &[f32]) -> Vec<(f32, MemoryItem)> {
        let cosine = DistCosine;
        candidates
            .into_iter()
            .map(|item| {
                let score = match &item.embedding {
                    Some(vector) if vector.len() == query_vec.len() => {
                        1.0 - cosine.eval(query_vec, vector)
                    }
                    // Unembedded items rank behind every true match.
                    _ => 0.0,
                };
                (score, item)
            })
            .collect()
    }

    fn rank_keyword(candidates: Vec<MemoryItem>, query: &str) -> Vec<(f32, MemoryItem)> {
        let needle = query.to_lowercase();
        candidates
            .into_iter()
            .filter(|item| {
                if needle.is_empty() {
                    return true;
                }
                item.content.to_lowercase().contains(&needle)
                    || item.tags.iter().any(|t| t.to_lowercase().contains(&needle))
                    || item
                        .context
                        .as_deref()
                        .map(|c| c.to_lowercase().contains(&needle))
                        .unwrap_or(false)
            })
            .map(|item| (1.0, item))
            .collect()
    }
}
