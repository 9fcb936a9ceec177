//! One category's collection: an exact id index plus the content-hash index
//! used for the store-dedup window. Mutable state sits behind a single mutex
//! per collection, matching the hub's lock model.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use waggle_types::{MemoryCategory, MemoryId, MemoryItem};

/// Entry in the content-hash index.
#[derive(Debug, Clone)]
struct HashEntry {
    id: MemoryId,
    stored_at: i64,
}

#[derive(Default)]
struct Inner {
    items: HashMap<MemoryId, MemoryItem>,
    by_hash: HashMap<String, HashEntry>,
    tombstones: HashSet<MemoryId>,
}

/// A single category collection.
pub struct Collection {
    category: MemoryCategory,
    inner: Mutex<Inner>,
}

impl Collection {
    pub fn new(category: MemoryCategory) -> Self {
        Self {
            category,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn category(&self) -> MemoryCategory {
        self.category
    }

    /// Insert a new item and record its content hash.
    pub fn insert(&self, item: MemoryItem, content_hash: String) {
        let mut inner = self.inner.lock();
        inner.by_hash.insert(
            content_hash,
            HashEntry {
                id: item.id,
                stored_at: item.created_at,
            },
        );
        inner.items.insert(item.id, item);
    }

    /// Look up a live item by id.
    pub fn get(&self, id: MemoryId) -> Option<MemoryItem> {
        let inner = self.inner.lock();
        if inner.tombstones.contains(&id) {
            return None;
        }
        inner.items.get(&id).cloned()
    }

    /// Find a prior store of the same content hash inside the dedup window.
    /// Refreshes the match's `updated_at` so repeat stores stay visible as
    /// recent activity.
    pub fn dedup_hit(&self, content_hash: &str, window_ms: i64, now: i64) -> Option<MemoryId> {
        let mut inner = self.inner.lock();
        let entry = inner.by_hash.get(content_hash)?.clone();
        if inner.tombstones.contains(&entry.id) || now - entry.stored_at >= window_ms {
            return None;
        }
        if let Some(item) = inner.items.get_mut(&entry.id) {
            item.updated_at = now;
        }
        Some(entry.id)
    }

    /// Tombstone an item. Returns false when the id is unknown or already
    /// tombstoned. The content hash is released so a future store of the
    /// same content creates a fresh item.
    pub fn tombstone(&self, id: MemoryId) -> bool {
        let mut inner = self.inner.lock();
        if inner.items.remove(&id).is_none() {
            return false;
        }
        inner.by_hash.retain(|_, entry| entry.id != id);
        inner.tombstones.insert(id)
    }

    /// Clone out every live item passing the predicate.
    pub fn matching<F>(&self, mut pred: F) -> Vec<MemoryItem>
    where
        F: FnMut(&MemoryItem) -> bool,
    {
        let inner = self.inner.lock();
        inner
            .items
            .values()
            .filter(|item| !inner.tombstones.contains(&item.id) && pred(item))
            .cloned()
            .collect()
    }

    /// Number of live items.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waggle_types::{now_ms, MemoryScope};

    fn item(content: &str) -> MemoryItem {
        let now = now_ms();
        MemoryItem {
            id: MemoryId::new(),
            content: content.into(),
            category: MemoryCategory::Global,
            scope: MemoryScope::Global,
            machine_id: "m1".into(),
            agent_id: "a1".into(),
            project: None,
            tags: Vec::new(),
            metadata: Default::default(),
            context: None,
            created_at: now,
            updated_at: now,
            embedding: None,
        }
    }

    #[test]
    fn test_insert_get_tombstone() {
        let coll = Collection::new(MemoryCategory::Global);
        let memory = item("hello");
        let id = memory.id;
        coll.insert(memory, "h1".into());

        assert_eq!(coll.get(id).unwrap().content, "hello");
        assert!(coll.tombstone(id));
        assert!(coll.get(id).is_none());
        // Second tombstone is a no-op.
        assert!(!coll.tombstone(id));
    }

    #[test]
    fn test_dedup_window() {
        let coll = Collection::new(MemoryCategory::Global);
        let memory = item("same content");
        let id = memory.id;
        coll.insert(memory, "hash-a".into());

        let now = now_ms();
        assert_eq!(coll.dedup_hit("hash-a", 1000, now), Some(id));
        // Outside the window the hash no longer matches.
        assert_eq!(coll.dedup_hit("hash-a", 1000, now + 5000), None);
        assert_eq!(coll.dedup_hit("other", 1000, now), None);
    }

    #[test]
    fn test_tombstone_releases_hash() {
        let coll = Collection::new(MemoryCategory::Global);
        let memory = item("ephemeral");
        let id = memory.id;
        coll.insert(memory, "hash-b".into());
        coll.tombstone(id);
        assert_eq!(coll.dedup_hit("hash-b", i64::MAX / 2, now_ms()), None);
    }

    #[test]
    fn test_matching_skips_tombstones() {
        let coll = Collection::new(MemoryCategory::Global);
        let keep = item("keep");
        let drop_me = item("drop");
        let drop_id = drop_me.id;
        coll.insert(keep, "h-keep".into());
        coll.insert(drop_me, "h-drop".into());
        coll.tombstone(drop_id);

        let found = coll.matching(|_| true);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].content, "keep");
    }
}
