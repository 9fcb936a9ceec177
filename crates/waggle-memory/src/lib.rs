//! # waggle-memory
//!
//! The collective memory store. One collection per category, each holding
//! content-addressed items with optional embeddings. Search is semantic
//! (cosine over the query embedding) with a keyword fallback when the
//! embedder is unavailable, and every predicate filter is applied before
//! ranking so pagination stays stable.

pub mod collection;
pub mod embed;
pub mod store;

pub use collection::Collection;
pub use embed::{EmbedError, Embedder, NgramEmbedder};
pub use store::{
    content_hash, MemoryError, MemoryEvent, MemoryStore, RecentRequest, SearchRequest,
    SharedMemoryStore, StoreRequest, DEDUP_WINDOW_MS,
};
