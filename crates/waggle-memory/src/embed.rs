//! Pluggable text embedders.
//!
//! The store only needs `dim()` and `embed()`; the production deployment
//! plugs an ONNX sentence model in behind the same trait. The default
//! [`NgramEmbedder`] is fully deterministic and dependency-free: character
//! trigrams are feature-hashed into a fixed-width vector and L2-normalized,
//! which is enough for stable cosine ranking in tests and air-gapped setups.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors raised by an embedder.
#[derive(Debug, Clone, Error)]
pub enum EmbedError {
    #[error("embedder unavailable: {0}")]
    Unavailable(String),

    #[error("embedding failed: {0}")]
    Failed(String),
}

/// A text embedder producing fixed-dimension vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Output dimension. Every collection stores vectors of this width.
    fn dim(&self) -> usize;

    /// Embed one text. Implementations may suspend on I/O.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;
}

/// Deterministic character-trigram feature-hashing embedder.
#[derive(Debug, Clone)]
pub struct NgramEmbedder {
    dim: usize,
}

/// Default vector width for the built-in embedder.
pub const DEFAULT_DIM: usize = 256;

impl NgramEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }

    /// Bucket and sign for one trigram, derived from its sha-256 digest so
    /// the projection is stable across processes and platforms.
    fn project(&self, gram: &[u8]) -> (usize, f32) {
        let digest = Sha256::digest(gram);
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_le_bytes(raw) % self.dim as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        (bucket, sign)
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        let lowered = text.to_lowercase();
        let bytes = lowered.as_bytes();
        if bytes.len() < 3 {
            // Degenerate input still gets a stable non-zero vector.
            let (bucket, sign) = self.project(bytes);
            vector[bucket] = sign;
            return vector;
        }
        for gram in bytes.windows(3) {
            let (bucket, sign) = self.project(gram);
            vector[bucket] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Default for NgramEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIM)
    }
}

#[async_trait]
impl Embedder for NgramEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        Ok(self.embed_sync(text))
    }
}

/// An embedder that always fails. Lets tests drive the degraded search path.
#[derive(Debug, Clone, Default)]
pub struct FailingEmbedder {
    dim: usize,
}

#[async_trait]
impl Embedder for FailingEmbedder {
    fn dim(&self) -> usize {
        if self.dim == 0 { DEFAULT_DIM } else { self.dim }
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedError> {
        Err(EmbedError::Unavailable("embedder offline".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deterministic() {
        let embedder = NgramEmbedder::default();
        let a = embedder.embed("postgres replication lag").await.unwrap();
        let b = embedder.embed("postgres replication lag").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), DEFAULT_DIM);
    }

    #[tokio::test]
    async fn test_normalized() {
        let embedder = NgramEmbedder::default();
        let v = embedder.embed("some moderately long input text").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_similar_texts_closer_than_dissimilar() {
        let embedder = NgramEmbedder::default();
        let base = embedder.embed("database backup failed on host alpha").await.unwrap();
        let near = embedder.embed("database backup failed on host beta").await.unwrap();
        let far = embedder.embed("zzz qqq xxw unrelated noise").await.unwrap();

        let dot = |a: &[f32], b: &[f32]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
        assert!(dot(&base, &near) > dot(&base, &far));
    }

    #[tokio::test]
    async fn test_short_input_is_stable() {
        let embedder = NgramEmbedder::default();
        let a = embedder.embed("ab").await.unwrap();
        let b = embedder.embed("ab").await.unwrap();
        assert_eq!(a, b);
        assert!(a.iter().any(|v| *v != 0.0));
    }
}
