//! Offline embedder based on feature hashing.

use async_trait::async_trait;
use companion_protocol::{CompanionError, CompanionResult, EmbeddingPort};

pub const DEFAULT_DIMENSION: usize = 384;

/// Character unigram and bigram features hashed into a fixed number of
/// buckets with `blake3`, signed, then L2-normalized. Works on CJK text
/// without a tokenizer. Empty input yields the zero vector.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    model: String,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> CompanionResult<Self> {
        if dimension == 0 {
            return Err(CompanionError::invalid_input(
                "embedding dimension must be positive",
            ));
        }
        Ok(Self {
            dimension,
            model: format!("hashing-bigram-{dimension}"),
        })
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimension];
        let chars: Vec<char> = text
            .to_lowercase()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();

        let mut buf = [0_u8; 8];
        for (position, c) in chars.iter().enumerate() {
            self.accumulate(&mut vector, c.encode_utf8(&mut buf).as_bytes(), 1.0);
            if let Some(next) = chars.get(position + 1) {
                let bigram: String = [*c, *next].iter().collect();
                self.accumulate(&mut vector, bigram.as_bytes(), 1.5);
            }
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }

    fn accumulate(&self, vector: &mut [f32], feature: &[u8], weight: f32) {
        let hash = blake3::hash(feature);
        let bytes = hash.as_bytes();
        let mut bucket = [0_u8; 8];
        bucket.copy_from_slice(&bytes[..8]);
        let slot = (u64::from_le_bytes(bucket) % self.dimension as u64) as usize;
        let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[slot] += sign * weight;
    }
}

#[async_trait]
impl EmbeddingPort for HashingEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> CompanionResult<Vec<f32>> {
        Ok(self.embed_sync(text))
    }
}
