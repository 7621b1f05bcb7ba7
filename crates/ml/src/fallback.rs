use haven_core::tokenize;

use crate::vector::normalize;
use crate::EmbeddingModel;

/// Feature-hashing bag of words. Deterministic and dependency free, good
/// enough for nearest-centroid routing over short utterances.
#[derive(Debug, Clone)]
pub struct HashEmbeddingModel {
    dims: usize,
}

impl HashEmbeddingModel {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(32) }
    }
}

impl EmbeddingModel for HashEmbeddingModel {
    fn model_name(&self) -> &'static str {
        "hash-fallback"
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0_f32; self.dims];

        for token in tokenize(text) {
            let hash = fxhash(token.as_bytes());
            let index = (hash as usize) % self.dims;
            let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
            vec[index] += sign;
        }

        normalize(&mut vec);
        vec
    }
}

fn fxhash(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
