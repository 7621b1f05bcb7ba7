use burn::tensor::TensorData;
use haven_core::{tokenize, AgentId};

use crate::vector::{cosine_similarity, normalize};
use crate::{AgentClassifier, AgentPrediction, EmbeddingModel};

#[derive(Debug, Clone)]
pub struct BurnHashEmbeddingModel {
    dims: usize,
}

impl BurnHashEmbeddingModel {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(32) }
    }
}

impl EmbeddingModel for BurnHashEmbeddingModel {
    fn model_name(&self) -> &'static str {
        "burn-hash-embed-v1"
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0_f32; self.dims];

        for token in tokenize(text) {
            let hash = rolling_hash(token.as_bytes());
            let index = (hash as usize) % self.dims;
            let value = (((hash >> 8) & 0xF) as f32 / 8.0) - 1.0;
            vec[index] += value;
        }

        normalize(&mut vec);

        let data = TensorData::new(vec, [self.dims]);
        data.to_vec::<f32>().unwrap_or_else(|_| vec![0.0; self.dims])
    }
}

/// Centroids seeded from fixed keyword descriptions of each agent, for
/// deployments that ship without a training dataset.
#[derive(Debug, Clone)]
pub struct BurnKeywordAgentClassifier {
    embedder: BurnHashEmbeddingModel,
    centroids: Vec<(AgentId, Vec<f32>)>,
}

impl BurnKeywordAgentClassifier {
    pub fn new(dims: usize) -> Self {
        let embedder = BurnHashEmbeddingModel::new(dims);
        let centroids = [
            (
                AgentId::SelfHarmSupport,
                "hurt myself self harm suicide want to die feel low nothing worth living",
            ),
            (
                AgentId::LocalServices,
                "near me nearby therapist dentist clinic hotline support group service address",
            ),
            (
                AgentId::AutismSupport,
                "autism autistic sensory overload stimming meltdown masking eye contact",
            ),
            (
                AgentId::GeneralDiscussion,
                "hi hello how are you weather movie joke fun fact",
            ),
        ]
        .into_iter()
        .map(|(agent, keywords)| (agent, embedder.embed(keywords)))
        .collect();

        Self {
            embedder,
            centroids,
        }
    }
}

impl AgentClassifier for BurnKeywordAgentClassifier {
    fn predict(&self, text: &str) -> AgentPrediction {
        let query = self.embedder.embed(text);

        let mut best_agent = AgentId::FALLBACK;
        let mut best_score = 0.0_f32;

        for (agent, center) in &self.centroids {
            let score = cosine_similarity(&query, center);
            if score > best_score {
                best_score = score;
                best_agent = *agent;
            }
        }

        AgentPrediction {
            agent: best_agent,
            confidence: best_score.clamp(0.0, 1.0),
            model: "burn-keyword-agent-v1",
        }
    }
}

fn rolling_hash(bytes: &[u8]) -> u64 {
    let mut hash = 0_u64;
    for byte in bytes {
        hash = hash.wrapping_mul(131).wrapping_add(*byte as u64);
    }
    hash
}
