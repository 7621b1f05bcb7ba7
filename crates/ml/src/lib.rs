mod centroid;
mod fallback;
mod vector;
mod vote;

#[cfg(feature = "burn-ml")]
mod burn_impl;

use std::env;
use std::path::Path;
use std::sync::Arc;

use haven_core::{score_agents, AgentId};
use serde::Serialize;
use tracing::{info, warn};

pub use centroid::CentroidAgentClassifier;
pub use fallback::HashEmbeddingModel;
pub use vote::MajorityVoteClassifier;

#[cfg(feature = "burn-ml")]
pub use burn_impl::{BurnHashEmbeddingModel, BurnKeywordAgentClassifier};

pub const DEFAULT_AGENT_DATASET: &str = "data/training/agents.jsonl";

pub trait EmbeddingModel: Send + Sync {
    fn model_name(&self) -> &'static str;
    fn embed(&self, text: &str) -> Vec<f32>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentPrediction {
    pub agent: AgentId,
    pub confidence: f32,
    pub model: &'static str,
}

pub trait AgentClassifier: Send + Sync {
    fn predict(&self, text: &str) -> AgentPrediction;

    fn classify(&self, text: &str) -> AgentId {
        self.predict(text).agent
    }
}

/// Keyword classifier over the shared rule table. Confidence grows with the
/// number of matched patterns and with how much of the total match mass the
/// winning agent holds.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleAgentClassifier;

impl AgentClassifier for RuleAgentClassifier {
    fn predict(&self, text: &str) -> AgentPrediction {
        let scores = score_agents(text);
        let Some((agent, best)) = scores.best() else {
            return AgentPrediction {
                agent: AgentId::FALLBACK,
                confidence: 0.0,
                model: "rules",
            };
        };

        let best = best as f32;
        let share = best / scores.total() as f32;
        let saturation = (0.6 + 0.2 * best).min(1.0);

        AgentPrediction {
            agent,
            confidence: (saturation * (0.5 + 0.5 * share)).clamp(0.0, 1.0),
            model: "rules",
        }
    }
}

#[derive(Clone)]
pub struct HavenMlStack {
    pub embedder: Arc<dyn EmbeddingModel>,
    pub classifier: Arc<dyn AgentClassifier>,
    pub burn_enabled: bool,
}

impl HavenMlStack {
    /// Rules only. Used by tests and when no dataset is configured.
    pub fn rules_only() -> Self {
        Self {
            embedder: Arc::new(HashEmbeddingModel::new(192)),
            classifier: Arc::new(RuleAgentClassifier),
            burn_enabled: false,
        }
    }

    /// Trains against `HAVEN_AGENT_DATASET`, or `DEFAULT_AGENT_DATASET`
    /// relative to the working directory.
    pub fn load_default() -> Self {
        let dataset_path = env::var("HAVEN_AGENT_DATASET")
            .unwrap_or_else(|_| DEFAULT_AGENT_DATASET.to_string());
        Self::from_dataset(&dataset_path)
    }

    /// Rules voting with centroids trained from `dataset_path`. A missing or
    /// unreadable dataset leaves the rules (or the burn keyword model) alone.
    pub fn from_dataset(dataset_path: &str) -> Self {
        #[cfg(feature = "burn-ml")]
        {
            let embedder = Arc::new(burn_impl::BurnHashEmbeddingModel::new(192));
            let classifier = load_centroid(dataset_path, embedder.clone(), "burn-centroid-agent")
                .unwrap_or_else(|| Arc::new(burn_impl::BurnKeywordAgentClassifier::new(192)));
            return Self {
                embedder,
                classifier,
                burn_enabled: true,
            };
        }

        #[cfg(not(feature = "burn-ml"))]
        {
            let embedder = Arc::new(HashEmbeddingModel::new(192));
            let classifier = load_centroid(dataset_path, embedder.clone(), "hash-centroid-agent")
                .unwrap_or_else(|| Arc::new(RuleAgentClassifier));
            Self {
                embedder,
                classifier,
                burn_enabled: false,
            }
        }
    }
}

/// Centroid model trained from `dataset_path`, voting alongside the rules.
fn load_centroid(
    dataset_path: &str,
    embedder: Arc<dyn EmbeddingModel>,
    model_name: &'static str,
) -> Option<Arc<dyn AgentClassifier>> {
    if !Path::new(dataset_path).exists() {
        info!(dataset = dataset_path, "agent dataset missing, using keyword rules");
        return None;
    }

    match CentroidAgentClassifier::from_jsonl(dataset_path, embedder, model_name) {
        Ok(centroid) => {
            info!(dataset = dataset_path, agents = ?centroid.agents(), "agent centroids loaded");
            let ensemble = MajorityVoteClassifier::new(vec![
                Arc::new(RuleAgentClassifier) as Arc<dyn AgentClassifier>,
                Arc::new(centroid),
            ]);
            Some(Arc::new(ensemble))
        }
        Err(err) => {
            warn!(dataset = dataset_path, error = %err, "agent dataset rejected, using keyword rules");
            None
        }
    }
}
