use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use haven_core::AgentId;
use serde::Deserialize;
use tracing::warn;

use crate::vector::{centroid, cosine_similarity};
use crate::{AgentClassifier, AgentPrediction, EmbeddingModel};

#[derive(Debug, Deserialize)]
struct LabeledExample {
    text: String,
    agent: String,
}

/// Nearest-centroid router over a labelled utterance set.
#[derive(Clone)]
pub struct CentroidAgentClassifier {
    model_name: &'static str,
    // priority order, so a strict `>` scan resolves ties to the earlier agent
    centroids: Vec<(AgentId, Vec<f32>)>,
    embedder: Arc<dyn EmbeddingModel>,
}

impl CentroidAgentClassifier {
    /// Reads one `{"text": .., "agent": ..}` object per line.
    pub fn from_jsonl(
        path: impl AsRef<Path>,
        embedder: Arc<dyn EmbeddingModel>,
        model_name: &'static str,
    ) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref()).with_context(|| {
            format!(
                "failed reading agent training dataset at {}",
                path.as_ref().display()
            )
        })?;

        let mut examples = Vec::new();
        for (idx, line) in raw
            .lines()
            .map(str::trim)
            .enumerate()
            .filter(|(_, line)| !line.is_empty())
        {
            let example: LabeledExample = serde_json::from_str(line)
                .with_context(|| format!("invalid jsonl training line {}", idx + 1))?;
            match AgentId::parse(&example.agent) {
                Some(agent) => examples.push((example.text, agent)),
                None => warn!(line = idx + 1, label = %example.agent, "unknown agent label skipped"),
            }
        }

        Self::from_examples(&examples, embedder, model_name)
    }

    pub fn from_examples(
        examples: &[(String, AgentId)],
        embedder: Arc<dyn EmbeddingModel>,
        model_name: &'static str,
    ) -> Result<Self> {
        let mut by_agent: BTreeMap<usize, (AgentId, Vec<Vec<f32>>)> = BTreeMap::new();
        for (text, agent) in examples {
            by_agent
                .entry(agent.priority_rank())
                .or_insert_with(|| (*agent, Vec::new()))
                .1
                .push(embedder.embed(text));
        }

        let centroids = by_agent
            .into_values()
            .filter(|(_, vectors)| !vectors.is_empty())
            .map(|(agent, vectors)| (agent, centroid(&vectors)))
            .collect::<Vec<_>>();

        if centroids.is_empty() {
            anyhow::bail!("training dataset produced zero agent centroids");
        }

        Ok(Self {
            model_name,
            centroids,
            embedder,
        })
    }

    pub fn agents(&self) -> Vec<AgentId> {
        self.centroids.iter().map(|(agent, _)| *agent).collect()
    }
}

impl AgentClassifier for CentroidAgentClassifier {
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
            model: self.model_name,
        }
    }
}
