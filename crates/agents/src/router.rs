use std::env;
use std::sync::Arc;

use haven_core::{normalize_text, AgentId};
use haven_ml::{AgentClassifier, HavenMlStack, RuleAgentClassifier};
use serde::Serialize;
use tracing::debug;

pub const DEFAULT_ROUTER_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingDecision {
    pub agent: AgentId,
    pub confidence: f32,
    pub model: &'static str,
    /// The classifier was not confident enough and the fallback agent was used.
    pub fell_back: bool,
}

/// Maps one utterance to exactly one agent. Never fails: empty input and
/// low-confidence predictions go to `AgentId::FALLBACK`.
#[derive(Clone)]
pub struct AgentRouter {
    classifier: Arc<dyn AgentClassifier>,
    threshold: f32,
}

impl AgentRouter {
    pub fn new(classifier: Arc<dyn AgentClassifier>, threshold: f32) -> Self {
        Self {
            classifier,
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    pub fn rules() -> Self {
        Self::new(Arc::new(RuleAgentClassifier), DEFAULT_ROUTER_THRESHOLD)
    }

    pub fn from_stack(stack: &HavenMlStack, threshold: f32) -> Self {
        Self::new(stack.classifier.clone(), threshold)
    }

    /// `HAVEN_ROUTER_THRESHOLD`, or the default when unset or not in [0, 1].
    pub fn threshold_from_env() -> f32 {
        env::var("HAVEN_ROUTER_THRESHOLD")
            .ok()
            .and_then(|raw| raw.parse::<f32>().ok())
            .filter(|value| (0.0..=1.0).contains(value))
            .unwrap_or(DEFAULT_ROUTER_THRESHOLD)
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn route(&self, text: &str) -> RoutingDecision {
        let normalized = normalize_text(text);
        if normalized.is_empty() {
            return RoutingDecision {
                agent: AgentId::FALLBACK,
                confidence: 0.0,
                model: "empty-input",
                fell_back: true,
            };
        }

        let prediction = self.classifier.predict(&normalized);
        let fell_back = prediction.confidence < self.threshold;
        debug!(
            predicted = prediction.agent.as_code(),
            confidence = prediction.confidence,
            model = prediction.model,
            fell_back,
            "utterance classified"
        );

        RoutingDecision {
            agent: if fell_back {
                AgentId::FALLBACK
            } else {
                prediction.agent
            },
            confidence: prediction.confidence,
            model: prediction.model,
            fell_back,
        }
    }
}

#[cfg(test)]
mod tests {
    use haven_ml::AgentPrediction;

    use super::*;

    struct Unsure;

    impl AgentClassifier for Unsure {
        fn predict(&self, _text: &str) -> AgentPrediction {
            AgentPrediction {
                agent: AgentId::AutismSupport,
                confidence: 0.3,
                model: "unsure",
            }
        }
    }

    #[test]
    fn routes_deterministically() {
        let router = AgentRouter::rules();
        for _ in 0..3 {
            assert_eq!(
                router.route("I keep thinking about hurting myself.").agent,
                AgentId::SelfHarmSupport
            );
            assert_eq!(
                router.route("Where can I find a therapist near me?").agent,
                AgentId::LocalServices
            );
        }
    }

    fn shipped_stack() -> HavenMlStack {
        HavenMlStack::from_dataset(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../../data/training/agents.jsonl"
        ))
    }

    #[test]
    fn trained_stack_keeps_clear_rule_matches() {
        let router = AgentRouter::from_stack(&shipped_stack(), DEFAULT_ROUTER_THRESHOLD);

        for (text, expected) in [
            ("I want to end my life", AgentId::SelfHarmSupport),
            ("I've been cutting myself again", AgentId::SelfHarmSupport),
            ("I keep thinking about hurting myself.", AgentId::SelfHarmSupport),
            ("I think my son might be autistic", AgentId::AutismSupport),
            ("Where can I find a therapist near me?", AgentId::LocalServices),
        ] {
            let decision = router.route(text);
            assert_eq!(decision.agent, expected, "{text}: {decision:?}");
            assert!(!decision.fell_back, "{text}: {decision:?}");
            assert_eq!(decision.model, "majority-vote");
        }
    }

    #[test]
    fn low_confidence_falls_back() {
        let router = AgentRouter::new(Arc::new(Unsure), DEFAULT_ROUTER_THRESHOLD);
        let decision = router.route("is this about autism?");
        assert_eq!(decision.agent, AgentId::GeneralDiscussion);
        assert!(decision.fell_back);
        assert_eq!(decision.model, "unsure");

        let lenient = AgentRouter::new(Arc::new(Unsure), 0.2);
        assert_eq!(lenient.route("anything").agent, AgentId::AutismSupport);
    }

    #[test]
    fn empty_and_unmatched_input_fall_back() {
        let router = AgentRouter::rules();
        assert!(router.route("   \n").fell_back);
        let decision = router.route("qwerty");
        assert_eq!(decision.agent, AgentId::GeneralDiscussion);
        assert!(decision.fell_back);
    }
}
