use std::sync::Arc;

use haven_core::AgentId;

use crate::{AgentClassifier, AgentPrediction};

/// Plurality vote over several classifiers. A voter with zero confidence
/// abstains. Equal vote counts go to the larger summed confidence, then to
/// agent priority.
///
/// The reported confidence is the strongest supporting vote, scaled by the
/// winner's share of all confidence cast, so a dissenting voter lowers it
/// without vetoing a confident match.
#[derive(Clone)]
pub struct MajorityVoteClassifier {
    voters: Vec<Arc<dyn AgentClassifier>>,
}

impl MajorityVoteClassifier {
    pub fn new(voters: Vec<Arc<dyn AgentClassifier>>) -> Self {
        Self { voters }
    }

    pub fn len(&self) -> usize {
        self.voters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voters.is_empty()
    }
}

impl AgentClassifier for MajorityVoteClassifier {
    fn predict(&self, text: &str) -> AgentPrediction {
        let mut tally = [Tally::default(); AgentId::PRIORITY.len()];
        let mut cast = 0.0_f32;

        for voter in &self.voters {
            let prediction = voter.predict(text);
            if prediction.confidence <= 0.0 {
                continue;
            }
            let confidence = prediction.confidence.min(1.0);
            let slot = &mut tally[prediction.agent.priority_rank()];
            slot.votes += 1;
            slot.summed += confidence;
            slot.strongest = slot.strongest.max(confidence);
            cast += confidence;
        }

        // ranks ascend, so keeping the first of equals favours priority
        let mut winner: Option<(usize, Tally)> = None;
        for (rank, slot) in tally.iter().enumerate().filter(|(_, slot)| slot.votes > 0) {
            let better = match &winner {
                None => true,
                Some((_, best)) => {
                    slot.votes > best.votes
                        || (slot.votes == best.votes && slot.summed > best.summed)
                }
            };
            if better {
                winner = Some((rank, *slot));
            }
        }

        match winner {
            Some((rank, slot)) => {
                let share = slot.summed / cast;
                AgentPrediction {
                    agent: AgentId::PRIORITY[rank],
                    confidence: (slot.strongest * (0.5 + 0.5 * share)).clamp(0.0, 1.0),
                    model: "majority-vote",
                }
            }
            None => AgentPrediction {
                agent: AgentId::FALLBACK,
                confidence: 0.0,
                model: "majority-vote",
            },
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    votes: usize,
    summed: f32,
    strongest: f32,
}
