use once_cell::sync::Lazy;
use regex::RegexSet;

use crate::models::AgentId;
use crate::text::normalize_for_matching;

static SELF_HARM_PATTERNS: &[&str] = &[
    r"\bhurt(ing)? myself\b",
    r"\bharm(ing)? myself\b",
    r"\bself[- ]?harm",
    r"\bkill(ing)? myself\b",
    r"\bsuicid",
    r"\bend(ing)? (it all|my life)\b",
    r"\bwant(ed)? to die\b",
    r"\bcutting myself\b",
    r"\bcan(not|'t)? do this anymore\b",
    r"\bnothing (feels|is) worth\b",
    r"\bnot worth living\b",
    r"\bno reason to live\b",
    r"\bfeel(ing)? (really |so |very )?low\b",
    r"\bcoping strateg",
    r"\bsomeone to talk to\b",
];

static LOCAL_SERVICES_PATTERNS: &[&str] = &[
    r"\bnear me\b",
    r"\bnearby\b",
    r"\bnearest\b",
    r"\bclosest\b",
    r"\bin my (area|city|town|region|neighbou?rhood)\b",
    r"\bwhere can i (find|get|go)\b",
    r"\btherapists?\b",
    r"\bdentists?\b",
    r"\bclinics?\b",
    r"\bhotlines?\b",
    r"\bsupport groups?\b",
    r"\bservices?\b",
    r"\baccommodations?\b",
    r"\brecommendations?\b",
    r"\bappointments?\b",
    r"\baddress(es)?\b",
];

static AUTISM_PATTERNS: &[&str] = &[
    r"\bautis",
    r"\basd\b",
    r"\bsensory\b",
    r"\bstim(ming)?\b",
    r"\bmeltdowns?\b",
    r"\bshutdowns?\b",
    r"\beye contact\b",
    r"\bsarcasm\b",
    r"\bmask(ing)?\b",
    r"\bpretend to be normal\b",
    r"\bneurodiverg",
    r"\bspecial interests?\b",
    r"\bsocial cues?\b",
    r"\bdiagnos",
];

static GENERAL_PATTERNS: &[&str] = &[
    r"^(hi|hey|hello|yo)\b",
    r"\bwhat'?s up\b",
    r"\bhow are you\b",
    r"\bfun fact\b",
    r"\bweather\b",
    r"\bmovies?\b",
    r"\bjokes?\b",
    r"\brandom question\b",
];

static RULES: Lazy<Vec<(AgentId, RegexSet)>> = Lazy::new(|| {
    [
        (AgentId::SelfHarmSupport, SELF_HARM_PATTERNS),
        (AgentId::LocalServices, LOCAL_SERVICES_PATTERNS),
        (AgentId::AutismSupport, AUTISM_PATTERNS),
        (AgentId::GeneralDiscussion, GENERAL_PATTERNS),
    ]
    .into_iter()
    .map(|(agent, patterns)| {
        let set = RegexSet::new(patterns).expect("valid agent routing patterns");
        (agent, set)
    })
    .collect()
});

/// Number of distinct rule patterns each agent matched, in priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentScores {
    scores: Vec<(AgentId, usize)>,
}

impl AgentScores {
    pub fn get(&self, agent: AgentId) -> usize {
        self.scores
            .iter()
            .find(|(candidate, _)| *candidate == agent)
            .map(|(_, score)| *score)
            .unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.scores.iter().map(|(_, score)| score).sum()
    }

    /// Highest-scoring agent; ties go to the higher-priority agent.
    pub fn best(&self) -> Option<(AgentId, usize)> {
        self.scores
            .iter()
            .copied()
            .filter(|(_, score)| *score > 0)
            .min_by_key(|(agent, score)| (std::cmp::Reverse(*score), agent.priority_rank()))
    }
}

pub fn score_agents(text: &str) -> AgentScores {
    let normalized = normalize_for_matching(text);
    let scores = RULES
        .iter()
        .map(|(agent, set)| (*agent, set.matches(&normalized).iter().count()))
        .collect();

    AgentScores { scores }
}

/// Keyword routing. `None` means no rule matched at all.
pub fn classify_agent_rules(text: &str) -> Option<AgentId> {
    score_agents(text).best().map(|(agent, _)| agent)
}
