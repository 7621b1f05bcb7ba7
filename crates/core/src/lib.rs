pub mod error;
pub mod geo;
pub mod models;
pub mod routing;
pub mod text;

pub use error::{ConstraintError, RegionPathError};
pub use geo::haversine_km;
pub use models::*;
pub use routing::{classify_agent_rules, score_agents, AgentScores};
pub use text::{normalize_for_matching, normalize_text, tokenize};
