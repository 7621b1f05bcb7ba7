use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ConstraintError, RegionPathError};
use crate::geo::haversine_km;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionId(pub i64);

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(pub i64);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Administrative level of a region. The derived ordering is the nesting
/// order: a Country contains Provinces, a Province contains Counties, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RegionType {
    Country,
    Province,
    County,
    City,
}

impl RegionType {
    pub const ALL: [RegionType; 4] = [
        RegionType::Country,
        RegionType::Province,
        RegionType::County,
        RegionType::City,
    ];

    pub fn depth(self) -> usize {
        match self {
            Self::Country => 0,
            Self::Province => 1,
            Self::County => 2,
            Self::City => 3,
        }
    }

    pub fn from_depth(depth: usize) -> Option<Self> {
        Self::ALL.get(depth).copied()
    }

    /// The type a parent must have for a region of this type.
    pub fn parent_type(self) -> Option<Self> {
        self.depth()
            .checked_sub(1)
            .and_then(Self::from_depth)
    }

    pub fn child_type(self) -> Option<Self> {
        Self::from_depth(self.depth() + 1)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Country => "Country",
            Self::Province => "Province",
            Self::County => "County",
            Self::City => "City",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "country" => Some(Self::Country),
            "province" | "state" => Some(Self::Province),
            "county" | "district" => Some(Self::County),
            "city" | "town" => Some(Self::City),
            _ => None,
        }
    }
}

impl fmt::Display for RegionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: RegionId,
    pub name: String,
    pub region_type: RegionType,
    pub parent_id: Option<RegionId>,
}

/// Checks that a region of `region_type` may hang below `parent`.
///
/// `parent_id` is what the caller asked for and `parent` is what the store
/// found for it, so a requested but missing parent is reported as such.
pub fn validate_placement(
    region_type: RegionType,
    parent_id: Option<RegionId>,
    parent: Option<&Region>,
) -> Result<(), ConstraintError> {
    match (region_type.parent_type(), parent_id) {
        (None, Some(parent)) => Err(ConstraintError::CountryWithParent { parent }),
        (None, None) => Ok(()),
        (Some(_), None) => Err(ConstraintError::MissingParent { region_type }),
        (Some(expected), Some(parent_id)) => {
            let Some(parent) = parent else {
                return Err(ConstraintError::ParentNotFound(parent_id));
            };
            if parent.region_type != expected {
                return Err(ConstraintError::ParentTypeMismatch {
                    child: region_type,
                    parent: parent.region_type,
                    expected,
                });
            }
            Ok(())
        }
    }
}

/// Region and service names match ASCII-case-insensitively after trimming.
pub fn names_match(lhs: &str, rhs: &str) -> bool {
    lhs.trim().eq_ignore_ascii_case(rhs.trim())
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        let valid = latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude);
        valid.then_some(Self {
            latitude,
            longitude,
        })
    }

    pub fn distance_km(&self, other: &Coordinates) -> f64 {
        haversine_km(self, other)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    pub description: String,
    pub region_id: RegionId,
    pub address: String,
    pub coordinates: Option<Coordinates>,
    pub service_type: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A service as submitted for insertion, before the catalog assigns an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewService {
    pub name: String,
    pub description: String,
    pub region_id: RegionId,
    pub address: String,
    pub coordinates: Option<Coordinates>,
    pub service_type: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
}

impl NewService {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        region_id: RegionId,
        address: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into().trim().to_string(),
            description: description.into(),
            region_id,
            address: address.into(),
            coordinates: None,
            service_type: None,
            phone: None,
            website: None,
        }
    }

    pub fn with_coordinates(mut self, coordinates: Option<Coordinates>) -> Self {
        self.coordinates = coordinates;
        self
    }

    pub fn with_service_type(mut self, service_type: Option<String>) -> Self {
        self.service_type = service_type;
        self
    }

    pub fn into_service(self, id: ServiceId, created_at: DateTime<Utc>) -> Service {
        Service {
            id,
            name: self.name,
            description: self.description,
            region_id: self.region_id,
            address: self.address,
            coordinates: self.coordinates,
            service_type: self.service_type,
            phone: self.phone,
            website: self.website,
            created_at,
        }
    }
}

/// Non-empty, gap-free chain of region names starting at a Country.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionPath {
    names: Vec<String>,
}

impl RegionPath {
    /// Builds a path from up to four optional level names, Country first.
    /// Blank entries are allowed only after the last named level.
    pub fn from_levels<S: AsRef<str>>(levels: &[Option<S>]) -> Result<Self, RegionPathError> {
        if levels.len() > RegionType::ALL.len() {
            return Err(RegionPathError::TooDeep(levels.len()));
        }

        let cleaned = levels
            .iter()
            .map(|level| {
                level
                    .as_ref()
                    .map(|name| name.as_ref().trim())
                    .filter(|name| !name.is_empty())
            })
            .collect::<Vec<_>>();

        let depth = cleaned.iter().take_while(|name| name.is_some()).count();
        if depth == 0 {
            return Err(RegionPathError::Empty);
        }
        if let Some(offset) = cleaned[depth..].iter().position(Option::is_some) {
            let missing = RegionType::from_depth(depth).unwrap_or(RegionType::City);
            let found = RegionType::from_depth(depth + offset).unwrap_or(RegionType::City);
            return Err(RegionPathError::Gap { missing, found });
        }

        Ok(Self {
            names: cleaned
                .into_iter()
                .flatten()
                .map(ToString::to_string)
                .collect(),
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn leaf_type(&self) -> RegionType {
        RegionType::from_depth(self.names.len().saturating_sub(1)).unwrap_or(RegionType::City)
    }

    /// Levels paired with their region type, root first.
    pub fn levels(&self) -> impl Iterator<Item = (RegionType, &str)> {
        RegionType::ALL
            .into_iter()
            .zip(self.names.iter().map(String::as_str))
    }
}

impl fmt::Display for RegionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names.join(" > "))
    }
}

/// The specialized conversational agents a message can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentId {
    AutismSupport,
    GeneralDiscussion,
    SelfHarmSupport,
    LocalServices,
}

impl AgentId {
    /// Tie-break order, highest priority first.
    pub const PRIORITY: [AgentId; 4] = [
        AgentId::SelfHarmSupport,
        AgentId::LocalServices,
        AgentId::AutismSupport,
        AgentId::GeneralDiscussion,
    ];

    pub const FALLBACK: AgentId = AgentId::GeneralDiscussion;

    /// Lower rank wins a tie.
    pub fn priority_rank(self) -> usize {
        Self::PRIORITY
            .iter()
            .position(|agent| *agent == self)
            .unwrap_or(Self::PRIORITY.len())
    }

    pub fn as_code(self) -> &'static str {
        match self {
            Self::AutismSupport => "autism_support",
            Self::GeneralDiscussion => "general_discussion",
            Self::SelfHarmSupport => "self_harm_support",
            Self::LocalServices => "local_services",
        }
    }

    /// Accepts the snake_case codes as well as the short labels used by
    /// older training files ("rag", "normal", "filter", "service").
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "autism_support" | "autism" | "rag" => Some(Self::AutismSupport),
            "general_discussion" | "general" | "normal" => Some(Self::GeneralDiscussion),
            "self_harm_support" | "self_harm" | "filter" => Some(Self::SelfHarmSupport),
            "local_services" | "service" | "services" => Some(Self::LocalServices),
            _ => None,
        }
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(id: i64, region_type: RegionType) -> Region {
        Region {
            id: RegionId(id),
            name: format!("r{id}"),
            region_type,
            parent_id: None,
        }
    }

    #[test]
    fn region_types_step_one_level() {
        assert_eq!(RegionType::Country.parent_type(), None);
        assert_eq!(RegionType::City.parent_type(), Some(RegionType::County));
        assert_eq!(RegionType::Province.child_type(), Some(RegionType::County));
        assert_eq!(RegionType::City.child_type(), None);
        assert!(RegionType::Country < RegionType::City);
    }

    #[test]
    fn placement_rejects_skipped_levels() {
        let country = region(1, RegionType::Country);
        let err = validate_placement(RegionType::City, Some(RegionId(1)), Some(&country))
            .expect_err("city under country must fail");
        assert_eq!(
            err,
            ConstraintError::ParentTypeMismatch {
                child: RegionType::City,
                parent: RegionType::Country,
                expected: RegionType::County,
            }
        );
        assert!(validate_placement(RegionType::Province, Some(RegionId(1)), Some(&country)).is_ok());
    }

    #[test]
    fn placement_reports_missing_and_unexpected_parents() {
        assert_eq!(
            validate_placement(RegionType::Country, Some(RegionId(4)), None),
            Err(ConstraintError::CountryWithParent {
                parent: RegionId(4)
            })
        );
        assert_eq!(
            validate_placement(RegionType::County, None, None),
            Err(ConstraintError::MissingParent {
                region_type: RegionType::County
            })
        );
        assert_eq!(
            validate_placement(RegionType::County, Some(RegionId(9)), None),
            Err(ConstraintError::ParentNotFound(RegionId(9)))
        );
    }

    #[test]
    fn region_path_accepts_trailing_blanks_only() {
        let path = RegionPath::from_levels(&[Some("CA"), Some(" BC "), None, Some("")])
            .expect("prefix path");
        assert_eq!(path.names(), ["CA", "BC"]);
        assert_eq!(path.leaf_type(), RegionType::Province);

        let gap = RegionPath::from_levels(&[Some("CA"), None, Some("Fraser Valley"), None]);
        assert_eq!(
            gap,
            Err(RegionPathError::Gap {
                missing: RegionType::Province,
                found: RegionType::County
            })
        );

        let empty: Result<RegionPath, _> = RegionPath::from_levels::<&str>(&[None, None]);
        assert_eq!(empty, Err(RegionPathError::Empty));
    }

    #[test]
    fn coordinates_are_range_checked() {
        assert!(Coordinates::new(49.28, -123.12).is_some());
        assert!(Coordinates::new(91.0, 0.0).is_none());
        assert!(Coordinates::new(0.0, f64::NAN).is_none());
    }

    #[test]
    fn agent_labels_parse_legacy_names() {
        assert_eq!(AgentId::parse("filter"), Some(AgentId::SelfHarmSupport));
        assert_eq!(AgentId::parse("Local_Services"), Some(AgentId::LocalServices));
        assert_eq!(AgentId::parse("weather"), None);
        assert!(AgentId::SelfHarmSupport.priority_rank() < AgentId::LocalServices.priority_rank());
    }
}
