use thiserror::Error;

use crate::models::{RegionId, RegionType};

/// A single insert or removal broke the region tree's referential rules.
/// The offending write never happens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConstraintError {
    #[error("country regions cannot have a parent (got parent {parent})")]
    CountryWithParent { parent: RegionId },
    #[error("{region_type} regions require a parent region")]
    MissingParent { region_type: RegionType },
    #[error("parent region {0} does not exist")]
    ParentNotFound(RegionId),
    #[error("a {child} cannot be placed under a {parent}; expected a {expected} parent")]
    ParentTypeMismatch {
        child: RegionType,
        parent: RegionType,
        expected: RegionType,
    },
    #[error("region {0} does not exist")]
    RegionNotFound(RegionId),
    #[error("region name must not be blank")]
    BlankName,
    #[error("service name must not be blank")]
    BlankServiceName,
    #[error("region {region} still has {child_regions} child regions and {services} services")]
    RegionHasDependents {
        region: RegionId,
        child_regions: usize,
        services: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegionPathError {
    #[error("region path is empty")]
    Empty,
    #[error("region path has {0} levels, at most 4 are supported")]
    TooDeep(usize),
    #[error("region path names a {found} but no {missing}")]
    Gap {
        missing: RegionType,
        found: RegionType,
    },
}
