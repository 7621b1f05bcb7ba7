use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use haven_core::{
    names_match, validate_placement, ConstraintError, Coordinates, NewService, Region, RegionId,
    RegionPath, RegionType, Service, ServiceId,
};
use parking_lot::RwLock;

use crate::{
    ImportWriter, RegionStore, RemovalPolicy, RemovalReport, RowCommit, RowWrite,
    ServiceCatalog, ServiceCommit, StoreResult,
};

/// In-process store. Every write takes the single write lock, so region
/// creation is serialized.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Default)]
struct MemoryState {
    regions: BTreeMap<RegionId, Region>,
    services: BTreeMap<ServiceId, Service>,
    last_region_id: i64,
    last_service_id: i64,
}

/// Id high-water marks taken before a multi-step write.
#[derive(Clone, Copy)]
struct Savepoint {
    last_region_id: i64,
    last_service_id: i64,
}

impl MemoryState {
    fn savepoint(&self) -> Savepoint {
        Savepoint {
            last_region_id: self.last_region_id,
            last_service_id: self.last_service_id,
        }
    }

    /// Drops everything inserted after `savepoint`. Ids only grow, so the
    /// inserted records are exactly those above the marks.
    fn rollback(&mut self, savepoint: Savepoint) {
        self.regions
            .retain(|id, _| id.0 <= savepoint.last_region_id);
        self.services
            .retain(|id, _| id.0 <= savepoint.last_service_id);
        self.last_region_id = savepoint.last_region_id;
        self.last_service_id = savepoint.last_service_id;
    }

    fn find_region(
        &self,
        name: &str,
        region_type: RegionType,
        parent_id: Option<RegionId>,
    ) -> Option<RegionId> {
        self.regions
            .values()
            .find(|region| {
                region.region_type == region_type
                    && region.parent_id == parent_id
                    && names_match(&region.name, name)
            })
            .map(|region| region.id)
    }

    fn insert_region(
        &mut self,
        name: &str,
        region_type: RegionType,
        parent_id: Option<RegionId>,
    ) -> Result<RegionId, ConstraintError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ConstraintError::BlankName);
        }

        let parent = parent_id.and_then(|id| self.regions.get(&id));
        validate_placement(region_type, parent_id, parent)?;

        if let Some(existing) = self.find_region(name, region_type, parent_id) {
            return Ok(existing);
        }

        self.last_region_id += 1;
        let id = RegionId(self.last_region_id);
        self.regions.insert(
            id,
            Region {
                id,
                name: name.to_string(),
                region_type,
                parent_id,
            },
        );
        Ok(id)
    }

    fn path(&self, region_id: RegionId) -> Result<Vec<Region>, ConstraintError> {
        let mut chain = Vec::new();
        let mut cursor = Some(region_id);

        while let Some(id) = cursor {
            let region = self
                .regions
                .get(&id)
                .ok_or(ConstraintError::RegionNotFound(id))?;
            cursor = region.parent_id;
            chain.push(region.clone());
        }

        chain.reverse();
        Ok(chain)
    }

    fn descendants(&self, region_id: RegionId) -> BTreeSet<RegionId> {
        let mut found = BTreeSet::new();
        if !self.regions.contains_key(&region_id) {
            return found;
        }

        let mut frontier = vec![region_id];
        while let Some(id) = frontier.pop() {
            if !found.insert(id) {
                continue;
            }
            frontier.extend(
                self.regions
                    .values()
                    .filter(|region| region.parent_id == Some(id))
                    .map(|region| region.id),
            );
        }
        found
    }

    fn find_service(&self, name: &str, region_id: RegionId) -> Option<&Service> {
        self.services
            .values()
            .find(|service| service.region_id == region_id && names_match(&service.name, name))
    }

    fn insert_service(&mut self, service: NewService) -> Result<ServiceId, ConstraintError> {
        if service.name.trim().is_empty() {
            return Err(ConstraintError::BlankServiceName);
        }
        if !self.regions.contains_key(&service.region_id) {
            return Err(ConstraintError::RegionNotFound(service.region_id));
        }
        if let Some(existing) = self.find_service(&service.name, service.region_id) {
            return Ok(existing.id);
        }

        self.last_service_id += 1;
        let id = ServiceId(self.last_service_id);
        let mut service = service;
        service.name = service.name.trim().to_string();
        self.services.insert(id, service.into_service(id, Utc::now()));
        Ok(id)
    }

    fn backfill(&mut self, service_id: ServiceId, coordinates: Coordinates) -> bool {
        match self.services.get_mut(&service_id) {
            Some(service) if service.coordinates.is_none() => {
                service.coordinates = Some(coordinates);
                true
            }
            _ => false,
        }
    }

    fn apply_row(&mut self, row: &RowWrite) -> Result<RowCommit, ConstraintError> {
        let mut regions = Vec::with_capacity(row.path.len());
        let mut parent = None;
        for (region_type, name) in row.path.levels() {
            let id = self.insert_region(name, region_type, parent)?;
            regions.push(id);
            parent = Some(id);
        }

        let Some(leaf) = parent else {
            return Ok(RowCommit {
                regions,
                service: None,
            });
        };

        let service = match &row.service {
            None => None,
            Some(draft) => Some(match self.find_service(&draft.name, leaf).map(|s| s.id) {
                Some(id) => {
                    match draft.coordinates {
                        Some(coordinates) if self.backfill(id, coordinates) => {
                            ServiceCommit::Backfilled(id)
                        }
                        _ => ServiceCommit::Existing(id),
                    }
                }
                None => ServiceCommit::Inserted(
                    self.insert_service(draft.clone().into_new_service(leaf))?,
                ),
            }),
        };

        Ok(RowCommit { regions, service })
    }
}

impl RegionStore for MemoryStore {
    async fn insert_region(
        &self,
        name: &str,
        region_type: RegionType,
        parent_id: Option<RegionId>,
    ) -> StoreResult<RegionId> {
        Ok(self.state.write().insert_region(name, region_type, parent_id)?)
    }

    async fn get_region(&self, region_id: RegionId) -> StoreResult<Option<Region>> {
        Ok(self.state.read().regions.get(&region_id).cloned())
    }

    async fn get_path(&self, region_id: RegionId) -> StoreResult<Vec<Region>> {
        Ok(self.state.read().path(region_id)?)
    }

    async fn find_by_type_and_parent(
        &self,
        name: &str,
        region_type: RegionType,
        parent_id: Option<RegionId>,
    ) -> StoreResult<Option<RegionId>> {
        Ok(self.state.read().find_region(name, region_type, parent_id))
    }

    async fn query_descendants(&self, region_id: RegionId) -> StoreResult<BTreeSet<RegionId>> {
        Ok(self.state.read().descendants(region_id))
    }

    async fn list_regions(&self) -> StoreResult<Vec<Region>> {
        Ok(self.state.read().regions.values().cloned().collect())
    }

    async fn find_region_by_path(&self, path: &RegionPath) -> StoreResult<Option<Region>> {
        let state = self.state.read();
        let mut parent = None;
        for (region_type, name) in path.levels() {
            match state.find_region(name, region_type, parent) {
                Some(id) => parent = Some(id),
                None => return Ok(None),
            }
        }
        Ok(parent.and_then(|id| state.regions.get(&id).cloned()))
    }

    async fn remove_region(
        &self,
        region_id: RegionId,
        policy: RemovalPolicy,
    ) -> StoreResult<RemovalReport> {
        let mut state = self.state.write();
        if !state.regions.contains_key(&region_id) {
            return Err(ConstraintError::RegionNotFound(region_id).into());
        }

        let subtree = state.descendants(region_id);
        let services = state
            .services
            .values()
            .filter(|service| subtree.contains(&service.region_id))
            .count();

        if policy == RemovalPolicy::Restrict && (subtree.len() > 1 || services > 0) {
            return Err(ConstraintError::RegionHasDependents {
                region: region_id,
                child_regions: subtree.len() - 1,
                services,
            }
            .into());
        }

        state
            .services
            .retain(|_, service| !subtree.contains(&service.region_id));
        state.regions.retain(|id, _| !subtree.contains(id));

        Ok(RemovalReport {
            regions_removed: subtree.len(),
            services_removed: services,
        })
    }
}

impl ServiceCatalog for MemoryStore {
    async fn insert_service(&self, service: NewService) -> StoreResult<ServiceId> {
        Ok(self.state.write().insert_service(service)?)
    }

    async fn get_service(&self, service_id: ServiceId) -> StoreResult<Option<Service>> {
        Ok(self.state.read().services.get(&service_id).cloned())
    }

    async fn find_service(&self, name: &str, region_id: RegionId) -> StoreResult<Option<Service>> {
        Ok(self.state.read().find_service(name, region_id).cloned())
    }

    async fn query_services(&self, region_id: RegionId, recursive: bool) -> StoreResult<Vec<Service>> {
        let state = self.state.read();
        let scope = if recursive {
            state.descendants(region_id)
        } else {
            BTreeSet::from([region_id])
        };

        Ok(state
            .services
            .values()
            .filter(|service| scope.contains(&service.region_id))
            .cloned()
            .collect())
    }

    async fn list_services(&self, service_type: Option<&str>) -> StoreResult<Vec<Service>> {
        Ok(self
            .state
            .read()
            .services
            .values()
            .filter(|service| match service_type {
                Some(wanted) => service
                    .service_type
                    .as_deref()
                    .is_some_and(|kind| names_match(kind, wanted)),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn service_types(&self) -> StoreResult<Vec<String>> {
        let types = self
            .state
            .read()
            .services
            .values()
            .filter_map(|service| service.service_type.clone())
            .collect::<BTreeSet<_>>();
        Ok(types.into_iter().collect())
    }

    async fn remove_service(&self, service_id: ServiceId) -> StoreResult<bool> {
        Ok(self.state.write().services.remove(&service_id).is_some())
    }

    async fn backfill_coordinates(
        &self,
        service_id: ServiceId,
        coordinates: Coordinates,
    ) -> StoreResult<bool> {
        Ok(self.state.write().backfill(service_id, coordinates))
    }
}

impl ImportWriter for MemoryStore {
    async fn commit_row(&self, row: &RowWrite) -> StoreResult<RowCommit> {
        let mut state = self.state.write();
        let savepoint = state.savepoint();

        match state.apply_row(row) {
            Ok(commit) => Ok(commit),
            Err(err) => {
                state.rollback(savepoint);
                Err(err.into())
            }
        }
    }
}
