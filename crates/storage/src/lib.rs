mod memory;
mod sqlite;

use std::collections::BTreeSet;

use haven_core::{
    ConstraintError, Coordinates, NewService, Region, RegionId, RegionPath, RegionType, Service,
    ServiceId,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Constraint(#[from] ConstraintError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored record is malformed: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn as_constraint(&self) -> Option<&ConstraintError> {
        match self {
            StoreError::Constraint(err) => Some(err),
            _ => None,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// What to do with dependents when a region is removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalPolicy {
    /// Refuse while child regions or services still reference the region.
    #[default]
    Restrict,
    /// Remove the whole subtree and every service attached to it.
    Cascade,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalReport {
    pub regions_removed: usize,
    pub services_removed: usize,
}

pub trait RegionStore: Send + Sync {
    /// Inserts a region, or returns the id of the identical existing one.
    async fn insert_region(
        &self,
        name: &str,
        region_type: RegionType,
        parent_id: Option<RegionId>,
    ) -> StoreResult<RegionId>;
    async fn get_region(&self, region_id: RegionId) -> StoreResult<Option<Region>>;
    /// Root-to-leaf chain ending at `region_id`.
    async fn get_path(&self, region_id: RegionId) -> StoreResult<Vec<Region>>;
    async fn find_by_type_and_parent(
        &self,
        name: &str,
        region_type: RegionType,
        parent_id: Option<RegionId>,
    ) -> StoreResult<Option<RegionId>>;
    /// Every region in the subtree rooted at `region_id`, itself included.
    async fn query_descendants(&self, region_id: RegionId) -> StoreResult<BTreeSet<RegionId>>;
    async fn list_regions(&self) -> StoreResult<Vec<Region>>;
    async fn find_region_by_path(&self, path: &RegionPath) -> StoreResult<Option<Region>>;
    async fn remove_region(
        &self,
        region_id: RegionId,
        policy: RemovalPolicy,
    ) -> StoreResult<RemovalReport>;
}

pub trait ServiceCatalog: Send + Sync {
    /// Inserts a service, or returns the id already held by its
    /// `(name, region_id)` natural key.
    async fn insert_service(&self, service: NewService) -> StoreResult<ServiceId>;
    async fn get_service(&self, service_id: ServiceId) -> StoreResult<Option<Service>>;
    async fn find_service(&self, name: &str, region_id: RegionId) -> StoreResult<Option<Service>>;
    async fn query_services(&self, region_id: RegionId, recursive: bool) -> StoreResult<Vec<Service>>;
    async fn list_services(&self, service_type: Option<&str>) -> StoreResult<Vec<Service>>;
    async fn service_types(&self) -> StoreResult<Vec<String>>;
    async fn remove_service(&self, service_id: ServiceId) -> StoreResult<bool>;
    /// Sets coordinates on a service that has none. Returns false when the
    /// service is missing or already located.
    async fn backfill_coordinates(
        &self,
        service_id: ServiceId,
        coordinates: Coordinates,
    ) -> StoreResult<bool>;
}

/// A service as it arrives from an import row, before its region is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDraft {
    pub name: String,
    pub description: String,
    pub address: String,
    pub coordinates: Option<Coordinates>,
    pub service_type: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
}

impl ServiceDraft {
    pub fn into_new_service(self, region_id: RegionId) -> NewService {
        NewService {
            name: self.name.trim().to_string(),
            description: self.description,
            region_id,
            address: self.address,
            coordinates: self.coordinates,
            service_type: self.service_type,
            phone: self.phone,
            website: self.website,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowWrite {
    pub path: RegionPath,
    pub service: Option<ServiceDraft>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "service_id")]
pub enum ServiceCommit {
    Inserted(ServiceId),
    /// Already present with nothing to change.
    Existing(ServiceId),
    /// Already present without coordinates, now located.
    Backfilled(ServiceId),
}

impl ServiceCommit {
    pub fn service_id(self) -> ServiceId {
        match self {
            Self::Inserted(id) | Self::Existing(id) | Self::Backfilled(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowCommit {
    /// Region ids along the row's path, root first.
    pub regions: Vec<RegionId>,
    pub service: Option<ServiceCommit>,
}

impl RowCommit {
    pub fn leaf(&self) -> Option<RegionId> {
        self.regions.last().copied()
    }
}

/// Single-row, all-or-nothing write used by the import pipeline.
pub trait ImportWriter: Send + Sync {
    async fn commit_row(&self, row: &RowWrite) -> StoreResult<RowCommit>;
}

#[derive(Clone)]
pub enum Store {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

impl Store {
    pub fn memory() -> Self {
        Self::Memory(MemoryStore::new())
    }

    pub async fn sqlite(database_url: &str) -> anyhow::Result<Self> {
        let sqlite = SqliteStore::connect(database_url).await?;
        Ok(Self::Sqlite(sqlite))
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Store::Memory(_) => "memory",
            Store::Sqlite(_) => "sqlite",
        }
    }
}

impl RegionStore for Store {
    async fn insert_region(
        &self,
        name: &str,
        region_type: RegionType,
        parent_id: Option<RegionId>,
    ) -> StoreResult<RegionId> {
        match self {
            Store::Memory(store) => store.insert_region(name, region_type, parent_id).await,
            Store::Sqlite(store) => store.insert_region(name, region_type, parent_id).await,
        }
    }

    async fn get_region(&self, region_id: RegionId) -> StoreResult<Option<Region>> {
        match self {
            Store::Memory(store) => store.get_region(region_id).await,
            Store::Sqlite(store) => store.get_region(region_id).await,
        }
    }

    async fn get_path(&self, region_id: RegionId) -> StoreResult<Vec<Region>> {
        match self {
            Store::Memory(store) => store.get_path(region_id).await,
            Store::Sqlite(store) => store.get_path(region_id).await,
        }
    }

    async fn find_by_type_and_parent(
        &self,
        name: &str,
        region_type: RegionType,
        parent_id: Option<RegionId>,
    ) -> StoreResult<Option<RegionId>> {
        match self {
            Store::Memory(store) => {
                store
                    .find_by_type_and_parent(name, region_type, parent_id)
                    .await
            }
            Store::Sqlite(store) => {
                store
                    .find_by_type_and_parent(name, region_type, parent_id)
                    .await
            }
        }
    }

    async fn query_descendants(&self, region_id: RegionId) -> StoreResult<BTreeSet<RegionId>> {
        match self {
            Store::Memory(store) => store.query_descendants(region_id).await,
            Store::Sqlite(store) => store.query_descendants(region_id).await,
        }
    }

    async fn list_regions(&self) -> StoreResult<Vec<Region>> {
        match self {
            Store::Memory(store) => store.list_regions().await,
            Store::Sqlite(store) => store.list_regions().await,
        }
    }

    async fn find_region_by_path(&self, path: &RegionPath) -> StoreResult<Option<Region>> {
        match self {
            Store::Memory(store) => store.find_region_by_path(path).await,
            Store::Sqlite(store) => store.find_region_by_path(path).await,
        }
    }

    async fn remove_region(
        &self,
        region_id: RegionId,
        policy: RemovalPolicy,
    ) -> StoreResult<RemovalReport> {
        match self {
            Store::Memory(store) => store.remove_region(region_id, policy).await,
            Store::Sqlite(store) => store.remove_region(region_id, policy).await,
        }
    }
}

impl ServiceCatalog for Store {
    async fn insert_service(&self, service: NewService) -> StoreResult<ServiceId> {
        match self {
            Store::Memory(store) => store.insert_service(service).await,
            Store::Sqlite(store) => store.insert_service(service).await,
        }
    }

    async fn get_service(&self, service_id: ServiceId) -> StoreResult<Option<Service>> {
        match self {
            Store::Memory(store) => store.get_service(service_id).await,
            Store::Sqlite(store) => store.get_service(service_id).await,
        }
    }

    async fn find_service(&self, name: &str, region_id: RegionId) -> StoreResult<Option<Service>> {
        match self {
            Store::Memory(store) => store.find_service(name, region_id).await,
            Store::Sqlite(store) => store.find_service(name, region_id).await,
        }
    }

    async fn query_services(&self, region_id: RegionId, recursive: bool) -> StoreResult<Vec<Service>> {
        match self {
            Store::Memory(store) => store.query_services(region_id, recursive).await,
            Store::Sqlite(store) => store.query_services(region_id, recursive).await,
        }
    }

    async fn list_services(&self, service_type: Option<&str>) -> StoreResult<Vec<Service>> {
        match self {
            Store::Memory(store) => store.list_services(service_type).await,
            Store::Sqlite(store) => store.list_services(service_type).await,
        }
    }

    async fn service_types(&self) -> StoreResult<Vec<String>> {
        match self {
            Store::Memory(store) => store.service_types().await,
            Store::Sqlite(store) => store.service_types().await,
        }
    }

    async fn remove_service(&self, service_id: ServiceId) -> StoreResult<bool> {
        match self {
            Store::Memory(store) => store.remove_service(service_id).await,
            Store::Sqlite(store) => store.remove_service(service_id).await,
        }
    }

    async fn backfill_coordinates(
        &self,
        service_id: ServiceId,
        coordinates: Coordinates,
    ) -> StoreResult<bool> {
        match self {
            Store::Memory(store) => store.backfill_coordinates(service_id, coordinates).await,
            Store::Sqlite(store) => store.backfill_coordinates(service_id, coordinates).await,
        }
    }
}

impl ImportWriter for Store {
    async fn commit_row(&self, row: &RowWrite) -> StoreResult<RowCommit> {
        match self {
            Store::Memory(store) => store.commit_row(row).await,
            Store::Sqlite(store) => store.commit_row(row).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn region(store: &Store, name: &str, region_type: RegionType, parent: Option<RegionId>) -> RegionId {
        store.insert_region(name, region_type, parent).await.unwrap()
    }

    async fn service(store: &Store, name: &str, region_id: RegionId) -> ServiceId {
        store
            .insert_service(NewService::new(name, "", region_id, format!("{name} address")))
            .await
            .unwrap()
    }

    async fn ids(store: &Store, region_id: RegionId, recursive: bool) -> BTreeSet<ServiceId> {
        store
            .query_services(region_id, recursive)
            .await
            .unwrap()
            .into_iter()
            .map(|service| service.id)
            .collect()
    }

    /// Recursive lookups equal the union of direct lookups over the subtree,
    /// on a branching tree with services at every level.
    async fn recursive_query_is_union_of_subtree(store: Store) {
        let ca = region(&store, "CA", RegionType::Country, None).await;
        let bc = region(&store, "BC", RegionType::Province, Some(ca)).await;
        let on = region(&store, "ON", RegionType::Province, Some(ca)).await;
        let crd = region(&store, "CRD", RegionType::County, Some(bc)).await;
        let metro = region(&store, "Metro Vancouver", RegionType::County, Some(bc)).await;
        let victoria = region(&store, "Victoria", RegionType::City, Some(crd)).await;
        let saanich = region(&store, "Saanich", RegionType::City, Some(crd)).await;
        let burnaby = region(&store, "Burnaby", RegionType::City, Some(metro)).await;
        let uk = region(&store, "UK", RegionType::Country, None).await;

        service(&store, "National Helpline", ca).await;
        service(&store, "BC Crisis Line", bc).await;
        service(&store, "Ontario Autism Program", on).await;
        service(&store, "Island Health", crd).await;
        service(&store, "ABC Dental", victoria).await;
        service(&store, "Fort St Clinic", victoria).await;
        service(&store, "Saanich Counselling", saanich).await;
        service(&store, "Access Learning", burnaby).await;
        service(&store, "NHS 111", uk).await;

        for root in [ca, bc, crd, victoria, on, uk] {
            let mut union = BTreeSet::new();
            for descendant in store.query_descendants(root).await.unwrap() {
                union.extend(ids(&store, descendant, false).await);
            }
            assert_eq!(ids(&store, root, true).await, union, "subtree of {root}");
        }

        assert_eq!(ids(&store, ca, true).await.len(), 8);
        assert_eq!(ids(&store, bc, true).await.len(), 6);
        assert_eq!(ids(&store, victoria, true).await.len(), 2);
        assert_eq!(ids(&store, victoria, true).await, ids(&store, victoria, false).await);
    }

    #[tokio::test]
    async fn memory_recursive_query_is_union_of_subtree() {
        recursive_query_is_union_of_subtree(Store::memory()).await;
    }

    #[tokio::test]
    async fn sqlite_recursive_query_is_union_of_subtree() {
        let store = Store::sqlite("sqlite::memory:").await.unwrap();
        recursive_query_is_union_of_subtree(store).await;
    }
}
