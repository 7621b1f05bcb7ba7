use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use haven_core::{haversine_km, Coordinates, RegionId, Service, ServiceId};
use haven_storage::{RegionStore, ServiceCatalog, StoreResult};
use serde::{Deserialize, Serialize};
use tracing::instrument;

pub const MAX_SERVICES_RECOMMENDED: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceQuery {
    /// Searched together with every region below it.
    pub region_id: Option<RegionId>,
    pub origin: Option<Coordinates>,
    pub service_type: Option<String>,
    pub limit: usize,
}

impl Default for ServiceQuery {
    fn default() -> Self {
        Self {
            region_id: None,
            origin: None,
            service_type: None,
            limit: MAX_SERVICES_RECOMMENDED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceListing {
    pub service_id: ServiceId,
    pub name: String,
    pub description: String,
    pub address: String,
    pub service_type: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub coordinates: Option<Coordinates>,
    /// Region names, country first.
    pub region_path: Vec<String>,
    pub distance_km: Option<f64>,
}

impl ServiceListing {
    /// Unformatted rendering for the presentation layer.
    pub fn to_plain_text(&self) -> String {
        let mut out = self.name.clone();
        if !self.description.trim().is_empty() {
            let _ = write!(out, "\n{}", self.description.trim());
        }
        let _ = write!(out, "\nAddress: {}", self.address);
        if !self.region_path.is_empty() {
            let _ = write!(out, "\nRegion: {}", self.region_path.join(", "));
        }
        if let Some(distance) = self.distance_km {
            let _ = write!(out, "\nDistance: {distance:.1} km");
        }
        if let Some(phone) = &self.phone {
            let _ = write!(out, "\nPhone: {phone}");
        }
        if let Some(website) = &self.website {
            let _ = write!(out, "\nWebsite: {website}");
        }
        out
    }
}

pub fn render_listings(listings: &[ServiceListing]) -> String {
    if listings.is_empty() {
        return "No matching services were found.".to_string();
    }
    listings
        .iter()
        .map(ServiceListing::to_plain_text)
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[derive(Clone)]
pub struct LocalServicesAgent<S>
where
    S: RegionStore + ServiceCatalog,
{
    store: Arc<S>,
}

impl<S> LocalServicesAgent<S>
where
    S: RegionStore + ServiceCatalog,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Nearest first when an origin is given, unlocated services last.
    /// Without an origin the catalog order is kept.
    #[instrument(skip(self))]
    pub async fn find(&self, query: &ServiceQuery) -> StoreResult<Vec<ServiceListing>> {
        let mut services = match query.region_id {
            Some(region_id) => self.store.query_services(region_id, true).await?,
            None => self.store.list_services(None).await?,
        };

        if let Some(wanted) = query.service_type.as_deref() {
            services.retain(|service| {
                service
                    .service_type
                    .as_deref()
                    .is_some_and(|kind| kind.trim().eq_ignore_ascii_case(wanted.trim()))
            });
        }

        let mut ranked: Vec<(Service, Option<f64>)> = services
            .into_iter()
            .map(|service| {
                let distance = query
                    .origin
                    .zip(service.coordinates)
                    .map(|(origin, at)| haversine_km(&origin, &at));
                (service, distance)
            })
            .collect();

        if query.origin.is_some() {
            ranked.sort_by(|(_, lhs), (_, rhs)| match (lhs, rhs) {
                (Some(lhs), Some(rhs)) => lhs.total_cmp(rhs),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            });
        }

        let limit = if query.limit == 0 {
            MAX_SERVICES_RECOMMENDED
        } else {
            query.limit
        };
        ranked.truncate(limit);

        let mut paths: HashMap<RegionId, Vec<String>> = HashMap::new();
        let mut listings = Vec::with_capacity(ranked.len());
        for (service, distance_km) in ranked {
            if !paths.contains_key(&service.region_id) {
                let names = self
                    .store
                    .get_path(service.region_id)
                    .await?
                    .into_iter()
                    .map(|region| region.name)
                    .collect();
                paths.insert(service.region_id, names);
            }

            listings.push(ServiceListing {
                service_id: service.id,
                region_path: paths.get(&service.region_id).cloned().unwrap_or_default(),
                name: service.name,
                description: service.description,
                address: service.address,
                service_type: service.service_type,
                phone: service.phone,
                website: service.website,
                coordinates: service.coordinates,
                distance_km,
            });
        }

        Ok(listings)
    }
}
