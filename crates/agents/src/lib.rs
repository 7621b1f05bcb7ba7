mod router;
mod services;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use haven_core::{AgentId, Coordinates, RegionId};
use haven_observability::AppMetrics;
use haven_storage::{RegionStore, ServiceCatalog};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

pub use router::{AgentRouter, RoutingDecision, DEFAULT_ROUTER_THRESHOLD};
pub use services::{
    render_listings, LocalServicesAgent, ServiceListing, ServiceQuery, MAX_SERVICES_RECOMMENDED,
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageInput {
    pub text: String,
    #[serde(default)]
    pub region_id: Option<RegionId>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub service_type: Option<String>,
}

impl MessageInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Both halves or neither; a lone latitude or longitude is ignored.
    pub fn origin(&self) -> Result<Option<Coordinates>> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => match Coordinates::new(latitude, longitude) {
                Some(origin) => Ok(Some(origin)),
                None => bail!("coordinates out of range: {latitude}, {longitude}"),
            },
            _ => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConciergeReply {
    pub routing: RoutingDecision,
    /// Only filled for `AgentId::LocalServices`.
    pub listings: Vec<ServiceListing>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plain_text: Option<String>,
}

/// Routes a message and, for local-service requests, looks up listings.
/// Dialogue for the other agents happens outside this crate.
#[derive(Clone)]
pub struct Concierge<S>
where
    S: RegionStore + ServiceCatalog,
{
    router: AgentRouter,
    services: LocalServicesAgent<S>,
    metrics: Arc<AppMetrics>,
}

impl<S> Concierge<S>
where
    S: RegionStore + ServiceCatalog,
{
    pub fn new(router: AgentRouter, store: Arc<S>, metrics: Arc<AppMetrics>) -> Self {
        Self {
            router,
            services: LocalServicesAgent::new(store),
            metrics,
        }
    }

    pub fn router(&self) -> &AgentRouter {
        &self.router
    }

    pub fn services(&self) -> &LocalServicesAgent<S> {
        &self.services
    }

    pub fn route(&self, text: &str) -> RoutingDecision {
        let decision = self.router.route(text);
        self.metrics.record_route(decision.agent, decision.fell_back);
        decision
    }

    #[instrument(skip(self, input), fields(text_len = input.text.len()))]
    pub async fn handle_message(&self, input: MessageInput) -> Result<ConciergeReply> {
        let started = Instant::now();
        self.metrics.inc_request();

        let origin = input.origin()?;
        let routing = self.route(&input.text);

        let (listings, plain_text) = if routing.agent == AgentId::LocalServices {
            let query = ServiceQuery {
                region_id: input.region_id,
                origin,
                service_type: input.service_type.clone(),
                ..ServiceQuery::default()
            };
            let listings = self.services.find(&query).await?;
            self.metrics.add_listings_served(listings.len());
            let text = render_listings(&listings);
            (listings, Some(text))
        } else {
            (Vec::new(), None)
        };

        self.metrics.observe_latency(started.elapsed());
        info!(
            agent = routing.agent.as_code(),
            confidence = routing.confidence,
            fell_back = routing.fell_back,
            listings = listings.len(),
            "message handled"
        );

        Ok(ConciergeReply {
            routing,
            listings,
            plain_text,
        })
    }
}

#[cfg(test)]
mod tests {
    use haven_core::{NewService, RegionType};
    use haven_storage::MemoryStore;

    use super::*;

    #[tokio::test]
    async fn local_service_messages_get_listings() {
        let store = Arc::new(MemoryStore::new());
        let uk = store.insert_region("UK", RegionType::Country, None).await.unwrap();
        let england = store
            .insert_region("England", RegionType::Province, Some(uk))
            .await
            .unwrap();
        store
            .insert_service(NewService::new("Camden Clinic", "therapy", england, "1 High St"))
            .await
            .unwrap();

        let metrics = AppMetrics::shared();
        let concierge = Concierge::new(AgentRouter::rules(), store, metrics.clone());

        let reply = concierge
            .handle_message(MessageInput {
                region_id: Some(uk),
                ..MessageInput::text("Where can I find a therapist near me?")
            })
            .await
            .unwrap();
        assert_eq!(reply.routing.agent, AgentId::LocalServices);
        assert_eq!(reply.listings.len(), 1);
        assert!(reply.plain_text.unwrap().contains("Camden Clinic"));

        let reply = concierge
            .handle_message(MessageInput::text("Do you have tips for sensory overload?"))
            .await
            .unwrap();
        assert_eq!(reply.routing.agent, AgentId::AutismSupport);
        assert!(reply.listings.is_empty());
        assert!(reply.plain_text.is_none());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_total, 2);
        assert_eq!(snapshot.listings_served_total, 1);
    }

    #[tokio::test]
    async fn rejects_out_of_range_origin() {
        let concierge = Concierge::new(
            AgentRouter::rules(),
            Arc::new(MemoryStore::new()),
            AppMetrics::shared(),
        );
        let result = concierge
            .handle_message(MessageInput {
                latitude: Some(123.0),
                longitude: Some(0.0),
                ..MessageInput::text("clinic near me")
            })
            .await;
        assert!(result.is_err());
    }
}
