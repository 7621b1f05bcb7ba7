use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use haven_core::AgentId;
use metrics::{counter, histogram};
use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Names of the series emitted through the `metrics` facade.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "haven_requests_total";
    pub const ROUTES_TOTAL: &str = "haven_routes_total";
    pub const ROUTE_FALLBACKS_TOTAL: &str = "haven_route_fallbacks_total";
    pub const REQUEST_DURATION_SECONDS: &str = "haven_request_duration_seconds";
    pub const IMPORT_ROWS_TOTAL: &str = "haven_import_rows_total";
    pub const GEOCODE_REQUESTS_TOTAL: &str = "haven_geocode_requests_total";
}

#[derive(Debug, Default)]
pub struct AppMetrics {
    requests_total: AtomicU64,
    // indexed by AgentId::priority_rank
    routes_total: [AtomicU64; AgentId::PRIORITY.len()],
    fallback_total: AtomicU64,
    listings_served_total: AtomicU64,
    import_rows_ok_total: AtomicU64,
    import_rows_failed_total: AtomicU64,
    total_latency_millis: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteCount {
    pub agent: AgentId,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub routes: Vec<RouteCount>,
    pub fallback_total: u64,
    pub listings_served_total: u64,
    pub import_rows_ok_total: u64,
    pub import_rows_failed_total: u64,
    pub avg_latency_millis: f64,
}

impl AppMetrics {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inc_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        counter!(names::REQUESTS_TOTAL).increment(1);
    }

    pub fn record_route(&self, agent: AgentId, fell_back: bool) {
        if let Some(slot) = self.routes_total.get(agent.priority_rank()) {
            slot.fetch_add(1, Ordering::Relaxed);
        }
        counter!(names::ROUTES_TOTAL, "agent" => agent.as_code()).increment(1);

        if fell_back {
            self.fallback_total.fetch_add(1, Ordering::Relaxed);
            counter!(names::ROUTE_FALLBACKS_TOTAL).increment(1);
        }
    }

    pub fn add_listings_served(&self, listings: usize) {
        self.listings_served_total
            .fetch_add(listings as u64, Ordering::Relaxed);
    }

    /// `outcome` is `"ok"` or a failure reason code.
    pub fn record_import_row(&self, outcome: &'static str) {
        if outcome == "ok" {
            self.import_rows_ok_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.import_rows_failed_total.fetch_add(1, Ordering::Relaxed);
        }
        counter!(names::IMPORT_ROWS_TOTAL, "outcome" => outcome).increment(1);
    }

    pub fn record_geocode(&self, outcome: &'static str) {
        counter!(names::GEOCODE_REQUESTS_TOTAL, "outcome" => outcome).increment(1);
    }

    pub fn observe_latency(&self, duration: Duration) {
        self.total_latency_millis
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        histogram!(names::REQUEST_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let requests = self.requests_total.load(Ordering::Relaxed);
        let latency = self.total_latency_millis.load(Ordering::Relaxed);

        MetricsSnapshot {
            requests_total: requests,
            routes: AgentId::PRIORITY
                .iter()
                .zip(self.routes_total.iter())
                .map(|(agent, total)| RouteCount {
                    agent: *agent,
                    total: total.load(Ordering::Relaxed),
                })
                .collect(),
            fallback_total: self.fallback_total.load(Ordering::Relaxed),
            listings_served_total: self.listings_served_total.load(Ordering::Relaxed),
            import_rows_ok_total: self.import_rows_ok_total.load(Ordering::Relaxed),
            import_rows_failed_total: self.import_rows_failed_total.load(Ordering::Relaxed),
            avg_latency_millis: if requests == 0 {
                0.0
            } else {
                latency as f64 / requests as f64
            },
        }
    }
}

pub fn init_tracing(service_name: &str) {
    TRACING_INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}=info,haven_api=info,haven_agents=info,haven_import=info,haven_ml=info",
                service_name.replace('-', "_")
            ))
        });

        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .with_span_list(true)
            .init();
        tracing::info!(service = service_name, "tracing initialized");
    });
}
