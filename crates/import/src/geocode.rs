use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use haven_core::Coordinates;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::FailureReason;

pub const GOOGLE_GEOCODE_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/geocode/json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum GeocodeOutcome {
    Success { coordinates: Coordinates },
    NotFound,
    RequestDenied,
    OtherFailure { detail: String },
}

impl GeocodeOutcome {
    pub fn success(latitude: f64, longitude: f64) -> Self {
        match Coordinates::new(latitude, longitude) {
            Some(coordinates) => Self::Success { coordinates },
            None => Self::OtherFailure {
                detail: format!("coordinates out of range: {latitude}, {longitude}"),
            },
        }
    }

    pub fn coordinates(&self) -> Option<Coordinates> {
        match self {
            Self::Success { coordinates } => Some(*coordinates),
            _ => None,
        }
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Self::Success { .. } => None,
            Self::NotFound => Some(FailureReason::NotFound),
            Self::RequestDenied => Some(FailureReason::RequestDenied),
            Self::OtherFailure { .. } => Some(FailureReason::OtherFailure),
        }
    }

    pub fn as_code(&self) -> &'static str {
        match self {
            Self::Success { .. } => "ok",
            Self::NotFound => "not_found",
            Self::RequestDenied => "request_denied",
            Self::OtherFailure { .. } => "other_failure",
        }
    }
}

/// Resolves a free-text address to coordinates. Implementations never fail;
/// transport problems are reported as `OtherFailure`.
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str) -> GeocodeOutcome;
}

#[derive(Debug, Deserialize)]
struct GoogleResponse {
    status: String,
    #[serde(default)]
    results: Vec<GoogleResult>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleResult {
    geometry: GoogleGeometry,
}

#[derive(Debug, Deserialize)]
struct GoogleGeometry {
    location: GoogleLocation,
}

#[derive(Debug, Deserialize)]
struct GoogleLocation {
    lat: f64,
    lng: f64,
}

/// Google Geocoding JSON API client.
#[derive(Debug, Clone)]
pub struct GoogleGeocoder {
    client: reqwest::Client,
    endpoint: Url,
    api_key: String,
}

impl GoogleGeocoder {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        Self::with_endpoint(GOOGLE_GEOCODE_ENDPOINT, api_key, timeout)
    }

    pub fn with_endpoint(
        endpoint: &str,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("haven-import/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: Url::parse(endpoint)?,
            api_key: api_key.into(),
        })
    }

    fn request_url(&self, address: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("address", address)
            .append_pair("key", &self.api_key);
        url
    }
}

impl Geocoder for GoogleGeocoder {
    async fn geocode(&self, address: &str) -> GeocodeOutcome {
        let response = match self.client.get(self.request_url(address)).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "geocode request failed");
                return GeocodeOutcome::OtherFailure {
                    detail: err.to_string(),
                };
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            warn!(%status, "geocode endpoint returned an error status");
            return GeocodeOutcome::OtherFailure {
                detail: format!("http status {status}"),
            };
        }

        match response.json::<GoogleResponse>().await {
            Ok(body) => interpret_google(body),
            Err(err) => GeocodeOutcome::OtherFailure {
                detail: format!("undecodable geocode response: {err}"),
            },
        }
    }
}

fn interpret_google(body: GoogleResponse) -> GeocodeOutcome {
    debug!(status = %body.status, results = body.results.len(), "geocode response");
    match body.status.as_str() {
        "OK" => match body.results.first() {
            Some(first) => {
                GeocodeOutcome::success(first.geometry.location.lat, first.geometry.location.lng)
            }
            None => GeocodeOutcome::NotFound,
        },
        "ZERO_RESULTS" => GeocodeOutcome::NotFound,
        "REQUEST_DENIED" => GeocodeOutcome::RequestDenied,
        other => GeocodeOutcome::OtherFailure {
            detail: body
                .error_message
                .map(|message| format!("{other}: {message}"))
                .unwrap_or_else(|| other.to_string()),
        },
    }
}

/// Answers from a fixed table. Unknown addresses resolve to the default
/// outcome, `NotFound` unless set.
#[derive(Debug, Default)]
pub struct FixedGeocoder {
    answers: HashMap<String, GeocodeOutcome>,
    default: Option<GeocodeOutcome>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl FixedGeocoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, address: impl Into<String>, outcome: GeocodeOutcome) -> Self {
        self.answers.insert(address.into(), outcome);
        self
    }

    pub fn with_default(mut self, outcome: GeocodeOutcome) -> Self {
        self.default = Some(outcome);
        self
    }

    /// Sleeps before answering, to exercise timeouts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Geocoder for FixedGeocoder {
    async fn geocode(&self, address: &str) -> GeocodeOutcome {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.answers
            .get(address.trim())
            .or(self.default.as_ref())
            .cloned()
            .unwrap_or(GeocodeOutcome::NotFound)
    }
}

impl<G: Geocoder> Geocoder for std::sync::Arc<G> {
    async fn geocode(&self, address: &str) -> GeocodeOutcome {
        G::geocode(self, address).await
    }
}
