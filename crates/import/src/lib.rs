//! Bulk CSV import into the region store and service catalog.

mod geocode;
mod pipeline;
mod record;
mod summary;

pub use geocode::{FixedGeocoder, GeocodeOutcome, Geocoder, GoogleGeocoder, GOOGLE_GEOCODE_ENDPOINT};
pub use pipeline::{ImportConfig, ImportPipeline};
pub use record::{read_records, Columns, ImportRecord, NumberedRecord, RecordError};
pub use summary::{DirectorySummary, FailureReason, ImportSummary, RowFailure};
