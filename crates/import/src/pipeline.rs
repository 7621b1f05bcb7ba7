use std::env;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{stream, StreamExt};
use haven_core::RegionPath;
use haven_observability::AppMetrics;
use haven_storage::{ImportWriter, RegionStore, RowWrite, ServiceCatalog, ServiceCommit};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::geocode::{GeocodeOutcome, Geocoder};
use crate::record::{read_records, ImportRecord, NumberedRecord, RecordError};
use crate::summary::{DirectorySummary, FailureReason, ImportSummary};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportConfig {
    /// Geocode requests in flight at once. Writes stay sequential.
    pub concurrency: usize,
    pub geocode_timeout: Duration,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            geocode_timeout: Duration::from_secs(10),
        }
    }
}

impl ImportConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let concurrency = env::var("HAVEN_IMPORT_CONCURRENCY")
            .ok()
            .and_then(|raw| raw.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(defaults.concurrency);
        let geocode_timeout = env::var("HAVEN_GEOCODE_TIMEOUT_SECONDS")
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.geocode_timeout);

        Self {
            concurrency,
            geocode_timeout,
        }
    }
}

/// What the writer has to do for one row, decided before it sees the row.
enum Plan {
    Invalid(RecordError),
    AlreadyPresent,
    Write {
        record: ImportRecord,
        geocode: Option<GeocodeOutcome>,
    },
}

pub struct ImportPipeline<S, G> {
    store: S,
    geocoder: G,
    config: ImportConfig,
    metrics: Arc<AppMetrics>,
}

impl<S, G> ImportPipeline<S, G>
where
    S: RegionStore + ServiceCatalog + ImportWriter,
    G: Geocoder,
{
    pub fn new(store: S, geocoder: G) -> Self {
        Self {
            store,
            geocoder,
            config: ImportConfig::default(),
            metrics: AppMetrics::shared(),
        }
    }

    pub fn with_config(mut self, config: ImportConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<AppMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn geocoder(&self) -> &G {
        &self.geocoder
    }

    pub async fn import_records(&self, records: Vec<NumberedRecord>) -> ImportSummary {
        self.run(Uuid::new_v4(), records).await
    }

    pub async fn import_reader<R: Read>(
        &self,
        reader: R,
        default_service_type: Option<&str>,
    ) -> Result<ImportSummary> {
        let records = read_records(reader, default_service_type)?;
        Ok(self.import_records(records).await)
    }

    /// Imports one CSV file. Its file stem is the service type for rows that
    /// do not name one.
    pub async fn import_path(&self, path: &Path) -> Result<ImportSummary> {
        let file = File::open(path)
            .with_context(|| format!("failed to open csv file {}", path.display()))?;
        let service_type = path.file_stem().and_then(|stem| stem.to_str());

        let records = read_records(file, service_type)
            .with_context(|| format!("failed to read csv file {}", path.display()))?;
        let mut summary = self.import_records(records).await;
        summary.source = Some(path.to_path_buf());
        Ok(summary)
    }

    /// Imports every `*.csv` directly inside `dir`, in file-name order.
    pub async fn import_dir(&self, dir: &Path) -> Result<DirectorySummary> {
        let files = csv_files(dir)?;
        info!(dir = %dir.display(), files = files.len(), "importing csv directory");

        let mut total = ImportSummary::new(Uuid::new_v4());
        total.source = Some(dir.to_path_buf());
        let mut summaries = Vec::with_capacity(files.len());
        for file in files {
            let summary = self.import_path(&file).await?;
            total.absorb(&summary);
            summaries.push(summary);
        }

        Ok(DirectorySummary {
            files: summaries,
            total,
        })
    }

    #[instrument(skip(self, records), fields(rows = records.len()))]
    async fn run(&self, run_id: Uuid, records: Vec<NumberedRecord>) -> ImportSummary {
        let mut summary = ImportSummary::new(run_id);

        let mut plans = stream::iter(records)
            .map(|(row, record)| async move { (row, self.plan(record).await) })
            .buffered(self.config.concurrency.max(1));

        while let Some((row, plan)) = plans.next().await {
            self.apply(row, plan, &mut summary).await;
        }

        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            already_present = summary.already_present,
            "import finished"
        );
        summary
    }

    async fn plan(&self, record: Result<ImportRecord, RecordError>) -> Plan {
        let record = match record {
            Ok(record) => record,
            Err(err) => return Plan::Invalid(err),
        };
        let (name, address) = match record.service() {
            Some(service) => (service.name.clone(), service.address.clone()),
            None => {
                return Plan::Write {
                    record,
                    geocode: None,
                }
            }
        };

        if self.already_located(record.path(), &name).await {
            return Plan::AlreadyPresent;
        }

        let outcome = self.geocode(&address).await;
        Plan::Write {
            record,
            geocode: Some(outcome),
        }
    }

    /// Read-only check for a service from an earlier run that already has
    /// coordinates. Lookup errors count as "not present".
    async fn already_located(&self, path: &RegionPath, name: &str) -> bool {
        let region = match self.store.find_region_by_path(path).await {
            Ok(Some(region)) => region,
            Ok(None) => return false,
            Err(err) => {
                warn!(%path, error = %err, "region lookup failed before geocoding");
                return false;
            }
        };

        matches!(
            self.store.find_service(name, region.id).await,
            Ok(Some(service)) if service.coordinates.is_some()
        )
    }

    async fn geocode(&self, address: &str) -> GeocodeOutcome {
        let timeout = self.config.geocode_timeout;
        let outcome = match tokio::time::timeout(timeout, self.geocoder.geocode(address)).await {
            Ok(outcome) => outcome,
            Err(_) => GeocodeOutcome::OtherFailure {
                detail: format!("geocode timed out after {}s", timeout.as_secs_f32()),
            },
        };
        self.metrics.record_geocode(outcome.as_code());
        outcome
    }

    async fn apply(&self, row: usize, plan: Plan, summary: &mut ImportSummary) {
        let (record, geocode) = match plan {
            Plan::Invalid(err) => {
                self.fail(summary, row, FailureReason::InvalidRow, err.to_string());
                return;
            }
            Plan::AlreadyPresent => {
                self.succeed(summary, true);
                return;
            }
            Plan::Write { record, geocode } => (record, geocode),
        };

        let write = match record {
            ImportRecord::Regions { path } => RowWrite {
                path,
                service: None,
            },
            ImportRecord::Service { path, mut service } => {
                service.coordinates = geocode.as_ref().and_then(GeocodeOutcome::coordinates);
                RowWrite {
                    path,
                    service: Some(service),
                }
            }
        };

        let commit = match self.store.commit_row(&write).await {
            Ok(commit) => commit,
            Err(err) => {
                self.fail(summary, row, FailureReason::StoreRejected, err.to_string());
                return;
            }
        };

        match geocode.as_ref().and_then(|outcome| outcome.failure_reason().map(|reason| (reason, outcome))) {
            Some((reason, outcome)) => {
                let detail = match outcome {
                    GeocodeOutcome::OtherFailure { detail } => detail.clone(),
                    GeocodeOutcome::RequestDenied => "geocoding request denied".to_string(),
                    _ => format!(
                        "no geocoding match for {:?}",
                        write.service.as_ref().map(|s| s.address.as_str()).unwrap_or_default()
                    ),
                };
                self.fail(summary, row, reason, detail);
            }
            None => self.succeed(
                summary,
                matches!(commit.service, Some(ServiceCommit::Existing(_))),
            ),
        }
    }

    fn succeed(&self, summary: &mut ImportSummary, already_present: bool) {
        summary.record_success(already_present);
        self.metrics.record_import_row("ok");
    }

    fn fail(&self, summary: &mut ImportSummary, row: usize, reason: FailureReason, detail: String) {
        warn!(
            row,
            reason = reason.as_code(),
            service_written = reason.service_written(),
            %detail,
            "import row failed"
        );
        summary.record_failure(row, reason, detail);
        self.metrics.record_import_row(reason.as_code());
    }
}

fn csv_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        anyhow::bail!("{} is not a directory", dir.display());
    }

    Ok(WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
        })
        .map(|entry| entry.into_path())
        .collect())
}
