use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use haven_agents::AgentRouter;
use haven_core::RegionId;
use haven_import::{FixedGeocoder, GeocodeOutcome, Geocoder, GoogleGeocoder, ImportConfig, ImportPipeline};
use haven_ml::HavenMlStack;
use haven_observability::{init_tracing, AppMetrics};
use haven_storage::{RegionStore, RemovalPolicy, ServiceCatalog, Store};
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(name = "haven")]
#[command(about = "Haven support-service catalog and agent router")]
struct Cli {
    /// SQLite URL of the region and service catalog.
    #[arg(long, env = "HAVEN_DATABASE_URL", default_value = "sqlite://haven.db")]
    database_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Import a CSV file, or every CSV file in a directory.
    Import {
        path: PathBuf,
        /// Skip the geocoding service; services are stored without coordinates.
        #[arg(long)]
        offline: bool,
        #[arg(long, env = "HAVEN_GEOCODER_API_KEY", hide_env_values = true)]
        geocoder_api_key: Option<String>,
        #[arg(long, env = "HAVEN_GEOCODER_ENDPOINT")]
        geocoder_endpoint: Option<String>,
    },
    /// Print the agent a message would be routed to.
    Route { text: String },
    Services {
        region_id: i64,
        #[arg(long)]
        recursive: bool,
    },
    Path { region_id: i64 },
    Regions,
    RemoveRegion {
        region_id: i64,
        /// Also remove child regions and every attached service.
        #[arg(long)]
        cascade: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("haven_cli");
    let cli = Cli::parse();
    let database_url = cli.database_url.as_str();

    match cli.command {
        Command::Route { text } => {
            let stack = HavenMlStack::load_default();
            let router = AgentRouter::from_stack(&stack, AgentRouter::threshold_from_env());
            print_json(&router.route(&text))?;
        }
        Command::Import {
            path,
            offline,
            geocoder_api_key,
            geocoder_endpoint,
        } => {
            let store = open_store(database_url).await?;
            let config = ImportConfig::from_env();
            if offline {
                run_import(store, offline_geocoder(), config, &path).await?;
            } else {
                let Some(api_key) = geocoder_api_key else {
                    bail!("no geocoder api key; set HAVEN_GEOCODER_API_KEY or pass --offline");
                };
                let geocoder = match geocoder_endpoint {
                    Some(endpoint) => {
                        GoogleGeocoder::with_endpoint(&endpoint, api_key, config.geocode_timeout)?
                    }
                    None => GoogleGeocoder::new(api_key, config.geocode_timeout)?,
                };
                run_import(store, geocoder, config, &path).await?;
            }
        }
        Command::Services {
            region_id,
            recursive,
        } => {
            let store = open_store(database_url).await?;
            let region_id = RegionId(region_id);
            if store.get_region(region_id).await?.is_none() {
                bail!("region {region_id} does not exist");
            }
            print_json(&store.query_services(region_id, recursive).await?)?;
        }
        Command::Path { region_id } => {
            let store = open_store(database_url).await?;
            let path = store.get_path(RegionId(region_id)).await?;
            let names = path.iter().map(|region| region.name.as_str()).collect::<Vec<_>>();
            println!("{}", names.join(" > "));
        }
        Command::Regions => {
            let store = open_store(database_url).await?;
            print_json(&store.list_regions().await?)?;
        }
        Command::RemoveRegion { region_id, cascade } => {
            let store = open_store(database_url).await?;
            let policy = if cascade {
                RemovalPolicy::Cascade
            } else {
                RemovalPolicy::Restrict
            };
            print_json(&store.remove_region(RegionId(region_id), policy).await?)?;
        }
    }

    Ok(())
}

async fn open_store(database_url: &str) -> Result<Store> {
    Store::sqlite(database_url)
        .await
        .with_context(|| format!("failed to open catalog at {database_url}"))
}

async fn run_import<G: Geocoder>(
    store: Store,
    geocoder: G,
    config: ImportConfig,
    path: &Path,
) -> Result<()> {
    let pipeline = ImportPipeline::new(store, geocoder)
        .with_config(config)
        .with_metrics(AppMetrics::shared());

    if path.is_dir() {
        let result = pipeline.import_dir(path).await?;
        print_json(&result)?;
    } else {
        let summary = pipeline.import_path(path).await?;
        print_json(&summary)?;
    }
    Ok(())
}

/// Answers every address with a failure that names the offline run, so the
/// summary shows why services were left unlocated.
fn offline_geocoder() -> FixedGeocoder {
    FixedGeocoder::new().with_default(GeocodeOutcome::OtherFailure {
        detail: "offline import, geocoding skipped".to_string(),
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use haven_import::FailureReason;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[tokio::test]
    async fn offline_import_reports_skipped_geocoding() {
        let outcome = offline_geocoder().geocode("101 Fort St").await;
        assert_eq!(
            outcome,
            GeocodeOutcome::OtherFailure {
                detail: "offline import, geocoding skipped".to_string()
            }
        );

        let pipeline = ImportPipeline::new(Store::memory(), offline_geocoder());
        let csv = "country,province,service_name,address\nCA,BC,BC Crisis Line,1 Government St\n";
        let summary = pipeline.import_reader(csv.as_bytes(), None).await.unwrap();

        assert_eq!(summary.failures_for(FailureReason::OtherFailure), 1);
        assert_eq!(summary.failures_for(FailureReason::NotFound), 0);
        assert_eq!(summary.failures[0].detail, "offline import, geocoding skipped");
        assert_eq!(pipeline.store().list_services(None).await.unwrap().len(), 1);
    }

    #[test]
    fn parses_remove_region_flags() {
        let cli = Cli::parse_from(["haven", "--database-url", "sqlite::memory:", "remove-region", "7", "--cascade"]);
        assert!(matches!(
            cli.command,
            Command::RemoveRegion {
                region_id: 7,
                cascade: true
            }
        ));
    }
}
