use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ctv_sheets::{RestSheetClient, SheetClient, SheetsConfig};
use ctv_storage::{Store, StoreConfig};
use ctv_sync::{IntegrityProbe, Reconciler, SyncConfig, Worker};
use ctv_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "ctv")]
#[command(about = "CTV back office: sync worker, commission engine, and API server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run pending database migrations.
    Migrate,
    /// Serve the admin/portal/booking HTTP API.
    Serve {
        /// Defaults to 0.0.0.0 on CTV_WEB_PORT (8000).
        #[arg(long)]
        addr: Option<SocketAddr>,
    },
    /// Run the periodic sheet-to-Postgres worker until killed.
    Worker,
    /// Run exactly one sync cycle and print the summary.
    Sync,
    /// Truncate the commission ledger and rebuild it from id zero.
    Recompute,
    /// Read-only integrity checks against the live sheet and database.
    Probe {
        #[command(subcommand)]
        probe: ProbeCommands,
    },
}

#[derive(Debug, Subcommand)]
enum ProbeCommands {
    /// Per-tab sheet vs database row counts.
    Counts,
    /// Sheet phones with no matching database row, for one tab or all.
    Missing {
        tab: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Every visit and commission row attached to a phone.
    Trace { phone: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let store = Arc::new(Store::connect(&StoreConfig::from_env()).await?);

    match cli.command {
        Commands::Migrate => {
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve { addr } => {
            store.migrate().await?;
            let addr = addr.unwrap_or_else(|| {
                let port = std::env::var("CTV_WEB_PORT")
                    .ok()
                    .and_then(|raw| raw.parse().ok())
                    .unwrap_or(8000);
                SocketAddr::from(([0, 0, 0, 0], port))
            });
            let state = AppState {
                store,
                sheets: sheet_client()?,
                sync: SyncConfig::from_env(),
            };
            ctv_web::serve(state, addr).await?;
        }
        Commands::Worker => {
            store.migrate().await?;
            let worker = Worker::new(store, sheet_client()?, SyncConfig::from_env());
            worker.run_forever().await?;
        }
        Commands::Sync => {
            let worker = Worker::new(store, sheet_client()?, SyncConfig::from_env());
            let summary = worker.run_cycle().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Recompute => {
            let config = SyncConfig::from_env();
            let outcome = Reconciler::new(&store, config.phone_matching)
                .recompute_all()
                .await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Probe { probe } => {
            let client = sheet_client()?;
            let probe_runner = IntegrityProbe::new(&store, client.as_ref());
            match probe {
                ProbeCommands::Counts => {
                    let checks = probe_runner.counts().await?;
                    println!("{}", serde_json::to_string_pretty(&checks)?);
                }
                ProbeCommands::Missing { tab, limit } => {
                    let mut reports = match tab {
                        Some(tab) => {
                            let tag = ctv_sync::parse_source_tag(&tab)
                                .with_context(|| format!("unknown tab '{tab}'"))?;
                            vec![probe_runner.missing(tag).await?]
                        }
                        None => probe_runner.missing_all().await?,
                    };
                    for report in &mut reports {
                        report.missing_phones.truncate(limit);
                    }
                    println!("{}", serde_json::to_string_pretty(&reports)?);
                }
                ProbeCommands::Trace { phone } => {
                    let report = probe_runner.trace(&phone).await?;
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
            }
        }
    }
    Ok(())
}

fn sheet_client() -> Result<Arc<dyn SheetClient>> {
    let config = SheetsConfig::from_env()?;
    Ok(Arc::new(RestSheetClient::new(config)?))
}
