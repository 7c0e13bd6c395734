use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use canopy::caches::{self, CacheContext};
use canopy::merge::MemberFilter;
use canopy::source::HttpMetadataSource;
use canopy::store::open_store;
use canopy::sync::{Registry, SyncOrchestrator};
use canopy::{decode_column, CanopyConfig, Dataset};

#[derive(Parser)]
#[command(name = "canopy")]
#[command(about = "Cached tabular snapshots of the metadata index", long_about = None)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Refresh every cache
    Sync,

    /// Print cached rows of one or more keys
    Read {
        /// Cache keys; several keys are merged and tagged with asset_name
        #[arg(required = true)]
        keys: Vec<String>,

        /// Maximum rows to print
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Print the column names recorded for a key
    Columns {
        key: String,
    },

    /// List project names
    ProjectNames {
        /// Fetch from the metadata source first
        #[arg(long)]
        refresh: bool,
    },

    /// List subject ids
    SubjectIds {
        /// Fetch from the metadata source first
        #[arg(long)]
        refresh: bool,
    },

    /// Print QC metrics of a subject
    Qc {
        subject_id: String,

        /// Restrict to these asset names
        #[arg(short, long = "asset")]
        assets: Vec<String>,

        /// Fetch from the metadata source first
        #[arg(long)]
        refresh: bool,

        /// Decode json: tagged values
        #[arg(long)]
        decode: bool,
    },

    /// Check that the metadata source is reachable
    Health,
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "canopy=info".into()),
    );
    let registry = tracing_subscriber::registry().with(filter);

    // stdout carries data; logs go to stderr
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn create_context(config: &CanopyConfig) -> Result<CacheContext> {
    let store = open_store(config)
        .await
        .context("Failed to open cache store")?;
    let source = HttpMetadataSource::new(config.source.clone())
        .context("Failed to configure metadata source")?;
    Ok(CacheContext::new(store, Arc::new(source)))
}

fn print_rows(data: &Dataset, limit: Option<usize>) -> Result<()> {
    for record in data.records().take(limit.unwrap_or(usize::MAX)) {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}

fn print_values(values: &[String]) -> Result<()> {
    for value in values {
        println!("{}", serde_json::to_string(value)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    let config = CanopyConfig::from_env().context("Invalid configuration")?;
    config.validate().context("Invalid configuration")?;

    match cli.command {
        Commands::Sync => {
            let ctx = create_context(&config).await?;
            let registry = Registry::standard()?;
            let orchestrator = SyncOrchestrator::new(ctx, registry, config.sync);

            let report = orchestrator.run().await.context("Sync failed")?;
            println!("{}", serde_json::to_string(&report)?);
        }

        Commands::Read { keys, limit } => {
            let ctx = create_context(&config).await?;
            let data = match keys.as_slice() {
                [key] => ctx.store.read(key).await,
                _ => ctx.store.read_many(&keys).await,
            };
            print_rows(&data, limit)?;
        }

        Commands::Columns { key } => {
            let ctx = create_context(&config).await?;
            let columns = ctx
                .store
                .columns(&key)
                .await
                .with_context(|| format!("No column metadata for '{}'", key))?;
            print_values(&columns)?;
        }

        Commands::ProjectNames { refresh } => {
            let ctx = create_context(&config).await?;
            let names = caches::unique_project_names(&ctx, refresh).await?;
            print_values(&names)?;
        }

        Commands::SubjectIds { refresh } => {
            let ctx = create_context(&config).await?;
            let ids = caches::unique_subject_ids(&ctx, refresh).await?;
            print_values(&ids)?;
        }

        Commands::Qc {
            subject_id,
            assets,
            refresh,
            decode,
        } => {
            let ctx = create_context(&config).await?;
            let filter = (!assets.is_empty()).then(|| MemberFilter::List(assets));
            let selection = caches::qc(&ctx, &subject_id, filter, refresh).await?;

            let mut data = selection.data;
            if decode {
                for column in data.columns().to_vec() {
                    data = decode_column(&data, &column)
                        .with_context(|| format!("Failed to decode column '{}'", column))?;
                }
            }
            print_rows(&data, None)?;
        }

        Commands::Health => {
            let source = HttpMetadataSource::new(config.source.clone())?;
            let health = source.health_check().await;
            println!("{}", serde_json::to_string(&health)?);
            if !health.reachable {
                anyhow::bail!("Metadata source unreachable at {}", source.base_url());
            }
        }
    }

    Ok(())
}
