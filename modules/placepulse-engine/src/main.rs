use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use placepulse_common::{Config, Destination};
use placepulse_engine::stages::{
    LodgingCensusStage, SearchFootprintStage, VisitorAllocationStage,
};
use placepulse_engine::traits::{
    CapacitySource, FootprintSource, LabelSource, ListingsSource, RegistrySource, SerpSource,
};
use placepulse_engine::{Coordinator, PgRunStore};
use placepulse_providers::{
    classifier, places, ClassifierClient, Pacer, PacerConfig, PlacesClient, RankIndexClient,
    RegistryClient, SerpClient, StatBaseClient,
};

#[derive(Parser)]
#[command(name = "placepulse", about = "Destination digital-presence audit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a run for a destination and advance it as far as it can go.
    Run {
        /// Path to a destination description (JSON).
        #[arg(long)]
        destination: PathBuf,
    },
    /// Resume an existing run: start every stage whose upstreams are done.
    Resume {
        #[arg(long)]
        run_id: Uuid,
    },
    /// Confirm a parked stage with a reviewed subset, then advance.
    Confirm {
        #[arg(long)]
        run_id: Uuid,
        #[arg(long)]
        stage: String,
        /// Path to the confirmed subset (JSON object).
        #[arg(long)]
        confirmed: PathBuf,
    },
    /// Print a run's stage statuses and spend.
    Status {
        #[arg(long)]
        run_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("placepulse=info".parse()?))
        .init();

    let cli = Cli::parse();

    info!("PlacePulse starting...");
    let config = Config::from_env();
    config.log_redacted();

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("connecting to postgres")?;
    let store = PgRunStore::new(pool);
    store.migrate().await?;

    let coordinator = build_coordinator(store, &config);

    match cli.command {
        Command::Run { destination } => {
            let raw = std::fs::read_to_string(&destination)
                .with_context(|| format!("reading {}", destination.display()))?;
            let destination: Destination =
                serde_json::from_str(&raw).context("parsing destination JSON")?;
            let run = coordinator.create_run(destination).await?;
            let run = coordinator.advance(run.id).await?;
            print_run(&run);
        }
        Command::Resume { run_id } => {
            let run = coordinator.advance(run_id).await?;
            print_run(&run);
        }
        Command::Confirm {
            run_id,
            stage,
            confirmed,
        } => {
            let raw = std::fs::read_to_string(&confirmed)
                .with_context(|| format!("reading {}", confirmed.display()))?;
            let subset: serde_json::Value =
                serde_json::from_str(&raw).context("parsing confirmed JSON")?;
            coordinator.confirm_stage(run_id, &stage, subset).await?;
            let run = coordinator.advance(run_id).await?;
            print_run(&run);
        }
        Command::Status { run_id } => {
            let run = coordinator.get_run(run_id).await?;
            print_run(&run);
        }
    }

    Ok(())
}

/// Wire the stage pipeline. A missing API key leaves that provider family
/// out; the affected escalation steps report skipped instead of failing.
fn build_coordinator(store: PgRunStore, config: &Config) -> Coordinator<PgRunStore> {
    let pacer = Arc::new(Pacer::new(PacerConfig::default()));
    // The free-tier providers tolerate far less than the default rate.
    pacer.configure(
        places::PROVIDER,
        PacerConfig {
            min_spacing: Duration::from_millis(500),
            max_in_flight: Some(2),
        },
    );
    pacer.configure(
        classifier::PROVIDER,
        PacerConfig {
            min_spacing: Duration::from_millis(1000),
            max_in_flight: Some(1),
        },
    );

    let rank_index: Option<Arc<dyn FootprintSource>> = config
        .rank_index_api_key
        .as_deref()
        .map(|k| Arc::new(RankIndexClient::new(k, pacer.clone())) as _);
    let serp: Option<Arc<dyn SerpSource>> = config
        .serp_api_key
        .as_deref()
        .map(|k| Arc::new(SerpClient::new(k, pacer.clone())) as _);
    let registry: Option<Arc<dyn RegistrySource>> = config
        .registry_api_key
        .as_deref()
        .map(|k| Arc::new(RegistryClient::new(k, pacer.clone())) as _);
    let statbase: Option<Arc<dyn CapacitySource>> = config
        .statbase_api_key
        .as_deref()
        .map(|k| Arc::new(StatBaseClient::new(k, pacer.clone())) as _);
    let listings: Option<Arc<dyn ListingsSource>> = config
        .places_api_key
        .as_deref()
        .map(|k| Arc::new(PlacesClient::new(k, pacer.clone())) as _);
    let labeler: Option<Arc<dyn LabelSource>> = config
        .anthropic_api_key
        .as_deref()
        .map(|k| Arc::new(ClassifierClient::new(k, pacer.clone())) as _);

    let budget = config.budget_limit_cents;
    Coordinator::new(store)
        .register(Arc::new(SearchFootprintStage::new(
            rank_index,
            serp,
            labeler.clone(),
            budget,
        )))
        .register(Arc::new(LodgingCensusStage::new(registry, listings, budget)))
        .register(Arc::new(VisitorAllocationStage::new(
            statbase, labeler, budget,
        )))
}

fn print_run(run: &placepulse_common::AuditRun) {
    println!("run {}  destination {}", run.id, run.destination.slug);
    for (stage, status) in &run.statuses {
        let errors = run
            .stages
            .get(stage)
            .map(|r| r.partial_errors.len())
            .unwrap_or(0);
        println!("  {stage:<24} {status:?}  partial_errors={errors}");
    }
    println!("  total spend: {} cents", run.total_cost_cents);
}
