use std::sync::Arc;
use std::time::Duration;

use adwatch_adapters::{
    ClassifiedAdConfig, GeoIndex, NotificationSink, PhoneLookup, RoomSearchConfig, Session,
    StaticSessionProvider,
};
use adwatch_cycle::{
    ClassifiedAdFactory, CollectorFactory, ContactEnrichment, CycleConfig, CycleRunner,
    RoomFactory, ScopeRegistry,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "adwatch")]
#[command(about = "Marketplace listing watcher")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scan cycle and exit.
    Cycle,
    /// Run cycles on the configured cron schedule until interrupted.
    Watch,
    /// Print the scope registry as the runner would load it.
    Scopes,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_runner(config: CycleConfig) -> Result<Arc<CycleRunner>> {
    let mut factories: Vec<Box<dyn CollectorFactory>> = Vec::new();

    let notifications = match &config.webhook_url {
        Some(url) => Some(NotificationSink::new(url.clone())?),
        None => None,
    };
    let enrichment = ContactEnrichment::new(
        PhoneLookup::production()?,
        notifications,
        Duration::from_millis(config.enrichment_delay_ms),
    );
    factories.push(Box::new(ClassifiedAdFactory::new(
        ClassifiedAdConfig::default(),
        Some(enrichment),
    )));

    // The room source needs an authenticated session; without one it
    // stays unregistered and its registry entry is skipped with a
    // warning each cycle.
    match room_session_from_env() {
        Some(session) => {
            let geo = load_geo_index()?;
            factories.push(Box::new(RoomFactory::new(
                RoomSearchConfig::default(),
                Arc::new(StaticSessionProvider::new(session)),
                geo,
            )));
        }
        None => {
            warn!("ADWATCH_ROOMS_CSRF / ADWATCH_ROOMS_COOKIES unset, rental-rooms source disabled");
        }
    }

    Ok(Arc::new(CycleRunner::new(config, factories)?))
}

fn room_session_from_env() -> Option<Session> {
    let csrf_token = std::env::var("ADWATCH_ROOMS_CSRF").ok()?;
    let cookies = std::env::var("ADWATCH_ROOMS_COOKIES").ok()?;
    Some(Session {
        csrf_token,
        cookies,
    })
}

fn load_geo_index() -> Result<GeoIndex> {
    let districts = std::env::var("ADWATCH_GEO_DISTRICTS");
    let wards = std::env::var("ADWATCH_GEO_WARDS");
    match (districts, wards) {
        (Ok(districts), Ok(wards)) => GeoIndex::from_data_files(&districts, &wards)
            .context("loading administrative-area data files"),
        _ => {
            warn!("geo data files unset, ward/district codes will not be resolved");
            Ok(GeoIndex::default())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = CycleConfig::from_env();

    match cli.command.unwrap_or(Commands::Cycle) {
        Commands::Cycle => {
            let runner = build_runner(config)?;
            let summary = runner.run_once().await?;
            println!(
                "cycle complete: run_id={} scanned={} aborted={} records={} soft_deleted={} restored={}",
                summary.run_id,
                summary.scopes_scanned,
                summary.scopes_aborted,
                summary.records_seen,
                summary.soft_deleted,
                summary.restored,
            );
        }
        Commands::Watch => {
            let mut config = config;
            config.scheduler_enabled = true;
            let cron = config.cycle_cron.clone();
            let runner = build_runner(config)?;
            let scheduler = runner
                .maybe_build_scheduler()
                .await?
                .context("scheduler not built despite being enabled")?;
            scheduler.start().await.context("starting scheduler")?;
            info!(cron, "watching; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("shutting down");
        }
        Commands::Scopes => {
            let registry = ScopeRegistry::load(&config.registry_path).await?;
            for source in &registry.sources {
                println!(
                    "{} enabled={} rotation={:?} scopes={}",
                    source.source_id,
                    source.enabled,
                    source.rotation,
                    source.scopes.join(",")
                );
            }
        }
    }

    Ok(())
}
