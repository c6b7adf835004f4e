//! ingestord: scrapes retailer release catalogs, canonicalizes and
//! deduplicates them, detects state changes, and fans those changes out to
//! subscribed users over email/webhook/push.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ingestord::config::Config;
use ingestord::delivery::{self, DeliveryChannel, EmailSender, PushSender, WebhookSender};
use ingestord::fetch::HttpFetcher;
use ingestord::models::{ChannelKind, Target};
use ingestord::parsers::ParserRegistry;
use ingestord::pipeline::Pipeline;
use ingestord::priority::ScoringModel;
use ingestord::scheduler::health::HealthTracker;
use ingestord::scheduler::Scheduler;
use ingestord::storage::{MemoryStorage, SqliteStorage, StorageGateway};
use ingestord::subscriptions::SubscriptionIndex;

#[derive(Parser, Debug)]
#[command(name = "ingestord", about = "Release ingestion and fanout core")]
struct Cli {
    /// Path to a TOML file listing scrape targets.
    #[arg(long, env = "INGESTORD_TARGETS")]
    targets: Option<String>,

    /// Run against an in-memory, non-persistent storage gateway.
    #[arg(long)]
    ephemeral: bool,

    /// Address to serve Prometheus metrics on.
    #[arg(long, default_value = "127.0.0.1:9898")]
    metrics_addr: SocketAddr,

    /// Number of delivery workers spun up per channel kind.
    #[arg(long, default_value_t = 4)]
    delivery_workers_per_channel: usize,

    /// Number of scheduler fetch/parse/canonicalize workers.
    #[arg(long, default_value_t = 16)]
    fetch_workers: usize,
}

#[derive(Debug, serde::Deserialize)]
struct TargetCatalog {
    #[serde(default)]
    target: Vec<Target>,
}

fn load_targets(path: &str) -> Result<Vec<Target>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading target catalog {path}"))?;
    let catalog: TargetCatalog = toml::from_str(&raw).with_context(|| format!("parsing target catalog {path}"))?;
    Ok(catalog.target)
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "ingestord=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = Config::from_env();

    PrometheusBuilder::new()
        .with_http_listener(cli.metrics_addr)
        .install()
        .context("failed to install prometheus metrics exporter")?;

    let storage: Arc<dyn StorageGateway> = if cli.ephemeral {
        info!("running with ephemeral in-memory storage");
        Arc::new(MemoryStorage::new())
    } else {
        Arc::new(SqliteStorage::open(&config.database_path)?)
    };

    let subscriptions = Arc::new(RwLock::new(SubscriptionIndex::new()));
    for sub in storage.all_subscriptions().await? {
        subscriptions.write().upsert(sub);
    }

    let health = Arc::new(HealthTracker::with_thresholds(
        config.scraper_cb_threshold,
        config.cb_cooldown(),
    ));
    let scheduler = Arc::new(Scheduler::new(health.clone(), config.max_parallel_per_pool));

    match &cli.targets {
        Some(path) => {
            for target in load_targets(path)? {
                scheduler.register_target(target);
            }
        }
        None => warn!("no --targets catalog supplied, scheduler has nothing to dispatch"),
    }

    let pipeline = Arc::new(Pipeline::new(
        Arc::new(HttpFetcher::new()?),
        Arc::new(ParserRegistry::with_defaults()),
        storage.clone(),
        subscriptions,
        ScoringModel::default(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_tick = config.scheduler_tick();
    let health_flush_interval = config.health_flush_interval();
    let lease_sweep_interval = config.lease_sweep_interval();
    let fetch_workers = cli.fetch_workers;

    let scheduler_handle = {
        let scheduler = scheduler.clone();
        let pipeline = pipeline.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            scheduler.run(pipeline, scheduler_tick, fetch_workers, rx).await;
        })
    };

    let health_flush_handle = {
        let health = health.clone();
        let storage = storage.clone();
        let mut rx = shutdown_rx.clone();
        let interval = health_flush_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = health.flush_if_due(storage.as_ref(), interval).await {
                            warn!(error = %e, "health flush failed");
                        }
                    }
                    _ = rx.changed() => {
                        if *rx.borrow() { break; }
                    }
                }
            }
        })
    };

    let lease_sweep_handle = {
        let storage = storage.clone();
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(lease_sweep_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match storage.expire_leases().await {
                            Ok(0) => {}
                            Ok(n) => info!(reclaimed = n, "expired delivery leases reclaimed"),
                            Err(e) => warn!(error = %e, "lease sweep failed"),
                        }
                    }
                    _ = rx.changed() => {
                        if *rx.borrow() { break; }
                    }
                }
            }
        })
    };

    let mut delivery_handles = Vec::new();
    let channels: Vec<Arc<dyn DeliveryChannel>> = vec![
        Arc::new(EmailSender::new()?),
        Arc::new(WebhookSender::new(ChannelKind::Discord)?),
        Arc::new(WebhookSender::new(ChannelKind::Slack)?),
        Arc::new(WebhookSender::new(ChannelKind::CustomWebhook)?),
        Arc::new(PushSender::new()?),
    ];
    for channel in channels {
        for _ in 0..cli.delivery_workers_per_channel {
            let storage = storage.clone();
            let channel = channel.clone();
            let rx = shutdown_rx.clone();
            delivery_handles.push(tokio::spawn(async move {
                delivery::run_worker(storage.as_ref(), channel.as_ref(), Duration::from_millis(250), rx).await;
            }));
        }
    }

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown signal received, draining workers");
    let _ = shutdown_tx.send(true);

    let _ = scheduler_handle.await;
    let _ = health_flush_handle.await;
    let _ = lease_sweep_handle.await;
    for handle in delivery_handles {
        let _ = handle.await;
    }

    Ok(())
}
