//! Traffic-abuse control service.
//!
//! Counts per-client hits off the message bus, bans rate exceedances and
//! whitelists verified search crawlers.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use trafficwatch::classifier::CrawlerClassifier;
use trafficwatch::config::SentryConfig;
use trafficwatch::hotlink::HotlinkIngestor;
use trafficwatch::ingest::Ingestor;
use trafficwatch::store::{BanStore, HitStore, HotlinkStore, WhitelistStore};
use trafficwatch::{service, Config, Enforcer, Service};

#[derive(Parser, Debug)]
#[command(name = "trafficwatch")]
#[command(author, version, about = "Traffic-abuse control service")]
struct Args {
    /// Path to configuration file (JSON or YAML)
    #[arg(short, long, default_value = "config.yml")]
    config: PathBuf,

    /// Enable JSON logging format
    #[arg(long)]
    json_logs: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP control API, the ingestor and all schedulers
    Serve,

    /// Run only the hit-stream and referer-stream ingestors
    ListenAmqp,

    /// One-shot hourly maintenance: sweep counters, lapsed bans and stale
    /// referers, then run an autowhitelist pass
    SchedulerHourly,

    /// One-shot autoban pass
    SchedulerMinutely,

    /// Apply schema migrations and exit
    Migrate,
}

fn init_observability(sentry: &SentryConfig, json: bool, level: &str) -> sentry::ClientInitGuard {
    let guard = sentry::init(sentry::ClientOptions {
        dsn: sentry.dsn.parse().ok(),
        environment: Some(sentry.environment.clone().into()),
        ..Default::default()
    });

    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::from_default_env().add_directive(level.into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .with(sentry_tracing::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .with(sentry_tracing::layer())
            .init();
    }

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;
    config.validate()?;

    let _sentry = init_observability(&config.sentry, args.json_logs, &args.log_level);

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&config).await,
        Command::ListenAmqp => listen_amqp(&config).await,
        Command::SchedulerHourly => scheduler_hourly(&config).await,
        Command::SchedulerMinutely => scheduler_minutely(&config).await,
        Command::Migrate => {
            service::apply_migrations(&config).await?;
            Ok(())
        }
    }
}

async fn serve(config: &Config) -> Result<()> {
    let service = Service::start(config).await?;
    service.run_until_shutdown().await;
    Ok(())
}

async fn listen_amqp(config: &Config) -> Result<()> {
    let pool = service::connect_db(&config.dsn).await?;
    let bus = service::connect_bus(&config.rabbitmq).await?;

    let ingestor = Ingestor::new(&bus, &config.monitoring_queue, HitStore::new(pool.clone())).await?;
    let hotlink_ingestor =
        HotlinkIngestor::new(&bus, &config.hotlink_queue, HotlinkStore::new(pool.clone())).await?;

    let (stop, stop_rx) = mpsc::channel(1);
    let handle = tokio::spawn(ingestor.run(stop_rx));

    let (hotlink_stop, hotlink_stop_rx) = mpsc::channel(1);
    let hotlink_handle = tokio::spawn(hotlink_ingestor.run(hotlink_stop_rx));

    service::wait_for_signal().await;
    info!("shutdown signal received");

    let _ = stop.send(()).await;
    handle.await??;

    let _ = hotlink_stop.send(()).await;
    hotlink_handle.await??;

    let _ = bus.close(200, "shutdown").await;
    pool.close().await;
    Ok(())
}

async fn scheduler_hourly(config: &Config) -> Result<()> {
    let pool = service::connect_db(&config.dsn).await?;

    let hits = HitStore::new(pool.clone());
    let bans = BanStore::new(pool.clone());
    let whitelist = WhitelistStore::new(pool.clone());
    let enforcer = Enforcer::new(
        hits.clone(),
        bans.clone(),
        whitelist,
        CrawlerClassifier::new(),
    );

    let deleted = hits.gc().await?;
    info!(deleted, "hit buckets swept");

    let deleted = bans.gc().await?;
    info!(deleted, "lapsed bans swept");

    let deleted = HotlinkStore::new(pool.clone()).gc().await?;
    info!(deleted, "referers swept");

    enforcer.auto_whitelist().await?;

    pool.close().await;
    Ok(())
}

async fn scheduler_minutely(config: &Config) -> Result<()> {
    let pool = service::connect_db(&config.dsn).await?;

    let hits = HitStore::new(pool.clone());
    let bans = BanStore::new(pool.clone());
    let whitelist = WhitelistStore::new(pool.clone());
    let enforcer = Enforcer::new(hits, bans, whitelist, CrawlerClassifier::new());

    enforcer.auto_ban().await?;

    pool.close().await;
    Ok(())
}
