//! Service lifecycle: bounded startup, worker supervision, ordered shutdown.

use crate::api::{self, AppState};
use crate::classifier::CrawlerClassifier;
use crate::config::Config;
use crate::error::Error;
use crate::hotlink::HotlinkIngestor;
use crate::ingest::Ingestor;
use crate::policy::Enforcer;
use crate::store::{BanStore, HitStore, HotlinkStore, WhitelistStore};
use lapin::{Connection, ConnectionProperties};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
const STARTUP_RETRY: Duration = Duration::from_millis(100);

const AUTOWHITELIST_PERIOD: Duration = Duration::from_secs(60 * 60);
const AUTOBAN_PERIOD: Duration = Duration::from_secs(60);
const GC_PERIOD: Duration = Duration::from_secs(60 * 60);

// Sized above the concurrent writer count: two ingestors, two policy
// schedulers, three sweepers, plus the HTTP worker pool.
const POOL_SIZE: u32 = 12;

/// Connect to the database and ping it, retrying every 100 ms within the
/// startup deadline. A deadline miss is fatal to startup.
pub async fn connect_db(dsn: &str) -> Result<PgPool, Error> {
    let deadline = tokio::time::Instant::now() + STARTUP_TIMEOUT;
    info!("waiting for database");

    loop {
        match ping_db(dsn).await {
            Ok(pool) => return Ok(pool),
            Err(e) if tokio::time::Instant::now() >= deadline => return Err(e),
            Err(_) => tokio::time::sleep(STARTUP_RETRY).await,
        }
    }
}

async fn ping_db(dsn: &str) -> Result<PgPool, Error> {
    let pool = PgPoolOptions::new()
        .max_connections(POOL_SIZE)
        .connect(dsn)
        .await?;
    sqlx::query("SELECT 1").execute(&pool).await?;
    Ok(pool)
}

/// Connect to the message bus with the same retry policy as the database.
pub async fn connect_bus(url: &str) -> Result<Connection, Error> {
    let deadline = tokio::time::Instant::now() + STARTUP_TIMEOUT;
    info!("waiting for message bus");

    loop {
        match Connection::connect(url, ConnectionProperties::default()).await {
            Ok(conn) => return Ok(conn),
            Err(e) if tokio::time::Instant::now() >= deadline => return Err(e.into()),
            Err(_) => tokio::time::sleep(STARTUP_RETRY).await,
        }
    }
}

/// Apply schema migrations. Already-applied migrations are a no-op.
pub async fn apply_migrations(config: &Config) -> Result<(), Error> {
    let dir = match &config.migrations.dir {
        Some(dir) => dir.clone(),
        None => default_migrations_dir()?,
    };
    info!(dir = %dir.display(), "applying migrations");

    let migrator = sqlx::migrate::Migrator::new(dir)
        .await
        .map_err(sqlx::Error::from)?;

    let dsn = config.migrations.dsn.as_deref().unwrap_or(&config.dsn);
    let pool = PgPoolOptions::new().max_connections(1).connect(dsn).await?;
    migrator.run(&pool).await.map_err(sqlx::Error::from)?;
    pool.close().await;

    info!("migrations applied");
    Ok(())
}

fn default_migrations_dir() -> Result<PathBuf, Error> {
    let exe = std::env::current_exe().map_err(sqlx::Error::Io)?;
    let dir = exe.parent().unwrap_or_else(|| std::path::Path::new("."));
    Ok(dir.join("migrations"))
}

struct Worker {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Send the stop token and wait for the worker to drain. A worker that
    /// already exited has dropped its receiver; that is not an error.
    async fn stop(self) {
        let _ = self.stop.send(()).await;
        let _ = self.handle.await;
    }
}

/// The full service: stores, ingestor, schedulers, sweepers and the HTTP
/// control API, sharing one pool and one bus connection.
pub struct Service {
    pool: PgPool,
    bus: Connection,
    pub hits: HitStore,
    pub bans: BanStore,
    pub whitelist: WhitelistStore,
    pub hotlink: HotlinkStore,
    pub enforcer: Enforcer,
    autowhitelist: Worker,
    autoban: Worker,
    hit_gc: Worker,
    ban_gc: Worker,
    hotlink_gc: Worker,
    ingest: Worker,
    hotlink_ingest: Worker,
    http: Worker,
}

impl Service {
    /// Bring everything up in dependency order: database, migrations, bus,
    /// stores, then the workers.
    pub async fn start(config: &Config) -> anyhow::Result<Self> {
        let pool = connect_db(&config.dsn).await?;
        apply_migrations(config).await?;
        let bus = connect_bus(&config.rabbitmq).await?;

        let hits = HitStore::new(pool.clone());
        let bans = BanStore::new(pool.clone());
        let whitelist = WhitelistStore::new(pool.clone());
        let hotlink = HotlinkStore::new(pool.clone());
        let enforcer = Enforcer::new(
            hits.clone(),
            bans.clone(),
            whitelist.clone(),
            CrawlerClassifier::new(),
        );

        let ingestor = Ingestor::new(&bus, &config.monitoring_queue, hits.clone()).await?;
        let (ingest_stop, ingest_stop_rx) = mpsc::channel(1);
        let ingest_handle = tokio::spawn(async move {
            if let Err(e) = ingestor.run(ingest_stop_rx).await {
                error!(error = %e, "ingestor failed");
            }
        });

        let hotlink_ingestor =
            HotlinkIngestor::new(&bus, &config.hotlink_queue, hotlink.clone()).await?;
        let (hotlink_ingest_stop, hotlink_ingest_stop_rx) = mpsc::channel(1);
        let hotlink_ingest_handle = tokio::spawn(async move {
            if let Err(e) = hotlink_ingestor.run(hotlink_ingest_stop_rx).await {
                error!(error = %e, "hotlink ingestor failed");
            }
        });

        let autowhitelist = {
            let enforcer = enforcer.clone();
            spawn_scheduler("autowhitelist", AUTOWHITELIST_PERIOD, false, move || {
                let enforcer = enforcer.clone();
                async move { enforcer.auto_whitelist().await }
            })
        };

        let autoban = {
            let enforcer = enforcer.clone();
            spawn_scheduler("autoban", AUTOBAN_PERIOD, false, move || {
                let enforcer = enforcer.clone();
                async move { enforcer.auto_ban().await }
            })
        };

        let hit_gc = {
            let hits = hits.clone();
            spawn_scheduler("hit-gc", GC_PERIOD, true, move || {
                let hits = hits.clone();
                async move {
                    let deleted = hits.gc().await?;
                    info!(deleted, "hit buckets swept");
                    Ok(())
                }
            })
        };

        let ban_gc = {
            let bans = bans.clone();
            spawn_scheduler("ban-gc", GC_PERIOD, true, move || {
                let bans = bans.clone();
                async move {
                    let deleted = bans.gc().await?;
                    info!(deleted, "lapsed bans swept");
                    Ok(())
                }
            })
        };

        let hotlink_gc = {
            let hotlink = hotlink.clone();
            spawn_scheduler("hotlink-gc", GC_PERIOD, true, move || {
                let hotlink = hotlink.clone();
                async move {
                    let deleted = hotlink.gc().await?;
                    info!(deleted, "referers swept");
                    Ok(())
                }
            })
        };

        let listener = TcpListener::bind(&config.http.listen).await?;
        let app = api::router(AppState {
            hits: hits.clone(),
            bans: bans.clone(),
            whitelist: whitelist.clone(),
            hotlink: hotlink.clone(),
        });
        let (http_stop, mut http_stop_rx) = mpsc::channel::<()>(1);
        let http_handle = tokio::spawn(async move {
            info!("http server started");
            let shutdown = async move {
                let _ = http_stop_rx.recv().await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %e, "http server failed");
            }
            info!("http server stopped");
        });

        info!(listen = %config.http.listen, "service started");

        Ok(Self {
            pool,
            bus,
            hits,
            bans,
            whitelist,
            hotlink,
            enforcer,
            autowhitelist,
            autoban,
            hit_gc,
            ban_gc,
            hotlink_gc,
            ingest: Worker {
                stop: ingest_stop,
                handle: ingest_handle,
            },
            hotlink_ingest: Worker {
                stop: hotlink_ingest_stop,
                handle: hotlink_ingest_handle,
            },
            http: Worker {
                stop: http_stop,
                handle: http_handle,
            },
        })
    }

    /// Block until SIGINT or SIGTERM, then drain everything.
    pub async fn run_until_shutdown(self) {
        wait_for_signal().await;
        info!("shutdown signal received");
        self.shutdown().await;
    }

    /// Ordered teardown. The policy schedulers stop first (they are the
    /// writers most likely to race), then the sweepers and the ingestor,
    /// then the HTTP server drains, and the shared connections close last.
    pub async fn shutdown(self) {
        self.autowhitelist.stop().await;
        self.autoban.stop().await;
        self.hit_gc.stop().await;
        self.ban_gc.stop().await;
        self.hotlink_gc.stop().await;
        self.ingest.stop().await;
        self.hotlink_ingest.stop().await;
        self.http.stop().await;

        if let Err(e) = self.bus.close(200, "shutdown").await {
            warn!(error = %e, "failed to close bus connection");
        }
        self.pool.close().await;

        info!("service stopped");
    }
}

/// Spawn a ticking worker. The first pass runs one full period after start.
/// `stop_on_error` distinguishes the sweepers (an error ends that loop, the
/// process stays up) from the policy passes (an error is a warning and the
/// next tick retries from scratch).
fn spawn_scheduler<F, Fut>(
    name: &'static str,
    period: Duration,
    stop_on_error: bool,
    mut task: F,
) -> Worker
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), Error>> + Send,
{
    let (stop, mut stop_rx) = mpsc::channel::<()>(1);

    let handle = tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        info!(scheduler = name, "scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = task().await {
                        if stop_on_error {
                            error!(scheduler = name, error = %e, "scheduler failed");
                            break;
                        }
                        warn!(scheduler = name, error = %e, "pass failed");
                    }
                }
                _ = stop_rx.recv() => break,
            }
        }

        info!(scheduler = name, "scheduler stopped");
    });

    Worker { stop, handle }
}

/// Resolve when either SIGINT or SIGTERM arrives.
pub async fn wait_for_signal() {
    let sigint = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = sigint => {}
        _ = sigterm => {}
    }
}
