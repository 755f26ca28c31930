//! Activity feed gRPC server.
//!
//! Serves `ReceiveActivityUpdates` and `GetActivities` over gRPC, reading
//! documents from PostgreSQL and keeping cursors in Redis. A standard gRPC
//! health service runs next to it. With `--tls-cert`/`--tls-key` the server
//! speaks TLS; adding `--tls-client-ca` requires client certificates.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::info;

use activity_feed::config::{FeedConfig, DEFAULT_NAMESPACE};
use activity_feed::logging::{self, LogFormat};
use activity_feed::storage::{postgres, CursorStore, PgDocumentSource, RedisCursorStore};
use activity_feed::transport::proto::activities_service_server::ActivitiesServiceServer;
use activity_feed::transport::ActivitiesServiceImpl;
use activity_feed::{ActivityFeed, SourceKind, SourceSet};

/// Server configuration
#[derive(Debug, Parser)]
#[command(name = "activity-feed-server", version, about = "Activity feed gRPC server")]
struct Args {
    /// Address to bind to
    #[arg(long, env = "FEED_ADDR", default_value = "127.0.0.1:50051")]
    addr: SocketAddr,

    /// Redis URL holding cursors and sequence counters
    #[arg(long, env = "FEED_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// PostgreSQL URL holding the watched collections
    #[arg(long, env = "FEED_DATABASE_URL")]
    database_url: String,

    /// Maximum PostgreSQL connections
    #[arg(long, env = "FEED_DB_MAX_CONNECTIONS", default_value_t = 8)]
    db_max_connections: u32,

    /// Cursor key namespace
    #[arg(long, env = "FEED_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Max records per fetch
    #[arg(long, env = "FEED_BATCH_SIZE", default_value_t = 1000)]
    batch_size: usize,

    /// Sleep between polls of a drained source, in milliseconds
    #[arg(long, env = "FEED_POLL_INTERVAL_MS", default_value_t = 5000)]
    poll_interval_ms: u64,

    /// Per-session fan-in queue capacity
    #[arg(long, env = "FEED_QUEUE_CAPACITY", default_value_t = 1024)]
    queue_capacity: usize,

    /// How long a cancelled session waits for its pollers, in milliseconds
    #[arg(long, env = "FEED_SHUTDOWN_GRACE_MS", default_value_t = 5000)]
    shutdown_grace_ms: u64,

    /// Base log level
    #[arg(long, env = "FEED_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log format: compact or json
    #[arg(long, env = "FEED_LOG_FORMAT", default_value = "compact")]
    log_format: LogFormat,

    /// PEM server certificate; enables TLS together with `--tls-key`
    #[arg(long, env = "FEED_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM server private key
    #[arg(long, env = "FEED_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// PEM CA bundle; clients must present a certificate it signed
    #[arg(long, env = "FEED_TLS_CLIENT_CA", requires = "tls_cert")]
    tls_client_ca: Option<PathBuf>,
}

impl Args {
    fn feed_config(&self) -> FeedConfig {
        FeedConfig {
            namespace: self.namespace.clone(),
            batch_size: self.batch_size,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            queue_capacity: self.queue_capacity,
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            ..FeedConfig::default()
        }
    }

    async fn tls_config(&self) -> Result<Option<ServerTlsConfig>, Box<dyn std::error::Error>> {
        let (Some(cert), Some(key)) = (&self.tls_cert, &self.tls_key) else {
            return Ok(None);
        };
        let identity = Identity::from_pem(read_pem(cert).await?, read_pem(key).await?);
        let mut tls = ServerTlsConfig::new().identity(identity);
        if let Some(ca) = &self.tls_client_ca {
            tls = tls.client_ca_root(Certificate::from_pem(read_pem(ca).await?));
        }
        Ok(Some(tls))
    }
}

async fn read_pem(path: &Path) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| format!("failed to read {}: {e}", path.display()).into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    logging::init(&args.log_level, args.log_format)?;
    info!(version = env!("CARGO_PKG_VERSION"), "starting activity feed server");

    let config = args.feed_config();
    config.validate()?;

    let cursors: Arc<dyn CursorStore> = Arc::new(RedisCursorStore::connect(&args.redis_url).await?);
    info!("connected to redis");

    let pool = postgres::connect(&args.database_url, args.db_max_connections).await?;
    postgres::ensure_schema(&pool).await?;
    info!("connected to postgres");

    let sources = SourceKind::ALL.into_iter().fold(SourceSet::new(), |set, kind| {
        set.with(Arc::new(PgDocumentSource::new(pool.clone(), kind)))
    });

    let feed = ActivityFeed::new(config, sources, cursors)?;
    let svc = ActivitiesServiceImpl::new(feed).into_server();

    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<ActivitiesServiceServer<ActivitiesServiceImpl>>()
        .await;

    let mut builder = Server::builder();
    match args.tls_config().await? {
        Some(tls) => {
            info!(mutual = args.tls_client_ca.is_some(), "TLS enabled");
            builder = builder.tls_config(tls)?;
        }
        None => info!("TLS disabled, serving plaintext"),
    }

    info!(addr = %args.addr, "serving gRPC");
    builder
        .add_service(health_service)
        .add_service(svc)
        .serve_with_shutdown(args.addr, async {
            let _ = signal::ctrl_c().await;
        })
        .await?;

    info!("shut down");
    Ok(())
}
