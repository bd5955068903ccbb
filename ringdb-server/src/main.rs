//! RingDB Server - HTTP API for the bounded time-series database

mod api;

use api::App;
use ringdb_core::backend::MemoryBackend;
use ringdb_core::query::QueryEngine;
use ringdb_core::Tsdb;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Server configuration, read from the environment
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen address (`API_HOST`, `API_PORT`)
    pub http_addr: SocketAddr,
    /// Backend cluster file (`FDB_CLUSTER_FILE`); reserved for networked
    /// backend deployments
    pub cluster_file: Option<PathBuf>,
}

impl ServerConfig {
    fn from_env() -> anyhow::Result<Self> {
        let host = std::env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = match std::env::var("API_PORT") {
            Ok(raw) => raw.parse::<u16>().map_err(|_| {
                anyhow::anyhow!("API_PORT must be a port number, got '{}'", raw)
            })?,
            Err(_) => 8086,
        };
        let http_addr = format!("{}:{}", host, port)
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid API_HOST/API_PORT: {}", e))?;
        let cluster_file = std::env::var("FDB_CLUSTER_FILE").ok().map(PathBuf::from);
        Ok(Self { http_addr, cluster_file })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let config = ServerConfig::from_env()?;
    info!("starting ringdb server");
    if let Some(cluster_file) = &config.cluster_file {
        warn!(
            ?cluster_file,
            "FDB_CLUSTER_FILE is set; this build ships the in-memory backend and ignores it"
        );
    }

    let backend = Arc::new(MemoryBackend::new());
    let app = Arc::new(App {
        tsdb: Tsdb::new(backend.clone()),
        engine: QueryEngine::new(backend),
    });

    let router = api::create_router(app);
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!("ringdb server listening on {}", config.http_addr);

    axum::serve(listener, router).await?;
    Ok(())
}
