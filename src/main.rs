//! Vellum Sync Daemon
//!
//! Runs the item sync backend: sync endpoint, health check and the
//! dual-store transition surface.
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults
//! vellum-sync
//!
//! # Start with custom config
//! vellum-sync --config /path/to/config.toml
//!
//! # Start with custom HTTP port
//! vellum-sync --http-port 8095
//!
//! # Start with custom storage directory
//! vellum-sync --storage-dir /data/sync
//!
//! # Enable the dual-store transition surface
//! vellum-sync --enable-transitions
//! ```
//!
//! ## HTTP API
//!
//! - `GET /health` - Health check
//! - `POST /items/sync` - Read and write sync
//! - `POST /transitions/{user}` - Start or resume a store transition

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vellum_sync::services::events::spawn_logging_listener;
use vellum_sync::transition::TransitionConfig;
use vellum_sync::{Config, HttpServer, ItemDb, Services, TransitionRunner};

#[derive(Parser, Debug)]
#[command(name = "vellum-sync")]
#[command(about = "Item sync backend for the Vellum notes platform")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "VELLUM_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// HTTP API port for the sync endpoint
    #[arg(long, env = "VELLUM_HTTP_PORT")]
    http_port: Option<u16>,

    /// Byte budget for a single sync response page
    #[arg(long, env = "VELLUM_TRANSFER_BUDGET")]
    transfer_budget: Option<u64>,

    /// Hard ceiling on the per-request page limit
    #[arg(long, env = "VELLUM_MAX_SYNC_LIMIT")]
    max_sync_limit: Option<u32>,

    /// Enable the dual-store transition surface (opens the secondary
    /// store alongside the primary)
    #[arg(long, env = "VELLUM_ENABLE_TRANSITIONS")]
    enable_transitions: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("vellum_sync=info".parse()?),
        )
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if let Some(budget) = args.transfer_budget {
        config.content_transfer_budget = budget;
    }
    if let Some(limit) = args.max_sync_limit {
        config.max_sync_limit = limit;
    }

    info!(
        storage_dir = %config.storage_dir.display(),
        http_port = config.http_port,
        transfer_budget = config.content_transfer_budget,
        "Starting vellum-sync"
    );

    // Ensure storage directory exists
    tokio::fs::create_dir_all(&config.storage_dir).await?;

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    // Open the primary store and wire the services
    let db = Arc::new(ItemDb::open(&config.primary_db_path())?);
    let services = Arc::new(Services::new(db.clone(), &config));

    // Drain the event bus into the audit log
    spawn_logging_listener(services.events.clone());

    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    let mut http_server = HttpServer::new(services.clone(), http_addr);

    info!("HTTP API available at http://{}", http_addr);
    info!("Endpoints:");
    info!("  GET  /health              - Health check");
    info!("  POST /items/sync          - Read and write sync");

    if args.enable_transitions {
        let secondary = Arc::new(ItemDb::open(&config.secondary_db_path())?);
        let runner = Arc::new(TransitionRunner::new(
            db,
            secondary,
            services.events.clone(),
            services.timer.clone(),
            TransitionConfig::from_config(&config),
        ));
        http_server = http_server.with_transition_runner(runner);
        info!("  POST /transitions/{{user}} - Start or resume a store transition");
    }

    Arc::new(http_server).run().await?;

    Ok(())
}
