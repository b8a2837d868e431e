mod bootstrap;
mod config;
mod http;
mod shutdown;
mod state;
mod telemetry;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tracing::{error, info};

use warden_core::EventSink;
use warden_engine::ExecutionEngineFactory;
use warden_gateway::{ConnectionRegistry, EventRouter};

/// Warden daemon — user-isolated agent execution runtime.
#[derive(Parser, Debug)]
#[command(name = "wardend", version, about)]
struct Cli {
    /// Config file path.
    #[arg(short, long, default_value = "warden.toml")]
    config: PathBuf,

    /// Increase log verbosity (debug level).
    #[arg(short, long)]
    verbose: bool,

    /// Validate config and exit.
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // -----------------------------------------------------------------------
    // 1. Load and validate config
    // -----------------------------------------------------------------------
    let config = config::load_config(&cli.config)?;
    config::validate_config(&config)?;

    if cli.validate {
        println!("config is valid");
        return Ok(());
    }

    // -----------------------------------------------------------------------
    // 2. Initialize tracing
    // -----------------------------------------------------------------------
    telemetry::init_telemetry(cli.verbose);

    info!(agents = config.agents.len(), "wardend starting");

    // -----------------------------------------------------------------------
    // 3. Build the frozen agent catalogue
    // -----------------------------------------------------------------------
    let registry = bootstrap::build_registry(&config)?;

    // -----------------------------------------------------------------------
    // 4. Wire the gateway and engine factory
    // -----------------------------------------------------------------------
    let connections = Arc::new(ConnectionRegistry::new(
        config.gateway.connection_queue_capacity,
    ));
    let router = Arc::new(EventRouter::new(connections.clone(), &config.gateway));
    let sink: Arc<dyn EventSink> = router.clone();
    let factory = Arc::new(ExecutionEngineFactory::new(
        registry.clone(),
        sink,
        config.engine.clone(),
    ));

    let app_state = state::AppState {
        registry,
        factory,
        connections,
        router,
        runs: Arc::new(RwLock::new(HashMap::new())),
        run_index_capacity: config.server.run_index_capacity,
        started_at: Instant::now(),
    };

    // -----------------------------------------------------------------------
    // 5. Start the HTTP server
    // -----------------------------------------------------------------------
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let app = http::api_router(app_state.clone());
    let listener = TcpListener::bind(&config.server.bind_addr).await?;
    info!(bind = %config.server.bind_addr, "api listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_rx.changed().await.ok();
            })
            .await
        {
            error!("api server error: {e}");
        }
    });

    // -----------------------------------------------------------------------
    // 6. Wait for a shutdown signal
    // -----------------------------------------------------------------------
    tokio::spawn(shutdown::signal_listener(shutdown_tx.clone()));

    let mut shutdown_watch = shutdown_tx.subscribe();
    shutdown_watch.changed().await.ok();
    info!("shutdown signal received, beginning graceful shutdown");

    // -----------------------------------------------------------------------
    // 7. Graceful shutdown: cancel live runs, then stop the server
    // -----------------------------------------------------------------------
    let cancelled = app_state.factory.cancel_all();
    if cancelled > 0 {
        info!(runs = cancelled, "graceful shutdown: cancelling live runs");
        // Give engines a moment to emit their terminal events.
        let drain_deadline = Instant::now() + Duration::from_secs(10);
        while app_state.factory.active_runs() > 0 && Instant::now() < drain_deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    info!("graceful shutdown: stopping api server");
    let _ = server_handle.await;

    info!("wardend stopped");
    Ok(())
}
