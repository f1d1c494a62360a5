//! ==============================================================================
//! main.rs - moisture host entry point
//! ==============================================================================
//!
//! purpose:
//!     wires the ingestion pipeline to the push channel and serves both.
//!
//! responsibilities:
//!     - load configuration (fatal on degenerate calibration)
//!     - start the mqtt listener on its own thread
//!     - run the handoff pump and the http / websocket server on tokio
//!     - stop everything on ctrl-c / sigterm
//!
//! architecture:
//!
//!     ┌───────────────────────────┐        ┌──────────────────────────────────┐
//!     │ mqtt-listener (os thread) │        │          tokio runtime           │
//!     │                           │ handoff│  ┌────────┐    ┌──────────────┐  │
//!     │ parse -> store -> deliver ├───────>│  │  pump  ├───>│   registry   │  │
//!     │                           │ (mpsc) │  └────────┘    └──────┬───────┘  │
//!     └───────────────────────────┘        │                       │ outboxes │
//!                                          │  axum: /ws/updates  <─┘          │
//!                                          │        /health /system/status    │
//!                                          └──────────────────────────────────┘
//!
//! ==============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use moisture_host::config::HostConfig;
use moisture_host::handoff::{self, ProcessBridge};
use moisture_host::ingest::IngestionBridge;
use moisture_host::push::ConnectionRegistry;
use moisture_host::server::{self, AppState};
use moisture_host::store::{ReadingStore, SqliteStore};
use moisture_host::TelemetryParser;

#[tokio::main]
async fn main() -> Result<()> {
    println!("===========================================================");
    println!("  Soil Moisture Host");
    println!("  MQTT -> calibrate -> store -> live push");
    println!("===========================================================");

    // step 1: configuration. calibration is validated here; equal dry/wet aborts.
    let config = HostConfig::load_or_default().context("invalid configuration")?;

    // step 2: logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    config.print_summary();

    // step 3: push side (this runtime owns the registry)
    let registry = Arc::new(ConnectionRegistry::new(
        config.push.authenticator()?,
        config.push.send_timeout(),
    ));
    let (bridge, handoff_rx) = ProcessBridge::channel(config.push.handoff_capacity);
    let pump = handoff::spawn_pump(registry.clone(), handoff_rx);

    // step 4: ingestion side (own thread)
    let store: Arc<dyn ReadingStore> = Arc::new(
        SqliteStore::open(&config.storage.database_url).context("failed to open reading store")?,
    );
    let ingestion = IngestionBridge::new(TelemetryParser::new(config.calibration), store.clone(), bridge)
        .show_readings(config.logging.show_readings);
    let link = ingestion.link_status();
    let listener = ingestion
        .spawn(&config.mqtt)
        .context("failed to start mqtt listener thread")?;

    // step 5: serve until a shutdown signal
    let app = server::router(
        AppState {
            registry,
            store,
            link,
            outbox_capacity: config.push.outbox_capacity,
        },
        &config.server.allowed_origins,
    );
    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let tcp = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("push channel live at ws://{}/ws/updates", addr);

    let served = axum::serve(tcp, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // step 6: stop the listener first so nothing new enters the handoff
    info!("shutting down");
    tokio::task::spawn_blocking(move || listener.shutdown())
        .await
        .context("listener shutdown task failed")?;
    if let Err(e) = pump.await {
        error!("handoff pump ended abnormally: {}", e);
    }

    served.context("http server error")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to listen for sigterm: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received sigterm"),
    }
}
