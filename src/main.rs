// =============================================================================
// Kline Recorder - Main Entry Point
// =============================================================================
//
// Subscribes to the Binance kline stream for one (instrument, resolution) at a
// time, appends every closed candle to that key's series and persists it
// after each append. Selections come in on stdin; the series is re-published
// after every append and every switch.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod console;
mod diagnostics;
mod error;
mod ingestion;
mod market_data;
mod runtime_config;
mod series_store;
mod types;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::diagnostics::Diagnostics;
use crate::ingestion::{Command, IngestionController};
use crate::market_data::WsTransport;
use crate::runtime_config::RuntimeConfig;
use crate::series_store::{DirStorage, MemoryStorage, SeriesStore, Storage};

const CONFIG_PATH: &str = "kline_recorder.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Kline Recorder starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env(|name| std::env::var(name).ok());

    info!(
        feed = %config.feed_base_url,
        default_key = %config.default_key(),
        data_dir = %config.data_dir.display(),
        ephemeral = config.ephemeral,
        "Configuration resolved"
    );

    // ── 2. Storage ───────────────────────────────────────────────────────
    let diagnostics = Arc::new(Diagnostics::new(config.max_recent_errors));
    let storage: Arc<dyn Storage> = if config.ephemeral {
        Arc::new(MemoryStorage::new())
    } else {
        Arc::new(DirStorage::open(&config.data_dir)?)
    };
    let store = SeriesStore::new(storage, diagnostics.clone());

    // ── 3. Ingestion controller (opens the default stream) ───────────────
    let controller =
        IngestionController::start(&config, store, Arc::new(WsTransport), diagnostics);
    let snapshots = controller.subscribe();
    let console_diagnostics = controller.diagnostics().clone();

    let (command_tx, command_rx) = mpsc::channel(32);
    let ingest = tokio::spawn(controller.run(command_rx));

    // ── 4. Series output ─────────────────────────────────────────────────
    let mut watch_rx = snapshots.clone();
    tokio::spawn(async move {
        while watch_rx.changed().await.is_ok() {
            let snap = watch_rx.borrow_and_update().clone();
            if snap.series.is_empty() {
                info!(key = %snap.key, version = snap.version, "series empty");
                continue;
            }
            let series = &snap.series;
            info!(
                key = %snap.key,
                len = series.len(),
                last = ?series.labels().last(),
                open = ?series.opens().last(),
                high = ?series.highs().last(),
                low = ?series.lows().last(),
                close = ?series.closes().last(),
                version = snap.version,
                "series updated"
            );
        }
    });

    // ── 5. Selection input ───────────────────────────────────────────────
    tokio::spawn(console::run_console(command_tx.clone(), snapshots, console_diagnostics));

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("Shutdown signal received - stopping gracefully");
            let _ = command_tx.send(Command::Shutdown).await;
        }
        _ = command_tx.closed() => {}
    }

    ingest.await?;
    info!("Kline Recorder shut down complete.");
    Ok(())
}
