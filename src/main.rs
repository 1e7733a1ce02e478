// ===============================
// src/main.rs
// ===============================
/*
 # buka listener untuk satu terminal DLL
 curl -s -X POST 'localhost:8080/dll/connect?dll_id=mt4-a'

 # ringkasan runtime & metrics prometheus
 curl -s localhost:8080/admin/metrics
 curl -s localhost:8080/metrics | egrep '^(events_|enforcements_total|dll_connections_active)'
*/
/*
=============================================================================
Project : dll_guard : DLL trading-event ingestion & enforcement engine in Rust
Module  : main.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Terima event trading dari DLL terminal via TCP (frame u32 LE + JSON),
          proses lewat worker pool bounded, evaluasi rule per user, kirim
          enforcement balik ke DLL & viewer WebSocket, expose admin API dan
          Prometheus metrics, rekam JSONL (opsional).
=============================================================================
*/
mod admin;
mod app;
mod codec;
mod config;
mod connections;
mod domain;
mod health;
mod keyed;
mod metrics;
mod mock;
mod notify;
mod pipeline;
mod recorder;
mod rules;
mod store;
mod users;
mod ws;

use std::sync::Arc;

use tokio::{
    sync::{mpsc, watch},
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app::App;
use crate::recorder::Record;
use crate::store::{MemoryStore, Storage};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // ---- Load config ----
    let args = config::load();

    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        port = args.port,
        ws_port = args.ws_port,
        bind_addr = %args.bind_addr,
        event_buffer = args.event_buffer,
        workers = args.workers,
        enforce_buffer = args.enforce_buffer,
        record_file = ?args.record_file,
        store_snapshot = ?args.store_snapshot,
        mock_dll = args.mock_dll,
        "startup config"
    );

    // ---- Metrics ----
    metrics::init();

    // ---- Storage ----
    let storage: Arc<dyn Storage> = match &args.store_snapshot {
        Some(path) => Arc::new(MemoryStore::with_snapshot(path)?),
        None => Arc::new(MemoryStore::new()),
    };

    // ---- Recorder (optional) ----
    let recorder = args.record_file.clone().map(|path| {
        let (tx, rx) = mpsc::channel::<Record>(recorder::RECORD_BUFFER);
        tokio::spawn(recorder::run(rx, path));
        tx
    });

    // ---- Services + workers ----
    let app = Arc::new(App::new(storage, args.event_buffer, args.enforce_buffer, &args.bind_addr, recorder));
    app.pipeline.start(args.workers);

    // ---- Listeners: bind gagal = fatal ----
    let admin_builder = admin::bind(args.port)?;
    let ws_listener = ws::bind(args.ws_port).await?;
    tokio::spawn(admin::serve(admin_builder, app.clone()));
    tokio::spawn(ws::serve(ws_listener, app.hub.clone()));

    // ---- Periodic tasks ----
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(health::run(
        app.dll.clone(),
        Duration::from_secs(args.health_check_secs),
        stop_rx.clone(),
    ));
    tokio::spawn({
        let app = app.clone();
        let mut stop = stop_rx;
        let period = Duration::from_secs(args.state_sync_secs);
        async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let app = app.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || app.sync_state()).await {
                            warn!(?e, "state sync task failed");
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        }
    });

    // ---- Mock DLL (optional) ----
    if args.mock_dll {
        match app.dll.start_listener(mock::MOCK_DLL_ID).await {
            Ok(port) => {
                tokio::spawn(mock::run(port, Duration::from_millis(200)));
            }
            Err(e) => error!(?e, "mock dll listener failed"),
        }
    }

    // ---- Wait for shutdown ----
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    stop_tx.send_replace(true);

    let app_final = app.clone();
    tokio::task::spawn_blocking(move || app_final.shutdown()).await?;
    app.pipeline.join().await;
    info!("bye");
    Ok(())
}
