// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : dll_guard : DLL trading-event ingestion & enforcement engine in Rust
Module  : config.rs
Version : 0.5.0
License : MIT (see LICENSE)

Summary : Terima event trading dari DLL terminal via TCP (frame u32 LE + JSON),
          proses lewat worker pool bounded, evaluasi rule per user, kirim
          enforcement balik ke DLL & viewer WebSocket, expose admin API dan
          Prometheus metrics, rekam JSONL (opsional).
=============================================================================
*/
use std::env;

use clap::Parser;
use dotenvy::dotenv;

/// Command-line overrides. Setiap flag menimpa env var yang sama.
#[derive(Parser, Debug, Default)]
#[command(name = "dll_guard", version, about = "DLL event ingestion & enforcement engine")]
pub struct Cli {
    /// Admin HTTP port (PORT)
    #[arg(long)]
    pub port: Option<u16>,
    /// WebSocket viewer port (WS_PORT)
    #[arg(long)]
    pub ws_port: Option<u16>,
    /// Host for per-DLL listeners (DLL_BIND_ADDR)
    #[arg(long)]
    pub bind_addr: Option<String>,
    /// Ingestion queue capacity (EVENT_BUFFER)
    #[arg(long)]
    pub event_buffer: Option<usize>,
    /// Worker count (WORKERS)
    #[arg(long)]
    pub workers: Option<usize>,
    /// Per-connection outbound enforcement buffer (ENFORCE_BUFFER)
    #[arg(long)]
    pub enforce_buffer: Option<usize>,
    #[arg(long)]
    pub health_check_secs: Option<u64>,
    #[arg(long)]
    pub state_sync_secs: Option<u64>,
    /// JSONL audit file (RECORD_FILE)
    #[arg(long)]
    pub record_file: Option<String>,
    /// Storage snapshot file (STORE_SNAPSHOT)
    #[arg(long)]
    pub store_snapshot: Option<String>,
    /// Start the built-in mock DLL client (MOCK_DLL=1)
    #[arg(long)]
    pub mock_dll: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Args {
    // network
    pub port: u16,
    pub ws_port: u16,
    pub bind_addr: String,

    // pipeline
    pub event_buffer: usize,
    pub workers: usize,
    pub enforce_buffer: usize,

    // periodic tasks
    pub health_check_secs: u64,
    pub state_sync_secs: u64,

    // files
    pub record_file: Option<String>,
    pub store_snapshot: Option<String>,

    pub mock_dll: bool,
}

fn parse_or<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl Args {
    /// Build from a key lookup (env vars in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mock_dll = matches!(
            lookup("MOCK_DLL").unwrap_or_default().trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes"
        );
        Self {
            port: parse_or(&lookup, "PORT", 8080),
            ws_port: parse_or(&lookup, "WS_PORT", 8081),
            bind_addr: non_empty(lookup("DLL_BIND_ADDR")).unwrap_or_else(|| "0.0.0.0".to_string()),
            event_buffer: parse_or(&lookup, "EVENT_BUFFER", 10_000).max(1),
            workers: parse_or(&lookup, "WORKERS", 10).max(1),
            enforce_buffer: parse_or(&lookup, "ENFORCE_BUFFER", 1_000).max(1),
            health_check_secs: parse_or(&lookup, "HEALTH_CHECK_SECS", 10).max(1),
            state_sync_secs: parse_or(&lookup, "STATE_SYNC_SECS", 30).max(1),
            record_file: non_empty(lookup("RECORD_FILE")),
            store_snapshot: non_empty(lookup("STORE_SNAPSHOT")),
            mock_dll,
        }
    }

    pub fn apply(mut self, cli: Cli) -> Self {
        if let Some(v) = cli.port {
            self.port = v;
        }
        if let Some(v) = cli.ws_port {
            self.ws_port = v;
        }
        if let Some(v) = cli.bind_addr {
            self.bind_addr = v;
        }
        if let Some(v) = cli.event_buffer {
            self.event_buffer = v.max(1);
        }
        if let Some(v) = cli.workers {
            self.workers = v.max(1);
        }
        if let Some(v) = cli.enforce_buffer {
            self.enforce_buffer = v.max(1);
        }
        if let Some(v) = cli.health_check_secs {
            self.health_check_secs = v.max(1);
        }
        if let Some(v) = cli.state_sync_secs {
            self.state_sync_secs = v.max(1);
        }
        if cli.record_file.is_some() {
            self.record_file = cli.record_file;
        }
        if cli.store_snapshot.is_some() {
            self.store_snapshot = cli.store_snapshot;
        }
        self.mock_dll |= cli.mock_dll;
        self
    }
}

pub fn load() -> Args {
    // Pastikan .env dibaca (agar PORT, RECORD_FILE, dll ter-load)
    let _ = dotenv();
    Args::from_lookup(|k| env::var(k).ok()).apply(Cli::parse())
}
