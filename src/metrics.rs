// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Ingestion --------
pub static EVENTS_RECEIVED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("events_received_total", "events decoded from DLL frames").unwrap());

pub static EVENTS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("events_dropped_total", "events dropped because the ingestion queue was full").unwrap()
});

pub static EVENTS_PROCESSED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("events_processed_total", "events run through the rule engine").unwrap());

pub static EVENTS_ABANDONED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("events_abandoned_total", "events skipped because rules could not be fetched").unwrap()
});

pub static MALFORMED_FRAMES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("malformed_frames_total", "frames whose payload failed to decode").unwrap());

pub static QUEUE_DEPTH: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("ingest_queue_depth", "events waiting in the ingestion queue").unwrap());

// -------- Rules & enforcement --------
pub static RULE_TRIGGERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("rule_triggers_total", "rule triggers (label: rule)"), &["rule"]).unwrap()
});

pub static ENFORCEMENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "enforcements_total",
            "enforcement dispatch outcomes (labels: target=dll|ws, outcome)",
        ),
        &["target", "outcome"],
    )
    .unwrap()
});

// -------- Connections --------
pub static DLL_ACTIVE: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("dll_connections_active", "active DLL connections").unwrap());

pub static DLL_ACCEPTED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("dll_connections_accepted_total", "accepted DLL sockets").unwrap());

pub static WS_CLIENTS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("ws_clients", "connected WebSocket viewers").unwrap());

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(EVENTS_RECEIVED.clone())),
        REGISTRY.register(Box::new(EVENTS_DROPPED.clone())),
        REGISTRY.register(Box::new(EVENTS_PROCESSED.clone())),
        REGISTRY.register(Box::new(EVENTS_ABANDONED.clone())),
        REGISTRY.register(Box::new(MALFORMED_FRAMES.clone())),
        REGISTRY.register(Box::new(QUEUE_DEPTH.clone())),
        REGISTRY.register(Box::new(RULE_TRIGGERS.clone())),
        REGISTRY.register(Box::new(ENFORCEMENTS.clone())),
        REGISTRY.register(Box::new(DLL_ACTIVE.clone())),
        REGISTRY.register(Box::new(DLL_ACCEPTED.clone())),
        REGISTRY.register(Box::new(WS_CLIENTS.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}
