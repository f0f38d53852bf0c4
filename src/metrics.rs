// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::path::Path;
use tracing::{info, warn};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Remote calls (labels: op) --------
pub static REMOTE_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("remote_calls_total", "exchange call attempts (retries included)"),
        &["op"],
    )
    .unwrap()
});

pub static RATE_LIMIT_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("rate_limit_retries_total", "backoff sleeps after a rate-limit response"),
        &["op"],
    )
    .unwrap()
});

pub static FATAL_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("operation_failures_total", "exchange calls that ended as OperationFailed"),
        &["op"],
    )
    .unwrap()
});

// -------- Cleanup outcomes --------
pub static ITEMS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "flash_close_items_total",
            "items acted on (labels: class = position|trigger|tpsl|limit, outcome = ok|failed)",
        ),
        &["class", "outcome"],
    )
    .unwrap()
});

pub static RESIDUAL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("flash_close_residual", "items still open after verification (-1 = unknown)"),
        &["class"],
    )
    .unwrap()
});

pub fn init() {
    for e in register_all() {
        warn!(error = %e, "metric registration failed");
    }
}

// Register all metrics to the custom registry, returns the failures
fn register_all() -> Vec<prometheus::Error> {
    [
        REGISTRY.register(Box::new(REMOTE_CALLS.clone())),
        REGISTRY.register(Box::new(RATE_LIMIT_RETRIES.clone())),
        REGISTRY.register(Box::new(FATAL_FAILURES.clone())),
        REGISTRY.register(Box::new(ITEMS.clone())),
        REGISTRY.register(Box::new(RESIDUAL.clone())),
    ]
    .into_iter()
    .filter_map(Result::err)
    .collect()
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

/// Dump the registry for a textfile collector. One-shot run, so no HTTP endpoint.
pub async fn write_textfile(path: &str) -> std::io::Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    // tulis ke file sementara lalu rename, supaya collector tidak membaca file setengah jadi
    let tmp = format!("{path}.tmp");
    tokio::fs::write(&tmp, encode_metrics()).await?;
    tokio::fs::rename(&tmp, path).await?;
    info!(%path, "metrics written");
    Ok(())
}
