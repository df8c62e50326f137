// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use crate::domain::BotStatus;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Signals & dispatch --------
pub static SIGNALS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("signals_total", "webhook signals received (label: action)"), &["action"])
        .unwrap()
});

pub static DISPATCHES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("dispatch_total", "dispatch results (label: result)"),
        &["result"],
    )
    .unwrap()
});

pub static DISPATCH_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new(
        "dispatch_latency_ms",
        "Latency of one dispatch including exchange calls (ms)",
    ))
    .unwrap()
});

// -------- Book & account --------
pub static OPEN_POSITIONS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("open_positions", "positions currently open").unwrap());

pub static PNL_REALIZED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_realized_total", "realized PnL since start").unwrap());

pub static BALANCE: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("account_balance", "last observed account balance").unwrap());

pub static BOT_STATUS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("bot_status", "1 for the current status (label: status)"), &["status"]).unwrap()
});

pub fn init() {
    for m in [
        REGISTRY.register(Box::new(SIGNALS.clone())),
        REGISTRY.register(Box::new(DISPATCHES.clone())),
        REGISTRY.register(Box::new(DISPATCH_LATENCY.clone())),
        REGISTRY.register(Box::new(OPEN_POSITIONS.clone())),
        REGISTRY.register(Box::new(PNL_REALIZED.clone())),
        REGISTRY.register(Box::new(BALANCE.clone())),
        REGISTRY.register(Box::new(BOT_STATUS.clone())),
    ] {
        if let Err(e) = m {
            tracing::debug!(?e, "metric already registered");
        }
    }
}

pub fn set_status(status: BotStatus) {
    for s in [BotStatus::Initialized, BotStatus::Running, BotStatus::Stopped, BotStatus::Error] {
        BOT_STATUS.with_label_values(&[s.as_str()]).set((s == status) as i64);
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

pub fn content_type() -> String { TextEncoder::new().format_type().to_string() }
