// ===============================
// src/main.rs
// ===============================
/*
 # kirim sinyal
curl -s -XPOST localhost:8000/webhook -d '{"action":"BUY","size":0.5,"asset":"ETH"}'
curl -s -XPOST localhost:8000/webhook -d '{"action":"CLOSE"}'

# dashboard
curl -s localhost:5000/api/open_positions
curl -s localhost:5000/api/trade_history?limit=10
curl -s localhost:5000/metrics | egrep '^(dispatch_total|open_positions|bot_status)'
*/
/*
=============================================================================
Project : perp_bot — webhook-driven perpetual futures trading bot in Rust
Module  : main.rs
Version : 0.1.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Receives BUY/SELL/CLOSE signals over an HTTP webhook, dispatches
          them to a perpetual futures venue (paper venue by default), keeps
          a FIFO book of open positions, records trades, balances and bot
          status as JSONL and serves a small dashboard API with metrics.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
mod config;
mod dashboard;
mod dispatcher;
mod domain;
mod exchange;
mod http;
mod metrics;
mod positions;
mod recorder;
mod risk;
mod webhook;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::dispatcher::Dispatcher;
use crate::domain::BotStatus;
use crate::exchange::PaperExchange;
use crate::http::AppState;
use crate::recorder::Recorder;

/// Console + daily file (`<log_dir>/perp_bot.log.YYYY-MM-DD`). Keep the guard alive.
fn init_logging(log_dir: &Path) -> WorkerGuard {
    let file = tracing_appender::rolling::daily(log_dir, "perp_bot.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();
    guard
}

/// INITIALIZED plus a first balance snapshot if the exchange answers, ERROR otherwise.
async fn record_startup(state: &AppState) -> BotStatus {
    let status = match state.dispatcher.account_balance().await {
        Ok(balance) => {
            if let Err(e) = state.recorder.record_balance(balance).await {
                error!(?e, "initial balance not recorded");
            }
            BotStatus::Initialized
        }
        Err(e) => {
            error!(?e, "exchange unreachable at startup");
            BotStatus::Error
        }
    };
    if let Err(e) = state.recorder.update_status(status).await {
        error!(?e, status = status.as_str(), "startup status not recorded");
    }
    status
}

#[tokio::main]
async fn main() {
    // ---- Config ----
    let cli = config::Cli::parse();
    let args = match config::load(&cli) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("config error: {e}");
            std::process::exit(2);
        }
    };

    // ---- Logging ----
    let _log_guard = init_logging(&args.log_dir);
    info!(
        asset = %args.asset_name,
        leverage = args.leverage,
        is_cross = args.is_cross,
        sizing = ?args.sizing,
        api = %format!("{}:{}", args.api_host, args.api_port),
        ui = %format!("{}:{}", args.ui_host, args.ui_port),
        data_dir = %args.data_dir.display(),
        "startup config"
    );
    args.warn_demo_mode();

    // ---- Metrics ----
    metrics::init();

    // ---- Recorder ----
    let recorder = match Recorder::open(&args.data_dir).await {
        Ok(r) => r,
        Err(e) => {
            error!(?e, "recorder open failed");
            std::process::exit(1);
        }
    };

    // ---- Exchange + dispatcher ----
    let exchange = Arc::new(PaperExchange::new(args.paper_balance, args.paper_price, args.paper_latency_ms));
    let dispatcher = Dispatcher::new(exchange, args.sizing.policy(), args.dispatch_cfg());
    info!(asset = %args.asset_name, "exchange initialized (paper)");

    let state = Arc::new(AppState::new(dispatcher, recorder, args.webhook_url()));

    // ---- Initial status + balance ----
    record_startup(&state).await;
    dashboard::ensure_status(&state).await;

    // ---- Servers ----
    let (api_addr, ui_addr) = match (args.api_addr(), args.ui_addr()) {
        (Ok(a), Ok(u)) => (a, u),
        (Err(e), _) | (_, Err(e)) => {
            error!(%e, "bad listen address");
            std::process::exit(2);
        }
    };
    let api = tokio::spawn(http::serve(api_addr, state.clone(), webhook::route, "webhook"));
    let ui = tokio::spawn(http::serve(ui_addr, state.clone(), dashboard::route, "dashboard"));
    info!("webhook at http://{api_addr}/webhook, dashboard at http://{ui_addr}/");

    tokio::select! {
        res = api => error!(?res, "webhook server exited"),
        res = ui => error!(?res, "dashboard server exited"),
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }

    if let Err(e) = state.recorder.update_status(BotStatus::Stopped).await {
        error!(?e, "final status not recorded");
    }
    info!(open = state.dispatcher.open_positions().await.len(), "perp_bot stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::tests::test_state;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    #[tokio::test]
    async fn startup_records_status_and_balance() {
        let dir = TempDir::new().unwrap();
        let (state, _ex) = test_state(dir.path()).await;

        assert_eq!(record_startup(&state).await, BotStatus::Initialized);
        assert_eq!(state.recorder.latest_status().await.unwrap().status, BotStatus::Initialized);
        assert_eq!(state.recorder.balance_history(1).await.unwrap().len(), 1);

        dashboard::ensure_status(&state).await;
        assert_eq!(state.recorder.latest_status().await.unwrap().status, BotStatus::Initialized);
    }

    #[tokio::test]
    async fn unreachable_exchange_records_error() {
        let dir = TempDir::new().unwrap();
        let (state, ex) = test_state(dir.path()).await;
        ex.fail_balance.store(true, Ordering::SeqCst);

        assert_eq!(record_startup(&state).await, BotStatus::Error);
        assert_eq!(state.recorder.latest_status().await.unwrap().status, BotStatus::Error);
        assert!(state.recorder.balance_history(1).await.unwrap().is_empty());
    }
}
