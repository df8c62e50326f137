// ===============================
// src/dashboard.rs (read API + bot control + /metrics)
// ===============================
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use hyper::{header, Body, Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::domain::BotStatus;
use crate::http::{error_json, json, not_found, query_param, read_json, AppState};
use crate::metrics;

const DEFAULT_TRADE_LIMIT: usize = 50;
const DEFAULT_BALANCE_DAYS: i64 = 7;
const MAX_BALANCE_DAYS: i64 = 3650;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total_trades: usize,
    pub daily_pnl: f64,
    pub balance: Option<f64>,
    pub open_positions: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRequest {
    #[serde(default)]
    pub trading_pair: Option<String>,
    #[serde(default)]
    pub position_size: Option<serde_json::Value>,
    #[serde(default)]
    pub action: Option<String>,
}

pub async fn route(state: Arc<AppState>, req: Request<Body>) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/api/status") => status(&state).await,
        (&Method::GET, "/api/open_positions") => json(StatusCode::OK, &state.dispatcher.open_positions().await),
        (&Method::GET, "/api/trade_history") => trade_history(&state, &req).await,
        (&Method::GET, "/api/balance_history") => balance_history(&state, &req).await,
        (&Method::GET, "/api/summary") => summary(&state).await,
        (&Method::POST, "/api/start_bot") => set_status(&state, BotStatus::Running, "started").await,
        (&Method::POST, "/api/stop_bot") => set_status(&state, BotStatus::Stopped, "stopped").await,
        (&Method::POST, "/api/generate_alert") => generate_alert(&state, req).await,
        (&Method::GET, "/metrics") => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, metrics::content_type())
            .body(Body::from(metrics::encode_metrics()))
            .unwrap_or_else(|_| Response::new(Body::empty())),
        _ => not_found(),
    }
}

/// Seed a status row so the dashboard never starts on UNKNOWN.
pub async fn ensure_status(state: &AppState) {
    match state.recorder.latest_status().await {
        Ok(s) if s.status != BotStatus::Unknown => metrics::set_status(s.status),
        _ => {
            if let Err(e) = state.recorder.update_status(BotStatus::Stopped).await {
                error!(?e, "dashboard: could not seed status");
            }
        }
    }
}

async fn status(state: &AppState) -> Response<Body> {
    match state.recorder.latest_status().await {
        Ok(s) => json(StatusCode::OK, &s),
        Err(e) => {
            error!(?e, "dashboard: status read failed");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn trade_history(state: &AppState, req: &Request<Body>) -> Response<Body> {
    let limit = query_param(req, "limit").and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_TRADE_LIMIT);
    match state.recorder.trades(limit).await {
        Ok(rows) => json(StatusCode::OK, &rows),
        Err(e) => {
            error!(?e, "dashboard: trade history read failed");
            json(StatusCode::OK, &Vec::<()>::new())
        }
    }
}

async fn balance_history(state: &AppState, req: &Request<Body>) -> Response<Body> {
    let days = query_param(req, "days")
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(DEFAULT_BALANCE_DAYS)
        .clamp(1, MAX_BALANCE_DAYS);
    match state.recorder.balance_history(days).await {
        Ok(rows) => json(StatusCode::OK, &rows),
        Err(e) => {
            error!(?e, "dashboard: balance history read failed");
            json(StatusCode::OK, &Vec::<()>::new())
        }
    }
}

async fn summary(state: &AppState) -> Response<Body> {
    let trades = match state.recorder.trades(usize::MAX).await {
        Ok(t) => t,
        Err(e) => return error_json(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    let since = Utc::now() - ChronoDuration::hours(24);
    let daily_pnl: f64 = trades.iter().filter(|t| t.timestamp >= since).map(|t| t.pnl).sum();
    let balance = match state.dispatcher.account_balance().await {
        Ok(b) => Some(b),
        Err(_) => state
            .recorder
            .balance_history(DEFAULT_BALANCE_DAYS)
            .await
            .ok()
            .and_then(|h| h.last().map(|b| b.balance)),
    };

    let out = Summary {
        total_trades: trades.len(),
        daily_pnl,
        balance,
        open_positions: state.dispatcher.open_positions().await.len(),
    };
    json(StatusCode::OK, &out)
}

async fn set_status(state: &AppState, status: BotStatus, label: &str) -> Response<Body> {
    match state.recorder.update_status(status).await {
        Ok(_) => json(StatusCode::OK, &serde_json::json!({ "status": label })),
        Err(e) => {
            error!(?e, "dashboard: status update failed");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn lenient_f64(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn round4(x: f64) -> f64 { (x * 10_000.0).round() / 10_000.0 }

/// Ready-to-paste webhook body sized as a percentage of the balance.
async fn generate_alert(state: &AppState, req: Request<Body>) -> Response<Body> {
    let body: AlertRequest = match read_json(req).await {
        Ok(b) => b,
        Err(msg) => return error_json(StatusCode::BAD_REQUEST, msg),
    };
    let asset = body
        .trading_pair
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| state.dispatcher.default_asset().to_string());
    let action = body.action.unwrap_or_else(|| "BUY".to_string());
    let pct = match body.position_size.as_ref() {
        None => 10.0,
        Some(v) => match lenient_f64(v) {
            Some(p) => p,
            None => return error_json(StatusCode::BAD_REQUEST, "positionSize must be a number"),
        },
    };

    let quote = async {
        let balance = state.dispatcher.account_balance().await?;
        let px = state.dispatcher.current_price(&asset).await?;
        Ok::<_, crate::exchange::ExchangeError>((balance, px))
    };
    let (balance, px) = match quote.await {
        Ok(q) => q,
        Err(e) => {
            error!(?e, "dashboard: alert quote failed");
            return error_json(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };

    let size = round4(balance * (pct / 100.0) / px);
    info!(%asset, %action, pct, size, "alert generated");
    json(
        StatusCode::OK,
        &serde_json::json!({
            "status": "success",
            "alert": { "action": action, "asset": asset, "size": size },
            "webhook_url": state.webhook_url,
        }),
    )
}
