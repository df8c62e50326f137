// ===============================
// src/webhook.rs (signal front door)
// ===============================
use std::sync::Arc;

use hyper::{Body, Method, Request, Response, StatusCode};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::domain::{Outcome, Signal};
use crate::http::{error_json, json, not_found, read_body, AppState};

/// Body of every `/webhook` reply.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WebhookReply {
    Success { result: Outcome },
    Error { message: String },
}

pub async fn route(state: Arc<AppState>, req: Request<Body>) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/") => json(
            StatusCode::OK,
            &serde_json::json!({ "status": "perp_bot webhook server is running" }),
        ),
        (&Method::POST, "/webhook") => handle_webhook(&state, req).await,
        _ => not_found(),
    }
}

async fn handle_webhook(state: &AppState, req: Request<Body>) -> Response<Body> {
    let signal = match parse_signal(req).await {
        Ok(s) => s,
        Err(msg) => {
            warn!(%msg, "webhook: bad request");
            return error_json(StatusCode::BAD_REQUEST, msg);
        }
    };
    let reply = process_signal(state, &signal).await;
    json(StatusCode::OK, &reply)
}

async fn parse_signal(req: Request<Body>) -> Result<Signal, String> {
    let bytes = read_body(req).await?;
    let payload: serde_json::Value =
        serde_json::from_slice(&bytes).map_err(|e| format!("invalid JSON body: {e}"))?;
    info!(%payload, "webhook received");

    match payload.get("action") {
        Some(serde_json::Value::String(_)) => {}
        Some(_) => return Err("'action' must be a string".into()),
        None => return Err("Missing 'action' field in payload".into()),
    }
    serde_json::from_value(payload).map_err(|e| format!("invalid signal: {e}"))
}

/// Dispatch, then write the trade row (if any) and a balance snapshot, in that order.
/// Concurrent signals are journaled in the order they were dispatched.
pub async fn process_signal(state: &AppState, signal: &Signal) -> WebhookReply {
    let _journal = state.journal.lock().await;
    let res = state.dispatcher.dispatch(signal).await;

    if let Some(fill) = res.as_ref().ok().and_then(Outcome::trade) {
        if let Err(e) = state.recorder.record_trade(&fill).await {
            error!(?e, "webhook: trade not recorded");
        }
    }

    match state.dispatcher.account_balance().await {
        Ok(balance) => {
            if let Err(e) = state.recorder.record_balance(balance).await {
                error!(?e, "webhook: balance not recorded");
            }
        }
        Err(e) => warn!(?e, "webhook: balance unavailable, snapshot skipped"),
    }

    match res {
        Ok(out) if out.success() => {
            info!(result = %out.describe(), "action executed");
            WebhookReply::Success { result: out }
        }
        Ok(out) => {
            info!(result = %out.describe(), "action produced nothing");
            WebhookReply::Error { message: out.describe() }
        }
        Err(e) => {
            error!(kind = e.kind(), %e, "action failed");
            WebhookReply::Error { message: e.to_string() }
        }
    }
}
