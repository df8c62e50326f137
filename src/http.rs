// ===============================
// src/http.rs (shared hyper plumbing)
// ===============================
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::{
    header,
    server::conn::AddrStream,
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::dispatcher::Dispatcher;
use crate::recorder::Recorder;

/// Everything a request handler may touch. Built once in `main`, shared by `Arc`.
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub recorder: Recorder,
    pub webhook_url: String,
    /// Held from dispatch until its trade/balance rows are written, so the
    /// journal lists rows in dispatch order.
    pub journal: Mutex<()>,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher, recorder: Recorder, webhook_url: String) -> Self {
        Self { dispatcher, recorder, webhook_url, journal: Mutex::new(()) }
    }
}

pub fn json<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    match serde_json::to_vec(body) {
        Ok(bytes) => Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(bytes))
            .unwrap_or_else(|_| Response::new(Body::empty())),
        Err(e) => {
            error!(?e, "http: response serialize failed");
            let mut resp = Response::new(Body::from("internal error"));
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            resp
        }
    }
}

pub fn error_json(status: StatusCode, message: impl Into<String>) -> Response<Body> {
    json(status, &serde_json::json!({ "status": "error", "message": message.into() }))
}

pub fn not_found() -> Response<Body> { error_json(StatusCode::NOT_FOUND, "not found") }

pub async fn read_body(req: Request<Body>) -> Result<hyper::body::Bytes, String> {
    hyper::body::to_bytes(req.into_body()).await.map_err(|e| format!("failed to read body: {e}"))
}

pub async fn read_json<T: DeserializeOwned>(req: Request<Body>) -> Result<T, String> {
    let bytes = read_body(req).await?;
    serde_json::from_slice(&bytes).map_err(|e| format!("invalid JSON body: {e}"))
}

/// First value of `key` in the query string.
pub fn query_param(req: &Request<Body>, key: &str) -> Option<String> {
    let q = req.uri().query()?;
    url::form_urlencoded::parse(q.as_bytes()).find(|(k, _)| k == key).map(|(_, v)| v.into_owned())
}

pub async fn serve<F, Fut>(addr: SocketAddr, state: Arc<AppState>, route: F, name: &'static str) -> Result<(), hyper::Error>
where
    F: Fn(Arc<AppState>, Request<Body>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Body>> + Send + 'static,
{
    let make = make_service_fn(move |_conn: &AddrStream| {
        let state = state.clone();
        let route = route.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let fut = route(state.clone(), req);
                async move { Ok::<_, Infallible>(fut.await) }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make);
    info!(%addr, server = name, "http listening");
    server.await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dispatcher::tests::{dispatcher, ScriptedExchange};

    pub(crate) async fn test_state(dir: &std::path::Path) -> (Arc<AppState>, Arc<ScriptedExchange>) {
        let ex = Arc::new(ScriptedExchange::new());
        let state = AppState::new(
            dispatcher(ex.clone()),
            Recorder::open(dir).await.unwrap(),
            "http://localhost:8000/webhook".into(),
        );
        (Arc::new(state), ex)
    }

    #[test]
    fn query_param_decodes() {
        let req = Request::get("/api/trade_history?limit=5&x=a%20b").body(Body::empty()).unwrap();
        assert_eq!(query_param(&req, "limit").as_deref(), Some("5"));
        assert_eq!(query_param(&req, "x").as_deref(), Some("a b"));
        assert_eq!(query_param(&req, "days"), None);
    }
}
