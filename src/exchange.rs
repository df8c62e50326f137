// ===============================
// src/exchange.rs (adapter boundary + paper venue)
// ===============================
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::sync::RwLock;
use thiserror::Error;
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    #[error("exchange unavailable: {0}")]
    Unavailable(String),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("exchange call timed out after {0} ms")]
    Timeout(u64),
    #[error("invalid price {price} for {asset}")]
    InvalidPrice { asset: String, price: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub asset: String,
    pub is_buy: bool,
    pub size: f64,
    pub reduce_only: bool,
    pub slippage: f64,
    pub leverage: u32,
    pub is_cross: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fill { pub order_id: String, pub asset: String, pub size: f64, pub avg_px: f64 }

/// Venue capabilities the dispatcher relies on. Every call may fail or stall.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn current_price(&self, asset: &str) -> Result<f64, ExchangeError>;
    async fn account_balance(&self) -> Result<f64, ExchangeError>;
    async fn submit_order(&self, order: &OrderRequest) -> Result<Fill, ExchangeError>;
}

/// In-process venue: fixed balance, settable marks, immediate fills at the mark.
pub struct PaperExchange {
    prices: RwLock<HashMap<String, f64>>,
    default_px: f64,
    balance: RwLock<f64>,
    fill_ms: u64,
}

impl PaperExchange {
    pub fn new(balance: f64, default_px: f64, fill_ms: u64) -> Self {
        Self { prices: RwLock::new(HashMap::new()), default_px, balance: RwLock::new(balance), fill_ms }
    }

    pub fn set_price(&self, asset: &str, px: f64) {
        if let Ok(mut prices) = self.prices.write() {
            prices.insert(asset.to_ascii_uppercase(), px);
        }
    }

    pub fn set_balance(&self, balance: f64) {
        if let Ok(mut b) = self.balance.write() {
            *b = balance;
        }
    }

    fn mark(&self, asset: &str) -> f64 {
        self.prices
            .read()
            .ok()
            .and_then(|p| p.get(&asset.to_ascii_uppercase()).copied())
            .unwrap_or(self.default_px)
    }

    async fn latency(&self) {
        if self.fill_ms > 0 {
            sleep(Duration::from_millis(self.fill_ms)).await;
        }
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    async fn current_price(&self, asset: &str) -> Result<f64, ExchangeError> {
        self.latency().await;
        Ok(self.mark(asset))
    }

    async fn account_balance(&self) -> Result<f64, ExchangeError> {
        self.latency().await;
        self.balance
            .read()
            .map(|b| *b)
            .map_err(|_| ExchangeError::Unavailable("balance lock poisoned".into()))
    }

    async fn submit_order(&self, order: &OrderRequest) -> Result<Fill, ExchangeError> {
        if !(order.size.is_finite() && order.size > 0.0) {
            return Err(ExchangeError::Rejected(format!("bad size {}", order.size)));
        }
        self.latency().await;

        let order_id = format!("PAPER-{}-{}", Utc::now().timestamp_millis(), rand::thread_rng().gen::<u32>());
        let avg_px = self.mark(&order.asset);
        debug!(%order_id, asset = %order.asset, is_buy = order.is_buy, size = order.size, reduce_only = order.reduce_only, "paper order");
        info!(%order_id, px = avg_px, "paper fill");
        Ok(Fill { order_id, asset: order.asset.clone(), size: order.size, avg_px })
    }
}
