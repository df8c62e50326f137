// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::dispatcher::DispatchError;

/// Signal vocabulary accepted on the webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action { Buy, Sell, Close }

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self { Action::Buy => "BUY", Action::Sell => "SELL", Action::Close => "CLOSE" }
    }
}

impl FromStr for Action {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" => Ok(Action::Buy),
            "SELL" => Ok(Action::Sell),
            "CLOSE" => Ok(Action::Close),
            _ => Err(DispatchError::UnknownAction(s.to_string())),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction { Long, Short }

impl Direction {
    /// `None` for CLOSE, which has no direction of its own.
    pub fn from_action(action: Action) -> Option<Self> {
        match action {
            Action::Buy => Some(Direction::Long),
            Action::Sell => Some(Direction::Short),
            Action::Close => None,
        }
    }

    pub fn is_long(&self) -> bool { matches!(self, Direction::Long) }

    pub fn sign(&self) -> f64 { match self { Direction::Long => 1.0, Direction::Short => -1.0 } }

    pub fn open_trade_type(&self) -> TradeType {
        match self { Direction::Long => TradeType::Buy, Direction::Short => TradeType::Sell }
    }

    pub fn close_trade_type(&self) -> TradeType {
        match self { Direction::Long => TradeType::CloseLong, Direction::Short => TradeType::CloseShort }
    }
}

/// `(exit - entry) * size` for a long, mirrored for a short.
pub fn realized_pnl(direction: Direction, entry_px: f64, exit_px: f64, size: f64) -> f64 {
    (exit_px - entry_px) * size * direction.sign()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub asset: String,
    pub direction: Direction,
    pub size: f64,
    pub entry_price: f64,
    pub current_price: f64,
    #[serde(rename = "pnl")]
    pub unrealized_pnl: f64,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Fresh position marked at its entry price. Returns `None` when the
    /// inputs cannot describe an open exposure.
    pub fn open(asset: &str, direction: Direction, size: f64, entry_price: f64) -> Option<Self> {
        let asset = asset.trim();
        if asset.is_empty() || !(size.is_finite() && size > 0.0) || !(entry_price.is_finite() && entry_price > 0.0) {
            return None;
        }
        Some(Self {
            asset: asset.to_string(),
            direction,
            size,
            entry_price,
            current_price: entry_price,
            unrealized_pnl: 0.0,
            opened_at: Utc::now(),
        })
    }

    pub fn mark(&mut self, price: f64) {
        self.current_price = price;
        self.unrealized_pnl = realized_pnl(self.direction, self.entry_price, price, self.size);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeType { Buy, Sell, CloseLong, CloseShort }

impl TradeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeType::Buy => "BUY",
            TradeType::Sell => "SELL",
            TradeType::CloseLong => "CLOSE_LONG",
            TradeType::CloseShort => "CLOSE_SHORT",
        }
    }
}

/// Everything the recorder needs about a completed dispatch, minus the timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeFill { pub asset: String, pub trade_type: TradeType, pub size: f64, pub price: f64, pub pnl: f64 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub asset: String,
    #[serde(rename = "type")]
    pub trade_type: TradeType,
    pub size: f64,
    pub price: f64,
    pub pnl: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot { pub timestamp: DateTime<Utc>, pub balance: f64 }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BotStatus { Initialized, Running, Stopped, Error, Unknown }

impl BotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotStatus::Initialized => "INITIALIZED",
            BotStatus::Running => "RUNNING",
            BotStatus::Stopped => "STOPPED",
            BotStatus::Error => "ERROR",
            BotStatus::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry { pub status: BotStatus, pub timestamp: DateTime<Utc> }

/// Webhook payload: `{action, size?, asset?}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Signal {
    pub action: String,
    #[serde(default)]
    pub size: Option<f64>,
    #[serde(default)]
    pub asset: Option<String>,
}

impl Signal {
    pub fn new(action: &str) -> Self { Self { action: action.to_string(), ..Default::default() } }
    pub fn with_size(mut self, size: f64) -> Self { self.size = Some(size); self }
    pub fn with_asset(mut self, asset: &str) -> Self { self.asset = Some(asset.to_string()); self }
}

/// Terminal result of one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Opened { position: Position },
    #[serde(rename_all = "camelCase")]
    Closed { asset: String, direction: Direction, size: f64, entry_price: f64, exit_price: f64, pnl: f64 },
    NoOpenPositions,
}

impl Outcome {
    pub fn success(&self) -> bool { !matches!(self, Outcome::NoOpenPositions) }

    /// Trade row for a successful dispatch, carrying the real fill values.
    pub fn trade(&self) -> Option<TradeFill> {
        match self {
            Outcome::Opened { position } => Some(TradeFill {
                asset: position.asset.clone(),
                trade_type: position.direction.open_trade_type(),
                size: position.size,
                price: position.entry_price,
                pnl: 0.0,
            }),
            Outcome::Closed { asset, direction, size, exit_price, pnl, .. } => Some(TradeFill {
                asset: asset.clone(),
                trade_type: direction.close_trade_type(),
                size: *size,
                price: *exit_price,
                pnl: *pnl,
            }),
            Outcome::NoOpenPositions => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Outcome::Opened { position } => format!(
                "Opened {} position: {} {} @ {}",
                position.direction.open_trade_type().as_str(), position.size, position.asset, position.entry_price
            ),
            Outcome::Closed { pnl, .. } => format!("Closed position with PnL: {}", pnl),
            Outcome::NoOpenPositions => "No open positions to close".to_string(),
        }
    }
}
