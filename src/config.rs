// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : perp_bot — webhook-driven perpetual futures trading bot in Rust
Module  : config.rs
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
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;
use tokio::time::Duration;
use tracing::warn;

use crate::dispatcher::DispatchCfg;
use crate::risk::{BalanceFraction, FixedSize, SizingPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load env file {path}: {source}")]
    EnvFile { path: String, source: dotenvy::Error },
    #[error("invalid listen address {0}")]
    Addr(String),
}

/// Command line overrides; everything else comes from the environment / `.env`.
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "perp_bot", version, about = "Webhook-driven perpetual futures bot")]
pub struct Cli {
    /// Env file to load instead of `.env`
    #[arg(long)]
    pub env_file: Option<PathBuf>,
    /// Default asset for signals that do not name one
    #[arg(long)]
    pub asset: Option<String>,
    #[arg(long)]
    pub api_port: Option<u16>,
    #[arg(long)]
    pub ui_port: Option<u16>,
}

/// How to size a position when the signal has no size.
#[derive(Clone, Debug, PartialEq)]
pub enum SizingMode {
    Fixed(f64),
    Fraction(f64),
}

impl SizingMode {
    pub fn from_env(default_size: f64, fraction: f64) -> SizingMode {
        match env::var("SIZING").unwrap_or_default().trim().to_ascii_lowercase().as_str() {
            "fixed" | "fixed_size" => SizingMode::Fixed(default_size),
            _ => SizingMode::Fraction(fraction),
        }
    }

    pub fn policy(&self) -> Box<dyn SizingPolicy> {
        match *self {
            SizingMode::Fixed(q) => Box::new(FixedSize(q)),
            SizingMode::Fraction(f) => Box::new(BalanceFraction(f)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Args {
    // trading
    pub asset_name: String,
    pub leverage: u32,
    pub is_cross: bool,
    pub slippage: f64,
    pub sizing: SizingMode,

    // servers
    pub api_host: String,
    pub api_port: u16,
    pub ui_host: String,
    pub ui_port: u16,

    // files
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,

    // exchange
    pub exchange_timeout_ms: u64,
    pub paper_balance: f64,
    pub paper_price: f64,
    pub paper_latency_ms: u64,

    // credentials (presence only)
    pub has_private_key: bool,
    pub has_account_address: bool,
    pub has_monitoring_address: bool,
}

impl Args {
    pub fn dispatch_cfg(&self) -> DispatchCfg {
        DispatchCfg {
            default_asset: self.asset_name.clone(),
            leverage: self.leverage,
            is_cross: self.is_cross,
            slippage: self.slippage,
            exchange_timeout: Duration::from_millis(self.exchange_timeout_ms),
        }
    }

    pub fn api_addr(&self) -> Result<SocketAddr, ConfigError> { socket_addr(&self.api_host, self.api_port) }

    pub fn ui_addr(&self) -> Result<SocketAddr, ConfigError> { socket_addr(&self.ui_host, self.ui_port) }

    pub fn webhook_url(&self) -> String { format!("http://your-server:{}/webhook", self.api_port) }

    /// Warn once per missing credential; no values are ever logged.
    pub fn warn_demo_mode(&self) {
        if !self.has_private_key {
            warn!("HYPERLIQUID_PRIVATE_KEY is not set. Bot will run in demo mode.");
        }
        if !self.has_account_address {
            warn!("HYPERLIQUID_ACCOUNT_ADDRESS is not set. Bot will run in demo mode.");
        }
        if !self.has_monitoring_address {
            tracing::debug!("HYPERLIQUID_MONITORING_ADDRESS is not set");
        }
    }
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    format!("{host}:{port}").parse().map_err(|_| ConfigError::Addr(format!("{host}:{port}")))
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key).unwrap_or_default().trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

fn env_present(key: &str) -> bool { env::var(key).map(|v| !v.trim().is_empty()).unwrap_or(false) }

pub fn load(cli: &Cli) -> Result<Args, ConfigError> {
    // explicit env file must exist; the default `.env` is optional
    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path)
                .map_err(|source| ConfigError::EnvFile { path: path.display().to_string(), source })?;
        }
        None => {
            let _ = dotenvy::dotenv();
        }
    }
    Ok(from_env(cli))
}

/// Read the process environment (already populated) and apply CLI overrides.
pub fn from_env(cli: &Cli) -> Args {
    // ===== Trading =====
    let asset_name = cli
        .asset
        .clone()
        .or_else(|| env::var("ASSET_NAME").ok())
        .map(|a| a.trim().to_ascii_uppercase())
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| "ETH".to_string());
    let leverage = env_or("LEVERAGE", 5u32);
    let is_cross = env_bool("IS_CROSS", true);
    let slippage = env_or("SLIPPAGE", 0.05f64);
    let sizing = SizingMode::from_env(env_or("DEFAULT_SIZE", 0.1), env_or("SIZE_FRACTION", 0.1));

    // ===== Servers =====
    let api_host = env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let api_port = cli.api_port.unwrap_or_else(|| env_or("API_PORT", 8000));
    let ui_host = env::var("UI_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let ui_port = cli.ui_port.unwrap_or_else(|| env_or("UI_PORT", 5000));

    // ===== Files =====
    let data_dir = PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string()));
    let log_dir = PathBuf::from(env::var("LOG_DIR").unwrap_or_else(|_| "logs".to_string()));

    // ===== Exchange =====
    let exchange_timeout_ms = env_or("EXCHANGE_TIMEOUT_MS", 5000);
    let paper_balance = env_or("PAPER_BALANCE", 10_000.0);
    let paper_price = env_or("PAPER_PRICE", 3500.0);
    let paper_latency_ms = env_or("PAPER_LATENCY_MS", 0);

    Args {
        asset_name,
        leverage,
        is_cross,
        slippage,
        sizing,
        api_host,
        api_port,
        ui_host,
        ui_port,
        data_dir,
        log_dir,
        exchange_timeout_ms,
        paper_balance,
        paper_price,
        paper_latency_ms,
        has_private_key: env_present("HYPERLIQUID_PRIVATE_KEY"),
        has_account_address: env_present("HYPERLIQUID_ACCOUNT_ADDRESS"),
        has_monitoring_address: env_present("HYPERLIQUID_MONITORING_ADDRESS"),
    }
}
