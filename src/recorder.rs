// ===============================
// src/recorder.rs
// ===============================
//
// Append-only JSONL store for trade history, balance snapshots and bot status.
// - One file per stream under DATA_DIR (trades / balance_history / bot_status).
// - Every write is a single line followed by a flush, timestamped here.
// - Parent directory is created on open.
// - Reads rescan the file; malformed lines are skipped.
//
use chrono::{Duration as ChronoDuration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter},
    sync::Mutex,
};
use tracing::{debug, info, warn};

use crate::domain::{BalanceSnapshot, BotStatus, StatusEntry, TradeFill, TradeRecord};
use crate::metrics;

const TRADES_FILE: &str = "trades.jsonl";
const BALANCE_FILE: &str = "balance_history.jsonl";
const STATUS_FILE: &str = "bot_status.jsonl";

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("recorder io on {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("recorder serialize: {0}")]
    Serialize(#[from] serde_json::Error),
}

struct Stream {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

async fn open_writer(path: &Path) -> Result<BufWriter<File>, RecorderError> {
    let io_err = |source| RecorderError::Io { path: path.display().to_string(), source };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await.map_err(io_err)?;
    Ok(BufWriter::new(file))
}

impl Stream {
    async fn open(path: PathBuf) -> Result<Self, RecorderError> {
        let writer = Mutex::new(open_writer(&path).await?);
        Ok(Self { path, writer })
    }

    async fn append<T: Serialize>(&self, row: &T) -> Result<(), RecorderError> {
        let mut line = serde_json::to_string(row)?;
        line.push('\n');
        let io_err = |source| RecorderError::Io { path: self.path.display().to_string(), source };

        let mut w = self.writer.lock().await;
        if let Err(e) = w.write_all(line.as_bytes()).await {
            warn!(?e, path = %self.path.display(), "recorder: write failed, reopening");
            *w = open_writer(&self.path).await?;
            w.write_all(line.as_bytes()).await.map_err(io_err)?;
        }
        w.flush().await.map_err(io_err)
    }

    async fn read_all<T: DeserializeOwned>(&self) -> Result<Vec<T>, RecorderError> {
        // hold the writer so we never read a half-flushed line
        let _guard = self.writer.lock().await;
        let file = match File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(RecorderError::Io { path: self.path.display().to_string(), source }),
        };

        let mut rows = Vec::new();
        let mut lines = BufReader::new(file).lines();
        let mut lineno = 0usize;
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|source| RecorderError::Io { path: self.path.display().to_string(), source })?
        {
            lineno += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(&line) {
                Ok(row) => rows.push(row),
                Err(e) => warn!(?e, path = %self.path.display(), lineno, "recorder: skip malformed line"),
            }
        }
        Ok(rows)
    }
}

/// Trade history, balance curve and status log, one JSONL file each.
pub struct Recorder {
    trades: Stream,
    balances: Stream,
    status: Stream,
}

impl Recorder {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, RecorderError> {
        let dir = dir.as_ref();
        let rec = Self {
            trades: Stream::open(dir.join(TRADES_FILE)).await?,
            balances: Stream::open(dir.join(BALANCE_FILE)).await?,
            status: Stream::open(dir.join(STATUS_FILE)).await?,
        };
        info!(dir = %dir.display(), "recorder: opened");
        Ok(rec)
    }

    pub async fn record_trade(&self, fill: &TradeFill) -> Result<TradeRecord, RecorderError> {
        let row = TradeRecord {
            timestamp: Utc::now(),
            asset: fill.asset.clone(),
            trade_type: fill.trade_type,
            size: fill.size,
            price: fill.price,
            pnl: fill.pnl,
        };
        self.trades.append(&row).await?;
        debug!(asset = %row.asset, kind = row.trade_type.as_str(), size = row.size, px = row.price, pnl = row.pnl, "trade recorded");
        Ok(row)
    }

    pub async fn record_balance(&self, balance: f64) -> Result<BalanceSnapshot, RecorderError> {
        let row = BalanceSnapshot { timestamp: Utc::now(), balance };
        self.balances.append(&row).await?;
        metrics::BALANCE.set(balance);
        Ok(row)
    }

    pub async fn update_status(&self, status: BotStatus) -> Result<StatusEntry, RecorderError> {
        let row = StatusEntry { status, timestamp: Utc::now() };
        self.status.append(&row).await?;
        metrics::set_status(status);
        info!(status = status.as_str(), "bot status");
        Ok(row)
    }

    /// Most recent first.
    pub async fn trades(&self, limit: usize) -> Result<Vec<TradeRecord>, RecorderError> {
        let mut rows: Vec<TradeRecord> = self.trades.read_all().await?;
        rows.reverse();
        rows.truncate(limit);
        Ok(rows)
    }

    /// Snapshots newer than `days` ago, oldest first. A window reaching past the
    /// representable range returns everything.
    pub async fn balance_history(&self, days: i64) -> Result<Vec<BalanceSnapshot>, RecorderError> {
        let cutoff = ChronoDuration::try_days(days).and_then(|w| Utc::now().checked_sub_signed(w));
        let rows: Vec<BalanceSnapshot> = self.balances.read_all().await?;
        Ok(rows.into_iter().filter(|b| cutoff.map_or(true, |c| b.timestamp > c)).collect())
    }

    pub async fn latest_status(&self) -> Result<StatusEntry, RecorderError> {
        let rows: Vec<StatusEntry> = self.status.read_all().await?;
        Ok(rows
            .into_iter()
            .last()
            .unwrap_or_else(|| StatusEntry { status: BotStatus::Unknown, timestamp: Utc::now() }))
    }
}
