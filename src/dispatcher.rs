// ===============================
// src/dispatcher.rs (signal -> exchange ops -> book)
// ===============================
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::domain::{realized_pnl, Action, Direction, Outcome, Position, Signal};
use crate::exchange::{ExchangeAdapter, ExchangeError, OrderRequest};
use crate::metrics::{DISPATCHES, DISPATCH_LATENCY, OPEN_POSITIONS, PNL_REALIZED, SIGNALS};
use crate::positions::PositionStore;
use crate::risk::{is_tradeable_size, resolve_size, SizingPolicy};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error("Invalid position size {size} for {asset}")]
    InvalidSize { asset: String, size: f64 },
}

impl DispatchError {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::UnknownAction(_) => "unknown_action",
            DispatchError::Exchange(_) => "exchange_error",
            DispatchError::InvalidSize { .. } => "invalid_size",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchCfg {
    pub default_asset: String,
    pub leverage: u32,
    pub is_cross: bool,
    pub slippage: f64,
    pub exchange_timeout: Duration,
}

impl Default for DispatchCfg {
    fn default() -> Self {
        Self {
            default_asset: "ETH".into(),
            leverage: 5,
            is_cross: true,
            slippage: 0.05,
            exchange_timeout: Duration::from_secs(5),
        }
    }
}

/// Owns the position book and the exchange handle. One dispatch at a time:
/// the book lock is held from the first exchange call to the final mutation.
pub struct Dispatcher {
    book: Mutex<PositionStore>,
    exchange: Arc<dyn ExchangeAdapter>,
    sizing: Box<dyn SizingPolicy>,
    cfg: DispatchCfg,
}

impl Dispatcher {
    pub fn new(exchange: Arc<dyn ExchangeAdapter>, sizing: Box<dyn SizingPolicy>, cfg: DispatchCfg) -> Self {
        Self { book: Mutex::new(PositionStore::new()), exchange, sizing, cfg }
    }

    pub fn default_asset(&self) -> &str { &self.cfg.default_asset }

    pub async fn dispatch(&self, signal: &Signal) -> Result<Outcome, DispatchError> {
        let started = Instant::now();
        let res = self.dispatch_inner(signal).await;
        DISPATCH_LATENCY.observe(started.elapsed().as_secs_f64() * 1000.0);

        let label = match &res {
            Ok(Outcome::Opened { .. }) => "opened",
            Ok(Outcome::Closed { .. }) => "closed",
            Ok(Outcome::NoOpenPositions) => "no_open_positions",
            Err(e) => e.kind(),
        };
        DISPATCHES.with_label_values(&[label]).inc();
        res
    }

    async fn dispatch_inner(&self, signal: &Signal) -> Result<Outcome, DispatchError> {
        let action: Action = signal.action.parse()?;
        SIGNALS.with_label_values(&[action.as_str()]).inc();
        info!(%action, size = ?signal.size, asset = ?signal.asset, "dispatch");

        let mut book = self.book.lock().await;
        let out = match Direction::from_action(action) {
            Some(direction) => self.open(&mut book, direction, signal).await?,
            None => self.close_oldest(&mut book).await?,
        };
        OPEN_POSITIONS.set(book.len() as i64);
        Ok(out)
    }

    async fn open(&self, book: &mut PositionStore, direction: Direction, signal: &Signal) -> Result<Outcome, DispatchError> {
        let asset = match signal.asset.as_deref().map(str::trim) {
            Some(a) if !a.is_empty() => a.to_string(),
            _ => self.cfg.default_asset.clone(),
        };

        let px = self.price(&asset).await?;
        let needs_balance = !signal.size.is_some_and(is_tradeable_size) && self.sizing.needs_balance();
        let balance = if needs_balance { self.call(self.exchange.account_balance()).await? } else { 0.0 };
        let size = resolve_size(signal.size, self.sizing.as_ref(), balance, px);
        if !is_tradeable_size(size) {
            warn!(%asset, size, balance, "sizing produced no tradeable size");
            return Err(DispatchError::InvalidSize { asset, size });
        }

        // Build the book entry before anything reaches the venue.
        let position = Position::open(&asset, direction, size, px)
            .ok_or_else(|| DispatchError::InvalidSize { asset: asset.clone(), size })?;
        let order = self.order(&asset, direction.is_long(), size, false);
        let fill = self.call(self.exchange.submit_order(&order)).await?;
        debug!(order_id = %fill.order_id, fill_px = fill.avg_px, "open filled");

        book.add(position.clone());
        info!(%asset, ?direction, size, entry_px = px, open = book.len(), "position opened");
        Ok(Outcome::Opened { position })
    }

    async fn close_oldest(&self, book: &mut PositionStore) -> Result<Outcome, DispatchError> {
        let Some(oldest) = book.oldest().cloned() else {
            info!("close requested with empty book");
            return Ok(Outcome::NoOpenPositions);
        };

        let px = self.price(&oldest.asset).await?;
        let order = self.order(&oldest.asset, !oldest.direction.is_long(), oldest.size, true);
        let fill = self.call(self.exchange.submit_order(&order)).await?;
        debug!(order_id = %fill.order_id, fill_px = fill.avg_px, "close filled");

        let pnl = realized_pnl(oldest.direction, oldest.entry_price, px, oldest.size);
        // Only mutation on this path; everything fallible happened above.
        let closed = match book.remove_oldest() {
            Ok(p) => p,
            Err(_) => return Ok(Outcome::NoOpenPositions),
        };
        PNL_REALIZED.add(pnl);
        info!(asset = %closed.asset, direction = ?closed.direction, size = closed.size, entry_px = closed.entry_price, exit_px = px, pnl, "position closed");

        Ok(Outcome::Closed {
            asset: closed.asset,
            direction: closed.direction,
            size: closed.size,
            entry_price: closed.entry_price,
            exit_price: px,
            pnl,
        })
    }

    /// Open positions with a fresh mark per asset; a failed quote keeps the previous mark.
    pub async fn open_positions(&self) -> Vec<Position> {
        let mut book = self.book.lock().await;
        for asset in book.assets() {
            match self.price(&asset).await {
                Ok(px) => {
                    book.mark_to_market(&asset, px);
                }
                Err(e) => warn!(%asset, ?e, "mark failed, serving last mark"),
            }
        }
        book.list_open()
    }

    pub async fn account_balance(&self) -> Result<f64, ExchangeError> {
        self.call(self.exchange.account_balance()).await
    }

    pub async fn current_price(&self, asset: &str) -> Result<f64, ExchangeError> { self.price(asset).await }

    async fn price(&self, asset: &str) -> Result<f64, ExchangeError> {
        let px = self.call(self.exchange.current_price(asset)).await?;
        if !(px.is_finite() && px > 0.0) {
            return Err(ExchangeError::InvalidPrice { asset: asset.to_string(), price: px });
        }
        Ok(px)
    }

    async fn call<T, F>(&self, fut: F) -> Result<T, ExchangeError>
    where
        F: Future<Output = Result<T, ExchangeError>>,
    {
        match timeout(self.cfg.exchange_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(ExchangeError::Timeout(self.cfg.exchange_timeout.as_millis() as u64)),
        }
    }

    fn order(&self, asset: &str, is_buy: bool, size: f64, reduce_only: bool) -> OrderRequest {
        OrderRequest {
            asset: asset.to_string(),
            is_buy,
            size,
            reduce_only,
            slippage: self.cfg.slippage,
            leverage: self.cfg.leverage,
            is_cross: self.cfg.is_cross,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::TradeType;
    use crate::exchange::{Fill, PaperExchange};
    use crate::risk::{BalanceFraction, FixedSize};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    /// Exchange double that can be told to fail, stall or lag; counts orders and
    /// calls that ran while another call was still in flight.
    #[derive(Default)]
    pub(crate) struct ScriptedExchange {
        pub paper: Option<PaperExchange>,
        pub fail_price: AtomicBool,
        pub fail_orders: AtomicBool,
        pub fail_balance: AtomicBool,
        pub stall: AtomicBool,
        pub latency_ms: AtomicU64,
        pub orders: AtomicUsize,
        pub balance_calls: AtomicUsize,
        pub in_flight: AtomicUsize,
        pub overlaps: AtomicUsize,
    }

    impl ScriptedExchange {
        pub(crate) fn new() -> Self {
            Self { paper: Some(PaperExchange::new(10_000.0, 3500.0, 0)), ..Default::default() }
        }

        pub(crate) fn set_price(&self, asset: &str, px: f64) {
            if let Some(p) = &self.paper {
                p.set_price(asset, px);
            }
        }

        fn paper(&self) -> &PaperExchange { self.paper.as_ref().unwrap() }

        async fn maybe_stall(&self) {
            if self.stall.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        }

        async fn lag(&self) {
            if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            let ms = self.latency_ms.load(Ordering::SeqCst);
            if ms > 0 {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ExchangeAdapter for ScriptedExchange {
        async fn current_price(&self, asset: &str) -> Result<f64, ExchangeError> {
            self.maybe_stall().await;
            self.lag().await;
            if self.fail_price.load(Ordering::SeqCst) {
                return Err(ExchangeError::Unavailable("price feed down".into()));
            }
            self.paper().current_price(asset).await
        }

        async fn account_balance(&self) -> Result<f64, ExchangeError> {
            self.balance_calls.fetch_add(1, Ordering::SeqCst);
            self.lag().await;
            if self.fail_balance.load(Ordering::SeqCst) {
                return Err(ExchangeError::Unavailable("account endpoint down".into()));
            }
            self.paper().account_balance().await
        }

        async fn submit_order(&self, order: &OrderRequest) -> Result<Fill, ExchangeError> {
            if self.fail_orders.load(Ordering::SeqCst) {
                return Err(ExchangeError::Rejected("insufficient margin".into()));
            }
            self.orders.fetch_add(1, Ordering::SeqCst);
            self.lag().await;
            self.paper().submit_order(order).await
        }
    }

    pub(crate) fn dispatcher(ex: Arc<ScriptedExchange>) -> Dispatcher {
        Dispatcher::new(ex, Box::new(FixedSize(0.1)), DispatchCfg::default())
    }

    #[tokio::test]
    async fn buy_then_close_scenario() {
        let ex = Arc::new(ScriptedExchange::new());
        let d = dispatcher(ex.clone());

        ex.set_price("ETH", 2000.0);
        let out = d.dispatch(&Signal::new("BUY").with_size(0.5).with_asset("ETH")).await.unwrap();
        let Outcome::Opened { position } = out else { panic!("expected open") };
        assert_eq!(position.direction, Direction::Long);
        assert_eq!(position.size, 0.5);
        assert_eq!(position.entry_price, 2000.0);
        assert_eq!(position.unrealized_pnl, 0.0);
        assert_eq!(d.open_positions().await.len(), 1);

        ex.set_price("ETH", 2100.0);
        let out = d.dispatch(&Signal::new("CLOSE")).await.unwrap();
        let fill = out.trade().unwrap();
        assert_eq!(fill.trade_type, TradeType::CloseLong);
        assert_eq!(fill.pnl, 50.0);
        assert_eq!(fill.price, 2100.0);
        assert_eq!(fill.size, 0.5);
        assert!(d.open_positions().await.is_empty());
    }

    #[tokio::test]
    async fn sell_then_close_scenario() {
        let ex = Arc::new(ScriptedExchange::new());
        let d = dispatcher(ex.clone());

        ex.set_price("ETH", 3500.0);
        d.dispatch(&Signal::new("SELL").with_size(1.0)).await.unwrap();
        ex.set_price("ETH", 3400.0);
        let out = d.dispatch(&Signal::new("CLOSE")).await.unwrap();
        match out {
            Outcome::Closed { pnl, direction, entry_price, exit_price, .. } => {
                assert_eq!(pnl, 100.0);
                assert_eq!(direction, Direction::Short);
                assert_eq!(entry_price, 3500.0);
                assert_eq!(exit_price, 3400.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_is_fifo() {
        let ex = Arc::new(ScriptedExchange::new());
        let d = dispatcher(ex.clone());

        d.dispatch(&Signal::new("BUY").with_size(1.0)).await.unwrap();
        d.dispatch(&Signal::new("BUY").with_size(2.0)).await.unwrap();
        let out = d.dispatch(&Signal::new("CLOSE")).await.unwrap();
        assert_eq!(out.trade().unwrap().size, 1.0);

        let left = d.open_positions().await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].size, 2.0);
    }

    #[tokio::test]
    async fn close_on_empty_book_is_not_an_error() {
        let ex = Arc::new(ScriptedExchange::new());
        let d = dispatcher(ex.clone());
        let out = d.dispatch(&Signal::new("close")).await.unwrap();
        assert_eq!(out, Outcome::NoOpenPositions);
        assert!(out.trade().is_none());
        assert_eq!(ex.orders.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_action_has_no_side_effects() {
        let ex = Arc::new(ScriptedExchange::new());
        let d = dispatcher(ex.clone());
        d.dispatch(&Signal::new("BUY")).await.unwrap();
        let before = d.open_positions().await;

        let err = d.dispatch(&Signal::new("HOLD")).await.unwrap_err();
        assert_eq!(err, DispatchError::UnknownAction("HOLD".into()));
        assert_eq!(d.open_positions().await, before);
        assert_eq!(ex.orders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exchange_failure_leaves_book_untouched() {
        let ex = Arc::new(ScriptedExchange::new());
        let d = dispatcher(ex.clone());

        ex.fail_price.store(true, Ordering::SeqCst);
        let err = d.dispatch(&Signal::new("BUY")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Exchange(ExchangeError::Unavailable(_))));
        assert!(d.open_positions().await.is_empty());

        ex.fail_price.store(false, Ordering::SeqCst);
        d.dispatch(&Signal::new("BUY")).await.unwrap();
        ex.fail_orders.store(true, Ordering::SeqCst);
        let err = d.dispatch(&Signal::new("CLOSE")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Exchange(ExchangeError::Rejected(_))));
        assert_eq!(d.open_positions().await.len(), 1);

        let err = d.dispatch(&Signal::new("SELL")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Exchange(_)));
        assert_eq!(d.open_positions().await.len(), 1);
    }

    #[tokio::test]
    async fn stalled_exchange_times_out() {
        let ex = Arc::new(ScriptedExchange::new());
        let d = Dispatcher::new(
            ex.clone(),
            Box::new(FixedSize(0.1)),
            DispatchCfg { exchange_timeout: Duration::from_millis(50), ..Default::default() },
        );
        ex.stall.store(true, Ordering::SeqCst);
        let err = d.dispatch(&Signal::new("BUY")).await.unwrap_err();
        assert_eq!(err, DispatchError::Exchange(ExchangeError::Timeout(50)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_dispatches_never_interleave() {
        let ex = Arc::new(ScriptedExchange::new());
        ex.latency_ms.store(20, Ordering::SeqCst);
        let d = dispatcher(ex.clone());

        let buy_1 = Signal::new("BUY").with_size(1.0);
        let buy_2 = Signal::new("BUY").with_size(2.0);
        let close = Signal::new("CLOSE");
        let (a, b, c) = tokio::join!(d.dispatch(&buy_1), d.dispatch(&buy_2), d.dispatch(&close));

        // the book lock is taken in poll order: BUY 1.0, BUY 2.0, then CLOSE
        assert!(matches!(a, Ok(Outcome::Opened { .. })));
        assert!(matches!(b, Ok(Outcome::Opened { .. })));
        assert_eq!(c.unwrap().trade().unwrap().size, 1.0);
        assert_eq!(ex.orders.load(Ordering::SeqCst), 3);
        assert_eq!(ex.overlaps.load(Ordering::SeqCst), 0);

        let left = d.open_positions().await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].size, 2.0);
    }

    #[tokio::test]
    async fn default_size_and_asset_come_from_config() {
        let ex = Arc::new(ScriptedExchange::new());
        let d = dispatcher(ex.clone());
        let out = d.dispatch(&Signal::new("BUY").with_size(0.0).with_asset("  ")).await.unwrap();
        let Outcome::Opened { position } = out else { panic!("expected open") };
        assert_eq!(position.asset, "ETH");
        assert_eq!(position.size, 0.1);
        assert_eq!(position.entry_price, 3500.0);
        assert_eq!(ex.balance_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn balance_fraction_sizing_reads_balance() {
        let ex = Arc::new(ScriptedExchange::new());
        let d = Dispatcher::new(ex.clone(), Box::new(BalanceFraction(0.1)), DispatchCfg::default());
        ex.set_price("ETH", 2000.0);
        let out = d.dispatch(&Signal::new("SELL")).await.unwrap();
        assert_eq!(out.trade().unwrap().size, 0.5);
        assert_eq!(ex.balance_calls.load(Ordering::SeqCst), 1);

        // an explicit size skips the balance read
        d.dispatch(&Signal::new("SELL").with_size(1.0)).await.unwrap();
        assert_eq!(ex.balance_calls.load(Ordering::SeqCst), 1);

        ex.paper().set_balance(0.0);
        let err = d.dispatch(&Signal::new("BUY")).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidSize { .. }));
        assert_eq!(d.open_positions().await.len(), 2);
        assert_eq!(ex.orders.load(Ordering::SeqCst), 2, "rejected size never reaches the venue");
    }

    #[tokio::test]
    async fn open_positions_marks_each_asset() {
        let ex = Arc::new(ScriptedExchange::new());
        let d = dispatcher(ex.clone());
        ex.set_price("ETH", 100.0);
        ex.set_price("BTC", 1000.0);
        d.dispatch(&Signal::new("BUY").with_size(1.0).with_asset("ETH")).await.unwrap();
        d.dispatch(&Signal::new("SELL").with_size(1.0).with_asset("BTC")).await.unwrap();

        ex.set_price("ETH", 110.0);
        ex.set_price("BTC", 900.0);
        let open = d.open_positions().await;
        assert_eq!(open[0].unrealized_pnl, 10.0);
        assert_eq!(open[1].unrealized_pnl, 100.0);
        assert_eq!(d.open_positions().await, open);

        ex.fail_price.store(true, Ordering::SeqCst);
        assert_eq!(d.open_positions().await, open);
    }

    #[tokio::test]
    async fn close_uses_the_oldest_positions_asset() {
        let ex = Arc::new(ScriptedExchange::new());
        let d = dispatcher(ex.clone());
        ex.set_price("BTC", 60_000.0);
        ex.set_price("ETH", 2000.0);
        d.dispatch(&Signal::new("BUY").with_size(0.1).with_asset("BTC")).await.unwrap();
        d.dispatch(&Signal::new("BUY").with_size(1.0).with_asset("ETH")).await.unwrap();

        ex.set_price("BTC", 61_000.0);
        let fill = d.dispatch(&Signal::new("CLOSE")).await.unwrap().trade().unwrap();
        assert_eq!(fill.asset, "BTC");
        assert_eq!(fill.price, 61_000.0);
        assert!((fill.pnl - 100.0).abs() < 1e-9);
    }
}
