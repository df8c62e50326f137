// ===============================
// src/positions.rs (open position book)
// ===============================
use std::collections::VecDeque;
use thiserror::Error;

use crate::domain::Position;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("no open positions")]
pub struct NoOpenPositions;

/// Open positions in the order they were opened. Only the dispatcher writes here.
#[derive(Debug, Default)]
pub struct PositionStore {
    open: VecDeque<Position>,
}

impl PositionStore {
    pub fn new() -> Self { Self::default() }

    pub fn add(&mut self, position: Position) { self.open.push_back(position); }

    pub fn oldest(&self) -> Option<&Position> { self.open.front() }

    /// FIFO close: first opened, first removed.
    pub fn remove_oldest(&mut self) -> Result<Position, NoOpenPositions> {
        self.open.pop_front().ok_or(NoOpenPositions)
    }

    pub fn list_open(&self) -> Vec<Position> { self.open.iter().cloned().collect() }

    pub fn is_empty(&self) -> bool { self.open.is_empty() }

    pub fn len(&self) -> usize { self.open.len() }

    /// Distinct assets, first-seen order.
    pub fn assets(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for p in &self.open {
            if !out.iter().any(|a| a == &p.asset) {
                out.push(p.asset.clone());
            }
        }
        out
    }

    /// Refresh mark and unrealized PnL for every position on `asset`; returns the asset total.
    pub fn mark_to_market(&mut self, asset: &str, px: f64) -> f64 {
        let mut u = 0.0;
        for p in self.open.iter_mut().filter(|p| p.asset == asset) {
            p.mark(px);
            u += p.unrealized_pnl;
        }
        u
    }
}
