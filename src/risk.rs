// ===============================
// src/risk.rs
// ===============================
use std::fmt;

/// How big a position to open when the signal does not say.
pub trait SizingPolicy: Send + Sync + fmt::Debug {
    fn size(&self, balance: f64, price: f64) -> f64;

    /// False when `size` ignores the balance, so the dispatcher can skip that call.
    fn needs_balance(&self) -> bool { true }
}

/// Constant size in asset units.
#[derive(Debug, Clone, Copy)]
pub struct FixedSize(pub f64);

impl SizingPolicy for FixedSize {
    fn size(&self, _balance: f64, _price: f64) -> f64 { self.0 }
    fn needs_balance(&self) -> bool { false }
}

/// Spend a fixed fraction of the account balance at the current price.
#[derive(Debug, Clone, Copy)]
pub struct BalanceFraction(pub f64);

impl SizingPolicy for BalanceFraction {
    fn size(&self, balance: f64, price: f64) -> f64 {
        if price <= 0.0 {
            return 0.0;
        }
        balance * self.0 / price
    }
}

pub fn is_tradeable_size(size: f64) -> bool { size.is_finite() && size > 0.0 }

/// Override wins when it is a usable size; otherwise the policy decides.
pub fn resolve_size(size_override: Option<f64>, policy: &dyn SizingPolicy, balance: f64, price: f64) -> f64 {
    match size_override {
        Some(s) if is_tradeable_size(s) => s,
        _ => policy.size(balance, price),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins_when_positive() {
        let p = FixedSize(0.1);
        assert_eq!(resolve_size(Some(0.5), &p, 10_000.0, 2000.0), 0.5);
        assert_eq!(resolve_size(Some(0.0), &p, 10_000.0, 2000.0), 0.1);
        assert_eq!(resolve_size(Some(-3.0), &p, 10_000.0, 2000.0), 0.1);
        assert_eq!(resolve_size(Some(f64::NAN), &p, 10_000.0, 2000.0), 0.1);
        assert_eq!(resolve_size(None, &p, 10_000.0, 2000.0), 0.1);
    }

    #[test]
    fn balance_fraction_converts_to_units() {
        let p = BalanceFraction(0.1);
        assert!(p.needs_balance());
        assert_eq!(resolve_size(None, &p, 10_000.0, 2000.0), 0.5);
        assert_eq!(p.size(10_000.0, 0.0), 0.0);
        assert!(!is_tradeable_size(p.size(0.0, 2000.0)));
    }
}
