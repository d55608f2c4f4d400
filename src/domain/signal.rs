//! Trading decisions from the strategy collaborator.
//!
//! The scoring internals are an opaque oracle; the core only reads direction,
//! levels and the 0-100 confidence. A `MasterSignal` is computed exactly once
//! per orchestrator cycle and is immutable for the rest of that cycle.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::trade::TradeDirection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "BUY",
            SignalAction::Sell => "SELL",
            SignalAction::Hold => "HOLD",
        }
    }

    pub fn is_actionable(&self) -> bool {
        !matches!(self, SignalAction::Hold)
    }

    pub fn direction(&self) -> Option<TradeDirection> {
        match self {
            SignalAction::Buy => Some(TradeDirection::Buy),
            SignalAction::Sell => Some(TradeDirection::Sell),
            SignalAction::Hold => None,
        }
    }
}

/// What the strategy collaborator returns from one analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSetup {
    pub action: SignalAction,
    pub entry: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    /// 0-100
    pub confidence: u8,
    pub reasons: Vec<String>,
}

impl TradeSetup {
    pub fn hold() -> Self {
        Self {
            action: SignalAction::Hold,
            entry: Decimal::ZERO,
            stop_loss: None,
            take_profit: None,
            confidence: 0,
            reasons: vec![],
        }
    }
}

/// The single decision of one cycle, shared unmodified by all accounts.
/// Cloning for an account only swaps the symbol; levels and confidence
/// never change mid-cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterSignal {
    pub id: Uuid,
    pub action: SignalAction,
    pub symbol: String,
    pub entry: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub confidence: u8,
    pub reasons: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl MasterSignal {
    pub fn from_setup(setup: &TradeSetup, symbol: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            action: setup.action,
            symbol: symbol.to_string(),
            entry: setup.entry,
            stop_loss: setup.stop_loss,
            take_profit: setup.take_profit,
            confidence: setup.confidence,
            reasons: setup.reasons.clone(),
            created_at: Utc::now(),
        }
    }

    /// Per-account copy; broker symbol suffixes differ, everything else is
    /// the shared master decision
    pub fn for_symbol(&self, symbol: &str) -> Self {
        let mut clone = self.clone();
        clone.symbol = symbol.to_string();
        clone
    }

    pub fn is_actionable(&self, min_confidence: u8) -> bool {
        self.action.is_actionable() && self.confidence >= min_confidence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn setup(action: SignalAction, confidence: u8) -> TradeSetup {
        TradeSetup {
            action,
            entry: dec!(2350.5),
            stop_loss: Some(dec!(2345.0)),
            take_profit: Some(dec!(2360.0)),
            confidence,
            reasons: vec!["bos".into()],
        }
    }

    #[test]
    fn test_hold_never_actionable() {
        let signal = MasterSignal::from_setup(&setup(SignalAction::Hold, 99), "XAUUSD");
        assert!(!signal.is_actionable(0));
    }

    #[test]
    fn test_confidence_threshold() {
        let signal = MasterSignal::from_setup(&setup(SignalAction::Buy, 60), "XAUUSD");
        assert!(signal.is_actionable(55));
        assert!(!signal.is_actionable(70));
    }

    #[test]
    fn test_for_symbol_keeps_decision() {
        let master = MasterSignal::from_setup(&setup(SignalAction::Sell, 80), "XAUUSD");
        let cloned = master.for_symbol("XAUUSD.m");
        assert_eq!(cloned.symbol, "XAUUSD.m");
        assert_eq!(cloned.id, master.id);
        assert_eq!(cloned.action, master.action);
        assert_eq!(cloned.entry, master.entry);
        assert_eq!(cloned.confidence, master.confidence);
    }
}
