//! Collaborator seams for the strategy and money-management components.
//!
//! Both are opaque to the orchestration core: the strategy returns a setup or
//! nothing, the money manager returns sizing and a daily stop flag. Their
//! internals live outside this crate and plug in at construction time.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::{Candle, TradeSetup};
use crate::error::Result;

/// Trading-signal oracle consulted once per cycle (orchestrator) or per
/// analysis window (agent bridge)
#[cfg_attr(test, mockall::automock)]
pub trait Strategy: Send + Sync {
    fn analyze(
        &self,
        candles: &[Candle],
        current_price: Decimal,
        spread: Decimal,
    ) -> Option<TradeSetup>;
}

/// Sizing and risk posture for one account
#[derive(Debug, Clone)]
pub struct MoneyStatus {
    pub lot_size: Decimal,
    pub level: u32,
    /// When set, the guard chain places nothing for this account today
    pub daily_stop: bool,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MoneyManager: Send + Sync {
    async fn status(&self, account_id: &str) -> Result<MoneyStatus>;
}

/// Placeholder strategy wired when no collaborator is configured; the server
/// still serves the agent protocol, it just never initiates trades.
pub struct HoldStrategy;

impl Strategy for HoldStrategy {
    fn analyze(&self, _: &[Candle], _: Decimal, _: Decimal) -> Option<TradeSetup> {
        None
    }
}

/// Fixed-size money manager used until a sizing table is plugged in
pub struct FixedMoneyManager {
    lot_size: Decimal,
}

impl FixedMoneyManager {
    pub fn new(lot_size: Decimal) -> Self {
        Self { lot_size }
    }
}

#[async_trait]
impl MoneyManager for FixedMoneyManager {
    async fn status(&self, _account_id: &str) -> Result<MoneyStatus> {
        Ok(MoneyStatus {
            lot_size: self.lot_size,
            level: 1,
            daily_stop: false,
        })
    }
}
