//! Persisted trade outcomes, created on placement and reconciled against the
//! broker-side position list on every agent poll.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeDirection {
    Buy,
    Sell,
}

impl TradeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeDirection::Buy => "buy",
            TradeDirection::Sell => "sell",
        }
    }
}

impl TryFrom<&str> for TradeDirection {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "buy" => Ok(TradeDirection::Buy),
            "sell" => Ok(TradeDirection::Sell),
            other => Err(format!("unknown trade direction: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Open,
    Closed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Open => "OPEN",
            TradeStatus::Closed => "CLOSED",
        }
    }
}

impl TryFrom<&str> for TradeStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "OPEN" => Ok(TradeStatus::Open),
            "CLOSED" => Ok(TradeStatus::Closed),
            other => Err(format!("unknown trade status: {other}")),
        }
    }
}

/// One placed order and its lifecycle on the broker side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub account_id: String,
    pub ticket: Option<i64>,
    pub symbol: String,
    pub direction: TradeDirection,
    pub entry_price: Option<Decimal>,
    pub exit_price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub volume: Decimal,
    pub status: TradeStatus,
    pub signal_id: Option<Uuid>,
    /// Command that produced this trade, when placed through the agent bridge
    pub command_id: Option<Uuid>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub profit: Decimal,
}

impl Trade {
    pub fn open(
        account_id: &str,
        symbol: &str,
        direction: TradeDirection,
        volume: Decimal,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id: account_id.to_string(),
            ticket: None,
            symbol: symbol.to_string(),
            direction,
            entry_price: None,
            exit_price: None,
            stop_loss: None,
            take_profit: None,
            volume,
            status: TradeStatus::Open,
            signal_id: None,
            command_id: None,
            opened_at: Utc::now(),
            closed_at: None,
            profit: Decimal::ZERO,
        }
    }

    pub fn with_ticket(mut self, ticket: i64) -> Self {
        self.ticket = Some(ticket);
        self
    }

    pub fn with_entry(mut self, price: Decimal) -> Self {
        self.entry_price = Some(price);
        self
    }

    pub fn with_levels(mut self, stop_loss: Option<Decimal>, take_profit: Option<Decimal>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }

    pub fn with_signal(mut self, signal_id: Option<Uuid>) -> Self {
        self.signal_id = signal_id;
        self
    }

    pub fn with_command(mut self, command_id: Uuid) -> Self {
        self.command_id = Some(command_id);
        self
    }

    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }
}
