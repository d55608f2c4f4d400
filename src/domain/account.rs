//! Account session state pushed by the Execution Agent on every poll.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::trade::TradeDirection;

/// Account snapshot as reported by the terminal
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSnapshot {
    pub balance: Decimal,
    pub equity: Decimal,
    pub free_margin: Decimal,
    pub leverage: u32,
    pub currency: String,
}

/// An open position inside the terminal
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub ticket: i64,
    pub symbol: String,
    pub direction: TradeDirection,
    pub volume: Decimal,
    pub open_price: Decimal,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    pub profit: Decimal,
    pub open_time: DateTime<Utc>,
}

/// Latest bid/ask for the traded symbol
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub bid: Decimal,
    pub ask: Decimal,
    pub time: DateTime<Utc>,
}

impl Quote {
    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }

    pub fn mid(&self) -> Decimal {
        (self.ask + self.bid) / Decimal::TWO
    }
}

/// One OHLC bar of the candle window the agent pushes
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: i64,
}

/// Latest Agent-pushed state for one account, upserted on every poll
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    pub account_id: String,
    pub heartbeat: DateTime<Utc>,
    pub snapshot: AccountSnapshot,
    pub positions: Vec<Position>,
    pub quote: Option<Quote>,
    pub candles: Vec<Candle>,
    pub agent_version: String,
    /// When the strategy collaborator last ran for this account
    pub last_analysis_at: Option<DateTime<Utc>>,
}

impl AgentSession {
    /// Online iff the heartbeat is younger than the configured window
    pub fn is_online(&self, window_secs: u64, now: DateTime<Utc>) -> bool {
        (now - self.heartbeat).num_seconds() < window_secs as i64
    }
}

/// Bearer token bound to the account whose credentials produced it.
/// A token must never authenticate a call for any other account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionToken {
    pub account_id: String,
    pub token: String,
    pub issued_at: DateTime<Utc>,
    /// Digest of the owning login, checked on restore so a stored token is
    /// never reused after credentials change
    pub owner_digest: String,
}

impl SessionToken {
    pub fn new(account_id: &str, token: &str, login: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            token: token.to_string(),
            issued_at: Utc::now(),
            owner_digest: owner_digest(login),
        }
    }

    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.issued_at).num_seconds()
    }
}

/// Digest binding a token to the credentials that produced it
pub fn owner_digest(login: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(login.as_bytes());
    hex::encode(hasher.finalize())
}
