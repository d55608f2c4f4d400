//! Queued instructions awaiting Execution-Agent pickup.
//!
//! Commands move through an explicit state machine; illegal transitions are
//! rejected at the storage boundary, never patched up in callers:
//!
//! ```text
//! PENDING --delivered--> SENT --agent success--> EXECUTED
//!    |                        \--agent failure--> FAILED
//!    \--expiry reached, still PENDING/SENT------> EXPIRED
//! ```

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandKind {
    Buy,
    Sell,
    Close,
    Modify,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Buy => "BUY",
            CommandKind::Sell => "SELL",
            CommandKind::Close => "CLOSE",
            CommandKind::Modify => "MODIFY",
        }
    }

    pub fn opens_position(&self) -> bool {
        matches!(self, CommandKind::Buy | CommandKind::Sell)
    }
}

impl TryFrom<&str> for CommandKind {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "BUY" => Ok(CommandKind::Buy),
            "SELL" => Ok(CommandKind::Sell),
            "CLOSE" => Ok(CommandKind::Close),
            "MODIFY" => Ok(CommandKind::Modify),
            other => Err(format!("unknown command kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandOrigin {
    Auto,
    Manual,
}

impl CommandOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandOrigin::Auto => "AUTO",
            CommandOrigin::Manual => "MANUAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandStatus {
    Pending,
    Sent,
    Executed,
    Failed,
    Expired,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "PENDING",
            CommandStatus::Sent => "SENT",
            CommandStatus::Executed => "EXECUTED",
            CommandStatus::Failed => "FAILED",
            CommandStatus::Expired => "EXPIRED",
        }
    }

    /// The only transitions the storage layer will perform
    pub fn can_transition_to(&self, next: CommandStatus) -> bool {
        use CommandStatus::*;
        matches!(
            (self, next),
            (Pending, Sent)
                | (Pending, Executed)
                | (Pending, Expired)
                | (Sent, Executed)
                | (Sent, Failed)
                | (Sent, Expired)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Executed | CommandStatus::Failed | CommandStatus::Expired
        )
    }
}

impl TryFrom<&str> for CommandStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "PENDING" => Ok(CommandStatus::Pending),
            "SENT" => Ok(CommandStatus::Sent),
            "EXECUTED" => Ok(CommandStatus::Executed),
            "FAILED" => Ok(CommandStatus::Failed),
            "EXPIRED" => Ok(CommandStatus::Expired),
            other => Err(format!("unknown command status: {other}")),
        }
    }
}

/// A queued open/close/modify instruction for one account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub account_id: String,
    pub kind: CommandKind,
    pub symbol: String,
    pub volume: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    /// Broker ticket the command targets (CLOSE/MODIFY)
    pub ticket: Option<i64>,
    pub comment: Option<String>,
    pub origin: CommandOrigin,
    pub status: CommandStatus,
    /// Broker ticket reported back by the agent on success
    pub result_ticket: Option<i64>,
    pub result_price: Option<Decimal>,
    pub result_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub signal_id: Option<Uuid>,
}

impl Command {
    pub fn new(
        account_id: &str,
        kind: CommandKind,
        symbol: &str,
        origin: CommandOrigin,
        ttl_secs: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            account_id: account_id.to_string(),
            kind,
            symbol: symbol.to_string(),
            volume: None,
            stop_loss: None,
            take_profit: None,
            ticket: None,
            comment: None,
            origin,
            status: CommandStatus::Pending,
            result_ticket: None,
            result_price: None,
            result_error: None,
            created_at: now,
            sent_at: None,
            executed_at: None,
            expires_at: now + Duration::seconds(ttl_secs as i64),
            signal_id: None,
        }
    }

    pub fn with_volume(mut self, volume: Decimal) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn with_levels(mut self, stop_loss: Option<Decimal>, take_profit: Option<Decimal>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }

    pub fn with_ticket(mut self, ticket: i64) -> Self {
        self.ticket = Some(ticket);
        self
    }

    pub fn with_comment(mut self, comment: &str) -> Self {
        self.comment = Some(comment.to_string());
        self
    }

    pub fn with_signal(mut self, signal_id: Uuid) -> Self {
        self.signal_id = Some(signal_id);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Deliverable commands are unexpired and still PENDING; once SENT a
    /// command is never redelivered
    pub fn is_deliverable(&self, now: DateTime<Utc>) -> bool {
        self.status == CommandStatus::Pending && !self.is_expired(now)
    }
}
