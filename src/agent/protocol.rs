//! Wire types for the Execution-Agent poll protocol.
//!
//! The agent's host cannot accept inbound connections, so everything rides on
//! its ~5s poll: it pushes terminal state and execution results, and pulls
//! whatever commands are queued. TTL expiry stands in for delivery
//! acknowledgement.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{AccountSnapshot, Candle, Command, CommandKind, Position, Quote};

/// One poll's push payload from the agent
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub account_id: String,
    pub symbol: String,
    pub account: AccountSnapshot,
    #[serde(default)]
    pub quote: Option<Quote>,
    #[serde(default)]
    pub candles: Vec<Candle>,
    #[serde(default)]
    pub positions: Vec<Position>,
    #[serde(default)]
    pub execution_results: Vec<ExecutionResult>,
    #[serde(default)]
    pub closed_deals: Vec<ClosedDeal>,
    #[serde(default)]
    pub ea_version: String,
}

/// Outcome of a previously delivered command, reported by the agent
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub command_id: Uuid,
    pub success: bool,
    #[serde(default)]
    pub ticket: Option<i64>,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Broker-side deal closure reported by the agent, used to enrich
/// reconciliation with exit prices
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedDeal {
    pub ticket: i64,
    #[serde(default)]
    pub close_price: Option<Decimal>,
    #[serde(default)]
    pub profit: Option<Decimal>,
    #[serde(default)]
    pub close_time: Option<DateTime<Utc>>,
}

/// A queued command as delivered to the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPayload {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: CommandKind,
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl From<&Command> for CommandPayload {
    fn from(command: &Command) -> Self {
        Self {
            id: command.id,
            kind: command.kind,
            symbol: command.symbol.clone(),
            volume: command.volume,
            stop_loss: command.stop_loss,
            take_profit: command.take_profit,
            ticket: command.ticket,
            comment: command.comment.clone(),
        }
    }
}

/// Poll response: always a structured envelope, never a raised fault
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub success: bool,
    pub commands: Vec<CommandPayload>,
    pub command_count: usize,
    pub analysis_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    pub next_analysis_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncResponse {
    pub fn ok(
        commands: Vec<CommandPayload>,
        analysis_run: bool,
        signal: Option<String>,
        next_analysis_in: i64,
    ) -> Self {
        Self {
            success: true,
            command_count: commands.len(),
            commands,
            analysis_run,
            signal,
            next_analysis_in,
            error: None,
        }
    }

    /// The agent must never loop on a malformed payload: any internal error
    /// collapses to this envelope with an empty command list
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            commands: vec![],
            command_count: 0,
            analysis_run: false,
            signal: None,
            next_analysis_in: 0,
            error: Some(error.into()),
        }
    }
}

/// Operator-submitted command (manual origin)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualCommandRequest {
    pub account_id: String,
    pub kind: CommandKind,
    pub symbol: String,
    #[serde(default)]
    pub volume: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub ticket: Option<i64>,
    #[serde(default)]
    pub comment: Option<String>,
}
