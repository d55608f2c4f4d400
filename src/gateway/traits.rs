//! Broker gateway abstraction (direct-execution mode).

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::AccountCredentials;
use crate::domain::{Candle, Position, Quote, TradeDirection};
use crate::error::Result;

/// A market order to place through the gateway
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub symbol: String,
    pub direction: TradeDirection,
    pub volume: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub comment: Option<String>,
}

/// Gateway response to an order placement
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementResult {
    pub ticket: Option<i64>,
    pub price: Option<Decimal>,
    /// Whether stop-loss/take-profit were applied atomically with the fill;
    /// when false the caller follows up with one corrective modify
    #[serde(default)]
    pub levels_applied: bool,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Authenticate with stored credentials; returns a bearer token
    async fn connect(&self, credentials: &AccountCredentials) -> Result<String>;

    /// Lightweight status call used to revalidate a cached token
    async fn validate(&self, token: &str) -> Result<bool>;

    async fn quote(&self, token: &str, symbol: &str) -> Result<Quote>;

    async fn candles(
        &self,
        token: &str,
        symbol: &str,
        timeframe: &str,
        count: usize,
    ) -> Result<Vec<Candle>>;

    async fn open_orders(&self, token: &str) -> Result<Vec<Position>>;

    async fn market_open(&self, token: &str, symbol: &str) -> Result<bool>;

    async fn place_order(&self, token: &str, order: &OrderRequest) -> Result<PlacementResult>;

    async fn modify_order(
        &self,
        token: &str,
        ticket: i64,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<()>;

    async fn close_order(&self, token: &str, ticket: i64) -> Result<PlacementResult>;
}
