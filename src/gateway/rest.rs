//! REST implementation of the broker gateway.
//!
//! Connection calls use a shorter timeout than data calls so a hung broker
//! endpoint cannot keep a lock lease occupied. Transient failures are
//! retried here with bounded exponential backoff and never reach the
//! orchestrator; a 401 maps to `TokenInvalid` so the session manager can run
//! its reconnect-once path.

use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{AccountCredentials, GatewayConfig};
use crate::domain::{Candle, Position, Quote};
use crate::error::{MtLinkError, Result};

use super::traits::{BrokerGateway, OrderRequest, PlacementResult};

pub struct RestGateway {
    base_url: String,
    /// Short-timeout client for connect/status
    connect_client: reqwest::Client,
    /// Longer-timeout client for data and order calls
    data_client: reqwest::Client,
    max_retries: u8,
}

#[derive(Deserialize)]
struct ConnectResponse {
    token: String,
}

#[derive(Deserialize)]
struct MarketStateResponse {
    open: bool,
}

impl RestGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let connect_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()?;
        let data_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            connect_client,
            data_client,
            max_retries: config.max_retries,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Bounded exponential backoff with jitter, transient failures only
    async fn with_retry<T, F, Fut>(&self, what: &str, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u8;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let backoff_ms =
                        200u64 * (1 << attempt) + rand::thread_rng().gen_range(0..100);
                    warn!(
                        "{} failed (attempt {}): {}; retrying in {}ms",
                        what,
                        attempt + 1,
                        e,
                        backoff_ms
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED => Err(MtLinkError::TokenInvalid(
                "gateway rejected bearer token".into(),
            )),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(MtLinkError::Gateway(format!("{status}: {body}")))
            }
        }
    }
}

#[async_trait]
impl BrokerGateway for RestGateway {
    async fn connect(&self, credentials: &AccountCredentials) -> Result<String> {
        let body = serde_json::json!({
            "login": credentials.login,
            "password": credentials.password,
            "server": credentials.server,
        });

        let response = self
            .with_retry("connect", || async {
                let response = self
                    .connect_client
                    .post(self.url("/connect"))
                    .json(&body)
                    .send()
                    .await?;
                Self::check(response).await
            })
            .await?;

        let connect: ConnectResponse = response.json().await?;
        debug!("Connected gateway session for account {}", credentials.id);
        Ok(connect.token)
    }

    async fn validate(&self, token: &str) -> Result<bool> {
        let response = self
            .connect_client
            .get(self.url("/status"))
            .bearer_auth(token)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::UNAUTHORIZED => Ok(false),
            status => Err(MtLinkError::Gateway(format!("status check failed: {status}"))),
        }
    }

    async fn quote(&self, token: &str, symbol: &str) -> Result<Quote> {
        let response = self
            .with_retry("quote", || async {
                let response = self
                    .data_client
                    .get(self.url("/quote"))
                    .query(&[("symbol", symbol)])
                    .bearer_auth(token)
                    .send()
                    .await?;
                Self::check(response).await
            })
            .await?;

        Ok(response.json().await?)
    }

    async fn candles(
        &self,
        token: &str,
        symbol: &str,
        timeframe: &str,
        count: usize,
    ) -> Result<Vec<Candle>> {
        let response = self
            .with_retry("candles", || async {
                let response = self
                    .data_client
                    .get(self.url("/candles"))
                    .query(&[
                        ("symbol", symbol),
                        ("timeframe", timeframe),
                        ("count", &count.to_string()),
                    ])
                    .bearer_auth(token)
                    .send()
                    .await?;
                Self::check(response).await
            })
            .await?;

        Ok(response.json().await?)
    }

    async fn open_orders(&self, token: &str) -> Result<Vec<Position>> {
        let response = self
            .with_retry("open_orders", || async {
                let response = self
                    .data_client
                    .get(self.url("/orders"))
                    .bearer_auth(token)
                    .send()
                    .await?;
                Self::check(response).await
            })
            .await?;

        Ok(response.json().await?)
    }

    async fn market_open(&self, token: &str, symbol: &str) -> Result<bool> {
        let response = self
            .with_retry("market_open", || async {
                let response = self
                    .data_client
                    .get(self.url("/market"))
                    .query(&[("symbol", symbol)])
                    .bearer_auth(token)
                    .send()
                    .await?;
                Self::check(response).await
            })
            .await?;

        let state: MarketStateResponse = response.json().await?;
        Ok(state.open)
    }

    async fn place_order(&self, token: &str, order: &OrderRequest) -> Result<PlacementResult> {
        // Order placement is deliberately not retried: a timeout may have
        // filled, and the position-count re-check plus reconciliation handle
        // the ambiguity.
        let response = self
            .data_client
            .post(self.url("/orders"))
            .bearer_auth(token)
            .json(order)
            .send()
            .await?;
        let response = Self::check(response).await?;

        Ok(response.json().await?)
    }

    async fn modify_order(
        &self,
        token: &str,
        ticket: i64,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<()> {
        let body = serde_json::json!({
            "stopLoss": stop_loss,
            "takeProfit": take_profit,
        });

        let response = self
            .data_client
            .patch(self.url(&format!("/orders/{ticket}")))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;

        Ok(())
    }

    async fn close_order(&self, token: &str, ticket: i64) -> Result<PlacementResult> {
        let response = self
            .data_client
            .delete(self.url(&format!("/orders/{ticket}")))
            .bearer_auth(token)
            .send()
            .await?;
        let response = Self::check(response).await?;

        Ok(response.json().await?)
    }
}
