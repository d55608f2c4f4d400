//! The per-cycle driver: one master signal, then the guard chain per account.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::domain::{Candle, MasterSignal, Quote};
use crate::error::Result;
use crate::gateway::{BrokerGateway, SessionManager};
use crate::persistence::Store;
use crate::strategy::Strategy;

use super::guard::{ExecutionGuard, GuardOutcome, SkipReason};

const CANDLE_TIMEFRAME: &str = "M5";
const CANDLE_FETCH_COUNT: usize = 50;

/// What one cycle did, for logs and tests
#[derive(Debug, Default)]
pub struct CycleReport {
    /// True when a previous cycle was still running and this one bailed out
    pub overlapped: bool,
    pub signal: Option<MasterSignal>,
    pub attempted: usize,
    pub placed: usize,
    pub enqueued: usize,
    pub errors: usize,
    pub skips: Vec<(String, SkipReason)>,
}

pub struct Orchestrator {
    store: Arc<dyn Store>,
    sessions: Arc<SessionManager>,
    gateway: Arc<dyn BrokerGateway>,
    strategy: Arc<dyn Strategy>,
    guard: Arc<ExecutionGuard>,
    config: Arc<AppConfig>,
    cycle_running: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        sessions: Arc<SessionManager>,
        gateway: Arc<dyn BrokerGateway>,
        strategy: Arc<dyn Strategy>,
        guard: Arc<ExecutionGuard>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            store,
            sessions,
            gateway,
            strategy,
            guard,
            config,
            cycle_running: AtomicBool::new(false),
        }
    }

    /// Run one trading cycle. A cycle that would overlap a still-running one
    /// is dropped, not queued.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        if self
            .cycle_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Previous trading cycle still running; skipping this tick");
            return Ok(CycleReport {
                overlapped: true,
                ..CycleReport::default()
            });
        }

        let result = self.cycle_inner().await;
        self.cycle_running.store(false, Ordering::SeqCst);
        result
    }

    async fn cycle_inner(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        if !self.config.trading.auto_trading {
            debug!("Auto trading disabled; cycle is a no-op");
            return Ok(report);
        }

        let Some(master) = self.master_signal().await? else {
            debug!("No master signal this cycle");
            return Ok(report);
        };
        info!(
            "Master signal: {} {} @ {} (confidence {})",
            master.action.as_str(),
            master.symbol,
            master.entry,
            master.confidence
        );
        report.signal = Some(master.clone());

        for account in self.config.accounts.iter().filter(|a| a.is_complete()) {
            report.attempted += 1;
            let signal = master.for_symbol(&account.symbol);
            match self.guard.execute(account, &signal).await {
                Ok(GuardOutcome::Placed(trade)) => {
                    report.placed += 1;
                    debug!("Cycle placed trade {} for {}", trade.id, account.id);
                }
                Ok(GuardOutcome::Enqueued(command)) => {
                    report.enqueued += 1;
                    debug!("Cycle queued command {} for {}", command.id, account.id);
                }
                Ok(GuardOutcome::Skipped(reason)) => {
                    debug!("Cycle skipped {}: {}", account.id, reason.as_str());
                    report.skips.push((account.id.clone(), reason));
                }
                // One broken account must not starve the rest
                Err(e) => {
                    error!("Guard chain failed for {}: {}", account.id, e);
                    report.errors += 1;
                }
            }
        }

        info!(
            "Cycle done: {} account(s), {} placed, {} enqueued, {} skipped",
            report.attempted,
            report.placed,
            report.enqueued,
            report.skips.len()
        );
        Ok(report)
    }

    /// Compute the cycle's single decision. The strategy runs exactly once;
    /// every account then sees the same action, levels and confidence.
    async fn master_signal(&self) -> Result<Option<MasterSignal>> {
        let Some((symbol, candles, quote)) = self.market_data().await? else {
            return Ok(None);
        };
        if candles.len() < self.config.agent.min_candles {
            debug!(
                "Only {} candle(s) available, need {}",
                candles.len(),
                self.config.agent.min_candles
            );
            return Ok(None);
        }

        let setup = self.strategy.analyze(&candles, quote.mid(), quote.spread());
        Ok(setup.map(|setup| MasterSignal::from_setup(&setup, &symbol)))
    }

    /// Market data for the master decision. In bridge mode it comes from the
    /// freshest online agent session; in direct mode from the gateway under
    /// the first configured account.
    async fn market_data(&self) -> Result<Option<(String, Vec<Candle>, Quote)>> {
        match self.config.trading.mode {
            crate::config::ExecutionMode::Bridge => {
                let sessions = self.store.list_sessions().await?;
                let now = chrono::Utc::now();
                let window = self.config.agent.online_window_secs;
                let best = sessions
                    .into_iter()
                    .filter(|s| s.is_online(window, now) && s.quote.is_some())
                    .max_by_key(|s| s.heartbeat);
                let Some(session) = best else {
                    return Ok(None);
                };
                let symbol = self
                    .config
                    .accounts
                    .iter()
                    .find(|a| a.id == session.account_id)
                    .map(|a| a.symbol.clone())
                    .or_else(|| self.config.accounts.first().map(|a| a.symbol.clone()));
                let Some(symbol) = symbol else {
                    return Ok(None);
                };
                let Some(quote) = session.quote else {
                    return Ok(None);
                };
                Ok(Some((symbol, session.candles, quote)))
            }
            crate::config::ExecutionMode::Direct => {
                let Some(account) = self.config.accounts.iter().find(|a| a.is_complete()) else {
                    return Ok(None);
                };
                self.sessions.bind(account).await;

                let gateway = Arc::clone(&self.gateway);
                let symbol = account.symbol.clone();
                let candles = self
                    .sessions
                    .with_token(account, move |token| {
                        let gateway = Arc::clone(&gateway);
                        let symbol = symbol.clone();
                        async move {
                            gateway
                                .candles(&token, &symbol, CANDLE_TIMEFRAME, CANDLE_FETCH_COUNT)
                                .await
                        }
                    })
                    .await?;

                let gateway = Arc::clone(&self.gateway);
                let symbol = account.symbol.clone();
                let quote = self
                    .sessions
                    .with_token(account, move |token| {
                        let gateway = Arc::clone(&gateway);
                        let symbol = symbol.clone();
                        async move { gateway.quote(&token, &symbol).await }
                    })
                    .await?;

                Ok(Some((account.symbol.clone(), candles, quote)))
            }
        }
    }
}
