//! Per-account execution guard chain.
//!
//! Every placement walks the same ordered checks: cooldown fast path, then
//! under the execution lock the master switch, confidence threshold, session
//! state, position cap and daily stop. The lock is acquired before any
//! externally visible side effect and released on every exit path; a check
//! that fails is a skip for this cycle, never an error.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{AccountCredentials, AppConfig, ExecutionMode};
use crate::coordination::ExecutionLock;
use crate::domain::{Command, CommandKind, CommandOrigin, MasterSignal, Trade, TradeDirection};
use crate::error::Result;
use crate::gateway::{BrokerGateway, OrderRequest, SessionManager};
use crate::persistence::Store;
use crate::strategy::MoneyManager;

const LEVEL_SETTLE_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AutoTradingOff,
    BelowThreshold,
    Cooldown,
    LockBusy,
    SessionOffline,
    CommandInFlight,
    PositionCap,
    DailyStop,
    MarketClosed,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::AutoTradingOff => "auto trading off",
            SkipReason::BelowThreshold => "below confidence threshold",
            SkipReason::Cooldown => "cooldown active",
            SkipReason::LockBusy => "execution lock busy",
            SkipReason::SessionOffline => "agent session offline",
            SkipReason::CommandInFlight => "open command still in flight",
            SkipReason::PositionCap => "position cap reached",
            SkipReason::DailyStop => "daily stop active",
            SkipReason::MarketClosed => "market closed",
        }
    }
}

#[derive(Debug)]
pub enum GuardOutcome {
    /// Direct mode: order placed at the gateway, trade recorded
    Placed(Trade),
    /// Bridge mode: command queued for the next agent poll
    Enqueued(Command),
    Skipped(SkipReason),
}

pub struct ExecutionGuard {
    store: Arc<dyn Store>,
    lock: Arc<ExecutionLock>,
    sessions: Arc<SessionManager>,
    gateway: Arc<dyn BrokerGateway>,
    money: Arc<dyn MoneyManager>,
    config: Arc<AppConfig>,
    /// Advisory in-process cooldown; the execution lock is the cross-instance
    /// guarantee
    cooldowns: DashMap<String, DateTime<Utc>>,
}

impl ExecutionGuard {
    pub fn new(
        store: Arc<dyn Store>,
        lock: Arc<ExecutionLock>,
        sessions: Arc<SessionManager>,
        gateway: Arc<dyn BrokerGateway>,
        money: Arc<dyn MoneyManager>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            store,
            lock,
            sessions,
            gateway,
            money,
            config,
            cooldowns: DashMap::new(),
        }
    }

    /// Run the full chain for one account against the cycle's master signal.
    pub async fn execute(
        &self,
        account: &AccountCredentials,
        signal: &MasterSignal,
    ) -> Result<GuardOutcome> {
        // Advisory fast path only; the lock below is the actual guarantee
        if self.in_cooldown(&account.id) {
            return Ok(GuardOutcome::Skipped(SkipReason::Cooldown));
        }

        // Lock first; every check and side effect runs under the lease, and
        // every exit path releases it
        let Some(handle) = self.lock.acquire(&account.id).await? else {
            return Ok(GuardOutcome::Skipped(SkipReason::LockBusy));
        };
        let result = self.execute_locked(account, signal).await;
        self.lock.release(&handle).await;

        if let Ok(GuardOutcome::Placed(_) | GuardOutcome::Enqueued(_)) = &result {
            self.cooldowns.insert(account.id.clone(), Utc::now());
        }
        result
    }

    fn in_cooldown(&self, account_id: &str) -> bool {
        let window = Duration::seconds(self.config.trading.cooldown_secs as i64);
        self.cooldowns
            .get(account_id)
            .is_some_and(|last| Utc::now() - *last < window)
    }

    async fn execute_locked(
        &self,
        account: &AccountCredentials,
        signal: &MasterSignal,
    ) -> Result<GuardOutcome> {
        if !self.config.trading.auto_trading {
            return Ok(GuardOutcome::Skipped(SkipReason::AutoTradingOff));
        }
        if !signal.is_actionable(self.config.confidence_threshold()) {
            debug!(
                "Signal {}@{} below threshold {} for {}",
                signal.action.as_str(),
                signal.confidence,
                self.config.confidence_threshold(),
                account.id
            );
            return Ok(GuardOutcome::Skipped(SkipReason::BelowThreshold));
        }

        match self.config.trading.mode {
            ExecutionMode::Bridge => self.enqueue_bridge(account, signal).await,
            ExecutionMode::Direct => self.place_direct(account, signal).await,
        }
    }

    /// Bridge mode: the agent executes; we only queue. Offline sessions get
    /// nothing queued since it would expire before pickup.
    async fn enqueue_bridge(
        &self,
        account: &AccountCredentials,
        signal: &MasterSignal,
    ) -> Result<GuardOutcome> {
        let session = self.store.get_session(&account.id).await?;
        let Some(session) = session
            .filter(|s| s.is_online(self.config.agent.online_window_secs, Utc::now()))
        else {
            return Ok(GuardOutcome::Skipped(SkipReason::SessionOffline));
        };

        if session.positions.len() >= self.config.trading.max_open_positions {
            return Ok(GuardOutcome::Skipped(SkipReason::PositionCap));
        }

        // An opening command the agent has not resolved yet counts against
        // the cap; queuing another would stack entries
        let recent = self.store.recent_commands(&account.id, 20).await?;
        if recent
            .iter()
            .any(|c| c.kind.opens_position() && !c.status.is_terminal())
        {
            return Ok(GuardOutcome::Skipped(SkipReason::CommandInFlight));
        }

        let money = self.money.status(&account.id).await?;
        if money.daily_stop {
            return Ok(GuardOutcome::Skipped(SkipReason::DailyStop));
        }

        let kind = match signal.action.direction() {
            Some(TradeDirection::Buy) => CommandKind::Buy,
            Some(TradeDirection::Sell) => CommandKind::Sell,
            None => return Ok(GuardOutcome::Skipped(SkipReason::BelowThreshold)),
        };

        let command = Command::new(
            &account.id,
            kind,
            &signal.symbol,
            CommandOrigin::Auto,
            self.config.agent.command_ttl_secs,
        )
        .with_volume(money.lot_size)
        .with_levels(signal.stop_loss, signal.take_profit)
        .with_signal(signal.id)
        .with_comment(&format!(
            "master:{}@{}",
            signal.action.as_str(),
            signal.confidence
        ));

        self.store.insert_command(&command).await?;
        info!(
            "Queued {} command {} for {} ({}@{})",
            kind.as_str(),
            command.id,
            account.id,
            signal.action.as_str(),
            signal.confidence
        );
        Ok(GuardOutcome::Enqueued(command))
    }

    /// Direct mode: place at the gateway under this account's session. The
    /// binding is verified again immediately before the order call, and the
    /// position count is re-read from the broker rather than trusted from
    /// local state.
    async fn place_direct(
        &self,
        account: &AccountCredentials,
        signal: &MasterSignal,
    ) -> Result<GuardOutcome> {
        self.sessions.bind(account).await;

        let money = self.money.status(&account.id).await?;
        if money.daily_stop {
            return Ok(GuardOutcome::Skipped(SkipReason::DailyStop));
        }

        let open = self.store.open_trades(&account.id).await?;
        if open.len() >= self.config.trading.max_open_positions {
            return Ok(GuardOutcome::Skipped(SkipReason::PositionCap));
        }

        let symbol = signal.symbol.clone();
        let gateway = Arc::clone(&self.gateway);
        let market_open = self
            .sessions
            .with_token(account, move |token| {
                let gateway = Arc::clone(&gateway);
                let symbol = symbol.clone();
                async move { gateway.market_open(&token, &symbol).await }
            })
            .await?;
        if !market_open {
            return Ok(GuardOutcome::Skipped(SkipReason::MarketClosed));
        }

        // Broker-side cap re-check just before placement
        let gateway = Arc::clone(&self.gateway);
        let live = self
            .sessions
            .with_token(account, move |token| {
                let gateway = Arc::clone(&gateway);
                async move { gateway.open_orders(&token).await }
            })
            .await?;
        if live.len() >= self.config.trading.max_open_positions {
            return Ok(GuardOutcome::Skipped(SkipReason::PositionCap));
        }

        let direction = match signal.action.direction() {
            Some(direction) => direction,
            None => return Ok(GuardOutcome::Skipped(SkipReason::BelowThreshold)),
        };

        let order = OrderRequest {
            symbol: signal.symbol.clone(),
            direction,
            volume: money.lot_size,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            comment: Some(format!(
                "master:{}@{}",
                signal.action.as_str(),
                signal.confidence
            )),
        };

        // Last mismatch check, then a single non-retried placement; the
        // broker re-check above and reconciliation absorb timeout ambiguity
        self.sessions.verify_bound(&account.id).await?;
        let token = self.sessions.token(account).await?;
        let placed = self.gateway.place_order(&token, &order).await?;

        if !placed.levels_applied
            && (signal.stop_loss.is_some() || signal.take_profit.is_some())
        {
            self.apply_levels(&token, account, signal, placed.ticket).await;
        }

        let mut trade = Trade::open(&account.id, &signal.symbol, direction, money.lot_size)
            .with_levels(signal.stop_loss, signal.take_profit)
            .with_signal(Some(signal.id));
        if let Some(ticket) = placed.ticket {
            trade = trade.with_ticket(ticket);
        }
        if let Some(price) = placed.price {
            trade = trade.with_entry(price);
        }
        self.store.insert_trade(&trade).await?;

        info!(
            "Placed {} {} {} for {} (ticket {:?}, price {:?})",
            direction.as_str(),
            money.lot_size,
            signal.symbol,
            account.id,
            placed.ticket,
            placed.price
        );
        Ok(GuardOutcome::Placed(trade))
    }

    /// One corrective modify when the fill did not carry its levels. The
    /// ticket comes from the placement response, or failing that from the
    /// most recently opened order for the symbol after a short settle delay.
    async fn apply_levels(
        &self,
        token: &str,
        account: &AccountCredentials,
        signal: &MasterSignal,
        placement_ticket: Option<i64>,
    ) {
        let ticket = match placement_ticket {
            Some(ticket) => Some(ticket),
            None => {
                tokio::time::sleep(std::time::Duration::from_millis(LEVEL_SETTLE_MS)).await;
                match self.gateway.open_orders(token).await {
                    Ok(orders) => orders
                        .into_iter()
                        .filter(|p| p.symbol == signal.symbol)
                        .max_by_key(|p| p.open_time)
                        .map(|p| p.ticket),
                    Err(e) => {
                        warn!("Ticket lookup for corrective modify failed: {}", e);
                        None
                    }
                }
            }
        };

        let Some(ticket) = ticket else {
            warn!(
                "No ticket resolved for {}; stop-loss/take-profit left unset",
                account.id
            );
            return;
        };
        if let Err(e) = self
            .gateway
            .modify_order(token, ticket, signal.stop_loss, signal.take_profit)
            .await
        {
            warn!(
                "Corrective modify for ticket {} on {} failed: {}",
                ticket, account.id, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests_support::test_config;
    use crate::domain::{AccountSnapshot, AgentSession, CommandStatus, SignalAction, TradeSetup};
    use crate::gateway::MockBrokerGateway;
    use crate::persistence::MemoryStore;
    use crate::strategy::{FixedMoneyManager, MockMoneyManager, MoneyStatus};
    use crate::gateway::PlacementResult;
    use rust_decimal_macros::dec;

    fn account(id: &str) -> AccountCredentials {
        AccountCredentials {
            id: id.to_string(),
            login: format!("login-{id}"),
            password: "pw".into(),
            server: "Broker-Demo".into(),
            symbol: "XAUUSD".into(),
        }
    }

    fn signal(action: SignalAction, confidence: u8) -> MasterSignal {
        MasterSignal::from_setup(
            &TradeSetup {
                action,
                entry: dec!(2350.3),
                stop_loss: Some(dec!(2345)),
                take_profit: Some(dec!(2360)),
                confidence,
                reasons: vec![],
            },
            "XAUUSD",
        )
    }

    async fn online_session(store: &MemoryStore, account_id: &str) {
        store
            .upsert_session(&AgentSession {
                account_id: account_id.to_string(),
                heartbeat: Utc::now(),
                snapshot: AccountSnapshot {
                    balance: dec!(1000),
                    equity: dec!(1000),
                    free_margin: dec!(900),
                    leverage: 100,
                    currency: "USD".into(),
                },
                positions: vec![],
                quote: None,
                candles: vec![],
                agent_version: "1.0".into(),
                last_analysis_at: None,
            })
            .await
            .unwrap();
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        lock: Arc<ExecutionLock>,
        guard: ExecutionGuard,
    }

    fn fixture(config: AppConfig) -> Fixture {
        fixture_with(config, MockBrokerGateway::new(), None)
    }

    fn fixture_with(
        config: AppConfig,
        gateway: MockBrokerGateway,
        money: Option<Arc<dyn MoneyManager>>,
    ) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let lock = Arc::new(ExecutionLock::new(
            store.clone(),
            config.trading.lock_lease_secs,
        ));
        let gateway: Arc<dyn BrokerGateway> = Arc::new(gateway);
        let sessions = Arc::new(SessionManager::new(store.clone(), Arc::clone(&gateway)));
        let guard = ExecutionGuard::new(
            store.clone(),
            Arc::clone(&lock),
            sessions,
            gateway,
            money.unwrap_or_else(|| Arc::new(FixedMoneyManager::new(dec!(0.01)))),
            Arc::new(config),
        );
        Fixture { store, lock, guard }
    }

    #[tokio::test]
    async fn test_below_threshold_skipped() {
        let fx = fixture(test_config()); // threshold 70
        online_session(&fx.store, "ACC1").await;

        let outcome = fx
            .guard
            .execute(&account("ACC1"), &signal(SignalAction::Buy, 60))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            GuardOutcome::Skipped(SkipReason::BelowThreshold)
        ));
    }

    #[tokio::test]
    async fn test_hold_never_executes() {
        let fx = fixture(test_config());
        online_session(&fx.store, "ACC1").await;

        let outcome = fx
            .guard
            .execute(&account("ACC1"), &signal(SignalAction::Hold, 99))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            GuardOutcome::Skipped(SkipReason::BelowThreshold)
        ));
    }

    #[tokio::test]
    async fn test_auto_trading_off() {
        let mut config = test_config();
        config.trading.auto_trading = false;
        let fx = fixture(config);

        let outcome = fx
            .guard
            .execute(&account("ACC1"), &signal(SignalAction::Buy, 90))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            GuardOutcome::Skipped(SkipReason::AutoTradingOff)
        ));
    }

    #[tokio::test]
    async fn test_offline_session_skipped_in_bridge_mode() {
        let fx = fixture(test_config());
        // No session pushed at all
        let outcome = fx
            .guard
            .execute(&account("ACC1"), &signal(SignalAction::Buy, 90))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            GuardOutcome::Skipped(SkipReason::SessionOffline)
        ));
    }

    #[tokio::test]
    async fn test_bridge_enqueue_and_cooldown() {
        let fx = fixture(test_config());
        online_session(&fx.store, "ACC1").await;

        let outcome = fx
            .guard
            .execute(&account("ACC1"), &signal(SignalAction::Buy, 90))
            .await
            .unwrap();
        let GuardOutcome::Enqueued(command) = outcome else {
            panic!("expected enqueue");
        };
        assert_eq!(command.kind, CommandKind::Buy);
        assert_eq!(command.volume, Some(dec!(0.01)));
        assert!(command.signal_id.is_some());

        let stored = fx.store.get_command(command.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Pending);

        // Immediate second attempt sits in cooldown
        let outcome = fx
            .guard
            .execute(&account("ACC1"), &signal(SignalAction::Buy, 90))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            GuardOutcome::Skipped(SkipReason::Cooldown)
        ));
    }

    #[tokio::test]
    async fn test_unresolved_open_command_blocks_new_entry() {
        let mut config = test_config();
        config.trading.cooldown_secs = 0;
        let fx = fixture(config);
        online_session(&fx.store, "ACC1").await;

        let first = fx
            .guard
            .execute(&account("ACC1"), &signal(SignalAction::Buy, 90))
            .await
            .unwrap();
        assert!(matches!(first, GuardOutcome::Enqueued(_)));

        // Cooldown disabled: the in-flight command is what blocks
        let second = fx
            .guard
            .execute(&account("ACC1"), &signal(SignalAction::Buy, 90))
            .await
            .unwrap();
        assert!(matches!(
            second,
            GuardOutcome::Skipped(SkipReason::CommandInFlight)
        ));
    }

    #[tokio::test]
    async fn test_position_cap_in_bridge_mode() {
        let fx = fixture(test_config());
        online_session(&fx.store, "ACC1").await;
        // Overwrite with one open position (cap is 1)
        let mut session = fx.store.get_session("ACC1").await.unwrap().unwrap();
        session.positions = vec![crate::domain::Position {
            ticket: 1,
            symbol: "XAUUSD".into(),
            direction: TradeDirection::Buy,
            volume: dec!(0.01),
            open_price: dec!(2350),
            stop_loss: None,
            take_profit: None,
            profit: dec!(0),
            open_time: Utc::now(),
        }];
        fx.store.upsert_session(&session).await.unwrap();

        let outcome = fx
            .guard
            .execute(&account("ACC1"), &signal(SignalAction::Buy, 90))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            GuardOutcome::Skipped(SkipReason::PositionCap)
        ));
    }

    #[tokio::test]
    async fn test_lock_busy_skips_and_queues_nothing() {
        let fx = fixture(test_config());
        online_session(&fx.store, "ACC1").await;

        let held = fx.lock.acquire("ACC1").await.unwrap().unwrap();
        let outcome = fx
            .guard
            .execute(&account("ACC1"), &signal(SignalAction::Buy, 90))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            GuardOutcome::Skipped(SkipReason::LockBusy)
        ));
        assert!(fx
            .store
            .recent_commands("ACC1", 10)
            .await
            .unwrap()
            .is_empty());
        fx.lock.release(&held).await;
    }

    #[tokio::test]
    async fn test_lock_released_after_success() {
        let fx = fixture(test_config());
        online_session(&fx.store, "ACC1").await;

        let outcome = fx
            .guard
            .execute(&account("ACC1"), &signal(SignalAction::Sell, 90))
            .await
            .unwrap();
        assert!(matches!(outcome, GuardOutcome::Enqueued(_)));

        // Lock must be free again
        assert!(fx.lock.acquire("ACC1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_daily_stop_blocks_entry() {
        let mut money = MockMoneyManager::new();
        money.expect_status().returning(|_| {
            Ok(MoneyStatus {
                lot_size: dec!(0.01),
                level: 1,
                daily_stop: true,
            })
        });
        let fx = fixture_with(test_config(), MockBrokerGateway::new(), Some(Arc::new(money)));
        online_session(&fx.store, "ACC1").await;

        let outcome = fx
            .guard
            .execute(&account("ACC1"), &signal(SignalAction::Buy, 90))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            GuardOutcome::Skipped(SkipReason::DailyStop)
        ));
    }

    #[tokio::test]
    async fn test_direct_mode_places_and_applies_levels() {
        let mut config = test_config();
        config.trading.mode = ExecutionMode::Direct;

        let mut gateway = MockBrokerGateway::new();
        gateway
            .expect_connect()
            .times(1)
            .returning(|_| Ok("tok".to_string()));
        gateway.expect_market_open().returning(|_, _| Ok(true));
        gateway.expect_open_orders().returning(|_| Ok(vec![]));
        gateway.expect_place_order().times(1).returning(|_, _| {
            Ok(PlacementResult {
                ticket: Some(7001),
                price: Some(dec!(2350.4)),
                levels_applied: false,
            })
        });
        // Fill did not carry levels: exactly one corrective modify
        gateway
            .expect_modify_order()
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let fx = fixture_with(config, gateway, None);
        let outcome = fx
            .guard
            .execute(&account("ACC1"), &signal(SignalAction::Buy, 90))
            .await
            .unwrap();

        let GuardOutcome::Placed(trade) = outcome else {
            panic!("expected placement");
        };
        assert_eq!(trade.ticket, Some(7001));
        assert_eq!(trade.entry_price, Some(dec!(2350.4)));

        let open = fx.store.open_trades("ACC1").await.unwrap();
        assert_eq!(open.len(), 1);
    }

    #[tokio::test]
    async fn test_direct_mode_market_closed() {
        let mut config = test_config();
        config.trading.mode = ExecutionMode::Direct;

        let mut gateway = MockBrokerGateway::new();
        gateway.expect_connect().returning(|_| Ok("tok".to_string()));
        gateway.expect_market_open().returning(|_, _| Ok(false));

        let fx = fixture_with(config, gateway, None);
        let outcome = fx
            .guard
            .execute(&account("ACC1"), &signal(SignalAction::Buy, 90))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            GuardOutcome::Skipped(SkipReason::MarketClosed)
        ));
        assert!(fx.store.open_trades("ACC1").await.unwrap().is_empty());
    }
}
