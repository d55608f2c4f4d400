//! Execution-Agent protocol handler.
//!
//! One `sync` call per poll does everything: upserts the session cache,
//! applies execution results, reconciles broker positions against open
//! trades, optionally runs the strategy collaborator, and atomically claims
//! deliverable commands. Steps 2-4 are error-isolated per item; any
//! unhandled failure collapses to a `success:false` envelope so the agent
//! never loops on a malformed payload.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::domain::{
    AgentSession, Command, CommandKind, CommandOrigin, CommandStatus, Trade, TradeDirection,
};
use crate::error::{MtLinkError, Result};
use crate::persistence::Store;
use crate::strategy::{MoneyManager, Strategy};

use super::protocol::{
    CommandPayload, ExecutionResult, ManualCommandRequest, SyncRequest, SyncResponse,
};

pub struct ProtocolHandler {
    store: Arc<dyn Store>,
    strategy: Arc<dyn Strategy>,
    money: Arc<dyn MoneyManager>,
    config: Arc<AppConfig>,
}

impl ProtocolHandler {
    pub fn new(
        store: Arc<dyn Store>,
        strategy: Arc<dyn Strategy>,
        money: Arc<dyn MoneyManager>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            store,
            strategy,
            money,
            config,
        }
    }

    /// Handle one agent poll. Never returns an error: internal failures are
    /// reported in the envelope with an empty command list.
    pub async fn sync(&self, request: SyncRequest) -> SyncResponse {
        match self.sync_inner(&request).await {
            Ok(response) => response,
            Err(e) => {
                error!("Sync failed for {}: {}", request.account_id, e);
                SyncResponse::failure(e.to_string())
            }
        }
    }

    async fn sync_inner(&self, request: &SyncRequest) -> Result<SyncResponse> {
        // 1. Upsert the session cache; this poll is the heartbeat
        self.store
            .upsert_session(&AgentSession {
                account_id: request.account_id.clone(),
                heartbeat: Utc::now(),
                snapshot: request.account.clone(),
                positions: request.positions.clone(),
                quote: request.quote,
                candles: request.candles.clone(),
                agent_version: request.ea_version.clone(),
                last_analysis_at: None,
            })
            .await?;

        // 2. Apply execution results; each item independent, bad items are
        //    logged and skipped. Tickets opened here are remembered: the
        //    agent captured its position list before executing commands, so
        //    these fills cannot appear in it yet.
        let mut opened_now: HashSet<i64> = HashSet::new();
        for result in &request.execution_results {
            match self.apply_execution_result(&request.account_id, result).await {
                Ok(Some(ticket)) => {
                    opened_now.insert(ticket);
                }
                Ok(None) => {}
                Err(e) => warn!(
                    "Execution result {} for {} failed: {}; continuing",
                    result.command_id, request.account_id, e
                ),
            }
        }

        // 3. Reconcile open trades against the pushed position list
        if let Err(e) = self.reconcile_positions(request, &opened_now).await {
            warn!(
                "Position reconciliation for {} failed: {}; continuing",
                request.account_id, e
            );
        }

        // 4. Strategy analysis window
        let (analysis_run, signal) = self.maybe_analyze(request).await?;

        // 5. Claim deliverable commands: atomically PENDING -> SENT so a
        //    retried poll cannot redeliver
        let claimed = self
            .store
            .claim_deliverable_commands(&request.account_id)
            .await?;
        let payloads: Vec<CommandPayload> = claimed.iter().map(CommandPayload::from).collect();

        if !payloads.is_empty() {
            info!(
                "Delivering {} command(s) to {}",
                payloads.len(),
                request.account_id
            );
        }

        let next_analysis_in = self.next_analysis_in(&request.account_id).await?;
        Ok(SyncResponse::ok(payloads, analysis_run, signal, next_analysis_in))
    }

    /// Returns the broker ticket of a trade opened by this result, if any.
    async fn apply_execution_result(
        &self,
        account_id: &str,
        result: &ExecutionResult,
    ) -> Result<Option<i64>> {
        let Some(command) = self.store.get_command(result.command_id).await? else {
            warn!(
                "Agent reported result for unknown command {}; skipping",
                result.command_id
            );
            return Ok(None);
        };

        if command.account_id != account_id {
            warn!(
                "Command {} belongs to {}, result pushed by {}; skipping",
                command.id, command.account_id, account_id
            );
            return Ok(None);
        }

        if !result.success {
            let error = result.error.as_deref().unwrap_or("unknown agent error");
            if self.store.mark_command_failed(command.id, error).await? {
                info!("Command {} failed at terminal: {}", command.id, error);
            }
            return Ok(None);
        }

        // The guarded transition is the idempotence barrier. A replay of an
        // EXECUTED command still walks the trade path below, so that a poll
        // which made the transition but lost the trade write gets repaired;
        // the `trade_for_command` guard keeps that path single-shot.
        let transitioned = self
            .store
            .mark_command_executed(command.id, result.ticket, result.price)
            .await?;
        if !transitioned {
            let executed = self
                .store
                .get_command(command.id)
                .await?
                .is_some_and(|c| c.status == CommandStatus::Executed);
            if !executed {
                debug!(
                    "Ignoring result for command {} not in an executable state",
                    command.id
                );
                return Ok(None);
            }
            debug!("Replayed result for executed command {}", command.id);
        }

        match command.kind {
            CommandKind::Buy | CommandKind::Sell => {
                if self.store.trade_for_command(command.id).await?.is_some() {
                    return Ok(None);
                }
                let direction = if command.kind == CommandKind::Buy {
                    TradeDirection::Buy
                } else {
                    TradeDirection::Sell
                };
                let mut trade = Trade::open(
                    account_id,
                    &command.symbol,
                    direction,
                    command.volume.unwrap_or(self.config.trading.default_lot_size),
                )
                .with_levels(command.stop_loss, command.take_profit)
                .with_signal(command.signal_id)
                .with_command(command.id);
                if let Some(ticket) = result.ticket {
                    trade = trade.with_ticket(ticket);
                }
                if let Some(price) = result.price {
                    trade = trade.with_entry(price);
                }
                self.store.insert_trade(&trade).await?;
                info!(
                    "Opened trade {} for {} ({} {} @ {:?})",
                    trade.id, account_id, command.symbol, direction.as_str(), result.price
                );
                return Ok(trade.ticket);
            }
            CommandKind::Close => {
                let Some(ticket) = command.ticket.or(result.ticket) else {
                    warn!("Close command {} has no ticket; skipping", command.id);
                    return Ok(None);
                };
                if self
                    .store
                    .close_trade(account_id, ticket, result.price)
                    .await?
                {
                    info!("Closed trade ticket {} for {}", ticket, account_id);
                }
            }
            CommandKind::Modify => {}
        }

        Ok(None)
    }

    /// Open trades whose ticket is absent from the pushed position list are
    /// presumed broker-closed; present tickets get their profit refreshed.
    /// Tickets in `opened_now` were filled during this same poll and postdate
    /// the position list, so their absence from it means nothing.
    async fn reconcile_positions(
        &self,
        request: &SyncRequest,
        opened_now: &HashSet<i64>,
    ) -> Result<()> {
        let open = self.store.open_trades(&request.account_id).await?;
        if open.is_empty() {
            return Ok(());
        }

        let live: HashSet<i64> = request.positions.iter().map(|p| p.ticket).collect();

        for trade in open {
            let Some(ticket) = trade.ticket else {
                continue;
            };
            if opened_now.contains(&ticket) {
                continue;
            }
            if live.contains(&ticket) {
                if let Some(position) = request.positions.iter().find(|p| p.ticket == ticket) {
                    self.store
                        .update_trade_profit(&request.account_id, ticket, position.profit)
                        .await?;
                }
            } else {
                let exit_price = request
                    .closed_deals
                    .iter()
                    .find(|d| d.ticket == ticket)
                    .and_then(|d| d.close_price);
                if self
                    .store
                    .close_trade(&request.account_id, ticket, exit_price)
                    .await?
                {
                    info!(
                        "Trade ticket {} for {} no longer at broker; marked closed",
                        ticket, request.account_id
                    );
                }
            }
        }

        Ok(())
    }

    async fn maybe_analyze(&self, request: &SyncRequest) -> Result<(bool, Option<String>)> {
        if !self.config.trading.auto_trading {
            return Ok((false, None));
        }
        if request.candles.len() < self.config.agent.min_candles {
            return Ok((false, None));
        }
        let Some(quote) = request.quote else {
            return Ok((false, None));
        };

        let session = self.store.get_session(&request.account_id).await?;
        let elapsed = session
            .and_then(|s| s.last_analysis_at)
            .map(|at| (Utc::now() - at).num_seconds());
        if let Some(elapsed) = elapsed {
            if elapsed < self.config.agent.analysis_interval_secs as i64 {
                return Ok((false, None));
            }
        }

        let setup = self
            .strategy
            .analyze(&request.candles, quote.mid(), quote.spread());
        self.store
            .set_last_analysis(&request.account_id, Utc::now())
            .await?;

        let Some(setup) = setup else {
            return Ok((true, None));
        };
        let signal_label = format!("{}@{}", setup.action.as_str(), setup.confidence);

        let Some(direction) = setup.action.direction() else {
            return Ok((true, Some(signal_label)));
        };

        if request.positions.len() >= self.config.trading.max_open_positions {
            debug!(
                "{} at position cap ({}); signal {} not enqueued",
                request.account_id,
                self.config.trading.max_open_positions,
                signal_label
            );
            return Ok((true, Some(signal_label)));
        }

        let money = self.money.status(&request.account_id).await?;
        if money.daily_stop {
            info!(
                "Daily stop active for {}; signal {} not enqueued",
                request.account_id, signal_label
            );
            return Ok((true, Some(signal_label)));
        }

        let kind = if direction == TradeDirection::Buy {
            CommandKind::Buy
        } else {
            CommandKind::Sell
        };
        let command = Command::new(
            &request.account_id,
            kind,
            &request.symbol,
            CommandOrigin::Auto,
            self.config.agent.command_ttl_secs,
        )
        .with_volume(money.lot_size)
        .with_levels(setup.stop_loss, setup.take_profit)
        .with_comment(&format!("auto:{signal_label}"));

        self.store.insert_command(&command).await?;
        info!(
            "Enqueued {} command {} for {} ({})",
            kind.as_str(),
            command.id,
            request.account_id,
            signal_label
        );

        Ok((true, Some(signal_label)))
    }

    async fn next_analysis_in(&self, account_id: &str) -> Result<i64> {
        let interval = self.config.agent.analysis_interval_secs as i64;
        let session = self.store.get_session(account_id).await?;
        Ok(match session.and_then(|s| s.last_analysis_at) {
            Some(at) => (interval - (Utc::now() - at).num_seconds()).clamp(0, interval),
            None => 0,
        })
    }

    /// Operator-submitted command. Rejected when the account's agent session
    /// is offline, since nothing would pick it up before the TTL lapses.
    pub async fn submit_manual(&self, request: ManualCommandRequest) -> Result<Command> {
        let session = self
            .store
            .get_session(&request.account_id)
            .await?
            .ok_or_else(|| MtLinkError::SessionOffline(request.account_id.clone()))?;
        if !session.is_online(self.config.agent.online_window_secs, Utc::now()) {
            return Err(MtLinkError::SessionOffline(request.account_id.clone()));
        }

        if matches!(request.kind, CommandKind::Close | CommandKind::Modify)
            && request.ticket.is_none()
        {
            return Err(MtLinkError::Validation(format!(
                "{} command requires a ticket",
                request.kind.as_str()
            )));
        }

        let mut command = Command::new(
            &request.account_id,
            request.kind,
            &request.symbol,
            CommandOrigin::Manual,
            self.config.agent.command_ttl_secs,
        )
        .with_levels(request.stop_loss, request.take_profit);

        if let Some(volume) = request.volume {
            command = command.with_volume(volume);
        } else if request.kind.opens_position() {
            command = command.with_volume(self.config.trading.default_lot_size);
        }
        if let Some(ticket) = request.ticket {
            command = command.with_ticket(ticket);
        }
        if let Some(comment) = &request.comment {
            command = command.with_comment(comment);
        }

        self.store.insert_command(&command).await?;
        info!(
            "Manual {} command {} queued for {}",
            request.kind.as_str(),
            command.id,
            request.account_id
        );
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests_support::test_config;
    use crate::domain::{
        AccountSnapshot, Candle, CommandStatus, Position, Quote, SignalAction, TradeSetup,
    };
    use crate::persistence::MemoryStore;
    use crate::strategy::{FixedMoneyManager, HoldStrategy, MockStrategy};
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn snapshot() -> AccountSnapshot {
        AccountSnapshot {
            balance: dec!(1000),
            equity: dec!(1000),
            free_margin: dec!(900),
            leverage: 100,
            currency: "USD".into(),
        }
    }

    fn quote() -> Quote {
        Quote {
            bid: dec!(2350.0),
            ask: dec!(2350.3),
            time: Utc::now(),
        }
    }

    fn candles(count: usize) -> Vec<Candle> {
        (0..count)
            .map(|i| Candle {
                time: Utc::now() - Duration::minutes(5 * (count - i) as i64),
                open: dec!(2349),
                high: dec!(2351),
                low: dec!(2348),
                close: dec!(2350),
                volume: 100,
            })
            .collect()
    }

    fn request(account_id: &str) -> SyncRequest {
        SyncRequest {
            account_id: account_id.into(),
            symbol: "XAUUSD".into(),
            account: snapshot(),
            quote: Some(quote()),
            candles: vec![],
            positions: vec![],
            execution_results: vec![],
            closed_deals: vec![],
            ea_version: "1.2.0".into(),
        }
    }

    fn position(ticket: i64, profit: Decimal) -> Position {
        Position {
            ticket,
            symbol: "XAUUSD".into(),
            direction: TradeDirection::Buy,
            volume: dec!(0.01),
            open_price: dec!(2350),
            stop_loss: None,
            take_profit: None,
            profit,
            open_time: Utc::now(),
        }
    }

    fn handler_with(
        store: Arc<MemoryStore>,
        strategy: Arc<dyn Strategy>,
    ) -> ProtocolHandler {
        ProtocolHandler::new(
            store,
            strategy,
            Arc::new(FixedMoneyManager::new(dec!(0.01))),
            Arc::new(test_config()),
        )
    }

    #[tokio::test]
    async fn test_sync_upserts_session() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler_with(store.clone(), Arc::new(HoldStrategy));

        let response = handler.sync(request("ACC1")).await;
        assert!(response.success);

        let session = store.get_session("ACC1").await.unwrap().unwrap();
        assert!(session.is_online(30, Utc::now()));
        assert_eq!(session.agent_version, "1.2.0");
    }

    #[tokio::test]
    async fn test_unknown_result_does_not_fail_batch() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler_with(store.clone(), Arc::new(HoldStrategy));

        let known = Command::new("ACC1", CommandKind::Buy, "XAUUSD", CommandOrigin::Auto, 60);
        store.insert_command(&known).await.unwrap();
        store.claim_deliverable_commands("ACC1").await.unwrap();

        let mut req = request("ACC1");
        req.execution_results = vec![
            ExecutionResult {
                command_id: Uuid::new_v4(), // unknown
                success: true,
                ticket: Some(1),
                price: Some(dec!(2350)),
                error: None,
            },
            ExecutionResult {
                command_id: known.id,
                success: true,
                ticket: Some(2),
                price: Some(dec!(2350.2)),
                error: None,
            },
        ];

        let response = handler.sync(req).await;
        assert!(response.success);

        let stored = store.get_command(known.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Executed);
        assert_eq!(stored.result_ticket, Some(2));
    }

    #[tokio::test]
    async fn test_result_replay_creates_one_trade() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler_with(store.clone(), Arc::new(HoldStrategy));

        let command = Command::new("ACC1", CommandKind::Buy, "XAUUSD", CommandOrigin::Auto, 60)
            .with_volume(dec!(0.01));
        store.insert_command(&command).await.unwrap();
        store.claim_deliverable_commands("ACC1").await.unwrap();

        let result = ExecutionResult {
            command_id: command.id,
            success: true,
            ticket: Some(900),
            price: Some(dec!(2350.1)),
            error: None,
        };

        let mut req = request("ACC1");
        req.positions = vec![position(900, dec!(0))];
        req.execution_results = vec![result.clone()];
        assert!(handler.sync(req.clone()).await.success);

        // Replay the identical payload
        assert!(handler.sync(req).await.success);

        let trades = store.open_trades("ACC1").await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].ticket, Some(900));
        assert_eq!(trades[0].command_id, Some(command.id));
    }

    #[tokio::test]
    async fn test_fresh_fill_survives_stale_position_list() {
        // The agent snapshots its positions before executing commands, so a
        // fill reported in this poll is never in the pushed list; the trade
        // it opens must not be reconciled away in the same call
        let store = Arc::new(MemoryStore::new());
        let handler = handler_with(store.clone(), Arc::new(HoldStrategy));

        let command = Command::new("ACC1", CommandKind::Buy, "XAUUSD", CommandOrigin::Auto, 60)
            .with_volume(dec!(0.01));
        store.insert_command(&command).await.unwrap();
        store.claim_deliverable_commands("ACC1").await.unwrap();

        let mut req = request("ACC1"); // positions stay empty
        req.execution_results = vec![ExecutionResult {
            command_id: command.id,
            success: true,
            ticket: Some(9001),
            price: Some(dec!(2350.4)),
            error: None,
        }];
        assert!(handler.sync(req).await.success);

        let open = store.open_trades("ACC1").await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].ticket, Some(9001));
    }

    #[tokio::test]
    async fn test_replay_repairs_executed_command_without_trade() {
        // A previous poll transitioned the command to EXECUTED but the trade
        // write was lost; the agent replays the identical result
        let store = Arc::new(MemoryStore::new());
        let handler = handler_with(store.clone(), Arc::new(HoldStrategy));

        let command = Command::new("ACC1", CommandKind::Buy, "XAUUSD", CommandOrigin::Auto, 60)
            .with_volume(dec!(0.01));
        store.insert_command(&command).await.unwrap();
        store.claim_deliverable_commands("ACC1").await.unwrap();
        assert!(store
            .mark_command_executed(command.id, Some(910), Some(dec!(2350.2)))
            .await
            .unwrap());
        assert!(store.open_trades("ACC1").await.unwrap().is_empty());

        let mut req = request("ACC1");
        req.positions = vec![position(910, dec!(0))];
        req.execution_results = vec![ExecutionResult {
            command_id: command.id,
            success: true,
            ticket: Some(910),
            price: Some(dec!(2350.2)),
            error: None,
        }];
        assert!(handler.sync(req).await.success);

        let open = store.open_trades("ACC1").await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].command_id, Some(command.id));
        assert_eq!(open[0].ticket, Some(910));
    }

    #[tokio::test]
    async fn test_failed_result_marks_command_failed() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler_with(store.clone(), Arc::new(HoldStrategy));

        let command = Command::new("ACC1", CommandKind::Sell, "XAUUSD", CommandOrigin::Auto, 60);
        store.insert_command(&command).await.unwrap();
        store.claim_deliverable_commands("ACC1").await.unwrap();

        let mut req = request("ACC1");
        req.execution_results = vec![ExecutionResult {
            command_id: command.id,
            success: false,
            ticket: None,
            price: None,
            error: Some("not enough money".into()),
        }];
        assert!(handler.sync(req).await.success);

        let stored = store.get_command(command.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CommandStatus::Failed);
        assert_eq!(stored.result_error.as_deref(), Some("not enough money"));
        assert!(store.open_trades("ACC1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconciliation_closes_vanished_ticket_once() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler_with(store.clone(), Arc::new(HoldStrategy));

        let trade = Trade::open("ACC1", "XAUUSD", TradeDirection::Buy, dec!(0.01))
            .with_ticket(501)
            .with_entry(dec!(2350));
        store.insert_trade(&trade).await.unwrap();

        // Position list without ticket 501
        let response = handler.sync(request("ACC1")).await;
        assert!(response.success);
        assert!(store.open_trades("ACC1").await.unwrap().is_empty());

        // A second identical poll is a no-op, not a second close
        assert!(handler.sync(request("ACC1")).await.success);
    }

    #[tokio::test]
    async fn test_reconciliation_refreshes_profit() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler_with(store.clone(), Arc::new(HoldStrategy));

        let trade = Trade::open("ACC1", "XAUUSD", TradeDirection::Buy, dec!(0.01))
            .with_ticket(502);
        store.insert_trade(&trade).await.unwrap();

        let mut req = request("ACC1");
        req.positions = vec![position(502, dec!(12.5))];
        assert!(handler.sync(req).await.success);

        let open = store.open_trades("ACC1").await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].profit, dec!(12.5));
    }

    #[tokio::test]
    async fn test_analysis_enqueues_and_delivers_sent() {
        let store = Arc::new(MemoryStore::new());
        let mut strategy = MockStrategy::new();
        strategy.expect_analyze().returning(|_, _, _| {
            Some(TradeSetup {
                action: SignalAction::Buy,
                entry: dec!(2350.3),
                stop_loss: Some(dec!(2345)),
                take_profit: Some(dec!(2360)),
                confidence: 60,
                reasons: vec!["structure break".into()],
            })
        });
        let handler = handler_with(store.clone(), Arc::new(strategy));

        // 25 fresh candles, no prior analysis timestamp, no open positions
        let mut req = request("ACC1");
        req.candles = candles(25);

        let response = handler.sync(req).await;
        assert!(response.success);
        assert!(response.analysis_run);
        assert_eq!(response.signal.as_deref(), Some("BUY@60"));
        assert_eq!(response.command_count, 1);
        assert_eq!(response.commands[0].kind, CommandKind::Buy);
        assert_eq!(response.commands[0].volume, Some(dec!(0.01)));

        // Stored status flipped to SENT in the same call
        let stored = store
            .get_command(response.commands[0].id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, CommandStatus::Sent);
    }

    #[tokio::test]
    async fn test_analysis_respects_interval() {
        let store = Arc::new(MemoryStore::new());
        let mut strategy = MockStrategy::new();
        strategy
            .expect_analyze()
            .times(1)
            .returning(|_, _, _| None);
        let handler = handler_with(store.clone(), Arc::new(strategy));

        let mut req = request("ACC1");
        req.candles = candles(25);

        let first = handler.sync(req.clone()).await;
        assert!(first.analysis_run);

        // Immediately retried poll: interval not yet elapsed
        let second = handler.sync(req).await;
        assert!(!second.analysis_run);
        assert!(second.next_analysis_in > 0);
    }

    #[tokio::test]
    async fn test_position_cap_blocks_enqueue() {
        let store = Arc::new(MemoryStore::new());
        let mut strategy = MockStrategy::new();
        strategy.expect_analyze().returning(|_, _, _| {
            Some(TradeSetup {
                action: SignalAction::Sell,
                entry: dec!(2350),
                stop_loss: None,
                take_profit: None,
                confidence: 80,
                reasons: vec![],
            })
        });
        let handler = handler_with(store.clone(), Arc::new(strategy));

        let mut req = request("ACC1");
        req.candles = candles(25);
        req.positions = vec![position(1, dec!(0))]; // cap is 1

        let response = handler.sync(req).await;
        assert!(response.analysis_run);
        assert_eq!(response.command_count, 0);
    }

    #[tokio::test]
    async fn test_too_few_candles_skip_analysis() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler_with(store.clone(), Arc::new(HoldStrategy));

        let mut req = request("ACC1");
        req.candles = candles(5);
        let response = handler.sync(req).await;
        assert!(!response.analysis_run);
    }

    #[tokio::test]
    async fn test_manual_command_requires_online_session() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler_with(store.clone(), Arc::new(HoldStrategy));

        let manual = ManualCommandRequest {
            account_id: "ACC1".into(),
            kind: CommandKind::Buy,
            symbol: "XAUUSD".into(),
            volume: None,
            stop_loss: None,
            take_profit: None,
            ticket: None,
            comment: None,
        };

        // No session at all
        let err = handler.submit_manual(manual.clone()).await.unwrap_err();
        assert!(matches!(err, MtLinkError::SessionOffline(_)));

        // Online after a poll
        assert!(handler.sync(request("ACC1")).await.success);
        let command = handler.submit_manual(manual).await.unwrap();
        assert_eq!(command.origin, CommandOrigin::Manual);
        assert_eq!(command.volume, Some(dec!(0.01)));
    }

    #[tokio::test]
    async fn test_manual_close_requires_ticket() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler_with(store.clone(), Arc::new(HoldStrategy));
        assert!(handler.sync(request("ACC1")).await.success);

        let err = handler
            .submit_manual(ManualCommandRequest {
                account_id: "ACC1".into(),
                kind: CommandKind::Close,
                symbol: "XAUUSD".into(),
                volume: None,
                stop_loss: None,
                take_profit: None,
                ticket: None,
                comment: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MtLinkError::Validation(_)));
    }
}
