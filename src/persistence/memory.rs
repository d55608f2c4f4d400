//! In-memory store backend.
//!
//! Backs tests and dry runs with the same conditional-write semantics as the
//! Postgres backend: one mutex over the whole state stands in for the
//! database's atomicity, and command transitions go through the same state
//! machine checks.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::domain::{AgentSession, Command, CommandStatus, SessionToken, Trade, TradeStatus};
use crate::error::Result;

use super::Store;

#[derive(Debug, Clone)]
struct LockRow {
    lock_id: Uuid,
    expires_at: DateTime<Utc>,
    released: bool,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, AgentSession>,
    commands: HashMap<Uuid, Command>,
    locks: HashMap<String, LockRow>,
    trades: Vec<Trade>,
    tokens: HashMap<String, SessionToken>,
}

/// Store backend holding everything behind one process-local mutex
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_session(&self, session: &AgentSession) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let mut incoming = session.clone();
        if let Some(existing) = inner.sessions.get(&session.account_id) {
            incoming.last_analysis_at = existing.last_analysis_at;
        }
        inner.sessions.insert(session.account_id.clone(), incoming);
        Ok(())
    }

    async fn get_session(&self, account_id: &str) -> Result<Option<AgentSession>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.sessions.get(account_id).cloned())
    }

    async fn list_sessions(&self) -> Result<Vec<AgentSession>> {
        let inner = self.inner.lock().unwrap();
        let mut sessions: Vec<_> = inner.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        Ok(sessions)
    }

    async fn set_last_analysis(&self, account_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.sessions.get_mut(account_id) {
            session.last_analysis_at = Some(at);
        }
        Ok(())
    }

    async fn insert_command(&self, command: &Command) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.commands.insert(command.id, command.clone());
        Ok(())
    }

    async fn get_command(&self, id: Uuid) -> Result<Option<Command>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.commands.get(&id).cloned())
    }

    async fn recent_commands(&self, account_id: &str, limit: i64) -> Result<Vec<Command>> {
        let inner = self.inner.lock().unwrap();
        let mut commands: Vec<_> = inner
            .commands
            .values()
            .filter(|c| c.account_id == account_id)
            .cloned()
            .collect();
        commands.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        commands.truncate(limit.max(0) as usize);
        Ok(commands)
    }

    async fn claim_deliverable_commands(&self, account_id: &str) -> Result<Vec<Command>> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        let mut claimed = Vec::new();
        for command in inner.commands.values_mut() {
            if command.account_id == account_id && command.is_deliverable(now) {
                command.status = CommandStatus::Sent;
                command.sent_at = Some(now);
                claimed.push(command.clone());
            }
        }
        claimed.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(claimed)
    }

    async fn mark_command_executed(
        &self,
        id: Uuid,
        ticket: Option<i64>,
        price: Option<Decimal>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(command) = inner.commands.get_mut(&id) else {
            return Ok(false);
        };
        if !command.status.can_transition_to(CommandStatus::Executed) {
            return Ok(false);
        }
        command.status = CommandStatus::Executed;
        command.result_ticket = ticket;
        command.result_price = price;
        command.executed_at = Some(Utc::now());
        Ok(true)
    }

    async fn mark_command_failed(&self, id: Uuid, error: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(command) = inner.commands.get_mut(&id) else {
            return Ok(false);
        };
        if !command.status.can_transition_to(CommandStatus::Failed) {
            return Ok(false);
        }
        command.status = CommandStatus::Failed;
        command.result_error = Some(error.to_string());
        Ok(true)
    }

    async fn expire_overdue_commands(&self) -> Result<u64> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        let mut expired = 0u64;
        for command in inner.commands.values_mut() {
            if command.is_expired(now) && command.status.can_transition_to(CommandStatus::Expired)
            {
                command.status = CommandStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn try_insert_lock(
        &self,
        account_id: &str,
        lock_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.locks.contains_key(account_id) {
            return Ok(false);
        }
        inner.locks.insert(
            account_id.to_string(),
            LockRow {
                lock_id,
                expires_at,
                released: false,
            },
        );
        Ok(true)
    }

    async fn try_takeover_lock(
        &self,
        account_id: &str,
        lock_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        let Some(row) = inner.locks.get_mut(account_id) else {
            return Ok(false);
        };
        if !row.released && row.expires_at > now {
            return Ok(false);
        }
        row.lock_id = lock_id;
        row.expires_at = expires_at;
        row.released = false;
        Ok(true)
    }

    async fn release_lock(&self, account_id: &str, lock_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(row) = inner.locks.get_mut(account_id) {
            if row.lock_id == lock_id {
                row.released = true;
            }
        }
        Ok(())
    }

    async fn reap_expired_locks(&self, grace: Duration) -> Result<u64> {
        let cutoff = Utc::now() - grace;
        let mut inner = self.inner.lock().unwrap();
        let before = inner.locks.len();
        inner.locks.retain(|_, row| row.expires_at >= cutoff);
        Ok((before - inner.locks.len()) as u64)
    }

    async fn insert_trade(&self, trade: &Trade) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.trades.push(trade.clone());
        Ok(())
    }

    async fn open_trades(&self, account_id: &str) -> Result<Vec<Trade>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .trades
            .iter()
            .filter(|t| t.account_id == account_id && t.is_open())
            .cloned()
            .collect())
    }

    async fn trade_for_command(&self, command_id: Uuid) -> Result<Option<Trade>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .trades
            .iter()
            .find(|t| t.command_id == Some(command_id))
            .cloned())
    }

    async fn close_trade(
        &self,
        account_id: &str,
        ticket: i64,
        exit_price: Option<Decimal>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(trade) = inner.trades.iter_mut().find(|t| {
            t.account_id == account_id && t.ticket == Some(ticket) && t.is_open()
        }) else {
            return Ok(false);
        };
        trade.status = TradeStatus::Closed;
        trade.exit_price = exit_price;
        trade.closed_at = Some(Utc::now());
        Ok(true)
    }

    async fn update_trade_profit(
        &self,
        account_id: &str,
        ticket: i64,
        profit: Decimal,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(trade) = inner.trades.iter_mut().find(|t| {
            t.account_id == account_id && t.ticket == Some(ticket) && t.is_open()
        }) {
            trade.profit = profit;
        }
        Ok(())
    }

    async fn save_token(&self, token: &SessionToken) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.tokens.insert(token.account_id.clone(), token.clone());
        Ok(())
    }

    async fn load_token(&self, account_id: &str) -> Result<Option<SessionToken>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.tokens.get(account_id).cloned())
    }

    async fn delete_token(&self, account_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.tokens.remove(account_id);
        Ok(())
    }
}
