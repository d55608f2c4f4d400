//! Shared persistent store.
//!
//! Every cross-instance invariant goes through this seam: the lease rows
//! behind the execution lock, the command queue with its status machine, the
//! agent session cache, session tokens and trades. The Postgres backend is
//! the production store; the in-memory backend backs tests and dry runs.
//!
//! Mutations are either idempotent (upsert by account id), scoped to one
//! command id, or guarded conditional writes whose success is reported via
//! the returned bool / row count. Illegal command transitions are rejected
//! here, not in callers.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::domain::{AgentSession, Command, SessionToken, Trade};
use crate::error::Result;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

#[async_trait]
pub trait Store: Send + Sync {
    // ==================== Agent sessions ====================

    /// Upsert the latest agent-pushed state. `last_analysis_at` is owned by
    /// the analysis bookkeeping and survives the upsert unchanged.
    async fn upsert_session(&self, session: &AgentSession) -> Result<()>;

    async fn get_session(&self, account_id: &str) -> Result<Option<AgentSession>>;

    async fn list_sessions(&self) -> Result<Vec<AgentSession>>;

    async fn set_last_analysis(&self, account_id: &str, at: DateTime<Utc>) -> Result<()>;

    // ==================== Command queue ====================

    async fn insert_command(&self, command: &Command) -> Result<()>;

    async fn get_command(&self, id: Uuid) -> Result<Option<Command>>;

    async fn recent_commands(&self, account_id: &str, limit: i64) -> Result<Vec<Command>>;

    /// Atomically select every unexpired PENDING command for the account,
    /// mark them SENT and return them oldest first. A command claimed by one
    /// poll is never handed to another, even under concurrent polls.
    async fn claim_deliverable_commands(&self, account_id: &str) -> Result<Vec<Command>>;

    /// PENDING/SENT -> EXECUTED with the reported ticket/price. Returns
    /// false when the command was already terminal, so replayed execution
    /// results stay idempotent.
    async fn mark_command_executed(
        &self,
        id: Uuid,
        ticket: Option<i64>,
        price: Option<Decimal>,
    ) -> Result<bool>;

    /// SENT -> FAILED with the agent's error text. Returns false when the
    /// command was not in SENT.
    async fn mark_command_failed(&self, id: Uuid, error: &str) -> Result<bool>;

    /// PENDING/SENT past their expiry -> EXPIRED. Returns how many flipped.
    async fn expire_overdue_commands(&self) -> Result<u64>;

    // ==================== Execution lock leases ====================

    /// Phase one of acquisition: atomic create-if-absent. True iff no row
    /// existed for the account.
    async fn try_insert_lock(
        &self,
        account_id: &str,
        lock_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Phase two: conditional replace that only succeeds when the existing
    /// row is released or its lease has lapsed. True iff the lock changed
    /// hands.
    async fn try_takeover_lock(
        &self,
        account_id: &str,
        lock_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Set released=true for the exact (account, lock id) pair. A stale or
    /// mismatched release is a silent no-op.
    async fn release_lock(&self, account_id: &str, lock_id: Uuid) -> Result<()>;

    /// Delete lock rows whose lease lapsed more than `grace` ago.
    async fn reap_expired_locks(&self, grace: Duration) -> Result<u64>;

    // ==================== Trades ====================

    async fn insert_trade(&self, trade: &Trade) -> Result<()>;

    async fn open_trades(&self, account_id: &str) -> Result<Vec<Trade>>;

    /// Trade created for a given bridge command, if any. Guards result
    /// replay against duplicate trade creation.
    async fn trade_for_command(&self, command_id: Uuid) -> Result<Option<Trade>>;

    /// OPEN -> CLOSED for the trade holding this broker ticket. Returns
    /// false when no open trade matched, so reconciliation closes a trade
    /// exactly once.
    async fn close_trade(
        &self,
        account_id: &str,
        ticket: i64,
        exit_price: Option<Decimal>,
    ) -> Result<bool>;

    async fn update_trade_profit(&self, account_id: &str, ticket: i64, profit: Decimal)
        -> Result<()>;

    // ==================== Session tokens ====================

    async fn save_token(&self, token: &SessionToken) -> Result<()>;

    async fn load_token(&self, account_id: &str) -> Result<Option<SessionToken>>;

    async fn delete_token(&self, account_id: &str) -> Result<()>;
}
