//! PostgreSQL store backend.
//!
//! All conditional writes are single guarded statements so that concurrent
//! server instances coordinate purely through row counts: lock acquisition is
//! `INSERT .. ON CONFLICT DO NOTHING` plus a guarded `UPDATE`, command
//! delivery claims rows with `FOR UPDATE SKIP LOCKED`, and status transitions
//! carry their legality in the `WHERE` clause.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::domain::{
    AgentSession, Command, CommandKind, CommandOrigin, CommandStatus, SessionToken, Trade,
    TradeDirection, TradeStatus,
};
use crate::error::{MtLinkError, Result};

use super::Store;

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect a new store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Reuse an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn session_from_row(row: &sqlx::postgres::PgRow) -> Result<AgentSession> {
    Ok(AgentSession {
        account_id: row.get("account_id"),
        heartbeat: row.get("heartbeat"),
        snapshot: serde_json::from_value(row.get("snapshot"))?,
        positions: serde_json::from_value(row.get("positions"))?,
        quote: row
            .get::<Option<serde_json::Value>, _>("quote")
            .map(serde_json::from_value)
            .transpose()?,
        candles: serde_json::from_value(row.get("candles"))?,
        agent_version: row.get("agent_version"),
        last_analysis_at: row.get("last_analysis_at"),
    })
}

fn command_from_row(row: &sqlx::postgres::PgRow) -> Result<Command> {
    let kind: String = row.get("kind");
    let origin: String = row.get("origin");
    let status: String = row.get("status");
    Ok(Command {
        id: row.get("id"),
        account_id: row.get("account_id"),
        kind: CommandKind::try_from(kind.as_str()).map_err(MtLinkError::Internal)?,
        symbol: row.get("symbol"),
        volume: row.get("volume"),
        stop_loss: row.get("stop_loss"),
        take_profit: row.get("take_profit"),
        ticket: row.get("ticket"),
        comment: row.get("comment"),
        origin: match origin.as_str() {
            "MANUAL" => CommandOrigin::Manual,
            _ => CommandOrigin::Auto,
        },
        status: CommandStatus::try_from(status.as_str()).map_err(MtLinkError::Internal)?,
        result_ticket: row.get("result_ticket"),
        result_price: row.get("result_price"),
        result_error: row.get("result_error"),
        created_at: row.get("created_at"),
        sent_at: row.get("sent_at"),
        executed_at: row.get("executed_at"),
        expires_at: row.get("expires_at"),
        signal_id: row.get("signal_id"),
    })
}

fn trade_from_row(row: &sqlx::postgres::PgRow) -> Result<Trade> {
    let direction: String = row.get("direction");
    let status: String = row.get("status");
    Ok(Trade {
        id: row.get("id"),
        account_id: row.get("account_id"),
        ticket: row.get("ticket"),
        symbol: row.get("symbol"),
        direction: TradeDirection::try_from(direction.as_str()).map_err(MtLinkError::Internal)?,
        entry_price: row.get("entry_price"),
        exit_price: row.get("exit_price"),
        stop_loss: row.get("stop_loss"),
        take_profit: row.get("take_profit"),
        volume: row.get("volume"),
        status: TradeStatus::try_from(status.as_str()).map_err(MtLinkError::Internal)?,
        signal_id: row.get("signal_id"),
        command_id: row.get("command_id"),
        opened_at: row.get("opened_at"),
        closed_at: row.get("closed_at"),
        profit: row.get("profit"),
    })
}

const COMMAND_COLUMNS: &str = "id, account_id, kind, symbol, volume, stop_loss, take_profit, \
     ticket, comment, origin, status, result_ticket, result_price, result_error, \
     created_at, sent_at, executed_at, expires_at, signal_id";

const TRADE_COLUMNS: &str = "id, account_id, ticket, symbol, direction, entry_price, exit_price, \
     stop_loss, take_profit, volume, status, signal_id, command_id, opened_at, closed_at, profit";

#[async_trait]
impl Store for PostgresStore {
    // ==================== Agent sessions ====================

    async fn upsert_session(&self, session: &AgentSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agent_sessions (
                account_id, heartbeat, snapshot, positions, quote, candles, agent_version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (account_id) DO UPDATE SET
                heartbeat = EXCLUDED.heartbeat,
                snapshot = EXCLUDED.snapshot,
                positions = EXCLUDED.positions,
                quote = EXCLUDED.quote,
                candles = EXCLUDED.candles,
                agent_version = EXCLUDED.agent_version
            "#,
        )
        .bind(&session.account_id)
        .bind(session.heartbeat)
        .bind(serde_json::to_value(&session.snapshot)?)
        .bind(serde_json::to_value(&session.positions)?)
        .bind(
            session
                .quote
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(serde_json::to_value(&session.candles)?)
        .bind(&session.agent_version)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_session(&self, account_id: &str) -> Result<Option<AgentSession>> {
        let row = sqlx::query(
            r#"
            SELECT account_id, heartbeat, snapshot, positions, quote, candles,
                   agent_version, last_analysis_at
            FROM agent_sessions WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(session_from_row).transpose()
    }

    async fn list_sessions(&self) -> Result<Vec<AgentSession>> {
        let rows = sqlx::query(
            r#"
            SELECT account_id, heartbeat, snapshot, positions, quote, candles,
                   agent_version, last_analysis_at
            FROM agent_sessions ORDER BY account_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(session_from_row).collect()
    }

    async fn set_last_analysis(&self, account_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE agent_sessions SET last_analysis_at = $2 WHERE account_id = $1")
            .bind(account_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== Command queue ====================

    async fn insert_command(&self, command: &Command) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agent_commands (
                id, account_id, kind, symbol, volume, stop_loss, take_profit,
                ticket, comment, origin, status, created_at, expires_at, signal_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(command.id)
        .bind(&command.account_id)
        .bind(command.kind.as_str())
        .bind(&command.symbol)
        .bind(command.volume)
        .bind(command.stop_loss)
        .bind(command.take_profit)
        .bind(command.ticket)
        .bind(&command.comment)
        .bind(command.origin.as_str())
        .bind(command.status.as_str())
        .bind(command.created_at)
        .bind(command.expires_at)
        .bind(command.signal_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_command(&self, id: Uuid) -> Result<Option<Command>> {
        let row = sqlx::query(&format!(
            "SELECT {COMMAND_COLUMNS} FROM agent_commands WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(command_from_row).transpose()
    }

    async fn recent_commands(&self, account_id: &str, limit: i64) -> Result<Vec<Command>> {
        let rows = sqlx::query(&format!(
            "SELECT {COMMAND_COLUMNS} FROM agent_commands \
             WHERE account_id = $1 ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(command_from_row).collect()
    }

    async fn claim_deliverable_commands(&self, account_id: &str) -> Result<Vec<Command>> {
        // SKIP LOCKED keeps two concurrent polls from claiming the same rows;
        // whichever instance wins marks them SENT in the same statement.
        let rows = sqlx::query(
            r#"
            WITH picked AS (
                SELECT id FROM agent_commands
                WHERE account_id = $1 AND status = 'PENDING' AND expires_at > NOW()
                ORDER BY created_at ASC
                FOR UPDATE SKIP LOCKED
            )
            UPDATE agent_commands c
            SET status = 'SENT', sent_at = NOW()
            FROM picked
            WHERE c.id = picked.id
            RETURNING c.id, c.account_id, c.kind, c.symbol, c.volume, c.stop_loss,
                      c.take_profit, c.ticket, c.comment, c.origin, c.status,
                      c.result_ticket, c.result_price, c.result_error, c.created_at,
                      c.sent_at, c.executed_at, c.expires_at, c.signal_id
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        let mut commands: Vec<Command> = rows
            .iter()
            .map(command_from_row)
            .collect::<Result<Vec<_>>>()?;
        commands.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(commands)
    }

    async fn mark_command_executed(
        &self,
        id: Uuid,
        ticket: Option<i64>,
        price: Option<Decimal>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE agent_commands
            SET status = 'EXECUTED', result_ticket = $2, result_price = $3, executed_at = NOW()
            WHERE id = $1 AND status IN ('PENDING', 'SENT')
            "#,
        )
        .bind(id)
        .bind(ticket)
        .bind(price)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_command_failed(&self, id: Uuid, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE agent_commands
            SET status = 'FAILED', result_error = $2
            WHERE id = $1 AND status = 'SENT'
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn expire_overdue_commands(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE agent_commands
            SET status = 'EXPIRED'
            WHERE status IN ('PENDING', 'SENT') AND expires_at <= NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ==================== Execution lock leases ====================

    async fn try_insert_lock(
        &self,
        account_id: &str,
        lock_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO execution_locks (account_id, lock_id, acquired_at, expires_at, released)
            VALUES ($1, $2, NOW(), $3, FALSE)
            ON CONFLICT (account_id) DO NOTHING
            "#,
        )
        .bind(account_id)
        .bind(lock_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn try_takeover_lock(
        &self,
        account_id: &str,
        lock_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE execution_locks
            SET lock_id = $2, acquired_at = NOW(), expires_at = $3, released = FALSE
            WHERE account_id = $1 AND (released = TRUE OR expires_at < NOW())
            "#,
        )
        .bind(account_id)
        .bind(lock_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_lock(&self, account_id: &str, lock_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE execution_locks
            SET released = TRUE
            WHERE account_id = $1 AND lock_id = $2
            "#,
        )
        .bind(account_id)
        .bind(lock_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reap_expired_locks(&self, grace: Duration) -> Result<u64> {
        let cutoff = Utc::now() - grace;
        let result = sqlx::query("DELETE FROM execution_locks WHERE expires_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    // ==================== Trades ====================

    async fn insert_trade(&self, trade: &Trade) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                id, account_id, ticket, symbol, direction, entry_price, exit_price,
                stop_loss, take_profit, volume, status, signal_id, command_id,
                opened_at, closed_at, profit
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(trade.id)
        .bind(&trade.account_id)
        .bind(trade.ticket)
        .bind(&trade.symbol)
        .bind(trade.direction.as_str())
        .bind(trade.entry_price)
        .bind(trade.exit_price)
        .bind(trade.stop_loss)
        .bind(trade.take_profit)
        .bind(trade.volume)
        .bind(trade.status.as_str())
        .bind(trade.signal_id)
        .bind(trade.command_id)
        .bind(trade.opened_at)
        .bind(trade.closed_at)
        .bind(trade.profit)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn open_trades(&self, account_id: &str) -> Result<Vec<Trade>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades \
             WHERE account_id = $1 AND status = 'OPEN' ORDER BY opened_at ASC"
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(trade_from_row).collect()
    }

    async fn trade_for_command(&self, command_id: Uuid) -> Result<Option<Trade>> {
        let row = sqlx::query(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades WHERE command_id = $1 LIMIT 1"
        ))
        .bind(command_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(trade_from_row).transpose()
    }

    async fn close_trade(
        &self,
        account_id: &str,
        ticket: i64,
        exit_price: Option<Decimal>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE trades
            SET status = 'CLOSED', exit_price = COALESCE($3, exit_price), closed_at = NOW()
            WHERE account_id = $1 AND ticket = $2 AND status = 'OPEN'
            "#,
        )
        .bind(account_id)
        .bind(ticket)
        .bind(exit_price)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_trade_profit(
        &self,
        account_id: &str,
        ticket: i64,
        profit: Decimal,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE trades SET profit = $3
            WHERE account_id = $1 AND ticket = $2 AND status = 'OPEN'
            "#,
        )
        .bind(account_id)
        .bind(ticket)
        .bind(profit)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Session tokens ====================

    async fn save_token(&self, token: &SessionToken) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO session_tokens (account_id, token, issued_at, owner_digest)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (account_id) DO UPDATE SET
                token = EXCLUDED.token,
                issued_at = EXCLUDED.issued_at,
                owner_digest = EXCLUDED.owner_digest
            "#,
        )
        .bind(&token.account_id)
        .bind(&token.token)
        .bind(token.issued_at)
        .bind(&token.owner_digest)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_token(&self, account_id: &str) -> Result<Option<SessionToken>> {
        let row = sqlx::query(
            "SELECT account_id, token, issued_at, owner_digest \
             FROM session_tokens WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| SessionToken {
            account_id: r.get("account_id"),
            token: r.get("token"),
            issued_at: r.get("issued_at"),
            owner_digest: r.get("owner_digest"),
        }))
    }

    async fn delete_token(&self, account_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM session_tokens WHERE account_id = $1")
            .bind(account_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
