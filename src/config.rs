use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub agent: AgentConfig,
    pub trading: TradingConfig,
    #[serde(default)]
    pub accounts: Vec<AccountCredentials>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the agent sync / operator API
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret the Execution Agent must present on every call.
    /// Requests are rejected before any processing when it does not match.
    pub agent_key: Option<String>,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Base URL of the broker HTTP gateway (direct mode)
    pub base_url: String,
    /// Connection-phase timeout; kept shorter than data calls so a hung
    /// dependency cannot occupy a lock lease
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Timeout for data and order calls
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Retry attempts for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u8,
}

fn default_connect_timeout() -> u64 {
    3_000
}

fn default_request_timeout() -> u64 {
    10_000
}

fn default_max_retries() -> u8 {
    3
}

/// Execution-Agent protocol settings
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Seconds between strategy analyses per account
    #[serde(default = "default_analysis_interval")]
    pub analysis_interval_secs: u64,
    /// Minimum candles required before the strategy is consulted
    #[serde(default = "default_min_candles")]
    pub min_candles: usize,
    /// TTL for queued commands; past this they expire instead of delivering
    #[serde(default = "default_command_ttl")]
    pub command_ttl_secs: u64,
    /// A session counts as online while its heartbeat is younger than this
    #[serde(default = "default_online_window")]
    pub online_window_secs: u64,
}

fn default_analysis_interval() -> u64 {
    60
}

fn default_min_candles() -> usize {
    20
}

fn default_command_ttl() -> u64 {
    120
}

fn default_online_window() -> u64 {
    30
}

/// Execution mode for placed orders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Call the broker HTTP gateway directly
    Direct,
    /// Enqueue commands for the polling Execution Agent
    Bridge,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    /// Master switch; when off the guard chain aborts before any side effect
    #[serde(default = "default_true")]
    pub auto_trading: bool,
    #[serde(default = "default_mode")]
    pub mode: ExecutionMode,
    /// Aggressive mode runs the fast (~5s) cycle schedule
    #[serde(default)]
    pub aggressive: bool,
    #[serde(default = "default_cycle_fast")]
    pub cycle_interval_fast_secs: u64,
    #[serde(default = "default_cycle_slow")]
    pub cycle_interval_slow_secs: u64,
    /// Minimum signal confidence (0-100) in normal mode
    #[serde(default = "default_confidence_normal")]
    pub confidence_threshold: u8,
    /// Lower bar when running aggressively
    #[serde(default = "default_confidence_aggressive")]
    pub confidence_threshold_aggressive: u8,
    /// Per-account open position cap
    #[serde(default = "default_max_positions")]
    pub max_open_positions: usize,
    /// Advisory per-account cooldown between trades; the execution lock is
    /// the actual cross-instance guarantee
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    /// Execution lock lease; every side effect must finish well inside it
    #[serde(default = "default_lease")]
    pub lock_lease_secs: u64,
    /// Token force-refresh period for the lifecycle manager
    #[serde(default = "default_token_refresh")]
    pub token_refresh_secs: u64,
    /// Default lot size when the money manager reports none
    #[serde(default = "default_lot")]
    pub default_lot_size: Decimal,
}

fn default_true() -> bool {
    true
}

fn default_mode() -> ExecutionMode {
    ExecutionMode::Bridge
}

fn default_cycle_fast() -> u64 {
    5
}

fn default_cycle_slow() -> u64 {
    15
}

fn default_confidence_normal() -> u8 {
    70
}

fn default_confidence_aggressive() -> u8 {
    55
}

fn default_max_positions() -> usize {
    1
}

fn default_cooldown() -> u64 {
    60
}

fn default_lease() -> u64 {
    30
}

fn default_token_refresh() -> u64 {
    20 * 60
}

fn default_lot() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

/// Stored credentials for one brokerage account
#[derive(Debug, Clone, Deserialize)]
pub struct AccountCredentials {
    pub id: String,
    pub login: String,
    pub password: String,
    pub server: String,
    /// Symbol this account trades (broker suffixes differ per account)
    pub symbol: String,
}

impl AccountCredentials {
    /// Accounts with incomplete credentials are skipped by the orchestrator
    pub fn is_complete(&self) -> bool {
        !self.id.is_empty()
            && !self.login.is_empty()
            && !self.password.is_empty()
            && !self.server.is_empty()
            && !self.symbol.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("server.bind", "0.0.0.0")?
            .set_default("server.port", 8090)?
            .set_default("database.max_connections", 5)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(
                File::from(config_dir.join(
                    std::env::var("MTLINK_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (MTLINK_SERVER__AGENT_KEY, etc.)
            .add_source(
                Environment::with_prefix("MTLINK")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Active confidence threshold for the current mode
    pub fn confidence_threshold(&self) -> u8 {
        if self.trading.aggressive {
            self.trading.confidence_threshold_aggressive
        } else {
            self.trading.confidence_threshold
        }
    }

    /// Cycle interval for the current mode
    pub fn cycle_interval_secs(&self) -> u64 {
        if self.trading.aggressive {
            self.trading.cycle_interval_fast_secs
        } else {
            self.trading.cycle_interval_slow_secs
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.agent_key.as_deref().unwrap_or("").is_empty() {
            errors.push("server.agent_key must be set; agent sync is rejected without it".into());
        }

        if self.trading.confidence_threshold > 100 {
            errors.push("trading.confidence_threshold must be 0-100".into());
        }

        if self.trading.lock_lease_secs < 5 {
            errors.push("trading.lock_lease_secs must be at least 5".into());
        }

        if self.agent.command_ttl_secs == 0 {
            errors.push("agent.command_ttl_secs must be positive".into());
        }

        for account in &self.accounts {
            if !account.is_complete() {
                errors.push(format!("account {} has incomplete credentials", account.id));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
