use clap::{Parser, Subcommand};
use mtlink::agent::ProtocolHandler;
use mtlink::api::{self, AppState};
use mtlink::config::{AppConfig, ExecutionMode};
use mtlink::coordination::ExecutionLock;
use mtlink::error::{MtLinkError, Result};
use mtlink::gateway::{session, BrokerGateway, RestGateway, SessionManager};
use mtlink::orchestrator::{scheduler, ExecutionGuard, Orchestrator};
use mtlink::persistence::{PostgresStore, Store};
use mtlink::strategy::{FixedMoneyManager, HoldStrategy, MoneyManager, Strategy};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mtlink", about = "Multi-account trading robot server", version)]
struct Cli {
    /// Configuration directory
    #[arg(long, default_value = "config", env = "MTLINK_CONFIG_DIR")]
    config_dir: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server (default)
    Serve,
    /// Apply pending database migrations and exit
    Migrate,
    /// Validate the configuration and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config_dir)?;
    init_logging(&config);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Migrate => {
            let store =
                PostgresStore::new(&config.database.url, config.database.max_connections).await?;
            store.migrate().await?;
            Ok(())
        }
        Commands::CheckConfig => match config.validate() {
            Ok(()) => {
                info!("Configuration valid: {} account(s)", config.accounts.len());
                Ok(())
            }
            Err(errors) => {
                for e in &errors {
                    error!("Config: {}", e);
                }
                Err(MtLinkError::Validation(format!(
                    "{} configuration error(s)",
                    errors.len()
                )))
            }
        },
    }
}

async fn serve(config: AppConfig) -> Result<()> {
    if let Err(errors) = config.validate() {
        for e in &errors {
            error!("Config: {}", e);
        }
        return Err(MtLinkError::Validation(format!(
            "{} configuration error(s)",
            errors.len()
        )));
    }
    let config = Arc::new(config);

    let postgres =
        PostgresStore::new(&config.database.url, config.database.max_connections).await?;
    postgres.migrate().await?;
    let store: Arc<dyn Store> = Arc::new(postgres);

    let gateway: Arc<dyn BrokerGateway> = Arc::new(RestGateway::new(&config.gateway)?);
    let sessions = Arc::new(SessionManager::new(Arc::clone(&store), Arc::clone(&gateway)));
    let lock = Arc::new(ExecutionLock::new(
        Arc::clone(&store),
        config.trading.lock_lease_secs,
    ));

    // Collaborator seams; replace with real implementations when wired
    let strategy: Arc<dyn Strategy> = Arc::new(HoldStrategy);
    let money: Arc<dyn MoneyManager> =
        Arc::new(FixedMoneyManager::new(config.trading.default_lot_size));

    let guard = Arc::new(ExecutionGuard::new(
        Arc::clone(&store),
        Arc::clone(&lock),
        Arc::clone(&sessions),
        Arc::clone(&gateway),
        Arc::clone(&money),
        Arc::clone(&config),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&sessions),
        Arc::clone(&gateway),
        Arc::clone(&strategy),
        guard,
        Arc::clone(&config),
    ));
    let handler = Arc::new(ProtocolHandler::new(
        Arc::clone(&store),
        Arc::clone(&strategy),
        Arc::clone(&money),
        Arc::clone(&config),
    ));

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(scheduler::run_cycle_loop(
        Arc::clone(&orchestrator),
        Arc::clone(&config),
    )));
    tasks.push(tokio::spawn(scheduler::run_maintenance_loop(
        Arc::clone(&store),
        Arc::clone(&lock),
        Duration::from_secs(30),
    )));
    if config.trading.mode == ExecutionMode::Direct {
        let accounts: Vec<_> = config
            .accounts
            .iter()
            .filter(|a| a.is_complete())
            .cloned()
            .collect();
        if accounts.is_empty() {
            warn!("Direct mode with no complete accounts; token refresh loop not started");
        } else {
            tasks.push(tokio::spawn(session::run_token_refresh_loop(
                Arc::clone(&sessions),
                accounts,
                Duration::from_secs(config.trading.token_refresh_secs),
            )));
        }
    }

    let state = AppState::new(store, handler, Arc::clone(&config));
    let app = api::router(state);
    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(
        "mtlink listening on {} ({} account(s), {:?} mode)",
        addr,
        config.accounts.len(),
        config.trading.mode
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    for task in tasks {
        task.abort();
    }
    Ok(())
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},sqlx=warn", config.logging.level))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
