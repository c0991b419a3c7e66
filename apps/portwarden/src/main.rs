mod cli;
mod error;
mod services;
mod settings;

use std::io;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use portwarden_db::repositories::{AccountRepository, NotificationRepository, TrafficRepository};

use services::account_service::{AccountService, NewAccount};
use services::host_executor::HostExecutor;
use services::lifecycle_service::LifecycleService;
use services::notification_service::{LogNotifier, NotificationService};
use services::sync_service::SyncService;
use services::traffic_service::{IptablesCounterSource, TrafficService};
use settings::Settings;

#[derive(Parser)]
#[command(name = "portwarden")]
#[command(about = "Proxy account provisioning and traffic accounting daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller daemon
    Serve,
    /// Install the daemon as a systemd service
    Install,
    /// Manage proxy accounts
    Account {
        #[command(subcommand)]
        subcommand: AccountCommands,
    },
    /// Show each account with the state of its service on the host
    Status,
    /// Re-align host services and the aggregate config with the account table
    Sync,
}

#[derive(Subcommand)]
enum AccountCommands {
    /// Create an account on the lowest free port
    Add {
        username: String,
        #[arg(long)]
        email: Option<String>,
        /// Traffic limit in GiB; 0 means unlimited
        #[arg(long, default_value_t = 10)]
        limit_gib: i64,
        /// Days until the account expires; omit for no expiry
        #[arg(long)]
        days: Option<i64>,
    },
    /// Delete an account and tear down its service
    Remove { username: String },
    /// List all accounts
    List,
    /// Start an account's service and put it back in the aggregate config
    Enable { username: String },
    /// Stop an account's service and drop it from the aggregate config
    Disable { username: String },
    /// Zero the traffic counter and re-arm the usage warning
    ResetTraffic { username: String },
    /// Push the expiry date further out
    Extend { username: String, days: i64 },
    /// Print the client connection string
    Url { username: String },
}

struct App {
    settings: Settings,
    accounts_repo: AccountRepository,
    traffic_repo: TrafficRepository,
    notifications_repo: NotificationRepository,
    executor: Arc<HostExecutor>,
    sync: Arc<SyncService>,
    accounts: Arc<AccountService>,
}

impl App {
    fn build(pool: sqlx::SqlitePool, settings: Settings) -> Self {
        let accounts_repo = AccountRepository::new(pool.clone());
        let traffic_repo = TrafficRepository::new(pool.clone());
        let notifications_repo = NotificationRepository::new(pool);

        let executor = Arc::new(HostExecutor::new(&settings));
        let lifecycle = Arc::new(LifecycleService::new(executor.clone(), &settings));
        let sync = Arc::new(SyncService::new(
            accounts_repo.clone(),
            lifecycle.clone(),
            &settings.method,
        ));
        let accounts = Arc::new(AccountService::new(
            accounts_repo.clone(),
            lifecycle,
            sync.clone(),
            settings.clone(),
        ));

        Self {
            settings,
            accounts_repo,
            traffic_repo,
            notifications_repo,
            executor,
            sync,
            accounts,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        println!("Warning: failed to load .env file: {}", e);
    }

    let cli = Cli::parse();

    let file_appender = tracing_appender::rolling::never(".", "portwarden.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "portwarden=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stdout))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    let settings = Settings::from_env()?;
    let pool = portwarden_db::connect(&settings.database_url).await?;
    let app = App::build(pool, settings);

    match cli.command {
        Commands::Serve => run_daemon(app).await?,
        Commands::Install => cli::install_service()?,
        Commands::Account { subcommand } => run_account_command(&app, subcommand).await?,
        Commands::Status => print_status(&app).await?,
        Commands::Sync => {
            let repaired = app.accounts.sync_services().await?;
            println!("Synced {} service(s) with the account table.", repaired);
        }
    }

    Ok(())
}

async fn run_daemon(app: App) -> Result<()> {
    let admin = app.accounts.ensure_admin().await?;
    tracing::info!(port = admin.port, "Admin aggregate service ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let counter_source = Box::new(IptablesCounterSource::new(
        app.executor.runner(),
        &app.settings.traffic_chain,
        app.settings.exec_timeout,
    ));
    let traffic = TrafficService::new(
        app.accounts_repo.clone(),
        app.traffic_repo.clone(),
        counter_source,
        app.settings.traffic_interval,
    );
    let traffic_handle = tokio::spawn(traffic.run(shutdown_rx.clone()));

    let notifications = NotificationService::new(
        app.accounts_repo.clone(),
        app.notifications_repo.clone(),
        app.traffic_repo.clone(),
        Box::new(LogNotifier),
        app.sync.clone(),
        app.settings.notify_interval,
    );
    let notify_handle = tokio::spawn(notifications.run(shutdown_rx));

    tracing::info!("Controller running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = traffic_handle.await;
    let _ = notify_handle.await;
    Ok(())
}

async fn run_account_command(app: &App, command: AccountCommands) -> Result<()> {
    match command {
        AccountCommands::Add {
            username,
            email,
            limit_gib,
            days,
        } => {
            let account = app
                .accounts
                .create_account(NewAccount {
                    username,
                    email,
                    traffic_limit: limit_gib * 1024 * 1024 * 1024,
                    expires_in_days: days,
                })
                .await?;
            println!(
                "Created '{}' on port {} ({})",
                account.username,
                account.port,
                account
                    .expires_at
                    .map(|at| format!("expires {}", at.format("%Y-%m-%d")))
                    .unwrap_or_else(|| "no expiry".to_string())
            );
            println!("{}", app.accounts.config_url(&account));
        }
        AccountCommands::Remove { username } => {
            app.accounts.delete_account(&username).await?;
            println!("Deleted '{}'.", username);
        }
        AccountCommands::List => {
            let accounts = app.accounts.list().await?;
            println!(
                "{:<16} {:>6} {:>8} {:>12} {:>12} {:>12}",
                "USERNAME", "PORT", "ENABLED", "USED", "LIMIT", "EXPIRES"
            );
            for a in accounts {
                println!(
                    "{:<16} {:>6} {:>8} {:>12} {:>12} {:>12}",
                    a.username,
                    a.port,
                    if a.enabled { "yes" } else { "no" },
                    cli::format_bytes(a.traffic_used),
                    if a.traffic_limit > 0 {
                        cli::format_bytes(a.traffic_limit)
                    } else {
                        "unlimited".to_string()
                    },
                    a.expires_at
                        .map(|at| at.format("%Y-%m-%d").to_string())
                        .unwrap_or_else(|| "-".to_string())
                );
            }
        }
        AccountCommands::Enable { username } => {
            app.accounts.set_enabled(&username, true).await?;
            println!("Enabled '{}'.", username);
        }
        AccountCommands::Disable { username } => {
            app.accounts.set_enabled(&username, false).await?;
            println!("Disabled '{}'.", username);
        }
        AccountCommands::ResetTraffic { username } => {
            app.accounts.reset_traffic(&username).await?;
            println!("Traffic reset for '{}'.", username);
        }
        AccountCommands::Extend { username, days } => {
            let account = app.accounts.extend(&username, days).await?;
            println!(
                "'{}' now expires {}.",
                username,
                account
                    .expires_at
                    .map(|at| at.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| "never".to_string())
            );
        }
        AccountCommands::Url { username } => {
            let account = app.accounts.get(&username).await?;
            println!("{}", app.accounts.config_url(&account));
        }
    }
    Ok(())
}

async fn print_status(app: &App) -> Result<()> {
    let accounts = app.accounts.list().await?;
    println!(
        "{:<16} {:>6} {:>8} {:>6} {:>8} {:>8}",
        "USERNAME", "PORT", "UNIT", "ACTIVE", "ENABLED", "RECORD"
    );
    for a in accounts {
        let (account, status) = app.accounts.status(&a.username).await?;
        println!(
            "{:<16} {:>6} {:>8} {:>6} {:>8} {:>8}",
            account.username,
            account.port,
            if status.unit_exists { "yes" } else { "no" },
            if status.active { "yes" } else { "no" },
            if status.enabled { "yes" } else { "no" },
            if account.enabled { "on" } else { "off" }
        );
    }
    Ok(())
}
