use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};

use eventpipe::app::App;
use eventpipe::config::Config;
use eventpipe::migrate::{ClickHouseMigrator, Migrator};
use eventpipe::store::ClickHouseConnector;

/// Analytics event ingestion and metrics service.
#[derive(Parser)]
#[command(name = "eventpipe", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
    /// Manage the ClickHouse schema and exit.
    Migrate {
        #[arg(value_enum, default_value_t = MigrateAction::Up)]
        action: MigrateAction,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum MigrateAction {
    Up,
    Down,
    Status,
}

mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("eventpipe {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Some(Command::Migrate { action }) => rt.block_on(migrate(cfg, action)),
        _ => {
            tracing::info!(
                version = version::RELEASE,
                commit = version::git_commit(),
                "starting eventpipe",
            );
            rt.block_on(run(cfg))
        }
    }
}

async fn run(cfg: Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let mut app = App::new(cfg)?;
    app.start().await?;

    let _ = shutdown_rx.await;

    app.stop().await?;

    tracing::info!("eventpipe stopped");

    Ok(())
}

async fn migrate(cfg: Config, action: MigrateAction) -> Result<()> {
    let pool = ClickHouseConnector::new(cfg.clickhouse.clone())
        .connect()
        .await
        .context("connecting to ClickHouse")?;
    let migrator = ClickHouseMigrator::new(pool);

    match action {
        MigrateAction::Up => migrator.up().await,
        MigrateAction::Down => migrator.down().await,
        MigrateAction::Status => {
            let (version, dirty) = migrator.status().await?;
            println!("version: {version} dirty: {dirty}");
            Ok(())
        }
    }
}
