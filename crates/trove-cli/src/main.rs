mod connection;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use trove_broker::ConnectionBroker;
use trove_config::{AppConfig, ConfigLoader};
use trove_db::{
    ConnectionStore, MetadataStore, MigrationReport, MigrationSecrets, StoreOptions,
    run_migrations,
};
use trove_security::Vault;

use crate::connection::ConnectionCommands;

#[derive(Parser)]
#[command(
    name = "trove",
    version,
    about = "Trove - registry and broker for target database connections"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Directory holding config.yml and the default metadata store
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,

    /// Print a new vault encryption key
    Keygen,

    /// Manage registered connections
    Connection {
        #[command(subcommand)]
        action: ConnectionCommands,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_loader = match &cli.config_dir {
        Some(dir) => ConfigLoader::with_dir(dir),
        None => ConfigLoader::new()?,
    };
    let config = config_loader.load()?;

    let log_level = cli
        .log_level
        .clone()
        .or_else(|| config.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level)),
        )
        .init();

    if let Commands::Keygen = cli.command {
        println!("{}", Vault::generate_key()?);
        return Ok(());
    }

    config_loader.ensure_dirs()?;
    let vault = Arc::new(Vault::from_config(config.vault.encryption_key.as_deref())?);
    let store = MetadataStore::open(
        &config_loader.store_path(&config),
        store_options(&config),
    )?;

    // No command touches the registry before the schema is current.
    let report = run_migrations(
        &store,
        Arc::clone(&vault),
        MigrationSecrets {
            sample_db_password: config.sample_db.password.clone(),
        },
    )
    .await
    .context("failed to migrate metadata store")?;

    match cli.command {
        Commands::Migrate => print_report(&report),
        Commands::Keygen => {}
        Commands::Connection { action } => {
            let registry = ConnectionStore::new(store, Arc::clone(&vault));
            let broker = ConnectionBroker::new(registry.clone(), vault).with_connect_timeout(
                Duration::from_secs(config.broker.connect_timeout_secs),
            );
            connection::run(action, registry, broker).await?;
        }
    }

    Ok(())
}

fn store_options(config: &AppConfig) -> StoreOptions {
    StoreOptions {
        pool_size: config.store.pool_size,
        operation_timeout: Duration::from_secs(config.store.operation_timeout_secs),
    }
}

fn print_report(report: &MigrationReport) {
    println!("Schema migrations");
    println!("─────────────────");
    if report.applied.is_empty() {
        println!("  up to date ({} already applied)", report.already_applied);
        return;
    }
    let ids: Vec<String> = report.applied.iter().map(|id| id.to_string()).collect();
    println!("  applied:         {}", ids.join(", "));
    println!("  already applied: {}", report.already_applied);
}
