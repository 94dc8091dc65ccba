// ABOUTME: CLI entry point for subscriber-sync
// ABOUTME: Parses commands and routes them to the engine's admin operations

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use subscriber_sync::config::{default_config_path, SyncConfig};
use subscriber_sync::engine::Engine;
use subscriber_sync::server::AdminServerHandle;
use subscriber_sync::store::{ResolutionChoice, Snapshot};
use subscriber_sync::utils::ensure_token_file;

#[derive(Parser)]
#[command(name = "subscriber-sync")]
#[command(about = "Synchronize externally captured subscriber changes", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, env = "SUBSCRIBER_SYNC_LOG", default_value = "info")]
    log: String,
    /// Path to config.toml (defaults to ~/.subscriber-sync/config.toml)
    #[arg(long, global = true, env = "SUBSCRIBER_SYNC_CONFIG")]
    config: Option<PathBuf>,
    /// Override the SQLite database path from the config file
    #[arg(long, global = true)]
    database: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler loop and the admin server until Ctrl+C
    Serve {
        /// Override the poll interval in seconds
        #[arg(long)]
        interval: Option<u64>,
        /// Override the admin listen address (host:port)
        #[arg(long)]
        listen: Option<String>,
    },
    /// Run one synchronization pass now
    Sync {
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Show sync health and counters
    Status,
    /// List unprocessed changes
    Changes {
        #[arg(long, default_value_t = 0)]
        page: usize,
        #[arg(long, default_value_t = 20)]
        size: usize,
        /// Only changes captured from this table
        #[arg(long)]
        table: Option<String>,
    },
    /// Inspect and resolve conflicts
    Conflicts {
        #[command(subcommand)]
        action: ConflictCommand,
    },
    /// Probe webhook endpoints
    TestWebhook {
        /// Probe this URL instead of every configured endpoint
        #[arg(long)]
        url: Option<String>,
    },
    /// Move records stuck in PROCESSING back to RETRY
    RearmStuck,
}

#[derive(Subcommand)]
enum ConflictCommand {
    /// List open conflicts
    List,
    /// Resolve the open conflict for one key
    Resolve {
        key: String,
        /// use-a, use-b or merge
        #[arg(long)]
        choice: String,
        /// Merged snapshot as a JSON object (required for merge)
        #[arg(long)]
        merged: Option<String>,
    },
    /// Resolve every open conflict with use-a or use-b
    ResolveAll {
        #[arg(long)]
        choice: String,
    },
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log / SUBSCRIBER_SYNC_LOG
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    // Logs go to stderr so command output on stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = SyncConfig::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    if let Some(database) = cli.database {
        config.database_path = database;
    }

    match cli.command {
        Commands::Serve { interval, listen } => {
            if let Some(interval) = interval {
                config.poll_interval_secs = interval;
            }
            if let Some(listen) = listen {
                config.admin.listen = listen;
            }
            serve(config).await
        }
        Commands::Sync { batch_size } => {
            let engine = Engine::from_config(&config)?;
            let batch_size = batch_size.unwrap_or(config.batch_size);
            let result = engine.admin.trigger_sync(batch_size).await?;
            print_json(&result)
        }
        Commands::Status => {
            let engine = Engine::from_config(&config)?;
            print_json(&engine.admin.status()?)
        }
        Commands::Changes { page, size, table } => {
            let engine = Engine::from_config(&config)?;
            print_json(&engine.admin.list_unprocessed(page, size, table.as_deref())?)
        }
        Commands::Conflicts { action } => {
            let engine = Engine::from_config(&config)?;
            match action {
                ConflictCommand::List => print_json(&engine.admin.list_conflicts()?),
                ConflictCommand::Resolve {
                    key,
                    choice,
                    merged,
                } => {
                    let choice: ResolutionChoice = choice.parse()?;
                    let merged = merged
                        .map(|raw| serde_json::from_str::<Snapshot>(&raw))
                        .transpose()
                        .context("--merged must be a JSON object")?;
                    print_json(&engine.admin.resolve_conflict(&key, choice, merged)?)
                }
                ConflictCommand::ResolveAll { choice } => {
                    let choice: ResolutionChoice = choice.parse()?;
                    print_json(&engine.admin.resolve_all_conflicts(choice)?)
                }
            }
        }
        Commands::TestWebhook { url } => {
            let engine = Engine::from_config(&config)?;
            let results = engine.admin.test_webhook(url.as_deref()).await;
            if results.is_empty() {
                return Err(anyhow!("No webhook endpoints configured; pass --url"));
            }
            print_json(&results)
        }
        Commands::RearmStuck => {
            let engine = Engine::from_config(&config)?;
            let rearmed = engine.admin.rearm_stuck()?;
            println!("Re-armed {} stuck change(s)", rearmed);
            Ok(())
        }
    }
}

async fn serve(config: SyncConfig) -> anyhow::Result<()> {
    let engine = Engine::from_config(&config)?;
    let listen = config.admin.listen_addr()?;
    let token = ensure_token_file(&config.admin.token_file)?;
    let server = AdminServerHandle::spawn(listen, engine.admin.clone(), token).await?;

    tracing::info!("Starting subscriber sync...");
    tracing::info!("Press Ctrl+C to stop");

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Received shutdown signal");
        let _ = shutdown_tx_clone.send(());
    });

    engine.scheduler.run(shutdown_rx).await?;
    server.shutdown().await?;
    Ok(())
}
