use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rewind_sync::application::services::{
    ActionLog, AdapterRegistry, OfflineCacheService, cache_store_schema,
};
use rewind_sync::domain::entities::{
    Action, HISTORY_SNAPSHOT_KEY, HistorySnapshot, PENDING_QUEUE_KEY, PendingQueueSnapshot,
};
use rewind_sync::infrastructure::storage::{ConnectionPool, SqliteDurableStore};
use rewind_sync::shared::{AppConfig, init_logging};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "rewind-inspect")]
#[command(about = "Inspect persisted action history and pending sync queue", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SQLite database URL (overrides REWIND_DATABASE_URL)
    #[arg(long)]
    database_url: Option<String>,

    /// Log filter (e.g. info, rewind_sync=debug)
    #[arg(short, long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Print JSON instead of a table
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show undo/redo stacks
    History,
    /// Show pending mutations waiting for delivery
    Queue,
    /// Clear persisted undo/redo history
    ClearHistory,
    /// List cached keys, oldest first
    Keys,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let mut config = AppConfig::from_env();
    if let Some(url) = cli.database_url.clone() {
        config.database.url = url;
    }
    config.validate().map_err(anyhow::Error::msg)?;

    ensure_parent_dir(&config.database.url)?;
    let pool = ConnectionPool::new(&config.database.url, config.database.max_connections)
        .await
        .with_context(|| format!("failed to connect to {}", config.database.url))?;
    let store = SqliteDurableStore::open(
        pool.get_pool().clone(),
        &config.database.store_name,
        config.database.store_version,
        cache_store_schema(),
    )
    .await
    .context("failed to open durable store")?;
    let cache = OfflineCacheService::new(Arc::new(store));

    match cli.command {
        Commands::History => show_history(&cache, cli.json).await?,
        Commands::Queue => show_queue(&cache, cli.json).await?,
        Commands::ClearHistory => clear_history(&config, cache).await?,
        Commands::Keys => {
            for key in cache.keys().await {
                let saved_at = key
                    .saved_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!("{saved_at}\t{}", key.key);
            }
        }
    }

    pool.close().await;
    Ok(())
}

async fn show_history(cache: &OfflineCacheService, json: bool) -> Result<()> {
    let snapshot = cache
        .load_validated::<HistorySnapshot, _>(HISTORY_SNAPSHOT_KEY, HistorySnapshot::is_well_formed)
        .await
        .unwrap_or_default();

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    println!("undo ({}):", snapshot.undo_stack.len());
    for action in &snapshot.undo_stack {
        print_action(action);
    }
    println!("redo ({}):", snapshot.redo_stack.len());
    for action in &snapshot.redo_stack {
        print_action(action);
    }
    Ok(())
}

fn print_action(action: &Action) {
    let batch = action
        .batch_id()
        .map(|id| format!(" [{id}]"))
        .unwrap_or_default();
    println!(
        "  {}  {:<11} {:<14} {}{}",
        action.timestamp.to_rfc3339(),
        action.kind.as_str(),
        action.entity_type,
        action.description,
        batch
    );
}

async fn show_queue(cache: &OfflineCacheService, json: bool) -> Result<()> {
    let snapshot = cache
        .load::<PendingQueueSnapshot>(PENDING_QUEUE_KEY)
        .await
        .unwrap_or_default();

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    println!("pending ({}):", snapshot.entries.len());
    for entry in &snapshot.entries {
        let error = entry.last_error.as_deref().unwrap_or("");
        println!(
            "  {}  {:<6} {}  attempts={} {}",
            entry.enqueued_at.to_rfc3339(),
            entry.method,
            entry.url,
            entry.attempts,
            error
        );
    }
    Ok(())
}

async fn clear_history(config: &AppConfig, cache: OfflineCacheService) -> Result<()> {
    // アダプタは呼ばれないので空のレジストリでよい
    let log = ActionLog::init(&config.history, Arc::new(AdapterRegistry::new()), cache).await?;
    log.clear_history().await;
    log.shutdown().await;
    info!("persisted history cleared");
    Ok(())
}

/// `sqlite:path/to/file.db?mode=rwc` のようなファイル DB なら親ディレクトリを作る
fn ensure_parent_dir(database_url: &str) -> Result<()> {
    let Some(rest) = database_url.strip_prefix("sqlite:") else {
        return Ok(());
    };
    let path = rest.trim_start_matches("//");
    let path = path.split('?').next().unwrap_or_default();
    if path.is_empty() || path == ":memory:" {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    Ok(())
}
