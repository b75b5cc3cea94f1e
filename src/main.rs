//! WolfSync - Full Synchronization Engine for Document-Store Followers
//!
//! Command-line front end: runs sync passes against a leader, serves the
//! local store as a leader, and inspects or resets checkpoint state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfsync::config::{LoggingConfig, WolfSyncConfig};
use wolfsync::network::{LeaderServer, LeaderService, TcpLeaderTransport};
use wolfsync::state::CheckpointStore;
use wolfsync::storage::{SharedStorage, SqliteStore};
use wolfsync::sync::{
    CancellationToken, GlobalSyncer, RemoteInventoryClient, SyncContext, SyncOutcome, SyncSummary,
};
use wolfsync::tuning;

/// WolfSync - Full Synchronization Engine for Document-Store Followers
#[derive(Parser)]
#[command(name = "wolfsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfsync.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synchronize every database from the leader
    Sync {
        /// Dump every collection in full instead of comparing revisions
        #[arg(long)]
        full: bool,
    },

    /// Serve the local document store as a leader
    Serve,

    /// Show checkpoints and recent runs
    Status,

    /// Clear checkpoints so the next run starts over
    Reset {
        /// Only clear checkpoints of this database
        #[arg(short, long)]
        database: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfsync.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "follower-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logging format comes from the config file when it can be read
    let logging = WolfSyncConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    init_logging(cli.log_level.as_deref().unwrap_or(&logging.level), &logging);

    match cli.command {
        Commands::Sync { full } => run_sync(&cli.config, full).await,
        Commands::Serve => run_serve(&cli.config).await,
        Commands::Status => run_status(&cli.config).await,
        Commands::Reset { database } => run_reset(&cli.config, database).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(&cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<WolfSyncConfig> {
    WolfSyncConfig::from_file(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

/// Open the local document store, creating its directory if needed
fn open_storage(config: &WolfSyncConfig) -> anyhow::Result<SharedStorage> {
    let path = config.storage_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = SqliteStore::open(&path)
        .with_context(|| format!("failed to open document store {}", path.display()))?;
    Ok(Arc::new(store))
}

fn open_checkpoints(config: &WolfSyncConfig) -> anyhow::Result<CheckpointStore> {
    let dir = config.state_dir();
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    CheckpointStore::open(&dir)
        .with_context(|| format!("failed to open checkpoints in {}", dir.display()))
}

/// Run one sync pass
async fn run_sync(config_path: &Path, full: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    config.validate_follower()?;
    tracing::info!(
        "Node {} syncing from leader {}",
        config.node.id,
        config.leader.address
    );

    let storage = open_storage(&config)?;
    let checkpoints = Arc::new(open_checkpoints(&config)?);
    let transport = Arc::new(TcpLeaderTransport::new(
        config.leader.address.clone(),
        config.connect_timeout(),
        config.leader.compression,
    ));
    let client = RemoteInventoryClient::new(transport, config.retry.clone(), config.request_timeout());
    let ctx = SyncContext::new(client, storage, checkpoints, config.sync.clone());

    let shutdown = CancellationToken::new();
    let on_interrupt = shutdown.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Received Ctrl+C, aborting sync run");
        on_interrupt.cancel();
    })
    .context("failed to install Ctrl+C handler")?;

    let syncer = GlobalSyncer::new(ctx).with_shutdown(shutdown);
    let summary = syncer.run(!full).await?;
    print_summary(&summary);

    match summary.outcome() {
        SyncOutcome::FullySucceeded => Ok(()),
        SyncOutcome::PartiallySucceeded { failed } => {
            bail!("{} collections failed to sync", failed.len())
        }
        SyncOutcome::Aborted => bail!(
            "sync run aborted with {} collections incomplete; run again to resume",
            summary.incomplete.len()
        ),
    }
}

fn print_summary(summary: &SyncSummary) {
    println!();
    println!("Sync run {} ({})", summary.run_id, summary.status);
    println!("===========================================================");
    println!("Leader:           {}", summary.leader.as_deref().unwrap_or("-"));
    println!("Mode:             {}", if summary.incremental { "incremental" } else { "full" });
    println!("Records applied:  {}", summary.records_applied);
    println!("Records deleted:  {}", summary.records_deleted);
    println!("Bytes:            {}", summary.bytes_transferred);
    if !summary.databases_created.is_empty() {
        println!("Created DBs:      {}", summary.databases_created.join(", "));
    }
    if !summary.databases_dropped.is_empty() {
        println!("Dropped DBs:      {}", summary.databases_dropped.join(", "));
    }
    for db in &summary.databases {
        println!(
            "  {:<20} {} synced, {} created, {} dropped, {} failed, {} aborted",
            db.database,
            db.succeeded.len(),
            db.created.len(),
            db.dropped.len(),
            db.failed.len(),
            db.aborted.len()
        );
    }
    for failed in &summary.failed {
        println!(
            "  FAILED {}/{} [{}]: {}",
            failed.database, failed.collection, failed.class, failed.error
        );
    }
}

/// Serve the local store to followers
async fn run_serve(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let storage = open_storage(&config)?;
    let service = Arc::new(LeaderService::new(config.node.id.clone(), storage));
    let server = LeaderServer::bind(&config.server.bind_address, service, config.leader.compression)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_address))?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                tracing::error!("Leader server error: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    Ok(())
}

/// Print checkpoints and run history
async fn run_status(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let checkpoints = open_checkpoints(&config)?;

    println!("WolfSync Status");
    println!("===============");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Leader:           {}", config.leader.address);
    println!("State Directory:  {}", config.state_dir().display());
    println!();

    let entries = checkpoints.list(None).await?;
    println!("Checkpoints ({}):", entries.len());
    for cp in &entries {
        println!(
            "  {:<32} {:<12} {:<12} {:>10} records  {}",
            format!("{}/{}", cp.database, cp.collection),
            cp.phase,
            cp.mode,
            cp.records_applied,
            cp.marker.as_ref().map(ToString::to_string).unwrap_or_default()
        );
    }
    println!();

    let runs = checkpoints.runs(10).await?;
    println!("Recent runs:");
    for run in &runs {
        println!(
            "  {}  {:<10} {}  ->  {}",
            run.run_id,
            run.status,
            run.started_at.to_rfc3339(),
            run.finished_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into())
        );
    }

    Ok(())
}

/// Forget checkpoints
async fn run_reset(config_path: &Path, database: Option<String>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let checkpoints = open_checkpoints(&config)?;

    let removed = match &database {
        Some(db) => checkpoints.remove_database(db).await?,
        None => checkpoints.clear().await?,
    };
    println!(
        "Removed {} checkpoints{}",
        removed,
        database.map(|db| format!(" for database {}", db)).unwrap_or_default()
    );
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String) -> anyhow::Result<()> {
    let config_content = format!(r#"# WolfSync Configuration
# Generated configuration file

[node]
id = "{node_id}"
data_dir = "/var/lib/wolfsync/{node_id}"

[leader]
address = "leader.example.com:7654"
connect_timeout_ms = 5000
# Per network call; timeouts are retried like other transient errors
request_timeout_ms = 30000
compression = true

[storage]
# path = "/var/lib/wolfsync/{node_id}/documents.db"

[sync]
# 0 = derive from available RAM
chunk_size = 1000
checksum_granularity = 16
checksum_leaf_size = 1000
# 0 = one worker per two CPU cores
collection_concurrency = 0
database_concurrency = 1
# databases = ["shop", "crm"]
skip_system_collections = false

[sync.drop_policy]
drop_extraneous = false
drop_extraneous_databases = false
# Drop and recreate collections whose type differs from the leader's
allow_recreate = false

[retry]
max_attempts = 5
initial_backoff_ms = 200
max_backoff_ms = 10000
multiplier = 2.0
jitter = true

[server]
bind_address = "0.0.0.0:7654"

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(&output, config_content)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to point at your leader.");
    println!("Then run: wolfsync sync --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: &Path) -> anyhow::Result<()> {
    match WolfSyncConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!(
                "  Leader: {}",
                if config.leader.address.is_empty() { "(none, serve only)" } else { config.leader.address.as_str() }
            );
            println!("  Storage: {}", config.storage_path().display());
            let mut sync = config.sync.clone();
            if sync.chunk_size == 0 || sync.collection_concurrency == 0 {
                let tuned = tuning::auto_tune();
                println!("{}", tuning::tuning_summary(&tuned));
                tuning::apply_tuned(&mut sync, &tuned);
            }
            println!("  Chunk Size: {}", sync.chunk_size);
            println!("  Collection Concurrency: {}", sync.collection_concurrency);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}
