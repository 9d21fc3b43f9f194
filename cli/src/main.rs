use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use kvledger_kernel::adapters::mirror::MirrorRemote;
use kvledger_kernel::config::StoreConfig;
use kvledger_kernel::local::LocalStore;
use kvledger_kernel::store::FileKvStore;
use kvledger_kernel::sync::{ReconcileError, Reconciler};

/// KvLedger CLI
#[derive(Parser, Debug)]
#[command(name = "kvledger")]
#[command(about = "Local-first key/value store with a reconcilable change log", long_about = None)]
struct Cli {
    /// Path to store config JSON
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Override the store namespace
    #[arg(long, global = true)]
    namespace: Option<String>,

    /// Log filter, e.g. `info` or `kvledger_kernel=debug`
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a serialized value
    Set { key: String, value: String },

    /// Read a value, optionally falling back to a remote directory
    Get {
        key: String,
        #[arg(long)]
        remote_dir: Option<PathBuf>,
    },

    /// Remove a key
    Remove { key: String },

    /// List stored keys
    Keys,

    /// Show outstanding change records
    Log,

    /// Drop every outstanding change record
    ClearLog,

    /// Reconcile the change log against a remote directory
    Sync {
        #[arg(long)]
        remote_dir: PathBuf,
    },

    /// Upload the outstanding change log to a remote directory
    PushLog {
        #[arg(long)]
        remote_dir: PathBuf,
    },
}

/// Wrapper for JSON output of reads
#[derive(Debug, Serialize)]
struct GetOutput {
    key: String,
    value: Option<String>,
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<StoreConfig> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::load(path)?,
        None => StoreConfig::default_config(),
    };

    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(namespace) = &cli.namespace {
        config.namespace = namespace.clone();
    }

    config.validate()?;
    Ok(config)
}

fn open_mirror(config: &StoreConfig, remote_dir: &Path) -> Result<Arc<MirrorRemote<FileKvStore>>> {
    let path = remote_dir.join(format!("{}.json", config.namespace));
    debug!(path = %path.display(), "Opening remote mirror");
    let store = FileKvStore::open(&path)
        .with_context(|| format!("opening remote store {}", path.display()))?;
    Ok(Arc::new(MirrorRemote::new(store)))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    // ----------------------------
    // Load config and open store
    // ----------------------------
    let config = load_config(&cli)?;
    let store_path = config.store_path();
    let store = FileKvStore::open(&store_path)
        .with_context(|| format!("opening local store {}", store_path.display()))?;
    let local = LocalStore::open(store)?;
    info!(
        path = %store_path.display(),
        namespace = %config.namespace,
        pending = local.pending_changes().await.len(),
        "Opened local store"
    );

    // ----------------------------
    // Dispatch
    // ----------------------------
    match cli.command {
        Command::Set { key, value } => {
            let record = local.set_raw(&key, value).await?;
            print_json(&record)?;
        }

        Command::Get { key, remote_dir } => {
            let local = match remote_dir {
                Some(dir) => {
                    let mirror = open_mirror(&config, &dir)?;
                    local.with_fallback(mirror, config.sync.remote_timeout())
                }
                None => local,
            };
            let value = local.get_raw(&key).await?;
            print_json(&GetOutput { key, value })?;
        }

        Command::Remove { key } => {
            let record = local.remove_item(&key).await?;
            print_json(&record)?;
        }

        Command::Keys => {
            print_json(&local.keys().await?)?;
        }

        Command::Log => {
            print_json(&local.pending_changes().await)?;
        }

        Command::ClearLog => {
            let cleared = local.clear_changes().await?;
            print_json(&json!({ "cleared": cleared }))?;
        }

        Command::Sync { remote_dir } => {
            let mirror = open_mirror(&config, &remote_dir)?;
            let reconciler = Reconciler::new(local, mirror, &config.sync);

            match reconciler.sync_all_changes().await {
                Ok(report) => print_json(&report)?,
                Err(ReconcileError::NothingToSync) => {
                    print_json(&json!({ "status": "nothing_to_sync" }))?
                }
                Err(err) => return Err(err.into()),
            }
        }

        Command::PushLog { remote_dir } => {
            let mirror = open_mirror(&config, &remote_dir)?;
            let reconciler = Reconciler::new(local, mirror, &config.sync);

            match reconciler.upload_change_log().await {
                Ok(uploaded) => print_json(&json!({ "uploaded": uploaded }))?,
                Err(ReconcileError::NothingToSync) => {
                    print_json(&json!({ "status": "nothing_to_sync" }))?
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    Ok(())
}
