//! DocVault CLI - Admin Command Line Interface
//!
//! Opens a data directory directly and runs engine operations against it.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use docvault_common::{EngineConfig, Record, RecordKey};
use docvault_storage::wal::{LOGS_DIR, WAL_FILE, WalEntry};
use docvault_storage::{EngineHandle, WriteAheadLog};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "docvault-cli")]
#[command(about = "DocVault Admin CLI")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "docvault.toml")]
    config: String,

    /// Data directory (overrides the config file)
    #[arg(short, long, env = "DOCVAULT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a record from a JSON object; a key is allocated if absent
    Put {
        /// Record as JSON
        json: String,
    },
    /// Show a record
    Get {
        /// Record key
        key: String,
    },
    /// Merge fields into a record
    Update {
        /// Record key
        key: String,
        /// Fields to merge, as JSON
        json: String,
    },
    /// Delete a record
    Delete {
        /// Record key
        key: String,
    },
    /// Find records by checksum
    FindChecksum {
        /// Checksum value
        value: String,
        /// Show every record with this checksum, not just the latest
        #[arg(long)]
        all: bool,
    },
    /// List records
    List {
        /// Only records in this folder
        #[arg(short, long)]
        folder: Option<String>,
        /// Include subfolders
        #[arg(short, long)]
        recursive: bool,
        /// Only records outside any folder
        #[arg(long, conflicts_with = "folder")]
        ungrouped: bool,
    },
    /// Folder operations
    Folder {
        #[command(subcommand)]
        action: FolderCommands,
    },
    /// Reconcile the index with the files on disk
    Compact,
    /// Print persisted write-ahead log entries
    Wal,
    /// Show engine statistics
    Stats,
}

#[derive(Subcommand, Debug)]
enum FolderCommands {
    /// Create a folder
    Create {
        /// Folder path, e.g. Projects/2026
        path: String,
        /// Extra fields as JSON
        #[arg(long)]
        data: Option<String>,
    },
    /// List explicit and implied folders
    List,
    /// Show a folder record
    Show {
        /// Folder path
        path: String,
    },
    /// Delete a folder with its subfolders and records
    Delete {
        /// Folder path
        path: String,
    },
    /// Move a folder subtree; omit the destination to move to root
    Move {
        /// Current folder path
        old: String,
        /// New folder path
        new: Option<String>,
    },
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    engine: EngineConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn load_config(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        return Ok(Config::default());
    }
    let config_str =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
    toml::from_str(&config_str).with_context(|| format!("failed to parse {path}"))
}

fn parse_object(json: &str) -> Result<Record> {
    match serde_json::from_str::<Value>(json).context("invalid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("expected a JSON object, got {other}"),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_records(records: &[Record]) -> Result<()> {
    for record in records {
        println!("{}", serde_json::to_string(record)?);
    }
    eprintln!("{} record(s)", records.len());
    Ok(())
}

/// Read persisted WAL entries without creating anything under `data_dir`
fn read_wal(data_dir: &Path) -> Result<Vec<WalEntry>> {
    let path = data_dir.join(LOGS_DIR).join(WAL_FILE);
    let entries = WriteAheadLog::read_file(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    eprintln!("{} entries, {} bytes", entries.len(), bytes);
    Ok(entries)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();
    let config = load_config(&args.config)?;

    // Merge CLI args with config file (CLI takes precedence)
    let mut engine_config = config.engine;
    if let Some(data_dir) = args.data_dir {
        engine_config.data_dir = data_dir;
    }
    let log_level = args.log_level.unwrap_or(config.logging.level);

    // Initialize logging; stdout is reserved for command output
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    debug!("Config file: {}", args.config);
    debug!("Data dir: {:?}", engine_config.data_dir);

    // The WAL can be inspected without opening (and recovering) the store
    if let Commands::Wal = args.command {
        let entries = read_wal(&engine_config.data_dir)?;
        for entry in &entries {
            println!("{}", serde_json::to_string(entry)?);
        }
        return Ok(());
    }

    let engine = EngineHandle::open(engine_config)
        .await
        .context("failed to open store")?;

    match args.command {
        Commands::Put { json } => {
            let record = engine.create(parse_object(&json)?).await?;
            print_json(&record)?;
        }
        Commands::Get { key } => match engine.get(RecordKey::parse(&key)?).await? {
            Some(record) => print_json(&record)?,
            None => bail!("record {key} not found"),
        },
        Commands::Update { key, json } => {
            let patch = parse_object(&json)?;
            match engine.update(RecordKey::parse(&key)?, patch).await? {
                Some(record) => print_json(&record)?,
                None => bail!("record {key} not found"),
            }
        }
        Commands::Delete { key } => {
            if engine.delete(RecordKey::parse(&key)?).await? {
                println!("Deleted {key}");
            } else {
                println!("Record {key} did not exist");
            }
        }
        Commands::FindChecksum { value, all } => {
            if all {
                print_records(&engine.find_all_by_secondary_key(value).await?)?;
            } else {
                match engine.find_by_secondary_key(value.clone()).await? {
                    Some(record) => print_json(&record)?,
                    None => bail!("no record with checksum {value}"),
                }
            }
        }
        Commands::List {
            folder,
            recursive,
            ungrouped,
        } => {
            let records = match folder {
                Some(folder) => engine.list_by_group(folder, recursive).await?,
                None if ungrouped => engine.list_ungrouped().await?,
                None => engine.list_all().await?,
            };
            print_records(&records)?;
        }
        Commands::Folder { action } => match action {
            FolderCommands::Create { path, data } => {
                let extra = data.as_deref().map(parse_object).transpose()?;
                let folder = engine
                    .create_folder(path, extra.unwrap_or_default())
                    .await?;
                print_json(&folder)?;
            }
            FolderCommands::List => {
                for folder in engine.list_folders().await? {
                    println!("{folder}");
                }
            }
            FolderCommands::Show { path } => match engine.get_folder(path.clone()).await? {
                Some(folder) => print_json(&folder)?,
                None => bail!("folder {path} not found"),
            },
            FolderCommands::Delete { path } => {
                let deleted = engine.delete_group(path.clone()).await?;
                println!("Deleted folder {path} and {deleted} record(s)");
            }
            FolderCommands::Move { old, new } => {
                let moved = engine.move_group(old.clone(), new.clone()).await?;
                println!(
                    "Moved {old} to {}: {moved} record(s)",
                    new.as_deref().unwrap_or("/")
                );
            }
        },
        Commands::Compact => {
            let report = engine.compact().await?;
            println!("Compaction");
            println!("==========");
            println!("Dropped entries:  {}", report.dropped);
            println!("Adopted orphans:  {}", report.adopted);
            println!("Deleted orphans:  {}", report.deleted_orphans);
            println!("Removed temp:     {}", report.removed_temp);
        }
        Commands::Stats => {
            let stats = engine.stats().await?;
            println!("Store Statistics");
            println!("================");
            println!("Records:          {}", stats.records);
            println!("Folders:          {}", stats.folders);
            println!("Last ID:          {}", stats.last_id);
            println!(
                "Cache:            {}/{} ({:.1}% hit ratio)",
                stats.cache_len,
                stats.cache_capacity,
                stats.cache.hit_ratio * 100.0
            );
            println!("WAL pending:      {}", stats.wal_pending);
            println!("WAL size:         {} bytes", stats.wal_bytes);
            println!("Since compaction: {}", stats.writes_since_compaction);
        }
        // Handled before the store is opened
        Commands::Wal => {}
    }

    engine.close().await?;
    info!("done");
    Ok(())
}
