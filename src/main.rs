//! Gartenplaner CLI
//!
//! Thin wrapper around the planner for command-line use. State lives in a
//! SQLite file under the platform data directory.
//!
//! ## Usage
//!
//! ```bash
//! # Overview of tasks, peers, encryption and recent errors
//! gartenplaner status
//!
//! # Add, list and complete tasks
//! gartenplaner tasks add "Rasen mähen" --employee Jonas --location Wiese
//! gartenplaner tasks list
//! gartenplaner tasks complete 1718000000000
//!
//! # Back up the encryption key under a passphrase
//! gartenplaner key export --passphrase "lange geheime phrase" > key.backup
//!
//! # Join the roster and follow changes from other peers
//! gartenplaner watch
//! ```

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gartenplaner::logging::{self, LogStore};
use gartenplaner::storage::{self, DurableStorage, PRESENCE_KEY, SYNC_KEY};
use gartenplaner::{Config, Planner, SqliteStorage, SyncMessage, TaskDraft};

/// Gartenplaner - garden task planning for several peers
#[derive(Parser)]
#[command(name = "gartenplaner")]
#[command(version)]
#[command(about = "Garden task planner with presence sync and encryption at rest")]
struct Cli {
    /// Config file (default: <config dir>/gartenplaner/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory, overriding the config file
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show tasks, peers, encryption state and recent errors
    Status,

    /// Task management
    Tasks {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Encryption key management
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// Show configured quotas and current usage
    Limits,

    /// Show or clear the persisted error log
    Errors {
        /// Erase the log after printing it
        #[arg(long)]
        clear: bool,
    },

    /// Remove all application data (keys and logs are kept)
    Clear {
        /// Confirm removal (required)
        #[arg(long)]
        force: bool,
    },

    /// Join the presence roster and follow changes until Ctrl-C
    Watch {
        /// Storage poll interval in milliseconds
        #[arg(long, default_value_t = 1000)]
        poll_ms: u64,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// List active tasks
    List {
        /// List the archive instead
        #[arg(long)]
        archived: bool,
    },
    /// Add a task
    Add {
        title: String,
        #[arg(short, long)]
        employee: String,
        #[arg(short, long)]
        location: String,
        #[arg(short = 'D', long, default_value = "")]
        description: String,
        /// low, medium or high
        #[arg(short, long)]
        priority: Option<String>,
        /// Due date (YYYY-MM-DD)
        #[arg(long)]
        due: Option<String>,
    },
    /// Mark a task completed
    Complete { id: u64 },
    /// Put a completed task back to pending
    Reopen { id: u64 },
    /// Move a task to the archive
    Archive { id: u64 },
    /// Move an archived task back to the active list
    Restore { id: u64 },
    /// Delete a task
    Delete { id: u64 },
}

#[derive(Subcommand)]
enum KeyAction {
    /// Print the key backup (JWK, or encrypted with a passphrase)
    Export {
        #[arg(long)]
        passphrase: Option<String>,
    },
    /// Import a key backup from a file ("-" for stdin)
    Import {
        file: PathBuf,
        #[arg(long)]
        passphrase: Option<String>,
    },
    /// Re-encrypt stored data under a new key
    Rotate,
    /// Erase key material (encrypted data becomes unreadable)
    Clear {
        /// Confirm erasure (required)
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = Some(dir);
    }

    let db_path = config.database_path()?;
    let storage: Arc<dyn DurableStorage> = Arc::new(
        SqliteStorage::open(&db_path)
            .with_context(|| format!("Failed to open {}", db_path.display()))?
            .with_quota(config.storage.quota_bytes),
    );

    let log_store = Arc::new(LogStore::new(
        storage.clone(),
        config.logging.max_entries,
        config.logging.retention_hours,
    ));
    logging::init(&config.logging, Some(log_store.clone()))?;

    let planner = Planner::open(&config, storage.clone(), None)?;

    match cli.command {
        Commands::Status => print_status(&planner, storage.as_ref()),
        Commands::Tasks { action } => run_task_action(&planner, action)?,
        Commands::Key { action } => run_key_action(&planner, action)?,
        Commands::Limits => print_limits(&planner, &config),
        Commands::Errors { clear } => {
            let errors = planner.errors().persisted();
            if errors.is_empty() {
                println!("No recorded errors");
            }
            for report in &errors {
                println!(
                    "{}  {:<10} {:<28} {}",
                    report.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    report.kind.as_str(),
                    report.function,
                    report.message
                );
            }
            if clear {
                planner.errors().clear();
                println!("Error log cleared");
            }
        }
        Commands::Clear { force } => {
            if !force {
                anyhow::bail!("Refusing to clear data without --force");
            }
            let removed = storage::clear_app_data(storage.as_ref())?;
            println!("Removed {removed} entries");
        }
        Commands::Watch { poll_ms } => {
            let cleanup = logging::spawn_cleanup(
                log_store,
                Duration::from_secs(config.logging.cleanup_interval_secs.max(1)),
            );
            watch(&planner, storage, Duration::from_millis(poll_ms.max(50))).await?;
            cleanup.abort();
        }
    }

    Ok(())
}

fn print_status(planner: &Planner, storage: &dyn DurableStorage) {
    let encryption = planner.encryption().status();
    println!("Tasks:       {} active, {} archived", planner.tasks().len(), planner.archived().len());
    println!(
        "Encryption:  {} ({} {}-bit, key {})",
        if encryption.ready { "ready" } else { "not ready" },
        encryption.algorithm,
        encryption.key_length,
        if encryption.key_loaded { "loaded" } else { "missing" }
    );

    let peers: std::collections::HashMap<String, u64> =
        storage::read_json(storage, PRESENCE_KEY).ok().flatten().unwrap_or_default();
    println!("Known peers: {}", peers.len());
    let now = chrono::Utc::now().timestamp_millis();
    let mut peers: Vec<_> = peers.into_iter().collect();
    peers.sort();
    for (peer, seen) in peers {
        let age = (now - i64::try_from(seen).unwrap_or(i64::MAX)).max(0) / 1000;
        println!("  {peer}  last seen {age}s ago");
    }

    println!("Errors:      {} recorded", planner.errors().persisted().len());
}

fn run_task_action(planner: &Planner, action: TaskAction) -> Result<()> {
    match action {
        TaskAction::List { archived } => {
            let tasks = if archived { planner.archived() } else { planner.tasks() };
            if tasks.is_empty() {
                println!("No tasks");
            }
            for task in tasks {
                let mark = if task.is_completed() { "✓" } else { "○" };
                println!(
                    "{mark} {:<14} {:<32} {:<14} {:<14} {}",
                    task.id,
                    task.title,
                    task.employee,
                    task.location,
                    task.priority.as_deref().unwrap_or("")
                );
            }
        }
        TaskAction::Add {
            title,
            employee,
            location,
            description,
            priority,
            due,
        } => {
            let task = planner.create_task(&TaskDraft {
                title,
                employee,
                location,
                description,
                status: None,
                priority,
                due_date: due,
            })?;
            println!("Created task {}", task.id);
        }
        TaskAction::Complete { id } => {
            planner.complete_task(id)?;
            println!("Completed task {id}");
        }
        TaskAction::Reopen { id } => {
            planner.reopen_task(id)?;
            println!("Reopened task {id}");
        }
        TaskAction::Archive { id } => {
            planner.archive_task(id)?;
            println!("Archived task {id}");
        }
        TaskAction::Restore { id } => {
            planner.restore_task(id)?;
            println!("Restored task {id}");
        }
        TaskAction::Delete { id } => {
            planner.delete_task(id)?;
            println!("Deleted task {id}");
        }
    }
    Ok(())
}

fn run_key_action(planner: &Planner, action: KeyAction) -> Result<()> {
    let encryption = planner.encryption();
    match action {
        KeyAction::Export { passphrase } => {
            println!("{}", encryption.export_key(passphrase.as_deref())?);
        }
        KeyAction::Import { file, passphrase } => {
            let mut data = String::new();
            if file.as_os_str() == "-" {
                std::io::stdin().read_to_string(&mut data)?;
            } else {
                data = std::fs::read_to_string(&file)
                    .with_context(|| format!("Failed to read {}", file.display()))?;
            }
            encryption.import_key_from_backup(data.trim(), passphrase.as_deref())?;
            println!("Key imported");
        }
        KeyAction::Rotate => {
            let report = encryption.rotate_key()?;
            println!(
                "Key rotated: {} entries re-encrypted, {} skipped",
                report.rotated.len(),
                report.skipped.len()
            );
        }
        KeyAction::Clear { force } => {
            if !force {
                anyhow::bail!("Refusing to erase key material without --force");
            }
            encryption.clear_keys()?;
            println!("Key material erased");
        }
    }
    Ok(())
}

fn print_limits(planner: &Planner, config: &Config) {
    let stats = planner.limiter().statistics();
    println!("{:<12} {:>8} {:>10} {:>8}", "category", "max", "window", "used");
    for (name, quota) in &config.limits.categories {
        let used = stats.by_limiter.get(name).map_or(0, |u| u.requests);
        println!(
            "{:<12} {:>8} {:>10} {:>8}",
            name,
            quota.max_requests,
            gartenplaner::security::format_wait(quota.window_ms),
            used
        );
    }
}

/// Join the roster and relay sync messages written by other processes.
///
/// Storage notifications do not cross process boundaries, so the sync key
/// is polled and fed to the presence layer directly.
async fn watch(planner: &Arc<Planner>, storage: Arc<dyn DurableStorage>, poll: Duration) -> Result<()> {
    planner.start();
    println!("Watching as {} (Ctrl-C to stop)", planner.presence().peer_id());

    let presence = planner.presence().clone();
    let poller = tokio::spawn(async move {
        let mut last: Option<String> = None;
        let mut ticker = tokio::time::interval(poll);
        loop {
            ticker.tick().await;
            let raw = match storage.get(SYNC_KEY) {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to poll sync key");
                    continue;
                }
            };
            if raw.is_none() || raw == last {
                continue;
            }
            if let Some(message) = raw.as_deref().and_then(|r| SyncMessage::from_json(r).ok()) {
                presence.handle_message(&message);
            }
            last = raw;
        }
    });

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    poller.abort();
    planner.stop();
    println!("Stopped");
    Ok(())
}
