//! Ledger Backup - Main entry point
//!
//! Operator and host-app entry points to the backup pipeline.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ledger_backup::daemon::shutdown::ShutdownCoordinator;
use ledger_backup::events::BackupEvent;
use ledger_backup::monitor::ChangeDetector;
use ledger_backup::queue::AutoBackupQueue;
use ledger_backup::transfer::progress::{format_bytes, format_duration, format_speed};
use ledger_backup::{utils, BackupError, BackupRequest, BackupService, Config};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// How long shutdown waits for an in-flight backup
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Snapshot, package and upload now
    Backup,
    /// Replace local state with a remote archive, then restart the app
    Restore {
        /// Remote file to restore
        #[arg(long, required_unless_present = "latest", conflicts_with = "latest")]
        file_id: Option<String>,
        /// Restore the newest archive for the configured owner
        #[arg(long)]
        latest: bool,
    },
    /// Post-login check: is there a backup this device should offer to restore?
    Check,
    /// List archives in the remote space
    List,
    /// Delete a remote archive
    Delete {
        #[arg(long)]
        file_id: String,
    },
    /// Show remote storage usage
    Quota,
    /// Show local backup bookkeeping
    Status,
    /// Turn auto-backup on or off
    Auto {
        #[arg(value_enum)]
        state: Toggle,
    },
    /// Watch the databases and back up after each burst of changes
    Watch,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Toggle {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::debug!(
        "ledger-backup v{} (owner: {})",
        env!("CARGO_PKG_VERSION"),
        config.account.owner_id
    );

    let service = Arc::new(BackupService::from_config(&config).await?);
    let owner_id = config.account.owner_id.clone();

    match args.command {
        Command::Backup => {
            let reporter = spawn_progress_reporter(&service);
            let result = service.perform_backup(backup_request(&config)).await;
            reporter.abort();
            let file = result?;
            println!("Backed up to {} ({})", file.id, file.name);
        }
        Command::Restore { file_id, latest } => {
            let file_id = match (file_id, latest) {
                (Some(id), _) => id,
                (None, true) => match service.find_latest_backup(&owner_id).await? {
                    Some(file) => file.id,
                    None => return Err(BackupError::NoBackupFound(owner_id).into()),
                },
                (None, false) => bail!("either --file-id or --latest is required"),
            };
            let report = service.restore_from_backup(&file_id).await?;
            println!("Restored {}: {}", report.file_id, report.restored_files.join(", "));
            if !report.removed_files.is_empty() {
                println!("Removed stale: {}", report.removed_files.join(", "));
            }
            if let Some(keys) = report.kv_keys_restored {
                println!("Preferences restored: {keys} keys");
            }
            if report.restart_required {
                println!("Restart the app to load the restored data.");
            }
        }
        Command::Check => match service.login_restore_check(&owner_id).await? {
            Some(file) => println!(
                "Backup available: {} (modified {})",
                file.id,
                file.modified_time.as_deref().unwrap_or("unknown")
            ),
            None => println!("Nothing to restore"),
        },
        Command::List => {
            let files = service.client().list_files(None).await?;
            if files.is_empty() {
                println!("No remote archives");
            }
            for file in files {
                println!(
                    "{}\t{}\t{}\t{}",
                    file.id,
                    file.name,
                    file.modified_time.as_deref().unwrap_or("-"),
                    file.size.map(format_bytes).unwrap_or_else(|| "-".to_string())
                );
            }
        }
        Command::Delete { file_id } => {
            service.client().delete_file(&file_id).await?;
            println!("Deleted {file_id}");
        }
        Command::Quota => {
            let quota = service.client().get_quota().await?;
            match quota.limit {
                Some(limit) => println!("{} of {} used", format_bytes(quota.usage), format_bytes(limit)),
                None => println!("{} used (no limit)", format_bytes(quota.usage)),
            }
        }
        Command::Status => {
            println!("{}", serde_json::to_string_pretty(&service.status()?)?);
        }
        Command::Auto { state } => {
            let enabled = matches!(state, Toggle::On);
            service.set_auto_backup(enabled)?;
            println!("Auto-backup {}", if enabled { "enabled" } else { "disabled" });
        }
        Command::Watch => watch(service, &config).await?,
    }

    Ok(())
}

fn backup_request(config: &Config) -> BackupRequest {
    BackupRequest {
        owner_id: config.account.owner_id.clone(),
        account_email: config.account.email.clone(),
    }
}

fn spawn_progress_reporter(service: &BackupService) -> tokio::task::JoinHandle<()> {
    let mut events = service.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                BackupEvent::PhaseChanged { phase } => tracing::info!(?phase, "Phase"),
                BackupEvent::UploadProgress(p) => tracing::info!(
                    "Uploading: {:.1}% ({} of {}, {}, ETA {})",
                    p.percent_complete,
                    format_bytes(p.transferred_bytes),
                    format_bytes(p.total_bytes),
                    format_speed(p.bytes_per_second),
                    format_duration(p.eta_seconds)
                ),
                _ => {}
            }
        }
    })
}

async fn watch(service: Arc<BackupService>, config: &Config) -> Result<()> {
    let queue = AutoBackupQueue::new(Arc::clone(&service), config.auto_backup.debounce());
    let mut detector = ChangeDetector::new(service.databases(), service.locator().as_ref());
    let request = backup_request(config);

    let coordinator = Arc::new(ShutdownCoordinator::new());
    let mut shutdown_rx = coordinator.subscribe();
    let signals = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.wait_for_signal().await })
    };
    let reporter = spawn_progress_reporter(&service);

    let mut ticker = tokio::time::interval(config.auto_backup.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut was_busy = false;

    tracing::info!(
        files = detector.watched().count(),
        debounce_secs = config.auto_backup.debounce_secs,
        "Watching databases for changes"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {
                // our own checkpoint and restore writes are not app mutations
                if service.is_running() {
                    was_busy = true;
                    continue;
                }
                if was_busy {
                    was_busy = false;
                    detector.rebaseline();
                    continue;
                }
                if detector.poll() {
                    tracing::debug!("Database change detected");
                    queue.enqueue(request.clone());
                }
            }
        }
    }

    queue.cancel();
    signals.abort();
    coordinator
        .drain(|| service.is_running(), SHUTDOWN_DRAIN)
        .await;
    reporter.abort();

    Ok(())
}
