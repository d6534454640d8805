//! CLI entry point for the offline content manager.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result, bail};
use clap::Parser;
use offline_content::api::{ContentApi, Manifest, ManifestContentApi};
use offline_content::{
    Connectivity, Database, EventFilter, NetworkMonitor, OfflineContent, OfflineSettings,
    TaskOutcome,
};
use serde::Serialize;
use tracing::{debug, info, warn};

mod app_config;
mod cli;
mod progress;

use app_config::{FileConfig, load_file_config, resolve_default_data_dir};
use cli::{Args, Command};

const DB_FILE_NAME: &str = "offline.db";

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let loaded = load_file_config(args.config.as_deref())?;
    if let Some(path) = &loaded.path {
        debug!(path = %path.display(), loaded = loaded.config.is_some(), "config file");
    }
    let file_config = loaded.config.unwrap_or_default();
    file_config.validate()?;

    let settings = effective_settings(&args, &file_config)?;
    let data_dir = args
        .data_dir
        .clone()
        .or_else(|| file_config.data_dir.clone())
        .unwrap_or_else(resolve_default_data_dir);

    let result = run(&args, &file_config, settings, &data_dir).await;
    if let Err(err) = &result {
        warn!(error = %format!("{err:#}"), "command failed");
    }
    result
}

/// Library defaults, then the config file, then CLI flags.
fn effective_settings(args: &Args, file_config: &FileConfig) -> Result<OfflineSettings> {
    let mut settings = OfflineSettings::default();
    file_config.apply(&mut settings);
    if args.wifi_only {
        settings.wifi_only = true;
    }
    if let Some(concurrency) = args.concurrency {
        settings.max_concurrent_transfers = usize::from(concurrency);
    }
    settings.validate()?;
    Ok(settings)
}

async fn run(
    args: &Args,
    file_config: &FileConfig,
    settings: OfflineSettings,
    data_dir: &Path,
) -> Result<()> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory '{}'", data_dir.display()))?;
    let db = Database::new_with_options(&data_dir.join(DB_FILE_NAME), file_config.database_options())
        .await
        .context("Failed to open database")?;

    match &args.command {
        Command::Download {
            manifest,
            resource,
            priority,
            no_progress,
        } => {
            let manifest = Manifest::from_path(manifest)?;
            let api: Arc<dyn ContentApi> = Arc::new(ManifestContentApi::from_manifest(&manifest));
            let offline = open(settings, db, data_dir, api, Connectivity::Wifi).await?;
            let outcome = download(
                &offline,
                &manifest,
                resource.as_deref(),
                (*priority).into(),
                !no_progress && !args.quiet,
            )
            .await;
            offline.shutdown().await?;
            outcome
        }
        command => {
            // Inspection and control commands never transfer: keep the
            // scheduler offline so queued work waits for the next download.
            let api: Arc<dyn ContentApi> = Arc::new(ManifestContentApi::new());
            let offline = open(settings, db, data_dir, api, Connectivity::None).await?;
            let outcome = control(&offline, command).await;
            offline.shutdown().await?;
            outcome
        }
    }
}

async fn open(
    settings: OfflineSettings,
    db: Database,
    data_dir: &Path,
    api: Arc<dyn ContentApi>,
    connectivity: Connectivity,
) -> Result<OfflineContent> {
    let network = NetworkMonitor::new(connectivity, settings.wifi_only);
    let offline = OfflineContent::open(settings, db, data_dir, api, network)
        .await
        .context("Failed to open offline content store")?;
    let recovery = offline.recovery_report();
    if recovery.committed + recovery.resumable + recovery.restarted > 0 {
        info!(
            committed = recovery.committed,
            resumable = recovery.resumable,
            restarted = recovery.restarted,
            "recovered interrupted transfers"
        );
    }
    Ok(offline)
}

async fn download(
    offline: &OfflineContent,
    manifest: &Manifest,
    only: Option<&str>,
    priority: offline_content::Priority,
    show_progress: bool,
) -> Result<()> {
    let resources: Vec<_> = manifest
        .resources
        .iter()
        .filter(|resource| only.is_none_or(|id| resource.resource_id == id))
        .collect();
    if resources.is_empty() {
        match only {
            Some(id) => bail!("Resource '{id}' is not in the manifest"),
            None => {
                info!("Manifest lists no resources");
                return Ok(());
            }
        }
    }

    let events = offline.subscribe(EventFilter::All);
    let mut receipts = Vec::new();
    for resource in resources {
        let units = resource.unit_requests();
        let receipt = offline
            .request_download(&resource.resource_id, &units, priority)
            .await?;
        receipts.push(receipt);
    }

    let total: usize = receipts.iter().map(|receipt| receipt.tickets.len()).sum();
    let already = receipts
        .iter()
        .map(offline_content::RequestReceipt::already_completed)
        .sum::<usize>();
    let (handle, stop) = progress::spawn_progress_ui(show_progress, events, total as u64);

    let mut completed = 0usize;
    let mut failed = Vec::new();
    for receipt in receipts {
        for (id, outcome) in receipt.wait_all().await {
            match outcome {
                TaskOutcome::Completed { .. } => completed += 1,
                TaskOutcome::Failed { error, failure } => {
                    failed.push(format!("{id}: {error} ({failure})"));
                }
                TaskOutcome::Removed | TaskOutcome::Interrupted => {
                    debug!(task = %id, ?outcome, "unit did not finish");
                }
            }
        }
    }

    stop.store(true, Ordering::SeqCst);
    if let Some(handle) = handle {
        let _ = handle.await;
    }

    for failure in &failed {
        warn!("{failure}");
    }
    info!(
        completed,
        already_present = already,
        failed = failed.len(),
        total,
        "Download complete"
    );
    if !failed.is_empty() {
        bail!("{} unit(s) failed", failed.len());
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct ResourceStatus {
    resource_id: String,
    status: String,
    completed_units: u32,
    total_units: u32,
    progress: Option<f64>,
    expires_at: Option<i64>,
    units: Vec<UnitStatus>,
}

#[derive(Debug, Serialize)]
struct UnitStatus {
    unit: String,
    status: String,
    bytes_transferred: u64,
    bytes_total: Option<u64>,
    retry_count: u32,
    last_error: Option<String>,
    local_path: Option<PathBuf>,
}

async fn control(offline: &OfflineContent, command: &Command) -> Result<()> {
    match command {
        Command::Download { .. } => unreachable!("download is handled separately"),
        Command::Status { resource, json } => status(offline, resource.as_deref(), *json).await,
        Command::Pause { resource } => {
            let n = offline.pause(resource).await?;
            println!("paused {n} unit(s) of {resource}");
            Ok(())
        }
        Command::Resume { resource } => {
            let n = offline.resume(resource).await?;
            println!("resumed {n} unit(s) of {resource}");
            Ok(())
        }
        Command::Cancel { resource } => {
            let n = offline.cancel(resource).await?;
            println!("cancelled {n} unit(s) of {resource}");
            Ok(())
        }
        Command::Retry { resource } => {
            let n = offline.retry_failed(resource).await?;
            println!("re-queued {n} failed unit(s) of {resource}");
            Ok(())
        }
        Command::Delete { resource } => {
            let files = offline.delete(resource).await?;
            println!("deleted {resource} ({files} file(s))");
            Ok(())
        }
        Command::Summary { json } => {
            let summary = offline.storage_summary().await?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("persistent: {} bytes", summary.persistent_bytes);
                println!("ephemeral:  {} bytes", summary.ephemeral_bytes);
                println!("available:  {} bytes", summary.available_device_bytes);
            }
            Ok(())
        }
        Command::Evict => {
            let expired = offline.evict_expired().await?;
            let trimmed = offline.trim_cache().await?;
            println!(
                "evicted {} expired resource(s), trimmed {} cached file(s)",
                expired.len(),
                trimmed.len()
            );
            Ok(())
        }
        Command::Reconcile => {
            let report = offline.reconcile().await?;
            println!(
                "checked {} entries: {} dropped, {} resized, {} orphan(s) and {} temp file(s) removed",
                report.entries_checked,
                report.entries_dropped,
                report.sizes_fixed,
                report.orphans_removed,
                report.temp_files_removed
            );
            Ok(())
        }
    }
}

async fn status(offline: &OfflineContent, resource: Option<&str>, json: bool) -> Result<()> {
    let records = match resource {
        Some(id) => match offline.record(id).await? {
            Some(record) => vec![record],
            None => bail!("Unknown resource '{id}'"),
        },
        None => offline.records().await?,
    };

    let mut statuses = Vec::with_capacity(records.len());
    for record in records {
        let mut units = Vec::new();
        for task in offline.tasks(&record.resource_id).await? {
            let local_path = offline.content_store().local_path(&task.id).await;
            units.push(UnitStatus {
                unit: task.id.to_string(),
                status: task.status.to_string(),
                bytes_transferred: task.bytes_transferred,
                bytes_total: task.bytes_total,
                retry_count: task.retry_count,
                last_error: task.last_error,
                local_path,
            });
        }
        statuses.push(ResourceStatus {
            progress: offline.progress(&record.resource_id).await?,
            resource_id: record.resource_id,
            status: record.status.to_string(),
            completed_units: record.completed_units,
            total_units: record.total_units,
            expires_at: record.expires_at,
            units,
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }
    if statuses.is_empty() {
        println!("no resources");
    }
    for status in statuses {
        let percent = status.progress.map_or_else(|| "-".to_string(), |p| format!("{:.0}%", p * 100.0));
        println!(
            "{} {} {}/{} units {}",
            status.resource_id, status.status, status.completed_units, status.total_units, percent
        );
        for unit in status.units {
            match unit.last_error {
                Some(error) if unit.status == "failed" => {
                    println!("  {} {} ({error})", unit.unit, unit.status);
                }
                _ => println!("  {} {} {} bytes", unit.unit, unit.status, unit.bytes_transferred),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_file_config() {
        let args = Args::try_parse_from(["offline", "-c", "5", "--wifi-only", "evict"]).unwrap();
        let file = FileConfig {
            max_concurrent_transfers: Some(2),
            max_retries: Some(7),
            ..FileConfig::default()
        };
        let settings = effective_settings(&args, &file).unwrap();
        assert_eq!(settings.max_concurrent_transfers, 5);
        assert_eq!(settings.max_retries, 7);
        assert!(settings.wifi_only);
    }
}
