//! Progress UI for download runs, driven by the event stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use offline_content::events::{EventStream, RecvError};
use offline_content::{TaskStatus, TransferEvent};

/// Spawns the progress bar when requested.
/// Returns (handle, stop) so the caller can signal stop and await the handle.
/// When `enabled` is false, returns (None, stop) with stop already true.
pub(crate) fn spawn_progress_ui(
    enabled: bool,
    events: EventStream,
    total_units: u64,
) -> (Option<tokio::task::JoinHandle<()>>, Arc<AtomicBool>) {
    if !enabled {
        return (None, Arc::new(AtomicBool::new(true)));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let handle = tokio::spawn(run_bar(events, total_units, Arc::clone(&stop)));
    (Some(handle), stop)
}

async fn run_bar(mut events: EventStream, total_units: u64, stop: Arc<AtomicBool>) {
    let bar = ProgressBar::new(total_units);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{pos}/{len}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.enable_steady_tick(Duration::from_millis(100));

    while !stop.load(Ordering::SeqCst) {
        let event = match tokio::time::timeout(Duration::from_millis(120), events.recv()).await {
            Ok(Ok(event)) => event,
            Ok(Err(RecvError::Lagged(_))) | Err(_) => continue,
            Ok(Err(RecvError::Closed)) => break,
        };
        if let Some(message) = describe(&event) {
            bar.set_message(message);
        }
        if settles_unit(&event) {
            bar.inc(1);
        }
    }

    bar.finish_and_clear();
}

/// Completed, failed and removed units advance the bar.
fn settles_unit(event: &TransferEvent) -> bool {
    matches!(
        event,
        TransferEvent::TaskStatusChanged {
            status: None | Some(TaskStatus::Completed | TaskStatus::Failed),
            ..
        }
    )
}

fn describe(event: &TransferEvent) -> Option<String> {
    match event {
        TransferEvent::TaskProgress {
            id,
            bytes_transferred,
            bytes_total: Some(total),
        } => Some(format!("{id} {bytes_transferred}/{total} bytes")),
        TransferEvent::TaskProgress {
            id,
            bytes_transferred,
            bytes_total: None,
        } => Some(format!("{id} {bytes_transferred} bytes")),
        TransferEvent::ResourceChanged {
            resource_id,
            fraction,
            ..
        } => Some(format!("{resource_id} {:.0}%", fraction * 100.0)),
        TransferEvent::TaskStatusChanged { .. } | TransferEvent::ResourceRemoved { .. } => None,
    }
}
