//! Progress bars driven by the engine's event stream.

use std::collections::HashMap;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use transfer_core::{TransferEvent, TransferStatus};

/// Spawns the progress UI when requested.
/// Returns `None` when disabled; otherwise the caller cancels `stop` and awaits
/// the handle.
pub(crate) fn spawn_progress_ui(
    enabled: bool,
    events: broadcast::Receiver<TransferEvent>,
    stop: CancellationToken,
) -> Option<tokio::task::JoinHandle<()>> {
    if !enabled {
        return None;
    }
    Some(tokio::spawn(render(events, stop)))
}

async fn render(mut events: broadcast::Receiver<TransferEvent>, stop: CancellationToken) {
    let multi = MultiProgress::new();
    let style = ProgressStyle::with_template("{prefix:>8} [{bar:30}] {pos:>3}% {msg}")
        .map(|style| style.progress_chars("=> "))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    let mut bars: HashMap<i64, ProgressBar> = HashMap::new();

    loop {
        let event = tokio::select! {
            () = stop.cancelled() => break,
            event = events.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "progress UI lagged behind events");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let bar = bars.entry(event.transfer_id()).or_insert_with(|| {
            let bar = multi.add(ProgressBar::new(100));
            bar.set_style(style.clone());
            bar.set_prefix(format!("#{}", event.transfer_id()));
            bar
        });
        apply(bar, &event);
    }

    for bar in bars.values() {
        if !bar.is_finished() {
            bar.abandon();
        }
    }
}

fn apply(bar: &ProgressBar, event: &TransferEvent) {
    match event {
        TransferEvent::Progress { percent, .. } => bar.set_position(u64::from(*percent)),
        TransferEvent::StatusChanged { status, .. } => {
            let status = *status;
            if status == TransferStatus::Completed {
                bar.set_position(100);
            }
            if status.is_terminal()
                || matches!(status, TransferStatus::Paused | TransferStatus::Canceled)
            {
                bar.finish_with_message(status.as_str());
            } else {
                bar.set_message(status.as_str());
            }
        }
    }
}
