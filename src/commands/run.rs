//! Run command handler: recover, download until idle, summarize.

use std::io::{self, IsTerminal};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use transfer_core::{TransferAction, TransferEngine, TransferStatus};

use super::AppContext;
use super::progress::spawn_progress_ui;

pub async fn run_download_command(ctx: &AppContext, show_progress: bool) -> Result<()> {
    let engine = &ctx.engine;
    let stop = CancellationToken::new();
    let progress = spawn_progress_ui(
        show_progress && io::stderr().is_terminal(),
        engine.subscribe(),
        stop.clone(),
    );

    let report = engine.recover().await?;
    info!(
        reset = report.reset,
        swept = report.swept,
        admitted = report.admitted,
        "recovered"
    );

    let interrupted = tokio::select! {
        idle = engine.wait_idle() => {
            idle?;
            false
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(error) = signal {
                warn!(error = %error, "could not listen for Ctrl-C");
            }
            true
        }
    };

    if interrupted {
        info!("interrupted, pausing active transfers");
        engine.suspend_admission();
        pause_active(engine).await?;
    }

    stop.cancel();
    if let Some(handle) = progress {
        let _ = handle.await;
    }

    print_summary(engine).await
}

/// Pauses transfers that were admitted. Pending ones stay queued for the next
/// run.
async fn pause_active(engine: &TransferEngine) -> Result<()> {
    for transfer in engine.list().await? {
        if !should_pause_on_interrupt(transfer.status()) {
            continue;
        }
        match engine.pause(transfer.id).await {
            Ok(_) => println!("paused transfer {}", transfer.id),
            Err(error) if error.is_conflict() => {}
            Err(error) => warn!(transfer_id = transfer.id, error = %error, "could not pause"),
        }
    }
    Ok(())
}

fn should_pause_on_interrupt(status: TransferStatus) -> bool {
    status != TransferStatus::Pending && TransferAction::Pause.permits(status)
}

async fn print_summary(engine: &TransferEngine) -> Result<()> {
    let transfers = engine.list().await?;
    let count = |status: TransferStatus| {
        transfers
            .iter()
            .filter(|transfer| transfer.status() == status)
            .count()
    };

    println!(
        "completed {}, failed {}, paused {}, canceled {}, pending {}",
        count(TransferStatus::Completed),
        count(TransferStatus::Failed),
        count(TransferStatus::Paused),
        count(TransferStatus::Canceled),
        count(TransferStatus::Pending),
    );
    for transfer in transfers
        .iter()
        .filter(|transfer| transfer.status() == TransferStatus::Failed)
    {
        println!(
            "  #{} {}: {}",
            transfer.id,
            transfer.source_url,
            transfer.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_leaves_pending_transfers_queued() {
        assert!(!should_pause_on_interrupt(TransferStatus::Pending));
        assert!(should_pause_on_interrupt(TransferStatus::Queued));
        assert!(should_pause_on_interrupt(TransferStatus::Downloading));
        assert!(!should_pause_on_interrupt(TransferStatus::Assembling));
        assert!(!should_pause_on_interrupt(TransferStatus::Completed));
    }
}
