//! Command handlers that change a transfer's state.

use anyhow::Result;
use transfer_core::TransferAction;

use super::AppContext;

/// Runs pause, resume, cancel or restart. Conflicts propagate as
/// [`transfer_core::ActionError`] so the caller can map the exit code.
pub async fn run_action_command(ctx: &AppContext, action: TransferAction, id: i64) -> Result<()> {
    let engine = &ctx.engine;
    let record = match action {
        TransferAction::Pause => engine.pause(id).await?,
        TransferAction::Resume => engine.resume(id).await?,
        TransferAction::Cancel => engine.cancel(id).await?,
        TransferAction::Restart => engine.restart(id).await?,
        TransferAction::Destroy => return run_destroy_command(ctx, id, false).await,
    };
    println!("transfer {} is now {}", record.id, record.status());
    Ok(())
}

pub async fn run_destroy_command(ctx: &AppContext, id: i64, with_asset: bool) -> Result<()> {
    if with_asset {
        ctx.engine.destroy_with_asset(id).await?;
        println!("transfer {id} and its asset file destroyed");
    } else {
        ctx.engine.destroy(id).await?;
        println!("transfer {id} destroyed");
    }
    Ok(())
}

pub async fn run_sweep_command(ctx: &AppContext) -> Result<()> {
    let swept = ctx.engine.sweep_orphans().await?;
    println!("removed {swept} orphaned temp director{}", if swept == 1 { "y" } else { "ies" });
    Ok(())
}
