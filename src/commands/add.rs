//! Add command handler: register assets and enqueue their transfers.

use anyhow::{Context, Result};
use tracing::info;

use super::AppContext;

pub async fn run_add_command(ctx: &AppContext, urls: &[String]) -> Result<()> {
    for url in urls {
        let asset = ctx
            .catalog
            .insert_asset(url)
            .await
            .with_context(|| format!("registering {url}"))?;
        let transfer = ctx
            .engine
            .enqueue(asset.id)
            .await
            .with_context(|| format!("enqueueing {url}"))?;

        info!(transfer_id = transfer.id, asset_id = asset.id, "queued");
        println!(
            "transfer {} queued for {} (asset {}, domain {})",
            transfer.id, url, asset.id, transfer.domain
        );
    }
    Ok(())
}
