//! List and show command handlers.

use anyhow::{Result, bail};
use transfer_core::{ChunkRecord, TransferRecord};

use super::AppContext;

pub async fn run_list_command(ctx: &AppContext, json: bool) -> Result<()> {
    let transfers = ctx.engine.list().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&transfers)?);
        return Ok(());
    }
    if transfers.is_empty() {
        println!("No transfers.");
        return Ok(());
    }

    println!(
        "{:>6}  {:<12}  {:>5}  {:<24}  URL",
        "ID", "STATUS", "PCT", "DOMAIN"
    );
    for transfer in &transfers {
        println!("{}", render_row(transfer));
    }
    Ok(())
}

pub async fn run_show_command(ctx: &AppContext, id: i64) -> Result<()> {
    let Some(transfer) = ctx.engine.get(id).await? else {
        bail!("transfer not found: id {id}");
    };
    let chunks = ctx.engine.chunks(id).await?;

    println!("transfer   {}", transfer.id);
    println!("asset      {}", transfer.asset_id);
    println!("url        {}", transfer.source_url);
    println!("domain     {}", transfer.domain);
    println!("status     {}", transfer.status());
    println!("progress   {}", render_bytes(&transfer));
    if let Some(batch) = &transfer.batch_id {
        println!("batch      {batch}");
    }
    if let Some(error) = &transfer.error {
        println!("error      {error}");
    }
    for (label, value) in [
        ("queued", &transfer.queued_at),
        ("started", &transfer.started_at),
        ("finished", &transfer.finished_at),
        ("failed", &transfer.failed_at),
    ] {
        if let Some(value) = value {
            println!("{label:<10} {value}");
        }
    }

    if !chunks.is_empty() {
        println!();
        println!("{:>5}  {:<10}  {:>23}  {:>12}", "CHUNK", "STATUS", "RANGE", "WRITTEN");
        for chunk in &chunks {
            println!("{}", render_chunk(chunk));
        }
    }
    Ok(())
}

fn render_row(transfer: &TransferRecord) -> String {
    let percent = transfer
        .percent()
        .map_or_else(|| "-".to_string(), |p| format!("{p}%"));
    format!(
        "{:>6}  {:<12}  {:>5}  {:<24}  {}",
        transfer.id,
        transfer.status().as_str(),
        percent,
        truncate(&transfer.domain, 24),
        transfer.source_url
    )
}

fn render_bytes(transfer: &TransferRecord) -> String {
    match (transfer.total_bytes(), transfer.percent()) {
        (Some(total), Some(percent)) => {
            format!("{} / {} bytes ({percent}%)", transfer.downloaded_bytes(), total)
        }
        _ => format!("{} bytes", transfer.downloaded_bytes()),
    }
}

fn render_chunk(chunk: &ChunkRecord) -> String {
    let range = chunk.range();
    let span = if chunk.ranged {
        format!("{}-{}", range.start, range.end)
    } else {
        "whole".to_string()
    };
    format!(
        "{:>5}  {:<10}  {:>23}  {:>12}",
        chunk.chunk_index,
        chunk.status().as_str(),
        span,
        chunk.written()
    )
}

fn truncate(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        value.to_string()
    } else {
        let kept: String = value.chars().take(max.saturating_sub(1)).collect();
        format!("{kept}~")
    }
}

#[cfg(test)]
mod tests {
    use super::truncate;

    #[test]
    fn test_truncate_keeps_short_values() {
        assert_eq!(truncate("a.example", 24), "a.example");
    }

    #[test]
    fn test_truncate_marks_cut_values() {
        assert_eq!(truncate("abcdefgh", 5), "abcd~");
    }
}
