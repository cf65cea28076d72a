//! File naming for assembled assets on the permanent disk.
//!
//! An asset lands at `assets/{asset_id}/{file name}`, where the file name is
//! the URL's last path segment, percent-decoded and sanitized.

use url::Url;

/// Longest file name kept, in characters. Extensions survive truncation.
const MAX_FILE_NAME_CHARS: usize = 120;

/// Derives the stored file name for an asset from its source URL.
///
/// Falls back to `asset-{asset_id}.bin` when the URL has no usable segment.
#[must_use]
pub fn asset_file_name(url: &str, asset_id: i64) -> String {
    last_path_segment(url)
        .map(|segment| {
            sanitize_component(&segment)
                .trim_matches(|c| c == '.' || c == '_')
                .to_string()
        })
        .map(|name| truncate_keeping_extension(&name, MAX_FILE_NAME_CHARS))
        .filter(|name| is_safe_file_name(name))
        .unwrap_or_else(|| format!("asset-{asset_id}.bin"))
}

/// Permanent storage key for an asset's file.
#[must_use]
pub fn asset_key(asset_id: i64, file_name: &str) -> String {
    format!("assets/{asset_id}/{file_name}")
}

fn last_path_segment(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.next_back()?;
    if segment.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(segment)
        .map_or_else(|_| segment.to_string(), std::borrow::Cow::into_owned);
    Some(decoded)
}

/// Keeps letters, digits, `-` and `.`; every other run of characters becomes
/// a single `_`. Leading and trailing `_` are dropped.
fn sanitize_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if ch.is_alphanumeric() || matches!(ch, '-' | '.') {
            out.push(ch);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

fn truncate_keeping_extension(name: &str, max_chars: usize) -> String {
    if name.chars().count() <= max_chars {
        return name.to_string();
    }
    let (stem, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 && name.len() - dot <= 12 => name.split_at(dot),
        _ => (name, ""),
    };
    let keep = max_chars.saturating_sub(ext.chars().count());
    let mut truncated: String = stem.chars().take(keep).collect();
    truncated.push_str(ext);
    truncated
}

fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty() && name.chars().any(|c| c != '.')
}
