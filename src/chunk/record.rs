//! Chunk record types.

use std::fmt;

use serde::Serialize;
use sqlx::FromRow;

/// Per-chunk progress state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    InFlight,
    Done,
    Failed,
}

impl ChunkStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChunkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid chunk status: {s}")),
        }
    }
}

/// Half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One planned byte range of a transfer, mapped to a temp part file.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ChunkRecord {
    pub id: i64,
    pub transfer_id: i64,
    /// Zero-based position in range order.
    pub chunk_index: i64,
    pub range_start: i64,
    /// Exclusive end. Zero for an unranged chunk of unknown length.
    pub range_end: i64,
    /// False for the single whole-asset chunk of a range-incapable origin.
    pub ranged: bool,
    /// Key of the part file on the temp disk.
    pub part_path: String,
    #[sqlx(rename = "status")]
    #[serde(rename = "status")]
    pub status_str: String,
    pub bytes_written: i64,
}

impl ChunkRecord {
    /// Parsed chunk status. Unreadable values count as failed.
    #[must_use]
    pub fn status(&self) -> ChunkStatus {
        self.status_str.parse().unwrap_or(ChunkStatus::Failed)
    }

    #[must_use]
    pub fn range(&self) -> ByteRange {
        ByteRange::new(
            u64::try_from(self.range_start).unwrap_or(0),
            u64::try_from(self.range_end).unwrap_or(0),
        )
    }

    #[must_use]
    pub fn written(&self) -> u64 {
        u64::try_from(self.bytes_written).unwrap_or(0)
    }

    /// Number of bytes this chunk must hold when complete, if known.
    ///
    /// An unranged chunk with `range_end == 0` covers a body of unknown length.
    #[must_use]
    pub fn expected_len(&self) -> Option<u64> {
        let range = self.range();
        if self.ranged || !range.is_empty() {
            Some(range.len())
        } else {
            None
        }
    }

    /// Inclusive HTTP range for the bytes still missing, or `None` for an
    /// unranged chunk.
    #[must_use]
    pub fn remaining_http_range(&self) -> Option<(u64, u64)> {
        if !self.ranged {
            return None;
        }
        let range = self.range();
        Some((range.start + self.written(), range.end.saturating_sub(1)))
    }
}
