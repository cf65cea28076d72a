//! Transfer record types, status state machine and command validity tables.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle state of a transfer.
///
/// ```text
/// PENDING -> QUEUED -> PREPARING -> DOWNLOADING -> ASSEMBLING -> COMPLETED
///    \________\___________\______________\             \
///                    |                                  -> FAILED
///                  PAUSED / CANCELED / FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Waiting for an admission slot on its domain.
    Pending,
    /// Admitted; a batch id has been assigned.
    Queued,
    /// Probing the origin and planning chunks.
    Preparing,
    /// Chunk workers are running.
    Downloading,
    /// All chunks done; parts are being concatenated.
    Assembling,
    /// Asset promoted to permanent storage.
    Completed,
    /// Stopped by the user; resumable.
    Paused,
    /// A chunk or the assembly failed; restartable.
    Failed,
    /// Stopped by the user for good; restartable.
    Canceled,
}

impl TransferStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 9] = [
        Self::Pending,
        Self::Queued,
        Self::Preparing,
        Self::Downloading,
        Self::Assembling,
        Self::Completed,
        Self::Paused,
        Self::Failed,
        Self::Canceled,
    ];

    /// States that consume an admission slot on the transfer's domain.
    pub const SLOT_HOLDING: [Self; 4] = [
        Self::Queued,
        Self::Preparing,
        Self::Downloading,
        Self::Assembling,
    ];

    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Preparing => "preparing",
            Self::Downloading => "downloading",
            Self::Assembling => "assembling",
            Self::Completed => "completed",
            Self::Paused => "paused",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Pending or somewhere in the admission/download pipeline.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending) || self.holds_slot()
    }

    /// Completed or failed. Canceled is deliberately not included; commands
    /// check it separately.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Counted against the domain's admission ceiling.
    #[must_use]
    pub fn holds_slot(self) -> bool {
        Self::SLOT_HOLDING.contains(&self)
    }

    /// Transition table for the state machine.
    ///
    /// Reset edges (back to `Pending`) are only legal from paused, failed,
    /// canceled, and the slot-holding states (crash recovery).
    #[must_use]
    #[allow(clippy::match_same_arms)]
    pub fn can_transition_to(self, next: Self) -> bool {
        use TransferStatus::{
            Assembling, Canceled, Completed, Downloading, Failed, Paused, Pending, Preparing,
            Queued,
        };
        match (self, next) {
            (Pending, Queued) => true,
            (Queued, Preparing) => true,
            (Preparing, Downloading) => true,
            (Downloading, Assembling) => true,
            (Assembling, Completed) => true,
            (Queued | Preparing | Downloading | Assembling, Failed) => true,
            (Pending | Queued | Preparing | Downloading, Paused) => true,
            (from, Canceled) => !from.is_terminal() && from != Canceled,
            (Paused | Failed | Canceled | Queued | Preparing | Downloading | Assembling, Pending) => {
                true
            }
            _ => false,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("invalid transfer status: {s}"))
    }
}

/// Commands the controller layer can issue against a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferAction {
    Pause,
    Resume,
    Cancel,
    Restart,
    Destroy,
}

impl TransferAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
            Self::Restart => "restart",
            Self::Destroy => "destroy",
        }
    }

    /// Command validity table. A `false` here is reported as a conflict.
    ///
    /// Resume and restart also accept `Pending`: re-issuing them against a
    /// transfer that is already waiting only re-triggers admission.
    #[must_use]
    pub fn permits(self, status: TransferStatus) -> bool {
        match self {
            Self::Pause => status.is_active() && status != TransferStatus::Assembling,
            Self::Resume => matches!(status, TransferStatus::Paused | TransferStatus::Pending),
            Self::Cancel => !(status.is_terminal() || status == TransferStatus::Canceled),
            Self::Restart => matches!(
                status,
                TransferStatus::Failed | TransferStatus::Canceled | TransferStatus::Pending
            ),
            Self::Destroy => true,
        }
    }
}

impl fmt::Display for TransferAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempted download of one asset.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TransferRecord {
    /// Unique identifier.
    pub id: i64,
    /// Catalog asset being fetched.
    pub asset_id: i64,
    /// Source URL of the asset.
    pub source_url: String,
    /// Lowercased origin host, the admission unit.
    pub domain: String,
    /// Current status (stored as text, parsed via `status()`).
    #[sqlx(rename = "status")]
    #[serde(rename = "status")]
    pub status_str: String,
    /// Total size once the origin has been probed.
    pub bytes_total: Option<i64>,
    /// Bytes written across all chunks.
    pub bytes_downloaded: i64,
    /// Last percent pushed to observers.
    pub last_broadcast_percent: Option<i64>,
    pub queued_at: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub failed_at: Option<String>,
    /// Active job-batch, if any.
    pub batch_id: Option<String>,
    /// Last failure description.
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TransferRecord {
    /// Returns the parsed status enum.
    ///
    /// Falls back to `Failed` if the stored value is unreadable, so a corrupt
    /// row is restartable rather than silently admitted.
    #[must_use]
    pub fn status(&self) -> TransferStatus {
        self.status_str.parse().unwrap_or(TransferStatus::Failed)
    }

    /// Total size in bytes, when known.
    #[must_use]
    pub fn total_bytes(&self) -> Option<u64> {
        self.bytes_total.and_then(|value| u64::try_from(value).ok())
    }

    /// Bytes downloaded so far.
    #[must_use]
    pub fn downloaded_bytes(&self) -> u64 {
        u64::try_from(self.bytes_downloaded).unwrap_or(0)
    }

    /// Whole-number progress percent, when the total is known.
    #[must_use]
    pub fn percent(&self) -> Option<u8> {
        self.total_bytes()
            .map(|total| percent_of(self.downloaded_bytes(), total))
    }
}

impl fmt::Display for TransferRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transfer {{ id: {}, asset: {}, domain: {}, status: {} }}",
            self.id,
            self.asset_id,
            self.domain,
            self.status()
        )
    }
}

/// Floor percentage, clamped to 100. A zero-length total counts as done.
#[must_use]
pub fn percent_of(downloaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (u128::from(downloaded) * 100) / u128::from(total);
    u8::try_from(pct.min(100)).unwrap_or(100)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use TransferStatus::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in TransferStatus::ALL {
            assert_eq!(status.as_str().parse::<TransferStatus>().unwrap(), status);
            assert_eq!(status.to_string(), status.as_str());
        }
        assert!("in_progress".parse::<TransferStatus>().is_err());
    }

    #[test]
    fn test_is_active_covers_pipeline_only() {
        let active: Vec<_> = TransferStatus::ALL
            .into_iter()
            .filter(|s| s.is_active())
            .collect();
        assert_eq!(
            active,
            vec![Pending, Queued, Preparing, Downloading, Assembling]
        );
    }

    #[test]
    fn test_is_terminal_excludes_canceled() {
        assert!(Completed.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!Canceled.is_terminal());
        assert!(!Paused.is_terminal());
    }

    #[test]
    fn test_pending_does_not_hold_slot() {
        assert!(!Pending.holds_slot());
        assert!(Downloading.holds_slot());
        assert!(Assembling.holds_slot());
        assert!(!Paused.holds_slot());
    }

    #[test]
    fn test_forward_pipeline_transitions() {
        assert!(Pending.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Preparing));
        assert!(Preparing.can_transition_to(Downloading));
        assert!(Downloading.can_transition_to(Assembling));
        assert!(Assembling.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Downloading));
        assert!(!Downloading.can_transition_to(Completed));
    }

    #[test]
    fn test_completed_is_a_dead_end() {
        for next in TransferStatus::ALL {
            assert!(!Completed.can_transition_to(next), "completed -> {next}");
        }
    }

    #[test]
    fn test_canceled_not_reenterable() {
        assert!(!Canceled.can_transition_to(Canceled));
        assert!(!Failed.can_transition_to(Canceled));
        assert!(Paused.can_transition_to(Canceled));
        assert!(Canceled.can_transition_to(Pending));
    }

    #[test]
    fn test_assembling_cannot_pause() {
        assert!(!Assembling.can_transition_to(Paused));
        assert!(!TransferAction::Pause.permits(Assembling));
        assert!(TransferAction::Pause.permits(Downloading));
        assert!(TransferAction::Pause.permits(Pending));
        assert!(!TransferAction::Pause.permits(Paused));
    }

    #[test]
    fn test_action_validity_table() {
        assert!(TransferAction::Resume.permits(Paused));
        assert!(!TransferAction::Resume.permits(Failed));
        assert!(TransferAction::Restart.permits(Failed));
        assert!(TransferAction::Restart.permits(Canceled));
        assert!(!TransferAction::Restart.permits(Completed));
        assert!(!TransferAction::Restart.permits(Downloading));
        assert!(TransferAction::Cancel.permits(Downloading));
        assert!(TransferAction::Cancel.permits(Paused));
        assert!(!TransferAction::Cancel.permits(Canceled));
        assert!(!TransferAction::Cancel.permits(Completed));
        assert!(!TransferAction::Cancel.permits(Failed));
        for status in TransferStatus::ALL {
            assert!(TransferAction::Destroy.permits(status));
        }
    }

    #[test]
    fn test_percent_of_floors_and_clamps() {
        assert_eq!(percent_of(0, 100), 0);
        assert_eq!(percent_of(999, 1000), 99);
        assert_eq!(percent_of(1000, 1000), 100);
        assert_eq!(percent_of(2000, 1000), 100);
        assert_eq!(percent_of(0, 0), 100);
    }
}
