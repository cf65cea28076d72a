//! Errors from the transfer and chunk stores.

use std::fmt;

use thiserror::Error;

/// Coarse class of a SQLite failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorKind {
    /// `SQLITE_BUSY` or `SQLITE_LOCKED`: another writer holds the file.
    Busy,
    /// A CHECK, UNIQUE, NOT NULL or foreign-key constraint refused the write.
    Constraint,
    /// The pool is closed or timed out handing out a connection.
    Pool,
    Other,
}

impl DbErrorKind {
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => Self::Pool,
            sqlx::Error::Database(db) => {
                // Primary result codes; extended codes keep them in the low byte.
                let primary = db
                    .code()
                    .and_then(|code| code.parse::<u32>().ok())
                    .map(|code| code & 0xff);
                match primary {
                    Some(5 | 6) => Self::Busy,
                    Some(19) => Self::Constraint,
                    _ if db.is_check_violation()
                        || db.is_unique_violation()
                        || db.is_foreign_key_violation() =>
                    {
                        Self::Constraint
                    }
                    _ => Self::Other,
                }
            }
            _ => Self::Other,
        }
    }
}

impl fmt::Display for DbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Busy => "busy",
            Self::Constraint => "constraint",
            Self::Pool => "pool",
            Self::Other => "other",
        })
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error ({kind}): {message}")]
    Database { kind: DbErrorKind, message: String },

    #[error("transfer not found: id {0}")]
    TransferNotFound(i64),

    #[error("chunk not found: id {0}")]
    ChunkNotFound(i64),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: DbErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl StoreError {
    #[must_use]
    pub fn database_kind(&self) -> Option<DbErrorKind> {
        match self {
            Self::Database { kind, .. } => Some(*kind),
            Self::TransferNotFound(_) | Self::ChunkNotFound(_) => None,
        }
    }
}
