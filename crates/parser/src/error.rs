//! Parse failure taxonomy

use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ParseError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("truncated input while reading {0}")]
    Truncated(&'static str),

    #[error("unsupported leaf version {0}")]
    UnsupportedVersion(u8),

    #[error("unsupported leaf type {0}")]
    UnsupportedLeafType(u8),

    #[error("unsupported entry type {0}")]
    UnsupportedEntryType(u16),

    #[error("invalid entry body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("certificate did not parse: {0}")]
    Certificate(String),

    #[error("checkpoint names tree {found}, expected {expected}")]
    CheckpointMismatch { expected: String, found: String },

    #[error("{0}")]
    Other(String),
}

impl ParseError {
    /// Checkpoint mismatches poison the whole fetch loop; everything
    /// else is scoped to the one entry.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::CheckpointMismatch { .. })
    }
}
