//! Unified error type for the confdis workspace.

use thiserror::Error;

/// Error returned by a caller-supplied edit function passed to an atomic save.
pub type EditError = Box<dyn std::error::Error + Send + Sync>;

/// Enumerates all error kinds that can occur across confdis crates.
#[derive(Debug, Error)]
pub enum ConfdisError {
    /// The document key does not exist in the backend.
    #[error("document not found: {key}")]
    NotFound { key: String },

    /// The stored payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Another reload or save changed the revision while an edit was pending.
    #[error("config already changed (rev {expected} -> {actual})")]
    Conflict { expected: u64, actual: u64 },

    /// Transport or storage failure reported by the backend.
    #[error("backend error: {0}")]
    Backend(String),

    /// The caller's edit function failed; nothing was written.
    #[error("edit aborted: {0}")]
    Edit(#[source] EditError),

    /// Settings loading or backend selection error.
    #[error("configuration error: {0}")]
    Config(String),
}

// ── Feature-gated From impls ──────────────────────────────────────────────────

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for ConfdisError {
    fn from(e: sqlx::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

impl ConfdisError {
    /// Returns `true` if re-running the whole operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Backend(_))
    }

    /// Returns `true` for an optimistic-concurrency revision mismatch.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns `true` when the document key was absent.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ConfdisError>;
