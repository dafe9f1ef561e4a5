//! Document storage backends implementing [`Backend`].
//!
//! Provides an in-memory backend for tests and single-process use, and a
//! SQLite-backed backend whose notifications are visible across processes
//! sharing the same database file.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

use confdis_types::{Backend, ConfdisError, Result};
use std::{sync::Arc, time::Duration};

/// Opens a backend from a URL.
///
/// `memory:` yields a fresh [`MemoryBackend`]; `sqlite:` URLs open (and create
/// if missing) a [`SqliteBackend`] polling for notifications every
/// `poll_interval`.
///
/// # Errors
///
/// Returns [`ConfdisError::Config`] for an unsupported scheme or a zero
/// `poll_interval`, and [`ConfdisError::Backend`] if the database cannot be
/// opened.
pub async fn connect(url: &str, poll_interval: Duration) -> Result<Arc<dyn Backend>> {
    if poll_interval.is_zero() {
        return Err(ConfdisError::Config("poll interval must be greater than zero".into()));
    }
    if url.starts_with("memory:") {
        return Ok(Arc::new(MemoryBackend::new()));
    }
    if url.starts_with("sqlite:") {
        let backend = SqliteBackend::new(url).await?.with_poll_interval(poll_interval);
        return Ok(Arc::new(backend));
    }
    Err(ConfdisError::Config(format!("unsupported backend url: {url}")))
}
