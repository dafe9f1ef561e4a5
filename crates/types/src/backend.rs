//! The backend gateway: the only surface through which the core touches a store.
//!
//! Any key-value store that can get, set, publish and subscribe implements
//! [`Backend`]; the synchronization engine never depends on a concrete store.

use crate::{ConfdisError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_core::Stream;
use std::pin::Pin;

/// Suffix appended to a document key to form its notification channel.
pub const CHANGES_SUFFIX: &str = ":_changes";

/// Returns the notification channel for a document key.
///
/// Every process holding the key computes the same channel name without any
/// coordination.
#[must_use]
pub fn changes_channel(key: &str) -> String {
    format!("{key}{CHANGES_SUFFIX}")
}

/// A content-free "something changed, re-fetch" notification.
///
/// `origin` is the marker the publisher passed to [`Backend::notify`]. It never
/// carries configuration data; handles only compare it against their own
/// marker to recognise echoes of their own writes. An empty origin means the
/// publisher is unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WakeEvent {
    pub origin: String,
}

impl WakeEvent {
    /// Creates a wake event published by `origin`.
    #[must_use]
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
        }
    }
}

/// A pinned, sendable stream of wake events for one channel.
///
/// An `Err` item is a failure of the subscription itself.
pub type WakeStream = Pin<Box<dyn Stream<Item = Result<WakeEvent>> + Send>>;

/// Get/set/publish/subscribe primitives of an external store.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Fetch the raw payload stored under `key`, or `None` if the key is absent.
    async fn load(&self, key: &str) -> Result<Option<Bytes>>;

    /// Persist `payload` under `key`, replacing any previous value.
    async fn store(&self, key: &str, payload: Bytes) -> Result<()>;

    /// Publish a wake event on `channel`. Fire-and-forget.
    async fn notify(&self, channel: &str, origin: &str) -> Result<()>;

    /// Subscribe to wake events published on `channel` from now on.
    async fn subscribe(&self, channel: &str) -> Result<WakeStream>;

    /// List the keys of all stored documents.
    async fn list(&self) -> Result<Vec<String>> {
        Err(ConfdisError::Backend(
            "listing keys not supported by this backend".into(),
        ))
    }
}
