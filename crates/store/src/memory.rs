//! In-memory backend: a `HashMap` of documents plus one broadcast channel per
//! notification channel.

use async_trait::async_trait;
use bytes::Bytes;
use confdis_types::{Backend, Result, WakeEvent, WakeStream};
use futures_util::StreamExt as _;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

/// Wake events buffered per channel before a slow subscriber starts lagging.
const CHANNEL_CAPACITY: usize = 64;

/// An in-memory [`Backend`] for tests and handles living in one process.
///
/// Clone the surrounding `Arc` to let several handles share the same store.
pub struct MemoryBackend {
    /// Key-addressed document payloads.
    documents: Mutex<HashMap<String, Bytes>>,
    /// Publishers, created lazily on first subscribe or notify.
    channels: Mutex<HashMap<String, broadcast::Sender<WakeEvent>>>,
}

impl MemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            documents: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<WakeEvent> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn load(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self
            .documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    async fn store(&self, key: &str, payload: Bytes) -> Result<()> {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), payload);
        Ok(())
    }

    async fn notify(&self, channel: &str, origin: &str) -> Result<()> {
        // No subscribers is not an error.
        let _ = self.sender(channel).send(WakeEvent::new(origin));
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<WakeStream> {
        let rx = self.sender(channel).subscribe();
        let channel = channel.to_string();
        let stream = BroadcastStream::new(rx).map(move |item| match item {
            Ok(event) => Ok(event),
            // Missed events still only mean "re-fetch".
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(channel = %channel, skipped, "wake subscriber lagged");
                Ok(WakeEvent::default())
            }
        });
        Ok(Box::pin(stream))
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
