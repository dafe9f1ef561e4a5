//! [`ConfigHandle`]: one process's binding to one configuration document.

use crate::{
    codec::{Codec, JsonCodec},
    listener::{self, CHANGES_CAPACITY, Changes},
    reload::Reloaded,
    snapshot::{Snapshot, SnapshotStore},
};
use confdis_types::{Backend, ConfdisError, EditError, Result, changes_channel};
use std::{future::Future, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};

/// State shared between the handle and its listener task.
pub(crate) struct Shared<T, C> {
    pub(crate) key: String,
    pub(crate) channel: String,
    /// Marker published with our own notifications.
    pub(crate) origin: String,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) codec: C,
    pub(crate) store: SnapshotStore<T>,
}

/// A live, strongly-typed view of one configuration document.
///
/// Opening a handle loads the document once (a missing document starts from
/// `T::default()`), then keeps it current in the background: every change
/// published on the document's channel by any other process triggers a reload,
/// reported on the [`Changes`] receiver returned by [`ConfigHandle::open`].
///
/// Writes go through [`ConfigHandle::atomic_save`], which fails with
/// [`ConfdisError::Conflict`] if anything changed the revision while the edit
/// was running. Conflicting writes are never retried automatically.
///
/// Dropping the handle stops its listener.
pub struct ConfigHandle<T, C = JsonCodec> {
    shared: Arc<Shared<T, C>>,
    listener: JoinHandle<()>,
}

impl<T> ConfigHandle<T, JsonCodec>
where
    T: Default + Clone + Send + Sync + 'static,
    JsonCodec: Codec<T>,
{
    /// Opens a handle for `key` using the JSON codec.
    ///
    /// # Errors
    ///
    /// Returns [`ConfdisError::Backend`] if subscribing or the initial load
    /// fails, or [`ConfdisError::Serialization`] if the stored document does
    /// not decode. A missing document is not an error.
    pub async fn open(
        backend: Arc<dyn Backend>,
        key: impl Into<String>,
    ) -> Result<(Self, Changes<T>)> {
        Self::open_with_codec(backend, key, JsonCodec).await
    }
}

impl<T, C> ConfigHandle<T, C>
where
    T: Default + Clone + Send + Sync + 'static,
    C: Codec<T> + 'static,
{
    /// Opens a handle for `key` with a caller-chosen codec.
    ///
    /// # Errors
    ///
    /// Same as [`ConfigHandle::open`].
    pub async fn open_with_codec(
        backend: Arc<dyn Backend>,
        key: impl Into<String>,
        codec: C,
    ) -> Result<(Self, Changes<T>)> {
        let key = key.into();
        let channel = changes_channel(&key);
        // Subscribe first so a change racing the initial load still wakes us.
        let wakes = backend.subscribe(&channel).await?;

        let shared = Arc::new(Shared {
            key,
            channel,
            origin: uuid::Uuid::new_v4().to_string(),
            backend,
            codec,
            store: SnapshotStore::new(T::default()),
        });

        match shared.reload().await {
            Ok(r) => {
                tracing::debug!(
                    key = %shared.key,
                    revision = r.revision,
                    "initial configuration loaded"
                );
            }
            Err(ConfdisError::NotFound { .. }) => {
                tracing::info!(
                    key = %shared.key,
                    "configuration not found, starting from defaults"
                );
            }
            Err(e) => return Err(e),
        }

        let (tx, rx) = mpsc::channel(CHANGES_CAPACITY);
        let listener = listener::spawn(Arc::clone(&shared), wakes, tx);
        tracing::debug!(key = %shared.key, channel = %shared.channel, "change listener started");

        Ok((Self { shared, listener }, rx))
    }

    /// The document key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.shared.key
    }

    /// The notification channel derived from the key.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.shared.channel
    }

    /// The marker this handle publishes with its own notifications.
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.shared.origin
    }

    /// Returns the current configuration value.
    #[must_use]
    pub fn read(&self) -> Arc<T> {
        self.shared.store.read()
    }

    /// Returns the current revision.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.shared.store.revision()
    }

    /// Returns the current value and its revision as one consistent pair.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Snapshot<T>> {
        self.shared.store.snapshot()
    }

    /// Reloads the document from the backend right now.
    ///
    /// # Errors
    ///
    /// Returns [`ConfdisError::NotFound`] if the document is absent,
    /// [`ConfdisError::Serialization`] if it does not decode (the current
    /// snapshot is kept), or [`ConfdisError::Backend`] on transport failure.
    pub async fn reload(&self) -> Result<Reloaded<T>> {
        self.shared.reload().await
    }

    /// Edits a copy of the current value and writes it back, unless the
    /// revision moved while `edit` ran.
    ///
    /// `edit` runs without holding any lock and may take as long as it needs;
    /// the longer it runs, the likelier a conflict. On success the edited value
    /// becomes the snapshot and the new revision is returned.
    ///
    /// A reload triggered by another writer runs in its own critical section,
    /// so it may still replace a value this call has just committed: at the
    /// reload layer the last writer wins.
    ///
    /// # Errors
    ///
    /// - [`ConfdisError::Edit`] if `edit` fails; nothing is written.
    /// - [`ConfdisError::Conflict`] if a reload or save happened meanwhile;
    ///   nothing is written and the caller should retry the whole edit.
    /// - [`ConfdisError::Serialization`] or [`ConfdisError::Backend`] if the
    ///   value cannot be encoded or stored. A failed notification after a
    ///   successful store is logged, not returned.
    pub async fn atomic_save<F, Fut>(&self, edit: F) -> Result<u64>
    where
        F: FnOnce(T) -> Fut,
        Fut: Future<Output = std::result::Result<T, EditError>>,
    {
        self.shared.atomic_save(edit).await
    }

    /// Synchronous-edit variant of [`ConfigHandle::atomic_save`].
    ///
    /// # Errors
    ///
    /// Same as [`ConfigHandle::atomic_save`].
    pub async fn atomic_update<F>(&self, edit: F) -> Result<u64>
    where
        F: FnOnce(&mut T) -> std::result::Result<(), EditError>,
    {
        self.shared
            .atomic_save(|mut value| {
                let outcome = edit(&mut value).map(|()| value);
                std::future::ready(outcome)
            })
            .await
    }

    /// Stops the change listener and waits for it to finish.
    pub async fn close(mut self) {
        self.listener.abort();
        if let Err(e) = (&mut self.listener).await
            && !e.is_cancelled()
        {
            tracing::warn!(key = %self.shared.key, error = %e, "change listener panicked");
        }
    }
}

impl<T, C> Drop for ConfigHandle<T, C> {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChangeEvent;
    use async_trait::async_trait;
    use bytes::Bytes;
    use confdis_store::MemoryBackend;
    use confdis_types::{WakeEvent, WakeStream};
    use serde::{Deserialize, Serialize};
    use std::{sync::Mutex, time::Duration};
    use tokio::sync::oneshot;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct Meta {
        researcher: String,
        grant: i64,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(default)]
    struct Sample {
        name: String,
        users: Vec<String>,
        meta: Meta,
    }

    const WAIT: Duration = Duration::from_secs(2);

    fn memory() -> Arc<dyn Backend> {
        Arc::new(MemoryBackend::new())
    }

    async fn open(
        backend: &Arc<dyn Backend>,
        key: &str,
    ) -> (ConfigHandle<Sample>, Changes<Sample>) {
        ConfigHandle::open(Arc::clone(backend), key).await.unwrap()
    }

    async fn next_event(changes: &mut Changes<Sample>) -> ChangeEvent<Sample> {
        tokio::time::timeout(WAIT, changes.recv())
            .await
            .expect("no change event within deadline")
            .expect("listener dropped its sender")
    }

    fn primates(cfg: &mut Sample) -> std::result::Result<(), EditError> {
        cfg.name = "primates".into();
        cfg.users = vec!["chimp".into(), "bonobo".into(), "lemur".into()];
        cfg.meta.researcher = "Jane Goodall".into();
        cfg.meta.grant = 1200;
        Ok(())
    }

    /// Wraps a [`MemoryBackend`] with scripted subscription items and an
    /// optionally failing `notify`.
    struct ScriptedBackend {
        inner: MemoryBackend,
        wakes: Mutex<Option<Vec<Result<WakeEvent>>>>,
        fail_notify: bool,
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        async fn load(&self, key: &str) -> Result<Option<Bytes>> {
            self.inner.load(key).await
        }

        async fn store(&self, key: &str, payload: Bytes) -> Result<()> {
            self.inner.store(key, payload).await
        }

        async fn notify(&self, channel: &str, origin: &str) -> Result<()> {
            if self.fail_notify {
                return Err(ConfdisError::Backend("publish refused".into()));
            }
            self.inner.notify(channel, origin).await
        }

        async fn subscribe(&self, channel: &str) -> Result<WakeStream> {
            let scripted = self.wakes.lock().unwrap().take();
            match scripted {
                Some(items) => Ok(Box::pin(futures_util::stream::iter(items))),
                None => self.inner.subscribe(channel).await,
            }
        }
    }

    #[tokio::test]
    async fn test_open_missing_key_starts_from_default() {
        let backend = memory();
        let (h, _changes) = open(&backend, "svc/missing").await;
        assert_eq!(*h.read(), Sample::default());
        assert_eq!(h.revision(), 0);
        assert_eq!(h.channel(), "svc/missing:_changes");
    }

    #[tokio::test]
    async fn test_open_existing_document() {
        let backend = memory();
        backend
            .store("svc/foo", Bytes::from_static(br#"{"name":"primates","meta":{"grant":1200}}"#))
            .await
            .unwrap();
        let (h, _changes) = open(&backend, "svc/foo").await;
        assert_eq!(h.read().name, "primates");
        assert_eq!(h.read().meta.grant, 1200);
        assert_eq!(h.revision(), 1);
    }

    #[tokio::test]
    async fn test_open_rejects_malformed_document() {
        let backend = memory();
        backend
            .store("svc/bad", Bytes::from_static(b"{not json"))
            .await
            .unwrap();
        let err = ConfigHandle::<Sample>::open(Arc::clone(&backend), "svc/bad")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConfdisError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_atomic_save_round_trip() {
        let backend = memory();
        let (h, _changes) = open(&backend, "svc/foo").await;
        let rev = h.atomic_update(primates).await.unwrap();
        assert_eq!(rev, 1);
        assert_eq!(h.read().meta.researcher, "Jane Goodall");

        let stored = backend.load("svc/foo").await.unwrap().unwrap();
        let decoded: Sample = serde_json::from_slice(&stored).unwrap();
        assert_eq!(decoded, *h.read());

        // A fresh handle decodes exactly what was committed.
        let (other, _c) = open(&backend, "svc/foo").await;
        assert_eq!(*other.read(), *h.read());
    }

    #[tokio::test]
    async fn test_single_writer_saves_always_succeed() {
        let backend = memory();
        let (h, _changes) = open(&backend, "svc/counter").await;
        for expected in 1..=20 {
            let rev = h
                .atomic_update(|cfg| {
                    cfg.meta.grant += 15;
                    Ok(())
                })
                .await
                .unwrap();
            assert_eq!(rev, expected);
            // Give the listener a chance to see (and skip) our own echo.
            tokio::task::yield_now().await;
        }
        assert_eq!(h.read().meta.grant, 300);
    }

    #[tokio::test]
    async fn test_own_saves_do_not_notify_self() {
        let backend = memory();
        let (h, mut changes) = open(&backend, "svc/echo").await;
        h.atomic_update(primates).await.unwrap();
        let res = tokio::time::timeout(Duration::from_millis(100), changes.recv()).await;
        assert!(res.is_err(), "handle was notified of its own save");
        assert_eq!(h.revision(), 1);
    }

    #[tokio::test]
    async fn test_change_propagates_to_other_handle() {
        let backend = memory();
        let (h1, _c1) = open(&backend, "svc/notify").await;
        let (h2, mut c2) = open(&backend, "svc/notify").await;

        h1.atomic_update(primates).await.unwrap();

        match next_event(&mut c2).await {
            ChangeEvent::Reloaded { previous, revision } => {
                assert_eq!(*previous, Sample::default());
                assert_eq!(revision, 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(h2.read().name, "primates");

        h1.atomic_update(|cfg| {
            cfg.meta.researcher = "Francine Patterson".into();
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(next_event(&mut c2).await.into_result().unwrap(), 2);
        assert_eq!(h2.read().meta.researcher, "Francine Patterson");
    }

    #[tokio::test]
    async fn test_interleaved_reload_causes_conflict() {
        let backend = memory();
        let (h, _changes) = open(&backend, "svc/occ").await;
        h.atomic_update(|cfg| {
            cfg.name = "first".into();
            Ok(())
        })
        .await
        .unwrap();

        let (go_tx, go_rx) = oneshot::channel::<()>();
        let save = h.atomic_save(|mut cfg| async move {
            go_rx.await.unwrap();
            cfg.name = "late".into();
            Ok(cfg)
        });
        let interfere = async {
            h.reload().await.unwrap();
            go_tx.send(()).unwrap();
        };
        let (res, ()) = tokio::join!(save, interfere);

        let err = res.unwrap_err();
        assert!(matches!(
            err,
            ConfdisError::Conflict {
                expected: 1,
                actual: 2
            }
        ));
        assert!(err.is_retryable());
        let stored: Sample =
            serde_json::from_slice(&backend.load("svc/occ").await.unwrap().unwrap()).unwrap();
        assert_eq!(stored.name, "first");
        assert_eq!(h.revision(), 2);
    }

    #[tokio::test]
    async fn test_slow_edit_loses_to_concurrent_commit() {
        let backend = memory();
        let (h1, _c1) = open(&backend, "svc/foo").await;
        let (h2, mut c2) = open(&backend, "svc/foo").await;

        assert_eq!(
            h1.atomic_update(|cfg| {
                cfg.name = "primates".into();
                cfg.meta.grant = 1200;
                Ok(())
            })
            .await
            .unwrap(),
            1
        );
        next_event(&mut c2).await.into_result().unwrap();
        assert_eq!(h2.read().name, "primates");

        let slow = h1.atomic_save(|mut cfg| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cfg.meta.researcher = "Francine Patterson".into();
            Ok(cfg)
        });
        let fast = h2.atomic_save(|mut cfg| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cfg.meta.grant += 15;
            Ok(cfg)
        });
        let (slow_res, fast_res) = tokio::join!(slow, fast);

        assert!(fast_res.is_ok());
        assert!(slow_res.unwrap_err().is_conflict());

        let stored: Sample =
            serde_json::from_slice(&backend.load("svc/foo").await.unwrap().unwrap()).unwrap();
        assert_eq!(stored.name, "primates");
        assert_eq!(stored.meta.grant, 1215);
        assert_eq!(stored.meta.researcher, "");
    }

    #[tokio::test]
    async fn test_edit_error_writes_nothing() {
        let backend = memory();
        let (h, _changes) = open(&backend, "svc/edit").await;
        let err = h
            .atomic_update(|cfg| {
                cfg.name = "never stored".into();
                Err("quota exceeded".into())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ConfdisError::Edit(_)));
        assert!(backend.load("svc/edit").await.unwrap().is_none());
        assert_eq!(h.revision(), 0);
        assert_eq!(h.read().name, "");
    }

    #[tokio::test]
    async fn test_malformed_update_keeps_snapshot() {
        let backend = memory();
        let (h, mut changes) = open(&backend, "svc/garbage").await;
        h.atomic_update(primates).await.unwrap();

        backend
            .store("svc/garbage", Bytes::from_static(b"{\"name\": 7"))
            .await
            .unwrap();
        backend.notify(h.channel(), "another-process").await.unwrap();

        let event = next_event(&mut changes).await;
        assert!(matches!(event, ChangeEvent::Failed(ConfdisError::Serialization(_))));
        assert!(!event.is_terminal());
        assert_eq!(h.read().name, "primates");
        assert_eq!(h.revision(), 1);
    }

    #[tokio::test]
    async fn test_deleted_document_after_wake_is_not_found() {
        let backend = memory();
        let (h, mut changes) = open(&backend, "svc/gone").await;
        backend.notify(h.channel(), "another-process").await.unwrap();
        let event = next_event(&mut changes).await;
        assert!(event.error().unwrap().is_not_found());
        assert_eq!(h.revision(), 0);
    }

    #[tokio::test]
    async fn test_subscription_end_is_terminal_event() {
        let backend: Arc<dyn Backend> = Arc::new(ScriptedBackend {
            inner: MemoryBackend::new(),
            wakes: Mutex::new(Some(Vec::new())),
            fail_notify: false,
        });
        let (_h, mut changes) = open(&backend, "svc/closed").await;
        let event = next_event(&mut changes).await;
        assert!(event.is_terminal());
        assert!(matches!(event, ChangeEvent::Closed(ConfdisError::Backend(_))));
        assert!(changes.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_subscription_error_is_escalated() {
        let backend: Arc<dyn Backend> = Arc::new(ScriptedBackend {
            inner: MemoryBackend::new(),
            wakes: Mutex::new(Some(vec![
                Ok(WakeEvent::new("remote")),
                Err(ConfdisError::Backend("connection reset".into())),
            ])),
            fail_notify: false,
        });
        backend
            .store("svc/flaky", Bytes::from_static(br#"{"name":"v1"}"#))
            .await
            .unwrap();
        let (h, mut changes) = open(&backend, "svc/flaky").await;

        assert_eq!(next_event(&mut changes).await.into_result().unwrap(), 2);
        match next_event(&mut changes).await {
            ChangeEvent::Closed(e) => assert_eq!(e.to_string(), "backend error: connection reset"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(h.read().name, "v1");
    }

    #[tokio::test]
    async fn test_notify_failure_does_not_fail_save() {
        let backend: Arc<dyn Backend> = Arc::new(ScriptedBackend {
            inner: MemoryBackend::new(),
            wakes: Mutex::new(None),
            fail_notify: true,
        });
        let (h, _changes) = open(&backend, "svc/quiet").await;
        assert_eq!(h.atomic_update(primates).await.unwrap(), 1);
        assert!(backend.load("svc/quiet").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reloads_continue_without_consumer() {
        let backend = memory();
        let (h1, _c1) = open(&backend, "svc/detached").await;
        let (h2, c2) = open(&backend, "svc/detached").await;
        drop(c2);

        for _ in 0..3 {
            h1.atomic_update(|cfg| {
                cfg.meta.grant += 1;
                Ok(())
            })
            .await
            .unwrap();
        }
        tokio::time::timeout(WAIT, async {
            while h2.read().meta.grant != 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_undrained_consumer_stalls_reloads() {
        let backend = memory();
        let (h1, _c1) = open(&backend, "svc/stalled").await;
        let (h2, mut c2) = open(&backend, "svc/stalled").await;

        for _ in 0..5 {
            h1.atomic_update(|cfg| {
                cfg.meta.grant += 1;
                Ok(())
            })
            .await
            .unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        // One reload is waiting in the slot; the remaining wakes are held back.
        assert_eq!(h2.revision(), 1);
        assert_eq!(h2.read().meta.grant, 1);

        assert_eq!(next_event(&mut c2).await.into_result().unwrap(), 1);
        assert_eq!(next_event(&mut c2).await.into_result().unwrap(), 2);
        tokio::time::timeout(WAIT, async {
            while h2.read().meta.grant != 5 {
                c2.recv().await.unwrap().into_result().unwrap();
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_close_stops_listener() {
        let backend = memory();
        let (h, mut changes) = open(&backend, "svc/close").await;
        h.close().await;
        assert!(changes.recv().await.is_none());
    }
}
