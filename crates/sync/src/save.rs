use crate::{codec::Codec, handle::Shared};
use confdis_types::{ConfdisError, EditError, Result};
use std::future::Future;

impl<T, C> Shared<T, C>
where
    T: Clone,
    C: Codec<T>,
{
    /// Capture, edit unlocked, then validate-and-commit under the write lock.
    pub(crate) async fn atomic_save<F, Fut>(&self, edit: F) -> Result<u64>
    where
        F: FnOnce(T) -> Fut,
        Fut: Future<Output = std::result::Result<T, EditError>>,
    {
        let captured = self.store.snapshot();
        let base = captured.revision();
        let draft = T::clone(captured.value());
        drop(captured);

        let edited = edit(draft).await.map_err(ConfdisError::Edit)?;

        let mut guard = self.store.lock().await;
        let live = guard.revision();
        if live != base {
            tracing::debug!(
                key = %self.key,
                expected = base,
                actual = live,
                "atomic save conflict"
            );
            return Err(ConfdisError::Conflict {
                expected: base,
                actual: live,
            });
        }

        let payload = self.codec.encode(&edited)?;
        self.backend.store(&self.key, payload).await?;
        // The write already landed; a lost wake-up only delays other readers.
        if let Err(e) = self.backend.notify(&self.channel, &self.origin).await {
            tracing::warn!(key = %self.key, error = %e, "change notification failed");
        }
        let (_, revision) = guard.swap(edited);
        tracing::debug!(key = %self.key, revision, "atomic save committed");
        Ok(revision)
    }
}
