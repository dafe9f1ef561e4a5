use crate::{codec::Codec, handle::Shared};
use confdis_types::{ConfdisError, Result};
use std::sync::Arc;

/// Outcome of a successful reload.
#[derive(Debug)]
pub struct Reloaded<T> {
    /// The snapshot value that was replaced, for diffing.
    pub previous: Arc<T>,
    /// The revision the freshly decoded value was published under.
    pub revision: u64,
}

impl<T, C> Shared<T, C>
where
    C: Codec<T>,
{
    /// Fetches the document, decodes it into a fresh value and swaps it in.
    ///
    /// A missing document yields [`ConfdisError::NotFound`]; a decode failure
    /// yields [`ConfdisError::Serialization`]. Neither touches the snapshot.
    pub(crate) async fn reload(&self) -> Result<Reloaded<T>> {
        let payload = self
            .backend
            .load(&self.key)
            .await?
            .ok_or_else(|| ConfdisError::NotFound {
                key: self.key.clone(),
            })?;
        let value = self.codec.decode(&payload)?;
        let (previous, revision) = self.store.swap(value).await;
        tracing::debug!(key = %self.key, revision, "configuration reloaded");
        Ok(Reloaded { previous, revision })
    }
}
