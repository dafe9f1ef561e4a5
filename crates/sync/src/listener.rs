//! Background change listener.
//!
//! One task per handle waits on the document's wake stream, reloads on every
//! event and reports each attempt on a single-slot channel. The slot is
//! reserved before reloading, so at most one completed reload is waiting for
//! the consumer and a stalled consumer stalls further reloads (never writes).

use crate::{codec::Codec, handle::Shared};
use confdis_types::{ConfdisError, WakeStream};
use futures_util::StreamExt as _;
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};

/// One completed reload attempt, or the end of the subscription.
#[derive(Debug)]
pub enum ChangeEvent<T> {
    /// A new value was decoded and published.
    Reloaded { previous: Arc<T>, revision: u64 },
    /// The reload failed; the previous snapshot is still current.
    Failed(ConfdisError),
    /// The subscription failed or ended. No further events follow.
    Closed(ConfdisError),
}

impl<T> ChangeEvent<T> {
    /// The error carried by this event, if any.
    #[must_use]
    pub fn error(&self) -> Option<&ConfdisError> {
        match self {
            Self::Reloaded { .. } => None,
            Self::Failed(e) | Self::Closed(e) => Some(e),
        }
    }

    /// Returns `true` if the listener has stopped.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed(_))
    }

    /// Converts the event into the reloaded revision or its error.
    ///
    /// # Errors
    ///
    /// Returns the carried error for `Failed` and `Closed` events.
    pub fn into_result(self) -> confdis_types::Result<u64> {
        match self {
            Self::Reloaded { revision, .. } => Ok(revision),
            Self::Failed(e) | Self::Closed(e) => Err(e),
        }
    }
}

/// Receiving side of a handle's notification stream.
///
/// Holds at most one undelivered event. While that event is not received, the
/// listener does not reload again; wakes that arrive meanwhile are handled
/// once the slot frees up. Dropping the receiver detaches notifications
/// without stopping reloads.
pub type Changes<T> = mpsc::Receiver<ChangeEvent<T>>;

/// Capacity of the notification channel.
pub(crate) const CHANGES_CAPACITY: usize = 1;

pub(crate) fn spawn<T, C>(
    shared: Arc<Shared<T, C>>,
    mut wakes: WakeStream,
    tx: mpsc::Sender<ChangeEvent<T>>,
) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
    C: Codec<T> + 'static,
{
    tokio::spawn(async move {
        let reason = loop {
            match wakes.next().await {
                Some(Ok(event)) => {
                    if event.origin == shared.origin {
                        tracing::trace!(key = %shared.key, "skipping own change notification");
                        continue;
                    }
                    // Wait for the consumer before reloading, not after.
                    let permit = tx.reserve().await.ok();
                    let change = match shared.reload().await {
                        Ok(r) => ChangeEvent::Reloaded {
                            previous: r.previous,
                            revision: r.revision,
                        },
                        Err(e) => {
                            tracing::warn!(
                                key = %shared.key,
                                error = %e,
                                "reload failed, keeping current configuration"
                            );
                            ChangeEvent::Failed(e)
                        }
                    };
                    match permit {
                        Some(permit) => permit.send(change),
                        None => tracing::trace!("change notification dropped, no consumer"),
                    }
                }
                Some(Err(e)) => break e,
                None => {
                    break ConfdisError::Backend(format!(
                        "subscription to {} ended",
                        shared.channel
                    ));
                }
            }
        };
        tracing::error!(key = %shared.key, error = %reason, "change listener stopped");
        deliver(&tx, ChangeEvent::Closed(reason)).await;
    })
}

async fn deliver<T>(tx: &mpsc::Sender<ChangeEvent<T>>, event: ChangeEvent<T>) {
    // The consumer may already be gone.
    if tx.send(event).await.is_err() {
        tracing::trace!("change notification dropped, no consumer");
    }
}
