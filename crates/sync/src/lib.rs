//! Synchronization engine for a shared, JSON-encoded configuration document.
//!
//! A [`ConfigHandle`] keeps a decoded snapshot of one document together with
//! a monotonic revision, reloads it whenever any process publishes a change on
//! the document's notification channel, and writes it back with optimistic
//! concurrency control.
//!
//! ```text
//! external write → Backend store + notify
//!     → listener wakes → reload (load, decode, swap)
//!     → snapshot + revision updated → ChangeEvent delivered
//! ```

pub mod codec;
pub mod handle;
pub mod listener;
mod reload;
mod save;
pub mod snapshot;

pub use codec::{Codec, JsonCodec};
pub use handle::ConfigHandle;
pub use listener::{ChangeEvent, Changes};
pub use reload::Reloaded;
pub use snapshot::{Snapshot, SnapshotStore, WriteGuard};
