//! Core types and traits for the confdis workspace.
//!
//! This crate defines the shared abstractions used by every layer: the error
//! taxonomy, the [`Backend`] gateway trait that concrete stores implement, and
//! the wake events that travel over a document's notification channel.

pub mod backend;
pub mod error;

pub use backend::{Backend, CHANGES_SUFFIX, WakeEvent, WakeStream, changes_channel};
pub use error::{ConfdisError, EditError, Result};
