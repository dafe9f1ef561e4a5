//! Settings for the `confdis` command-line tool.
//!
//! Uses figment: built-in defaults, then an optional YAML file, then
//! `CONFDIS_*` environment variables (`CONFDIS_LOG__LEVEL=debug`).

pub mod schema;

pub use schema::{LogConfig, LogFormat, Settings};
