use anyhow::{Context as _, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use confdis_config::{LogFormat, Settings};
use confdis_sync::{ChangeEvent, ConfigHandle};
use confdis_types::{Backend, EditError, changes_channel};
use serde_json::Value;
use std::{path::PathBuf, sync::Arc, time::Instant};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _};

#[derive(Parser, Debug)]
#[command(name = "confdis", about = "confdis: shared JSON configuration over a key-value store")]
struct Cli {
    /// Path to the YAML settings file.
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,
    /// Backend URL (default: sqlite://~/.confdis/confdis.db).
    #[arg(short, long, value_name = "URL", global = true)]
    backend: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print a stored document.
    Get {
        /// Document key.
        key: String,
    },
    /// Replace a document and notify its subscribers.
    Set {
        /// Document key.
        key: String,
        /// JSON document.
        json: String,
    },
    /// Replace the value at a JSON pointer with an optimistic write.
    Patch {
        /// Document key.
        key: String,
        /// JSON pointer (`""` for the whole document, `/meta/grant` for a field).
        pointer: String,
        /// New JSON value.
        json: String,
    },
    /// Print a document and every change to it until interrupted.
    Watch {
        /// Document key.
        key: String,
    },
    /// List stored document keys.
    List,
    /// Copy documents into another backend.
    Copy {
        /// Destination backend URL.
        #[arg(long, value_name = "URL")]
        to: String,
        /// Repeat the copy this many times, reporting each pass's duration.
        #[arg(long, default_value_t = 1)]
        repeat: u32,
        /// Keys to copy (default: all).
        keys: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())
        .map_err(|e| anyhow::anyhow!("settings error: {e}"))?;
    if let Some(url) = cli.backend {
        settings.backend = Some(url);
    }
    let _log_guard = init_logging(&settings)?;

    let backend = open_backend(&settings, &settings.backend_url()).await?;
    match cli.command {
        Commands::Get { key } => cmd_get(&*backend, &key).await,
        Commands::Set { key, json } => cmd_set(&*backend, &key, &json).await,
        Commands::Patch { key, pointer, json } => cmd_patch(backend, key, pointer, &json).await,
        Commands::Watch { key } => cmd_watch(backend, key).await,
        Commands::List => cmd_list(&*backend).await,
        Commands::Copy { to, repeat, keys } => {
            let target = open_backend(&settings, &to).await?;
            cmd_copy(&*backend, &*target, keys, repeat).await
        }
    }
}

/// Installs the tracing subscriber; the returned guard flushes the log file.
fn init_logging(
    settings: &Settings,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log.level));

    let (file_layer, guard) = match &settings.log.file {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "confdis.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    match settings.log.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?,
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()?,
    }
    Ok(guard)
}

async fn open_backend(settings: &Settings, url: &str) -> Result<Arc<dyn Backend>> {
    if let Some(path) = url.strip_prefix("sqlite://")
        && let Some(parent) = PathBuf::from(path).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    confdis_store::connect(url, settings.poll_interval())
        .await
        .map_err(|e| anyhow::anyhow!("cannot open backend {url}: {e}"))
}

/// Marker published with notifications sent by this tool.
fn cli_origin() -> String {
    format!("confdis-cli-{}", std::process::id())
}

async fn cmd_get(backend: &dyn Backend, key: &str) -> Result<()> {
    let payload = backend
        .load(key)
        .await?
        .ok_or_else(|| anyhow::anyhow!("{key}: not found"))?;
    let doc: Value = serde_json::from_slice(&payload)
        .with_context(|| format!("{key}: stored value is not JSON"))?;
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

async fn cmd_set(backend: &dyn Backend, key: &str, json: &str) -> Result<()> {
    let doc: Value = serde_json::from_str(json).context("invalid JSON document")?;
    backend
        .store(key, Bytes::from(serde_json::to_vec(&doc)?))
        .await?;
    if let Err(e) = backend.notify(&changes_channel(key), &cli_origin()).await {
        tracing::warn!(key, error = %e, "change notification failed");
    }
    tracing::info!(key, "document stored");
    Ok(())
}

async fn cmd_patch(
    backend: Arc<dyn Backend>,
    key: String,
    pointer: String,
    json: &str,
) -> Result<()> {
    let replacement: Value = serde_json::from_str(json).context("invalid JSON value")?;
    let (handle, _changes) = ConfigHandle::<Value>::open(backend, key).await?;
    let revision = handle
        .atomic_update(|doc| {
            let slot = doc
                .pointer_mut(&pointer)
                .ok_or_else(|| EditError::from(format!("no value at pointer {pointer:?}")))?;
            *slot = replacement;
            Ok(())
        })
        .await?;
    tracing::info!(key = handle.key(), revision, "document patched");
    println!("{}", serde_json::to_string_pretty(&*handle.read())?);
    handle.close().await;
    Ok(())
}

async fn cmd_watch(backend: Arc<dyn Backend>, key: String) -> Result<()> {
    let (handle, mut changes) = ConfigHandle::<Value>::open(backend, key).await?;
    println!("{}", serde_json::to_string_pretty(&*handle.read())?);

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break Ok(()),
            event = changes.recv() => match event {
                Some(ChangeEvent::Reloaded { revision, .. }) => {
                    tracing::info!(key = handle.key(), revision, "document changed");
                    println!("{}", serde_json::to_string_pretty(&*handle.read())?);
                }
                Some(ChangeEvent::Failed(e)) => {
                    tracing::warn!(key = handle.key(), error = %e, "reload failed");
                }
                Some(ChangeEvent::Closed(e)) => break Err(e.into()),
                None => break Ok(()),
            },
        }
    };
    handle.close().await;
    outcome
}

async fn cmd_list(backend: &dyn Backend) -> Result<()> {
    for key in backend.list().await? {
        println!("{key}");
    }
    Ok(())
}

async fn cmd_copy(
    source: &dyn Backend,
    target: &dyn Backend,
    keys: Vec<String>,
    repeat: u32,
) -> Result<()> {
    let keys = if keys.is_empty() { source.list().await? } else { keys };

    let mut documents = Vec::with_capacity(keys.len());
    for key in keys {
        tracing::info!(key = %key, "reading document");
        let payload = source
            .load(&key)
            .await?
            .ok_or_else(|| anyhow::anyhow!("{key}: not found in source"))?;
        documents.push((key, payload));
    }

    for attempt in 1..=repeat.max(1) {
        let started = Instant::now();
        for (key, payload) in &documents {
            target.store(key, payload.clone()).await?;
        }
        tracing::info!(
            attempt,
            documents = documents.len(),
            elapsed = ?started.elapsed(),
            "copy pass complete"
        );
    }
    Ok(())
}
