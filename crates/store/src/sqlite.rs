//! SQLite-backed document store using sqlx.
//!
//! Schema:
//! - `documents(key, payload, updated_at)` with `key` as primary key.
//! - `notifications(seq, channel, origin, created_at)`, an append-only log.
//!
//! Subscribers poll the notification log for rows past their cursor, so any
//! process opening the same database file sees every other process's writes.

use async_trait::async_trait;
use bytes::Bytes;
use confdis_types::{Backend, Result, WakeEvent, WakeStream};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{collections::VecDeque, str::FromStr, time::Duration};
use tokio::time::{Interval, MissedTickBehavior};

/// Default delay between two polls of the notification log.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Shortest accepted poll interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Notifications older than this are pruned on the next publish.
const NOTIFICATION_RETENTION_SECS: i64 = 3600;

/// A persistent [`Backend`] backed by `SQLite`.
pub struct SqliteBackend {
    /// Connection pool to the `SQLite` database.
    pool: SqlitePool,
    /// How often subscribers poll for new notifications.
    poll_interval: Duration,
}

impl SqliteBackend {
    /// Connects to a `SQLite` database (e.g. `"sqlite:./confdis.db"`).
    ///
    /// Automatically creates the database file if it does not exist and
    /// creates the schema.
    ///
    /// # Errors
    ///
    /// Returns a [`sqlx::Error`] if the connection or table creation fails.
    pub async fn new(database_url: &str) -> std::result::Result<Self, sqlx::Error> {
        let opts = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self {
            pool,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Overrides the subscriber poll interval, raised to at least
    /// [`MIN_POLL_INTERVAL`].
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        self
    }

    async fn migrate(pool: &SqlitePool) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (
                key         TEXT    PRIMARY KEY NOT NULL,
                payload     BLOB    NOT NULL,
                updated_at  INTEGER NOT NULL DEFAULT (unixepoch())
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS notifications (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                channel     TEXT    NOT NULL,
                origin      TEXT    NOT NULL,
                created_at  INTEGER NOT NULL DEFAULT (unixepoch())
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_notifications_channel
             ON notifications(channel, seq)",
        )
        .execute(pool)
        .await?;

        Ok(())
    }
}

/// Polling state of one subscription.
struct Subscription {
    pool: SqlitePool,
    channel: String,
    /// Highest `seq` already delivered.
    cursor: i64,
    pending: VecDeque<WakeEvent>,
    ticker: Interval,
    failed: bool,
}

impl Subscription {
    async fn poll(&mut self) -> Result<()> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT seq, origin FROM notifications
             WHERE channel = ? AND seq > ? ORDER BY seq",
        )
        .bind(&self.channel)
        .bind(self.cursor)
        .fetch_all(&self.pool)
        .await?;

        for (seq, origin) in rows {
            self.cursor = seq;
            self.pending.push_back(WakeEvent { origin });
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn load(&self, key: &str) -> Result<Option<Bytes>> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT payload FROM documents WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(payload,)| Bytes::from(payload)))
    }

    async fn store(&self, key: &str, payload: Bytes) -> Result<()> {
        sqlx::query(
            "INSERT INTO documents (key, payload) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET
                 payload = excluded.payload,
                 updated_at = unixepoch()",
        )
        .bind(key)
        .bind(payload.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn notify(&self, channel: &str, origin: &str) -> Result<()> {
        sqlx::query("INSERT INTO notifications (channel, origin) VALUES (?, ?)")
            .bind(channel)
            .bind(origin)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM notifications WHERE created_at < unixepoch() - ?")
            .bind(NOTIFICATION_RETENTION_SECS)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<WakeStream> {
        let cursor: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM notifications WHERE channel = ?")
                .bind(channel)
                .fetch_one(&self.pool)
                .await?;

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(channel, cursor, "sqlite subscription started");

        let state = Subscription {
            pool: self.pool.clone(),
            channel: channel.to_string(),
            cursor,
            pending: VecDeque::new(),
            ticker,
            failed: false,
        };

        let stream = futures_util::stream::unfold(state, |mut s| async move {
            if s.failed {
                return None;
            }
            loop {
                if let Some(event) = s.pending.pop_front() {
                    return Some((Ok(event), s));
                }
                s.ticker.tick().await;
                if let Err(e) = s.poll().await {
                    s.failed = true;
                    return Some((Err(e), s));
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn list(&self) -> Result<Vec<String>> {
        let keys: Vec<(String,)> = sqlx::query_as("SELECT key FROM documents ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        Ok(keys.into_iter().map(|(key,)| key).collect())
    }
}
