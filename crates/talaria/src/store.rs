//! Durable storage: scheduler state, commit history, probe cache.
//!
//! One SQLite file holds three tables. A connection is opened fresh per
//! operation and all writes are serialized behind a single mutex; the scan
//! loop is the only writer of `state` and `commits`, so coarse locking is
//! adequate. Timestamps live in ordered `INTEGER` epoch-millisecond columns,
//! with the full [`CommitInfo`] serialized alongside as JSON.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::types::CommitInfo;

const NEXT_RUN_KEY: &str = "next_run";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS commits (
    commit_hash TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    commit_timestamp INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS skopeo_cache (
    command_hash TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
";

/// Handle to the durable store. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl Store {
    /// Open (creating if necessary) the store at `path` and ensure the
    /// schema exists.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create store directory {}", parent.display())
                })?;
            }
        }
        let store = Self {
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
        };
        store
            .conn()?
            .execute_batch(SCHEMA)
            .context("failed to initialize store schema")?;
        Ok(store)
    }

    fn conn(&self) -> Result<Connection> {
        Connection::open(&self.path)
            .with_context(|| format!("failed to open store {}", self.path.display()))
    }

    fn write_guard(&self) -> std::sync::MutexGuard<'_, ()> {
        // A poisoned lock only means a writer panicked; the store itself is
        // still consistent because every write is a single statement.
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- scheduler state ---

    pub fn next_run_at(&self) -> Result<Option<DateTime<Utc>>> {
        let value: Option<String> = self
            .conn()?
            .query_row(
                "SELECT value FROM state WHERE key = ?1",
                params![NEXT_RUN_KEY],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read next_run")?;
        value
            .map(|v| {
                let millis: i64 = v
                    .parse()
                    .map_err(|_| anyhow!("corrupt next_run value {v:?}"))?;
                from_millis(millis)
            })
            .transpose()
    }

    pub fn set_next_run_at(&self, at: Option<DateTime<Utc>>) -> Result<()> {
        let _guard = self.write_guard();
        let conn = self.conn()?;
        match at {
            None => {
                conn.execute("DELETE FROM state WHERE key = ?1", params![NEXT_RUN_KEY])
                    .context("failed to clear next_run")?;
            }
            Some(at) => {
                conn.execute(
                    "REPLACE INTO state (key, value) VALUES (?1, ?2)",
                    params![NEXT_RUN_KEY, at.timestamp_millis().to_string()],
                )
                .context("failed to write next_run")?;
            }
        }
        Ok(())
    }

    // --- commit history ---

    pub fn get_commit(&self, commit_hash: &str) -> Result<Option<CommitInfo>> {
        let data: Option<String> = self
            .conn()?
            .query_row(
                "SELECT data FROM commits WHERE commit_hash = ?1",
                params![commit_hash],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read commit")?;
        data.map(|d| serde_json::from_str(&d).context("corrupt commit record"))
            .transpose()
    }

    pub fn put_commit(&self, info: &CommitInfo) -> Result<()> {
        let data = serde_json::to_string(info).context("failed to serialize commit record")?;
        let _guard = self.write_guard();
        self.conn()?
            .execute(
                "REPLACE INTO commits (commit_hash, data, commit_timestamp) VALUES (?1, ?2, ?3)",
                params![
                    info.commit_hash,
                    data,
                    info.commit_timestamp.timestamp_millis()
                ],
            )
            .context("failed to write commit record")?;
        Ok(())
    }

    pub fn delete_commit(&self, commit_hash: &str) -> Result<()> {
        let _guard = self.write_guard();
        self.conn()?
            .execute(
                "DELETE FROM commits WHERE commit_hash = ?1",
                params![commit_hash],
            )
            .context("failed to delete commit record")?;
        Ok(())
    }

    /// Page through commit history, newest first. Ties on timestamp are
    /// broken by hash so the order is deterministic. `page` starts at 1;
    /// `per_page` is clamped to `[1, 100]`. Returns the rows and the total
    /// count.
    pub fn list_commits(&self, page: u64, per_page: u64) -> Result<(Vec<CommitInfo>, u64)> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, 100);
        let conn = self.conn()?;

        let total: i64 = conn
            .query_row("SELECT COUNT(*) FROM commits", [], |row| row.get(0))
            .context("failed to count commits")?;

        let mut statement = conn
            .prepare(
                "SELECT data FROM commits
                 ORDER BY commit_timestamp DESC, commit_hash ASC
                 LIMIT ?1 OFFSET ?2",
            )
            .context("failed to prepare commit listing")?;
        let rows = statement
            .query_map(
                params![per_page as i64, ((page - 1) * per_page) as i64],
                |row| row.get::<_, String>(0),
            )
            .context("failed to list commits")?;

        let mut commits = Vec::new();
        for row in rows {
            let data = row.context("failed to read commit row")?;
            commits.push(serde_json::from_str(&data).context("corrupt commit record")?);
        }
        Ok((commits, total as u64))
    }

    // --- probe cache ---

    /// Fetch a cached probe payload. Entries that are expired, or whose
    /// expiration exceeds `now + max_duration` (the configured duration was
    /// shortened since the entry was written), are deleted on read.
    pub fn cache_get(&self, command_hash: &str, max_duration: Duration) -> Result<Option<String>> {
        let row: Option<(String, i64)> = self
            .conn()?
            .query_row(
                "SELECT payload, expires_at FROM skopeo_cache WHERE command_hash = ?1",
                params![command_hash],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("failed to read cache entry")?;

        let Some((payload, expires_at)) = row else {
            return Ok(None);
        };
        let now = Utc::now();
        let ceiling = now
            + chrono::Duration::from_std(max_duration).context("cache duration out of range")?;
        let expires_at = from_millis(expires_at)?;
        if expires_at <= now || expires_at > ceiling {
            self.cache_delete(command_hash)?;
            return Ok(None);
        }
        Ok(Some(payload))
    }

    pub fn cache_set(
        &self,
        command_hash: &str,
        payload: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let _guard = self.write_guard();
        self.conn()?
            .execute(
                "REPLACE INTO skopeo_cache (command_hash, payload, expires_at) VALUES (?1, ?2, ?3)",
                params![command_hash, payload, expires_at.timestamp_millis()],
            )
            .context("failed to write cache entry")?;
        Ok(())
    }

    pub fn cache_delete(&self, command_hash: &str) -> Result<()> {
        let _guard = self.write_guard();
        self.conn()?
            .execute(
                "DELETE FROM skopeo_cache WHERE command_hash = ?1",
                params![command_hash],
            )
            .context("failed to delete cache entry")?;
        Ok(())
    }

    /// Drop every expired cache entry; returns how many were removed.
    pub fn cleanup_expired_cache(&self) -> Result<u64> {
        let _guard = self.write_guard();
        let removed = self
            .conn()?
            .execute(
                "DELETE FROM skopeo_cache WHERE expires_at <= ?1",
                params![Utc::now().timestamp_millis()],
            )
            .context("failed to clean up cache")?;
        Ok(removed as u64)
    }
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| anyhow!("timestamp {millis} out of range"))
}
