//! Durable event store over SQLite.
//!
//! Every statement binds values as parameters; SQL text is assembled only
//! from placeholder counts, never from event or filter strings.

use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use crate::event::{verify_event, Event, KindClass, Tag};
use crate::filter::Filter;

/// Bounded connection pool size.
const POOL_SIZE: u32 = 10;

/// Result of a store call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    Duplicate,
}

/// Transactional event store with supersession and tombstone semantics.
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
    max_limit: u64,
}

impl Repository {
    /// Open the database, creating the file when missing.
    pub async fn connect(database_url: &str, max_limit: u64) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .context("parsing database url")?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(POOL_SIZE)
            .connect_with(options)
            .await
            .context("opening database")?;
        Ok(Self { pool, max_limit })
    }

    /// Create tables and indexes idempotently.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                author_key TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                kind INTEGER NOT NULL,
                tags_json TEXT NOT NULL,
                content TEXT NOT NULL,
                sig TEXT NOT NULL,
                tombstoned INTEGER NOT NULL DEFAULT 0,
                inserted_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tags (
                row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                value TEXT NOT NULL,
                position INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS deletions (
                row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                target_event_id TEXT NOT NULL,
                deletion_event_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
                at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        for stmt in [
            "CREATE INDEX IF NOT EXISTS idx_events_author ON events(author_key)",
            "CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind)",
            "CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_events_author_kind ON events(author_key, kind)",
            "CREATE INDEX IF NOT EXISTS idx_events_live ON events(tombstoned) WHERE tombstoned = 0",
            "CREATE INDEX IF NOT EXISTS idx_tags_event ON tags(event_id)",
            "CREATE INDEX IF NOT EXISTS idx_tags_name_value ON tags(name, value)",
            "CREATE INDEX IF NOT EXISTS idx_deletions_target ON deletions(target_event_id)",
        ] {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        info!("database schema ready");
        Ok(())
    }

    /// Store an event atomically.
    ///
    /// Handles duplicate detection, replaceable-kind supersession, and
    /// kind-5 tombstoning in one transaction.
    pub async fn store(&self, ev: &Event) -> Result<StoreOutcome> {
        let mut tx = self.pool.begin().await?;

        let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE id = ?")
            .bind(&ev.id)
            .fetch_one(&mut *tx)
            .await?;
        if exists > 0 {
            tx.rollback().await?;
            return Ok(StoreOutcome::Duplicate);
        }

        // For replaceable kinds, settle the fight for the replacement key
        // inside the same transaction. The loser carries the tombstone.
        let mut insert_tombstoned = false;
        match ev.kind_class() {
            KindClass::Replaceable => {
                let rows = sqlx::query(
                    "SELECT id, created_at FROM events
                     WHERE author_key = ? AND kind = ? AND tombstoned = 0",
                )
                .bind(&ev.pubkey)
                .bind(ev.kind)
                .fetch_all(&mut *tx)
                .await?;
                insert_tombstoned = self.settle(&mut tx, ev, rows, None).await?;
            }
            KindClass::ParameterizedReplaceable => {
                let rows = sqlx::query(
                    "SELECT e.id, e.created_at,
                            COALESCE((SELECT value FROM tags
                                      WHERE event_id = e.id AND name = 'd'
                                      ORDER BY position LIMIT 1), '') AS d
                     FROM events e
                     WHERE e.author_key = ? AND e.kind = ? AND e.tombstoned = 0",
                )
                .bind(&ev.pubkey)
                .bind(ev.kind)
                .fetch_all(&mut *tx)
                .await?;
                insert_tombstoned = self
                    .settle(&mut tx, ev, rows, Some(ev.d_tag().to_string()))
                    .await?;
            }
            _ => {}
        }

        let now = unix_now();
        sqlx::query(
            "INSERT INTO events
                (id, author_key, created_at, kind, tags_json, content, sig, tombstoned, inserted_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&ev.id)
        .bind(&ev.pubkey)
        .bind(ev.created_at)
        .bind(ev.kind)
        .bind(serde_json::to_string(&ev.tags)?)
        .bind(&ev.content)
        .bind(&ev.sig)
        .bind(insert_tombstoned as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for (position, tag) in ev.tags.iter().enumerate() {
            let name = tag.name().unwrap_or("");
            let value = tag.value().unwrap_or("");
            sqlx::query(
                "INSERT INTO tags (event_id, name, value, position) VALUES (?, ?, ?, ?)",
            )
            .bind(&ev.id)
            .bind(name)
            .bind(value)
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }

        if ev.kind_class() == KindClass::Deletion {
            for target in ev.tag_values("e") {
                // only the author's own events may be tombstoned
                sqlx::query(
                    "UPDATE events SET tombstoned = 1 WHERE id = ? AND author_key = ?",
                )
                .bind(target)
                .bind(&ev.pubkey)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    "INSERT INTO deletions (target_event_id, deletion_event_id, at)
                     VALUES (?, ?, ?)",
                )
                .bind(target)
                .bind(&ev.id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        debug!(event_id = %ev.id, kind = ev.kind, "event stored");
        Ok(StoreOutcome::Stored)
    }

    /// Tombstone superseded rows; returns true when the new event loses.
    async fn settle(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        ev: &Event,
        rows: Vec<sqlx::sqlite::SqliteRow>,
        d_filter: Option<String>,
    ) -> Result<bool> {
        let mut new_loses = false;
        for row in rows {
            if let Some(d) = &d_filter {
                let row_d: String = row.get("d");
                if row_d != *d {
                    continue;
                }
            }
            let id: String = row.get("id");
            let created_at: i64 = row.get("created_at");
            if (created_at, id.as_str()) >= (ev.created_at, ev.id.as_str()) {
                new_loses = true;
            } else {
                sqlx::query("UPDATE events SET tombstoned = 1 WHERE id = ?")
                    .bind(&id)
                    .execute(&mut **tx)
                    .await?;
            }
        }
        Ok(new_loses)
    }

    /// Historical query: non-tombstoned matches, newest first, capped.
    pub async fn query(&self, filter: &Filter) -> Result<Vec<Event>> {
        let mut sql = String::from(
            "SELECT id, author_key, created_at, kind, tags_json, content, sig
             FROM events WHERE tombstoned = 0",
        );
        if let Some(ids) = &filter.ids {
            sql.push_str(&format!(" AND id IN ({})", placeholders(ids.len())));
        }
        if let Some(authors) = &filter.authors {
            sql.push_str(&format!(
                " AND author_key IN ({})",
                placeholders(authors.len())
            ));
        }
        if let Some(kinds) = &filter.kinds {
            sql.push_str(&format!(" AND kind IN ({})", placeholders(kinds.len())));
        }
        if filter.since.is_some() {
            sql.push_str(" AND created_at >= ?");
        }
        if filter.until.is_some() {
            sql.push_str(" AND created_at <= ?");
        }
        if let Some(es) = &filter.e_tags {
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM tags WHERE tags.event_id = events.id
                              AND tags.name = 'e' AND tags.value IN ({}))",
                placeholders(es.len())
            ));
        }
        if let Some(ps) = &filter.p_tags {
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM tags WHERE tags.event_id = events.id
                              AND tags.name = 'p' AND tags.value IN ({}))",
                placeholders(ps.len())
            ));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");

        let limit = filter.limit.unwrap_or(self.max_limit).min(self.max_limit);

        let mut q = sqlx::query(&sql);
        if let Some(ids) = &filter.ids {
            for id in ids {
                q = q.bind(id);
            }
        }
        if let Some(authors) = &filter.authors {
            for a in authors {
                q = q.bind(a);
            }
        }
        if let Some(kinds) = &filter.kinds {
            for k in kinds {
                q = q.bind(k);
            }
        }
        if let Some(since) = filter.since {
            q = q.bind(since);
        }
        if let Some(until) = filter.until {
            q = q.bind(until);
        }
        if let Some(es) = &filter.e_tags {
            for e in es {
                q = q.bind(e);
            }
        }
        if let Some(ps) = &filter.p_tags {
            for p in ps {
                q = q.bind(p);
            }
        }
        q = q.bind(limit as i64);

        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_event).collect()
    }

    /// Re-verify the hash and signature of up to `sample` stored events.
    ///
    /// Administrative integrity check; returns the number verified and
    /// fails on the first corrupt row.
    pub async fn verify_sample(&self, sample: usize) -> Result<usize> {
        let rows = sqlx::query(
            "SELECT id, author_key, created_at, kind, tags_json, content, sig
             FROM events WHERE tombstoned = 0 ORDER BY RANDOM() LIMIT ?",
        )
        .bind(sample as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut verified = 0;
        for row in rows {
            let ev = row_to_event(row)?;
            verify_event(&ev).with_context(|| format!("event {}", ev.id))?;
            verified += 1;
        }
        Ok(verified)
    }

    /// Wipe every table. Administrative; never exposed on the wire.
    pub async fn delete_all(&self) -> Result<()> {
        sqlx::query("DELETE FROM events").execute(&self.pool).await?;
        Ok(())
    }

    /// Test support: true when a live (non-tombstoned) row exists for the id.
    #[cfg(test)]
    pub async fn has_live_event(&self, id: &str) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE id = ? AND tombstoned = 0")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    /// Total rows, tombstoned included. Used by health reporting and tests.
    pub async fn event_rows(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?)
    }
}

/// A comma-separated run of `?` placeholders.
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Rebuild an event from its row, tags included.
fn row_to_event(row: sqlx::sqlite::SqliteRow) -> Result<Event> {
    let tags_json: String = row.get("tags_json");
    let tags: Vec<Tag> = serde_json::from_str(&tags_json)?;
    Ok(Event {
        id: row.get("id"),
        pubkey: row.get("author_key"),
        created_at: row.get("created_at"),
        kind: row.get("kind"),
        tags,
        content: row.get("content"),
        sig: row.get("sig"),
    })
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
