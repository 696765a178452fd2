//! SQLite-backed message cache.
//!
//! Summaries and content live in separate tables, both keyed by
//! `(account_id, uid)`. Merging new summaries is a conflict-ignoring
//! insert, which makes the merge idempotent by construction.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use tracing::debug;

use crate::account::AccountId;
use crate::model::{AttachmentMeta, MessageContent, MessageSummary};
use crate::{Error, Result};

/// Message cache repository over a SQLite pool.
pub struct CacheStore {
    pool: SqlitePool,
}

impl CacheStore {
    /// Opens (creating if needed) the cache database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn open(path: &str) -> Result<Self> {
        let url = format!("sqlite:{path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Opens an in-memory cache, for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Closes the pool. Every operation afterwards fails.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS message_summaries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                uid INTEGER NOT NULL,
                from_name TEXT,
                from_address TEXT NOT NULL DEFAULT '',
                to_addresses TEXT NOT NULL DEFAULT '',
                subject TEXT NOT NULL DEFAULT '',
                date TEXT NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0,
                has_attachments INTEGER NOT NULL DEFAULT 0,
                preview_text TEXT NOT NULL DEFAULT '',
                size_bytes INTEGER NOT NULL DEFAULT 0,
                message_id TEXT,
                cached_at TEXT NOT NULL,
                UNIQUE(account_id, uid)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS message_content (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                uid INTEGER NOT NULL,
                text_body TEXT NOT NULL DEFAULT '',
                html_body TEXT,
                attachments_json TEXT NOT NULL DEFAULT '[]',
                cached_at TEXT NOT NULL,
                UNIQUE(account_id, uid)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_summaries_account_uid
            ON message_summaries(account_id, uid DESC)
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// All cached summaries for an account, UID descending.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_all(&self, account_id: &AccountId) -> Result<Vec<MessageSummary>> {
        let rows = sqlx::query(
            r"
            SELECT account_id, uid, from_name, from_address, to_addresses, subject,
                   date, is_read, has_attachments, preview_text, size_bytes, message_id
            FROM message_summaries
            WHERE account_id = ?
            ORDER BY uid DESC
            ",
        )
        .bind(account_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(summary_from_row).collect())
    }

    /// Inserts only summaries whose `(account_id, uid)` is not yet cached,
    /// returning how many were actually inserted.
    ///
    /// Re-merging the same batch inserts nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if an insert fails.
    pub async fn merge_new(
        &self,
        account_id: &AccountId,
        summaries: &[MessageSummary],
    ) -> Result<usize> {
        let mut inserted = 0usize;
        for summary in summaries {
            let result = sqlx::query(
                r"
                INSERT INTO message_summaries
                    (account_id, uid, from_name, from_address, to_addresses, subject,
                     date, is_read, has_attachments, preview_text, size_bytes,
                     message_id, cached_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(account_id, uid) DO NOTHING
                ",
            )
            .bind(account_id.as_str())
            .bind(summary.uid)
            .bind(&summary.from_name)
            .bind(&summary.from_address)
            .bind(&summary.to)
            .bind(&summary.subject)
            .bind(summary.date.to_rfc3339())
            .bind(summary.is_read)
            .bind(summary.has_attachments)
            .bind(&summary.preview_text)
            .bind(summary.size_bytes)
            .bind(&summary.message_id)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
            inserted += usize::try_from(result.rows_affected()).unwrap_or(0);
        }
        debug!(account = %account_id, offered = summaries.len(), inserted, "merged summaries");
        Ok(inserted)
    }

    /// Cached content for one message, when present.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the stored attachment JSON
    /// is corrupt.
    pub async fn get_content(
        &self,
        account_id: &AccountId,
        uid: u32,
    ) -> Result<Option<MessageContent>> {
        let Some(summary) = self.get_summary(account_id, uid).await? else {
            return Ok(None);
        };

        let row = sqlx::query(
            r"
            SELECT text_body, html_body, attachments_json
            FROM message_content
            WHERE account_id = ? AND uid = ?
            ",
        )
        .bind(account_id.as_str())
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let attachments: Vec<AttachmentMeta> =
            serde_json::from_str(row.get::<&str, _>("attachments_json"))?;
        Ok(Some(MessageContent {
            summary,
            text_body: row.get("text_body"),
            html_body: row.get("html_body"),
            attachments,
        }))
    }

    /// Stores (or replaces) the content of one message, inserting its
    /// summary row if the header pass never saw it, and refreshes the
    /// summary's preview text from the body.
    ///
    /// # Errors
    ///
    /// Returns an error if a write fails.
    pub async fn upsert_content(&self, content: &MessageContent) -> Result<()> {
        let account_id = &content.summary.account_id;
        self.merge_new(account_id, std::slice::from_ref(&content.summary))
            .await?;

        let attachments_json = serde_json::to_string(&content.attachments)?;
        sqlx::query(
            r"
            INSERT INTO message_content
                (account_id, uid, text_body, html_body, attachments_json, cached_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(account_id, uid) DO UPDATE SET
                text_body = excluded.text_body,
                html_body = excluded.html_body,
                attachments_json = excluded.attachments_json,
                cached_at = excluded.cached_at
            ",
        )
        .bind(account_id.as_str())
        .bind(content.summary.uid)
        .bind(&content.text_body)
        .bind(&content.html_body)
        .bind(&attachments_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        let preview = preview_of(&content.text_body);
        sqlx::query(
            "UPDATE message_summaries SET preview_text = ? WHERE account_id = ? AND uid = ?",
        )
        .bind(&preview)
        .bind(account_id.as_str())
        .bind(content.summary.uid)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Sets the read flag on a cached summary.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` when the message is not cached.
    pub async fn set_read_flag(&self, account_id: &AccountId, uid: u32, read: bool) -> Result<()> {
        let result = sqlx::query(
            "UPDATE message_summaries SET is_read = ? WHERE account_id = ? AND uid = ?",
        )
        .bind(read)
        .bind(account_id.as_str())
        .bind(uid)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("uid {uid} not cached")));
        }
        Ok(())
    }

    /// Corrects the attachment flag on a cached summary.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_has_attachments(
        &self,
        account_id: &AccountId,
        uid: u32,
        has_attachments: bool,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE message_summaries SET has_attachments = ? WHERE account_id = ? AND uid = ?",
        )
        .bind(has_attachments)
        .bind(account_id.as_str())
        .bind(uid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Removes one message (summary and content).
    ///
    /// # Errors
    ///
    /// Returns an error if a delete fails.
    pub async fn remove(&self, account_id: &AccountId, uid: u32) -> Result<()> {
        sqlx::query("DELETE FROM message_summaries WHERE account_id = ? AND uid = ?")
            .bind(account_id.as_str())
            .bind(uid)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM message_content WHERE account_id = ? AND uid = ?")
            .bind(account_id.as_str())
            .bind(uid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drops everything cached for an account.
    ///
    /// # Errors
    ///
    /// Returns an error if a delete fails.
    pub async fn clear_account(&self, account_id: &AccountId) -> Result<()> {
        sqlx::query("DELETE FROM message_summaries WHERE account_id = ?")
            .bind(account_id.as_str())
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM message_content WHERE account_id = ?")
            .bind(account_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Highest cached UID for an account, `None` on a cold cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn max_uid(&self, account_id: &AccountId) -> Result<Option<u32>> {
        let row = sqlx::query("SELECT MAX(uid) AS max_uid FROM message_summaries WHERE account_id = ?")
            .bind(account_id.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<Option<u32>, _>("max_uid"))
    }

    /// Case-insensitive substring search over subject, sender, and
    /// preview, newest date first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn search(&self, account_id: &AccountId, query: &str) -> Result<Vec<MessageSummary>> {
        let pattern = format!("%{query}%");
        let rows = sqlx::query(
            r"
            SELECT account_id, uid, from_name, from_address, to_addresses, subject,
                   date, is_read, has_attachments, preview_text, size_bytes, message_id
            FROM message_summaries
            WHERE account_id = ?
              AND (subject LIKE ? OR from_name LIKE ? OR from_address LIKE ?
                   OR preview_text LIKE ?)
            ORDER BY date DESC
            ",
        )
        .bind(account_id.as_str())
        .bind(&pattern)
        .bind(&pattern)
        .bind(&pattern)
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(summary_from_row).collect())
    }

    /// Number of cached summaries for an account.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn count(&self, account_id: &AccountId) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM message_summaries WHERE account_id = ?")
            .bind(account_id.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n").unsigned_abs())
    }

    async fn get_summary(
        &self,
        account_id: &AccountId,
        uid: u32,
    ) -> Result<Option<MessageSummary>> {
        let row = sqlx::query(
            r"
            SELECT account_id, uid, from_name, from_address, to_addresses, subject,
                   date, is_read, has_attachments, preview_text, size_bytes, message_id
            FROM message_summaries
            WHERE account_id = ? AND uid = ?
            ",
        )
        .bind(account_id.as_str())
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(summary_from_row))
    }
}

fn summary_from_row(row: &SqliteRow) -> MessageSummary {
    let date: String = row.get("date");
    let date = DateTime::parse_from_rfc3339(&date)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    MessageSummary {
        account_id: AccountId::new(row.get::<String, _>("account_id")),
        uid: row.get("uid"),
        from_name: row.get("from_name"),
        from_address: row.get("from_address"),
        to: row.get("to_addresses"),
        subject: row.get("subject"),
        date,
        is_read: row.get("is_read"),
        has_attachments: row.get("has_attachments"),
        preview_text: row.get("preview_text"),
        size_bytes: row.get("size_bytes"),
        message_id: row.get("message_id"),
    }
}

/// First 120 characters of the body, newlines collapsed.
fn preview_of(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(120)
        .collect()
}
