//! SQLite persistence for upload sessions, chunk receipts and stored images.

use crate::models::{
    image::{ImageRow, ImageVariant, UploadedImage},
    session::{ChunkReceipt, SessionState, UploadSession},
};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

const SESSION_COLUMNS: &str = "id, file_name, declared_size, total_chunks, content_type, state, \
     image_id, error, created_at, updated_at";

/// Declared shape of a chunked upload, taken from a chunk request.
#[derive(Debug, Clone)]
pub struct NewSession<'a> {
    pub id: &'a str,
    pub file_name: &'a str,
    pub declared_size: i64,
    pub total_chunks: u32,
    pub content_type: Option<&'a str>,
}

#[derive(Clone)]
pub struct SessionStore {
    db: Arc<SqlitePool>,
}

impl SessionStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn get(&self, id: &str) -> Result<Option<UploadSession>, sqlx::Error> {
        sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {} FROM upload_sessions WHERE id = ?",
            SESSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await
    }

    /// Insert a fresh session, or reset an existing one to `receiving` and
    /// drop its old receipts.
    pub async fn start(&self, new: NewSession<'_>) -> Result<UploadSession, sqlx::Error> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        sqlx::query("DELETE FROM upload_chunks WHERE session_id = ?")
            .bind(new.id)
            .execute(&mut *tx)
            .await?;

        let session = sqlx::query_as::<_, UploadSession>(&format!(
            r#"
            INSERT INTO upload_sessions (
                id, file_name, declared_size, total_chunks, content_type, state,
                image_id, error, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, NULL, NULL, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                file_name = excluded.file_name,
                declared_size = excluded.declared_size,
                total_chunks = excluded.total_chunks,
                content_type = excluded.content_type,
                state = excluded.state,
                image_id = NULL,
                error = NULL,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at
            RETURNING {}
            "#,
            SESSION_COLUMNS
        ))
        .bind(new.id)
        .bind(new.file_name)
        .bind(new.declared_size)
        .bind(new.total_chunks)
        .bind(new.content_type)
        .bind(SessionState::Receiving)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(session)
    }

    /// Upsert the receipt of a stored chunk and touch the session.
    ///
    /// Returns false, recording nothing, when the session is no longer
    /// receiving or composing.
    pub async fn record_chunk(&self, receipt: &ChunkReceipt) -> Result<bool, sqlx::Error> {
        let mut tx = self.db.begin().await?;
        let touched = sqlx::query(
            "UPDATE upload_sessions SET updated_at = ?
             WHERE id = ? AND state IN (?, ?)",
        )
        .bind(receipt.received_at)
        .bind(&receipt.session_id)
        .bind(SessionState::Receiving)
        .bind(SessionState::Composing)
        .execute(&mut *tx)
        .await?;
        if touched.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO upload_chunks (
                session_id, chunk_index, size_bytes, storage_key, etag, received_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id, chunk_index) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                storage_key = excluded.storage_key,
                etag = excluded.etag,
                received_at = excluded.received_at
            "#,
        )
        .bind(&receipt.session_id)
        .bind(receipt.chunk_index)
        .bind(receipt.size_bytes)
        .bind(&receipt.storage_key)
        .bind(&receipt.etag)
        .bind(receipt.received_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Receipts of a session ordered by index.
    pub async fn chunks(&self, session_id: &str) -> Result<Vec<ChunkReceipt>, sqlx::Error> {
        sqlx::query_as::<_, ChunkReceipt>(
            "SELECT session_id, chunk_index, size_bytes, storage_key, etag, received_at
             FROM upload_chunks WHERE session_id = ? ORDER BY chunk_index ASC",
        )
        .bind(session_id)
        .fetch_all(&*self.db)
        .await
    }

    pub async fn clear_chunks(&self, session_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM upload_chunks WHERE session_id = ?")
            .bind(session_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Move a session from `from` to `to`.
    ///
    /// Returns false when the session was not in `from`; only one caller can
    /// win a given transition.
    pub async fn transition(
        &self,
        id: &str,
        from: SessionState,
        to: SessionState,
    ) -> Result<bool, sqlx::Error> {
        let result =
            sqlx::query("UPDATE upload_sessions SET state = ?, updated_at = ? WHERE id = ? AND state = ?")
                .bind(to)
                .bind(Utc::now())
                .bind(id)
                .bind(from)
                .execute(&*self.db)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Only a composing session can complete or fail; a restarted session
    /// is left alone.
    pub async fn mark_completed(&self, id: &str, image_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE upload_sessions SET state = ?, image_id = ?, error = NULL, updated_at = ?
             WHERE id = ? AND state = ?",
        )
        .bind(SessionState::Completed)
        .bind(image_id)
        .bind(Utc::now())
        .bind(id)
        .bind(SessionState::Composing)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: &str, reason: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE upload_sessions SET state = ?, error = ?, updated_at = ?
             WHERE id = ? AND state = ?",
        )
        .bind(SessionState::Failed)
        .bind(reason)
        .bind(Utc::now())
        .bind(id)
        .bind(SessionState::Composing)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Sessions in any state untouched since `cutoff`.
    pub async fn stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<UploadSession>, sqlx::Error> {
        sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {} FROM upload_sessions WHERE updated_at < ? ORDER BY updated_at ASC",
            SESSION_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&*self.db)
        .await
    }

    /// Delete a session row and its receipts.
    pub async fn remove(&self, id: &str) -> Result<(), sqlx::Error> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM upload_chunks WHERE session_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM upload_sessions WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await
    }

    /// Persist an image and its variants.
    pub async fn save_image(&self, image: &UploadedImage) -> Result<(), sqlx::Error> {
        let mut tx = self.db.begin().await?;
        sqlx::query("INSERT INTO images (id, original_name, created_at) VALUES (?, ?, ?)")
            .bind(image.id)
            .bind(&image.original_name)
            .bind(image.created_at)
            .execute(&mut *tx)
            .await?;

        for variant in &image.variants {
            sqlx::query(
                "INSERT INTO image_variants (image_id, size, storage_key, url, width, height)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(image.id)
            .bind(variant.size)
            .bind(&variant.storage_key)
            .bind(&variant.url)
            .bind(variant.width)
            .bind(variant.height)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    pub async fn get_image(&self, id: Uuid) -> Result<Option<UploadedImage>, sqlx::Error> {
        let Some(row) = sqlx::query_as::<_, ImageRow>(
            "SELECT id, original_name, created_at FROM images WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        else {
            return Ok(None);
        };

        let variants = sqlx::query_as::<_, ImageVariant>(
            "SELECT size, url, width, height, storage_key FROM image_variants
             WHERE image_id = ?
             ORDER BY CASE size
                 WHEN 'small' THEN 0 WHEN 'medium' THEN 1 WHEN 'large' THEN 2 ELSE 3
             END",
        )
        .bind(id)
        .fetch_all(&*self.db)
        .await?;

        Ok(Some(UploadedImage {
            id: row.id,
            original_name: row.original_name,
            variants,
            created_at: row.created_at,
        }))
    }
}
