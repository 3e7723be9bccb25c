//! MediaLibrary: the host record store.
//!
//! Records, their secondary variants and the remote metadata written by the
//! offloader all live in SQLite. Remote metadata is the only part the
//! offloader mutates.

use crate::models::{
    media::{
        FULL_VARIANT, MediaRecord, MediaRow, NewMedia, RemoteMetadata, RemoteMetadataMap,
        RemoteObjectRow,
    },
    sync::SyncStatus,
};
use chrono::Utc;
use sqlx::SqlitePool;
use std::{collections::BTreeMap, io, path::Path, sync::Arc};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("media record {0} not found")]
    NotFound(i64),
    #[error("invalid media record: {0}")]
    Invalid(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type LibraryResult<T> = Result<T, LibraryError>;

const MEDIA_COLUMNS: &str = "id, title, local_path, mime_type, created_at, local_deleted";

#[derive(Clone)]
pub struct MediaLibrary {
    db: Arc<SqlitePool>,
}

impl MediaLibrary {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Insert a new record and its secondary variants.
    pub async fn register(&self, new: &NewMedia) -> LibraryResult<MediaRecord> {
        let local_path = new.local_path.to_string_lossy().into_owned();
        if local_path.trim().is_empty() {
            return Err(LibraryError::Invalid("localPath is required".into()));
        }
        if new.mime_type.trim().is_empty() {
            return Err(LibraryError::Invalid("mimeType is required".into()));
        }
        if let Some(name) = new.variants.keys().find(|n| n.trim().is_empty()) {
            return Err(LibraryError::Invalid(format!("variant name `{}` is empty", name)));
        }

        let created_at = new.created_at.unwrap_or_else(Utc::now);
        let mut tx = self.db.begin().await?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO media (title, local_path, mime_type, created_at, local_deleted)
             VALUES (?, ?, ?, ?, 0)
             RETURNING id",
        )
        .bind(&new.title)
        .bind(&local_path)
        .bind(new.mime_type.trim())
        .bind(created_at)
        .fetch_one(&mut *tx)
        .await?;

        for (name, file) in new.variants.iter().filter(|(n, _)| n.as_str() != FULL_VARIANT) {
            sqlx::query("INSERT INTO media_variants (media_id, name, file) VALUES (?, ?, ?)")
                .bind(id)
                .bind(name)
                .bind(file)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!(media_id = id, path = %local_path, "registered media record");
        self.get(id).await
    }

    pub async fn get(&self, id: i64) -> LibraryResult<MediaRecord> {
        let row = sqlx::query_as::<_, MediaRow>(&format!(
            "SELECT {} FROM media WHERE id = ?",
            MEDIA_COLUMNS
        ))
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => LibraryError::NotFound(id),
            other => LibraryError::Sqlx(other),
        })?;

        let variants = self.variants(id).await?;
        Ok(MediaRecord::from_row(row, variants))
    }

    /// Record whose primary file is `path`, if any.
    pub async fn find_by_local_path(&self, path: &Path) -> LibraryResult<Option<MediaRecord>> {
        let row = sqlx::query_as::<_, MediaRow>(&format!(
            "SELECT {} FROM media WHERE local_path = ? ORDER BY id LIMIT 1",
            MEDIA_COLUMNS
        ))
        .bind(path.to_string_lossy().as_ref())
        .fetch_optional(&*self.db)
        .await?;

        match row {
            Some(row) => {
                let variants = self.variants(row.id).await?;
                Ok(Some(MediaRecord::from_row(row, variants)))
            }
            None => Ok(None),
        }
    }

    /// Attach variants to rows fetched elsewhere (the sync selector).
    pub async fn hydrate(&self, rows: Vec<MediaRow>) -> LibraryResult<Vec<MediaRecord>> {
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let variants = self.variants(row.id).await?;
            records.push(MediaRecord::from_row(row, variants));
        }
        Ok(records)
    }

    /// Secondary variants of a record, `(name, file)` ordered by name.
    pub async fn variants(&self, id: i64) -> LibraryResult<Vec<(String, String)>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT name, file FROM media_variants WHERE media_id = ? ORDER BY name",
        )
        .bind(id)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows)
    }

    /// Replace the secondary variant list (regenerate pre-step).
    pub async fn replace_variants(
        &self,
        id: i64,
        variants: &BTreeMap<String, String>,
    ) -> LibraryResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM media_variants WHERE media_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        for (name, file) in variants.iter().filter(|(n, _)| n.as_str() != FULL_VARIANT) {
            sqlx::query("INSERT INTO media_variants (media_id, name, file) VALUES (?, ?, ?)")
                .bind(id)
                .bind(name)
                .bind(file)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn remote_metadata(&self, id: i64) -> LibraryResult<RemoteMetadataMap> {
        let rows = sqlx::query_as::<_, RemoteObjectRow>(
            "SELECT media_id, variant, remote_key, remote_url, etag, size_bytes, uploaded_at
             FROM remote_objects WHERE media_id = ?",
        )
        .bind(id)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.variant.clone(), RemoteMetadata::from(row)))
            .collect())
    }

    /// Write the remote copy of one variant. An explicit re-upload
    /// overwrites the previous entry.
    pub async fn put_remote_metadata(
        &self,
        id: i64,
        variant: &str,
        meta: &RemoteMetadata,
    ) -> LibraryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO remote_objects (
                media_id, variant, remote_key, remote_url, etag, size_bytes, uploaded_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(media_id, variant) DO UPDATE SET
                remote_key = excluded.remote_key,
                remote_url = excluded.remote_url,
                etag = excluded.etag,
                size_bytes = excluded.size_bytes,
                uploaded_at = excluded.uploaded_at
            "#,
        )
        .bind(id)
        .bind(variant)
        .bind(&meta.remote_key)
        .bind(&meta.remote_url)
        .bind(meta.etag.as_deref())
        .bind(meta.size_bytes)
        .bind(meta.uploaded_at.timestamp_millis())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn mark_local_deleted(&self, id: i64) -> LibraryResult<()> {
        sqlx::query("UPDATE media SET local_deleted = 1 WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Remove a record with its variants and remote metadata.
    pub async fn delete(&self, id: i64) -> LibraryResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM remote_objects WHERE media_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM media_variants WHERE media_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM media WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(LibraryError::NotFound(id));
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn count_total(&self) -> LibraryResult<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM media")
            .fetch_one(&*self.db)
            .await?)
    }

    pub async fn count_synced(&self) -> LibraryResult<i64> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM media m
             WHERE EXISTS (SELECT 1 FROM remote_objects r
                           WHERE r.media_id = m.id AND r.variant = 'full')",
        )
        .fetch_one(&*self.db)
        .await?)
    }

    pub async fn status(&self) -> LibraryResult<SyncStatus> {
        let total = self.count_total().await?;
        let synced = self.count_synced().await?;
        Ok(SyncStatus {
            total,
            synced,
            remaining: (total - synced).max(0),
        })
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::path::PathBuf;

    /// Register an image at `dir/name` with the given secondary variants.
    pub async fn image(
        library: &MediaLibrary,
        dir: &Path,
        name: &str,
        variants: &[(&str, &str)],
    ) -> MediaRecord {
        library
            .register(&NewMedia {
                title: String::new(),
                local_path: PathBuf::from(dir).join(name),
                mime_type: "image/jpeg".into(),
                created_at: None,
                variants: variants
                    .iter()
                    .map(|(n, f)| (n.to_string(), f.to_string()))
                    .collect(),
            })
            .await
            .unwrap()
    }

    pub fn remote(key: &str, url: &str) -> RemoteMetadata {
        RemoteMetadata {
            remote_key: key.into(),
            remote_url: url.into(),
            etag: None,
            size_bytes: 1,
            uploaded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::db;
    use std::path::PathBuf;

    #[tokio::test]
    async fn register_and_get_round_trip_variants() {
        let library = MediaLibrary::new(db::memory().await);
        let rec = image(
            &library,
            Path::new("/srv/uploads/2024/03"),
            "cat.jpg",
            &[("thumbnail", "cat-150x150.jpg")],
        )
        .await;

        let fetched = library.get(rec.id).await.unwrap();
        assert_eq!(fetched.variants.len(), 2);
        assert_eq!(fetched.variants["thumbnail"], "cat-150x150.jpg");
        assert_eq!(fetched.variants[FULL_VARIANT], "cat.jpg");

        let found = library
            .find_by_local_path(Path::new("/srv/uploads/2024/03/cat.jpg"))
            .await
            .unwrap();
        assert_eq!(found.map(|r| r.id), Some(rec.id));
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let library = MediaLibrary::new(db::memory().await);
        assert!(matches!(library.get(42).await, Err(LibraryError::NotFound(42))));
        assert!(matches!(library.delete(42).await, Err(LibraryError::NotFound(42))));
    }

    #[tokio::test]
    async fn remote_metadata_marks_record_synced() {
        let library = MediaLibrary::new(db::memory().await);
        let rec = image(&library, Path::new("/u"), "a.jpg", &[]).await;
        image(&library, Path::new("/u"), "b.jpg", &[]).await;

        library
            .put_remote_metadata(rec.id, FULL_VARIANT, &remote("2024/03/a.jpg", "https://cdn/a.jpg"))
            .await
            .unwrap();
        library
            .put_remote_metadata(rec.id, FULL_VARIANT, &remote("2024/03/a.jpg", "https://cdn/a2.jpg"))
            .await
            .unwrap();

        let map = library.remote_metadata(rec.id).await.unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map[FULL_VARIANT].remote_url, "https://cdn/a2.jpg");

        let status = library.status().await.unwrap();
        assert_eq!(
            status,
            SyncStatus {
                total: 2,
                synced: 1,
                remaining: 1
            }
        );
    }

    #[tokio::test]
    async fn replace_variants_and_delete() {
        let library = MediaLibrary::new(db::memory().await);
        let rec = image(&library, Path::new("/u"), "a.jpg", &[("thumbnail", "a-1x1.jpg")]).await;

        let mut next = BTreeMap::new();
        next.insert("medium".to_string(), "a-300x300.jpg".to_string());
        library.replace_variants(rec.id, &next).await.unwrap();
        let variants = library.variants(rec.id).await.unwrap();
        assert_eq!(variants, vec![("medium".to_string(), "a-300x300.jpg".to_string())]);

        library.delete(rec.id).await.unwrap();
        assert_eq!(library.count_total().await.unwrap(), 0);
        assert!(library.variants(rec.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn register_rejects_missing_fields() {
        let library = MediaLibrary::new(db::memory().await);
        let err = library
            .register(&NewMedia {
                title: String::new(),
                local_path: PathBuf::new(),
                mime_type: "image/png".into(),
                created_at: None,
                variants: BTreeMap::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LibraryError::Invalid(_)));
    }
}
