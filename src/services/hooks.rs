//! Collaborator: host callbacks fired by the offloader.
//!
//! Calls are awaited inline; a collaborator must not fail the operation
//! that triggered it, so errors are logged and swallowed here.

use crate::models::{
    event::{EVENT_DELETE, EVENT_UPLOAD, OffloadEvent},
    media::{MediaRecord, RemoteMetadata},
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::warn;

#[async_trait]
pub trait Collaborator: Send + Sync {
    async fn on_upload_complete(&self, record: &MediaRecord, variant: &str, remote: &RemoteMetadata);

    async fn on_record_deleted(&self, record: &MediaRecord, deleted_keys: &[String]);
}

pub struct NoopCollaborator;

#[async_trait]
impl Collaborator for NoopCollaborator {
    async fn on_upload_complete(&self, _: &MediaRecord, _: &str, _: &RemoteMetadata) {}

    async fn on_record_deleted(&self, _: &MediaRecord, _: &[String]) {}
}

/// Appends uploads and deletions to `offload_events`.
#[derive(Clone)]
pub struct ActivityJournal {
    db: Arc<SqlitePool>,
}

impl ActivityJournal {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn events(&self, media_id: i64) -> Result<Vec<OffloadEvent>, sqlx::Error> {
        sqlx::query_as::<_, OffloadEvent>(
            "SELECT id, media_id, kind, variant, remote_key, detail, recorded_at
             FROM offload_events WHERE media_id = ? ORDER BY id",
        )
        .bind(media_id)
        .fetch_all(&*self.db)
        .await
    }

    async fn append(
        &self,
        media_id: i64,
        kind: &str,
        variant: Option<&str>,
        remote_key: Option<&str>,
        detail: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO offload_events (media_id, kind, variant, remote_key, detail, recorded_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(media_id)
        .bind(kind)
        .bind(variant)
        .bind(remote_key)
        .bind(detail)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Collaborator for ActivityJournal {
    async fn on_upload_complete(&self, record: &MediaRecord, variant: &str, remote: &RemoteMetadata) {
        if let Err(err) = self
            .append(
                record.id,
                EVENT_UPLOAD,
                Some(variant),
                Some(&remote.remote_key),
                &remote.remote_url,
            )
            .await
        {
            warn!(media_id = record.id, variant, "failed to journal upload: {}", err);
        }
    }

    async fn on_record_deleted(&self, record: &MediaRecord, deleted_keys: &[String]) {
        for key in deleted_keys {
            if let Err(err) = self
                .append(record.id, EVENT_DELETE, None, Some(key), &record.display_name())
                .await
            {
                warn!(media_id = record.id, key = %key, "failed to journal deletion: {}", err);
            }
        }
    }
}
