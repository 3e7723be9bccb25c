//! SyncSelector: candidate queries for the batch engine.
//!
//! `full` selects records without a remote primary copy. `incremental`
//! selects synced records with at least one secondary variant missing
//! remotely. With an anchor, records whose relevant remote metadata was
//! written at or after it stay in the selection, so a session's offsets do
//! not skip records while the candidate pool shrinks underneath it.

use crate::{
    models::{
        media::{MediaRecord, MediaRow},
        sync::SyncMode,
    },
    services::media_library::{LibraryResult, MediaLibrary},
};

const HAS_FULL: &str = "EXISTS (SELECT 1 FROM remote_objects r
         WHERE r.media_id = m.id AND r.variant = 'full')";

const MISSING_VARIANT: &str = "EXISTS (SELECT 1 FROM media_variants v
         WHERE v.media_id = m.id
           AND NOT EXISTS (SELECT 1 FROM remote_objects r
                           WHERE r.media_id = m.id AND r.variant = v.name))";

const FULL_SINCE_ANCHOR: &str = "EXISTS (SELECT 1 FROM remote_objects r
         WHERE r.media_id = m.id AND r.variant = 'full' AND r.uploaded_at >= ?)";

const VARIANT_SINCE_ANCHOR: &str = "EXISTS (SELECT 1 FROM remote_objects r
         WHERE r.media_id = m.id AND r.variant <> 'full' AND r.uploaded_at >= ?)";

#[derive(Clone)]
pub struct SyncSelector {
    library: MediaLibrary,
}

impl SyncSelector {
    pub fn new(library: MediaLibrary) -> Self {
        Self { library }
    }

    /// Up to `limit` records of the selection, in id order, from `offset`.
    pub async fn select(
        &self,
        mode: SyncMode,
        offset: i64,
        limit: i64,
        anchor: Option<i64>,
    ) -> LibraryResult<Vec<MediaRecord>> {
        let sql = format!(
            "SELECT m.id, m.title, m.local_path, m.mime_type, m.created_at, m.local_deleted
             FROM media m
             WHERE {}
             ORDER BY m.id ASC
             LIMIT ? OFFSET ?",
            where_clause(mode, anchor.is_some())
        );

        let mut query = sqlx::query_as::<_, MediaRow>(&sql);
        if let Some(anchor) = anchor {
            query = query.bind(anchor);
        }
        let rows = query
            .bind(limit.max(0))
            .bind(offset.max(0))
            .fetch_all(self.library.pool())
            .await?;

        self.library.hydrate(rows).await
    }

    /// Size of the selection.
    pub async fn count(&self, mode: SyncMode, anchor: Option<i64>) -> LibraryResult<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM media m WHERE {}",
            where_clause(mode, anchor.is_some())
        );

        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        if let Some(anchor) = anchor {
            query = query.bind(anchor);
        }
        Ok(query.fetch_one(self.library.pool()).await?)
    }
}

fn where_clause(mode: SyncMode, anchored: bool) -> String {
    match (mode, anchored) {
        (SyncMode::Full, false) => format!("NOT {}", HAS_FULL),
        (SyncMode::Full, true) => format!("(NOT {} OR {})", HAS_FULL, FULL_SINCE_ANCHOR),
        (SyncMode::Incremental, false) => format!("{} AND {}", HAS_FULL, MISSING_VARIANT),
        (SyncMode::Incremental, true) => format!(
            "{} AND ({} OR {})",
            HAS_FULL, MISSING_VARIANT, VARIANT_SINCE_ANCHOR
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db,
        models::media::FULL_VARIANT,
        services::media_library::testing::{image, remote},
    };
    use chrono::{Duration, Utc};
    use std::path::Path;

    async fn setup(count: usize) -> (MediaLibrary, SyncSelector, Vec<MediaRecord>) {
        let library = MediaLibrary::new(db::memory().await);
        let mut records = Vec::new();
        for i in 0..count {
            records.push(
                image(
                    &library,
                    Path::new("/u"),
                    &format!("img{}.jpg", i),
                    &[("thumbnail", &format!("img{}-150x150.jpg", i))],
                )
                .await,
            );
        }
        let selector = SyncSelector::new(library.clone());
        (library, selector, records)
    }

    #[tokio::test]
    async fn full_mode_selects_records_without_primary_copy() {
        let (library, selector, records) = setup(4).await;
        library
            .put_remote_metadata(records[1].id, FULL_VARIANT, &remote("k", "u"))
            .await
            .unwrap();

        let picked = selector.select(SyncMode::Full, 0, 10, None).await.unwrap();
        let ids: Vec<i64> = picked.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![records[0].id, records[2].id, records[3].id]);
        assert_eq!(selector.count(SyncMode::Full, None).await.unwrap(), 3);

        let page = selector.select(SyncMode::Full, 1, 1, None).await.unwrap();
        assert_eq!(page[0].id, records[2].id);
    }

    #[tokio::test]
    async fn incremental_mode_selects_partially_synced_records() {
        let (library, selector, records) = setup(3).await;
        for rec in &records[..2] {
            library
                .put_remote_metadata(rec.id, FULL_VARIANT, &remote("k", "u"))
                .await
                .unwrap();
        }
        library
            .put_remote_metadata(records[0].id, "thumbnail", &remote("k2", "u2"))
            .await
            .unwrap();

        let picked = selector.select(SyncMode::Incremental, 0, 10, None).await.unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, records[1].id);
    }

    #[tokio::test]
    async fn anchor_keeps_records_synced_during_the_session() {
        let (library, selector, records) = setup(3).await;
        let anchor = (Utc::now() - Duration::seconds(1)).timestamp_millis();

        library
            .put_remote_metadata(records[0].id, FULL_VARIANT, &remote("k", "u"))
            .await
            .unwrap();

        assert_eq!(selector.count(SyncMode::Full, None).await.unwrap(), 2);
        assert_eq!(selector.count(SyncMode::Full, Some(anchor)).await.unwrap(), 3);

        let future = (Utc::now() + Duration::hours(1)).timestamp_millis();
        assert_eq!(selector.count(SyncMode::Full, Some(future)).await.unwrap(), 2);
    }
}
