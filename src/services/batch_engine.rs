//! BatchEngine: one stateless sync batch per call.
//!
//! Everything needed to resume lives in the caller's [`BatchCursor`]; a
//! cursor without an anchor pages over every record. A
//! batch processes its candidates sequentially and always runs to the end;
//! per-record failures become `error` outcomes instead of aborting the
//! batch. Only a credential-level failure stops the batch early and sets
//! `halted`.

use crate::{
    config::{AutoSyncConfig, UploadMode},
    models::{
        media::{MediaRecord, file_name_of, is_synced, missing_variants},
        sync::{BatchCursor, BatchRequest, BatchResult, ItemOutcome, OutcomeKind, SyncMode, SyncStatus},
    },
    services::{
        media_library::{LibraryError, MediaLibrary},
        offloader::{MediaOffloader, OffloadError, VariantUploadReport},
        sync_selector::SyncSelector,
    },
};
use async_trait::async_trait;
use chrono::Utc;
use std::{collections::BTreeMap, path::PathBuf, sync::Arc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("object store credentials are not configured")]
    NotConfigured,
    #[error(transparent)]
    Library(#[from] LibraryError),
}

/// Host-owned re-derivation of a record's variant files. The engine only
/// consumes the resulting `{variant -> local path}` map.
#[async_trait]
pub trait VariantSource: Send + Sync {
    async fn regenerate(&self, record: &MediaRecord) -> Result<BTreeMap<String, PathBuf>, LibraryError>;
}

/// Keeps the variants the library already lists whose files still exist.
pub struct ExistingFiles;

#[async_trait]
impl VariantSource for ExistingFiles {
    async fn regenerate(&self, record: &MediaRecord) -> Result<BTreeMap<String, PathBuf>, LibraryError> {
        let mut kept = BTreeMap::new();
        for (name, path) in record.variant_paths() {
            if tokio::fs::try_exists(&path).await? {
                kept.insert(name, path);
            }
        }
        Ok(kept)
    }
}

#[derive(Clone)]
pub struct BatchEngine {
    library: MediaLibrary,
    selector: SyncSelector,
    offloader: MediaOffloader,
    variant_source: Arc<dyn VariantSource>,
}

impl BatchEngine {
    pub fn new(
        library: MediaLibrary,
        offloader: MediaOffloader,
        variant_source: Arc<dyn VariantSource>,
    ) -> Self {
        Self {
            selector: SyncSelector::new(library.clone()),
            library,
            offloader,
            variant_source,
        }
    }

    pub async fn status(&self) -> Result<SyncStatus, SyncError> {
        Ok(self.library.status().await?)
    }

    /// Process the batch at `request.cursor`.
    pub async fn run_batch(&self, request: BatchRequest) -> Result<BatchResult, SyncError> {
        if !self.offloader.is_configured() {
            return Err(SyncError::NotConfigured);
        }

        let cursor = request.cursor.normalized();
        let anchor = cursor.effective_anchor();
        let records = self
            .selector
            .select(cursor.mode, cursor.offset, cursor.batch_size, Some(anchor))
            .await?;

        debug!(
            mode = %cursor.mode,
            offset = cursor.offset,
            batch_size = cursor.batch_size,
            selected = records.len(),
            "running sync batch"
        );

        let mut outcomes = Vec::with_capacity(records.len());
        let mut halted = false;
        for record in records {
            let (outcome, halts) = self.sync_record(record, cursor.mode, request.regenerate_metadata).await;
            outcomes.push(outcome);
            if halts {
                warn!("credential-level failure, halting sync batch");
                halted = true;
                break;
            }
        }

        let processed_count = outcomes.len() as i64;
        let total_candidates = self.selector.count(cursor.mode, Some(anchor)).await?;
        let result = BatchResult {
            processed_count,
            total_remaining: (total_candidates - cursor.offset - processed_count).max(0),
            total_candidates,
            anchor,
            halted,
            outcomes,
        };

        info!(
            mode = %cursor.mode,
            offset = cursor.offset,
            processed = result.processed_count,
            success = result.count(OutcomeKind::Success),
            errors = result.count(OutcomeKind::Error),
            remaining = result.total_remaining,
            "sync batch complete"
        );

        Ok(result)
    }

    /// Outcome for one record, plus whether the sync must halt.
    async fn sync_record(&self, record: MediaRecord, mode: SyncMode, regenerate: bool) -> (ItemOutcome, bool) {
        let id = record.id;
        let name = record.display_name();

        let record = if regenerate {
            match self.regenerate(record).await {
                Ok(record) => record,
                Err(err) => {
                    return (
                        ItemOutcome::new(id, OutcomeKind::Error, format!("{}: {}", name, err)),
                        false,
                    );
                }
            }
        } else {
            record
        };

        let result = match mode {
            SyncMode::Full => self.sync_full(&record).await,
            SyncMode::Incremental => self.sync_incremental(&record).await,
        };

        match result {
            Ok(Synced::Skipped(reason)) => (
                ItemOutcome::new(id, OutcomeKind::Skipped, format!("{}: {}", name, reason)),
                false,
            ),
            Ok(Synced::Uploaded(report)) => classify(id, &name, &report),
            Err(err) => {
                error!(media_id = id, "sync failed: {}", err);
                (
                    ItemOutcome::new(id, OutcomeKind::Error, format!("{}: {}", name, err)),
                    false,
                )
            }
        }
    }

    /// Primary plus variants per the upload mode.
    async fn sync_full(&self, record: &MediaRecord) -> Result<Synced, OffloadError> {
        let remote = self.library.remote_metadata(record.id).await?;
        if is_synced(&remote) {
            return Ok(Synced::Skipped("already synced".into()));
        }
        let report = self
            .offloader
            .upload_all_variants(record, &record.variant_paths(), false)
            .await?;
        Ok(Synced::Uploaded(report))
    }

    /// Only the variants absent remotely; synced variants are untouched.
    async fn sync_incremental(&self, record: &MediaRecord) -> Result<Synced, OffloadError> {
        if self.offloader.policy().upload_mode == UploadMode::FullOnly {
            return Ok(Synced::Skipped("upload mode is full only".into()));
        }
        let remote = self.library.remote_metadata(record.id).await?;
        if !is_synced(&remote) {
            return Ok(Synced::Skipped("primary file not synced yet".into()));
        }
        let missing = missing_variants(record, &remote);
        if missing.is_empty() {
            return Ok(Synced::Skipped("all variants synced".into()));
        }
        let report = self.offloader.upload_missing_variants(record, &missing).await?;
        Ok(Synced::Uploaded(report))
    }

    /// Run the variant source and persist its result.
    async fn regenerate(&self, record: MediaRecord) -> Result<MediaRecord, LibraryError> {
        let paths = self.variant_source.regenerate(&record).await?;
        let files: BTreeMap<String, String> = paths
            .iter()
            .map(|(name, path)| (name.clone(), file_name_of(path)))
            .collect();
        self.library.replace_variants(record.id, &files).await?;
        debug!(media_id = record.id, variants = files.len(), "variants regenerated");
        self.library.get(record.id).await
    }
}

enum Synced {
    Skipped(String),
    Uploaded(VariantUploadReport),
}

fn classify(id: i64, name: &str, report: &VariantUploadReport) -> (ItemOutcome, bool) {
    let halts = report.halts_sync();
    let failures = || {
        report
            .failed
            .iter()
            .map(|f| format!("{} ({})", f.variant, f.message))
            .collect::<Vec<_>>()
            .join("; ")
    };

    let outcome = if !report.overall_success || (report.uploaded.is_empty() && !report.failed.is_empty()) {
        ItemOutcome::new(id, OutcomeKind::Error, format!("{}: {}", name, failures()))
    } else if !report.failed.is_empty() {
        ItemOutcome::new(
            id,
            OutcomeKind::Warning,
            format!(
                "{}: uploaded {} file(s), {} failed: {}",
                name,
                report.uploaded.len(),
                report.failed.len(),
                failures()
            ),
        )
    } else if report.uploaded.is_empty() {
        ItemOutcome::new(id, OutcomeKind::Skipped, format!("{}: nothing to upload", name))
    } else {
        ItemOutcome::new(
            id,
            OutcomeKind::Success,
            format!("{}: uploaded {} file(s)", name, report.uploaded.len()),
        )
    };
    (outcome, halts)
}

/// Periodic batch at offset 0 until `shutdown` fires.
pub fn spawn_scheduled(engine: BatchEngine, config: AutoSyncConfig, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.interval);
        // The first tick completes immediately.
        interval.tick().await;
        info!(every = ?config.interval, mode = %config.mode, "scheduled sync enabled");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let request = BatchRequest {
                cursor: BatchCursor::new(config.batch_size, config.mode)
                    .with_anchor(Utc::now().timestamp_millis()),
                regenerate_metadata: false,
            };
            match engine.run_batch(request).await {
                Ok(result) => info!(
                    processed = result.processed_count,
                    success = result.count(OutcomeKind::Success),
                    errors = result.count(OutcomeKind::Error),
                    remaining = result.total_remaining,
                    "scheduled sync batch finished"
                ),
                Err(SyncError::NotConfigured) => debug!("scheduled sync skipped, store not configured"),
                Err(err) => error!("scheduled sync failed: {}", err),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::OffloadPolicy,
        db,
        models::{media::FULL_VARIANT, sync::OPEN_ANCHOR},
        services::{
            media_library::testing::image,
            object_store::{HttpResponse, testing::FakeTransport},
            offloader::testing::{all_sizes, offloader, touch},
        },
    };
    use std::path::Path;

    struct Fixture {
        _dir: tempfile::TempDir,
        library: MediaLibrary,
        transport: Arc<FakeTransport>,
        engine: BatchEngine,
        ids: Vec<i64>,
    }

    async fn fixture(count: usize, transport: Arc<FakeTransport>, policy: OffloadPolicy) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let library = MediaLibrary::new(db::memory().await);
        let mut ids = Vec::new();
        for i in 0..count {
            let name = format!("img{:02}.jpg", i);
            let thumb = format!("img{:02}-150x150.jpg", i);
            touch(dir.path(), &name);
            touch(dir.path(), &thumb);
            ids.push(image(&library, dir.path(), &name, &[("thumbnail", &thumb)]).await.id);
        }
        let offloader = offloader(&library, transport.clone(), policy);
        let engine = BatchEngine::new(library.clone(), offloader, Arc::new(ExistingFiles));
        Fixture {
            _dir: dir,
            library,
            transport,
            engine,
            ids,
        }
    }

    fn request(cursor: BatchCursor) -> BatchRequest {
        BatchRequest {
            cursor,
            regenerate_metadata: false,
        }
    }

    #[tokio::test]
    async fn twenty_five_records_in_batches_of_ten() {
        let fx = fixture(25, FakeTransport::ok(), OffloadPolicy::default()).await;
        let mut cursor = BatchCursor::new(10, SyncMode::Full);
        let mut counts = Vec::new();

        for expected_offset in [0, 10, 20] {
            assert_eq!(cursor.offset, expected_offset);
            let result = fx.engine.run_batch(request(cursor)).await.unwrap();
            assert_eq!(result.total_candidates, 25);
            counts.push(result.processed_count);
            assert!(result.outcomes.iter().all(|o| o.kind == OutcomeKind::Success));
            cursor = cursor.advance(&result);
        }

        assert_eq!(counts, vec![10, 10, 5]);
        assert_eq!(fx.engine.selector.count(SyncMode::Full, None).await.unwrap(), 0);
        assert_eq!(fx.transport.puts().len(), 25);
        assert_eq!(fx.engine.status().await.unwrap().remaining, 0);
    }

    #[tokio::test]
    async fn plain_offset_requests_page_through_every_record() {
        let fx = fixture(25, FakeTransport::ok(), OffloadPolicy::default()).await;
        let mut counts = Vec::new();

        for offset in [0, 10, 20] {
            let request: BatchRequest =
                serde_json::from_value(serde_json::json!({ "offset": offset, "batchSize": 10, "mode": "full" }))
                    .unwrap();
            let result = fx.engine.run_batch(request).await.unwrap();
            assert_eq!(result.total_candidates, 25);
            assert_eq!(result.anchor, OPEN_ANCHOR);
            counts.push(result.processed_count);
        }

        assert_eq!(counts, vec![10, 10, 5]);
        assert_eq!(fx.engine.selector.count(SyncMode::Full, None).await.unwrap(), 0);
        assert_eq!(fx.transport.puts().len(), 25);
    }

    #[tokio::test]
    async fn open_session_reports_previously_synced_records_as_info() {
        let fx = fixture(3, FakeTransport::ok(), OffloadPolicy::default()).await;
        let rec = fx.library.get(fx.ids[1]).await.unwrap();
        fx.engine
            .offloader
            .upload_one(&rec, FULL_VARIANT, &rec.local_path)
            .await
            .unwrap();

        let result = fx
            .engine
            .run_batch(request(BatchCursor::new(10, SyncMode::Full)))
            .await
            .unwrap();

        let kinds: Vec<OutcomeKind> = result.outcomes.iter().map(|o| o.kind).collect();
        assert_eq!(kinds, vec![OutcomeKind::Success, OutcomeKind::Skipped, OutcomeKind::Success]);
        assert!(result.outcomes[1].message.ends_with("already synced"));
        assert_eq!(fx.transport.puts().len(), 3);
    }

    #[tokio::test]
    async fn anchored_session_skips_records_synced_before_it() {
        let fx = fixture(3, FakeTransport::ok(), OffloadPolicy::default()).await;
        let rec = fx.library.get(fx.ids[0]).await.unwrap();
        fx.engine
            .offloader
            .upload_one(&rec, FULL_VARIANT, &rec.local_path)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let anchor = Utc::now().timestamp_millis();

        let cursor = BatchCursor::new(1, SyncMode::Full).with_anchor(anchor);
        let first = fx.engine.run_batch(request(cursor)).await.unwrap();
        let second = fx.engine.run_batch(request(cursor.advance(&first))).await.unwrap();

        assert_eq!(first.total_candidates, 2);
        assert_eq!(first.outcomes[0].id, fx.ids[1]);
        assert_eq!(second.outcomes[0].id, fx.ids[2]);
        assert_eq!(second.total_remaining, 0);
    }

    #[tokio::test]
    async fn total_remaining_counts_down() {
        let fx = fixture(5, FakeTransport::ok(), OffloadPolicy::default()).await;
        let cursor = BatchCursor::new(2, SyncMode::Full);

        let first = fx.engine.run_batch(request(cursor)).await.unwrap();
        assert_eq!(first.total_remaining, 3);
        assert!(!first.is_exhausted(&cursor));

        let next = cursor.advance(&first);
        let second = fx.engine.run_batch(request(next)).await.unwrap();
        assert_eq!(second.total_remaining, 1);
    }

    #[tokio::test]
    async fn one_bad_record_does_not_block_the_batch() {
        let fx = fixture(3, FakeTransport::ok(), OffloadPolicy::default()).await;
        let missing = fx.library.get(fx.ids[1]).await.unwrap();
        std::fs::remove_file(&missing.local_path).unwrap();

        let result = fx
            .engine
            .run_batch(request(BatchCursor::new(10, SyncMode::Full)))
            .await
            .unwrap();

        let kinds: Vec<OutcomeKind> = result.outcomes.iter().map(|o| o.kind).collect();
        assert_eq!(kinds, vec![OutcomeKind::Success, OutcomeKind::Error, OutcomeKind::Success]);
        assert!(result.outcomes[1].message.starts_with("img01.jpg: full (file not found"));
        assert!(!result.halted);
        assert!(result.is_exhausted(&BatchCursor::new(10, SyncMode::Full)));
    }

    #[tokio::test]
    async fn auth_failure_halts_the_batch() {
        let transport = FakeTransport::new(|_, _| {
            Ok(HttpResponse::new(403)
                .with_body("<Error><Code>AccessDenied</Code><Message>denied</Message></Error>"))
        });
        let fx = fixture(3, transport, OffloadPolicy::default()).await;

        let result = fx
            .engine
            .run_batch(request(BatchCursor::new(10, SyncMode::Full)))
            .await
            .unwrap();

        assert!(result.halted);
        assert_eq!(result.processed_count, 1);
        assert_eq!(result.outcomes[0].kind, OutcomeKind::Error);
        assert!(result.outcomes[0].message.contains("Access denied"));
    }

    #[tokio::test]
    async fn incremental_uploads_only_missing_variants() {
        let fx = fixture(2, FakeTransport::ok(), all_sizes()).await;
        for id in &fx.ids {
            let rec = fx.library.get(*id).await.unwrap();
            let (name, path) = (FULL_VARIANT, rec.local_path.clone());
            fx.engine.offloader.upload_one(&rec, name, &path).await.unwrap();
        }
        let before = fx.transport.puts().len();

        let cursor = BatchCursor::new(10, SyncMode::Incremental);
        let result = fx.engine.run_batch(request(cursor)).await.unwrap();

        assert_eq!(result.processed_count, 2);
        assert_eq!(result.count(OutcomeKind::Success), 2);
        let puts = fx.transport.puts();
        assert_eq!(puts.len() - before, 2);
        assert!(puts[before..].iter().all(|p| p.url.ends_with("-150x150.jpg")));
        assert_eq!(fx.engine.selector.count(SyncMode::Incremental, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn regenerate_drops_variants_without_files() {
        let fx = fixture(1, FakeTransport::ok(), all_sizes()).await;
        let rec = fx.library.get(fx.ids[0]).await.unwrap();
        std::fs::remove_file(rec.variant_path("thumbnail").unwrap()).unwrap();

        let result = fx
            .engine
            .run_batch(BatchRequest {
                cursor: BatchCursor::new(10, SyncMode::Full),
                regenerate_metadata: true,
            })
            .await
            .unwrap();

        assert_eq!(result.outcomes[0].kind, OutcomeKind::Success);
        assert!(fx.library.variants(rec.id).await.unwrap().is_empty());
        assert_eq!(fx.transport.puts().len(), 1);
    }

    #[tokio::test]
    async fn unconfigured_store_is_rejected_before_selection() {
        let library = MediaLibrary::new(db::memory().await);
        let client = crate::services::object_store::ObjectStoreClient::new(
            Default::default(),
            &Default::default(),
            FakeTransport::ok(),
        );
        let offloader = MediaOffloader::new(
            client,
            library.clone(),
            Arc::new(crate::services::hooks::NoopCollaborator),
            OffloadPolicy::default(),
        );
        let engine = BatchEngine::new(library, offloader, Arc::new(ExistingFiles));
        image(&engine.library, Path::new("/u"), "a.jpg", &[]).await;

        let err = engine
            .run_batch(request(BatchCursor::new(10, SyncMode::Full)))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotConfigured));
    }
}
