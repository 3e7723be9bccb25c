//! Auto-offload on ingest.
//!
//! The primary file is uploaded inside the request that registers the
//! record. Secondary variants are queued on the request's
//! [`RequestLifecycle`] and drained by one detached task once the handler
//! calls [`RequestLifecycle::finish`], so a client that disconnects early
//! does not cancel them.

use crate::{
    config::{OffloadPolicy, UploadMode},
    models::media::{FULL_VARIANT, MediaRecord, NewMedia},
    services::{
        media_library::MediaLibrary,
        object_store::UploadResult,
        offloader::{MediaOffloader, OffloadError, UploadedVariant, VariantUploadReport},
    },
};
use serde::Serialize;
use std::{collections::BTreeMap, path::PathBuf};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Variants of one record left for the end of the request.
#[derive(Debug, Clone)]
pub struct DeferredTask {
    pub record: MediaRecord,
    pub variants: Vec<String>,
}

#[derive(Debug, Default)]
pub struct DeferredTaskQueue {
    tasks: Vec<DeferredTask>,
}

impl DeferredTaskQueue {
    pub fn push(&mut self, task: DeferredTask) {
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn take(&mut self) -> Vec<DeferredTask> {
        std::mem::take(&mut self.tasks)
    }
}

/// Per-request owner of deferred work.
pub struct RequestLifecycle {
    queue: DeferredTaskQueue,
    offloader: MediaOffloader,
}

impl RequestLifecycle {
    pub fn new(offloader: MediaOffloader) -> Self {
        Self {
            queue: DeferredTaskQueue::default(),
            offloader,
        }
    }

    pub fn defer(&mut self, task: DeferredTask) {
        self.queue.push(task);
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// End-of-request hook: drain the queue in one fire-and-forget task.
    pub fn finish(mut self) -> Option<JoinHandle<Vec<VariantUploadReport>>> {
        if self.queue.is_empty() {
            return None;
        }
        let tasks = self.queue.take();
        let offloader = self.offloader;

        Some(tokio::spawn(async move {
            let mut reports = Vec::with_capacity(tasks.len());
            for task in tasks {
                match offloader.upload_missing_variants(&task.record, &task.variants).await {
                    Ok(report) => {
                        info!(
                            media_id = task.record.id,
                            uploaded = report.uploaded.len(),
                            failed = report.failed.len(),
                            "deferred variant uploads finished"
                        );
                        reports.push(report);
                    }
                    Err(err) => warn!(media_id = task.record.id, "deferred variant uploads failed: {}", err),
                }
            }
            reports
        }))
    }
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub record: MediaRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary: Option<UploadResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_error: Option<String>,
    pub deferred_variants: usize,
}

#[derive(Clone)]
pub struct IngestHandler {
    library: MediaLibrary,
    offloader: MediaOffloader,
    uploads_dir: PathBuf,
    policy: OffloadPolicy,
}

impl IngestHandler {
    pub fn new(library: MediaLibrary, offloader: MediaOffloader, uploads_dir: PathBuf, policy: OffloadPolicy) -> Self {
        Self {
            library,
            offloader,
            uploads_dir,
            policy,
        }
    }

    pub fn lifecycle(&self) -> RequestLifecycle {
        RequestLifecycle::new(self.offloader.clone())
    }

    /// Register a record and, when auto-offload is on, upload its primary
    /// file now and queue its secondary variants on `lifecycle`.
    pub async fn ingest(&self, mut new: NewMedia, lifecycle: &mut RequestLifecycle) -> Result<IngestOutcome, OffloadError> {
        if new.local_path.is_relative() {
            new.local_path = self.uploads_dir.join(&new.local_path);
        }
        let record = self.library.register(&new).await?;

        let mut outcome = IngestOutcome {
            record,
            primary: None,
            primary_error: None,
            deferred_variants: 0,
        };
        if !self.policy.auto_offload || !self.offloader.is_configured() {
            return Ok(outcome);
        }

        let record = &outcome.record;
        match self.offloader.upload_one(record, FULL_VARIANT, &record.local_path).await {
            Ok(result) => {
                let mut report = VariantUploadReport {
                    overall_success: true,
                    ..VariantUploadReport::default()
                };
                report.uploaded.push(UploadedVariant {
                    variant: FULL_VARIANT.to_string(),
                    key: result.key.clone(),
                    url: result.url.clone(),
                    size: result.size,
                });
                let paths: BTreeMap<String, PathBuf> =
                    [(FULL_VARIANT.to_string(), record.local_path.clone())].into();
                self.offloader.finish(record, &paths, &mut report).await;
                outcome.primary = Some(result);
            }
            Err(err) => {
                warn!(media_id = record.id, "auto-offload of primary file failed: {}", err);
                outcome.primary_error = Some(err.to_string());
                return Ok(outcome);
            }
        }

        let record = &outcome.record;
        if record.is_image() && self.policy.upload_mode == UploadMode::AllSizes {
            let variants: Vec<String> = record.secondary_variants().map(|(name, _)| name.clone()).collect();
            if !variants.is_empty() {
                outcome.deferred_variants = variants.len();
                lifecycle.defer(DeferredTask {
                    record: record.clone(),
                    variants,
                });
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db,
        services::{
            object_store::testing::FakeTransport,
            offloader::testing::{all_sizes, offloader, touch},
        },
    };

    fn new_media(name: &str, variants: &[(&str, &str)]) -> NewMedia {
        NewMedia {
            title: "Cat".into(),
            local_path: PathBuf::from(name),
            mime_type: "image/jpeg".into(),
            created_at: None,
            variants: variants
                .iter()
                .map(|(n, f)| (n.to_string(), f.to_string()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn primary_is_uploaded_inline_and_variants_after_finish() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "cat.jpg");
        touch(dir.path(), "cat-150x150.jpg");
        let library = MediaLibrary::new(db::memory().await);
        let transport = FakeTransport::ok();
        let policy = OffloadPolicy {
            auto_offload: true,
            ..all_sizes()
        };
        let offloader = offloader(&library, transport.clone(), policy.clone());
        let handler = IngestHandler::new(library.clone(), offloader, dir.path().to_path_buf(), policy);

        let mut lifecycle = handler.lifecycle();
        let outcome = handler
            .ingest(new_media("cat.jpg", &[("thumbnail", "cat-150x150.jpg")]), &mut lifecycle)
            .await
            .unwrap();

        assert!(outcome.primary.is_some());
        assert_eq!(outcome.deferred_variants, 1);
        assert_eq!(lifecycle.pending(), 1);
        assert_eq!(transport.puts().len(), 1);

        let reports = lifecycle.finish().unwrap().await.unwrap();
        assert_eq!(reports[0].uploaded.len(), 1);
        assert_eq!(transport.puts().len(), 2);
        let remote = library.remote_metadata(outcome.record.id).await.unwrap();
        assert!(remote.contains_key("thumbnail"));
    }

    #[tokio::test]
    async fn auto_offload_off_only_registers() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "cat.jpg");
        let library = MediaLibrary::new(db::memory().await);
        let transport = FakeTransport::ok();
        let offloader = offloader(&library, transport.clone(), all_sizes());
        let handler = IngestHandler::new(library, offloader, dir.path().to_path_buf(), all_sizes());

        let mut lifecycle = handler.lifecycle();
        let outcome = handler.ingest(new_media("cat.jpg", &[]), &mut lifecycle).await.unwrap();

        assert!(outcome.primary.is_none());
        assert_eq!(outcome.record.local_path, dir.path().join("cat.jpg"));
        assert!(lifecycle.finish().is_none());
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn failed_primary_queues_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let library = MediaLibrary::new(db::memory().await);
        let policy = OffloadPolicy {
            auto_offload: true,
            ..all_sizes()
        };
        let offloader = offloader(&library, FakeTransport::ok(), policy.clone());
        let handler = IngestHandler::new(library, offloader, dir.path().to_path_buf(), policy);

        let mut lifecycle = handler.lifecycle();
        let outcome = handler
            .ingest(new_media("gone.jpg", &[("thumbnail", "gone-150x150.jpg")]), &mut lifecycle)
            .await
            .unwrap();

        assert!(outcome.primary_error.unwrap().starts_with("file not found"));
        assert_eq!(lifecycle.pending(), 0);
    }
}
