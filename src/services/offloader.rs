//! MediaOffloader: record-level uploads on top of the object-store client.
//!
//! Every successful upload writes the variant's remote metadata and
//! notifies the collaborator before the next variant is attempted.

use crate::{
    config::{OffloadPolicy, UploadMode},
    models::media::{FULL_VARIANT, MediaRecord, RemoteMetadata, is_synced},
    services::{
        hooks::Collaborator,
        media_library::{LibraryError, MediaLibrary},
        object_store::{ObjectStoreClient, StoreError, UploadResult},
    },
};
use chrono::Utc;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum OffloadError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Library(#[from] LibraryError),
    #[error("media record {id} has no variant `{variant}`")]
    UnknownVariant { id: i64, variant: String },
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadedVariant {
    pub variant: String,
    pub key: String,
    pub url: String,
    pub size: u64,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FailedVariant {
    pub variant: String,
    pub message: String,
    #[serde(skip)]
    pub halts_sync: bool,
}

/// Outcome of uploading several variants of one record. A report with
/// `overall_success` and a non-empty `failed` list is a partial failure.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VariantUploadReport {
    pub overall_success: bool,
    pub uploaded: Vec<UploadedVariant>,
    pub failed: Vec<FailedVariant>,
    /// Variants left alone because they already had remote metadata.
    pub skipped: Vec<String>,
    pub local_deleted: Vec<String>,
}

impl VariantUploadReport {
    pub fn is_partial_failure(&self) -> bool {
        self.overall_success && !self.failed.is_empty()
    }

    pub fn halts_sync(&self) -> bool {
        self.failed.iter().any(|f| f.halts_sync)
    }

    /// Nothing was attempted.
    pub fn is_noop(&self) -> bool {
        self.uploaded.is_empty() && self.failed.is_empty()
    }
}

/// Outcome of the deletion hook.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeletionReport {
    pub deleted_keys: Vec<String>,
    pub failed: Vec<FailedVariant>,
}

#[derive(Clone)]
pub struct MediaOffloader {
    client: ObjectStoreClient,
    library: MediaLibrary,
    collaborator: Arc<dyn Collaborator>,
    policy: OffloadPolicy,
}

impl MediaOffloader {
    pub fn new(
        client: ObjectStoreClient,
        library: MediaLibrary,
        collaborator: Arc<dyn Collaborator>,
        policy: OffloadPolicy,
    ) -> Self {
        Self {
            client,
            library,
            collaborator,
            policy,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.client.is_configured()
    }

    pub fn policy(&self) -> &OffloadPolicy {
        &self.policy
    }

    pub async fn test_connection(&self) -> Result<(), StoreError> {
        self.client.test_connection().await
    }

    /// Single-variant upload contract: `upload(recordId, path, variant)`.
    pub async fn upload_variant(&self, record_id: i64, variant: &str) -> Result<UploadResult, OffloadError> {
        let record = self.library.get(record_id).await?;
        let path = record
            .variant_path(variant)
            .ok_or_else(|| OffloadError::UnknownVariant {
                id: record_id,
                variant: variant.to_string(),
            })?;
        self.upload_one(&record, variant, &path).await
    }

    /// Upload one file and persist its remote metadata.
    pub async fn upload_one(
        &self,
        record: &MediaRecord,
        variant: &str,
        path: &Path,
    ) -> Result<UploadResult, OffloadError> {
        let result = self
            .client
            .upload(record.id, path, variant, record.created_at)
            .await?;

        let meta = RemoteMetadata {
            remote_key: result.key.clone(),
            remote_url: result.url.clone(),
            etag: result.etag.clone(),
            size_bytes: result.size as i64,
            uploaded_at: Utc::now(),
        };
        self.library.put_remote_metadata(record.id, variant, &meta).await?;
        self.collaborator.on_upload_complete(record, variant, &meta).await;

        Ok(result)
    }

    /// Upload `variants` under the configured upload mode.
    ///
    /// A record whose primary copy already exists is skipped without any
    /// network call unless `force` is set. The primary variant decides
    /// `overall_success`; secondary failures are recorded only. When the
    /// primary fails no secondary is attempted.
    pub async fn upload_all_variants(
        &self,
        record: &MediaRecord,
        variants: &BTreeMap<String, PathBuf>,
        force: bool,
    ) -> Result<VariantUploadReport, OffloadError> {
        let remote = self.library.remote_metadata(record.id).await?;
        let mut report = VariantUploadReport::default();

        let mut selected: Vec<(&String, &PathBuf)> = variants
            .iter()
            .filter(|(name, _)| {
                self.policy.upload_mode == UploadMode::AllSizes || name.as_str() == FULL_VARIANT
            })
            .collect();
        // Primary first.
        selected.sort_by_key(|(name, _)| name.as_str() != FULL_VARIANT);

        if !force && is_synced(&remote) {
            debug!(media_id = record.id, "record already synced, skipping");
            report.overall_success = true;
            report.skipped = selected.iter().map(|(name, _)| name.to_string()).collect();
            return Ok(report);
        }

        let Some((_, full_path)) = selected.iter().find(|(name, _)| name.as_str() == FULL_VARIANT) else {
            report.failed.push(FailedVariant {
                variant: FULL_VARIANT.to_string(),
                message: "record has no primary file".into(),
                halts_sync: false,
            });
            return Ok(report);
        };

        match self.upload_one(record, FULL_VARIANT, full_path).await {
            Ok(result) => {
                report.overall_success = true;
                report.uploaded.push(uploaded(FULL_VARIANT, result));
            }
            Err(err) => {
                report.failed.push(failed(FULL_VARIANT, &err));
                return Ok(report);
            }
        }

        for (name, path) in selected.iter().filter(|(name, _)| name.as_str() != FULL_VARIANT) {
            if !force && remote.contains_key(name.as_str()) {
                report.skipped.push(name.to_string());
                continue;
            }
            match self.upload_one(record, name, path).await {
                Ok(result) => report.uploaded.push(uploaded(name, result)),
                Err(err) => {
                    warn!(media_id = record.id, variant = %name, "variant upload failed: {}", err);
                    report.failed.push(failed(name, &err));
                }
            }
        }

        self.finish(record, variants, &mut report).await;
        Ok(report)
    }

    /// Upload only the named secondary variants of a synced record.
    pub async fn upload_missing_variants(
        &self,
        record: &MediaRecord,
        missing: &[String],
    ) -> Result<VariantUploadReport, OffloadError> {
        let mut report = VariantUploadReport {
            overall_success: true,
            ..VariantUploadReport::default()
        };
        let paths = record.variant_paths();

        for name in missing.iter().filter(|n| n.as_str() != FULL_VARIANT) {
            let Some(path) = paths.get(name) else {
                report.failed.push(FailedVariant {
                    variant: name.clone(),
                    message: format!("unknown variant `{}`", name),
                    halts_sync: false,
                });
                continue;
            };
            match self.upload_one(record, name, path).await {
                Ok(result) => report.uploaded.push(uploaded(name, result)),
                Err(err) => {
                    warn!(media_id = record.id, variant = %name, "variant upload failed: {}", err);
                    report.failed.push(failed(name, &err));
                }
            }
        }

        self.finish(record, &paths, &mut report).await;
        Ok(report)
    }

    /// Remove the local files of uploaded variants when the policy asks for
    /// it. Files whose upload failed are never touched.
    pub async fn finish(
        &self,
        record: &MediaRecord,
        paths: &BTreeMap<String, PathBuf>,
        report: &mut VariantUploadReport,
    ) {
        if !report.overall_success || !self.policy.delete_local_after_upload {
            return;
        }

        for item in &report.uploaded {
            let Some(path) = paths.get(&item.variant) else {
                continue;
            };
            match fs::remove_file(path).await {
                Ok(()) => {
                    debug!(media_id = record.id, path = %path.display(), "deleted local copy");
                    report.local_deleted.push(item.variant.clone());
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(media_id = record.id, path = %path.display(), "failed to delete local copy: {}", err)
                }
            }
        }

        if report.local_deleted.iter().any(|v| v == FULL_VARIANT) {
            if let Err(err) = self.library.mark_local_deleted(record.id).await {
                warn!(media_id = record.id, "failed to flag local deletion: {}", err);
            }
        }
    }

    /// Deletion hook: drop every remote copy, then the record itself.
    /// Remote failures are reported but do not keep the record alive.
    pub async fn delete_record(&self, record_id: i64) -> Result<DeletionReport, OffloadError> {
        let record = self.library.get(record_id).await?;
        let remote = self.library.remote_metadata(record_id).await?;
        let mut report = DeletionReport::default();

        if !remote.is_empty() && !self.client.is_configured() {
            warn!(media_id = record_id, "store not configured, remote copies left in place");
        } else {
            for (variant, meta) in &remote {
                match self.client.delete(&meta.remote_key).await {
                    Ok(()) => report.deleted_keys.push(meta.remote_key.clone()),
                    Err(err) => {
                        warn!(media_id = record_id, key = %meta.remote_key, "remote delete failed: {}", err);
                        report.failed.push(FailedVariant {
                            variant: variant.clone(),
                            message: err.to_string(),
                            halts_sync: err.halts_sync(),
                        });
                    }
                }
            }
        }

        self.library.delete(record_id).await?;
        self.collaborator.on_record_deleted(&record, &report.deleted_keys).await;
        info!(
            media_id = record_id,
            deleted = report.deleted_keys.len(),
            failed = report.failed.len(),
            "media record deleted"
        );

        Ok(report)
    }
}

fn uploaded(variant: &str, result: UploadResult) -> UploadedVariant {
    UploadedVariant {
        variant: variant.to_string(),
        key: result.key,
        url: result.url,
        size: result.size,
    }
}

fn failed(variant: &str, err: &OffloadError) -> FailedVariant {
    FailedVariant {
        variant: variant.to_string(),
        message: err.to_string(),
        halts_sync: matches!(err, OffloadError::Store(e) if e.halts_sync()),
    }
}
