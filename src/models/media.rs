//! Media records owned by the host library and the remote metadata the
//! offloader attaches to them.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

/// Name of the primary variant. Always present on a record.
pub const FULL_VARIANT: &str = "full";

/// A media record as the offloader sees it.
///
/// `variants` maps a variant name to its local file name. File names of
/// secondary variants are relative to the directory of `local_path`; the
/// `full` entry is the file name of `local_path` itself.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MediaRecord {
    pub id: i64,
    pub title: String,
    pub local_path: PathBuf,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
    pub local_deleted: bool,
    pub variants: BTreeMap<String, String>,
}

/// Row shape of the `media` table.
#[derive(Clone, FromRow, Debug)]
pub struct MediaRow {
    pub id: i64,
    pub title: String,
    pub local_path: String,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
    pub local_deleted: bool,
}

impl MediaRecord {
    /// Assemble a record from its row and the secondary variants stored
    /// for it. The `full` entry is derived from `local_path`.
    pub fn from_row(row: MediaRow, secondary: impl IntoIterator<Item = (String, String)>) -> Self {
        let local_path = PathBuf::from(row.local_path);
        let mut variants: BTreeMap<String, String> = secondary
            .into_iter()
            .filter(|(name, _)| name != FULL_VARIANT)
            .collect();
        variants.insert(FULL_VARIANT.to_string(), file_name_of(&local_path));

        Self {
            id: row.id,
            title: row.title,
            local_path,
            mime_type: row.mime_type,
            created_at: row.created_at,
            local_deleted: row.local_deleted,
            variants,
        }
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    /// Title if set, otherwise the primary file name.
    pub fn display_name(&self) -> String {
        if self.title.trim().is_empty() {
            file_name_of(&self.local_path)
        } else {
            self.title.clone()
        }
    }

    /// Local path of a variant, if the record knows that variant.
    pub fn variant_path(&self, variant: &str) -> Option<PathBuf> {
        if variant == FULL_VARIANT {
            return Some(self.local_path.clone());
        }
        let file = self.variants.get(variant)?;
        Some(self.base_dir().join(file))
    }

    /// Every known variant mapped to its local path, `full` included.
    pub fn variant_paths(&self) -> BTreeMap<String, PathBuf> {
        self.variants
            .keys()
            .filter_map(|name| self.variant_path(name).map(|p| (name.clone(), p)))
            .collect()
    }

    /// Names of the secondary (non-`full`) variants.
    pub fn secondary_variants(&self) -> impl Iterator<Item = (&String, &String)> {
        self.variants
            .iter()
            .filter(|(name, _)| name.as_str() != FULL_VARIANT)
    }

    fn base_dir(&self) -> &Path {
        self.local_path.parent().unwrap_or_else(|| Path::new(""))
    }
}

/// Remote copy of one variant, written once per successful upload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMetadata {
    pub remote_key: String,
    pub remote_url: String,
    pub etag: Option<String>,
    pub size_bytes: i64,
    pub uploaded_at: DateTime<Utc>,
}

/// Row shape of the `remote_objects` table. `uploaded_at` is stored as
/// unix milliseconds so the selector can compare it against a cursor anchor.
#[derive(Clone, FromRow, Debug)]
pub struct RemoteObjectRow {
    pub media_id: i64,
    pub variant: String,
    pub remote_key: String,
    pub remote_url: String,
    pub etag: Option<String>,
    pub size_bytes: i64,
    pub uploaded_at: i64,
}

impl From<RemoteObjectRow> for RemoteMetadata {
    fn from(row: RemoteObjectRow) -> Self {
        Self {
            remote_key: row.remote_key,
            remote_url: row.remote_url,
            etag: row.etag,
            size_bytes: row.size_bytes,
            uploaded_at: Utc
                .timestamp_millis_opt(row.uploaded_at)
                .single()
                .unwrap_or_else(Utc::now),
        }
    }
}

/// Remote metadata of a record, keyed by variant name.
pub type RemoteMetadataMap = BTreeMap<String, RemoteMetadata>;

/// A record is synced once its primary variant has remote metadata.
pub fn is_synced(remote: &RemoteMetadataMap) -> bool {
    remote.contains_key(FULL_VARIANT)
}

/// Secondary variants of `record` that have no remote metadata yet.
pub fn missing_variants(record: &MediaRecord, remote: &RemoteMetadataMap) -> Vec<String> {
    record
        .secondary_variants()
        .filter(|(name, _)| !remote.contains_key(name.as_str()))
        .map(|(name, _)| name.clone())
        .collect()
}

/// Payload accepted when the host registers a new record.
#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NewMedia {
    #[serde(default)]
    pub title: String,
    pub local_path: PathBuf,
    pub mime_type: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Secondary variants, name -> file name next to `local_path`.
    #[serde(default)]
    pub variants: BTreeMap<String, String>,
}

pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
