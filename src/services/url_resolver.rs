//! UrlResolver: read-time rewriting of local media URLs to their remote
//! copies.
//!
//! One rule covers every surface: a reference whose file name carries a
//! `-<w>x<h>` suffix maps to the remote primary URL with that suffix
//! inserted before the extension, anything else maps to the remote primary
//! URL. Records without a remote primary copy are left alone.

use crate::{
    models::media::{FULL_VARIANT, MediaRecord, RemoteMetadataMap},
    services::{
        keys::{insert_size_suffix, replace_file_name, size_suffix, strip_size_suffix},
        media_library::{LibraryResult, MediaLibrary},
    },
};
use regex::{Captures, Regex};
use serde::Serialize;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::LazyLock,
};
use tracing::debug;

/// Media tags whose `src`, `href` and `srcset` attributes are rewritten.
static MEDIA_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<(?:img|a|audio|video|source)\b[^>]*>").expect("valid media tag pattern")
});

static URL_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(src|href|srcset)(\s*=\s*)(?:"([^"]*)"|'([^']*)')"#)
        .expect("valid attribute pattern")
});

/// URL of a variant and whether it points at the remote copy.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct VariantUrl {
    pub url: String,
    pub remote: bool,
}

#[derive(Clone)]
pub struct UrlResolver {
    library: MediaLibrary,
    uploads_dir: PathBuf,
    uploads_base_url: String,
    enabled: bool,
}

impl UrlResolver {
    pub fn new(
        library: MediaLibrary,
        uploads_dir: impl Into<PathBuf>,
        uploads_base_url: &str,
        enabled: bool,
    ) -> Self {
        Self {
            library,
            uploads_dir: uploads_dir.into(),
            uploads_base_url: uploads_base_url.trim_end_matches('/').to_string(),
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn rewrite_reference_url(&self, original: &str, record_id: i64) -> LibraryResult<String> {
        if !self.enabled {
            return Ok(original.to_string());
        }
        let record = self.library.get(record_id).await?;
        let remote = self.library.remote_metadata(record_id).await?;
        Ok(rewrite_with(original, &record, &remote))
    }

    pub async fn rewrite_srcset(&self, srcset: &str, record_id: i64) -> LibraryResult<String> {
        if !self.enabled {
            return Ok(srcset.to_string());
        }
        let record = self.library.get(record_id).await?;
        let remote = self.library.remote_metadata(record_id).await?;
        Ok(rewrite_srcset_with(srcset, &record, &remote))
    }

    /// Rewrite media tag references in an HTML fragment. Only URLs under
    /// the local uploads base that resolve to a known record are touched.
    pub async fn rewrite_content(&self, content: &str) -> LibraryResult<String> {
        if !self.enabled || self.uploads_base_url.is_empty() {
            return Ok(content.to_string());
        }

        let mut replacements: HashMap<String, String> = HashMap::new();
        for url in self.local_references(content) {
            if replacements.contains_key(&url) {
                continue;
            }
            if let Some((record, remote)) = self.record_for_url(&url).await? {
                let rewritten = rewrite_with(&url, &record, &remote);
                if rewritten != url {
                    replacements.insert(url, rewritten);
                }
            }
        }

        if replacements.is_empty() {
            return Ok(content.to_string());
        }
        debug!(count = replacements.len(), "rewriting content references");

        let rewritten = MEDIA_TAG.replace_all(content, |tag: &Captures| {
            URL_ATTR
                .replace_all(&tag[0], |attr: &Captures| {
                    let (value, quote) = match (attr.get(3), attr.get(4)) {
                        (Some(v), _) => (v.as_str(), '"'),
                        (None, Some(v)) => (v.as_str(), '\''),
                        (None, None) => ("", '"'),
                    };
                    let value = if attr[1].eq_ignore_ascii_case("srcset") {
                        map_srcset(value, |u| replacements.get(u).cloned())
                    } else {
                        replacements.get(value).cloned().unwrap_or_else(|| value.to_string())
                    };
                    format!("{}{}{}{}{}", &attr[1], &attr[2], quote, value, quote)
                })
                .into_owned()
        });

        Ok(rewritten.into_owned())
    }

    /// Remote URL of `variant`, falling back to the local URL when the
    /// record has not been offloaded.
    pub async fn variant_url(&self, record_id: i64, variant: &str) -> LibraryResult<Option<VariantUrl>> {
        let record = self.library.get(record_id).await?;
        if self.enabled {
            let remote = self.library.remote_metadata(record_id).await?;
            if let Some(url) = variant_url_with(&record, &remote, variant) {
                return Ok(Some(VariantUrl { url, remote: true }));
            }
        }
        Ok(record
            .variant_path(variant)
            .and_then(|path| self.local_url(&path))
            .map(|url| VariantUrl { url, remote: false }))
    }

    /// Public URL of a file under the uploads directory.
    pub fn local_url(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.uploads_dir).ok()?;
        let segments: Vec<String> = relative
            .components()
            .map(|c| urlencoding::encode(&c.as_os_str().to_string_lossy()).into_owned())
            .collect();
        Some(format!("{}/{}", self.uploads_base_url, segments.join("/")))
    }

    /// Every URL under the uploads base referenced by a media tag.
    fn local_references(&self, content: &str) -> Vec<String> {
        let prefix = format!("{}/", self.uploads_base_url);
        let mut urls = Vec::new();
        for tag in MEDIA_TAG.find_iter(content) {
            for attr in URL_ATTR.captures_iter(tag.as_str()) {
                let Some(value) = attr.get(3).or_else(|| attr.get(4)) else {
                    continue;
                };
                if attr[1].eq_ignore_ascii_case("srcset") {
                    urls.extend(srcset_entries(value.as_str()).map(|(u, _)| u.to_string()));
                } else {
                    urls.push(value.as_str().to_string());
                }
            }
        }
        urls.retain(|u| u.starts_with(&prefix));
        urls
    }

    /// Resolve a local URL to its record. Variant file names are mapped to
    /// the primary file by dropping their size suffix.
    async fn record_for_url(&self, url: &str) -> LibraryResult<Option<(MediaRecord, RemoteMetadataMap)>> {
        let Some(rest) = url.strip_prefix(&format!("{}/", self.uploads_base_url)) else {
            return Ok(None);
        };
        let rest = rest.split(['?', '#']).next().unwrap_or(rest);
        let relative = urlencoding::decode(rest)
            .map(|d| d.into_owned())
            .unwrap_or_else(|_| rest.to_string());

        let stripped = strip_size_suffix(&relative);
        let mut candidates = vec![stripped];
        if candidates[0] != relative {
            candidates.push(relative);
        }

        for candidate in candidates {
            let path = self.uploads_dir.join(&candidate);
            if let Some(record) = self.library.find_by_local_path(&path).await? {
                let remote = self.library.remote_metadata(record.id).await?;
                return Ok(Some((record, remote)));
            }
        }
        Ok(None)
    }
}

/// Rewrite one reference to `record` using its remote metadata.
pub fn rewrite_with(original: &str, record: &MediaRecord, remote: &RemoteMetadataMap) -> String {
    let Some(full) = remote.get(FULL_VARIANT) else {
        return original.to_string();
    };

    let file = file_segment(original);
    if record.is_image() && record.variants.get(FULL_VARIANT).map(String::as_str) != Some(file) {
        if let Some(suffix) = size_suffix(file) {
            let exact = record
                .secondary_variants()
                .find(|(_, f)| f.as_str() == file)
                .and_then(|(name, _)| remote.get(name.as_str()));
            return match exact {
                Some(meta) => meta.remote_url.clone(),
                None => insert_size_suffix(&full.remote_url, suffix),
            };
        }
    }
    full.remote_url.clone()
}

/// Rewrite every entry of a `srcset` independently.
pub fn rewrite_srcset_with(srcset: &str, record: &MediaRecord, remote: &RemoteMetadataMap) -> String {
    if !remote.contains_key(FULL_VARIANT) {
        return srcset.to_string();
    }
    map_srcset(srcset, |url| Some(rewrite_with(url, record, remote)))
}

/// URL of `variant`: its own remote copy, else the primary remote URL with
/// the variant's local file name substituted in.
pub fn variant_url_with(record: &MediaRecord, remote: &RemoteMetadataMap, variant: &str) -> Option<String> {
    if let Some(meta) = remote.get(variant) {
        return Some(meta.remote_url.clone());
    }
    let full = remote.get(FULL_VARIANT)?;
    let file = record.variants.get(variant)?;
    Some(replace_file_name(&full.remote_url, file))
}

fn map_srcset(srcset: &str, mut map: impl FnMut(&str) -> Option<String>) -> String {
    srcset_entries(srcset)
        .map(|(url, descriptor)| {
            let url = map(url).unwrap_or_else(|| url.to_string());
            if descriptor.is_empty() {
                url
            } else {
                format!("{} {}", url, descriptor)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// `(url, descriptor)` pairs of a `srcset` value.
fn srcset_entries(srcset: &str) -> impl Iterator<Item = (&str, &str)> {
    srcset
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once(char::is_whitespace) {
            Some((url, descriptor)) => (url, descriptor.trim()),
            None => (entry, ""),
        })
}

fn file_segment(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path)
}
