//! Object keys, public URLs and the `-<w>x<h>` size-suffix helpers shared
//! with the URL resolver.

use crate::{
    config::{Credentials, StoreEndpoint},
    models::media::FULL_VARIANT,
    services::signer::canonical_uri,
};
use chrono::{DateTime, Datelike, Utc};
use regex::Regex;
use std::sync::LazyLock;

/// `-150x150.jpg` style suffix at the end of a file name or URL.
static SIZE_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)-([0-9]+x[0-9]+)\.[a-z0-9]+$").expect("valid size suffix pattern")
});

/// Trailing extension of a URL or file name.
static EXTENSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\.[a-z0-9]+)$").expect("valid extension pattern"));

const SPECIAL_CHARS: &[char] = &[
    '?', '[', ']', '/', '\\', '=', '<', '>', ':', ';', ',', '\'', '"', '&', '$', '#', '*', '(',
    ')', '|', '~', '`', '!', '{', '}', '%', '+', '\u{2019}', '\u{ab}', '\u{bb}', '\u{201d}',
    '\u{201c}', '\0',
];

/// Derives object keys and public URLs for the configured bucket.
#[derive(Clone, Debug)]
pub struct KeyDeriver {
    endpoint: String,
    bucket: String,
    public_base_url: Option<String>,
}

impl KeyDeriver {
    pub fn new(credentials: &Credentials, store: &StoreEndpoint) -> Self {
        Self {
            endpoint: store.url(credentials),
            bucket: credentials.bucket_name.clone(),
            public_base_url: credentials
                .custom_public_base_url
                .clone()
                .filter(|u| !u.trim().is_empty()),
        }
    }

    /// `{YYYY}/{MM}/{file}` where `file` is the sanitized file name, except
    /// for secondary variants whose name already carries a size suffix:
    /// those keep their file name verbatim.
    pub fn derive_key(&self, filename: &str, variant: &str, uploaded_at: DateTime<Utc>) -> String {
        let file = if variant != FULL_VARIANT && size_suffix(filename).is_some() {
            filename.to_string()
        } else {
            sanitize_file_name(filename)
        };
        format!("{:04}/{:02}/{}", uploaded_at.year(), uploaded_at.month(), file)
    }

    /// Public URL of `key`, each path segment percent-encoded the same way
    /// the signed request path is.
    pub fn resolve_public_url(&self, key: &str) -> String {
        match &self.public_base_url {
            Some(base) => format!("{}{}", base.trim().trim_end_matches('/'), canonical_uri(key)),
            None => format!("{}/{}{}", self.endpoint, self.bucket, canonical_uri(key)),
        }
    }
}

/// Size token (`150x150`) of a trailing `-<w>x<h>.<ext>` suffix.
pub fn size_suffix(name: &str) -> Option<&str> {
    SIZE_SUFFIX
        .captures(name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Drop a trailing size suffix, keeping the extension.
pub fn strip_size_suffix(name: &str) -> String {
    match SIZE_SUFFIX.captures(name) {
        Some(caps) => {
            let whole = caps.get(0).map(|m| m.start()).unwrap_or(name.len());
            let ext = EXTENSION
                .captures(name)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str())
                .unwrap_or("");
            format!("{}{}", &name[..whole], ext)
        }
        None => name.to_string(),
    }
}

/// Insert `-{suffix}` before the extension of `url`.
pub fn insert_size_suffix(url: &str, suffix: &str) -> String {
    match EXTENSION.captures(url).and_then(|c| c.get(1)) {
        Some(ext) => format!("{}-{}{}", &url[..ext.start()], suffix, ext.as_str()),
        None => format!("{}-{}", url, suffix),
    }
}

/// Replace the last path segment of `url` with the encoded `file`.
pub fn replace_file_name(url: &str, file: &str) -> String {
    let file = urlencoding::encode(file);
    match url.rfind('/') {
        Some(idx) => format!("{}{}", &url[..=idx], file),
        None => file.into_owned(),
    }
}

/// Make a file name safe for object keys and URLs: special characters are
/// dropped, runs of whitespace and dashes collapse to one dash, and leading
/// or trailing dots, dashes and underscores are trimmed.
pub fn sanitize_file_name(filename: &str) -> String {
    let replaced = filename.replace("%20", "-").replace('+', "-");
    let mut out = String::with_capacity(replaced.len());
    let mut last_dash = false;
    for c in replaced.chars() {
        if SPECIAL_CHARS.contains(&c) || (c.is_control() && !c.is_whitespace()) {
            continue;
        }
        if c.is_whitespace() || c == '-' {
            if !last_dash {
                out.push('-');
                last_dash = true;
            }
            continue;
        }
        last_dash = false;
        out.push(c);
    }

    let trimmed = out.trim_matches(|c| c == '.' || c == '-' || c == '_');
    if trimmed.is_empty() {
        return "unnamed-file".to_string();
    }
    trimmed.to_string()
}
