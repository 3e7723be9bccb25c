//! ObjectStoreClient: signed PUT / DELETE / HEAD against an S3-compatible
//! bucket.
//!
//! Transport-level failures (connect, DNS, timeout) are retried with a fixed
//! pause; any HTTP status the store returns is authoritative and is never
//! retried. Error bodies are parsed as S3 XML errors when possible and
//! mapped to the [`StoreError`] taxonomy.

use crate::{
    config::{Credentials, StoreEndpoint, key_prefix},
    services::{
        keys::KeyDeriver,
        signer::{RequestSigner, SignedRequest, canonical_uri},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Method, redirect};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, warn};

pub const CONNECT_TEST_TIMEOUT: Duration = Duration::from_secs(15);
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(45);
pub const DELETE_TIMEOUT: Duration = Duration::from_secs(30);

const ERROR_BODY_PREVIEW: usize = 200;
const USER_AGENT: &str = concat!("media-offload/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object store credentials are not configured")]
    NotConfigured,
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("file is empty: {}", .0.display())]
    FileEmpty(PathBuf),
    #[error("failed to read {}: {source}", path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("network error: {0}")]
    Network(String),
    #[error("request could not be sent: {0}")]
    Request(String),
    #[error("{message}")]
    Auth { code: String, message: String },
    #[error("{message}")]
    NotFound { message: String },
    #[error("{message}")]
    Server { status: u16, message: String },
}

impl StoreError {
    /// Only transport-level failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Network(_))
    }

    /// Credential-level failures: further batches would fail the same way.
    pub fn halts_sync(&self) -> bool {
        matches!(self, StoreError::NotConfigured | StoreError::Auth { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of a successful single-object upload.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct UploadResult {
    pub key: String,
    pub url: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// A fully signed HTTP call handed to a [`Transport`].
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    /// Lower-cased header names.
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    /// The request was built but failed on the wire before a status arrived.
    #[error("send failed: {0}")]
    Send(String),
    /// The request could not be built or sent at all; resending is futile.
    #[error("{0}")]
    Invalid(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Invalid(_))
    }
}

/// Sends signed requests. An error returned here means no HTTP status was
/// received; once a status arrives the call is `Ok(HttpResponse)`, even
/// when its body could not be read.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Production transport backed by `reqwest`. Redirects are not followed.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> StoreResult<Self> {
        let client = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| StoreError::Network(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            // reqwest derives Host from the URL.
            if name.eq_ignore_ascii_case("host") {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder
                .header(reqwest::header::CONTENT_LENGTH, request.body.len())
                .body(request.body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                warn!(status, "failed to read response body: {}", err);
                String::new()
            }
        };

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else if err.is_request() {
        TransportError::Send(err.to_string())
    } else {
        TransportError::Invalid(err.to_string())
    }
}

/// Attempts and pause for network-level failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            pause: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Deserialize)]
struct S3ErrorBody {
    #[serde(rename = "Code")]
    code: Option<String>,
    #[serde(rename = "Message")]
    message: Option<String>,
}

/// Client for the single configured bucket.
#[derive(Clone)]
pub struct ObjectStoreClient {
    credentials: Credentials,
    endpoint: String,
    host: String,
    signer: RequestSigner,
    keys: KeyDeriver,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl ObjectStoreClient {
    pub fn new(credentials: Credentials, store: &StoreEndpoint, transport: Arc<dyn Transport>) -> Self {
        let endpoint = store.url(&credentials);
        let host = endpoint
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&endpoint)
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string();

        Self {
            signer: RequestSigner::new(&credentials),
            keys: KeyDeriver::new(&credentials, store),
            credentials,
            endpoint,
            host,
            transport,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn keys(&self) -> &KeyDeriver {
        &self.keys
    }

    pub fn is_configured(&self) -> bool {
        self.credentials.is_configured()
    }

    fn ensure_configured(&self) -> StoreResult<()> {
        if self.is_configured() {
            Ok(())
        } else {
            Err(StoreError::NotConfigured)
        }
    }

    /// Upload one local file as `variant` of `record_id`.
    ///
    /// Local preconditions (file exists, non-empty) are checked before any
    /// network call. `key_date` places the object under `{YYYY}/{MM}/`.
    pub async fn upload(
        &self,
        record_id: i64,
        local_path: &Path,
        variant: &str,
        key_date: DateTime<Utc>,
    ) -> StoreResult<UploadResult> {
        self.ensure_configured()?;

        let meta = fs::metadata(local_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::FileNotFound(local_path.to_path_buf())
            } else {
                StoreError::FileRead {
                    path: local_path.to_path_buf(),
                    source: err,
                }
            }
        })?;
        if !meta.is_file() {
            return Err(StoreError::FileNotFound(local_path.to_path_buf()));
        }
        if meta.len() == 0 {
            return Err(StoreError::FileEmpty(local_path.to_path_buf()));
        }

        let body = Bytes::from(fs::read(local_path).await.map_err(|source| {
            StoreError::FileRead {
                path: local_path.to_path_buf(),
                source,
            }
        })?);
        if body.is_empty() {
            return Err(StoreError::FileEmpty(local_path.to_path_buf()));
        }

        let filename = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let key = self.keys.derive_key(&filename, variant, key_date);
        let content_type = mime_guess::from_path(local_path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        debug!(
            record_id,
            variant,
            path = %local_path.display(),
            size = body.len(),
            key = %key,
            "uploading object"
        );

        let response = self
            .send(
                Method::PUT,
                &self.object_path(&key),
                body.clone(),
                Some(&content_type),
                UPLOAD_TIMEOUT,
            )
            .await
            .inspect_err(|err| error!(record_id, variant, key = %key, "upload failed: {}", err))?;

        if response.status != 200 {
            let err = self.classify_failure(response.status, &response.body);
            error!(
                record_id,
                variant,
                key = %key,
                status = response.status,
                "upload rejected: {}",
                err
            );
            return Err(err);
        }

        let etag = response
            .headers
            .get("etag")
            .map(|e| e.trim_matches('"').to_string());
        let local_md5 = format!("{:x}", md5::compute(&body));
        if let Some(remote) = etag.as_deref() {
            if !remote.eq_ignore_ascii_case(&local_md5) {
                warn!(record_id, key = %key, remote, local = %local_md5, "etag does not match local md5");
            }
        }

        let url = self.keys.resolve_public_url(&key);
        info!(record_id, variant, key = %key, url = %url, size = body.len(), "upload complete");

        Ok(UploadResult {
            key,
            url,
            size: body.len() as u64,
            etag,
        })
    }

    /// Delete one object. An already-absent key is not an error.
    pub async fn delete(&self, remote_key: &str) -> StoreResult<()> {
        self.ensure_configured()?;

        let response = self
            .send(
                Method::DELETE,
                &self.object_path(remote_key),
                Bytes::new(),
                None,
                DELETE_TIMEOUT,
            )
            .await?;

        match response.status {
            200 | 204 => {
                info!(key = remote_key, "object deleted");
                Ok(())
            }
            404 => {
                debug!(key = remote_key, "object already absent");
                Ok(())
            }
            status => Err(self.classify_failure(status, &response.body)),
        }
    }

    /// HEAD the bucket root. `403` means the credentials authenticate but
    /// cannot list, which still counts as reachable.
    pub async fn test_connection(&self) -> StoreResult<()> {
        self.ensure_configured()?;
        debug!(
            endpoint = %self.endpoint,
            bucket = %self.credentials.bucket_name,
            access_key = %key_prefix(&self.credentials.access_key_id),
            "testing connection"
        );

        let path = format!("/{}/", self.credentials.bucket_name);
        let response = self
            .send(Method::HEAD, &path, Bytes::new(), None, CONNECT_TEST_TIMEOUT)
            .await?;

        match response.status {
            200 | 403 => {
                info!(status = response.status, "connection test succeeded");
                Ok(())
            }
            status => Err(self.classify_failure(status, &response.body)),
        }
    }

    fn object_path(&self, key: &str) -> String {
        format!("/{}/{}", self.credentials.bucket_name, key)
    }

    fn sign(&self, method: &Method, path: &str, body: &[u8], content_type: Option<&str>) -> SignedRequest {
        self.signer
            .sign(method.as_str(), &self.host, path, body, content_type, Utc::now())
    }

    /// Sign and send, re-signing on every attempt. Only wire-level
    /// transport errors are retried; a received status never is.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Bytes,
        content_type: Option<&str>,
        timeout: Duration,
    ) -> StoreResult<HttpResponse> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let signed = self.sign(&method, path, &body, content_type);
            let request = HttpRequest {
                method: method.clone(),
                url: format!("{}{}", self.endpoint, signed.canonical_uri),
                headers: signed.headers,
                body: body.clone(),
                timeout,
            };

            match self.transport.send(request).await {
                Ok(response) => {
                    debug!(method = %method, path, status = response.status, attempt, "object store response");
                    return Ok(response);
                }
                Err(err) if err.is_retryable() && attempt < attempts => {
                    warn!(method = %method, path, attempt, attempts, "network failure, retrying: {}", err);
                    tokio::time::sleep(self.retry.pause).await;
                }
                Err(err) if err.is_retryable() => {
                    return Err(StoreError::Network(err.to_string()));
                }
                Err(err) => {
                    error!(method = %method, path, "request failed: {}", err);
                    return Err(StoreError::Request(err.to_string()));
                }
            }
        }
    }

    /// Map a non-success status and body to a typed error.
    fn classify_failure(&self, status: u16, body: &str) -> StoreError {
        let parsed = parse_error_body(body);

        if let Some((code, message)) = parsed {
            let described = match code.as_str() {
                "AccessDenied" => {
                    "Access denied - check that the credentials have object write permission"
                        .to_string()
                }
                "SignatureDoesNotMatch" => {
                    "Signature mismatch - check the access key id and secret access key".to_string()
                }
                "NoSuchBucket" => format!(
                    "Bucket does not exist - check the bucket name: {}",
                    self.credentials.bucket_name
                ),
                _ => format!("{}: {}", code, message),
            };
            return match code.as_str() {
                "AccessDenied" | "SignatureDoesNotMatch" | "InvalidAccessKeyId" => StoreError::Auth {
                    code,
                    message: described,
                },
                "NoSuchBucket" | "NoSuchKey" => StoreError::NotFound { message: described },
                _ => by_status(status, code, described),
            };
        }

        let preview: String = body.chars().take(ERROR_BODY_PREVIEW).collect();
        let message = if preview.is_empty() {
            format!("HTTP {}", status)
        } else {
            format!("HTTP {}: {}", status, preview)
        };
        by_status(status, String::new(), message)
    }
}

fn by_status(status: u16, code: String, message: String) -> StoreError {
    match status {
        401 | 403 => StoreError::Auth { code, message },
        404 => StoreError::NotFound { message },
        _ => StoreError::Server { status, message },
    }
}

/// `(Code, Message)` of an S3 XML error document.
fn parse_error_body(body: &str) -> Option<(String, String)> {
    let trimmed = body.trim_start();
    if !(trimmed.starts_with("<?xml") || trimmed.starts_with("<Error")) {
        return None;
    }
    let parsed: S3ErrorBody = quick_xml::de::from_str(trimmed).ok()?;
    let code = parsed.code.filter(|c| !c.is_empty())?;
    Some((code, parsed.message.unwrap_or_default()))
}

#[cfg(test)]
pub mod testing {
    //! In-memory transport for tests: answers through a closure and
    //! records every request it sees.

    use super::*;
    use std::sync::Mutex;

    type Responder = dyn Fn(&HttpRequest, usize) -> Result<HttpResponse, TransportError> + Send + Sync;

    pub struct FakeTransport {
        responder: Box<Responder>,
        calls: Mutex<Vec<HttpRequest>>,
    }

    impl FakeTransport {
        /// `responder` gets the request and its zero-based call index.
        pub fn new(
            responder: impl Fn(&HttpRequest, usize) -> Result<HttpResponse, TransportError>
            + Send
            + Sync
            + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                responder: Box::new(responder),
                calls: Mutex::new(Vec::new()),
            })
        }

        /// 200 for PUT/HEAD, 204 for DELETE.
        pub fn ok() -> Arc<Self> {
            Self::new(|req, _| {
                Ok(if req.method == Method::DELETE {
                    HttpResponse::new(204)
                } else {
                    HttpResponse::new(200)
                })
            })
        }

        pub fn calls(&self) -> Vec<HttpRequest> {
            self.calls.lock().unwrap().clone()
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        pub fn puts(&self) -> Vec<HttpRequest> {
            self.calls()
                .into_iter()
                .filter(|r| r.method == Method::PUT)
                .collect()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            let index = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(request.clone());
                calls.len() - 1
            };
            (self.responder)(&request, index)
        }
    }

    pub fn credentials() -> Credentials {
        Credentials {
            account_id: "acct123".into(),
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into(),
            bucket_name: "media".into(),
            custom_public_base_url: Some("https://cdn.example.com".into()),
        }
    }

    pub fn client(transport: Arc<FakeTransport>) -> ObjectStoreClient {
        ObjectStoreClient::new(credentials(), &StoreEndpoint::default(), transport).with_retry_policy(
            RetryPolicy {
                attempts: 3,
                pause: Duration::ZERO,
            },
        )
    }
}
