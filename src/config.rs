use crate::models::sync::SyncMode;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{env, fmt, path::PathBuf, str::FromStr, time::Duration};

/// Default object-store domain; the endpoint is `https://{account_id}.{domain}`.
pub const DEFAULT_STORE_DOMAIN: &str = "r2.cloudflarestorage.com";

/// Credentials for the single bucket this service offloads to.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub account_id: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub custom_public_base_url: Option<String>,
}

impl Credentials {
    /// All four required fields are non-empty.
    pub fn is_configured(&self) -> bool {
        !self.account_id.trim().is_empty()
            && !self.access_key_id.trim().is_empty()
            && !self.secret_access_key.trim().is_empty()
            && !self.bucket_name.trim().is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("account_id", &self.account_id)
            .field("access_key_id", &key_prefix(&self.access_key_id))
            .field("secret_access_key", &"<redacted>")
            .field("bucket_name", &self.bucket_name)
            .field("custom_public_base_url", &self.custom_public_base_url)
            .finish()
    }
}

/// First four characters of a key id, for log output.
pub fn key_prefix(key: &str) -> String {
    let prefix: String = key.chars().take(4).collect();
    format!("{}...", prefix)
}

/// Which variants of a record are uploaded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UploadMode {
    /// Only the primary file.
    #[default]
    FullOnly,
    /// The primary file and every derived size.
    AllSizes,
}

impl FromStr for UploadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "full_only" | "fullonly" => Ok(UploadMode::FullOnly),
            "all_sizes" | "allsizes" => Ok(UploadMode::AllSizes),
            other => Err(format!("unknown upload mode `{}`", other)),
        }
    }
}

/// Offload behavior shared by the ingest path, the batch engine and the
/// URL resolver.
#[derive(Clone, Debug, Default)]
pub struct OffloadPolicy {
    pub upload_mode: UploadMode,
    pub delete_local_after_upload: bool,
    pub enable_url_rewrite: bool,
    pub auto_offload: bool,
}

/// Where the object store lives.
#[derive(Clone, Debug)]
pub struct StoreEndpoint {
    pub store_domain: String,
    /// Full endpoint override (S3-compatible stores, local testing).
    pub endpoint: Option<String>,
}

impl StoreEndpoint {
    pub fn url(&self, credentials: &Credentials) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://{}.{}", credentials.account_id, self.store_domain),
        }
    }
}

impl Default for StoreEndpoint {
    fn default() -> Self {
        Self {
            store_domain: DEFAULT_STORE_DOMAIN.into(),
            endpoint: None,
        }
    }
}

/// Periodic background sync.
#[derive(Clone, Debug)]
pub struct AutoSyncConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub batch_size: i64,
    pub mode: SyncMode,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub uploads_dir: PathBuf,
    pub uploads_base_url: String,
    pub credentials: Credentials,
    pub store: StoreEndpoint,
    pub policy: OffloadPolicy,
    pub auto_sync: AutoSyncConfig,
    pub enable_debug_logging: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Offload a media library to an S3-compatible bucket")]
pub struct Args {
    /// Host to bind to (overrides MEDIA_OFFLOAD_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides MEDIA_OFFLOAD_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides MEDIA_OFFLOAD_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Local media root (overrides MEDIA_OFFLOAD_UPLOADS_DIR)
    #[arg(long)]
    pub uploads_dir: Option<PathBuf>,

    /// Public URL of the local media root (overrides MEDIA_OFFLOAD_UPLOADS_BASE_URL)
    #[arg(long)]
    pub uploads_base_url: Option<String>,

    /// Object store endpoint override (overrides MEDIA_OFFLOAD_ENDPOINT)
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Enable debug logging (overrides MEDIA_OFFLOAD_DEBUG)
    #[arg(long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the HTTP service (default)
    Serve,
    /// Run migrations and exit
    Migrate,
    /// Sync the media library in batches until done or interrupted
    Sync {
        #[arg(long, default_value = "full")]
        mode: SyncMode,
        #[arg(long, default_value_t = 10)]
        batch_size: i64,
        #[arg(long, default_value_t = 500)]
        delay_ms: u64,
        /// Re-derive variant lists before uploading
        #[arg(long)]
        regenerate_metadata: bool,
    },
    /// Probe the bucket with the configured credentials
    TestConnection,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the command to run.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env_or("MEDIA_OFFLOAD_HOST", "0.0.0.0");
        let env_port = env_parse("MEDIA_OFFLOAD_PORT", 3000u16)?;
        let env_db = env_or(
            "MEDIA_OFFLOAD_DATABASE_URL",
            "sqlite://./data/meta/media_offload.db",
        );
        let env_uploads = env_or("MEDIA_OFFLOAD_UPLOADS_DIR", "./data/uploads");
        let env_base_url = env_or(
            "MEDIA_OFFLOAD_UPLOADS_BASE_URL",
            "http://localhost:3000/uploads",
        );

        let credentials = Credentials {
            account_id: env_or("MEDIA_OFFLOAD_ACCOUNT_ID", ""),
            access_key_id: env_or("MEDIA_OFFLOAD_ACCESS_KEY_ID", ""),
            secret_access_key: env_or("MEDIA_OFFLOAD_SECRET_ACCESS_KEY", ""),
            bucket_name: env_or("MEDIA_OFFLOAD_BUCKET", ""),
            custom_public_base_url: env_opt("MEDIA_OFFLOAD_PUBLIC_URL"),
        };

        let store = StoreEndpoint {
            store_domain: env_or("MEDIA_OFFLOAD_STORE_DOMAIN", DEFAULT_STORE_DOMAIN),
            endpoint: args.endpoint.or_else(|| env_opt("MEDIA_OFFLOAD_ENDPOINT")),
        };

        let policy = OffloadPolicy {
            upload_mode: env_parse("MEDIA_OFFLOAD_UPLOAD_MODE", UploadMode::AllSizes)?,
            delete_local_after_upload: env_parse("MEDIA_OFFLOAD_DELETE_LOCAL", false)?,
            enable_url_rewrite: env_parse("MEDIA_OFFLOAD_URL_REWRITE", true)?,
            auto_offload: env_parse("MEDIA_OFFLOAD_AUTO_OFFLOAD", true)?,
        };

        let auto_sync = AutoSyncConfig {
            enabled: env_parse("MEDIA_OFFLOAD_AUTO_SYNC", false)?,
            interval: Duration::from_secs(env_parse("MEDIA_OFFLOAD_AUTO_SYNC_INTERVAL_SECS", 3600u64)?),
            batch_size: env_parse("MEDIA_OFFLOAD_AUTO_SYNC_BATCH_SIZE", 10i64)?,
            mode: env_parse("MEDIA_OFFLOAD_AUTO_SYNC_MODE", SyncMode::Full)?,
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            uploads_dir: args.uploads_dir.unwrap_or_else(|| env_uploads.into()),
            uploads_base_url: args.uploads_base_url.unwrap_or(env_base_url),
            credentials,
            store,
            policy,
            auto_sync,
            enable_debug_logging: args.debug || env_parse("MEDIA_OFFLOAD_DEBUG", false)?,
        };

        Ok((cfg, args.command.unwrap_or(Command::Serve)))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.into())
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials {
            account_id: "acct".into(),
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: "secret".into(),
            bucket_name: "media".into(),
            custom_public_base_url: None,
        }
    }

    #[test]
    fn configured_requires_all_four_fields() {
        assert!(creds().is_configured());
        let mut missing = creds();
        missing.bucket_name = "  ".into();
        assert!(!missing.is_configured());
    }

    #[test]
    fn debug_output_redacts_secret() {
        let out = format!("{:?}", creds());
        assert!(!out.contains("secret\""));
        assert!(out.contains("<redacted>"));
        assert!(out.contains("AKID..."));
    }

    #[test]
    fn endpoint_defaults_to_account_subdomain() {
        let store = StoreEndpoint::default();
        assert_eq!(store.url(&creds()), "https://acct.r2.cloudflarestorage.com");

        let custom = StoreEndpoint {
            endpoint: Some("http://127.0.0.1:9000/".into()),
            ..StoreEndpoint::default()
        };
        assert_eq!(custom.url(&creds()), "http://127.0.0.1:9000");
    }

    #[test]
    fn upload_mode_parses_both_spellings() {
        assert_eq!("full_only".parse::<UploadMode>(), Ok(UploadMode::FullOnly));
        assert_eq!("all-sizes".parse::<UploadMode>(), Ok(UploadMode::AllSizes));
        assert!("thumbs".parse::<UploadMode>().is_err());
    }
}
