use crate::{
    client::{DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_THRESHOLD},
    storage::{StorageBackendKind, StorageSettings},
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{env, fmt::Display, path::PathBuf, str::FromStr, time::Duration};

const DEFAULT_MAX_REQUEST_BYTES: usize = 32 * 1024 * 1024;
const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub storage: StorageSettings,
    /// Upper bound on a single request body (whole file or one chunk).
    pub max_request_bytes: usize,
    /// Abandoned sessions older than this are swept; zero disables sweeping.
    pub session_ttl: Duration,
}

/// What the binary was asked to do.
#[derive(Debug, Clone)]
pub enum Mode {
    Serve,
    Migrate,
    Upload(UploadArgs),
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Chunked image upload and variant service")]
pub struct Args {
    /// Host to bind to (overrides MEDIA_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides MEDIA_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides MEDIA_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Storage backend: local, gcs or memory (overrides MEDIA_STORAGE_BACKEND)
    #[arg(long)]
    pub storage_backend: Option<StorageBackendKind>,

    /// Directory of the local backend (overrides MEDIA_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<PathBuf>,

    /// Base URL used in links to locally served media (overrides MEDIA_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// GCS bucket name (overrides MEDIA_GCS_BUCKET)
    #[arg(long)]
    pub gcs_bucket: Option<String>,

    /// Maximum request body size in bytes (overrides MEDIA_MAX_REQUEST_BYTES)
    #[arg(long)]
    pub max_request_bytes: Option<usize>,

    /// Seconds before an abandoned upload session is swept (overrides MEDIA_SESSION_TTL_SECS)
    #[arg(long)]
    pub session_ttl_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Upload image files to a running server and print the resulting records
    Upload(UploadArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct UploadArgs {
    /// Upload endpoint
    #[arg(long, default_value = "http://localhost:3000/api/v1/upload-image")]
    pub endpoint: String,

    /// Files at or above this many bytes are sent in chunks
    #[arg(long, default_value_t = DEFAULT_CHUNK_THRESHOLD)]
    pub chunk_threshold: u64,

    /// Bytes per chunk
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: u64,

    /// Image files to upload
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the run mode.
    pub fn from_env_and_args() -> Result<(Self, Mode)> {
        let args = Args::parse();
        Self::from_sources(args, |key| env::var(key).ok())
    }

    /// Merge parsed flags over values looked up by `env`; flags win.
    pub fn from_sources(args: Args, env: impl Fn(&str) -> Option<String>) -> Result<(Self, Mode)> {
        // --- Environment fallback ---
        let env_host = env("MEDIA_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = parse_var(&env, "MEDIA_PORT", 3000u16)?;
        let env_db =
            env("MEDIA_DATABASE_URL").unwrap_or_else(|| "sqlite://./data/meta/media.db".into());
        let env_backend = parse_var(&env, "MEDIA_STORAGE_BACKEND", StorageBackendKind::Local)?;
        let env_storage = env("MEDIA_STORAGE_DIR").unwrap_or_else(|| "./data/objects".into());
        let env_public =
            env("MEDIA_PUBLIC_BASE_URL").unwrap_or_else(|| "http://localhost:3000".into());
        let env_max_request = parse_var(&env, "MEDIA_MAX_REQUEST_BYTES", DEFAULT_MAX_REQUEST_BYTES)?;
        let env_ttl = parse_var(&env, "MEDIA_SESSION_TTL_SECS", DEFAULT_SESSION_TTL_SECS)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            storage: StorageSettings {
                backend: args.storage_backend.unwrap_or(env_backend),
                storage_dir: args.storage_dir.unwrap_or_else(|| PathBuf::from(env_storage)),
                public_base_url: args.public_base_url.unwrap_or(env_public),
                gcs_bucket: args.gcs_bucket.or_else(|| env("MEDIA_GCS_BUCKET")),
                // same lookup order as the GCS SDK
                gcs_service_account: env("SERVICE_ACCOUNT")
                    .or_else(|| env("GOOGLE_APPLICATION_CREDENTIALS"))
                    .filter(|path| !path.trim().is_empty())
                    .map(PathBuf::from),
            },
            max_request_bytes: args.max_request_bytes.unwrap_or(env_max_request),
            session_ttl: Duration::from_secs(args.session_ttl_secs.unwrap_or(env_ttl)),
        };

        let mode = match args.command {
            Some(Command::Upload(upload)) => Mode::Upload(upload),
            None if args.migrate => Mode::Migrate,
            None => Mode::Serve,
        };

        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// How often the stale-session sweeper runs.
    pub fn sweep_interval(&self) -> Duration {
        self.session_ttl.min(Duration::from_secs(600))
    }
}

fn parse_var<T>(env: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env(key) {
        Some(value) => value
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        None => Ok(default),
    }
}
