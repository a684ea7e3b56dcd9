use crate::services::storage_service::PipelineConfig;
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, num::NonZeroUsize, str::FromStr, time::Duration};

const ENV_PREFIX: &str = "SEGMENT_STORE_";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub segment_size_mb: usize,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
    pub redis_url: Option<String>,
    pub max_inflight_fetches: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Segmented file store")]
pub struct Args {
    /// Host to bind to (overrides SEGMENT_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides SEGMENT_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where segment blobs are stored (overrides SEGMENT_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides SEGMENT_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Segment size in MiB (overrides SEGMENT_STORE_SEGMENT_SIZE_MB)
    #[arg(long)]
    pub segment_size_mb: Option<usize>,

    /// Metadata cache TTL in seconds (overrides SEGMENT_STORE_CACHE_TTL_SECS)
    #[arg(long)]
    pub cache_ttl_secs: Option<u64>,

    /// In-process cache capacity (overrides SEGMENT_STORE_CACHE_CAPACITY)
    #[arg(long)]
    pub cache_capacity: Option<usize>,

    /// Redis URL for a shared metadata cache (overrides SEGMENT_STORE_REDIS_URL)
    #[arg(long)]
    pub redis_url: Option<String>,

    /// Max concurrent segment fetches per read (overrides SEGMENT_STORE_MAX_INFLIGHT_FETCHES)
    #[arg(long)]
    pub max_inflight_fetches: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::merge(args, |key| env::var(key))?;
        Ok((cfg, migrate))
    }

    /// CLI values win over `lookup`, which wins over defaults.
    fn merge<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let string = |name: &str, default: &str| -> Result<String> {
            Ok(env_value(&lookup, name)?.unwrap_or_else(|| default.to_string()))
        };

        let cfg = Self {
            host: match args.host {
                Some(v) => v,
                None => string("HOST", "0.0.0.0")?,
            },
            port: match args.port {
                Some(v) => v,
                None => env_parsed(&lookup, "PORT")?.unwrap_or(8080),
            },
            storage_dir: match args.storage_dir {
                Some(v) => v,
                None => string("STORAGE_DIR", "./data/segments")?,
            },
            database_url: match args.database_url {
                Some(v) => v,
                None => string("DATABASE_URL", "sqlite://./data/meta/segment_store.db")?,
            },
            segment_size_mb: match args.segment_size_mb {
                Some(v) => v,
                None => env_parsed(&lookup, "SEGMENT_SIZE_MB")?.unwrap_or(1),
            },
            cache_ttl_secs: match args.cache_ttl_secs {
                Some(v) => v,
                None => env_parsed(&lookup, "CACHE_TTL_SECS")?.unwrap_or(300),
            },
            cache_capacity: match args.cache_capacity {
                Some(v) => v,
                None => env_parsed(&lookup, "CACHE_CAPACITY")?.unwrap_or(10_000),
            },
            redis_url: match args.redis_url {
                Some(v) => Some(v),
                None => env_value(&lookup, "REDIS_URL")?,
            }
            .filter(|url| !url.trim().is_empty()),
            max_inflight_fetches: match args.max_inflight_fetches {
                Some(v) => v,
                None => env_parsed(&lookup, "MAX_INFLIGHT_FETCHES")?.unwrap_or(16),
            },
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.segment_size_mb == 0 {
            bail!("segment_size_mb must be positive");
        }
        if self.segment_size_mb.checked_mul(1024 * 1024).is_none() {
            bail!("segment_size_mb `{}` is too large", self.segment_size_mb);
        }
        if self.cache_capacity == 0 {
            bail!("cache_capacity must be positive");
        }
        if self.max_inflight_fetches == 0 {
            bail!("max_inflight_fetches must be positive");
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn cache_capacity(&self) -> Result<NonZeroUsize> {
        NonZeroUsize::new(self.cache_capacity).context("cache_capacity must be positive")
    }

    /// The subset of settings the storage pipeline needs.
    pub fn pipeline(&self) -> Result<PipelineConfig> {
        let segment_bytes = self
            .segment_size_mb
            .checked_mul(1024 * 1024)
            .context("segment_size_mb overflows")?;
        Ok(PipelineConfig {
            segment_size: NonZeroUsize::new(segment_bytes)
                .context("segment_size_mb must be positive")?,
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            max_inflight: NonZeroUsize::new(self.max_inflight_fetches)
                .context("max_inflight_fetches must be positive")?,
        })
    }
}

fn env_value<F>(lookup: &F, name: &str) -> Result<Option<String>>
where
    F: Fn(&str) -> Result<String, env::VarError>,
{
    let key = format!("{}{}", ENV_PREFIX, name);
    match lookup(&key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

fn env_parsed<F, T>(lookup: &F, name: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Result<String, env::VarError>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_value(lookup, name)? {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {}{} value `{}`", ENV_PREFIX, name, value)),
        None => Ok(None),
    }
}
