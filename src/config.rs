use crate::services::ingest::DEFAULT_BATCH_SIZE;
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};
use thiserror::Error;

/// Where upload sessions live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SessionBackend {
    /// Survives restarts; default.
    Sqlite,
    /// Lost on restart, for single-node development.
    Memory,
}

#[derive(Debug, Error)]
#[error("unknown session backend `{0}`, expected `sqlite` or `memory`")]
pub struct UnknownSessionBackend(String);

impl FromStr for SessionBackend {
    type Err = UnknownSessionBackend;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(SessionBackend::Sqlite),
            "memory" => Ok(SessionBackend::Memory),
            _ => Err(UnknownSessionBackend(value.to_string())),
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub session_ttl_secs: u64,
    pub reaper_interval_secs: u64,
    pub batch_size: usize,
    pub workers: usize,
    pub max_chunk_bytes: usize,
    pub session_backend: SessionBackend,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Resumable CSV contact import service")]
pub struct Args {
    /// Host to bind to (overrides CONTACT_IMPORT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CONTACT_IMPORT_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where uploaded objects are stored (overrides CONTACT_IMPORT_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides CONTACT_IMPORT_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Upload session lifetime in seconds (overrides CONTACT_IMPORT_SESSION_TTL_SECS)
    #[arg(long)]
    pub session_ttl_secs: Option<u64>,

    /// Seconds between expired-session sweeps (overrides CONTACT_IMPORT_REAPER_INTERVAL_SECS)
    #[arg(long)]
    pub reaper_interval_secs: Option<u64>,

    /// Rows per ingest batch (overrides CONTACT_IMPORT_BATCH_SIZE)
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Number of ingest workers (overrides CONTACT_IMPORT_WORKERS)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Largest accepted chunk body in bytes (overrides CONTACT_IMPORT_MAX_CHUNK_BYTES)
    #[arg(long)]
    pub max_chunk_bytes: Option<usize>,

    /// Upload session store (overrides CONTACT_IMPORT_SESSION_BACKEND)
    #[arg(long, value_enum)]
    pub session_backend: Option<SessionBackend>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

const ENV_PREFIX: &str = "CONTACT_IMPORT_";
const MAX_SESSION_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Read `CONTACT_IMPORT_{name}`, parsing it when present.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let var = format!("{ENV_PREFIX}{name}");
    match env::var(&var) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", var, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", var)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        Self::from_args(Args::parse())
    }

    fn from_args(args: Args) -> Result<(Self, bool)> {
        let cfg = Self {
            host: match args.host {
                Some(host) => host,
                None => env_or("HOST", "0.0.0.0".to_string())?,
            },
            port: match args.port {
                Some(port) => port,
                None => env_or("PORT", 3000)?,
            },
            storage_dir: match args.storage_dir {
                Some(dir) => dir,
                None => env_or("STORAGE_DIR", "./data/objects".to_string())?,
            },
            database_url: match args.database_url {
                Some(url) => url,
                None => env_or(
                    "DATABASE_URL",
                    "sqlite://./data/meta/contact_import.db".to_string(),
                )?,
            },
            session_ttl_secs: match args.session_ttl_secs {
                Some(secs) => secs,
                None => env_or("SESSION_TTL_SECS", 6 * 60 * 60)?,
            },
            reaper_interval_secs: match args.reaper_interval_secs {
                Some(secs) => secs,
                None => env_or("REAPER_INTERVAL_SECS", 300)?,
            },
            batch_size: match args.batch_size {
                Some(size) => size,
                None => env_or("BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
            },
            workers: match args.workers {
                Some(workers) => workers,
                None => env_or("WORKERS", 4)?,
            },
            max_chunk_bytes: match args.max_chunk_bytes {
                Some(bytes) => bytes,
                None => env_or("MAX_CHUNK_BYTES", 64 * 1024 * 1024)?,
            },
            session_backend: match args.session_backend {
                Some(backend) => backend,
                None => env_or("SESSION_BACKEND", SessionBackend::Sqlite)?,
            },
        };

        if !(1..=MAX_SESSION_TTL_SECS).contains(&cfg.session_ttl_secs) {
            anyhow::bail!("session TTL must be between 1 and {} seconds", MAX_SESSION_TTL_SECS);
        }
        if cfg.batch_size == 0 {
            anyhow::bail!("batch size must be at least 1");
        }
        if cfg.workers == 0 {
            anyhow::bail!("at least one ingest worker is required");
        }

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        // Bounded by MAX_SESSION_TTL_SECS.
        chrono::Duration::seconds(self.session_ttl_secs as i64)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_values_override_defaults() {
        let (cfg, migrate) = AppConfig::from_args(Args {
            port: Some(8080),
            batch_size: Some(250),
            workers: Some(2),
            session_ttl_secs: Some(60),
            migrate: true,
            ..Default::default()
        })
        .unwrap();
        assert!(migrate);
        assert_eq!(cfg.addr().rsplit(':').next(), Some("8080"));
        assert_eq!(cfg.batch_size, 250);
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.session_ttl(), chrono::Duration::seconds(60));
    }

    #[test]
    fn session_backend_parses_case_insensitively() {
        assert_eq!("Memory".parse::<SessionBackend>().unwrap(), SessionBackend::Memory);
        assert_eq!("sqlite".parse::<SessionBackend>().unwrap(), SessionBackend::Sqlite);
        assert!("redis".parse::<SessionBackend>().is_err());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let result = AppConfig::from_args(Args {
            batch_size: Some(0),
            ..Default::default()
        });
        assert!(result.is_err());
    }
}
