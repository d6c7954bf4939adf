//! Server configuration.

use clap::Parser;
use dyntab_core::config::{
    DatabaseConfig, EngineConfig, OrchestratorConfig, SqliteConfig, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_WORKER_COUNT,
};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Error;

/// Default data directory.
pub const DEFAULT_DATA_PATH: &str = "./data";

/// Default queue poll interval in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 200;

/// Default job lease in seconds (10 minutes).
pub const DEFAULT_MAX_JOB_DURATION_SECS: u64 = 600;

/// Default interval between queue status reports in seconds.
pub const DEFAULT_STATUS_INTERVAL_SECS: u64 = 60;

/// Default Postgres pool size.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// DYNTAB server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory holding metadata and, by default, the SQLite tables file.
    pub data_path: PathBuf,

    /// SQLite file for physical tables. Defaults to `<data_path>/tables.sqlite3`.
    pub sqlite_path: Option<PathBuf>,

    /// Postgres URL; replaces SQLite when set.
    pub postgres_url: Option<String>,

    /// Postgres pool size.
    pub max_connections: u32,

    /// Schema job worker threads.
    pub workers: usize,

    /// Attempts before a retryable job fails terminally.
    pub max_attempts: u32,

    /// Idle delay between queue polls.
    pub poll_interval: Duration,

    /// Lease on a claimed job.
    pub max_job_duration: Duration,

    /// Interval between queue status reports. None disables them.
    pub status_interval: Option<Duration>,
}

impl ServerConfig {
    /// Create a configuration with the given data path.
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
            sqlite_path: None,
            postgres_url: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            workers: DEFAULT_WORKER_COUNT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_job_duration: Duration::from_secs(DEFAULT_MAX_JOB_DURATION_SECS),
            status_interval: Some(Duration::from_secs(DEFAULT_STATUS_INTERVAL_SECS)),
        }
    }

    /// Set the SQLite file.
    pub fn with_sqlite_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.sqlite_path = Some(path.into());
        self
    }

    /// Use Postgres for physical tables.
    pub fn with_postgres_url(mut self, url: impl Into<String>) -> Self {
        self.postgres_url = Some(url.into());
        self
    }

    /// Set the number of workers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the queue poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Disable status reports.
    pub fn without_status(mut self) -> Self {
        self.status_interval = None;
        self
    }

    /// Orchestrator settings.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_worker_count(self.workers)
            .with_max_attempts(self.max_attempts)
            .with_poll_interval(self.poll_interval)
            .with_max_job_duration(self.max_job_duration)
    }

    /// Core database configuration.
    pub fn database_config(&self) -> Result<DatabaseConfig, Error> {
        let config = DatabaseConfig::new(&self.data_path).with_orchestrator(self.orchestrator_config());
        Ok(config.with_engine(self.engine_config()?))
    }

    fn engine_config(&self) -> Result<EngineConfig, Error> {
        match (&self.postgres_url, &self.sqlite_path) {
            (Some(_), Some(_)) => Err(Error::Config(
                "--postgres-url and --sqlite-path are mutually exclusive".to_string(),
            )),
            #[cfg(feature = "postgres")]
            (Some(url), None) => Ok(EngineConfig::Postgres {
                url: url.clone(),
                max_connections: self.max_connections,
            }),
            #[cfg(not(feature = "postgres"))]
            (Some(_), None) => Err(Error::Config(
                "postgres support requires the `postgres` feature".to_string(),
            )),
            (None, Some(path)) => Ok(EngineConfig::Sqlite(SqliteConfig::new(path))),
            (None, None) => Ok(EngineConfig::Sqlite(SqliteConfig::new(
                self.data_path.join("tables.sqlite3"),
            ))),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_PATH)
    }
}

/// Command-line arguments for the server.
#[derive(Parser, Debug)]
#[command(name = "dyntab-server")]
#[command(version, about = "DYNTAB schema job server", long_about = None)]
pub struct Args {
    /// Path to the data directory.
    #[arg(short, long, default_value = DEFAULT_DATA_PATH)]
    pub data_path: PathBuf,

    /// SQLite file for physical tables.
    #[arg(long)]
    pub sqlite_path: Option<PathBuf>,

    /// Postgres URL for physical tables (requires the `postgres` feature).
    #[arg(long)]
    pub postgres_url: Option<String>,

    /// Postgres pool size.
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: u32,

    /// Schema job workers (0 = default).
    #[arg(long, default_value_t = 0)]
    pub workers: usize,

    /// Attempts before a retryable job fails terminally.
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,

    /// Queue poll interval in milliseconds.
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    pub poll_interval_ms: u64,

    /// Job lease in seconds.
    #[arg(long, default_value_t = DEFAULT_MAX_JOB_DURATION_SECS)]
    pub max_job_duration: u64,

    /// Status report interval in seconds. Set to 0 to disable.
    #[arg(long, default_value_t = DEFAULT_STATUS_INTERVAL_SECS)]
    pub status_interval: u64,
}

impl Args {
    /// Convert command-line arguments to server configuration.
    pub fn into_config(self) -> ServerConfig {
        let workers = if self.workers == 0 {
            DEFAULT_WORKER_COUNT
        } else {
            self.workers
        };
        let status_interval = if self.status_interval == 0 {
            None
        } else {
            Some(Duration::from_secs(self.status_interval))
        };

        ServerConfig {
            data_path: self.data_path,
            sqlite_path: self.sqlite_path,
            postgres_url: self.postgres_url,
            max_connections: self.max_connections.max(1),
            workers,
            max_attempts: self.max_attempts.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_job_duration: Duration::from_secs(self.max_job_duration),
            status_interval,
        }
    }
}
