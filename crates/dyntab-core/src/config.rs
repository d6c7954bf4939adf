//! Engine, orchestrator, and database configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default number of attempts before a retryable job becomes terminal.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default delay before the first retry.
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(1);

/// Default upper bound on the retry delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Default lease taken by a worker on a claimed job.
pub const DEFAULT_MAX_JOB_DURATION: Duration = Duration::from_secs(10 * 60);

/// Default idle delay between queue polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Default number of worker threads.
pub const DEFAULT_WORKER_COUNT: usize = 2;

/// Default time SQLite waits on a locked database.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for the schema job orchestrator and its workers.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Attempts before a retryable failure becomes terminal.
    pub max_attempts: u32,
    /// Delay before the first retry; doubled on each further attempt.
    pub base_backoff: Duration,
    /// Cap on the retry delay.
    pub max_backoff: Duration,
    /// Lease on a claimed job. An expired lease makes the job claimable again.
    pub max_job_duration: Duration,
    /// Number of worker threads.
    pub worker_count: usize,
    /// Sleep between polls when the queue has nothing claimable.
    pub poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff: DEFAULT_BASE_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            max_job_duration: DEFAULT_MAX_JOB_DURATION,
            worker_count: DEFAULT_WORKER_COUNT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl OrchestratorConfig {
    /// Set the maximum number of attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the retry backoff bounds.
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max.max(base);
        self
    }

    /// Set the job lease.
    pub fn with_max_job_duration(mut self, duration: Duration) -> Self {
        self.max_job_duration = duration;
        self
    }

    /// Set the number of workers.
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Delay before retrying after the given (1-based) failed attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Configuration for the embedded SQLite engine.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database file. `None` opens a private in-memory database.
    pub path: Option<PathBuf>,
    /// How long a statement waits on a locked database.
    pub busy_timeout: Duration,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

impl SqliteConfig {
    /// Configuration for a database file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Configuration for an in-memory database.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Set the busy timeout.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }
}

/// Which engine hosts the physical tables.
#[derive(Debug, Clone)]
pub enum EngineConfig {
    /// Embedded SQLite.
    Sqlite(SqliteConfig),
    /// PostgreSQL reached through a connection URL.
    #[cfg(feature = "postgres")]
    Postgres {
        /// Connection URL.
        url: String,
        /// Pool size.
        max_connections: u32,
    },
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::Sqlite(SqliteConfig::default())
    }
}

/// Top-level configuration of a [`crate::Database`].
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Directory holding the sled metadata database.
    pub data_path: PathBuf,
    /// Use a temporary sled database removed on drop.
    pub temporary: bool,
    /// Physical engine.
    pub engine: EngineConfig,
    /// Job orchestration settings.
    pub orchestrator: OrchestratorConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("./dyntab_data"),
            temporary: false,
            engine: EngineConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl DatabaseConfig {
    /// Configuration rooted at a data directory, with SQLite stored alongside.
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        let data_path = data_path.into();
        let sqlite = SqliteConfig::new(data_path.join("tables.sqlite3"));
        Self {
            engine: EngineConfig::Sqlite(sqlite),
            data_path,
            ..Default::default()
        }
    }

    /// Temporary metadata and in-memory SQLite, for tests.
    pub fn temporary() -> Self {
        Self {
            data_path: PathBuf::new(),
            temporary: true,
            ..Default::default()
        }
    }

    /// Set the engine.
    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Set the orchestrator configuration.
    pub fn with_orchestrator(mut self, orchestrator: OrchestratorConfig) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    /// Path of the sled metadata database.
    pub fn metadata_path(&self) -> PathBuf {
        self.data_path.join("metadata")
    }

    pub(crate) fn to_sled_config(&self) -> sled::Config {
        let config = sled::Config::new().use_compression(true);
        if self.temporary {
            config.temporary(true)
        } else {
            config.path(self.metadata_path())
        }
    }
}
