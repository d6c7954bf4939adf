//! Database handle wiring metadata, engine, jobs and record access together.

use std::sync::Arc;

use crate::blob::{BlobStore, MemoryBlobStore};
use crate::catalog::MetadataStore;
use crate::config::{DatabaseConfig, EngineConfig};
use crate::ddl::DdlService;
use crate::engine::{Engine, SqliteEngine};
use crate::error::Result;
use crate::jobs::{JobOrchestrator, JobQueue, JobWorkerPool};
use crate::records::RecordAccess;
use crate::service::SchemaService;
use crate::webhook::{TracingWebhookSink, WebhookSink};

/// An open dynamic schema database.
pub struct Database {
    db: sled::Db,
    catalog: MetadataStore,
    queue: JobQueue,
    engine: Arc<dyn Engine>,
    schema: SchemaService,
    orchestrator: Arc<JobOrchestrator>,
    records: RecordAccess,
}

impl Database {
    /// Open with an in-memory blob store and a logging webhook sink.
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        Self::open_with(
            config,
            Arc::new(MemoryBlobStore::new()),
            Arc::new(TracingWebhookSink),
        )
    }

    /// Open with explicit blob store and webhook sink.
    pub fn open_with(
        config: DatabaseConfig,
        blobs: Arc<dyn BlobStore>,
        webhooks: Arc<dyn WebhookSink>,
    ) -> Result<Self> {
        if !config.temporary {
            std::fs::create_dir_all(&config.data_path)?;
        }

        let db = config.to_sled_config().open()?;
        let engine = Self::open_engine(&config.engine)?;
        let catalog = MetadataStore::open(&db)?;
        let queue = JobQueue::open(&db)?;

        let orchestrator = Arc::new(JobOrchestrator::new(
            catalog.clone(),
            queue.clone(),
            DdlService::new(engine.clone()),
            config.orchestrator.clone(),
        ));
        let schema = SchemaService::new(catalog.clone(), queue.clone());
        let records = RecordAccess::new(catalog.clone(), engine.clone(), blobs, webhooks);

        tracing::info!(
            path = %config.data_path.display(),
            engine = engine.name(),
            pending_jobs = queue.pending_count(),
            "opened database"
        );

        Ok(Self {
            db,
            catalog,
            queue,
            engine,
            schema,
            orchestrator,
            records,
        })
    }

    fn open_engine(config: &EngineConfig) -> Result<Arc<dyn Engine>> {
        match config {
            EngineConfig::Sqlite(sqlite) => Ok(Arc::new(SqliteEngine::open(sqlite)?)),
            #[cfg(feature = "postgres")]
            EngineConfig::Postgres {
                url,
                max_connections,
            } => Ok(Arc::new(crate::engine::PostgresEngine::connect(
                url,
                *max_connections,
            )?)),
        }
    }

    /// Table and field metadata.
    pub fn catalog(&self) -> &MetadataStore {
        &self.catalog
    }

    /// Metadata mutations.
    pub fn schema(&self) -> &SchemaService {
        &self.schema
    }

    /// Record CRUD.
    pub fn records(&self) -> &RecordAccess {
        &self.records
    }

    /// The job queue.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// The job orchestrator, for running jobs inline or from workers.
    pub fn orchestrator(&self) -> &Arc<JobOrchestrator> {
        &self.orchestrator
    }

    /// The physical engine.
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Start background workers draining the job queue.
    pub fn start_workers(&self) -> Result<JobWorkerPool> {
        JobWorkerPool::start(self.orchestrator.clone())
    }

    /// Flush metadata and jobs to disk.
    pub fn flush(&self) -> Result<()> {
        self.catalog.flush()?;
        self.queue.flush()?;
        self.db.flush()?;
        Ok(())
    }
}
