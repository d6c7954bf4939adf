//! DYNTAB Core - Dynamic schema engine.
//!
//! Tenants describe tables and fields as metadata at runtime; this crate
//! materializes and evolves real physical tables to match. Metadata
//! mutations enqueue durable schema jobs which workers apply through an
//! engine adapter, and the record layer runs generic CRUD against whatever
//! physical schema currently exists.

mod codec;

pub mod blob;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod database;
pub mod ddl;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod naming;
pub mod records;
pub mod service;
pub mod types;
pub mod webhook;

pub use blob::{BlobHandle, BlobRef, BlobStore, MemoryBlobStore};
pub use catalog::{
    FieldDef, FieldSpec, FieldUpdate, MetadataStore, NewField, NewTable, SyncFailure, TableDef,
    TableUpdate,
};
pub use config::{DatabaseConfig, EngineConfig, OrchestratorConfig, SqliteConfig};
pub use database::Database;
pub use ddl::{DdlOutcome, DdlService};
pub use engine::{Engine, EngineError, SqliteEngine};
pub use error::{Error, FailureClass, Result, SchemaApplyError};
pub use jobs::{Job, JobOperation, JobOrchestrator, JobOutcome, JobQueue, JobReport, JobStatus, JobWorkerPool};
pub use records::{Record, RecordAccess, RecordPage, RecordQuery, ResolvedSchema};
pub use service::{Accepted, SchemaService};
pub use types::{FieldType, SqlValue};
pub use webhook::{ChannelWebhookSink, TracingWebhookSink, WebhookEvent, WebhookSink};

#[cfg(feature = "postgres")]
pub use engine::PostgresEngine;
