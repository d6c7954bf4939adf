//! DYNTAB Server library.
//!
//! Runs the schema job workers of a DYNTAB database as a standalone process.

pub mod config;
pub mod error;
pub mod server;
pub mod status;

pub use config::{Args, ServerConfig};
pub use error::Error;
pub use server::run;
pub use status::StatusTask;
