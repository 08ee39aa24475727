#![forbid(unsafe_code)]

//! Hierarchical audit trail: request, handler and entity-change records
//! linked by an ambient correlation id.

pub mod config;
pub mod context;
pub mod diff;
pub mod errors;
pub mod identity;
pub mod middleware;
pub mod models;
pub mod persistence;
pub mod recorder;
pub mod redact;
pub mod store;

pub use config::AuditConfig;
pub use errors::{AppError, Result};
