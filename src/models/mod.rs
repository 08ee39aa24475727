//! Audit record model declarations.

pub mod entity;
pub mod handler;
pub mod operation;
pub mod request;

use chrono::{DateTime, Utc};

/// Elapsed milliseconds between two instants, never negative.
pub(crate) fn elapsed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_milliseconds().max(0)
}

pub use entity::EntityAuditRecord;
pub use handler::HandlerAuditRecord;
pub use operation::OperationType;
pub use request::RequestAuditRecord;
