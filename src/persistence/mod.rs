//! Persistence layer modules.

pub mod db;
pub mod entity_repo;
pub mod handler_repo;
pub mod request_repo;
pub mod schema;

use chrono::{DateTime, Utc};

use crate::models::OperationType;
use crate::{AppError, Result};

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;

fn parse_ts(column: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {column}: {e}")))
}

fn parse_opt_ts(column: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(column, s)).transpose()
}

fn parse_operation(raw: &str) -> Result<OperationType> {
    OperationType::parse(raw).map_err(|_| AppError::Db(format!("invalid operation_type: {raw}")))
}

fn parse_json<T: serde::de::DeserializeOwned>(column: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| AppError::Db(format!("invalid {column}: {e}")))
}
