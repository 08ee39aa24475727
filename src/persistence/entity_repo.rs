//! Entity audit record repository for `SQLite` persistence.
//!
//! Inserts go through any `SQLite` executor so the records can join the
//! transaction whose changes they describe.

use std::sync::Arc;

use sqlx::SqliteExecutor;

use crate::models::EntityAuditRecord;
use crate::Result;

use super::db::Database;
use super::{parse_json, parse_operation, parse_opt_ts, parse_ts};

/// Repository wrapper around `SQLite` for entity audit records.
#[derive(Clone)]
pub struct EntityRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct EntityRow {
    id: String,
    handler_audit_log_id: Option<String>,
    correlation_id: Option<String>,
    tenant_id: Option<String>,
    entity_type: String,
    entity_id: String,
    operation_type: String,
    diff: String,
    timestamp: String,
    is_archived: i64,
    archived_at: Option<String>,
}

impl EntityRow {
    fn into_record(self) -> Result<EntityAuditRecord> {
        Ok(EntityAuditRecord {
            id: self.id,
            handler_audit_log_id: self.handler_audit_log_id,
            correlation_id: self.correlation_id,
            tenant_id: self.tenant_id,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            operation_type: parse_operation(&self.operation_type)?,
            diff: parse_json("diff", &self.diff)?,
            timestamp: parse_ts("timestamp", &self.timestamp)?,
            is_archived: self.is_archived != 0,
            archived_at: parse_opt_ts("archived_at", self.archived_at.as_deref())?,
        })
    }
}

/// Insert one entity record through `executor` (a pool or an open transaction).
///
/// # Errors
///
/// Returns `AppError::Db` if the insert fails.
pub async fn insert_with<'e, E>(executor: E, record: &EntityAuditRecord) -> Result<()>
where
    E: SqliteExecutor<'e>,
{
    let diff = serde_json::to_string(&record.diff)?;

    sqlx::query(
        "INSERT INTO entity_audit_log (id, handler_audit_log_id, correlation_id, tenant_id,
         entity_type, entity_id, operation_type, diff, timestamp, is_archived, archived_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )
    .bind(&record.id)
    .bind(&record.handler_audit_log_id)
    .bind(&record.correlation_id)
    .bind(&record.tenant_id)
    .bind(&record.entity_type)
    .bind(&record.entity_id)
    .bind(record.operation_type.as_str())
    .bind(&diff)
    .bind(record.timestamp.to_rfc3339())
    .bind(i64::from(record.is_archived))
    .bind(record.archived_at.map(|dt| dt.to_rfc3339()))
    .execute(executor)
    .await?;

    Ok(())
}

impl EntityRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert entity records outside any business transaction.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if any insert fails.
    pub async fn insert_all(&self, records: &[EntityAuditRecord]) -> Result<()> {
        let mut tx = self.db.begin().await?;
        for record in records {
            insert_with(&mut *tx, record).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// List entity records written under handler `handler_id`, in capture order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_by_handler(&self, handler_id: &str) -> Result<Vec<EntityAuditRecord>> {
        let rows: Vec<EntityRow> = sqlx::query_as(
            "SELECT * FROM entity_audit_log WHERE handler_audit_log_id = ?1 ORDER BY rowid ASC",
        )
        .bind(handler_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(EntityRow::into_record).collect()
    }

    /// List entity records sharing `correlation_id`, in capture order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_by_correlation(&self, correlation_id: &str) -> Result<Vec<EntityAuditRecord>> {
        let rows: Vec<EntityRow> = sqlx::query_as(
            "SELECT * FROM entity_audit_log WHERE correlation_id = ?1 ORDER BY rowid ASC",
        )
        .bind(correlation_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(EntityRow::into_record).collect()
    }
}
