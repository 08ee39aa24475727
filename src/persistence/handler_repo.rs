//! Handler audit record repository for `SQLite` persistence.

use std::sync::Arc;

use crate::diff::PatchOperation;
use crate::models::handler::ERROR_SEPARATOR;
use crate::models::HandlerAuditRecord;
use crate::{AppError, Result};

use super::db::Database;
use super::{parse_json, parse_operation, parse_opt_ts, parse_ts};

/// Repository wrapper around `SQLite` for handler audit records.
#[derive(Clone)]
pub struct HandlerRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct HandlerRow {
    id: String,
    http_request_audit_log_id: Option<String>,
    correlation_id: String,
    tenant_id: Option<String>,
    user_id: Option<String>,
    handler_name: String,
    operation_type: String,
    page_context: Option<String>,
    action_description: Option<String>,
    target_display_name: Option<String>,
    target_dto_type: Option<String>,
    target_dto_id: Option<String>,
    dto_diff: Option<String>,
    input_parameters: Option<String>,
    output_result: Option<String>,
    start_time: String,
    end_time: Option<String>,
    duration_ms: Option<i64>,
    is_success: i64,
    error_message: Option<String>,
    is_archived: i64,
    archived_at: Option<String>,
}

impl HandlerRow {
    fn into_record(self) -> Result<HandlerAuditRecord> {
        let dto_diff: Option<Vec<PatchOperation>> = self
            .dto_diff
            .as_deref()
            .map(|raw| parse_json("dto_diff", raw))
            .transpose()?;

        Ok(HandlerAuditRecord {
            id: self.id,
            http_request_audit_log_id: self.http_request_audit_log_id,
            correlation_id: self.correlation_id,
            tenant_id: self.tenant_id,
            user_id: self.user_id,
            handler_name: self.handler_name,
            operation_type: parse_operation(&self.operation_type)?,
            page_context: self.page_context,
            action_description: self.action_description,
            target_display_name: self.target_display_name,
            target_dto_type: self.target_dto_type,
            target_dto_id: self.target_dto_id,
            dto_diff,
            input_parameters: self
                .input_parameters
                .as_deref()
                .map(|raw| parse_json("input_parameters", raw))
                .transpose()?,
            output_result: self
                .output_result
                .as_deref()
                .map(|raw| parse_json("output_result", raw))
                .transpose()?,
            start_time: parse_ts("start_time", &self.start_time)?,
            end_time: parse_opt_ts("end_time", self.end_time.as_deref())?,
            duration_ms: self.duration_ms,
            is_success: self.is_success != 0,
            error_message: self.error_message,
            is_archived: self.is_archived != 0,
            archived_at: parse_opt_ts("archived_at", self.archived_at.as_deref())?,
        })
    }
}

fn to_json_opt<T: serde::Serialize>(value: Option<&T>) -> Result<Option<String>> {
    value
        .map(|v| serde_json::to_string(v).map_err(AppError::from))
        .transpose()
}

impl HandlerRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a newly started handler record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database insert fails.
    pub async fn insert(&self, record: &HandlerAuditRecord) -> Result<()> {
        let dto_diff = to_json_opt(record.dto_diff.as_ref())?;
        let input = to_json_opt(record.input_parameters.as_ref())?;
        let output = to_json_opt(record.output_result.as_ref())?;

        sqlx::query(
            "INSERT INTO handler_audit_log (id, http_request_audit_log_id, correlation_id,
             tenant_id, user_id, handler_name, operation_type, page_context, action_description,
             target_display_name, target_dto_type, target_dto_id, dto_diff, input_parameters,
             output_result, start_time, end_time, duration_ms, is_success, error_message,
             is_archived, archived_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
             ?17, ?18, ?19, ?20, ?21, ?22)",
        )
        .bind(&record.id)
        .bind(&record.http_request_audit_log_id)
        .bind(&record.correlation_id)
        .bind(&record.tenant_id)
        .bind(&record.user_id)
        .bind(&record.handler_name)
        .bind(record.operation_type.as_str())
        .bind(&record.page_context)
        .bind(&record.action_description)
        .bind(&record.target_display_name)
        .bind(&record.target_dto_type)
        .bind(&record.target_dto_id)
        .bind(&dto_diff)
        .bind(&input)
        .bind(&output)
        .bind(record.start_time.to_rfc3339())
        .bind(record.end_time.map(|dt| dt.to_rfc3339()))
        .bind(record.duration_ms)
        .bind(i64::from(record.is_success))
        .bind(&record.error_message)
        .bind(i64::from(record.is_archived))
        .bind(record.archived_at.map(|dt| dt.to_rfc3339()))
        .execute(self.db.as_ref())
        .await?;

        Ok(())
    }

    /// Persist the completion fields of `record`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no row has the record's id.
    /// Returns `AppError::Db` if the update fails.
    pub async fn complete(&self, record: &HandlerAuditRecord) -> Result<()> {
        let dto_diff = to_json_opt(record.dto_diff.as_ref())?;
        let output = to_json_opt(record.output_result.as_ref())?;

        let result = sqlx::query(
            "UPDATE handler_audit_log
             SET dto_diff = ?1, output_result = ?2, end_time = ?3, duration_ms = ?4,
                 is_success = ?5, error_message = ?6
             WHERE id = ?7",
        )
        .bind(&dto_diff)
        .bind(&output)
        .bind(record.end_time.map(|dt| dt.to_rfc3339()))
        .bind(record.duration_ms)
        .bind(i64::from(record.is_success))
        .bind(&record.error_message)
        .bind(&record.id)
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "handler audit record {} not found",
                record.id
            )));
        }
        Ok(())
    }

    /// Flag a handler record as failed, appending `message` to any prior error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no row has `id`.
    /// Returns `AppError::Db` if the update fails.
    pub async fn mark_failed(&self, id: &str, message: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE handler_audit_log
             SET is_success = 0,
                 error_message = CASE
                     WHEN error_message IS NULL OR error_message = '' THEN ?1
                     ELSE error_message || ?2 || ?1
                 END
             WHERE id = ?3",
        )
        .bind(message)
        .bind(ERROR_SEPARATOR)
        .bind(id)
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "handler audit record {id} not found"
            )));
        }
        Ok(())
    }

    /// Retrieve a handler record by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<HandlerAuditRecord>> {
        let row: Option<HandlerRow> =
            sqlx::query_as("SELECT * FROM handler_audit_log WHERE id = ?1")
                .bind(id)
                .fetch_optional(self.db.as_ref())
                .await?;

        row.map(HandlerRow::into_record).transpose()
    }

    /// List handler records sharing `correlation_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_by_correlation(&self, correlation_id: &str) -> Result<Vec<HandlerAuditRecord>> {
        let rows: Vec<HandlerRow> = sqlx::query_as(
            "SELECT * FROM handler_audit_log WHERE correlation_id = ?1
             ORDER BY start_time ASC, rowid ASC",
        )
        .bind(correlation_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(HandlerRow::into_record).collect()
    }
}
