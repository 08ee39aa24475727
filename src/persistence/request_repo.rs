//! Request audit record repository for `SQLite` persistence.

use std::sync::Arc;

use crate::models::RequestAuditRecord;
use crate::{AppError, Result};

use super::db::Database;
use super::{parse_json, parse_opt_ts, parse_ts};

/// Repository wrapper around `SQLite` for request audit records.
#[derive(Clone)]
pub struct RequestRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct RequestRow {
    id: String,
    correlation_id: String,
    tenant_id: Option<String>,
    user_id: Option<String>,
    user_email: Option<String>,
    method: String,
    url: String,
    query_string: Option<String>,
    headers: String,
    request_body: Option<String>,
    status_code: Option<i64>,
    response_body: Option<String>,
    ip_address: Option<String>,
    user_agent: Option<String>,
    start_time: String,
    end_time: Option<String>,
    duration_ms: Option<i64>,
    is_archived: i64,
    archived_at: Option<String>,
}

impl RequestRow {
    fn into_record(self) -> Result<RequestAuditRecord> {
        let status_code = self
            .status_code
            .map(|code| {
                u16::try_from(code).map_err(|_| AppError::Db(format!("invalid status_code: {code}")))
            })
            .transpose()?;

        Ok(RequestAuditRecord {
            id: self.id,
            correlation_id: self.correlation_id,
            tenant_id: self.tenant_id,
            user_id: self.user_id,
            user_email: self.user_email,
            method: self.method,
            url: self.url,
            query_string: self.query_string,
            headers: parse_json("headers", &self.headers)?,
            request_body: self.request_body,
            status_code,
            response_body: self.response_body,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            start_time: parse_ts("start_time", &self.start_time)?,
            end_time: parse_opt_ts("end_time", self.end_time.as_deref())?,
            duration_ms: self.duration_ms,
            is_archived: self.is_archived != 0,
            archived_at: parse_opt_ts("archived_at", self.archived_at.as_deref())?,
        })
    }
}

impl RequestRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a newly started request record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database insert fails.
    pub async fn insert(&self, record: &RequestAuditRecord) -> Result<()> {
        let headers = serde_json::to_string(&record.headers)?;

        sqlx::query(
            "INSERT INTO http_request_audit_log (id, correlation_id, tenant_id, user_id,
             user_email, method, url, query_string, headers, request_body, status_code,
             response_body, ip_address, user_agent, start_time, end_time, duration_ms,
             is_archived, archived_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
             ?17, ?18, ?19)",
        )
        .bind(&record.id)
        .bind(&record.correlation_id)
        .bind(&record.tenant_id)
        .bind(&record.user_id)
        .bind(&record.user_email)
        .bind(&record.method)
        .bind(&record.url)
        .bind(&record.query_string)
        .bind(&headers)
        .bind(&record.request_body)
        .bind(record.status_code.map(i64::from))
        .bind(&record.response_body)
        .bind(&record.ip_address)
        .bind(&record.user_agent)
        .bind(record.start_time.to_rfc3339())
        .bind(record.end_time.map(|dt| dt.to_rfc3339()))
        .bind(record.duration_ms)
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
    pub async fn complete(&self, record: &RequestAuditRecord) -> Result<()> {
        let result = sqlx::query(
            "UPDATE http_request_audit_log
             SET status_code = ?1, response_body = ?2, end_time = ?3, duration_ms = ?4
             WHERE id = ?5",
        )
        .bind(record.status_code.map(i64::from))
        .bind(&record.response_body)
        .bind(record.end_time.map(|dt| dt.to_rfc3339()))
        .bind(record.duration_ms)
        .bind(&record.id)
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "request audit record {} not found",
                record.id
            )));
        }
        Ok(())
    }

    /// Retrieve a request record by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<RequestAuditRecord>> {
        let row: Option<RequestRow> =
            sqlx::query_as("SELECT * FROM http_request_audit_log WHERE id = ?1")
                .bind(id)
                .fetch_optional(self.db.as_ref())
                .await?;

        row.map(RequestRow::into_record).transpose()
    }

    /// List request records sharing `correlation_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_by_correlation(&self, correlation_id: &str) -> Result<Vec<RequestAuditRecord>> {
        let rows: Vec<RequestRow> = sqlx::query_as(
            "SELECT * FROM http_request_audit_log WHERE correlation_id = ?1
             ORDER BY start_time ASC, rowid ASC",
        )
        .bind(correlation_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(RequestRow::into_record).collect()
    }
}
