//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS` and are safe to
//! re-run on every startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply the three audit table definitions to the connected database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS http_request_audit_log (
    id              TEXT PRIMARY KEY NOT NULL,
    correlation_id  TEXT NOT NULL,
    tenant_id       TEXT,
    user_id         TEXT,
    user_email      TEXT,
    method          TEXT NOT NULL,
    url             TEXT NOT NULL,
    query_string    TEXT,
    headers         TEXT NOT NULL,
    request_body    TEXT,
    status_code     INTEGER,
    response_body   TEXT,
    ip_address      TEXT,
    user_agent      TEXT,
    start_time      TEXT NOT NULL,
    end_time        TEXT,
    duration_ms     INTEGER,
    is_archived     INTEGER NOT NULL DEFAULT 0,
    archived_at     TEXT
);

CREATE TABLE IF NOT EXISTS handler_audit_log (
    id                          TEXT PRIMARY KEY NOT NULL,
    http_request_audit_log_id   TEXT,
    correlation_id              TEXT NOT NULL,
    tenant_id                   TEXT,
    user_id                     TEXT,
    handler_name                TEXT NOT NULL,
    operation_type              TEXT NOT NULL CHECK(operation_type IN ('create','update','delete','query')),
    page_context                TEXT,
    action_description          TEXT,
    target_display_name         TEXT,
    target_dto_type             TEXT,
    target_dto_id               TEXT,
    dto_diff                    TEXT,
    input_parameters            TEXT,
    output_result               TEXT,
    start_time                  TEXT NOT NULL,
    end_time                    TEXT,
    duration_ms                 INTEGER,
    is_success                  INTEGER NOT NULL DEFAULT 0,
    error_message               TEXT,
    is_archived                 INTEGER NOT NULL DEFAULT 0,
    archived_at                 TEXT
);

CREATE TABLE IF NOT EXISTS entity_audit_log (
    id                      TEXT PRIMARY KEY NOT NULL,
    handler_audit_log_id    TEXT,
    correlation_id          TEXT,
    tenant_id               TEXT,
    entity_type             TEXT NOT NULL,
    entity_id               TEXT NOT NULL,
    operation_type          TEXT NOT NULL CHECK(operation_type IN ('create','update','delete')),
    diff                    TEXT NOT NULL,
    timestamp               TEXT NOT NULL,
    is_archived             INTEGER NOT NULL DEFAULT 0,
    archived_at             TEXT
);

CREATE INDEX IF NOT EXISTS idx_request_correlation ON http_request_audit_log(correlation_id);
CREATE INDEX IF NOT EXISTS idx_handler_correlation ON handler_audit_log(correlation_id);
CREATE INDEX IF NOT EXISTS idx_handler_request ON handler_audit_log(http_request_audit_log_id);
CREATE INDEX IF NOT EXISTS idx_entity_correlation ON entity_audit_log(correlation_id);
CREATE INDEX IF NOT EXISTS idx_entity_handler ON entity_audit_log(handler_audit_log_id);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
