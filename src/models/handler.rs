//! Audit record for one command or query handler execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::OperationType;
use crate::diff::PatchOperation;
use crate::{AppError, Result};

/// Separator placed between accumulated failure messages.
pub const ERROR_SEPARATOR: &str = " | ";

/// Handler-level audit record, nested under a request record when one exists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct HandlerAuditRecord {
    /// Unique record identifier.
    pub id: String,
    /// Parent request record; `None` for background triggers.
    pub http_request_audit_log_id: Option<String>,
    /// Identifier shared with the parent request record.
    pub correlation_id: String,
    /// Tenant the handler acted within.
    pub tenant_id: Option<String>,
    /// Acting user identifier.
    pub user_id: Option<String>,
    /// Handler type name.
    pub handler_name: String,
    /// Classified operation kind.
    pub operation_type: OperationType,
    /// UI page the action was triggered from.
    pub page_context: Option<String>,
    /// Human-readable description of the action.
    pub action_description: Option<String>,
    /// Human-readable name of the target.
    pub target_display_name: Option<String>,
    /// DTO type the handler targets.
    pub target_dto_type: Option<String>,
    /// Identifier of the targeted DTO.
    pub target_dto_id: Option<String>,
    /// DTO-level diff; only present when a before snapshot was obtained.
    pub dto_diff: Option<Vec<PatchOperation>>,
    /// Sanitized handler input.
    pub input_parameters: Option<Value>,
    /// Sanitized handler output.
    pub output_result: Option<Value>,
    /// When the handler started.
    pub start_time: DateTime<Utc>,
    /// When the handler finished; `None` until completed.
    pub end_time: Option<DateTime<Utc>>,
    /// `end_time - start_time` in milliseconds; `None` until completed.
    pub duration_ms: Option<i64>,
    /// Whether the handler (and any enclosing layer) reported success.
    pub is_success: bool,
    /// Accumulated failure messages.
    pub error_message: Option<String>,
    /// Set by the archival process.
    pub is_archived: bool,
    /// When the record was archived.
    pub archived_at: Option<DateTime<Utc>>,
}

impl HandlerAuditRecord {
    /// Start a record for a handler invocation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if the correlation id or handler name is blank.
    pub fn new(
        correlation_id: String,
        handler_name: String,
        operation_type: OperationType,
    ) -> Result<Self> {
        if correlation_id.trim().is_empty() {
            return Err(AppError::Validation("correlation_id is required".into()));
        }
        if handler_name.trim().is_empty() {
            return Err(AppError::Validation("handler_name is required".into()));
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            http_request_audit_log_id: None,
            correlation_id,
            tenant_id: None,
            user_id: None,
            handler_name,
            operation_type,
            page_context: None,
            action_description: None,
            target_display_name: None,
            target_dto_type: None,
            target_dto_id: None,
            dto_diff: None,
            input_parameters: None,
            output_result: None,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            is_success: false,
            error_message: None,
            is_archived: false,
            archived_at: None,
        })
    }

    /// Record a successful completion.
    pub fn complete_success(&mut self, output: Option<Value>, dto_diff: Option<Vec<PatchOperation>>) {
        self.output_result = output;
        self.dto_diff = dto_diff;
        self.is_success = true;
        self.finish(Utc::now());
    }

    /// Record a failed completion, appending `message` to any prior failure.
    pub fn complete_failure(&mut self, message: &str) {
        self.mark_as_failed(message);
        self.finish(Utc::now());
    }

    /// Set completion timing at `end_time`; a later call overwrites it.
    pub fn finish(&mut self, end_time: DateTime<Utc>) {
        self.end_time = Some(end_time);
        self.duration_ms = Some(super::elapsed_ms(self.start_time, end_time));
    }

    /// Flag the record as failed without touching its timing.
    ///
    /// Messages accumulate: a second call appends to the first so a handler
    /// exception and a later HTTP-level failure are both kept.
    pub fn mark_as_failed(&mut self, message: &str) {
        self.is_success = false;
        self.error_message = Some(append_error(self.error_message.take(), message));
    }

    /// Whether completion timing has been recorded.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.end_time.is_some()
    }
}

/// Join a new failure message onto an existing one.
#[must_use]
pub fn append_error(existing: Option<String>, message: &str) -> String {
    match existing {
        Some(prior) if !prior.is_empty() => format!("{prior}{ERROR_SEPARATOR}{message}"),
        _ => message.to_owned(),
    }
}
