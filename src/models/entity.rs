//! Audit record for one persisted entity change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::OperationType;
use crate::diff::PatchOperation;
use crate::{AppError, Result};

/// Entity-level audit record; immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct EntityAuditRecord {
    /// Unique record identifier.
    pub id: String,
    /// Handler record active when the change was saved.
    pub handler_audit_log_id: Option<String>,
    /// Correlation id of the enclosing chain, if any.
    pub correlation_id: Option<String>,
    /// Tenant the change belongs to.
    pub tenant_id: Option<String>,
    /// Entity type name.
    pub entity_type: String,
    /// Primary key value(s) rendered as a single string.
    pub entity_id: String,
    /// `create`, `update` or `delete`.
    pub operation_type: OperationType,
    /// Property-level diff between original and current values.
    pub diff: Vec<PatchOperation>,
    /// When the change was captured.
    pub timestamp: DateTime<Utc>,
    /// Set by the archival process.
    pub is_archived: bool,
    /// When the record was archived.
    pub archived_at: Option<DateTime<Utc>>,
}

impl EntityAuditRecord {
    /// Build an entity change record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if the entity type is blank or the
    /// operation is not a mutation.
    pub fn new(
        entity_type: String,
        entity_id: String,
        operation_type: OperationType,
        diff: Vec<PatchOperation>,
    ) -> Result<Self> {
        if entity_type.trim().is_empty() {
            return Err(AppError::Validation("entity_type is required".into()));
        }
        if !operation_type.is_mutation() {
            return Err(AppError::Validation(format!(
                "entity changes cannot have operation type {operation_type}"
            )));
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            handler_audit_log_id: None,
            correlation_id: None,
            tenant_id: None,
            entity_type,
            entity_id,
            operation_type,
            diff,
            timestamp: Utc::now(),
            is_archived: false,
            archived_at: None,
        })
    }

    /// Link the record to its handler, chain and tenant.
    #[must_use]
    pub fn linked(
        mut self,
        handler_audit_log_id: Option<String>,
        correlation_id: Option<String>,
        tenant_id: Option<String>,
    ) -> Self {
        self.handler_audit_log_id = handler_audit_log_id;
        self.correlation_id = correlation_id;
        self.tenant_id = tenant_id;
        self
    }
}
