//! Entity boundary: one record per added, modified or deleted entity in a
//! unit-of-work save.
//!
//! [`EntityChangeRecorder::capture`] is synchronous so it can run inside a
//! data layer's save hook; the persisting helpers either write through the
//! store or join the caller's transaction.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use sqlx::{Sqlite, Transaction};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{guarded_write, WriteTarget};
use crate::config::AuditConfig;
use crate::context;
use crate::diff::{diff_snapshots, PropertySnapshot};
use crate::models::{EntityAuditRecord, OperationType};
use crate::redact::Redactor;
use crate::store::{AuditStore, SqliteAuditStore};

/// Separator between the values of a composite key.
pub const KEY_SEPARATOR: &str = "|";

/// Change-tracker state of an entity about to be saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Loaded and not changed.
    Unchanged,
    /// New entity.
    Added,
    /// Existing entity with changed properties.
    Modified,
    /// Entity being removed.
    Deleted,
}

impl EntityState {
    fn operation(self) -> Option<OperationType> {
        match self {
            Self::Added => Some(OperationType::Create),
            Self::Modified => Some(OperationType::Update),
            Self::Deleted => Some(OperationType::Delete),
            Self::Unchanged => None,
        }
    }
}

/// An entity as seen by the change tracker at save time.
#[derive(Debug, Clone)]
pub struct TrackedEntity {
    /// Entity type name.
    pub entity_type: String,
    /// Tracker state.
    pub state: EntityState,
    /// Primary key property names in declaration order.
    pub key_properties: Vec<String>,
    /// Values as loaded; `None` for added entities.
    pub original_values: Option<PropertySnapshot>,
    /// Values about to be written; empty for deleted entities.
    pub current_values: PropertySnapshot,
}

impl TrackedEntity {
    /// A newly added entity.
    #[must_use]
    pub fn added(entity_type: impl Into<String>, key_properties: &[&str], current: PropertySnapshot) -> Self {
        Self {
            entity_type: entity_type.into(),
            state: EntityState::Added,
            key_properties: key_properties.iter().map(|k| (*k).to_owned()).collect(),
            original_values: None,
            current_values: current,
        }
    }

    /// A modified entity with its original and current values.
    #[must_use]
    pub fn modified(
        entity_type: impl Into<String>,
        key_properties: &[&str],
        original: PropertySnapshot,
        current: PropertySnapshot,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            state: EntityState::Modified,
            key_properties: key_properties.iter().map(|k| (*k).to_owned()).collect(),
            original_values: Some(original),
            current_values: current,
        }
    }

    /// An entity being deleted, with the values it had.
    #[must_use]
    pub fn deleted(entity_type: impl Into<String>, key_properties: &[&str], original: PropertySnapshot) -> Self {
        Self {
            entity_type: entity_type.into(),
            state: EntityState::Deleted,
            key_properties: key_properties.iter().map(|k| (*k).to_owned()).collect(),
            original_values: Some(original),
            current_values: PropertySnapshot::new(),
        }
    }

    /// Primary key rendered as one string; composite keys are joined with
    /// [`KEY_SEPARATOR`] in key declaration order.
    #[must_use]
    pub fn entity_id(&self) -> String {
        let source = match self.state {
            EntityState::Deleted => self.original_values.as_ref().unwrap_or(&self.current_values),
            _ => &self.current_values,
        };
        self.key_properties
            .iter()
            .map(|name| source.get(name).map(render_key).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(KEY_SEPARATOR)
    }
}

fn render_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Turns tracked entity changes into entity audit records.
#[derive(Debug, Clone)]
pub struct EntityChangeRecorder {
    excluded: HashSet<String>,
    redactor: Arc<Redactor>,
}

impl EntityChangeRecorder {
    /// Create a recorder ignoring the given entity types.
    #[must_use]
    pub fn new<I, S>(excluded_entity_types: I, redactor: Arc<Redactor>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            excluded: excluded_entity_types.into_iter().map(Into::into).collect(),
            redactor,
        }
    }

    /// Create a recorder from configuration.
    #[must_use]
    pub fn from_config(config: &AuditConfig) -> Self {
        Self::new(
            config.excluded_entity_types.iter().cloned(),
            Arc::new(Redactor::from_config(&config.redaction)),
        )
    }

    /// Whether `entity_type` is skipped.
    #[must_use]
    pub fn is_excluded(&self, entity_type: &str) -> bool {
        self.excluded.contains(entity_type)
    }

    /// Build records for every added, modified or deleted entity.
    ///
    /// Excluded types and unchanged entities are skipped. Records link to the
    /// ambient correlation scope when one is active and are left unlinked
    /// otherwise.
    #[must_use]
    pub fn capture(&self, tracked: &[TrackedEntity]) -> Vec<EntityAuditRecord> {
        let scope = context::current();
        let (handler_id, correlation_id, tenant_id) = match &scope {
            Some(scope) => (
                scope.active_handler_record_id.clone(),
                Some(scope.correlation_id.clone()),
                scope.identity.tenant_id.clone(),
            ),
            None => (None, None, None),
        };

        tracked
            .iter()
            .filter(|entity| !self.is_excluded(&entity.entity_type))
            .filter_map(|entity| {
                let operation = entity.state.operation()?;
                let after = match entity.state {
                    EntityState::Deleted => None,
                    _ => Some(&entity.current_values),
                };
                let diff = self
                    .redactor
                    .redact_patch(diff_snapshots(entity.original_values.as_ref(), after));

                match EntityAuditRecord::new(entity.entity_type.clone(), entity.entity_id(), operation, diff) {
                    Ok(record) => Some(record.linked(
                        handler_id.clone(),
                        correlation_id.clone(),
                        tenant_id.clone(),
                    )),
                    Err(err) => {
                        warn!(entity_type = %entity.entity_type, %err, "entity change not captured");
                        None
                    }
                }
            })
            .collect()
    }

    /// Capture and append records through `store`.
    ///
    /// Returns the number of records written; failures are logged.
    pub async fn record(
        &self,
        store: &dyn AuditStore,
        tracked: &[TrackedEntity],
        cancel: &CancellationToken,
    ) -> usize {
        let records = self.capture(tracked);
        if records.is_empty() {
            return 0;
        }
        let correlation_id = records[0].correlation_id.clone().unwrap_or_default();
        let target = WriteTarget {
            kind: "entity",
            correlation_id: &correlation_id,
            record_id: &records[0].id,
        };
        if guarded_write(cancel, target, store.add_entities(&records)).await {
            debug!(correlation_id = %correlation_id, count = records.len(), "entity changes recorded");
            records.len()
        } else {
            0
        }
    }

    /// Capture records and insert them inside the caller's open transaction,
    /// so they commit or roll back with the changes they describe.
    ///
    /// Returns the number of records queued; insert failures are logged and
    /// leave the transaction usable for the business writes.
    pub async fn record_in_transaction(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        tracked: &[TrackedEntity],
    ) -> usize {
        let records = self.capture(tracked);
        if records.is_empty() {
            return 0;
        }
        match SqliteAuditStore::add_entities_in_tx(tx, &records).await {
            Ok(()) => records.len(),
            Err(err) => {
                warn!(
                    correlation_id = records[0].correlation_id.as_deref().unwrap_or_default(),
                    %err,
                    "entity audit insert failed inside transaction"
                );
                0
            }
        }
    }
}
