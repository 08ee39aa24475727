//! Shared fixtures for integration tests.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use audit_chain::diff::PropertySnapshot;
use audit_chain::persistence::db::{self, Database};
use audit_chain::recorder::{
    EntityChangeRecorder, HandlerAuditRecorder, RequestAuditRecorder, SnapshotRegistry,
};
use audit_chain::redact::Redactor;
use audit_chain::store::{AuditStore, SqliteAuditStore};
use audit_chain::AuditConfig;

/// The three recorders wired to one store.
pub struct Pipeline<S> {
    pub store: Arc<S>,
    pub requests: RequestAuditRecorder,
    pub handlers: HandlerAuditRecorder,
    pub entities: EntityChangeRecorder,
    pub cancel: CancellationToken,
}

/// Build a pipeline over `store` using `config` and `snapshots`.
pub fn pipeline_with<S>(store: Arc<S>, config: AuditConfig, snapshots: SnapshotRegistry) -> Pipeline<S>
where
    S: AuditStore + 'static,
{
    let redactor = Arc::new(Redactor::from_config(&config.redaction));
    let entities = EntityChangeRecorder::new(config.excluded_entity_types.clone(), Arc::clone(&redactor));
    let shared: Arc<dyn AuditStore> = store.clone();
    Pipeline {
        requests: RequestAuditRecorder::new(Arc::clone(&shared), Arc::new(config))
            .with_redactor(Arc::clone(&redactor)),
        handlers: HandlerAuditRecorder::new(shared, redactor).with_snapshots(Arc::new(snapshots)),
        entities,
        store,
        cancel: CancellationToken::new(),
    }
}

/// Build a pipeline over `store` with default configuration.
pub fn pipeline<S>(store: Arc<S>) -> Pipeline<S>
where
    S: AuditStore + 'static,
{
    pipeline_with(store, AuditConfig::default(), SnapshotRegistry::new())
}

/// In-memory `SQLite` store plus its pool.
pub async fn sqlite_store() -> (Arc<SqliteAuditStore>, Arc<Database>) {
    let pool = Arc::new(db::connect_memory().await.expect("db connect"));
    (Arc::new(SqliteAuditStore::new(Arc::clone(&pool))), pool)
}

/// Convert a JSON object literal into a property snapshot.
pub fn props(value: Value) -> PropertySnapshot {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}
