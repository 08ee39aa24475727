//! Entity-change capture at save time.
//!
//! Validates:
//! - An added entity yields one `add` per property in declaration order
//! - Every entity saved inside a handler links to that handler and chain
//! - Records written through the business transaction commit and roll back with it
//! - Entities saved outside any scope are recorded unlinked
//! - A handler nested inside an open transaction does not stall on its audit writes

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use sqlx::Row;

use audit_chain::context;
use audit_chain::models::OperationType;
use audit_chain::recorder::{EntityChangeRecorder, EntityState, HandlerInvocation, InboundRequest, RequestOutcome, TrackedEntity};
use audit_chain::redact::{Redactor, REDACTION_MARKER};
use audit_chain::store::{AuditStore, MemoryAuditStore, SqliteAuditStore};
use audit_chain::AuditConfig;

use super::test_helpers::{pipeline, pipeline_with, props, sqlite_store};

#[test]
fn added_entity_diff_follows_declaration_order() {
    let recorder = EntityChangeRecorder::new(Vec::<String>::new(), Arc::new(Redactor::default()));
    let records = recorder.capture(&[TrackedEntity::added("Widget", &["a"], props(json!({"a": 1, "b": 2})))]);

    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.operation_type, OperationType::Create);
    assert_eq!(record.entity_id, "1");
    assert_eq!(
        serde_json::to_value(&record.diff).unwrap(),
        json!([
            {"op": "add", "path": "/a", "value": 1},
            {"op": "add", "path": "/b", "value": 2}
        ])
    );
}

#[test]
fn modified_and_deleted_entities_diff_against_originals() {
    let recorder = EntityChangeRecorder::new(Vec::<String>::new(), Arc::new(Redactor::default()));
    let records = recorder.capture(&[
        TrackedEntity::modified(
            "Vendor",
            &["id"],
            props(json!({"id": 5, "name": "Old", "city": "Oslo"})),
            props(json!({"id": 5, "name": "New", "city": "Oslo"})),
        ),
        TrackedEntity::deleted("Vendor", &["id"], props(json!({"id": 6, "name": "Gone"}))),
    ]);

    assert_eq!(records[0].operation_type, OperationType::Update);
    assert_eq!(
        serde_json::to_value(&records[0].diff).unwrap(),
        json!([{"op": "replace", "path": "/name", "value": "New", "oldValue": "Old"}])
    );

    assert_eq!(records[1].operation_type, OperationType::Delete);
    assert_eq!(records[1].entity_id, "6");
    assert_eq!(
        serde_json::to_value(&records[1].diff).unwrap(),
        json!([
            {"op": "remove", "path": "/id", "value": 6},
            {"op": "remove", "path": "/name", "value": "Gone"}
        ])
    );
}

#[test]
fn changed_sensitive_property_yields_a_masked_replace() {
    let recorder = EntityChangeRecorder::new(Vec::<String>::new(), Arc::new(Redactor::default()));
    let records = recorder.capture(&[TrackedEntity::modified(
        "User",
        &["id"],
        props(json!({"id": 1, "password_hash_secret": "old-hash"})),
        props(json!({"id": 1, "password_hash_secret": "new-hash"})),
    )]);

    assert_eq!(
        serde_json::to_value(&records[0].diff).unwrap(),
        json!([{
            "op": "replace",
            "path": "/password_hash_secret",
            "value": REDACTION_MARKER,
            "oldValue": REDACTION_MARKER
        }])
    );
}

#[test]
fn changed_secret_inside_a_property_still_yields_a_masked_replace() {
    let recorder = EntityChangeRecorder::new(Vec::<String>::new(), Arc::new(Redactor::default()));
    let records = recorder.capture(&[TrackedEntity::modified(
        "Integration",
        &["id"],
        props(json!({"id": 1, "author": "ann", "settings": {"apiKey": "k-1", "region": "eu"}})),
        props(json!({"id": 1, "author": "bob", "settings": {"apiKey": "k-2", "region": "eu"}})),
    )]);

    assert_eq!(
        serde_json::to_value(&records[0].diff).unwrap(),
        json!([
            {"op": "replace", "path": "/author", "value": "bob", "oldValue": "ann"},
            {
                "op": "replace",
                "path": "/settings",
                "value": {"apiKey": REDACTION_MARKER, "region": "eu"},
                "oldValue": {"apiKey": REDACTION_MARKER, "region": "eu"}
            }
        ])
    );
}

#[test]
fn excluded_types_come_from_config() {
    let config = AuditConfig {
        excluded_entity_types: vec!["AuditOutbox".into()],
        ..AuditConfig::default()
    };
    let recorder = EntityChangeRecorder::from_config(&config);

    assert!(recorder.is_excluded("AuditOutbox"));
    let mut unchanged = TrackedEntity::added("Vendor", &["id"], props(json!({"id": 1})));
    unchanged.state = EntityState::Unchanged;
    let records = recorder.capture(&[
        TrackedEntity::added("AuditOutbox", &["id"], props(json!({"id": 1}))),
        unchanged,
    ]);
    assert!(records.is_empty());
}

#[test]
fn entities_outside_any_scope_are_unlinked() {
    let recorder = EntityChangeRecorder::new(Vec::<String>::new(), Arc::new(Redactor::default()));
    let records = recorder.capture(&[TrackedEntity::added("Seed", &["id"], props(json!({"id": 1})))]);

    assert!(records[0].handler_audit_log_id.is_none());
    assert!(records[0].correlation_id.is_none());
}

#[tokio::test]
async fn entities_saved_in_a_handler_link_to_it() {
    let p = pipeline(Arc::new(MemoryAuditStore::new()));

    p.requests
        .run(
            InboundRequest::new("POST", "/vendors").with_header("X-Correlation-ID", "corr-save"),
            &p.cancel,
            async {
                p.handlers
                    .run(HandlerInvocation::new("CreateVendor", "create").unwrap(), &p.cancel, async {
                        let saved = p
                            .entities
                            .record(
                                p.store.as_ref(),
                                &[
                                    TrackedEntity::added("Vendor", &["id"], props(json!({"id": 1, "name": "Acme"}))),
                                    TrackedEntity::added(
                                        "VendorContact",
                                        &["vendor_id", "seq"],
                                        props(json!({"vendor_id": 1, "seq": 1, "email": "a@acme.io"})),
                                    ),
                                    TrackedEntity::added(
                                        "VendorContact",
                                        &["vendor_id", "seq"],
                                        props(json!({"vendor_id": 1, "seq": 2, "email": "b@acme.io"})),
                                    ),
                                ],
                                &p.cancel,
                            )
                            .await;
                        Ok::<_, String>(saved)
                    })
                    .await
                    .unwrap();

                // A save after the handler returned has no active handler.
                p.entities
                    .record(
                        p.store.as_ref(),
                        &[TrackedEntity::added("Log", &["id"], props(json!({"id": 9})))],
                        &p.cancel,
                    )
                    .await;
                RequestOutcome::status(201)
            },
        )
        .await
        .unwrap();

    let handler = &p.store.handlers()[0];
    assert_eq!(handler.output_result, Some(json!(3)));

    let trail = p.store.trail("corr-save").await.unwrap();
    let nested = trail.entities_for(&handler.id);
    assert_eq!(nested.len(), 3);
    for entity in &nested {
        assert_eq!(entity.correlation_id.as_deref(), Some("corr-save"));
    }
    assert_eq!(
        nested.iter().map(|e| e.entity_id.as_str()).collect::<Vec<_>>(),
        vec!["1", "1|1", "1|2"]
    );

    let orphan = trail.entities.iter().find(|e| e.entity_type == "Log").unwrap();
    assert!(orphan.handler_audit_log_id.is_none());
    assert_eq!(orphan.correlation_id.as_deref(), Some("corr-save"));
}

#[tokio::test]
async fn transaction_commit_persists_entity_records() {
    let (store, pool) = sqlite_store().await;
    let p = pipeline_with(Arc::clone(&store), AuditConfig::default(), Default::default());

    let correlation_id = p
        .handlers
        .run(HandlerInvocation::new("CreateVendor", "create").unwrap(), &p.cancel, async {
            let mut tx = pool.begin().await.map_err(|e| e.to_string())?;
            let queued = p
                .entities
                .record_in_transaction(
                    &mut tx,
                    &[TrackedEntity::added("Vendor", &["id"], props(json!({"id": 42})))],
                )
                .await;
            tx.commit().await.map_err(|e| e.to_string())?;
            assert_eq!(queued, 1);
            Ok::<_, String>(context::current().unwrap().correlation_id)
        })
        .await
        .unwrap();

    let handlers = p.store.handlers_by_correlation(&correlation_id).await.unwrap();
    assert_eq!(handlers.len(), 1);
    let entities = p.store.entities_by_handler(&handlers[0].id).await.unwrap();
    assert_eq!(entities.len(), 1);
    assert_eq!(entities[0].entity_id, "42");
    assert_eq!(entities[0].correlation_id.as_deref(), Some(correlation_id.as_str()));
}

#[tokio::test]
async fn transaction_rollback_discards_entity_records() {
    let (store, pool) = sqlite_store().await;
    let p = pipeline_with(store, AuditConfig::default(), Default::default());

    let mut tx = pool.begin().await.unwrap();
    let queued = p
        .entities
        .record_in_transaction(
            &mut tx,
            &[TrackedEntity::added("Vendor", &["id"], props(json!({"id": 43})))],
        )
        .await;
    assert_eq!(queued, 1);
    tx.rollback().await.unwrap();

    let row = sqlx::query("SELECT COUNT(*) AS cnt FROM entity_audit_log")
        .fetch_one(pool.as_ref())
        .await
        .unwrap();
    assert_eq!(row.get::<i64, _>("cnt"), 0);
}

#[tokio::test]
async fn nested_handler_inside_open_transaction_gives_up_on_audit_writes() {
    let (_, pool) = sqlite_store().await;
    let store = Arc::new(
        SqliteAuditStore::new(Arc::clone(&pool)).with_write_timeout(Duration::from_millis(100)),
    );
    let p = pipeline_with(store, AuditConfig::default(), Default::default());
    let started = Instant::now();

    let correlation_id = p
        .handlers
        .run(HandlerInvocation::new("CreateVendor", "create").unwrap(), &p.cancel, async {
            // The transaction holds the pool's only connection.
            let mut tx = pool.begin().await.map_err(|e| e.to_string())?;
            let number = p
                .handlers
                .run(HandlerInvocation::new("AssignNumber", "update").unwrap(), &p.cancel, async {
                    Ok::<_, String>(7)
                })
                .await;
            assert_eq!(number, Ok(7));
            let queued = p
                .entities
                .record_in_transaction(
                    &mut tx,
                    &[TrackedEntity::added("Vendor", &["id"], props(json!({"id": 7})))],
                )
                .await;
            tx.commit().await.map_err(|e| e.to_string())?;
            assert_eq!(queued, 1);
            Ok::<_, String>(context::current().unwrap().correlation_id)
        })
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    let handlers = p.store.handlers_by_correlation(&correlation_id).await.unwrap();
    assert_eq!(handlers.len(), 1);
    assert_eq!(handlers[0].handler_name, "CreateVendor");
    assert!(handlers[0].is_success);
    assert!(handlers[0].end_time.is_some());
    let entities = p.store.entities_by_handler(&handlers[0].id).await.unwrap();
    assert_eq!(entities.len(), 1);
}
