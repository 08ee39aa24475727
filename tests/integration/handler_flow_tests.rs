//! Handler boundary behavior.
//!
//! | Case                                  | Expected record                            |
//! |---------------------------------------|--------------------------------------------|
//! | handler returns `Err("boom")`         | failed, message has "boom", end time set   |
//! | update with before/after snapshots    | `replace /name` with `oldValue`            |
//! | update without a snapshot provider    | no DTO diff                                |
//! | handler outside any request           | detached chain, no request parent          |
//! | rotated secret in the snapshots       | `replace` with both values masked          |
//! | handler panics                        | completed as failed, then panic resumes    |

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};

use audit_chain::context;
use audit_chain::identity::{FixedIdentity, Identity};
use audit_chain::recorder::{HandlerAuditRecorder, HandlerInvocation, InboundRequest, RequestOutcome, SnapshotRegistry};
use audit_chain::redact::{Redactor, REDACTION_MARKER};
use audit_chain::store::MemoryAuditStore;
use audit_chain::{AppError, AuditConfig};

use super::test_helpers::{pipeline, pipeline_with};

#[derive(Debug, Serialize)]
struct UpdateVendor {
    id: u32,
    name: String,
    api_key: String,
}

/// Registry backed by a shared in-memory "database" of vendor DTOs.
fn vendor_registry(db: &Arc<Mutex<Option<Value>>>) -> SnapshotRegistry {
    let mut registry = SnapshotRegistry::new();
    let db = Arc::clone(db);
    registry.register("VendorDto", move |_id| {
        let db = Arc::clone(&db);
        async move { Ok(db.lock().unwrap().clone()) }
    });
    registry
}

#[tokio::test]
async fn failing_handler_is_recorded_and_marker_cleared() {
    let p = pipeline(Arc::new(MemoryAuditStore::new()));

    p.requests
        .run(InboundRequest::new("POST", "/x"), &p.cancel, async {
            let invocation = HandlerInvocation::new("Explode", "update").unwrap();
            let result = p
                .handlers
                .run(invocation, &p.cancel, async { Err::<(), _>("InvalidOperation: boom") })
                .await;
            assert_eq!(result, Err("InvalidOperation: boom"));
            assert!(context::current().unwrap().active_handler_record_id.is_none());
            RequestOutcome::status(500)
        })
        .await
        .unwrap();

    let handler = &p.store.handlers()[0];
    assert!(!handler.is_success);
    assert!(handler.error_message.as_deref().unwrap().contains("boom"));
    assert!(handler.end_time.is_some());
    assert!(handler.duration_ms.is_some());
    assert!(handler.output_result.is_none());
}

#[tokio::test]
async fn update_diff_uses_before_and_after_snapshots() {
    let vendors = Arc::new(Mutex::new(Some(json!({"name": "Old"}))));
    let p = pipeline_with(
        Arc::new(MemoryAuditStore::new()),
        AuditConfig::default(),
        vendor_registry(&vendors),
    );

    let invocation = HandlerInvocation::new("UpdateVendor", "Update")
        .unwrap()
        .with_target("VendorDto", "7")
        .with_target_display_name("Acme AS")
        .with_page_context("vendors/edit")
        .with_action_description("Rename vendor");

    let writer = Arc::clone(&vendors);
    p.handlers
        .run(invocation, &p.cancel, async move {
            *writer.lock().unwrap() = Some(json!({"name": "New"}));
            Ok::<_, String>(json!({"ok": true}))
        })
        .await
        .unwrap();

    let handler = &p.store.handlers()[0];
    assert_eq!(
        serde_json::to_value(handler.dto_diff.as_ref().unwrap()).unwrap(),
        json!([{"op": "replace", "path": "/name", "value": "New", "oldValue": "Old"}])
    );
    assert_eq!(handler.target_dto_type.as_deref(), Some("VendorDto"));
    assert_eq!(handler.target_dto_id.as_deref(), Some("7"));
    assert_eq!(handler.target_display_name.as_deref(), Some("Acme AS"));
    assert_eq!(handler.page_context.as_deref(), Some("vendors/edit"));
    assert_eq!(handler.action_description.as_deref(), Some("Rename vendor"));
}

#[tokio::test]
async fn missing_after_snapshot_falls_back_to_output() {
    let seen = Arc::new(Mutex::new(Some(json!({"name": "Old", "city": "Oslo"}))));
    let p = pipeline_with(
        Arc::new(MemoryAuditStore::new()),
        AuditConfig::default(),
        vendor_registry(&seen),
    );
    let writer = Arc::clone(&seen);

    p.handlers
        .run(
            HandlerInvocation::new("UpdateVendor", "update").unwrap().with_target("VendorDto", "1"),
            &p.cancel,
            async move {
                *writer.lock().unwrap() = None;
                Ok::<_, String>(json!({"name": "New", "city": "Oslo"}))
            },
        )
        .await
        .unwrap();

    let diff = p.store.handlers()[0].dto_diff.clone().unwrap();
    assert_eq!(diff.len(), 1);
    assert_eq!(diff[0].path, "/name");
}

#[tokio::test]
async fn delete_diff_removes_every_field() {
    let vendors = Arc::new(Mutex::new(Some(json!({"id": 3, "name": "Gone"}))));
    let p = pipeline_with(
        Arc::new(MemoryAuditStore::new()),
        AuditConfig::default(),
        vendor_registry(&vendors),
    );
    let writer = Arc::clone(&vendors);

    p.handlers
        .run(
            HandlerInvocation::new("DeleteVendor", "delete").unwrap().with_target("VendorDto", "3"),
            &p.cancel,
            async move {
                *writer.lock().unwrap() = None;
                Ok::<_, String>(())
            },
        )
        .await
        .unwrap();

    let diff = p.store.handlers()[0].dto_diff.clone().unwrap();
    let ops: Vec<(String, String)> = diff
        .iter()
        .map(|op| (format!("{:?}", op.op), op.path.clone()))
        .collect();
    assert_eq!(
        ops,
        vec![("Remove".into(), "/id".into()), ("Remove".into(), "/name".into())]
    );
}

#[tokio::test]
async fn no_snapshot_provider_means_no_dto_diff() {
    let p = pipeline(Arc::new(MemoryAuditStore::new()));

    p.handlers
        .run(
            HandlerInvocation::new("UpdateVendor", "update").unwrap().with_target("VendorDto", "1"),
            &p.cancel,
            async { Ok::<_, String>(json!({"name": "New"})) },
        )
        .await
        .unwrap();

    assert!(p.store.handlers()[0].dto_diff.is_none());
}

#[tokio::test]
async fn input_and_output_are_sanitized() {
    let p = pipeline(Arc::new(MemoryAuditStore::new()));
    let command = UpdateVendor {
        id: 1,
        name: "Acme".into(),
        api_key: "sk_live_123".into(),
    };

    p.handlers
        .run(
            HandlerInvocation::new("UpdateVendor", "update").unwrap().with_input(&command),
            &p.cancel,
            async { Ok::<_, String>(json!({"id": 1, "refreshToken": "r-1"})) },
        )
        .await
        .unwrap();

    let handler = &p.store.handlers()[0];
    assert_eq!(
        handler.input_parameters,
        Some(json!({"id": 1, "name": "Acme", "api_key": REDACTION_MARKER}))
    );
    assert_eq!(
        handler.output_result,
        Some(json!({"id": 1, "refreshToken": REDACTION_MARKER}))
    );
}

#[tokio::test]
async fn background_handler_opens_detached_chain() {
    let store = Arc::new(MemoryAuditStore::new());
    let identity = Identity::new(Some("tenant-bg".into()), "scheduler".into(), None);
    let recorder = HandlerAuditRecorder::new(store.clone(), Arc::new(Redactor::default()))
        .with_identity_provider(Arc::new(FixedIdentity(identity)));
    let cancel = tokio_util::sync::CancellationToken::new();

    let (correlation_id, active_handler) = recorder
        .run(
            HandlerInvocation::new("NightlyReconcile", "update").unwrap(),
            &cancel,
            async {
                let scope = context::current().unwrap();
                Ok::<_, String>((scope.correlation_id, scope.active_handler_record_id))
            },
        )
        .await
        .unwrap();
    assert!(context::current().is_none());

    let handler = &store.handlers()[0];
    assert!(handler.http_request_audit_log_id.is_none());
    assert_eq!(handler.correlation_id, correlation_id);
    assert_eq!(handler.tenant_id.as_deref(), Some("tenant-bg"));
    assert_eq!(active_handler.as_deref(), Some(handler.id.as_str()));
}

#[tokio::test]
async fn rotated_secret_shows_as_a_masked_replace() {
    let vendors = Arc::new(Mutex::new(Some(json!({"name": "Acme", "apiKey": "k-old"}))));
    let p = pipeline_with(
        Arc::new(MemoryAuditStore::new()),
        AuditConfig::default(),
        vendor_registry(&vendors),
    );

    let writer = Arc::clone(&vendors);
    p.handlers
        .run(
            HandlerInvocation::new("RotateKey", "update").unwrap().with_target("VendorDto", "7"),
            &p.cancel,
            async move {
                *writer.lock().unwrap() = Some(json!({"name": "Acme", "apiKey": "k-new"}));
                Ok::<_, String>(())
            },
        )
        .await
        .unwrap();

    let handler = &p.store.handlers()[0];
    assert_eq!(
        serde_json::to_value(handler.dto_diff.as_ref().unwrap()).unwrap(),
        json!([{
            "op": "replace",
            "path": "/apiKey",
            "value": REDACTION_MARKER,
            "oldValue": REDACTION_MARKER
        }])
    );
}

#[allow(clippy::unused_async)]
async fn explode() -> Result<(), String> {
    panic!("boom")
}

#[tokio::test]
async fn panicking_handler_is_completed_before_the_panic_resumes() {
    let p = pipeline(Arc::new(MemoryAuditStore::new()));

    let caught = AssertUnwindSafe(p.handlers.run(
        HandlerInvocation::new("Explode", "update").unwrap(),
        &p.cancel,
        explode(),
    ))
    .catch_unwind()
    .await;

    assert!(caught.is_err());
    let handler = &p.store.handlers()[0];
    assert!(!handler.is_success);
    assert!(handler.end_time.is_some());
    assert!(handler.duration_ms.is_some());
    assert!(handler.error_message.as_deref().unwrap().contains("boom"));
}

#[test]
fn unknown_operation_kind_fails_fast() {
    let err = HandlerInvocation::new("Frobnicate", "frobnicate").expect_err("closed set");
    assert!(matches!(err, AppError::Validation(_)));
}
