use chrono::{Duration, Utc};
use serde_json::json;

use audit_chain::diff::PatchOperation;
use audit_chain::identity::Identity;
use audit_chain::models::handler::append_error;
use audit_chain::models::{EntityAuditRecord, HandlerAuditRecord, OperationType, RequestAuditRecord};
use audit_chain::AppError;

// ── Operation type ───────────────────────────────────────

#[test]
fn operation_type_parses_case_insensitively() {
    assert_eq!(OperationType::parse("Create").unwrap(), OperationType::Create);
    assert_eq!(OperationType::parse(" UPDATE ").unwrap(), OperationType::Update);
    assert_eq!("delete".parse::<OperationType>().unwrap(), OperationType::Delete);
    assert_eq!(OperationType::Query.to_string(), "query");
}

#[test]
fn operation_type_outside_closed_set_is_rejected() {
    let err = OperationType::parse("Archive").expect_err("unknown kind");
    assert!(matches!(err, AppError::Validation(msg) if msg.contains("Archive")));
}

#[test]
fn only_query_is_not_a_mutation() {
    assert!(OperationType::Create.is_mutation());
    assert!(OperationType::Update.is_mutation());
    assert!(OperationType::Delete.is_mutation());
    assert!(!OperationType::Query.is_mutation());
}

// ── Request record ───────────────────────────────────────

#[test]
fn request_timing_is_absent_until_completed() {
    let record = RequestAuditRecord::new("c-1".into(), "GET".into(), "/x".into()).unwrap();

    assert!(record.end_time.is_none());
    assert!(record.duration_ms.is_none());
    assert!(record.status_code.is_none());
    assert!(!record.is_completed());
}

#[test]
fn request_duration_is_end_minus_start() {
    let mut record = RequestAuditRecord::new("c-1".into(), "GET".into(), "/x".into()).unwrap();
    let end = record.start_time + Duration::milliseconds(1_250);

    record.complete_at(200, Some("ok".into()), end);

    assert_eq!(record.end_time, Some(end));
    assert_eq!(record.duration_ms, Some(1_250));
    assert_eq!(record.status_code, Some(200));
    assert_eq!(record.response_body.as_deref(), Some("ok"));
}

#[test]
fn second_completion_overwrites_timing() {
    let mut record = RequestAuditRecord::new("c-1".into(), "POST".into(), "/x".into()).unwrap();
    record.complete_at(500, None, record.start_time + Duration::milliseconds(40));
    record.complete_at(200, None, record.start_time + Duration::milliseconds(90));

    assert_eq!(record.duration_ms, Some(90));
    assert_eq!(record.status_code, Some(200));
}

#[test]
fn clock_skew_never_yields_negative_duration() {
    let mut record = RequestAuditRecord::new("c-1".into(), "GET".into(), "/x".into()).unwrap();
    record.complete_at(200, None, record.start_time - Duration::seconds(3));
    assert_eq!(record.duration_ms, Some(0));
}

#[test]
fn request_requires_method_and_url() {
    assert!(matches!(
        RequestAuditRecord::new("c-1".into(), " ".into(), "/x".into()),
        Err(AppError::Validation(_))
    ));
    assert!(matches!(
        RequestAuditRecord::new("c-1".into(), "GET".into(), String::new()),
        Err(AppError::Validation(_))
    ));
}

#[test]
fn request_identity_is_copied() {
    let identity = Identity::new(Some("t-1".into()), "u-1".into(), Some("u@x.io".into()));
    let record = RequestAuditRecord::new("c-1".into(), "GET".into(), "/x".into())
        .unwrap()
        .with_identity(&identity);

    assert_eq!(record.tenant_id.as_deref(), Some("t-1"));
    assert_eq!(record.user_id.as_deref(), Some("u-1"));
    assert_eq!(record.user_email.as_deref(), Some("u@x.io"));
}

// ── Handler record ───────────────────────────────────────

fn handler() -> HandlerAuditRecord {
    HandlerAuditRecord::new("c-1".into(), "UpdateVendor".into(), OperationType::Update).unwrap()
}

#[test]
fn handler_starts_incomplete_and_unsuccessful() {
    let record = handler();
    assert!(!record.is_success);
    assert!(!record.is_completed());
    assert!(record.duration_ms.is_none());
}

#[test]
fn handler_success_sets_output_diff_and_timing() {
    let mut record = handler();
    let diff = vec![PatchOperation::replace("/name", json!("New"), json!("Old"))];

    record.complete_success(Some(json!({"id": 1})), Some(diff.clone()));

    assert!(record.is_success);
    assert!(record.is_completed());
    assert_eq!(record.output_result, Some(json!({"id": 1})));
    assert_eq!(record.dto_diff, Some(diff));
    let end = record.end_time.unwrap();
    assert_eq!(record.duration_ms, Some((end - record.start_time).num_milliseconds()));
}

#[test]
fn mark_as_failed_accumulates_messages() {
    let mut record = handler();
    record.complete_failure("boom");
    let end_time = record.end_time;

    record.mark_as_failed("HTTP 500");

    assert!(!record.is_success);
    assert_eq!(record.error_message.as_deref(), Some("boom | HTTP 500"));
    assert_eq!(record.end_time, end_time, "post-hoc marking keeps timing");
}

#[test]
fn post_hoc_failure_overrides_success() {
    let mut record = handler();
    record.complete_success(None, None);
    record.mark_as_failed("HTTP 422");

    assert!(!record.is_success);
    assert_eq!(record.error_message.as_deref(), Some("HTTP 422"));
}

#[test]
fn append_error_ignores_empty_prior() {
    assert_eq!(append_error(None, "a"), "a");
    assert_eq!(append_error(Some(String::new()), "a"), "a");
    assert_eq!(append_error(Some("a".into()), "b"), "a | b");
}

#[test]
fn handler_requires_name_and_correlation() {
    assert!(HandlerAuditRecord::new(String::new(), "H".into(), OperationType::Query).is_err());
    assert!(HandlerAuditRecord::new("c".into(), "  ".into(), OperationType::Query).is_err());
}

// ── Entity record ────────────────────────────────────────

#[test]
fn entity_record_rejects_query_operations() {
    let err = EntityAuditRecord::new("Vendor".into(), "1".into(), OperationType::Query, Vec::new())
        .expect_err("query is not a change");
    assert!(matches!(err, AppError::Validation(_)));
}

#[test]
fn entity_record_links_to_chain() {
    let record = EntityAuditRecord::new("Vendor".into(), "1".into(), OperationType::Create, Vec::new())
        .unwrap()
        .linked(Some("h-1".into()), Some("c-1".into()), Some("t-1".into()));

    assert_eq!(record.handler_audit_log_id.as_deref(), Some("h-1"));
    assert_eq!(record.correlation_id.as_deref(), Some("c-1"));
    assert_eq!(record.tenant_id.as_deref(), Some("t-1"));
    assert!(record.timestamp <= Utc::now());
}
