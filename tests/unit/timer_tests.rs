use std::time::Duration;

use audit_chain::recorder::OperationTimer;

#[tokio::test(start_paused = true)]
async fn stop_returns_elapsed_time() {
    let mut timer = OperationTimer::new();
    assert!(timer.start("charge-1"));

    tokio::time::advance(Duration::from_millis(250)).await;

    assert_eq!(timer.stop("charge-1"), Some(Duration::from_millis(250)));
    assert_eq!(timer.in_flight(), 0);
    assert_eq!(timer.completed(), 1);
}

#[test]
fn stopping_unknown_or_stopped_ids_never_goes_negative() {
    let mut timer = OperationTimer::new();

    assert_eq!(timer.stop("never-started"), None);
    assert_eq!(timer.in_flight(), 0);

    timer.start("refund-1");
    assert!(timer.stop("refund-1").is_some());
    assert_eq!(timer.stop("refund-1"), None);
    assert_eq!(timer.in_flight(), 0);
    assert_eq!(timer.completed(), 1);
}

#[test]
fn restarting_a_running_id_keeps_one_entry() {
    let mut timer = OperationTimer::new();
    assert!(timer.start("op"));
    assert!(!timer.start("op"));
    assert_eq!(timer.in_flight(), 1);
}

#[test]
fn interleaved_operations_are_tracked_independently() {
    let mut timer = OperationTimer::new();
    timer.start("a");
    timer.start("b");
    assert_eq!(timer.in_flight(), 2);

    assert!(timer.stop("a").is_some());
    assert_eq!(timer.in_flight(), 1);
    assert!(timer.stop("b").is_some());
    assert_eq!(timer.in_flight(), 0);
}
