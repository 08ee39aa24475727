//! Boundary components that turn requests, handler invocations and entity
//! saves into linked audit records.
//!
//! Every recorder converts audit-side failures into `tracing` events. The
//! only error a caller can see is an invalid argument at construction time.

pub mod entity;
pub mod handler;
pub mod request;
pub mod timing;

use std::any::Any;
use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{AppError, Result};

pub use entity::{EntityChangeRecorder, EntityState, TrackedEntity};
pub use handler::{HandlerAuditRecorder, HandlerInvocation, SnapshotRegistry};
pub use request::{ActiveRequest, InboundRequest, RequestAuditRecorder, RequestOutcome};
pub use timing::OperationTimer;

/// Identifies a record in write-failure logs.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WriteTarget<'a> {
    pub kind: &'static str,
    pub correlation_id: &'a str,
    pub record_id: &'a str,
}

/// Await an audit write, logging instead of propagating any failure.
///
/// Returns `true` when the write succeeded. A cancelled `cancel` token
/// abandons the write.
pub(crate) async fn guarded_write<F>(cancel: &CancellationToken, target: WriteTarget<'_>, write: F) -> bool
where
    F: Future<Output = Result<()>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            info!(
                record_kind = target.kind,
                correlation_id = target.correlation_id,
                record_id = target.record_id,
                "audit write cancelled"
            );
            false
        }
        result = write => match result {
            Ok(()) => true,
            Err(AppError::NotFound(msg)) => {
                warn!(
                    record_kind = target.kind,
                    correlation_id = target.correlation_id,
                    record_id = target.record_id,
                    %msg,
                    "audit record missing; completion not recorded"
                );
                false
            }
            Err(err) => {
                warn!(
                    record_kind = target.kind,
                    correlation_id = target.correlation_id,
                    record_id = target.record_id,
                    %err,
                    "audit write failed"
                );
                false
            }
        }
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}
