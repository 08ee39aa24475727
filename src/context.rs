//! Ambient correlation state for one logical call chain.
//!
//! The active [`CorrelationScope`] lives in a tokio task-local, so it follows
//! the future it was bound to across every `.await` and never leaks into a
//! sibling request running on the same worker thread. Scopes are immutable
//! snapshots: marking a handler as active binds a nested scope for the span
//! of the handler future, and the enclosing scope is visible again as soon
//! as that future completes, fails, or is dropped.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;
use uuid::Uuid;

use crate::identity::Identity;

tokio::task_local! {
    static FRAME: ScopeFrame;
}

/// Immutable snapshot of the correlation state visible to the current chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationScope {
    /// Identifier shared by every record produced in this chain.
    pub correlation_id: String,
    /// Request record that opened the chain, if any.
    pub request_record_id: Option<String>,
    /// Handler record currently executing, if any.
    pub active_handler_record_id: Option<String>,
    /// Tenant and actor resolved when the chain was opened.
    pub identity: Identity,
}

/// Task-local payload: the visible snapshot plus the per-request list of
/// handlers that finished without error.
#[derive(Debug, Clone)]
struct ScopeFrame {
    scope: CorrelationScope,
    succeeded_handlers: Arc<Mutex<Vec<String>>>,
}

/// Mint a new opaque correlation identifier.
#[must_use]
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Read the scope visible to the calling chain.
///
/// Returns `None` outside any scope, which is the expected state for
/// background work and seeding.
#[must_use]
pub fn current() -> Option<CorrelationScope> {
    FRAME.try_with(|frame| frame.scope.clone()).ok()
}

/// Open a request-level scope.
///
/// Nothing becomes ambient until the returned [`RequestScope`] runs a future;
/// the state is released when that future finishes on any path.
#[must_use]
pub fn begin_request_scope(
    request_record_id: Option<String>,
    correlation_id: String,
    identity: Identity,
) -> RequestScope {
    RequestScope {
        frame: ScopeFrame {
            scope: CorrelationScope {
                correlation_id,
                request_record_id,
                active_handler_record_id: None,
                identity,
            },
            succeeded_handlers: Arc::new(Mutex::new(Vec::new())),
        },
    }
}

/// Run `fut` with `handler_record_id` as the active handler.
///
/// Request-level fields are inherited from the enclosing scope. The marker
/// is cleared when `fut` resolves, so sequential and concurrent handlers in
/// one request each see only their own id. Outside any scope the future runs
/// unchanged.
pub async fn with_handler<F>(handler_record_id: String, fut: F) -> F::Output
where
    F: Future,
{
    let Ok(mut frame) = FRAME.try_with(Clone::clone) else {
        debug!(%handler_record_id, "no correlation scope active; handler marker not set");
        return fut.await;
    };
    frame.scope.active_handler_record_id = Some(handler_record_id);
    FRAME.scope(frame, fut).await
}

/// Record that `handler_record_id` completed without error in this request.
///
/// Used by the request boundary to correct handler outcomes when the final
/// HTTP status reports a failure.
pub fn note_handler_succeeded(handler_record_id: &str) {
    let _ = FRAME.try_with(|frame| {
        frame
            .succeeded_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler_record_id.to_owned());
    });
}

/// Capture the caller's scope so `fut` observes it when polled elsewhere,
/// e.g. after `tokio::spawn`.
pub fn propagate<F>(fut: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let frame = FRAME.try_with(Clone::clone).ok();
    async move {
        match frame {
            Some(frame) => FRAME.scope(frame, fut).await,
            None => fut.await,
        }
    }
}

/// Handle to a request-level scope that has not necessarily been entered yet.
#[derive(Debug, Clone)]
pub struct RequestScope {
    frame: ScopeFrame,
}

impl RequestScope {
    /// Snapshot of the state this scope makes ambient.
    #[must_use]
    pub fn snapshot(&self) -> &CorrelationScope {
        &self.frame.scope
    }

    /// Correlation id shared by the chain.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.frame.scope.correlation_id
    }

    /// Drive `fut` with this scope ambient.
    pub async fn run<F>(&self, fut: F) -> F::Output
    where
        F: Future,
    {
        FRAME.scope(self.frame.clone(), fut).await
    }

    /// Run a synchronous closure with this scope ambient.
    pub fn run_sync<R>(&self, f: impl FnOnce() -> R) -> R {
        FRAME.sync_scope(self.frame.clone(), f)
    }

    /// Handler ids that completed without error inside this scope.
    #[must_use]
    pub fn succeeded_handlers(&self) -> Vec<String> {
        self.frame
            .succeeded_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
