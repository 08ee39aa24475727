//! Handler boundary: one record per command or query handler execution.
//!
//! The recorder wraps the handler future, marks its record as the active
//! handler for the span of the call, and stores the sanitized input, output
//! and an optional DTO diff. The handler's own result is returned untouched.

use std::collections::HashMap;
use std::fmt::{self, Debug, Display};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{guarded_write, panic_message, WriteTarget};
use crate::context::{self, CorrelationScope};
use crate::diff::diff_values;
use crate::identity::{AnonymousIdentity, IdentityProvider};
use crate::models::{HandlerAuditRecord, OperationType};
use crate::redact::Redactor;
use crate::store::AuditStore;
use crate::{AppError, Result};

/// Future returned by a registered snapshot fetcher.
pub type SnapshotFuture = Pin<Box<dyn Future<Output = Result<Option<Value>>> + Send>>;

type SnapshotFetcher = Arc<dyn Fn(String) -> SnapshotFuture + Send + Sync>;

/// Per-DTO-type lookups that load the current state of a handler's target.
///
/// A type without a registered fetcher gets no DTO diff. Fetch failures are
/// treated as an absent snapshot.
#[derive(Clone, Default)]
pub struct SnapshotRegistry {
    fetchers: HashMap<String, SnapshotFetcher>,
}

impl Debug for SnapshotRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotRegistry")
            .field("dto_types", &self.fetchers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SnapshotRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the fetcher for `dto_type`, replacing any previous one.
    pub fn register<F, Fut>(&mut self, dto_type: impl Into<String>, fetch: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        let fetcher: SnapshotFetcher = Arc::new(move |id| -> SnapshotFuture { Box::pin(fetch(id)) });
        self.fetchers.insert(dto_type.into(), fetcher);
    }

    /// Whether `dto_type` has a fetcher.
    #[must_use]
    pub fn contains(&self, dto_type: &str) -> bool {
        self.fetchers.contains_key(dto_type)
    }

    /// Load the current state of `dto_type` / `dto_id`.
    pub async fn fetch(&self, dto_type: &str, dto_id: &str) -> Option<Value> {
        let fetcher = self.fetchers.get(dto_type)?;
        match fetcher(dto_id.to_owned()).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                debug!(dto_type, dto_id, %err, "snapshot fetch failed; treating as absent");
                None
            }
        }
    }
}

/// Description of one handler call, built by the dispatcher.
#[derive(Debug, Clone)]
pub struct HandlerInvocation {
    handler_name: String,
    operation_type: OperationType,
    input: Option<Value>,
    target: Option<(String, String)>,
    page_context: Option<String>,
    action_description: Option<String>,
    target_display_name: Option<String>,
}

impl HandlerInvocation {
    /// Describe a call to `handler_name` with the given operation kind
    /// (`create`, `update`, `delete` or `query`).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if the name is blank or the operation
    /// kind is unknown.
    pub fn new(handler_name: impl Into<String>, operation_type: &str) -> Result<Self> {
        Self::typed(handler_name, OperationType::parse(operation_type)?)
    }

    /// Like [`HandlerInvocation::new`] with an already classified operation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if the name is blank.
    pub fn typed(handler_name: impl Into<String>, operation_type: OperationType) -> Result<Self> {
        let handler_name = handler_name.into();
        if handler_name.trim().is_empty() {
            return Err(AppError::Validation("handler_name is required".into()));
        }
        Ok(Self {
            handler_name,
            operation_type,
            input: None,
            target: None,
            page_context: None,
            action_description: None,
            target_display_name: None,
        })
    }

    /// Attach the handler input. Unserializable input is kept as its debug form.
    #[must_use]
    pub fn with_input<T>(mut self, input: &T) -> Self
    where
        T: Serialize + Debug + ?Sized,
    {
        self.input = Some(
            serde_json::to_value(input).unwrap_or_else(|_| Value::String(format!("{input:?}"))),
        );
        self
    }

    /// Name the DTO the handler reads or changes.
    #[must_use]
    pub fn with_target(mut self, dto_type: impl Into<String>, dto_id: impl Into<String>) -> Self {
        self.target = Some((dto_type.into(), dto_id.into()));
        self
    }

    /// UI page the action came from.
    #[must_use]
    pub fn with_page_context(mut self, page_context: impl Into<String>) -> Self {
        self.page_context = Some(page_context.into());
        self
    }

    /// Human-readable description of the action.
    #[must_use]
    pub fn with_action_description(mut self, description: impl Into<String>) -> Self {
        self.action_description = Some(description.into());
        self
    }

    /// Human-readable name of the target.
    #[must_use]
    pub fn with_target_display_name(mut self, name: impl Into<String>) -> Self {
        self.target_display_name = Some(name.into());
        self
    }

    /// Handler name.
    #[must_use]
    pub fn handler_name(&self) -> &str {
        &self.handler_name
    }

    /// Operation kind.
    #[must_use]
    pub fn operation_type(&self) -> OperationType {
        self.operation_type
    }
}

/// Records handler-level audit entries around handler futures.
pub struct HandlerAuditRecorder {
    store: Arc<dyn AuditStore>,
    redactor: Arc<Redactor>,
    snapshots: Arc<SnapshotRegistry>,
    identity: Arc<dyn IdentityProvider>,
}

impl HandlerAuditRecorder {
    /// Create a recorder writing to `store`.
    #[must_use]
    pub fn new(store: Arc<dyn AuditStore>, redactor: Arc<Redactor>) -> Self {
        Self {
            store,
            redactor,
            snapshots: Arc::new(SnapshotRegistry::new()),
            identity: Arc::new(AnonymousIdentity),
        }
    }

    /// Use `snapshots` to compute DTO diffs.
    #[must_use]
    pub fn with_snapshots(mut self, snapshots: Arc<SnapshotRegistry>) -> Self {
        self.snapshots = snapshots;
        self
    }

    /// Identity used when a handler runs outside any request scope.
    #[must_use]
    pub fn with_identity_provider(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.identity = provider;
        self
    }

    /// Run `handler` under audit and return its result unchanged.
    ///
    /// Outside a request scope a detached scope with a new correlation id is
    /// opened, so background triggers still produce a linked chain. Audit
    /// failures are logged and never affect the handler.
    pub async fn run<T, E, Fut>(
        &self,
        invocation: HandlerInvocation,
        cancel: &CancellationToken,
        handler: Fut,
    ) -> std::result::Result<T, E>
    where
        Fut: Future<Output = std::result::Result<T, E>>,
        T: Serialize + Debug,
        E: Display,
    {
        match context::current() {
            Some(scope) => self.run_in_scope(scope, invocation, cancel, handler).await,
            None => {
                let detached = context::begin_request_scope(
                    None,
                    context::new_correlation_id(),
                    self.identity.current(),
                );
                debug!(
                    correlation_id = detached.correlation_id(),
                    handler = invocation.handler_name(),
                    "handler invoked outside a request; opened detached scope"
                );
                let scope = detached.snapshot().clone();
                detached
                    .run(self.run_in_scope(scope, invocation, cancel, handler))
                    .await
            }
        }
    }

    async fn run_in_scope<T, E, Fut>(
        &self,
        scope: CorrelationScope,
        invocation: HandlerInvocation,
        cancel: &CancellationToken,
        handler: Fut,
    ) -> std::result::Result<T, E>
    where
        Fut: Future<Output = std::result::Result<T, E>>,
        T: Serialize + Debug,
        E: Display,
    {
        let mut record = match self.start_record(&scope, &invocation) {
            Ok(record) => record,
            Err(err) => {
                warn!(handler = invocation.handler_name(), %err, "handler audit record not created");
                return handler.await;
            }
        };

        let before = match &invocation.target {
            Some((dto_type, dto_id)) => self.snapshots.fetch(dto_type, dto_id).await,
            None => None,
        };

        let target = WriteTarget {
            kind: "handler",
            correlation_id: &scope.correlation_id,
            record_id: &record.id,
        };
        guarded_write(cancel, target, self.store.add_handler(&record)).await;

        let outcome = match AssertUnwindSafe(context::with_handler(record.id.clone(), handler))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(payload) => {
                record.complete_failure(&format!("handler panicked: {}", panic_message(&*payload)));
                self.finish(&scope, &record, cancel).await;
                panic::resume_unwind(payload);
            }
        };

        match &outcome {
            Ok(output) => {
                let raw = serde_json::to_value(output).ok();
                let sanitized = match &raw {
                    Some(value) => self.redactor.sanitize_value(value),
                    None => self.redactor.sanitize(output),
                };
                let dto_diff = match (&before, &invocation.target) {
                    (Some(before), Some((dto_type, dto_id))) => {
                        let after = self.after_state(&invocation, dto_type, dto_id, raw).await;
                        Some(self.redactor.redact_patch(diff_values(Some(before), after.as_ref())))
                    }
                    _ => None,
                };
                record.complete_success(Some(sanitized), dto_diff);
                context::note_handler_succeeded(&record.id);
            }
            Err(err) => record.complete_failure(&err.to_string()),
        }

        self.finish(&scope, &record, cancel).await;
        outcome
    }

    async fn finish(&self, scope: &CorrelationScope, record: &HandlerAuditRecord, cancel: &CancellationToken) {
        let target = WriteTarget {
            kind: "handler",
            correlation_id: &scope.correlation_id,
            record_id: &record.id,
        };
        guarded_write(cancel, target, self.store.complete_handler(record)).await;

        debug!(
            correlation_id = %scope.correlation_id,
            handler = %record.handler_name,
            is_success = record.is_success,
            duration_ms = record.duration_ms,
            "handler audit completed"
        );
    }

    fn start_record(&self, scope: &CorrelationScope, invocation: &HandlerInvocation) -> Result<HandlerAuditRecord> {
        let mut record = HandlerAuditRecord::new(
            scope.correlation_id.clone(),
            invocation.handler_name.clone(),
            invocation.operation_type,
        )?;
        record.http_request_audit_log_id.clone_from(&scope.request_record_id);
        record.tenant_id.clone_from(&scope.identity.tenant_id);
        record.user_id.clone_from(&scope.identity.user_id);
        record.page_context.clone_from(&invocation.page_context);
        record.action_description.clone_from(&invocation.action_description);
        record.target_display_name.clone_from(&invocation.target_display_name);
        if let Some((dto_type, dto_id)) = &invocation.target {
            record.target_dto_type = Some(dto_type.clone());
            record.target_dto_id = Some(dto_id.clone());
        }
        record.input_parameters = invocation
            .input
            .as_ref()
            .map(|input| self.redactor.sanitize_value(input));
        Ok(record)
    }

    /// State of the target after the handler ran, unredacted.
    ///
    /// Re-fetched through the snapshot registry; when that yields nothing a
    /// delete is treated as removing the target and any other operation
    /// falls back to the handler's output.
    async fn after_state(
        &self,
        invocation: &HandlerInvocation,
        dto_type: &str,
        dto_id: &str,
        output: Option<Value>,
    ) -> Option<Value> {
        if let Some(after) = self.snapshots.fetch(dto_type, dto_id).await {
            return Some(after);
        }
        match invocation.operation_type {
            OperationType::Delete => None,
            _ => output,
        }
    }
}
