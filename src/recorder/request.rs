//! Request boundary: one record per inbound HTTP request.
//!
//! `begin` adopts or mints the correlation id, stores the started record and
//! hands back an [`ActiveRequest`] whose scope the caller drives the rest of
//! the pipeline in. `complete` consumes it, so completion happens at most once.

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{guarded_write, panic_message, WriteTarget};
use crate::config::AuditConfig;
use crate::context::{self, RequestScope};
use crate::identity::{AnonymousIdentity, Identity, IdentityProvider};
use crate::models::RequestAuditRecord;
use crate::redact::{truncate_body, Redactor};
use crate::store::AuditStore;
use crate::Result;

/// Metadata of an inbound request as seen by the web middleware.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    /// HTTP method.
    pub method: String,
    /// Full URL (path and query).
    pub url: String,
    /// Raw query string.
    pub query_string: Option<String>,
    /// Header name/value pairs in arrival order.
    pub headers: Vec<(String, String)>,
    /// Request body decoded as UTF-8, if any.
    pub body: Option<String>,
    /// Client address.
    pub ip_address: Option<String>,
    /// Identity attached by an upstream authentication layer.
    pub identity: Option<Identity>,
}

impl InboundRequest {
    /// Minimal request with method and URL.
    #[must_use]
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            ..Self::default()
        }
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set the authenticated identity.
    #[must_use]
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// First value of header `name`, compared case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Status recorded for a request whose pipeline panicked.
const PANIC_STATUS: u16 = 500;

/// Final status and body of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body, if captured.
    pub body: Option<String>,
}

impl RequestOutcome {
    /// Outcome with a status code and no body.
    #[must_use]
    pub fn status(status_code: u16) -> Self {
        Self {
            status_code,
            body: None,
        }
    }
}

/// A started request awaiting completion.
#[derive(Debug)]
pub struct ActiveRequest {
    record: RequestAuditRecord,
    scope: RequestScope,
    completed: bool,
}

impl ActiveRequest {
    /// Scope to drive the remaining pipeline in.
    #[must_use]
    pub fn scope(&self) -> &RequestScope {
        &self.scope
    }

    /// The started record.
    #[must_use]
    pub fn record(&self) -> &RequestAuditRecord {
        &self.record
    }

    /// Correlation id adopted or minted for this request.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.record.correlation_id
    }
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        if !self.completed {
            warn!(
                correlation_id = %self.record.correlation_id,
                record_id = %self.record.id,
                "request dropped before audit completion"
            );
        }
    }
}

/// Records request-level audit entries and owns the correlation scope.
pub struct RequestAuditRecorder {
    store: Arc<dyn AuditStore>,
    redactor: Arc<Redactor>,
    identity: Arc<dyn IdentityProvider>,
    config: Arc<AuditConfig>,
}

impl RequestAuditRecorder {
    /// Create a recorder writing to `store`.
    #[must_use]
    pub fn new(store: Arc<dyn AuditStore>, config: Arc<AuditConfig>) -> Self {
        Self {
            store,
            redactor: Arc::new(Redactor::from_config(&config.redaction)),
            identity: Arc::new(AnonymousIdentity),
            config,
        }
    }

    /// Use `provider` when a request carries no identity of its own.
    #[must_use]
    pub fn with_identity_provider(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.identity = provider;
        self
    }

    /// Use a shared redactor instead of one built from the configuration.
    #[must_use]
    pub fn with_redactor(mut self, redactor: Arc<Redactor>) -> Self {
        self.redactor = redactor;
        self
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// Pick the correlation id for `request`.
    ///
    /// Preference: the configured correlation header, then the trace id of
    /// the configured tracing header, then a freshly minted id.
    #[must_use]
    pub fn resolve_correlation_id(&self, request: &InboundRequest) -> String {
        if let Some(id) = request
            .header(&self.config.correlation_header)
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            return id.to_owned();
        }
        if let Some(trace) = request
            .header(&self.config.trace_header)
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            return trace_id(trace).to_owned();
        }
        context::new_correlation_id()
    }

    /// Start auditing `request`.
    ///
    /// Storage failures are logged and the request proceeds unaudited.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if the method or URL is blank.
    pub async fn begin(&self, request: InboundRequest, cancel: &CancellationToken) -> Result<ActiveRequest> {
        let correlation_id = self.resolve_correlation_id(&request);
        let identity = request
            .identity
            .clone()
            .unwrap_or_else(|| self.identity.current());
        let max = self.config.max_body_bytes;

        let headers = self
            .redactor
            .sanitize_headers(request.headers.iter().map(|(n, v)| (n.as_str(), v.as_str())));
        let body = request
            .body
            .as_deref()
            .map(|b| truncate_body(&self.redactor.sanitize_str(b), max));

        let record = RequestAuditRecord::new(correlation_id, request.method.clone(), request.url.clone())?
            .with_identity(&identity)
            .with_query_string(request.query_string.clone())
            .with_headers(headers)
            .with_request_body(body)
            .with_client(
                request.ip_address.clone(),
                request.header("user-agent").map(str::to_owned),
            );

        let target = WriteTarget {
            kind: "request",
            correlation_id: &record.correlation_id,
            record_id: &record.id,
        };
        guarded_write(cancel, target, self.store.add_request(&record)).await;

        let scope = context::begin_request_scope(
            Some(record.id.clone()),
            record.correlation_id.clone(),
            identity,
        );
        debug!(correlation_id = %record.correlation_id, method = %record.method, url = %record.url, "request audit started");

        Ok(ActiveRequest {
            record,
            scope,
            completed: false,
        })
    }

    /// Record the outcome of `active` and release its scope.
    ///
    /// A non-success status also flags every handler that completed without
    /// error inside the request as failed.
    pub async fn complete(
        &self,
        mut active: ActiveRequest,
        status_code: u16,
        response_body: Option<&str>,
        cancel: &CancellationToken,
    ) {
        let body = response_body
            .map(|b| truncate_body(&self.redactor.sanitize_str(b), self.config.max_body_bytes));
        active.record.complete(status_code, body);
        active.completed = true;

        let record = &active.record;
        let target = WriteTarget {
            kind: "request",
            correlation_id: &record.correlation_id,
            record_id: &record.id,
        };
        guarded_write(cancel, target, self.store.complete_request(record)).await;

        if !is_success_status(status_code) {
            let message = format!("HTTP {status_code}");
            for handler_id in active.scope.succeeded_handlers() {
                let target = WriteTarget {
                    kind: "handler",
                    correlation_id: &record.correlation_id,
                    record_id: &handler_id,
                };
                guarded_write(cancel, target, self.store.mark_handler_failed(&handler_id, &message)).await;
            }
        }

        debug!(
            correlation_id = %record.correlation_id,
            status_code,
            duration_ms = record.duration_ms,
            "request audit completed"
        );
    }

    /// Audit a whole request: begin, drive `pipeline` in scope, complete.
    ///
    /// A panicking pipeline is recorded as a 500 before the panic resumes.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if the method or URL is blank; the
    /// pipeline is not run in that case.
    pub async fn run<Fut>(
        &self,
        request: InboundRequest,
        cancel: &CancellationToken,
        pipeline: Fut,
    ) -> Result<RequestOutcome>
    where
        Fut: Future<Output = RequestOutcome>,
    {
        let active = self.begin(request, cancel).await?;
        match self.drive_scoped(&active, pipeline).await {
            Ok(outcome) => {
                self.complete(active, outcome.status_code, outcome.body.as_deref(), cancel)
                    .await;
                Ok(outcome)
            }
            Err(payload) => {
                let message = panic_message(&*payload);
                self.complete_panicked(active, &message, cancel).await;
                panic::resume_unwind(payload)
            }
        }
    }

    /// Drive `pipeline` inside the scope of `active`, catching a panic so
    /// the caller can complete the record before resuming it.
    pub(crate) async fn drive_scoped<Fut>(
        &self,
        active: &ActiveRequest,
        pipeline: Fut,
    ) -> std::result::Result<Fut::Output, Box<dyn Any + Send>>
    where
        Fut: Future,
    {
        AssertUnwindSafe(active.scope().run(pipeline)).catch_unwind().await
    }

    /// Complete `active` as a server error after its pipeline panicked.
    pub(crate) async fn complete_panicked(&self, active: ActiveRequest, message: &str, cancel: &CancellationToken) {
        warn!(
            correlation_id = active.correlation_id(),
            panic = message,
            "request pipeline panicked"
        );
        self.complete(active, PANIC_STATUS, None, cancel).await;
    }
}

/// 2xx and 3xx count as success.
#[must_use]
pub fn is_success_status(status_code: u16) -> bool {
    (200..400).contains(&status_code)
}

/// Extract the trace id from a W3C `traceparent` value, or return it whole.
fn trace_id(raw: &str) -> &str {
    let mut parts = raw.split('-');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(version), Some(trace), Some(_), Some(_)) if version.len() == 2 && trace.len() == 32 => trace,
        _ => raw,
    }
}
