//! Top-level audit record for one inbound HTTP request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::identity::Identity;
use crate::{AppError, Result};

/// Request-level audit record; the root of a correlation chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct RequestAuditRecord {
    /// Unique record identifier.
    pub id: String,
    /// Identifier shared by every record in this request's chain.
    pub correlation_id: String,
    /// Tenant the request acted within.
    pub tenant_id: Option<String>,
    /// Authenticated user identifier.
    pub user_id: Option<String>,
    /// Authenticated user email.
    pub user_email: Option<String>,
    /// HTTP method.
    pub method: String,
    /// Full request URL (path and query).
    pub url: String,
    /// Raw query string without the leading `?`.
    pub query_string: Option<String>,
    /// Sanitized request headers keyed by name.
    pub headers: Value,
    /// Sanitized, possibly truncated request body.
    pub request_body: Option<String>,
    /// Final HTTP status code.
    pub status_code: Option<u16>,
    /// Sanitized, possibly truncated response body.
    pub response_body: Option<String>,
    /// Client address.
    pub ip_address: Option<String>,
    /// Client user agent.
    pub user_agent: Option<String>,
    /// When the request entered the pipeline.
    pub start_time: DateTime<Utc>,
    /// When the response left the pipeline; `None` until completed.
    pub end_time: Option<DateTime<Utc>>,
    /// `end_time - start_time` in milliseconds; `None` until completed.
    pub duration_ms: Option<i64>,
    /// Set by the archival process.
    pub is_archived: bool,
    /// When the record was archived.
    pub archived_at: Option<DateTime<Utc>>,
}

impl RequestAuditRecord {
    /// Start a record for a request that has just arrived.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if the correlation id, method, or URL is blank.
    pub fn new(correlation_id: String, method: String, url: String) -> Result<Self> {
        if correlation_id.trim().is_empty() {
            return Err(AppError::Validation("correlation_id is required".into()));
        }
        if method.trim().is_empty() {
            return Err(AppError::Validation("method is required".into()));
        }
        if url.trim().is_empty() {
            return Err(AppError::Validation("url is required".into()));
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            correlation_id,
            tenant_id: None,
            user_id: None,
            user_email: None,
            method,
            url,
            query_string: None,
            headers: Value::Object(serde_json::Map::new()),
            request_body: None,
            status_code: None,
            response_body: None,
            ip_address: None,
            user_agent: None,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            is_archived: false,
            archived_at: None,
        })
    }

    /// Attach the tenant and actor.
    #[must_use]
    pub fn with_identity(mut self, identity: &Identity) -> Self {
        self.tenant_id.clone_from(&identity.tenant_id);
        self.user_id.clone_from(&identity.user_id);
        self.user_email.clone_from(&identity.user_email);
        self
    }

    /// Set the raw query string.
    #[must_use]
    pub fn with_query_string(mut self, query_string: Option<String>) -> Self {
        self.query_string = query_string.filter(|q| !q.is_empty());
        self
    }

    /// Set the sanitized header map.
    #[must_use]
    pub fn with_headers(mut self, headers: Value) -> Self {
        self.headers = headers;
        self
    }

    /// Set the sanitized request body.
    #[must_use]
    pub fn with_request_body(mut self, body: Option<String>) -> Self {
        self.request_body = body.filter(|b| !b.is_empty());
        self
    }

    /// Set client address and user agent.
    #[must_use]
    pub fn with_client(mut self, ip_address: Option<String>, user_agent: Option<String>) -> Self {
        self.ip_address = ip_address;
        self.user_agent = user_agent;
        self
    }

    /// Record the outcome using the current wall-clock time.
    pub fn complete(&mut self, status_code: u16, response_body: Option<String>) {
        self.complete_at(status_code, response_body, Utc::now());
    }

    /// Record the outcome at `end_time`.
    ///
    /// A second call overwrites the first call's timing and outcome.
    pub fn complete_at(
        &mut self,
        status_code: u16,
        response_body: Option<String>,
        end_time: DateTime<Utc>,
    ) {
        self.status_code = Some(status_code);
        self.response_body = response_body.filter(|b| !b.is_empty());
        self.end_time = Some(end_time);
        self.duration_ms = Some(super::elapsed_ms(self.start_time, end_time));
    }

    /// Whether `complete` has been called.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.end_time.is_some()
    }
}
