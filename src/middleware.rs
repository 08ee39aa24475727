//! axum middleware that audits every request passing through a router.
//!
//! Request and response bodies of known length up to `max_capture_bytes` are
//! buffered so they can be recorded, then handed on unchanged. Larger or
//! unsized bodies and server-sent event streams pass through unbuffered and
//! are recorded without a body.

use std::net::SocketAddr;
use std::panic;
use std::sync::Arc;

use axum::body::{to_bytes, Body, Bytes, HttpBody};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::identity::Identity;
use crate::recorder::{panic_message, InboundRequest, RequestAuditRecorder};

/// State shared by every invocation of [`audit_requests`].
#[derive(Clone)]
pub struct AuditLayerState {
    /// Recorder that owns the request scope.
    pub recorder: Arc<RequestAuditRecorder>,
    /// Cancelled on shutdown; abandons pending audit writes.
    pub cancel: CancellationToken,
}

/// Wrap `router` so every request is audited.
#[must_use]
pub fn audited(router: Router, recorder: Arc<RequestAuditRecorder>, cancel: CancellationToken) -> Router {
    router.layer(middleware::from_fn_with_state(
        AuditLayerState { recorder, cancel },
        audit_requests,
    ))
}

/// Middleware body: begin the request record, run the rest of the pipeline
/// inside its correlation scope, then complete the record.
pub async fn audit_requests(State(state): State<AuditLayerState>, request: Request, next: Next) -> Response {
    let recorder = &state.recorder;
    let cap = recorder.config().max_capture_bytes;
    let (parts, body) = request.into_parts();
    let (captured, body) = match capture(body, cap).await {
        Ok(split) => split,
        Err(err) => {
            warn!(%err, "failed to read request body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let headers: Vec<(String, String)> = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_owned(), v.to_owned()))
        })
        .collect();

    let inbound = InboundRequest {
        method: parts.method.as_str().to_owned(),
        url: parts.uri.to_string(),
        query_string: parts.uri.query().map(str::to_owned),
        ip_address: client_ip(&parts),
        body: captured.as_ref().and_then(body_text),
        identity: parts.extensions.get::<Identity>().cloned(),
        headers,
    };

    let active = match recorder.begin(inbound, &state.cancel).await {
        Ok(active) => active,
        Err(err) => {
            warn!(%err, "request not audited");
            return next.run(Request::from_parts(parts, body)).await;
        }
    };

    let request = Request::from_parts(parts, body);
    let response = match recorder.drive_scoped(&active, next.run(request)).await {
        Ok(response) => response,
        Err(payload) => {
            let message = panic_message(&*payload);
            recorder.complete_panicked(active, &message, &state.cancel).await;
            panic::resume_unwind(payload)
        }
    };
    let (mut parts, body) = response.into_parts();

    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(recorder.config().correlation_header.as_bytes()),
        HeaderValue::from_str(active.correlation_id()),
    ) {
        parts.headers.entry(name).or_insert(value);
    }

    let status = parts.status.as_u16();
    if is_event_stream(&parts.headers) {
        recorder.complete(active, status, None, &state.cancel).await;
        return Response::from_parts(parts, body);
    }

    match capture(body, cap).await {
        Ok((captured, body)) => {
            let text = captured.as_ref().and_then(body_text);
            recorder
                .complete(active, status, text.as_deref(), &state.cancel)
                .await;
            Response::from_parts(parts, body)
        }
        Err(err) => {
            warn!(correlation_id = active.correlation_id(), %err, "failed to read response body");
            let failed = StatusCode::INTERNAL_SERVER_ERROR;
            recorder
                .complete(active, failed.as_u16(), None, &state.cancel)
                .await;
            failed.into_response()
        }
    }
}

/// Buffer `body` when its length is known and at most `cap` bytes.
///
/// Returns the captured bytes (if any) and a body carrying the same content.
/// Bodies of unknown or larger size are handed back untouched.
async fn capture(body: Body, cap: usize) -> Result<(Option<Bytes>, Body), axum::Error> {
    let fits = body
        .size_hint()
        .upper()
        .and_then(|upper| usize::try_from(upper).ok())
        .is_some_and(|upper| upper <= cap);
    if !fits {
        debug!(cap, "body not captured: size unknown or over limit");
        return Ok((None, body));
    }
    let bytes = to_bytes(body, cap).await?;
    Ok((Some(bytes.clone()), Body::from(bytes)))
}

fn body_text(bytes: &Bytes) -> Option<String> {
    if bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(bytes).into_owned())
    }
}

fn is_event_stream(headers: &axum::http::HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"))
}

/// Peer address from `ConnectInfo`, falling back to the first
/// `X-Forwarded-For` hop.
fn client_ip(parts: &axum::http::request::Parts) -> Option<String> {
    if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
        return Some(addr.ip().to_string());
    }
    parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}
