use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::identity::ClientIdentity;
use crate::rate_limiter::RateLimiter;

pub const RATE_LIMIT_HEADER: HeaderName = HeaderName::from_static("ratelimit-limit");
pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Logging middleware for request/response tracking
pub async fn logging_middleware(mut request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let client = client_label(&request);

    let request_id = request
        .headers()
        .get(&REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        request.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    info!(
        target: "turnstile::middleware",
        method = %method,
        uri = %uri,
        client = %client,
        request_id = %request_id,
        "Incoming request"
    );

    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    info!(
        target: "turnstile::middleware",
        method = %method,
        uri = %uri,
        status = %response.status(),
        elapsed = ?start.elapsed(),
        request_id = %request_id,
        "Request completed"
    );

    response
}

/// Admission control: one token per request, 429 once the caller's bucket
/// is empty. The policy header is attached to every outcome.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let identity = match ClientIdentity::from_parts(request.headers(), peer_addr(&request)) {
        Ok(identity) => identity,
        Err(err) => {
            warn!(error = %err, "Unable to resolve client identity");
            return Error::from(err).into_response();
        }
    };

    let decision = limiter.check(identity);
    let policy = HeaderValue::from_str(limiter.header_value()).ok();

    let mut response = if decision.is_admitted() {
        next.run(request).await
    } else {
        debug!(client = %decision.identity, "Rate limit exceeded");
        Error::RateLimitExceeded.into_response()
    };

    if let Some(policy) = policy {
        response.headers_mut().insert(RATE_LIMIT_HEADER, policy);
    }
    response
}

fn peer_addr(request: &Request) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

fn client_label(request: &Request) -> String {
    ClientIdentity::from_parts(request.headers(), peer_addr(request))
        .map(|identity| identity.to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
