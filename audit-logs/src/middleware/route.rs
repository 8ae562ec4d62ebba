use axum::{
    body::{Body, HttpBody},
    extract::{MatchedPath, Request, State},
    http::header::CONTENT_TYPE,
    middleware::Next,
    response::Response,
};

use super::{buffer_body, RouteResolved};
use crate::audit::{payload_from_bytes, CaptureService};
use crate::ids::ExchangeId;

/// Route-level audit middleware
///
/// Use with `axum::middleware::from_fn_with_state` on
/// [`Router::route_layer`](axum::Router::route_layer), together with
/// [`audit_middleware`](super::audit_middleware) on the same router.
///
/// The route id looked up in the policy table is the request method and the
/// matched path template, e.g. `"GET /users/{id}"`.
///
/// Request bodies are captured only when their length is known up front and
/// does not exceed `max_body_bytes`; chunked uploads pass through untouched.
/// A body that fails to read is handed to the handler as it failed, without
/// capture.
pub async fn route_middleware(
    State(capture): State<CaptureService>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(id) = request.extensions().get::<ExchangeId>().copied() else {
        return next.run(request).await;
    };

    let route_id = match request.extensions().get::<MatchedPath>() {
        Some(path) => format!("{} {}", request.method(), path.as_str()),
        None => format!("{} {}", request.method(), request.uri().path()),
    };
    capture.attach(&id, Some(&capture.descriptor(&route_id)));

    let request = if capture.is_tracked(&id) {
        capture_request_body(&capture, id, request).await
    } else {
        request
    };

    let mut response = next.run(request).await;
    response.extensions_mut().insert(RouteResolved);
    response
}

async fn capture_request_body(
    capture: &CaptureService,
    id: ExchangeId,
    request: Request<Body>,
) -> Request<Body> {
    let max = capture.config().max_body_bytes;
    match request.body().size_hint().exact() {
        Some(size) if size > 0 && size <= max as u64 => {}
        _ => return request,
    }

    let (parts, body) = request.into_parts();
    let (bytes, body) = buffer_body(body, max).await;
    let Some(bytes) = bytes else {
        tracing::warn!(exchange_id = %id, "Request body could not be read for audit");
        return Request::from_parts(parts, body);
    };

    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    if let Some(payload) = payload_from_bytes(&bytes, content_type) {
        capture.set_request_body(&id, payload);
    }
    Request::from_parts(parts, body)
}
