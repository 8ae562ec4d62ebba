use axum::{
    body::{Body, HttpBody},
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;

use super::{buffer_body, AuditPrincipal, RouteResolved};
use crate::audit::{payload_from_bytes, CaptureService, RequestInfo};
use crate::config::Endpoint;
use crate::ids::ExchangeId;

/// Global audit middleware
///
/// Use with `axum::middleware::from_fn_with_state` on [`Router::layer`](axum::Router::layer).
///
/// The [`ExchangeId`] of an audited request is available to handlers as a
/// request extension, to call [`CaptureService::put_custom_field`] or
/// [`CaptureService::set_user`].
///
/// The user id is also taken from an [`AuditPrincipal`] extension, found on
/// the request (set by an authentication layer installed outside this one)
/// or on the response. `user.remoteAddress` is the socket peer, available
/// when the router is served with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
///
/// # Behavior
///
/// 1. Begins the exchange (nothing else happens if server auditing is disabled)
/// 2. Runs the inner service
/// 3. Drops the exchange if no route matched (404 without route)
/// 4. Records status and headers
/// 5. Streaming responses complete at once, without body
/// 6. Other responses with a body are buffered, captured and rebuilt; a body
///    that fails to read reaches the caller with its error, uncaptured
pub async fn audit_middleware(
    State(capture): State<CaptureService>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let info = RequestInfo::new(request.method().as_str(), request.uri().path())
        .with_query(request.uri().query())
        .with_headers(request.headers().clone());
    let info = match remote_address(&request) {
        Some(address) => info.with_remote_address(address),
        None => info,
    };

    let Some(id) = capture.begin(Endpoint::Server, info) else {
        return next.run(request).await;
    };
    if let Some(AuditPrincipal(user)) = request.extensions().get::<AuditPrincipal>() {
        capture.set_user(&id, Some(user.as_str()));
    }
    request.extensions_mut().insert(id);

    let response = next.run(request).await;
    if !capture.is_tracked(&id) {
        return response;
    }
    if let Some(AuditPrincipal(user)) = response.extensions().get::<AuditPrincipal>() {
        capture.set_user(&id, Some(user.as_str()));
    }

    if response.status() == StatusCode::NOT_FOUND
        && response.extensions().get::<RouteResolved>().is_none()
    {
        capture.attach(&id, None);
        return response;
    }

    capture.set_response(&id, response.status().as_u16(), response.headers());
    capture_response_body(&capture, id, response).await
}

async fn capture_response_body(
    capture: &CaptureService,
    id: ExchangeId,
    response: Response,
) -> Response {
    let max = capture.config().max_body_bytes;
    let size = match response.body().size_hint().exact() {
        Some(size) => size,
        None => {
            // streaming: no body in the record
            capture.complete(&id);
            return response;
        }
    };
    if size == 0 || size > max as u64 {
        capture.complete(&id);
        return response;
    }

    let (parts, body) = response.into_parts();
    let (bytes, body) = buffer_body(body, max).await;
    match bytes {
        Some(bytes) => {
            let content_type = capture.response_content_type(&id);
            if let Some(payload) = payload_from_bytes(&bytes, content_type.as_deref()) {
                capture.set_response_body(&id, payload);
            }
        }
        None => {
            tracing::warn!(exchange_id = %id, "Response body could not be read for audit");
        }
    }
    capture.complete(&id);
    Response::from_parts(parts, body)
}

/// Socket peer of the request, when the server was started with connect info
fn remote_address(request: &Request<Body>) -> Option<String> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}
