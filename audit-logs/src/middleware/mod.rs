//! axum integration
//!
//! Two middleware functions drive the capture lifecycle of inbound requests:
//!
//! - [`audit_middleware`], installed with [`Router::layer`], sees every
//!   request. It begins the exchange, records the response and completes
//!   the exchange.
//! - [`route_middleware`], installed with [`Router::route_layer`], only runs
//!   once a route matched. It attaches the route (`"{METHOD} {path template}"`)
//!   and captures the request body.
//!
//! [`AuditRouterExt::audited`] installs both.
//!
//! # Example
//!
//! ```rust,ignore
//! use audit_logs::prelude::*;
//! use axum::{routing::get, Router};
//!
//! let audit = AuditLogs::builder().config(config).build()?;
//! let app = Router::new()
//!     .route("/users/{id}", get(get_user))
//!     .audited(audit.capture());
//! ```

mod exchange;
mod route;

pub use exchange::audit_middleware;
pub use route::route_middleware;

use axum::{
    body::{Body, Bytes},
    Router,
};
use futures::{future, stream, StreamExt};

use crate::audit::CaptureService;

/// Authenticated user of an inbound request
///
/// Insert it into the request extensions from an authentication layer, or
/// into the response extensions from a handler, and the audit middleware
/// records it as `user.id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditPrincipal(pub String);

/// Marker left on responses of requests that reached a route
#[derive(Debug, Clone, Copy)]
pub(crate) struct RouteResolved;

/// Read a body into memory for capture
///
/// Returns the bytes when the whole body was read within `limit`, along with
/// the body to hand on. Otherwise no bytes are returned and the body replays
/// what was read, followed by the rest of the stream or by the read error.
pub(crate) async fn buffer_body(body: Body, limit: usize) -> (Option<Bytes>, Body) {
    let mut data = body.into_data_stream();
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut size = 0;

    while let Some(chunk) = data.next().await {
        match chunk {
            Ok(chunk) => {
                size += chunk.len();
                chunks.push(chunk);
                if size > limit {
                    let read = stream::iter(chunks.into_iter().map(Ok::<_, axum::Error>));
                    return (None, Body::from_stream(read.chain(data)));
                }
            }
            Err(e) => {
                let read = stream::iter(chunks.into_iter().map(Ok));
                let failed = stream::once(future::ready(Err(e)));
                return (None, Body::from_stream(read.chain(failed)));
            }
        }
    }

    let bytes = match chunks.len() {
        1 => chunks.swap_remove(0),
        _ => Bytes::from(chunks.concat()),
    };
    (Some(bytes.clone()), Body::from(bytes))
}

/// Install the audit middleware on a router
pub trait AuditRouterExt {
    /// Audit every route of the router
    ///
    /// Routes added after this call are not attached to a route policy and
    /// are captured with their raw request data only.
    fn audited(self, capture: &CaptureService) -> Self;
}

impl<S> AuditRouterExt for Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn audited(self, capture: &CaptureService) -> Self {
        self.route_layer(axum::middleware::from_fn_with_state(
            capture.clone(),
            route_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            capture.clone(),
            audit_middleware,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    #[tokio::test]
    async fn test_buffer_body_within_limit() {
        let (bytes, body) = buffer_body(Body::from("hello"), 16).await;
        assert_eq!(bytes.as_deref(), Some(&b"hello"[..]));
        let replayed = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(&replayed[..], b"hello");
    }

    #[tokio::test]
    async fn test_buffer_body_over_limit_replays_everything() {
        let chunks = stream::iter(vec![
            Ok::<_, Infallible>("0123456789"),
            Ok("0123456789"),
            Ok("tail"),
        ]);
        let (bytes, body) = buffer_body(Body::from_stream(chunks), 12).await;
        assert!(bytes.is_none());
        let replayed = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(&replayed[..], b"01234567890123456789tail");
    }
}
