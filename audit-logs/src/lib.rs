//! # audit-logs
//!
//! Best-effort audit records for the HTTP exchanges of a service: every
//! inbound request (axum) and every outbound call (reqwest) produces one
//! structured record, posted to a collection endpoint from a detached task.
//!
//! ## Features
//!
//! - **Correlation**: asynchronous lifecycle events stitched into one record per exchange
//! - **Per-route policy**: enable/disable markers with group-level defaults, capture options
//! - **Redaction**: sensitive headers masked before anything leaves the process
//! - **Custom fields**: pluggable generators deriving fields from payloads
//! - **Fail-open**: the audit pipeline never changes the outcome of an exchange
//!
//! ## Example
//!
//! ```rust,no_run
//! use audit_logs::prelude::*;
//! use axum::{routing::get, Router};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     init_tracing("info")?;
//!
//!     let audit = AuditLogs::builder()
//!         .config(AuditLogsConfig::load()?)
//!         .route("GET /health", RoutePolicy::new().disabled())
//!         .build()?;
//!
//!     let app: Router = Router::new()
//!         .route("/hello", get(|| async { "Hello world!" }))
//!         .route("/health", get(|| async { "ok" }))
//!         .audited(audit.capture());
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//!     Ok(())
//! }
//! ```
//!
//! ## Cargo features
//!
//! - `server` (default): axum middleware
//! - `client` (default): audited reqwest client

pub mod audit;
pub mod builder;
pub mod config;
pub mod error;
pub mod ids;
pub mod observability;

#[cfg(feature = "server")]
pub mod middleware;

#[cfg(feature = "client")]
pub mod client;

pub use builder::{AuditLogs, AuditLogsBuilder};
pub use error::{Error, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::audit::{
        AuditRecord, AuditSender, CaptureOptions, CaptureService, CustomFields,
        CustomFieldsGenerator, DispatchMetrics, GeneratorKey, GroupPolicy, HttpCaptureOptions,
        PolicyTable, RequestInfo, RouteDescriptor, RoutePolicy,
    };
    pub use crate::builder::{AuditLogs, AuditLogsBuilder};
    pub use crate::config::{AuditLogsConfig, Endpoint};
    pub use crate::error::{Error, Result};
    pub use crate::ids::ExchangeId;
    pub use crate::observability::init_tracing;

    #[cfg(feature = "server")]
    pub use crate::middleware::{audit_middleware, route_middleware, AuditPrincipal, AuditRouterExt};

    #[cfg(feature = "client")]
    pub use crate::client::AuditedClient;
}
