//! Capture and correlation engine
//!
//! Turns the lifecycle events of an HTTP exchange (request started, route
//! resolved, bodies read, response received) into one [`AuditRecord`] per
//! exchange, then forwards it to a sink without blocking or failing the
//! exchange itself.
//!
//! # Architecture
//!
//! [`CaptureService`] is the only entry point of the transports. It keeps
//! in-flight records in a sharded [`CorrelationStore`] keyed by a random
//! [`ExchangeId`](crate::ids::ExchangeId), asks the [`PolicyResolver`] what
//! to capture once the route is known, masks headers with the
//! [`Redactor`], runs [`CustomFieldsGenerator`]s from the
//! [`GeneratorRegistry`] and, on the terminal event, hands the record to the
//! [`Dispatcher`], which posts it from a detached task.

pub mod capture;
pub mod dispatcher;
pub mod generators;
pub mod policy;
pub mod record;
pub mod redaction;
pub mod store;

pub use capture::{payload_from_bytes, CaptureService, RequestInfo};
pub use dispatcher::{AuditSender, DispatchMetrics, Dispatcher, HttpSender};
pub use generators::{CustomFieldsGenerator, GeneratorKey, GeneratorRegistry, NoopGenerator};
pub use policy::{
    CaptureOptions, EnablementDecision, GroupPolicy, HttpCaptureOptions, PolicyResolver,
    PolicyTable, RouteDescriptor, RoutePolicy,
};
pub use record::{AuditRecord, AuditRequest, AuditResponse, AuditUser, CustomFields, MultiMap};
pub use redaction::{extract_query_params, Redactor, MASK};
pub use store::{CorrelationStore, Exchange};
