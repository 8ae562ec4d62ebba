//! Capture service
//!
//! [`CaptureService`] is what the transport integrations call, at fixed
//! points of an exchange:
//!
//! ```text
//! begin -> attach -> set_request_body -> set_response -> set_response_body
//!                                                     \-> complete
//! ```
//!
//! Calls for one exchange arrive in that order; calls for different
//! exchanges interleave freely. Every operation is fail-open: none of them
//! returns an error, and an id that is unknown (disabled route, already
//! completed, never begun) turns any later call into a no-op.
//!
//! The first terminal call (`complete`, `discard`, or a disabling `attach`)
//! takes the record out of the store; whatever happens afterwards for that
//! id is ignored.

use http::header::CONTENT_TYPE;
use http::HeaderMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::dispatcher::{DispatchMetrics, Dispatcher};
use super::generators::GeneratorRegistry;
use super::policy::{HttpCaptureOptions, PolicyResolver, RouteDescriptor};
use super::record::AuditRecord;
use super::redaction::{extract_query_params, Redactor};
use super::store::{CorrelationStore, Exchange};
use crate::config::{AuditLogsConfig, Endpoint, REST_CLIENT_FIELD};
use crate::ids::ExchangeId;

/// Raw request data available when an exchange begins
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub method: String,
    /// Path, or full URL for outbound requests
    pub uri: String,
    /// Raw query string, still percent-encoded
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub remote_address: Option<String>,
}

impl RequestInfo {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            ..Default::default()
        }
    }

    pub fn with_query(mut self, query: Option<&str>) -> Self {
        self.query = query.map(str::to_string);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_remote_address(mut self, address: impl Into<String>) -> Self {
        self.remote_address = Some(address.into());
        self
    }
}

/// Side of the exchange a payload belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Request,
    Response,
}

struct Inner {
    config: Arc<AuditLogsConfig>,
    store: CorrelationStore,
    resolver: PolicyResolver,
    generators: Arc<GeneratorRegistry>,
    redactor: Redactor,
    dispatcher: Dispatcher,
}

/// Lifecycle façade correlating the events of each exchange into one record
///
/// Cheap to clone; clones share the same store.
#[derive(Clone)]
pub struct CaptureService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CaptureService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureService")
            .field("in_flight", &self.inner.store.len())
            .field("generators", &self.inner.generators)
            .finish_non_exhaustive()
    }
}

impl CaptureService {
    /// Assemble a capture service
    ///
    /// Prefer [`AuditLogs::builder`](crate::AuditLogs::builder), which also
    /// validates the configuration.
    pub fn new(
        config: Arc<AuditLogsConfig>,
        resolver: PolicyResolver,
        generators: Arc<GeneratorRegistry>,
        dispatcher: Dispatcher,
    ) -> Self {
        let redactor = Redactor::new(&config.masked_headers);
        Self {
            inner: Arc::new(Inner {
                config,
                store: CorrelationStore::new(),
                resolver,
                generators,
                redactor,
                dispatcher,
            }),
        }
    }

    /// Effective configuration
    pub fn config(&self) -> &AuditLogsConfig {
        &self.inner.config
    }

    /// Delivery counters
    pub fn metrics(&self) -> Arc<DispatchMetrics> {
        self.inner.dispatcher.metrics()
    }

    /// Number of exchanges still in flight
    pub fn in_flight(&self) -> usize {
        self.inner.store.len()
    }

    /// Whether the exchange is still in flight
    pub fn is_tracked(&self, id: &ExchangeId) -> bool {
        self.inner.store.contains(id)
    }

    /// Route descriptor of a route id, as declared in the policy table
    pub fn descriptor(&self, route_id: &str) -> RouteDescriptor {
        self.inner.resolver.descriptor(route_id)
    }

    /// Start an exchange
    ///
    /// Returns `None`, and records nothing, when the endpoint is disabled.
    pub fn begin(&self, endpoint: Endpoint, info: RequestInfo) -> Option<ExchangeId> {
        if !self.inner.config.is_enabled(&endpoint) {
            return None;
        }

        let mut record = AuditRecord::new(ExchangeId::new());
        record.request.method = info.method;
        record.request.uri = info.uri;
        record.request.headers = self.inner.redactor.extract_headers(Some(&info.headers));
        record.request.query_params = extract_query_params(info.query.as_deref());
        record.user.remote_address = info.remote_address;
        if let Some(client) = endpoint.client_name() {
            record.put_custom_field(REST_CLIENT_FIELD, Value::String(client.to_string()));
        }

        let id = self.inner.store.insert(Exchange::new(record, endpoint));
        tracing::trace!(exchange_id = %id, "Exchange started");
        Some(id)
    }

    /// Resolve the route that serves the exchange
    ///
    /// `None` means no route matched: the exchange is dropped. A disabled
    /// route drops it as well. Otherwise the capture options, action and
    /// signature of the route are applied to the record.
    pub fn attach(&self, id: &ExchangeId, route: Option<&RouteDescriptor>) {
        let Some(route) = route else {
            if self.inner.store.remove(id).is_some() {
                tracing::debug!(exchange_id = %id, "No route resolved, exchange dropped");
            }
            return;
        };

        let resolver = &self.inner.resolver;
        if !resolver.resolve(route).is_enabled() {
            if self.inner.store.remove(id).is_some() {
                tracing::debug!(
                    exchange_id = %id,
                    route = %route.id,
                    "Auditing disabled for route, exchange dropped"
                );
            }
            return;
        }

        let options = resolver.options_for(route);
        let signature = resolver.signature_for(route);
        self.inner.store.update(id, |exchange| {
            exchange.record.set_action(options.action.as_deref());
            exchange.record.invoked_method_signature = Some(signature);
            exchange.options = Some(options);
        });
    }

    /// Record the authenticated principal of the exchange
    pub fn set_user(&self, id: &ExchangeId, user_id: Option<&str>) {
        let user_id = user_id.map(str::to_string);
        self.inner.store.update(id, |exchange| {
            exchange.record.user.id = user_id;
        });
    }

    /// Capture the request payload
    pub fn set_request_body(&self, id: &ExchangeId, payload: Value) {
        self.set_body(id, Side::Request, payload);
    }

    /// Record the response status and headers
    ///
    /// An unmasked copy of the headers is kept aside for the integrations;
    /// only the masked copy reaches the record.
    pub fn set_response(&self, id: &ExchangeId, status: u16, headers: &HeaderMap) {
        let masked = self.inner.redactor.extract_headers(Some(headers));
        self.inner.store.update(id, |exchange| {
            exchange.record.response.status = Some(status);
            exchange.record.response.headers = masked;
            exchange.raw_response_headers = Some(headers.clone());
        });
    }

    /// Capture the response payload
    pub fn set_response_body(&self, id: &ExchangeId, payload: Value) {
        self.set_body(id, Side::Response, payload);
    }

    /// Content type of the recorded response, from the unmasked headers
    pub fn response_content_type(&self, id: &ExchangeId) -> Option<String> {
        self.inner
            .store
            .update(id, |exchange| {
                exchange
                    .raw_response_headers
                    .as_ref()
                    .and_then(|headers| headers.get(CONTENT_TYPE))
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string)
            })
            .flatten()
    }

    /// Finalize the exchange and hand its record to the dispatcher
    ///
    /// Only the first call for an id dispatches; returns whether this call did.
    pub fn complete(&self, id: &ExchangeId) -> bool {
        let Some(exchange) = self.inner.store.remove(id) else {
            return false;
        };
        let mut record = exchange.record;
        record.set_end_datetime_as_now();
        tracing::trace!(
            exchange_id = %id,
            endpoint = %exchange.endpoint,
            status = ?record.response.status,
            "Exchange completed"
        );
        self.inner.dispatcher.send(&exchange.endpoint, record);
        true
    }

    /// Add a record-level custom field; the last value written for a key wins
    pub fn put_custom_field(&self, id: &ExchangeId, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.inner.store.update(id, |exchange| {
            exchange.record.put_custom_field(key, value);
        });
    }

    /// Drop the exchange without dispatching anything
    pub fn discard(&self, id: &ExchangeId) {
        if self.inner.store.remove(id).is_some() {
            tracing::debug!(exchange_id = %id, "Exchange discarded");
        }
    }

    /// Drop exchanges in flight for longer than `max_age`
    pub fn sweep_stale(&self, max_age: Duration) -> usize {
        let dropped = self.inner.store.sweep(max_age);
        if dropped > 0 {
            tracing::warn!(
                dropped,
                max_age_secs = max_age.as_secs(),
                "Dropped unfinished audit exchanges"
            );
        }
        dropped
    }

    fn set_body(&self, id: &ExchangeId, side: Side, payload: Value) {
        // unresolved options: keep the payload, no generator
        let Some(options) = self.inner.store.update(id, |exchange| {
            exchange.options.as_ref().map(|options| match side {
                Side::Request => options.request.clone(),
                Side::Response => options.response.clone(),
            })
        }) else {
            return;
        };
        let HttpCaptureOptions {
            log_body,
            field_generator,
        } = options.unwrap_or_default();

        // generators run outside the store lock
        let fields = self
            .inner
            .generators
            .generate(field_generator.as_ref(), &payload);

        self.inner.store.update(id, |exchange| {
            let (body, custom_fields) = match side {
                Side::Request => (
                    &mut exchange.record.request.body,
                    &mut exchange.record.request.custom_fields,
                ),
                Side::Response => (
                    &mut exchange.record.response.body,
                    &mut exchange.record.response.custom_fields,
                ),
            };
            if log_body {
                *body = Some(payload);
            }
            custom_fields.extend(fields);
        });
    }
}

/// Decode a captured payload
///
/// JSON content is parsed when it is valid JSON, anything else is kept as a
/// (lossy) UTF-8 string. An empty payload is no payload.
pub fn payload_from_bytes(bytes: &[u8], content_type: Option<&str>) -> Option<Value> {
    if bytes.is_empty() {
        return None;
    }
    let is_json = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|mime| {
            let mime = mime.trim();
            mime.eq_ignore_ascii_case("application/json") || mime.ends_with("+json")
        })
        .unwrap_or(false);
    if is_json {
        if let Ok(value) = serde_json::from_slice(bytes) {
            return Some(value);
        }
    }
    Some(Value::String(String::from_utf8_lossy(bytes).into_owned()))
}
