//! Audit record model
//!
//! One [`AuditRecord`] describes one HTTP exchange. It is created when an
//! exchange begins, mutated by the lifecycle callbacks of
//! [`CaptureService`](super::CaptureService), and serialized to the wire
//! format below when it is dispatched:
//!
//! ```json
//! {
//!   "uuid": "…", "startDatetime": "…", "endDatetime": "…", "durationInMs": 12,
//!   "action": "…", "invokedMethodSignature": "…",
//!   "user": { "id": "…", "remoteAddress": "…" },
//!   "customFields": { … },
//!   "request": { "uri": "…", "method": "GET", "headers": { … }, "queryParams": { … },
//!                "body": …, "customFields": { … } },
//!   "response": { "status": 200, "headers": { … }, "body": …, "customFields": { … } }
//! }
//! ```
//!
//! Optional fields are omitted rather than written as `null`, and an empty
//! custom fields map is omitted rather than written as `{}`.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::ids::ExchangeId;

/// Multi-valued string map used for headers and query parameters
pub type MultiMap = BTreeMap<String, Vec<String>>;

/// Derived fields attached to a record or to one side of an exchange
pub type CustomFields = BTreeMap<String, Value>;

/// A single audited HTTP exchange
#[derive(Debug, Clone)]
pub struct AuditRecord {
    id: ExchangeId,
    start_datetime: DateTime<Utc>,
    end_datetime: Option<DateTime<Utc>>,
    action: Option<String>,
    /// Signature of the handler or client operation that served the exchange
    pub invoked_method_signature: Option<String>,
    /// Who issued the request
    pub user: AuditUser,
    /// Record-level custom fields (see [`AuditRecord::put_custom_field`])
    pub custom_fields: CustomFields,
    /// Request side of the exchange
    pub request: AuditRequest,
    /// Response side of the exchange
    pub response: AuditResponse,
}

impl AuditRecord {
    /// Create a record for a new exchange, started now
    pub fn new(id: ExchangeId) -> Self {
        Self {
            id,
            start_datetime: Utc::now(),
            end_datetime: None,
            action: None,
            invoked_method_signature: None,
            user: AuditUser::default(),
            custom_fields: CustomFields::new(),
            request: AuditRequest::default(),
            response: AuditResponse::default(),
        }
    }

    /// Exchange id, also the record `uuid`
    pub fn id(&self) -> ExchangeId {
        self.id
    }

    /// When the exchange began
    pub fn start_datetime(&self) -> DateTime<Utc> {
        self.start_datetime
    }

    /// When the record was finalized, if it was
    pub fn end_datetime(&self) -> Option<DateTime<Utc>> {
        self.end_datetime
    }

    /// Stamp the end timestamp with the current time.
    ///
    /// The end timestamp is written once; later calls keep the first value.
    pub fn set_end_datetime_as_now(&mut self) {
        if self.end_datetime.is_none() {
            self.end_datetime = Some(Utc::now());
        }
    }

    /// Whether the end timestamp has been stamped
    pub fn is_finalized(&self) -> bool {
        self.end_datetime.is_some()
    }

    /// Milliseconds between start and end, when both are known
    pub fn duration_in_ms(&self) -> Option<i64> {
        self.end_datetime
            .map(|end| (end - self.start_datetime).num_milliseconds())
    }

    /// Action label, if one was set and is not blank
    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    /// Set the action label; blank labels are treated as absent
    pub fn set_action(&mut self, action: Option<&str>) {
        self.action = action
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(String::from);
    }

    /// Insert a record-level custom field, replacing any previous value
    pub fn put_custom_field(&mut self, key: impl Into<String>, value: Value) {
        self.custom_fields.insert(key.into(), value);
    }
}

/// User information for an exchange
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditUser {
    /// Authenticated principal
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Client address as seen by the server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,
}

/// Request side of an exchange
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRequest {
    pub uri: String,
    pub method: String,
    /// Lower-cased, masked request headers
    pub headers: MultiMap,
    pub query_params: MultiMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_fields: CustomFields,
}

/// Response side of an exchange
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Lower-cased, masked response headers
    pub headers: MultiMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_fields: CustomFields,
}

/// Borrowed wire view of a record, carrying the derived fields
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRecord<'a> {
    uuid: ExchangeId,
    start_datetime: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_datetime: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_in_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    invoked_method_signature: Option<&'a str>,
    user: &'a AuditUser,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    custom_fields: &'a CustomFields,
    request: &'a AuditRequest,
    response: &'a AuditResponse,
}

impl Serialize for AuditRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireRecord {
            uuid: self.id,
            start_datetime: self.start_datetime,
            end_datetime: self.end_datetime,
            duration_in_ms: self.duration_in_ms(),
            action: self.action(),
            invoked_method_signature: self.invoked_method_signature.as_deref(),
            user: &self.user,
            custom_fields: &self.custom_fields,
            request: &self.request,
            response: &self.response,
        }
        .serialize(serializer)
    }
}
