//! Per-route audit policy
//!
//! Policies are declared once, at startup, in a [`PolicyTable`]: either in
//! code or in the `[audit_logs.policies]` section of `config.toml`. A route
//! can carry enable/disable markers of its own and can belong to a *group*
//! (a controller, a client, any set of routes sharing a marker).
//!
//! # Conflict rule
//!
//! ```text
//! disabled = route.disabled || (group.disabled && !route.enabled)
//! ```
//!
//! A route-level disable always wins. A route-level enable only lifts a
//! group-level disable. Routes that are not in the table are audited with
//! the default [`CaptureOptions`].
//!
//! # Example
//!
//! ```rust
//! use audit_logs::audit::policy::*;
//!
//! let table = PolicyTable::new()
//!     .group("internal", GroupPolicy::disabled())
//!     .route("GET /internal/health", RoutePolicy::new().in_group("internal"))
//!     .route("GET /internal/report", RoutePolicy::new().in_group("internal").enabled());
//! let resolver = PolicyResolver::new(table);
//!
//! let health = resolver.descriptor("GET /internal/health");
//! let report = resolver.descriptor("GET /internal/report");
//! assert!(!resolver.resolve(&health).is_enabled());
//! assert!(resolver.resolve(&report).is_enabled());
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::generators::GeneratorKey;

/// Outcome of applying the markers of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnablementDecision {
    /// Exchanges on the route are audited
    Enabled,
    /// Exchanges on the route produce no record
    Disabled,
}

impl EnablementDecision {
    /// Apply the conflict rule to a set of markers
    pub fn from_markers(group_disabled: bool, route_disabled: bool, route_enabled: bool) -> Self {
        if route_disabled || (group_disabled && !route_enabled) {
            Self::Disabled
        } else {
            Self::Enabled
        }
    }

    /// Whether auditing is enabled
    pub fn is_enabled(self) -> bool {
        self == Self::Enabled
    }
}

/// Capture toggles for one side (request or response) of an exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpCaptureOptions {
    /// Keep the payload in the record (default: true)
    #[serde(default = "default_true")]
    pub log_body: bool,

    /// Generator deriving custom fields from the payload (default: none)
    #[serde(default)]
    pub field_generator: Option<GeneratorKey>,
}

impl Default for HttpCaptureOptions {
    fn default() -> Self {
        Self {
            log_body: true,
            field_generator: None,
        }
    }
}

impl HttpCaptureOptions {
    /// Do not keep the payload
    pub fn without_body(mut self) -> Self {
        self.log_body = false;
        self
    }

    /// Derive custom fields from the payload with the given generator
    pub fn with_generator(mut self, key: impl Into<GeneratorKey>) -> Self {
        self.field_generator = Some(key.into());
        self
    }
}

/// Capture options of a route
///
/// The default logs both bodies, generates no custom fields and sets no action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureOptions {
    /// Human-readable label used to group records
    #[serde(default)]
    pub action: Option<String>,

    /// Request side toggles
    #[serde(default)]
    pub request: HttpCaptureOptions,

    /// Response side toggles
    #[serde(default)]
    pub response: HttpCaptureOptions,
}

impl CaptureOptions {
    /// Set the action label
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Set the request side toggles
    pub fn with_request(mut self, request: HttpCaptureOptions) -> Self {
        self.request = request;
        self
    }

    /// Set the response side toggles
    pub fn with_response(mut self, response: HttpCaptureOptions) -> Self {
        self.response = response;
        self
    }
}

/// Markers shared by every route of a group
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPolicy {
    #[serde(default)]
    pub disabled: bool,
}

impl GroupPolicy {
    /// A group whose routes are not audited unless they opt back in
    pub fn disabled() -> Self {
        Self { disabled: true }
    }
}

/// Markers and options of a single route
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutePolicy {
    /// Group the route belongs to
    #[serde(default)]
    pub group: Option<String>,

    /// Route-level enable marker (only lifts a group-level disable)
    #[serde(default)]
    pub enabled: bool,

    /// Route-level disable marker (always wins)
    #[serde(default)]
    pub disabled: bool,

    /// Signature reported as `invokedMethodSignature`
    #[serde(default)]
    pub signature: Option<String>,

    /// Capture options; defaults apply when unset
    #[serde(default)]
    pub options: Option<CaptureOptions>,
}

impl RoutePolicy {
    /// A route without markers
    pub fn new() -> Self {
        Self::default()
    }

    /// Put the route in a group
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Add the route-level enable marker
    pub fn enabled(mut self) -> Self {
        self.enabled = true;
        self
    }

    /// Add the route-level disable marker
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// Set the reported handler signature
    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    /// Attach capture options
    pub fn with_options(mut self, options: CaptureOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// Declarative route-to-policy table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyTable {
    /// Group markers by group name
    #[serde(default)]
    pub groups: HashMap<String, GroupPolicy>,

    /// Route policies by route id
    #[serde(default)]
    pub routes: HashMap<String, RoutePolicy>,
}

impl PolicyTable {
    /// An empty table: every route is audited with default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a group
    pub fn group(mut self, name: impl Into<String>, policy: GroupPolicy) -> Self {
        self.groups.insert(name.into(), policy);
        self
    }

    /// Declare a route
    pub fn route(mut self, id: impl Into<String>, policy: RoutePolicy) -> Self {
        self.routes.insert(id.into(), policy);
        self
    }

    /// Merge another table into this one; entries of `other` win
    pub fn merge(mut self, other: PolicyTable) -> Self {
        self.groups.extend(other.groups);
        self.routes.extend(other.routes);
        self
    }
}

/// Identity of the route that served an exchange
///
/// Server routes use `"{METHOD} {path template}"` as id, client operations
/// any stable name chosen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteDescriptor {
    /// Route id, key of [`PolicyTable::routes`]
    pub id: String,
    /// Group overriding the one declared in the table
    pub group: Option<String>,
}

impl RouteDescriptor {
    /// Describe a route by id
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            group: None,
        }
    }

    /// Put the route in a group
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// Policy lookups built once from a [`PolicyTable`]
#[derive(Debug, Clone, Default)]
pub struct PolicyResolver {
    table: PolicyTable,
}

impl PolicyResolver {
    /// Build the resolver
    pub fn new(table: PolicyTable) -> Self {
        Self { table }
    }

    /// Descriptor of a route id, with the group declared in the table
    pub fn descriptor(&self, route_id: &str) -> RouteDescriptor {
        RouteDescriptor {
            id: route_id.to_string(),
            group: self
                .table
                .routes
                .get(route_id)
                .and_then(|route| route.group.clone()),
        }
    }

    /// Decide whether exchanges on the route are audited
    pub fn resolve(&self, route: &RouteDescriptor) -> EnablementDecision {
        let policy = self.table.routes.get(&route.id);
        let group_disabled = self
            .group_of(route)
            .and_then(|group| self.table.groups.get(group))
            .is_some_and(|group| group.disabled);

        EnablementDecision::from_markers(
            group_disabled,
            policy.is_some_and(|p| p.disabled),
            policy.is_some_and(|p| p.enabled),
        )
    }

    /// Capture options of the route, defaults when none are declared
    pub fn options_for(&self, route: &RouteDescriptor) -> CaptureOptions {
        self.table
            .routes
            .get(&route.id)
            .and_then(|policy| policy.options.clone())
            .unwrap_or_default()
    }

    /// Signature reported for the route
    ///
    /// The declared signature if any, else `group.id`, else the route id.
    pub fn signature_for(&self, route: &RouteDescriptor) -> String {
        if let Some(signature) = self
            .table
            .routes
            .get(&route.id)
            .and_then(|policy| policy.signature.clone())
        {
            return signature;
        }
        match self.group_of(route) {
            Some(group) => format!("{}.{}", group, route.id),
            None => route.id.clone(),
        }
    }

    fn group_of<'a>(&'a self, route: &'a RouteDescriptor) -> Option<&'a str> {
        route.group.as_deref().or_else(|| {
            self.table
                .routes
                .get(&route.id)
                .and_then(|policy| policy.group.as_deref())
        })
    }
}

fn default_true() -> bool {
    true
}
