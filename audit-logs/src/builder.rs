//! Pipeline assembly
//!
//! [`AuditLogs::builder`] wires the configuration, the policy table, the
//! generator registry and the dispatcher into a [`CaptureService`]. Building
//! validates the configuration: an enabled endpoint without a sink is a
//! startup error.

use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::audit::{
    AuditSender, CaptureService, CustomFieldsGenerator, DispatchMetrics, Dispatcher,
    GeneratorKey, GeneratorRegistry, GroupPolicy, PolicyResolver, PolicyTable, RoutePolicy,
};
use crate::audit::generators::BoxError;
use crate::config::AuditLogsConfig;
use crate::error::Result;

#[cfg(feature = "client")]
use crate::client::AuditedClient;

/// A running audit pipeline
///
/// Dropping it stops the stale exchange reaper, if one was started.
#[derive(Debug)]
pub struct AuditLogs {
    capture: CaptureService,
    generators: Arc<GeneratorRegistry>,
    reaper: Option<JoinHandle<()>>,
}

impl AuditLogs {
    /// Start configuring a pipeline
    pub fn builder() -> AuditLogsBuilder {
        AuditLogsBuilder::new()
    }

    /// Lifecycle entry point for the transports
    pub fn capture(&self) -> &CaptureService {
        &self.capture
    }

    /// Generator registry; generators may still be registered after build
    pub fn generators(&self) -> &GeneratorRegistry {
        &self.generators
    }

    /// Delivery counters
    pub fn metrics(&self) -> Arc<DispatchMetrics> {
        self.capture.metrics()
    }

    /// Effective configuration
    pub fn config(&self) -> &AuditLogsConfig {
        self.capture.config()
    }

    /// Wrap an outbound client
    #[cfg(feature = "client")]
    pub fn client(&self, http: reqwest::Client) -> AuditedClient {
        AuditedClient::new(http, self.capture.clone())
    }
}

impl Drop for AuditLogs {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.take() {
            reaper.abort();
        }
    }
}

/// Builder for [`AuditLogs`]
///
/// # Example
///
/// ```rust,no_run
/// use audit_logs::prelude::*;
///
/// # fn main() -> audit_logs::Result<()> {
/// let audit = AuditLogs::builder()
///     .config(AuditLogsConfig::load_from("config.toml")?)
///     .group("internal", GroupPolicy::disabled())
///     .route("GET /internal/metrics", RoutePolicy::new().in_group("internal"))
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct AuditLogsBuilder {
    config: Option<AuditLogsConfig>,
    policies: PolicyTable,
    generators: GeneratorRegistry,
    sender: Option<Arc<dyn AuditSender>>,
}

impl AuditLogsBuilder {
    /// Create a builder with no configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this configuration instead of loading it
    pub fn config(mut self, config: AuditLogsConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Add policies on top of the configured ones
    pub fn policies(mut self, table: PolicyTable) -> Self {
        self.policies = std::mem::take(&mut self.policies).merge(table);
        self
    }

    /// Declare a group
    pub fn group(mut self, name: impl Into<String>, policy: GroupPolicy) -> Self {
        self.policies = std::mem::take(&mut self.policies).group(name, policy);
        self
    }

    /// Declare a route
    pub fn route(mut self, id: impl Into<String>, policy: RoutePolicy) -> Self {
        self.policies = std::mem::take(&mut self.policies).route(id, policy);
        self
    }

    /// Register a generator built with `Default::default`
    pub fn generator<G>(self, key: impl Into<GeneratorKey>) -> Self
    where
        G: CustomFieldsGenerator + Default,
    {
        self.generators.register::<G>(key);
        self
    }

    /// Register a generator with a fallible constructor
    pub fn generator_with<G, F>(self, key: impl Into<GeneratorKey>, factory: F) -> Self
    where
        G: CustomFieldsGenerator,
        F: Fn() -> std::result::Result<G, BoxError> + Send + Sync + 'static,
    {
        self.generators.register_with(key, factory);
        self
    }

    /// Deliver records with a custom transport instead of HTTP
    pub fn sender(mut self, sender: Arc<dyn AuditSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Validate the configuration and assemble the pipeline
    ///
    /// Without an explicit configuration, [`AuditLogsConfig::load`] is used.
    pub fn build(self) -> Result<AuditLogs> {
        let mut config = match self.config {
            Some(config) => config,
            None => AuditLogsConfig::load()?,
        };
        config.validate()?;

        let policies = std::mem::take(&mut config.policies).merge(self.policies);
        let config = Arc::new(config);

        let dispatcher = match self.sender {
            Some(sender) => Dispatcher::with_sender(Arc::clone(&config), sender),
            None => Dispatcher::new(Arc::clone(&config)),
        };
        let generators = Arc::new(self.generators);
        let capture = CaptureService::new(
            Arc::clone(&config),
            PolicyResolver::new(policies),
            Arc::clone(&generators),
            dispatcher,
        );

        tracing::info!(
            server_enabled = config.server.enabled,
            clients_enabled = config.clients.enabled,
            "Audit logs initialized"
        );

        let reaper = spawn_reaper(&capture);
        Ok(AuditLogs {
            capture,
            generators,
            reaper,
        })
    }
}

fn spawn_reaper(capture: &CaptureService) -> Option<JoinHandle<()>> {
    let max_age = capture.config().stale_after()?;
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::warn!(
            "No async runtime available, stale exchanges will not be swept"
        );
        return None;
    };

    let capture = capture.clone();
    let period = (max_age / 2).max(std::time::Duration::from_millis(10));
    Some(runtime.spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            capture.sweep_stale(max_age);
        }
    }))
}
