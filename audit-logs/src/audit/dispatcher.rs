//! Record delivery
//!
//! Completed records are posted to the sink of their endpoint on a detached
//! tokio task. The instrumented exchange never waits for delivery and never
//! sees its outcome: failures are logged at error level, counted, and the
//! record is dropped. There is no retry and no buffering.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::record::AuditRecord;
use crate::config::{AuditLogsConfig, Endpoint};
use crate::error::{Error, Result};

/// Names under which the delivery counters are reported
pub mod metric_names {
    /// Records accepted by a sink
    pub const SEND_SUCCESS: &str = "audit_logs.send.success";
    /// Records lost to a network error, timeout or non-success status
    pub const SEND_FAILED: &str = "audit_logs.send.failed";
}

/// Transport delivering one record to one sink
#[async_trait]
pub trait AuditSender: Send + Sync + 'static {
    /// Deliver the record, failing on transport errors and non-2xx answers
    async fn send(&self, url: &str, record: &AuditRecord) -> Result<()>;
}

/// Sender posting records as JSON with reqwest
#[derive(Debug, Clone)]
pub struct HttpSender {
    client: reqwest::Client,
}

impl HttpSender {
    /// Create a sender with the given connect and total timeouts
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Create a sender using the timeouts of the configuration
    pub fn from_config(config: &AuditLogsConfig) -> Self {
        Self::new(config.connect_timeout(), config.request_timeout())
    }
}

#[async_trait]
impl AuditSender for HttpSender {
    async fn send(&self, url: &str, record: &AuditRecord) -> Result<()> {
        let response = self.client.post(url).json(record).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::SinkStatus(status.as_u16()))
        }
    }
}

/// Monotonic delivery counters
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    success: AtomicU64,
    failed: AtomicU64,
}

impl DispatchMetrics {
    /// Records accepted by a sink so far
    pub fn success(&self) -> u64 {
        self.success.load(Ordering::Relaxed)
    }

    /// Records lost so far
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Counter values by metric name
    pub fn snapshot(&self) -> [(&'static str, u64); 2] {
        [
            (metric_names::SEND_SUCCESS, self.success()),
            (metric_names::SEND_FAILED, self.failed()),
        ]
    }

    fn record_success(&self) {
        self.success.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Resolves the sink of each record and sends it in the background
#[derive(Clone)]
pub struct Dispatcher {
    config: Arc<AuditLogsConfig>,
    sender: Arc<dyn AuditSender>,
    metrics: Arc<DispatchMetrics>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher posting over HTTP
    pub fn new(config: Arc<AuditLogsConfig>) -> Self {
        let sender = Arc::new(HttpSender::from_config(&config));
        Self::with_sender(config, sender)
    }

    /// Create a dispatcher with a custom transport
    pub fn with_sender(config: Arc<AuditLogsConfig>, sender: Arc<dyn AuditSender>) -> Self {
        Self {
            config,
            sender,
            metrics: Arc::new(DispatchMetrics::default()),
        }
    }

    /// Delivery counters
    pub fn metrics(&self) -> Arc<DispatchMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Sink URL of the endpoint, if any
    pub fn sink_url(&self, endpoint: &Endpoint) -> Option<String> {
        self.config.sink_for(endpoint).endpoint
    }

    /// Hand a finished record over for delivery
    ///
    /// Stamps the end timestamp if it is still unset and returns at once.
    /// The returned handle only exists for callers that want to observe
    /// completion; dropping it does not cancel delivery. Nothing is sent
    /// when the endpoint has no sink or no tokio runtime is running.
    pub fn send(&self, endpoint: &Endpoint, mut record: AuditRecord) -> Option<JoinHandle<()>> {
        record.set_end_datetime_as_now();
        let exchange_id = record.id();

        let Some(url) = self.sink_url(endpoint) else {
            tracing::debug!(
                exchange_id = %exchange_id,
                endpoint = %endpoint,
                "No audit sink configured, record dropped"
            );
            return None;
        };

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                tracing::warn!(
                    exchange_id = %exchange_id,
                    endpoint = %endpoint,
                    "No async runtime available, audit record dropped"
                );
                return None;
            }
        };

        let sender = Arc::clone(&self.sender);
        let metrics = Arc::clone(&self.metrics);
        let endpoint = endpoint.to_string();
        Some(runtime.spawn(async move {
            match sender.send(&url, &record).await {
                Ok(()) => {
                    metrics.record_success();
                    tracing::trace!(
                        exchange_id = %exchange_id,
                        endpoint = %endpoint,
                        "Audit record sent"
                    );
                }
                Err(e) => {
                    metrics.record_failure();
                    tracing::error!(
                        exchange_id = %exchange_id,
                        endpoint = %endpoint,
                        url = %url,
                        error = %e,
                        "Failed to send audit record"
                    );
                }
            }
        }))
    }
}
