//! Correlation store
//!
//! Concurrent map from [`ExchangeId`] to the in-flight [`Exchange`]. Each
//! exchange is only ever touched by the lifecycle callbacks of its own id,
//! and the map is sharded, so unrelated exchanges never contend on a record.
//!
//! Records whose terminal event never fires stay in the store until the
//! process exits, unless [`CorrelationStore::sweep`] is run (see
//! `stale_after_secs` in the configuration).

use dashmap::DashMap;
use http::HeaderMap;
use std::time::{Duration, Instant};

use super::policy::CaptureOptions;
use super::record::AuditRecord;
use crate::config::Endpoint;
use crate::ids::ExchangeId;

/// In-flight state of one audited exchange
#[derive(Debug)]
pub struct Exchange {
    /// Record under construction
    pub record: AuditRecord,
    /// Logical endpoint the exchange belongs to
    pub endpoint: Endpoint,
    /// Capture options, `None` until the route is known
    pub options: Option<CaptureOptions>,
    /// Unmasked copy of the response headers, never serialized
    pub raw_response_headers: Option<HeaderMap>,
    created_at: Instant,
}

impl Exchange {
    /// Start tracking a record for an endpoint
    pub fn new(record: AuditRecord, endpoint: Endpoint) -> Self {
        Self {
            record,
            endpoint,
            options: None,
            raw_response_headers: None,
            created_at: Instant::now(),
        }
    }

    /// Time spent in the store so far
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Concurrent exchange map
#[derive(Debug, Default)]
pub struct CorrelationStore {
    exchanges: DashMap<ExchangeId, Exchange>,
}

impl CorrelationStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new exchange under its record id
    pub fn insert(&self, exchange: Exchange) -> ExchangeId {
        let id = exchange.record.id();
        self.exchanges.insert(id, exchange);
        id
    }

    /// Mutate the exchange in place, if it is still tracked
    ///
    /// The shard lock is held while `f` runs: `f` must not call back into
    /// the store.
    pub fn update<R>(&self, id: &ExchangeId, f: impl FnOnce(&mut Exchange) -> R) -> Option<R> {
        self.exchanges.get_mut(id).map(|mut entry| f(entry.value_mut()))
    }

    /// Stop tracking the exchange and hand it back
    ///
    /// Only the first caller for an id gets the exchange.
    pub fn remove(&self, id: &ExchangeId) -> Option<Exchange> {
        self.exchanges.remove(id).map(|(_, exchange)| exchange)
    }

    /// Whether the exchange is still tracked
    pub fn contains(&self, id: &ExchangeId) -> bool {
        self.exchanges.contains_key(id)
    }

    /// Number of in-flight exchanges
    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    /// Whether no exchange is in flight
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    /// Drop every exchange older than `max_age`, returning how many were dropped
    ///
    /// Dropped exchanges are not dispatched.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let before = self.exchanges.len();
        self.exchanges.retain(|_, exchange| exchange.age() < max_age);
        before.saturating_sub(self.exchanges.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn exchange() -> Exchange {
        Exchange::new(AuditRecord::new(ExchangeId::new()), Endpoint::Server)
    }

    #[test]
    fn test_insert_update_remove() {
        let store = CorrelationStore::new();
        let id = store.insert(exchange());
        assert!(store.contains(&id));

        let updated = store.update(&id, |ex| {
            ex.record.request.method = "GET".to_string();
        });
        assert!(updated.is_some());

        let removed = store.remove(&id).unwrap();
        assert_eq!(removed.record.request.method, "GET");
        assert!(store.is_empty());
    }

    #[test]
    fn test_second_remove_is_noop() {
        let store = CorrelationStore::new();
        let id = store.insert(exchange());
        assert!(store.remove(&id).is_some());
        assert!(store.remove(&id).is_none());
        assert!(store.update(&id, |_| ()).is_none());
    }

    #[test]
    fn test_sweep_drops_only_stale_exchanges() {
        let store = CorrelationStore::new();
        store.insert(exchange());
        std::thread::sleep(Duration::from_millis(20));
        let fresh = store.insert(exchange());

        assert_eq!(store.sweep(Duration::from_millis(10)), 1);
        assert!(store.contains(&fresh));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_concurrent_exchanges_do_not_interfere() {
        let store = Arc::new(CorrelationStore::new());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for n in 0..200 {
                        let id = store.insert(exchange());
                        store.update(&id, |ex| {
                            ex.record.request.uri = format!("/{}/{}", worker, n);
                        });
                        let removed = store.remove(&id).unwrap();
                        assert_eq!(removed.record.request.uri, format!("/{}/{}", worker, n));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(store.is_empty());
    }
}
