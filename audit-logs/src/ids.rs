//! Exchange identifiers
//!
//! An [`ExchangeId`] links the asynchronous lifecycle events of one HTTP
//! exchange to its in-flight audit record. It doubles as the record's
//! `uuid` on the wire.
//!
//! Identifiers are random UUIDv4 values. They are never sequential and
//! never reused during the lifetime of the process, so a stale id held by a
//! late lifecycle callback can only miss, never hit another exchange's record.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque identifier of an audited exchange.
///
/// # Example
///
/// ```rust
/// use audit_logs::ids::ExchangeId;
/// use std::str::FromStr;
///
/// let id = ExchangeId::new();
/// let parsed = ExchangeId::from_str(&id.to_string()).unwrap();
/// assert_eq!(id, parsed);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeId(Uuid);

impl ExchangeId {
    /// Creates a new random exchange id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ExchangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for ExchangeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique() {
        let ids: HashSet<ExchangeId> = (0..1000).map(|_| ExchangeId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_ids_are_random_v4() {
        let id = ExchangeId::new();
        assert_eq!(id.as_uuid().get_version_num(), 4);
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let id = ExchangeId::new();
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json, serde_json::Value::String(id.to_string()));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ExchangeId::from_str("req_not-a-uuid").is_err());
    }
}
