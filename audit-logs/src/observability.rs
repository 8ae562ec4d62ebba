//! Tracing initialisation
//!
//! Everything the crate logs uses the `audit_logs` target, so the pipeline
//! can be filtered on its own, e.g. `info,audit_logs=debug`.

use tracing_subscriber::EnvFilter;

use crate::error::Result;

/// Install a JSON `tracing` subscriber filtered by `filter`
///
/// An invalid filter falls back to `info`. Does nothing if a global
/// subscriber is already installed.
pub fn init_tracing(filter: &str) -> Result<()> {
    let installed = tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();

    match installed {
        Ok(()) => tracing::info!(filter, "Tracing initialized"),
        Err(_) => tracing::debug!("Tracing subscriber already installed"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        assert!(init_tracing("audit_logs=debug").is_ok());
        assert!(init_tracing("not a [valid filter").is_ok());
    }
}
