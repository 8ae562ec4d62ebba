//! Custom fields generators
//!
//! A generator derives extra fields from a request or response payload
//! (an order id, a tenant, a document type, ...). Routes reference
//! generators by [`GeneratorKey`] in their [`CaptureOptions`](super::CaptureOptions);
//! the [`GeneratorRegistry`] maps keys to implementations.
//!
//! Implementations are built lazily with their zero-argument constructor the
//! first time their key is used, then reused for the lifetime of the
//! registry. A generator that cannot be built is replaced by a
//! [`NoopGenerator`]: the failure is logged once and the fallback is cached,
//! so the warning is not repeated on every exchange.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use super::record::CustomFields;
use crate::error::Error;

/// Boxed error returned by fallible generator constructors
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Stable name a generator is registered under
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GeneratorKey(String);

impl GeneratorKey {
    /// Key derived from the generator type name
    pub fn of<G: ?Sized + 'static>() -> Self {
        Self(std::any::type_name::<G>().to_string())
    }

    /// The key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for GeneratorKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for GeneratorKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl fmt::Display for GeneratorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives custom fields from a payload
///
/// Called inline on the request/response path: implementations must be fast
/// and free of side effects.
///
/// # Example
///
/// ```rust
/// use audit_logs::audit::generators::CustomFieldsGenerator;
/// use audit_logs::audit::record::CustomFields;
/// use serde_json::Value;
///
/// #[derive(Default)]
/// struct OrderId;
///
/// impl CustomFieldsGenerator for OrderId {
///     fn generate(&self, entity: &Value) -> CustomFields {
///         entity
///             .get("orderId")
///             .map(|id| CustomFields::from([("orderId".to_string(), id.clone())]))
///             .unwrap_or_default()
///     }
/// }
/// ```
pub trait CustomFieldsGenerator: Send + Sync + 'static {
    /// Derive fields from the payload
    fn generate(&self, entity: &Value) -> CustomFields;
}

/// Generator producing no fields
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopGenerator;

impl CustomFieldsGenerator for NoopGenerator {
    fn generate(&self, _entity: &Value) -> CustomFields {
        CustomFields::new()
    }
}

type Factory =
    Arc<dyn Fn() -> Result<Arc<dyn CustomFieldsGenerator>, BoxError> + Send + Sync>;

/// Registry of generator constructors and memoized instances
#[derive(Default)]
pub struct GeneratorRegistry {
    factories: DashMap<GeneratorKey, Factory>,
    instances: DashMap<GeneratorKey, Arc<dyn CustomFieldsGenerator>>,
}

impl fmt::Debug for GeneratorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratorRegistry")
            .field("registered", &self.factories.len())
            .field("instantiated", &self.instances.len())
            .finish()
    }
}

impl GeneratorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a generator built with `Default::default`
    pub fn register<G>(&self, key: impl Into<GeneratorKey>) -> &Self
    where
        G: CustomFieldsGenerator + Default,
    {
        self.register_with(key, || Ok(G::default()))
    }

    /// Register a generator under the key derived from its type name
    pub fn register_type<G>(&self) -> &Self
    where
        G: CustomFieldsGenerator + Default,
    {
        self.register::<G>(GeneratorKey::of::<G>())
    }

    /// Register a generator with a fallible zero-argument constructor
    pub fn register_with<G, F>(&self, key: impl Into<GeneratorKey>, factory: F) -> &Self
    where
        G: CustomFieldsGenerator,
        F: Fn() -> Result<G, BoxError> + Send + Sync + 'static,
    {
        let key = key.into();
        let factory: Factory = Arc::new(move || {
            factory().map(|generator| Arc::new(generator) as Arc<dyn CustomFieldsGenerator>)
        });
        // a new constructor invalidates any memoized instance
        self.instances.remove(&key);
        self.factories.insert(key, factory);
        self
    }

    /// Whether a constructor is registered for the key
    pub fn is_registered(&self, key: &GeneratorKey) -> bool {
        self.factories.contains_key(key)
    }

    /// Memoized generator for the key
    ///
    /// Never fails: unknown keys and failing constructors yield a cached
    /// [`NoopGenerator`].
    pub fn get_instance(&self, key: &GeneratorKey) -> Arc<dyn CustomFieldsGenerator> {
        if let Some(instance) = self.instances.get(key) {
            return Arc::clone(instance.value());
        }
        let instance = self
            .instances
            .entry(key.clone())
            .or_insert_with(|| self.construct(key));
        Arc::clone(instance.value())
    }

    /// Run the generator for `key` on the payload
    ///
    /// `None` yields no fields. A panicking generator is contained and
    /// yields no fields.
    pub fn generate(&self, key: Option<&GeneratorKey>, entity: &Value) -> CustomFields {
        let Some(key) = key else {
            return CustomFields::new();
        };
        let generator = self.get_instance(key);
        match panic::catch_unwind(AssertUnwindSafe(|| generator.generate(entity))) {
            Ok(fields) => fields,
            Err(_) => {
                tracing::error!(
                    generator = %key,
                    "Custom fields generator panicked, no fields generated"
                );
                CustomFields::new()
            }
        }
    }

    fn construct(&self, key: &GeneratorKey) -> Arc<dyn CustomFieldsGenerator> {
        let Some(factory) = self.factories.get(key).map(|f| Arc::clone(f.value())) else {
            tracing::warn!(
                generator = %key,
                "No custom fields generator registered, using a no-op generator"
            );
            return Arc::new(NoopGenerator);
        };

        match panic::catch_unwind(AssertUnwindSafe(|| factory())) {
            Ok(Ok(generator)) => generator,
            Ok(Err(e)) => {
                let error = Error::Generator(e.to_string());
                tracing::warn!(
                    generator = %key,
                    error = %error,
                    "Error while instantiating custom fields generator, using a no-op generator"
                );
                Arc::new(NoopGenerator)
            }
            Err(_) => {
                tracing::warn!(
                    generator = %key,
                    "Custom fields generator constructor panicked, using a no-op generator"
                );
                Arc::new(NoopGenerator)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FooBar;

    impl CustomFieldsGenerator for FooBar {
        fn generate(&self, _entity: &Value) -> CustomFields {
            CustomFields::from([("foo".to_string(), json!("bar"))])
        }
    }

    struct Panicking;

    impl CustomFieldsGenerator for Panicking {
        fn generate(&self, _entity: &Value) -> CustomFields {
            panic!("generator bug")
        }
    }

    #[test]
    fn test_registered_generator_is_used() {
        let registry = GeneratorRegistry::new();
        registry.register::<FooBar>("foo-bar");

        let fields = registry.generate(Some(&"foo-bar".into()), &json!("payload"));
        assert_eq!(fields.get("foo"), Some(&json!("bar")));
    }

    #[test]
    fn test_instance_is_memoized() {
        let registry = GeneratorRegistry::new();
        registry.register::<FooBar>("foo-bar");
        let key = GeneratorKey::from("foo-bar");

        let first = registry.get_instance(&key);
        let second = registry.get_instance(&key);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_constructor_runs_once() {
        static BUILT: AtomicUsize = AtomicUsize::new(0);
        let registry = GeneratorRegistry::new();
        registry.register_with("counted", || {
            BUILT.fetch_add(1, Ordering::SeqCst);
            Ok(FooBar)
        });

        for _ in 0..5 {
            registry.generate(Some(&"counted".into()), &Value::Null);
        }
        assert_eq!(BUILT.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_construction_falls_back_and_is_cached() {
        static ATTEMPTS: AtomicUsize = AtomicUsize::new(0);
        let registry = GeneratorRegistry::new();
        registry.register_with("broken", || -> Result<FooBar, BoxError> {
            ATTEMPTS.fetch_add(1, Ordering::SeqCst);
            Err("missing configuration".into())
        });
        let key = GeneratorKey::from("broken");

        assert!(registry.generate(Some(&key), &json!({})).is_empty());
        assert!(registry.generate(Some(&key), &json!({})).is_empty());
        assert_eq!(ATTEMPTS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_constructor_falls_back() {
        let registry = GeneratorRegistry::new();
        registry.register_with("boom", || -> Result<FooBar, BoxError> {
            panic!("constructor bug")
        });
        assert!(registry.generate(Some(&"boom".into()), &json!({})).is_empty());
    }

    #[test]
    fn test_unregistered_key_yields_no_fields() {
        let registry = GeneratorRegistry::new();
        let key = GeneratorKey::from("unknown");
        assert!(!registry.is_registered(&key));
        assert!(registry.generate(Some(&key), &json!({})).is_empty());
    }

    #[test]
    fn test_no_key_yields_no_fields() {
        let registry = GeneratorRegistry::new();
        registry.register::<FooBar>("foo-bar");
        assert!(registry.generate(None, &json!({})).is_empty());
    }

    #[test]
    fn test_panicking_generator_is_contained() {
        let registry = GeneratorRegistry::new();
        registry.register_with("panics", || Ok(Panicking));
        assert!(registry.generate(Some(&"panics".into()), &json!({})).is_empty());
    }

    #[test]
    fn test_register_type_uses_type_name() {
        let registry = GeneratorRegistry::new();
        registry.register_type::<FooBar>();
        assert!(registry.is_registered(&GeneratorKey::of::<FooBar>()));
    }
}
