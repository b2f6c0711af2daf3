//! Factory types for creating service instances
//!
//! A factory turns the already-resolved dependencies of a descriptor into a
//! new instance. Dependencies are handed over as a [`Resolved`] view, in the
//! order they were declared at registration time, so factories never reach
//! back into the container.
//!
//! Like the rest of the crate, factories store type-erased
//! `Arc<dyn Any + Send + Sync>` values and downcast only at the typed edges.

use crate::{DiError, Injectable, Result, ServiceKey};
use std::any::Any;
use std::sync::Arc;

/// A type-erased service instance.
pub type AnyService = Arc<dyn Any + Send + Sync>;

/// Type-erased constructor function
type ConstructFn = Arc<dyn Fn(&Resolved<'_>) -> Result<AnyService> + Send + Sync>;

/// Type-erased factory wrapper stored in a descriptor
///
/// An enum rather than `Box<dyn Factory>`: there are only two ways to
/// produce an instance, and the pre-built case must be distinguishable so the
/// container does not run lifecycle hooks on objects it does not own.
pub(crate) enum AnyFactory {
    /// Pre-built instance handed in by the caller (test doubles)
    Instance(AnyService),
    /// Constructor invoked with the resolved dependencies
    Constructor(ConstructFn),
}

impl AnyFactory {
    /// Wrap an existing shared value
    #[inline]
    pub fn from_arc<T: Injectable>(value: Arc<T>) -> Self {
        AnyFactory::Instance(value as AnyService)
    }

    /// Create a constructor factory
    #[inline]
    pub fn constructor<T: Injectable, F>(factory: F) -> Self
    where
        F: Fn(&Resolved<'_>) -> Result<T> + Send + Sync + 'static,
    {
        AnyFactory::Constructor(Arc::new(move |deps: &Resolved<'_>| {
            factory(deps).map(|value| Arc::new(value) as AnyService)
        }))
    }

    /// Produce an instance
    #[inline]
    pub fn create(&self, deps: &Resolved<'_>) -> Result<AnyService> {
        match self {
            AnyFactory::Instance(instance) => Ok(Arc::clone(instance)),
            AnyFactory::Constructor(construct) => construct(deps),
        }
    }

    /// Check if this factory hands out a pre-built instance
    #[inline]
    pub fn is_prebuilt(&self) -> bool {
        matches!(self, AnyFactory::Instance(_))
    }
}

/// The resolved dependencies of a service, as seen by its factory.
///
/// Lookups are restricted to the keys the service declared; asking for
/// anything else is a wiring bug reported as
/// [`DiError::UndeclaredDependency`].
///
/// # Examples
///
/// ```rust
/// use di_runtime::{Container, ServiceKey};
/// use std::sync::Arc;
///
/// struct Config { url: String }
/// struct Database { url: String }
///
/// let container = Container::new();
/// container.register_instance(Config { url: "postgres://localhost".into() }).unwrap();
/// container
///     .register_singleton(&[ServiceKey::of::<Config>()], |deps| {
///         let config: Arc<Config> = deps.get()?;
///         Ok(Database { url: config.url.clone() })
///     })
///     .unwrap();
/// ```
#[derive(Clone, Copy)]
pub struct Resolved<'a> {
    keys: &'a [ServiceKey],
    instances: &'a [AnyService],
}

impl<'a> Resolved<'a> {
    pub(crate) fn new(keys: &'a [ServiceKey], instances: &'a [AnyService]) -> Self {
        debug_assert_eq!(keys.len(), instances.len());
        Self { keys, instances }
    }

    /// A view with no dependencies.
    pub fn empty() -> Resolved<'static> {
        Resolved {
            keys: &[],
            instances: &[],
        }
    }

    /// Get the unnamed dependency of type `T`.
    #[inline]
    pub fn get<T: Injectable>(&self) -> Result<Arc<T>> {
        self.get_by_key(&ServiceKey::of::<T>())
    }

    /// Get the dependency of type `T` registered under `name`.
    #[inline]
    pub fn get_named<T: Injectable>(&self, name: &str) -> Result<Arc<T>> {
        self.get_by_key(&ServiceKey::named::<T>(name.to_owned()))
    }

    /// Get a dependency by key and downcast it to `T`.
    pub fn get_by_key<T: Injectable>(&self, key: &ServiceKey) -> Result<Arc<T>> {
        let any = self.get_any(key)?;
        downcast(key, Arc::clone(any))
    }

    /// Get the type-erased dependency at `key`.
    pub fn get_any(&self, key: &ServiceKey) -> Result<&'a AnyService> {
        self.keys
            .iter()
            .position(|k| k == key)
            .map(|idx| &self.instances[idx])
            .ok_or_else(|| DiError::UndeclaredDependency {
                dependency: key.clone(),
            })
    }

    /// Declared dependency keys, in declaration order.
    #[inline]
    pub fn keys(&self) -> &'a [ServiceKey] {
        self.keys
    }

    /// Number of resolved dependencies.
    #[inline]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether the service declared no dependencies.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl std::fmt::Debug for Resolved<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolved").field("keys", &self.keys).finish()
    }
}

/// Downcast a type-erased instance, reporting the key on mismatch.
#[inline]
pub(crate) fn downcast<T: Injectable>(key: &ServiceKey, any: AnyService) -> Result<Arc<T>> {
    any.downcast::<T>().map_err(|_| DiError::TypeMismatch {
        key: key.clone(),
        expected: std::any::type_name::<T>(),
    })
}
