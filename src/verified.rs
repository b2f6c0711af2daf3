//! Typed service declarations
//!
//! Services can declare their dependencies in the type system instead of
//! listing keys by hand. The dependency list handed to the container is
//! derived from [`Service::Dependencies`], so it can never drift from what
//! `create` actually consumes.
//!
//! # Example
//!
//! ```rust
//! use di_runtime::verified::{Service, ServiceProvider};
//! use di_runtime::{Container, Lifetime};
//! use std::sync::Arc;
//!
//! struct Clock;
//!
//! impl Service for Clock {
//!     type Dependencies = ();
//!
//!     fn create(_: ()) -> Self {
//!         Clock
//!     }
//! }
//!
//! struct SessionStore {
//!     clock: Arc<Clock>,
//!     ttl_secs: u64,
//! }
//!
//! impl Service for SessionStore {
//!     type Dependencies = Arc<Clock>;
//!
//!     fn create(clock: Arc<Clock>) -> Self {
//!         SessionStore { clock, ttl_secs: 900 }
//!     }
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let container = Container::new();
//! container.provide::<Clock>(Lifetime::Singleton).unwrap();
//! container.provide::<SessionStore>(Lifetime::Scoped).unwrap();
//!
//! let scope = container.create_scope().unwrap();
//! let sessions = scope.resolve::<SessionStore>().await.unwrap();
//! assert_eq!(sessions.ttl_secs, 900);
//! # });
//! ```

use crate::{Container, Injectable, Lifetime, Resolved, Result, ServiceKey, ServiceLifecycle};
use std::sync::Arc;

/// A service whose dependency list is its constructor's argument type.
///
/// `Dependencies` may be `()`, a single `Arc<T>`, or a tuple of up to eight
/// `Arc`s, resolved left to right.
pub trait Service: Injectable + Sized {
    type Dependencies: Resolvable;

    /// Build the service from its resolved dependencies.
    fn create(deps: Self::Dependencies) -> Self;
}

/// A dependency set that knows its own keys.
pub trait Resolvable: Sized {
    /// The keys to declare, in resolution order.
    fn keys() -> Vec<ServiceKey>;

    /// Pick the instances out of the resolved dependencies.
    fn extract(resolved: &Resolved<'_>) -> Result<Self>;
}

impl Resolvable for () {
    #[inline]
    fn keys() -> Vec<ServiceKey> {
        Vec::new()
    }

    #[inline]
    fn extract(_resolved: &Resolved<'_>) -> Result<Self> {
        Ok(())
    }
}

impl<T: Injectable> Resolvable for Arc<T> {
    #[inline]
    fn keys() -> Vec<ServiceKey> {
        vec![ServiceKey::of::<T>()]
    }

    #[inline]
    fn extract(resolved: &Resolved<'_>) -> Result<Self> {
        resolved.get::<T>()
    }
}

macro_rules! impl_resolvable_tuple {
    ($($T:ident),+) => {
        impl<$($T: Injectable),+> Resolvable for ($(Arc<$T>,)+) {
            fn keys() -> Vec<ServiceKey> {
                vec![$(ServiceKey::of::<$T>()),+]
            }

            #[inline]
            fn extract(resolved: &Resolved<'_>) -> Result<Self> {
                Ok(($(resolved.get::<$T>()?,)+))
            }
        }
    };
}

impl_resolvable_tuple!(A, B);
impl_resolvable_tuple!(A, B, C);
impl_resolvable_tuple!(A, B, C, D);
impl_resolvable_tuple!(A, B, C, D, E);
impl_resolvable_tuple!(A, B, C, D, E, F);
impl_resolvable_tuple!(A, B, C, D, E, F, G);
impl_resolvable_tuple!(A, B, C, D, E, F, G, H);

/// Extension trait for registering [`Service`] implementations.
pub trait ServiceProvider {
    /// Register `T` with the given lifetime, its dependency list taken from
    /// `T::Dependencies`.
    fn provide<T: Service>(&self, lifetime: Lifetime) -> Result<()>;

    /// Like [`provide`](Self::provide), and run `T`'s lifecycle hooks.
    fn provide_managed<T: Service + ServiceLifecycle>(&self, lifetime: Lifetime) -> Result<()>;

    #[inline]
    fn provide_singleton<T: Service>(&self) -> Result<()> {
        self.provide::<T>(Lifetime::Singleton)
    }

    #[inline]
    fn provide_scoped<T: Service>(&self) -> Result<()> {
        self.provide::<T>(Lifetime::Scoped)
    }

    #[inline]
    fn provide_transient<T: Service>(&self) -> Result<()> {
        self.provide::<T>(Lifetime::Transient)
    }
}

impl ServiceProvider for Container {
    fn provide<T: Service>(&self, lifetime: Lifetime) -> Result<()> {
        self.service::<T>(lifetime)
            .depends_on_keys(&T::Dependencies::keys())
            .factory(|deps| T::Dependencies::extract(deps).map(T::create))
    }

    fn provide_managed<T: Service + ServiceLifecycle>(&self, lifetime: Lifetime) -> Result<()> {
        self.service::<T>(lifetime)
            .depends_on_keys(&T::Dependencies::keys())
            .with_lifecycle()
            .factory(|deps| T::Dependencies::extract(deps).map(T::create))
    }
}

/// A unit of composition: a group of registrations applied together at
/// startup.
///
/// ```rust
/// use di_runtime::{Container, Result, verified::{Service, ServiceModule, ServiceProvider}};
///
/// struct Metrics;
///
/// impl Service for Metrics {
///     type Dependencies = ();
///     fn create(_: ()) -> Self { Metrics }
/// }
///
/// struct AuditTrail;
///
/// impl Service for AuditTrail {
///     type Dependencies = ();
///     fn create(_: ()) -> Self { AuditTrail }
/// }
///
/// struct Observability;
///
/// impl ServiceModule for Observability {
///     fn register(container: &Container) -> Result<()> {
///         container.provide_singleton::<Metrics>()?;
///         container.provide_scoped::<AuditTrail>()
///     }
/// }
///
/// let container = Container::new();
/// Observability::register(&container).unwrap();
/// assert_eq!(container.len(), 2);
/// ```
pub trait ServiceModule {
    fn register(container: &Container) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DiError, HookError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct Settings {
        region: &'static str,
    }

    impl Service for Settings {
        type Dependencies = ();

        fn create(_: ()) -> Self {
            Settings { region: "eu-west-1" }
        }
    }

    #[derive(Debug)]
    struct BlobStore {
        bucket: String,
    }

    impl Service for BlobStore {
        type Dependencies = Arc<Settings>;

        fn create(settings: Arc<Settings>) -> Self {
            BlobStore {
                bucket: format!("uploads-{}", settings.region),
            }
        }
    }

    struct RateLimiter {
        per_minute: u32,
    }

    impl Service for RateLimiter {
        type Dependencies = ();

        fn create(_: ()) -> Self {
            RateLimiter { per_minute: 600 }
        }
    }

    struct UploadHandler {
        store: Arc<BlobStore>,
        limiter: Arc<RateLimiter>,
    }

    impl Service for UploadHandler {
        type Dependencies = (Arc<BlobStore>, Arc<RateLimiter>);

        fn create((store, limiter): (Arc<BlobStore>, Arc<RateLimiter>)) -> Self {
            UploadHandler { store, limiter }
        }
    }

    #[tokio::test]
    async fn test_service_without_dependencies() {
        let container = Container::new();
        container.provide_singleton::<Settings>().unwrap();

        let settings = container.resolve::<Settings>().await.unwrap();
        assert_eq!(settings.region, "eu-west-1");
    }

    #[tokio::test]
    async fn test_dependency_list_comes_from_type() {
        let container = Container::new();
        container.provide_singleton::<Settings>().unwrap();
        container.provide_singleton::<BlobStore>().unwrap();
        container.provide_singleton::<RateLimiter>().unwrap();
        container.provide_transient::<UploadHandler>().unwrap();

        let descriptor = container
            .descriptors()
            .into_iter()
            .find(|d| d.key().is::<UploadHandler>())
            .unwrap();
        assert_eq!(
            descriptor.dependencies(),
            &[ServiceKey::of::<BlobStore>(), ServiceKey::of::<RateLimiter>()]
        );

        let handler = container.resolve::<UploadHandler>().await.unwrap();
        assert_eq!(handler.store.bucket, "uploads-eu-west-1");
        assert_eq!(handler.limiter.per_minute, 600);
    }

    #[tokio::test]
    async fn test_missing_dependency_fails_at_resolution() {
        let container = Container::new();
        container.provide_singleton::<BlobStore>().unwrap();

        let err = container.resolve::<BlobStore>().await.unwrap_err();
        assert!(matches!(err, DiError::UnregisteredService { ref key } if key.is::<Settings>()));
    }

    #[tokio::test]
    async fn test_provide_transient() {
        static NEXT: AtomicU32 = AtomicU32::new(0);

        struct Ticket(u32);

        impl Service for Ticket {
            type Dependencies = ();

            fn create(_: ()) -> Self {
                Ticket(NEXT.fetch_add(1, Ordering::SeqCst))
            }
        }

        let container = Container::new();
        container.provide_transient::<Ticket>().unwrap();

        let t1 = container.resolve::<Ticket>().await.unwrap();
        let t2 = container.resolve::<Ticket>().await.unwrap();
        assert_ne!(t1.0, t2.0);
    }

    #[tokio::test]
    async fn test_provide_managed_runs_hooks() {
        #[derive(Default)]
        struct Pool {
            open: AtomicBool,
        }

        impl Service for Pool {
            type Dependencies = ();

            fn create(_: ()) -> Self {
                Pool::default()
            }
        }

        #[async_trait]
        impl ServiceLifecycle for Pool {
            async fn initialize(&self) -> std::result::Result<(), HookError> {
                self.open.store(true, Ordering::SeqCst);
                Ok(())
            }

            async fn dispose(&self) -> std::result::Result<(), HookError> {
                self.open.store(false, Ordering::SeqCst);
                Ok(())
            }
        }

        let container = Container::new();
        container.provide_managed::<Pool>(Lifetime::Singleton).unwrap();

        let pool = container.resolve::<Pool>().await.unwrap();
        assert!(pool.open.load(Ordering::SeqCst));

        container.shutdown().await.unwrap();
        assert!(!pool.open.load(Ordering::SeqCst));
    }

    #[test]
    fn test_resolvable_keys() {
        assert!(<() as Resolvable>::keys().is_empty());
        assert_eq!(<Arc<Settings> as Resolvable>::keys(), vec![ServiceKey::of::<Settings>()]);
        assert_eq!(<(Arc<BlobStore>, Arc<RateLimiter>) as Resolvable>::keys().len(), 2);
    }

    #[test]
    fn test_module_registration_is_not_repeatable() {
        struct Storage;

        impl ServiceModule for Storage {
            fn register(container: &Container) -> Result<()> {
                container.provide_singleton::<Settings>()?;
                container.provide_singleton::<BlobStore>()
            }
        }

        let container = Container::new();
        Storage::register(&container).unwrap();
        assert!(container.contains::<Settings>());
        assert!(container.contains::<BlobStore>());

        let err = Storage::register(&container).unwrap_err();
        assert!(matches!(err, DiError::DuplicateRegistration { .. }));
    }
}
