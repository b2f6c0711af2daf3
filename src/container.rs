//! The dependency injection container
//!
//! The `Container` owns the service registry, the singleton cache and the
//! root disposal ledger. It is cheap to clone; all clones share state.
//!
//! A container goes through three phases:
//!
//! 1. **Composition**: services are registered. Nothing is built.
//! 2. **Running**: the first resolution (or an explicit [`Container::seal`])
//!    freezes the registry; services are built on demand.
//! 3. **Shut down**: [`Container::shutdown`] closes live scopes and disposes
//!    singletons; further resolution fails with [`DiError::ShutDown`].

use crate::factory::{AnyService, Resolved, downcast};
use crate::lifecycle::{LifecycleAdapter, ServiceLifecycle, disposal_result};
use crate::registry::{CaptiveValidation, Registry, ServiceDescriptor};
use crate::scope::{Scope, ScopeId, ScopeState, run_in_scope};
use crate::storage::InstanceCache;
use crate::{DiError, Injectable, Lifetime, Result, ServiceKey, resolver};
use std::borrow::Cow;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[cfg(feature = "logging")]
use tracing::{debug, info};

/// Construction options for a [`Container`].
///
/// # Examples
///
/// ```rust
/// use di_runtime::{CaptiveValidation, Container, ContainerOptions};
///
/// let container = Container::with_options(
///     ContainerOptions::new()
///         .capacity(64)
///         .captive_validation(CaptiveValidation::Lazy),
/// );
/// assert!(container.is_empty());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ContainerOptions {
    capacity: usize,
    captive_validation: CaptiveValidation,
}

impl ContainerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-allocate room for roughly this many services.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// When to check for singletons depending on scoped services.
    pub fn captive_validation(mut self, validation: CaptiveValidation) -> Self {
        self.captive_validation = validation;
        self
    }
}

/// State shared by a container, its clones and its scopes.
pub(crate) struct ContainerInner {
    pub(crate) registry: Registry,
    pub(crate) singletons: InstanceCache,
    root: Arc<ScopeState>,
    options: ContainerOptions,
    next_scope_id: AtomicU64,
    shut_down: AtomicBool,
}

impl ContainerInner {
    /// The container's own scope: owns singletons and anything resolved
    /// directly from the container.
    #[inline]
    pub(crate) fn root(&self) -> &Arc<ScopeState> {
        &self.root
    }

    #[inline]
    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            Err(DiError::ShutDown)
        } else {
            Ok(())
        }
    }

    #[inline]
    pub(crate) fn seal(&self) -> Result<()> {
        self.registry.seal(self.options.captive_validation)
    }

    #[inline]
    pub(crate) fn next_scope_id(&self) -> ScopeId {
        ScopeId::new(self.next_scope_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Dependency injection container.
///
/// # Examples
///
/// ```rust
/// use di_runtime::{Container, ServiceKey};
/// use std::sync::Arc;
///
/// struct Logger;
/// struct Repository { logger: Arc<Logger> }
///
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let container = Container::new();
/// container.register_singleton(&[], |_| Ok(Logger)).unwrap();
/// container
///     .register_scoped(&[ServiceKey::of::<Logger>()], |deps| {
///         Ok(Repository { logger: deps.get()? })
///     })
///     .unwrap();
///
/// let scope = container.create_scope().unwrap();
/// let repo = scope.resolve::<Repository>().await.unwrap();
/// let logger = container.resolve::<Logger>().await.unwrap();
/// assert!(Arc::ptr_eq(&repo.logger, &logger));
///
/// scope.close().await.unwrap();
/// container.shutdown().await.unwrap();
/// # });
/// ```
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

impl Container {
    /// Create an empty container with default options.
    #[inline]
    pub fn new() -> Self {
        Self::with_options(ContainerOptions::default())
    }

    /// Create a container with pre-allocated capacity.
    ///
    /// Use this when you know approximately how many services will be registered.
    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_options(ContainerOptions::new().capacity(capacity))
    }

    pub fn with_options(options: ContainerOptions) -> Self {
        #[cfg(feature = "logging")]
        debug!(
            target: "di_runtime",
            capacity = options.capacity,
            captive_validation = ?options.captive_validation,
            "Creating new DI container"
        );

        Self {
            inner: Arc::new(ContainerInner {
                registry: Registry::with_capacity(options.capacity),
                singletons: InstanceCache::with_capacity(options.capacity),
                root: Arc::new(ScopeState::root(options.capacity)),
                next_scope_id: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
                options,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ContainerInner>) -> Self {
        Self { inner }
    }

    // =========================================================================
    // Registration Methods
    // =========================================================================

    /// Register a descriptor.
    ///
    /// Fails with [`DiError::DuplicateRegistration`] if the key is taken and
    /// `allow_override` is false, and with [`DiError::RegistryClosed`] once
    /// the container is sealed.
    pub fn register(&self, descriptor: ServiceDescriptor, allow_override: bool) -> Result<()> {
        self.inner.registry.register(descriptor, allow_override)
    }

    /// Register a singleton: built once, on first resolution, and shared by
    /// every caller.
    ///
    /// `dependencies` are resolved in order and made available to `factory`
    /// through [`Resolved`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// use di_runtime::Container;
    ///
    /// struct Database { url: String }
    ///
    /// let container = Container::new();
    /// container
    ///     .register_singleton(&[], |_| Ok(Database { url: "postgres://localhost".into() }))
    ///     .unwrap();
    /// assert!(container.contains::<Database>());
    /// ```
    pub fn register_singleton<T, F>(&self, dependencies: &[ServiceKey], factory: F) -> Result<()>
    where
        T: Injectable,
        F: Fn(&Resolved<'_>) -> Result<T> + Send + Sync + 'static,
    {
        self.service::<T>(Lifetime::Singleton)
            .depends_on_keys(dependencies)
            .factory(factory)
    }

    /// Register a scoped service: one instance per scope.
    pub fn register_scoped<T, F>(&self, dependencies: &[ServiceKey], factory: F) -> Result<()>
    where
        T: Injectable,
        F: Fn(&Resolved<'_>) -> Result<T> + Send + Sync + 'static,
    {
        self.service::<T>(Lifetime::Scoped)
            .depends_on_keys(dependencies)
            .factory(factory)
    }

    /// Register a transient service: a new instance on every resolution.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use di_runtime::Container;
    /// use std::sync::atomic::{AtomicU64, Ordering};
    ///
    /// static COUNTER: AtomicU64 = AtomicU64::new(0);
    ///
    /// struct RequestId(u64);
    ///
    /// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
    /// let container = Container::new();
    /// container
    ///     .register_transient(&[], |_| Ok(RequestId(COUNTER.fetch_add(1, Ordering::SeqCst))))
    ///     .unwrap();
    ///
    /// let id1 = container.resolve::<RequestId>().await.unwrap();
    /// let id2 = container.resolve::<RequestId>().await.unwrap();
    /// assert_ne!(id1.0, id2.0);
    /// # });
    /// ```
    pub fn register_transient<T, F>(&self, dependencies: &[ServiceKey], factory: F) -> Result<()>
    where
        T: Injectable,
        F: Fn(&Resolved<'_>) -> Result<T> + Send + Sync + 'static,
    {
        self.service::<T>(Lifetime::Transient)
            .depends_on_keys(dependencies)
            .factory(factory)
    }

    /// Register a pre-built singleton, replacing any existing registration
    /// for `T`.
    ///
    /// Intended for configuration values and test doubles. The container
    /// never runs lifecycle hooks on instances it did not build.
    pub fn register_instance<T: Injectable>(&self, value: T) -> Result<()> {
        self.service::<T>(Lifetime::Singleton)
            .allow_override()
            .instance(value)
    }

    /// Start a fluent registration for `T`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use di_runtime::{Container, Lifetime};
    ///
    /// struct Pool { size: usize }
    ///
    /// let container = Container::new();
    /// container
    ///     .service::<Pool>(Lifetime::Singleton)
    ///     .named("primary")
    ///     .factory(|_| Ok(Pool { size: 16 }))
    ///     .unwrap();
    /// assert!(container.contains_named::<Pool>("primary"));
    /// ```
    #[inline]
    pub fn service<T: Injectable>(&self, lifetime: Lifetime) -> ServiceBuilder<'_, T> {
        ServiceBuilder {
            container: self,
            key: ServiceKey::of::<T>(),
            lifetime,
            dependencies: Vec::new(),
            lifecycle: None,
            allow_override: false,
            _marker: PhantomData,
        }
    }

    /// Freeze the registry now instead of on first resolution.
    ///
    /// Runs captive-dependency validation unless the container was built
    /// with [`CaptiveValidation::Lazy`]. Idempotent.
    pub fn seal(&self) -> Result<()> {
        self.inner.seal()
    }

    #[inline]
    pub fn is_sealed(&self) -> bool {
        self.inner.registry.is_sealed()
    }

    /// Check the dependency graph without building anything.
    ///
    /// Returns every missing dependency and cycle, plus the first captive
    /// dependency found. An empty list means the graph is sound.
    pub fn diagnose(&self) -> Vec<DiError> {
        self.inner.registry.diagnose()
    }

    // =========================================================================
    // Resolution Methods
    // =========================================================================

    /// Resolve the unnamed service of type `T` at the root scope.
    ///
    /// Scoped services resolved here are cached by the container and live
    /// until shutdown.
    pub async fn resolve<T: Injectable>(&self) -> Result<Arc<T>> {
        let key = ServiceKey::of::<T>();
        let any = self.resolve_key(&key).await?;
        downcast(&key, any)
    }

    /// Resolve the service of type `T` registered under `name`.
    pub async fn resolve_named<T: Injectable>(&self, name: &str) -> Result<Arc<T>> {
        let key = ServiceKey::named::<T>(name.to_owned());
        let any = self.resolve_key(&key).await?;
        downcast(&key, any)
    }

    /// Like [`resolve`](Self::resolve), but `Ok(None)` if `T` itself is not
    /// registered.
    pub async fn try_resolve<T: Injectable>(&self) -> Result<Option<Arc<T>>> {
        if !self.contains::<T>() {
            return Ok(None);
        }
        self.resolve::<T>().await.map(Some)
    }

    /// Resolve a type-erased instance by key.
    pub async fn resolve_key(&self, key: &ServiceKey) -> Result<AnyService> {
        resolver::resolve(&self.inner, self.inner.root(), key).await
    }

    /// Check if `T` is registered (unnamed).
    #[inline]
    pub fn contains<T: Injectable>(&self) -> bool {
        self.inner.registry.contains(&ServiceKey::of::<T>())
    }

    #[inline]
    pub fn contains_named<T: Injectable>(&self, name: &str) -> bool {
        self.inner
            .registry
            .contains(&ServiceKey::named::<T>(name.to_owned()))
    }

    #[inline]
    pub fn contains_key(&self, key: &ServiceKey) -> bool {
        self.inner.registry.contains(key)
    }

    /// Number of registered services.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.registry.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered keys, in registration order.
    pub fn keys(&self) -> Vec<ServiceKey> {
        self.inner.registry.keys()
    }

    /// Registered descriptors, in registration order.
    pub fn descriptors(&self) -> Vec<Arc<ServiceDescriptor>> {
        self.inner.registry.descriptors()
    }

    /// Number of singletons built so far.
    pub fn singleton_count(&self) -> usize {
        self.inner.singletons.len()
    }

    // =========================================================================
    // Scopes
    // =========================================================================

    /// Open a new top-level scope.
    pub fn create_scope(&self) -> Result<Scope> {
        Scope::open(&self.inner, self.inner.root())
    }

    /// Alias for [`create_scope`](Self::create_scope).
    #[inline]
    pub fn open_scope(&self) -> Result<Scope> {
        self.create_scope()
    }

    /// Close `scope`. Alias for [`Scope::close`].
    #[inline]
    pub async fn close_scope(&self, scope: &Scope) -> Result<()> {
        scope.close().await
    }

    /// Run `body` in a fresh scope that is closed on every exit path: normal
    /// return, panic (re-raised after closing) and cancellation (closed in
    /// the background).
    ///
    /// Dispose failures are logged; use [`create_scope`](Self::create_scope)
    /// and [`Scope::close`] to receive them as an error instead.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use di_runtime::Container;
    ///
    /// struct RequestContext { id: u32 }
    ///
    /// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
    /// let container = Container::new();
    /// container.register_scoped(&[], |_| Ok(RequestContext { id: 7 })).unwrap();
    ///
    /// let id = container
    ///     .with_scope(|scope| async move {
    ///         scope.resolve::<RequestContext>().await.map(|ctx| ctx.id)
    ///     })
    ///     .await
    ///     .unwrap()
    ///     .unwrap();
    /// assert_eq!(id, 7);
    /// # });
    /// ```
    pub async fn with_scope<F, Fut, R>(&self, body: F) -> Result<R>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = R>,
    {
        let scope = self.create_scope()?;
        Ok(run_in_scope(scope, body).await)
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Shut the container down.
    ///
    /// Closes every live scope, then disposes singletons and root-owned
    /// instances newest first. Every hook runs even if some fail; failures
    /// are reported together as [`DiError::Disposal`]. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        #[cfg(feature = "logging")]
        info!(
            target: "di_runtime",
            singletons = self.inner.singletons.len(),
            owned = self.inner.root.ledger.len(),
            "Shutting down DI container"
        );

        let failures = Arc::clone(&self.inner.root).close().await;
        self.inner.singletons.clear();
        disposal_result(failures)
    }

    #[inline]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("service_count", &self.len())
            .field("singletons", &self.inner.singletons.len())
            .field("sealed", &self.is_sealed())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Fluent registration for a single service.
///
/// Created by [`Container::service`]; finished by
/// [`factory`](Self::factory) or [`instance`](Self::instance).
#[must_use = "a service is only registered once `factory` or `instance` is called"]
pub struct ServiceBuilder<'a, T> {
    container: &'a Container,
    key: ServiceKey,
    lifetime: Lifetime,
    dependencies: Vec<ServiceKey>,
    lifecycle: Option<LifecycleAdapter>,
    allow_override: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T: Injectable> ServiceBuilder<'a, T> {
    /// Register under `name` instead of the bare type.
    pub fn named(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.key = self.key.with_name(Some(name.into()));
        self
    }

    /// Depend on the unnamed service of type `D`.
    pub fn depends_on<D: Injectable>(mut self) -> Self {
        self.dependencies.push(ServiceKey::of::<D>());
        self
    }

    /// Depend on the service of type `D` registered under `name`.
    pub fn depends_on_named<D: Injectable>(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.dependencies.push(ServiceKey::named::<D>(name));
        self
    }

    /// Depend on an explicit key.
    pub fn depends_on_key(mut self, key: ServiceKey) -> Self {
        self.dependencies.push(key);
        self
    }

    /// Depend on each of `keys`, in order.
    pub fn depends_on_keys(mut self, keys: &[ServiceKey]) -> Self {
        self.dependencies.extend_from_slice(keys);
        self
    }

    /// Replace an existing registration instead of failing.
    pub fn allow_override(mut self) -> Self {
        self.allow_override = true;
        self
    }

    /// Finish with a factory.
    pub fn factory<F>(self, factory: F) -> Result<()>
    where
        F: Fn(&Resolved<'_>) -> Result<T> + Send + Sync + 'static,
    {
        let descriptor = ServiceDescriptor::new(self.key, self.lifetime, self.dependencies, factory)
            .with_adapter(self.lifecycle);
        self.container.register(descriptor, self.allow_override)
    }

    /// Finish with a pre-built value, always registered as a singleton.
    pub fn instance(self, value: T) -> Result<()> {
        self.shared(Arc::new(value))
    }

    /// Finish with a pre-built shared value.
    pub fn shared(self, value: Arc<T>) -> Result<()> {
        let descriptor = ServiceDescriptor::instance(self.key, value);
        self.container.register(descriptor, self.allow_override)
    }
}

impl<'a, T: Injectable + ServiceLifecycle> ServiceBuilder<'a, T> {
    /// Run `T`'s initialize hook after construction and its dispose hook at
    /// teardown.
    pub fn with_lifecycle(mut self) -> Self {
        self.lifecycle = Some(crate::lifecycle::adapter::<T>());
        self
    }
}
