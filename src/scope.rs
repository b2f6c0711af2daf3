//! Scoped lifetimes
//!
//! A [`Scope`] is a bounded unit of work (a request, a job, a session).
//! Scoped services are cached per scope; transient services resolved in a
//! scope are owned by it. Closing a scope disposes what it owns, newest
//! first, after closing any scopes nested inside it.
//!
//! The container itself acts as the root scope (id 0): singletons live in
//! its ledger, as does anything resolved directly from the container.

use crate::container::{Container, ContainerInner};
use crate::factory::{AnyService, downcast};
use crate::lifecycle::{Ledger, dispose_in_reverse, disposal_result};
use crate::storage::InstanceCache;
use crate::{DiError, DisposalFailure, Injectable, Result, ServiceKey, resolver};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

#[cfg(feature = "logging")]
use tracing::{debug, warn};

/// Scope identifier, unique within a container.
///
/// The root scope (the container itself) is `0`; nested scopes count up
/// from `1` in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u64);

impl ScopeId {
    /// The container's own scope.
    pub const ROOT: ScopeId = ScopeId(0);

    #[inline]
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw ID value.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_root() {
            f.write_str("root")
        } else {
            write!(f, "scope-{}", self.0)
        }
    }
}

/// Shared state behind a scope handle.
pub(crate) struct ScopeState {
    id: ScopeId,
    depth: u32,
    pub(crate) cache: InstanceCache,
    pub(crate) ledger: Ledger,
    closed: AtomicBool,
    children: Mutex<Vec<Weak<ScopeState>>>,
}

impl ScopeState {
    pub(crate) fn root(capacity: usize) -> Self {
        Self::new(ScopeId::ROOT, 0, InstanceCache::with_capacity(capacity))
    }

    fn new(id: ScopeId, depth: u32, cache: InstanceCache) -> Self {
        Self {
            id,
            depth,
            cache,
            ledger: Ledger::new(),
            closed: AtomicBool::new(false),
            children: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> ScopeId {
        self.id
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The error reported for work attempted after close.
    pub(crate) fn closed_error(&self) -> DiError {
        if self.id.is_root() {
            DiError::ShutDown
        } else {
            DiError::ScopeClosed { scope: self.id }
        }
    }

    #[inline]
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(self.closed_error())
        } else {
            Ok(())
        }
    }

    /// Open a nested scope tracked by this one.
    fn open_child(self: &Arc<Self>, id: ScopeId) -> Result<Arc<ScopeState>> {
        self.ensure_open()?;

        let child = Arc::new(ScopeState::new(id, self.depth + 1, InstanceCache::new()));
        {
            let mut children = self.children.lock();
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&child));
        }

        // Lost a race with close(): the child would never be closed by us.
        if self.is_closed() {
            child.closed.store(true, Ordering::Release);
            return Err(self.closed_error());
        }

        Ok(child)
    }

    /// Close this scope: nested scopes first (newest first), then the own
    /// ledger in reverse creation order. Only the first call does any work.
    pub(crate) fn close(self: Arc<Self>) -> BoxFuture<'static, Vec<DisposalFailure>> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::AcqRel) {
                return Vec::new();
            }

            let children: Vec<Arc<ScopeState>> = self
                .children
                .lock()
                .drain(..)
                .filter_map(|child| child.upgrade())
                .collect();

            let mut failures = Vec::new();
            for child in children.into_iter().rev() {
                failures.extend(child.close().await);
            }

            failures.extend(dispose_in_reverse(self.ledger.take_all()).await);
            self.cache.clear();
            failures
        })
    }
}

impl Drop for ScopeState {
    fn drop(&mut self) {
        let entries = self.ledger.take_all();
        if entries.is_empty() {
            return;
        }

        #[cfg(feature = "logging")]
        if !self.is_closed() {
            warn!(
                target: "di_runtime",
                scope = %self.id,
                pending = entries.len(),
                "Scope dropped without being closed; disposing its services in the background"
            );
        }

        crate::lifecycle::dispose_detached(entries);
    }
}

impl std::fmt::Debug for ScopeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeState")
            .field("id", &self.id)
            .field("depth", &self.depth)
            .field("cached", &self.cache.len())
            .field("owned", &self.ledger.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A handle to an open scope.
///
/// Cloning the handle shares the scope. Scopes should be closed explicitly
/// with [`Scope::close`] (or used through [`Container::with_scope`]); a scope
/// whose last handle is dropped while still open is disposed in the
/// background and a warning is logged.
///
/// # Examples
///
/// ```rust
/// use di_runtime::{Container, Lifetime};
/// use std::sync::Arc;
///
/// struct RequestContext;
///
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let container = Container::new();
/// container.register_scoped(&[], |_| Ok(RequestContext)).unwrap();
///
/// let scope = container.create_scope().unwrap();
/// let a = scope.resolve::<RequestContext>().await.unwrap();
/// let b = scope.resolve::<RequestContext>().await.unwrap();
/// assert!(Arc::ptr_eq(&a, &b));
///
/// scope.close().await.unwrap();
/// assert!(scope.resolve::<RequestContext>().await.is_err());
/// # });
/// ```
#[derive(Clone)]
pub struct Scope {
    container: Arc<ContainerInner>,
    state: Arc<ScopeState>,
}

impl Scope {
    pub(crate) fn open(container: &Arc<ContainerInner>, parent: &Arc<ScopeState>) -> Result<Self> {
        container.ensure_running()?;
        let state = parent.open_child(container.next_scope_id())?;

        #[cfg(feature = "logging")]
        debug!(
            target: "di_runtime",
            scope = %state.id,
            parent = %parent.id,
            depth = state.depth,
            "Opened scope"
        );

        Ok(Self {
            container: Arc::clone(container),
            state,
        })
    }

    /// This scope's identifier.
    #[inline]
    pub fn id(&self) -> ScopeId {
        self.state.id
    }

    /// Nesting depth; scopes opened from the container have depth 1.
    #[inline]
    pub fn depth(&self) -> u32 {
        self.state.depth
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// The container this scope belongs to.
    pub fn container(&self) -> Container {
        Container::from_inner(Arc::clone(&self.container))
    }

    /// Resolve the unnamed service of type `T`.
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
    /// registered. Failures further down the graph are still errors.
    pub async fn try_resolve<T: Injectable>(&self) -> Result<Option<Arc<T>>> {
        if !self.container.registry.contains(&ServiceKey::of::<T>()) {
            return Ok(None);
        }
        self.resolve::<T>().await.map(Some)
    }

    /// Resolve a type-erased instance by key.
    pub async fn resolve_key(&self, key: &ServiceKey) -> Result<AnyService> {
        resolver::resolve(&self.container, &self.state, key).await
    }

    /// Open a scope nested in this one.
    ///
    /// Nested scopes have their own scoped instances; closing this scope
    /// closes them first.
    pub fn create_scope(&self) -> Result<Scope> {
        Scope::open(&self.container, &self.state)
    }

    /// Run `body` in a nested scope that is closed on every exit path.
    ///
    /// See [`Container::with_scope`].
    pub async fn with_scope<F, Fut, R>(&self, body: F) -> Result<R>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = R>,
    {
        let scope = self.create_scope()?;
        Ok(run_in_scope(scope, body).await)
    }

    /// Close the scope, disposing everything it owns.
    ///
    /// Idempotent. Every dispose hook runs even if some fail; failures are
    /// reported together as [`DiError::Disposal`].
    pub async fn close(&self) -> Result<()> {
        if self.state.is_closed() {
            return Ok(());
        }

        #[cfg(feature = "logging")]
        debug!(
            target: "di_runtime",
            scope = %self.state.id,
            owned = self.state.ledger.len(),
            "Closing scope"
        );

        let failures = Arc::clone(&self.state).close().await;
        disposal_result(failures)
    }

    /// Alias for [`close`](Self::close).
    #[inline]
    pub async fn close_scope(&self) -> Result<()> {
        self.close().await
    }

    /// Number of scoped instances currently cached in this scope.
    pub fn cached_count(&self) -> usize {
        self.state.cache.len()
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.state.id)
            .field("depth", &self.state.depth)
            .field("closed", &self.state.is_closed())
            .finish()
    }
}

/// Closes the scope if the enclosing future is dropped before it could.
struct CloseOnDrop {
    scope: Option<Scope>,
}

impl CloseOnDrop {
    async fn close(mut self) {
        if let Some(scope) = self.scope.take() {
            // Failures were logged by the disposal pass.
            let _ = scope.close().await;
        }
    }
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        let Some(scope) = self.scope.take() else { return };

        #[cfg(feature = "logging")]
        warn!(
            target: "di_runtime",
            scope = %scope.state.id,
            "Scoped block cancelled; closing scope in the background"
        );

        let pass = async move {
            let _ = scope.close().await;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(pass);
            }
            Err(_) => futures::executor::block_on(pass),
        }
    }
}

/// Run `body` with `scope`, closing the scope whether the body returns,
/// panics or is cancelled. Panics are re-raised after the close pass.
pub(crate) async fn run_in_scope<F, Fut, R>(scope: Scope, body: F) -> R
where
    F: FnOnce(Scope) -> Fut,
    Fut: Future<Output = R>,
{
    let guard = CloseOnDrop {
        scope: Some(scope.clone()),
    };

    let outcome = AssertUnwindSafe(body(scope)).catch_unwind().await;
    guard.close().await;

    match outcome {
        Ok(value) => value,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}
