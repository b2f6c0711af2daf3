//! Service lifecycle coordination
//!
//! Services that hold external resources implement [`ServiceLifecycle`] and
//! opt in at registration time. The container then:
//!
//! - runs `initialize` right after construction, before anyone sees the
//!   instance;
//! - records the instance in the ledger of its owner (the container for
//!   singletons, the resolving scope otherwise);
//! - runs `dispose` when the owner is torn down, newest first, so dependents
//!   are always disposed before their dependencies.
//!
//! Disposal is best-effort: a failing or panicking hook is recorded as a
//! [`DisposalFailure`] and the walk continues.

use crate::factory::AnyService;
use crate::{DiError, DisposalFailure, HookError, Injectable, Result, ServiceKey};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

#[cfg(feature = "logging")]
use tracing::{debug, warn};

/// Optional initialize/dispose contract for registered services.
///
/// Both hooks default to doing nothing, so implementors only write the half
/// they need. Hooks receive `&self` because instances are shared; use
/// interior mutability for state that changes on open/close.
///
/// # Examples
///
/// ```rust
/// use di_runtime::{HookError, ServiceLifecycle};
/// use std::sync::atomic::{AtomicBool, Ordering};
///
/// struct ConnectionPool {
///     open: AtomicBool,
/// }
///
/// #[async_trait::async_trait]
/// impl ServiceLifecycle for ConnectionPool {
///     async fn initialize(&self) -> Result<(), HookError> {
///         self.open.store(true, Ordering::SeqCst);
///         Ok(())
///     }
///
///     async fn dispose(&self) -> Result<(), HookError> {
///         self.open.store(false, Ordering::SeqCst);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait ServiceLifecycle: Send + Sync + 'static {
    /// Called once after construction, before the instance is handed out.
    async fn initialize(&self) -> std::result::Result<(), HookError> {
        Ok(())
    }

    /// Called once when the owning scope or container is torn down.
    async fn dispose(&self) -> std::result::Result<(), HookError> {
        Ok(())
    }
}

/// Lifecycle state of a managed instance.
///
/// `Uninitialized → Initializing → Ready → Disposing → Disposed`, with the
/// failure path `Initializing → Disposing → Disposed`. Nothing leaves
/// `Disposed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InstanceState {
    Uninitialized = 0,
    Initializing = 1,
    Ready = 2,
    Disposing = 3,
    Disposed = 4,
}

impl InstanceState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => InstanceState::Uninitialized,
            1 => InstanceState::Initializing,
            2 => InstanceState::Ready,
            3 => InstanceState::Disposing,
            _ => InstanceState::Disposed,
        }
    }
}

/// Projects a type-erased instance onto its lifecycle hooks.
pub(crate) type LifecycleAdapter =
    Arc<dyn Fn(&AnyService) -> Option<Arc<dyn ServiceLifecycle>> + Send + Sync>;

/// Build the adapter for a concrete service type.
pub(crate) fn adapter<T: Injectable + ServiceLifecycle>() -> LifecycleAdapter {
    Arc::new(|any: &AnyService| {
        Arc::clone(any)
            .downcast::<T>()
            .ok()
            .map(|typed| typed as Arc<dyn ServiceLifecycle>)
    })
}

/// An instance whose hooks the container is responsible for.
pub(crate) struct ManagedInstance {
    key: ServiceKey,
    hooks: Arc<dyn ServiceLifecycle>,
    state: AtomicU8,
}

impl ManagedInstance {
    pub fn new(key: ServiceKey, hooks: Arc<dyn ServiceLifecycle>) -> Self {
        Self {
            key,
            hooks,
            state: AtomicU8::new(InstanceState::Uninitialized as u8),
        }
    }

    #[inline]
    pub fn state(&self) -> InstanceState {
        InstanceState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: InstanceState, to: InstanceState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Run the initialize hook.
    ///
    /// On failure the instance is moved straight to `Disposed`; its dispose
    /// hook is not called since initialization never completed.
    pub async fn initialize(&self) -> Result<()> {
        if !self.transition(InstanceState::Uninitialized, InstanceState::Initializing) {
            return Ok(());
        }

        #[cfg(feature = "logging")]
        debug!(
            target: "di_runtime",
            service = %self.key,
            "Initializing service"
        );

        match run_hook(self.hooks.initialize()).await {
            Ok(()) => {
                self.transition(InstanceState::Initializing, InstanceState::Ready);
                Ok(())
            }
            Err(reason) => {
                self.transition(InstanceState::Initializing, InstanceState::Disposing);
                self.transition(InstanceState::Disposing, InstanceState::Disposed);

                #[cfg(feature = "logging")]
                warn!(
                    target: "di_runtime",
                    service = %self.key,
                    error = %reason,
                    "Initialize hook failed"
                );

                Err(DiError::Initialization {
                    key: self.key.clone(),
                    reason,
                })
            }
        }
    }

    /// Run the dispose hook once. Later calls are no-ops.
    pub async fn dispose(&self) -> std::result::Result<(), DisposalFailure> {
        if !self.transition(InstanceState::Ready, InstanceState::Disposing) {
            // Never initialized: nothing to release.
            self.transition(InstanceState::Uninitialized, InstanceState::Disposed);
            return Ok(());
        }

        #[cfg(feature = "logging")]
        debug!(
            target: "di_runtime",
            service = %self.key,
            "Disposing service"
        );

        let interrupted = Interrupted(self);
        let outcome = run_hook(self.hooks.dispose()).await;
        std::mem::forget(interrupted);
        self.transition(InstanceState::Disposing, InstanceState::Disposed);

        outcome.map_err(|reason| {
            #[cfg(feature = "logging")]
            warn!(
                target: "di_runtime",
                service = %self.key,
                error = %reason,
                "Dispose hook failed"
            );

            DisposalFailure {
                key: self.key.clone(),
                reason,
            }
        })
    }
}

/// Armed while a dispose hook runs. If the hook's future is dropped before it
/// finishes, the instance goes back to `Ready` so a later pass disposes it.
struct Interrupted<'a>(&'a ManagedInstance);

impl Drop for Interrupted<'_> {
    fn drop(&mut self) {
        self.0.transition(InstanceState::Disposing, InstanceState::Ready);
    }
}

impl std::fmt::Debug for ManagedInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedInstance")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

/// Await a hook, turning both errors and panics into a message.
async fn run_hook<F>(hook: F) -> std::result::Result<(), String>
where
    F: Future<Output = std::result::Result<(), HookError>>,
{
    match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(panic) => Err(panic_message(&*panic)),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("hook panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("hook panicked: {msg}")
    } else {
        "hook panicked".to_string()
    }
}

/// Ordered record of managed instances owned by a scope or the container.
///
/// Append order is creation order.
#[derive(Default)]
pub(crate) struct Ledger {
    entries: Mutex<Vec<Arc<ManagedInstance>>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: Arc<ManagedInstance>) {
        self.entries.lock().push(entry);
    }

    /// Remove a specific entry (rollback). Returns whether it was present.
    pub fn remove(&self, entry: &Arc<ManagedInstance>) -> bool {
        let mut entries = self.entries.lock();
        match entries.iter().rposition(|e| Arc::ptr_eq(e, entry)) {
            Some(idx) => {
                entries.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Take every entry, oldest first, leaving the ledger empty.
    pub fn take_all(&self) -> Vec<Arc<ManagedInstance>> {
        std::mem::take(&mut *self.entries.lock())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").field("count", &self.len()).finish()
    }
}

/// Dispose `entries` newest first, collecting every failure.
///
/// If the returned future is dropped part-way, the entries not yet disposed
/// are handed to [`dispose_detached`] instead of being leaked.
pub(crate) fn dispose_in_reverse(
    entries: Vec<Arc<ManagedInstance>>,
) -> impl Future<Output = Vec<DisposalFailure>> + Send + 'static {
    let queue = DisposalQueue { remaining: entries };
    async move {
        // Rebound so the in-flight hook below is dropped before the queue
        let mut queue = queue;
        let mut failures = Vec::new();
        // The entry stays queued until its hook returns, so a cancelled
        // pass hands the in-flight one over as well.
        while let Some(entry) = queue.remaining.last().cloned() {
            let outcome = entry.dispose().await;
            queue.remaining.pop();
            if let Err(failure) = outcome {
                failures.push(failure);
            }
        }
        failures
    }
}

struct DisposalQueue {
    remaining: Vec<Arc<ManagedInstance>>,
}

impl Drop for DisposalQueue {
    fn drop(&mut self) {
        if !self.remaining.is_empty() {
            dispose_detached(std::mem::take(&mut self.remaining));
        }
    }
}

/// Dispose `entries` outside of the caller's task.
///
/// Used from `Drop` impls, which cannot await. Runs on the current tokio
/// runtime when there is one, otherwise blocks the dropping thread.
pub(crate) fn dispose_detached(entries: Vec<Arc<ManagedInstance>>) {
    if entries.is_empty() {
        return;
    }

    #[cfg(feature = "logging")]
    debug!(
        target: "di_runtime",
        count = entries.len(),
        "Disposing instances in the background"
    );

    let pass = async move {
        let _ = disposal_result(dispose_in_reverse(entries).await);
    };

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(pass);
        }
        Err(_) => futures::executor::block_on(pass),
    }
}

/// Turn the failures of a full disposal pass into a result.
pub(crate) fn disposal_result(failures: Vec<DisposalFailure>) -> Result<()> {
    if failures.is_empty() {
        Ok(())
    } else {
        #[cfg(feature = "logging")]
        warn!(
            target: "di_runtime",
            failed = failures.len(),
            "Disposal pass completed with failures"
        );

        Err(DiError::Disposal { failures })
    }
}
