//! # di-runtime - Async Dependency Injection for Rust
//!
//! A dependency injection runtime for async services: explicit registration,
//! on-demand construction, per-unit-of-work scopes and ordered teardown.
//!
//! ## Features
//!
//! - **Three lifetimes** - Singleton, Scoped (one per [`Scope`]) and Transient
//! - **Explicit dependency lists** - every service declares the keys it needs;
//!   the graph can be inspected without building anything
//! - **Safe composition** - cycles are reported with their full path, and
//!   singletons capturing scoped services are rejected when the registry seals
//! - **Exactly-once singletons** - concurrent first resolutions run the
//!   factory once, without one key's construction blocking another's
//! - **Lifecycle hooks** - async `initialize`/`dispose`, rolled back on failure
//!   and torn down newest-first
//! - **Observable** - optional tracing integration with JSON or pretty output
//!
//! ## Quick Start
//!
//! ```rust
//! use di_runtime::{Container, ServiceKey};
//! use std::sync::Arc;
//!
//! struct Logger;
//!
//! struct Repository {
//!     logger: Arc<Logger>,
//! }
//!
//! struct RequestHandler {
//!     repo: Arc<Repository>,
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let container = Container::new();
//!
//! container.register_singleton(&[], |_| Ok(Logger)).unwrap();
//! container
//!     .register_scoped(&[ServiceKey::of::<Logger>()], |deps| {
//!         Ok(Repository { logger: deps.get()? })
//!     })
//!     .unwrap();
//! container
//!     .register_transient(&[ServiceKey::of::<Repository>()], |deps| {
//!         Ok(RequestHandler { repo: deps.get()? })
//!     })
//!     .unwrap();
//!
//! // One scope per request
//! let scope = container.create_scope().unwrap();
//! let h1 = scope.resolve::<RequestHandler>().await.unwrap();
//! let h2 = scope.resolve::<RequestHandler>().await.unwrap();
//!
//! assert!(!Arc::ptr_eq(&h1, &h2));
//! assert!(Arc::ptr_eq(&h1.repo, &h2.repo));
//!
//! scope.close().await.unwrap();
//! container.shutdown().await.unwrap();
//! # });
//! ```
//!
//! ## Lifecycle Hooks
//!
//! ```rust
//! use di_runtime::{Container, HookError, Lifetime, ServiceLifecycle};
//! use std::sync::atomic::{AtomicBool, Ordering};
//!
//! #[derive(Default)]
//! struct Pool {
//!     open: AtomicBool,
//! }
//!
//! #[async_trait::async_trait]
//! impl ServiceLifecycle for Pool {
//!     async fn initialize(&self) -> Result<(), HookError> {
//!         self.open.store(true, Ordering::SeqCst);
//!         Ok(())
//!     }
//!
//!     async fn dispose(&self) -> Result<(), HookError> {
//!         self.open.store(false, Ordering::SeqCst);
//!         Ok(())
//!     }
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let container = Container::new();
//! container
//!     .service::<Pool>(Lifetime::Singleton)
//!     .with_lifecycle()
//!     .factory(|_| Ok(Pool::default()))
//!     .unwrap();
//!
//! let pool = container.resolve::<Pool>().await.unwrap();
//! assert!(pool.open.load(Ordering::SeqCst));
//!
//! container.shutdown().await.unwrap();
//! assert!(!pool.open.load(Ordering::SeqCst));
//! # });
//! ```
//!
//! ## Scoped Blocks
//!
//! [`Container::with_scope`] closes its scope on every exit path, including
//! panics and cancellation:
//!
//! ```rust
//! use di_runtime::Container;
//!
//! struct RequestContext { id: u64 }
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let container = Container::new();
//! container.register_scoped(&[], |_| Ok(RequestContext { id: 1 })).unwrap();
//!
//! let id = container
//!     .with_scope(|scope| async move { scope.resolve::<RequestContext>().await.map(|c| c.id) })
//!     .await
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(id, 1);
//! # });
//! ```

// Lets the derive macros refer to `::di_runtime` from inside this crate
#[cfg(feature = "derive")]
extern crate self as di_runtime;

mod container;
mod error;
mod factory;
mod lifecycle;
#[cfg(feature = "logging")]
pub mod logging;
mod provider;
mod registry;
mod resolver;
mod scope;
mod storage;
pub mod verified;

pub use container::{Container, ContainerOptions, ServiceBuilder};
pub use error::*;
pub use factory::{AnyService, Resolved};
pub use lifecycle::{InstanceState, ServiceLifecycle};
pub use provider::*;
pub use registry::{CaptiveValidation, ServiceDescriptor};
pub use scope::{Scope, ScopeId};

// Re-export derive macros when feature is enabled
#[cfg(feature = "derive")]
pub use di_runtime_derive::Service;

// Re-export for convenience
pub use std::sync::Arc;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::verified::{Service, ServiceModule, ServiceProvider};
    pub use crate::{
        CaptiveValidation, Container, ContainerOptions, DiError, HookError, Injectable, Lifetime,
        Resolved, Result, Scope, ServiceKey, ServiceLifecycle,
    };
    pub use std::sync::Arc;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    type CallLog = Arc<Mutex<Vec<&'static str>>>;

    /// A lifecycle-aware service that records its hook calls.
    #[derive(Debug)]
    struct Tracked {
        name: &'static str,
        log: CallLog,
        fail_init: bool,
    }

    #[async_trait]
    impl ServiceLifecycle for Tracked {
        async fn initialize(&self) -> std::result::Result<(), HookError> {
            if self.fail_init {
                return Err(format!("{} refused to start", self.name).into());
            }
            Ok(())
        }

        async fn dispose(&self) -> std::result::Result<(), HookError> {
            self.log.lock().push(self.name);
            Ok(())
        }
    }

    /// Register a `Tracked` under `name` with the given dependencies.
    fn tracked(
        container: &Container,
        name: &'static str,
        lifetime: Lifetime,
        deps: &[&'static str],
        log: &CallLog,
        fail_init: bool,
    ) {
        let log = Arc::clone(log);
        let mut builder = container
            .service::<Tracked>(lifetime)
            .named(name)
            .with_lifecycle();
        for dep in deps {
            builder = builder.depends_on_named::<Tracked>(*dep);
        }
        builder
            .factory(move |_| {
                Ok(Tracked {
                    name,
                    log: Arc::clone(&log),
                    fail_init,
                })
            })
            .unwrap();
    }

    struct Logger;

    struct Repository {
        logger: Arc<Logger>,
    }

    struct RequestHandler {
        repo: Arc<Repository>,
    }

    fn request_pipeline() -> Container {
        let container = Container::new();
        container.register_singleton(&[], |_| Ok(Logger)).unwrap();
        container
            .register_scoped(&[ServiceKey::of::<Logger>()], |deps| {
                Ok(Repository {
                    logger: deps.get()?,
                })
            })
            .unwrap();
        container
            .register_transient(&[ServiceKey::of::<Repository>()], |deps| {
                Ok(RequestHandler { repo: deps.get()? })
            })
            .unwrap();
        container
    }

    #[tokio::test]
    async fn test_singleton_identity_across_scopes() {
        let container = request_pipeline();
        let s1 = container.create_scope().unwrap();
        let s2 = container.create_scope().unwrap();

        let a = s1.resolve::<Logger>().await.unwrap();
        let b = s2.resolve::<Logger>().await.unwrap();
        let c = container.resolve::<Logger>().await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_scoped_identity() {
        let container = request_pipeline();
        let s1 = container.create_scope().unwrap();
        let s2 = container.create_scope().unwrap();

        let a = s1.resolve::<Repository>().await.unwrap();
        let b = s1.resolve::<Repository>().await.unwrap();
        let c = s2.resolve::<Repository>().await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_transient_instances_are_distinct() {
        let container = request_pipeline();
        let scope = container.create_scope().unwrap();

        let mut handlers = Vec::new();
        for _ in 0..5 {
            handlers.push(scope.resolve::<RequestHandler>().await.unwrap());
        }
        for (i, a) in handlers.iter().enumerate() {
            for b in &handlers[i + 1..] {
                assert!(!Arc::ptr_eq(a, b));
            }
        }
    }

    #[tokio::test]
    async fn test_request_scenario() {
        let container = request_pipeline();

        let s1 = container.create_scope().unwrap();
        let h1 = s1.resolve::<RequestHandler>().await.unwrap();
        let h2 = s1.resolve::<RequestHandler>().await.unwrap();
        assert!(!Arc::ptr_eq(&h1, &h2));
        assert!(Arc::ptr_eq(&h1.repo, &h2.repo));

        let s2 = container.create_scope().unwrap();
        let h3 = s2.resolve::<RequestHandler>().await.unwrap();
        assert!(!Arc::ptr_eq(&h1.repo, &h3.repo));
        assert!(Arc::ptr_eq(&h1.repo.logger, &h3.repo.logger));

        s1.close().await.unwrap();
        s2.close().await.unwrap();
        container.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cycle_is_reported_with_path() {
        #[derive(Debug)]
        struct A;
        struct B;

        let container = Container::new();
        container
            .register_transient::<A, _>(&[ServiceKey::of::<B>()], |_| Ok(A))
            .unwrap();
        container
            .register_transient::<B, _>(&[ServiceKey::of::<A>()], |_| Ok(B))
            .unwrap();

        let err = container.resolve::<A>().await.unwrap_err();
        match err {
            DiError::CircularDependency { path } => assert_eq!(
                path,
                vec![ServiceKey::of::<A>(), ServiceKey::of::<B>(), ServiceKey::of::<A>()]
            ),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_singleton_cycle_does_not_deadlock() {
        struct A;
        struct B;

        let container = Container::new();
        container
            .register_singleton::<A, _>(&[ServiceKey::of::<B>()], |_| Ok(A))
            .unwrap();
        container
            .register_singleton::<B, _>(&[ServiceKey::of::<A>()], |_| Ok(B))
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), container.resolve::<B>())
            .await
            .expect("resolution must not hang");
        assert!(matches!(result, Err(DiError::CircularDependency { ref path }) if path.len() == 3));
    }

    #[tokio::test]
    async fn test_captive_dependency_rejected_on_seal() {
        #[derive(Debug)]
        struct X;
        struct Y;

        let container = Container::new();
        container
            .register_singleton::<X, _>(&[ServiceKey::of::<Y>()], |_| Ok(X))
            .unwrap();
        container.register_scoped(&[], |_| Ok(Y)).unwrap();

        let err = container.seal().unwrap_err();
        assert!(matches!(
            err,
            DiError::CaptiveDependency { ref service, ref dependency, .. }
                if service.is::<X>() && dependency.is::<Y>()
        ));

        // First resolution reports the same thing
        let scope = container.create_scope().unwrap();
        let err = scope.resolve::<X>().await.unwrap_err();
        assert!(matches!(err, DiError::CaptiveDependency { .. }));
    }

    #[tokio::test]
    async fn test_captive_dependency_detected_lazily() {
        #[derive(Debug)]
        struct X;
        struct Y;

        let container =
            Container::with_options(ContainerOptions::new().captive_validation(CaptiveValidation::Lazy));
        container
            .register_singleton::<X, _>(&[ServiceKey::of::<Y>()], |_| Ok(X))
            .unwrap();
        container.register_scoped(&[], |_| Ok(Y)).unwrap();

        container.seal().unwrap();

        let scope = container.create_scope().unwrap();
        // Y alone is fine
        scope.resolve::<Y>().await.unwrap();

        let err = scope.resolve::<X>().await.unwrap_err();
        assert!(matches!(
            err,
            DiError::CaptiveDependency { ref service, ref dependency, .. }
                if service.is::<X>() && dependency.is::<Y>()
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_singleton_built_once() {
        struct Slow;

        #[async_trait]
        impl ServiceLifecycle for Slow {
            async fn initialize(&self) -> std::result::Result<(), HookError> {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            }
        }

        let calls = Arc::new(AtomicU32::new(0));
        let container = Container::new();
        {
            let calls = Arc::clone(&calls);
            container
                .service::<Slow>(Lifetime::Singleton)
                .with_lifecycle()
                .factory(move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Slow)
                })
                .unwrap();
        }

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let container = container.clone();
                tokio::spawn(async move { container.resolve::<Slow>().await })
            })
            .collect();

        let mut instances = Vec::new();
        for task in tasks {
            instances.push(task.await.unwrap().unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(instances.iter().all(|i| Arc::ptr_eq(i, &instances[0])));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unrelated_keys_build_concurrently() {
        struct Gate;
        struct Other;

        #[async_trait]
        impl ServiceLifecycle for Gate {
            async fn initialize(&self) -> std::result::Result<(), HookError> {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            }
        }

        let container = Container::new();
        container
            .service::<Gate>(Lifetime::Singleton)
            .with_lifecycle()
            .factory(|_| Ok(Gate))
            .unwrap();
        container.register_singleton(&[], |_| Ok(Other)).unwrap();

        let slow = {
            let container = container.clone();
            tokio::spawn(async move { container.resolve::<Gate>().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Not blocked behind Gate's initialize hook
        tokio::time::timeout(Duration::from_millis(250), container.resolve::<Other>())
            .await
            .expect("unrelated singleton must not wait")
            .unwrap();

        slow.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_disposes_in_reverse_creation_order() {
        let log: CallLog = Arc::default();
        let container = Container::new();
        tracked(&container, "A", Lifetime::Singleton, &[], &log, false);
        tracked(&container, "B", Lifetime::Singleton, &["A"], &log, false);

        container.resolve_named::<Tracked>("B").await.unwrap();
        container.shutdown().await.unwrap();

        assert_eq!(*log.lock(), vec!["B", "A"]);
    }

    #[tokio::test]
    async fn test_failed_initialize_rolls_back_chain() {
        let log: CallLog = Arc::default();
        let container = Container::new();
        tracked(&container, "A", Lifetime::Singleton, &[], &log, false);
        tracked(&container, "B", Lifetime::Scoped, &["A"], &log, false);
        tracked(&container, "C", Lifetime::Transient, &["B"], &log, true);

        let scope = container.create_scope().unwrap();
        let err = scope.resolve_named::<Tracked>("C").await.unwrap_err();

        assert!(matches!(err, DiError::Initialization { ref key, .. } if key.name() == Some("C")));
        // Dispose calls happened before the error reached us, newest first
        assert_eq!(*log.lock(), vec!["B", "A"]);
        // Nothing from the failed call stays cached
        assert_eq!(container.singleton_count(), 0);
        assert_eq!(scope.cached_count(), 0);

        // Closing later does not dispose them a second time
        scope.close().await.unwrap();
        container.shutdown().await.unwrap();
        assert_eq!(log.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_rollback_keeps_instances_from_earlier_calls() {
        let log: CallLog = Arc::default();
        let container = Container::new();
        tracked(&container, "A", Lifetime::Singleton, &[], &log, false);
        tracked(&container, "C", Lifetime::Transient, &["A"], &log, true);

        let a = container.resolve_named::<Tracked>("A").await.unwrap();
        container.resolve_named::<Tracked>("C").await.unwrap_err();

        assert!(log.lock().is_empty());
        let again = container.resolve_named::<Tracked>("A").await.unwrap();
        assert!(Arc::ptr_eq(&a, &again));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rollback_keeps_singleton_another_call_received() {
        struct Session {
            disposed: Arc<AtomicU32>,
        }

        #[async_trait]
        impl ServiceLifecycle for Session {
            async fn dispose(&self) -> std::result::Result<(), HookError> {
                self.disposed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        struct Upload;

        #[async_trait]
        impl ServiceLifecycle for Upload {
            async fn initialize(&self) -> std::result::Result<(), HookError> {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Err("quota exceeded".into())
            }
        }

        let built = Arc::new(AtomicU32::new(0));
        let disposed = Arc::new(AtomicU32::new(0));
        let container = Container::new();
        {
            let (built, disposed) = (Arc::clone(&built), Arc::clone(&disposed));
            container
                .service::<Session>(Lifetime::Singleton)
                .with_lifecycle()
                .factory(move |_| {
                    built.fetch_add(1, Ordering::SeqCst);
                    Ok(Session {
                        disposed: Arc::clone(&disposed),
                    })
                })
                .unwrap();
        }
        container
            .service::<Upload>(Lifetime::Transient)
            .depends_on::<Session>()
            .with_lifecycle()
            .factory(|_| Ok(Upload))
            .unwrap();

        let failing = {
            let container = container.clone();
            tokio::spawn(async move { container.resolve::<Upload>().await.map(|_| ()) })
        };
        // Session is built and cached; Upload is still initializing
        tokio::time::sleep(Duration::from_millis(30)).await;
        let held = container.resolve::<Session>().await.unwrap();

        let err = failing.await.unwrap().unwrap_err();
        assert!(matches!(err, DiError::Initialization { ref key, .. } if key.is::<Upload>()));

        // The failed call did not take back what we are holding
        assert_eq!(disposed.load(Ordering::SeqCst), 0);
        let again = container.resolve::<Session>().await.unwrap();
        assert!(Arc::ptr_eq(&held, &again));
        assert_eq!(built.load(Ordering::SeqCst), 1);

        container.shutdown().await.unwrap();
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_losing_callers_release_their_transients() {
        #[derive(Default)]
        struct Counts {
            initialized: AtomicU32,
            disposed: AtomicU32,
        }

        struct Connection(Arc<Counts>);

        #[async_trait]
        impl ServiceLifecycle for Connection {
            async fn initialize(&self) -> std::result::Result<(), HookError> {
                self.0.initialized.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }

            async fn dispose(&self) -> std::result::Result<(), HookError> {
                self.0.disposed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        struct Pool {
            _conn: Arc<Connection>,
        }

        #[async_trait]
        impl ServiceLifecycle for Pool {
            async fn initialize(&self) -> std::result::Result<(), HookError> {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            }
        }

        let counts = Arc::new(Counts::default());
        let container = Container::new();
        {
            let counts = Arc::clone(&counts);
            container
                .service::<Connection>(Lifetime::Transient)
                .with_lifecycle()
                .factory(move |_| Ok(Connection(Arc::clone(&counts))))
                .unwrap();
        }
        container
            .service::<Pool>(Lifetime::Singleton)
            .depends_on::<Connection>()
            .with_lifecycle()
            .factory(|deps| Ok(Pool { _conn: deps.get()? }))
            .unwrap();

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let container = container.clone();
                tokio::spawn(async move { container.resolve::<Pool>().await })
            })
            .collect();
        let mut pools = Vec::new();
        for task in tasks {
            pools.push(task.await.unwrap().unwrap());
        }
        assert!(pools.iter().all(|p| Arc::ptr_eq(p, &pools[0])));

        // Only the connection the pool holds is still open
        let live = counts.initialized.load(Ordering::SeqCst) - counts.disposed.load(Ordering::SeqCst);
        assert_eq!(live, 1);

        container.shutdown().await.unwrap();
        assert_eq!(
            counts.initialized.load(Ordering::SeqCst),
            counts.disposed.load(Ordering::SeqCst)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_scoped_built_once_per_scope() {
        struct Slow;

        #[async_trait]
        impl ServiceLifecycle for Slow {
            async fn initialize(&self) -> std::result::Result<(), HookError> {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            }
        }

        let calls = Arc::new(AtomicU32::new(0));
        let container = Container::new();
        {
            let calls = Arc::clone(&calls);
            container
                .service::<Slow>(Lifetime::Scoped)
                .with_lifecycle()
                .factory(move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Slow)
                })
                .unwrap();
        }

        let scope = container.create_scope().unwrap();
        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let scope = scope.clone();
                tokio::spawn(async move { scope.resolve::<Slow>().await })
            })
            .collect();
        let mut instances = Vec::new();
        for task in tasks {
            instances.push(task.await.unwrap().unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(instances.iter().all(|i| Arc::ptr_eq(i, &instances[0])));

        // A second scope gets its own
        let other = container.create_scope().unwrap();
        let theirs = other.resolve::<Slow>().await.unwrap();
        assert!(!Arc::ptr_eq(&theirs, &instances[0]));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_nested_scopes_are_isolated() {
        let container = request_pipeline();
        let outer = container.create_scope().unwrap();
        let inner = outer.create_scope().unwrap();

        let outer_repo = outer.resolve::<Repository>().await.unwrap();
        let inner_repo = inner.resolve::<Repository>().await.unwrap();
        assert!(!Arc::ptr_eq(&outer_repo, &inner_repo));
        assert!(Arc::ptr_eq(&inner_repo, &inner.resolve::<Repository>().await.unwrap()));

        // Singletons are shared all the way down
        assert!(Arc::ptr_eq(&outer_repo.logger, &inner_repo.logger));

        // Closing the inner scope leaves the outer one's instance in place
        inner.close().await.unwrap();
        assert!(Arc::ptr_eq(&outer_repo, &outer.resolve::<Repository>().await.unwrap()));
    }

    #[tokio::test]
    async fn test_scope_close_disposes_transients_it_owns() {
        let log: CallLog = Arc::default();
        let container = Container::new();
        tracked(&container, "S", Lifetime::Singleton, &[], &log, false);
        tracked(&container, "T", Lifetime::Transient, &["S"], &log, false);

        let scope = container.create_scope().unwrap();
        scope.resolve_named::<Tracked>("T").await.unwrap();
        scope.resolve_named::<Tracked>("T").await.unwrap();

        scope.close().await.unwrap();
        assert_eq!(*log.lock(), vec!["T", "T"]);

        container.shutdown().await.unwrap();
        assert_eq!(*log.lock(), vec!["T", "T", "S"]);
    }

    #[tokio::test]
    async fn test_disposal_failures_are_aggregated() {
        struct Flaky(&'static str);

        #[async_trait]
        impl ServiceLifecycle for Flaky {
            async fn dispose(&self) -> std::result::Result<(), HookError> {
                Err(format!("{} failed to flush", self.0).into())
            }
        }

        let log: CallLog = Arc::default();
        let container = Container::new();
        tracked(&container, "healthy", Lifetime::Singleton, &[], &log, false);
        for name in ["one", "two"] {
            container
                .service::<Flaky>(Lifetime::Singleton)
                .named(name)
                .with_lifecycle()
                .factory(move |_| Ok(Flaky(name)))
                .unwrap();
        }

        container.resolve_named::<Tracked>("healthy").await.unwrap();
        container.resolve_named::<Flaky>("one").await.unwrap();
        container.resolve_named::<Flaky>("two").await.unwrap();

        let err = container.shutdown().await.unwrap_err();
        match err {
            DiError::Disposal { failures } => {
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].key.name(), Some("two"));
                assert_eq!(failures[1].key.name(), Some("one"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // The healthy service was still disposed
        assert_eq!(*log.lock(), vec!["healthy"]);
    }

    #[tokio::test]
    async fn test_register_instance_substitutes_test_double() {
        trait Clock: Send + Sync {
            fn now(&self) -> u64;
        }
        struct SystemClock;
        impl Clock for SystemClock {
            fn now(&self) -> u64 {
                1
            }
        }
        struct FixedClock;
        impl Clock for FixedClock {
            fn now(&self) -> u64 {
                42
            }
        }

        let container = Container::new();
        container
            .register_singleton::<Box<dyn Clock>, _>(&[], |_| Ok(Box::new(SystemClock) as Box<dyn Clock>))
            .unwrap();
        container
            .register_instance::<Box<dyn Clock>>(Box::new(FixedClock) as Box<dyn Clock>)
            .unwrap();

        let clock = container.resolve::<Box<dyn Clock>>().await.unwrap();
        assert_eq!(clock.now(), 42);
    }

    #[tokio::test]
    async fn test_prebuilt_instances_are_not_disposed() {
        let log: CallLog = Arc::default();
        let container = Container::new();
        container
            .service::<Tracked>(Lifetime::Singleton)
            .instance(Tracked {
                name: "prebuilt",
                log: Arc::clone(&log),
                fail_init: false,
            })
            .unwrap();

        container.resolve::<Tracked>().await.unwrap();
        container.shutdown().await.unwrap();
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_diagnose_without_building() {
        struct A;
        struct B;

        let built = Arc::new(AtomicU32::new(0));
        let container = Container::new();
        {
            let built = Arc::clone(&built);
            container
                .register_transient::<A, _>(&[ServiceKey::of::<B>()], move |_| {
                    built.fetch_add(1, Ordering::SeqCst);
                    Ok(A)
                })
                .unwrap();
        }

        let problems = container.diagnose();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].is_unregistered());
        assert_eq!(built.load(Ordering::SeqCst), 0);
        assert!(!container.is_sealed());
    }

    #[cfg(feature = "derive")]
    #[tokio::test]
    async fn test_derived_service_declares_its_fields() {
        use crate::verified::ServiceProvider;

        #[derive(Service)]
        struct Handler {
            #[dep]
            repo: Arc<Repository>,
            #[dep]
            logger: Arc<Logger>,
            served: AtomicU32,
        }

        let container = request_pipeline();
        container.provide_transient::<Handler>().unwrap();

        let descriptor = container
            .descriptors()
            .into_iter()
            .find(|d| d.key().is::<Handler>())
            .unwrap();
        assert_eq!(
            descriptor.dependencies(),
            &[ServiceKey::of::<Repository>(), ServiceKey::of::<Logger>()]
        );

        let scope = container.create_scope().unwrap();
        let handler = scope.resolve::<Handler>().await.unwrap();
        assert!(Arc::ptr_eq(&handler.repo.logger, &handler.logger));
        assert_eq!(handler.served.load(Ordering::SeqCst), 0);
    }
}
