#![no_main]

//! Fuzz target for lifecycle hooks and scope teardown
//!
//! Whatever mix of scopes, failing hooks and failing factories the input
//! produces, every instance whose initialize hook succeeded must see exactly
//! one dispose call by the time the container has shut down.

use arbitrary::Arbitrary;
use async_trait::async_trait;
use di_runtime::{Container, DiError, HookError, Lifetime, Scope, ServiceLifecycle};
use libfuzzer_sys::fuzz_target;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Default)]
struct Counters {
    initialized: AtomicU32,
    disposed: AtomicU32,
}

struct Managed {
    counters: Arc<Counters>,
    fail_init: bool,
    fail_dispose: bool,
}

#[async_trait]
impl ServiceLifecycle for Managed {
    async fn initialize(&self) -> Result<(), HookError> {
        tokio::task::yield_now().await;
        if self.fail_init {
            return Err("initialize refused".into());
        }
        self.counters.initialized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn dispose(&self) -> Result<(), HookError> {
        self.counters.disposed.fetch_add(1, Ordering::SeqCst);
        if self.fail_dispose {
            return Err("dispose refused".into());
        }
        Ok(())
    }
}

#[derive(Debug, Arbitrary)]
struct NodeSpec {
    lifetime: u8,
    /// Index of an earlier node to depend on, if any
    dep: Option<u8>,
    fail_factory: bool,
    fail_init: bool,
    fail_dispose: bool,
}

#[derive(Debug, Arbitrary)]
enum LifecycleOp {
    Resolve { node: u8, scope: Option<u8> },
    OpenScope { parent: Option<u8> },
    CloseScope(u8),
    WithScope(u8),
}

#[derive(Debug, Arbitrary)]
struct Input {
    nodes: Vec<NodeSpec>,
    ops: Vec<LifecycleOp>,
}

const NAMES: [&str; 6] = ["a", "b", "c", "d", "e", "f"];

fn lifetime(raw: u8) -> Lifetime {
    match raw % 3 {
        0 => Lifetime::Singleton,
        1 => Lifetime::Scoped,
        _ => Lifetime::Transient,
    }
}

fn register(container: &Container, counters: &Arc<Counters>, nodes: &[NodeSpec]) {
    for (i, node) in nodes.iter().take(NAMES.len()).enumerate() {
        let mut builder = container
            .service::<Managed>(lifetime(node.lifetime))
            .named(NAMES[i])
            .with_lifecycle();
        // Only backwards edges, so the graph stays acyclic
        if let Some(dep) = node.dep.filter(|_| i > 0) {
            builder = builder.depends_on_named::<Managed>(NAMES[dep as usize % i]);
        }

        let counters = Arc::clone(counters);
        let (fail_factory, fail_init, fail_dispose) =
            (node.fail_factory, node.fail_init, node.fail_dispose);
        builder
            .factory(move |_| {
                if fail_factory {
                    return Err(DiError::creation_failed::<Managed>("factory refused"));
                }
                Ok(Managed {
                    counters: Arc::clone(&counters),
                    fail_init,
                    fail_dispose,
                })
            })
            .unwrap();
    }
}

fuzz_target!(|input: Input| {
    let Ok(rt) = tokio::runtime::Builder::new_current_thread().build() else {
        return;
    };

    rt.block_on(async {
        let counters = Arc::new(Counters::default());
        let container = Container::new();
        register(&container, &counters, &input.nodes);
        let registered = input.nodes.len().min(NAMES.len());

        // A singleton capturing a scoped service is rejected up front
        if container.seal().is_err() {
            return;
        }

        let mut scopes: Vec<Scope> = Vec::new();

        for op in input.ops.iter().take(64) {
            match op {
                LifecycleOp::Resolve { node, scope } => {
                    if registered == 0 {
                        continue;
                    }
                    let name = NAMES[*node as usize % registered];
                    let target = scope.and_then(|s| scopes.get(s as usize % scopes.len().max(1)));
                    let result = match target {
                        Some(scope) => scope.resolve_named::<Managed>(name).await,
                        None => container.resolve_named::<Managed>(name).await,
                    };
                    if let Err(err) = result {
                        assert!(
                            matches!(
                                err,
                                DiError::CreationFailed { .. }
                                    | DiError::Initialization { .. }
                                    | DiError::ScopeClosed { .. }
                            ),
                            "{err}"
                        );
                    }
                }
                LifecycleOp::OpenScope { parent } => {
                    if scopes.len() >= 8 {
                        continue;
                    }
                    let parent = parent.and_then(|p| scopes.get(p as usize % scopes.len().max(1)));
                    let opened = match parent {
                        Some(parent) => parent.create_scope(),
                        None => container.create_scope(),
                    };
                    match opened {
                        Ok(scope) => scopes.push(scope),
                        Err(err) => assert!(matches!(err, DiError::ScopeClosed { .. })),
                    }
                }
                LifecycleOp::CloseScope(index) => {
                    if scopes.is_empty() {
                        continue;
                    }
                    let scope = &scopes[*index as usize % scopes.len()];
                    // Dispose failures are reported but never stop the pass
                    if let Err(err) = scope.close().await {
                        assert!(matches!(err, DiError::Disposal { .. }));
                    }
                    assert!(scope.is_closed());
                }
                LifecycleOp::WithScope(node) => {
                    if registered == 0 {
                        continue;
                    }
                    let name = NAMES[*node as usize % registered];
                    let _ = container
                        .with_scope(|scope| async move { scope.resolve_named::<Managed>(name).await })
                        .await;
                }
            }
        }

        let _ = container.shutdown().await;

        assert_eq!(
            counters.initialized.load(Ordering::SeqCst),
            counters.disposed.load(Ordering::SeqCst)
        );
    });
});
