#![no_main]

//! Fuzz target for registry and resolution
//!
//! Builds arbitrary dependency graphs over a handful of named keys and checks
//! that sealing, diagnosis and resolution agree with each other.

use arbitrary::Arbitrary;
use di_runtime::{Container, DiError, Lifetime, Scope};
use libfuzzer_sys::fuzz_target;
use std::sync::Arc;

const NODES: u8 = 8;

const NAMES: [&str; NODES as usize] = ["n0", "n1", "n2", "n3", "n4", "n5", "n6", "n7"];

struct Node;

#[derive(Debug, Arbitrary)]
enum FuzzLifetime {
    Singleton,
    Scoped,
    Transient,
}

impl From<&FuzzLifetime> for Lifetime {
    fn from(value: &FuzzLifetime) -> Self {
        match value {
            FuzzLifetime::Singleton => Lifetime::Singleton,
            FuzzLifetime::Scoped => Lifetime::Scoped,
            FuzzLifetime::Transient => Lifetime::Transient,
        }
    }
}

#[derive(Debug, Arbitrary)]
enum ContainerOp {
    Register {
        node: u8,
        lifetime: FuzzLifetime,
        deps: Vec<u8>,
        allow_override: bool,
    },
    Seal,
    Diagnose,
    ResolveRoot(u8),
    ResolveInScope(u8),
    OpenScope,
    CloseScope,
    Contains(u8),
}

fn name(node: u8) -> &'static str {
    NAMES[(node % NODES) as usize]
}

/// Errors a resolution may legitimately produce for a wiring mistake.
fn is_wiring_error(err: &DiError) -> bool {
    matches!(
        err,
        DiError::UnregisteredService { .. }
            | DiError::CircularDependency { .. }
            | DiError::CaptiveDependency { .. }
    )
}

fuzz_target!(|ops: Vec<ContainerOp>| {
    let Ok(rt) = tokio::runtime::Builder::new_current_thread().build() else {
        return;
    };

    rt.block_on(async {
        let container = Container::new();
        let mut scopes: Vec<Scope> = Vec::new();

        for op in &ops {
            match op {
                ContainerOp::Register {
                    node,
                    lifetime,
                    deps,
                    allow_override,
                } => {
                    let mut builder = container.service::<Node>(lifetime.into()).named(name(*node));
                    for dep in deps.iter().take(4) {
                        builder = builder.depends_on_named::<Node>(name(*dep));
                    }
                    if *allow_override {
                        builder = builder.allow_override();
                    }
                    let sealed = container.is_sealed();
                    match builder.factory(|_| Ok(Node)) {
                        Ok(()) => assert!(!sealed),
                        Err(DiError::RegistryClosed { .. }) => assert!(sealed),
                        Err(DiError::DuplicateRegistration { .. }) => assert!(!allow_override),
                        Err(other) => panic!("unexpected registration error: {other}"),
                    }
                }
                ContainerOp::Seal => {
                    let before = container.diagnose();
                    match container.seal() {
                        Ok(()) => assert!(container.is_sealed()),
                        Err(err) => {
                            assert!(matches!(err, DiError::CaptiveDependency { .. }));
                            assert!(!container.is_sealed());
                            assert!(
                                before
                                    .iter()
                                    .any(|e| matches!(e, DiError::CaptiveDependency { .. }))
                            );
                        }
                    }
                }
                ContainerOp::Diagnose => {
                    for problem in container.diagnose() {
                        assert!(is_wiring_error(&problem));
                        if let DiError::CircularDependency { path } = problem {
                            assert!(path.len() >= 2);
                            assert_eq!(path.first(), path.last());
                        }
                    }
                }
                ContainerOp::ResolveRoot(node) => {
                    match container.resolve_named::<Node>(name(*node)).await {
                        Ok(first) => {
                            let key = di_runtime::ServiceKey::named::<Node>(name(*node));
                            let singleton = container
                                .descriptors()
                                .iter()
                                .any(|d| d.key() == &key && d.lifetime() == Lifetime::Singleton);
                            if singleton {
                                let second = container.resolve_named::<Node>(name(*node)).await;
                                assert!(second.is_ok_and(|s| Arc::ptr_eq(&first, &s)));
                            }
                        }
                        Err(err) => assert!(is_wiring_error(&err), "{err}"),
                    }
                }
                ContainerOp::ResolveInScope(node) => {
                    let Some(scope) = scopes.last() else {
                        continue;
                    };
                    if let Err(err) = scope.resolve_named::<Node>(name(*node)).await {
                        assert!(is_wiring_error(&err), "{err}");
                    }
                }
                ContainerOp::OpenScope => {
                    if scopes.len() < 8 {
                        match scopes.last() {
                            Some(parent) => scopes.push(parent.create_scope().unwrap()),
                            None => scopes.push(container.create_scope().unwrap()),
                        }
                    }
                }
                ContainerOp::CloseScope => {
                    if let Some(scope) = scopes.pop() {
                        scope.close().await.unwrap();
                        assert!(scope.is_closed());
                        assert!(matches!(
                            scope.resolve_named::<Node>("n0").await,
                            Err(DiError::ScopeClosed { .. })
                        ));
                    }
                }
                ContainerOp::Contains(node) => {
                    let _ = container.contains_named::<Node>(name(*node));
                }
            }
        }

        container.shutdown().await.unwrap();
        assert!(matches!(
            container.resolve_named::<Node>("n0").await,
            Err(DiError::ShutDown)
        ));
    });
});
