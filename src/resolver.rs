//! Dependency resolution
//!
//! Resolution walks a service's declared dependencies depth-first, left to
//! right, then builds the service itself. Every top-level call carries a
//! [`ResolutionContext`] that records:
//!
//! - the chain of keys currently being built, used to report cycles and
//!   singletons capturing scoped services;
//! - every instance this call created, so a failure anywhere can roll the
//!   whole call back.
//!
//! Cached lifetimes are built through per-key slots (see
//! [`InstanceCache`]). Dependencies are resolved *before* a slot is claimed,
//! so a task never holds one key's slot while waiting on another's.
//!
//! A cached instance only belongs to the call that built it until some other
//! call receives it. Rollback takes back what is still private to the failing
//! call and leaves shared instances cached and in their owner's ledger.

use crate::container::ContainerInner;
use crate::factory::{AnyService, Resolved};
use crate::lifecycle::{ManagedInstance, disposal_result};
use crate::registry::ServiceDescriptor;
use crate::scope::ScopeState;
use crate::storage::InstanceCache;
use crate::{DiError, Lifetime, Result, ServiceKey};
use futures::future::BoxFuture;
use std::sync::Arc;

#[cfg(feature = "logging")]
use tracing::{debug, trace, warn};

/// Where a freshly built instance was cached.
#[derive(Clone)]
enum Placement {
    Singleton,
    Scoped(Arc<ScopeState>),
    Uncached,
}

/// An instance created by the current call.
struct Created {
    key: ServiceKey,
    instance: AnyService,
    placement: Placement,
    /// Hooks and the ledger owner, for lifecycle-managed instances
    managed: Option<(Arc<ManagedInstance>, Arc<ScopeState>)>,
    /// How many entries directly before this one were created for it
    subtree: usize,
}

/// Per-call resolution state.
#[derive(Default)]
pub(crate) struct ResolutionContext {
    chain: Vec<(ServiceKey, Lifetime)>,
    created: Vec<Created>,
}

impl ResolutionContext {
    /// If `key` is already being built, the cycle from its first occurrence
    /// back to itself.
    fn cycle_path(&self, key: &ServiceKey) -> Option<Vec<ServiceKey>> {
        let start = self.chain.iter().position(|(k, _)| k == key)?;
        let mut path: Vec<ServiceKey> = self.chain[start..].iter().map(|(k, _)| k.clone()).collect();
        path.push(key.clone());
        Some(path)
    }

    /// If a singleton is being built somewhere up the chain, resolving the
    /// scoped `key` now would capture it.
    fn captive(&self, key: &ServiceKey) -> Option<DiError> {
        let owner = self
            .chain
            .iter()
            .rposition(|(_, lifetime)| lifetime.outlives(Lifetime::Scoped))?;
        let mut path: Vec<ServiceKey> = self.chain[owner..].iter().map(|(k, _)| k.clone()).collect();
        path.push(key.clone());
        Some(DiError::CaptiveDependency {
            service: self.chain[owner].0.clone(),
            dependency: key.clone(),
            path,
        })
    }

    fn built(&self, instance: &AnyService) -> bool {
        self.created.iter().any(|c| Arc::ptr_eq(&c.instance, instance))
    }

    /// The cached instance for `key`, if there is one this call may use.
    ///
    /// Instances built by another call are shared first, which pins them in
    /// the cache for good.
    fn reuse(&self, cache: &InstanceCache, key: &ServiceKey) -> Option<AnyService> {
        let slot = cache.filled(key)?;
        let instance = Arc::clone(slot.get()?);
        (self.built(&instance) || slot.share()).then_some(instance)
    }

    /// Pull out what was created after `start` only to feed an instance this
    /// call ended up not building.
    ///
    /// Cached entries stay, together with everything they consumed; uncached
    /// ones had no other consumer. The result is newest first.
    fn take_unused(&mut self, start: usize) -> Vec<Created> {
        let tail = self.created.split_off(start);
        let mut unused = Vec::new();
        let mut kept = Vec::new();
        let mut pinned = 0;
        for created in tail.into_iter().rev() {
            if pinned > 0 {
                pinned -= 1;
                kept.push(created);
            } else if matches!(created.placement, Placement::Uncached) {
                unused.push(created);
            } else {
                pinned = created.subtree;
                kept.push(created);
            }
        }
        self.created.extend(kept.into_iter().rev());
        unused
    }
}

/// Resolve `key` on behalf of `scope`.
///
/// Seals the registry on first use. On any failure, everything this call
/// created and no other call has received is disposed and evicted before the
/// error is returned.
pub(crate) async fn resolve(
    container: &ContainerInner,
    scope: &Arc<ScopeState>,
    key: &ServiceKey,
) -> Result<AnyService> {
    container.ensure_running()?;
    scope.ensure_open()?;
    container.seal()?;

    #[cfg(feature = "logging")]
    trace!(
        target: "di_runtime",
        service = %key,
        scope = %scope.id(),
        "Resolving service"
    );

    let mut ctx = ResolutionContext::default();
    match resolve_in(container, scope, key, &mut ctx).await {
        Ok(instance) => Ok(instance),
        Err(err) => {
            #[cfg(feature = "logging")]
            warn!(
                target: "di_runtime",
                service = %key,
                scope = %scope.id(),
                error = %err,
                "Resolution failed"
            );

            #[cfg(feature = "logging")]
            {
                if !ctx.created.is_empty() {
                    debug!(
                        target: "di_runtime",
                        count = ctx.created.len(),
                        "Rolling back partially resolved services"
                    );
                }
            }

            release(container, ctx.created.into_iter().rev()).await;
            Err(err)
        }
    }
}

fn resolve_in<'a>(
    container: &'a ContainerInner,
    scope: &'a Arc<ScopeState>,
    key: &'a ServiceKey,
    ctx: &'a mut ResolutionContext,
) -> BoxFuture<'a, Result<AnyService>> {
    Box::pin(async move {
        let descriptor = container.registry.lookup(key)?;

        if let Some(path) = ctx.cycle_path(key) {
            return Err(DiError::circular(path));
        }

        match descriptor.lifetime() {
            Lifetime::Singleton => {
                if let Some(instance) = ctx.reuse(&container.singletons, key) {
                    #[cfg(feature = "logging")]
                    trace!(target: "di_runtime", service = %key, "Singleton cache hit");
                    return Ok(instance);
                }
                // Singleton dependencies always come from the root, never from
                // the scope that happened to ask first.
                build(container, container.root(), key, &descriptor, Placement::Singleton, ctx).await
            }
            Lifetime::Scoped => {
                if let Some(err) = ctx.captive(key) {
                    return Err(err);
                }
                if let Some(instance) = ctx.reuse(&scope.cache, key) {
                    #[cfg(feature = "logging")]
                    trace!(
                        target: "di_runtime",
                        service = %key,
                        scope = %scope.id(),
                        "Scoped cache hit"
                    );
                    return Ok(instance);
                }
                let placement = Placement::Scoped(Arc::clone(scope));
                build(container, scope, key, &descriptor, placement, ctx).await
            }
            Lifetime::Transient => build(container, scope, key, &descriptor, Placement::Uncached, ctx).await,
        }
    })
}

async fn build(
    container: &ContainerInner,
    owner: &Arc<ScopeState>,
    key: &ServiceKey,
    descriptor: &ServiceDescriptor,
    placement: Placement,
    ctx: &mut ResolutionContext,
) -> Result<AnyService> {
    ctx.chain.push((key.clone(), descriptor.lifetime()));
    let result = build_in_chain(container, owner, key, descriptor, placement, ctx).await;
    ctx.chain.pop();
    result
}

async fn build_in_chain(
    container: &ContainerInner,
    owner: &Arc<ScopeState>,
    key: &ServiceKey,
    descriptor: &ServiceDescriptor,
    placement: Placement,
    ctx: &mut ResolutionContext,
) -> Result<AnyService> {
    let start = ctx.created.len();
    let mut instances = Vec::with_capacity(descriptor.dependencies().len());
    for dep in descriptor.dependencies() {
        instances.push(resolve_in(container, owner, dep, ctx).await?);
    }

    let cache = match &placement {
        Placement::Singleton => &container.singletons,
        Placement::Scoped(scope) => &scope.cache,
        Placement::Uncached => {
            return construct(owner, key, descriptor, &instances, placement.clone(), start, ctx).await;
        }
    };

    loop {
        // Concurrent callers for the same key wait here; only the first
        // runs the factory. A failed attempt leaves the slot empty.
        let slot = cache.slot(key);
        let (deps, placed, attempt) = (&instances, placement.clone(), &mut *ctx);
        let (instance, built) = slot
            .get_or_try_init(move || construct(owner, key, descriptor, deps, placed, start, attempt))
            .await?;

        if built {
            return Ok(instance);
        }
        if slot.share() {
            // Another call built it first; what this call resolved for it
            // has no consumer.
            let unused = ctx.take_unused(start);
            release(container, unused.into_iter()).await;
            return Ok(instance);
        }
        // The builder is rolling it back; start over on a fresh slot.
    }
}

/// Run the factory and, for lifecycle-aware services, the initialize hook.
async fn construct(
    owner: &Arc<ScopeState>,
    key: &ServiceKey,
    descriptor: &ServiceDescriptor,
    instances: &[AnyService],
    placement: Placement,
    start: usize,
    ctx: &mut ResolutionContext,
) -> Result<AnyService> {
    let deps = Resolved::new(descriptor.dependencies(), instances);
    let instance = descriptor.factory().create(&deps)?;

    #[cfg(feature = "logging")]
    debug!(
        target: "di_runtime",
        service = %key,
        lifetime = descriptor.lifetime().as_str(),
        owner = %owner.id(),
        "Constructed service"
    );

    let managed = match descriptor.hooks_for(&instance) {
        None => None,
        Some(hooks) => {
            let managed = Arc::new(ManagedInstance::new(key.clone(), hooks));
            managed.initialize().await?;

            owner.ledger.push(Arc::clone(&managed));
            // The owner may have been closed while we were initializing. If
            // the close pass did not pick this entry up, release it here.
            if owner.is_closed() && owner.ledger.remove(&managed) {
                let failures = managed.dispose().await.err().into_iter().collect();
                let _ = disposal_result(failures);
                return Err(owner.closed_error());
            }

            Some((managed, Arc::clone(owner)))
        }
    };

    let subtree = ctx.created.len() - start;
    ctx.created.push(Created {
        key: key.clone(),
        instance: Arc::clone(&instance),
        placement,
        managed,
        subtree,
    });

    Ok(instance)
}

/// Take back and dispose `created`, newest first.
///
/// Cached instances another call has received are skipped along with
/// everything built for them; they stay cached and their owner disposes them
/// later.
async fn release(container: &ContainerInner, created: impl Iterator<Item = Created>) {
    let mut failures = Vec::new();
    let mut pinned = 0;
    for created in created {
        if pinned > 0 {
            pinned -= 1;
            continue;
        }

        let retracted = match &created.placement {
            Placement::Singleton => container.singletons.retract(&created.key, &created.instance),
            Placement::Scoped(scope) => scope.cache.retract(&created.key, &created.instance),
            Placement::Uncached => true,
        };
        if !retracted {
            pinned = created.subtree;
            continue;
        }

        if let Some((managed, owner)) = created.managed {
            // Absent if the owner was closed meanwhile; its close pass
            // already disposed the instance.
            if owner.ledger.remove(&managed) {
                if let Err(failure) = managed.dispose().await {
                    failures.push(failure);
                }
            }
        }
    }

    // Release failures are logged; the caller sees the original outcome.
    let _ = disposal_result(failures);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct A;
    struct B;
    struct S;

    #[test]
    fn test_cycle_path_starts_at_first_occurrence() {
        let ctx = ResolutionContext {
            chain: vec![
                (ServiceKey::of::<S>(), Lifetime::Transient),
                (ServiceKey::of::<A>(), Lifetime::Transient),
                (ServiceKey::of::<B>(), Lifetime::Transient),
            ],
            created: Vec::new(),
        };

        let path = ctx.cycle_path(&ServiceKey::of::<A>()).unwrap();
        assert_eq!(
            path,
            vec![
                ServiceKey::of::<A>(),
                ServiceKey::of::<B>(),
                ServiceKey::of::<A>()
            ]
        );
        assert!(ctx.cycle_path(&ServiceKey::of::<u8>()).is_none());
    }

    #[test]
    fn test_captive_names_nearest_singleton() {
        let ctx = ResolutionContext {
            chain: vec![
                (ServiceKey::of::<A>(), Lifetime::Scoped),
                (ServiceKey::of::<S>(), Lifetime::Singleton),
                (ServiceKey::of::<B>(), Lifetime::Transient),
            ],
            created: Vec::new(),
        };

        match ctx.captive(&ServiceKey::of::<u8>()) {
            Some(DiError::CaptiveDependency {
                service,
                dependency,
                path,
            }) => {
                assert_eq!(service, ServiceKey::of::<S>());
                assert_eq!(dependency, ServiceKey::of::<u8>());
                assert_eq!(path.len(), 3);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    fn entry(id: u32, placement: Placement, subtree: usize) -> Created {
        Created {
            key: ServiceKey::of::<u32>(),
            instance: Arc::new(id),
            placement,
            managed: None,
            subtree,
        }
    }

    fn ids(entries: &[Created]) -> Vec<u32> {
        entries
            .iter()
            .map(|c| *c.instance.downcast_ref::<u32>().unwrap())
            .collect()
    }

    #[test]
    fn test_take_unused_keeps_cached_subtrees() {
        // 1 feeds singleton 2; 4 feeds transient 5; 3 and 5 fed the
        // instance that was never built
        let mut ctx = ResolutionContext {
            chain: Vec::new(),
            created: vec![
                entry(0, Placement::Uncached, 0),
                entry(1, Placement::Uncached, 0),
                entry(2, Placement::Singleton, 1),
                entry(3, Placement::Uncached, 0),
                entry(4, Placement::Uncached, 0),
                entry(5, Placement::Uncached, 1),
            ],
        };

        let unused = ctx.take_unused(1);
        assert_eq!(ids(&unused), vec![5, 4, 3]);
        assert_eq!(ids(&ctx.created), vec![0, 1, 2]);
    }

    #[test]
    fn test_take_unused_nothing_after_start() {
        let mut ctx = ResolutionContext {
            chain: Vec::new(),
            created: vec![entry(0, Placement::Uncached, 0)],
        };
        assert!(ctx.take_unused(1).is_empty());
        assert_eq!(ids(&ctx.created), vec![0]);
    }

    #[test]
    fn test_no_captive_without_singleton() {
        let ctx = ResolutionContext {
            chain: vec![(ServiceKey::of::<A>(), Lifetime::Scoped)],
            created: Vec::new(),
        };
        assert!(ctx.captive(&ServiceKey::of::<B>()).is_none());
    }
}
