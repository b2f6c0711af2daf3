//! Service descriptor registry
//!
//! Holds the mapping from [`ServiceKey`] to [`ServiceDescriptor`]. The
//! registry is mutable during composition and frozen by [`Registry::seal`];
//! after sealing, lookups read an immutable map without taking any lock.

use crate::factory::{AnyFactory, AnyService, Resolved};
use crate::lifecycle::{LifecycleAdapter, ServiceLifecycle};
use crate::{DiError, Injectable, Lifetime, Result, ServiceKey};
use ahash::RandomState;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[cfg(feature = "logging")]
use tracing::debug;

/// How a service is built and how long it lives.
///
/// Dependencies are an explicit, ordered key list declared at registration
/// time; they are resolved depth-first, left to right, and handed to the
/// factory in that order. A dependency does not need to be registered yet
/// when the descriptor is created.
pub struct ServiceDescriptor {
    key: ServiceKey,
    lifetime: Lifetime,
    dependencies: Vec<ServiceKey>,
    factory: AnyFactory,
    lifecycle: Option<LifecycleAdapter>,
}

impl ServiceDescriptor {
    /// Describe a service built by `factory` from `dependencies`.
    pub fn new<T, F>(key: ServiceKey, lifetime: Lifetime, dependencies: Vec<ServiceKey>, factory: F) -> Self
    where
        T: Injectable,
        F: Fn(&Resolved<'_>) -> Result<T> + Send + Sync + 'static,
    {
        Self {
            key,
            lifetime,
            dependencies,
            factory: AnyFactory::constructor(factory),
            lifecycle: None,
        }
    }

    /// Describe a pre-built singleton.
    ///
    /// The container hands the value out as-is and never runs lifecycle hooks
    /// on it: whoever built it keeps responsibility for tearing it down.
    pub fn instance<T: Injectable>(key: ServiceKey, value: Arc<T>) -> Self {
        Self {
            key,
            lifetime: Lifetime::Singleton,
            dependencies: Vec::new(),
            factory: AnyFactory::from_arc(value),
            lifecycle: None,
        }
    }

    /// Run `T`'s [`ServiceLifecycle`] hooks on instances of this service.
    pub fn with_lifecycle<T: Injectable + ServiceLifecycle>(mut self) -> Self {
        if !self.factory.is_prebuilt() {
            self.lifecycle = Some(crate::lifecycle::adapter::<T>());
        }
        self
    }

    pub(crate) fn with_adapter(mut self, adapter: Option<LifecycleAdapter>) -> Self {
        if !self.factory.is_prebuilt() {
            self.lifecycle = adapter;
        }
        self
    }

    /// The key this descriptor is registered under.
    #[inline]
    pub fn key(&self) -> &ServiceKey {
        &self.key
    }

    /// The service lifetime.
    #[inline]
    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    /// Declared dependencies, in resolution order.
    #[inline]
    pub fn dependencies(&self) -> &[ServiceKey] {
        &self.dependencies
    }

    /// Whether the container runs initialize/dispose hooks for this service.
    #[inline]
    pub fn is_lifecycle_capable(&self) -> bool {
        self.lifecycle.is_some()
    }

    /// Whether this descriptor wraps a pre-built instance.
    #[inline]
    pub fn is_prebuilt(&self) -> bool {
        self.factory.is_prebuilt()
    }

    #[inline]
    pub(crate) fn factory(&self) -> &AnyFactory {
        &self.factory
    }

    /// The lifecycle hooks of a freshly built instance, if this service has any.
    pub(crate) fn hooks_for(&self, instance: &AnyService) -> Option<Arc<dyn ServiceLifecycle>> {
        self.lifecycle.as_ref().and_then(|adapt| adapt(instance))
    }
}

impl std::fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("key", &self.key)
            .field("lifetime", &self.lifetime)
            .field("dependencies", &self.dependencies)
            .field("lifecycle", &self.is_lifecycle_capable())
            .field("prebuilt", &self.is_prebuilt())
            .finish()
    }
}

/// When captive dependencies are detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptiveValidation {
    /// Walk the whole graph when the registry is sealed
    #[default]
    Eager,
    /// Only fail when a singleton actually reaches a scoped service while
    /// being resolved
    Lazy,
}

type DescriptorMap = HashMap<ServiceKey, Arc<ServiceDescriptor>, RandomState>;

/// Registrations collected during composition.
#[derive(Default)]
struct Pending {
    map: DescriptorMap,
    /// Registration order, for deterministic validation and listing
    order: Vec<ServiceKey>,
}

/// Immutable snapshot taken at sealing time.
struct Frozen {
    map: DescriptorMap,
    order: Vec<ServiceKey>,
}

/// Thread-safe descriptor registry.
pub(crate) struct Registry {
    pending: Mutex<Pending>,
    frozen: OnceCell<Frozen>,
}

impl Registry {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(Pending {
                map: HashMap::with_capacity_and_hasher(capacity, RandomState::new()),
                order: Vec::with_capacity(capacity),
            }),
            frozen: OnceCell::new(),
        }
    }

    /// Insert a descriptor.
    ///
    /// Fails with `DuplicateRegistration` if the key exists and
    /// `allow_override` is false, and with `RegistryClosed` after sealing.
    /// Never touches instance caches.
    pub fn register(&self, descriptor: ServiceDescriptor, allow_override: bool) -> Result<()> {
        let mut pending = self.pending.lock();

        if self.frozen.get().is_some() {
            return Err(DiError::RegistryClosed {
                key: descriptor.key.clone(),
            });
        }

        let key = descriptor.key.clone();
        let exists = pending.map.contains_key(&key);
        if exists && !allow_override {
            return Err(DiError::DuplicateRegistration { key });
        }

        #[cfg(feature = "logging")]
        debug!(
            target: "di_runtime",
            service = %key,
            lifetime = descriptor.lifetime.as_str(),
            dependencies = descriptor.dependencies.len(),
            lifecycle = descriptor.is_lifecycle_capable(),
            overridden = exists,
            "Registering service"
        );

        if !exists {
            pending.order.push(key.clone());
        }
        pending.map.insert(key, Arc::new(descriptor));
        Ok(())
    }

    /// Look up a descriptor.
    ///
    /// Lock-free once sealed.
    #[inline]
    pub fn lookup(&self, key: &ServiceKey) -> Result<Arc<ServiceDescriptor>> {
        let found = match self.frozen.get() {
            Some(frozen) => frozen.map.get(key).cloned(),
            None => self.pending.lock().map.get(key).cloned(),
        };
        found.ok_or_else(|| DiError::UnregisteredService { key: key.clone() })
    }

    #[inline]
    pub fn contains(&self, key: &ServiceKey) -> bool {
        match self.frozen.get() {
            Some(frozen) => frozen.map.contains_key(key),
            None => self.pending.lock().map.contains_key(key),
        }
    }

    #[inline]
    pub fn is_sealed(&self) -> bool {
        self.frozen.get().is_some()
    }

    /// Freeze the registry.
    ///
    /// With [`CaptiveValidation::Eager`] the dependency graph is checked
    /// first; on failure the registry stays open so the caller sees the same
    /// error on every attempt. Sealing an already sealed registry is a no-op.
    pub fn seal(&self, validation: CaptiveValidation) -> Result<()> {
        if self.frozen.get().is_some() {
            return Ok(());
        }

        let pending = self.pending.lock();
        if self.frozen.get().is_some() {
            return Ok(());
        }

        if validation == CaptiveValidation::Eager {
            find_captive(&pending.map, &pending.order)?;
        }

        let frozen = Frozen {
            map: pending.map.clone(),
            order: pending.order.clone(),
        };
        let count = frozen.order.len();
        // The pending lock is held, so nobody else can be filling the cell.
        let _ = self.frozen.set(frozen);

        #[cfg(feature = "logging")]
        debug!(
            target: "di_runtime",
            service_count = count,
            validation = ?validation,
            "Registry sealed - no further registrations allowed"
        );
        #[cfg(not(feature = "logging"))]
        let _ = count;

        Ok(())
    }

    /// All descriptors in registration order.
    pub fn descriptors(&self) -> Vec<Arc<ServiceDescriptor>> {
        match self.frozen.get() {
            Some(frozen) => collect_ordered(&frozen.map, &frozen.order),
            None => {
                let pending = self.pending.lock();
                collect_ordered(&pending.map, &pending.order)
            }
        }
    }

    /// Registered keys in registration order.
    pub fn keys(&self) -> Vec<ServiceKey> {
        match self.frozen.get() {
            Some(frozen) => frozen.order.clone(),
            None => self.pending.lock().order.clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self.frozen.get() {
            Some(frozen) => frozen.order.len(),
            None => self.pending.lock().order.len(),
        }
    }

    /// Statically check the dependency graph without building anything.
    ///
    /// Reports, in registration order, every dependency that is not
    /// registered, every cycle, and the first captive dependency.
    pub fn diagnose(&self) -> Vec<DiError> {
        let descriptors = self.descriptors();
        let map: DescriptorMap = descriptors
            .iter()
            .map(|d| (d.key.clone(), Arc::clone(d)))
            .collect();
        let order: Vec<ServiceKey> = descriptors.iter().map(|d| d.key.clone()).collect();

        let mut problems = Vec::new();

        for descriptor in &descriptors {
            for dep in &descriptor.dependencies {
                if !map.contains_key(dep) {
                    problems.push(DiError::UnregisteredService { key: dep.clone() });
                }
            }
        }

        problems.extend(find_cycles(&map, &order));

        if let Err(captive) = find_captive(&map, &order) {
            problems.push(captive);
        }

        problems
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("count", &self.len())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

fn collect_ordered(map: &DescriptorMap, order: &[ServiceKey]) -> Vec<Arc<ServiceDescriptor>> {
    order.iter().filter_map(|key| map.get(key).cloned()).collect()
}

/// Find a singleton that reaches a scoped service through singleton-free
/// paths (directly or via transients).
///
/// Singleton dependencies are not followed: each singleton is checked on its
/// own, so the reported pair is always the innermost offender. Unregistered
/// keys are skipped; they fail at resolution time.
fn find_captive(map: &DescriptorMap, order: &[ServiceKey]) -> Result<()> {
    for key in order {
        let Some(descriptor) = map.get(key) else { continue };
        if !descriptor.lifetime.outlives(Lifetime::Scoped) {
            continue;
        }

        let mut visited = HashSet::new();
        let mut path = vec![key.clone()];
        if let Some(scoped) = walk_captive(map, &descriptor.dependencies, &mut visited, &mut path) {
            return Err(DiError::CaptiveDependency {
                service: key.clone(),
                dependency: scoped,
                path,
            });
        }
    }
    Ok(())
}

fn walk_captive(
    map: &DescriptorMap,
    dependencies: &[ServiceKey],
    visited: &mut HashSet<ServiceKey>,
    path: &mut Vec<ServiceKey>,
) -> Option<ServiceKey> {
    for dep in dependencies {
        if !visited.insert(dep.clone()) {
            continue;
        }
        let Some(descriptor) = map.get(dep) else { continue };

        path.push(dep.clone());
        match descriptor.lifetime {
            Lifetime::Scoped => return Some(dep.clone()),
            Lifetime::Transient => {
                if let Some(scoped) = walk_captive(map, &descriptor.dependencies, visited, path) {
                    return Some(scoped);
                }
            }
            Lifetime::Singleton => {}
        }
        path.pop();
    }
    None
}

/// Depth-first cycle search over the declared graph.
///
/// Each cycle is reported once, as the path from its first key back to
/// itself (`[A, B, A]`).
fn find_cycles(map: &DescriptorMap, order: &[ServiceKey]) -> Vec<DiError> {
    let mut done = HashSet::new();
    let mut cycles = Vec::new();

    for key in order {
        let mut stack = Vec::new();
        visit(map, key, &mut done, &mut stack, &mut cycles);
    }

    cycles
}

fn visit(
    map: &DescriptorMap,
    key: &ServiceKey,
    done: &mut HashSet<ServiceKey>,
    stack: &mut Vec<ServiceKey>,
    cycles: &mut Vec<DiError>,
) {
    if done.contains(key) {
        return;
    }
    if let Some(pos) = stack.iter().position(|k| k == key) {
        let mut path = stack[pos..].to_vec();
        path.push(key.clone());
        cycles.push(DiError::circular(path));
        return;
    }
    let Some(descriptor) = map.get(key) else { return };

    stack.push(key.clone());
    for dep in &descriptor.dependencies {
        visit(map, dep, done, stack, cycles);
    }
    stack.pop();
    done.insert(key.clone());
}
