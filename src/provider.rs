//! Provider traits and service identity
//!
//! These types define what can be injected, how a service is identified and
//! how long a constructed instance is reused.

use std::any::TypeId;
use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Marker trait for types that can be injected via the DI container.
///
/// This is automatically implemented for all types that are `Send + Sync + 'static`.
/// You never need to implement this manually.
///
/// # Examples
///
/// ```rust
/// // Any type that is Send + Sync + 'static works automatically
/// struct MyService {
///     name: String,
/// }
///
/// // No impl needed - it just works!
/// ```
pub trait Injectable: Send + Sync + 'static {}

// Blanket implementation - everything that's Send + Sync + 'static is Injectable
impl<T: Send + Sync + 'static> Injectable for T {}

/// Stable identifier of a registered service.
///
/// A key is the service's type identity plus an optional name, so several
/// registrations of the same type can coexist (`Database#primary`,
/// `Database#replica`). Equality and hashing only consider the type id and
/// the name; the type name is carried for diagnostics.
///
/// # Examples
///
/// ```rust
/// use di_runtime::ServiceKey;
///
/// struct Database;
///
/// let key = ServiceKey::of::<Database>();
/// let primary = ServiceKey::named::<Database>("primary");
///
/// assert_ne!(key, primary);
/// assert_eq!(primary, ServiceKey::named::<Database>("primary"));
/// assert!(primary.to_string().ends_with("Database#primary"));
/// ```
#[derive(Clone)]
pub struct ServiceKey {
    type_id: TypeId,
    type_name: &'static str,
    name: Option<Cow<'static, str>>,
}

impl ServiceKey {
    /// Key for the unnamed registration of `T`.
    #[inline]
    pub fn of<T: Injectable>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            name: None,
        }
    }

    /// Key for a named registration of `T`.
    #[inline]
    pub fn named<T: Injectable>(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            name: Some(name.into()),
        }
    }

    /// Same type identity, different (or no) name.
    pub fn with_name(&self, name: Option<Cow<'static, str>>) -> Self {
        Self {
            type_id: self.type_id,
            type_name: self.type_name,
            name,
        }
    }

    /// The `TypeId` of the service type.
    #[inline]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// The service type name.
    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// The registration name, if any.
    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether this key refers to a named registration.
    #[inline]
    pub fn is_named(&self) -> bool {
        self.name.is_some()
    }

    /// Whether this key identifies a service of type `T`.
    #[inline]
    pub fn is<T: Injectable>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }
}

impl PartialEq for ServiceKey {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.name == other.name
    }
}

impl Eq for ServiceKey {}

impl Hash for ServiceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        self.name.hash(state);
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}#{}", self.type_name, name),
            None => f.write_str(self.type_name),
        }
    }
}

impl fmt::Debug for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceKey({self})")
    }
}

/// How long a constructed instance lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Lifetime {
    /// One instance per container, created on first resolve and shared by
    /// every scope
    #[default]
    Singleton,

    /// One instance per scope
    Scoped,

    /// New instance created on every resolve
    Transient,
}

impl Lifetime {
    /// Whether an instance of this lifetime lives strictly longer than one
    /// of `other`.
    #[inline]
    pub fn outlives(&self, other: Lifetime) -> bool {
        self.rank() > other.rank()
    }

    fn rank(&self) -> u8 {
        match self {
            Lifetime::Singleton => 2,
            Lifetime::Scoped => 1,
            Lifetime::Transient => 0,
        }
    }

    /// Lowercase name used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifetime::Singleton => "singleton",
            Lifetime::Scoped => "scoped",
            Lifetime::Transient => "transient",
        }
    }
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
