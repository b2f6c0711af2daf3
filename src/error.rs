//! Error types for dependency injection

use crate::{Injectable, ScopeId, ServiceKey};
use std::fmt;
use thiserror::Error;

/// Error type returned by lifecycle hooks and fallible factories.
pub type HookError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur during dependency injection operations
#[derive(Error, Debug, Clone)]
pub enum DiError {
    /// Service was not registered in the container
    #[error("Service not registered: {key}")]
    UnregisteredService { key: ServiceKey },

    /// Attempted to register a key twice without requesting an override
    #[error("Service already registered: {key}")]
    DuplicateRegistration { key: ServiceKey },

    /// Registration attempted after the registry was sealed
    #[error("Registry is sealed - cannot register {key}")]
    RegistryClosed { key: ServiceKey },

    /// Circular dependency detected during resolution
    #[error("Circular dependency detected: {}", display_path(.path))]
    CircularDependency { path: Vec<ServiceKey> },

    /// A singleton depends (directly or through transients) on a scoped service
    #[error("Singleton {service} captures scoped service {dependency} (via {})", display_path(.path))]
    CaptiveDependency {
        service: ServiceKey,
        dependency: ServiceKey,
        path: Vec<ServiceKey>,
    },

    /// Factory failed to create service
    #[error("Failed to create service {key}: {reason}")]
    CreationFailed { key: ServiceKey, reason: String },

    /// A factory asked for a dependency it did not declare
    #[error("Factory requested undeclared dependency {dependency}")]
    UndeclaredDependency { dependency: ServiceKey },

    /// The stored instance is not of the requested type
    #[error("Service {key} is not of type {expected}")]
    TypeMismatch {
        key: ServiceKey,
        expected: &'static str,
    },

    /// Initialize hook failed; siblings created by the same call were rolled back
    #[error("Failed to initialize service {key}: {reason}")]
    Initialization { key: ServiceKey, reason: String },

    /// One or more dispose hooks failed during a teardown pass
    #[error("{} dispose hook(s) failed: {}", .failures.len(), display_failures(.failures))]
    Disposal { failures: Vec<DisposalFailure> },

    /// Resolution attempted in a scope that was already closed
    #[error("Scope {scope} is closed")]
    ScopeClosed { scope: ScopeId },

    /// Resolution or scope creation attempted after container shutdown
    #[error("Container has been shut down")]
    ShutDown,
}

impl DiError {
    /// Create a CreationFailed error for a type
    #[inline]
    pub fn creation_failed<T: Injectable>(reason: impl Into<String>) -> Self {
        Self::CreationFailed {
            key: ServiceKey::of::<T>(),
            reason: reason.into(),
        }
    }

    /// Create a CircularDependency error
    #[inline]
    pub fn circular(path: Vec<ServiceKey>) -> Self {
        Self::CircularDependency { path }
    }

    /// Whether this error means the key is simply not registered.
    #[inline]
    pub fn is_unregistered(&self) -> bool {
        matches!(self, Self::UnregisteredService { .. })
    }

    /// Errors that indicate a wiring mistake at the composition root.
    ///
    /// These should abort startup rather than be handled per request.
    pub fn is_composition_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateRegistration { .. }
                | Self::RegistryClosed { .. }
                | Self::CaptiveDependency { .. }
        )
    }
}

/// A dispose hook that failed during a teardown pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisposalFailure {
    /// The service whose hook failed
    pub key: ServiceKey,
    /// The hook's error (or panic message)
    pub reason: String,
}

impl fmt::Display for DisposalFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.reason)
    }
}

fn display_path(path: &[ServiceKey]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn display_failures(failures: &[DisposalFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias for DI operations
pub type Result<T> = std::result::Result<T, DiError>;
