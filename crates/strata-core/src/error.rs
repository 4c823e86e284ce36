//! Error types for strata-core

use crate::Entity;
use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("component type {0} is already registered")]
    DuplicateComponent(&'static str),

    #[error("component type {0} is not registered")]
    UnregisteredComponent(&'static str),

    #[error("component type {0} is shared and mutable but declares neither NEEDS_CLONE nor LOCAL_ONLY")]
    AmbiguousMutability(&'static str),

    #[error("component type {name} has a conflicting policy: {reason}")]
    ConflictingPolicy { name: &'static str, reason: String },

    #[error("component type {0} requests NEEDS_CLONE but was registered without a cloner")]
    MissingCloner(&'static str),

    #[error("component type {0} appears twice in a type mask")]
    DuplicateMaskType(&'static str),

    #[error("cannot sync between worlds built from different registries")]
    RegistryMismatch,

    #[error("{0} is not alive")]
    DeadEntity(Entity),

    #[error("deep clone of {component} failed: {source}")]
    Clone {
        component: &'static str,
        #[source]
        source: CloneError,
    },
}

/// Failure while deep-cloning a component value
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloneError {
    /// Nesting exceeded the guard's limit, which is how cyclic graphs surface
    #[error("clone depth exceeded {limit} while cloning {at}")]
    DepthExceeded { limit: usize, at: &'static str },

    /// A lock inside the value was already held, either by a cycle or by
    /// another thread mutating the value during the copy
    #[error("lock already held while cloning {at}")]
    Contended { at: &'static str },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

fn _assert_error_send_sync<T: Send + Sync>() {}
fn _error_is_send_sync() {
    _assert_error_send_sync::<Error>();
}
