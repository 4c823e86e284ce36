//! Component types and their replication policy
//!
//! Every component type declares a [`Mutability`] class on the type itself and
//! receives a [`TypePolicy`] when it is registered. Together they decide whether
//! a type may cross into a concurrently-read replica, and how:
//!
//! - `Value` types are copied by `Clone` and never alias
//! - `SharedImmutable` types (e.g. `Arc<str>`) are copied by reference
//! - `SharedMutable` types (e.g. `Arc<Mutex<_>>`) must either be deep-cloned
//!   (`NEEDS_CLONE`) or stay out of replicas entirely (`LOCAL_ONLY`)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

/// How a component's `Clone` impl relates to aliasing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Mutability {
    /// Plain data; `Clone` produces an independent copy
    #[default]
    Value,
    /// Reference-typed but immutable; sharing the reference is safe
    SharedImmutable,
    /// Reference-typed with interior mutability; `Clone` aliases mutable state
    SharedMutable,
}

impl Mutability {
    /// Whether a plain `Clone` of this type shares mutable state
    pub fn aliases_mutable_state(&self) -> bool {
        matches!(self, Mutability::SharedMutable)
    }
}

/// A type storable in a component table
///
/// ```rust
/// use strata_core::{Component, Mutability};
///
/// #[derive(Debug, Clone, PartialEq)]
/// struct Position { x: f32, y: f32 }
/// impl Component for Position {}
///
/// #[derive(Debug, Clone)]
/// struct Blackboard(std::sync::Arc<std::sync::Mutex<Vec<u32>>>);
/// impl Component for Blackboard {
///     const MUTABILITY: Mutability = Mutability::SharedMutable;
/// }
/// ```
pub trait Component: Clone + Send + Sync + 'static {
    /// Mutability class of the type, defaults to plain value semantics
    const MUTABILITY: Mutability = Mutability::Value;
}

/// Immutable per-type policy flags, fixed at registration
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TypePolicy(u8);

impl TypePolicy {
    /// No flags: the type lives only in the authoritative store
    pub const NONE: TypePolicy = TypePolicy(0);
    /// Safe to expose to a concurrently-read replica
    pub const SNAPSHOTABLE: TypePolicy = TypePolicy(1 << 0);
    /// Selected by external recorders
    pub const RECORDABLE: TypePolicy = TypePolicy(1 << 1);
    /// Selected by external checkpoint writers
    pub const SAVEABLE: TypePolicy = TypePolicy(1 << 2);
    /// Must be deep-copied, never aliased, when crossing into a replica
    pub const NEEDS_CLONE: TypePolicy = TypePolicy(1 << 3);
    /// Explicit opt-out from replication for shared mutable types
    pub const LOCAL_ONLY: TypePolicy = TypePolicy(1 << 4);

    /// Check whether every flag in `other` is set
    pub const fn contains(self, other: TypePolicy) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two policies
    pub const fn union(self, other: TypePolicy) -> TypePolicy {
        TypePolicy(self.0 | other.0)
    }

    pub fn is_snapshotable(&self) -> bool {
        self.contains(Self::SNAPSHOTABLE)
    }

    pub fn is_recordable(&self) -> bool {
        self.contains(Self::RECORDABLE)
    }

    pub fn is_saveable(&self) -> bool {
        self.contains(Self::SAVEABLE)
    }

    pub fn needs_clone(&self) -> bool {
        self.contains(Self::NEEDS_CLONE)
    }

    pub fn is_local_only(&self) -> bool {
        self.contains(Self::LOCAL_ONLY)
    }
}

impl BitOr for TypePolicy {
    type Output = TypePolicy;

    fn bitor(self, rhs: TypePolicy) -> TypePolicy {
        self.union(rhs)
    }
}

impl fmt::Debug for TypePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::SNAPSHOTABLE, "SNAPSHOTABLE"),
            (Self::RECORDABLE, "RECORDABLE"),
            (Self::SAVEABLE, "SAVEABLE"),
            (Self::NEEDS_CLONE, "NEEDS_CLONE"),
            (Self::LOCAL_ONLY, "LOCAL_ONLY"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag) && flag.0 != 0)
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "TypePolicy(NONE)")
        } else {
            write!(f, "TypePolicy({})", set.join(" | "))
        }
    }
}
