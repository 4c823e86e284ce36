//! Identity types for entities and component types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle to an entity: a slot index plus the generation of that slot.
///
/// A handle stays valid until the entity is destroyed; reusing the slot bumps
/// the generation so stale handles are rejected by liveness checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity {
    index: u32,
    generation: u32,
}

impl Entity {
    /// Create a handle from raw parts
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index of this entity
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot when this handle was issued
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity:{}v{}", self.index, self.generation)
    }
}

/// Dense index of a registered component type
///
/// Assigned in registration order by the type registry; doubles as the bit
/// position of the type inside a [`TypeMask`](crate::TypeMask).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentId(pub usize);

impl ComponentId {
    /// Get the raw index
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "component:{}", self.0)
    }
}
