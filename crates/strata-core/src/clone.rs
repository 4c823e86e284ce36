//! Deep cloning for component types marked `NEEDS_CLONE`
//!
//! `Clone` on a shared-mutable type copies the handle and aliases the state
//! behind it. [`DeepClone`] instead rebuilds the whole value: plain fields are
//! copied, nested shared-mutable handles are cloned recursively into fresh
//! allocations, and immutable leaves such as `Arc<str>` are shared.
//!
//! The cloner for a type is a monomorphized function pointer captured once at
//! registration, so syncing never inspects types at runtime. Struct impls are
//! generated field by field with [`deep_clone_struct!`](crate::deep_clone_struct).
//!
//! Cyclic graphs are not supported. A [`CloneGuard`] bounds nesting depth and a
//! lock that is already held while cloning is reported as
//! [`CloneError::Contended`], so a cycle fails fast instead of looping.

use crate::CloneError;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, RwLock, TryLockError};

/// Maximum nesting depth accepted by a default [`CloneGuard`]
pub const DEFAULT_CLONE_DEPTH: usize = 64;

/// Depth tracker threaded through a deep clone
#[derive(Debug)]
pub struct CloneGuard {
    depth: usize,
    limit: usize,
}

impl CloneGuard {
    /// Create a guard with the default depth limit
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_CLONE_DEPTH)
    }

    /// Create a guard with a custom depth limit
    pub fn with_limit(limit: usize) -> Self {
        Self { depth: 0, limit }
    }

    /// Enter one level of nesting
    pub fn enter(&mut self, at: &'static str) -> Result<(), CloneError> {
        if self.depth >= self.limit {
            return Err(CloneError::DepthExceeded {
                limit: self.limit,
                at,
            });
        }
        self.depth += 1;
        Ok(())
    }

    /// Leave one level of nesting
    pub fn exit(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Current nesting depth
    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl Default for CloneGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Structural deep copy that never aliases mutable state
pub trait DeepClone: Sized {
    fn deep_clone(&self, guard: &mut CloneGuard) -> Result<Self, CloneError>;
}

/// Deep-clone a value with a fresh default guard
pub fn deep_clone<T: DeepClone>(value: &T) -> Result<T, CloneError> {
    value.deep_clone(&mut CloneGuard::new())
}

macro_rules! deep_clone_by_copy {
    ($($ty:ty),* $(,)?) => {
        $(
            impl DeepClone for $ty {
                fn deep_clone(&self, _guard: &mut CloneGuard) -> Result<Self, CloneError> {
                    Ok(self.clone())
                }
            }
        )*
    };
}

deep_clone_by_copy!(
    (), bool, char, u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64,
    String, crate::Entity,
);

// Immutable leaves are shared on purpose.
impl DeepClone for Arc<str> {
    fn deep_clone(&self, _guard: &mut CloneGuard) -> Result<Self, CloneError> {
        Ok(Arc::clone(self))
    }
}

impl<T: Send + Sync> DeepClone for Arc<[T]> {
    fn deep_clone(&self, _guard: &mut CloneGuard) -> Result<Self, CloneError> {
        Ok(Arc::clone(self))
    }
}

impl<T: DeepClone> DeepClone for Option<T> {
    fn deep_clone(&self, guard: &mut CloneGuard) -> Result<Self, CloneError> {
        match self {
            Some(value) => Ok(Some(value.deep_clone(guard)?)),
            None => Ok(None),
        }
    }
}

impl<T: DeepClone> DeepClone for Box<T> {
    fn deep_clone(&self, guard: &mut CloneGuard) -> Result<Self, CloneError> {
        guard.enter("Box")?;
        let inner = (**self).deep_clone(guard)?;
        guard.exit();
        Ok(Box::new(inner))
    }
}

impl<T: DeepClone> DeepClone for Vec<T> {
    fn deep_clone(&self, guard: &mut CloneGuard) -> Result<Self, CloneError> {
        self.iter().map(|item| item.deep_clone(guard)).collect()
    }
}

impl<T: DeepClone> DeepClone for VecDeque<T> {
    fn deep_clone(&self, guard: &mut CloneGuard) -> Result<Self, CloneError> {
        self.iter().map(|item| item.deep_clone(guard)).collect()
    }
}

impl<K: Clone + Eq + Hash, V: DeepClone> DeepClone for HashMap<K, V> {
    fn deep_clone(&self, guard: &mut CloneGuard) -> Result<Self, CloneError> {
        self.iter()
            .map(|(k, v)| Ok((k.clone(), v.deep_clone(guard)?)))
            .collect()
    }
}

impl<K: Clone + Ord, V: DeepClone> DeepClone for BTreeMap<K, V> {
    fn deep_clone(&self, guard: &mut CloneGuard) -> Result<Self, CloneError> {
        self.iter()
            .map(|(k, v)| Ok((k.clone(), v.deep_clone(guard)?)))
            .collect()
    }
}

impl<T: DeepClone> DeepClone for Arc<Mutex<T>> {
    fn deep_clone(&self, guard: &mut CloneGuard) -> Result<Self, CloneError> {
        guard.enter("Arc<Mutex<_>>")?;
        let inner = match self.try_lock() {
            Ok(locked) => locked.deep_clone(guard)?,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().deep_clone(guard)?,
            Err(TryLockError::WouldBlock) => {
                return Err(CloneError::Contended { at: "Arc<Mutex<_>>" })
            }
        };
        guard.exit();
        Ok(Arc::new(Mutex::new(inner)))
    }
}

impl<T: DeepClone> DeepClone for Arc<RwLock<T>> {
    fn deep_clone(&self, guard: &mut CloneGuard) -> Result<Self, CloneError> {
        guard.enter("Arc<RwLock<_>>")?;
        let inner = match self.try_write() {
            Ok(locked) => locked.deep_clone(guard)?,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().deep_clone(guard)?,
            Err(TryLockError::WouldBlock) => {
                return Err(CloneError::Contended { at: "Arc<RwLock<_>>" })
            }
        };
        guard.exit();
        Ok(Arc::new(RwLock::new(inner)))
    }
}

/// Generate a field-wise [`DeepClone`] impl for a struct with named fields
///
/// ```rust
/// use std::sync::{Arc, Mutex};
/// use strata_core::{deep_clone, deep_clone_struct};
///
/// struct Memory {
///     label: String,
///     facts: Arc<Mutex<Vec<u32>>>,
/// }
/// deep_clone_struct!(Memory { label, facts });
///
/// let original = Memory { label: "a".into(), facts: Arc::new(Mutex::new(vec![1])) };
/// let copy = deep_clone(&original).unwrap();
/// assert!(!Arc::ptr_eq(&original.facts, &copy.facts));
/// ```
#[macro_export]
macro_rules! deep_clone_struct {
    ($ty:ident { $($field:ident),* $(,)? }) => {
        impl $crate::DeepClone for $ty {
            fn deep_clone(
                &self,
                guard: &mut $crate::CloneGuard,
            ) -> ::std::result::Result<Self, $crate::CloneError> {
                guard.enter(stringify!($ty))?;
                let copy = $ty {
                    $($field: $crate::DeepClone::deep_clone(&self.$field, guard)?,)*
                };
                guard.exit();
                Ok(copy)
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Inventory {
        owner: String,
        items: Arc<Mutex<Vec<u32>>>,
        tag: Arc<str>,
    }
    crate::deep_clone_struct!(Inventory { owner, items, tag });

    #[derive(Debug)]
    struct Node {
        next: Option<Arc<Mutex<Node>>>,
    }
    crate::deep_clone_struct!(Node { next });

    #[test]
    fn test_deep_clone_does_not_alias_mutable_state() {
        let original = Inventory {
            owner: "smith".to_string(),
            items: Arc::new(Mutex::new(vec![1, 2])),
            tag: Arc::from("merchant"),
        };
        let copy = deep_clone(&original).unwrap();

        original.items.lock().unwrap().push(3);

        assert_eq!(*copy.items.lock().unwrap(), vec![1, 2]);
        assert!(!Arc::ptr_eq(&original.items, &copy.items));
        assert_eq!(copy.owner, "smith");
    }

    #[test]
    fn test_immutable_leaves_are_shared() {
        let original = Inventory {
            owner: String::new(),
            items: Arc::new(Mutex::new(Vec::new())),
            tag: Arc::from("shared"),
        };
        let copy = deep_clone(&original).unwrap();
        assert!(Arc::ptr_eq(&original.tag, &copy.tag));
    }

    #[test]
    fn test_cycle_fails_fast() {
        let a = Arc::new(Mutex::new(Node { next: None }));
        let b = Arc::new(Mutex::new(Node {
            next: Some(Arc::clone(&a)),
        }));
        a.lock().unwrap().next = Some(Arc::clone(&b));

        let err = deep_clone(&a).unwrap_err();
        assert!(matches!(err, CloneError::Contended { .. }));

        // break the cycle so the test does not leak
        a.lock().unwrap().next = None;
    }

    #[test]
    fn test_depth_limit() {
        let mut chain = Node { next: None };
        for _ in 0..10 {
            chain = Node {
                next: Some(Arc::new(Mutex::new(chain))),
            };
        }
        let mut guard = CloneGuard::with_limit(5);
        let err = chain.deep_clone(&mut guard).unwrap_err();
        assert!(matches!(err, CloneError::DepthExceeded { limit: 5, .. }));

        let mut guard = CloneGuard::new();
        assert!(chain.deep_clone(&mut guard).is_ok());
        assert_eq!(guard.depth(), 0);
    }

    #[test]
    fn test_collections() {
        let mut map = HashMap::new();
        map.insert("k", Arc::new(Mutex::new(5u32)));
        let copy = deep_clone(&map).unwrap();
        *map["k"].lock().unwrap() = 6;
        assert_eq!(*copy["k"].lock().unwrap(), 5);
    }
}
