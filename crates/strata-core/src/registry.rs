//! Type-policy registry and type masks
//!
//! Component types are registered once, up front, on a [`RegistryBuilder`].
//! Building freezes the registry into an `Arc<TypeRegistry>` that the live
//! store and every replica share; after that the set of types and their
//! policies can no longer change, so lookups need no locking.
//!
//! Registration is where policy mistakes are caught. A shared mutable type
//! that does not say how it should cross into replicas is rejected here, never
//! at runtime.

use crate::clone::DeepClone;
use crate::table::{AnyTable, ComponentTable};
use crate::{Component, ComponentId, Error, Mutability, Result, TypePolicy};
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

type TableFactory = fn() -> Box<dyn AnyTable>;

fn new_table<T: Component>() -> Box<dyn AnyTable> {
    Box::new(ComponentTable::<T>::new(None))
}

fn new_deep_clone_table<T: Component + DeepClone>() -> Box<dyn AnyTable> {
    Box::new(ComponentTable::<T>::new(Some(<T as DeepClone>::deep_clone)))
}

/// Identity of a component type before it is resolved against a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentKey {
    pub type_id: TypeId,
    pub name: &'static str,
}

impl ComponentKey {
    pub fn of<T: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }
}

/// Registration record for one component type
#[derive(Clone)]
pub struct TypeInfo {
    id: ComponentId,
    key: ComponentKey,
    policy: TypePolicy,
    mutability: Mutability,
    factory: TableFactory,
}

impl TypeInfo {
    pub fn id(&self) -> ComponentId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.key.name
    }

    pub fn policy(&self) -> TypePolicy {
        self.policy
    }

    pub fn mutability(&self) -> Mutability {
        self.mutability
    }

    pub(crate) fn new_table(&self) -> Box<dyn AnyTable> {
        (self.factory)()
    }
}

impl fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeInfo")
            .field("id", &self.id)
            .field("name", &self.key.name)
            .field("policy", &self.policy)
            .field("mutability", &self.mutability)
            .finish()
    }
}

/// Mutable registration phase of a [`TypeRegistry`]
///
/// # Example
///
/// ```rust
/// use strata_core::{Component, RegistryBuilder, TypePolicy};
///
/// #[derive(Clone)]
/// struct Position(f32, f32);
/// impl Component for Position {}
///
/// let mut builder = RegistryBuilder::new();
/// builder.register::<Position>(TypePolicy::SNAPSHOTABLE | TypePolicy::RECORDABLE).unwrap();
/// let registry = builder.build();
/// assert_eq!(registry.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    types: Vec<TypeInfo>,
    index: HashMap<TypeId, ComponentId>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component type copied by `Clone` when replicated
    ///
    /// Fails with:
    /// - `DuplicateComponent` if `T` is already registered
    /// - `MissingCloner` if the policy asks for `NEEDS_CLONE`
    /// - `ConflictingPolicy` if `LOCAL_ONLY` is combined with `SNAPSHOTABLE`
    /// - `AmbiguousMutability` if `T` is shared-mutable and not `LOCAL_ONLY`
    pub fn register<T: Component>(&mut self, policy: TypePolicy) -> Result<ComponentId> {
        let key = ComponentKey::of::<T>();
        self.check_duplicate(key)?;

        if policy.needs_clone() {
            return Err(Error::MissingCloner(key.name));
        }
        if policy.is_local_only() && policy.is_snapshotable() {
            return Err(Error::ConflictingPolicy {
                name: key.name,
                reason: "LOCAL_ONLY cannot be SNAPSHOTABLE".to_string(),
            });
        }
        if T::MUTABILITY.aliases_mutable_state() && !policy.is_local_only() {
            return Err(Error::AmbiguousMutability(key.name));
        }

        Ok(self.push(key, policy, T::MUTABILITY, new_table::<T>))
    }

    /// Register a component type that is deep-cloned when replicated
    ///
    /// The policy always gains `SNAPSHOTABLE | NEEDS_CLONE`.
    pub fn register_deep_clone<T: Component + DeepClone>(
        &mut self,
        policy: TypePolicy,
    ) -> Result<ComponentId> {
        let key = ComponentKey::of::<T>();
        self.check_duplicate(key)?;

        if policy.is_local_only() {
            return Err(Error::ConflictingPolicy {
                name: key.name,
                reason: "LOCAL_ONLY types are never cloned into replicas".to_string(),
            });
        }

        let policy = policy | TypePolicy::SNAPSHOTABLE | TypePolicy::NEEDS_CLONE;
        Ok(self.push(key, policy, T::MUTABILITY, new_deep_clone_table::<T>))
    }

    fn check_duplicate(&self, key: ComponentKey) -> Result<()> {
        if self.index.contains_key(&key.type_id) {
            return Err(Error::DuplicateComponent(key.name));
        }
        Ok(())
    }

    fn push(
        &mut self,
        key: ComponentKey,
        policy: TypePolicy,
        mutability: Mutability,
        factory: TableFactory,
    ) -> ComponentId {
        let id = ComponentId(self.types.len());
        self.types.push(TypeInfo {
            id,
            key,
            policy,
            mutability,
            factory,
        });
        self.index.insert(key.type_id, id);
        id
    }

    /// Freeze the registry
    pub fn build(self) -> Arc<TypeRegistry> {
        Arc::new(TypeRegistry {
            types: self.types,
            index: self.index,
        })
    }
}

/// Frozen table of registered component types
#[derive(Debug)]
pub struct TypeRegistry {
    types: Vec<TypeInfo>,
    index: HashMap<TypeId, ComponentId>,
}

impl TypeRegistry {
    /// Number of registered types
    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn id_of<T: 'static>(&self) -> Option<ComponentId> {
        self.index.get(&TypeId::of::<T>()).copied()
    }

    /// Resolve a key, failing with `UnregisteredComponent`
    pub fn resolve(&self, key: ComponentKey) -> Result<ComponentId> {
        self.index
            .get(&key.type_id)
            .copied()
            .ok_or(Error::UnregisteredComponent(key.name))
    }

    pub fn info(&self, id: ComponentId) -> Option<&TypeInfo> {
        self.types.get(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TypeInfo> {
        self.types.iter()
    }

    /// Mask of every type whose policy satisfies `predicate`
    pub fn mask_where(&self, predicate: impl Fn(&TypeInfo) -> bool) -> TypeMask {
        let mut mask = TypeMask::empty(self.len());
        for info in self.types.iter().filter(|info| predicate(info)) {
            mask.insert(info.id);
        }
        mask
    }

    /// Default replication mask: every `SNAPSHOTABLE` type
    pub fn snapshotable(&self) -> TypeMask {
        self.mask_where(|info| info.policy.is_snapshotable())
    }

    /// Types selected by external recorders
    pub fn recordable(&self) -> TypeMask {
        self.mask_where(|info| info.policy.is_recordable())
    }

    /// Types selected by external checkpoint writers
    pub fn saveable(&self) -> TypeMask {
        self.mask_where(|info| info.policy.is_saveable())
    }

    pub fn all(&self) -> TypeMask {
        self.mask_where(|_| true)
    }

    /// Start building an explicit mask
    pub fn mask_builder(&self) -> MaskBuilder<'_> {
        MaskBuilder {
            registry: self,
            mask: TypeMask::empty(self.len()),
        }
    }

    /// Build a mask from a list of keys, rejecting unknown and repeated types
    pub fn mask_of(&self, keys: &[ComponentKey]) -> Result<TypeMask> {
        let mut builder = self.mask_builder();
        for key in keys {
            builder = builder.with_key(*key)?;
        }
        Ok(builder.build())
    }
}

/// Builder for an explicit [`TypeMask`]
#[derive(Debug)]
pub struct MaskBuilder<'r> {
    registry: &'r TypeRegistry,
    mask: TypeMask,
}

impl<'r> MaskBuilder<'r> {
    pub fn with<T: 'static>(self) -> Result<Self> {
        self.with_key(ComponentKey::of::<T>())
    }

    pub fn with_key(mut self, key: ComponentKey) -> Result<Self> {
        let id = self.registry.resolve(key)?;
        if !self.mask.insert(id) {
            return Err(Error::DuplicateMaskType(key.name));
        }
        Ok(self)
    }

    pub fn build(self) -> TypeMask {
        self.mask
    }
}

/// Bitset over [`ComponentId`]s
///
/// Masks compare by their set ids; trailing zero words do not matter.
#[derive(Clone, Default)]
pub struct TypeMask {
    bits: Vec<u64>,
}

impl TypeMask {
    /// Empty mask sized for `types` component ids
    pub fn empty(types: usize) -> Self {
        Self {
            bits: vec![0; types.div_ceil(64)],
        }
    }

    /// Set the bit for `id`; returns false if it was already set
    pub fn insert(&mut self, id: ComponentId) -> bool {
        let (word, bit) = (id.0 / 64, id.0 % 64);
        if self.bits.len() <= word {
            self.bits.resize(word + 1, 0);
        }
        let was_set = self.bits[word] & (1u64 << bit) != 0;
        self.bits[word] |= 1u64 << bit;
        !was_set
    }

    pub fn contains(&self, id: ComponentId) -> bool {
        self.bits
            .get(id.0 / 64)
            .is_some_and(|word| *word & (1u64 << (id.0 % 64)) != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|word| *word == 0)
    }

    pub fn len(&self) -> usize {
        self.bits.iter().map(|word| word.count_ones() as usize).sum()
    }

    pub fn union(&self, other: &TypeMask) -> TypeMask {
        let len = self.bits.len().max(other.bits.len());
        let bits = (0..len)
            .map(|i| self.bits.get(i).copied().unwrap_or(0) | other.bits.get(i).copied().unwrap_or(0))
            .collect();
        TypeMask { bits }
    }

    pub fn difference(&self, other: &TypeMask) -> TypeMask {
        let bits = self
            .bits
            .iter()
            .enumerate()
            .map(|(i, word)| word & !other.bits.get(i).copied().unwrap_or(0))
            .collect();
        TypeMask { bits }
    }

    /// Whether every id in `self` is also in `other`
    pub fn is_subset(&self, other: &TypeMask) -> bool {
        self.difference(other).is_empty()
    }

    /// Words up to and including the last non-zero one
    fn significant(&self) -> &[u64] {
        let len = self.bits.iter().rposition(|word| *word != 0).map_or(0, |i| i + 1);
        &self.bits[..len]
    }

    /// Iterate set ids in ascending order
    pub fn iter(&self) -> impl Iterator<Item = ComponentId> + '_ {
        self.bits.iter().enumerate().flat_map(|(w, word)| {
            (0..64)
                .filter(move |bit| *word & (1u64 << bit) != 0)
                .map(move |bit| ComponentId(w * 64 + bit))
        })
    }
}

impl PartialEq for TypeMask {
    fn eq(&self, other: &Self) -> bool {
        self.significant() == other.significant()
    }
}

impl Eq for TypeMask {}

impl Hash for TypeMask {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.significant().hash(state);
    }
}

impl fmt::Debug for TypeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|id| id.0)).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CloneError, CloneGuard};
    use std::sync::Mutex;

    #[derive(Clone)]
    struct Position;
    impl Component for Position {}

    #[derive(Clone)]
    struct DebugCache;
    impl Component for DebugCache {}

    #[derive(Clone)]
    struct Memory(Arc<Mutex<Vec<u8>>>);
    impl Component for Memory {
        const MUTABILITY: Mutability = Mutability::SharedMutable;
    }
    impl DeepClone for Memory {
        fn deep_clone(&self, guard: &mut CloneGuard) -> std::result::Result<Self, CloneError> {
            Ok(Memory(self.0.deep_clone(guard)?))
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut builder = RegistryBuilder::new();
        let pos = builder.register::<Position>(TypePolicy::SNAPSHOTABLE).unwrap();
        let dbg = builder.register::<DebugCache>(TypePolicy::NONE).unwrap();
        let registry = builder.build();

        assert_eq!(registry.id_of::<Position>(), Some(pos));
        assert_eq!(registry.id_of::<DebugCache>(), Some(dbg));
        assert!(registry.info(pos).unwrap().policy().is_snapshotable());
        assert_eq!(registry.snapshotable().iter().collect::<Vec<_>>(), vec![pos]);
    }

    #[test]
    fn test_duplicate_registration() {
        let mut builder = RegistryBuilder::new();
        builder.register::<Position>(TypePolicy::SNAPSHOTABLE).unwrap();
        let err = builder.register::<Position>(TypePolicy::NONE).unwrap_err();
        assert!(matches!(err, Error::DuplicateComponent(_)));
    }

    #[test]
    fn test_shared_mutable_requires_explicit_choice() {
        let mut builder = RegistryBuilder::new();
        let err = builder.register::<Memory>(TypePolicy::NONE).unwrap_err();
        assert!(matches!(err, Error::AmbiguousMutability(_)));

        let err = builder.register::<Memory>(TypePolicy::SNAPSHOTABLE).unwrap_err();
        assert!(matches!(err, Error::AmbiguousMutability(_)));

        assert!(builder.register::<Memory>(TypePolicy::LOCAL_ONLY).is_ok());
    }

    #[test]
    fn test_needs_clone_requires_cloner() {
        let mut builder = RegistryBuilder::new();
        let err = builder.register::<Position>(TypePolicy::NEEDS_CLONE).unwrap_err();
        assert!(matches!(err, Error::MissingCloner(_)));
    }

    #[test]
    fn test_deep_clone_registration_implies_snapshotable() {
        let mut builder = RegistryBuilder::new();
        let id = builder.register_deep_clone::<Memory>(TypePolicy::RECORDABLE).unwrap();
        let registry = builder.build();
        let policy = registry.info(id).unwrap().policy();
        assert!(policy.is_snapshotable());
        assert!(policy.needs_clone());
        assert!(policy.is_recordable());
    }

    #[test]
    fn test_local_only_conflicts() {
        let mut builder = RegistryBuilder::new();
        let err = builder
            .register::<Position>(TypePolicy::LOCAL_ONLY | TypePolicy::SNAPSHOTABLE)
            .unwrap_err();
        assert!(matches!(err, Error::ConflictingPolicy { .. }));

        let err = builder
            .register_deep_clone::<Memory>(TypePolicy::LOCAL_ONLY)
            .unwrap_err();
        assert!(matches!(err, Error::ConflictingPolicy { .. }));
    }

    #[test]
    fn test_mask_builder_rejects_unknown_and_duplicates() {
        let mut builder = RegistryBuilder::new();
        builder.register::<Position>(TypePolicy::SNAPSHOTABLE).unwrap();
        let registry = builder.build();

        let err = registry.mask_builder().with::<DebugCache>().unwrap_err();
        assert!(matches!(err, Error::UnregisteredComponent(_)));

        let err = registry
            .mask_builder()
            .with::<Position>()
            .unwrap()
            .with::<Position>()
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateMaskType(_)));

        let err = registry
            .mask_of(&[ComponentKey::of::<Position>(), ComponentKey::of::<Position>()])
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateMaskType(_)));
    }

    #[test]
    fn test_mask_set_operations() {
        let mut a = TypeMask::empty(3);
        a.insert(ComponentId(0));
        a.insert(ComponentId(2));
        let mut b = TypeMask::empty(3);
        b.insert(ComponentId(2));
        b.insert(ComponentId(70));

        assert_eq!(a.union(&b).len(), 3);
        assert_eq!(a.difference(&b).iter().collect::<Vec<_>>(), vec![ComponentId(0)]);
        assert!(b.contains(ComponentId(70)));
        assert!(!a.contains(ComponentId(70)));
        assert!(TypeMask::empty(10).is_empty());
        assert!(!a.insert(ComponentId(0)));
        assert!(a.difference(&b).is_subset(&a));
        assert!(!a.is_subset(&b));
    }

    #[test]
    fn test_mask_equality_ignores_width() {
        let mut narrow = TypeMask::empty(1);
        narrow.insert(ComponentId(70));
        let mut wide = TypeMask::empty(256);
        wide.insert(ComponentId(70));
        assert_eq!(narrow, wide);
        assert_eq!(TypeMask::empty(0), TypeMask::empty(200));
        assert_ne!(narrow, TypeMask::empty(128));

        let hash = |mask: &TypeMask| {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            mask.hash(&mut hasher);
            hasher.finish()
        };
        assert_eq!(hash(&narrow), hash(&wide));
    }
}
