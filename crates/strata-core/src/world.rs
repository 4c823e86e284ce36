//! World - a set of component tables plus entity liveness
//!
//! The same type serves as the authoritative store and as a replica. The
//! authoritative world is written only by the coordinating thread; every write
//! draws a fresh value from the world's version ledger and stamps the touched
//! chunk with it. Replicas are never written directly, only diff-synced.

use crate::event::EventStream;
use crate::table::{AnyTable, ComponentTable};
use crate::{
    Clock, Component, ComponentId, Entity, Error, Result, TypeMask, TypeRegistry,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Generational entity allocator
#[derive(Debug, Clone, Default)]
pub struct Entities {
    generations: Vec<u32>,
    alive: Vec<bool>,
    free: Vec<u32>,
    live: usize,
    version: u64,
}

impl Entities {
    fn spawn(&mut self, version: u64) -> Entity {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.generations.push(0);
                self.alive.push(false);
                (self.generations.len() - 1) as u32
            }
        };
        self.alive[index as usize] = true;
        self.live += 1;
        self.version = version;
        Entity::new(index, self.generations[index as usize])
    }

    fn despawn(&mut self, entity: Entity, version: u64) -> bool {
        if !self.is_alive(entity) {
            return false;
        }
        let index = entity.index() as usize;
        self.alive[index] = false;
        self.generations[index] = self.generations[index].wrapping_add(1);
        self.free.push(entity.index());
        self.live -= 1;
        self.version = version;
        true
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        let index = entity.index() as usize;
        self.alive.get(index).copied().unwrap_or(false)
            && self.generations[index] == entity.generation()
    }

    /// Current handle for a slot, if the slot holds a live entity
    pub fn handle(&self, index: u32) -> Option<Entity> {
        let i = index as usize;
        if self.alive.get(i).copied().unwrap_or(false) {
            Some(Entity::new(index, self.generations[i]))
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Ledger version of the last spawn or despawn
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn iter(&self) -> impl Iterator<Item = Entity> + '_ {
        self.alive
            .iter()
            .enumerate()
            .filter(|(_, alive)| **alive)
            .map(|(i, _)| Entity::new(i as u32, self.generations[i]))
    }
}

/// A set of component tables sharing one registry
pub struct World {
    registry: Arc<TypeRegistry>,
    entities: Entities,
    tables: Vec<Box<dyn AnyTable>>,
    ledger: u64,
    clock: Clock,
    events: EventStream,
}

impl World {
    /// Create an empty world with one table per registered type
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        let tables = registry.iter().map(|info| info.new_table()).collect();
        Self {
            registry,
            entities: Entities::default(),
            tables,
            ledger: 0,
            clock: Clock::new(),
            events: EventStream::new(),
        }
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Advance the clock by one frame
    pub fn advance_frame(&mut self, delta: Duration) -> u64 {
        self.clock.advance(delta)
    }

    /// Latest value drawn from the version ledger
    pub fn version(&self) -> u64 {
        self.ledger
    }

    fn next_version(&mut self) -> u64 {
        self.ledger += 1;
        self.ledger
    }

    pub fn entities(&self) -> &Entities {
        &self.entities
    }

    pub fn events(&self) -> &EventStream {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut EventStream {
        &mut self.events
    }

    // ========================================================================
    // Entities
    // ========================================================================

    pub fn spawn(&mut self) -> Entity {
        let version = self.next_version();
        self.entities.spawn(version)
    }

    /// Destroy an entity and remove all of its components
    pub fn despawn(&mut self, entity: Entity) -> Result<()> {
        if !self.entities.is_alive(entity) {
            return Err(Error::DeadEntity(entity));
        }
        let version = self.next_version();
        for table in &mut self.tables {
            table.remove_index(entity.index(), version);
        }
        self.entities.despawn(entity, version);
        Ok(())
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    // ========================================================================
    // Components
    // ========================================================================

    fn table<T: Component>(&self) -> Option<&ComponentTable<T>> {
        let id = self.registry.id_of::<T>()?;
        self.tables[id.0].as_any().downcast_ref::<ComponentTable<T>>()
    }

    fn table_mut<T: Component>(&mut self) -> Result<&mut ComponentTable<T>> {
        let name = std::any::type_name::<T>();
        let id = self.registry.id_of::<T>().ok_or(Error::UnregisteredComponent(name))?;
        self.tables[id.0]
            .as_any_mut()
            .downcast_mut::<ComponentTable<T>>()
            .ok_or(Error::UnregisteredComponent(name))
    }

    /// Insert or overwrite a component, returning the previous value
    pub fn insert<T: Component>(&mut self, entity: Entity, value: T) -> Result<Option<T>> {
        if !self.entities.is_alive(entity) {
            return Err(Error::DeadEntity(entity));
        }
        let version = self.ledger + 1;
        let previous = self.table_mut::<T>()?.insert(entity.index(), value, version);
        self.ledger = version;
        Ok(previous)
    }

    pub fn remove<T: Component>(&mut self, entity: Entity) -> Result<Option<T>> {
        if !self.entities.is_alive(entity) {
            return Err(Error::DeadEntity(entity));
        }
        let version = self.ledger + 1;
        let removed = self.table_mut::<T>()?.remove(entity.index(), version);
        if removed.is_some() {
            self.ledger = version;
        }
        Ok(removed)
    }

    pub fn get<T: Component>(&self, entity: Entity) -> Option<&T> {
        if !self.entities.is_alive(entity) {
            return None;
        }
        self.table::<T>()?.get(entity.index())
    }

    /// Mutable access; counts as a write even if the value is left unchanged
    pub fn get_mut<T: Component>(&mut self, entity: Entity) -> Option<&mut T> {
        if !self.entities.is_alive(entity) {
            return None;
        }
        let version = self.ledger + 1;
        let id = self.registry.id_of::<T>()?;
        let table = self.tables[id.0]
            .as_any_mut()
            .downcast_mut::<ComponentTable<T>>()?;
        let value = table.get_mut(entity.index(), version)?;
        self.ledger = version;
        Some(value)
    }

    /// Iterate every live entity carrying `T`
    pub fn query<T: Component>(&self) -> impl Iterator<Item = (Entity, &T)> + '_ {
        self.table::<T>()
            .into_iter()
            .flat_map(|table| table.iter())
            .filter_map(|(index, value)| self.entities.handle(index).map(|e| (e, value)))
    }

    /// Number of stored `T` components
    pub fn count<T: Component>(&self) -> usize {
        self.table::<T>().map(|t| t.len()).unwrap_or(0)
    }

    // ========================================================================
    // Version ledger
    // ========================================================================

    /// Whether any `T` chunk was written after ledger version `since`
    pub fn has_changes<T: Component>(&self, since: u64) -> bool {
        self.table::<T>().is_some_and(|t| t.has_changes(since))
    }

    pub fn has_changes_id(&self, id: ComponentId, since: u64) -> bool {
        self.tables.get(id.0).is_some_and(|t| t.has_changes(since))
    }

    /// Whether any type in `mask` changed after `since`
    pub fn has_changes_in(&self, mask: &TypeMask, since: u64) -> bool {
        mask.iter().any(|id| self.has_changes_id(id, since))
    }

    /// Source version a replica table was last synced up to
    pub fn synced_version<T: Component>(&self) -> u64 {
        self.table::<T>().map(|t| t.synced_version()).unwrap_or(0)
    }

    /// Chunk version of the chunk holding `entity`'s `T`
    pub fn chunk_version<T: Component>(&self, entity: Entity) -> Option<u64> {
        let (chunk, _) = crate::table::locate(entity.index());
        self.table::<T>()?.chunk_version(chunk)
    }

    // ========================================================================
    // Replica support
    // ========================================================================

    pub(crate) fn table_at(&self, id: ComponentId) -> Option<&dyn AnyTable> {
        self.tables.get(id.0).map(|t| t.as_ref())
    }

    pub(crate) fn table_at_mut(&mut self, id: ComponentId) -> Option<&mut Box<dyn AnyTable>> {
        self.tables.get_mut(id.0)
    }

    pub(crate) fn entities_mut(&mut self) -> &mut Entities {
        &mut self.entities
    }

    /// Adopt the source's clock and ledger position after a sync
    pub(crate) fn adopt_position(&mut self, source: &World) {
        self.clock = source.clock;
        self.ledger = source.ledger;
    }

    /// Forget every synced value and high-water mark
    ///
    /// Used when a pooled snapshot returns to its pool so that types outside
    /// the next borrower's mask read as absent rather than stale.
    pub fn reset(&mut self) {
        for table in &mut self.tables {
            table.reset();
        }
        self.entities = Entities::default();
        self.events.clear();
        self.clock = Clock::new();
    }

    /// Empty every table outside `mask`
    pub fn retain_types(&mut self, mask: &TypeMask) {
        for (i, table) in self.tables.iter_mut().enumerate() {
            if !mask.contains(ComponentId(i)) {
                table.reset();
            }
        }
    }

    /// Forget each table's synced mark, keeping contents and chunk versions
    ///
    /// The next sync from the same source then walks every chunk again but
    /// still skips the ones whose versions match.
    pub fn forget_sync_marks(&mut self) {
        for table in &mut self.tables {
            table.forget_synced();
        }
    }

    /// Copy the whole world, deep-cloning types that require it
    pub fn try_clone(&self) -> Result<World> {
        let tables = self
            .tables
            .iter()
            .map(|t| t.try_clone_box())
            .collect::<Result<Vec<_>>>()?;
        Ok(World {
            registry: Arc::clone(&self.registry),
            entities: self.entities.clone(),
            tables,
            ledger: self.ledger,
            clock: self.clock,
            events: self.events.snapshot(),
        })
    }
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("frame", &self.clock.frame)
            .field("entities", &self.entities.len())
            .field("types", &self.tables.len())
            .field("version", &self.ledger)
            .finish()
    }
}
