//! Chunk-partitioned component storage with per-chunk write versions
//!
//! Components of one type live in a [`ComponentTable`], split into chunks of
//! [`CHUNK_SIZE`] consecutive entity slots. Every write to a chunk stamps it
//! with the next value of the owning store's version ledger, so:
//!
//! - a chunk's version never decreases
//! - two reads of an unchanged chunk observe the same version
//! - "did anything change since V" is a scan over chunk versions with no allocation
//!
//! Replicas hold tables of the same shape. Diff-syncing copies only the chunks
//! whose version differs from the source and then adopts the source version.

use crate::clone::CloneGuard;
use crate::{CloneError, Component, Error, Result};
use std::any::Any;
use tracing::trace;

/// Number of entity slots per chunk
pub const CHUNK_SIZE: usize = 64;

pub(crate) type Cloner<T> = fn(&T, &mut CloneGuard) -> std::result::Result<T, CloneError>;

/// Split an entity slot index into (chunk, offset)
pub(crate) fn locate(index: u32) -> (usize, usize) {
    let index = index as usize;
    (index / CHUNK_SIZE, index % CHUNK_SIZE)
}

#[derive(Debug, Clone)]
struct Chunk<T> {
    slots: Vec<Option<T>>,
    occupied: usize,
    version: u64,
}

impl<T> Chunk<T> {
    fn new() -> Self {
        Self {
            slots: std::iter::repeat_with(|| None).take(CHUNK_SIZE).collect(),
            occupied: 0,
            version: 0,
        }
    }

    fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.occupied = 0;
    }
}

/// Chunk counts produced by syncing one table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableSync {
    /// Chunks whose payload was copied
    pub copied: usize,
    /// Chunks skipped because their versions already matched
    pub skipped: usize,
}

/// Storage for every instance of one component type
#[derive(Debug)]
pub struct ComponentTable<T: Component> {
    chunks: Vec<Chunk<T>>,
    len: usize,
    /// Highest version stamped on any chunk
    latest: u64,
    /// Source version this table was last synced up to
    synced: u64,
    cloner: Option<Cloner<T>>,
}

impl<T: Component> ComponentTable<T> {
    pub(crate) fn new(cloner: Option<Cloner<T>>) -> Self {
        Self {
            chunks: Vec::new(),
            len: 0,
            latest: 0,
            synced: 0,
            cloner,
        }
    }

    fn chunk_for_write(&mut self, chunk: usize) -> &mut Chunk<T> {
        if self.chunks.len() <= chunk {
            self.chunks.resize_with(chunk + 1, Chunk::new);
        }
        &mut self.chunks[chunk]
    }

    fn stamp(&mut self, chunk: usize, version: u64) {
        self.chunks[chunk].version = version;
        self.latest = self.latest.max(version);
    }

    /// Number of stored components
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of allocated chunks
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Version of a chunk, `None` if it was never allocated
    pub fn chunk_version(&self, chunk: usize) -> Option<u64> {
        self.chunks.get(chunk).map(|c| c.version)
    }

    /// Highest version stamped on this table
    pub fn latest_version(&self) -> u64 {
        self.latest
    }

    /// Source version this table was last synced up to
    pub fn synced_version(&self) -> u64 {
        self.synced
    }

    /// Whether any chunk was written after `since`
    pub fn has_changes(&self, since: u64) -> bool {
        self.chunks.iter().any(|c| c.version > since)
    }

    pub fn get(&self, index: u32) -> Option<&T> {
        let (chunk, offset) = locate(index);
        self.chunks.get(chunk)?.slots[offset].as_ref()
    }

    /// Mutable access; stamps the chunk with `version` when the slot is occupied
    pub(crate) fn get_mut(&mut self, index: u32, version: u64) -> Option<&mut T> {
        let (chunk, offset) = locate(index);
        if self.chunks.get(chunk)?.slots[offset].is_none() {
            return None;
        }
        self.stamp(chunk, version);
        self.chunks[chunk].slots[offset].as_mut()
    }

    pub(crate) fn insert(&mut self, index: u32, value: T, version: u64) -> Option<T> {
        let (chunk, offset) = locate(index);
        let target = self.chunk_for_write(chunk);
        let previous = target.slots[offset].replace(value);
        if previous.is_none() {
            target.occupied += 1;
            self.len += 1;
        }
        self.stamp(chunk, version);
        previous
    }

    pub(crate) fn remove(&mut self, index: u32, version: u64) -> Option<T> {
        let (chunk, offset) = locate(index);
        let removed = self.chunks.get_mut(chunk)?.slots[offset].take()?;
        self.chunks[chunk].occupied -= 1;
        self.len -= 1;
        self.stamp(chunk, version);
        Some(removed)
    }

    /// Iterate `(slot index, component)` pairs in slot order
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.chunks.iter().enumerate().flat_map(|(c, chunk)| {
            chunk
                .slots
                .iter()
                .enumerate()
                .filter_map(move |(o, slot)| slot.as_ref().map(|v| ((c * CHUNK_SIZE + o) as u32, v)))
        })
    }

    fn copy_chunk(&self, source: &Chunk<T>) -> std::result::Result<Vec<Option<T>>, CloneError> {
        match self.cloner {
            None => Ok(source.slots.clone()),
            Some(clone) => {
                let mut guard = CloneGuard::new();
                source
                    .slots
                    .iter()
                    .map(|slot| match slot {
                        Some(value) => clone(value, &mut guard).map(Some),
                        None => Ok(None),
                    })
                    .collect()
            }
        }
    }

    /// Diff-sync this table from `source`, copying only chunks whose versions differ
    pub(crate) fn sync_from(&mut self, source: &ComponentTable<T>) -> Result<TableSync> {
        let mut stats = TableSync::default();

        if self.synced == source.latest && self.chunks.len() >= source.chunks.len() {
            stats.skipped = source.chunks.len();
            return Ok(stats);
        }

        for (c, src) in source.chunks.iter().enumerate() {
            if self.chunks.get(c).map(|d| d.version) == Some(src.version) {
                stats.skipped += 1;
                continue;
            }

            let previous = self.chunks.get(c).map(|d| d.occupied).unwrap_or(0);
            if src.occupied == 0 {
                trace!(component = std::any::type_name::<T>(), chunk = c, "clearing emptied chunk");
                self.chunk_for_write(c).clear();
            } else {
                let slots = self.copy_chunk(src).map_err(|source| Error::Clone {
                    component: std::any::type_name::<T>(),
                    source,
                })?;
                let target = self.chunk_for_write(c);
                target.slots = slots;
                target.occupied = src.occupied;
            }
            self.chunks[c].version = src.version;
            self.len = self.len - previous + src.occupied;
            stats.copied += 1;
        }

        // chunks the source no longer has (only after a reset into a shorter store)
        for chunk in self.chunks.iter_mut().skip(source.chunks.len()) {
            self.len -= chunk.occupied;
            chunk.clear();
            chunk.version = 0;
        }

        self.latest = source.latest;
        self.synced = source.latest;
        Ok(stats)
    }

    fn try_clone(&self) -> Result<Self> {
        let mut chunks = Vec::with_capacity(self.chunks.len());
        for chunk in &self.chunks {
            let slots = self.copy_chunk(chunk).map_err(|source| Error::Clone {
                component: std::any::type_name::<T>(),
                source,
            })?;
            chunks.push(Chunk {
                slots,
                occupied: chunk.occupied,
                version: chunk.version,
            });
        }
        Ok(Self {
            chunks,
            len: self.len,
            latest: self.latest,
            synced: self.synced,
            cloner: self.cloner,
        })
    }
}

/// Type-erased table interface used by the store and the synchronizer
pub(crate) trait AnyTable: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn type_name(&self) -> &'static str;
    fn len(&self) -> usize;
    fn has_changes(&self, since: u64) -> bool;
    fn synced_version(&self) -> u64;
    fn remove_index(&mut self, index: u32, version: u64) -> bool;
    fn sync_from(&mut self, source: &dyn AnyTable) -> Result<TableSync>;
    fn reset(&mut self);
    fn forget_synced(&mut self);
    fn try_clone_box(&self) -> Result<Box<dyn AnyTable>>;
}

impl<T: Component> AnyTable for ComponentTable<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn len(&self) -> usize {
        self.len
    }

    fn has_changes(&self, since: u64) -> bool {
        ComponentTable::has_changes(self, since)
    }

    fn synced_version(&self) -> u64 {
        self.synced
    }

    fn remove_index(&mut self, index: u32, version: u64) -> bool {
        self.remove(index, version).is_some()
    }

    fn sync_from(&mut self, source: &dyn AnyTable) -> Result<TableSync> {
        let source = source
            .as_any()
            .downcast_ref::<ComponentTable<T>>()
            .ok_or(Error::UnregisteredComponent(std::any::type_name::<T>()))?;
        ComponentTable::sync_from(self, source)
    }

    fn reset(&mut self) {
        for chunk in &mut self.chunks {
            chunk.clear();
            chunk.version = 0;
        }
        self.len = 0;
        self.latest = 0;
        self.synced = 0;
    }

    fn forget_synced(&mut self) {
        self.synced = 0;
    }

    fn try_clone_box(&self) -> Result<Box<dyn AnyTable>> {
        Ok(Box::new(self.try_clone()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Health(u32);
    impl Component for Health {}

    #[test]
    fn test_insert_stamps_chunk() {
        let mut table = ComponentTable::<Health>::new(None);
        table.insert(3, Health(10), 1);
        table.insert(CHUNK_SIZE as u32 + 1, Health(20), 2);

        assert_eq!(table.len(), 2);
        assert_eq!(table.chunk_count(), 2);
        assert_eq!(table.chunk_version(0), Some(1));
        assert_eq!(table.chunk_version(1), Some(2));
        assert_eq!(table.get(3), Some(&Health(10)));
        assert_eq!(table.latest_version(), 2);
    }

    #[test]
    fn test_version_is_stable_without_writes() {
        let mut table = ComponentTable::<Health>::new(None);
        table.insert(0, Health(1), 5);
        let first = table.chunk_version(0);
        let _ = table.get(0);
        assert_eq!(table.chunk_version(0), first);
    }

    #[test]
    fn test_has_changes() {
        let mut table = ComponentTable::<Health>::new(None);
        assert!(!table.has_changes(0));
        table.insert(0, Health(1), 4);
        assert!(table.has_changes(3));
        assert!(!table.has_changes(4));
    }

    #[test]
    fn test_get_mut_only_stamps_occupied() {
        let mut table = ComponentTable::<Health>::new(None);
        table.insert(0, Health(1), 1);
        assert!(table.get_mut(1, 9).is_none());
        assert_eq!(table.chunk_version(0), Some(1));
        table.get_mut(0, 9).unwrap().0 = 2;
        assert_eq!(table.chunk_version(0), Some(9));
    }

    #[test]
    fn test_sync_copies_only_dirty_chunks() {
        let mut source = ComponentTable::<Health>::new(None);
        source.insert(0, Health(1), 1);
        source.insert(CHUNK_SIZE as u32, Health(2), 2);

        let mut dest = ComponentTable::<Health>::new(None);
        let first = dest.sync_from(&source).unwrap();
        assert_eq!(first.copied, 2);
        assert_eq!(dest.get(CHUNK_SIZE as u32), Some(&Health(2)));

        source.insert(1, Health(3), 3);
        let second = dest.sync_from(&source).unwrap();
        assert_eq!(second, TableSync { copied: 1, skipped: 1 });
        assert_eq!(dest.len(), 3);

        let third = dest.sync_from(&source).unwrap();
        assert_eq!(third.copied, 0);
    }

    #[test]
    fn test_sync_clears_emptied_chunk() {
        let mut source = ComponentTable::<Health>::new(None);
        source.insert(0, Health(1), 1);
        let mut dest = ComponentTable::<Health>::new(None);
        dest.sync_from(&source).unwrap();

        source.remove(0, 2);
        dest.sync_from(&source).unwrap();

        assert!(dest.get(0).is_none());
        assert_eq!(dest.len(), 0);
        assert_eq!(dest.chunk_version(0), Some(2));
    }

    #[test]
    fn test_reset_forgets_sync_marks() {
        let mut source = ComponentTable::<Health>::new(None);
        source.insert(0, Health(1), 1);
        let mut dest = ComponentTable::<Health>::new(None);
        dest.sync_from(&source).unwrap();

        AnyTable::reset(&mut dest);
        assert_eq!(dest.synced_version(), 0);
        assert!(dest.get(0).is_none());

        let again = dest.sync_from(&source).unwrap();
        assert_eq!(again.copied, 1);
    }

    #[test]
    fn test_iter_in_slot_order() {
        let mut table = ComponentTable::<Health>::new(None);
        table.insert(70, Health(2), 1);
        table.insert(5, Health(1), 2);
        let items: Vec<_> = table.iter().map(|(i, h)| (i, h.0)).collect();
        assert_eq!(items, vec![(5, 1), (70, 2)]);
    }
}
