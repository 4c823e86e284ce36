//! Dirty-diff synchronization between two worlds
//!
//! [`sync`] walks the tables selected by a type mask and copies only the
//! chunks whose version differs between source and destination. Cost scales
//! with the number of changed chunks, not with entity count, and a second sync
//! with no intervening source writes copies nothing.

use crate::{ComponentId, Error, Result, TypeMask, TypeRegistry, World};
use std::sync::Arc;
use tracing::trace;

/// Which types a [`sync`] copies
///
/// With no explicit mask the effective set is every `SNAPSHOTABLE` type,
/// widened to every registered type by `include_non_snapshotable`, minus
/// `exclude`. An explicit mask replaces that computation entirely. `LOCAL_ONLY`
/// types are never copied, whichever way the mask was built.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub mask: Option<TypeMask>,
    pub include_non_snapshotable: bool,
    pub exclude: Option<TypeMask>,
}

impl SyncOptions {
    /// Default options: every snapshotable type
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy exactly the types in `mask`
    pub fn with_mask(mask: TypeMask) -> Self {
        Self {
            mask: Some(mask),
            ..Self::default()
        }
    }

    pub fn include_non_snapshotable(mut self) -> Self {
        self.include_non_snapshotable = true;
        self
    }

    pub fn exclude(mut self, types: TypeMask) -> Self {
        self.exclude = Some(types);
        self
    }

    /// Resolve against a registry into the set of type ids to copy
    pub fn effective_mask(&self, registry: &TypeRegistry) -> TypeMask {
        let local_only = registry.mask_where(|info| info.policy().is_local_only());
        let selected = match &self.mask {
            Some(mask) => mask.clone(),
            None => {
                let base = if self.include_non_snapshotable {
                    registry.all()
                } else {
                    registry.snapshotable()
                };
                match &self.exclude {
                    Some(exclude) => base.difference(exclude),
                    None => base,
                }
            }
        };
        selected.difference(&local_only)
    }
}

/// Work done by one sync
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Tables visited
    pub types: usize,
    pub chunks_copied: usize,
    pub chunks_skipped: usize,
    /// Live entities copied with the allocator, zero if liveness was unchanged
    pub entities_copied: usize,
}

impl SyncStats {
    pub fn merge(&mut self, other: SyncStats) {
        self.types += other.types;
        self.chunks_copied += other.chunks_copied;
        self.chunks_skipped += other.chunks_skipped;
        self.entities_copied += other.entities_copied;
    }

    /// Whether anything at all was copied
    pub fn is_noop(&self) -> bool {
        self.chunks_copied == 0 && self.entities_copied == 0
    }
}

/// Diff-sync `dest` from `source`
///
/// Both worlds must share one registry. After a successful sync every included
/// value in `dest` equals the source value at sync time, `dest`'s clock and
/// ledger position match the source, and each included table records the
/// source version it was synced up to.
pub fn sync(source: &World, dest: &mut World, options: &SyncOptions) -> Result<SyncStats> {
    if !Arc::ptr_eq(source.registry(), dest.registry()) {
        return Err(Error::RegistryMismatch);
    }

    let mut stats = SyncStats::default();

    if dest.entities().version() != source.entities().version() {
        *dest.entities_mut() = source.entities().clone();
        stats.entities_copied = source.entities().len();
    }

    let mask = options.effective_mask(source.registry());
    for id in mask.iter() {
        let (Some(src), Some(dst)) = (source.table_at(id), dest.table_at_mut(id)) else {
            continue;
        };
        let table = dst.sync_from(src)?;
        trace!(
            component = src.type_name(),
            copied = table.copied,
            skipped = table.skipped,
            "synced table"
        );
        stats.types += 1;
        stats.chunks_copied += table.copied;
        stats.chunks_skipped += table.skipped;
    }

    dest.adopt_position(source);
    Ok(stats)
}

/// Ids of the types a default sync would copy
pub fn default_types(registry: &TypeRegistry) -> Vec<ComponentId> {
    SyncOptions::default().effective_mask(registry).iter().collect()
}
