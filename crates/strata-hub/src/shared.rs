//! Shared ref-counted snapshot provider
//!
//! Modules in one convoy share a single pooled snapshot per frame. The first
//! acquisition of a frame materializes the snapshot with the union of every
//! member's mask; later acquisitions in the same frame only bump a reference
//! count. A member that was never joined may ask for types the frame's
//! snapshot lacks; it gets a second snapshot with the widened mask rather
//! than a view missing data. A snapshot goes back to the pool when its last
//! reference is released.

use crate::pool::{materialize, SnapshotPool};
use crate::provider::{LeaseLedger, ProviderId, ProviderKind, SnapshotProvider, ViewLease};
use crate::{Error, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use strata_core::{Frame, SyncStats, TypeMask, World};
use tracing::{debug, error, warn};

#[derive(Debug)]
struct SharedEntry {
    frame: Frame,
    /// Types materialized into `world`
    mask: TypeMask,
    world: Arc<World>,
    refs: usize,
}

#[derive(Debug)]
struct ConvoyState {
    mask: TypeMask,
    /// Snapshots with live references; normally one per frame
    entries: Vec<SharedEntry>,
    materializations: u64,
    shares: u64,
}

/// Provider for a named convoy of modules
#[derive(Debug)]
pub struct SharedSnapshotProvider {
    id: ProviderId,
    name: String,
    pool: Arc<SnapshotPool>,
    state: Mutex<ConvoyState>,
    leases: LeaseLedger,
}

impl SharedSnapshotProvider {
    pub fn new(name: impl Into<String>, pool: Arc<SnapshotPool>) -> Self {
        let mask = TypeMask::empty(pool.registry().len());
        Self {
            id: ProviderId::next(),
            name: name.into(),
            pool,
            state: Mutex::new(ConvoyState {
                mask,
                entries: Vec::new(),
                materializations: 0,
                shares: 0,
            }),
            leases: LeaseLedger::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConvoyState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Widen the convoy's mask to cover a new member
    pub fn join(&self, mask: &TypeMask) {
        let mut state = self.lock();
        state.mask = state.mask.union(mask);
    }

    /// Union of every member's mask
    pub fn mask(&self) -> TypeMask {
        self.lock().mask.clone()
    }

    pub fn stats(&self) -> ConvoyStats {
        let state = self.lock();
        ConvoyStats {
            materializations: state.materializations,
            shares: state.shares,
            live_snapshots: state.entries.len(),
        }
    }
}

impl SnapshotProvider for SharedSnapshotProvider {
    fn id(&self) -> ProviderId {
        self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::SharedSnapshot
    }

    fn update(&self, live: &World) -> Result<SyncStats> {
        let state = self.lock();
        let frame = live.clock().frame;
        for entry in state.entries.iter().filter(|e| e.frame < frame) {
            warn!(
                convoy = %self.name,
                frame = entry.frame,
                refs = entry.refs,
                "shared snapshot from an earlier frame is still referenced"
            );
        }
        Ok(SyncStats::default())
    }

    fn acquire_view(&self, live: &World, mask: &TypeMask) -> Result<ViewLease> {
        let frame = live.clock().frame;
        let mut state = self.lock();

        if !mask.is_subset(&state.mask) {
            state.mask = state.mask.union(mask);
        }

        if let Some(entry) = state
            .entries
            .iter_mut()
            .rev()
            .find(|e| e.frame == frame && mask.is_subset(&e.mask))
        {
            entry.refs += 1;
            let world = Arc::clone(&entry.world);
            state.shares += 1;
            drop(state);
            let lease = ViewLease::new(self.id, frame, world);
            self.leases.issue(&lease);
            return Ok(lease);
        }

        let mask = state.mask.clone();
        let (world, stats) = materialize(&self.pool, live, &mask)?;
        debug!(
            convoy = %self.name,
            frame,
            copied = stats.chunks_copied,
            skipped = stats.chunks_skipped,
            "materialized shared snapshot"
        );
        let world = Arc::new(world);
        state.entries.push(SharedEntry {
            frame,
            mask,
            world: Arc::clone(&world),
            refs: 1,
        });
        state.materializations += 1;
        drop(state);

        let lease = ViewLease::new(self.id, frame, world);
        self.leases.issue(&lease);
        Ok(lease)
    }

    fn release_view(&self, lease: ViewLease) -> Result<()> {
        self.leases.retire(self.id, &lease)?;
        let (id, frame) = (lease.id(), lease.frame());
        let world = lease.into_world();

        let mut state = self.lock();
        let position = state
            .entries
            .iter()
            .position(|e| e.frame == frame && Arc::ptr_eq(&e.world, &world));
        drop(world);
        let Some(position) = position else {
            error!(convoy = %self.name, frame, "released a view with no shared snapshot");
            return Err(Error::UnknownLease {
                lease: id,
                provider: self.id,
            });
        };

        let entry = &mut state.entries[position];
        entry.refs -= 1;
        if entry.refs == 0 {
            let entry = state.entries.remove(position);
            drop(state);
            self.pool.recycle(entry.world);
        }
        Ok(())
    }

    fn outstanding(&self) -> usize {
        self.leases.len()
    }
}

/// Statistics about a convoy provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvoyStats {
    /// Snapshots materialized (one diff-sync each)
    pub materializations: u64,
    /// Acquisitions served from an already materialized snapshot
    pub shares: u64,
    /// Snapshots currently referenced
    pub live_snapshots: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use strata_core::{Component, RegistryBuilder, TypePolicy};

    #[derive(Debug, Clone, PartialEq)]
    struct Position(i32);
    impl Component for Position {}

    #[derive(Debug, Clone, PartialEq)]
    struct Health(u32);
    impl Component for Health {}

    fn live() -> World {
        let mut builder = RegistryBuilder::new();
        builder.register::<Position>(TypePolicy::SNAPSHOTABLE).unwrap();
        builder.register::<Health>(TypePolicy::SNAPSHOTABLE).unwrap();
        let mut world = World::new(builder.build());
        let e = world.spawn();
        world.insert(e, Position(4)).unwrap();
        world.insert(e, Health(7)).unwrap();
        world
    }

    #[test]
    fn test_same_frame_acquisitions_share_one_snapshot() {
        let mut live = live();
        live.advance_frame(Duration::from_millis(16));
        let pool = Arc::new(SnapshotPool::new(Arc::clone(live.registry()), 4, 1));
        let convoy = SharedSnapshotProvider::new("ai", Arc::clone(&pool));

        let position = live.registry().mask_builder().with::<Position>().unwrap().build();
        let health = live.registry().mask_builder().with::<Health>().unwrap().build();
        convoy.join(&position);
        convoy.join(&health);

        let a = convoy.acquire_view(&live, &position).unwrap();
        let b = convoy.acquire_view(&live, &health).unwrap();

        assert!(Arc::ptr_eq(a.world(), b.world()));
        let e = live.entities().iter().next().unwrap();
        assert_eq!(b.world().get::<Position>(e), Some(&Position(4)));
        assert_eq!(b.world().get::<Health>(e), Some(&Health(7)));
        assert_eq!(convoy.stats().materializations, 1);
        assert_eq!(convoy.stats().shares, 1);
        assert_eq!(pool.free_count(), 0);

        convoy.release_view(a).unwrap();
        assert_eq!(pool.free_count(), 0);
        convoy.release_view(b).unwrap();
        assert_eq!(pool.free_count(), 1);
        assert_eq!(convoy.stats().live_snapshots, 0);
    }

    #[test]
    fn test_new_frame_materializes_again() {
        let mut live = live();
        let pool = Arc::new(SnapshotPool::new(Arc::clone(live.registry()), 4, 0));
        let convoy = SharedSnapshotProvider::new("net", Arc::clone(&pool));
        let all = live.registry().snapshotable();
        convoy.join(&all);

        live.advance_frame(Duration::from_millis(16));
        let first = convoy.acquire_view(&live, &all).unwrap();
        convoy.release_view(first).unwrap();

        live.advance_frame(Duration::from_millis(16));
        let second = convoy.acquire_view(&live, &all).unwrap();
        assert_eq!(second.frame(), 2);
        convoy.release_view(second).unwrap();

        assert_eq!(convoy.stats().materializations, 2);
        assert_eq!(pool.stats().allocated, 1);
    }

    #[test]
    fn test_stale_frame_reference_kept_alive() {
        let mut live = live();
        let pool = Arc::new(SnapshotPool::new(Arc::clone(live.registry()), 4, 0));
        let convoy = SharedSnapshotProvider::new("rec", Arc::clone(&pool));
        let all = live.registry().snapshotable();

        live.advance_frame(Duration::from_millis(16));
        let old = convoy.acquire_view(&live, &all).unwrap();

        live.advance_frame(Duration::from_millis(16));
        convoy.update(&live).unwrap();
        let new = convoy.acquire_view(&live, &all).unwrap();
        assert!(!Arc::ptr_eq(old.world(), new.world()));
        assert_eq!(convoy.stats().live_snapshots, 2);

        convoy.release_view(old).unwrap();
        convoy.release_view(new).unwrap();
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_unjoined_mask_gets_its_own_snapshot() {
        let mut live = live();
        live.advance_frame(Duration::from_millis(16));
        let pool = Arc::new(SnapshotPool::new(Arc::clone(live.registry()), 4, 0));
        let convoy = SharedSnapshotProvider::new("late", Arc::clone(&pool));
        let position = live.registry().mask_builder().with::<Position>().unwrap().build();
        let health = live.registry().mask_builder().with::<Health>().unwrap().build();
        let e = live.entities().iter().next().unwrap();

        let a = convoy.acquire_view(&live, &position).unwrap();
        assert_eq!(a.world().get::<Health>(e), None);
        let b = convoy.acquire_view(&live, &health).unwrap();
        assert!(!Arc::ptr_eq(a.world(), b.world()));
        assert_eq!(b.world().get::<Health>(e), Some(&Health(7)));
        assert_eq!(b.world().get::<Position>(e), Some(&Position(4)));

        // the widened snapshot now serves both masks
        let c = convoy.acquire_view(&live, &position).unwrap();
        assert!(Arc::ptr_eq(b.world(), c.world()));
        assert_eq!(convoy.stats().materializations, 2);
        assert_eq!(convoy.stats().shares, 1);
        assert_eq!(convoy.mask(), position.union(&health));

        convoy.release_view(b).unwrap();
        convoy.release_view(a).unwrap();
        assert_eq!(pool.free_count(), 1);
        assert_eq!(convoy.stats().live_snapshots, 1);
        convoy.release_view(c).unwrap();
        assert_eq!(pool.free_count(), 2);
        assert_eq!(convoy.outstanding(), 0);
    }
}
