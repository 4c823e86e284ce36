//! Snapshot pool and the pooled on-demand provider
//!
//! The pool is a bounded free list of worlds. A returned snapshot keeps its
//! contents and chunk versions but forgets its per-type sync marks, so the
//! next borrower's diff-sync still skips every chunk that did not change in
//! between.
//!
//! Only the free list is synchronized. A snapshot is owned exclusively by
//! whoever holds it between take and give-back.

use crate::provider::{LeaseLedger, ProviderId, ProviderKind, SnapshotProvider, ViewLease};
use crate::{Error, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use strata_core::{sync, SyncOptions, SyncStats, TypeMask, TypeRegistry, World};
use tracing::{debug, warn};

#[derive(Debug)]
struct PoolState {
    free: Vec<World>,
    /// Snapshots alive, free or handed out
    allocated: usize,
    reused: u64,
    discarded: u64,
}

/// Bounded free list of snapshot worlds
#[derive(Debug)]
pub struct SnapshotPool {
    registry: Arc<TypeRegistry>,
    capacity: usize,
    state: Mutex<PoolState>,
}

impl SnapshotPool {
    /// Create a pool holding at most `capacity` snapshots, `prewarm` of them allocated now
    pub fn new(registry: Arc<TypeRegistry>, capacity: usize, prewarm: usize) -> Self {
        let capacity = capacity.max(1);
        let prewarm = prewarm.min(capacity);
        let free = (0..prewarm).map(|_| World::new(Arc::clone(&registry))).collect();
        Self {
            registry,
            capacity,
            state: Mutex::new(PoolState {
                free,
                allocated: prewarm,
                reused: 0,
                discarded: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshots waiting on the free list
    pub fn free_count(&self) -> usize {
        self.lock().free.len()
    }

    /// Pop a free snapshot or allocate one, up to capacity
    pub fn take(&self) -> Result<World> {
        let mut state = self.lock();
        if let Some(world) = state.free.pop() {
            state.reused += 1;
            return Ok(world);
        }
        if state.allocated >= self.capacity {
            return Err(Error::PoolExhausted {
                capacity: self.capacity,
            });
        }
        state.allocated += 1;
        drop(state);
        debug!(capacity = self.capacity, "allocating pooled snapshot");
        Ok(World::new(Arc::clone(&self.registry)))
    }

    /// Return a snapshot to the free list
    pub fn give_back(&self, mut world: World) {
        world.forget_sync_marks();
        world.events_mut().clear();
        self.lock().free.push(world);
    }

    /// Give up on a snapshot that is still referenced elsewhere
    ///
    /// The slot is freed for a new allocation; the world itself is dropped by
    /// its last holder.
    pub fn discard(&self) {
        let mut state = self.lock();
        state.allocated = state.allocated.saturating_sub(1);
        state.discarded += 1;
    }

    /// Return a shared snapshot if this was its last reference, else discard it
    pub(crate) fn recycle(&self, world: Arc<World>) {
        match Arc::try_unwrap(world) {
            Ok(world) => self.give_back(world),
            Err(_) => {
                warn!("snapshot still referenced by an abandoned reader; discarding");
                self.discard();
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            capacity: self.capacity,
            allocated: state.allocated,
            free: state.free.len(),
            reused: state.reused,
            discarded: state.discarded,
        }
    }
}

/// Statistics about a snapshot pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub allocated: usize,
    pub free: usize,
    /// Takes served from the free list
    pub reused: u64,
    /// Snapshots given up because an abandoned reader still held them
    pub discarded: u64,
}

impl PoolStats {
    /// Snapshots currently handed out
    pub fn in_use(&self) -> usize {
        self.allocated - self.free
    }
}

/// On-demand provider: each acquisition diffs a pooled snapshot against the live world
#[derive(Debug)]
pub struct PooledSnapshotProvider {
    id: ProviderId,
    pool: Arc<SnapshotPool>,
    leases: LeaseLedger,
}

impl PooledSnapshotProvider {
    pub fn new(pool: Arc<SnapshotPool>) -> Self {
        Self {
            id: ProviderId::next(),
            pool,
            leases: LeaseLedger::default(),
        }
    }

    pub fn pool(&self) -> &Arc<SnapshotPool> {
        &self.pool
    }
}

/// Take a pooled snapshot and diff it against `live` for exactly `mask`
pub(crate) fn materialize(
    pool: &SnapshotPool,
    live: &World,
    mask: &TypeMask,
) -> Result<(World, SyncStats)> {
    let options = SyncOptions::with_mask(mask.clone());
    let mut world = pool.take()?;
    world.retain_types(&options.effective_mask(live.registry()));
    match sync(live, &mut world, &options) {
        Ok(stats) => Ok((world, stats)),
        Err(err) => {
            pool.give_back(world);
            Err(err.into())
        }
    }
}

impl SnapshotProvider for PooledSnapshotProvider {
    fn id(&self) -> ProviderId {
        self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::PooledSnapshot
    }

    fn update(&self, _live: &World) -> Result<SyncStats> {
        Ok(SyncStats::default())
    }

    fn acquire_view(&self, live: &World, mask: &TypeMask) -> Result<ViewLease> {
        let (world, stats) = materialize(&self.pool, live, mask)?;
        debug!(
            provider = %self.id,
            copied = stats.chunks_copied,
            skipped = stats.chunks_skipped,
            "materialized on-demand snapshot"
        );
        let lease = ViewLease::new(self.id, live.clock().frame, Arc::new(world));
        self.leases.issue(&lease);
        Ok(lease)
    }

    fn release_view(&self, lease: ViewLease) -> Result<()> {
        self.leases.retire(self.id, &lease)?;
        self.pool.recycle(lease.into_world());
        Ok(())
    }

    fn outstanding(&self) -> usize {
        self.leases.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
        world.insert(e, Position(3)).unwrap();
        world.insert(e, Health(9)).unwrap();
        world
    }

    #[test]
    fn test_pool_prewarm_and_capacity() {
        let world = live();
        let pool = SnapshotPool::new(Arc::clone(world.registry()), 2, 1);
        assert_eq!(pool.free_count(), 1);

        let a = pool.take().unwrap();
        let b = pool.take().unwrap();
        assert!(matches!(pool.take(), Err(Error::PoolExhausted { capacity: 2 })));

        pool.give_back(a);
        pool.give_back(b);
        assert_eq!(pool.stats().free, 2);
        assert_eq!(pool.stats().in_use(), 0);
    }

    #[test]
    fn test_acquire_syncs_only_requested_types() {
        let live = live();
        let pool = Arc::new(SnapshotPool::new(Arc::clone(live.registry()), 4, 0));
        let provider = PooledSnapshotProvider::new(Arc::clone(&pool));

        let mask = live.registry().mask_builder().with::<Position>().unwrap().build();
        let lease = provider.acquire_view(&live, &mask).unwrap();
        let e = live.entities().iter().next().unwrap();

        assert_eq!(lease.world().get::<Position>(e), Some(&Position(3)));
        assert!(lease.world().get::<Health>(e).is_none());
        assert_eq!(provider.outstanding(), 1);

        provider.release_view(lease).unwrap();
        assert_eq!(provider.outstanding(), 0);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_reused_snapshot_drops_types_outside_new_mask() {
        let live = live();
        let pool = Arc::new(SnapshotPool::new(Arc::clone(live.registry()), 1, 0));
        let provider = PooledSnapshotProvider::new(Arc::clone(&pool));
        let e = live.entities().iter().next().unwrap();

        let both = live.registry().snapshotable();
        let lease = provider.acquire_view(&live, &both).unwrap();
        assert!(lease.world().get::<Health>(e).is_some());
        provider.release_view(lease).unwrap();

        let position = live.registry().mask_builder().with::<Position>().unwrap().build();
        let lease = provider.acquire_view(&live, &position).unwrap();
        assert!(lease.world().get::<Health>(e).is_none());
        assert_eq!(lease.world().get::<Position>(e), Some(&Position(3)));
        provider.release_view(lease).unwrap();
        assert_eq!(pool.stats().reused, 1);
    }

    #[test]
    fn test_foreign_lease_rejected() {
        let live = live();
        let pool = Arc::new(SnapshotPool::new(Arc::clone(live.registry()), 4, 0));
        let a = PooledSnapshotProvider::new(Arc::clone(&pool));
        let b = PooledSnapshotProvider::new(Arc::clone(&pool));

        let lease = a.acquire_view(&live, &live.registry().all()).unwrap();
        let err = b.release_view(lease).unwrap_err();
        assert!(matches!(err, Error::ForeignLease { .. }));
        assert!(err.is_lease_violation());
    }

    #[test]
    fn test_abandoned_reader_snapshot_discarded() {
        let live = live();
        let pool = Arc::new(SnapshotPool::new(Arc::clone(live.registry()), 1, 0));
        let provider = PooledSnapshotProvider::new(Arc::clone(&pool));

        let lease = provider.acquire_view(&live, &live.registry().all()).unwrap();
        let reader = Arc::clone(lease.world());
        provider.release_view(lease).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.free, 0);
        assert_eq!(stats.allocated, 0);
        assert_eq!(reader.entities().len(), 1);

        // the freed slot can be allocated again
        let lease = provider.acquire_view(&live, &live.registry().all()).unwrap();
        provider.release_view(lease).unwrap();
    }
}
