//! Persistent replica provider
//!
//! One long-lived world, diffed from the live world on every `update` and
//! handed out by reference. Acquisition allocates nothing beyond the lease.

use crate::provider::{LeaseLedger, ProviderId, ProviderKind, SnapshotProvider, ViewLease};
use crate::Result;
use std::sync::{Arc, Mutex, MutexGuard};
use strata_core::{sync, SyncOptions, SyncStats, TypeMask, TypeRegistry, World};
use tracing::{debug, warn};

/// Continuously synced replica shared by every realtime module
#[derive(Debug)]
pub struct PersistentReplica {
    id: ProviderId,
    options: SyncOptions,
    world: Mutex<Arc<World>>,
    leases: LeaseLedger,
}

impl PersistentReplica {
    /// Replica of every snapshotable type
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self::with_options(registry, SyncOptions::default())
    }

    pub fn with_options(registry: Arc<TypeRegistry>, options: SyncOptions) -> Self {
        Self {
            id: ProviderId::next(),
            options,
            world: Mutex::new(Arc::new(World::new(registry))),
            leases: LeaseLedger::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Arc<World>> {
        self.world.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Types this replica carries
    pub fn mask(&self) -> TypeMask {
        self.options.effective_mask(self.lock().registry())
    }
}

impl SnapshotProvider for PersistentReplica {
    fn id(&self) -> ProviderId {
        self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::PersistentReplica
    }

    fn update(&self, live: &World) -> Result<SyncStats> {
        let mut current = self.lock();
        let stats = match Arc::get_mut(&mut current) {
            Some(world) => sync(live, world, &self.options)?,
            None => {
                // A reader from an earlier tick still holds the replica and may
                // hold locks inside it. Rebuild from the live world instead.
                warn!(
                    provider = %self.id,
                    outstanding = self.leases.len(),
                    "replica still referenced; rebuilding from the live world"
                );
                let mut fork = World::new(Arc::clone(current.registry()));
                let stats = sync(live, &mut fork, &self.options)?;
                *current = Arc::new(fork);
                stats
            }
        };
        debug!(
            provider = %self.id,
            copied = stats.chunks_copied,
            skipped = stats.chunks_skipped,
            "replica updated"
        );
        Ok(stats)
    }

    fn acquire_view(&self, live: &World, _mask: &TypeMask) -> Result<ViewLease> {
        let lease = ViewLease::new(self.id, live.clock().frame, Arc::clone(&self.lock()));
        self.leases.issue(&lease);
        Ok(lease)
    }

    fn release_view(&self, lease: ViewLease) -> Result<()> {
        self.leases.retire(self.id, &lease)
    }

    fn outstanding(&self) -> usize {
        self.leases.len()
    }
}
