//! Snapshot provider contract
//!
//! A provider hands out point-in-time views of the live world. `update` runs
//! on the coordinating thread once per tick, before any module is dispatched;
//! `acquire_view` and `release_view` may be called from any thread.
//!
//! Every acquisition yields a [`ViewLease`]. Leases are not `Clone`, so a
//! lease can be released at most once; releasing one on the wrong provider,
//! or one its provider does not know, is a protocol violation reported as an
//! error and logged at `error!`.

use crate::{Error, Result};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use strata_core::{Frame, SyncStats, TypeMask, World};
use tracing::error;

static NEXT_PROVIDER: AtomicU64 = AtomicU64::new(1);
static NEXT_LEASE: AtomicU64 = AtomicU64::new(1);

/// Unique identity of a provider instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProviderId(pub u64);

impl ProviderId {
    pub(crate) fn next() -> Self {
        ProviderId(NEXT_PROVIDER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provider:{}", self.0)
    }
}

/// Unique identity of one acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(pub u64);

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lease:{}", self.0)
    }
}

/// Provider strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// Long-lived replica, diffed every tick
    PersistentReplica,
    /// Pooled snapshot materialized per acquisition
    PooledSnapshot,
    /// Pooled snapshot shared by a convoy within one frame
    SharedSnapshot,
}

/// Proof of one acquisition, returned to the provider on release
pub struct ViewLease {
    id: LeaseId,
    provider: ProviderId,
    frame: Frame,
    world: Arc<World>,
}

impl ViewLease {
    pub(crate) fn new(provider: ProviderId, frame: Frame, world: Arc<World>) -> Self {
        Self {
            id: LeaseId(NEXT_LEASE.fetch_add(1, Ordering::Relaxed)),
            provider,
            frame,
            world,
        }
    }

    pub fn id(&self) -> LeaseId {
        self.id
    }

    /// Provider that issued the lease
    pub fn provider(&self) -> ProviderId {
        self.provider
    }

    /// Frame the view was acquired in
    pub fn frame(&self) -> Frame {
        self.frame
    }

    pub fn world(&self) -> &Arc<World> {
        &self.world
    }

    pub(crate) fn into_world(self) -> Arc<World> {
        self.world
    }
}

impl fmt::Debug for ViewLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewLease")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("frame", &self.frame)
            .finish()
    }
}

/// Source of consistent point-in-time views of the live world
pub trait SnapshotProvider: Send + Sync {
    fn id(&self) -> ProviderId;

    fn kind(&self) -> ProviderKind;

    /// Bring the provider up to date with `live`; a no-op for on-demand providers
    fn update(&self, live: &World) -> Result<SyncStats>;

    /// Hand out a view covering at least the types in `mask`
    fn acquire_view(&self, live: &World, mask: &TypeMask) -> Result<ViewLease>;

    /// Return a view previously handed out by this provider
    fn release_view(&self, lease: ViewLease) -> Result<()>;

    /// Leases handed out and not yet released
    fn outstanding(&self) -> usize;
}

/// Bookkeeping of outstanding leases shared by every provider
#[derive(Debug, Default)]
pub(crate) struct LeaseLedger {
    outstanding: Mutex<HashSet<LeaseId>>,
}

impl LeaseLedger {
    fn lock(&self) -> MutexGuard<'_, HashSet<LeaseId>> {
        self.outstanding
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn issue(&self, lease: &ViewLease) {
        self.lock().insert(lease.id);
    }

    /// Check that `lease` belongs to `provider` and retire it
    pub(crate) fn retire(&self, provider: ProviderId, lease: &ViewLease) -> Result<()> {
        if lease.provider != provider {
            error!(
                lease = %lease.id,
                owner = %lease.provider,
                %provider,
                "view released on a provider that did not issue it"
            );
            return Err(Error::ForeignLease {
                lease: lease.id,
                owner: lease.provider,
                provider,
            });
        }
        if !self.lock().remove(&lease.id) {
            error!(lease = %lease.id, %provider, "release of a view that is not outstanding");
            return Err(Error::UnknownLease {
                lease: lease.id,
                provider,
            });
        }
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Scoped acquisition: releases its view when dropped
///
/// Prefer [`ViewGuard::release`], which reports a failed release; the drop
/// path can only log it.
pub struct ViewGuard {
    provider: Arc<dyn SnapshotProvider>,
    lease: Option<ViewLease>,
}

impl ViewGuard {
    pub fn acquire(
        provider: Arc<dyn SnapshotProvider>,
        live: &World,
        mask: &TypeMask,
    ) -> Result<Self> {
        let lease = provider.acquire_view(live, mask)?;
        Ok(Self {
            provider,
            lease: Some(lease),
        })
    }

    pub fn lease(&self) -> Option<&ViewLease> {
        self.lease.as_ref()
    }

    pub fn world(&self) -> &Arc<World> {
        match &self.lease {
            Some(lease) => lease.world(),
            None => unreachable!("lease is only taken by release or drop"),
        }
    }

    pub fn release(mut self) -> Result<()> {
        match self.lease.take() {
            Some(lease) => self.provider.release_view(lease),
            None => Ok(()),
        }
    }
}

impl Drop for ViewGuard {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            let id = lease.id();
            if let Err(err) = self.provider.release_view(lease) {
                error!(lease = %id, %err, "failed to release view on drop");
            }
        }
    }
}

impl fmt::Debug for ViewGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewGuard")
            .field("provider", &self.provider.id())
            .field("lease", &self.lease)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PersistentReplica;
    use strata_core::{Component, RegistryBuilder, TypePolicy};

    #[derive(Debug, Clone, PartialEq)]
    struct Position(i32);
    impl Component for Position {}

    fn setup() -> (World, Arc<dyn SnapshotProvider>) {
        let mut builder = RegistryBuilder::new();
        builder.register::<Position>(TypePolicy::SNAPSHOTABLE).unwrap();
        let registry = builder.build();
        let live = World::new(Arc::clone(&registry));
        let provider: Arc<dyn SnapshotProvider> = Arc::new(PersistentReplica::new(registry));
        (live, provider)
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let (live, provider) = setup();
        let mask = live.registry().snapshotable();
        {
            let guard = ViewGuard::acquire(Arc::clone(&provider), &live, &mask).unwrap();
            assert!(guard.lease().is_some());
            assert_eq!(provider.outstanding(), 1);
        }
        assert_eq!(provider.outstanding(), 0);
    }

    #[test]
    fn test_guard_explicit_release() {
        let (live, provider) = setup();
        let mask = live.registry().snapshotable();
        let guard = ViewGuard::acquire(Arc::clone(&provider), &live, &mask).unwrap();
        assert_eq!(guard.world().clock().frame, 0);
        guard.release().unwrap();
        assert_eq!(provider.outstanding(), 0);
    }

    #[test]
    fn test_ledger_rejects_foreign_and_repeated_retire() {
        let ledger = LeaseLedger::default();
        let owner = ProviderId::next();
        let other = ProviderId::next();
        let world = Arc::new(World::new(RegistryBuilder::new().build()));
        let lease = ViewLease::new(owner, 3, world);
        ledger.issue(&lease);

        let err = ledger.retire(other, &lease).unwrap_err();
        assert!(matches!(err, Error::ForeignLease { .. }));
        assert!(err.is_lease_violation());

        ledger.retire(owner, &lease).unwrap();
        assert_eq!(ledger.len(), 0);
        assert!(matches!(
            ledger.retire(owner, &lease),
            Err(Error::UnknownLease { .. })
        ));
    }

    #[test]
    fn test_lease_ids_are_unique() {
        let world = Arc::new(World::new(RegistryBuilder::new().build()));
        let provider = ProviderId::next();
        let a = ViewLease::new(provider, 1, Arc::clone(&world));
        let b = ViewLease::new(provider, 1, world);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.frame(), 1);
        assert_eq!(a.provider(), provider);
    }
}
