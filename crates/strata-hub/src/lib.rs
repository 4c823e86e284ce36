//! Strata Hub - background module scheduling over consistent snapshots
//!
//! This crate runs expensive, latency-tolerant modules (AI, pathfinding,
//! analytics) next to a simulation without letting them see a half-updated
//! world or stall the frame.
//!
//! ## Architecture
//!
//! ```text
//! Scheduler (owns the live World)
//!  │
//!  ├── EventAccumulator ← last K frames of events
//!  │
//!  ├── SnapshotProvider (trait) ← Scheduler only acquires/releases through this
//!  │    ├── PersistentReplica        Realtime: one replica, diffed every tick
//!  │    ├── PooledSnapshotProvider   OnDemand: a pooled snapshot per run
//!  │    └── SharedSnapshotProvider   Convoy: one pooled snapshot per frame per convoy
//!  │         └── SnapshotPool
//!  │
//!  └── Module[] ── worker thread ── View ── CommandBuffer ──▶ playback
//! ```
//!
//! ## Key Components
//!
//! - [`Scheduler`]: drives ticks, decides who runs, plays back mutations
//! - [`Module`]: user work; any `Fn(&mut View, Duration) -> ModuleResult`
//! - [`View`]: read-only world, accumulated events and a command sink
//! - [`CircuitBreaker`]: keeps a failing module from running every frame
//!
//! ## Design Principles
//!
//! 1. **Modules never touch the live world** - they read a snapshot and write commands
//! 2. **strata-core is standalone** - it does NOT know about strata-hub
//! 3. **A slow module costs only itself** - it is abandoned at its deadline

mod breaker;
mod config;
mod error;
mod module;
pub mod playback;
mod pool;
mod provider;
mod replica;
mod scheduler;
mod shared;
mod view;
mod worker;

pub use breaker::{BreakerState, CircuitBreaker};
pub use config::{max_cores, SchedulerConfig};
pub use error::{Error, Result};
pub use module::{BoxError, Module, ModuleId, ModuleResult, ModuleSettings, Tier};
pub use playback::{playback, CommandFailure, PlaybackReport};
pub use pool::{PoolStats, PooledSnapshotProvider, SnapshotPool};
pub use provider::{LeaseId, ProviderId, ProviderKind, SnapshotProvider, ViewGuard, ViewLease};
pub use replica::PersistentReplica;
pub use scheduler::{Scheduler, SchedulerStats, TickReport};
pub use shared::{ConvoyStats, SharedSnapshotProvider};
pub use view::View;
pub use worker::ModuleFailure;
