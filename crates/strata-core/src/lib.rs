//! Strata Core - Chunked component store with a change-version ledger
//!
//! This crate provides the storage substrate the scheduler builds on:
//! - Generational entity handles (`Entity`)
//! - A write-then-freeze type-policy registry (`RegistryBuilder`, `TypeRegistry`)
//! - Chunk-partitioned component tables with per-chunk write versions
//! - Structural deep cloning for shared mutable component types (`DeepClone`)
//! - Dirty-diff synchronization between a live world and its replicas (`sync`)
//! - Per-frame event streams and deferred command buffers
//!
//! ## Example
//!
//! ```rust
//! use strata_core::{sync, Component, RegistryBuilder, SyncOptions, TypePolicy, World};
//! use std::sync::Arc;
//!
//! #[derive(Clone, Debug, PartialEq)]
//! struct Position(f32, f32);
//! impl Component for Position {}
//!
//! let mut builder = RegistryBuilder::new();
//! builder.register::<Position>(TypePolicy::SNAPSHOTABLE).unwrap();
//! let registry = builder.build();
//!
//! let mut live = World::new(Arc::clone(&registry));
//! let e = live.spawn();
//! live.insert(e, Position(1.0, 2.0)).unwrap();
//!
//! let mut replica = World::new(registry);
//! let stats = sync(&live, &mut replica, &SyncOptions::default()).unwrap();
//! assert_eq!(stats.chunks_copied, 1);
//! assert_eq!(replica.get::<Position>(e), Some(&Position(1.0, 2.0)));
//! ```

mod clone;
mod command;
mod error;
mod event;
mod identity;
mod policy;
mod registry;
mod sync;
mod table;
pub mod time;
mod world;

pub use clone::{deep_clone, CloneGuard, DeepClone, DEFAULT_CLONE_DEPTH};
pub use command::{Command, CommandBuffer, ComponentWrite, EventWrite, SpawnCommands};
pub use error::{CloneError, Error, Result};
pub use event::{Event, EventKey, EventStream};
pub use identity::{ComponentId, Entity};
pub use policy::{Component, Mutability, TypePolicy};
pub use registry::{ComponentKey, MaskBuilder, RegistryBuilder, TypeInfo, TypeMask, TypeRegistry};
pub use sync::{default_types, sync, SyncOptions, SyncStats};
pub use table::{ComponentTable, TableSync, CHUNK_SIZE};
pub use time::{Clock, Frame};
pub use world::{Entities, World};
