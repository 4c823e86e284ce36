//! Module contract and registration settings

use crate::View;
use std::fmt;
use std::time::Duration;
use strata_core::{Component, ComponentKey, Event, EventKey};

/// Error type returned by module code
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result of one module execution
pub type ModuleResult = std::result::Result<(), BoxError>;

/// A unit of background work scheduled against a consistent view
///
/// `elapsed` is the simulation time since the module last ran successfully
/// (or since registration), not the delta of a single tick.
///
/// Any `Fn(&mut View, Duration) -> ModuleResult` closure is a module:
///
/// ```
/// use strata_hub::{Module, ModuleResult, View};
/// use std::time::Duration;
///
/// fn assert_module<M: Module>(_: M) {}
/// assert_module(|_view: &mut View, _elapsed: Duration| -> ModuleResult { Ok(()) });
/// ```
pub trait Module: Send + Sync + 'static {
    fn execute(&self, view: &mut View, elapsed: Duration) -> ModuleResult;
}

impl<F> Module for F
where
    F: Fn(&mut View, Duration) -> ModuleResult + Send + Sync + 'static,
{
    fn execute(&self, view: &mut View, elapsed: Duration) -> ModuleResult {
        self(view, elapsed)
    }
}

/// Identifier of a registered module, in registration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub usize);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module:{}", self.0)
    }
}

/// Cost/latency class, which selects the module's snapshot provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Tier {
    /// Reads the persistent replica
    #[default]
    Realtime,
    /// Gets its own pooled snapshot per run
    OnDemand,
    /// Shares one pooled snapshot per frame with the rest of the named convoy
    Convoy(String),
}

/// Registration settings for one module
///
/// # Example
///
/// ```
/// use strata_hub::{ModuleSettings, Tier};
/// use std::time::Duration;
///
/// #[derive(Clone)]
/// struct Position(f32);
/// impl strata_core::Component for Position {}
///
/// #[derive(Clone)]
/// struct Explosion;
///
/// let settings = ModuleSettings::new("threat-ai")
///     .tier(Tier::Convoy("ai".into()))
///     .frequency(6)
///     .reads::<Position>()
///     .watch_event::<Explosion>()
///     .max_runtime(Duration::from_millis(50));
/// assert_eq!(settings.name(), "threat-ai");
/// ```
#[derive(Debug, Clone)]
pub struct ModuleSettings {
    pub(crate) name: String,
    pub(crate) tier: Tier,
    pub(crate) frequency: u64,
    pub(crate) reads: Vec<ComponentKey>,
    pub(crate) watched_components: Vec<ComponentKey>,
    pub(crate) watched_events: Vec<EventKey>,
    pub(crate) max_runtime: Option<Duration>,
    pub(crate) failure_threshold: Option<u32>,
    pub(crate) cooldown: Option<Duration>,
}

impl ModuleSettings {
    /// Realtime module running every frame
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tier: Tier::Realtime,
            frequency: 1,
            reads: Vec::new(),
            watched_components: Vec::new(),
            watched_events: Vec::new(),
            max_runtime: None,
            failure_threshold: None,
            cooldown: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    /// Run every `frames` frames
    pub fn frequency(mut self, frames: u64) -> Self {
        self.frequency = frames;
        self
    }

    /// Component types the module reads; selects a snapshot's mask
    ///
    /// With no reads declared a snapshot carries every snapshotable type.
    pub fn reads<T: Component>(mut self) -> Self {
        self.reads.push(ComponentKey::of::<T>());
        self
    }

    /// Also run whenever a `T` table changes
    pub fn watch_component<T: Component>(mut self) -> Self {
        self.watched_components.push(ComponentKey::of::<T>());
        self
    }

    /// Also run in any frame where an `E` is published
    pub fn watch_event<E: Event>(mut self) -> Self {
        self.watched_events.push(EventKey::of::<E>());
        self
    }

    pub fn max_runtime(mut self, limit: Duration) -> Self {
        self.max_runtime = Some(limit);
        self
    }

    pub fn failure_threshold(mut self, failures: u32) -> Self {
        self.failure_threshold = Some(failures);
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    /// Reason the settings are unusable, if any
    pub(crate) fn problem(&self) -> Option<String> {
        if self.name.trim().is_empty() {
            return Some("name must not be empty".into());
        }
        if self.frequency == 0 {
            return Some("frequency must be at least 1".into());
        }
        if let Tier::Convoy(convoy) = &self.tier {
            if convoy.trim().is_empty() {
                return Some("convoy name must not be empty".into());
            }
        }
        if self.max_runtime == Some(Duration::ZERO) {
            return Some("max_runtime must be positive".into());
        }
        if self.failure_threshold == Some(0) {
            return Some("failure_threshold must be at least 1".into());
        }
        None
    }
}
