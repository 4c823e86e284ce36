//! Scheduler - central coordinator for background modules
//!
//! The scheduler owns the live world and drives one tick at a time:
//!
//! 1. advance the frame and capture its events into the accumulator
//! 2. bring every snapshot provider up to date (the sync barrier)
//! 3. pick the modules due this frame, honoring in-flight work and breakers
//! 4. acquire a view for each of them before any is dispatched
//! 5. dispatch in waves of at most `max_parallel` and wait up to each deadline
//! 6. release views, settle outcomes and feed the breakers
//! 7. play back command buffers in registration order
//!
//! Module failures never escape a tick; they are reported in the
//! [`TickReport`]. An `Err` from [`Scheduler::tick`] means a provider could
//! not sync or a lease was mishandled. The frame still completes: live events
//! are cleared and the buffers of modules that already finished are played
//! back before the error is returned.

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::config::{max_cores, SchedulerConfig};
use crate::error::{Error, Result};
use crate::module::{Module, ModuleId, ModuleResult, ModuleSettings, Tier};
use crate::playback::{playback, PlaybackReport};
use crate::pool::{PoolStats, PooledSnapshotProvider, SnapshotPool};
use crate::provider::{ProviderKind, SnapshotProvider, ViewGuard};
use crate::replica::PersistentReplica;
use crate::shared::{ConvoyStats, SharedSnapshotProvider};
use crate::view::View;
use crate::worker::{dispatch, ModuleFailure, Outcome};
use indexmap::IndexMap;
use std::any::TypeId;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strata_core::{CommandBuffer, EventStream, Frame, SyncStats, TypeMask, World};
use strata_history::{EventAccumulator, HistoryGap};
use tracing::{debug, info, warn};

/// What happened during one tick
#[derive(Debug, Default)]
pub struct TickReport {
    /// Frame the tick produced
    pub frame: Frame,
    /// Work done by the provider barrier
    pub sync: SyncStats,
    /// Modules handed to a worker, in dispatch order
    pub dispatched: Vec<ModuleId>,
    pub succeeded: Vec<ModuleId>,
    pub failures: Vec<(ModuleId, ModuleFailure)>,
    /// Due modules held back by an open breaker
    pub skipped_by_breaker: Vec<ModuleId>,
    /// Due modules whose previous execution has not returned yet
    pub skipped_in_flight: Vec<ModuleId>,
    /// Due modules that got no snapshot because the pool was exhausted
    pub starved: Vec<ModuleId>,
    /// Modules that received partial event history
    pub history_gaps: Vec<(ModuleId, HistoryGap)>,
    pub playback: PlaybackReport,
}

impl TickReport {
    /// Whether `id` ran and succeeded this tick
    pub fn ran(&self, id: ModuleId) -> bool {
        self.succeeded.contains(&id)
    }

    /// Failure recorded for `id` this tick, if any
    pub fn failure(&self, id: ModuleId) -> Option<&ModuleFailure> {
        self.failures
            .iter()
            .find(|(failed, _)| *failed == id)
            .map(|(_, failure)| failure)
    }
}

/// Running totals across every tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub dispatches: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub panics: u64,
    /// Executions that started with an incomplete event history
    pub history_gaps: u64,
    /// Commands that failed during playback
    pub playback_failures: u64,
    /// Transitions of any breaker into the open state
    pub breaker_trips: u64,
    /// Due executions skipped for lack of a snapshot
    pub starvations: u64,
}

/// Per-module scheduling state
struct ModuleEntry {
    id: ModuleId,
    name: Arc<str>,
    module: Arc<dyn Module>,
    tier: Tier,
    frequency: u64,
    provider: Arc<dyn SnapshotProvider>,
    mask: TypeMask,
    watched_components: TypeMask,
    watched_events: HashSet<TypeId>,
    max_runtime: Duration,
    breaker: CircuitBreaker,
    frames_since_last_run: u64,
    last_run_time: Duration,
    last_seen_frame: Frame,
    last_seen_version: u64,
    in_flight: Arc<AtomicBool>,
}

impl ModuleEntry {
    fn timer_due(&self) -> bool {
        self.frames_since_last_run + 1 >= self.frequency
    }

    fn reactive_due(&self, active: &HashSet<TypeId>, live: &World) -> bool {
        if self.watched_events.iter().any(|t| active.contains(t)) {
            return true;
        }
        !self.watched_components.is_empty()
            && live.has_changes_in(&self.watched_components, self.last_seen_version)
    }

    fn skip(&mut self) {
        self.frames_since_last_run += 1;
    }
}

/// A due module with its view ready, waiting for a worker
struct Prepared {
    index: usize,
    guard: ViewGuard,
    view: View,
    elapsed: Duration,
    newest_frame: Frame,
}

/// Owns the live world and schedules modules against snapshots of it
///
/// # Example
///
/// ```
/// use strata_core::{Component, RegistryBuilder, TypePolicy, World};
/// use strata_hub::{ModuleSettings, Scheduler, View};
/// use std::time::Duration;
///
/// #[derive(Debug, Clone, PartialEq)]
/// struct Health(u32);
/// impl Component for Health {}
///
/// let mut builder = RegistryBuilder::new();
/// builder.register::<Health>(TypePolicy::SNAPSHOTABLE).unwrap();
/// let mut world = World::new(builder.build());
/// let hero = world.spawn();
/// world.insert(hero, Health(10)).unwrap();
///
/// let mut scheduler = Scheduler::new(world);
/// scheduler
///     .register_fn(ModuleSettings::new("regen").frequency(2), move |view: &mut View, _| {
///         if let Some(Health(hp)) = view.get_cloned::<Health>(hero) {
///             view.commands().insert(hero, Health(hp + 1));
///         }
///         Ok(())
///     })
///     .unwrap();
///
/// for _ in 0..4 {
///     scheduler.tick(Duration::from_millis(16)).unwrap();
/// }
/// assert_eq!(scheduler.world().get::<Health>(hero), Some(&Health(12)));
/// ```
pub struct Scheduler {
    world: World,
    config: SchedulerConfig,
    accumulator: EventAccumulator,
    pool: Arc<SnapshotPool>,
    replica: Option<Arc<PersistentReplica>>,
    on_demand: Option<Arc<PooledSnapshotProvider>>,
    convoys: IndexMap<String, Arc<SharedSnapshotProvider>>,
    /// Every provider in creation order; all of them take part in the barrier
    providers: Vec<Arc<dyn SnapshotProvider>>,
    entries: Vec<ModuleEntry>,
    stats: SchedulerStats,
}

impl Scheduler {
    /// Create a scheduler with the default configuration
    pub fn new(world: World) -> Self {
        let config = SchedulerConfig::default();
        let accumulator = EventAccumulator::new(config.history_depth);
        let pool = Arc::new(SnapshotPool::new(
            Arc::clone(world.registry()),
            config.pool_capacity,
            config.pool_prewarm,
        ));
        Self {
            world,
            config,
            accumulator,
            pool,
            replica: None,
            on_demand: None,
            convoys: IndexMap::new(),
            providers: Vec::new(),
            entries: Vec::new(),
            stats: SchedulerStats::default(),
        }
    }

    /// Create a scheduler with a specific configuration
    pub fn with_config(world: World, config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        let mut scheduler = Self::new(world);
        scheduler.accumulator = EventAccumulator::new(config.history_depth);
        scheduler.pool = Arc::new(SnapshotPool::new(
            Arc::clone(scheduler.world.registry()),
            config.pool_capacity,
            config.pool_prewarm,
        ));
        info!(
            history_depth = config.history_depth,
            max_parallel = config.parallelism(),
            pool_capacity = config.pool_capacity,
            "scheduler configured"
        );
        scheduler.config = config;
        Ok(scheduler)
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    /// Mutable access to the live world between ticks
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Change how many modules run concurrently; takes effect next tick
    ///
    /// The value is clamped to `[1, max_cores()]`.
    pub fn set_max_parallel(&mut self, n: usize) {
        self.config.max_parallel = n.clamp(1, max_cores());
    }

    /// Current frame of the live world
    pub fn frame(&self) -> Frame {
        self.world.clock().frame
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    pub fn accumulator(&self) -> &EventAccumulator {
        &self.accumulator
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Statistics of a named convoy, if any module joined it
    pub fn convoy_stats(&self, convoy: &str) -> Option<ConvoyStats> {
        self.convoys.get(convoy).map(|provider| provider.stats())
    }

    pub fn module_count(&self) -> usize {
        self.entries.len()
    }

    /// Look up a module by name
    pub fn module_id(&self, name: &str) -> Option<ModuleId> {
        self.entries
            .iter()
            .find(|entry| &*entry.name == name)
            .map(|entry| entry.id)
    }

    pub fn module_name(&self, id: ModuleId) -> Result<&str> {
        Ok(&self.entry(id)?.name)
    }

    pub fn module_tier(&self, id: ModuleId) -> Result<&Tier> {
        Ok(&self.entry(id)?.tier)
    }

    /// Strategy of the provider serving a module
    pub fn provider_kind(&self, id: ModuleId) -> Result<ProviderKind> {
        Ok(self.entry(id)?.provider.kind())
    }

    pub fn breaker_state(&self, id: ModuleId) -> Result<BreakerState> {
        Ok(self.entry(id)?.breaker.state())
    }

    /// Close a module's breaker and forget its failure streak
    pub fn reset_breaker(&mut self, id: ModuleId) -> Result<()> {
        let entry = self.entry_mut(id)?;
        entry.breaker.reset();
        info!(module = %entry.name, "breaker reset");
        Ok(())
    }

    /// Whether an earlier execution of the module is still running
    pub fn is_in_flight(&self, id: ModuleId) -> Result<bool> {
        Ok(self.entry(id)?.in_flight.load(Ordering::Acquire))
    }

    fn entry(&self, id: ModuleId) -> Result<&ModuleEntry> {
        self.entries.get(id.0).ok_or(Error::UnknownModule(id))
    }

    fn entry_mut(&mut self, id: ModuleId) -> Result<&mut ModuleEntry> {
        self.entries.get_mut(id.0).ok_or(Error::UnknownModule(id))
    }

    /// Register a module
    pub fn register<M: Module>(&mut self, settings: ModuleSettings, module: M) -> Result<ModuleId> {
        self.register_shared(settings, Arc::new(module))
    }

    /// Register a closure as a module
    ///
    /// Same as [`register`](Self::register), but lets the closure's argument
    /// types be inferred.
    pub fn register_fn<F>(&mut self, settings: ModuleSettings, f: F) -> Result<ModuleId>
    where
        F: Fn(&mut View, Duration) -> ModuleResult + Send + Sync + 'static,
    {
        self.register(settings, f)
    }

    /// Register a module that is already shared
    pub fn register_shared(
        &mut self,
        settings: ModuleSettings,
        module: Arc<dyn Module>,
    ) -> Result<ModuleId> {
        if let Some(reason) = settings.problem() {
            return Err(Error::InvalidModuleSettings {
                module: settings.name,
                reason,
            });
        }
        if self.module_id(&settings.name).is_some() {
            return Err(Error::DuplicateModule(settings.name));
        }

        let registry = Arc::clone(self.world.registry());
        let mask = if settings.reads.is_empty() {
            registry.snapshotable()
        } else {
            registry.mask_of(&settings.reads)?
        };
        let watched_components = registry.mask_of(&settings.watched_components)?;
        let watched_events = settings
            .watched_events
            .iter()
            .map(|key| key.type_id)
            .collect();

        if settings.frequency > self.config.history_depth as u64 {
            warn!(
                module = %settings.name,
                frequency = settings.frequency,
                history_depth = self.config.history_depth,
                "run interval exceeds retained event history; the module will miss events"
            );
        }

        let provider = self.provider_for(&settings.tier, &mask);
        if settings.tier == Tier::Realtime && !mask.is_subset(&registry.snapshotable()) {
            warn!(
                module = %settings.name,
                "realtime replica carries snapshotable types only; other reads will be empty"
            );
        }

        let id = ModuleId(self.entries.len());
        let name: Arc<str> = Arc::from(settings.name.as_str());
        let clock = *self.world.clock();
        info!(
            module = %name,
            %id,
            tier = ?settings.tier,
            frequency = settings.frequency,
            "module registered"
        );

        self.entries.push(ModuleEntry {
            id,
            name,
            module,
            tier: settings.tier,
            frequency: settings.frequency,
            provider,
            mask,
            watched_components,
            watched_events,
            max_runtime: settings
                .max_runtime
                .unwrap_or_else(|| self.config.default_max_runtime()),
            breaker: CircuitBreaker::new(
                settings
                    .failure_threshold
                    .unwrap_or(self.config.default_failure_threshold),
                settings
                    .cooldown
                    .unwrap_or_else(|| self.config.default_cooldown()),
            ),
            frames_since_last_run: 0,
            last_run_time: clock.time,
            last_seen_frame: clock.frame,
            last_seen_version: self.world.version(),
            in_flight: Arc::new(AtomicBool::new(false)),
        });
        Ok(id)
    }

    /// Provider for a tier, created on first use
    fn provider_for(&mut self, tier: &Tier, mask: &TypeMask) -> Arc<dyn SnapshotProvider> {
        match tier {
            Tier::Realtime => {
                if let Some(replica) = &self.replica {
                    return Arc::clone(replica) as Arc<dyn SnapshotProvider>;
                }
                let replica = Arc::new(PersistentReplica::new(Arc::clone(self.world.registry())));
                self.providers.push(Arc::clone(&replica) as Arc<dyn SnapshotProvider>);
                self.replica = Some(Arc::clone(&replica));
                replica
            }
            Tier::OnDemand => {
                if let Some(provider) = &self.on_demand {
                    return Arc::clone(provider) as Arc<dyn SnapshotProvider>;
                }
                let provider = Arc::new(PooledSnapshotProvider::new(Arc::clone(&self.pool)));
                self.providers.push(Arc::clone(&provider) as Arc<dyn SnapshotProvider>);
                self.on_demand = Some(Arc::clone(&provider));
                provider
            }
            Tier::Convoy(convoy) => {
                let provider = match self.convoys.get(convoy) {
                    Some(provider) => Arc::clone(provider),
                    None => {
                        let provider = Arc::new(SharedSnapshotProvider::new(
                            convoy.clone(),
                            Arc::clone(&self.pool),
                        ));
                        self.providers.push(Arc::clone(&provider) as Arc<dyn SnapshotProvider>);
                        self.convoys.insert(convoy.clone(), Arc::clone(&provider));
                        provider
                    }
                };
                provider.join(mask);
                provider
            }
        }
    }

    /// Run one tick of `delta` simulation time
    pub fn tick(&mut self, delta: Duration) -> Result<TickReport> {
        let frame = self.world.advance_frame(delta);
        let now = self.world.clock().time;
        let mut report = TickReport {
            frame,
            ..TickReport::default()
        };

        // Events published since the previous tick belong to this frame
        self.accumulator.capture_frame(self.world.events(), frame);
        let active: HashSet<TypeId> = self.world.events().active_types().collect();

        let mut collected: Vec<(usize, CommandBuffer)> = Vec::new();
        let outcome = self.run_modules(&active, now, &mut report, &mut collected);

        // Captured above; the next frame starts with an empty live stream
        self.world.events_mut().clear();

        collected.sort_by_key(|(index, _)| *index);
        for (index, mut commands) in collected {
            let name = Arc::clone(&self.entries[index].name);
            let result = playback(&name, &mut commands, &mut self.world);
            self.stats.playback_failures += result.failures.len() as u64;
            report.playback.merge(result);
        }

        self.stats.ticks += 1;
        debug!(
            frame,
            dispatched = report.dispatched.len(),
            failed = report.failures.len(),
            applied = report.playback.applied,
            "tick complete"
        );
        outcome.map(|()| report)
    }

    /// Provider barrier, run-set, dispatch and settlement
    ///
    /// Commands of settled modules are pushed to `collected` as they finish,
    /// so they are played back even when a later step fails.
    fn run_modules(
        &mut self,
        active: &HashSet<TypeId>,
        now: Duration,
        report: &mut TickReport,
        collected: &mut Vec<(usize, CommandBuffer)>,
    ) -> Result<()> {
        for provider in &self.providers {
            report.sync.merge(provider.update(&self.world)?);
        }

        let due = self.select_due(active, now, report);
        let prepared = self.prepare(due, now, report)?;

        // Version the views were taken at; later playback marks new changes
        let version = self.world.version();
        let wave_size = self.config.parallelism();
        let mut queue = prepared.into_iter();
        loop {
            let wave: Vec<Prepared> = queue.by_ref().take(wave_size).collect();
            if wave.is_empty() {
                return Ok(());
            }

            let mut running = Vec::with_capacity(wave.len());
            for item in wave {
                let entry = &self.entries[item.index];
                report.dispatched.push(entry.id);
                self.stats.dispatches += 1;
                let execution = dispatch(
                    &entry.name,
                    Arc::clone(&entry.module),
                    item.view,
                    item.elapsed,
                    entry.max_runtime,
                    Arc::clone(&entry.in_flight),
                );
                running.push((item.index, item.guard, item.newest_frame, execution));
            }

            let mut violation = None;
            for (index, guard, newest_frame, execution) in running {
                let outcome = match execution {
                    Ok(execution) => execution.join(),
                    Err(failure) => Err(failure),
                };
                let released = guard.release();
                if let Some(commands) =
                    self.settle(index, outcome, newest_frame, version, now, report)
                {
                    collected.push((index, commands));
                }
                if let Err(err) = released {
                    violation.get_or_insert(err);
                }
            }
            if let Some(err) = violation {
                return Err(err);
            }
        }
    }

    /// Indices of the modules that run this frame, in registration order
    fn select_due(
        &mut self,
        active: &HashSet<TypeId>,
        now: Duration,
        report: &mut TickReport,
    ) -> Vec<usize> {
        let mut due = Vec::new();
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if !entry.timer_due() && !entry.reactive_due(active, &self.world) {
                entry.skip();
                continue;
            }
            if entry.in_flight.load(Ordering::Acquire) {
                debug!(module = %entry.name, frame = report.frame, "previous run still in flight");
                entry.skip();
                report.skipped_in_flight.push(entry.id);
                continue;
            }
            if !entry.breaker.allow(now) {
                debug!(module = %entry.name, frame = report.frame, "breaker open");
                entry.skip();
                report.skipped_by_breaker.push(entry.id);
                continue;
            }
            due.push(index);
        }
        due
    }

    /// Acquire a view for every due module before any of them runs
    fn prepare(
        &mut self,
        due: Vec<usize>,
        now: Duration,
        report: &mut TickReport,
    ) -> Result<Vec<Prepared>> {
        let mut prepared = Vec::with_capacity(due.len());
        for index in due {
            let entry = &mut self.entries[index];
            let guard = match ViewGuard::acquire(Arc::clone(&entry.provider), &self.world, &entry.mask)
            {
                Ok(guard) => guard,
                Err(Error::PoolExhausted { capacity }) => {
                    warn!(
                        module = %entry.name,
                        frame = report.frame,
                        capacity,
                        "no snapshot available; module skipped this frame"
                    );
                    entry.breaker.cancel_trial();
                    entry.skip();
                    report.starved.push(entry.id);
                    self.stats.starvations += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let mut events = EventStream::new();
            let flush = self.accumulator.flush_to(&mut events, entry.last_seen_frame);
            if let Some(gap) = flush.gap {
                warn!(
                    module = %entry.name,
                    first_missing = gap.first_missing,
                    last_missing = gap.last_missing,
                    "event history evicted before the module saw it"
                );
                report.history_gaps.push((entry.id, gap));
                self.stats.history_gaps += 1;
            }

            let view = View::new(Arc::clone(&entry.name), Arc::clone(guard.world()), events);
            prepared.push(Prepared {
                index,
                guard,
                view,
                elapsed: now.saturating_sub(entry.last_run_time),
                newest_frame: flush.newest_frame,
            });
        }
        Ok(prepared)
    }

    /// Record an outcome; returns the commands of a successful run
    fn settle(
        &mut self,
        index: usize,
        outcome: Outcome,
        newest_frame: Frame,
        version: u64,
        now: Duration,
        report: &mut TickReport,
    ) -> Option<CommandBuffer> {
        let entry = &mut self.entries[index];
        match outcome {
            Ok(commands) => {
                if entry.breaker.record_success().is_some() {
                    info!(module = %entry.name, "breaker closed after successful trial");
                }
                entry.frames_since_last_run = 0;
                entry.last_run_time = now;
                entry.last_seen_frame = newest_frame;
                entry.last_seen_version = version;
                report.succeeded.push(entry.id);
                self.stats.successes += 1;
                Some(commands)
            }
            Err(failure) => {
                warn!(module = %entry.name, frame = report.frame, %failure, "module failed");
                if entry.breaker.record_failure(now) == Some(BreakerState::Open) {
                    warn!(
                        module = %entry.name,
                        streak = entry.breaker.streak(),
                        "breaker opened"
                    );
                    self.stats.breaker_trips += 1;
                }
                entry.skip();
                self.stats.failures += 1;
                match &failure {
                    ModuleFailure::Timeout(_) => self.stats.timeouts += 1,
                    ModuleFailure::Panic(_) => self.stats.panics += 1,
                    _ => {}
                }
                report.failures.push((entry.id, failure));
                None
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("frame", &self.frame())
            .field("modules", &self.entries.len())
            .field("providers", &self.providers.len())
            .field("stats", &self.stats)
            .finish()
    }
}
