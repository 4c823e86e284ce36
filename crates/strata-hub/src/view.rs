//! The read side handed to a module for one execution
//!
//! A [`View`] pairs a point-in-time world (replica or snapshot) with the
//! module's own event history and mutation sink. The world is shared and
//! read-only; events and commands belong to this execution alone.

use std::sync::Arc;
use std::time::Duration;
use strata_core::{CommandBuffer, Component, Entity, Event, EventStream, Frame, World};

/// Read access to a consistent world plus a deferred mutation sink
pub struct View {
    world: Arc<World>,
    events: EventStream,
    commands: CommandBuffer,
    module: Arc<str>,
}

impl View {
    pub(crate) fn new(module: Arc<str>, world: Arc<World>, events: EventStream) -> Self {
        Self {
            world,
            events,
            commands: CommandBuffer::new(),
            module,
        }
    }

    /// Name of the module this view was built for
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Frame the view reflects
    pub fn frame(&self) -> Frame {
        self.world.clock().frame
    }

    /// Simulation time at that frame
    pub fn time(&self) -> Duration {
        self.world.clock().time
    }

    /// Delta of the tick that produced the frame
    pub fn delta(&self) -> Duration {
        self.world.clock().delta
    }

    /// Store version the view was synced up to
    pub fn version(&self) -> u64 {
        self.world.version()
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn get<T: Component>(&self, entity: Entity) -> Option<&T> {
        self.world.get(entity)
    }

    /// Owned copy of a component
    pub fn get_cloned<T: Component>(&self, entity: Entity) -> Option<T> {
        self.world.get::<T>(entity).cloned()
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.world.is_alive(entity)
    }

    /// Every live entity carrying `T`
    pub fn query<T: Component>(&self) -> impl Iterator<Item = (Entity, &T)> + '_ {
        self.world.query::<T>()
    }

    /// Events of type `E` from every frame since this module last ran, oldest first
    pub fn events<E: Event>(&self) -> &[E] {
        self.events.read::<E>()
    }

    /// Every event delivered to this execution
    pub fn event_stream(&self) -> &EventStream {
        &self.events
    }

    /// Deferred mutations, played back after the tick's modules finish
    pub fn commands(&mut self) -> &mut CommandBuffer {
        &mut self.commands
    }

    pub(crate) fn into_commands(self) -> CommandBuffer {
        self.commands
    }
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("module", &self.module)
            .field("frame", &self.frame())
            .field("events", &self.events.len())
            .field("commands", &self.commands.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{sync, RegistryBuilder, SyncOptions, TypePolicy};

    #[derive(Debug, Clone, PartialEq)]
    struct Position(i32);
    impl Component for Position {}

    #[derive(Debug, Clone, PartialEq)]
    struct Alarm;

    #[test]
    fn test_view_reads_snapshot_and_records_commands() {
        let mut builder = RegistryBuilder::new();
        builder.register::<Position>(TypePolicy::SNAPSHOTABLE).unwrap();
        let registry = builder.build();

        let mut live = World::new(Arc::clone(&registry));
        live.advance_frame(Duration::from_millis(10));
        let e = live.spawn();
        live.insert(e, Position(5)).unwrap();

        let mut snapshot = World::new(registry);
        sync(&live, &mut snapshot, &SyncOptions::default()).unwrap();

        let mut events = EventStream::new();
        events.publish(Alarm);

        let mut view = View::new("watcher".into(), Arc::new(snapshot), events);
        assert_eq!(view.module(), "watcher");
        assert_eq!(view.frame(), 1);
        assert_eq!(view.time(), Duration::from_millis(10));
        assert_eq!(view.get::<Position>(e), Some(&Position(5)));
        assert_eq!(view.get_cloned::<Position>(e), Some(Position(5)));
        assert!(view.is_alive(e));
        assert_eq!(view.query::<Position>().count(), 1);
        assert_eq!(view.events::<Alarm>(), &[Alarm]);

        view.commands().despawn(e);
        let commands = view.into_commands();
        assert_eq!(commands.len(), 1);
    }
}
