//! Deferred mutation buffers
//!
//! Modules never write to the authoritative store. While they run they record
//! [`Command`]s into their own [`CommandBuffer`]; the scheduler plays every
//! buffer back at the end of the tick, in registration order, then clears it.
//!
//! Component and event payloads are type-erased so one buffer can carry writes
//! of any registered type.

use crate::{Component, Entity, Event, EventStream, Result, World};
use std::fmt;

/// A type-erased component value waiting to be inserted
pub trait ComponentWrite: Send {
    fn type_name(&self) -> &'static str;
    fn apply(self: Box<Self>, world: &mut World, entity: Entity) -> Result<()>;
}

struct Insert<T: Component>(T);

impl<T: Component> ComponentWrite for Insert<T> {
    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn apply(self: Box<Self>, world: &mut World, entity: Entity) -> Result<()> {
        world.insert(entity, self.0).map(|_| ())
    }
}

/// A type-erased event waiting to be published
pub trait EventWrite: Send {
    fn type_name(&self) -> &'static str;
    fn publish_into(self: Box<Self>, stream: &mut EventStream);
}

struct Publish<E: Event>(E);

impl<E: Event> EventWrite for Publish<E> {
    fn type_name(&self) -> &'static str {
        std::any::type_name::<E>()
    }

    fn publish_into(self: Box<Self>, stream: &mut EventStream) {
        stream.publish(self.0);
    }
}

type RemoveFn = fn(&mut World, Entity) -> Result<()>;

fn remove_component<T: Component>(world: &mut World, entity: Entity) -> Result<()> {
    world.remove::<T>(entity).map(|_| ())
}

/// A pending mutation of the authoritative store
pub enum Command {
    /// Create an entity with initial components
    Spawn {
        components: Vec<Box<dyn ComponentWrite>>,
    },
    /// Destroy an entity and all of its components
    Despawn { entity: Entity },
    /// Insert or overwrite a component
    Insert {
        entity: Entity,
        component: Box<dyn ComponentWrite>,
    },
    /// Remove a component
    Remove {
        entity: Entity,
        component: &'static str,
        remove: RemoveFn,
    },
    /// Publish an event into the live stream
    Publish { event: Box<dyn EventWrite> },
}

impl Command {
    /// Short label used in logs and failure reports
    pub fn describe(&self) -> String {
        match self {
            Command::Spawn { components } => format!("spawn with {} components", components.len()),
            Command::Despawn { entity } => format!("despawn {}", entity),
            Command::Insert { entity, component } => {
                format!("insert {} on {}", component.type_name(), entity)
            }
            Command::Remove { entity, component, .. } => format!("remove {} from {}", component, entity),
            Command::Publish { event } => format!("publish {}", event.type_name()),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Ordered queue of commands owned by one module
#[derive(Debug, Default)]
pub struct CommandBuffer {
    commands: Vec<Command>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an entity creation; chain `.with(..)` to add initial components
    pub fn spawn(&mut self) -> SpawnCommands<'_> {
        self.commands.push(Command::Spawn {
            components: Vec::new(),
        });
        SpawnCommands { buffer: self }
    }

    pub fn despawn(&mut self, entity: Entity) {
        self.commands.push(Command::Despawn { entity });
    }

    pub fn insert<T: Component>(&mut self, entity: Entity, component: T) {
        self.commands.push(Command::Insert {
            entity,
            component: Box::new(Insert(component)),
        });
    }

    pub fn remove<T: Component>(&mut self, entity: Entity) {
        self.commands.push(Command::Remove {
            entity,
            component: std::any::type_name::<T>(),
            remove: remove_component::<T>,
        });
    }

    pub fn publish<E: Event>(&mut self, event: E) {
        self.commands.push(Command::Publish {
            event: Box::new(Publish(event)),
        });
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter()
    }

    /// Take every queued command, leaving the buffer empty
    pub fn drain(&mut self) -> std::vec::Drain<'_, Command> {
        self.commands.drain(..)
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }
}

/// Builder returned by [`CommandBuffer::spawn`]
pub struct SpawnCommands<'a> {
    buffer: &'a mut CommandBuffer,
}

impl SpawnCommands<'_> {
    /// Add an initial component to the queued entity
    pub fn with<T: Component>(self, component: T) -> Self {
        if let Some(Command::Spawn { components }) = self.buffer.commands.last_mut() {
            components.push(Box::new(Insert(component)));
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct Position(f32);
    impl Component for Position {}

    #[derive(Clone)]
    struct Velocity(f32);
    impl Component for Velocity {}

    #[test]
    fn test_buffer_preserves_order() {
        let mut buffer = CommandBuffer::new();
        let e = Entity::new(0, 0);
        buffer.insert(e, Position(1.0));
        buffer.remove::<Velocity>(e);
        buffer.publish(42u32);
        buffer.despawn(e);

        let labels: Vec<String> = buffer.iter().map(Command::describe).collect();
        assert_eq!(labels.len(), 4);
        assert!(labels[0].starts_with("insert"));
        assert!(labels[1].starts_with("remove"));
        assert!(labels[2].starts_with("publish"));
        assert!(labels[3].starts_with("despawn"));
    }

    #[test]
    fn test_spawn_builder_collects_components() {
        let mut buffer = CommandBuffer::new();
        buffer.spawn().with(Position(0.0)).with(Velocity(1.0));
        assert_eq!(buffer.len(), 1);
        match buffer.iter().next() {
            Some(Command::Spawn { components }) => assert_eq!(components.len(), 2),
            other => panic!("unexpected command {:?}", other),
        };
    }

    #[test]
    fn test_drain_empties_buffer() {
        let mut buffer = CommandBuffer::new();
        buffer.publish("ping");
        let drained: Vec<Command> = buffer.drain().collect();
        assert_eq!(drained.len(), 1);
        assert!(buffer.is_empty());
    }
}
