//! Playback of deferred command buffers against the live world
//!
//! Buffers are played back in module registration order, commands within a
//! buffer in the order they were recorded. A command that fails is reported
//! and skipped; there is no rollback of the commands before it.

use strata_core::{Command, CommandBuffer, Entity, World};
use tracing::warn;

/// One command that could not be applied
#[derive(Debug)]
pub struct CommandFailure {
    /// Module whose buffer held the command
    pub module: String,
    /// Short description of the command
    pub command: String,
    pub error: strata_core::Error,
}

/// Result of playing back one or more buffers
#[derive(Debug, Default)]
pub struct PlaybackReport {
    /// Commands applied successfully
    pub applied: usize,
    /// Entities created
    pub spawned: Vec<Entity>,
    /// Entities destroyed
    pub despawned: Vec<Entity>,
    /// Events published into the live stream
    pub published: usize,
    pub failures: Vec<CommandFailure>,
}

impl PlaybackReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge another report into this one
    pub fn merge(&mut self, other: PlaybackReport) {
        self.applied += other.applied;
        self.spawned.extend(other.spawned);
        self.despawned.extend(other.despawned);
        self.published += other.published;
        self.failures.extend(other.failures);
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Drain `buffer` into `world`
///
/// The buffer is empty afterwards, whatever happened to its commands.
pub fn playback(module: &str, buffer: &mut CommandBuffer, world: &mut World) -> PlaybackReport {
    let mut report = PlaybackReport::new();

    for command in buffer.drain() {
        let label = command.describe();
        let result = match command {
            Command::Spawn { components } => {
                let entity = world.spawn();
                report.spawned.push(entity);
                let mut outcome = Ok(());
                for component in components {
                    let name = component.type_name();
                    if let Err(error) = component.apply(world, entity) {
                        warn!(module, entity = %entity, component = name, %error, "spawn component failed");
                        outcome = Err(error);
                    }
                }
                outcome
            }
            Command::Despawn { entity } => world.despawn(entity).map(|()| {
                report.despawned.push(entity);
            }),
            Command::Insert { entity, component } => component.apply(world, entity),
            Command::Remove { entity, remove, .. } => remove(world, entity),
            Command::Publish { event } => {
                event.publish_into(world.events_mut());
                report.published += 1;
                Ok(())
            }
        };

        match result {
            Ok(()) => report.applied += 1,
            Err(error) => {
                warn!(module, command = %label, %error, "playback command failed");
                report.failures.push(CommandFailure {
                    module: module.to_string(),
                    command: label,
                    error,
                });
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{Component, RegistryBuilder, TypePolicy};

    #[derive(Debug, Clone, PartialEq)]
    struct Health(u32);
    impl Component for Health {}

    #[derive(Debug, Clone, PartialEq)]
    struct Unregistered;
    impl Component for Unregistered {}

    #[derive(Debug, Clone, PartialEq)]
    struct Died(u32);

    fn world() -> World {
        let mut builder = RegistryBuilder::new();
        builder.register::<Health>(TypePolicy::SNAPSHOTABLE).unwrap();
        World::new(builder.build())
    }

    #[test]
    fn test_commands_applied_in_order() {
        let mut world = world();
        let e = world.spawn();

        let mut buffer = CommandBuffer::new();
        buffer.insert(e, Health(10));
        buffer.insert(e, Health(20));
        buffer.spawn().with(Health(1));
        buffer.publish(Died(3));

        let report = playback("m", &mut buffer, &mut world);

        assert!(report.is_clean());
        assert_eq!(report.applied, 4);
        assert_eq!(world.get::<Health>(e), Some(&Health(20)));
        assert_eq!(report.spawned.len(), 1);
        assert_eq!(world.get::<Health>(report.spawned[0]), Some(&Health(1)));
        assert_eq!(world.events().read::<Died>(), &[Died(3)]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_failures_reported_individually() {
        let mut world = world();
        let e = world.spawn();
        let dead = world.spawn();
        world.despawn(dead).unwrap();

        let mut buffer = CommandBuffer::new();
        buffer.insert(dead, Health(1));
        buffer.insert(e, Unregistered);
        buffer.insert(e, Health(5));
        buffer.despawn(dead);

        let report = playback("m", &mut buffer, &mut world);

        assert_eq!(report.applied, 1);
        assert_eq!(report.failures.len(), 3);
        assert!(matches!(report.failures[0].error, strata_core::Error::DeadEntity(_)));
        assert!(matches!(
            report.failures[1].error,
            strata_core::Error::UnregisteredComponent(_)
        ));
        assert_eq!(report.failures[2].module, "m");
        assert_eq!(world.get::<Health>(e), Some(&Health(5)));
    }

    #[test]
    fn test_remove_and_despawn() {
        let mut world = world();
        let a = world.spawn();
        let b = world.spawn();
        world.insert(a, Health(1)).unwrap();

        let mut buffer = CommandBuffer::new();
        buffer.remove::<Health>(a);
        buffer.despawn(b);
        let report = playback("m", &mut buffer, &mut world);

        assert!(report.is_clean());
        assert!(world.get::<Health>(a).is_none());
        assert!(!world.is_alive(b));
        assert_eq!(report.despawned, vec![b]);
    }

    #[test]
    fn test_merge() {
        let mut total = PlaybackReport::new();
        let mut world = world();
        let mut buffer = CommandBuffer::new();
        buffer.spawn();
        total.merge(playback("a", &mut buffer, &mut world));
        buffer.spawn();
        total.merge(playback("b", &mut buffer, &mut world));
        assert_eq!(total.spawned.len(), 2);
        assert_eq!(total.applied, 2);
    }
}
