//! Per-frame event streams
//!
//! An [`EventStream`] keeps one typed buffer per event type, in first-publish
//! order. The simulation publishes into the live stream during a frame; the
//! history ring copies it without clearing it, and modules later receive the
//! concatenation of every frame they missed.

use indexmap::IndexMap;
use std::any::{Any, TypeId};
use std::fmt;

/// Marker for event payloads; implemented for every cloneable thread-safe type
pub trait Event: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Event for T {}

/// Identity of an event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub type_id: TypeId,
    pub name: &'static str,
}

impl EventKey {
    pub fn of<E: Event>() -> Self {
        Self {
            type_id: TypeId::of::<E>(),
            name: std::any::type_name::<E>(),
        }
    }
}

trait AnyEventBuffer: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn type_name(&self) -> &'static str;
    fn len(&self) -> usize;
    fn clear(&mut self);
    fn clone_box(&self) -> Box<dyn AnyEventBuffer>;
    fn append_into(&self, target: &mut EventStream);
}

struct EventBuffer<E: Event> {
    events: Vec<E>,
}

impl<E: Event> AnyEventBuffer for EventBuffer<E> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<E>()
    }

    fn len(&self) -> usize {
        self.events.len()
    }

    fn clear(&mut self) {
        self.events.clear();
    }

    fn clone_box(&self) -> Box<dyn AnyEventBuffer> {
        Box::new(EventBuffer {
            events: self.events.clone(),
        })
    }

    fn append_into(&self, target: &mut EventStream) {
        target.buffer_mut::<E>().extend(self.events.iter().cloned());
    }
}

/// Typed event buffers for one frame
#[derive(Default)]
pub struct EventStream {
    buffers: IndexMap<TypeId, Box<dyn AnyEventBuffer>>,
}

impl EventStream {
    pub fn new() -> Self {
        Self::default()
    }

    fn buffer_mut<E: Event>(&mut self) -> &mut Vec<E> {
        let buffer = self
            .buffers
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(EventBuffer::<E> { events: Vec::new() }));
        match buffer.as_any_mut().downcast_mut::<EventBuffer<E>>() {
            Some(typed) => &mut typed.events,
            None => unreachable!("event buffer keyed by its own TypeId"),
        }
    }

    /// Publish an event
    pub fn publish<E: Event>(&mut self, event: E) {
        self.buffer_mut::<E>().push(event);
    }

    /// Read every buffered event of type `E`, oldest first
    pub fn read<E: Event>(&self) -> &[E] {
        self.buffers
            .get(&TypeId::of::<E>())
            .and_then(|buffer| buffer.as_any().downcast_ref::<EventBuffer<E>>())
            .map(|typed| typed.events.as_slice())
            .unwrap_or(&[])
    }

    /// Whether at least one event of this type is buffered
    pub fn contains(&self, key: &EventKey) -> bool {
        self.buffers
            .get(&key.type_id)
            .is_some_and(|buffer| buffer.len() > 0)
    }

    /// Type ids of every non-empty buffer
    pub fn active_types(&self) -> impl Iterator<Item = TypeId> + '_ {
        self.buffers
            .iter()
            .filter(|(_, buffer)| buffer.len() > 0)
            .map(|(type_id, _)| *type_id)
    }

    /// Total number of buffered events across types
    pub fn len(&self) -> usize {
        self.buffers.values().map(|buffer| buffer.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty every buffer, keeping allocations
    pub fn clear(&mut self) {
        for buffer in self.buffers.values_mut() {
            buffer.clear();
        }
    }

    /// Non-destructive copy of every non-empty buffer
    pub fn snapshot(&self) -> EventStream {
        EventStream {
            buffers: self
                .buffers
                .iter()
                .filter(|(_, buffer)| buffer.len() > 0)
                .map(|(type_id, buffer)| (*type_id, buffer.clone_box()))
                .collect(),
        }
    }

    /// Append (never replace) every event of `self` onto `target`
    pub fn append_into(&self, target: &mut EventStream) {
        for buffer in self.buffers.values() {
            buffer.append_into(target);
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.buffers.values().map(|b| (b.type_name(), b.len())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Explosion(u32);

    #[derive(Debug, Clone, PartialEq)]
    struct Chat(&'static str);

    #[test]
    fn test_publish_and_read() {
        let mut stream = EventStream::new();
        stream.publish(Explosion(1));
        stream.publish(Explosion(2));
        stream.publish(Chat("hi"));

        assert_eq!(stream.read::<Explosion>(), &[Explosion(1), Explosion(2)]);
        assert_eq!(stream.read::<Chat>(), &[Chat("hi")]);
        assert_eq!(stream.len(), 3);
        assert!(stream.read::<u64>().is_empty());
    }

    #[test]
    fn test_snapshot_is_non_destructive() {
        let mut stream = EventStream::new();
        stream.publish(Explosion(1));

        let copy = stream.snapshot();
        stream.publish(Explosion(2));

        assert_eq!(copy.read::<Explosion>(), &[Explosion(1)]);
        assert_eq!(stream.read::<Explosion>().len(), 2);
    }

    #[test]
    fn test_append_preserves_existing() {
        let mut a = EventStream::new();
        a.publish(Explosion(1));
        let mut b = EventStream::new();
        b.publish(Explosion(2));
        b.publish(Chat("x"));

        b.append_into(&mut a);

        assert_eq!(a.read::<Explosion>(), &[Explosion(1), Explosion(2)]);
        assert_eq!(a.read::<Chat>(), &[Chat("x")]);
    }

    #[test]
    fn test_clear_and_active_types() {
        let mut stream = EventStream::new();
        stream.publish(Explosion(1));
        assert!(stream.contains(&EventKey::of::<Explosion>()));
        assert_eq!(stream.active_types().count(), 1);

        stream.clear();
        assert!(stream.is_empty());
        assert!(!stream.contains(&EventKey::of::<Explosion>()));
        assert_eq!(stream.active_types().count(), 0);
    }
}
