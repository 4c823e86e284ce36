//! Strata History - Bounded event history for low-frequency consumers
//!
//! The simulation clears its live event stream every frame. A module that
//! runs every sixth frame would otherwise miss five frames of events. The
//! [`EventAccumulator`] keeps a non-destructive copy of the last K frames and
//! hands each consumer everything newer than the last frame it saw.
//!
//! # Features
//!
//! - **Bounded memory**: fixed ring of K captured frames, oldest evicted first
//! - **Non-destructive capture**: the live stream is copied, never drained
//! - **Append-only flush**: history is appended to the consumer's stream in frame order
//! - **Gap detection**: a consumer whose interval exceeds K gets the frames
//!   still retained plus a [`HistoryGap`] describing what was lost
//!
//! # Example
//!
//! ```rust
//! use strata_core::EventStream;
//! use strata_history::EventAccumulator;
//!
//! let mut accumulator = EventAccumulator::new(8);
//! let mut live = EventStream::new();
//!
//! for frame in 1..=3u64 {
//!     live.publish(frame as u32);
//!     accumulator.capture_frame(&live, frame);
//!     live.clear();
//! }
//!
//! let mut mine = EventStream::new();
//! let report = accumulator.flush_to(&mut mine, 1);
//! assert_eq!(mine.read::<u32>(), &[2, 3]);
//! assert_eq!(report.newest_frame, 3);
//! assert!(report.gap.is_none());
//! ```

use strata_core::{EventStream, Frame};
use tracing::{trace, warn};

/// Events of one frame, frozen at capture time
#[derive(Debug)]
pub struct CapturedFrame {
    frame: Frame,
    events: EventStream,
}

impl CapturedFrame {
    pub fn frame(&self) -> Frame {
        self.frame
    }

    pub fn events(&self) -> &EventStream {
        &self.events
    }
}

/// Frames a consumer should have received but that were already evicted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryGap {
    /// First missing frame
    pub first_missing: Frame,
    /// Last missing frame
    pub last_missing: Frame,
}

impl HistoryGap {
    /// Number of frames lost
    pub fn frames(&self) -> u64 {
        self.last_missing - self.first_missing + 1
    }
}

/// Result of one [`EventAccumulator::flush_to`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Frames whose events were appended
    pub frames: usize,
    /// Events appended across all frames and types
    pub events: usize,
    /// Newest frame delivered, or the caller's `last_seen` if nothing was newer
    pub newest_frame: Frame,
    /// Evicted frames the consumer never saw
    pub gap: Option<HistoryGap>,
}

/// Ring of the last K captured frames
///
/// Frames must be captured in increasing order. Capturing a frame that is
/// not newer than the newest retained one is ignored with a warning.
#[derive(Debug)]
pub struct EventAccumulator {
    /// Ring storage; None means the slot is empty
    slots: Vec<Option<CapturedFrame>>,
    /// Next write position
    head: usize,
    /// Number of retained frames
    count: usize,
    capacity: usize,
    /// Newest frame ever evicted, 0 if nothing was evicted yet
    evicted_through: Frame,
    evicted: u64,
}

impl EventAccumulator {
    /// Create an accumulator retaining `capacity` frames
    ///
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            count: 0,
            capacity,
            evicted_through: 0,
            evicted: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Ring position of the i-th oldest retained frame
    fn slot_of(&self, i: usize) -> usize {
        (self.head + self.capacity - self.count + i) % self.capacity
    }

    /// Retained frames, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &CapturedFrame> {
        (0..self.count).filter_map(move |i| self.slots[self.slot_of(i)].as_ref())
    }

    pub fn oldest_frame(&self) -> Option<Frame> {
        self.iter().next().map(|c| c.frame)
    }

    pub fn newest_frame(&self) -> Option<Frame> {
        if self.count == 0 {
            return None;
        }
        let newest = (self.head + self.capacity - 1) % self.capacity;
        self.slots[newest].as_ref().map(|c| c.frame)
    }

    /// Copy every buffered event of `live` and retain it under `frame`
    ///
    /// The live stream is left untouched. When the ring is full the oldest
    /// frame is evicted and dropped. Returns false if the frame was rejected.
    pub fn capture_frame(&mut self, live: &EventStream, frame: Frame) -> bool {
        if let Some(newest) = self.newest_frame() {
            if frame <= newest {
                warn!(frame, newest, "ignoring out-of-order event capture");
                return false;
            }
        }

        let captured = CapturedFrame {
            frame,
            events: live.snapshot(),
        };

        if let Some(old) = self.slots[self.head].replace(captured) {
            trace!(frame = old.frame, events = old.events.len(), "evicting captured frame");
            self.evicted_through = old.frame;
            self.evicted += 1;
        } else {
            self.count += 1;
        }
        self.head = (self.head + 1) % self.capacity;
        true
    }

    /// Whether every frame after `last_seen` is still retained
    pub fn covers(&self, last_seen: Frame) -> bool {
        self.evicted_through <= last_seen
    }

    /// Append every retained event from frames newer than `last_seen` to `target`
    ///
    /// Events are appended frame by frame, oldest first; existing contents of
    /// `target` are kept. If frames after `last_seen` were already evicted the
    /// report carries a [`HistoryGap`] and the consumer receives only what is
    /// still retained.
    pub fn flush_to(&self, target: &mut EventStream, last_seen: Frame) -> FlushReport {
        let mut report = FlushReport {
            newest_frame: last_seen,
            ..FlushReport::default()
        };

        if !self.covers(last_seen) {
            report.gap = Some(HistoryGap {
                first_missing: last_seen + 1,
                last_missing: self.evicted_through,
            });
        }

        for captured in self.iter().filter(|c| c.frame > last_seen) {
            captured.events.append_into(target);
            report.frames += 1;
            report.events += captured.events.len();
            report.newest_frame = captured.frame;
        }

        report
    }

    /// Drop every retained frame and forget eviction history
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.head = 0;
        self.count = 0;
        self.evicted = 0;
        self.evicted_through = 0;
    }

    /// Get statistics about the ring
    pub fn stats(&self) -> AccumulatorStats {
        AccumulatorStats {
            capacity: self.capacity,
            count: self.count,
            oldest_frame: self.oldest_frame().unwrap_or(0),
            newest_frame: self.newest_frame().unwrap_or(0),
            evicted: self.evicted,
        }
    }
}

impl Default for EventAccumulator {
    fn default() -> Self {
        Self::new(32)
    }
}

/// Statistics about the accumulator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccumulatorStats {
    /// Maximum retained frames
    pub capacity: usize,
    /// Currently retained frames
    pub count: usize,
    pub oldest_frame: Frame,
    pub newest_frame: Frame,
    /// Frames evicted since creation or the last clear
    pub evicted: u64,
}

impl AccumulatorStats {
    /// Get the frame span (newest - oldest)
    pub fn frame_span(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.newest_frame - self.oldest_frame
        }
    }

    /// Get the fill percentage (0.0 to 1.0)
    pub fn fill_ratio(&self) -> f32 {
        self.count as f32 / self.capacity as f32
    }
}
