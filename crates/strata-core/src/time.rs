//! Frame clock for tick-based simulation
//!
//! The clock advances once per scheduler tick. Frame indices start at 0 (before
//! the first tick) and time is the sum of every tick delta so far.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A discrete frame identifier
pub type Frame = u64;

/// Simulation clock state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Clock {
    /// Current frame number
    pub frame: Frame,
    /// Accumulated simulation time
    pub time: Duration,
    /// Delta of the most recent tick
    pub delta: Duration,
}

impl Clock {
    /// Create a clock at frame 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance to the next frame
    pub fn advance(&mut self, delta: Duration) -> Frame {
        self.frame += 1;
        self.time += delta;
        self.delta = delta;
        self.frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advance() {
        let mut clock = Clock::new();
        assert_eq!(clock.frame, 0);

        let dt = Duration::from_millis(16);
        assert_eq!(clock.advance(dt), 1);
        assert_eq!(clock.advance(dt), 2);
        assert_eq!(clock.time, Duration::from_millis(32));
        assert_eq!(clock.delta, dt);
    }

    #[test]
    fn test_clock_serde() {
        let mut clock = Clock::new();
        clock.advance(Duration::from_millis(5));
        let text = ron::to_string(&clock).unwrap();
        let back: Clock = ron::from_str(&text).unwrap();
        assert_eq!(clock, back);
    }
}
