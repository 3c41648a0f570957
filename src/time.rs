//! Tick arithmetic and the system tick counter
//!
//! Deadlines are absolute 32-bit tick values. They are always compared
//! through a signed wrapping difference, never by magnitude, so timers keep
//! working across counter rollover as long as no deadline is more than
//! `i32::MAX` ticks away.

use core::fmt;

/// Absolute tick value (wraps at 2^32)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Tick(pub u32);

impl Tick {
    /// `self + ticks`, wrapping
    pub const fn after(self, ticks: u32) -> Tick {
        Tick(self.0.wrapping_add(ticks))
    }

    /// Signed distance from `now` to `self`
    ///
    /// Positive: still in the future. Zero or negative: due.
    pub const fn delta(self, now: Tick) -> i32 {
        self.0.wrapping_sub(now.0) as i32
    }

    /// Has `self` been reached at `now`?
    pub const fn is_due(self, now: Tick) -> bool {
        self.delta(now) <= 0
    }

    /// Is `self` strictly earlier than `other` (wraparound aware)?
    pub const fn is_before(self, other: Tick) -> bool {
        other.delta(self) > 0
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// How long a blocking call may wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Fail immediately instead of waiting
    NoWait,
    /// Wait at most this many ticks
    Ticks(u32),
    /// Wait until satisfied
    Forever,
}

impl Timeout {
    /// Longest bounded wait a deadline can express
    ///
    /// Longer `Ticks` values are clamped to it; a deadline further away
    /// would compare as already due.
    pub const MAX_TICKS: u32 = i32::MAX as u32;

    /// Deadline of a bounded wait starting at `now` (`None` for `Forever`)
    pub const fn deadline(self, now: Tick) -> Option<Tick> {
        match self {
            Timeout::NoWait => Some(now),
            Timeout::Ticks(ticks) => {
                let ticks = if ticks > Self::MAX_TICKS {
                    Self::MAX_TICKS
                } else {
                    ticks
                };
                Some(now.after(ticks))
            }
            Timeout::Forever => None,
        }
    }

    /// Must the call fail instead of waiting? (`Ticks(0)` counts as no wait)
    pub const fn is_no_wait(self) -> bool {
        matches!(self, Timeout::NoWait | Timeout::Ticks(0))
    }
}

/// Monotonic tick counter
///
/// Advanced by the tick interrupt; counts how often the 32-bit value
/// rolled over so uptime stays available as a 64-bit value.
#[derive(Debug, Clone)]
pub struct TickCounter {
    /// Current tick
    now: Tick,
    /// Rollover count
    overflows: u32,
}

impl TickCounter {
    /// Counter starting at `start`
    pub const fn new(start: Tick) -> Self {
        Self {
            now: start,
            overflows: 0,
        }
    }

    /// Advance by `ticks`, returning the new tick
    pub fn advance(&mut self, ticks: u32) -> Tick {
        let next = self.now.0.wrapping_add(ticks);
        if next < self.now.0 {
            self.overflows += 1;
        }
        self.now = Tick(next);
        self.now
    }

    /// Current tick
    pub fn now(&self) -> Tick {
        self.now
    }

    /// Number of rollovers seen
    pub fn overflows(&self) -> u32 {
        self.overflows
    }

    /// 64-bit tick count (rollovers included)
    pub fn uptime(&self) -> u64 {
        ((self.overflows as u64) << 32) | self.now.0 as u64
    }

    /// Ticks elapsed since `reference` (wrapping)
    pub fn elapsed_since(&self, reference: Tick) -> u32 {
        self.now.0.wrapping_sub(reference.0)
    }
}
