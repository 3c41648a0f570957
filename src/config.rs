//! Kernel configuration
//!
//! Runtime knobs live in [`KernelConfig`]; optional TCB components are
//! Cargo features (`thread-monitor`, `thread-custom-data`).

use crate::thread::Priority;
use crate::time::Tick;

/// Default tick rate (Hz)
pub const DEFAULT_TICK_HZ: u32 = 100;

/// Default bound on concurrently held reader slots of an rwlock
pub const DEFAULT_MAX_READERS: u32 = 8;

/// Kernel configuration, fixed at [`Kernel::new`](crate::Kernel::new)
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    /// Tick frequency, used only for millisecond conversions
    pub tick_hz: u32,
    /// Initial value of the tick counter
    pub start_tick: Tick,
    /// Priority of the bootstrapping (main) thread
    pub main_priority: Priority,
    /// Default reader bound for [`RwLock::new`](crate::sync::RwLock::new)
    pub rwlock_max_readers: u32,
}

impl KernelConfig {
    /// Configuration used when nothing else is specified
    pub const fn new() -> Self {
        Self {
            tick_hz: DEFAULT_TICK_HZ,
            start_tick: Tick(0),
            main_priority: Priority::TASK,
            rwlock_max_readers: DEFAULT_MAX_READERS,
        }
    }

    /// Start the tick counter at `tick` (rollover testing)
    pub const fn with_start_tick(mut self, tick: Tick) -> Self {
        self.start_tick = tick;
        self
    }

    /// Override the tick rate
    pub const fn with_tick_hz(mut self, hz: u32) -> Self {
        self.tick_hz = hz;
        self
    }

    /// Ticks corresponding to `ms` milliseconds, rounded up
    pub const fn ms_to_ticks(&self, ms: u32) -> u32 {
        let ticks = (ms as u64 * self.tick_hz as u64 + 999) / 1000;
        if ticks > u32::MAX as u64 {
            u32::MAX
        } else {
            ticks as u32
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}
