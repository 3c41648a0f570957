//! Kestrel: single-core RTOS kernel core
//!
//! Threads with a fixed-priority scheduler, deadline-ordered timeouts and
//! blocking IPC:
//! - cooperative fibers and preemptible tasks sharing one run queue
//! - alarms on a wrapping 32-bit tick counter, fired in deadline order
//! - one-shot and periodic timers with a status counter
//! - message queue, pipe, semaphore and reader/writer lock
//! - all CPU-specific work behind the [`arch::Arch`] port
//!
//! State lives in one explicitly owned [`Kernel`]; nothing is global.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod error;
pub mod kernel;
pub mod sched;
pub mod sync;
pub mod thread;
pub mod time;
pub mod timeout;
pub mod timer;

#[cfg(test)]
mod testing;

pub use arch::{Arch, IrqGuard, IrqKey, IrqLock, StackPointer};
pub use config::KernelConfig;
pub use error::{KernelError, Result};
pub use kernel::{FatalReason, Kernel, KernelStats};
pub use sched::WaitQueueId;
pub use sync::{MessageQueue, Pipe, RwLock, Semaphore};
pub use thread::{Priority, ThreadFlags, ThreadId, ThreadOptions, ThreadState};
pub use time::{Tick, Timeout};
pub use timeout::{AlarmId, AlarmState, ScheduleFlags};
pub use timer::{Timer, TimerFn};
