//! Thread control block and thread attributes
//!
//! A thread is either a cooperative fiber (runs until it blocks or
//! yields) or a preemptible task, chosen by its priority: the
//! [`Priority::TASK`] sentinel makes a task, anything else a fiber.
//! TCBs live in the scheduler's arena and are addressed by [`ThreadId`].

use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;

use crate::arch::{Arch, SavedContext, StackPointer};
use crate::error::{KernelError, Result};
use crate::sched::WaitQueueId;
use crate::timeout::AlarmId;

/// Thread entry point, called with the three creation arguments
pub type ThreadEntry = fn(usize, usize, usize);

/// Handle of a thread in the kernel's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub(crate) u16);

impl ThreadId {
    /// The bootstrapping thread registered by `Kernel::new`
    pub const MAIN: ThreadId = ThreadId(0);

    /// Arena index
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

/// Thread priority (lower number = higher priority)
///
/// Fibers use any value below [`Priority::TASK`]; the sentinel itself
/// marks a preemptible task, which only runs when no fiber is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i16);

impl Priority {
    /// Highest fiber priority
    pub const HIGHEST: Priority = Priority(i16::MIN);
    /// Default fiber priority
    pub const NORMAL: Priority = Priority(0);
    /// Lowest fiber priority
    pub const LOWEST_FIBER: Priority = Priority(i16::MAX - 1);
    /// Sentinel priority of preemptible tasks
    pub const TASK: Priority = Priority(i16::MAX);

    /// Is this the task sentinel?
    pub const fn is_task(self) -> bool {
        self.0 == Self::TASK.0
    }
}

bitflags! {
    /// Per-thread state bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u8 {
        /// Created at the task sentinel priority
        const TASK = 1 << 0;
        /// May be switched out by a higher-priority ready thread
        const PREEMPTIBLE = 1 << 1;
        /// Aborting it is a fatal system error
        const ESSENTIAL = 1 << 2;
        /// Floating-point context must be preserved
        const USES_FP = 1 << 3;
        /// Running an interrupt handler on top of this thread
        const IN_INTERRUPT = 1 << 4;
        /// Running a CPU exception handler on top of this thread
        const IN_EXCEPTION = 1 << 5;
    }
}

bitflags! {
    /// Creation options accepted by `Kernel::create_thread`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ThreadOptions: u8 {
        /// See [`ThreadFlags::ESSENTIAL`]
        const ESSENTIAL = 1 << 0;
        /// See [`ThreadFlags::USES_FP`]
        const USES_FP = 1 << 1;
    }
}

impl ThreadFlags {
    /// Initial flags for a thread created at `priority` with `options`
    ///
    /// Execution-context bits can never be requested at creation.
    pub fn initial(priority: Priority, options: ThreadOptions) -> Self {
        let mut flags = if priority.is_task() {
            ThreadFlags::TASK | ThreadFlags::PREEMPTIBLE
        } else {
            ThreadFlags::empty()
        };
        if options.contains(ThreadOptions::ESSENTIAL) {
            flags |= ThreadFlags::ESSENTIAL;
        }
        if options.contains(ThreadOptions::USES_FP) {
            flags |= ThreadFlags::USES_FP;
        }
        flags
    }
}

/// Scheduling state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created, not yet on the run queue
    Unscheduled,
    /// On the run queue
    Ready,
    /// Executing
    Current,
    /// Waiting on a primitive or a sleep
    Blocked,
    /// Retired; the slot is never reused
    Aborted,
}

/// Why the thread last gave up the CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelinquishCause {
    /// Blocked or yielded voluntarily
    Cooperative,
    /// Switched out by a higher-priority ready thread
    Preemptive,
}

/// Typed hand-off channel between a blocked thread and whoever wakes it
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WaitSlot {
    /// Nothing to exchange
    #[default]
    Empty,
    /// A blocked writer's message, waiting to be taken
    Outgoing(Vec<u8>),
    /// A blocked reader waiting for a message
    Incoming,
    /// A message delivered straight to a blocked reader
    Delivered(Vec<u8>),
}

/// Outcome of a suspension, read by the thread when it resumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wake {
    /// Wait satisfied; carries whatever the waker handed over
    Ready(WaitSlot),
    /// Timeout expired first
    TimedOut,
    /// Wait torn down by purge, reset or close
    Cancelled,
}

impl Wake {
    /// Map the outcome to the caller-facing result
    pub fn into_result(self) -> Result<WaitSlot> {
        match self {
            Wake::Ready(slot) => Ok(slot),
            Wake::TimedOut => Err(KernelError::TimedOut),
            Wake::Cancelled => Err(KernelError::Cancelled),
        }
    }
}

/// Stack memory a thread was created on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackInfo {
    /// Address of the first byte
    pub start: usize,
    /// Size in bytes
    pub size: usize,
}

/// Thread control block
pub struct Thread<A: Arch> {
    /// Own handle
    pub(crate) id: ThreadId,
    /// Scheduling state
    pub(crate) state: ThreadState,
    /// Priority (fixed at creation)
    pub(crate) priority: Priority,
    /// Flag bitset
    pub(crate) flags: ThreadFlags,
    /// Cause of the last suspension
    pub(crate) relinquish: Option<RelinquishCause>,
    /// Saved registers
    pub(crate) context: SavedContext<A>,
    /// Stack the thread runs on
    pub(crate) stack: Option<StackInfo>,
    /// Wait queue the thread is blocked on, if any
    pub(crate) pended_on: Option<WaitQueueId>,
    /// Hand-off data published while blocked
    pub(crate) slot: WaitSlot,
    /// Return slot, filled by whoever makes the thread ready again
    pub(crate) wake: Option<Wake>,
    /// Timeout alarm, allocated with the thread
    pub(crate) timeout: Option<AlarmId>,
    /// Threads waiting for this one to exit, allocated on the first join
    pub(crate) join_queue: Option<WaitQueueId>,
    /// Thread this one is blocked joining
    pub(crate) joining: Option<ThreadId>,
    /// Opaque per-thread word
    #[cfg(feature = "thread-custom-data")]
    pub(crate) custom_data: usize,
    /// Next entry in the all-threads list
    #[cfg(feature = "thread-monitor")]
    pub(crate) next_thread: Option<ThreadId>,
}

impl<A: Arch> Thread<A> {
    /// Fresh TCB, not yet on any list
    pub(crate) fn new(
        id: ThreadId,
        priority: Priority,
        options: ThreadOptions,
        sp: StackPointer,
        stack: Option<StackInfo>,
    ) -> Self {
        Self {
            id,
            state: ThreadState::Unscheduled,
            priority,
            flags: ThreadFlags::initial(priority, options),
            relinquish: None,
            context: SavedContext::new(sp),
            stack,
            pended_on: None,
            slot: WaitSlot::Empty,
            wake: None,
            timeout: None,
            join_queue: None,
            joining: None,
            #[cfg(feature = "thread-custom-data")]
            custom_data: 0,
            #[cfg(feature = "thread-monitor")]
            next_thread: None,
        }
    }

    /// Handle
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Scheduling state
    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// Priority
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Flags
    pub fn flags(&self) -> ThreadFlags {
        self.flags
    }

    /// May this thread be preempted right now?
    pub fn is_preemptible(&self) -> bool {
        self.flags.contains(ThreadFlags::PREEMPTIBLE)
    }

    /// Is this thread still alive?
    pub fn is_alive(&self) -> bool {
        self.state != ThreadState::Aborted
    }
}
