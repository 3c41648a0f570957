//! Run queue and thread arena
//!
//! Fixed-priority scheduling: the ready queue is kept sorted by priority,
//! FIFO within a priority, so the head is always the next thread to run.
//! Wait queues are plain FIFOs of thread handles stored in an arena so a
//! timeout can unpend a thread without knowing which primitive it waits on.
//!
//! Everything here runs under the kernel's scheduler lock; none of it
//! switches context. The swap itself is in [`crate::kernel`].

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::arch::Arch;
use crate::error::{KernelError, Result};
use crate::thread::{Thread, ThreadId, ThreadState};
use crate::time::{Tick, TickCounter};

/// Handle of a wait queue in the kernel's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitQueueId(pub(crate) u16);

impl WaitQueueId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Scheduler state, guarded by the kernel lock
pub(crate) struct Scheduler<A: Arch> {
    /// TCB arena; boxed so saved contexts never move
    threads: Vec<Box<Thread<A>>>,
    /// Runnable threads, highest priority first
    ready: VecDeque<ThreadId>,
    /// Thread owning the CPU
    current: ThreadId,
    /// Wait queue arena
    wait_queues: Vec<VecDeque<ThreadId>>,
    /// Released wait queues, reused before the arena grows
    free_queues: Vec<WaitQueueId>,
    /// System tick counter
    pub(crate) clock: TickCounter,
    /// Interrupt nesting depth
    pub(crate) isr_nesting: u32,
    /// Head of the all-threads list
    #[cfg(feature = "thread-monitor")]
    monitor_head: Option<ThreadId>,
    /// Total context switches
    pub(crate) context_switches: u32,
}

impl<A: Arch> Scheduler<A> {
    /// Scheduler whose only thread is `main`, already running
    pub fn new(mut main: Thread<A>, start: Tick) -> Self {
        main.id = ThreadId::MAIN;
        main.state = ThreadState::Current;
        let mut sched = Self {
            threads: Vec::new(),
            ready: VecDeque::new(),
            current: ThreadId::MAIN,
            wait_queues: Vec::new(),
            free_queues: Vec::new(),
            clock: TickCounter::new(start),
            isr_nesting: 0,
            #[cfg(feature = "thread-monitor")]
            monitor_head: None,
            context_switches: 0,
        };
        sched.push(main);
        sched
    }

    /// Handle the next inserted thread will get
    ///
    /// Fails with `Exhausted` once every 16-bit handle is taken; slots are
    /// never reused, so a handle always names the same thread.
    pub fn next_id(&self) -> Result<ThreadId> {
        u16::try_from(self.threads.len())
            .map(ThreadId)
            .map_err(|_| KernelError::Exhausted)
    }

    /// Add a TCB to the arena (and to the monitor list)
    pub fn insert(&mut self, thread: Thread<A>) -> Result<ThreadId> {
        let id = self.next_id()?;
        debug_assert_eq!(thread.id, id);
        self.push(thread);
        Ok(id)
    }

    fn push(&mut self, thread: Thread<A>) {
        #[cfg(feature = "thread-monitor")]
        let id = thread.id;
        self.threads.push(Box::new(thread));
        #[cfg(feature = "thread-monitor")]
        {
            self.threads[id.index()].next_thread = self.monitor_head;
            self.monitor_head = Some(id);
        }
    }

    /// TCB of `id`
    pub fn thread(&self, id: ThreadId) -> &Thread<A> {
        &self.threads[id.index()]
    }

    /// Mutable TCB of `id`
    pub fn thread_mut(&mut self, id: ThreadId) -> &mut Thread<A> {
        &mut self.threads[id.index()]
    }

    /// Does `id` name a TCB in the arena?
    pub fn contains(&self, id: ThreadId) -> bool {
        id.index() < self.threads.len()
    }

    /// Running thread
    pub fn current(&self) -> ThreadId {
        self.current
    }

    /// Install `id` as the running thread
    pub fn set_current(&mut self, id: ThreadId) {
        self.current = id;
        self.thread_mut(id).state = ThreadState::Current;
    }

    /// Put `id` on the ready queue behind every thread of equal or higher priority
    pub fn make_ready(&mut self, id: ThreadId) {
        let priority = self.thread(id).priority;
        self.thread_mut(id).state = ThreadState::Ready;
        let pos = self
            .ready
            .iter()
            .position(|&t| self.threads[t.index()].priority > priority)
            .unwrap_or(self.ready.len());
        self.ready.insert(pos, id);
    }

    /// Take `id` off the ready queue
    pub fn remove_ready(&mut self, id: ThreadId) -> bool {
        match self.ready.iter().position(|&t| t == id) {
            Some(pos) => {
                self.ready.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Highest-priority ready thread, left on the queue
    pub fn peek_ready(&self) -> Option<ThreadId> {
        self.ready.front().copied()
    }

    /// Highest-priority ready thread, removed from the queue
    pub fn pop_ready(&mut self) -> Option<ThreadId> {
        self.ready.pop_front()
    }

    /// Number of threads on the ready queue
    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Must the running thread give way at this point?
    ///
    /// Only a preemptible thread outside interrupt context is switched
    /// out, and only for a strictly higher-priority ready thread.
    pub fn should_preempt(&self) -> bool {
        if self.isr_nesting > 0 {
            return false;
        }
        let current = self.thread(self.current);
        if current.state != ThreadState::Current || !current.is_preemptible() {
            return false;
        }
        match self.peek_ready() {
            Some(next) => self.thread(next).priority < current.priority,
            None => false,
        }
    }

    /// Allocate an empty wait queue
    pub fn create_wait_queue(&mut self) -> Result<WaitQueueId> {
        if let Some(id) = self.free_queues.pop() {
            return Ok(id);
        }
        let id = u16::try_from(self.wait_queues.len())
            .map(WaitQueueId)
            .map_err(|_| KernelError::Exhausted)?;
        self.wait_queues.push(VecDeque::new());
        Ok(id)
    }

    /// Return an empty wait queue to the arena
    pub fn release_wait_queue(&mut self, wq: WaitQueueId) {
        debug_assert!(self.wait_queues[wq.index()].is_empty(), "released a wait queue with waiters");
        debug_assert!(!self.free_queues.contains(&wq), "wait queue released twice");
        self.free_queues.push(wq);
    }

    /// Block `id` on `wq`
    pub fn pend(&mut self, id: ThreadId, wq: WaitQueueId) {
        self.wait_queues[wq.index()].push_back(id);
        self.thread_mut(id).pended_on = Some(wq);
    }

    /// Take `id` off whatever wait queue it is on
    ///
    /// Safe to call on a thread that is not pended.
    pub fn unpend(&mut self, id: ThreadId) -> bool {
        let Some(wq) = self.thread_mut(id).pended_on.take() else {
            return false;
        };
        let queue = &mut self.wait_queues[wq.index()];
        match queue.iter().position(|&t| t == id) {
            Some(pos) => {
                queue.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Take the longest waiter off `wq`
    pub fn unpend_first(&mut self, wq: WaitQueueId) -> Option<ThreadId> {
        let id = self.wait_queues[wq.index()].pop_front()?;
        self.thread_mut(id).pended_on = None;
        Some(id)
    }

    /// Number of threads blocked on `wq`
    pub fn waiter_count(&self, wq: WaitQueueId) -> usize {
        self.wait_queues[wq.index()].len()
    }

    /// Unlink `id` from the all-threads list
    #[cfg(feature = "thread-monitor")]
    pub fn unlink_monitor(&mut self, id: ThreadId) {
        let next = self.thread_mut(id).next_thread.take();
        if self.monitor_head == Some(id) {
            self.monitor_head = next;
            return;
        }
        let mut cursor = self.monitor_head;
        while let Some(c) = cursor {
            if self.threads[c.index()].next_thread == Some(id) {
                self.threads[c.index()].next_thread = next;
                return;
            }
            cursor = self.threads[c.index()].next_thread;
        }
    }

    /// Walk the all-threads list, newest first
    #[cfg(feature = "thread-monitor")]
    pub fn monitor(&self) -> Vec<ThreadId> {
        let mut out = Vec::new();
        let mut cursor = self.monitor_head;
        while let Some(c) = cursor {
            out.push(c);
            cursor = self.threads[c.index()].next_thread;
        }
        out
    }

    /// Number of live threads
    pub fn live_count(&self) -> usize {
        self.threads.iter().filter(|t| t.is_alive()).count()
    }
}
