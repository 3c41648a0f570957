//! Kernel: top-level RTOS state
//!
//! One [`Kernel`] value owns the architecture port, the scheduler (thread
//! arena, run queue, wait queues, tick counter) and the alarm queue. Every
//! operation takes it by reference; there is no global state, so several
//! kernels can coexist in one test binary.
//!
//! ## Suspension
//!
//! [`Kernel::swap`] is the only place a thread gives up the CPU. Blocking
//! primitives publish their wait with [`Kernel::pend_current`] while holding
//! their own lock, release that lock with interrupts still masked, then
//! call `swap`; whoever satisfies the wait fills the thread's return slot
//! with a [`Wake`] before making it ready again.
//!
//! ## Lock order
//!
//! primitive lock → scheduler lock → alarm lock. All of them are
//! [`IrqLock`]s, taken with interrupts masked. Alarm handlers and cancel
//! callbacks always run with every kernel lock released.

use core::mem;

use log::{debug, trace, warn};

use crate::arch::{
    Arch, InitialFrame, IrqGuard, IrqKey, IrqLock, SavedContext, StackLayout, StackPointer,
};
use crate::config::KernelConfig;
use crate::error::{KernelError, Result};
use crate::sched::{Scheduler, WaitQueueId};
use crate::thread::{
    Priority, RelinquishCause, StackInfo, Thread, ThreadEntry, ThreadFlags, ThreadId,
    ThreadOptions, ThreadState, WaitSlot, Wake,
};
use crate::time::{Tick, Timeout};
use crate::timeout::{AlarmHandler, AlarmId, AlarmQueue, AlarmState, ScheduleFlags};

/// Alarm handler type for alarms scheduled on a kernel
pub type KernelAlarmHandler<A> = AlarmHandler<Kernel<A>>;

type SchedGuard<'a, A> = IrqGuard<'a, A, Scheduler<A>>;

/// Reason passed to [`Kernel::fatal_error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalReason {
    /// Stack overflow detected by the port
    StackOverflow,
    /// Unrecoverable CPU exception
    CpuException,
    /// Kernel invariant violated
    KernelOops,
}

/// Kernel instance
pub struct Kernel<A: Arch> {
    /// Architecture port
    arch: A,
    /// Configuration
    config: KernelConfig,
    /// Scheduler state
    sched: IrqLock<Scheduler<A>>,
    /// Alarms and thread timeouts
    alarms: AlarmQueue<Kernel<A>>,
}

impl<A: Arch> Kernel<A> {
    /// Create a kernel; the calling context becomes the essential main thread
    pub fn new(arch: A, config: KernelConfig) -> Self {
        let (alarms, main_timeout) =
            AlarmQueue::with_alarm(thread_timeout::<A>, None, ThreadId::MAIN.index());
        let mut main = Thread::new(
            ThreadId::MAIN,
            config.main_priority,
            ThreadOptions::ESSENTIAL,
            StackPointer::NULL,
            None,
        );
        main.timeout = Some(main_timeout);
        Self {
            arch,
            config,
            sched: IrqLock::new(Scheduler::new(main, config.start_tick)),
            alarms,
        }
    }

    /// Architecture port
    pub fn arch(&self) -> &A {
        &self.arch
    }

    /// Configuration
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    fn lock_sched(&self) -> SchedGuard<'_, A> {
        self.sched.lock(&self.arch)
    }

    // ------------------------------------------------------------------
    // Thread lifecycle
    // ------------------------------------------------------------------

    /// Create a thread running `entry(args[0], args[1], args[2])` on `stack`
    ///
    /// The thread is ready immediately; if the caller is preemptible and the
    /// new thread outranks it, the new thread runs before this returns.
    /// `stack` must hold at least `A::INITIAL_FRAME_SIZE` bytes after
    /// alignment. Fails with `Exhausted` once thread or alarm handles run
    /// out.
    pub fn create_thread(
        &'static self,
        stack: &'static mut [u8],
        entry: ThreadEntry,
        args: [usize; 3],
        priority: Priority,
        options: ThreadOptions,
    ) -> Result<ThreadId> {
        let layout = StackLayout::carve(stack, A::STACK_ALIGN, A::INITIAL_FRAME_SIZE);
        let info = StackInfo {
            start: stack.as_ptr() as usize + layout.base,
            size: layout.usable(),
        };

        let id = {
            let mut s = self.lock_sched();
            let id = s.next_id()?;
            let timeout = self
                .alarms
                .create(&self.arch, thread_timeout::<A>, None, id.index())?;
            let frame = InitialFrame {
                wrapper: entry_wrapper::<A>,
                kernel: self as *const Self as usize,
                entry,
                args,
                irq_key: IrqKey::UNMASKED,
            };
            let sp = self.arch.build_initial_frame(stack, frame);
            let mut thread = Thread::new(id, priority, options, sp, Some(info));
            thread.timeout = Some(timeout);
            if let Err(e) = s.insert(thread) {
                self.alarms.release(&self.arch, timeout);
                return Err(e);
            }
            s.make_ready(id);
            id
        };
        debug!(
            "created {} prio {} stack {:#x}+{}",
            id, priority.0, info.start, info.size
        );

        self.reschedule();
        Ok(id)
    }

    /// Running thread
    pub fn current(&self) -> ThreadId {
        self.lock_sched().current()
    }

    /// Retire a thread
    ///
    /// Removes it from the run queue or its wait queue, cancels its timeout
    /// and releases every thread joining it. Aborting the running thread
    /// does not return. Aborting an essential thread is fatal. Aborting an
    /// already-aborted thread is a no-op.
    pub fn abort(&self, id: ThreadId) {
        let mut s = self.lock_sched();
        if !s.contains(id) || !s.thread(id).is_alive() {
            return;
        }
        if s.thread(id).flags.contains(ThreadFlags::ESSENTIAL) {
            drop(s);
            panic!("essential {} aborted", id);
        }
        if id == s.current() {
            drop(s);
            self.exit_current();
        }

        match s.thread(id).state {
            ThreadState::Ready => {
                s.remove_ready(id);
            }
            ThreadState::Blocked => {
                s.unpend(id);
            }
            _ => {}
        }
        let timeout = self.retire(&mut s, id);
        drop(s);
        if let Some(alarm) = timeout {
            self.alarms.release(&self.arch, alarm);
            self.arch.set_deadline(self.alarms.next_deadline(&self.arch));
        }
        debug!("aborted {}", id);
        self.reschedule();
    }

    /// Retire the running thread and switch away for good
    pub fn exit_current(&self) -> ! {
        // Never restored: the next thread's resume path unmasks.
        let _key = self.arch.irq_lock();
        let mut s = self.lock_sched();
        let me = s.current();
        if s.thread(me).flags.contains(ThreadFlags::ESSENTIAL) {
            drop(s);
            panic!("essential {} exited", me);
        }
        let timeout = self.retire(&mut s, me);
        debug!("{} exited", me);

        let (mut s, next) = self.next_runnable(s);
        s.context_switches += 1;
        s.set_current(next);
        let to: *const SavedContext<A> = &s.thread(next).context;
        drop(s);
        if let Some(alarm) = timeout {
            self.alarms.release(&self.arch, alarm);
            self.arch.set_deadline(self.alarms.next_deadline(&self.arch));
        }
        trace!("exit -> {}", next);
        // SAFETY: `to` points into a boxed TCB that is never freed.
        unsafe { self.arch.exit_to(to) }
    }

    /// Mark `id` aborted, release its joiners and unlink it from the
    /// monitor list
    ///
    /// Returns the timeout alarm for the caller to release once the
    /// scheduler lock is dropped.
    fn retire(&self, s: &mut Scheduler<A>, id: ThreadId) -> Option<AlarmId> {
        self.stop_timeout(s, id);
        let t = s.thread_mut(id);
        t.state = ThreadState::Aborted;
        t.slot = WaitSlot::Empty;
        t.wake = None;
        t.joining = None;
        let timeout = t.timeout.take();
        if let Some(wq) = t.join_queue.take() {
            while let Some(joiner) = s.unpend_first(wq) {
                self.stop_timeout(s, joiner);
                let j = s.thread_mut(joiner);
                j.slot = WaitSlot::Empty;
                j.wake = Some(Wake::Ready(WaitSlot::Empty));
                s.make_ready(joiner);
                trace!("{} released by exit of {}", joiner, id);
            }
            s.release_wait_queue(wq);
        }
        #[cfg(feature = "thread-monitor")]
        s.unlink_monitor(id);
        timeout
    }

    /// Wait for `id` to exit
    ///
    /// Returns at once when `id` is already gone. Fails with `Busy` when it
    /// is alive and the caller won't wait, and with `Deadlock` when `id` is
    /// the caller or is itself joining the caller.
    pub fn join(&self, id: ThreadId, timeout: Timeout) -> Result<()> {
        let mut s = self.lock_sched();
        if !s.contains(id) {
            return Err(KernelError::InvalidArgument);
        }
        let me = s.current();
        if id == me || s.thread(id).joining == Some(me) {
            return Err(KernelError::Deadlock);
        }
        if !s.thread(id).is_alive() {
            return Ok(());
        }
        if timeout.is_no_wait() {
            return Err(KernelError::Busy);
        }
        let wq = match s.thread(id).join_queue {
            Some(wq) => wq,
            None => {
                let wq = s.create_wait_queue()?;
                s.thread_mut(id).join_queue = Some(wq);
                wq
            }
        };
        s.thread_mut(me).joining = Some(id);
        self.pend_locked(&mut s, Some(wq), timeout, WaitSlot::Empty);
        let key = s.into_key();

        let wake = self.swap(key);
        self.lock_sched().thread_mut(me).joining = None;
        wake.into_result().map(|_| ())
    }

    /// State of `id`
    pub fn thread_state(&self, id: ThreadId) -> ThreadState {
        self.lock_sched().thread(id).state
    }

    /// Priority of `id`
    pub fn priority(&self, id: ThreadId) -> Priority {
        self.lock_sched().thread(id).priority
    }

    /// Flags of `id`
    pub fn flags(&self, id: ThreadId) -> ThreadFlags {
        self.lock_sched().thread(id).flags
    }

    /// Why `id` last gave up the CPU
    pub fn relinquish_cause(&self, id: ThreadId) -> Option<RelinquishCause> {
        self.lock_sched().thread(id).relinquish
    }

    /// Stack `id` runs on (`None` for the main thread)
    pub fn stack_info(&self, id: ThreadId) -> Option<StackInfo> {
        self.lock_sched().thread(id).stack
    }

    /// Tick at which the pending timeout of `id` fires
    ///
    /// The current tick when `id` is not in a timed wait.
    pub fn timeout_expires(&self, id: ThreadId) -> Tick {
        let s = self.lock_sched();
        let now = s.clock.now();
        s.thread(id)
            .timeout
            .and_then(|alarm| self.alarms.deadline(&self.arch, alarm))
            .unwrap_or(now)
    }

    /// Ticks left before the pending timeout of `id` fires (0 when none)
    pub fn timeout_remaining(&self, id: ThreadId) -> u32 {
        let now = self.now();
        self.timeout_expires(id).delta(now).max(0) as u32
    }

    /// Set the running thread's custom data word
    #[cfg(feature = "thread-custom-data")]
    pub fn set_custom_data(&self, value: usize) {
        let mut s = self.lock_sched();
        let me = s.current();
        s.thread_mut(me).custom_data = value;
    }

    /// The running thread's custom data word
    #[cfg(feature = "thread-custom-data")]
    pub fn custom_data(&self) -> usize {
        let s = self.lock_sched();
        s.thread(s.current()).custom_data
    }

    /// Every live thread, most recently created first
    #[cfg(feature = "thread-monitor")]
    pub fn threads(&self) -> alloc::vec::Vec<ThreadId> {
        self.lock_sched().monitor()
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Give the CPU to another ready thread of equal or higher priority
    pub fn yield_now(&self) {
        let mut s = self.lock_sched();
        let me = s.current();
        s.thread_mut(me).relinquish = Some(RelinquishCause::Cooperative);
        s.make_ready(me);
        let key = s.into_key();
        self.swap(key);
    }

    /// Block the running thread for `ticks` ticks
    ///
    /// Waits longer than [`Timeout::MAX_TICKS`] are clamped to it.
    pub fn sleep(&self, ticks: u32) {
        if ticks == 0 {
            self.yield_now();
            return;
        }
        let key = self.arch.irq_lock();
        self.pend_current(None, Timeout::Ticks(ticks), WaitSlot::Empty);
        self.swap(key);
    }

    /// Block the running thread until the tick counter reaches `deadline`
    pub fn sleep_until(&self, deadline: Tick) {
        let delay = deadline.delta(self.now());
        if delay <= 0 {
            self.yield_now();
        } else {
            self.sleep(delay as u32);
        }
    }

    /// Wake a sleeping thread early
    ///
    /// Returns whether `id` was sleeping. Threads blocked on a primitive are
    /// left alone.
    pub fn wakeup(&self, id: ThreadId) -> bool {
        let woke = {
            let mut s = self.lock_sched();
            let t = s.thread(id);
            if t.state == ThreadState::Blocked && t.pended_on.is_none() {
                self.stop_timeout(&mut s, id);
                s.thread_mut(id).wake = Some(Wake::Ready(WaitSlot::Empty));
                s.make_ready(id);
                true
            } else {
                false
            }
        };
        if woke {
            self.reschedule();
        }
        woke
    }

    /// Switch away from the running thread and return once it is resumed
    ///
    /// The caller has already masked interrupts (`key`) and published the
    /// thread's new state: blocked on a wait queue, or requeued for a
    /// yield/preemption. Returns the thread's return slot.
    pub(crate) fn swap(&self, key: IrqKey) -> Wake {
        let s = self.lock_sched();
        let me = s.current();
        let (mut s, next) = self.next_runnable(s);

        if next != me {
            s.context_switches += 1;
            let from: *mut SavedContext<A> = &mut s.thread_mut(me).context;
            let to: *const SavedContext<A> = &s.thread(next).context;
            s.set_current(next);
            drop(s);
            trace!("swap {} -> {}", me, next);
            // SAFETY: both contexts live in boxed TCBs that are never freed,
            // and interrupts are masked by `key`.
            unsafe { self.arch.switch_to(from, to) };
            s = self.lock_sched();
        } else {
            s.set_current(me);
        }

        let wake = s.thread_mut(me).wake.take();
        drop(s);
        self.arch.irq_unlock(key);
        wake.unwrap_or(Wake::Ready(WaitSlot::Empty))
    }

    /// Pop the next thread to run, idling until one exists
    fn next_runnable<'a>(&'a self, mut s: SchedGuard<'a, A>) -> (SchedGuard<'a, A>, ThreadId) {
        loop {
            if let Some(next) = s.pop_ready() {
                return (s, next);
            }
            drop(s);
            self.arch.idle();
            s = self.lock_sched();
        }
    }

    /// Preemption point: switch out a preemptible thread if a
    /// higher-priority one is ready. A no-op in interrupt context.
    pub fn reschedule(&self) {
        let mut s = self.lock_sched();
        if !s.should_preempt() {
            return;
        }
        let me = s.current();
        s.thread_mut(me).relinquish = Some(RelinquishCause::Preemptive);
        s.make_ready(me);
        let key = s.into_key();
        self.swap(key);
    }

    // ------------------------------------------------------------------
    // Wait / wake plumbing for the synchronization primitives
    // ------------------------------------------------------------------

    /// Allocate a wait queue
    pub(crate) fn create_wait_queue(&self) -> Result<WaitQueueId> {
        self.lock_sched().create_wait_queue()
    }

    /// Return a wait queue nobody waits on
    pub(crate) fn release_wait_queue(&self, wq: WaitQueueId) {
        self.lock_sched().release_wait_queue(wq);
    }

    /// Block the running thread on `wq` (or just on its timeout)
    ///
    /// The caller holds its own lock or an interrupt key; once it has
    /// released the lock with [`IrqGuard::into_key`] it hands the key to
    /// [`Kernel::swap`].
    pub(crate) fn pend_current(&self, wq: Option<WaitQueueId>, timeout: Timeout, slot: WaitSlot) {
        let mut s = self.lock_sched();
        self.pend_locked(&mut s, wq, timeout, slot);
    }

    fn pend_locked(
        &self,
        s: &mut Scheduler<A>,
        wq: Option<WaitQueueId>,
        timeout: Timeout,
        slot: WaitSlot,
    ) {
        debug_assert!(!timeout.is_no_wait(), "pend without waiting");
        debug_assert_eq!(s.isr_nesting, 0, "blocking call from interrupt context");
        let me = s.current();
        {
            let t = s.thread_mut(me);
            t.state = ThreadState::Blocked;
            t.slot = slot;
            t.wake = None;
            t.relinquish = Some(RelinquishCause::Cooperative);
        }
        if let Some(wq) = wq {
            s.pend(me, wq);
        }
        let now = s.clock.now();
        if let (Some(deadline), Some(alarm)) = (timeout.deadline(now), s.thread(me).timeout) {
            if let Ok(true) =
                self.alarms
                    .schedule(&self.arch, alarm, deadline, ScheduleFlags::REPLACE, now)
            {
                self.arch.set_deadline(self.alarms.next_deadline(&self.arch));
            }
        }
        trace!("{} pended on {:?} ({:?})", me, wq, timeout);
    }

    /// Cancel the pending timeout of `id`, if any
    fn stop_timeout(&self, s: &mut Scheduler<A>, id: ThreadId) {
        if let Some(alarm) = s.thread(id).timeout {
            if let Ok(true) = self.alarms.cancel(&self.arch, self, alarm) {
                self.arch.set_deadline(self.alarms.next_deadline(&self.arch));
            }
        }
    }

    /// Take the longest waiter off `wq`, cancelling its timeout
    ///
    /// The thread stays blocked until [`Kernel::ready_thread`].
    pub(crate) fn unpend_first(&self, wq: WaitQueueId) -> Option<ThreadId> {
        let mut s = self.lock_sched();
        let id = s.unpend_first(wq)?;
        self.stop_timeout(&mut s, id);
        Some(id)
    }

    /// Hand-off data a blocked thread published
    pub(crate) fn take_slot(&self, id: ThreadId) -> WaitSlot {
        mem::take(&mut self.lock_sched().thread_mut(id).slot)
    }

    /// Fill the return slot of a blocked thread and make it ready
    pub(crate) fn ready_thread(&self, id: ThreadId, wake: Wake) {
        let mut s = self.lock_sched();
        debug_assert_eq!(s.thread(id).state, ThreadState::Blocked);
        let t = s.thread_mut(id);
        t.slot = WaitSlot::Empty;
        t.wake = Some(wake);
        s.make_ready(id);
        trace!("{} readied", id);
    }

    /// Wake every waiter on `wq` with `wake`; returns how many
    pub(crate) fn wake_all(&self, wq: WaitQueueId, wake: Wake) -> usize {
        let mut woken = 0;
        while let Some(id) = self.unpend_first(wq) {
            self.ready_thread(id, wake.clone());
            woken += 1;
        }
        woken
    }

    /// Number of threads blocked on `wq`
    pub(crate) fn waiters(&self, wq: WaitQueueId) -> usize {
        self.lock_sched().waiter_count(wq)
    }

    /// A thread timeout fired
    fn expire(&self, id: ThreadId) {
        let mut s = self.lock_sched();
        if s.thread(id).state != ThreadState::Blocked {
            return;
        }
        s.unpend(id);
        let t = s.thread_mut(id);
        t.slot = WaitSlot::Empty;
        t.wake = Some(Wake::TimedOut);
        s.make_ready(id);
        trace!("{} timed out", id);
    }

    // ------------------------------------------------------------------
    // Interrupts and time
    // ------------------------------------------------------------------

    /// Enter interrupt context on top of the running thread
    pub fn isr_enter(&self) {
        let mut s = self.lock_sched();
        s.isr_nesting += 1;
        let me = s.current();
        s.thread_mut(me).flags |= ThreadFlags::IN_INTERRUPT;
    }

    /// Leave interrupt context; the outermost exit is a preemption point
    pub fn isr_exit(&self) {
        let outermost = {
            let mut s = self.lock_sched();
            debug_assert!(s.isr_nesting > 0, "isr_exit without isr_enter");
            s.isr_nesting = s.isr_nesting.saturating_sub(1);
            if s.isr_nesting == 0 {
                let me = s.current();
                s.thread_mut(me).flags.remove(ThreadFlags::IN_INTERRUPT);
                true
            } else {
                false
            }
        };
        if outermost {
            self.reschedule();
        }
    }

    /// Tick interrupt body: advance time by `ticks` and fire due alarms
    pub fn announce(&self, ticks: u32) {
        self.isr_enter();
        let now = self.lock_sched().clock.advance(ticks);
        let due = self.alarms.split(&self.arch, now);
        let fired = self.alarms.process_ready(&self.arch, self);
        if fired > 0 {
            trace!("{}: {} due, {} fired", now, due, fired);
        }
        self.arch.set_deadline(self.alarms.next_deadline(&self.arch));
        self.isr_exit();
    }

    /// Current tick
    pub fn now(&self) -> Tick {
        self.lock_sched().clock.now()
    }

    /// 64-bit tick count since boot
    pub fn uptime(&self) -> u64 {
        self.lock_sched().clock.uptime()
    }

    /// Unrecoverable error in the running thread
    ///
    /// Aborts it, or halts the system if it is essential.
    pub fn fatal_error(&self, reason: FatalReason) -> ! {
        let (me, essential) = {
            let mut s = self.lock_sched();
            let me = s.current();
            let t = s.thread_mut(me);
            t.flags |= ThreadFlags::IN_EXCEPTION;
            (me, t.flags.contains(ThreadFlags::ESSENTIAL))
        };
        warn!("fatal error {:?} in {}", reason, me);
        if essential {
            panic!("fatal error {:?} in essential {}", reason, me);
        }
        self.exit_current()
    }

    // ------------------------------------------------------------------
    // Alarm API
    // ------------------------------------------------------------------

    /// Allocate an alarm
    pub fn alarm_create(
        &self,
        handler: KernelAlarmHandler<A>,
        on_cancel: Option<KernelAlarmHandler<A>>,
        data: usize,
    ) -> Result<AlarmId> {
        self.alarms.create(&self.arch, handler, on_cancel, data)
    }

    /// Schedule `id` at absolute tick `deadline`
    ///
    /// Returns whether the earliest deadline changed; the deadline source
    /// has already been re-armed when it did.
    pub fn alarm_schedule(&self, id: AlarmId, deadline: Tick, flags: ScheduleFlags) -> Result<bool> {
        let now = self.now();
        let changed = self.alarms.schedule(&self.arch, id, deadline, flags, now)?;
        if changed {
            self.arch.set_deadline(self.alarms.next_deadline(&self.arch));
        }
        Ok(changed)
    }

    /// Cancel `id`, running its cancel callback
    pub fn alarm_cancel(&self, id: AlarmId) -> Result<bool> {
        let changed = self.alarms.cancel(&self.arch, self, id)?;
        if changed {
            self.arch.set_deadline(self.alarms.next_deadline(&self.arch));
        }
        Ok(changed)
    }

    /// Replace the word passed to the handler of `id`
    pub fn alarm_set_data(&self, id: AlarmId, data: usize) {
        self.alarms.set_data(&self.arch, id, data);
    }

    /// Return `id` to the arena
    pub fn alarm_release(&self, id: AlarmId) {
        self.alarms.release(&self.arch, id);
        self.arch.set_deadline(self.alarms.next_deadline(&self.arch));
    }

    /// State of `id`
    pub fn alarm_state(&self, id: AlarmId) -> AlarmState {
        self.alarms.state(&self.arch, id)
    }

    /// Deadline of `id` while pending
    pub fn alarm_deadline(&self, id: AlarmId) -> Option<Tick> {
        self.alarms.deadline(&self.arch, id)
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Tick> {
        self.alarms.next_deadline(&self.arch)
    }

    /// Execution statistics
    pub fn stats(&self) -> KernelStats {
        let s = self.lock_sched();
        KernelStats {
            ticks: s.clock.uptime(),
            context_switches: s.context_switches as u64,
            threads: s.live_count(),
            ready: s.ready_count(),
        }
    }
}

/// First code every thread runs
fn entry_wrapper<A: Arch>(kernel: usize, entry: ThreadEntry, args: [usize; 3], key: IrqKey) {
    // SAFETY: `create_thread` only plants the address of a `'static` kernel.
    let kernel = unsafe { &*(kernel as *const Kernel<A>) };
    kernel.arch.irq_unlock(key);
    entry(args[0], args[1], args[2]);
    kernel.exit_current();
}

/// Handler of every thread-timeout alarm; `data` is the thread index
fn thread_timeout<A: Arch>(kernel: &Kernel<A>, _alarm: AlarmId, data: usize) {
    kernel.expire(ThreadId(data as u16));
}

/// Kernel execution statistics
#[derive(Debug, Clone)]
pub struct KernelStats {
    /// Ticks since boot
    pub ticks: u64,
    /// Context switches performed
    pub context_switches: u64,
    /// Live threads
    pub threads: usize,
    /// Threads on the ready queue
    pub ready: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimArch;
    use crate::testing::{self, Recorder, SimKernel};
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn fiber(k: &'static SimKernel, entry: ThreadEntry, a1: usize, a2: usize) -> ThreadId {
        k.create_thread(
            testing::stack(),
            entry,
            [testing::addr(k), a1, a2],
            Priority(1),
            ThreadOptions::empty(),
        )
        .unwrap()
    }

    fn record_once(_: usize, log: usize, value: usize) {
        let log: &Recorder = testing::at(log);
        log.push(value as u32);
    }

    #[test]
    fn test_main_thread_registered() {
        let k = testing::kernel();
        assert_eq!(k.current(), ThreadId::MAIN);
        assert_eq!(k.thread_state(ThreadId::MAIN), ThreadState::Current);
        assert_eq!(
            k.flags(ThreadId::MAIN),
            ThreadFlags::TASK | ThreadFlags::PREEMPTIBLE | ThreadFlags::ESSENTIAL
        );
        assert_eq!(k.stack_info(ThreadId::MAIN), None);
        assert_eq!(k.stats().threads, 1);
    }

    #[test]
    fn test_fiber_preempts_main_and_exits() {
        let k = testing::kernel();
        let log = testing::leak(Recorder::new());
        let id = fiber(k, record_once, testing::addr(log), 7);

        assert_eq!(log.take(), [7]);
        assert_eq!(k.current(), ThreadId::MAIN);
        assert_eq!(k.thread_state(id), ThreadState::Aborted);
        assert_eq!(k.relinquish_cause(ThreadId::MAIN), Some(RelinquishCause::Preemptive));

        let stats = k.stats();
        assert_eq!(stats.context_switches, 2);
        assert_eq!(stats.threads, 1);
        assert_eq!(stats.ready, 0);
        assert_eq!(k.arch().switches(), 2);
    }

    #[test]
    fn test_stack_info() {
        let k = testing::kernel();
        let log = testing::leak(Recorder::new());
        let id = fiber(k, record_once, testing::addr(log), 0);
        let info = k.stack_info(id).unwrap();
        assert!(info.size <= 1024 && info.size >= 1024 - 2 * SimArch::STACK_ALIGN);
        assert_eq!(info.start % SimArch::STACK_ALIGN, 0);
    }

    #[test]
    fn test_yield_without_peers() {
        let k = testing::kernel();
        k.yield_now();
        assert_eq!(k.current(), ThreadId::MAIN);
        assert_eq!(k.stats().context_switches, 0);
        assert_eq!(k.relinquish_cause(ThreadId::MAIN), Some(RelinquishCause::Cooperative));
    }

    fn spinner(k: usize, log: usize, _: usize) {
        let k = testing::kernel_at(k);
        let log: &Recorder = testing::at(log);
        let me = k.current().index() as u32;
        for _ in 0..3 {
            log.push(me);
            k.yield_now();
        }
    }

    fn spawner(k: usize, log: usize, _: usize) {
        let kernel = testing::kernel_at(k);
        for _ in 0..2 {
            kernel
                .create_thread(
                    testing::stack(),
                    spinner,
                    [k, log, 0],
                    Priority(1),
                    ThreadOptions::empty(),
                )
                .unwrap();
        }
    }

    #[test]
    fn test_yield_round_robin_among_equals() {
        let k = testing::kernel();
        let log = testing::leak(Recorder::new());
        let spawned = fiber(k, spawner, testing::addr(log), 0);

        let (a, b) = (spawned.index() as u32 + 1, spawned.index() as u32 + 2);
        assert_eq!(log.take(), [a, b, a, b, a, b]);
        assert_eq!(
            k.relinquish_cause(ThreadId(a as u16)),
            Some(RelinquishCause::Cooperative)
        );
    }

    fn sleeper(k: usize, log: usize, ticks: usize) {
        let k = testing::kernel_at(k);
        let log: &Recorder = testing::at(log);
        k.sleep(ticks as u32);
        log.push(k.now().0);
    }

    #[test]
    fn test_sleep_until_announced() {
        let k = testing::kernel();
        let log = testing::leak(Recorder::new());
        let id = fiber(k, sleeper, testing::addr(log), 5);

        assert_eq!(k.thread_state(id), ThreadState::Blocked);
        assert_eq!(k.next_deadline(), Some(Tick(5)));
        assert_eq!(k.arch().armed_deadline(), Some(Tick(5)));

        k.announce(4);
        assert!(log.is_empty());
        k.announce(1);
        assert_eq!(log.take(), [5]);
        assert_eq!(k.arch().armed_deadline(), None);
        assert!(!k.arch().is_masked());
    }

    #[test]
    fn test_timeout_across_rollover() {
        let k = testing::kernel_with(KernelConfig::new().with_start_tick(Tick(u32::MAX - 2)));
        let log = testing::leak(Recorder::new());
        fiber(k, sleeper, testing::addr(log), 5);
        assert_eq!(k.next_deadline(), Some(Tick(2)));

        k.announce(4);
        assert_eq!(k.now(), Tick(1));
        assert!(log.is_empty());
        k.announce(1);
        assert_eq!(log.take(), [2]);
        assert_eq!(k.uptime(), (1u64 << 32) + 2);
    }

    #[test]
    fn test_wakeup_cancels_timeout() {
        let k = testing::kernel();
        let log = testing::leak(Recorder::new());
        let id = fiber(k, sleeper, testing::addr(log), 100);

        assert!(!k.wakeup(ThreadId::MAIN));
        assert!(k.wakeup(id));
        assert_eq!(log.take(), [0]);
        assert_eq!(k.next_deadline(), None);
        assert!(!k.wakeup(id));
    }

    #[test]
    fn test_abort_blocked_thread() {
        let k = testing::kernel();
        let log = testing::leak(Recorder::new());
        let id = fiber(k, sleeper, testing::addr(log), 10);

        k.abort(id);
        assert_eq!(k.thread_state(id), ThreadState::Aborted);
        assert_eq!(k.next_deadline(), None);
        #[cfg(feature = "thread-monitor")]
        assert_eq!(k.threads(), [ThreadId::MAIN]);

        k.announce(20);
        assert!(log.is_empty());
        // Idempotent.
        k.abort(id);
    }

    #[test]
    fn test_isr_defers_preemption() {
        let k = testing::kernel();
        let log = testing::leak(Recorder::new());

        k.isr_enter();
        assert!(k.flags(ThreadId::MAIN).contains(ThreadFlags::IN_INTERRUPT));
        let id = fiber(k, record_once, testing::addr(log), 1);
        assert_eq!(k.thread_state(id), ThreadState::Ready);
        assert!(log.is_empty());

        k.isr_exit();
        assert_eq!(log.take(), [1]);
        assert!(!k.flags(ThreadId::MAIN).contains(ThreadFlags::IN_INTERRUPT));
    }

    #[test]
    fn test_abort_ready_thread() {
        let k = testing::kernel();
        let log = testing::leak(Recorder::new());

        k.isr_enter();
        let id = fiber(k, record_once, testing::addr(log), 1);
        k.abort(id);
        k.isr_exit();

        assert!(log.is_empty());
        assert_eq!(k.thread_state(id), ThreadState::Aborted);
        assert_eq!(k.stats().ready, 0);
    }

    #[test]
    #[should_panic(expected = "essential")]
    fn test_abort_main_is_fatal() {
        let k = testing::kernel();
        k.abort(ThreadId::MAIN);
    }

    fn crasher(k: usize, _: usize, _: usize) {
        testing::kernel_at(k).fatal_error(FatalReason::StackOverflow)
    }

    #[test]
    fn test_fatal_error_aborts_thread() {
        let k = testing::kernel();
        let id = fiber(k, crasher, 0, 0);
        assert_eq!(k.thread_state(id), ThreadState::Aborted);
        assert!(k.flags(id).contains(ThreadFlags::IN_EXCEPTION));
        assert_eq!(k.current(), ThreadId::MAIN);
    }

    #[cfg(feature = "thread-custom-data")]
    fn data_user(k: usize, log: usize, _: usize) {
        let k = testing::kernel_at(k);
        let log: &Recorder = testing::at(log);
        log.push(k.custom_data() as u32);
        k.set_custom_data(7);
        log.push(k.custom_data() as u32);
    }

    #[cfg(feature = "thread-custom-data")]
    #[test]
    fn test_custom_data_is_per_thread() {
        let k = testing::kernel();
        let log = testing::leak(Recorder::new());
        k.set_custom_data(42);
        fiber(k, data_user, testing::addr(log), 0);
        assert_eq!(log.take(), [0, 7]);
        assert_eq!(k.custom_data(), 42);
    }

    #[cfg(feature = "thread-monitor")]
    #[test]
    fn test_monitor_lists_live_threads() {
        let k = testing::kernel();
        let log = testing::leak(Recorder::new());
        let a = fiber(k, sleeper, testing::addr(log), 3);
        let b = fiber(k, sleeper, testing::addr(log), 6);
        assert_eq!(k.threads(), [b, a, ThreadId::MAIN]);

        k.announce(3);
        assert_eq!(k.threads(), [b, ThreadId::MAIN]);
    }

    fn ring(k: &SimKernel, _: AlarmId, log: usize) {
        let log: &Recorder = testing::at(log);
        log.push(k.now().0);
    }

    #[test]
    fn test_alarm_api_rearms_deadline() {
        let k = testing::kernel();
        let log = testing::leak(Recorder::new());
        let alarm = k.alarm_create(ring, None, 0).unwrap();
        k.alarm_set_data(alarm, testing::addr(log));

        assert_eq!(k.alarm_schedule(alarm, Tick(10), ScheduleFlags::empty()), Ok(true));
        assert_eq!(k.arch().armed_deadline(), Some(Tick(10)));
        assert_eq!(k.alarm_deadline(alarm), Some(Tick(10)));
        assert_eq!(k.alarm_cancel(alarm), Ok(true));
        assert_eq!(k.arch().armed_deadline(), None);
        assert_eq!(k.alarm_cancel(alarm), Err(KernelError::NotScheduled));

        k.alarm_schedule(alarm, Tick(10), ScheduleFlags::empty()).unwrap();
        k.announce(10);
        assert_eq!(log.take(), [10]);
        assert_eq!(k.alarm_state(alarm), AlarmState::Unscheduled);
        assert_eq!(
            k.alarm_schedule(alarm, k.now(), ScheduleFlags::ERROR_IF_LATE),
            Err(KernelError::Late)
        );

        // A late replacement leaves the pending deadline armed.
        k.alarm_schedule(alarm, Tick(20), ScheduleFlags::empty()).unwrap();
        assert_eq!(
            k.alarm_schedule(
                alarm,
                k.now(),
                ScheduleFlags::REPLACE | ScheduleFlags::ERROR_IF_LATE
            ),
            Err(KernelError::Late)
        );
        assert_eq!(k.alarm_deadline(alarm), Some(Tick(20)));
        assert_eq!(k.arch().armed_deadline(), Some(Tick(20)));
        k.alarm_release(alarm);
        assert_eq!(k.arch().armed_deadline(), None);
    }

    fn deadline_sleeper(k: usize, deadline: usize, log: usize) {
        let k = testing::kernel_at(k);
        let log: &Recorder = testing::at(log);
        k.sleep_until(Tick(deadline as u32));
        assert!(Tick(deadline as u32).is_due(k.now()));
        log.push(deadline as u32);
    }

    #[test]
    fn test_threads_run_in_deadline_order() {
        let k = testing::kernel();
        let log = testing::leak(Recorder::new());
        let mut rng = SmallRng::seed_from_u64(0x0dea_d11e);
        let deadlines: Vec<u32> = (0..8).map(|_| rng.gen_range(1..1u32 << 30)).collect();

        for &deadline in &deadlines {
            k.create_thread(
                testing::stack(),
                deadline_sleeper,
                [testing::addr(k), deadline as usize, testing::addr(log)],
                Priority(4),
                ThreadOptions::empty(),
            )
            .unwrap();
        }
        assert_eq!(k.stats().ready, 0);
        assert!(log.is_empty());

        while let Some(next) = k.next_deadline() {
            k.announce(next.delta(k.now()).max(1) as u32);
        }

        let mut expected = deadlines;
        expected.sort_unstable();
        assert_eq!(log.take(), expected);
        assert_eq!(k.stats().threads, 1);
    }

    fn outcome(result: Result<()>) -> u32 {
        match result {
            Ok(()) => 1,
            Err(KernelError::TimedOut) => 2,
            Err(KernelError::Busy) => 3,
            Err(KernelError::Deadlock) => 4,
            Err(_) => 9,
        }
    }

    fn joiner(k: usize, target: usize, log: usize) {
        let k = testing::kernel_at(k);
        let log: &Recorder = testing::at(log);
        log.push(outcome(k.join(ThreadId(target as u16), Timeout::Forever)));
    }

    fn impatient_joiner(k: usize, target: usize, log: usize) {
        let k = testing::kernel_at(k);
        let log: &Recorder = testing::at(log);
        log.push(outcome(k.join(ThreadId(target as u16), Timeout::Ticks(3))));
    }

    #[test]
    fn test_join_waits_for_exit() {
        let k = testing::kernel();
        let log = testing::leak(Recorder::new());
        let target = fiber(k, sleeper, testing::addr(log), 5);
        let waiting = fiber(k, joiner, target.index(), testing::addr(log));
        assert_eq!(k.thread_state(waiting), ThreadState::Blocked);

        k.announce(5);
        assert_eq!(log.take(), [5, 1]);
        assert_eq!(k.thread_state(waiting), ThreadState::Aborted);
        assert_eq!(k.stats().threads, 1);
    }

    #[test]
    fn test_join_times_out() {
        let k = testing::kernel();
        let log = testing::leak(Recorder::new());
        let target = fiber(k, sleeper, testing::addr(log), 10);
        fiber(k, impatient_joiner, target.index(), testing::addr(log));

        k.announce(3);
        assert_eq!(log.take(), [2]);
        assert_eq!(k.thread_state(target), ThreadState::Blocked);
        k.announce(7);
        assert_eq!(log.take(), [10]);
    }

    #[test]
    fn test_join_without_waiting() {
        let k = testing::kernel();
        let log = testing::leak(Recorder::new());
        let target = fiber(k, sleeper, testing::addr(log), 10);

        assert_eq!(k.join(target, Timeout::NoWait), Err(KernelError::Busy));
        assert_eq!(k.join(ThreadId::MAIN, Timeout::Forever), Err(KernelError::Deadlock));
        assert_eq!(k.join(ThreadId(999), Timeout::NoWait), Err(KernelError::InvalidArgument));

        k.abort(target);
        assert_eq!(k.join(target, Timeout::NoWait), Ok(()));
        assert_eq!(k.join(target, Timeout::Forever), Ok(()));
        assert!(log.is_empty());
    }

    #[test]
    fn test_mutual_join_is_refused() {
        let k = testing::kernel();
        let log = testing::leak(Recorder::new());
        let waiting = fiber(k, joiner, ThreadId::MAIN.index(), testing::addr(log));
        assert_eq!(k.thread_state(waiting), ThreadState::Blocked);

        assert_eq!(k.join(waiting, Timeout::Forever), Err(KernelError::Deadlock));
        k.abort(waiting);
        assert!(log.is_empty());
        assert_eq!(k.stats().threads, 1);
    }

    #[test]
    fn test_timeout_queries() {
        let k = testing::kernel();
        let log = testing::leak(Recorder::new());
        let id = fiber(k, sleeper, testing::addr(log), 10);

        assert_eq!(k.timeout_expires(id), Tick(10));
        assert_eq!(k.timeout_remaining(id), 10);
        k.announce(4);
        assert_eq!(k.timeout_remaining(id), 6);

        assert_eq!(k.timeout_remaining(ThreadId::MAIN), 0);
        assert_eq!(k.timeout_expires(ThreadId::MAIN), k.now());

        assert!(k.wakeup(id));
        assert_eq!(log.take(), [4]);
        assert_eq!(k.timeout_remaining(id), 0);
    }

    fn report_mask(k: usize, log: usize, _: usize) {
        let k = testing::kernel_at(k);
        let log: &Recorder = testing::at(log);
        log.push(k.arch().is_masked() as u32);
    }

    #[test]
    fn test_new_thread_starts_unmasked() {
        let k = testing::kernel();
        let log = testing::leak(Recorder::new());
        fiber(k, report_mask, testing::addr(log), 0);
        assert_eq!(log.take(), [0]);
        assert!(!k.arch().is_masked());
    }
}
