//! Deadline-ordered alarms
//!
//! Two index-linked lists share one lock:
//! - `scheduled`: pending alarms in non-decreasing deadline order
//! - `ready`: alarms whose deadline has been reached, FIFO
//!
//! [`AlarmQueue::split`] moves the due prefix of `scheduled` to `ready` in
//! one splice. [`AlarmQueue::process_ready`] then fires them one at a time
//! with the lock released, so a handler may schedule or cancel alarms
//! (including itself). Thread timeouts are ordinary alarms.
//!
//! `C` is the context handed to handlers; the kernel uses itself. The
//! lock is an [`IrqLock`], so every call takes the port that masks
//! interrupts around it.

use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;
use log::debug;

use crate::arch::{Arch, IrqLock};
use crate::error::{KernelError, Result};
use crate::time::Tick;

/// Alarm callback: `(context, alarm, user data)`
pub type AlarmHandler<C> = fn(&C, AlarmId, usize);

/// Handle of an alarm in the queue's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlarmId(pub(crate) u16);

impl AlarmId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for AlarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alarm#{}", self.0)
    }
}

/// Alarm lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmState {
    /// Not on any list
    Unscheduled,
    /// On the scheduled list
    Scheduled,
    /// Due, on the ready list
    Ready,
    /// Handler running
    Active,
    /// Removed by cancel
    Cancelled,
}

bitflags! {
    /// Options for [`AlarmQueue::schedule`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ScheduleFlags: u8 {
        /// Reschedule an alarm that is already pending
        const REPLACE = 1 << 0;
        /// Reschedule a pending alarm only if the new deadline is earlier
        const IF_SOONER = 1 << 1;
        /// Fail with `Late` instead of firing a deadline that already passed
        const ERROR_IF_LATE = 1 << 2;
    }
}

struct Alarm<C> {
    deadline: Tick,
    state: AlarmState,
    handler: AlarmHandler<C>,
    on_cancel: Option<AlarmHandler<C>>,
    data: usize,
    prev: Option<AlarmId>,
    next: Option<AlarmId>,
    in_use: bool,
}

impl<C> Alarm<C> {
    fn new(handler: AlarmHandler<C>, on_cancel: Option<AlarmHandler<C>>, data: usize) -> Self {
        Self {
            deadline: Tick(0),
            state: AlarmState::Unscheduled,
            handler,
            on_cancel,
            data,
            prev: None,
            next: None,
            in_use: true,
        }
    }
}

#[derive(Default, Clone, Copy)]
struct List {
    head: Option<AlarmId>,
    tail: Option<AlarmId>,
}

struct Lists<C> {
    slots: Vec<Alarm<C>>,
    free: Vec<AlarmId>,
    scheduled: List,
    ready: List,
}

impl<C> Lists<C> {
    fn slot(&mut self, id: AlarmId) -> &mut Alarm<C> {
        &mut self.slots[id.index()]
    }

    fn list_mut(&mut self, state: AlarmState) -> Option<&mut List> {
        match state {
            AlarmState::Scheduled => Some(&mut self.scheduled),
            AlarmState::Ready => Some(&mut self.ready),
            _ => None,
        }
    }

    /// Remove `id` from whichever list its state says it is on
    fn unlink(&mut self, id: AlarmId) {
        let (state, prev, next) = {
            let a = self.slot(id);
            (a.state, a.prev.take(), a.next.take())
        };
        match prev {
            Some(p) => self.slot(p).next = next,
            None => {
                if let Some(list) = self.list_mut(state) {
                    list.head = next;
                }
            }
        }
        match next {
            Some(n) => self.slot(n).prev = prev,
            None => {
                if let Some(list) = self.list_mut(state) {
                    list.tail = prev;
                }
            }
        }
    }

    fn push_ready(&mut self, id: AlarmId) {
        let tail = self.ready.tail;
        {
            let a = self.slot(id);
            a.state = AlarmState::Ready;
            a.prev = tail;
            a.next = None;
        }
        match tail {
            Some(t) => self.slot(t).next = Some(id),
            None => self.ready.head = Some(id),
        }
        self.ready.tail = Some(id);
    }

    /// Insert behind every alarm due no later than `deadline`
    fn insert_sorted(&mut self, id: AlarmId, deadline: Tick, now: Tick) {
        let delay = deadline.delta(now);
        let mut cursor = self.scheduled.head;
        while let Some(c) = cursor {
            if self.slots[c.index()].deadline.delta(now) > delay {
                break;
            }
            cursor = self.slots[c.index()].next;
        }

        let prev = match cursor {
            Some(c) => self.slots[c.index()].prev,
            None => self.scheduled.tail,
        };
        {
            let a = self.slot(id);
            a.deadline = deadline;
            a.state = AlarmState::Scheduled;
            a.prev = prev;
            a.next = cursor;
        }
        match prev {
            Some(p) => self.slot(p).next = Some(id),
            None => self.scheduled.head = Some(id),
        }
        match cursor {
            Some(c) => self.slot(c).prev = Some(id),
            None => self.scheduled.tail = Some(id),
        }
    }

    fn head_deadline(&self) -> Option<(AlarmId, Tick)> {
        self.scheduled
            .head
            .map(|h| (h, self.slots[h.index()].deadline))
    }
}

/// Deadline-ordered alarm set
pub struct AlarmQueue<C> {
    inner: IrqLock<Lists<C>>,
}

impl<C> AlarmQueue<C> {
    /// Empty queue
    pub const fn new() -> Self {
        Self {
            inner: IrqLock::new(Lists {
                slots: Vec::new(),
                free: Vec::new(),
                scheduled: List {
                    head: None,
                    tail: None,
                },
                ready: List {
                    head: None,
                    tail: None,
                },
            }),
        }
    }

    /// Queue holding one unscheduled alarm, which gets the first handle
    pub fn with_alarm(
        handler: AlarmHandler<C>,
        on_cancel: Option<AlarmHandler<C>>,
        data: usize,
    ) -> (Self, AlarmId) {
        let mut queue = Self::new();
        queue.inner.get_mut().slots.push(Alarm::new(handler, on_cancel, data));
        (queue, AlarmId(0))
    }

    /// Allocate an unscheduled alarm
    ///
    /// Fails with `Exhausted` once every 16-bit handle is live.
    pub fn create<A: Arch>(
        &self,
        arch: &A,
        handler: AlarmHandler<C>,
        on_cancel: Option<AlarmHandler<C>>,
        data: usize,
    ) -> Result<AlarmId> {
        let mut lists = self.inner.lock(arch);
        let alarm = Alarm::new(handler, on_cancel, data);
        match lists.free.pop() {
            Some(id) => {
                *lists.slot(id) = alarm;
                Ok(id)
            }
            None => {
                let id = u16::try_from(lists.slots.len())
                    .map(AlarmId)
                    .map_err(|_| KernelError::Exhausted)?;
                lists.slots.push(alarm);
                Ok(id)
            }
        }
    }

    /// Return an alarm to the arena, unlinking it first if pending
    ///
    /// The cancel callback is not invoked.
    pub fn release<A: Arch>(&self, arch: &A, id: AlarmId) {
        let mut lists = self.inner.lock(arch);
        if !lists.slots[id.index()].in_use {
            return;
        }
        lists.unlink(id);
        let a = lists.slot(id);
        a.state = AlarmState::Unscheduled;
        a.in_use = false;
        lists.free.push(id);
    }

    /// Replace the user data passed to the handler
    pub fn set_data<A: Arch>(&self, arch: &A, id: AlarmId, data: usize) {
        self.inner.lock(arch).slot(id).data = data;
    }

    /// Schedule `id` to fire at `deadline`
    ///
    /// Returns whether the earliest pending deadline changed, i.e. whether
    /// the hardware deadline source must be re-armed. A call that fails
    /// leaves a pending alarm where it was.
    pub fn schedule<A: Arch>(
        &self,
        arch: &A,
        id: AlarmId,
        deadline: Tick,
        flags: ScheduleFlags,
        now: Tick,
    ) -> Result<bool> {
        let mut lists = self.inner.lock(arch);
        if !lists.slots[id.index()].in_use {
            return Err(KernelError::InvalidArgument);
        }
        let before = lists.head_deadline();

        let (state, current) = {
            let a = lists.slot(id);
            (a.state, a.deadline)
        };
        let pending = matches!(state, AlarmState::Scheduled | AlarmState::Ready);
        if pending && !flags.contains(ScheduleFlags::REPLACE) {
            if !flags.contains(ScheduleFlags::IF_SOONER) {
                return Err(KernelError::Busy);
            }
            if deadline.delta(now) >= current.delta(now) {
                return Ok(false);
            }
        }
        let late = deadline.is_due(now);
        if late && flags.contains(ScheduleFlags::ERROR_IF_LATE) {
            return Err(KernelError::Late);
        }
        if pending {
            lists.unlink(id);
            lists.slot(id).state = AlarmState::Unscheduled;
        }

        if !late {
            lists.insert_sorted(id, deadline, now);
            debug!("{} scheduled for {} (now {})", id, deadline, now);
        } else {
            lists.slot(id).deadline = deadline;
            lists.push_ready(id);
            debug!("{} already due at {} (now {})", id, deadline, now);
        }

        Ok(lists.head_deadline() != before)
    }

    /// Remove a pending alarm and run its cancel callback
    ///
    /// Returns whether it was the earliest scheduled alarm. Cancelling an
    /// alarm that is not pending is a harmless `NotScheduled` error.
    pub fn cancel<A: Arch>(&self, arch: &A, ctx: &C, id: AlarmId) -> Result<bool> {
        let (was_head, callback, data) = {
            let mut lists = self.inner.lock(arch);
            if !lists.slots[id.index()].in_use {
                return Err(KernelError::InvalidArgument);
            }
            let state = lists.slots[id.index()].state;
            if !matches!(state, AlarmState::Scheduled | AlarmState::Ready) {
                return Err(KernelError::NotScheduled);
            }
            let was_head = state == AlarmState::Scheduled && lists.scheduled.head == Some(id);
            lists.unlink(id);
            let a = lists.slot(id);
            a.state = AlarmState::Cancelled;
            (was_head, a.on_cancel, a.data)
        };

        if let Some(callback) = callback {
            callback(ctx, id, data);
        }
        Ok(was_head)
    }

    /// Move every alarm due at `now` onto the ready list
    ///
    /// Returns how many were moved.
    pub fn split<A: Arch>(&self, arch: &A, now: Tick) -> usize {
        let mut lists = self.inner.lock(arch);
        let first = match lists.scheduled.head {
            Some(h) if lists.slots[h.index()].deadline.is_due(now) => h,
            _ => return 0,
        };

        let mut last = first;
        let mut moved = 0;
        let mut cursor = Some(first);
        while let Some(c) = cursor {
            let a = lists.slot(c);
            if !a.deadline.is_due(now) {
                break;
            }
            a.state = AlarmState::Ready;
            last = c;
            moved += 1;
            cursor = a.next;
        }

        // Detach [first..=last] from `scheduled`.
        lists.scheduled.head = cursor;
        match cursor {
            Some(c) => lists.slot(c).prev = None,
            None => lists.scheduled.tail = None,
        }
        lists.slot(last).next = None;

        // Append it to `ready`.
        let tail = lists.ready.tail;
        lists.slot(first).prev = tail;
        match tail {
            Some(t) => lists.slot(t).next = Some(first),
            None => lists.ready.head = Some(first),
        }
        lists.ready.tail = Some(last);
        moved
    }

    /// Fire every ready alarm, lock released around each handler
    ///
    /// Returns how many handlers ran.
    pub fn process_ready<A: Arch>(&self, arch: &A, ctx: &C) -> usize {
        let mut fired = 0;
        loop {
            let (id, handler, data) = {
                let mut lists = self.inner.lock(arch);
                let Some(id) = lists.ready.head else {
                    break;
                };
                lists.unlink(id);
                let a = lists.slot(id);
                a.state = AlarmState::Active;
                (id, a.handler, a.data)
            };

            handler(ctx, id, data);
            fired += 1;

            let mut lists = self.inner.lock(arch);
            let a = lists.slot(id);
            if a.in_use && a.state == AlarmState::Active {
                a.state = AlarmState::Unscheduled;
            }
        }
        fired
    }

    /// Earliest pending deadline
    pub fn next_deadline<A: Arch>(&self, arch: &A) -> Option<Tick> {
        self.inner.lock(arch).head_deadline().map(|(_, d)| d)
    }

    /// Are any alarms due but not yet fired?
    pub fn has_ready<A: Arch>(&self, arch: &A) -> bool {
        self.inner.lock(arch).ready.head.is_some()
    }

    /// State of `id`
    pub fn state<A: Arch>(&self, arch: &A, id: AlarmId) -> AlarmState {
        self.inner.lock(arch).slots[id.index()].state
    }

    /// Deadline of `id` while it is pending
    pub fn deadline<A: Arch>(&self, arch: &A, id: AlarmId) -> Option<Tick> {
        let lists = self.inner.lock(arch);
        let a = &lists.slots[id.index()];
        match a.state {
            AlarmState::Scheduled | AlarmState::Ready => Some(a.deadline),
            _ => None,
        }
    }
}

impl<C> Default for AlarmQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimArch;
    use core::cell::{Cell, RefCell};
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    type Log = RefCell<Vec<usize>>;

    fn record(log: &Log, _id: AlarmId, data: usize) {
        log.borrow_mut().push(data);
    }

    fn record_cancel(log: &Log, _id: AlarmId, data: usize) {
        log.borrow_mut().push(1000 + data);
    }

    fn fire_all(arch: &SimArch, queue: &AlarmQueue<Log>, log: &Log, now: Tick) {
        queue.split(arch, now);
        queue.process_ready(arch, log);
    }

    fn scheduled_at(arch: &SimArch, queue: &AlarmQueue<Log>, data: usize, deadline: Tick) -> AlarmId {
        let id = queue.create(arch, record, None, data).unwrap();
        queue.schedule(arch, id, deadline, ScheduleFlags::empty(), Tick(0)).unwrap();
        id
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let arch = SimArch::new();
        let queue = AlarmQueue::<Log>::new();
        let log = Log::default();
        let now = Tick(100);
        for (data, delay) in [(0, 30), (1, 10), (2, 20), (3, 5)] {
            let id = queue.create(&arch, record, None, data).unwrap();
            queue.schedule(&arch, id, now.after(delay), ScheduleFlags::empty(), now).unwrap();
        }
        fire_all(&arch, &queue, &log, now.after(100));
        assert_eq!(*log.borrow(), [3, 1, 2, 0]);
        assert!(!arch.is_masked());
    }

    #[test]
    fn test_equal_deadlines_fire_in_insertion_order() {
        let arch = SimArch::new();
        let queue = AlarmQueue::<Log>::new();
        let log = Log::default();
        for data in 0..4 {
            scheduled_at(&arch, &queue, data, Tick(50));
        }
        fire_all(&arch, &queue, &log, Tick(50));
        assert_eq!(*log.borrow(), [0, 1, 2, 3]);
    }

    #[test]
    fn test_random_deadlines_across_rollover() {
        let arch = SimArch::new();
        let queue = AlarmQueue::<Log>::new();
        let log = Log::default();
        let mut rng = SmallRng::seed_from_u64(0x5eed);
        let now = Tick(u32::MAX - 1_000);
        let mut deadlines = Vec::new();
        for data in 0..64 {
            let delay = rng.gen_range(1..5_000u32);
            let deadline = now.after(delay);
            deadlines.push((delay, data));
            let id = queue.create(&arch, record, None, data).unwrap();
            queue.schedule(&arch, id, deadline, ScheduleFlags::empty(), now).unwrap();
        }

        // Advance in uneven steps past the rollover.
        let mut t = now;
        for step in [700, 300, 1, 2_000, 3_000] {
            t = t.after(step);
            fire_all(&arch, &queue, &log, t);
        }

        deadlines.sort_by_key(|&(delay, _)| delay);
        let fired = log.borrow().clone();
        assert_eq!(fired.len(), 64);
        let fired_delays: Vec<u32> = fired
            .iter()
            .map(|d| deadlines.iter().find(|&&(_, data)| data == *d).unwrap().0)
            .collect();
        assert!(fired_delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_split_only_moves_due_prefix() {
        let arch = SimArch::new();
        let queue = AlarmQueue::<Log>::new();
        let a = scheduled_at(&arch, &queue, 0, Tick(10));
        let b = scheduled_at(&arch, &queue, 1, Tick(20));
        let c = scheduled_at(&arch, &queue, 2, Tick(30));

        assert_eq!(queue.split(&arch, Tick(20)), 2);
        assert_eq!(queue.state(&arch, a), AlarmState::Ready);
        assert_eq!(queue.state(&arch, b), AlarmState::Ready);
        assert_eq!(queue.state(&arch, c), AlarmState::Scheduled);
        assert_eq!(queue.next_deadline(&arch), Some(Tick(30)));
        assert!(queue.has_ready(&arch));
    }

    #[test]
    fn test_head_change_signal() {
        let arch = SimArch::new();
        let queue = AlarmQueue::<Log>::new();
        let a = queue.create(&arch, record, None, 0).unwrap();
        let b = queue.create(&arch, record, None, 1).unwrap();
        assert!(queue.schedule(&arch, a, Tick(50), ScheduleFlags::empty(), Tick(0)).unwrap());
        // Later deadline does not move the head.
        assert!(!queue.schedule(&arch, b, Tick(80), ScheduleFlags::empty(), Tick(0)).unwrap());
        // Pulling b in front does.
        assert!(queue.schedule(&arch, b, Tick(20), ScheduleFlags::REPLACE, Tick(0)).unwrap());
        assert_eq!(queue.next_deadline(&arch), Some(Tick(20)));
        assert!(queue.cancel(&arch, &Log::default(), b).unwrap());
        assert_eq!(queue.cancel(&arch, &Log::default(), a), Ok(true));
    }

    #[test]
    fn test_reschedule_flags() {
        let arch = SimArch::new();
        let queue = AlarmQueue::<Log>::new();
        let a = scheduled_at(&arch, &queue, 0, Tick(50));

        assert_eq!(
            queue.schedule(&arch, a, Tick(40), ScheduleFlags::empty(), Tick(0)),
            Err(KernelError::Busy)
        );
        assert_eq!(queue.schedule(&arch, a, Tick(60), ScheduleFlags::IF_SOONER, Tick(0)), Ok(false));
        assert_eq!(queue.deadline(&arch, a), Some(Tick(50)));
        assert_eq!(queue.schedule(&arch, a, Tick(30), ScheduleFlags::IF_SOONER, Tick(0)), Ok(true));
        assert_eq!(queue.deadline(&arch, a), Some(Tick(30)));
        assert_eq!(queue.schedule(&arch, a, Tick(90), ScheduleFlags::REPLACE, Tick(0)), Ok(true));
        assert_eq!(queue.deadline(&arch, a), Some(Tick(90)));
    }

    #[test]
    fn test_late_deadline() {
        let arch = SimArch::new();
        let queue = AlarmQueue::<Log>::new();
        let log = Log::default();
        let a = queue.create(&arch, record, None, 7).unwrap();
        assert_eq!(
            queue.schedule(&arch, a, Tick(90), ScheduleFlags::ERROR_IF_LATE, Tick(100)),
            Err(KernelError::Late)
        );
        assert_eq!(queue.state(&arch, a), AlarmState::Unscheduled);

        // Without the flag it goes straight to the ready list.
        assert_eq!(queue.schedule(&arch, a, Tick(100), ScheduleFlags::empty(), Tick(100)), Ok(false));
        assert_eq!(queue.state(&arch, a), AlarmState::Ready);
        queue.process_ready(&arch, &log);
        assert_eq!(*log.borrow(), [7]);
        assert_eq!(queue.state(&arch, a), AlarmState::Unscheduled);
    }

    #[test]
    fn test_late_replace_keeps_pending_alarm() {
        let arch = SimArch::new();
        let queue = AlarmQueue::<Log>::new();
        let now = Tick(5);
        let a = queue.create(&arch, record, None, 0).unwrap();
        assert_eq!(queue.schedule(&arch, a, Tick(10), ScheduleFlags::empty(), now), Ok(true));

        let flags = ScheduleFlags::REPLACE | ScheduleFlags::ERROR_IF_LATE;
        assert_eq!(queue.schedule(&arch, a, Tick(3), flags, now), Err(KernelError::Late));
        assert_eq!(queue.state(&arch, a), AlarmState::Scheduled);
        assert_eq!(queue.deadline(&arch, a), Some(Tick(10)));
        assert_eq!(queue.next_deadline(&arch), Some(Tick(10)));

        let sooner = ScheduleFlags::IF_SOONER | ScheduleFlags::ERROR_IF_LATE;
        assert_eq!(queue.schedule(&arch, a, now, sooner, now), Err(KernelError::Late));
        assert_eq!(queue.deadline(&arch, a), Some(Tick(10)));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let arch = SimArch::new();
        let queue = AlarmQueue::<Log>::new();
        let log = Log::default();
        let a = queue.create(&arch, record, Some(record_cancel), 4).unwrap();
        assert_eq!(queue.cancel(&arch, &log, a), Err(KernelError::NotScheduled));

        queue.schedule(&arch, a, Tick(10), ScheduleFlags::empty(), Tick(0)).unwrap();
        assert_eq!(queue.cancel(&arch, &log, a), Ok(true));
        assert_eq!(queue.state(&arch, a), AlarmState::Cancelled);
        assert_eq!(queue.cancel(&arch, &log, a), Err(KernelError::NotScheduled));
        assert_eq!(*log.borrow(), [1004]);

        fire_all(&arch, &queue, &log, Tick(100));
        assert_eq!(*log.borrow(), [1004]);
    }

    #[test]
    fn test_cancel_from_ready_list() {
        let arch = SimArch::new();
        let queue = AlarmQueue::<Log>::new();
        let log = Log::default();
        let a = scheduled_at(&arch, &queue, 1, Tick(10));
        scheduled_at(&arch, &queue, 2, Tick(10));
        queue.split(&arch, Tick(10));
        assert_eq!(queue.cancel(&arch, &log, a), Ok(false));
        queue.process_ready(&arch, &log);
        assert_eq!(*log.borrow(), [2]);
    }

    struct Rearm {
        arch: SimArch,
        queue: AlarmQueue<Rearm>,
        now: Cell<Tick>,
        fired: RefCell<Vec<Tick>>,
    }

    fn periodic(ctx: &Rearm, id: AlarmId, period: usize) {
        let now = ctx.now.get();
        ctx.fired.borrow_mut().push(now);
        if ctx.fired.borrow().len() < 3 {
            ctx.queue
                .schedule(&ctx.arch, id, now.after(period as u32), ScheduleFlags::empty(), now)
                .unwrap();
        }
    }

    #[test]
    fn test_handler_can_rearm_itself() {
        let ctx = Rearm {
            arch: SimArch::new(),
            queue: AlarmQueue::new(),
            now: Cell::new(Tick(0)),
            fired: RefCell::new(Vec::new()),
        };
        let arch = &ctx.arch;
        let id = ctx.queue.create(arch, periodic, None, 10).unwrap();
        ctx.queue.schedule(arch, id, Tick(10), ScheduleFlags::empty(), Tick(0)).unwrap();

        for t in (5..=60).step_by(5) {
            ctx.now.set(Tick(t));
            ctx.queue.split(arch, Tick(t));
            ctx.queue.process_ready(arch, &ctx);
        }
        assert_eq!(*ctx.fired.borrow(), [Tick(10), Tick(20), Tick(30)]);
        assert_eq!(ctx.queue.state(arch, id), AlarmState::Unscheduled);
    }

    #[test]
    fn test_release_reuses_slot() {
        let arch = SimArch::new();
        let queue = AlarmQueue::<Log>::new();
        let a = scheduled_at(&arch, &queue, 0, Tick(10));
        queue.release(&arch, a);
        assert_eq!(queue.next_deadline(&arch), None);
        let b = queue.create(&arch, record, None, 1).unwrap();
        assert_eq!(a, b);
        assert_eq!(queue.state(&arch, b), AlarmState::Unscheduled);
    }

    #[test]
    fn test_handles_run_out_instead_of_wrapping() {
        let arch = SimArch::new();
        let queue = AlarmQueue::<Log>::new();
        for _ in 0..=u16::MAX as usize {
            queue.create(&arch, record, None, 0).unwrap();
        }
        assert_eq!(queue.create(&arch, record, None, 0), Err(KernelError::Exhausted));
        queue.release(&arch, AlarmId(7));
        assert_eq!(queue.create(&arch, record, None, 0), Ok(AlarmId(7)));
    }
}
