//! Kernel timers
//!
//! A [`Timer`] wraps one kernel alarm. It fires once after an initial
//! duration and then, if it has a period, every `period` ticks. Each
//! expiry bumps a status counter that threads read with
//! [`Timer::status_get`] or wait on with [`Timer::status_sync`].
//!
//! Periods are measured from the previous deadline, not from when the
//! handler ran, so a late tick makes the timer catch up instead of drift.

use core::mem;

use log::{trace, warn};

use crate::arch::{Arch, IrqLock};
use crate::error::Result;
use crate::kernel::Kernel;
use crate::sched::WaitQueueId;
use crate::thread::{WaitSlot, Wake};
use crate::time::{Tick, Timeout};
use crate::timeout::{AlarmId, ScheduleFlags};

/// Expiry or stop callback, run in interrupt context with no lock held
pub type TimerFn<A> = fn(&Kernel<A>, &Timer<A>);

struct TimerState {
    /// Ticks between expiries; 0 for a one-shot
    period: u32,
    /// Expiries since the status was last read
    status: u32,
    running: bool,
    /// Deadline the alarm is armed for
    next: Tick,
    user_data: usize,
}

/// One-shot or periodic timer
pub struct Timer<A: Arch> {
    alarm: AlarmId,
    wq: WaitQueueId,
    expiry: Option<TimerFn<A>>,
    stop: Option<TimerFn<A>>,
    state: IrqLock<TimerState>,
}

impl<A: Arch> Timer<A> {
    /// Stopped timer
    ///
    /// `expiry` runs on every expiry, `stop` when a running timer is
    /// stopped.
    pub fn new(
        k: &Kernel<A>,
        expiry: Option<TimerFn<A>>,
        stop: Option<TimerFn<A>>,
    ) -> Result<Self> {
        let alarm = k.alarm_create(timer_expired::<A>, None, 0)?;
        let wq = match k.create_wait_queue() {
            Ok(wq) => wq,
            Err(e) => {
                k.alarm_release(alarm);
                return Err(e);
            }
        };
        Ok(Self {
            alarm,
            wq,
            expiry,
            stop,
            state: IrqLock::new(TimerState {
                period: 0,
                status: 0,
                running: false,
                next: Tick(0),
                user_data: 0,
            }),
        })
    }

    /// (Re)start: first expiry in `duration` ticks, then every `period`
    ///
    /// A zero `period` makes a one-shot. Resets the status counter.
    /// Both lengths are clamped to [`Timeout::MAX_TICKS`].
    pub fn start(&'static self, k: &Kernel<A>, duration: u32, period: u32) -> Result<()> {
        k.alarm_set_data(self.alarm, self as *const Self as usize);
        let first = {
            let mut s = self.state.lock(k.arch());
            s.period = period.min(Timeout::MAX_TICKS);
            s.status = 0;
            s.running = true;
            s.next = k.now().after(duration.min(Timeout::MAX_TICKS));
            s.next
        };
        trace!("timer {:?} starts at {} period {}", self.alarm, first, period);
        k.alarm_schedule(self.alarm, first, ScheduleFlags::REPLACE).map(|_| ())
    }

    /// Stop the timer
    ///
    /// Threads in [`Timer::status_sync`] are released. The stop callback
    /// runs only if the timer was running.
    pub fn stop(&self, k: &Kernel<A>) {
        let (was_running, woken) = {
            let mut s = self.state.lock(k.arch());
            let was_running = mem::replace(&mut s.running, false);
            (was_running, k.wake_all(self.wq, Wake::Cancelled))
        };
        if !was_running {
            return;
        }
        // A one-shot that already fired is no longer pending.
        let _ = k.alarm_cancel(self.alarm);
        if let Some(stop) = self.stop {
            stop(k, self);
        }
        if woken > 0 {
            k.reschedule();
        }
    }

    /// Expiries since the last read; resets the counter
    pub fn status_get(&self, k: &Kernel<A>) -> u32 {
        mem::take(&mut self.state.lock(k.arch()).status)
    }

    /// Wait for the next expiry and return the counter, resetting it
    ///
    /// Returns at once if the timer already expired since the last read,
    /// and 0 if it is stopped (or gets stopped during the wait).
    pub fn status_sync(&self, k: &Kernel<A>) -> u32 {
        let mut s = self.state.lock(k.arch());
        if s.status > 0 {
            return mem::take(&mut s.status);
        }
        if !s.running {
            return 0;
        }
        k.pend_current(Some(self.wq), Timeout::Forever, WaitSlot::Empty);
        let key = s.into_key();
        k.swap(key);
        mem::take(&mut self.state.lock(k.arch()).status)
    }

    /// Tick of the next expiry, while running
    pub fn expires(&self, k: &Kernel<A>) -> Option<Tick> {
        k.alarm_deadline(self.alarm)
    }

    /// Ticks until the next expiry; 0 when stopped
    pub fn remaining(&self, k: &Kernel<A>) -> u32 {
        match self.expires(k) {
            Some(deadline) => deadline.delta(k.now()).max(0) as u32,
            None => 0,
        }
    }

    pub fn is_running(&self, k: &Kernel<A>) -> bool {
        self.state.lock(k.arch()).running
    }

    pub fn user_data(&self, k: &Kernel<A>) -> usize {
        self.state.lock(k.arch()).user_data
    }

    pub fn set_user_data(&self, k: &Kernel<A>, data: usize) {
        self.state.lock(k.arch()).user_data = data;
    }

    /// Release the alarm and wait queue
    pub fn cleanup(self, k: &Kernel<A>) {
        debug_assert_eq!(k.waiters(self.wq), 0);
        k.alarm_release(self.alarm);
        k.release_wait_queue(self.wq);
    }

    fn expired(&self, k: &Kernel<A>) {
        {
            let mut s = self.state.lock(k.arch());
            if !s.running {
                return;
            }
            s.status = s.status.saturating_add(1);
            if s.period > 0 {
                s.next = s.next.after(s.period);
                if let Err(e) = k.alarm_schedule(self.alarm, s.next, ScheduleFlags::empty()) {
                    warn!("timer {:?} not rearmed: {}", self.alarm, e);
                    s.running = false;
                }
            } else {
                s.running = false;
            }
            k.wake_all(self.wq, Wake::Ready(WaitSlot::Empty));
        }
        if let Some(expiry) = self.expiry {
            expiry(k, self);
        }
    }
}

/// Alarm handler shared by every timer; `data` is the timer's address
fn timer_expired<A: Arch>(k: &Kernel<A>, _alarm: AlarmId, data: usize) {
    // SAFETY: `start` plants the address of a `'static` timer before the
    // alarm can fire.
    let timer = unsafe { &*(data as *const Timer<A>) };
    timer.expired(k);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimArch;
    use crate::testing::{self, Recorder, SimKernel};
    use crate::thread::{Priority, ThreadOptions};

    type SimTimer = Timer<SimArch>;

    fn log_now(k: &SimKernel, timer: &SimTimer) {
        let log: &Recorder = testing::at(timer.user_data(k));
        log.push(k.now().0);
    }

    fn log_stop(k: &SimKernel, timer: &SimTimer) {
        let log: &Recorder = testing::at(timer.user_data(k));
        log.push(99);
    }

    fn timer(k: &'static SimKernel, log: &'static Recorder) -> &'static SimTimer {
        let timer = testing::leak(Timer::new(k, Some(log_now), Some(log_stop)).unwrap());
        timer.set_user_data(k, testing::addr(log));
        timer
    }

    #[test]
    fn test_periodic_timer_counts_expiries() {
        let k = testing::kernel();
        let log = testing::leak(Recorder::new());
        let t = timer(k, log);
        t.start(k, 5, 3).unwrap();
        assert_eq!(t.expires(k), Some(Tick(5)));

        k.announce(4);
        assert_eq!(t.status_get(k), 0);
        assert_eq!(t.remaining(k), 1);
        k.announce(1);
        assert_eq!(t.status_get(k), 1);
        assert_eq!(log.take(), [5]);

        // Two periods elapse in one announcement; both are counted.
        k.announce(7);
        assert_eq!(log.take(), [12, 12]);
        assert_eq!(t.status_get(k), 2);
        assert_eq!(t.expires(k), Some(Tick(14)));
        assert_eq!(t.remaining(k), 2);

        t.stop(k);
        assert_eq!(log.take(), [99]);
        assert_eq!(t.expires(k), None);
        assert_eq!(k.next_deadline(), None);
    }

    #[test]
    fn test_one_shot_stops_itself() {
        let k = testing::kernel();
        let log = testing::leak(Recorder::new());
        let t = timer(k, log);
        t.start(k, 2, 0).unwrap();

        k.announce(2);
        assert_eq!(log.take(), [2]);
        assert!(!t.is_running(k));
        assert_eq!(t.remaining(k), 0);
        assert_eq!(t.status_get(k), 1);

        // Stopping a stopped timer skips the callback.
        t.stop(k);
        assert!(log.is_empty());

        t.start(k, 10, 0).unwrap();
        t.stop(k);
        assert_eq!(log.take(), [99]);
        k.announce(10);
        assert!(log.is_empty());
    }

    fn syncer(k: usize, timer: usize, log: usize) {
        let k = testing::kernel_at(k);
        let timer: &SimTimer = testing::at(timer);
        let log: &Recorder = testing::at(log);
        log.push(100 + timer.status_sync(k));
    }

    #[test]
    fn test_status_sync_waits_for_expiry_or_stop() {
        let k = testing::kernel();
        let sync_log = testing::leak(Recorder::new());
        let t = testing::leak(Timer::new(k, None, None).unwrap());
        let args = [testing::addr(k), testing::addr(t), testing::addr(sync_log)];
        t.start(k, 3, 3).unwrap();

        k.create_thread(testing::stack(), syncer, args, Priority(1), ThreadOptions::empty())
            .unwrap();
        assert!(sync_log.is_empty());
        k.announce(3);
        assert_eq!(sync_log.take(), [101]);

        // Already expired: no wait.
        k.announce(3);
        assert_eq!(t.status_sync(k), 1);

        k.create_thread(testing::stack(), syncer, args, Priority(1), ThreadOptions::empty())
            .unwrap();
        t.stop(k);
        assert_eq!(sync_log.take(), [100]);
        assert_eq!(t.status_sync(k), 0);
    }

    #[test]
    fn test_cleanup_frees_alarm() {
        let k = testing::kernel();
        let first = Timer::new(k, None, None).unwrap();
        let alarm = first.alarm;
        first.cleanup(k);
        let second: SimTimer = Timer::new(k, None, None).unwrap();
        assert_eq!(second.alarm, alarm);
    }
}
