//! Host simulator port
//!
//! Every kernel thread is backed by an OS thread, and a baton (mutex +
//! condvar) lets exactly one of them run at a time, so a blocked kernel
//! thread really is suspended mid-call and resumes where it left off.
//! A context is identified by its saved stack pointer; the thread that
//! created the kernel is [`StackPointer::NULL`] and holds the baton first.
//!
//! A panic in any simulated thread is reported to whoever waits for the
//! baton next, so a broken test fails instead of hanging.
//!
//! Interrupts are simulated with [`SimArch::raise`]: the handler is held
//! pending and delivered the next time interrupts go from masked to
//! unmasked, the earliest point a real one could preempt the kernel.

extern crate std;

use std::any::Any;
use std::boxed::Box;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::string::{String, ToString};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use std::vec::Vec;

use super::{Arch, InitialFrame, IrqKey, SavedContext, StackLayout, StackPointer};
use crate::time::Tick;

/// Longest a simulated thread waits for the baton
const STALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Words written into the initial frame
const FRAME_WORDS: usize = 8;

/// Unwind payload of a simulated thread that exited
struct SimExit;

/// Simulated interrupt handler
pub type SimIrq = Box<dyn FnOnce() + Send>;

struct Baton {
    /// Context allowed to run
    running: usize,
    /// Frames of threads that have not run yet, by stack pointer
    pending: HashMap<usize, InitialFrame>,
    /// First panic message from a simulated thread
    failure: Option<String>,
}

struct Shared {
    baton: Mutex<Baton>,
    turn: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Baton> {
        self.baton.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until `me` holds the baton
    fn wait_turn(&self, me: usize) {
        let mut baton = self.lock();
        loop {
            if let Some(failure) = baton.failure.clone() {
                drop(baton);
                panic!("simulated thread failed: {failure}");
            }
            if baton.running == me {
                return;
            }
            let (guard, timeout) = self
                .turn
                .wait_timeout(baton, STALL_TIMEOUT)
                .unwrap_or_else(|e| e.into_inner());
            baton = guard;
            // Parked threads of a finished test wait forever; only the
            // main context reports a stall.
            if timeout.timed_out()
                && me == StackPointer::NULL.0
                && baton.running != me
                && baton.failure.is_none()
            {
                drop(baton);
                panic!("simulator stalled waiting for context {me:#x}");
            }
        }
    }

    /// Record a failure and give the baton back to the main context
    fn fail(&self, message: String) {
        let mut baton = self.lock();
        baton.failure.get_or_insert(message);
        baton.running = StackPointer::NULL.0;
        self.turn.notify_all();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic".to_string()
    }
}

/// Architecture port running on host threads
pub struct SimArch {
    shared: Arc<Shared>,
    masked: AtomicBool,
    irqs: Mutex<VecDeque<SimIrq>>,
    deadline: Mutex<Option<Tick>>,
    switches: AtomicUsize,
}

impl SimArch {
    /// Simulator whose calling OS thread is the main context
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                baton: Mutex::new(Baton {
                    running: StackPointer::NULL.0,
                    pending: HashMap::new(),
                    failure: None,
                }),
                turn: Condvar::new(),
            }),
            masked: AtomicBool::new(false),
            irqs: Mutex::new(VecDeque::new()),
            deadline: Mutex::new(None),
            switches: AtomicUsize::new(0),
        }
    }

    /// Are interrupts masked?
    pub fn is_masked(&self) -> bool {
        self.masked.load(Ordering::SeqCst)
    }

    /// Deadline last programmed by the kernel
    pub fn armed_deadline(&self) -> Option<Tick> {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pend an interrupt, delivered at the next unmask
    pub fn raise(&self, irq: SimIrq) {
        self.irqs.lock().unwrap_or_else(|e| e.into_inner()).push_back(irq);
    }

    /// Interrupts raised but not delivered yet
    pub fn pending_irqs(&self) -> usize {
        self.irqs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn deliver(&self) {
        loop {
            let irq = self.irqs.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
            match irq {
                Some(irq) => irq(),
                None => break,
            }
        }
    }

    /// Switches performed through this port
    pub fn switches(&self) -> usize {
        self.switches.load(Ordering::SeqCst)
    }

    /// Give the baton to `to`, starting its OS thread on first use
    fn hand_over(&self, to: usize) {
        let mut baton = self.shared.lock();
        baton.running = to;
        if let Some(frame) = baton.pending.remove(&to) {
            self.spawn(to, frame);
        }
        self.shared.turn.notify_all();
    }

    fn spawn(&self, me: usize, frame: InitialFrame) {
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name(std::format!("sim-{me:#x}"))
            .spawn(move || {
                shared.wait_turn(me);
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    (frame.wrapper)(frame.kernel, frame.entry, frame.args, frame.irq_key)
                }));
                match result {
                    Ok(()) => shared.fail(std::format!("context {me:#x} returned from its wrapper")),
                    Err(payload) if payload.is::<SimExit>() => {}
                    Err(payload) => shared.fail(panic_message(payload.as_ref())),
                }
            });
        if let Err(e) = spawned {
            self.shared.fail(std::format!("cannot spawn simulated thread: {e}"));
        }
    }
}

impl Default for SimArch {
    fn default() -> Self {
        Self::new()
    }
}

impl Arch for SimArch {
    type CalleeSaved = [usize; 8];
    type Esf = [usize; 8];

    const STACK_ALIGN: usize = 8;
    const INITIAL_FRAME_SIZE: usize = FRAME_WORDS * core::mem::size_of::<usize>();

    fn build_initial_frame(&self, stack: &mut [u8], frame: InitialFrame) -> StackPointer {
        let layout = StackLayout::carve(stack, Self::STACK_ALIGN, Self::INITIAL_FRAME_SIZE);
        let words: [usize; FRAME_WORDS] = [
            frame.wrapper as usize,
            frame.kernel,
            frame.entry as usize,
            frame.args[0],
            frame.args[1],
            frame.args[2],
            frame.irq_key.0 as usize,
            0,
        ];
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_ne_bytes()).collect();
        let end = (layout.frame + bytes.len()).min(stack.len());
        stack[layout.frame..end].copy_from_slice(&bytes[..end - layout.frame]);

        let sp = stack.as_ptr() as usize + layout.frame;
        self.shared.lock().pending.insert(sp, frame);
        StackPointer(sp)
    }

    fn irq_lock(&self) -> IrqKey {
        if self.masked.swap(true, Ordering::SeqCst) {
            IrqKey::MASKED
        } else {
            IrqKey::UNMASKED
        }
    }

    fn irq_unlock(&self, key: IrqKey) {
        let unmask = key == IrqKey::UNMASKED;
        let was_masked = self.masked.swap(!unmask, Ordering::SeqCst);
        if unmask && was_masked {
            self.deliver();
        }
    }

    unsafe fn switch_to(&self, from: *mut SavedContext<Self>, to: *const SavedContext<Self>) {
        // SAFETY: the caller guarantees both contexts are live.
        let (me, next) = unsafe { ((*from).sp.0, (*to).sp.0) };
        self.switches.fetch_add(1, Ordering::SeqCst);
        self.hand_over(next);
        self.shared.wait_turn(me);
    }

    unsafe fn exit_to(&self, to: *const SavedContext<Self>) -> ! {
        // SAFETY: the caller guarantees `to` is live.
        let next = unsafe { (*to).sp.0 };
        self.switches.fetch_add(1, Ordering::SeqCst);
        self.hand_over(next);
        panic::resume_unwind(Box::new(SimExit))
    }

    fn set_deadline(&self, deadline: Option<Tick>) {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner()) = deadline;
    }

    fn idle(&self) {
        panic!("simulated kernel idle: every thread is blocked");
    }
}
