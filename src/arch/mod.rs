//! Architecture boundary
//!
//! The portable kernel never touches raw stack bytes or CPU registers.
//! Everything that does lives behind [`Arch`]:
//! - laying out the first frame of a new thread
//! - masking/unmasking interrupts
//! - the context switch itself
//! - arming the hardware deadline interrupt
//!
//! [`StackLayout`] does the alignment arithmetic shared by every port, and
//! [`IrqLock`] is the interrupt-safe lock built on the masking calls.

mod irq;
#[cfg(any(test, feature = "std"))]
pub mod sim;

pub use irq::{IrqGuard, IrqLock};

use crate::thread::ThreadEntry;
use crate::time::Tick;

/// Saved stack pointer of a suspended thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StackPointer(pub usize);

impl StackPointer {
    /// Placeholder for a context that has not been saved yet
    pub const NULL: StackPointer = StackPointer(0);
}

/// Interrupt state returned by [`Arch::irq_lock`], restored by [`Arch::irq_unlock`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqKey(pub u32);

impl IrqKey {
    /// Key meaning "interrupts were enabled"
    pub const UNMASKED: IrqKey = IrqKey(0);
    /// Key meaning "interrupts were already masked"
    pub const MASKED: IrqKey = IrqKey(1);
}

/// Function planted as the first return address of every thread
///
/// Receives the kernel address, the user entry, its three arguments and the
/// interrupt state to restore before the entry runs.
pub type EntryWrapper = fn(usize, ThreadEntry, [usize; 3], IrqKey);

/// Everything a port needs to start a thread for the first time
#[derive(Clone, Copy)]
pub struct InitialFrame {
    /// Trampoline that calls `entry` and retires the thread when it returns
    pub wrapper: EntryWrapper,
    /// Address of the owning kernel, handed to `wrapper`
    pub kernel: usize,
    /// User entry point
    pub entry: ThreadEntry,
    /// Arguments for `entry`
    pub args: [usize; 3],
    /// Interrupt state the thread starts with (restored by the wrapper)
    pub irq_key: IrqKey,
}

/// Register state of a thread while it is not running
///
/// `callee` is the cooperative set restored by a voluntary swap; `esf`
/// is the frame the hardware stacks on exception entry.
pub struct SavedContext<A: Arch> {
    /// Stack pointer at the moment of suspension
    pub sp: StackPointer,
    /// Callee-saved registers
    pub callee: A::CalleeSaved,
    /// Hardware-stacked exception frame
    pub esf: A::Esf,
}

impl<A: Arch> SavedContext<A> {
    /// Context with the given stack pointer and zeroed registers
    pub fn new(sp: StackPointer) -> Self {
        Self {
            sp,
            callee: A::CalleeSaved::default(),
            esf: A::Esf::default(),
        }
    }
}

/// Architecture port
pub trait Arch: Sync + Sized + 'static {
    /// Callee-saved register set
    type CalleeSaved: Default + Send;
    /// Exception stack frame
    type Esf: Default + Send;

    /// Required alignment of stack base, top and frame
    const STACK_ALIGN: usize;
    /// Bytes reserved at the top of the stack for the initial frame
    const INITIAL_FRAME_SIZE: usize;

    /// Lay out `frame` at the top of `stack` and return the thread's first stack pointer
    fn build_initial_frame(&self, stack: &mut [u8], frame: InitialFrame) -> StackPointer;

    /// Mask interrupts, returning the previous state
    fn irq_lock(&self) -> IrqKey;

    /// Restore the interrupt state saved in `key`
    fn irq_unlock(&self, key: IrqKey);

    /// Save the running context into `from` and resume `to`
    ///
    /// Returns once `from` is switched back in.
    ///
    /// # Safety
    /// Both pointers must reference live contexts owned by the kernel and
    /// interrupts must be masked. `from` must describe the running thread.
    unsafe fn switch_to(&self, from: *mut SavedContext<Self>, to: *const SavedContext<Self>);

    /// Resume `to` without saving the running context
    ///
    /// # Safety
    /// Same as [`Arch::switch_to`]; the running thread is gone afterwards.
    unsafe fn exit_to(&self, to: *const SavedContext<Self>) -> !;

    /// Program the hardware deadline source (`None` disarms it)
    fn set_deadline(&self, deadline: Option<Tick>);

    /// Wait for an interrupt with interrupts enabled
    fn idle(&self);
}

/// Aligned regions carved out of a caller-supplied stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackLayout {
    /// Offset of the aligned stack base
    pub base: usize,
    /// Offset of the aligned stack top (one past the last usable byte)
    pub top: usize,
    /// Offset of the initial frame (`top - frame_size`)
    pub frame: usize,
}

impl StackLayout {
    /// Compute the layout of `stack` for the given alignment and frame size
    ///
    /// An undersized stack is a caller contract violation; it trips a debug
    /// assertion and yields a degenerate layout in release builds.
    pub fn carve(stack: &[u8], align: usize, frame_size: usize) -> Self {
        debug_assert!(align.is_power_of_two());
        let start = stack.as_ptr() as usize;
        let end = start + stack.len();
        let base_addr = (start + align - 1) & !(align - 1);
        let top_addr = end & !(align - 1);
        debug_assert!(
            top_addr >= base_addr + frame_size,
            "stack of {} bytes cannot hold a {} byte frame",
            stack.len(),
            frame_size
        );
        let base = (base_addr - start).min(stack.len());
        let top = top_addr.saturating_sub(start).max(base);
        let frame = top.saturating_sub(frame_size).max(base);
        Self { base, top, frame }
    }

    /// Usable bytes between base and top
    pub fn usable(&self) -> usize {
        self.top - self.base
    }
}
