//! Blocking synchronization primitives
//!
//! Every primitive guards its own state with a spin lock, allocates its
//! wait queues from the kernel it is created on, and must only be used
//! with that kernel.

pub mod msgq;
pub mod pipe;
pub mod ring;
pub mod rwlock;
pub mod sem;

pub use msgq::{MessageQueue, QueueAttrs};
pub use pipe::Pipe;
pub use ring::ByteRing;
pub use rwlock::RwLock;
pub use sem::Semaphore;
