//! Synchronization primitives: spinlocks, events, mutexes, push-locks, and
//! rundown references. All layered on [`spinlock`] and the scheduler's
//! sleep/wake path.

pub mod event;
pub mod mutex;
pub mod pushlock;
pub mod rundown;
pub mod spinlock;

pub use event::{Event, EventKind};
pub use mutex::Mutex;
pub use pushlock::PushLock;
pub use rundown::RundownRef;
pub use spinlock::{RawSpinlock, Spinlock};
