//! A user-space M:N coroutine runtime for Linux/x86_64: stackful
//! coroutines switched by hand-written assembly, a cooperative FIFO
//! scheduler, an epoll-backed I/O reactor, and an `LD_PRELOAD`-style
//! syscall hook layer that suspends blocking-looking calls onto the
//! reactor instead of the kernel.
//!
//! See `SPEC_FULL.md` for the full module breakdown; the short version:
//!
//! - [`coroutine`] -- the `Coroutine` primitive and its state machine (C1)
//! - [`fd_registry`] -- per-fd bookkeeping (C2)
//! - [`timer`] -- the timer heap (C3)
//! - [`scheduler`] -- the worker-thread pool (C4)
//! - [`reactor`] -- the epoll reactor built on top of it (C5)
//! - [`hooks`] -- the syscall hook layer built on top of that (C6)

#[macro_use]
extern crate log;

pub mod config;
pub mod context;
pub mod coroutine;
pub mod error;
pub mod fd_registry;
pub mod hooks;
pub mod reactor;
pub mod scheduler;
pub mod stack;
pub mod timer;

pub use coroutine::{resume, Coroutine, Handle, State};
pub use error::{Result, RuntimeError};
pub use reactor::Reactor;
pub use scheduler::Scheduler;

/// Spawn a new coroutine. Equivalent to `Coroutine::spawn(entry, 0)`,
/// using the default stack size (`config::FIBER_STACK_SIZE`).
pub fn spawn<F>(entry: F) -> Handle
where
    F: FnOnce() + Send + 'static,
{
    Coroutine::spawn(entry, 0)
}

/// The coroutine executing on this thread right now, if any. Equivalent
/// to `Coroutine::current`.
pub fn current() -> Option<Handle> {
    Coroutine::current()
}

/// Suspend the current coroutine, marking it Ready so the scheduler
/// re-picks it up as soon as it is next free to run. Equivalent to
/// `Coroutine::yield_to_ready`.
pub fn sched() {
    Coroutine::yield_to_ready()
}
