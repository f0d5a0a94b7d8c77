// Error taxonomy, SPEC_FULL.md section 7. `thiserror` in place of the
// teacher's spot-usage of `io::Result`, because callers (the scheduler,
// the trampoline) need to match on error *kind*, not just display it.

use std::io;

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// A syscall underlying a construction step failed: `epoll_ctl`,
    /// `pipe2`, `fstat`, `mmap`/`mprotect`. Always fatal to whatever
    /// was being constructed.
    #[error("system call failed: {0}")]
    SysCallError(#[source] io::Error),

    /// The context-switch primitive itself failed (stack allocation,
    /// or an assertion inside the trampoline was violated). Fatal to
    /// the coroutine; the worker thread that observes it should treat
    /// the coroutine as poisoned rather than attempt to resume it.
    #[error("coroutine fault: {0}")]
    CoroutineFault(String),

    /// The user's entry closure panicked. Caught at the trampoline,
    /// logged, and reported here only for the benefit of anything
    /// that wants to introspect post-mortem; by the time this is
    /// constructed, the coroutine is already in state EXCEPTION and
    /// the worker is unaffected.
    #[error("coroutine entry panicked: {0}")]
    UserPanic(String),

    /// Programmer misuse caught short of an outright assertion: the
    /// caller asked for something the contract explicitly disallows
    /// (double-arming an fd event, resetting a non-terminal
    /// coroutine, scheduling on a stopped scheduler).
    #[error("invalid use of coroutine-rt: {0}")]
    InvalidUse(String),
}

impl From<io::Error> for RuntimeError {
    fn from(e: io::Error) -> RuntimeError {
        RuntimeError::SysCallError(e)
    }
}
