// C1: the coroutine primitive and its state machine.
//
// Grounded on `original_source/include/fiber.h` for the contract
// (State enum, swapIn/swapOut/YieldToReady/YieldToHold/GetFiberID,
// the `FiberInfo` thread-locals) and on the teacher's own
// `coroutine.rs` for the Rust-level shape this replaces (a `Coroutine`
// struct holding nothing but a `Context` and a `Stack`, recycled
// through a `StackPool`). The teacher's version has no state machine
// or thread-locals at all -- those come from `original_source`. Every
// coroutine here owns a stack drawn from stack.rs's process-wide pool
// (`Option` only so `Drop` can reclaim it for recycling); the thread's
// master/scheduler-fiber slots are plain Context values, never a
// CoroutineInner, so they never touch the pool at all.
//
// Ownership: the teacher holds coroutines behind a `Unique<Coroutine>`
// raw pointer (pre-`NonNull`, single-owner only); this crate uses
// `Arc<CoroutineInner>` instead, per SPEC_FULL.md's ownership mapping
// -- the scheduler, the reactor's FDContext handlers, and a thread's
// `current` slot all need to hold a coroutine alive simultaneously.

use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config;
use crate::context::Context;
use crate::error::{Result, RuntimeError};
use crate::stack::Stack;

/// Lifecycle state, `original_source/include/fiber.h`'s `enum State`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Ready,
    Hold,
    Exec,
    Term,
    Exception,
}

impl State {
    fn resumable(self) -> bool {
        matches!(self, State::Init | State::Ready | State::Hold)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, State::Term | State::Exception)
    }
}

type Entry = Box<dyn FnOnce() + Send + 'static>;

pub struct CoroutineInner {
    id: u64,
    state: Cell<State>,
    // Boxed so the address handed to `Context::new`/the trampoline stays
    // stable even while the `CoroutineInner` itself is moved into an Arc.
    context: Box<std::cell::UnsafeCell<Context>>,
    // `None` only in the gap between `Drop` reclaiming it for the pool
    // and the `CoroutineInner` itself being freed -- never observable
    // from outside `Drop::drop`.
    stack: Option<Stack>,
    entry: std::cell::UnsafeCell<Option<Entry>>,
    // Context to swap back into on swap_out: the resumer's context
    // (master, scheduler fiber, or an enclosing coroutine), set fresh
    // by every swap_in. Raw because it aliases a thread-local or
    // another coroutine's boxed Context for the scope of one EXEC run.
    resumer: Cell<*mut Context>,
}

// Safety: `CoroutineInner`'s interior-mutable fields (context, entry,
// resumer) are only ever touched by the single thread that currently
// holds the coroutine in state EXEC (enforced by swap_in's precondition
// check and the fact that EXEC is observed by at most one thread at a
// time, SPEC_FULL.md invariant 2). Arc's refcount itself is already
// thread-safe.
unsafe impl Send for CoroutineInner {}
unsafe impl Sync for CoroutineInner {}

/// A shared handle to a coroutine. Coroutines are reference-counted:
/// the scheduler's task queue, a thread's `current` slot, and an
/// FDContext's handler can all hold a live reference simultaneously.
pub type Handle = Arc<CoroutineInner>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static LIVE_COUNT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    // The thread's implicit springboard context -- never itself a
    // `Handle`, per spec.md's "entry closure is non-null iff the
    // coroutine is a worker (not the thread's master)".
    static MASTER: RefCell<Context> = RefCell::new(Context::empty());
    // The coroutine executing right now on this thread, or `None` if
    // running directly on the master context.
    static CURRENT: RefCell<Option<Handle>> = RefCell::new(None);
    // Set only on a thread that constructed a `Scheduler` with
    // `use_caller = true`; see scheduler.rs.
    static SCHEDULER_FIBER: RefCell<Option<Handle>> = RefCell::new(None);
}

extern "C" fn trampoline(arg: *mut u8) -> ! {
    // Reclaim the extra refcount `spawn`/`reset` leaked via `into_raw`.
    let handle: Handle = unsafe { Handle::from_raw(arg as *const CoroutineInner) };

    let entry = unsafe { (*handle.entry.get()).take() };
    let entry = entry.expect("coroutine trampoline entered with no entry closure set");

    let result = panic::catch_unwind(AssertUnwindSafe(entry));
    match result {
        Ok(()) => handle.state.set(State::Term),
        Err(cause) => {
            let msg = panic_message(&cause);
            error!("coroutine {} panicked: {}", handle.id, msg);
            handle.state.set(State::Exception);
        }
    }

    let resumer = handle.resumer.get();
    debug_assert!(!resumer.is_null(), "trampoline exit with no resumer recorded");
    unsafe {
        Context::swap(&mut *handle.context.get(), &*resumer);
    }
    unreachable!("a terminated coroutine must never be resumed");
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = cause.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

/// Returns the context to swap into when the calling thread jumps into
/// a new coroutine: whatever is presently EXEC on this thread (master
/// if nothing is).
fn active_context_ptr() -> *mut Context {
    CURRENT.with(|c| match &*c.borrow() {
        Some(h) => h.context.get(),
        None => MASTER.with(|m| m.as_ptr()),
    })
}

pub struct Coroutine;

impl Coroutine {
    /// Allocate a stack and build a trampoline-initialised context;
    /// state <- Init. `stack_size == 0` uses `config::FIBER_STACK_SIZE`.
    pub fn spawn<F>(entry: F, stack_size: usize) -> Handle
    where
        F: FnOnce() + Send + 'static,
    {
        let size = if stack_size == 0 {
            config::FIBER_STACK_SIZE.get() as usize
        } else {
            stack_size
        };
        let stack = crate::stack::take(size);

        let inner = Arc::new(CoroutineInner {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: Cell::new(State::Init),
            context: Box::new(std::cell::UnsafeCell::new(Context::empty())),
            stack: Some(stack),
            entry: std::cell::UnsafeCell::new(Some(Box::new(entry))),
            resumer: Cell::new(ptr::null_mut()),
        });
        LIVE_COUNT.fetch_add(1, Ordering::Relaxed);

        let arg = Handle::into_raw(inner.clone()) as *mut u8;
        let ctx = Context::new(trampoline, arg, inner.stack.as_ref().unwrap());
        unsafe {
            *inner.context.get() = ctx;
        }

        inner
    }

    /// Reinitialise a terminal (or never-started) coroutine to run a
    /// new entry closure, reusing its stack. Asserts on a non-terminal,
    /// non-Init coroutine -- resetting a live coroutine is programmer
    /// misuse (SPEC_FULL.md section 7).
    pub fn reset<F>(handle: &Handle, entry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let state = handle.state.get();
        assert!(
            state == State::Init || state.is_terminal(),
            "reset() called on a coroutine in state {state:?}"
        );
        unsafe {
            *handle.entry.get() = Some(Box::new(entry));
        }
        let arg = Handle::into_raw(handle.clone()) as *mut u8;
        let ctx = Context::new(trampoline, arg, handle.stack.as_ref().unwrap());
        unsafe {
            *handle.context.get() = ctx;
        }
        handle.state.set(State::Init);
    }

    /// Resume `handle`: suspend whatever is active on this thread
    /// (master, scheduler fiber, or an enclosing coroutine) and run
    /// `handle` until it next yields or terminates.
    pub fn swap_in(handle: &Handle) -> Result<()> {
        let state = handle.state.get();
        if !state.resumable() {
            return Err(RuntimeError::InvalidUse(format!(
                "swap_in on coroutine {} in non-resumable state {:?}",
                handle.id, state
            )));
        }

        let resumer_ctx = active_context_ptr();
        handle.resumer.set(resumer_ctx);

        let previous_current = CURRENT.with(|c| c.replace(Some(handle.clone())));
        handle.state.set(State::Exec);

        unsafe {
            Context::swap(&mut *resumer_ctx, &*handle.context.get());
        }

        CURRENT.with(|c| *c.borrow_mut() = previous_current);
        Ok(())
    }

    /// Suspend `handle`, which must be the coroutine currently
    /// executing on this thread, returning control to whoever called
    /// `swap_in`. Callers should set `handle`'s state first (Ready or
    /// Hold); `swap_in`/`swap_out` themselves never change state to
    /// anything but Exec.
    fn swap_out(handle: &Handle) {
        let resumer = handle.resumer.get();
        debug_assert!(!resumer.is_null());
        unsafe {
            Context::swap(&mut *handle.context.get(), &*resumer);
        }
    }

    /// The coroutine executing on this thread right now, if any.
    pub fn current() -> Option<Handle> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Suspend the current coroutine, marking it Ready (eligible to be
    /// immediately re-picked-up by the scheduler).
    pub fn yield_to_ready() {
        if let Some(h) = Coroutine::current() {
            h.state.set(State::Ready);
            Coroutine::swap_out(&h);
        }
    }

    /// Suspend the current coroutine, marking it Hold (parked until
    /// something explicitly re-schedules it, e.g. an armed reactor
    /// event firing).
    pub fn yield_to_hold() {
        if let Some(h) = Coroutine::current() {
            h.state.set(State::Hold);
            Coroutine::swap_out(&h);
        }
    }

    pub fn total() -> u64 {
        LIVE_COUNT.load(Ordering::Relaxed)
    }

    pub(crate) fn scheduler_fiber() -> Option<Handle> {
        SCHEDULER_FIBER.with(|f| f.borrow().clone())
    }

    pub(crate) fn set_scheduler_fiber(handle: Option<Handle>) {
        SCHEDULER_FIBER.with(|f| *f.borrow_mut() = handle);
    }
}

impl CoroutineInner {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    pub fn finish(&self) -> bool {
        self.state.get().is_terminal()
    }
}

impl Drop for CoroutineInner {
    fn drop(&mut self) {
        LIVE_COUNT.fetch_sub(1, Ordering::Relaxed);
        if let Some(stack) = self.stack.take() {
            crate::stack::recycle(stack);
        }
    }
}

/// Resume a coroutine from outside the scheduler (S1's fibonacci
/// ping-pong scenario resumes by hand, with no `Scheduler` involved).
/// Equivalent to `Coroutine::swap_in`.
pub fn resume(handle: &Handle) -> Result<()> {
    Coroutine::swap_in(handle)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn fibonacci_ping_pong_reaches_term_and_matches_sequence() {
        // S1 from SPEC_FULL.md section 8.
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_coro = seen.clone();

        let shared = Arc::new(Mutex::new(0u64));
        let shared_in_coro = shared.clone();

        let handle = Coroutine::spawn(
            move || {
                let (mut a, mut b) = (1u64, 1u64);
                loop {
                    *shared_in_coro.lock().unwrap() = a;
                    seen_in_coro.lock().unwrap().push(a);
                    Coroutine::yield_to_hold();
                    let next = a + b;
                    a = b;
                    b = next;
                    if a >= 100 {
                        *shared_in_coro.lock().unwrap() = a;
                        seen_in_coro.lock().unwrap().push(a);
                        return;
                    }
                }
            },
            0,
        );

        loop {
            resume(&handle).unwrap();
            if handle.finish() {
                break;
            }
        }

        assert_eq!(handle.state(), State::Term);
        let got = seen.lock().unwrap().clone();
        assert_eq!(got, vec![1, 2, 3, 5, 8, 13, 21, 34, 55, 89, 144]);
    }

    #[test]
    fn panic_in_entry_sets_exception_state() {
        let handle = Coroutine::spawn(
            || {
                panic!("boom");
            },
            0,
        );
        resume(&handle).unwrap();
        assert_eq!(handle.state(), State::Exception);
    }

    #[test]
    fn swap_in_on_terminal_coroutine_errors() {
        let handle = Coroutine::spawn(|| {}, 0);
        resume(&handle).unwrap();
        assert!(handle.finish());
        assert!(Coroutine::swap_in(&handle).is_err());
    }

    #[test]
    fn reset_reuses_a_terminal_coroutine() {
        let handle = Coroutine::spawn(|| {}, 0);
        resume(&handle).unwrap();
        assert!(handle.finish());

        let ran = Arc::new(Mutex::new(false));
        let ran2 = ran.clone();
        Coroutine::reset(&handle, move || {
            *ran2.lock().unwrap() = true;
        });
        assert_eq!(handle.state(), State::Init);
        resume(&handle).unwrap();
        assert!(*ran.lock().unwrap());
        assert_eq!(handle.state(), State::Term);
    }
}
