// C4: the scheduler -- a worker-thread pool running a cooperative FIFO
// task queue of coroutines and closures.
//
// Grounded on `original_source/include/scheduler.h` + `src/scheduler.cc`
// (the `Task`/`m_task_list` shape, the exact `run()` algorithm -- scan
// for an affinity-eligible, non-EXEC task; tickle on skip; re-submit
// READY tasks with `instant=true` and the same affinity, HOLD tasks
// with default affinity -- and the `use_caller`/`m_root_fiber`
// construction path). The teacher's own `scheduler.rs` (mio event loop
// plus a `deque`-based work-stealing queue) is dropped entirely: the
// Non-goals rule out work-stealing, and `mio` is replaced process-wide
// by a direct `libc` epoll reactor in reactor.rs.
//
// Dynamic dispatch: `original_source`'s `tickle`/`onIdle`/`isStop` are
// virtual methods IOManager overrides. Rust has no base-class
// inheritance, so the override points become a `SchedulerHooks` trait
// (tickle, on_idle) that reactor.rs's `Reactor` implements; `is_stopping`
// stays a concrete formula on `Scheduler` itself, since nothing in the
// pack overrides its definition -- `IOManager::isStop` *extends* it
// (`next_timeout == MAX && pending == 0 && Scheduler::isStop()`), it
// doesn't replace it, so `Reactor::on_idle` just calls
// `scheduler.is_stopping()` directly and ANDs in its own conditions.
//
// Cyclic ownership (SPEC_FULL.md's Design Notes / Rust ownership
// mapping): a scheduler's worker threads and its `use_caller` fiber
// hold a raw `*const Scheduler` for their lifetime, matching the
// sanctioned "schedulers as process-lifetime objects referenced by raw
// pointer" resolution -- `stop()` joins every thread (and drains the
// fiber) before returning, so the pointee is guaranteed to outlive
// every dereference of it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use crate::coroutine::{Coroutine, Handle, State};

/// The two override points a scheduler subclass customises.
/// `original_source/include/scheduler.h`'s `virtual void tickle()` and
/// `virtual void onIdle()`. Both take `&Scheduler` so an implementor
/// (just `Reactor`, in this crate) can read back the scheduler's
/// concrete state (`is_stopping()`, active/idle counts) without needing
/// a cyclic `Arc` back-reference of its own.
pub trait SchedulerHooks: Send + Sync {
    /// Wake one idle worker blocked in `on_idle`. Base scheduler: no-op,
    /// since the base `on_idle` just spins on `yield_to_hold`.
    fn tickle(&self, scheduler: &Scheduler);

    /// Run on a worker (or the `use_caller` scheduler fiber) whenever the
    /// task queue is empty. Must return once `scheduler.is_stopping()`
    /// (and any subclass-specific condition) holds, so the coroutine it
    /// runs in reaches TERM and the worker loop can break.
    fn on_idle(&self, scheduler: &Scheduler);
}

/// `original_source/include/scheduler.h`'s `Scheduler::Task`: either a
/// coroutine handle or a closure to be wrapped into one when picked up.
enum TaskBody {
    Fiber(Handle),
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

struct Task {
    body: TaskBody,
    /// OS thread id this task is pinned to, or -1 for "any worker".
    thread_id: i64,
}

/// A thread-unsafe-to-share raw pointer, carried into a spawned worker
/// thread or the `use_caller` fiber closure. Safe to dereference for as
/// long as the pointee's `stop()` has not yet returned -- see the
/// module doc comment.
struct SchedPtr(*const Scheduler);
unsafe impl Send for SchedPtr {}

fn current_os_tid() -> i64 {
    unsafe { libc::syscall(libc::SYS_gettid) as i64 }
}

pub struct Scheduler {
    name: String,
    /// Worker thread count, *excluding* the use_caller thread.
    thread_count: usize,
    use_caller: bool,
    /// OS tid of the constructing thread when `use_caller`, else -1.
    root_thread_id: i64,

    active_thread_count: AtomicU64,
    idle_thread_count: AtomicU64,
    /// Mirrors `original_source`'s `m_stopping`: true before `start()`
    /// and after a completed `stop()`; false while running.
    stopping: AtomicBool,
    auto_stop: AtomicBool,

    task_list: Mutex<VecDeque<Task>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Only populated when `use_caller`.
    scheduler_fiber: Mutex<Option<Handle>>,
    /// OS tids of every thread that has entered `run()` (workers plus,
    /// if present, the caller thread via the scheduler fiber). Exposed
    /// read-only so tests can address a specific worker by affinity
    /// (SPEC_FULL.md S6).
    thread_ids: Mutex<Vec<i64>>,

    hooks: Mutex<Weak<dyn SchedulerHooks>>,
    start_lock: Mutex<()>,
}

impl Scheduler {
    /// Build a scheduler whose `tickle`/`on_idle` are delegated to
    /// `hooks`. Used by `Reactor::new` (via `Arc::new_cyclic`) to wire
    /// the reactor as the scheduler's dynamic-dispatch implementor.
    pub fn new_with_hooks(
        thread_size: usize,
        use_caller: bool,
        name: impl Into<String>,
        hooks: Weak<dyn SchedulerHooks>,
    ) -> Scheduler {
        assert!(thread_size >= 1, "thread_size must be >= 1");
        let thread_count = if use_caller { thread_size - 1 } else { thread_size };
        let root_thread_id = if use_caller { current_os_tid() } else { -1 };

        Scheduler {
            name: name.into(),
            thread_count,
            use_caller,
            root_thread_id,
            active_thread_count: AtomicU64::new(0),
            idle_thread_count: AtomicU64::new(0),
            stopping: AtomicBool::new(true),
            auto_stop: AtomicBool::new(false),
            task_list: Mutex::new(VecDeque::new()),
            workers: Mutex::new(Vec::new()),
            scheduler_fiber: Mutex::new(None),
            thread_ids: Mutex::new(Vec::new()),
            hooks: Mutex::new(hooks),
            start_lock: Mutex::new(()),
        }
    }

    /// A standalone scheduler with no reactor: `tickle` is a no-op and
    /// `on_idle` just parks on `yield_to_hold` until stopped --
    /// `original_source`'s base `Scheduler::onIdle` does exactly this
    /// (`while (!isStop()) Fiber::YieldToHold();`).
    pub fn new(thread_size: usize, use_caller: bool, name: impl Into<String>) -> Arc<Scheduler> {
        Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let hooks: Weak<dyn SchedulerHooks> = weak.clone();
            Scheduler::new_with_hooks(thread_size, use_caller, name, hooks)
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thread_ids(&self) -> Vec<i64> {
        self.thread_ids.lock().unwrap().clone()
    }

    pub fn root_thread_id(&self) -> i64 {
        self.root_thread_id
    }

    pub fn active_thread_count(&self) -> u64 {
        self.active_thread_count.load(Ordering::Acquire)
    }

    pub fn idle_thread_count(&self) -> u64 {
        self.idle_thread_count.load(Ordering::Acquire)
    }

    pub fn has_idle_thread(&self) -> bool {
        self.idle_thread_count() > 0
    }

    /// `original_source/include/scheduler.h`'s `isStop()`: true once
    /// `stop()` has been called, the task queue has drained, and no
    /// worker is mid-task.
    pub fn is_stopping(&self) -> bool {
        self.auto_stop.load(Ordering::Acquire)
            && self.task_list.lock().unwrap().is_empty()
            && self.active_thread_count() == 0
    }

    fn hooks(&self) -> Option<Arc<dyn SchedulerHooks>> {
        self.hooks.lock().unwrap().upgrade()
    }

    /// `schedule(exec, thread_id, instant)`, coroutine-handle overload.
    pub fn schedule_fiber(&self, handle: Handle, thread_id: i64, instant: bool) {
        self.schedule_task(Task { body: TaskBody::Fiber(handle), thread_id }, instant);
    }

    /// `schedule(exec, thread_id, instant)`, closure overload.
    pub fn schedule_fn<F>(&self, f: F, thread_id: i64, instant: bool)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task(Task { body: TaskBody::Callback(Box::new(f)), thread_id }, instant);
    }

    fn schedule_task(&self, task: Task, instant: bool) {
        let need_tickle = {
            let mut list = self.task_list.lock().unwrap();
            let was_empty = list.is_empty();
            if instant {
                list.push_front(task);
            } else {
                list.push_back(task);
            }
            was_empty
        };
        if need_tickle {
            if let Some(h) = self.hooks() {
                h.tickle(self);
            }
        }
    }

    /// Spawn the worker pool and, if `use_caller`, swap into the
    /// caller's dedicated scheduler fiber. A no-op if already running.
    pub fn start(&self) {
        let _guard = self.start_lock.lock().unwrap();
        if !self.stopping.load(Ordering::Acquire) {
            return;
        }
        self.stopping.store(false, Ordering::Release);
        debug!("scheduler {} starting {} worker thread(s)", self.name, self.thread_count);

        {
            let mut workers = self.workers.lock().unwrap();
            assert!(workers.is_empty(), "Scheduler::start called while workers are live");
            for i in 0..self.thread_count {
                let ptr = SchedPtr(self as *const Scheduler);
                let builder = thread::Builder::new().name(format!("{}-{}", self.name, i));
                let handle = builder
                    .spawn(move || {
                        let scheduler = unsafe { &*ptr.0 };
                        scheduler.run();
                    })
                    .expect("failed to spawn scheduler worker thread");
                workers.push(handle);
            }
        }

        if self.use_caller {
            let ptr = SchedPtr(self as *const Scheduler);
            let fiber = Coroutine::spawn(
                move || {
                    let scheduler = unsafe { &*ptr.0 };
                    scheduler.run();
                },
                0,
            );
            *self.scheduler_fiber.lock().unwrap() = Some(fiber.clone());
            let _ = Coroutine::swap_in(&fiber);
        }
    }

    /// Unblock every idle worker and the scheduler fiber (if any), then
    /// join all worker threads. `original_source/src/scheduler.cc`'s
    /// `Scheduler::stop`, including its `use_caller && thread_count==0`
    /// fast path.
    pub fn stop(&self) {
        self.auto_stop.store(true, Ordering::Release);

        let fiber_idle_or_unstarted = {
            let sf = self.scheduler_fiber.lock().unwrap();
            match &*sf {
                None => true,
                Some(h) => h.finish() || h.state() == State::Init,
            }
        };
        if self.use_caller && self.thread_count == 0 && fiber_idle_or_unstarted {
            self.stopping.store(true, Ordering::Release);
            return;
        }

        self.stopping.store(true, Ordering::Release);

        let hooks = self.hooks();
        for _ in 0..self.thread_count {
            if let Some(h) = &hooks {
                h.tickle(self);
            }
        }

        let fiber = self.scheduler_fiber.lock().unwrap().clone();
        if let Some(fiber) = fiber {
            if let Some(h) = &hooks {
                h.tickle(self);
            }
            if !fiber.finish() {
                // Drain the scheduler fiber on the calling thread: it is
                // parked in `on_idle`'s `yield_to_hold`, and will observe
                // `is_stopping()` the next time its idle loop checks.
                let _ = Coroutine::swap_in(&fiber);
            }
        }

        let mut workers = self.workers.lock().unwrap();
        for w in workers.drain(..) {
            let _ = w.join();
        }
    }

    /// The worker loop, `original_source/src/scheduler.cc`'s
    /// `Scheduler::run`. Invoked by every spawned worker thread and, if
    /// `use_caller`, by the scheduler fiber on the caller's own thread.
    fn run(&self) {
        self.thread_ids.lock().unwrap().push(current_os_tid());
        crate::hooks::set_hook_enabled(true);

        let hooks = self.hooks.lock().unwrap().clone();
        let idle_hooks = hooks.clone();
        let idle = Coroutine::spawn(
            move || {
                if let Some(h) = idle_hooks.upgrade() {
                    // SAFETY-ish: `on_idle` needs `&Scheduler`; recovered
                    // via `Scheduler::current()`'s thread-local below.
                    if let Some(scheduler) = current_scheduler() {
                        h.on_idle(scheduler);
                    }
                }
            },
            0,
        );

        CURRENT_SCHEDULER.with(|c| c.set(self as *const Scheduler));

        loop {
            let mut tickle_me = false;
            let my_tid = current_os_tid();

            let picked = {
                let mut list = self.task_list.lock().unwrap();
                let mut found = None;
                for i in 0..list.len() {
                    let t = &list[i];
                    if t.thread_id != -1 && t.thread_id != my_tid {
                        tickle_me = true;
                        continue;
                    }
                    if let TaskBody::Fiber(h) = &t.body {
                        if h.state() == State::Exec {
                            continue;
                        }
                    }
                    found = Some(i);
                    break;
                }
                found.map(|i| {
                    self.active_thread_count.fetch_add(1, Ordering::AcqRel);
                    list.remove(i).unwrap()
                })
            };

            if tickle_me {
                if let Some(h) = hooks.upgrade() {
                    h.tickle(self);
                }
            }

            match picked {
                Some(task) => {
                    let thread_id = task.thread_id;
                    let handle = match task.body {
                        TaskBody::Fiber(h) => h,
                        TaskBody::Callback(cb) => Coroutine::spawn(cb, 0),
                    };

                    let _ = Coroutine::swap_in(&handle);
                    self.active_thread_count.fetch_sub(1, Ordering::AcqRel);

                    match handle.state() {
                        State::Ready => self.schedule_fiber(handle, thread_id, true),
                        State::Hold => self.schedule_fiber(handle, -1, false),
                        _ => {}
                    }
                }
                None => {
                    if idle.finish() {
                        break;
                    }
                    self.idle_thread_count.fetch_add(1, Ordering::AcqRel);
                    let _ = Coroutine::swap_in(&idle);
                    self.idle_thread_count.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
    }
}

thread_local! {
    static CURRENT_SCHEDULER: std::cell::Cell<*const Scheduler> = std::cell::Cell::new(std::ptr::null());
}

/// The scheduler currently running its `run()` loop on this thread, if
/// any. Used by the idle coroutine body to recover `&Scheduler` for its
/// `on_idle` hook, and by hooks.rs to find the reactor to register
/// events against.
pub fn current_scheduler() -> Option<&'static Scheduler> {
    let ptr = CURRENT_SCHEDULER.with(|c| c.get());
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { &*ptr })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct NullHooks;
    impl SchedulerHooks for NullHooks {
        fn tickle(&self, _scheduler: &Scheduler) {}
        fn on_idle(&self, scheduler: &Scheduler) {
            while !scheduler.is_stopping() {
                Coroutine::yield_to_hold();
            }
        }
    }

    // `NullHooks` is kept alive alongside the scheduler it backs: the
    // scheduler only holds a `Weak` to it, matching the cyclic-ownership
    // pattern `Reactor` uses for real.
    fn scheduler_with_null_hooks(threads: usize, use_caller: bool) -> (Scheduler, Arc<dyn SchedulerHooks>) {
        let hooks: Arc<dyn SchedulerHooks> = Arc::new(NullHooks);
        let scheduler = Scheduler::new_with_hooks(threads, use_caller, "test", Arc::downgrade(&hooks));
        (scheduler, hooks)
    }

    #[test]
    fn closures_run_and_scheduler_stops_cleanly() {
        let (scheduler, _hooks) = scheduler_with_null_hooks(2, false);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let count = count.clone();
            scheduler.schedule_fn(move || { count.fetch_add(1, Ordering::SeqCst); }, -1, false);
        }
        scheduler.start();
        for _ in 0..200 {
            if count.load(Ordering::SeqCst) == 20 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(count.load(Ordering::SeqCst), 20);
        scheduler.stop();
        assert_eq!(scheduler.active_thread_count(), 0);
    }

    #[test]
    fn affinity_pins_a_task_to_one_worker() {
        // S6 from SPEC_FULL.md section 8.
        let (scheduler, _hooks) = scheduler_with_null_hooks(3, false);
        scheduler.start();
        for _ in 0..50 {
            if scheduler.thread_ids().len() == 3 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let ids = scheduler.thread_ids();
        assert_eq!(ids.len(), 3);
        let target = ids[1];

        let ran_on = Arc::new(StdMutex::new(None));
        let ran_on2 = ran_on.clone();
        scheduler.schedule_fn(
            move || {
                *ran_on2.lock().unwrap() = Some(current_os_tid());
            },
            target,
            false,
        );

        for _ in 0..100 {
            if ran_on.lock().unwrap().is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*ran_on.lock().unwrap(), Some(target));
        scheduler.stop();
    }
}
