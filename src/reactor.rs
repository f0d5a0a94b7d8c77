// C5: the I/O reactor -- a scheduler specialisation that drives an
// epoll instance and the timer heap from its idle coroutine.
//
// Grounded on `original_source/include/io_manager.h` +
// `src/io_manager.cc`'s `IOManager`: the `FDContext`/`EventHandler`
// shape, `addEventListener`/`removeEventListener`/`cancelEventListener`/
// `cancelAll`, the `epoll_create(0xffff)` sizing hint (cosmetic on a
// modern kernel, kept for fidelity) and `contextListResize(64)` eager
// population, and the exact `onIdle()` loop (EINTR retry, timer drain,
// the self-pipe drain-and-continue, `EPOLLERR|EPOLLHUP` -> both
// directions).
//
// `tickle()`'s gating is implemented per the glossary's own definition
// of tickle ("wake an idle worker blocked in epoll_wait"): a byte is
// written only when `Scheduler::has_idle_thread()` is true. The literal
// C++ condition (`if (hasIdleThread()) return;`) reads backwards from
// that intent -- it skips the write exactly when there is someone to
// wake -- which would starve a worker already parked in `epoll_wait`
// of its wakeup. Recorded as a deliberate correction in DESIGN.md
// rather than a literal port.
//
// Cyclic ownership: an `FDContext`'s handler is reached from epoll via
// a raw pointer into the reactor's own fd-context vector (sound since
// the reactor outlives every event it has armed -- `stop()` drains all
// workers, and fd contexts are never individually freed, only reset).
// The reactor itself is built via `Arc::new_cyclic` so it can hand the
// embedded `Scheduler` a `Weak<dyn SchedulerHooks>` pointing back at
// itself, without an actual reference cycle.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use once_cell::sync::Lazy;

use crate::coroutine::{Coroutine, Handle};
use crate::error::{Result, RuntimeError};
use crate::scheduler::{Scheduler, SchedulerHooks};
use crate::timer::TimerManager;

const EPOLL_SIZE_HINT: i32 = 0xffff;
const MAX_EPOLL_EVENTS: usize = 64;
const MAX_IDLE_TIMEOUT_MS: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Read,
    Write,
}

impl EventKind {
    fn bit(self) -> u8 {
        match self {
            EventKind::Read => 0b01,
            EventKind::Write => 0b10,
        }
    }
}

fn mask_to_epoll_bits(mask: u8) -> u32 {
    let mut bits = 0u32;
    if mask & EventKind::Read.bit() != 0 {
        bits |= libc::EPOLLIN as u32;
    }
    if mask & EventKind::Write.bit() != 0 {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

enum HandlerBody {
    Fiber(Handle),
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

struct FDContextInner {
    fd: i32,
    events: u8,
    read: Option<HandlerBody>,
    write: Option<HandlerBody>,
}

impl FDContextInner {
    fn handler_slot(&mut self, kind: EventKind) -> &mut Option<HandlerBody> {
        match kind {
            EventKind::Read => &mut self.read,
            EventKind::Write => &mut self.write,
        }
    }
}

/// `original_source/include/io_manager.h`'s `FDContext`. Lives for the
/// process's lifetime once its slot is created -- `Reactor`'s context
/// vector only grows, matching the same "never shrinks" policy as C2's
/// fd registry.
pub struct FDContext {
    inner: Mutex<FDContextInner>,
}

impl FDContext {
    fn new(fd: i32) -> FDContext {
        FDContext {
            inner: Mutex::new(FDContextInner { fd, events: 0, read: None, write: None }),
        }
    }
}

fn fire_handler(scheduler: &Scheduler, body: HandlerBody) {
    match body {
        HandlerBody::Fiber(handle) => scheduler.schedule_fiber(handle, -1, false),
        HandlerBody::Callback(cb) => scheduler.schedule_fn(cb, -1, false),
    }
}

pub struct Reactor {
    scheduler: Scheduler,
    epoll_fd: i32,
    tickle_read_fd: i32,
    tickle_write_fd: i32,
    pending_event_count: AtomicUsize,
    contexts: RwLock<Vec<Arc<FDContext>>>,
    contexts_grow_lock: Mutex<()>,
    timers: TimerManager,
}

impl Reactor {
    pub fn new(thread_size: usize, use_caller: bool, name: impl Into<String>) -> Result<Arc<Reactor>> {
        let epoll_fd = unsafe { libc::epoll_create(EPOLL_SIZE_HINT) };
        if epoll_fd < 0 {
            return Err(RuntimeError::SysCallError(io::Error::last_os_error()));
        }

        let mut fds = [0i32; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(RuntimeError::SysCallError(io::Error::last_os_error()));
        }
        let (tickle_read_fd, tickle_write_fd) = (fds[0], fds[1]);

        unsafe {
            let flags = libc::fcntl(tickle_read_fd, libc::F_GETFL, 0);
            if libc::fcntl(tickle_read_fd, libc::F_SETFL, flags | libc::O_NONBLOCK) != 0 {
                return Err(RuntimeError::SysCallError(io::Error::last_os_error()));
            }
            let mut ev: libc::epoll_event = std::mem::zeroed();
            ev.events = (libc::EPOLLIN | libc::EPOLLET) as u32;
            ev.u64 = tickle_read_fd as u64;
            if libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, tickle_read_fd, &mut ev) != 0 {
                return Err(RuntimeError::SysCallError(io::Error::last_os_error()));
            }
        }

        let initial_contexts: Vec<Arc<FDContext>> =
            (0..64).map(|fd| Arc::new(FDContext::new(fd))).collect();

        Ok(Arc::new_cyclic(|weak: &Weak<Reactor>| {
            let hooks: Weak<dyn SchedulerHooks> = weak.clone();
            let scheduler = Scheduler::new_with_hooks(thread_size, use_caller, name, hooks);

            let timer_weak = weak.clone();
            let timers = TimerManager::new(move || {
                if let Some(reactor) = timer_weak.upgrade() {
                    reactor.tickle(&reactor.scheduler);
                }
            });

            Reactor {
                scheduler,
                epoll_fd,
                tickle_read_fd,
                tickle_write_fd,
                pending_event_count: AtomicUsize::new(0),
                contexts: RwLock::new(initial_contexts),
                contexts_grow_lock: Mutex::new(()),
                timers,
            }
        }))
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn start(&self) {
        self.scheduler.start();
    }

    pub fn stop(&self) {
        self.scheduler.stop();
    }

    pub fn pending_event_count(&self) -> usize {
        self.pending_event_count.load(Ordering::Acquire)
    }

    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    fn context(&self, fd: i32) -> Arc<FDContext> {
        {
            let contexts = self.contexts.read().unwrap();
            if let Some(ctx) = contexts.get(fd as usize) {
                return ctx.clone();
            }
        }
        let _guard = self.contexts_grow_lock.lock().unwrap();
        let mut contexts = self.contexts.write().unwrap();
        if (fd as usize) >= contexts.len() {
            let mut new_len = contexts.len().max(1);
            while new_len <= fd as usize {
                new_len *= 2;
            }
            contexts.reserve(new_len - contexts.len());
            for next_fd in contexts.len()..new_len {
                contexts.push(Arc::new(FDContext::new(next_fd as i32)));
            }
        }
        contexts[fd as usize].clone()
    }

    /// Arm `event` on `fd`. If `callback` is `None`, the handler is the
    /// currently-executing coroutine, which is resumed when the event
    /// fires.
    pub fn add_event(
        &self,
        fd: i32,
        event: EventKind,
        callback: Option<Box<dyn FnOnce() + Send + 'static>>,
    ) -> Result<()> {
        let ctx = self.context(fd);
        let mut inner = ctx.inner.lock().unwrap();
        assert!(
            inner.events & event.bit() == 0,
            "add_event: fd {fd} already has a {event:?} handler armed"
        );

        let op = if inner.events == 0 { libc::EPOLL_CTL_ADD } else { libc::EPOLL_CTL_MOD };
        let new_mask = inner.events | event.bit();
        let mut epevent: libc::epoll_event = unsafe { std::mem::zeroed() };
        epevent.events = libc::EPOLLET as u32 | mask_to_epoll_bits(new_mask);
        epevent.u64 = Arc::as_ptr(&ctx) as u64;

        if unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut epevent) } != 0 {
            return Err(RuntimeError::SysCallError(io::Error::last_os_error()));
        }

        inner.events = new_mask;
        self.pending_event_count.fetch_add(1, Ordering::AcqRel);
        let body = match callback {
            Some(cb) => HandlerBody::Callback(cb),
            None => {
                let current = Coroutine::current()
                    .expect("add_event's fiber-handler path requires a running coroutine");
                HandlerBody::Fiber(current)
            }
        };
        *inner.handler_slot(event) = Some(body);
        Ok(())
    }

    /// Disarm `event` on `fd` without invoking its handler.
    pub fn remove_event(&self, fd: i32, event: EventKind) -> bool {
        let ctx = self.context(fd);
        let mut inner = ctx.inner.lock().unwrap();
        if inner.events & event.bit() == 0 {
            return false;
        }
        let new_mask = inner.events & !event.bit();
        self.apply_epoll_mask(&ctx, &mut inner, new_mask);
        *inner.handler_slot(event) = None;
        self.pending_event_count.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Disarm `event` on `fd` and immediately schedule its handler.
    pub fn cancel_event(&self, fd: i32, event: EventKind) -> bool {
        let ctx = self.context(fd);
        let mut inner = ctx.inner.lock().unwrap();
        if inner.events & event.bit() == 0 {
            return false;
        }
        let new_mask = inner.events & !event.bit();
        self.apply_epoll_mask(&ctx, &mut inner, new_mask);
        if let Some(body) = inner.handler_slot(event).take() {
            self.pending_event_count.fetch_sub(1, Ordering::AcqRel);
            drop(inner);
            fire_handler(&self.scheduler, body);
        }
        true
    }

    /// Disarm and fire every outstanding handler on `fd`.
    pub fn cancel_all(&self, fd: i32) -> bool {
        let ctx = self.context(fd);
        let mut inner = ctx.inner.lock().unwrap();
        if inner.events == 0 {
            return false;
        }
        if unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) } != 0 {
            error!("epoll_ctl(DEL) failed for fd {fd}: {}", io::Error::last_os_error());
        }
        let read = inner.read.take();
        let write = inner.write.take();
        inner.events = 0;
        drop(inner);
        if let Some(body) = read {
            self.pending_event_count.fetch_sub(1, Ordering::AcqRel);
            fire_handler(&self.scheduler, body);
        }
        if let Some(body) = write {
            self.pending_event_count.fetch_sub(1, Ordering::AcqRel);
            fire_handler(&self.scheduler, body);
        }
        true
    }

    fn apply_epoll_mask(&self, ctx: &Arc<FDContext>, inner: &mut FDContextInner, new_mask: u8) {
        let op = if new_mask == 0 { libc::EPOLL_CTL_DEL } else { libc::EPOLL_CTL_MOD };
        let mut epevent: libc::epoll_event = unsafe { std::mem::zeroed() };
        epevent.events = libc::EPOLLET as u32 | mask_to_epoll_bits(new_mask);
        epevent.u64 = Arc::as_ptr(ctx) as u64;
        if unsafe { libc::epoll_ctl(self.epoll_fd, op, inner.fd, &mut epevent) } != 0 {
            error!(
                "epoll_ctl({op}) failed for fd {}: {}",
                inner.fd,
                io::Error::last_os_error()
            );
        }
        inner.events = new_mask;
    }

    fn drain_tickle_pipe(&self) {
        let mut byte = [0u8; 1];
        loop {
            let n = unsafe { libc::read(self.tickle_read_fd, byte.as_mut_ptr() as *mut _, 1) };
            if n <= 0 {
                break;
            }
        }
    }
}

impl SchedulerHooks for Reactor {
    fn tickle(&self, scheduler: &Scheduler) {
        if !scheduler.has_idle_thread() {
            return;
        }
        if unsafe { libc::write(self.tickle_write_fd, b"T".as_ptr() as *const _, 1) } == -1 {
            error!("reactor tickle write failed: {}", io::Error::last_os_error());
        }
    }

    fn on_idle(&self, scheduler: &Scheduler) {
        debug!("reactor {} entering idle loop", scheduler.name());
        let mut events: [libc::epoll_event; MAX_EPOLL_EVENTS] = unsafe { std::mem::zeroed() };

        loop {
            let next_timeout = self.timers.next_deadline_ms();
            if scheduler.is_stopping() && next_timeout.is_none() && self.pending_event_count() == 0 {
                debug!("reactor {} stopped", scheduler.name());
                break;
            }

            let wait_ms = match next_timeout {
                Some(ms) => (ms as i64).min(MAX_IDLE_TIMEOUT_MS) as i32,
                None => MAX_IDLE_TIMEOUT_MS as i32,
            };

            let n = loop {
                let r = unsafe {
                    libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), MAX_EPOLL_EVENTS as i32, wait_ms)
                };
                if r >= 0 {
                    break r;
                }
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("epoll_wait failed: {err}");
                break 0;
            };

            let expired = self.timers.drain_expired();
            for entry in expired {
                scheduler.schedule_fn(move || entry.fire(), -1, false);
            }

            for raw in &events[..n as usize] {
                if raw.u64 == self.tickle_read_fd as u64 {
                    self.drain_tickle_pipe();
                    continue;
                }

                let ctx = unsafe { &*(raw.u64 as *const FDContext) };
                let mut inner = ctx.inner.lock().unwrap();

                let mut raw_events = raw.events;
                if raw_events & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
                    raw_events |= (libc::EPOLLIN | libc::EPOLLOUT) as u32;
                }
                let mut real = 0u8;
                if raw_events & libc::EPOLLIN as u32 != 0 {
                    real |= EventKind::Read.bit();
                }
                if raw_events & libc::EPOLLOUT as u32 != 0 {
                    real |= EventKind::Write.bit();
                }
                real &= inner.events;
                if real == 0 {
                    continue;
                }

                let remaining = inner.events & !real;
                let op = if remaining == 0 { libc::EPOLL_CTL_DEL } else { libc::EPOLL_CTL_MOD };
                let mut epevent: libc::epoll_event = unsafe { std::mem::zeroed() };
                epevent.events = libc::EPOLLET as u32 | mask_to_epoll_bits(remaining);
                epevent.u64 = raw.u64;
                if unsafe { libc::epoll_ctl(self.epoll_fd, op, inner.fd, &mut epevent) } == -1 {
                    error!(
                        "epoll_ctl({op}) failed for fd {}: {}",
                        inner.fd,
                        io::Error::last_os_error()
                    );
                }
                inner.events = remaining;

                let read_body = if real & EventKind::Read.bit() != 0 { inner.read.take() } else { None };
                let write_body = if real & EventKind::Write.bit() != 0 { inner.write.take() } else { None };
                drop(inner);

                if let Some(body) = read_body {
                    self.pending_event_count.fetch_sub(1, Ordering::AcqRel);
                    fire_handler(scheduler, body);
                }
                if let Some(body) = write_body {
                    self.pending_event_count.fetch_sub(1, Ordering::AcqRel);
                    fire_handler(scheduler, body);
                }
            }

            Coroutine::yield_to_hold();
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
            libc::close(self.tickle_read_fd);
            libc::close(self.tickle_write_fd);
        }
    }
}

fn default_thread_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

/// The process-wide reactor the syscall hook layer (C6) suspends
/// coroutines against. Lazily started on first use, matching C2/C6's
/// "process-wide one-time state" convention.
static GLOBAL_REACTOR: Lazy<Arc<Reactor>> = Lazy::new(|| {
    let reactor = Reactor::new(default_thread_count(), false, "hook-reactor")
        .expect("failed to construct the process-wide reactor");
    reactor.start();
    reactor
});

pub fn global() -> Arc<Reactor> {
    GLOBAL_REACTOR.clone()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn add_event_fires_via_epoll_when_the_fd_becomes_readable() {
        let reactor = Reactor::new(1, false, "test-reactor").unwrap();
        reactor.start();

        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        reactor
            .add_event(read_fd, EventKind::Read, Some(Box::new(move || {
                fired2.store(true, Ordering::SeqCst);
            })))
            .unwrap();

        assert_eq!(unsafe { libc::write(write_fd, b"x".as_ptr() as *const _, 1) }, 1);

        for _ in 0..200 {
            if fired.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(fired.load(Ordering::SeqCst));

        reactor.stop();
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn cancel_all_fires_every_armed_handler_without_waiting_on_epoll() {
        let reactor = Reactor::new(1, false, "test-reactor-2").unwrap();
        reactor.start();

        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let read_fired = Arc::new(AtomicBool::new(false));
        let write_fired = Arc::new(AtomicBool::new(false));
        {
            let f = read_fired.clone();
            reactor.add_event(read_fd, EventKind::Read, Some(Box::new(move || f.store(true, Ordering::SeqCst)))).unwrap();
        }
        {
            let f = write_fired.clone();
            reactor.add_event(read_fd, EventKind::Write, Some(Box::new(move || f.store(true, Ordering::SeqCst)))).unwrap();
        }

        assert!(reactor.cancel_all(read_fd));

        for _ in 0..200 {
            if read_fired.load(Ordering::SeqCst) && write_fired.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(read_fired.load(Ordering::SeqCst));
        assert!(write_fired.load(Ordering::SeqCst));

        reactor.stop();
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
