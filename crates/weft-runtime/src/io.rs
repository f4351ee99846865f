//! Readiness-based I/O manager
//!
//! Extends the scheduler with an edge-triggered epoll demultiplexer and the
//! timer manager. Each worker's idle fiber blocks in epoll_wait (bounded by
//! the next timer deadline), schedules expired timer callables, and fires
//! fiber/callable continuations for ready descriptors. A non-blocking
//! self-pipe wakes the demultiplexer out of stale waits; duplicate wakes
//! collapse into a single byte.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use weft_core::{kdebug, kerror, WeftError, WeftResult};

use crate::config;
use crate::fiber::{self, Fiber};
use crate::scheduler::{Engine, Scheduler, SchedulerCore, TaskFn};
use crate::thread::Thread;
use crate::timer::{Timer, TimerManager, TimerNotify};
use crate::tls;

const EV_READ: u32 = libc::EPOLLIN as u32;
const EV_WRITE: u32 = libc::EPOLLOUT as u32;
const EV_ERR: u32 = libc::EPOLLERR as u32;
const EV_HUP: u32 = libc::EPOLLHUP as u32;
const EV_ET: u32 = libc::EPOLLET as u32;

/// epoll data token for the wake pipe; descriptor tokens are FdContext
/// pointers and can never collide with it.
const WAKE_TOKEN: u64 = u64::MAX;

/// A readiness direction on a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Read,
    Write,
}

impl Event {
    #[inline]
    pub(crate) fn bit(self) -> u32 {
        match self {
            Event::Read => EV_READ,
            Event::Write => EV_WRITE,
        }
    }
}

/// Continuation armed on one direction: the scheduler it was registered
/// from plus exactly one of {fiber, callable}.
#[derive(Default)]
struct EventSlot {
    scheduler: Option<Scheduler>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<TaskFn>,
}

impl EventSlot {
    fn reset(&mut self) {
        self.scheduler = None;
        self.fiber = None;
        self.cb = None;
    }
}

#[derive(Default)]
struct FdInner {
    /// Currently armed directions (EV_READ | EV_WRITE bits)
    events: u32,
    read: EventSlot,
    write: EventSlot,
}

impl FdInner {
    fn slot(&mut self, event: Event) -> &mut EventSlot {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }

    /// Disarm `event` and hand its continuation to the scheduler it was
    /// registered on. Registration is one-shot: re-arm to keep watching.
    fn trigger(&mut self, event: Event) {
        assert!(self.events & event.bit() != 0);
        self.events &= !event.bit();

        let slot = self.slot(event);
        let scheduler = slot.scheduler.take();
        let fiber = slot.fiber.take();
        let cb = slot.cb.take();
        slot.reset();

        let scheduler = scheduler.expect("armed event without a scheduler");
        if let Some(cb) = cb {
            scheduler.schedule_boxed(cb);
        } else if let Some(fiber) = fiber {
            scheduler.schedule_fiber(fiber);
        }
    }
}

/// Per-descriptor state; epoll's `data` points back at this.
struct FdContext {
    fd: RawFd,
    inner: Mutex<FdInner>,
}

/// The I/O engine: scheduler core + timers + epoll set.
pub(crate) struct IoEngine {
    core: SchedulerCore,
    timers: TimerManager,
    epfd: RawFd,
    wake_read: RawFd,
    wake_write: RawFd,
    /// FdContext array indexed by descriptor, grown geometrically
    contexts: RwLock<Vec<Arc<FdContext>>>,
    /// Armed (fd, direction) registrations not yet fired or cancelled
    pending: AtomicUsize,
    self_ref: OnceLock<Weak<IoEngine>>,
}

impl IoEngine {
    fn handle(&self) -> Option<IoManager> {
        self.self_ref
            .get()
            .and_then(Weak::upgrade)
            .map(|engine| IoManager { engine })
    }

    fn resize_contexts(&self, len: usize) {
        let mut contexts = self.contexts.write().unwrap();
        while contexts.len() < len {
            let fd = contexts.len() as RawFd;
            contexts.push(Arc::new(FdContext {
                fd,
                inner: Mutex::new(FdInner::default()),
            }));
        }
    }

    /// Context for `fd`, growing the array to ~1.5x on demand.
    fn context_for(&self, fd: RawFd) -> Arc<FdContext> {
        {
            let contexts = self.contexts.read().unwrap();
            if let Some(ctx) = contexts.get(fd as usize) {
                return ctx.clone();
            }
        }
        self.resize_contexts((fd as usize * 3 / 2).max(fd as usize + 1));
        self.contexts.read().unwrap()[fd as usize].clone()
    }

    fn context_if_tracked(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        self.contexts.read().unwrap().get(fd as usize).cloned()
    }

    fn add_event(&self, fd: RawFd, event: Event, cb: Option<TaskFn>) -> WeftResult<()> {
        let ctx = self.context_for(fd);
        let mut inner = ctx.inner.lock().unwrap();

        if inner.events & event.bit() != 0 {
            return Err(WeftError::EventExists(fd));
        }

        let op = if inner.events != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let mut ep = libc::epoll_event {
            events: EV_ET | inner.events | event.bit(),
            u64: Arc::as_ptr(&ctx) as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ep) } != 0 {
            let e = errno();
            kerror!("{}: add_event epoll_ctl(fd {}) failed: errno {}", self.core.name, fd, e);
            return Err(WeftError::Sys("epoll_ctl", e));
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        inner.events |= event.bit();

        let slot = inner.slot(event);
        debug_assert!(slot.scheduler.is_none() && slot.fiber.is_none() && slot.cb.is_none());
        slot.scheduler = Some(Scheduler::current().expect("add_event outside a scheduler thread"));
        match cb {
            Some(cb) => slot.cb = Some(cb),
            None => {
                let fiber = Fiber::current();
                debug_assert_eq!(fiber.state(), weft_core::FiberState::Running);
                slot.fiber = Some(fiber);
            }
        }
        Ok(())
    }

    fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.context_if_tracked(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock().unwrap();
        if inner.events & event.bit() == 0 {
            return false;
        }

        let left = inner.events & !event.bit();
        let op = if left != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        let mut ep = libc::epoll_event {
            events: EV_ET | left,
            u64: Arc::as_ptr(&ctx) as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ep) } != 0 {
            kerror!("{}: del_event epoll_ctl(fd {}) failed: errno {}", self.core.name, fd, errno());
            return false;
        }

        self.pending.fetch_sub(1, Ordering::AcqRel);
        inner.events = left;
        inner.slot(event).reset();
        true
    }

    /// Like del_event, but the stored continuation runs (exactly once, on
    /// its scheduler of registration).
    fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.context_if_tracked(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock().unwrap();
        if inner.events & event.bit() == 0 {
            return false;
        }

        let left = inner.events & !event.bit();
        let op = if left != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        let mut ep = libc::epoll_event {
            events: EV_ET | left,
            u64: Arc::as_ptr(&ctx) as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ep) } != 0 {
            kerror!("{}: cancel_event epoll_ctl(fd {}) failed: errno {}", self.core.name, fd, errno());
            return false;
        }

        self.pending.fetch_sub(1, Ordering::AcqRel);
        inner.trigger(event);
        true
    }

    fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.context_if_tracked(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock().unwrap();
        if inner.events == 0 {
            return false;
        }

        let mut ep = libc::epoll_event {
            events: 0,
            u64: Arc::as_ptr(&ctx) as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ep) } != 0 {
            kerror!("{}: cancel_all epoll_ctl(fd {}) failed: errno {}", self.core.name, fd, errno());
            return false;
        }

        if inner.events & EV_READ != 0 {
            inner.trigger(Event::Read);
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        if inner.events & EV_WRITE != 0 {
            inner.trigger(Event::Write);
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        debug_assert_eq!(inner.events, 0);
        true
    }
}

impl Engine for IoEngine {
    fn core(&self) -> &SchedulerCore {
        &self.core
    }

    fn register_tls(&self, handle: &Scheduler) {
        tls::set_current_scheduler(Some(handle.clone()));
        tls::set_current_io_manager(self.handle());
    }

    /// Wake one epoll_wait via the self-pipe. Skipped when every worker is
    /// busy: they re-check the queue before idling again.
    fn tickle(&self) {
        if self.core.idle_threads.load(Ordering::Acquire) == 0 {
            return;
        }
        let _ = unsafe { libc::write(self.wake_write, b"T".as_ptr() as *const libc::c_void, 1) };
    }

    fn stopping(&self) -> bool {
        !self.timers.has_timer()
            && self.pending.load(Ordering::Acquire) == 0
            && self.core.base_stopping()
    }

    fn idle(self: Arc<Self>) {
        let tid = Thread::gettid();
        let mut events =
            vec![libc::epoll_event { events: 0, u64: 0 }; config::EPOLL_BATCH];

        loop {
            if self.stopping() {
                kdebug!("{}: idle exits in thread {}", self.core.name, tid);
                break;
            }

            let n = loop {
                let next = self.timers.next_timeout().min(config::MAX_IDLE_TIMEOUT_MS);
                let n = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        config::EPOLL_BATCH as i32,
                        next as i32,
                    )
                };
                if n < 0 && errno() == libc::EINTR {
                    continue;
                }
                break n;
            };
            if n < 0 {
                kerror!("{}: epoll_wait failed: errno {}", self.core.name, errno());
            }

            let mut cbs = Vec::new();
            self.timers.drain_expired(&mut cbs);
            if !cbs.is_empty() {
                let sched = Scheduler::from_engine(self.clone() as Arc<dyn Engine>);
                for cb in cbs {
                    sched.schedule_boxed(Box::new(move || cb()));
                }
            }

            for i in 0..n.max(0) as usize {
                let flags = events[i].events;
                let token = events[i].u64;

                if token == WAKE_TOKEN {
                    let mut buf = [0u8; 256];
                    while unsafe {
                        libc::read(self.wake_read, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                    } > 0
                    {}
                    continue;
                }

                // token is the FdContext installed at registration; the
                // contexts array never shrinks, so it is still alive
                let ctx = unsafe { &*(token as *const FdContext) };
                let mut inner = ctx.inner.lock().unwrap();

                let mut flags = flags;
                if flags & (EV_ERR | EV_HUP) != 0 {
                    flags |= (EV_READ | EV_WRITE) & inner.events;
                }
                let mut real = 0u32;
                if flags & EV_READ != 0 {
                    real |= EV_READ;
                }
                if flags & EV_WRITE != 0 {
                    real |= EV_WRITE;
                }
                real &= inner.events;
                if real == 0 {
                    continue;
                }

                let left = inner.events & !real;
                let op = if left != 0 {
                    libc::EPOLL_CTL_MOD
                } else {
                    libc::EPOLL_CTL_DEL
                };
                let mut ep = libc::epoll_event {
                    events: EV_ET | left,
                    u64: token,
                };
                if unsafe { libc::epoll_ctl(self.epfd, op, ctx.fd, &mut ep) } != 0 {
                    kerror!("{}: idle epoll_ctl(fd {}) failed: errno {}", self.core.name, ctx.fd, errno());
                    continue;
                }

                if real & EV_READ != 0 {
                    inner.trigger(Event::Read);
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                }
                if real & EV_WRITE != 0 {
                    inner.trigger(Event::Write);
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                }
            }

            // Let the worker loop drain whatever was just scheduled
            fiber::yield_now();
        }
    }
}

impl TimerNotify for IoEngine {
    /// The demultiplexer may be blocked on a stale timeout; kick it.
    fn on_front_inserted(&self) {
        self.tickle();
    }
}

impl Drop for IoEngine {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.wake_read);
            libc::close(self.wake_write);
        }
    }
}

/// Handle to a running I/O manager: a scheduler with event demultiplexing
/// and timers. Cheap to clone.
#[derive(Clone)]
pub struct IoManager {
    engine: Arc<IoEngine>,
}

impl IoManager {
    /// Create the manager and start its worker pool.
    ///
    /// epoll/pipe setup failure is fatal.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> IoManager {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        assert!(epfd >= 0, "epoll_create1 failed: errno {}", errno());

        let mut pipe_fds = [0 as RawFd; 2];
        let rt = unsafe { libc::pipe(pipe_fds.as_mut_ptr()) };
        assert_eq!(rt, 0, "pipe failed: errno {}", errno());
        let rt = unsafe { libc::fcntl(pipe_fds[0], libc::F_SETFL, libc::O_NONBLOCK) };
        assert!(rt >= 0, "fcntl(wake pipe) failed: errno {}", errno());

        let mut ep = libc::epoll_event {
            events: EV_READ | EV_ET,
            u64: WAKE_TOKEN,
        };
        let rt = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe_fds[0], &mut ep) };
        assert_eq!(rt, 0, "epoll_ctl(wake pipe) failed: errno {}", errno());

        let engine = Arc::new(IoEngine {
            core: SchedulerCore::new(threads, use_caller, name),
            timers: TimerManager::new(),
            epfd,
            wake_read: pipe_fds[0],
            wake_write: pipe_fds[1],
            contexts: RwLock::new(Vec::new()),
            pending: AtomicUsize::new(0),
            self_ref: OnceLock::new(),
        });
        let _ = engine.self_ref.set(Arc::downgrade(&engine));
        engine
            .timers
            .set_notify(Arc::downgrade(&engine) as Weak<dyn TimerNotify>);
        engine.resize_contexts(32);

        let manager = IoManager { engine };
        manager.scheduler().install_caller();
        manager.scheduler().start();
        manager
    }

    /// The I/O manager driving the calling thread's worker loop, if any.
    pub fn current() -> Option<IoManager> {
        tls::current_io_manager()
    }

    /// This manager viewed as its scheduler.
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::from_engine(self.engine.clone() as Arc<dyn Engine>)
    }

    /// The embedded timer manager.
    pub fn timers(&self) -> &TimerManager {
        &self.engine.timers
    }

    pub fn name(&self) -> &str {
        &self.engine.core().name
    }

    /// Arm `event` on `fd`, resuming the current fiber on readiness.
    pub fn add_event(&self, fd: RawFd, event: Event) -> WeftResult<()> {
        self.engine.add_event(fd, event, None)
    }

    /// Arm `event` on `fd` with an explicit callable continuation.
    pub fn add_event_with(
        &self,
        fd: RawFd,
        event: Event,
        cb: impl FnOnce() + Send + 'static,
    ) -> WeftResult<()> {
        self.engine.add_event(fd, event, Some(Box::new(cb)))
    }

    /// Disarm without firing. Returns false if nothing was armed.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        self.engine.del_event(fd, event)
    }

    /// Disarm and fire the stored continuation once.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        self.engine.cancel_event(fd, event)
    }

    /// Remove `fd` from the demultiplexer, firing both directions if armed.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        self.engine.cancel_all(fd)
    }

    /// Armed registrations not yet fired or cancelled.
    pub fn pending_events(&self) -> usize {
        self.engine.pending.load(Ordering::Acquire)
    }

    pub fn schedule(&self, f: impl FnOnce() + Send + 'static) {
        self.scheduler().schedule(f);
    }

    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.scheduler().schedule_fiber(fiber);
    }

    pub fn add_timer(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        self.engine.timers.add_timer(ms, cb, recurring)
    }

    pub fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        witness: Weak<T>,
        recurring: bool,
    ) -> Timer {
        self.engine.timers.add_condition_timer(ms, cb, witness, recurring)
    }

    pub fn stop(&self) {
        self.scheduler().stop();
    }

    pub fn stopping(&self) -> bool {
        self.scheduler().stopping()
    }
}

fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_add_del_event_round_trip() {
        let iom = IoManager::new(1, false, "io-roundtrip");
        let (rd, wr) = pipe_pair();

        assert_eq!(iom.pending_events(), 0);
        iom.add_event_with(rd, Event::Read, || {}).unwrap();
        assert_eq!(iom.pending_events(), 1);

        // double-arming the same direction fails
        assert!(matches!(
            iom.add_event_with(rd, Event::Read, || {}),
            Err(WeftError::EventExists(_))
        ));

        assert!(iom.del_event(rd, Event::Read));
        assert_eq!(iom.pending_events(), 0);
        assert!(!iom.del_event(rd, Event::Read));

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
        iom.stop();
    }

    #[test]
    fn test_readiness_fires_callback() {
        let iom = IoManager::new(1, false, "io-ready");
        let (rd, wr) = pipe_pair();

        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        iom.add_event_with(rd, Event::Read, move || {
            f.store(true, Ordering::Release);
        })
        .unwrap();

        assert_eq!(unsafe { libc::write(wr, b"x".as_ptr() as *const libc::c_void, 1) }, 1);

        for _ in 0..200 {
            if fired.load(Ordering::Acquire) {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(fired.load(Ordering::Acquire));
        assert_eq!(iom.pending_events(), 0);

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
        iom.stop();
    }

    #[test]
    fn test_cancel_event_fires_continuation() {
        let iom = IoManager::new(1, false, "io-cancel");
        let (rd, wr) = pipe_pair();

        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        iom.add_event_with(rd, Event::Read, move || {
            f.store(true, Ordering::Release);
        })
        .unwrap();

        assert!(iom.cancel_event(rd, Event::Read));
        assert!(!iom.cancel_event(rd, Event::Read));

        for _ in 0..200 {
            if fired.load(Ordering::Acquire) {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(fired.load(Ordering::Acquire));
        assert_eq!(iom.pending_events(), 0);

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
        iom.stop();
    }

    #[test]
    fn test_timer_fires_on_io_manager() {
        let iom = IoManager::new(1, false, "io-timer");
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let start = std::time::Instant::now();
        let _t = iom.add_timer(50, move || {
            f.store(true, Ordering::Release);
        }, false);

        for _ in 0..200 {
            if fired.load(Ordering::Acquire) {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(fired.load(Ordering::Acquire));
        assert!(start.elapsed() >= Duration::from_millis(45));
        iom.stop();
    }
}
