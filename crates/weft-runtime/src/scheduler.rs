//! Multi-threaded fiber scheduler
//!
//! A worker pool draining one shared FIFO task queue. Tasks are fibers or
//! plain callables, optionally pinned to a specific worker thread. Each
//! worker owns an idle fiber it falls into when the queue is empty; the
//! bare scheduler's idle body is a timed yield, the I/O manager replaces it
//! with an epoll loop.
//!
//! The scheduler/IOManager split is a small capability interface
//! ([`Engine`]) rather than an inheritance tree: exactly two
//! implementations exist.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use weft_core::kdebug;

use crate::config;
use crate::fiber::{self, Fiber};
use crate::hook;
use crate::thread::Thread;
use crate::tls;
use weft_core::FiberState;

pub(crate) type TaskFn = Box<dyn FnOnce() + Send>;

/// A queue entry: exactly one of {fiber, callable}, plus an optional target
/// thread (-1 = any).
pub(crate) struct Task {
    fiber: Option<Arc<Fiber>>,
    cb: Option<TaskFn>,
    thread: libc::pid_t,
}

impl Task {
    fn from_fiber(fiber: Arc<Fiber>, thread: libc::pid_t) -> Task {
        Task {
            fiber: Some(fiber),
            cb: None,
            thread,
        }
    }

    fn from_cb(cb: TaskFn, thread: libc::pid_t) -> Task {
        Task {
            fiber: None,
            cb: Some(cb),
            thread,
        }
    }
}

/// Shared state of a worker pool.
pub(crate) struct SchedulerCore {
    pub(crate) name: String,
    use_caller: bool,
    /// Caller tid when `use_caller`, else -1
    pub(crate) root_thread: libc::pid_t,
    /// Worker threads spawned by `start()` (excludes the caller)
    thread_count: usize,
    queue: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<Thread>>,
    /// Scheduler fiber living on the caller thread, when `use_caller`
    caller_fiber: Mutex<Option<Arc<Fiber>>>,
    pub(crate) active_threads: AtomicUsize,
    pub(crate) idle_threads: AtomicUsize,
    stopping: AtomicBool,
    started: AtomicBool,
}

impl SchedulerCore {
    pub(crate) fn new(threads: usize, use_caller: bool, name: &str) -> SchedulerCore {
        assert!(threads >= 1, "scheduler needs at least one thread");
        let (thread_count, root_thread) = if use_caller {
            (threads - 1, Thread::gettid())
        } else {
            (threads, -1)
        };
        SchedulerCore {
            name: name.to_string(),
            use_caller,
            root_thread,
            thread_count,
            queue: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            caller_fiber: Mutex::new(None),
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }
    }

    /// Stop requested AND the queue is drained AND nothing is mid-task.
    pub(crate) fn base_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
            && self.queue.lock().unwrap().is_empty()
            && self.active_threads.load(Ordering::Acquire) == 0
    }
}

/// Capability interface between the worker loop and its owner.
///
/// Two implementations: [`BareEngine`] here and `IoEngine` in `io`.
pub(crate) trait Engine: Send + Sync + 'static {
    fn core(&self) -> &SchedulerCore;

    /// Install this engine's handles into the calling thread's TLS.
    fn register_tls(&self, handle: &Scheduler);

    /// Wake a worker parked in its idle fiber.
    fn tickle(&self);

    /// May the worker loops terminate?
    fn stopping(&self) -> bool;

    /// Body of the per-thread idle fiber.
    fn idle(self: Arc<Self>);
}

/// The bare scheduler engine: no demultiplexer, idle is a timed yield.
struct BareEngine {
    core: SchedulerCore,
}

impl Engine for BareEngine {
    fn core(&self) -> &SchedulerCore {
        &self.core
    }

    fn register_tls(&self, handle: &Scheduler) {
        tls::set_current_scheduler(Some(handle.clone()));
    }

    fn tickle(&self) {}

    fn stopping(&self) -> bool {
        self.core.base_stopping()
    }

    fn idle(self: Arc<Self>) {
        while !self.stopping() {
            std::thread::sleep(Duration::from_millis(config::IDLE_SLEEP_MS));
            fiber::yield_now();
        }
    }
}

/// Handle to a running scheduler. Cheap to clone; all clones share one
/// worker pool.
#[derive(Clone)]
pub struct Scheduler {
    engine: Arc<dyn Engine>,
}

impl Scheduler {
    /// Create a scheduler with `threads` worker slots.
    ///
    /// With `use_caller` the constructing thread contributes one slot: a
    /// dedicated scheduler fiber is created on it and tasks drain there
    /// during `stop()`.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Scheduler {
        let core = SchedulerCore::new(threads, use_caller, name);
        let sched = Scheduler {
            engine: Arc::new(BareEngine { core }),
        };
        sched.install_caller();
        sched
    }

    pub(crate) fn from_engine(engine: Arc<dyn Engine>) -> Scheduler {
        Scheduler { engine }
    }

    /// The scheduler driving the calling thread's worker loop, if any.
    pub fn current() -> Option<Scheduler> {
        tls::current_scheduler()
    }

    /// Set up the constructing thread: TLS handle, and with `use_caller`
    /// the caller's main fiber plus its scheduler fiber bound to the worker
    /// loop.
    pub(crate) fn install_caller(&self) {
        self.engine.register_tls(self);
        let core = self.engine.core();
        if core.use_caller {
            let _ = Fiber::current();
            let weak = Arc::downgrade(&self.engine);
            let sched_fiber = Fiber::new(
                move || {
                    if let Some(engine) = weak.upgrade() {
                        run_worker(engine);
                    }
                },
                0,
                false,
            );
            Fiber::set_scheduler_fiber(sched_fiber.clone());
            *core.caller_fiber.lock().unwrap() = Some(sched_fiber);
        }
    }

    pub fn name(&self) -> &str {
        &self.engine.core().name
    }

    /// Enqueue a callable on any worker.
    pub fn schedule(&self, f: impl FnOnce() + Send + 'static) {
        self.submit(Task::from_cb(Box::new(f), -1));
    }

    /// Enqueue a callable pinned to the worker with kernel tid `thread`.
    pub fn schedule_to(&self, f: impl FnOnce() + Send + 'static, thread: libc::pid_t) {
        self.submit(Task::from_cb(Box::new(f), thread));
    }

    /// Enqueue a fiber on any worker. Passing the `Arc` by value is the
    /// refcount-neutral path; clone at the call site to keep a handle.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.submit(Task::from_fiber(fiber, -1));
    }

    /// Enqueue a fiber pinned to the worker with kernel tid `thread`.
    pub fn schedule_fiber_to(&self, fiber: Arc<Fiber>, thread: libc::pid_t) {
        self.submit(Task::from_fiber(fiber, thread));
    }

    pub(crate) fn schedule_boxed(&self, cb: TaskFn) {
        self.submit(Task::from_cb(cb, -1));
    }

    fn submit(&self, task: Task) {
        let need_tickle = {
            let mut queue = self.engine.core().queue.lock().unwrap();
            let was_empty = queue.is_empty();
            queue.push_back(task);
            was_empty
        };
        if need_tickle {
            self.engine.tickle();
        }
    }

    /// Spawn the worker threads. A stopped scheduler cannot be restarted.
    pub fn start(&self) {
        let core = self.engine.core();
        if core.stopping.load(Ordering::Acquire) {
            weft_core::kerror!("{}: start() on a stopped scheduler", core.name);
            return;
        }
        if core.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut threads = core.threads.lock().unwrap();
        debug_assert!(threads.is_empty());
        for i in 0..core.thread_count {
            let engine = self.engine.clone();
            threads.push(Thread::spawn(&format!("{}_{}", core.name, i), move || {
                run_worker(engine)
            }));
        }
    }

    /// Request shutdown, drain on the caller if it participates, and join
    /// every worker. Returns only once all enqueued tasks have been
    /// dispatched.
    pub fn stop(&self) {
        if self.engine.stopping() {
            return;
        }
        let core = self.engine.core();
        core.stopping.store(true, Ordering::Release);

        for _ in 0..core.thread_count {
            self.engine.tickle();
        }

        let caller_fiber = core.caller_fiber.lock().unwrap().take();
        if caller_fiber.is_some() {
            self.engine.tickle();
        }
        if let Some(fiber) = caller_fiber {
            fiber.resume();
            kdebug!("{}: caller worker finished", core.name);
        }

        let mut threads = std::mem::take(&mut *core.threads.lock().unwrap());
        for t in &mut threads {
            t.join();
        }
    }

    /// True once stop was requested and all work has drained.
    pub fn stopping(&self) -> bool {
        self.engine.stopping()
    }
}

/// The worker loop: pop tasks honoring thread pins, run each in a fiber,
/// fall into the idle fiber when the queue is empty.
pub(crate) fn run_worker(engine: Arc<dyn Engine>) {
    let tid = Thread::gettid();
    kdebug!("{}: worker loop starts in thread {}", engine.core().name, tid);

    engine.register_tls(&Scheduler::from_engine(engine.clone()));
    hook::set_hook_enable(true);

    if tid != engine.core().root_thread {
        let _ = Fiber::current();
    }

    let idle_engine = engine.clone();
    let idle_fiber = Fiber::new(move || idle_engine.idle(), 0, true);
    let core = engine.core();

    loop {
        let mut tickle_me = false;
        let mut task: Option<Task> = None;
        {
            let mut queue = core.queue.lock().unwrap();
            let mut i = 0;
            while i < queue.len() {
                // A task pinned to another thread stays queued; remember to
                // wake someone else for it.
                if queue[i].thread != -1 && queue[i].thread != tid {
                    tickle_me = true;
                    i += 1;
                    continue;
                }
                task = queue.remove(i);
                core.active_threads.fetch_add(1, Ordering::AcqRel);
                break;
            }
            tickle_me = tickle_me || !queue.is_empty();
        }
        if tickle_me {
            engine.tickle();
        }

        if let Some(task) = task {
            if let Some(task_fiber) = task.fiber {
                // One slice: a mid-task yield is not auto-requeued
                if task_fiber.state() != FiberState::Term {
                    task_fiber.resume();
                }
            } else if let Some(cb) = task.cb {
                let cb_fiber = Fiber::new(cb, 0, true);
                cb_fiber.resume();
            }
            core.active_threads.fetch_sub(1, Ordering::AcqRel);
        } else {
            if idle_fiber.state() == FiberState::Term {
                kdebug!("{}: worker loop exits in thread {}", core.name, tid);
                break;
            }
            core.idle_threads.fetch_add(1, Ordering::AcqRel);
            idle_fiber.resume();
            core.idle_threads.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_tasks_run_exactly_once_across_pool() {
        let sched = Scheduler::new(3, true, "sched-test");
        let log: Arc<Mutex<Vec<(usize, libc::pid_t)>>> = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let log = log.clone();
            sched.schedule(move || {
                log.lock().unwrap().push((i, Thread::gettid()));
            });
        }
        sched.start();
        sched.stop();

        let log = log.lock().unwrap();
        let ids: HashSet<usize> = log.iter().map(|(i, _)| *i).collect();
        assert_eq!(log.len(), 10);
        assert_eq!(ids.len(), 10);

        let tids: HashSet<libc::pid_t> = log.iter().map(|(_, t)| *t).collect();
        assert!(tids.len() <= 3);
    }

    #[test]
    fn test_pinned_task_runs_on_caller() {
        let caller = Thread::gettid();
        let sched = Scheduler::new(2, true, "sched-pin");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..4 {
            let seen = seen.clone();
            sched.schedule_to(
                move || {
                    seen.lock().unwrap().push(Thread::gettid());
                },
                caller,
            );
        }
        sched.start();
        sched.stop();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().all(|t| *t == caller));
    }

    #[test]
    fn test_schedule_fiber_task() {
        let sched = Scheduler::new(1, true, "sched-fiber");
        let hit = Arc::new(AtomicBool::new(false));
        let h = hit.clone();
        let fiber = Fiber::new(move || h.store(true, Ordering::Release), 0, true);

        sched.schedule_fiber(fiber);
        sched.start();
        sched.stop();
        assert!(hit.load(Ordering::Acquire));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let sched = Scheduler::new(1, false, "sched-stop");
        sched.start();
        sched.stop();
        sched.stop();
        assert!(sched.stopping());
    }
}
