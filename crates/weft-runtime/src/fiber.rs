//! Stackful cooperative fibers
//!
//! A fiber is an independently stacked execution context with explicit
//! resume/yield. Every thread lazily owns a "main" fiber that reuses the OS
//! thread stack; child fibers own a guard-paged mmap'd stack. A fiber
//! scheduled by a worker loop (`run_in_scheduler`) yields back to the
//! thread's scheduler fiber, everything else yields to the thread-main
//! fiber.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use weft_core::{FiberId, FiberState};

use crate::config;
use crate::current_arch::{self, Context};
use crate::stack::Stack;
use crate::tls;

/// Process-wide id source
static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Live fiber count
static LIVE_FIBERS: AtomicU64 = AtomicU64::new(0);

type EntryFn = Box<dyn FnOnce() + Send>;

/// A stackful cooperative execution context.
///
/// Shared between its creator and the scheduler queue via `Arc`. A fiber is
/// RUNNING on at most one thread at any moment; the context block is only
/// touched by the thread that holds the RUNNING claim, which is what makes
/// the `UnsafeCell` sound.
pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    run_in_scheduler: bool,
    ctx: UnsafeCell<Context>,
    stack: Option<Stack>,
    entry: Mutex<Option<EntryFn>>,
}

unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a child fiber in READY state.
    ///
    /// `stack_size` of zero selects the configured default (128 KiB). With
    /// `run_in_scheduler` the fiber yields back to the thread's scheduler
    /// fiber instead of the thread-main fiber.
    ///
    /// Stack or context setup failure is fatal.
    pub fn new(
        entry: impl FnOnce() + Send + 'static,
        stack_size: usize,
        run_in_scheduler: bool,
    ) -> Arc<Fiber> {
        let size = if stack_size == 0 {
            config::stack_size()
        } else {
            stack_size
        };
        let stack = Stack::alloc(size).expect("fiber stack allocation failed");
        let stack_top = stack.top();

        let fiber = Arc::new(Fiber {
            id: FiberId::new(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            state: AtomicU8::new(FiberState::Ready as u8),
            run_in_scheduler,
            ctx: UnsafeCell::new(Context::zeroed()),
            stack: Some(stack),
            entry: Mutex::new(Some(Box::new(entry))),
        });
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);

        unsafe {
            current_arch::init_context(
                fiber.ctx.get(),
                stack_top,
                fiber_main as usize,
                Arc::as_ptr(&fiber) as usize,
            );
        }
        fiber
    }

    /// The thread-main fiber: RUNNING from birth, no owned stack. Its
    /// context block is first filled when a child fiber switches away from
    /// it.
    fn new_main() -> Fiber {
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        Fiber {
            id: FiberId::new(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            state: AtomicU8::new(FiberState::Running as u8),
            run_in_scheduler: false,
            ctx: UnsafeCell::new(Context::zeroed()),
            stack: None,
            entry: Mutex::new(None),
        }
    }

    /// The fiber currently executing on this thread.
    ///
    /// The first call on a thread creates its main fiber (and installs it as
    /// the default scheduler fiber).
    pub fn current() -> Arc<Fiber> {
        if let Some(f) = tls::current_fiber() {
            return f;
        }
        let main = Arc::new(Fiber::new_main());
        tls::set_current_fiber(Some(main.clone()));
        tls::set_thread_fiber(Some(main.clone()));
        tls::set_scheduler_fiber(Some(main.clone()));
        main
    }

    /// Id of the fiber currently executing on this thread, or
    /// [`FiberId::NONE`] when the thread has no fiber context yet.
    pub fn current_id() -> FiberId {
        tls::current_fiber().map_or(FiberId::NONE, |f| f.id)
    }

    /// Install `f` as this thread's scheduler fiber: the fiber that
    /// scheduler-owned tasks yield back to.
    pub fn set_scheduler_fiber(f: Arc<Fiber>) {
        tls::set_scheduler_fiber(Some(f));
    }

    /// Number of live fibers in the process.
    pub fn total() -> u64 {
        LIVE_FIBERS.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    /// Transfer control into this fiber.
    ///
    /// Legal only from READY; any other settled state aborts. A fiber that
    /// has just yielded on another worker publishes READY only once its
    /// context save is complete, so a transient RUNNING observed here means
    /// "still switching out" and is waited out.
    pub fn resume(self: &Arc<Self>) {
        loop {
            match self.state.compare_exchange(
                FiberState::Ready as u8,
                FiberState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(s) if s == FiberState::Running as u8 => std::hint::spin_loop(),
                Err(s) => panic!(
                    "resume() on fiber {} in state {}",
                    self.id,
                    FiberState::from(s)
                ),
            }
        }

        // Lazily create this thread's main fiber so there is a context block
        // to save into.
        let _ = Fiber::current();
        let ret = self
            .return_fiber()
            .expect("resume without a thread fiber context");

        tls::set_current_fiber(Some(self.clone()));
        unsafe {
            current_arch::context_switch(ret.ctx.get(), self.ctx.get());
        }

        // The fiber switched back. Publish READY here, not in yield: until
        // this point its saved context may still be mid-write, and no other
        // worker may load it.
        let _ = self.state.compare_exchange(
            FiberState::Running as u8,
            FiberState::Ready as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Hand control back to the return fiber.
    ///
    /// Legal only on the currently running fiber, from RUNNING (mid-task) or
    /// TERM (the trampoline's final switch).
    pub fn yield_fiber(&self) {
        let s = self.state();
        assert!(
            s == FiberState::Running || s == FiberState::Term,
            "yield on fiber {} in state {}",
            self.id,
            s
        );

        let ret = self
            .return_fiber()
            .expect("yield without a thread fiber context");
        tls::set_current_fiber(Some(ret.clone()));
        unsafe {
            current_arch::context_switch(self.ctx.get(), ret.ctx.get());
        }
    }

    /// Re-arm a finished fiber with a new entry, reusing its stack.
    ///
    /// Legal only when TERM and the fiber owns a stack.
    pub fn reset(self: &Arc<Self>, entry: impl FnOnce() + Send + 'static) {
        assert!(
            self.state() == FiberState::Term,
            "reset() on fiber {} in state {}",
            self.id,
            self.state()
        );
        let stack = self.stack.as_ref().expect("reset() on the main fiber");

        *self.entry.lock().unwrap() = Some(Box::new(entry));
        unsafe {
            current_arch::init_context(
                self.ctx.get(),
                stack.top(),
                fiber_main as usize,
                Arc::as_ptr(self) as usize,
            );
        }
        self.state
            .store(FiberState::Ready as u8, Ordering::Release);
    }

    fn return_fiber(&self) -> Option<Arc<Fiber>> {
        if self.run_in_scheduler {
            tls::scheduler_fiber()
        } else {
            tls::thread_fiber()
        }
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Yield the currently running fiber.
pub fn yield_now() {
    Fiber::current().yield_fiber();
}

/// First frame of every child fiber.
///
/// Runs the entry, clears it, marks TERM, drops the self-reference and
/// switches back to whoever resumed us. Never returns.
extern "C" fn fiber_main(arg: usize) {
    let fiber = unsafe { &*(arg as *const Fiber) };
    {
        let curr = Fiber::current();
        debug_assert_eq!(curr.id(), fiber.id());

        let entry = curr.entry.lock().unwrap().take();
        if let Some(entry) = entry {
            entry();
        }
        curr.state
            .store(FiberState::Term as u8, Ordering::Release);
        // self-reference dropped here, before the final switch
    }
    fiber.yield_fiber();
    unreachable!("terminated fiber was resumed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_main_fiber_is_running() {
        let main = Fiber::current();
        assert_eq!(main.state(), FiberState::Running);
        assert!(Fiber::current_id().is_some());
    }

    #[test]
    fn test_generator_yields_ten_times() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let fiber = Fiber::new(
            move || {
                let (mut a, mut b) = (0u64, 1u64);
                for _ in 0..10 {
                    h.fetch_add(1, Ordering::Relaxed);
                    let next = a + b;
                    a = b;
                    b = next;
                    yield_now();
                }
            },
            0,
            false,
        );

        let mut resumes = 0;
        while fiber.state() != FiberState::Term {
            fiber.resume();
            resumes += 1;
        }
        assert_eq!(hits.load(Ordering::Relaxed), 10);
        assert_eq!(resumes, 11); // ten slices plus the terminating return
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_reset_reuses_stack() {
        let first = Arc::new(AtomicUsize::new(0));
        let f1 = first.clone();
        let fiber = Fiber::new(move || f1.store(1, Ordering::Relaxed), 0, false);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(first.load(Ordering::Relaxed), 1);

        let second = Arc::new(AtomicUsize::new(0));
        let f2 = second.clone();
        fiber.reset(move || f2.store(2, Ordering::Relaxed));
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(second.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_yield_mid_task_leaves_ready() {
        let fiber = Fiber::new(|| yield_now(), 0, false);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_custom_stack_size() {
        let fiber = Fiber::new(|| {}, 512 * 1024, false);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
    }
}
