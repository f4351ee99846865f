//! Thread-local runtime context
//!
//! Per-thread slots for the fiber machinery (current / thread-main /
//! scheduler fibers), the scheduler and I/O manager handles of the worker
//! loop, and the hook-enable flag.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use crate::fiber::Fiber;
use crate::io::IoManager;
use crate::scheduler::Scheduler;

thread_local! {
    /// Fiber currently executing on this thread
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// The thread-main fiber (runs on the OS thread stack)
    static THREAD_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// The fiber that scheduler-owned tasks yield back to
    static SCHED_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Scheduler driving this thread's worker loop
    static SCHEDULER: RefCell<Option<Scheduler>> = const { RefCell::new(None) };

    /// I/O manager driving this thread's worker loop, when there is one
    static IO_MANAGER: RefCell<Option<IoManager>> = const { RefCell::new(None) };

    /// Whether hooked I/O is engaged on this thread
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

#[inline]
pub fn current_fiber() -> Option<Arc<Fiber>> {
    CURRENT_FIBER.with(|c| c.borrow().clone())
}

#[inline]
pub fn set_current_fiber(f: Option<Arc<Fiber>>) {
    CURRENT_FIBER.with(|c| *c.borrow_mut() = f);
}

#[inline]
pub fn thread_fiber() -> Option<Arc<Fiber>> {
    THREAD_FIBER.with(|c| c.borrow().clone())
}

#[inline]
pub fn set_thread_fiber(f: Option<Arc<Fiber>>) {
    THREAD_FIBER.with(|c| *c.borrow_mut() = f);
}

#[inline]
pub fn scheduler_fiber() -> Option<Arc<Fiber>> {
    SCHED_FIBER.with(|c| c.borrow().clone())
}

#[inline]
pub fn set_scheduler_fiber(f: Option<Arc<Fiber>>) {
    SCHED_FIBER.with(|c| *c.borrow_mut() = f);
}

#[inline]
pub fn current_scheduler() -> Option<Scheduler> {
    SCHEDULER.with(|c| c.borrow().clone())
}

#[inline]
pub fn set_current_scheduler(s: Option<Scheduler>) {
    SCHEDULER.with(|c| *c.borrow_mut() = s);
}

#[inline]
pub fn current_io_manager() -> Option<IoManager> {
    IO_MANAGER.with(|c| c.borrow().clone())
}

#[inline]
pub fn set_current_io_manager(m: Option<IoManager>) {
    IO_MANAGER.with(|c| *c.borrow_mut() = m);
}

#[inline]
pub fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

#[inline]
pub fn set_hook_enabled(on: bool) {
    HOOK_ENABLED.with(|c| c.set(on));
}
