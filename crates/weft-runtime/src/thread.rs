//! Worker thread bootstrap
//!
//! `Thread::spawn` returns only after the new thread is live and has
//! published its kernel tid, so callers can pin work to it immediately.

use std::cell::RefCell;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Counting semaphore over Mutex + Condvar.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Semaphore {
        Semaphore {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Block until a permit is available, then take it.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Release one permit.
    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }
}

thread_local! {
    static THREAD_NAME: RefCell<String> = RefCell::new(String::from("UNKNOWN"));
}

/// A named OS thread with synchronous startup.
pub struct Thread {
    handle: Option<JoinHandle<()>>,
    tid: libc::pid_t,
    name: String,
}

impl Thread {
    /// Spawn a named thread running `f`; blocks until the thread has
    /// started and published its tid.
    pub fn spawn(name: &str, f: impl FnOnce() + Send + 'static) -> Thread {
        let sem = Arc::new(Semaphore::new(0));
        let tid_slot = Arc::new(AtomicI32::new(0));

        let sem2 = sem.clone();
        let tid2 = tid_slot.clone();
        let name2 = name.to_string();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                Thread::set_current_name(&name2);
                tid2.store(Thread::gettid(), Ordering::Release);
                sem2.post();
                f();
            })
            .expect("failed to spawn worker thread");

        sem.wait();
        Thread {
            handle: Some(handle),
            tid: tid_slot.load(Ordering::Acquire),
            name: name.to_string(),
        }
    }

    /// Wait for the thread to finish.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Kernel thread id of this thread.
    #[inline]
    pub fn tid(&self) -> libc::pid_t {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel thread id of the calling thread.
    #[inline]
    pub fn gettid() -> libc::pid_t {
        unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
    }

    /// Name of the calling thread, as published at spawn.
    pub fn current_name() -> String {
        THREAD_NAME.with(|n| n.borrow().clone())
    }

    pub fn set_current_name(name: &str) {
        THREAD_NAME.with(|n| *n.borrow_mut() = name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_publishes_tid() {
        let mut t = Thread::spawn("weft-test", || {
            assert_eq!(Thread::current_name(), "weft-test");
        });
        assert!(t.tid() > 0);
        assert_ne!(t.tid(), Thread::gettid());
        t.join();
    }

    #[test]
    fn test_semaphore_orders_startup() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = sem.clone();
        let handle = std::thread::spawn(move || {
            sem2.post();
            sem2.post();
        });
        sem.wait();
        sem.wait();
        handle.join().unwrap();
    }
}
