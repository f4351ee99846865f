//! Deadline-ordered timers
//!
//! Timers live in an ordered set keyed by absolute wall-clock deadline with
//! the timer id as a stable tie-break: O(log n) insert/remove, a stable
//! front element, and cancellation by identity without tombstones.
//!
//! The wall clock can move backwards; `drain_expired` detects a jump of
//! more than an hour and drains the whole set once so far-future deadlines
//! cannot get stuck.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::{Duration, SystemTime};

/// Callable fired when a timer expires.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Receiver of "a new earliest deadline appeared" notifications.
///
/// The I/O manager implements this to wake its demultiplexer out of a stale
/// epoll_wait timeout. A standalone TimerManager has no notifier.
pub(crate) trait TimerNotify: Send + Sync {
    fn on_front_inserted(&self);
}

/// Backward clock jumps larger than this count as a rollover
const ROLLOVER_WINDOW: Duration = Duration::from_secs(60 * 60);

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(0);

struct TimerState {
    ms: u64,
    next: SystemTime,
    cb: Option<TimerCallback>,
}

struct TimerInner {
    id: u64,
    recurring: bool,
    manager: Weak<TimerShared>,
    state: Mutex<TimerState>,
}

/// Handle to a scheduled timer.
///
/// Shared with the manager's set; cancelling nulls the callable and removes
/// the set entry.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Timer {
    /// Cancel the timer. The callable never fires after this returns.
    /// Returns false if already cancelled (or already fired, non-recurring).
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.inner.manager.upgrade() else {
            return false;
        };
        let mut set = shared.set.write().unwrap();
        let mut state = self.inner.state.lock().unwrap();
        if state.cb.is_none() {
            return false;
        }
        state.cb = None;
        set.remove(&TimerKey::probe(state.next, self.inner.id));
        true
    }

    /// Re-seat the deadline at now + interval.
    pub fn refresh(&self) -> bool {
        let Some(shared) = self.inner.manager.upgrade() else {
            return false;
        };
        let mut set = shared.set.write().unwrap();
        let mut state = self.inner.state.lock().unwrap();
        if state.cb.is_none() {
            return false;
        }
        if !set.remove(&TimerKey::probe(state.next, self.inner.id)) {
            return false;
        }
        state.next = SystemTime::now() + Duration::from_millis(state.ms);
        set.insert(TimerKey::new(state.next, self.inner.clone()));
        true
    }

    /// Change the interval to `ms`. The new deadline is computed from now
    /// when `from_now`, else from the original scheduling instant.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(shared) = self.inner.manager.upgrade() else {
            return false;
        };
        {
            let mut set = shared.set.write().unwrap();
            let mut state = self.inner.state.lock().unwrap();
            if ms == state.ms && !from_now {
                return true;
            }
            if state.cb.is_none() {
                return false;
            }
            if !set.remove(&TimerKey::probe(state.next, self.inner.id)) {
                return false;
            }
            let start = if from_now {
                SystemTime::now()
            } else {
                state.next - Duration::from_millis(state.ms)
            };
            state.ms = ms;
            state.next = start + Duration::from_millis(ms);
        }
        // Re-insert through the notifying path: the new deadline may become
        // the new front.
        shared.insert(self.inner.clone());
        true
    }
}

/// Set entry; ordered by (deadline, id).
struct TimerKey {
    when: SystemTime,
    id: u64,
    timer: Option<Arc<TimerInner>>,
}

impl TimerKey {
    fn new(when: SystemTime, timer: Arc<TimerInner>) -> TimerKey {
        TimerKey {
            when,
            id: timer.id,
            timer: Some(timer),
        }
    }

    /// Lookup key for remove(); carries no timer.
    fn probe(when: SystemTime, id: u64) -> TimerKey {
        TimerKey {
            when,
            id,
            timer: None,
        }
    }
}

impl PartialEq for TimerKey {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.id == other.id
    }
}
impl Eq for TimerKey {}
impl PartialOrd for TimerKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.when, self.id).cmp(&(other.when, other.id))
    }
}

struct TimerShared {
    set: RwLock<BTreeSet<TimerKey>>,
    /// A front-insert notification is outstanding; cleared by next_timeout()
    tickled: AtomicBool,
    last_probe: Mutex<SystemTime>,
    notify: OnceLock<Weak<dyn TimerNotify>>,
}

impl TimerShared {
    /// Insert and fire `on_front_inserted` when the entry became the new
    /// minimum and no notification is already outstanding.
    fn insert(&self, timer: Arc<TimerInner>) {
        let at_front;
        {
            let mut set = self.set.write().unwrap();
            let when = timer.state.lock().unwrap().next;
            let id = timer.id;
            set.insert(TimerKey::new(when, timer));
            let is_front = set.first().map(|k| k.id) == Some(id);
            at_front = is_front && !self.tickled.load(Ordering::Relaxed);
            if at_front {
                self.tickled.store(true, Ordering::Relaxed);
            }
        }
        if at_front {
            if let Some(notify) = self.notify.get().and_then(Weak::upgrade) {
                notify.on_front_inserted();
            }
        }
    }
}

/// Manager of deadline-ordered timers.
pub struct TimerManager {
    shared: Arc<TimerShared>,
}

impl TimerManager {
    pub fn new() -> TimerManager {
        TimerManager {
            shared: Arc::new(TimerShared {
                set: RwLock::new(BTreeSet::new()),
                tickled: AtomicBool::new(false),
                last_probe: Mutex::new(SystemTime::now()),
                notify: OnceLock::new(),
            }),
        }
    }

    pub(crate) fn set_notify(&self, notify: Weak<dyn TimerNotify>) {
        let _ = self.shared.notify.set(notify);
    }

    /// Schedule `cb` to fire in `ms` milliseconds. A recurring timer
    /// re-inserts itself with `now + ms` after each firing.
    pub fn add_timer(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        let inner = Arc::new(TimerInner {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            recurring,
            manager: Arc::downgrade(&self.shared),
            state: Mutex::new(TimerState {
                ms,
                next: SystemTime::now() + Duration::from_millis(ms),
                cb: Some(Arc::new(cb)),
            }),
        });
        self.shared.insert(inner.clone());
        Timer { inner }
    }

    /// Schedule a timer whose callable first upgrades `witness`; if the
    /// witness is gone the firing is a no-op. The hook layer uses this to
    /// cancel per-descriptor I/O waits on timeout.
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        witness: Weak<T>,
        recurring: bool,
    ) -> Timer {
        self.add_timer(
            ms,
            move || {
                if witness.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the earliest deadline: 0 if one is already due,
    /// `u64::MAX` if the set is empty. Clears the outstanding front-insert
    /// notification.
    pub fn next_timeout(&self) -> u64 {
        let set = self.shared.set.read().unwrap();
        self.shared.tickled.store(false, Ordering::Relaxed);
        let Some(first) = set.first() else {
            return u64::MAX;
        };
        match first.when.duration_since(SystemTime::now()) {
            Ok(d) => d.as_millis() as u64,
            Err(_) => 0,
        }
    }

    /// Pop every due timer (all of them after a clock rollover), appending
    /// their callables to `out`. Recurring timers are re-seated at
    /// `now + interval`.
    pub fn drain_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = SystemTime::now();
        let mut set = self.shared.set.write().unwrap();
        let rollover = self.detect_clock_rollover(now);

        loop {
            let due = match set.first() {
                None => break,
                Some(k) => rollover || k.when <= now,
            };
            if !due {
                break;
            }
            let key = set.pop_first().unwrap();
            let Some(timer) = key.timer else { continue };

            let mut state = timer.state.lock().unwrap();
            if let Some(cb) = state.cb.clone() {
                out.push(cb);
            }
            if timer.recurring {
                state.next = now + Duration::from_millis(state.ms);
                let when = state.next;
                drop(state);
                set.insert(TimerKey::new(when, timer.clone()));
            } else {
                state.cb = None;
            }
        }
    }

    /// Any timers scheduled?
    pub fn has_timer(&self) -> bool {
        !self.shared.set.read().unwrap().is_empty()
    }

    fn detect_clock_rollover(&self, now: SystemTime) -> bool {
        let mut last = self.shared.last_probe.lock().unwrap();
        let rolled = match last.checked_sub(ROLLOVER_WINDOW) {
            Some(threshold) => now < threshold,
            None => false,
        };
        *last = now;
        rolled
    }

    #[cfg(test)]
    fn inject_last_probe(&self, t: SystemTime) {
        *self.shared.last_probe.lock().unwrap() = t;
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        TimerManager::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_next_timeout_semantics() {
        let mgr = TimerManager::new();
        assert_eq!(mgr.next_timeout(), u64::MAX);
        assert!(!mgr.has_timer());

        let _t = mgr.add_timer(10_000, || {}, false);
        let next = mgr.next_timeout();
        assert!(next > 0 && next <= 10_000);
        assert!(mgr.has_timer());

        let _due = mgr.add_timer(0, || {}, false);
        assert_eq!(mgr.next_timeout(), 0);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let timer = mgr.add_timer(5, move || {
            f.fetch_add(1, Ordering::Relaxed);
        }, false);

        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(!mgr.has_timer());

        std::thread::sleep(Duration::from_millis(20));
        let mut cbs = Vec::new();
        mgr.drain_expired(&mut cbs);
        assert!(cbs.is_empty());
        assert_eq!(fired.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_drain_fires_due_and_reseats_recurring() {
        let mgr = TimerManager::new();
        let _once = mgr.add_timer(0, || {}, false);
        let _rec = mgr.add_timer(0, || {}, true);
        let _far = mgr.add_timer(60_000, || {}, false);

        std::thread::sleep(Duration::from_millis(5));
        let mut cbs = Vec::new();
        mgr.drain_expired(&mut cbs);
        assert_eq!(cbs.len(), 2);

        // recurring one is back in, plus the far one
        assert_eq!(mgr.shared.set.read().unwrap().len(), 2);
    }

    #[test]
    fn test_refresh_pushes_deadline_out() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(50, || {}, false);
        std::thread::sleep(Duration::from_millis(30));
        assert!(timer.refresh());
        let next = mgr.next_timeout();
        assert!(next > 30, "refresh should re-seat at now + interval, got {}", next);
    }

    #[test]
    fn test_reset_changes_interval() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(10_000, || {}, false);
        assert!(timer.reset(20_000, true));
        let next = mgr.next_timeout();
        assert!(next > 10_000 && next <= 20_000);

        assert!(timer.cancel());
        assert!(!timer.reset(5, true));
    }

    #[test]
    fn test_clock_rollover_drains_everything() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f1 = fired.clone();
        let f2 = fired.clone();
        let _a = mgr.add_timer(60_000, move || {
            f1.fetch_add(1, Ordering::Relaxed);
        }, false);
        let _b = mgr.add_timer(120_000, move || {
            f2.fetch_add(1, Ordering::Relaxed);
        }, true);

        // Simulate the wall clock jumping backwards past the window
        mgr.inject_last_probe(SystemTime::now() + Duration::from_secs(2 * 60 * 60));

        let mut cbs = Vec::new();
        mgr.drain_expired(&mut cbs);
        assert_eq!(cbs.len(), 2);
        for cb in &cbs {
            cb();
        }
        assert_eq!(fired.load(Ordering::Relaxed), 2);

        // the recurring timer re-seated itself relative to the new now
        assert!(mgr.has_timer());
        assert_eq!(mgr.shared.set.read().unwrap().len(), 1);
    }
}
