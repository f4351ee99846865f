//! Runtime tuning knobs
//!
//! Compile-time defaults with environment overrides, read once at startup.

use std::sync::OnceLock;

use weft_core::env::env_u64;

/// Default stack size for child fibers (128 KiB)
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Upper bound on a single epoll_wait timeout, so the idle loop re-checks
/// `stopping()` even with no timers armed
pub const MAX_IDLE_TIMEOUT_MS: u64 = 5000;

/// epoll_wait batch size
pub const EPOLL_BATCH: usize = 256;

/// Sleep interval of the bare scheduler's idle fiber
pub const IDLE_SLEEP_MS: u64 = 1000;

/// Child fiber stack size, `WEFT_STACK_SIZE` override applied.
///
/// A zero `stack_size` argument to `Fiber::new` resolves to this.
pub fn stack_size() -> usize {
    static STACK_SIZE: OnceLock<usize> = OnceLock::new();
    *STACK_SIZE.get_or_init(|| env_u64("WEFT_STACK_SIZE", DEFAULT_STACK_SIZE as u64) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_size_default() {
        // WEFT_STACK_SIZE is not set in the test environment
        assert_eq!(stack_size(), DEFAULT_STACK_SIZE);
    }
}
