//! # weft-runtime
//!
//! User-space M:N fiber runtime. Many lightweight cooperative fibers are
//! multiplexed onto a small pool of OS threads, and blocking I/O primitives
//! are rewritten as cooperative suspension points so straight-line blocking
//! code runs as a non-blocking event loop.
//!
//! This crate provides:
//! - Stackful fibers with explicit resume/yield (architecture-specific assembly)
//! - A multi-threaded scheduler with a shared FIFO task queue and thread pinning
//! - A timer manager keyed by absolute deadlines
//! - An epoll-based I/O manager with a wake pipe
//! - A hooked-syscall facade (`register interest → yield → resume → retry`)

pub mod arch;
pub mod config;
pub mod fdreg;
pub mod fiber;
pub mod hook;
pub mod io;
pub mod net;
pub mod scheduler;
pub mod stack;
pub mod thread;
pub mod timer;
pub mod tls;

// Re-exports
pub use fdreg::{fd_registry, FdCtx, FdRegistry};
pub use fiber::Fiber;
pub use io::{Event, IoManager};
pub use scheduler::Scheduler;
pub use thread::{Semaphore, Thread};
pub use timer::{Timer, TimerManager};
pub use weft_core::{FiberId, FiberState, WeftError, WeftResult};

// Architecture detection
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use arch::x86_64 as current_arch;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use arch::aarch64 as current_arch;
    } else {
        compile_error!("Unsupported architecture");
    }
}

#[cfg(not(target_os = "linux"))]
compile_error!("weft-runtime requires Linux (epoll)");
