//! # weft - user-space M:N fiber runtime
//!
//! Many lightweight cooperative fibers multiplexed onto a small pool of OS
//! threads, with blocking I/O primitives rewritten as cooperative
//! suspension points: code written in a straight-line blocking style runs
//! as a non-blocking event loop.
//!
//! ## Quick Start
//!
//! ```ignore
//! use weft::{hook, net, IoManager};
//!
//! fn main() {
//!     let iom = IoManager::new(2, true, "echo");
//!
//!     iom.schedule(|| {
//!         let listener = net::Listener::bind(8080).unwrap();
//!         loop {
//!             let stream = listener.accept().unwrap();
//!             let iom = IoManager::current().unwrap();
//!             iom.schedule(move || {
//!                 let mut buf = [0u8; 4096];
//!                 loop {
//!                     let n = stream.read(&mut buf);
//!                     if n <= 0 {
//!                         break;
//!                     }
//!                     stream.write_all(&buf[..n as usize]);
//!                 }
//!             });
//!         }
//!     });
//!
//!     iom.stop();
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        User Code                           │
//! │        schedule(), hook::read(), hook::sleep(), net        │
//! └────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌────────────────────────────────────────────────────────────┐
//! │                       IoManager                            │
//! │     scheduler + timers + epoll set + wake pipe             │
//! └────────────────────────────────────────────────────────────┘
//!          │                   │                   │
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Worker   │      │  Worker   │      │  Worker   │
//!    │ + idle    │      │ + idle    │      │ + idle    │
//!    │   fiber   │      │   fiber   │      │   fiber   │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │                   │
//!          └───────────────────┴───────────────────┘
//!                              ▼
//!              Fibers: mmap'd stacks, asm context switch
//! ```

// Core types
pub use weft_core::{FiberId, FiberState, LogLevel, WeftError, WeftResult};

// Runtime surface
pub use weft_runtime::{
    fd_registry, Event, FdCtx, FdRegistry, Fiber, IoManager, Scheduler, Semaphore, Thread, Timer,
    TimerManager,
};

pub use weft_runtime::fiber::yield_now;
pub use weft_runtime::{hook, net};

// Logging macros and controls
pub use weft_core::kprint::{init as init_logging, set_flush_enabled, set_log_level};
pub use weft_core::{kdebug, kerror, kinfo, kprintln, ktrace, kwarn};
