//! # weft-core
//!
//! Platform-independent primitives shared by the weft fiber runtime:
//!
//! - Fiber identifiers and lifecycle states
//! - The runtime error enum
//! - Kernel-style leveled logging (`kprint`)
//! - Environment variable helpers

pub mod env;
pub mod error;
pub mod id;
pub mod kprint;
pub mod state;

pub use error::{WeftError, WeftResult};
pub use id::FiberId;
pub use kprint::LogLevel;
pub use state::FiberState;
