//! Architecture-specific context switching
//!
//! Each architecture exposes the same three items:
//!
//! - `Context`: the callee-saved register block of a suspended fiber
//! - `init_context`: prime a fresh context so the first switch lands in the
//!   fiber trampoline with the entry function and its argument staged
//! - `context_switch`: save the current callee-saved state into one context
//!   and load another, transferring control

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "x86_64")]
pub mod x86_64;
