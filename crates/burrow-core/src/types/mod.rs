//! # Types
//!
//! Platform-agnostic types shared by every layer.
//!
//! These keep the rest of the crate free of `pid_t`, `mach_port_t` and raw
//! `u64` addresses, whichever OS backend is underneath.

pub mod address;
pub mod process;

pub use address::Address;
pub use process::{PointerWidth, ProcessId, ProcessInfo, TargetOs, ThreadId};
