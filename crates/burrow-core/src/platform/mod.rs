//! # Platform-Specific Backends
//!
//! One [`ProcessBackend`](crate::backend::ProcessBackend) per operating system.
//!
//! - **Linux**: procfs (`/proc/<pid>/mem`, `maps`, `task`, `stat`) and job-control signals
//!   - See: [proc(5) man page](https://man7.org/linux/man-pages/man5/proc.5.html)
//! - **macOS**: Mach task ports (`task_for_pid`, `task_suspend`, `mach_vm_*`)
//!   - See: [Apple Mach Kernel Programming](https://developer.apple.com/library/archive/documentation/Darwin/Conceptual/KernelProgramming/Mach/Mach.html)
//! - **mock**: an in-memory target, compiled everywhere
//!
//! Only the module for the host OS is compiled; [`crate::backend::open`]
//! selects it.

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "macos")]
pub mod macos;

pub mod mock;
