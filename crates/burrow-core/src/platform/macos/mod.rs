//! # macOS Backend
//!
//! Process access through Mach task ports.
//!
//! - `task_for_pid()`: get a port to the process (declared in [`ffi`])
//! - `task_suspend()`/`task_resume()`: stop and continue (from `mach2`)
//! - `mach_vm_*`: memory access and region walk (from `mach2`)
//! - `libproc`: process list, executable paths and mapped file names
//!
//! ## References
//!
//! - [Apple Mach Kernel Programming](https://developer.apple.com/library/archive/documentation/Darwin/Conceptual/KernelProgramming/Mach/Mach.html)

pub mod ffi;
pub mod memory;
pub mod task;

use std::path::PathBuf;

use libproc::libproc::proc_pid;
use libproc::processes::{pids_by_type, ProcFilter};

use crate::error::Result;
use crate::types::{ProcessId, ProcessInfo};
pub use task::MacOSProcess;

/// Every process visible to the caller.
pub fn list_processes() -> Result<Vec<ProcessInfo>>
{
    let mut processes = Vec::new();
    for pid in pids_by_type(ProcFilter::All)? {
        let Ok(raw) = i32::try_from(pid) else { continue };
        if raw == 0 {
            continue;
        }
        // processes can vanish while we look
        let Ok(name) = proc_pid::name(raw) else { continue };
        processes.push(ProcessInfo {
            pid: ProcessId(pid),
            name,
            executable: proc_pid::pidpath(raw).ok().map(PathBuf::from),
        });
    }
    processes.sort_by_key(|info| info.pid);
    Ok(processes)
}
