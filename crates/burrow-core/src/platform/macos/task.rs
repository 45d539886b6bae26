//! # macOS Task Backend
//!
//! A target process seen through its Mach task port.
//!
//! 1. `task_for_pid()` yields a send right to the task
//! 2. `task_suspend()`/`task_resume()` stop and continue every thread at once
//! 3. memory goes through [`memory`](super::memory)
//! 4. `mach_port_deallocate()` gives the right back on release
//!
//! `task_suspend` is synchronous: when it returns no thread of the task runs
//! user code, so no stop confirmation loop is needed here.
//!
//! ## Permissions
//!
//! `task_for_pid` needs root, or a binary signed with the
//! `com.apple.security.cs.debugger` entitlement, and the target must not be
//! hardened against debugging.

use std::mem;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use libc::{c_int, mach_msg_type_number_t, mach_port_t, thread_act_t, vm_address_t, vm_size_t};
use mach2::kern_return::KERN_SUCCESS;
use mach2::task::{task_resume, task_suspend, task_threads};
use mach2::traps::mach_task_self;
use tracing::{debug, warn};

use super::{ffi, memory};
use crate::backend::ProcessBackend;
use crate::error::{BurrowError, Result};
use crate::memory_map::MemoryRegion;
use crate::types::{Address, PointerWidth, ProcessId, ThreadId};

/// A process opened through its Mach task port
#[derive(Debug)]
pub struct MacOSProcess
{
    pid: ProcessId,
    task: mach_port_t,
    released: AtomicBool,
}

impl MacOSProcess
{
    /// Obtain the task port of `pid`.
    ///
    /// ## Errors
    ///
    /// - `ProcessNotFound`: no such process
    /// - `PermissionDenied`: the process exists but `task_for_pid` refused
    /// - `AttachFailed`: any other Mach error
    #[allow(unsafe_code)] // task_for_pid, kill
    pub fn attach(pid: ProcessId) -> Result<Self>
    {
        let raw_pid = c_int::try_from(pid.0).map_err(|_| BurrowError::ProcessNotFound(format!("pid {pid}")))?;
        let mut task: mach_port_t = 0;

        // SAFETY: `task` is a valid out-pointer.
        let result = unsafe { ffi::task_for_pid(mach_task_self(), raw_pid, &mut task) };
        if result != KERN_SUCCESS {
            // task_for_pid reports KERN_FAILURE for both "no such process" and "not allowed"
            // SAFETY: signal 0 only checks for existence.
            let exists = unsafe { libc::kill(raw_pid, 0) } == 0
                || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
            return Err(if !exists {
                BurrowError::ProcessNotFound(format!("pid {pid}"))
            } else if result == libc::KERN_FAILURE || result == libc::KERN_PROTECTION_FAILURE {
                BurrowError::PermissionDenied(format!(
                    "task_for_pid({pid}) failed with {result}; run as root or sign with the debugger entitlement"
                ))
            } else {
                BurrowError::AttachFailed(format!("task_for_pid({pid}) failed with {result}"))
            });
        }

        debug!(%pid, task, "obtained task port");
        Ok(Self {
            pid,
            task,
            released: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()>
    {
        if self.released.load(Ordering::Acquire) {
            return Err(BurrowError::NotAttached);
        }
        Ok(())
    }

    #[allow(unsafe_code)]
    fn deallocate_threads_array(threads: *mut thread_act_t, count: mach_msg_type_number_t)
    {
        if threads.is_null() || count == 0 {
            return;
        }
        let size = (count as usize).saturating_mul(mem::size_of::<thread_act_t>()) as vm_size_t;
        // SAFETY: the array was allocated by task_threads in our address space.
        unsafe {
            let _ = ffi::vm_deallocate(mach_task_self(), threads as vm_address_t, size);
        }
    }
}

impl ProcessBackend for MacOSProcess
{
    fn pid(&self) -> ProcessId
    {
        self.pid
    }

    fn pointer_width(&self) -> PointerWidth
    {
        // 32-bit processes no longer run on any supported macOS
        PointerWidth::Eight
    }

    #[allow(unsafe_code)]
    fn is_alive(&self) -> bool
    {
        let Ok(pid) = c_int::try_from(self.pid.0) else {
            return false;
        };
        // SAFETY: signal 0 only checks for existence.
        unsafe { libc::kill(pid, 0) == 0 }
    }

    #[allow(unsafe_code)]
    fn stop(&self) -> Result<()>
    {
        self.ensure_open()?;
        // SAFETY: task is a live send right until release().
        let result = unsafe { task_suspend(self.task) };
        if result != KERN_SUCCESS {
            if !self.is_alive() {
                return Err(BurrowError::ProcessExited(self.pid.0));
            }
            return Err(BurrowError::SuspendFailed(format!("task_suspend failed: {result}")));
        }
        Ok(())
    }

    #[allow(unsafe_code)]
    fn cont(&self) -> Result<()>
    {
        self.ensure_open()?;
        // SAFETY: task is a live send right until release().
        let result = unsafe { task_resume(self.task) };
        if result != KERN_SUCCESS {
            if !self.is_alive() {
                return Err(BurrowError::ProcessExited(self.pid.0));
            }
            return Err(BurrowError::ResumeFailed(format!("task_resume failed: {result}")));
        }
        Ok(())
    }

    fn read_into(&self, address: Address, buffer: &mut [u8]) -> Result<()>
    {
        self.ensure_open()?;
        if buffer.is_empty() {
            return Ok(());
        }
        memory::read_into(self.task, address, buffer).map_err(|e| {
            if self.is_alive() {
                e
            } else {
                BurrowError::ProcessExited(self.pid.0)
            }
        })
    }

    fn write_from(&self, address: Address, data: &[u8]) -> Result<()>
    {
        self.ensure_open()?;
        if data.is_empty() {
            return Ok(());
        }
        memory::write_from(self.task, address, data).map_err(|e| {
            if self.is_alive() {
                e
            } else {
                BurrowError::ProcessExited(self.pid.0)
            }
        })
    }

    fn memory_regions(&self) -> Result<Vec<MemoryRegion>>
    {
        self.ensure_open()?;
        memory::regions(self.task, self.pid)
    }

    #[allow(unsafe_code)]
    fn threads(&self) -> Result<Vec<ThreadId>>
    {
        self.ensure_open()?;
        let mut threads: *mut thread_act_t = std::ptr::null_mut();
        let mut count: mach_msg_type_number_t = 0;

        // SAFETY: both out-pointers are valid; the array is freed below.
        let result = unsafe { task_threads(self.task, &mut threads, &mut count) };
        if result != KERN_SUCCESS {
            return Err(if self.is_alive() {
                BurrowError::AttachFailed(format!("task_threads failed: {result}"))
            } else {
                BurrowError::ProcessExited(self.pid.0)
            });
        }

        // SAFETY: task_threads returned `count` valid entries.
        let ports = unsafe { std::slice::from_raw_parts(threads, count as usize) }.to_vec();
        Self::deallocate_threads_array(threads, count);

        let mut ids = Vec::with_capacity(ports.len());
        for port in ports {
            ids.push(ThreadId(u64::from(port)));
            // SAFETY: each port is a send right handed to us by task_threads.
            unsafe {
                let _ = ffi::mach_port_deallocate(mach_task_self(), port);
            }
        }
        Ok(ids)
    }

    fn executable(&self) -> Result<PathBuf>
    {
        let pid = c_int::try_from(self.pid.0).map_err(|_| BurrowError::ProcessNotFound(format!("pid {}", self.pid)))?;
        libproc::libproc::proc_pid::pidpath(pid)
            .map(PathBuf::from)
            .map_err(|e| BurrowError::Io(std::io::Error::other(format!("pidpath({pid}): {e}"))))
    }

    #[allow(unsafe_code)]
    fn release(&self) -> Result<()>
    {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // SAFETY: the right came from task_for_pid and is released exactly once.
        let result = unsafe { ffi::mach_port_deallocate(mach_task_self(), self.task) };
        if result != KERN_SUCCESS {
            warn!(pid = %self.pid, result, "mach_port_deallocate failed");
        }
        Ok(())
    }
}
