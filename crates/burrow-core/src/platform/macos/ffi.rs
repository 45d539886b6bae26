//! # Mach API FFI Declarations
//!
//! Mach calls that the `mach2` crate does not bind. `task_for_pid` is a
//! restricted call (it needs root or the debugging entitlement), which is why
//! the general-purpose bindings leave it out.
//!
//! Everything here is wrapped by the safe functions in
//! [`task`](super::task) and [`memory`](super::memory).

// Doc comments on foreign items are for readers of this file; rustdoc skips them.
#![allow(unused_doc_comments)]

use libc::{c_int, kern_return_t, mach_port_t, vm_address_t, vm_map_t, vm_size_t};

#[link(name = "c", kind = "dylib")]
extern "C" {
    /// Get the task port of `pid`.
    ///
    /// Returns `KERN_SUCCESS` on success. Permission problems usually surface as
    /// `KERN_FAILURE` rather than `KERN_PROTECTION_FAILURE`.
    ///
    /// See: XNU `osfmk/kern/task.c`
    pub fn task_for_pid(target_task: mach_port_t, pid: c_int, task: *mut mach_port_t) -> kern_return_t;

    /// Release a send right obtained from `task_for_pid` or `task_threads`.
    ///
    /// See: [mach_port_deallocate](https://developer.apple.com/documentation/kernel/1578777-mach_port_deallocate/)
    pub fn mach_port_deallocate(target_task: mach_port_t, name: mach_port_t) -> kern_return_t;

    /// Free out-of-line memory returned by the kernel (the `task_threads` array).
    ///
    /// See: [vm_deallocate](https://developer.apple.com/documentation/kernel/1585284-vm_deallocate/)
    pub fn vm_deallocate(target_task: vm_map_t, address: vm_address_t, size: vm_size_t) -> kern_return_t;
}
