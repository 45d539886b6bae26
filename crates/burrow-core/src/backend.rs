//! # Process Backends
//!
//! The OS capability set behind a [`Process`](crate::process::Process).
//!
//! A backend knows how to do exactly the things the operating system provides
//! and nothing more: stop and continue a process, copy bytes in and out of it,
//! and describe its mappings and threads. Nesting of suspends, fail-fast after
//! exit and typed reads all live above this trait, so every backend gets them
//! for free.
//!
//! ## Implementations
//!
//! | backend | where | how |
//! |---|---|---|
//! | [`LinuxProcess`](crate::platform::linux::LinuxProcess) | Linux | `/proc/<pid>/mem`, `SIGSTOP`/`SIGCONT` |
//! | `MacOSProcess` | macOS | Mach task port |
//! | [`MockProcess`](crate::platform::mock::MockProcess) | everywhere | in-memory simulation |
//!
//! [`open`] picks the implementation for the host at build time.

use std::path::PathBuf;

use crate::descriptor::fingerprint_file;
use crate::error::Result;
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
use crate::error::BurrowError;
use crate::memory_map::MemoryRegion;
use crate::types::{Address, PointerWidth, ProcessId, ProcessInfo, ThreadId};

/// What an operating system must provide to inspect a live process
///
/// Implementations are shared between threads behind a
/// [`Process`](crate::process::Process), which serializes `stop`/`cont` but
/// not memory I/O. `read_into`/`write_from` must therefore be safe to call
/// concurrently.
pub trait ProcessBackend: Send + Sync
{
    /// Target process ID
    fn pid(&self) -> ProcessId;

    /// Pointer size of the target
    fn pointer_width(&self) -> PointerWidth;

    /// `false` once the target has exited (or is a zombie).
    fn is_alive(&self) -> bool;

    /// Stop every thread of the target and wait until they are stopped.
    ///
    /// ## Errors
    ///
    /// `SuspendFailed`, `PermissionDenied`, or `ProcessExited`.
    fn stop(&self) -> Result<()>;

    /// Let the target run again.
    ///
    /// ## Errors
    ///
    /// `ResumeFailed` or `ProcessExited`.
    fn cont(&self) -> Result<()>;

    /// Fill `buffer` from target memory at `address`.
    ///
    /// Either the whole buffer is filled or an error is returned.
    fn read_into(&self, address: Address, buffer: &mut [u8]) -> Result<()>;

    /// Copy `data` into target memory at `address`.
    ///
    /// Either every byte is written or an error is returned.
    fn write_from(&self, address: Address, data: &[u8]) -> Result<()>;

    /// Current mappings, in any order.
    fn memory_regions(&self) -> Result<Vec<MemoryRegion>>;

    /// IDs of the target's threads.
    fn threads(&self) -> Result<Vec<ThreadId>>;

    /// Path of the target's main executable.
    fn executable(&self) -> Result<PathBuf>;

    /// Fingerprint of the executable, matched against descriptor tables.
    fn fingerprint(&self) -> Result<String>
    {
        fingerprint_file(&self.executable()?)
    }

    /// Give OS handles back. Called once, after the target has been resumed.
    fn release(&self) -> Result<()>
    {
        Ok(())
    }
}

/// Open the host OS backend for `pid`.
///
/// ## Errors
///
/// Attach-time errors from the platform backend, or `Unsupported` on hosts
/// without one.
pub fn open(pid: ProcessId) -> Result<Box<dyn ProcessBackend>>
{
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(crate::platform::linux::LinuxProcess::attach(pid)?))
    }

    #[cfg(target_os = "macos")]
    {
        Ok(Box::new(crate::platform::macos::MacOSProcess::attach(pid)?))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Err(BurrowError::Unsupported(format!("no process backend for this OS (pid {pid})")))
    }
}

/// Every process visible to the caller.
///
/// ## Errors
///
/// `Io` if the process list cannot be read, `Unsupported` on other hosts.
pub fn list_processes() -> Result<Vec<ProcessInfo>>
{
    #[cfg(target_os = "linux")]
    {
        crate::platform::linux::list_processes()
    }

    #[cfg(target_os = "macos")]
    {
        crate::platform::macos::list_processes()
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Err(BurrowError::Unsupported("process enumeration".to_string()))
    }
}

/// Processes whose short name or executable file name equals `name`.
///
/// Matching is exact; resolving zero or several matches is up to the caller
/// (see [`Context::attach`](crate::context::Context::attach)).
pub fn find_processes(name: &str) -> Result<Vec<ProcessInfo>>
{
    Ok(list_processes()?
        .into_iter()
        .filter(|info| matches_name(info, name))
        .collect())
}

pub(crate) fn matches_name(info: &ProcessInfo, name: &str) -> bool
{
    if info.name == name {
        return true;
    }
    info.executable
        .as_deref()
        .and_then(|path| path.file_name())
        .is_some_and(|file| file == name)
}

#[cfg(test)]
mod tests
{
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn name_matching_uses_comm_and_executable()
    {
        let info = ProcessInfo {
            pid: ProcessId(10),
            name: "Dwarf_Fortress".to_string(),
            executable: Some(PathBuf::from("/opt/df/libs/Dwarf_Fortress")),
        };
        assert!(matches_name(&info, "Dwarf_Fortress"));

        // comm is truncated to 15 bytes on Linux
        let truncated = ProcessInfo {
            pid: ProcessId(11),
            name: "dwarfort.exe-ve".to_string(),
            executable: Some(PathBuf::from("/opt/df/dwarfort.exe-very-long")),
        };
        assert!(matches_name(&truncated, "dwarfort.exe-very-long"));
        assert!(!matches_name(&truncated, "dwarfort"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn host_can_list_itself()
    {
        let me = ProcessId(std::process::id());
        let all = list_processes().unwrap();
        assert!(all.iter().any(|info| info.pid == me));
    }
}
