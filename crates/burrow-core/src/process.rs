//! # Process Handle
//!
//! [`Process`] owns the OS-level attachment to one target and provides the raw
//! `(address, length, buffer)` boundary everything else is built on.
//!
//! ## Lifecycle
//!
//! ```text
//! attach ──> Running <──> Suspended(N) ──detach──> Detached
//!                 │                          ▲
//!                 └───────────detach─────────┘
//! ```
//!
//! - A handle starts out **running**.
//! - [`Process::suspend`]/[`Process::resume`] nest (see
//!   [`coordination`](crate::coordination)); [`Process::suspend_scope`] is
//!   the intended way to use them.
//! - [`Process::detach`] always leaves the target running before giving the
//!   OS handles back. It is idempotent, and `Drop` calls it.
//!
//! ## Failure semantics
//!
//! Read and write failures are returned, never replaced with zeroes. Once the
//! backend reports the target gone, the handle remembers it and every later
//! call fails with `ProcessExited` without touching the OS.
//!
//! ## Threading
//!
//! `Process` is `Send + Sync`; share it as `Arc<Process>`. Suspend and resume
//! are serialized by an internal lock that is held across the OS call. Memory
//! I/O does not take that lock.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace, warn};

use crate::backend::{self, ProcessBackend};
use crate::context::Registration;
use crate::coordination::{RunState, SuspendCounter, SuspendGuard, Suspendable, Transition};
use crate::descriptor::VersionInfo;
use crate::error::{BurrowError, Result};
use crate::memory_map::{MemoryMap, MemoryRegion};
use crate::overlay::{check_buffer, MemoryAccess};
use crate::types::{Address, PointerWidth, ProcessId, ThreadId};

/// Mutable state guarded by the suspend lock
#[derive(Debug, Default)]
struct HandleState
{
    counter: SuspendCounter,
    registration: Option<Registration>,
}

/// An attached target process
pub struct Process
{
    backend: Box<dyn ProcessBackend>,
    pid: ProcessId,
    width: PointerWidth,
    attached: AtomicBool,
    exited: AtomicBool,
    state: Mutex<HandleState>,
    fingerprint: Option<String>,
    descriptor: Option<VersionInfo>,
}

impl Process
{
    /// Open `pid` with the host backend, without version identification.
    ///
    /// Most callers go through [`Context::attach`](crate::context::Context::attach),
    /// which also picks the matching descriptor.
    pub fn open(pid: ProcessId) -> Result<Self>
    {
        Ok(Self::from_backend(backend::open(pid)?))
    }

    /// Wrap an already opened backend.
    pub fn from_backend(backend: Box<dyn ProcessBackend>) -> Self
    {
        let pid = backend.pid();
        let width = backend.pointer_width();
        debug!(%pid, %width, "process handle created");
        Self {
            backend,
            pid,
            width,
            attached: AtomicBool::new(true),
            exited: AtomicBool::new(false),
            state: Mutex::new(HandleState::default()),
            fingerprint: None,
            descriptor: None,
        }
    }

    pub(crate) fn with_identity(mut self, fingerprint: Option<String>, descriptor: Option<VersionInfo>) -> Self
    {
        self.fingerprint = fingerprint;
        self.descriptor = descriptor;
        self
    }

    pub(crate) fn with_registration(self, registration: Registration) -> Self
    {
        self.lock_state().registration = Some(registration);
        self
    }

    /// Use `info` as this target's descriptor, replacing any identified one.
    pub fn set_descriptor(&mut self, info: VersionInfo)
    {
        self.descriptor = Some(info);
    }

    /// Target process ID
    pub fn pid(&self) -> ProcessId
    {
        self.pid
    }

    /// Pointer size of the target
    pub fn pointer_width(&self) -> PointerWidth
    {
        self.width
    }

    /// Executable fingerprint computed at attach time, if any.
    pub fn fingerprint(&self) -> Option<&str>
    {
        self.fingerprint.as_deref()
    }

    /// The version descriptor of this target.
    ///
    /// ## Errors
    ///
    /// `UnknownVersion` when no descriptor matched the executable.
    pub fn descriptor(&self) -> Result<&VersionInfo>
    {
        self.descriptor.as_ref().ok_or_else(|| {
            BurrowError::UnknownVersion(self.fingerprint.clone().unwrap_or_else(|| "unknown".to_string()))
        })
    }

    /// `false` after [`Process::detach`].
    pub fn is_attached(&self) -> bool
    {
        self.attached.load(Ordering::Acquire)
    }

    /// `false` once the target has exited.
    pub fn is_alive(&self) -> bool
    {
        if self.exited.load(Ordering::Acquire) {
            return false;
        }
        let alive = self.backend.is_alive();
        if !alive {
            self.mark_exited();
        }
        alive
    }

    /// Current run state as seen by this handle.
    pub fn run_state(&self) -> RunState
    {
        self.lock_state().counter.state()
    }

    /// Add one suspend request; the first one stops the target.
    ///
    /// ## Errors
    ///
    /// `NotAttached`, `ProcessExited`, or the backend's `SuspendFailed`. On
    /// error the depth is unchanged.
    pub fn suspend(&self) -> Result<()>
    {
        let mut state = self.lock_state();
        self.ensure_live()?;
        let transition = state.counter.plan_suspend();
        if transition == Transition::Stop {
            self.backend.stop().map_err(|e| self.observe(e))?;
            debug!(pid = %self.pid, "target stopped");
        }
        state.counter.commit(transition);
        trace!(pid = %self.pid, depth = state.counter.depth(), "suspend");
        Ok(())
    }

    /// Remove one suspend request; the last one lets the target run.
    ///
    /// ## Errors
    ///
    /// `NotSuspended` if nothing is outstanding, otherwise as
    /// [`Process::suspend`].
    pub fn resume(&self) -> Result<()>
    {
        let mut state = self.lock_state();
        self.ensure_live()?;
        let transition = state.counter.plan_resume()?;
        if transition == Transition::Continue {
            self.backend.cont().map_err(|e| self.observe(e))?;
            debug!(pid = %self.pid, "target continued");
        }
        state.counter.commit(transition);
        trace!(pid = %self.pid, depth = state.counter.depth(), "resume");
        Ok(())
    }

    /// Drop every outstanding suspend request and let the target run.
    ///
    /// Recovery path for a caller that leaked a suspension. Guards still alive
    /// afterwards will see `NotSuspended` when they are released.
    pub fn force_resume(&self) -> Result<()>
    {
        let mut state = self.lock_state();
        self.ensure_live()?;
        let depth = state.counter.depth();
        if depth > 0 {
            warn!(pid = %self.pid, depth, "forcing resume");
            self.backend.cont().map_err(|e| self.observe(e))?;
        }
        state.counter.force();
        Ok(())
    }

    /// Suspend the target until the returned guard is dropped.
    ///
    /// ```rust
    /// use burrow_core::memory_map::Permissions;
    /// use burrow_core::overlay::TypedMemory;
    /// use burrow_core::platform::mock::MockProcess;
    /// use burrow_core::process::Process;
    /// use burrow_core::types::Address;
    ///
    /// let mock = MockProcess::builder(7)
    ///     .region(0x1000, 0x1000, Permissions::READ_WRITE, None)
    ///     .build();
    /// let process = Process::from_backend(Box::new(mock.clone()));
    /// {
    ///     let _scope = process.suspend_scope()?;
    ///     assert!(mock.is_stopped());
    ///     process.write_u32(Address::new(0x1000), 7)?;
    /// }
    /// assert!(!mock.is_stopped());
    /// # Ok::<(), burrow_core::BurrowError>(())
    /// ```
    pub fn suspend_scope(&self) -> Result<SuspendGuard<'_>>
    {
        SuspendGuard::new(self)
    }

    /// Resume if needed and release the OS handles.
    ///
    /// Returns `Ok(false)` if the handle was already detached.
    ///
    /// ## Errors
    ///
    /// A failed resume of a live target, or a failed release. The handle is
    /// detached either way.
    pub fn detach(&self) -> Result<bool>
    {
        let mut state = self.lock_state();
        if !self.attached.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        let resumed = if state.counter.force() && !self.exited.load(Ordering::Acquire) {
            self.backend.cont()
        } else {
            Ok(())
        };
        let released = self.backend.release();
        state.registration = None;
        debug!(pid = %self.pid, "detached");

        match resumed {
            Err(e) if !e.is_process_gone() => return Err(e),
            _ => {}
        }
        released?;
        Ok(true)
    }

    /// Copy `length` bytes at `address` into `buffer`.
    pub fn read(&self, address: Address, length: usize, buffer: &mut [u8]) -> Result<()>
    {
        check_buffer(length, buffer.len())?;
        self.ensure_live()?;
        trace!(pid = %self.pid, %address, length, "read");
        self.backend
            .read_into(address, &mut buffer[..length])
            .map_err(|e| self.observe(e))
    }

    /// Copy `length` bytes from `buffer` to `address`.
    pub fn write(&self, address: Address, length: usize, buffer: &[u8]) -> Result<()>
    {
        check_buffer(length, buffer.len())?;
        self.ensure_live()?;
        trace!(pid = %self.pid, %address, length, "write");
        self.backend
            .write_from(address, &buffer[..length])
            .map_err(|e| self.observe(e))
    }

    /// Read `length` bytes into a fresh vector.
    pub fn read_bytes(&self, address: Address, length: usize) -> Result<Vec<u8>>
    {
        let mut buffer = vec![0u8; length];
        self.read(address, length, &mut buffer)?;
        Ok(buffer)
    }

    /// Current mappings in address order.
    pub fn memory_regions(&self) -> Result<Vec<MemoryRegion>>
    {
        Ok(self.memory_map()?.regions().to_vec())
    }

    /// Current mappings as a searchable snapshot.
    pub fn memory_map(&self) -> Result<MemoryMap>
    {
        self.ensure_live()?;
        let regions = self.backend.memory_regions().map_err(|e| self.observe(e))?;
        Ok(MemoryMap::new(regions))
    }

    /// IDs of the target's threads.
    pub fn threads(&self) -> Result<Vec<ThreadId>>
    {
        self.ensure_live()?;
        self.backend.threads().map_err(|e| self.observe(e))
    }

    /// Path of the target's main executable.
    pub fn executable(&self) -> Result<PathBuf>
    {
        self.ensure_live()?;
        self.backend.executable().map_err(|e| self.observe(e))
    }

    /// Lowest address the main executable is mapped at.
    ///
    /// `None` if no mapping carries the executable's path (stripped maps,
    /// simulated targets without an image).
    pub fn image_base(&self) -> Result<Option<Address>>
    {
        let executable = self.executable()?;
        let path = executable.to_string_lossy();
        let map = self.memory_map()?;
        Ok(map.named(&path).map(|region| region.start).min())
    }

    fn lock_state(&self) -> MutexGuard<'_, HandleState>
    {
        // the counter stays consistent across a panic in a caller; keep using it
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_live(&self) -> Result<()>
    {
        if !self.attached.load(Ordering::Acquire) {
            return Err(BurrowError::NotAttached);
        }
        if self.exited.load(Ordering::Acquire) {
            return Err(BurrowError::ProcessExited(self.pid.0));
        }
        Ok(())
    }

    fn mark_exited(&self)
    {
        if !self.exited.swap(true, Ordering::AcqRel) {
            debug!(pid = %self.pid, "target exited");
        }
    }

    fn observe(&self, err: BurrowError) -> BurrowError
    {
        if err.is_process_gone() {
            self.mark_exited();
        }
        err
    }
}

impl std::fmt::Debug for Process
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("width", &self.width)
            .field("attached", &self.is_attached())
            .field("exited", &self.exited.load(Ordering::Acquire))
            .field("version", &self.descriptor.as_ref().map(VersionInfo::version))
            .finish_non_exhaustive()
    }
}

impl MemoryAccess for Process
{
    fn read(&self, address: Address, length: usize, buffer: &mut [u8]) -> Result<()>
    {
        Process::read(self, address, length, buffer)
    }

    fn write(&self, address: Address, length: usize, buffer: &[u8]) -> Result<()>
    {
        Process::write(self, address, length, buffer)
    }

    fn pointer_width(&self) -> PointerWidth
    {
        self.width
    }
}

impl Suspendable for Process
{
    fn suspend(&self) -> Result<()>
    {
        Process::suspend(self)
    }

    fn resume(&self) -> Result<()>
    {
        Process::resume(self)
    }
}

impl Drop for Process
{
    fn drop(&mut self)
    {
        if let Err(e) = self.detach() {
            warn!(pid = %self.pid, error = %e, "detach on drop failed");
        }
    }
}

#[cfg(test)]
mod tests
{
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::memory_map::Permissions;
    use crate::overlay::TypedMemory;
    use crate::platform::mock::MockProcess;

    fn target() -> (MockProcess, Process)
    {
        let mock = MockProcess::builder(42)
            .region(0x1000, 0x1000, Permissions::READ_WRITE, Some("[heap]"))
            .region(0x40_0000, 0x1000, Permissions::READ_EXECUTE, Some("/mock/target"))
            .region(0x40_1000, 0x1000, Permissions::READ_ONLY, Some("/mock/target"))
            .thread(43)
            .build();
        let process = Process::from_backend(Box::new(mock.clone()));
        (mock, process)
    }

    #[test]
    fn os_stop_follows_depth()
    {
        let (mock, process) = target();
        process.suspend().unwrap();
        process.suspend().unwrap();
        process.resume().unwrap();
        assert!(mock.is_stopped());
        assert_eq!(process.run_state(), RunState::Suspended(1));

        process.resume().unwrap();
        assert!(!mock.is_stopped());
        assert!(matches!(process.resume(), Err(BurrowError::NotSuspended)));
        assert_eq!(mock.stop_calls(), 1);
        assert_eq!(mock.cont_calls(), 1);
    }

    #[test]
    fn failed_stop_leaves_depth_alone()
    {
        let (mock, process) = target();
        mock.fail_stops(true);
        assert!(process.suspend().is_err());
        assert_eq!(process.run_state(), RunState::Running);

        mock.fail_stops(false);
        process.suspend().unwrap();
        assert_eq!(process.run_state(), RunState::Suspended(1));
    }

    #[test]
    fn force_resume_recovers_leaked_suspends()
    {
        let (mock, process) = target();
        std::mem::forget(process.suspend_scope().unwrap());
        std::mem::forget(process.suspend_scope().unwrap());
        assert!(mock.is_stopped());

        process.force_resume().unwrap();
        assert!(!mock.is_stopped());
        assert_eq!(process.run_state(), RunState::Running);
        // nothing outstanding: a second call is a no-op
        process.force_resume().unwrap();
        assert_eq!(mock.cont_calls(), 1);
    }

    #[test]
    fn detach_resumes_and_is_idempotent()
    {
        let (mock, process) = target();
        process.suspend().unwrap();
        assert!(process.detach().unwrap());
        assert!(!mock.is_stopped());
        assert!(mock.is_released());

        assert!(!process.detach().unwrap());
        assert!(matches!(process.read_u8(Address::new(0x1000)), Err(BurrowError::NotAttached)));
        assert!(matches!(process.suspend(), Err(BurrowError::NotAttached)));
    }

    #[test]
    fn drop_detaches()
    {
        let (mock, process) = target();
        process.suspend().unwrap();
        drop(process);
        assert!(!mock.is_stopped());
        assert!(mock.is_released());
    }

    #[test]
    fn exit_is_sticky()
    {
        let (mock, process) = target();
        process.write_u32(Address::new(0x1000), 1).unwrap();
        mock.kill();

        assert!(matches!(process.read_u32(Address::new(0x1000)), Err(BurrowError::ProcessExited(42))));
        assert!(!process.is_alive());
        assert!(matches!(process.suspend(), Err(BurrowError::ProcessExited(42))));
        // detaching a dead target still succeeds
        assert!(process.detach().unwrap());
    }

    #[test]
    fn io_errors_are_typed()
    {
        let (_mock, process) = target();
        assert!(matches!(
            process.read_u32(Address::new(0x9000)),
            Err(BurrowError::MemoryRead { .. })
        ));
        assert!(matches!(
            process.write_u32(Address::new(0x40_1000), 1),
            Err(BurrowError::MemoryWrite { .. })
        ));
        let mut small = [0u8; 2];
        assert!(matches!(
            process.read(Address::new(0x1000), 4, &mut small),
            Err(BurrowError::InvalidArgument(_))
        ));
    }

    #[test]
    fn queries_delegate_to_backend()
    {
        let (_mock, process) = target();
        assert_eq!(process.threads().unwrap(), vec![ThreadId(42), ThreadId(43)]);
        assert_eq!(process.executable().unwrap(), PathBuf::from("/mock/target"));
        assert_eq!(process.image_base().unwrap(), Some(Address::new(0x40_0000)));
        let map = process.memory_map().unwrap();
        assert_eq!(map.len(), 3);
        assert!(map.is_writable(Address::new(0x1000), 0x1000));
        assert!(matches!(process.descriptor(), Err(BurrowError::UnknownVersion(_))));
    }

    #[test]
    fn concurrent_scopes_hold_the_union()
    {
        let (mock, process) = target();
        let process = Arc::new(process);
        let outer = process.suspend_scope().unwrap();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let process = Arc::clone(&process);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _scope = process.suspend_scope().unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        // the outer scope was never interrupted
        assert!(mock.is_stopped());
        assert_eq!(mock.stop_calls(), 1);
        outer.release().unwrap();
        assert!(!mock.is_stopped());
    }
}
