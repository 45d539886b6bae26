//! # Simulated Target
//!
//! An in-memory [`ProcessBackend`] for tests and for tools that want to run
//! their overlay code against a captured memory image.
//!
//! A [`MockProcess`] is a set of byte segments with permissions, a thread
//! list, a pointer width and an executable identity. It keeps count of
//! `stop`/`cont` calls so suspend nesting can be asserted, and can be
//! "killed" to exercise the exited-process paths.
//!
//! Clones share state: hand one clone to a [`Process`](crate::process::Process)
//! and keep another to inspect what the process did.
//!
//! ```rust
//! use burrow_core::memory_map::Permissions;
//! use burrow_core::platform::mock::MockProcess;
//!
//! let target = MockProcess::builder(42)
//!     .region(0x1000, 0x1000, Permissions::READ_WRITE, Some("[heap]"))
//!     .thread(43)
//!     .build();
//! assert_eq!(target.stop_calls(), 0);
//! ```

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::backend::ProcessBackend;
use crate::descriptor::fingerprint_bytes;
use crate::error::{BurrowError, Result};
use crate::memory_map::{MemoryRegion, Permissions};
use crate::overlay::{check_buffer, MemoryAccess};
use crate::types::{Address, PointerWidth, ProcessId, ThreadId};

#[derive(Debug, Clone)]
struct Segment
{
    start: u64,
    bytes: Vec<u8>,
    permissions: Permissions,
    name: Option<String>,
}

impl Segment
{
    /// One past the last byte; a segment touching the top of the address
    /// space ends at `u64::MAX`.
    fn end(&self) -> u64
    {
        self.start.saturating_add(self.bytes.len() as u64)
    }

    /// Byte range of `[address, address + len)` inside this segment.
    fn span(&self, address: u64, len: usize) -> Option<std::ops::Range<usize>>
    {
        let end = address.checked_add(len as u64)?;
        if address < self.start || end > self.end() {
            return None;
        }
        let offset = usize::try_from(address - self.start).ok()?;
        Some(offset..offset + len)
    }
}

#[derive(Debug)]
struct MockState
{
    segments: Vec<Segment>,
    threads: Vec<ThreadId>,
    stopped: bool,
    stop_calls: usize,
    cont_calls: usize,
    alive: bool,
    released: bool,
    fail_stop: bool,
}

/// In-memory simulated target process
#[derive(Debug, Clone)]
pub struct MockProcess
{
    pid: ProcessId,
    width: PointerWidth,
    executable: PathBuf,
    fingerprint: String,
    state: Arc<Mutex<MockState>>,
}

/// Builder for [`MockProcess`]
#[derive(Debug)]
pub struct MockBuilder
{
    pid: ProcessId,
    width: PointerWidth,
    executable: PathBuf,
    fingerprint: Option<String>,
    segments: Vec<Segment>,
    threads: Vec<ThreadId>,
}

impl MockBuilder
{
    /// Target pointer width (default: 64-bit).
    #[must_use]
    pub fn pointer_width(mut self, width: PointerWidth) -> Self
    {
        self.width = width;
        self
    }

    /// Add a zero-filled region of `size` bytes at `start`.
    #[must_use]
    pub fn region(self, start: u64, size: usize, permissions: Permissions, name: Option<&str>) -> Self
    {
        self.region_with_bytes(start, vec![0; size], permissions, name)
    }

    /// Add a region with initial contents.
    #[must_use]
    pub fn region_with_bytes(mut self, start: u64, bytes: Vec<u8>, permissions: Permissions, name: Option<&str>) -> Self
    {
        self.segments.push(Segment {
            start,
            bytes,
            permissions,
            name: name.map(str::to_string),
        });
        self
    }

    /// Add a thread (the main thread, `tid == pid`, is always present).
    #[must_use]
    pub fn thread(mut self, tid: u64) -> Self
    {
        self.threads.push(ThreadId(tid));
        self
    }

    /// Path reported as the executable.
    #[must_use]
    pub fn executable(mut self, path: impl Into<PathBuf>) -> Self
    {
        self.executable = path.into();
        self
    }

    /// Fingerprint reported for the executable (default: hash of its path).
    #[must_use]
    pub fn fingerprint(mut self, fingerprint: &str) -> Self
    {
        self.fingerprint = Some(fingerprint.to_ascii_lowercase());
        self
    }

    /// Finish building.
    pub fn build(self) -> MockProcess
    {
        let fingerprint = self
            .fingerprint
            .unwrap_or_else(|| fingerprint_bytes(self.executable.to_string_lossy().as_bytes()));
        let mut segments = self.segments;
        segments.sort_by_key(|segment| segment.start);

        let mut threads = vec![ThreadId(u64::from(self.pid.0))];
        threads.extend(self.threads);

        MockProcess {
            pid: self.pid,
            width: self.width,
            executable: self.executable,
            fingerprint,
            state: Arc::new(Mutex::new(MockState {
                segments,
                threads,
                stopped: false,
                stop_calls: 0,
                cont_calls: 0,
                alive: true,
                released: false,
                fail_stop: false,
            })),
        }
    }
}

impl MockProcess
{
    /// Start building a target with process ID `pid`.
    pub fn builder(pid: u32) -> MockBuilder
    {
        MockBuilder {
            pid: ProcessId(pid),
            width: PointerWidth::Eight,
            executable: PathBuf::from("/mock/target"),
            fingerprint: None,
            segments: Vec::new(),
            threads: Vec::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState>
    {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `true` while stopped.
    pub fn is_stopped(&self) -> bool
    {
        self.state().stopped
    }

    /// Number of real stops performed.
    pub fn stop_calls(&self) -> usize
    {
        self.state().stop_calls
    }

    /// Number of real continues performed.
    pub fn cont_calls(&self) -> usize
    {
        self.state().cont_calls
    }

    /// `true` once the backend has been released.
    pub fn is_released(&self) -> bool
    {
        self.state().released
    }

    /// Simulate the target exiting.
    pub fn kill(&self)
    {
        self.state().alive = false;
    }

    /// Make the next stops fail with `SuspendFailed`.
    pub fn fail_stops(&self, fail: bool)
    {
        self.state().fail_stop = fail;
    }

    /// Read bytes ignoring permissions and liveness.
    ///
    /// ## Errors
    ///
    /// `MemoryRead` if the range is not inside one region.
    pub fn peek(&self, address: Address, len: usize) -> Result<Vec<u8>>
    {
        let state = self.state();
        let (segment, span) = locate(&state.segments, address, len).ok_or_else(|| unmapped_read(address, len))?;
        Ok(segment.bytes[span].to_vec())
    }

    /// Write bytes ignoring permissions and liveness.
    ///
    /// ## Errors
    ///
    /// `MemoryWrite` if the range is not inside one region.
    pub fn poke(&self, address: Address, bytes: &[u8]) -> Result<()>
    {
        let mut state = self.state();
        let index = locate_index(&state.segments, address, bytes.len()).ok_or_else(|| unmapped_write(address, bytes.len()))?;
        let segment = &mut state.segments[index];
        if let Some(span) = segment.span(address.value(), bytes.len()) {
            segment.bytes[span].copy_from_slice(bytes);
        }
        Ok(())
    }
}

fn locate_index(segments: &[Segment], address: Address, len: usize) -> Option<usize>
{
    segments
        .iter()
        .position(|segment| segment.span(address.value(), len).is_some())
}

fn locate(segments: &[Segment], address: Address, len: usize) -> Option<(&Segment, std::ops::Range<usize>)>
{
    segments
        .iter()
        .find_map(|segment| segment.span(address.value(), len).map(|span| (segment, span)))
}

fn unmapped_read(address: Address, length: usize) -> BurrowError
{
    BurrowError::MemoryRead {
        address,
        length,
        details: "range is not mapped".to_string(),
    }
}

fn unmapped_write(address: Address, length: usize) -> BurrowError
{
    BurrowError::MemoryWrite {
        address,
        length,
        details: "range is not mapped".to_string(),
    }
}

impl ProcessBackend for MockProcess
{
    fn pid(&self) -> ProcessId
    {
        self.pid
    }

    fn pointer_width(&self) -> PointerWidth
    {
        self.width
    }

    fn is_alive(&self) -> bool
    {
        self.state().alive
    }

    fn stop(&self) -> Result<()>
    {
        let mut state = self.state();
        if !state.alive {
            return Err(BurrowError::ProcessExited(self.pid.0));
        }
        if state.fail_stop {
            return Err(BurrowError::SuspendFailed("simulated stop failure".to_string()));
        }
        state.stop_calls += 1;
        state.stopped = true;
        Ok(())
    }

    fn cont(&self) -> Result<()>
    {
        let mut state = self.state();
        if !state.alive {
            return Err(BurrowError::ProcessExited(self.pid.0));
        }
        state.cont_calls += 1;
        state.stopped = false;
        Ok(())
    }

    fn read_into(&self, address: Address, buffer: &mut [u8]) -> Result<()>
    {
        let state = self.state();
        if !state.alive {
            return Err(BurrowError::ProcessExited(self.pid.0));
        }
        let (segment, span) =
            locate(&state.segments, address, buffer.len()).ok_or_else(|| unmapped_read(address, buffer.len()))?;
        if !segment.permissions.read {
            return Err(BurrowError::MemoryRead {
                address,
                length: buffer.len(),
                details: "region is not readable".to_string(),
            });
        }
        buffer.copy_from_slice(&segment.bytes[span]);
        Ok(())
    }

    fn write_from(&self, address: Address, data: &[u8]) -> Result<()>
    {
        let mut state = self.state();
        if !state.alive {
            return Err(BurrowError::ProcessExited(self.pid.0));
        }
        let index = locate_index(&state.segments, address, data.len()).ok_or_else(|| unmapped_write(address, data.len()))?;
        let segment = &mut state.segments[index];
        if !segment.permissions.write {
            return Err(BurrowError::MemoryWrite {
                address,
                length: data.len(),
                details: "region is not writable".to_string(),
            });
        }
        if let Some(span) = segment.span(address.value(), data.len()) {
            segment.bytes[span].copy_from_slice(data);
        }
        Ok(())
    }

    fn memory_regions(&self) -> Result<Vec<MemoryRegion>>
    {
        let state = self.state();
        if !state.alive {
            return Err(BurrowError::ProcessExited(self.pid.0));
        }
        Ok(state
            .segments
            .iter()
            .map(|segment| {
                MemoryRegion::new(
                    Address::new(segment.start),
                    Address::new(segment.end()),
                    segment.permissions,
                    segment.name.clone(),
                )
            })
            .collect())
    }

    fn threads(&self) -> Result<Vec<ThreadId>>
    {
        let state = self.state();
        if !state.alive {
            return Err(BurrowError::ProcessExited(self.pid.0));
        }
        Ok(state.threads.clone())
    }

    fn executable(&self) -> Result<PathBuf>
    {
        Ok(self.executable.clone())
    }

    fn fingerprint(&self) -> Result<String>
    {
        Ok(self.fingerprint.clone())
    }

    fn release(&self) -> Result<()>
    {
        self.state().released = true;
        Ok(())
    }
}

impl MemoryAccess for MockProcess
{
    fn read(&self, address: Address, length: usize, buffer: &mut [u8]) -> Result<()>
    {
        check_buffer(length, buffer.len())?;
        self.read_into(address, &mut buffer[..length])
    }

    fn write(&self, address: Address, length: usize, buffer: &[u8]) -> Result<()>
    {
        check_buffer(length, buffer.len())?;
        self.write_from(address, &buffer[..length])
    }

    fn pointer_width(&self) -> PointerWidth
    {
        self.width
    }
}
