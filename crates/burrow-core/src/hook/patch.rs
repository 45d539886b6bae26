//! # Patching Our Own Address Space
//!
//! Used when burrow runs inside the target. Virtual tables normally live in
//! read-only pages (`.rodata`, `__DATA_CONST`), so a plain store would fault.
//! [`patch_memory`] widens the page protection around the write and restores
//! the previous protection afterwards.
//!
//! The current protection is taken from the same region walk the remote
//! backends use (`/proc/self/maps` on Linux, `mach_vm_region_recurse` on
//! macOS).
//!
//! These helpers patch data. Patching instructions also needs an instruction
//! cache flush on some architectures, which is not done here.

use std::ops::Range;
use std::sync::{Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;
use tracing::{debug, trace, warn};

use crate::error::{BurrowError, Result};
use crate::memory_map::{MemoryMap, MemoryRegion, Permissions};
use crate::overlay::{check_buffer, MemoryAccess};
use crate::types::{Address, PointerWidth};

/// Host page size
#[allow(unsafe_code)]
pub static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).ok().filter(|size| size.is_power_of_two()).unwrap_or(4096)
});

/// Mappings of the current process.
pub fn own_regions() -> Result<Vec<MemoryRegion>>
{
    #[cfg(target_os = "linux")]
    {
        let text = std::fs::read_to_string("/proc/self/maps")?;
        Ok(crate::memory_map::parse_proc_maps(&text))
    }

    #[cfg(target_os = "macos")]
    {
        #[allow(unsafe_code)]
        // SAFETY: mach_task_self only reads a per-process constant.
        let task = unsafe { mach2::traps::mach_task_self() };
        crate::platform::macos::memory::regions(task, crate::types::ProcessId(std::process::id()))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Err(BurrowError::Unsupported("enumerating our own mappings".to_string()))
    }
}

/// Page-aligned span covering `len` bytes at `address`.
fn page_span(address: Address, len: usize) -> Result<Range<u64>>
{
    let page = *PAGE_SIZE as u64;
    let end = address
        .checked_add(len as u64)
        .ok_or_else(|| BurrowError::InvalidArgument(format!("{len} bytes at {address} wrap the address space")))?;
    let first = address.value() & !(page - 1);
    let last = end
        .value()
        .checked_add(page - 1)
        .map(|value| value & !(page - 1))
        .ok_or_else(|| BurrowError::InvalidArgument(format!("{address} is too close to the end of memory")))?;
    Ok(first..last)
}

/// Regions intersecting `span`, which must cover it without gaps.
fn covering(map: &MemoryMap, span: &Range<u64>) -> Result<Vec<MemoryRegion>>
{
    let regions: Vec<MemoryRegion> = map
        .iter()
        .filter(|region| region.start.value() < span.end && region.end.value() > span.start)
        .cloned()
        .collect();

    let mut cursor = span.start;
    for region in &regions {
        if region.start.value() > cursor {
            break;
        }
        cursor = cursor.max(region.end.value());
    }
    if cursor < span.end {
        return Err(BurrowError::HookFailed(format!("0x{cursor:x} is not mapped")));
    }
    Ok(regions)
}

fn protection(permissions: Permissions) -> libc::c_int
{
    let mut flags = libc::PROT_NONE;
    if permissions.read {
        flags |= libc::PROT_READ;
    }
    if permissions.write {
        flags |= libc::PROT_WRITE;
    }
    if permissions.execute {
        flags |= libc::PROT_EXEC;
    }
    flags
}

#[allow(unsafe_code)]
fn mprotect(span: &Range<u64>, flags: libc::c_int) -> Result<()>
{
    let len = usize::try_from(span.end - span.start)
        .map_err(|_| BurrowError::HookFailed("protection span too large".to_string()))?;
    // SAFETY: `span` is page aligned and fully mapped; changing protection
    // does not invalidate any Rust reference by itself.
    let result = unsafe { libc::mprotect(span.start as usize as *mut libc::c_void, len, flags) };
    if result != 0 {
        return Err(BurrowError::HookFailed(format!(
            "mprotect(0x{:x}, {len}, {flags}) failed: {}",
            span.start,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Copy `bytes` to `address` in this process, even into read-only pages.
///
/// ## Errors
///
/// `HookFailed` if part of the range is unmapped or the protection cannot be
/// changed.
///
/// ## Safety
///
/// `address..address + bytes.len()` must be memory of the current process
/// that nothing else reads or writes during the call, and overwriting it must
/// not break any invariant Rust code relies on.
#[allow(unsafe_code)]
pub unsafe fn patch_memory(address: Address, bytes: &[u8]) -> Result<()>
{
    if bytes.is_empty() {
        return Ok(());
    }
    let span = page_span(address, bytes.len())?;
    let map = MemoryMap::new(own_regions()?);
    let regions = covering(&map, &span)?;
    let destination = address.value() as usize as *mut u8;

    if regions.iter().all(MemoryRegion::is_writable) {
        trace!(%address, len = bytes.len(), "patching writable memory");
        // SAFETY: mapped writable, exclusivity guaranteed by the caller.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), destination, bytes.len()) };
        return Ok(());
    }

    let guard = ProtectionGuard::widen(&span, &regions)?;
    // SAFETY: the span is now writable; exclusivity guaranteed by the caller.
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), destination, bytes.len()) };
    guard.restore()
}

/// Page protection widened to read+write, put back on drop
///
/// Each region the span touches gets its own previous protection back.
struct ProtectionGuard
{
    restore: Vec<(Range<u64>, libc::c_int)>,
    active: bool,
}

impl ProtectionGuard
{
    fn widen(span: &Range<u64>, regions: &[MemoryRegion]) -> Result<Self>
    {
        let mut widened = libc::PROT_READ | libc::PROT_WRITE;
        if regions.iter().any(MemoryRegion::is_executable) {
            widened |= libc::PROT_EXEC;
        }
        debug!(start = span.start, end = span.end, "widening page protection for patch");
        mprotect(span, widened)?;

        let restore = regions
            .iter()
            .map(|region| {
                let clamped = region.start.value().max(span.start)..region.end.value().min(span.end);
                (clamped, protection(region.permissions))
            })
            .collect();
        Ok(Self { restore, active: true })
    }

    /// Put the old protection back and report failures.
    fn restore(mut self) -> Result<()>
    {
        self.active = false;
        for (span, flags) in &self.restore {
            mprotect(span, *flags)?;
        }
        Ok(())
    }
}

impl Drop for ProtectionGuard
{
    fn drop(&mut self)
    {
        if self.active {
            for (span, flags) in &self.restore {
                if let Err(e) = mprotect(span, *flags) {
                    warn!(start = span.start, error = %e, "failed to restore page protection");
                }
            }
        }
    }
}

/// [`MemoryAccess`] over the current process
///
/// Reads check the mapping first, writes go through [`patch_memory`]. This is
/// the memory the [`HookRegistry`](super::HookRegistry) works on when burrow
/// is loaded inside the target.
///
/// The mapping is cached and re-read only when a range is not readable in
/// the cached copy. Call [`LocalMemory::refresh`] after unmapping or
/// protecting memory this value has already read.
#[derive(Debug)]
pub struct LocalMemory
{
    map: Mutex<Option<MemoryMap>>,
}

impl LocalMemory
{
    /// Access to this process's own memory.
    ///
    /// ## Safety
    ///
    /// Every address later passed to this value must satisfy the contract of
    /// [`patch_memory`] for writes and be safe to read for reads.
    #[allow(unsafe_code)]
    pub unsafe fn new() -> Self
    {
        Self { map: Mutex::new(None) }
    }

    /// Drop the cached mapping; the next read walks the regions again.
    pub fn refresh(&self)
    {
        *self.cache() = None;
    }

    fn cache(&self) -> MutexGuard<'_, Option<MemoryMap>>
    {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `true` if `[address, address + length)` is readable, re-walking the
    /// mappings once when the cached copy says no.
    fn readable(&self, address: Address, length: u64) -> Result<bool>
    {
        let mut cache = self.cache();
        if cache.as_ref().is_some_and(|map| map.is_readable(address, length)) {
            return Ok(true);
        }
        trace!(%address, length, "refreshing own mappings");
        let map = MemoryMap::new(own_regions()?);
        let readable = map.is_readable(address, length);
        *cache = Some(map);
        Ok(readable)
    }
}

impl MemoryAccess for LocalMemory
{
    #[allow(unsafe_code)]
    fn read(&self, address: Address, length: usize, buffer: &mut [u8]) -> Result<()>
    {
        check_buffer(length, buffer.len())?;
        if length == 0 {
            return Ok(());
        }
        if !self.readable(address, length as u64)? {
            return Err(BurrowError::MemoryRead {
                address,
                length,
                details: "not readable in this process".to_string(),
            });
        }
        // SAFETY: the range is mapped readable; the constructor's contract covers the rest.
        unsafe { std::ptr::copy_nonoverlapping(address.value() as usize as *const u8, buffer.as_mut_ptr(), length) };
        Ok(())
    }

    #[allow(unsafe_code)]
    fn write(&self, address: Address, length: usize, buffer: &[u8]) -> Result<()>
    {
        check_buffer(length, buffer.len())?;
        // SAFETY: guaranteed by the constructor's contract.
        unsafe { patch_memory(address, &buffer[..length]) }
    }

    fn pointer_width(&self) -> PointerWidth
    {
        PointerWidth::host()
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests
{
    use super::*;
    use crate::overlay::TypedMemory;

    /// One anonymous page with the given protection
    #[allow(unsafe_code)]
    fn map_page(flags: libc::c_int) -> Address
    {
        let page = *PAGE_SIZE;
        // SAFETY: anonymous private mapping, no file involved.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                page,
                flags,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(ptr, libc::MAP_FAILED);
        Address::new(ptr as usize as u64)
    }

    fn permissions_of(address: Address) -> Permissions
    {
        let map = MemoryMap::new(own_regions().unwrap());
        map.find(address).unwrap().permissions
    }

    #[test]
    fn page_span_rounds_outward()
    {
        let page = *PAGE_SIZE as u64;
        let span = page_span(Address::new(page + 3), 2).unwrap();
        assert_eq!(span, page..2 * page);
        let straddle = page_span(Address::new(2 * page - 1), 2).unwrap();
        assert_eq!(straddle, page..3 * page);
    }

    #[test]
    #[allow(unsafe_code)]
    fn patches_read_only_pages_and_restores_protection()
    {
        let page = map_page(libc::PROT_READ);
        unsafe { patch_memory(page + 8, &0xdead_beef_u32.to_le_bytes()).unwrap() };

        let local = unsafe { LocalMemory::new() };
        assert_eq!(local.read_u32(page + 8).unwrap(), 0xdead_beef);
        let permissions = permissions_of(page);
        assert!(permissions.read);
        assert!(!permissions.write);
    }

    #[test]
    #[allow(unsafe_code)]
    fn local_memory_refuses_unmapped_reads()
    {
        let page = map_page(libc::PROT_NONE);
        let local = unsafe { LocalMemory::new() };
        assert!(matches!(local.read_u8(page), Err(BurrowError::MemoryRead { .. })));
    }

    #[test]
    #[allow(unsafe_code)]
    fn local_memory_caches_mappings_until_a_miss()
    {
        let local = unsafe { LocalMemory::new() };
        let first = map_page(libc::PROT_READ | libc::PROT_WRITE);
        local.read_u8(first).unwrap();
        assert!(local.cache().as_ref().is_some_and(|map| map.find(first).is_some()));

        // mapped after the cache was filled: the miss re-reads the mappings
        let second = map_page(libc::PROT_READ | libc::PROT_WRITE);
        unsafe { (second.value() as usize as *mut u8).write(0x2A) };
        assert_eq!(local.read_u8(second).unwrap(), 0x2A);
        assert!(local.cache().as_ref().is_some_and(|map| map.find(second).is_some()));

        local.refresh();
        assert!(local.cache().is_none());
        assert_eq!(local.read_u8(second).unwrap(), 0x2A);
    }
}
