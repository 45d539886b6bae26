//! # macOS Memory Operations
//!
//! Reading, writing and enumerating target memory through a Mach task port.
//!
//! - **mach_vm_read_overwrite()**: copy target memory into our buffer
//! - **mach_vm_write()**: copy our buffer into target memory
//! - **mach_vm_region_recurse()**: walk the address space, descending into submaps
//!
//! ## References
//!
//! - [mach_vm_read_overwrite](https://developer.apple.com/documentation/kernel/1402127-mach_vm_read_overwrite)
//! - [mach_vm_write](https://developer.apple.com/documentation/kernel/1402070-mach_vm_write)
//! - [mach_vm_region_recurse](https://developer.apple.com/documentation/kernel/1402149-mach_vm_region_recurse)

use std::cmp::min;

use libc::{mach_port_t, vm_map_t};
use mach2::kern_return::KERN_SUCCESS;
use mach2::message::mach_msg_type_number_t;
use mach2::vm::{mach_vm_read_overwrite, mach_vm_region_recurse, mach_vm_write};
use mach2::vm_region::{
    vm_region_recurse_info_t, vm_region_submap_short_info_data_64_t, VM_REGION_SUBMAP_SHORT_INFO_COUNT_64,
};
use mach2::vm_statistics::{
    VM_MEMORY_MALLOC, VM_MEMORY_MALLOC_HUGE, VM_MEMORY_MALLOC_LARGE, VM_MEMORY_MALLOC_MEDIUM, VM_MEMORY_MALLOC_SMALL,
    VM_MEMORY_MALLOC_TINY, VM_MEMORY_STACK,
};
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t, natural_t, vm_offset_t};

use crate::error::{BurrowError, Result};
use crate::memory_map::{MemoryRegion, Permissions};
use crate::types::{Address, ProcessId};

/// Largest single `mach_vm_read_overwrite` request
const MAX_VM_READ_CHUNK: usize = 64 * 1024;

// vm_region share modes (mach/vm_region.h)
const SM_SHARED: u8 = 3;
const SM_TRUESHARED: u8 = 5;
const SM_SHARED_ALIASED: u8 = 7;

/// Fill `dst` from the target at `addr`.
pub fn read_into(task: mach_port_t, addr: Address, dst: &mut [u8]) -> Result<()>
{
    let mut total = 0usize;
    let mut cursor = addr.value();

    while total < dst.len() {
        let chunk_len = min(MAX_VM_READ_CHUNK, dst.len() - total);
        let mut actual: mach_vm_size_t = 0;

        // SAFETY: the destination range lies inside `dst`, which we borrow mutably.
        let result = unsafe {
            mach_vm_read_overwrite(
                task as vm_map_t,
                cursor,
                chunk_len as mach_vm_size_t,
                dst[total..].as_mut_ptr() as mach_vm_address_t,
                &mut actual,
            )
        };

        if result != KERN_SUCCESS || actual == 0 {
            return Err(BurrowError::MemoryRead {
                address: addr,
                length: dst.len(),
                details: format!("mach_vm_read_overwrite failed at 0x{cursor:x}: {result}"),
            });
        }

        total += actual as usize;
        cursor += actual;
    }

    Ok(())
}

/// Copy `data` into the target at `addr`.
pub fn write_from(task: mach_port_t, addr: Address, data: &[u8]) -> Result<()>
{
    let count = mach_msg_type_number_t::try_from(data.len()).map_err(|_| {
        BurrowError::InvalidArgument(format!("write of {} bytes is too large", data.len()))
    })?;

    // SAFETY: the kernel only reads `count` bytes from `data`.
    let result = unsafe { mach_vm_write(task as vm_map_t, addr.value(), data.as_ptr() as vm_offset_t, count) };
    if result != KERN_SUCCESS {
        return Err(BurrowError::MemoryWrite {
            address: addr,
            length: data.len(),
            details: format!("mach_vm_write failed: {result}"),
        });
    }
    Ok(())
}

/// Walk the whole address space of `task`.
///
/// Regions tagged as malloc zones or stacks get the same `[heap]`/`[stack]`
/// labels Linux uses; file-backed regions are labelled with their path.
pub fn regions(task: mach_port_t, pid: ProcessId) -> Result<Vec<MemoryRegion>>
{
    let mut regions = Vec::new();
    let mut address: mach_vm_address_t = 0;
    let mut depth: natural_t = 0;

    loop {
        let mut size: mach_vm_size_t = 0;
        let mut info = vm_region_submap_short_info_data_64_t::default();
        let mut info_count = VM_REGION_SUBMAP_SHORT_INFO_COUNT_64;

        // SAFETY: `info` is the structure matching VM_REGION_SUBMAP_SHORT_INFO_COUNT_64.
        let result = unsafe {
            mach_vm_region_recurse(
                task as vm_map_t,
                &mut address,
                &mut size,
                &mut depth,
                &mut info as *mut _ as vm_region_recurse_info_t,
                &mut info_count,
            )
        };

        if result == libc::KERN_INVALID_ADDRESS {
            break;
        }
        if result != KERN_SUCCESS {
            return Err(BurrowError::Io(std::io::Error::other(format!(
                "mach_vm_region_recurse failed: {result}"
            ))));
        }

        if info.is_submap != 0 {
            depth += 1;
            continue;
        }

        let permissions = Permissions {
            read: info.protection & libc::VM_PROT_READ != 0,
            write: info.protection & libc::VM_PROT_WRITE != 0,
            execute: info.protection & libc::VM_PROT_EXECUTE != 0,
            shared: matches!(info.share_mode, SM_SHARED | SM_TRUESHARED | SM_SHARED_ALIASED),
        };
        let name = name_from_user_tag(info.user_tag).or_else(|| region_file_name(pid, address));

        regions.push(
            MemoryRegion::new(Address::new(address), Address::new(address + size), permissions, name)
                .with_offset(info.offset),
        );

        address += size;
    }

    Ok(regions)
}

fn name_from_user_tag(tag: u32) -> Option<String>
{
    match tag {
        VM_MEMORY_STACK => Some("[stack]".to_string()),
        VM_MEMORY_MALLOC
        | VM_MEMORY_MALLOC_SMALL
        | VM_MEMORY_MALLOC_MEDIUM
        | VM_MEMORY_MALLOC_LARGE
        | VM_MEMORY_MALLOC_HUGE
        | VM_MEMORY_MALLOC_TINY => Some("[heap]".to_string()),
        _ => None,
    }
}

fn region_file_name(pid: ProcessId, address: u64) -> Option<String>
{
    let pid = i32::try_from(pid.0).ok()?;
    libproc::libproc::proc_pid::regionfilename(pid, address)
        .ok()
        .filter(|name| !name.is_empty())
}
