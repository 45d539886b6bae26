//! Tests for platform-agnostic types

use burrow_core::memory_map::{parse_proc_maps, MemoryMap, MemoryRegion, Permissions, RegionKind};
use burrow_core::overlay::{host_to_target, target_to_host};
use burrow_core::types::{Address, PointerWidth, ProcessId, TargetOs, ThreadId};

#[test]
fn test_process_id_conversions()
{
    let pid = ProcessId::from(12345);
    assert_eq!(pid.0, 12345);
    let value: u32 = pid.into();
    assert_eq!(value, 12345);
    assert_eq!(pid.to_string(), "12345");
}

#[test]
fn test_thread_id_raw()
{
    assert_eq!(ThreadId::from(99).raw(), 99);
}

#[test]
fn test_address_display_and_arithmetic()
{
    let address = Address::new(0x1000);
    assert_eq!(address.to_string(), "0x0000000000001000");
    assert_eq!(format!("{address:x}"), "1000");
    assert_eq!(address.checked_add(0x10), Some(Address::new(0x1010)));
    assert_eq!(Address::new(u64::MAX).checked_add(1), None);
    assert_eq!(address.offset(-0x10), Some(Address::new(0xff0)));
    assert_eq!(Address::new(8).offset(-16), None);
    assert_eq!(Address::new(0x1010).distance_from(address), Some(0x10));
    assert!(address.is_aligned(0x1000));
    assert!(!Address::new(0x1004).is_aligned(8));
    assert!(Address::ZERO.is_null());
}

#[test]
fn test_pointer_width()
{
    assert_eq!(PointerWidth::Four.bytes(), 4);
    assert_eq!(PointerWidth::Eight.bytes(), 8);
    assert_eq!(PointerWidth::host().bytes(), std::mem::size_of::<usize>());
    assert_eq!(PointerWidth::Eight.to_string(), "64-bit");
}

#[test]
fn test_target_os_parsing()
{
    assert_eq!("darwin".parse::<TargetOs>().unwrap(), TargetOs::Macos);
    assert_eq!("Linux".parse::<TargetOs>().unwrap(), TargetOs::Linux);
    assert_eq!("win64".parse::<TargetOs>().unwrap(), TargetOs::Windows);
    assert!("plan9".parse::<TargetOs>().is_err());
}

#[cfg(target_endian = "little")]
#[test]
fn test_byte_order_is_identity_on_little_endian()
{
    for value in [0u32, 1, 0x2A, 0xDEAD_BEEF, u32::MAX] {
        assert_eq!(target_to_host(value), value);
        assert_eq!(host_to_target(value), value);
    }
    assert_eq!(target_to_host(-5i64), -5);
    assert_eq!(target_to_host(1.5f64).to_bits(), 1.5f64.to_bits());
}

#[test]
fn test_parse_proc_maps_classifies_regions()
{
    let text = "\
00400000-00452000 r-xp 00000000 08:02 173521 /usr/bin/game
00651000-00652000 rw-p 00051000 08:02 173521 /usr/bin/game
01b84000-01ba5000 rw-p 00000000 00:00 0 [heap]
7ffd1e9f0000-7ffd1ea11000 rw-p 00000000 00:00 0 [stack]
7f2a00000000-7f2a00021000 rw-p 00000000 00:00 0
";
    let regions = parse_proc_maps(text);
    assert_eq!(regions.len(), 5);
    assert_eq!(regions[0].start, Address::new(0x40_0000));
    assert!(regions[0].is_executable());
    assert_eq!(regions[1].offset, 0x51000);
    assert_eq!(regions[2].kind, RegionKind::Heap);
    assert_eq!(regions[3].kind, RegionKind::Stack);
    assert_eq!(regions[4].kind, RegionKind::Anonymous);

    let map = MemoryMap::new(regions);
    assert!(map.is_readable(Address::new(0x40_0100), 0x10));
    assert!(!map.is_writable(Address::new(0x40_0100), 0x10));
    assert!(map.find(Address::new(0x50_0000)).is_none());
    assert!(map.is_plausible_heap_pointer(Address::new(0x01b8_4010), 8));
    assert!(!map.is_plausible_heap_pointer(Address::new(0x01b8_4011), 8));
}

#[test]
fn test_memory_region_bounds()
{
    let region = MemoryRegion::new(
        Address::new(0x1000),
        Address::new(0x2000),
        Permissions::READ_WRITE,
        Some("[heap]".to_string()),
    );
    assert_eq!(region.size(), 0x1000);
    assert!(region.contains(Address::new(0x1fff)));
    assert!(!region.contains(Address::new(0x2000)));
    assert!(region.contains_range(Address::new(0x1ff0), 0x10));
    assert!(!region.contains_range(Address::new(0x1ff0), 0x11));
}
