//! # Memory Map
//!
//! Point-in-time snapshots of the target's mapped address ranges.
//!
//! Each backend produces a list of [`MemoryRegion`] values from whatever the
//! OS offers (`/proc/<pid>/maps` on Linux, `mach_vm_region_recurse()` on
//! macOS). [`MemoryMap`] then normalises the list so that the heuristics on
//! top of it behave the same everywhere:
//!
//! - regions are sorted by start address
//! - empty or inverted ranges are dropped
//! - overlapping ranges are dropped (the first one wins)
//! - platform labels are folded into a [`RegionKind`]
//!
//! A snapshot is never updated in place. Take a new one with
//! [`Process::memory_map`](crate::process::Process::memory_map) when the
//! target's layout may have changed.

use std::fmt;

use tracing::warn;

use crate::types::Address;

/// Access flags of a mapped range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Permissions
{
    /// Readable
    pub read: bool,
    /// Writable
    pub write: bool,
    /// Executable
    pub execute: bool,
    /// Shared with other processes (as opposed to private copy-on-write)
    pub shared: bool,
}

impl Permissions
{
    /// Read + write, private.
    pub const READ_WRITE: Self = Permissions {
        read: true,
        write: true,
        execute: false,
        shared: false,
    };

    /// Read-only, private.
    pub const READ_ONLY: Self = Permissions {
        read: true,
        write: false,
        execute: false,
        shared: false,
    };

    /// Read + execute, private.
    pub const READ_EXECUTE: Self = Permissions {
        read: true,
        write: false,
        execute: true,
        shared: false,
    };

    /// Parse the four-character permission column of `/proc/<pid>/maps` (`"rw-p"`).
    ///
    /// Returns `None` if the field is not exactly four known characters.
    pub fn from_maps_field(field: &str) -> Option<Self>
    {
        let bytes = field.as_bytes();
        if bytes.len() != 4 {
            return None;
        }
        let flag = |byte: u8, set: u8| -> Option<bool> {
            match byte {
                b'-' => Some(false),
                b if b == set => Some(true),
                _ => None,
            }
        };
        let shared = match bytes[3] {
            b's' => true,
            b'p' => false,
            _ => return None,
        };
        Some(Permissions {
            read: flag(bytes[0], b'r')?,
            write: flag(bytes[1], b'w')?,
            execute: flag(bytes[2], b'x')?,
            shared,
        })
    }
}

impl fmt::Display for Permissions
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(
            f,
            "{}{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.execute { 'x' } else { '-' },
            if self.shared { 's' } else { 'p' }
        )
    }
}

/// What a region is used for, as far as the platform label tells us
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind
{
    /// The allocator's heap (`[heap]` on Linux, `MALLOC_*` tags on macOS)
    Heap,
    /// A thread stack
    Stack,
    /// Anonymous mapping without a label
    ///
    /// Large allocations and secondary malloc arenas live here on Linux, so
    /// heap heuristics treat it like the heap.
    Anonymous,
    /// File-backed mapping (the executable, shared libraries, data files)
    Mapped,
    /// Kernel-provided pseudo mappings (`[vdso]`, `[vvar]`, `[vsyscall]`)
    Special,
}

impl RegionKind
{
    /// Fold a platform label into a kind.
    pub fn classify(name: Option<&str>) -> Self
    {
        match name {
            None | Some("") => RegionKind::Anonymous,
            Some("[heap]") => RegionKind::Heap,
            Some(label) if label == "[stack]" || label.starts_with("[stack:") => RegionKind::Stack,
            Some(label) if label.starts_with("[anon") => RegionKind::Anonymous,
            Some(label) if label.starts_with('[') => RegionKind::Special,
            Some(_) => RegionKind::Mapped,
        }
    }

    /// `true` for kinds the allocator hands objects out of.
    pub fn is_heap_like(self) -> bool
    {
        matches!(self, RegionKind::Heap | RegionKind::Anonymous)
    }
}

/// One mapped range of the target's address space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion
{
    /// Start address (inclusive)
    pub start: Address,
    /// End address (exclusive)
    pub end: Address,
    /// Access flags
    pub permissions: Permissions,
    /// Offset into the backing file, zero for anonymous memory
    pub offset: u64,
    /// Label reported by the OS, if any
    pub name: Option<String>,
    /// Normalised label
    pub kind: RegionKind,
}

impl MemoryRegion
{
    /// Create a region; the kind is derived from `name`.
    pub fn new(start: Address, end: Address, permissions: Permissions, name: Option<String>) -> Self
    {
        let kind = RegionKind::classify(name.as_deref());
        Self {
            start,
            end,
            permissions,
            offset: 0,
            name,
            kind,
        }
    }

    /// Set the backing-file offset.
    #[must_use]
    pub fn with_offset(mut self, offset: u64) -> Self
    {
        self.offset = offset;
        self
    }

    /// Override the derived kind.
    #[must_use]
    pub fn with_kind(mut self, kind: RegionKind) -> Self
    {
        self.kind = kind;
        self
    }

    /// Size in bytes (zero for an inverted range).
    pub fn size(&self) -> u64
    {
        self.end.value().saturating_sub(self.start.value())
    }

    /// `true` if `address` is inside `[start, end)`.
    pub fn contains(&self, address: Address) -> bool
    {
        address >= self.start && address < self.end
    }

    /// `true` if the whole of `[address, address + len)` is inside this region.
    pub fn contains_range(&self, address: Address, len: u64) -> bool
    {
        match address.checked_add(len) {
            Some(end) => address >= self.start && end <= self.end,
            None => false,
        }
    }

    /// Readable
    pub fn is_readable(&self) -> bool
    {
        self.permissions.read
    }

    /// Writable
    pub fn is_writable(&self) -> bool
    {
        self.permissions.write
    }

    /// Executable
    pub fn is_executable(&self) -> bool
    {
        self.permissions.execute
    }

    /// Shared mapping
    pub fn is_shared(&self) -> bool
    {
        self.permissions.shared
    }
}

impl fmt::Display for MemoryRegion
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}-{} {}", self.start, self.end, self.permissions)?;
        if let Some(name) = &self.name {
            write!(f, " {name}")?;
        }
        Ok(())
    }
}

/// Sorted, non-overlapping snapshot of a target's memory regions
#[derive(Debug, Clone, Default)]
pub struct MemoryMap
{
    regions: Vec<MemoryRegion>,
}

impl MemoryMap
{
    /// Normalise a raw region list into a snapshot.
    pub fn new(mut regions: Vec<MemoryRegion>) -> Self
    {
        regions.retain(|region| {
            let valid = region.start < region.end;
            if !valid {
                warn!(start = %region.start, end = %region.end, "dropping empty memory region");
            }
            valid
        });
        regions.sort_by_key(|region| region.start);

        let mut normalised: Vec<MemoryRegion> = Vec::with_capacity(regions.len());
        for region in regions {
            if let Some(previous) = normalised.last() {
                if region.start < previous.end {
                    warn!(start = %region.start, previous_end = %previous.end, "dropping overlapping memory region");
                    continue;
                }
            }
            normalised.push(region);
        }

        Self { regions: normalised }
    }

    /// All regions in ascending address order.
    pub fn regions(&self) -> &[MemoryRegion]
    {
        &self.regions
    }

    /// Iterate regions in ascending address order.
    pub fn iter(&self) -> std::slice::Iter<'_, MemoryRegion>
    {
        self.regions.iter()
    }

    /// Number of regions
    pub fn len(&self) -> usize
    {
        self.regions.len()
    }

    /// `true` if nothing is mapped
    pub fn is_empty(&self) -> bool
    {
        self.regions.is_empty()
    }

    /// Region containing `address`.
    pub fn find(&self, address: Address) -> Option<&MemoryRegion>
    {
        let index = self.regions.partition_point(|region| region.end <= address);
        self.regions.get(index).filter(|region| region.contains(address))
    }

    /// Region containing the whole of `[address, address + len)`.
    ///
    /// Ranges that straddle two adjacent regions are rejected even when both
    /// are mapped, because OS permissions may differ between them.
    pub fn find_range(&self, address: Address, len: u64) -> Option<&MemoryRegion>
    {
        self.find(address).filter(|region| region.contains_range(address, len))
    }

    /// `true` if `len` bytes at `address` can be read.
    pub fn is_readable(&self, address: Address, len: u64) -> bool
    {
        self.find_range(address, len).is_some_and(MemoryRegion::is_readable)
    }

    /// `true` if `len` bytes at `address` can be written.
    pub fn is_writable(&self, address: Address, len: u64) -> bool
    {
        self.find_range(address, len).is_some_and(MemoryRegion::is_writable)
    }

    /// Heuristic check that `address` could point at a live heap object.
    ///
    /// The address has to be aligned to `align`, and it has to fall inside a
    /// private region that is both readable and writable. File-backed, shared
    /// and executable mappings never qualify.
    pub fn is_plausible_heap_pointer(&self, address: Address, align: u64) -> bool
    {
        if address.is_null() || !address.is_aligned(align) {
            return false;
        }
        self.find(address).is_some_and(|region| {
            region.permissions.read
                && region.permissions.write
                && !region.permissions.shared
                && !region.permissions.execute
                && (region.kind.is_heap_like() || region.kind == RegionKind::Mapped)
        })
    }

    /// Regions whose label equals `name`.
    pub fn named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a MemoryRegion> + 'a
    {
        self.regions.iter().filter(move |region| region.name.as_deref() == Some(name))
    }

    /// Regions the allocator hands objects out of.
    pub fn heap_regions(&self) -> impl Iterator<Item = &MemoryRegion>
    {
        self.regions.iter().filter(|region| region.kind.is_heap_like())
    }
}

impl<'a> IntoIterator for &'a MemoryMap
{
    type Item = &'a MemoryRegion;
    type IntoIter = std::slice::Iter<'a, MemoryRegion>;

    fn into_iter(self) -> Self::IntoIter
    {
        self.regions.iter()
    }
}

/// Parse the text of `/proc/<pid>/maps`
///
/// Each line has the form
///
/// ```text
/// 55d4c0a00000-55d4c0a21000 rw-p 00000000 00:00 0          [heap]
/// ```
///
/// The label column may be absent or contain spaces. Lines that do not parse
/// are skipped with a warning rather than failing the whole snapshot.
///
/// ## Example
///
/// ```rust
/// use burrow_core::memory_map::{parse_proc_maps, RegionKind};
///
/// let text = "00400000-00452000 r-xp 00000000 08:02 173521 /usr/bin/dbus-daemon\n\
///             0222e000-0224f000 rw-p 00000000 00:00 0 [heap]\n";
/// let regions = parse_proc_maps(text);
/// assert_eq!(regions.len(), 2);
/// assert_eq!(regions[1].kind, RegionKind::Heap);
/// ```
pub fn parse_proc_maps(text: &str) -> Vec<MemoryRegion>
{
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let parsed = parse_maps_line(line);
            if parsed.is_none() {
                warn!(line, "skipping malformed maps line");
            }
            parsed
        })
        .collect()
}

fn parse_maps_line(line: &str) -> Option<MemoryRegion>
{
    // Five whitespace-separated columns, then the label (which may contain spaces).
    let mut rest = line.trim_end();
    let mut columns = [""; 5];
    for column in &mut columns {
        rest = rest.trim_start();
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        if end == 0 {
            return None;
        }
        *column = &rest[..end];
        rest = &rest[end..];
    }
    let [range, perms, offset, _device, _inode] = columns;

    let (start, end) = range.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    let permissions = Permissions::from_maps_field(perms)?;
    let offset = u64::from_str_radix(offset, 16).ok()?;

    let label = rest.trim();
    let name = if label.is_empty() { None } else { Some(label.to_string()) };

    Some(MemoryRegion::new(Address::new(start), Address::new(end), permissions, name).with_offset(offset))
}

#[cfg(test)]
mod tests
{
    use super::*;

    const SAMPLE: &str = "\
5581c8a00000-5581c8a02000 r--p 00000000 fd:01 1835 /opt/game/Dwarf Fortress
5581c8a02000-5581c8b00000 r-xp 00002000 fd:01 1835 /opt/game/Dwarf Fortress
5581c9e3c000-5581c9e5d000 rw-p 00000000 00:00 0                          [heap]
7f2a10000000-7f2a10021000 rw-p 00000000 00:00 0
7f2a1c000000-7f2a1c001000 rw-s 00000000 00:05 42 /dev/shm/sem.game
7ffc0e5b1000-7ffc0e5d2000 rw-p 00000000 00:00 0                          [stack]
7ffc0e5f6000-7ffc0e5f8000 r-xp 00000000 00:00 0                          [vdso]
";

    #[test]
    fn parses_every_column()
    {
        let regions = parse_proc_maps(SAMPLE);
        assert_eq!(regions.len(), 7);

        let code = &regions[1];
        assert_eq!(code.start, Address::new(0x5581_c8a0_2000));
        assert_eq!(code.end, Address::new(0x5581_c8b0_0000));
        assert_eq!(code.permissions, Permissions::READ_EXECUTE);
        assert_eq!(code.offset, 0x2000);
        assert_eq!(code.name.as_deref(), Some("/opt/game/Dwarf Fortress"));
        assert_eq!(code.kind, RegionKind::Mapped);
    }

    #[test]
    fn classifies_platform_labels()
    {
        let regions = parse_proc_maps(SAMPLE);
        let kinds: Vec<RegionKind> = regions.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                RegionKind::Mapped,
                RegionKind::Mapped,
                RegionKind::Heap,
                RegionKind::Anonymous,
                RegionKind::Mapped,
                RegionKind::Stack,
                RegionKind::Special,
            ]
        );
        assert!(regions[4].is_shared());
    }

    #[test]
    fn skips_malformed_lines()
    {
        let text = "garbage\n00400000-00452000 r-xp 00000000 08:02 173521 /bin/true\n00400000 rw-p\n";
        let regions = parse_proc_maps(text);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].name.as_deref(), Some("/bin/true"));
    }

    #[test]
    fn rejects_bad_permission_fields()
    {
        assert!(Permissions::from_maps_field("rwxp").is_some());
        assert!(Permissions::from_maps_field("rwx").is_none());
        assert!(Permissions::from_maps_field("rwxq").is_none());
        assert!(Permissions::from_maps_field("wrxp").is_none());
        assert_eq!(Permissions::READ_WRITE.to_string(), "rw-p");
    }

    #[test]
    fn map_sorts_and_drops_bad_ranges()
    {
        let map = MemoryMap::new(vec![
            MemoryRegion::new(Address::new(0x3000), Address::new(0x4000), Permissions::READ_WRITE, None),
            MemoryRegion::new(Address::new(0x1000), Address::new(0x2000), Permissions::READ_ONLY, None),
            MemoryRegion::new(Address::new(0x5000), Address::new(0x5000), Permissions::READ_ONLY, None),
            MemoryRegion::new(Address::new(0x3800), Address::new(0x4800), Permissions::READ_ONLY, None),
        ]);

        assert_eq!(map.len(), 2);
        assert_eq!(map.regions()[0].start, Address::new(0x1000));
        assert_eq!(map.regions()[1].start, Address::new(0x3000));
        for pair in map.regions().windows(2) {
            assert!(pair[0].end <= pair[1].start);
        }
    }

    #[test]
    fn find_respects_exclusive_end()
    {
        let map = MemoryMap::new(parse_proc_maps(SAMPLE));
        assert!(map.find(Address::new(0x5581_c9e3_c000)).is_some());
        assert!(map.find(Address::new(0x5581_c9e5_d000)).is_none());
        assert!(map.find(Address::new(0x10)).is_none());
    }

    #[test]
    fn range_checks_do_not_straddle_regions()
    {
        let map = MemoryMap::new(parse_proc_maps(SAMPLE));
        let last_code_byte = Address::new(0x5581_c8a0_1fff);
        assert!(map.is_readable(last_code_byte, 1));
        assert!(!map.is_readable(last_code_byte, 2));
        assert!(!map.is_writable(Address::new(0x5581_c8a0_2000), 4));
        assert!(map.is_writable(Address::new(0x5581_c9e3_c000), 16));
    }

    #[test]
    fn heap_pointer_heuristic()
    {
        let map = MemoryMap::new(parse_proc_maps(SAMPLE));
        assert!(map.is_plausible_heap_pointer(Address::new(0x5581_c9e3_c010), 4));
        assert!(map.is_plausible_heap_pointer(Address::new(0x7f2a_1000_0100), 8));
        // misaligned
        assert!(!map.is_plausible_heap_pointer(Address::new(0x5581_c9e3_c011), 4));
        // executable
        assert!(!map.is_plausible_heap_pointer(Address::new(0x5581_c8a0_2000), 4));
        // shared
        assert!(!map.is_plausible_heap_pointer(Address::new(0x7f2a_1c00_0000), 4));
        // unmapped
        assert!(!map.is_plausible_heap_pointer(Address::new(0x1000), 4));
    }
}
