//! C strings and the target runtime's `std::string` layouts.
//!
//! The game has been built with three different standard libraries over its
//! life, and each lays a `std::string` out differently:
//!
//! | kind | layout |
//! |---|---|
//! | `msvc` | 16-byte buffer/pointer union, then size and capacity words. Inline while capacity is below the buffer size |
//! | `gnu-cow` | a single pointer to the characters, preceded by a `{length, capacity, refcount}` header |
//! | `gnu-sso` | pointer, size, then a 16-byte local buffer that doubles as the capacity word when the data is on the heap |
//!
//! [`StringLayout::from_descriptor`] picks the layout from the descriptor's
//! `string` group. The `kind` string is required; the field offsets and the
//! inline capacity default to the runtime ABI for the target's pointer width
//! and may be overridden for debug builds that insert extra fields.
//!
//! Reads never trust the target blindly: the length must fit the capacity and
//! a sanity bound before any character data is read.

use crate::descriptor::VersionInfo;
use crate::error::{BurrowError, Result};
use crate::overlay::{MemoryAccess, TypedMemory};
use crate::types::{Address, PointerWidth};

/// Chunk size for C-string reads; one page of the smallest page size in use.
const C_STRING_CHUNK: usize = 4096;

/// Upper bound on any decoded `std::string`, in bytes
pub const MAX_STRING_BYTES: usize = 64 << 20;

/// How the target runtime lays out a `std::string`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringLayout
{
    /// Microsoft runtime
    Msvc
    {
        /// Offset of the buffer/pointer union
        buffer: u64,
        /// Offset of the size word
        size: u64,
        /// Offset of the capacity word
        capacity: u64,
        /// Size of the inline buffer; strings whose capacity is below this live inline
        inline_capacity: u64,
    },
    /// libstdc++ before the C++11 ABI (reference-counted, copy-on-write)
    GnuCow
    {
        /// Offset of the character pointer
        pointer: u64,
    },
    /// libstdc++ C++11 ABI (small-string optimized)
    GnuSso
    {
        /// Offset of the character pointer
        pointer: u64,
        /// Offset of the size word
        size: u64,
        /// Offset of the local buffer (holds the capacity when on the heap)
        buffer: u64,
        /// Largest length that fits the local buffer
        inline_capacity: u64,
    },
}

/// Decoded header of a string, before any character data is read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringHeader
{
    /// Where the character data lives
    pub data: Address,
    /// Length in bytes, excluding the terminator
    pub len: usize,
    /// Bytes available for characters, excluding the terminator
    pub capacity: usize,
    /// `true` when the characters are stored inside the structure itself
    pub inline: bool,
}

impl StringLayout
{
    /// Microsoft layout with release-build offsets.
    pub const fn msvc(width: PointerWidth) -> Self
    {
        StringLayout::Msvc {
            buffer: 0,
            size: 16,
            capacity: 16 + width.bytes() as u64,
            inline_capacity: 16,
        }
    }

    /// libstdc++ copy-on-write layout.
    pub const fn gnu_cow() -> Self
    {
        StringLayout::GnuCow { pointer: 0 }
    }

    /// libstdc++ small-string layout.
    pub const fn gnu_sso(width: PointerWidth) -> Self
    {
        let word = width.bytes() as u64;
        StringLayout::GnuSso {
            pointer: 0,
            size: word,
            buffer: 2 * word,
            inline_capacity: 15,
        }
    }

    /// Build the layout described by the `string` group of `info`.
    ///
    /// ## Errors
    ///
    /// - Definition errors if the group or its `kind` string is missing
    /// - `Config` for an unknown kind or a negative offset
    pub fn from_descriptor(info: &VersionInfo, width: PointerWidth) -> Result<Self>
    {
        let group = info.group("string")?;
        let kind = group.string("kind")?;

        let field = |key: &str, default: u64| -> Result<u64> {
            match group.try_offset(key) {
                Some(value) => u64::try_from(value).map_err(|_| {
                    BurrowError::Config(format!("{}{key}: negative string field offset", group.full_name()))
                }),
                None => Ok(default),
            }
        };
        let inline = |default: u64| group.try_hex_value("inline_capacity").unwrap_or(default);

        let word = width.bytes() as u64;
        let layout = match kind.to_ascii_lowercase().as_str() {
            "msvc" => {
                let size = field("size", 16)?;
                StringLayout::Msvc {
                    buffer: field("buffer", 0)?,
                    size,
                    capacity: field("capacity", size + word)?,
                    inline_capacity: inline(16),
                }
            }
            "gnu-cow" | "gnu" => StringLayout::GnuCow {
                pointer: field("pointer", 0)?,
            },
            "gnu-sso" | "gnu-cxx11" => {
                StringLayout::GnuSso {
                    pointer: field("pointer", 0)?,
                    size: field("size", word)?,
                    buffer: field("buffer", 2 * word)?,
                    inline_capacity: inline(15),
                }
            }
            other => {
                return Err(BurrowError::Config(format!(
                    "{}kind: unknown string layout '{other}'",
                    group.full_name()
                )))
            }
        };
        Ok(layout)
    }

    /// Decode the header of the string at `address` and validate it.
    ///
    /// ## Errors
    ///
    /// `CorruptContainer` if the length exceeds the capacity or the sanity
    /// bound, or the heap pointer is null; I/O errors from the reads.
    pub fn header<M: MemoryAccess + ?Sized>(&self, memory: &M, address: Address) -> Result<StringHeader>
    {
        let word = memory.pointer_width().bytes() as u64;
        let header = match *self {
            StringLayout::Msvc {
                buffer,
                size,
                capacity,
                inline_capacity,
            } => {
                let len = read_word(memory, field(address, size)?)?;
                let cap = read_word(memory, field(address, capacity)?)?;
                let inline = cap < inline_capacity;
                let data = if inline {
                    field(address, buffer)?
                } else {
                    memory.read_pointer(field(address, buffer)?)?
                };
                StringHeader {
                    data,
                    len: to_len(len, address)?,
                    capacity: to_len(cap, address)?,
                    inline,
                }
            }
            StringLayout::GnuCow { pointer } => {
                let data = memory.read_pointer(field(address, pointer)?)?;
                let rep = data.checked_sub(3 * word).ok_or_else(|| corrupt(address, "character pointer below header"))?;
                let len = read_word(memory, rep)?;
                let cap = read_word(memory, field(rep, word)?)?;
                StringHeader {
                    data,
                    len: to_len(len, address)?,
                    capacity: to_len(cap, address)?,
                    inline: false,
                }
            }
            StringLayout::GnuSso {
                pointer,
                size,
                buffer,
                inline_capacity,
            } => {
                let local = field(address, buffer)?;
                let len_at = field(address, size)?;
                let data = memory.read_pointer(field(address, pointer)?)?;
                let len = read_word(memory, len_at)?;
                let inline = data == local;
                let cap = if inline { inline_capacity } else { read_word(memory, local)? };
                StringHeader {
                    data,
                    len: to_len(len, address)?,
                    capacity: to_len(cap, address)?,
                    inline,
                }
            }
        };

        if header.len > header.capacity {
            return Err(corrupt(
                address,
                &format!("length {} exceeds capacity {}", header.len, header.capacity),
            ));
        }
        if header.data.is_null() && header.len > 0 {
            return Err(corrupt(address, "null character pointer"));
        }
        Ok(header)
    }

    /// Read the characters of the string at `address`.
    pub fn read<M: MemoryAccess + ?Sized>(&self, memory: &M, address: Address) -> Result<Vec<u8>>
    {
        let header = self.header(memory, address)?;
        if header.len == 0 {
            return Ok(Vec::new());
        }
        memory.read_bytes(header.data, header.len)
    }

    /// Replace the characters of the string at `address` without reallocating.
    ///
    /// Writes the characters plus a terminator, then the new length.
    ///
    /// ## Errors
    ///
    /// - `CapacityExceeded` if `text` does not fit the current capacity
    /// - `InvalidArgument` for a copy-on-write string shared with other owners
    pub fn write<M: MemoryAccess + ?Sized>(&self, memory: &M, address: Address, text: &[u8]) -> Result<()>
    {
        let header = self.header(memory, address)?;
        if text.len() > header.capacity {
            return Err(BurrowError::CapacityExceeded {
                needed: text.len(),
                capacity: header.capacity,
            });
        }

        let word = memory.pointer_width().bytes() as u64;
        if let StringLayout::GnuCow { .. } = self {
            let refcount = memory.read_i32(header.data - word)?;
            if refcount > 0 {
                return Err(BurrowError::InvalidArgument(format!(
                    "string at {address} is shared ({} extra owners)",
                    refcount
                )));
            }
        }

        let mut bytes = Vec::with_capacity(text.len() + 1);
        bytes.extend_from_slice(text);
        bytes.push(0);
        memory.write(header.data, bytes.len(), &bytes)?;

        let len = text.len() as u64;
        match *self {
            StringLayout::Msvc { size, .. } | StringLayout::GnuSso { size, .. } => {
                write_word(memory, field(address, size)?, len)
            }
            StringLayout::GnuCow { .. } => write_word(memory, header.data - 3 * word, len),
        }
    }
}

fn read_word<M: MemoryAccess + ?Sized>(memory: &M, address: Address) -> Result<u64>
{
    Ok(memory.read_pointer(address)?.value())
}

fn write_word<M: MemoryAccess + ?Sized>(memory: &M, address: Address, value: u64) -> Result<()>
{
    memory.write_pointer(address, Address::new(value))
}

fn to_len(value: u64, address: Address) -> Result<usize>
{
    usize::try_from(value)
        .ok()
        .filter(|&len| len <= MAX_STRING_BYTES)
        .ok_or_else(|| corrupt(address, &format!("implausible size field {value:#x}")))
}

/// `base + offset`, failing instead of wrapping past the top of the address space
fn field(base: Address, offset: u64) -> Result<Address>
{
    base.checked_add(offset)
        .ok_or_else(|| corrupt(base, &format!("field at +{offset:#x} lies past the end of the address space")))
}

fn corrupt(address: Address, details: &str) -> BurrowError
{
    BurrowError::CorruptContainer {
        address,
        details: details.to_string(),
    }
}

/// Read up to `max` bytes, stopping at the first NUL.
///
/// Each read stops at a page boundary, so the bytes after the terminator are
/// never requested and a string at the very end of a mapping reads cleanly.
pub(crate) fn read_c_bytes<M: MemoryAccess + ?Sized>(memory: &M, address: Address, max: usize) -> Result<Vec<u8>>
{
    let mut out = Vec::new();
    let mut chunk = [0u8; C_STRING_CHUNK];
    let mut cursor = address;

    while out.len() < max {
        let to_boundary = C_STRING_CHUNK - (cursor.value() % C_STRING_CHUNK as u64) as usize;
        let want = to_boundary.min(max - out.len());
        memory.read(cursor, want, &mut chunk[..want])?;

        if let Some(nul) = chunk[..want].iter().position(|&byte| byte == 0) {
            out.extend_from_slice(&chunk[..nul]);
            return Ok(out);
        }
        out.extend_from_slice(&chunk[..want]);
        cursor = cursor.checked_add(want as u64).ok_or_else(|| {
            BurrowError::InvalidArgument(format!("C string at {address} runs off the address space"))
        })?;
    }
    Ok(out)
}

/// Write `text` and a terminator into a buffer of `capacity` bytes.
pub(crate) fn write_c_bytes<M: MemoryAccess + ?Sized>(
    memory: &M,
    address: Address,
    text: &[u8],
    capacity: usize,
) -> Result<()>
{
    if text.contains(&0) {
        return Err(BurrowError::InvalidArgument("C string contains an interior NUL".to_string()));
    }
    if text.len() + 1 > capacity {
        return Err(BurrowError::CapacityExceeded {
            needed: text.len() + 1,
            capacity,
        });
    }
    let mut bytes = Vec::with_capacity(text.len() + 1);
    bytes.extend_from_slice(text);
    bytes.push(0);
    memory.write(address, bytes.len(), &bytes)
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::memory_map::Permissions;
    use crate::platform::mock::MockProcess;

    const OBJECT: u64 = 0x1000;
    const HEAP: u64 = 0x2000;

    fn target() -> MockProcess
    {
        MockProcess::builder(3)
            .region(0x1000, 0x1000, Permissions::READ_WRITE, Some("[heap]"))
            .region(0x2000, 0x1000, Permissions::READ_WRITE, Some("[heap]"))
            .build()
    }

    /// Lay out an MSVC string the way the runtime would for `text`.
    fn store_msvc(mem: &MockProcess, text: &[u8])
    {
        let object = Address::new(OBJECT);
        if text.len() < 16 {
            mem.write_bytes(object, text).unwrap();
            mem.write_u8(object + text.len() as u64, 0).unwrap();
            mem.write_u64(object + 24, 15).unwrap();
        } else {
            mem.write_bytes(Address::new(HEAP), text).unwrap();
            mem.write_u8(Address::new(HEAP + text.len() as u64), 0).unwrap();
            mem.write_u64(object, HEAP).unwrap();
            mem.write_u64(object + 24, text.len().max(31) as u64).unwrap();
        }
        mem.write_u64(object + 16, text.len() as u64).unwrap();
    }

    #[test]
    fn msvc_threshold_boundary_decodes_both_branches()
    {
        let layout = StringLayout::msvc(PointerWidth::Eight);
        for len in [15usize, 16, 17] {
            let mem = target();
            let text: Vec<u8> = (0..len).map(|i| b'a' + (i % 26) as u8).collect();
            store_msvc(&mem, &text);

            let header = layout.header(&mem, Address::new(OBJECT)).unwrap();
            assert_eq!(header.inline, len < 16, "len {len}");
            assert_eq!(mem.read_std_string(Address::new(OBJECT), &layout).unwrap(), text);
        }
    }

    #[test]
    fn gnu_sso_threshold_boundary()
    {
        let layout = StringLayout::gnu_sso(PointerWidth::Eight);
        for len in [14usize, 15, 16] {
            let mem = target();
            let object = Address::new(OBJECT);
            let text = vec![b'x'; len];
            if len <= 15 {
                mem.write_u64(object, OBJECT + 16).unwrap();
                mem.write_bytes(object + 16, &text).unwrap();
            } else {
                mem.write_u64(object, HEAP).unwrap();
                mem.write_u64(object + 16, 30).unwrap();
                mem.write_bytes(Address::new(HEAP), &text).unwrap();
            }
            mem.write_u64(object + 8, len as u64).unwrap();

            let header = layout.header(&mem, object).unwrap();
            assert_eq!(header.inline, len <= 15);
            assert_eq!(layout.read(&mem, object).unwrap(), text);
        }
    }

    #[test]
    fn gnu_cow_reads_header_before_characters()
    {
        let mem = target();
        let data = HEAP + 24;
        mem.write_u64(Address::new(HEAP), 5).unwrap();
        mem.write_u64(Address::new(HEAP + 8), 8).unwrap();
        mem.write_i32(Address::new(HEAP + 16), 0).unwrap();
        mem.write_bytes(Address::new(data), b"urist\0").unwrap();
        mem.write_u64(Address::new(OBJECT), data).unwrap();

        let layout = StringLayout::gnu_cow();
        assert_eq!(layout.read(&mem, Address::new(OBJECT)).unwrap(), b"urist");

        layout.write(&mem, Address::new(OBJECT), b"cat").unwrap();
        assert_eq!(layout.read(&mem, Address::new(OBJECT)).unwrap(), b"cat");

        mem.write_i32(Address::new(HEAP + 16), 1).unwrap();
        assert!(matches!(
            layout.write(&mem, Address::new(OBJECT), b"dog"),
            Err(BurrowError::InvalidArgument(_))
        ));
    }

    #[test]
    fn length_past_capacity_is_corrupt()
    {
        let mem = target();
        let object = Address::new(OBJECT);
        mem.write_u64(object + 16, 40).unwrap();
        mem.write_u64(object + 24, 15).unwrap();

        let layout = StringLayout::msvc(PointerWidth::Eight);
        assert!(matches!(layout.read(&mem, object), Err(BurrowError::CorruptContainer { .. })));
    }

    #[test]
    fn field_offsets_do_not_wrap_the_address_space()
    {
        let mem = target();
        let near_top = Address::new(u64::MAX - 4);
        for layout in [StringLayout::msvc(PointerWidth::Eight), StringLayout::gnu_sso(PointerWidth::Eight)] {
            assert!(matches!(layout.header(&mem, near_top), Err(BurrowError::CorruptContainer { .. })));
            assert!(matches!(layout.write(&mem, near_top, b"x"), Err(BurrowError::CorruptContainer { .. })));
        }
    }

    #[test]
    fn writes_stay_within_capacity()
    {
        let mem = target();
        store_msvc(&mem, b"short");
        let layout = StringLayout::msvc(PointerWidth::Eight);
        let object = Address::new(OBJECT);

        layout.write(&mem, object, b"fifteen chars!!").unwrap();
        assert_eq!(layout.read(&mem, object).unwrap(), b"fifteen chars!!");

        assert!(matches!(
            layout.write(&mem, object, b"sixteen chars!!!"),
            Err(BurrowError::CapacityExceeded {
                needed: 16,
                capacity: 15
            })
        ));
    }

    #[test]
    fn layout_from_descriptor()
    {
        let mut info = VersionInfo::new("test");
        info.root_mut()
            .group_mut("string")
            .set_string("kind", "msvc")
            .set_offset("size", 20)
            .set_hex_value("inline_capacity", 8);

        assert_eq!(
            StringLayout::from_descriptor(&info, PointerWidth::Four).unwrap(),
            StringLayout::Msvc {
                buffer: 0,
                size: 20,
                capacity: 24,
                inline_capacity: 8
            }
        );

        info.root_mut().group_mut("string").set_string("kind", "rope");
        assert!(matches!(
            StringLayout::from_descriptor(&info, PointerWidth::Four),
            Err(BurrowError::Config(_))
        ));

        let empty = VersionInfo::new("bare");
        assert!(StringLayout::from_descriptor(&empty, PointerWidth::Eight)
            .unwrap_err()
            .is_definition_error());
    }

    #[test]
    fn c_string_stops_at_unmapped_page()
    {
        let mem = MockProcess::builder(3)
            .region(0x1000, 0x1000, Permissions::READ_WRITE, None)
            .build();
        // terminator is the last byte of the mapping
        let start = Address::new(0x1FF0);
        mem.write_bytes(start, b"dwarf fortress!\0").unwrap();
        assert_eq!(mem.read_c_string(start, 4096).unwrap(), "dwarf fortress!");
        assert_eq!(mem.read_c_string(start, 5).unwrap(), "dwarf");

        // no terminator before the mapping ends
        mem.write_u8(Address::new(0x1FFF), b'x').unwrap();
        assert!(mem.read_c_string(start, 4096).is_err());
    }

    #[test]
    fn c_string_writes_are_bounded()
    {
        let mem = target();
        let at = Address::new(OBJECT);
        mem.write_c_string(at, b"axe", 4).unwrap();
        assert_eq!(mem.read_c_string(at, 64).unwrap(), "axe");
        assert!(matches!(
            mem.write_c_string(at, b"pick", 4),
            Err(BurrowError::CapacityExceeded { needed: 5, .. })
        ));
        assert!(mem.write_c_string(at, b"a\0b", 8).is_err());
    }
}
