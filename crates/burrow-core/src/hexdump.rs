//! # Hexdump and Byte Search
//!
//! Display and search helpers for raw target memory. Neither is needed by the
//! overlays; they exist for tools that show memory to a person.
//!
//! ```rust
//! use burrow_core::hexdump::format_hexdump;
//! use burrow_core::types::Address;
//!
//! let dump = format_hexdump(Address::new(0x1000), b"burrow\0\x01", 8);
//! assert_eq!(dump, "0000000000001000: 62 75 72 72 6f 77 00 01  burrow..\n");
//! ```

use std::cmp::min;
use std::fmt::Write;

use crate::error::{BurrowError, Result};
use crate::overlay::{MemoryAccess, TypedMemory};
use crate::types::Address;

/// Bytes read per step of [`find_pattern`]
const PATTERN_SCAN_CHUNK: usize = 64 * 1024;

/// Format `bytes` as lines of `width` hex bytes plus their ASCII rendering.
///
/// `width` is clamped to 8..=32. Each line starts with the address of its
/// first byte, counted from `base`.
pub fn format_hexdump(base: Address, bytes: &[u8], width: usize) -> String
{
    let width = width.clamp(8, 32);
    let mut out = String::new();
    for (line, chunk) in bytes.chunks(width).enumerate() {
        let address = base.value().saturating_add((line * width) as u64);
        let _ = write!(out, "{address:016x}: ");

        for index in 0..width {
            match chunk.get(index) {
                Some(byte) => {
                    let _ = write!(out, "{byte:02x} ");
                }
                None => out.push_str("   "),
            }
        }

        out.push(' ');
        out.extend(chunk.iter().map(|&byte| {
            if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                '.'
            }
        }));
        out.push('\n');
    }
    out
}

/// Parse `"de ad be ef"`, `"deadbeef"` or `"0xde 0xad"` into bytes.
pub fn parse_hex_bytes(text: &str) -> Result<Vec<u8>>
{
    let digits: String = text
        .split_whitespace()
        .map(|part| part.strip_prefix("0x").or_else(|| part.strip_prefix("0X")).unwrap_or(part))
        .collect();
    if digits.is_empty() || digits.len() % 2 != 0 {
        return Err(BurrowError::InvalidArgument(format!("'{text}' is not a whole number of hex bytes")));
    }
    (0..digits.len())
        .step_by(2)
        .map(|index| {
            u8::from_str_radix(&digits[index..index + 2], 16)
                .map_err(|_| BurrowError::InvalidArgument(format!("'{text}' is not valid hex")))
        })
        .collect()
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize>
{
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Search `len` bytes from `start` for `pattern`.
///
/// Memory is read in chunks that overlap by `pattern.len() - 1` bytes, so a
/// match spanning two chunks is still found. Returns the first match.
///
/// ## Errors
///
/// Any read failure inside the range; a search never skips memory silently.
pub fn find_pattern<M: MemoryAccess + ?Sized>(
    memory: &M,
    start: Address,
    len: usize,
    pattern: &[u8],
) -> Result<Option<Address>>
{
    if pattern.is_empty() {
        return Ok(Some(start));
    }

    let mut scanned = 0usize;
    while scanned < len {
        let chunk_len = min(PATTERN_SCAN_CHUNK, len - scanned);
        let chunk = memory.read_bytes(start.saturating_add(scanned as u64), chunk_len)?;

        if let Some(position) = find_subslice(&chunk, pattern) {
            return Ok(Some(start.saturating_add((scanned + position) as u64)));
        }

        if chunk_len < pattern.len() || scanned + chunk_len >= len {
            break;
        }

        // overlap so boundary matches are seen
        let step = chunk_len.saturating_sub(pattern.len() - 1);
        if step == 0 {
            break;
        }
        scanned += step;
    }

    Ok(None)
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::memory_map::Permissions;
    use crate::platform::mock::MockProcess;

    #[test]
    fn pads_short_last_line()
    {
        let dump = format_hexdump(Address::new(0x10), b"0123456789", 8);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "0000000000000010: 30 31 32 33 34 35 36 37  01234567");
        assert_eq!(lines[1], "0000000000000018: 38 39                    89");
    }

    #[test]
    fn parses_hex_forms()
    {
        assert_eq!(parse_hex_bytes("de ad be ef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(parse_hex_bytes("DEADbeef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(parse_hex_bytes("0x2a 0X00").unwrap(), vec![0x2a, 0x00]);
        assert!(parse_hex_bytes("abc").is_err());
        assert!(parse_hex_bytes("zz").is_err());
        assert!(parse_hex_bytes("").is_err());
    }

    #[test]
    fn finds_matches_across_chunk_boundaries()
    {
        let size = PATTERN_SCAN_CHUNK * 2;
        let mut bytes = vec![0u8; size];
        let at = PATTERN_SCAN_CHUNK - 2;
        bytes[at..at + 4].copy_from_slice(b"DWRF");
        let target = MockProcess::builder(1)
            .region_with_bytes(0x10_0000, bytes, Permissions::READ_ONLY, None)
            .build();

        let found = find_pattern(&target, Address::new(0x10_0000), size, b"DWRF").unwrap();
        assert_eq!(found, Some(Address::new(0x10_0000 + at as u64)));
        assert_eq!(find_pattern(&target, Address::new(0x10_0000), size, b"NOPE").unwrap(), None);
    }

    #[test]
    fn read_failures_surface()
    {
        let target = MockProcess::builder(1)
            .region(0x1000, 0x100, Permissions::READ_WRITE, None)
            .build();
        assert!(find_pattern(&target, Address::new(0x1000), 0x200, b"x").is_err());
    }
}
