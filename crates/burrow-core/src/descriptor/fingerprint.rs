//! Executable fingerprints used to pick a descriptor for a running build.
//!
//! A fingerprint is the lowercase hex SHA3-224 digest of the executable file.

use std::fmt::Write as _;
use std::fs::File;
use std::io;
use std::path::Path;

use sha3::digest::Digest;
use sha3::Sha3_224;

use crate::error::Result;

/// Hash an in-memory byte slice.
///
/// ```rust
/// use burrow_core::descriptor::fingerprint_bytes;
///
/// let digest = fingerprint_bytes(b"");
/// assert_eq!(digest, "6b4e03423667dbb73b6e15454f0eb1abd4597f9a1b078e3f5b5a6bc7");
/// ```
pub fn fingerprint_bytes(bytes: &[u8]) -> String
{
    let mut hasher = Sha3_224::new();
    hasher.update(bytes);
    to_hex(&hasher.finalize())
}

/// Hash a file without reading it into memory in one piece.
///
/// ## Errors
///
/// `Io` if the file cannot be opened or read.
pub fn fingerprint_file(path: &Path) -> Result<String>
{
    let mut file = File::open(path)?;
    let mut hasher = Sha3_224::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(to_hex(&hasher.finalize()))
}

fn to_hex(digest: &[u8]) -> String
{
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
