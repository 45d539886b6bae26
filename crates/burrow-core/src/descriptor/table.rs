//! Collections of [`VersionInfo`] and a TOML loader for them.
//!
//! The file layout is a convenience, not a contract; tools are free to build
//! descriptors in code instead. One `[[version]]` table per build:
//!
//! ```toml
//! [[version]]
//! name = "v0.47.05 linux64"
//! os = "linux"
//! fingerprint = "6b4e03423667dbb73b6e15454f0eb1abd4597f9a1b078e3f5b5a6bc7"
//! base = "0x400000"
//!
//! [version.addresses]
//! world = "0x1a2b3c0"
//!
//! [version.groups.creature.offsets]
//! x_offset = "0x10"
//! flags = "unset"
//! legacy = "invalid"
//!
//! [version.groups.string.strings]
//! kind = "msvc"
//! ```
//!
//! Numeric values may be TOML integers or strings (`"0x10"`, `"-0x8"`, `"42"`).
//! The strings `"invalid"` and `"unset"` (or an empty string) set the entry state.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use super::{Entry, OffsetGroup, VersionInfo};
use crate::error::{BurrowError, Result};
use crate::types::{Address, TargetOs};

/// Every known build of the target
#[derive(Debug, Clone, Default)]
pub struct VersionTable
{
    versions: Vec<VersionInfo>,
}

impl VersionTable
{
    /// Empty table
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Add a descriptor.
    pub fn push(&mut self, info: VersionInfo)
    {
        self.versions.push(info);
    }

    /// Number of known builds
    pub fn len(&self) -> usize
    {
        self.versions.len()
    }

    /// `true` if no builds are known
    pub fn is_empty(&self) -> bool
    {
        self.versions.is_empty()
    }

    /// Iterate the known builds.
    pub fn iter(&self) -> std::slice::Iter<'_, VersionInfo>
    {
        self.versions.iter()
    }

    /// Descriptor whose fingerprint matches (case-insensitive).
    pub fn find_by_fingerprint(&self, fingerprint: &str) -> Option<&VersionInfo>
    {
        self.versions
            .iter()
            .find(|info| info.fingerprint().is_some_and(|known| known.eq_ignore_ascii_case(fingerprint)))
    }

    /// Descriptor with the given version label.
    pub fn find_by_version(&self, version: &str) -> Option<&VersionInfo>
    {
        self.versions.iter().find(|info| info.version() == version)
    }

    /// Parse a table from TOML text.
    ///
    /// ## Errors
    ///
    /// `Config` if the text is not valid TOML, does not match the layout, or a
    /// value is not a number/state keyword.
    pub fn from_toml_str(text: &str) -> Result<Self>
    {
        let raw: RawTable = toml::from_str(text)?;
        let mut table = VersionTable::new();
        for version in raw.version {
            table.push(version.into_info()?);
        }
        debug!(versions = table.len(), "loaded version table");
        Ok(table)
    }

    /// Read and parse a table file.
    ///
    /// ## Errors
    ///
    /// `Io` if the file cannot be read, otherwise as [`VersionTable::from_toml_str`].
    pub fn load(path: &Path) -> Result<Self>
    {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

impl<'a> IntoIterator for &'a VersionTable
{
    type Item = &'a VersionInfo;
    type IntoIter = std::slice::Iter<'a, VersionInfo>;

    fn into_iter(self) -> Self::IntoIter
    {
        self.versions.iter()
    }
}

#[derive(Debug, Deserialize)]
struct RawTable
{
    #[serde(default)]
    version: Vec<RawVersion>,
}

#[derive(Debug, Deserialize)]
struct RawVersion
{
    name: String,
    os: Option<TargetOs>,
    fingerprint: Option<String>,
    base: Option<RawValue>,
    #[serde(flatten)]
    root: RawGroup,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawGroup
{
    offsets: BTreeMap<String, RawValue>,
    addresses: BTreeMap<String, RawValue>,
    hex: BTreeMap<String, RawValue>,
    strings: BTreeMap<String, String>,
    groups: BTreeMap<String, RawGroup>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawValue
{
    Int(i64),
    Text(String),
}

impl RawVersion
{
    fn into_info(self) -> Result<VersionInfo>
    {
        let mut info = VersionInfo::new(self.name);
        if let Some(os) = self.os {
            info = info.with_os(os);
        }
        if let Some(fingerprint) = &self.fingerprint {
            info = info.with_fingerprint(fingerprint);
        }
        if let Some(base) = &self.base {
            match parse_value(base, "base")? {
                Entry::Valid(value) => info = info.with_base(Address::new(value as u64)),
                Entry::Invalid | Entry::Unset => {}
            }
        }
        self.root.apply(info.root_mut())?;
        Ok(info)
    }
}

impl RawGroup
{
    fn apply(self, group: &mut OffsetGroup) -> Result<()>
    {
        for (key, value) in &self.offsets {
            let entry = parse_value(value, &qualified(group, key))?;
            group.insert_offset_entry(key, entry);
        }
        for (key, value) in &self.addresses {
            let entry = parse_value(value, &qualified(group, key))?;
            group.insert_address_entry(key, map_entry(entry, |v| Address::new(v as u64)));
        }
        for (key, value) in &self.hex {
            let entry = parse_value(value, &qualified(group, key))?;
            group.insert_hex_entry(key, map_entry(entry, |v| v as u64));
        }
        for (key, value) in &self.strings {
            group.set_string(key, value);
        }
        for (name, child) in self.groups {
            child.apply(group.group_mut(&name))?;
        }
        Ok(())
    }
}

fn qualified(group: &OffsetGroup, key: &str) -> String
{
    format!("{}{key}", group.full_name())
}

fn map_entry<T, U>(entry: Entry<T>, f: impl FnOnce(T) -> U) -> Entry<U>
{
    match entry {
        Entry::Valid(value) => Entry::Valid(f(value)),
        Entry::Invalid => Entry::Invalid,
        Entry::Unset => Entry::Unset,
    }
}

/// Parse a raw value. Hex strings are read as `u64` and reinterpreted, so
/// addresses above `i64::MAX` survive the trip.
fn parse_value(value: &RawValue, what: &str) -> Result<Entry<i64>>
{
    let text = match value {
        RawValue::Int(number) => return Ok(Entry::Valid(*number)),
        RawValue::Text(text) => text.trim(),
    };

    match text.to_ascii_lowercase().as_str() {
        "" | "unset" => return Ok(Entry::Unset),
        "invalid" => return Ok(Entry::Invalid),
        _ => {}
    }

    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let magnitude = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => digits.parse::<u64>(),
    }
    .map_err(|_| BurrowError::Config(format!("{what}: not a number: '{text}'")))?;

    let value = if negative {
        0i64.checked_sub_unsigned(magnitude)
            .ok_or_else(|| BurrowError::Config(format!("{what}: out of range: '{text}'")))?
    } else {
        magnitude as i64
    };
    Ok(Entry::Valid(value))
}
