//! # Version/Offset Descriptor
//!
//! Symbolic name → offset/address resolution for one build of the target.
//!
//! The game has no stable ABI: every release moves globals and reshuffles
//! structure fields. A [`VersionInfo`] captures one build's layout as a tree of
//! named [`OffsetGroup`]s. Each group holds four kinds of entries:
//!
//! | kind | meaning | example |
//! |---|---|---|
//! | offset | signed byte offset inside a structure | `creature.x_offset` |
//! | address | absolute address in the executable image | `world` |
//! | hex value | unsigned constant | `string.inline_capacity` |
//! | string | free-form text | `string.kind` |
//!
//! Every entry is in one of three states, see [`Entry`]. Lookups always return
//! a `Result`, and a failure carries the kind, the fully-qualified group name
//! and the key, so "this tool does not support this game version" is
//! diagnosable from the error alone instead of surfacing as a bad pointer
//! three layers later.
//!
//! ## Example
//!
//! ```rust
//! use burrow_core::descriptor::VersionInfo;
//! use burrow_core::error::BurrowError;
//!
//! let mut info = VersionInfo::new("v0.47.05 linux64");
//! info.root_mut().group_mut("creature").set_offset("x_offset", 0x10);
//!
//! assert_eq!(info.offset_path("creature.x_offset")?, 0x10);
//! assert!(matches!(
//!     info.offset_path("creature.y_offset"),
//!     Err(BurrowError::MissingDefinition { .. })
//! ));
//! # Ok::<(), BurrowError>(())
//! ```

mod fingerprint;
mod table;

use std::collections::BTreeMap;

use tracing::warn;

pub use fingerprint::{fingerprint_bytes, fingerprint_file};
pub use table::VersionTable;

use crate::error::{BurrowError, DefinitionKind, Result};
use crate::types::{Address, TargetOs};

/// State of a single descriptor entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry<T>
{
    /// Known value for this build
    Valid(T),
    /// Known not to exist in this build
    Invalid,
    /// Declared but never filled in
    Unset,
}

impl<T> Entry<T>
{
    /// The value, if valid.
    pub fn valid(&self) -> Option<&T>
    {
        match self {
            Entry::Valid(value) => Some(value),
            Entry::Invalid | Entry::Unset => None,
        }
    }
}

/// A named scope of descriptor entries
///
/// Groups nest; the full name of a group is the dot-joined path from the root,
/// dot-terminated (`"string.msvc."`), and the root's full name is empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetGroup
{
    name: String,
    full_name: String,
    offsets: BTreeMap<String, Entry<i64>>,
    addresses: BTreeMap<String, Entry<Address>>,
    hex_values: BTreeMap<String, Entry<u64>>,
    strings: BTreeMap<String, Entry<String>>,
    groups: BTreeMap<String, OffsetGroup>,
}

impl OffsetGroup
{
    /// Create an empty root group.
    pub fn root() -> Self
    {
        Self::default()
    }

    fn child(parent_full_name: &str, name: &str) -> Self
    {
        Self {
            name: name.to_string(),
            full_name: format!("{parent_full_name}{name}."),
            ..Self::default()
        }
    }

    /// Short name (empty for the root)
    pub fn name(&self) -> &str
    {
        &self.name
    }

    /// Dot-terminated path from the root (`"creature."`)
    pub fn full_name(&self) -> &str
    {
        &self.full_name
    }

    fn missing(&self, kind: DefinitionKind, key: &str) -> BurrowError
    {
        BurrowError::MissingDefinition {
            kind,
            group: self.full_name.clone(),
            key: key.to_string(),
        }
    }

    fn resolve<'a, T>(&self, kind: DefinitionKind, map: &'a BTreeMap<String, Entry<T>>, key: &str) -> Result<&'a T>
    {
        match map.get(key) {
            Some(Entry::Valid(value)) => Ok(value),
            Some(Entry::Invalid) => Err(BurrowError::InvalidDefinition {
                kind,
                group: self.full_name.clone(),
                key: key.to_string(),
            }),
            Some(Entry::Unset) => Err(BurrowError::UnsetDefinition {
                kind,
                group: self.full_name.clone(),
                key: key.to_string(),
            }),
            None => Err(self.missing(kind, key)),
        }
    }

    // ---- lookups ----

    /// Direct child group.
    ///
    /// ## Errors
    ///
    /// - `MissingDefinition` with kind `Group` if there is no such child
    pub fn group(&self, name: &str) -> Result<&OffsetGroup>
    {
        self.groups
            .get(name)
            .ok_or_else(|| self.missing(DefinitionKind::Group, name))
    }

    /// Nested group by dotted path (`"string.msvc"`).
    ///
    /// The error names the deepest group that exists and the first missing
    /// component.
    pub fn group_path(&self, path: &str) -> Result<&OffsetGroup>
    {
        path.split('.')
            .filter(|part| !part.is_empty())
            .try_fold(self, |group, part| group.group(part))
    }

    /// Relative byte offset.
    ///
    /// ## Errors
    ///
    /// - `MissingDefinition`: no such key in this group
    /// - `UnsetDefinition`: declared without a value
    /// - `InvalidDefinition`: marked as absent in this build
    pub fn offset(&self, key: &str) -> Result<i64>
    {
        self.resolve(DefinitionKind::Offset, &self.offsets, key).copied()
    }

    /// Absolute address.
    ///
    /// ## Errors
    ///
    /// Same as [`OffsetGroup::offset`].
    pub fn address(&self, key: &str) -> Result<Address>
    {
        self.resolve(DefinitionKind::Address, &self.addresses, key).copied()
    }

    /// Unsigned constant.
    pub fn hex_value(&self, key: &str) -> Result<u64>
    {
        self.resolve(DefinitionKind::HexValue, &self.hex_values, key).copied()
    }

    /// String value.
    pub fn string(&self, key: &str) -> Result<&str>
    {
        self.resolve(DefinitionKind::String, &self.strings, key).map(String::as_str)
    }

    /// Offset if valid, `None` for every failure state.
    pub fn try_offset(&self, key: &str) -> Option<i64>
    {
        self.offsets.get(key).and_then(Entry::valid).copied()
    }

    /// Address if valid.
    pub fn try_address(&self, key: &str) -> Option<Address>
    {
        self.addresses.get(key).and_then(Entry::valid).copied()
    }

    /// Hex value if valid.
    pub fn try_hex_value(&self, key: &str) -> Option<u64>
    {
        self.hex_values.get(key).and_then(Entry::valid).copied()
    }

    /// String if valid.
    pub fn try_string(&self, key: &str) -> Option<&str>
    {
        self.strings.get(key).and_then(Entry::valid).map(String::as_str)
    }

    /// Offset by dotted path; the last component is the key (`"creature.x_offset"`).
    pub fn offset_path(&self, path: &str) -> Result<i64>
    {
        let (group, key) = self.split_path(path)?;
        group.offset(key)
    }

    /// Address by dotted path.
    pub fn address_path(&self, path: &str) -> Result<Address>
    {
        let (group, key) = self.split_path(path)?;
        group.address(key)
    }

    /// Hex value by dotted path.
    pub fn hex_value_path(&self, path: &str) -> Result<u64>
    {
        let (group, key) = self.split_path(path)?;
        group.hex_value(key)
    }

    fn split_path<'p>(&self, path: &'p str) -> Result<(&OffsetGroup, &'p str)>
    {
        match path.rsplit_once('.') {
            Some((prefix, key)) => Ok((self.group_path(prefix)?, key)),
            None => Ok((self, path)),
        }
    }

    /// Names of the direct child groups.
    pub fn group_names(&self) -> impl Iterator<Item = &str>
    {
        self.groups.keys().map(String::as_str)
    }

    /// Every `(key, state)` offset pair of this group.
    pub fn offsets(&self) -> impl Iterator<Item = (&str, &Entry<i64>)>
    {
        self.offsets.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Every `(key, state)` address pair of this group.
    pub fn addresses(&self) -> impl Iterator<Item = (&str, &Entry<Address>)>
    {
        self.addresses.iter().map(|(k, v)| (k.as_str(), v))
    }

    // ---- construction ----

    /// Child group, created if absent.
    pub fn group_mut(&mut self, name: &str) -> &mut OffsetGroup
    {
        let parent = self.full_name.clone();
        self.groups
            .entry(name.to_string())
            .or_insert_with(|| OffsetGroup::child(&parent, name))
    }

    /// Set a valid offset.
    pub fn set_offset(&mut self, key: &str, value: i64) -> &mut Self
    {
        self.offsets.insert(key.to_string(), Entry::Valid(value));
        self
    }

    /// Set a valid address.
    pub fn set_address(&mut self, key: &str, value: Address) -> &mut Self
    {
        self.addresses.insert(key.to_string(), Entry::Valid(value));
        self
    }

    /// Set a valid hex value.
    pub fn set_hex_value(&mut self, key: &str, value: u64) -> &mut Self
    {
        self.hex_values.insert(key.to_string(), Entry::Valid(value));
        self
    }

    /// Set a valid string.
    pub fn set_string(&mut self, key: &str, value: &str) -> &mut Self
    {
        self.strings.insert(key.to_string(), Entry::Valid(value.to_string()));
        self
    }

    /// Declare an entry without a value (`Unset`).
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` for `DefinitionKind::Group`, which has no entry states.
    pub fn declare(&mut self, kind: DefinitionKind, key: &str) -> Result<&mut Self>
    {
        self.put_state(kind, key, false)
    }

    /// Mark an entry as not existing in this build (`Invalid`).
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` for `DefinitionKind::Group`.
    pub fn invalidate(&mut self, kind: DefinitionKind, key: &str) -> Result<&mut Self>
    {
        self.put_state(kind, key, true)
    }

    fn put_state(&mut self, kind: DefinitionKind, key: &str, invalid: bool) -> Result<&mut Self>
    {
        fn state<T>(invalid: bool) -> Entry<T>
        {
            if invalid { Entry::Invalid } else { Entry::Unset }
        }

        let key = key.to_string();
        match kind {
            DefinitionKind::Offset => {
                self.offsets.insert(key, state(invalid));
            }
            DefinitionKind::Address => {
                self.addresses.insert(key, state(invalid));
            }
            DefinitionKind::HexValue => {
                self.hex_values.insert(key, state(invalid));
            }
            DefinitionKind::String => {
                self.strings.insert(key, state(invalid));
            }
            DefinitionKind::Group => {
                return Err(BurrowError::InvalidArgument(format!(
                    "groups have no entry state ({}{key})",
                    self.full_name
                )));
            }
        }
        Ok(self)
    }

    pub(crate) fn insert_offset_entry(&mut self, key: &str, entry: Entry<i64>)
    {
        self.offsets.insert(key.to_string(), entry);
    }

    pub(crate) fn insert_address_entry(&mut self, key: &str, entry: Entry<Address>)
    {
        self.addresses.insert(key.to_string(), entry);
    }

    pub(crate) fn insert_hex_entry(&mut self, key: &str, entry: Entry<u64>)
    {
        self.hex_values.insert(key.to_string(), entry);
    }

    /// Shift every valid address in this group and all children by `delta`.
    ///
    /// Addresses that would leave the 64-bit range are marked `Invalid` so a
    /// later lookup fails loudly.
    pub fn rebase(&mut self, delta: i64)
    {
        if delta == 0 {
            return;
        }
        for (key, entry) in &mut self.addresses {
            if let Entry::Valid(address) = *entry {
                *entry = match address.offset(delta) {
                    Some(moved) => Entry::Valid(moved),
                    None => {
                        warn!(group = %self.full_name, key = %key, "address left the address space when rebased");
                        Entry::Invalid
                    }
                };
            }
        }
        for child in self.groups.values_mut() {
            child.rebase(delta);
        }
    }
}

/// Layout description of one build of the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo
{
    version: String,
    os: Option<TargetOs>,
    fingerprint: Option<String>,
    base: Option<Address>,
    root: OffsetGroup,
}

impl VersionInfo
{
    /// Empty descriptor for the given version label.
    pub fn new(version: impl Into<String>) -> Self
    {
        Self {
            version: version.into(),
            os: None,
            fingerprint: None,
            base: None,
            root: OffsetGroup::root(),
        }
    }

    /// Set the OS the build targets.
    #[must_use]
    pub fn with_os(mut self, os: TargetOs) -> Self
    {
        self.os = Some(os);
        self
    }

    /// Set the executable fingerprint (lowercase hex digest).
    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: &str) -> Self
    {
        self.fingerprint = Some(fingerprint.to_ascii_lowercase());
        self
    }

    /// Set the image base the addresses were recorded against.
    #[must_use]
    pub fn with_base(mut self, base: Address) -> Self
    {
        self.base = Some(base);
        self
    }

    /// Version label
    pub fn version(&self) -> &str
    {
        &self.version
    }

    /// Target OS, if recorded
    pub fn os(&self) -> Option<TargetOs>
    {
        self.os
    }

    /// Executable fingerprint, if recorded
    pub fn fingerprint(&self) -> Option<&str>
    {
        self.fingerprint.as_deref()
    }

    /// Image base the addresses currently refer to
    pub fn base(&self) -> Option<Address>
    {
        self.base
    }

    /// Root group
    pub fn root(&self) -> &OffsetGroup
    {
        &self.root
    }

    /// Mutable root group, for building descriptors in code.
    pub fn root_mut(&mut self) -> &mut OffsetGroup
    {
        &mut self.root
    }

    /// Top-level group by name (`getGroup`).
    pub fn group(&self, name: &str) -> Result<&OffsetGroup>
    {
        self.root.group_path(name)
    }

    /// Offset by dotted path.
    pub fn offset_path(&self, path: &str) -> Result<i64>
    {
        self.root.offset_path(path)
    }

    /// Address by dotted path.
    pub fn address_path(&self, path: &str) -> Result<Address>
    {
        self.root.address_path(path)
    }

    /// Move every address so it is relative to `actual_base`.
    ///
    /// Does nothing if no declared base was recorded. Returns the applied delta.
    pub fn rebase_to(&mut self, actual_base: Address) -> i64
    {
        let Some(declared) = self.base else {
            return 0;
        };
        let delta = actual_base.value().wrapping_sub(declared.value()) as i64;
        self.root.rebase(delta);
        self.base = Some(actual_base);
        delta
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn sample() -> VersionInfo
    {
        let mut info = VersionInfo::new("test build").with_base(Address::new(0x40_0000));
        let root = info.root_mut();
        root.set_address("world", Address::new(0x41_0000));
        root.group_mut("creature")
            .set_offset("x_offset", 0x10)
            .set_offset("back", -8);
        root.group_mut("creature")
            .declare(DefinitionKind::Offset, "flags")
            .unwrap()
            .invalidate(DefinitionKind::Offset, "legacy")
            .unwrap();
        root.group_mut("string")
            .group_mut("msvc")
            .set_hex_value("inline_capacity", 16);
        info
    }

    #[test]
    fn full_names_nest()
    {
        let info = sample();
        assert_eq!(info.root().full_name(), "");
        assert_eq!(info.group("creature").unwrap().full_name(), "creature.");
        assert_eq!(info.group("string.msvc").unwrap().full_name(), "string.msvc.");
        assert_eq!(info.group("string.msvc").unwrap().name(), "msvc");
    }

    #[test]
    fn resolves_valid_entries()
    {
        let info = sample();
        assert_eq!(info.offset_path("creature.x_offset").unwrap(), 0x10);
        assert_eq!(info.offset_path("creature.back").unwrap(), -8);
        assert_eq!(info.address_path("world").unwrap(), Address::new(0x41_0000));
        assert_eq!(
            info.root().hex_value_path("string.msvc.inline_capacity").unwrap(),
            16
        );
    }

    #[test]
    fn missing_key_names_group_and_key()
    {
        let info = sample();
        match info.offset_path("creature.y_offset") {
            Err(BurrowError::MissingDefinition { kind, group, key }) => {
                assert_eq!(kind, DefinitionKind::Offset);
                assert_eq!(group, "creature.");
                assert_eq!(key, "y_offset");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn missing_group_names_deepest_existing_parent()
    {
        let info = sample();
        match info.group("string.gnu") {
            Err(BurrowError::MissingDefinition { kind, group, key }) => {
                assert_eq!(kind, DefinitionKind::Group);
                assert_eq!(group, "string.");
                assert_eq!(key, "gnu");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn unset_and_invalid_are_distinct()
    {
        let info = sample();
        let creature = info.group("creature").unwrap();
        assert!(matches!(
            creature.offset("flags"),
            Err(BurrowError::UnsetDefinition { .. })
        ));
        assert!(matches!(
            creature.offset("legacy"),
            Err(BurrowError::InvalidDefinition { .. })
        ));
        assert_eq!(creature.try_offset("flags"), None);
        assert_eq!(creature.try_offset("legacy"), None);
        assert_eq!(creature.try_offset("x_offset"), Some(0x10));
    }

    #[test]
    fn kinds_do_not_alias()
    {
        let info = sample();
        // x_offset is an offset, not an address
        assert!(matches!(
            info.group("creature").unwrap().address("x_offset"),
            Err(BurrowError::MissingDefinition {
                kind: DefinitionKind::Address,
                ..
            })
        ));
    }

    #[test]
    fn declaring_a_group_state_is_rejected()
    {
        let mut group = OffsetGroup::root();
        assert!(group.declare(DefinitionKind::Group, "x").is_err());
    }

    #[test]
    fn rebase_moves_every_address()
    {
        let mut info = sample();
        info.root_mut()
            .group_mut("creature")
            .set_address("vtable", Address::new(0x42_0000));

        let delta = info.rebase_to(Address::new(0x5555_0000_0000));
        assert_eq!(delta, 0x5555_0000_0000 - 0x40_0000);
        assert_eq!(info.base(), Some(Address::new(0x5555_0000_0000)));
        assert_eq!(info.address_path("world").unwrap(), Address::new(0x5555_0001_0000));
        assert_eq!(
            info.address_path("creature.vtable").unwrap(),
            Address::new(0x5555_0002_0000)
        );
        // offsets are relative and stay put
        assert_eq!(info.offset_path("creature.x_offset").unwrap(), 0x10);
    }

    #[test]
    fn rebase_without_declared_base_is_noop()
    {
        let mut info = VersionInfo::new("no base");
        info.root_mut().set_address("world", Address::new(0x1000));
        assert_eq!(info.rebase_to(Address::new(0x9000)), 0);
        assert_eq!(info.address_path("world").unwrap(), Address::new(0x1000));
    }
}
