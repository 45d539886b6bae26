//! Recovering class names of polymorphic objects from RTTI.
//!
//! Every polymorphic object starts with a vtable pointer, and every vtable is
//! preceded by a pointer to compiler-specific type information. Two schemes
//! cover the builds the game ships:
//!
//! - **Itanium** (GCC, Clang): `vtable[-1]` points at a `type_info` whose
//!   second word is a mangled name such as `N2df4unitE`.
//! - **MSVC**: `vtable[-1]` points at a Complete Object Locator. Its type
//!   descriptor holds a decorated name such as `.?AVunit@df@@`. 64-bit
//!   locators store image-relative offsets instead of pointers.
//!
//! Resolution is cached per vtable in a [`ClassNameResolver`], since every
//! object of a class shares one vtable.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tracing::trace;

use crate::descriptor::VersionInfo;
use crate::error::{BurrowError, Result};
use crate::overlay::{MemoryAccess, TypedMemory};
use crate::types::{Address, PointerWidth, TargetOs};

/// Longest type name read from the target
const MAX_TYPE_NAME: usize = 512;

/// RTTI layout used by the compiler that built the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassNameScheme
{
    /// GCC/Clang `std::type_info`
    Itanium,
    /// Microsoft RTTI
    Msvc,
}

impl ClassNameScheme
{
    /// Scheme used by the usual toolchain of `os`.
    pub fn for_os(os: TargetOs) -> Self
    {
        match os {
            TargetOs::Windows => ClassNameScheme::Msvc,
            TargetOs::Linux | TargetOs::Macos => ClassNameScheme::Itanium,
        }
    }

    /// Pick the scheme for a build.
    ///
    /// An explicit `rtti.scheme` string wins; otherwise the descriptor's OS
    /// decides, then the host OS.
    ///
    /// ## Errors
    ///
    /// `Config` if `rtti.scheme` names an unknown scheme.
    pub fn from_descriptor(info: &VersionInfo) -> Result<Self>
    {
        if let Some(scheme) = info.group("rtti").ok().and_then(|group| group.try_string("scheme")) {
            return match scheme.to_ascii_lowercase().as_str() {
                "itanium" | "gcc" => Ok(ClassNameScheme::Itanium),
                "msvc" => Ok(ClassNameScheme::Msvc),
                other => Err(BurrowError::Config(format!("rtti.scheme: unknown RTTI scheme '{other}'"))),
            };
        }
        let os = info.os().or(TargetOs::host()).unwrap_or(TargetOs::Linux);
        Ok(Self::for_os(os))
    }
}

/// Caching class-name lookup
///
/// Shareable between threads; the cache is keyed by vtable address and lives
/// as long as the resolver. Create a new resolver (or call
/// [`ClassNameResolver::clear`]) after the target reloads code.
#[derive(Debug)]
pub struct ClassNameResolver
{
    scheme: ClassNameScheme,
    cache: Mutex<HashMap<Address, String>>,
}

impl ClassNameResolver
{
    /// Resolver for one RTTI scheme
    pub fn new(scheme: ClassNameScheme) -> Self
    {
        Self {
            scheme,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Scheme in use
    pub fn scheme(&self) -> ClassNameScheme
    {
        self.scheme
    }

    /// Number of cached vtables
    pub fn cached(&self) -> usize
    {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Forget every cached name.
    pub fn clear(&self)
    {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Class name of the object at `object`.
    ///
    /// ## Errors
    ///
    /// I/O errors while walking the RTTI chain; `InvalidArgument` if the
    /// object has a null vtable or an empty type name.
    pub fn resolve<M: MemoryAccess + ?Sized>(&self, memory: &M, object: Address) -> Result<String>
    {
        let vtable = memory.read_pointer(object)?;
        if vtable.is_null() {
            return Err(BurrowError::InvalidArgument(format!("object at {object} has a null vtable")));
        }
        self.resolve_vtable(memory, vtable)
    }

    /// Class name for a vtable address.
    pub fn resolve_vtable<M: MemoryAccess + ?Sized>(&self, memory: &M, vtable: Address) -> Result<String>
    {
        if let Some(name) = self.cache.lock().unwrap_or_else(PoisonError::into_inner).get(&vtable) {
            return Ok(name.clone());
        }

        let raw = match self.scheme {
            ClassNameScheme::Itanium => itanium_type_name(memory, vtable)?,
            ClassNameScheme::Msvc => msvc_type_name(memory, vtable)?,
        };
        if raw.is_empty() {
            return Err(BurrowError::InvalidArgument(format!("vtable {vtable} has an empty type name")));
        }
        let name = match self.scheme {
            ClassNameScheme::Itanium => demangle_itanium(&raw),
            ClassNameScheme::Msvc => demangle_msvc(&raw),
        };
        trace!(%vtable, raw = %raw, name = %name, "resolved class name");

        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(vtable, name.clone());
        Ok(name)
    }
}

fn rtti_slot(vtable: Address, width: PointerWidth) -> Result<Address>
{
    vtable
        .checked_sub(width.bytes() as u64)
        .ok_or_else(|| BurrowError::InvalidArgument(format!("vtable {vtable} has no RTTI slot")))
}

fn itanium_type_name<M: MemoryAccess + ?Sized>(memory: &M, vtable: Address) -> Result<String>
{
    let width = memory.pointer_width();
    let type_info = memory.read_pointer(rtti_slot(vtable, width)?)?;
    let name = memory.read_pointer(type_info + width.bytes() as u64)?;
    memory.read_c_string(name, MAX_TYPE_NAME)
}

fn msvc_type_name<M: MemoryAccess + ?Sized>(memory: &M, vtable: Address) -> Result<String>
{
    let width = memory.pointer_width();
    let locator = memory.read_pointer(rtti_slot(vtable, width)?)?;
    let name = match width {
        PointerWidth::Four => {
            let descriptor = memory.read_pointer(locator + 0xC)?;
            descriptor + 0x8
        }
        PointerWidth::Eight => {
            // 64-bit locators hold RVAs; the locator's own RVA gives the image base.
            let descriptor_rva = u64::from(memory.read_u32(locator + 0xC)?);
            let self_rva = u64::from(memory.read_u32(locator + 0x14)?);
            let image_base = locator
                .checked_sub(self_rva)
                .ok_or_else(|| BurrowError::InvalidArgument(format!("bad object locator at {locator}")))?;
            image_base + descriptor_rva + 0x10
        }
    };
    memory.read_c_string(name, MAX_TYPE_NAME)
}

/// Turn an Itanium type name into `a::b::C` form.
///
/// Handles plain (`4unit`) and nested (`N2df4unitE`) names, which is all the
/// game's classes use. Anything else is returned unchanged.
///
/// ```rust
/// use burrow_core::overlay::demangle_itanium;
///
/// assert_eq!(demangle_itanium("N2df4unitE"), "df::unit");
/// assert_eq!(demangle_itanium("8viewscreen"), "viewscreen");
/// assert_eq!(demangle_itanium("St9exception"), "St9exception");
/// ```
pub fn demangle_itanium(raw: &str) -> String
{
    let trimmed = raw.strip_prefix('*').unwrap_or(raw);
    let parsed = match trimmed.strip_prefix('N') {
        Some(nested) => nested.strip_suffix('E').and_then(parse_source_names),
        None => parse_source_names(trimmed),
    };
    match parsed {
        Some(parts) if !parts.is_empty() => parts.join("::"),
        _ => raw.to_string(),
    }
}

fn parse_source_names(mut text: &str) -> Option<Vec<&str>>
{
    let mut parts = Vec::new();
    while !text.is_empty() {
        let digits = text.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            return None;
        }
        let len: usize = text[..digits].parse().ok()?;
        let rest = &text[digits..];
        parts.push(rest.get(..len)?);
        text = &rest[len..];
    }
    Some(parts)
}

/// Turn an MSVC decorated type name into `a::b::C` form.
///
/// ```rust
/// use burrow_core::overlay::demangle_msvc;
///
/// assert_eq!(demangle_msvc(".?AVunit@df@@"), "df::unit");
/// assert_eq!(demangle_msvc(".?AUcoord@@"), "coord");
/// ```
pub fn demangle_msvc(raw: &str) -> String
{
    let Some(body) = raw.strip_prefix(".?AV").or_else(|| raw.strip_prefix(".?AU")) else {
        return raw.to_string();
    };
    let body = body.strip_suffix("@@").unwrap_or(body);
    let mut parts: Vec<&str> = body.split('@').filter(|part| !part.is_empty()).collect();
    parts.reverse();
    parts.join("::")
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::memory_map::Permissions;
    use crate::platform::mock::MockProcess;

    fn target(width: PointerWidth) -> MockProcess
    {
        MockProcess::builder(9)
            .pointer_width(width)
            .region(0x40_0000, 0x1000, Permissions::READ_ONLY, Some("/opt/df/libg_src_lib.so"))
            .region(0x80_0000, 0x1000, Permissions::READ_WRITE, Some("[heap]"))
            .build()
    }

    #[test]
    fn itanium_chain()
    {
        let mem = target(PointerWidth::Eight);
        let object = Address::new(0x80_0100);
        let vtable = Address::new(0x40_0108);
        let type_info = Address::new(0x40_0200);
        let name = Address::new(0x40_0300);

        mem.poke(name, b"N2df4unitE\0").unwrap();
        mem.poke(type_info + 8, &name.value().to_le_bytes()).unwrap();
        mem.poke(vtable - 8, &type_info.value().to_le_bytes()).unwrap();
        mem.write_pointer(object, vtable).unwrap();

        let resolver = ClassNameResolver::new(ClassNameScheme::Itanium);
        assert_eq!(mem.read_class_name(object, &resolver).unwrap(), "df::unit");
        assert_eq!(resolver.cached(), 1);
    }

    #[test]
    fn msvc_32_bit_chain()
    {
        let mem = target(PointerWidth::Four);
        let object = Address::new(0x80_0100);
        let vtable = Address::new(0x40_0104);
        let locator = Address::new(0x40_0200);
        let descriptor = Address::new(0x40_0300);

        mem.poke(descriptor + 8, b".?AVviewscreen_titlest@@\0").unwrap();
        mem.poke(locator + 0xC, &(descriptor.value() as u32).to_le_bytes()).unwrap();
        mem.poke(vtable - 4, &(locator.value() as u32).to_le_bytes()).unwrap();
        mem.write_u32(object, vtable.value() as u32).unwrap();

        let resolver = ClassNameResolver::new(ClassNameScheme::Msvc);
        assert_eq!(resolver.resolve(&mem, object).unwrap(), "viewscreen_titlest");
    }

    #[test]
    fn msvc_64_bit_chain_uses_image_relative_offsets()
    {
        let mem = target(PointerWidth::Eight);
        let image = 0x40_0000u64;
        let object = Address::new(0x80_0100);
        let vtable = Address::new(image + 0x108);
        let locator = Address::new(image + 0x200);
        let descriptor_rva = 0x300u32;

        mem.poke(Address::new(image + u64::from(descriptor_rva) + 0x10), b".?AVitem_weaponst@df@@\0").unwrap();
        mem.poke(locator + 0xC, &descriptor_rva.to_le_bytes()).unwrap();
        mem.poke(locator + 0x14, &0x200u32.to_le_bytes()).unwrap();
        mem.poke(vtable - 8, &locator.value().to_le_bytes()).unwrap();
        mem.write_pointer(object, vtable).unwrap();

        let resolver = ClassNameResolver::new(ClassNameScheme::Msvc);
        assert_eq!(resolver.resolve(&mem, object).unwrap(), "df::item_weaponst");
    }

    #[test]
    fn cache_is_keyed_by_vtable()
    {
        let mem = target(PointerWidth::Eight);
        let object = Address::new(0x80_0100);
        let vtable = Address::new(0x40_0108);
        mem.poke(Address::new(0x40_0300), b"4unit\0").unwrap();
        mem.poke(Address::new(0x40_0208), &0x40_0300u64.to_le_bytes()).unwrap();
        mem.poke(vtable - 8, &0x40_0200u64.to_le_bytes()).unwrap();
        mem.write_pointer(object, vtable).unwrap();

        let resolver = ClassNameResolver::new(ClassNameScheme::Itanium);
        assert_eq!(resolver.resolve(&mem, object).unwrap(), "unit");

        // the name changes underneath; the cached value is served
        mem.poke(Address::new(0x40_0300), b"4item\0").unwrap();
        assert_eq!(resolver.resolve(&mem, object).unwrap(), "unit");

        resolver.clear();
        assert_eq!(resolver.resolve(&mem, object).unwrap(), "item");
    }

    #[test]
    fn null_vtable_is_rejected()
    {
        let mem = target(PointerWidth::Eight);
        let resolver = ClassNameResolver::new(ClassNameScheme::Itanium);
        assert!(matches!(
            resolver.resolve(&mem, Address::new(0x80_0000)),
            Err(BurrowError::InvalidArgument(_))
        ));
    }

    #[test]
    fn scheme_selection()
    {
        let windows = VersionInfo::new("win").with_os(TargetOs::Windows);
        assert_eq!(ClassNameScheme::from_descriptor(&windows).unwrap(), ClassNameScheme::Msvc);

        let mut forced = VersionInfo::new("linux").with_os(TargetOs::Linux);
        forced.root_mut().group_mut("rtti").set_string("scheme", "msvc");
        assert_eq!(ClassNameScheme::from_descriptor(&forced).unwrap(), ClassNameScheme::Msvc);

        forced.root_mut().group_mut("rtti").set_string("scheme", "borland");
        assert!(ClassNameScheme::from_descriptor(&forced).is_err());
    }

    #[test]
    fn demangling_edge_cases()
    {
        assert_eq!(demangle_itanium("*N6widget4textE"), "widget::text");
        assert_eq!(demangle_itanium("N2dfE"), "df");
        assert_eq!(demangle_itanium("12truncated"), "12truncated");
        assert_eq!(demangle_msvc("not decorated"), "not decorated");
        assert_eq!(demangle_msvc(".?AVa@b@c@@"), "c::b::a");
    }
}
