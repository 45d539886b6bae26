//! # Typed Overlay Layer
//!
//! Turns raw `(address, length, buffer)` I/O into typed values and back.
//!
//! The lowest common denominator of every layer is [`MemoryAccess`]: copy
//! `length` bytes between an address in the target and a caller-owned buffer.
//! [`TypedMemory`] is an extension trait implemented for everything that
//! offers `MemoryAccess`, so a [`Process`](crate::process::Process), a
//! simulated target and any future backend get the same typed API:
//!
//! ```rust
//! use burrow_core::memory_map::Permissions;
//! use burrow_core::overlay::TypedMemory;
//! use burrow_core::platform::mock::MockProcess;
//! use burrow_core::types::Address;
//!
//! let target = MockProcess::builder(1)
//!     .region(0x1000, 0x100, Permissions::READ_WRITE, None)
//!     .build();
//!
//! target.write_u32(Address::new(0x1010), 0x2A)?;
//! assert_eq!(target.read_u32(Address::new(0x1010))?, 0x2A);
//! # Ok::<(), burrow_core::BurrowError>(())
//! ```
//!
//! ## Byte order
//!
//! Values are copied in target byte order and converted with
//! [`target_to_host`]/[`host_to_target`]. The game only ships for
//! little-endian machines, so both are the identity on a little-endian host
//! and can be applied unconditionally.
//!
//! ## Submodules
//!
//! - [`string`]: C strings and the runtime's `std::string` layouts
//! - [`class_name`]: recovering class names from RTTI

pub mod class_name;
pub mod string;

use crate::descriptor::OffsetGroup;
use crate::error::{BurrowError, Result};
use crate::types::{Address, PointerWidth};

pub use class_name::{demangle_itanium, demangle_msvc, ClassNameResolver, ClassNameScheme};
pub use string::StringLayout;

/// The raw I/O boundary every layer is built on
///
/// `buffer` must be at least `length` bytes; only the first `length` bytes
/// are touched. Implementations must either transfer all `length` bytes or
/// fail: a short read never returns partially filled data as success.
pub trait MemoryAccess
{
    /// Copy `length` bytes at `address` into `buffer`.
    ///
    /// ## Errors
    ///
    /// - `MemoryRead`: unmapped or unreadable range
    /// - `ProcessExited`: the target went away
    /// - `InvalidArgument`: `buffer` shorter than `length`
    fn read(&self, address: Address, length: usize, buffer: &mut [u8]) -> Result<()>;

    /// Copy `length` bytes from `buffer` to `address`.
    ///
    /// ## Errors
    ///
    /// - `MemoryWrite`: unmapped or read-only range
    /// - `ProcessExited`: the target went away
    /// - `InvalidArgument`: `buffer` shorter than `length`
    fn write(&self, address: Address, length: usize, buffer: &[u8]) -> Result<()>;

    /// Pointer size of the target.
    fn pointer_width(&self) -> PointerWidth;
}

impl<M: MemoryAccess + ?Sized> MemoryAccess for &M
{
    fn read(&self, address: Address, length: usize, buffer: &mut [u8]) -> Result<()>
    {
        (**self).read(address, length, buffer)
    }

    fn write(&self, address: Address, length: usize, buffer: &[u8]) -> Result<()>
    {
        (**self).write(address, length, buffer)
    }

    fn pointer_width(&self) -> PointerWidth
    {
        (**self).pointer_width()
    }
}

/// Check the `(length, buffer)` half of the boundary contract.
pub(crate) fn check_buffer(length: usize, available: usize) -> Result<()>
{
    if available < length {
        return Err(BurrowError::InvalidArgument(format!(
            "buffer holds {available} bytes but {length} were requested"
        )));
    }
    Ok(())
}

/// Largest [`Scalar::SIZE`]; typed accessors stage values in a buffer this wide.
pub const MAX_SCALAR_SIZE: usize = 8;

mod sealed
{
    pub trait Sealed {}
}

/// Fixed-width plain value that can be copied to and from the target
///
/// Sealed: implemented for the primitive integers and floats only.
pub trait Scalar: Copy + sealed::Sealed
{
    /// Size in bytes
    const SIZE: usize;

    /// Decode from the first `SIZE` bytes of `bytes`, native order.
    fn from_ne_slice(bytes: &[u8]) -> Self;

    /// Encode into the first `SIZE` bytes of `out`, native order.
    fn write_ne_slice(self, out: &mut [u8]);

    /// Reverse the byte order.
    #[must_use]
    fn reverse_bytes(self) -> Self;
}

macro_rules! impl_scalar_int {
    ($($ty:ty),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Scalar for $ty
            {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn from_ne_slice(bytes: &[u8]) -> Self
                {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_ne_bytes(raw)
                }

                fn write_ne_slice(self, out: &mut [u8])
                {
                    out[..Self::SIZE].copy_from_slice(&self.to_ne_bytes());
                }

                fn reverse_bytes(self) -> Self
                {
                    self.swap_bytes()
                }
            }
        )*
    };
}

macro_rules! impl_scalar_float {
    ($($ty:ty),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Scalar for $ty
            {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn from_ne_slice(bytes: &[u8]) -> Self
                {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_ne_bytes(raw)
                }

                fn write_ne_slice(self, out: &mut [u8])
                {
                    out[..Self::SIZE].copy_from_slice(&self.to_ne_bytes());
                }

                fn reverse_bytes(self) -> Self
                {
                    <$ty>::from_bits(self.to_bits().swap_bytes())
                }
            }
        )*
    };
}

impl_scalar_int!(u8, u16, u32, u64, i8, i16, i32, i64);
impl_scalar_float!(f32, f64);

/// Convert a value read in target byte order to host order.
///
/// Identity on little-endian hosts.
///
/// ```rust
/// use burrow_core::overlay::target_to_host;
///
/// # #[cfg(target_endian = "little")]
/// assert_eq!(target_to_host(0x1234_5678u32), 0x1234_5678);
/// ```
#[inline]
pub fn target_to_host<T: Scalar>(value: T) -> T
{
    if cfg!(target_endian = "big") {
        value.reverse_bytes()
    } else {
        value
    }
}

/// Convert a host value to target byte order before writing it.
///
/// Identity on little-endian hosts.
#[inline]
pub fn host_to_target<T: Scalar>(value: T) -> T
{
    target_to_host(value)
}

/// Typed accessors on top of [`MemoryAccess`]
///
/// Implemented for every `MemoryAccess`; bring it into scope and call the
/// methods directly on a process handle.
pub trait TypedMemory: MemoryAccess
{
    /// Read one scalar.
    fn read_scalar<T: Scalar>(&self, address: Address) -> Result<T>
    {
        let mut raw = [0u8; MAX_SCALAR_SIZE];
        self.read(address, T::SIZE, &mut raw[..T::SIZE])?;
        Ok(target_to_host(T::from_ne_slice(&raw)))
    }

    /// Write one scalar.
    fn write_scalar<T: Scalar>(&self, address: Address, value: T) -> Result<()>
    {
        let mut raw = [0u8; MAX_SCALAR_SIZE];
        host_to_target(value).write_ne_slice(&mut raw);
        self.write(address, T::SIZE, &raw[..T::SIZE])
    }

    /// Read `length` bytes into a new vector.
    fn read_bytes(&self, address: Address, length: usize) -> Result<Vec<u8>>
    {
        let mut buffer = vec![0u8; length];
        self.read(address, length, &mut buffer)?;
        Ok(buffer)
    }

    /// Write a whole slice.
    fn write_bytes(&self, address: Address, bytes: &[u8]) -> Result<()>
    {
        self.write(address, bytes.len(), bytes)
    }

    /// Byte
    fn read_u8(&self, address: Address) -> Result<u8>
    {
        self.read_scalar(address)
    }

    /// 16-bit word
    fn read_u16(&self, address: Address) -> Result<u16>
    {
        self.read_scalar(address)
    }

    /// 32-bit dword
    fn read_u32(&self, address: Address) -> Result<u32>
    {
        self.read_scalar(address)
    }

    /// 64-bit quad
    fn read_u64(&self, address: Address) -> Result<u64>
    {
        self.read_scalar(address)
    }

    /// Signed byte
    fn read_i8(&self, address: Address) -> Result<i8>
    {
        self.read_scalar(address)
    }

    /// Signed word
    fn read_i16(&self, address: Address) -> Result<i16>
    {
        self.read_scalar(address)
    }

    /// Signed dword
    fn read_i32(&self, address: Address) -> Result<i32>
    {
        self.read_scalar(address)
    }

    /// Signed quad
    fn read_i64(&self, address: Address) -> Result<i64>
    {
        self.read_scalar(address)
    }

    /// Single-precision float
    fn read_f32(&self, address: Address) -> Result<f32>
    {
        self.read_scalar(address)
    }

    /// Double-precision float
    fn read_f64(&self, address: Address) -> Result<f64>
    {
        self.read_scalar(address)
    }

    /// Byte
    fn write_u8(&self, address: Address, value: u8) -> Result<()>
    {
        self.write_scalar(address, value)
    }

    /// 16-bit word
    fn write_u16(&self, address: Address, value: u16) -> Result<()>
    {
        self.write_scalar(address, value)
    }

    /// 32-bit dword
    fn write_u32(&self, address: Address, value: u32) -> Result<()>
    {
        self.write_scalar(address, value)
    }

    /// 64-bit quad
    fn write_u64(&self, address: Address, value: u64) -> Result<()>
    {
        self.write_scalar(address, value)
    }

    /// Signed byte
    fn write_i8(&self, address: Address, value: i8) -> Result<()>
    {
        self.write_scalar(address, value)
    }

    /// Signed word
    fn write_i16(&self, address: Address, value: i16) -> Result<()>
    {
        self.write_scalar(address, value)
    }

    /// Signed dword
    fn write_i32(&self, address: Address, value: i32) -> Result<()>
    {
        self.write_scalar(address, value)
    }

    /// Signed quad
    fn write_i64(&self, address: Address, value: i64) -> Result<()>
    {
        self.write_scalar(address, value)
    }

    /// Single-precision float
    fn write_f32(&self, address: Address, value: f32) -> Result<()>
    {
        self.write_scalar(address, value)
    }

    /// Double-precision float
    fn write_f64(&self, address: Address, value: f64) -> Result<()>
    {
        self.write_scalar(address, value)
    }

    /// Read a target pointer, zero-extended for 32-bit targets.
    fn read_pointer(&self, address: Address) -> Result<Address>
    {
        let raw = match self.pointer_width() {
            PointerWidth::Four => u64::from(self.read_u32(address)?),
            PointerWidth::Eight => self.read_u64(address)?,
        };
        Ok(Address::new(raw))
    }

    /// Write a target pointer.
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` if the value does not fit a 32-bit target.
    fn write_pointer(&self, address: Address, value: Address) -> Result<()>
    {
        match self.pointer_width() {
            PointerWidth::Four => {
                let narrow = u32::try_from(value.value()).map_err(|_| {
                    BurrowError::InvalidArgument(format!("{value} does not fit a 32-bit pointer"))
                })?;
                self.write_u32(address, narrow)
            }
            PointerWidth::Eight => self.write_u64(address, value.value()),
        }
    }

    /// Read a NUL-terminated byte string of at most `max` bytes.
    ///
    /// Reads never cross a page boundary speculatively, so a string that ends
    /// right before an unmapped page is read without faulting.
    fn read_c_bytes(&self, address: Address, max: usize) -> Result<Vec<u8>>
    {
        string::read_c_bytes(self, address, max)
    }

    /// [`TypedMemory::read_c_bytes`] decoded lossily as UTF-8.
    fn read_c_string(&self, address: Address, max: usize) -> Result<String>
    {
        Ok(String::from_utf8_lossy(&self.read_c_bytes(address, max)?).into_owned())
    }

    /// Write `text` plus a NUL into a buffer of `capacity` bytes.
    ///
    /// ## Errors
    ///
    /// `CapacityExceeded` if `text.len() + 1 > capacity`.
    fn write_c_string(&self, address: Address, text: &[u8], capacity: usize) -> Result<()>
    {
        string::write_c_bytes(self, address, text, capacity)
    }

    /// Decode the runtime's `std::string` at `address`.
    fn read_std_string(&self, address: Address, layout: &StringLayout) -> Result<Vec<u8>>
    {
        layout.read(self, address)
    }

    /// Overwrite the runtime's `std::string` at `address` within its current capacity.
    fn write_std_string(&self, address: Address, layout: &StringLayout, text: &[u8]) -> Result<()>
    {
        layout.write(self, address, text)
    }

    /// Class name of the polymorphic object at `object`.
    fn read_class_name(&self, object: Address, resolver: &ClassNameResolver) -> Result<String>
    {
        resolver.resolve(self, object)
    }
}

impl<M: MemoryAccess + ?Sized> TypedMemory for M {}

/// A structure instance in the target, addressed by descriptor field names
///
/// Binds a base address to the descriptor group describing the structure's
/// layout, so that field access reads as `view.read::<u32>("x_offset")`
/// instead of hand-written pointer arithmetic.
///
/// ```rust
/// use burrow_core::descriptor::VersionInfo;
/// use burrow_core::memory_map::Permissions;
/// use burrow_core::overlay::FieldView;
/// use burrow_core::platform::mock::MockProcess;
/// use burrow_core::types::Address;
///
/// let mut info = VersionInfo::new("demo");
/// info.root_mut().group_mut("creature").set_offset("x_offset", 0x10);
///
/// let target = MockProcess::builder(1)
///     .region(0x1000, 0x100, Permissions::READ_WRITE, None)
///     .build();
///
/// let creature = FieldView::new(&target, Address::new(0x1000), info.group("creature")?);
/// creature.write::<u32>("x_offset", 7)?;
/// assert_eq!(creature.read::<u32>("x_offset")?, 7);
/// # Ok::<(), burrow_core::BurrowError>(())
/// ```
pub struct FieldView<'a, M: MemoryAccess + ?Sized>
{
    memory: &'a M,
    base: Address,
    group: &'a OffsetGroup,
}

impl<'a, M: MemoryAccess + ?Sized> FieldView<'a, M>
{
    /// View the structure at `base` using `group` for field offsets.
    pub fn new(memory: &'a M, base: Address, group: &'a OffsetGroup) -> Self
    {
        Self { memory, base, group }
    }

    /// Base address of the structure
    pub fn base(&self) -> Address
    {
        self.base
    }

    /// Absolute address of a field.
    ///
    /// ## Errors
    ///
    /// Descriptor errors for unknown fields; `InvalidArgument` if the offset
    /// leaves the address space.
    pub fn address_of(&self, field: &str) -> Result<Address>
    {
        let offset = self.group.offset(field)?;
        self.base.offset(offset).ok_or_else(|| {
            BurrowError::InvalidArgument(format!(
                "{}{field} ({offset:#x}) overflows base {}",
                self.group.full_name(),
                self.base
            ))
        })
    }

    /// Read a scalar field.
    pub fn read<T: Scalar>(&self, field: &str) -> Result<T>
    {
        self.memory.read_scalar(self.address_of(field)?)
    }

    /// Write a scalar field.
    pub fn write<T: Scalar>(&self, field: &str, value: T) -> Result<()>
    {
        self.memory.write_scalar(self.address_of(field)?, value)
    }

    /// Read a pointer field.
    pub fn read_pointer(&self, field: &str) -> Result<Address>
    {
        self.memory.read_pointer(self.address_of(field)?)
    }

    /// Follow a pointer field and view the pointee with another group.
    pub fn follow(&self, field: &str, group: &'a OffsetGroup) -> Result<FieldView<'a, M>>
    {
        let target = self.read_pointer(field)?;
        Ok(FieldView::new(self.memory, target, group))
    }
}
