//! Target address type.

use std::fmt;
use std::ops::{Add, Sub};

/// Strongly typed address in the target's address space
///
/// Descriptor offsets, element sizes and lengths are plain integers; anything
/// that points into the target is an `Address`. Keeping the two apart stops a
/// byte count from being passed where a location is expected.
///
/// The value is always stored as 64 bits, even for 32-bit targets. Reading a
/// pointer out of a 32-bit target zero-extends it.
///
/// ## Example
///
/// ```rust
/// use burrow_core::types::Address;
///
/// let base = Address::from(0x1000);
/// assert_eq!((base + 0x10).value(), 0x1010);
/// assert_eq!(base.offset(-0x10), Some(Address::new(0xff0)));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u64);

impl Address
{
    /// The null address
    pub const ZERO: Self = Address(0);

    /// Create an address from a raw value (usable in const contexts).
    pub const fn new(value: u64) -> Self
    {
        Address(value)
    }

    /// Raw `u64` value, for handing to OS APIs.
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// `true` for the null address.
    pub const fn is_null(self) -> bool
    {
        self.0 == 0
    }

    /// Add an unsigned offset, returning `None` on overflow.
    ///
    /// ```rust
    /// use burrow_core::types::Address;
    ///
    /// assert_eq!(Address::from(0x1000).checked_add(0x100), Some(Address::from(0x1100)));
    /// assert_eq!(Address::from(0x1000).checked_add(u64::MAX), None);
    /// ```
    pub fn checked_add(self, offset: u64) -> Option<Self>
    {
        self.0.checked_add(offset).map(Address)
    }

    /// Subtract an unsigned offset, returning `None` on underflow.
    pub fn checked_sub(self, offset: u64) -> Option<Self>
    {
        self.0.checked_sub(offset).map(Address)
    }

    /// Apply a signed displacement such as a descriptor offset.
    ///
    /// Structure offsets may be negative (fields reached from a pointer into
    /// the middle of an object), so this is the form the overlay layer uses.
    pub fn offset(self, delta: i64) -> Option<Self>
    {
        self.0.checked_add_signed(delta).map(Address)
    }

    /// Add an offset, saturating at `u64::MAX`.
    pub fn saturating_add(self, offset: u64) -> Self
    {
        Address(self.0.saturating_add(offset))
    }

    /// Byte distance from `earlier` to `self`, or `None` if `earlier` is above `self`.
    pub fn distance_from(self, earlier: Address) -> Option<u64>
    {
        self.0.checked_sub(earlier.0)
    }

    /// `true` if the address is a multiple of `align` (which must be non-zero).
    pub fn is_aligned(self, align: u64) -> bool
    {
        align != 0 && self.0 % align == 0
    }
}

impl From<u64> for Address
{
    fn from(value: u64) -> Self
    {
        Address(value)
    }
}

impl From<Address> for u64
{
    fn from(address: Address) -> Self
    {
        address.0
    }
}

impl fmt::Display for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:016x}", self.0)
    }
}

impl fmt::LowerHex for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Add<u64> for Address
{
    type Output = Address;

    fn add(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for Address
{
    type Output = Address;

    fn sub(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_sub(rhs))
    }
}
