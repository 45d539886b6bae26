//! # Remote Container Overlay
//!
//! [`RemoteVector`] interprets a three-pointer header living in the target
//! (`begin`, `end`, `capacity_end`, the layout of `std::vector` in every
//! runtime the game has shipped with) as an indexable sequence.
//!
//! ```text
//! header @ address          element storage @ begin
//! ┌────────────┐            ┌──────┬──────┬──────┬──────────────┐
//! │ begin      │──────────> │  e0  │  e1  │  e2  │  (spare)     │
//! │ end        │────────────────────────────────^ │              │
//! │ capacity   │──────────────────────────────────────────────────^
//! └────────────┘
//! ```
//!
//! ## No caching
//!
//! Every call re-reads the header and validates it, so the view is always as
//! fresh as the target. Nothing is copied locally unless the caller asks for
//! it (`read_all`).
//!
//! ## Element types
//!
//! The overlay is byte-oriented. Callers supply the interpretation as a
//! closure ([`RemoteVector::get`]/[`RemoteVector::set`]) or use the scalar
//! shortcuts.
//!
//! ## Mutation
//!
//! `push`, `pop`, `remove` and friends touch the element storage and the
//! header in several steps. Hold a suspend scope around them; the overlay
//! never allocates in the target, so growth past the capacity is refused.

use tracing::trace;

use crate::error::{BurrowError, Result};
use crate::memory_map::MemoryMap;
use crate::overlay::{MemoryAccess, Scalar, TypedMemory};
use crate::types::Address;

/// Snapshot of a vector header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorHeader
{
    /// First element
    pub begin: Address,
    /// One past the last element
    pub end: Address,
    /// One past the allocation
    pub capacity_end: Address,
}

impl VectorHeader
{
    /// Bytes in use
    pub fn used_bytes(&self) -> u64
    {
        self.end.value() - self.begin.value()
    }

    /// Bytes allocated
    pub fn allocated_bytes(&self) -> u64
    {
        self.capacity_end.value() - self.begin.value()
    }
}

/// View of a remote `std::vector`-like container
#[derive(Debug)]
pub struct RemoteVector<'m, M: ?Sized>
{
    memory: &'m M,
    address: Address,
    element_size: usize,
}

impl<'m, M: MemoryAccess + ?Sized> RemoteVector<'m, M>
{
    /// Overlay the header at `address` with elements of `element_size` bytes.
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` for a zero element size.
    pub fn new(memory: &'m M, address: Address, element_size: usize) -> Result<Self>
    {
        if element_size == 0 {
            return Err(BurrowError::InvalidArgument("element size must be non-zero".to_string()));
        }
        Ok(Self {
            memory,
            address,
            element_size,
        })
    }

    /// Address of the header
    pub fn address(&self) -> Address
    {
        self.address
    }

    /// Element size in bytes
    pub fn element_size(&self) -> usize
    {
        self.element_size
    }

    /// Read and validate the header.
    ///
    /// ## Errors
    ///
    /// `CorruptContainer` if `begin <= end <= capacity_end` does not hold or
    /// the used span is not a whole number of elements.
    pub fn header(&self) -> Result<VectorHeader>
    {
        let begin = self.memory.read_pointer(self.address)?;
        let end = self.memory.read_pointer(self.header_word(1)?)?;
        let capacity_end = self.memory.read_pointer(self.header_word(2)?)?;
        let header = VectorHeader {
            begin,
            end,
            capacity_end,
        };

        if !(begin <= end && end <= capacity_end) {
            return Err(self.corrupt(format!(
                "pointers out of order (begin {begin}, end {end}, capacity {capacity_end})"
            )));
        }
        if header.used_bytes() % self.element_size as u64 != 0 {
            return Err(self.corrupt(format!(
                "{} used bytes is not a multiple of the element size {}",
                header.used_bytes(),
                self.element_size
            )));
        }
        Ok(header)
    }

    /// Number of elements
    pub fn len(&self) -> Result<usize>
    {
        let header = self.header()?;
        self.count(header.used_bytes())
    }

    /// Number of elements that fit the current allocation
    pub fn capacity(&self) -> Result<usize>
    {
        let header = self.header()?;
        self.count(header.allocated_bytes())
    }

    /// `true` if the container holds no elements
    pub fn is_empty(&self) -> Result<bool>
    {
        Ok(self.len()? == 0)
    }

    /// Address of element `index`.
    ///
    /// ## Errors
    ///
    /// `IndexOutOfBounds` for `index >= len()`.
    pub fn at(&self, index: usize) -> Result<Address>
    {
        let header = self.header()?;
        self.element_address(&header, index)
    }

    /// Raw bytes of element `index`.
    pub fn read_element(&self, index: usize) -> Result<Vec<u8>>
    {
        let address = self.at(index)?;
        self.memory.read_bytes(address, self.element_size)
    }

    /// Overwrite element `index` with exactly `element_size` bytes.
    pub fn write_element(&self, index: usize, bytes: &[u8]) -> Result<()>
    {
        self.check_element(bytes)?;
        let address = self.at(index)?;
        self.memory.write(address, self.element_size, bytes)
    }

    /// Decode element `index` with `decode`.
    ///
    /// ```rust
    /// # use burrow_core::container::RemoteVector;
    /// # use burrow_core::memory_map::Permissions;
    /// # use burrow_core::overlay::TypedMemory;
    /// # use burrow_core::platform::mock::MockProcess;
    /// # use burrow_core::types::Address;
    /// # let target = MockProcess::builder(1).region(0x1000, 0x100, Permissions::READ_WRITE, None).build();
    /// # target.write_u64(Address::new(0x1000), 0x1040)?;
    /// # target.write_u64(Address::new(0x1008), 0x1048)?;
    /// # target.write_u64(Address::new(0x1010), 0x1048)?;
    /// # target.write_u32(Address::new(0x1040), 3)?;
    /// # target.write_u32(Address::new(0x1044), 4)?;
    /// let points = RemoteVector::new(&target, Address::new(0x1000), 8)?;
    /// let (x, y) = points.get(0, |raw| {
    ///     let x = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    ///     let y = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
    ///     (x, y)
    /// })?;
    /// assert_eq!((x, y), (3, 4));
    /// # Ok::<(), burrow_core::BurrowError>(())
    /// ```
    pub fn get<T>(&self, index: usize, decode: impl FnOnce(&[u8]) -> T) -> Result<T>
    {
        let bytes = self.read_element(index)?;
        Ok(decode(&bytes))
    }

    /// Update element `index` in place.
    ///
    /// `encode` receives the element's current bytes and edits them; the
    /// result is written back.
    pub fn set(&self, index: usize, encode: impl FnOnce(&mut [u8])) -> Result<()>
    {
        let address = self.at(index)?;
        let mut bytes = self.memory.read_bytes(address, self.element_size)?;
        encode(&mut bytes);
        self.memory.write(address, self.element_size, &bytes)
    }

    /// Read the scalar at the start of element `index`.
    pub fn get_scalar<T: Scalar>(&self, index: usize) -> Result<T>
    {
        self.check_scalar::<T>()?;
        self.memory.read_scalar(self.at(index)?)
    }

    /// Write the scalar at the start of element `index`.
    pub fn set_scalar<T: Scalar>(&self, index: usize, value: T) -> Result<()>
    {
        self.check_scalar::<T>()?;
        self.memory.write_scalar(self.at(index)?, value)
    }

    /// Append an element within the existing capacity.
    ///
    /// Returns the index of the new element.
    ///
    /// ## Errors
    ///
    /// `CapacityExceeded` if the allocation is full.
    pub fn push(&self, bytes: &[u8]) -> Result<usize>
    {
        self.check_element(bytes)?;
        let header = self.header()?;
        let len = self.count(header.used_bytes())?;
        let capacity = self.count(header.allocated_bytes())?;
        if len >= capacity {
            return Err(BurrowError::CapacityExceeded {
                needed: len + 1,
                capacity,
            });
        }

        // element first, so the header never covers unwritten bytes
        self.memory.write(header.end, self.element_size, bytes)?;
        self.set_end(header.end + self.element_size as u64)?;
        trace!(vector = %self.address, index = len, "pushed element");
        Ok(len)
    }

    /// Remove and return the last element.
    pub fn pop(&self) -> Result<Option<Vec<u8>>>
    {
        let header = self.header()?;
        if header.end == header.begin {
            return Ok(None);
        }
        let last = header.end - self.element_size as u64;
        let bytes = self.memory.read_bytes(last, self.element_size)?;
        self.set_end(last)?;
        Ok(Some(bytes))
    }

    /// Shorten to `len` elements; longer lengths are ignored.
    pub fn truncate(&self, len: usize) -> Result<()>
    {
        let header = self.header()?;
        if len >= self.count(header.used_bytes())? {
            return Ok(());
        }
        let end = header
            .begin
            .checked_add(self.byte_span(len)?)
            .ok_or_else(|| self.corrupt(format!("length {len} lies past the end of the address space")))?;
        self.set_end(end)
    }

    /// Remove every element (the allocation stays).
    pub fn clear(&self) -> Result<()>
    {
        self.truncate(0)
    }

    /// Remove element `index`, shifting the tail down, and return it.
    pub fn remove(&self, index: usize) -> Result<Vec<u8>>
    {
        let header = self.header()?;
        let address = self.element_address(&header, index)?;
        let removed = self.memory.read_bytes(address, self.element_size)?;

        let tail_start = address + self.element_size as u64;
        let tail_len = (header.end.value() - tail_start.value()) as usize;
        if tail_len > 0 {
            let tail = self.memory.read_bytes(tail_start, tail_len)?;
            self.memory.write(address, tail_len, &tail)?;
        }
        self.set_end(header.end - self.element_size as u64)?;
        Ok(removed)
    }

    /// Copy every element out with a single read.
    pub fn read_all(&self) -> Result<Vec<Vec<u8>>>
    {
        let header = self.header()?;
        let used = usize::try_from(header.used_bytes()).map_err(|_| self.corrupt("used span too large".to_string()))?;
        let raw = self.memory.read_bytes(header.begin, used)?;
        Ok(raw.chunks_exact(self.element_size).map(<[u8]>::to_vec).collect())
    }

    /// Address of every element.
    pub fn element_addresses(&self) -> Result<Vec<Address>>
    {
        let header = self.header()?;
        let len = self.count(header.used_bytes())?;
        (0..len).map(|index| self.element_address(&header, index)).collect()
    }

    /// Heuristic check that the header points into the heap.
    ///
    /// An empty, never-allocated vector (all three pointers null) passes.
    pub fn is_plausible(&self, map: &MemoryMap) -> Result<bool>
    {
        let header = match self.header() {
            Ok(header) => header,
            Err(BurrowError::CorruptContainer { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        if header.begin.is_null() {
            return Ok(header.capacity_end.is_null());
        }
        let align = self.memory.pointer_width().bytes() as u64;
        Ok(map.is_plausible_heap_pointer(header.begin, align)
            && (header.allocated_bytes() == 0 || map.is_writable(header.begin, header.allocated_bytes())))
    }

    fn element_address(&self, header: &VectorHeader, index: usize) -> Result<Address>
    {
        let len = self.count(header.used_bytes())?;
        if index >= len {
            return Err(BurrowError::IndexOutOfBounds { index, len });
        }
        header
            .begin
            .checked_add(self.byte_span(index)?)
            .ok_or_else(|| self.corrupt(format!("element {index} lies past the end of the address space")))
    }

    fn set_end(&self, end: Address) -> Result<()>
    {
        self.memory.write_pointer(self.header_word(1)?, end)
    }

    /// Address of header word `index` (0 = begin, 1 = end, 2 = capacity end)
    fn header_word(&self, index: u64) -> Result<Address>
    {
        let word = self.memory.pointer_width().bytes() as u64;
        self.address
            .checked_add(index * word)
            .ok_or_else(|| self.corrupt("header runs past the end of the address space".to_string()))
    }

    fn count(&self, bytes: u64) -> Result<usize>
    {
        usize::try_from(bytes / self.element_size as u64)
            .map_err(|_| self.corrupt(format!("{bytes} bytes is too large for this host")))
    }

    fn byte_span(&self, elements: usize) -> Result<u64>
    {
        (elements as u64)
            .checked_mul(self.element_size as u64)
            .ok_or_else(|| BurrowError::InvalidArgument(format!("{elements} elements overflow the address space")))
    }

    fn check_element(&self, bytes: &[u8]) -> Result<()>
    {
        if bytes.len() != self.element_size {
            return Err(BurrowError::InvalidArgument(format!(
                "element is {} bytes, expected {}",
                bytes.len(),
                self.element_size
            )));
        }
        Ok(())
    }

    fn check_scalar<T: Scalar>(&self) -> Result<()>
    {
        if T::SIZE > self.element_size {
            return Err(BurrowError::InvalidArgument(format!(
                "{}-byte scalar does not fit a {}-byte element",
                T::SIZE,
                self.element_size
            )));
        }
        Ok(())
    }

    fn corrupt(&self, details: String) -> BurrowError
    {
        BurrowError::CorruptContainer {
            address: self.address,
            details,
        }
    }
}
