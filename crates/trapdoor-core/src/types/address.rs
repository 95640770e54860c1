//! Memory address types.

use std::fmt;
use std::ops::{Add, Sub};

/// Strongly typed virtual address in the debuggee
///
/// This wrapper around `u64` keeps addresses from being mixed up with lengths,
/// counts and other plain integers. 32-bit debuggees use the low half.
///
/// ## Example
///
/// ```rust
/// use trapdoor_core::types::Address;
///
/// let addr = Address::from(0x1000);
/// let next_addr = addr + 0x5; // instruction length
/// assert_eq!(next_addr.value(), 0x1005);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u64);

impl Address
{
    /// The null address (0x0)
    pub const ZERO: Self = Address(0);

    /// Create a new address from a `u64` value
    ///
    /// Usable in const contexts, unlike `Address::from`.
    ///
    /// ## Example
    ///
    /// ```rust
    /// use trapdoor_core::types::Address;
    ///
    /// const ENTRY: Address = Address::new(0x401000);
    /// assert_eq!(ENTRY.value(), 0x401000);
    /// ```
    #[must_use]
    pub const fn new(value: u64) -> Self
    {
        Address(value)
    }

    /// Get the raw `u64` value of this address
    #[must_use]
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// Add an offset to this address, checking for overflow
    ///
    /// ## Example
    ///
    /// ```rust
    /// use trapdoor_core::types::Address;
    ///
    /// let addr = Address::from(0x1000);
    /// assert_eq!(addr.checked_add(0x100), Some(Address::from(0x1100)));
    /// assert_eq!(addr.checked_add(u64::MAX), None);
    /// ```
    #[must_use]
    pub fn checked_add(self, offset: u64) -> Option<Self>
    {
        self.0.checked_add(offset).map(Address)
    }

    /// Subtract an offset from this address, checking for underflow
    #[must_use]
    pub fn checked_sub(self, offset: u64) -> Option<Self>
    {
        self.0.checked_sub(offset).map(Address)
    }

    /// Add an offset to this address, saturating at the maximum value
    #[must_use]
    pub fn saturating_add(self, offset: u64) -> Self
    {
        Address(self.0.saturating_add(offset))
    }

    /// Distance in bytes from `base` to this address, if this address is not below `base`
    #[must_use]
    pub fn offset_from(self, base: Address) -> Option<u64>
    {
        self.0.checked_sub(base.0)
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

/// Closed address interval `[begin, end]`
///
/// Range steps keep going while the program counter stays inside this
/// interval. Both ends are part of the range, so a one-instruction range
/// is `begin == end`.
///
/// ## Example
///
/// ```rust
/// use trapdoor_core::types::{Address, AddressRange};
///
/// let line = AddressRange::new(Address::new(0x1000), Address::new(0x100f));
/// assert!(line.contains(Address::new(0x100f)));
/// assert!(!line.contains(Address::new(0x1010)));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRange
{
    /// First address inside the range.
    pub begin: Address,
    /// Last address inside the range.
    pub end: Address,
}

impl AddressRange
{
    /// Create a range covering `begin..=end`.
    #[must_use]
    pub const fn new(begin: Address, end: Address) -> Self
    {
        Self { begin, end }
    }

    /// Create the range covering `len` bytes starting at `begin`.
    ///
    /// A zero length yields the single-address range at `begin`.
    #[must_use]
    pub fn with_len(begin: Address, len: u64) -> Self
    {
        Self {
            begin,
            end: begin.saturating_add(len.saturating_sub(1)),
        }
    }

    /// Whether `address` lies inside the range (both ends inclusive).
    #[must_use]
    pub fn contains(&self, address: Address) -> bool
    {
        self.begin <= address && address <= self.end
    }
}

impl fmt::Display for AddressRange
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "[{}, {}]", self.begin, self.end)
    }
}
