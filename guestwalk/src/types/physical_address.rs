/*!
Abstraction over a physical address of the guest.
*/

use super::size::{PAGE_SHIFT, PAGE_SIZE};

/// Names a single byte of guest physical memory.
///
/// A `PhysicalAddress` can only be obtained from a raw value or from
/// translating a [`VirtualAddress`](super::VirtualAddress). There is
/// intentionally no `From` implementation between the two address types.
///
/// # Examples
///
/// ```
/// use guestwalk::types::PhysicalAddress;
///
/// let pa = PhysicalAddress::from_page_number(0x40000);
/// assert_eq!(pa.as_u64(), 0x4000_0000);
/// assert_eq!(pa.page_number(), 0x40000);
/// assert_eq!(pa.to_string(), "0x0000000040000000");
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct PhysicalAddress(u64);

impl_address!(PhysicalAddress);

impl PhysicalAddress {
    /// Constructs the address of the first byte of the given 4 KiB page frame.
    #[inline]
    pub const fn from_page_number(pfn: u64) -> Self {
        PhysicalAddress(pfn << PAGE_SHIFT)
    }

    /// Returns the 4 KiB page frame number containing this address.
    #[inline]
    pub const fn page_number(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    /// Returns the byte offset of this address inside its 4 KiB page.
    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Returns the base of the 4 KiB page containing this address.
    #[inline]
    pub const fn page_base(self) -> Self {
        PhysicalAddress(self.0 & !(PAGE_SIZE - 1))
    }
}
