/*!
Abstraction over a virtual address of the guest.
*/

/// An address as seen by code running inside the guest.
///
/// Which bit patterns are valid depends on the implemented address width of
/// the architecture. A canonical address has all bits above the implemented
/// width equal to the highest implemented bit. The upper (sign-extended)
/// half belongs to the kernel, the lower half to user space.
///
/// Splitting an address into page table indices is architecture specific, see
/// [`ArchMmuDef::decompose`](crate::architecture::ArchMmuDef::decompose).
///
/// # Examples
///
/// ```
/// use guestwalk::types::VirtualAddress;
///
/// let va = VirtualAddress::from(0xffff_8000_11c1_0000);
/// assert!(va.is_canonical(48));
/// assert!(va.is_kernel());
/// assert!(!VirtualAddress::from(0x0000_8000_0000_0000).is_canonical(48));
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct VirtualAddress(u64);

impl_address!(VirtualAddress);

impl VirtualAddress {
    /// Sign-extends the address from the given implemented width.
    pub const fn canonicalize(self, bits: u8) -> Self {
        if bits >= 64 {
            return self;
        }
        let shift = 64 - bits as u32;
        VirtualAddress((((self.0 << shift) as i64) >> shift) as u64)
    }

    /// Returns true if all bits above `bits - 1` equal bit `bits - 1`.
    #[inline]
    pub const fn is_canonical(self, bits: u8) -> bool {
        self.canonicalize(bits).0 == self.0
    }

    /// Returns true for addresses in the upper, sign-extended half.
    ///
    /// Only meaningful for canonical addresses.
    #[inline]
    pub const fn is_kernel(self) -> bool {
        (self.0 >> 63) == 1
    }

    /// Returns true for addresses in the lower half.
    #[inline]
    pub const fn is_user(self) -> bool {
        !self.is_kernel()
    }

    /// Strips the sign extension and returns only the implemented bits.
    #[inline]
    pub const fn truncate(self, bits: u8) -> u64 {
        if bits >= 64 {
            self.0
        } else {
            self.0 & ((1u64 << bits) - 1)
        }
    }
}
