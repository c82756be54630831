use crate::error::{Error, ErrorKind, ErrorOrigin, Result};
use crate::types::{PageFlags, VirtualAddress};

use smallvec::SmallVec;

/// The `ArchMmuDef` structure defines how a real memory management unit should behave when
/// translating virtual memory addresses to physical ones.
///
/// The core logic of the translation is the same for every supported MMU. What differs is the
/// number of levels, the way a virtual address gets split into table indices and how the bits
/// of a descriptor are interpreted. Everything that differentiates the translation process is
/// the data inside this structure.
///
/// Levels are indexed from 0 (the root table) to `level_count() - 1` (the last table, whose
/// valid descriptors always map a 4 KiB page).
#[derive(Debug)]
pub struct ArchMmuDef {
    pub name: &'static str,
    /// defines the way virtual addresses gets split (the last element
    /// being the final physical page offset, and thus treated a bit differently)
    pub virtual_address_splits: &'static [u8],
    /// defines at which levels a block (large page) mapping may terminate the walk,
    /// the last level is always a valid final level. Has to be sorted.
    pub valid_final_page_steps: &'static [usize],
    /// physical output address width in bits
    pub address_space_bits: u8,
    /// size of an individual page table entry in bytes.
    pub pte_size: usize,
    /// checks the bit in a descriptor defining whether it is valid or not.
    pub present_bit: fn(u64) -> bool,
    /// checks if a descriptor above the last level maps a block instead of pointing to a table.
    pub large_page_bit: fn(u64) -> bool,
    /// checks if a descriptor at the last level is a well formed page descriptor.
    pub leaf_page_bit: fn(u64) -> bool,
    pub writeable_bit: fn(u64) -> bool,
    pub user_bit: fn(u64) -> bool,
    /// second argument tells if the mapping is user accessible.
    pub nx_bit: fn(u64, bool) -> bool,
    pub accessed_bit: fn(u64) -> bool,
}

/// The table indices and page offset a virtual address is made of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualAddressParts {
    /// one index per level, root first
    pub indices: SmallVec<[u16; 5]>,
    pub page_offset: u64,
}

impl ArchMmuDef {
    /// Returns the number of page table levels.
    pub const fn level_count(&self) -> usize {
        self.virtual_address_splits.len() - 1
    }

    /// Returns the number of implemented virtual address bits.
    pub const fn va_bits(&self) -> u8 {
        let subsl = &self.virtual_address_splits;
        let mut accum = 0;
        let mut i = 0;
        while i < subsl.len() {
            accum += subsl[i];
            i += 1;
        }
        accum
    }

    /// Returns the half-open bit range `[min, max)` indexing the table at the given level.
    pub const fn virt_addr_bit_range(&self, level: usize) -> (u8, u8) {
        let max_index_bits = {
            let subsl = &self.virtual_address_splits;
            let mut accum = 0;
            let mut i = level;
            while i < subsl.len() {
                accum += subsl[i];
                i += 1;
            }
            accum
        };
        let min_index_bits = max_index_bits - self.virtual_address_splits[level];
        (min_index_bits, max_index_bits)
    }

    /// Get the size of the region a single descriptor at the given level maps.
    pub const fn page_size_level(&self, level: usize) -> u64 {
        let (min, _) = self.virt_addr_bit_range(level);
        1 << min
    }

    /// Returns true if a walk may end at the given level.
    pub fn is_final_level(&self, level: usize) -> bool {
        level + 1 == self.level_count() || self.valid_final_page_steps.binary_search(&level).is_ok()
    }

    /// Returns the table index of the virtual address at the given level.
    #[inline]
    pub const fn index(&self, va: VirtualAddress, level: usize) -> u64 {
        let (min, max) = self.virt_addr_bit_range(level);
        va.extract_bits(min, max - 1)
    }

    /// Masks the output address of a descriptor.
    ///
    /// For tables and 4 KiB pages the low 12 bits get cleared, for blocks all bits below
    /// the block size are cleared. The upper bound is `address_space_bits`.
    pub const fn pte_addr(&self, pte: u64, page_size: u64) -> u64 {
        let upper = if self.address_space_bits >= 64 {
            !0u64
        } else {
            (1u64 << self.address_space_bits) - 1
        };
        pte & upper & !(page_size - 1)
    }

    /// Decodes the protection bits of a leaf descriptor.
    pub fn page_flags(&self, pte: u64) -> PageFlags {
        let user = (self.user_bit)(pte);
        PageFlags::READABLE
            .write((self.writeable_bit)(pte))
            .user(user)
            .exec(!(self.nx_bit)(pte, user))
            .accessed((self.accessed_bit)(pte))
    }

    /// Returns true if the address is canonical and belongs to the upper half.
    pub const fn is_kernel_address(&self, va: VirtualAddress) -> bool {
        va.is_canonical(self.va_bits()) && va.is_kernel()
    }

    /// Returns true if the address is canonical and belongs to the lower half.
    pub const fn is_user_address(&self, va: VirtualAddress) -> bool {
        va.is_canonical(self.va_bits()) && va.is_user()
    }

    /// Splits a canonical virtual address into its table indices and page offset.
    pub fn decompose(&self, va: VirtualAddress) -> Result<VirtualAddressParts> {
        if !va.is_canonical(self.va_bits()) {
            return Err(Error(ErrorOrigin::VirtualTranslate, ErrorKind::NonCanonical));
        }

        let indices = (0..self.level_count())
            .map(|level| self.index(va, level) as u16)
            .collect();

        Ok(VirtualAddressParts {
            indices,
            page_offset: va.page_offset_for(self.page_size_level(self.level_count() - 1)),
        })
    }

    /// Reassembles a canonical virtual address from its table indices and page offset.
    ///
    /// The address gets sign-extended from the implemented width.
    pub fn recompose(&self, parts: &VirtualAddressParts) -> Result<VirtualAddress> {
        if parts.indices.len() != self.level_count() {
            return Err(Error(ErrorOrigin::VirtualTranslate, ErrorKind::InvalidAddress));
        }

        let mut value = parts.page_offset;
        if value >= self.page_size_level(self.level_count() - 1) {
            return Err(Error(ErrorOrigin::VirtualTranslate, ErrorKind::OutOfBounds));
        }

        for (level, &index) in parts.indices.iter().enumerate() {
            let (min, max) = self.virt_addr_bit_range(level);
            if (index as u64) >> (max - min) != 0 {
                return Err(Error(ErrorOrigin::VirtualTranslate, ErrorKind::OutOfBounds));
            }
            value |= (index as u64) << min;
        }

        Ok(VirtualAddress::from(value).canonicalize(self.va_bits()))
    }
}
