use super::ArchMmuDef;

use crate::error::{Error, ErrorKind, ErrorOrigin};
use crate::mem::PhysicalMemory;
use crate::types::{size, PageFlags, PhysicalAddress, VirtualAddress};

use std::fmt;

#[cfg(feature = "trace_mmu")]
macro_rules! vtop_trace {
    ( $( $x:expr ),* ) => {
        log::trace!( $($x, )* );
    }
}

#[cfg(not(feature = "trace_mmu"))]
macro_rules! vtop_trace {
    ( $( $x:expr ),* ) => {};
}

/// Upper bound of the results of a single [`ArchMmuDef::translate_range`] call.
pub const MAX_RANGE_PAGES: usize = 1 << 18;

/// Reasons a translation did not produce a physical address.
///
/// None of these are fatal. While scanning they are the expected outcome for most addresses.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize))]
pub enum TranslationFailure {
    /// The virtual address is not canonical for the architecture.
    NonCanonical,
    /// A descriptor on the way down had its valid bit clear.
    NotMapped,
    /// A descriptor was valid but could not be interpreted at its level.
    MalformedTable,
    /// Reading a descriptor from physical memory failed.
    OutOfRange,
}

impl TranslationFailure {
    pub fn to_str(self) -> &'static str {
        match self {
            TranslationFailure::NonCanonical => "non canonical address",
            TranslationFailure::NotMapped => "not mapped",
            TranslationFailure::MalformedTable => "malformed table",
            TranslationFailure::OutOfRange => "descriptor out of range",
        }
    }
}

impl fmt::Display for TranslationFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.to_str())
    }
}

impl From<TranslationFailure> for Error {
    fn from(failure: TranslationFailure) -> Self {
        let kind = match failure {
            TranslationFailure::NonCanonical => ErrorKind::NonCanonical,
            TranslationFailure::NotMapped => ErrorKind::NotMapped,
            TranslationFailure::MalformedTable => ErrorKind::MalformedTable,
            TranslationFailure::OutOfRange => ErrorKind::OutOfMemoryRange,
        };
        Error(ErrorOrigin::VirtualTranslate, kind)
    }
}

/// The result of a successful walk.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize))]
pub struct PageMapping {
    /// the translated address
    pub address: PhysicalAddress,
    /// physical base of the page or block containing `address`
    pub page_base: PhysicalAddress,
    /// size of the page or block, 4 KiB, 2 MiB or 1 GiB
    pub page_size: u64,
    /// level of the leaf descriptor, 0 being the root
    pub level: usize,
    pub flags: PageFlags,
}

impl ArchMmuDef {
    /// Walks the page tables starting at `root` and returns the mapping of `va`.
    ///
    /// One descriptor is read per level. A clear valid bit fails with `NotMapped`, a
    /// block descriptor at a level that does not allow blocks or a non-page descriptor at
    /// the last level fail with `MalformedTable`.
    pub fn walk<T: PhysicalMemory + ?Sized>(
        &self,
        mem: &mut T,
        root: PhysicalAddress,
        va: VirtualAddress,
    ) -> Result<PageMapping, TranslationFailure> {
        if !va.is_canonical(self.va_bits()) {
            return Err(TranslationFailure::NonCanonical);
        }

        let last = self.level_count() - 1;
        let mut table = PhysicalAddress::from(self.pte_addr(root.as_u64(), size::PAGE_SIZE));

        for level in 0..=last {
            let pte_addr = table + self.index(va, level) * self.pte_size as u64;
            let pte = mem
                .phys_read_u64(pte_addr)
                .map_err(|_| TranslationFailure::OutOfRange)?;
            vtop_trace!(
                "{} level {}: table={:x} pte_addr={:x} pte={:x}",
                self.name,
                level,
                table,
                pte_addr,
                pte
            );

            if !(self.present_bit)(pte) {
                return Err(TranslationFailure::NotMapped);
            }

            let is_leaf = if level == last {
                if !(self.leaf_page_bit)(pte) {
                    return Err(TranslationFailure::MalformedTable);
                }
                true
            } else if (self.large_page_bit)(pte) {
                if !self.is_final_level(level) {
                    return Err(TranslationFailure::MalformedTable);
                }
                true
            } else {
                false
            };

            if is_leaf {
                let page_size = self.page_size_level(level);
                let page_base = PhysicalAddress::from(self.pte_addr(pte, page_size));
                let address = page_base + va.page_offset_for(page_size);
                vtop_trace!("{} -> {:x} ({:x} bytes)", va, address, page_size);
                return Ok(PageMapping {
                    address,
                    page_base,
                    page_size,
                    level,
                    flags: self.page_flags(pte),
                });
            }

            table = PhysicalAddress::from(self.pte_addr(pte, size::PAGE_SIZE));
        }

        // the last level always returns above
        Err(TranslationFailure::MalformedTable)
    }

    /// Translates a virtual address into a physical one.
    pub fn translate<T: PhysicalMemory + ?Sized>(
        &self,
        mem: &mut T,
        root: PhysicalAddress,
        va: VirtualAddress,
    ) -> Result<PhysicalAddress, TranslationFailure> {
        self.walk(mem, root, va).map(|m| m.address)
    }

    /// Translates `page_count` consecutive 4 KiB pages starting at the page containing `start`.
    ///
    /// Every page gets its own result so a partially mapped range can still be reported.
    /// Pages inside an already resolved block are computed without another walk.
    ///
    /// The range ends at the top of the address space and after at most
    /// [`MAX_RANGE_PAGES`] pages, callers wanting more have to split the range.
    pub fn translate_range<T: PhysicalMemory + ?Sized>(
        &self,
        mem: &mut T,
        root: PhysicalAddress,
        start: VirtualAddress,
        page_count: usize,
    ) -> Vec<Result<PhysicalAddress, TranslationFailure>> {
        let start = start.as_page_aligned(size::PAGE_SIZE);
        let pages_left = (u64::MAX - start.as_u64()) / size::PAGE_SIZE + 1;
        let page_count = (page_count as u64)
            .min(pages_left)
            .min(MAX_RANGE_PAGES as u64);
        let mut out = Vec::with_capacity(page_count as usize);
        let mut last_block: Option<(VirtualAddress, PageMapping)> = None;

        for i in 0..page_count {
            let va = match i
                .checked_mul(size::PAGE_SIZE)
                .and_then(|offset| start.checked_add(offset))
            {
                Some(va) => va,
                None => {
                    out.push(Err(TranslationFailure::NonCanonical));
                    continue;
                }
            };

            if let Some((block_va, mapping)) = last_block {
                if va.as_page_aligned(mapping.page_size) == block_va {
                    out.push(Ok(mapping.page_base + va.page_offset_for(mapping.page_size)));
                    continue;
                }
            }

            match self.walk(mem, root, va) {
                Ok(mapping) => {
                    last_block = Some((va.as_page_aligned(mapping.page_size), mapping));
                    out.push(Ok(mapping.address));
                }
                Err(err) => out.push(Err(err)),
            }
        }

        out
    }
}
