/*!
In-memory guest RAM with helpers for building page tables and kernel structures.

Only meant for tests and examples, enabled with the `dummy_mem` feature.
*/

use crate::architecture::arm::aarch64;
use crate::architecture::x86::x64;
use crate::architecture::ArchitectureIdent;
use crate::error::{Error, ErrorKind, ErrorOrigin, Result};
use crate::mem::phys_mem::{PhysicalMemory, PhysicalMemoryMetadata};
use crate::types::{size, PageFlags, PhysicalAddress, VirtualAddress};

use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

pub struct DummyMemory {
    buf: Box<[u8]>,
    ram_base: PhysicalAddress,
    next_free: u64,
    rng: XorShiftRng,
}

impl DummyMemory {
    /// Creates zeroed RAM of the given size at physical address zero.
    pub fn new(size: u64) -> Self {
        Self::with_base(size, PhysicalAddress::NULL)
    }

    /// Creates zeroed RAM of the given size starting at `ram_base`.
    pub fn with_base(size: u64, ram_base: PhysicalAddress) -> Self {
        Self::with_seed(size, ram_base, 0x0123_4567_89ab_cdef)
    }

    pub fn with_seed(size: u64, ram_base: PhysicalAddress, seed: u64) -> Self {
        Self {
            buf: vec![0u8; size as usize].into_boxed_slice(),
            ram_base,
            next_free: 0,
            rng: XorShiftRng::seed_from_u64(seed),
        }
    }

    /// Allocates a zeroed region with the given alignment.
    ///
    /// # Panics
    ///
    /// When the RAM is exhausted.
    pub fn alloc_aligned(&mut self, len: u64, align: u64) -> PhysicalAddress {
        let start = (self.ram_base.as_u64() + self.next_free + align - 1) / align * align;
        let offset = start - self.ram_base.as_u64();
        assert!(
            offset + len <= self.buf.len() as u64,
            "dummy memory exhausted"
        );
        self.next_free = offset + len;
        PhysicalAddress::from(start)
    }

    /// Allocates a single zeroed 4 KiB page.
    pub fn alloc_page(&mut self) -> PhysicalAddress {
        self.alloc_aligned(size::PAGE_SIZE, size::PAGE_SIZE)
    }

    fn offset(&self, addr: PhysicalAddress, len: usize) -> Result<usize> {
        let offset = addr
            .as_u64()
            .checked_sub(self.ram_base.as_u64())
            .ok_or(Error(ErrorOrigin::PhysicalMemory, ErrorKind::OutOfMemoryRange))?;
        if offset + len as u64 > self.buf.len() as u64 {
            return Err(Error(ErrorOrigin::PhysicalMemory, ErrorKind::OutOfMemoryRange));
        }
        Ok(offset as usize)
    }

    pub fn write_raw(&mut self, addr: PhysicalAddress, data: &[u8]) -> Result<()> {
        let offset = self.offset(addr, data.len())?;
        self.buf[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn write_u64(&mut self, addr: PhysicalAddress, value: u64) -> Result<()> {
        self.write_raw(addr, &value.to_le_bytes())
    }

    pub fn write_u32(&mut self, addr: PhysicalAddress, value: u32) -> Result<()> {
        self.write_raw(addr, &value.to_le_bytes())
    }

    /// Overwrites a region with random bytes.
    pub fn fill_random(&mut self, addr: PhysicalAddress, len: usize) -> Result<()> {
        let offset = self.offset(addr, len)?;
        self.rng.fill(&mut self.buf[offset..offset + len]);
        Ok(())
    }

    /// Maps `va` to `pa` with a page or block of `page_size` bytes in the tables rooted at `root`.
    ///
    /// Missing intermediate tables are allocated on the way down.
    pub fn map(
        &mut self,
        arch: ArchitectureIdent,
        root: PhysicalAddress,
        va: VirtualAddress,
        pa: PhysicalAddress,
        page_size: u64,
        flags: PageFlags,
    ) -> Result<()> {
        let mmu = arch.mmu();
        let last = mmu.level_count() - 1;
        let mut table = root;

        for level in 0..=last {
            let pte_addr = table + mmu.index(va, level) * mmu.pte_size as u64;

            if mmu.page_size_level(level) == page_size {
                if !mmu.is_final_level(level) {
                    return Err(Error(ErrorOrigin::Memory, ErrorKind::NotSupported)
                        .log_warn(format!("{} can not map blocks at level {}", arch, level)));
                }
                let pte = match arch {
                    ArchitectureIdent::AArch64 { .. } => {
                        aarch64::leaf_entry(pa.as_u64(), level == last, flags)
                    }
                    ArchitectureIdent::X86_64 { .. } => {
                        x64::leaf_entry(pa.as_u64(), level == last, flags)
                    }
                };
                return self.write_u64(pte_addr, pte);
            }

            let pte = self.phys_read_u64(pte_addr)?;
            table = if (mmu.present_bit)(pte) {
                if (mmu.large_page_bit)(pte) {
                    return Err(Error(ErrorOrigin::Memory, ErrorKind::AlreadyExists));
                }
                PhysicalAddress::from(mmu.pte_addr(pte, size::PAGE_SIZE))
            } else {
                let next = self.alloc_page();
                let entry = match arch {
                    ArchitectureIdent::AArch64 { .. } => aarch64::table_entry(next.as_u64()),
                    ArchitectureIdent::X86_64 { .. } => x64::table_entry(next.as_u64()),
                };
                self.write_u64(pte_addr, entry)?;
                next
            };
        }

        Err(Error(ErrorOrigin::Memory, ErrorKind::InvalidMemorySize))
    }

    /// Maps `len` bytes starting at `va` to physical memory starting at `pa` using 4 KiB pages.
    pub fn map_range(
        &mut self,
        arch: ArchitectureIdent,
        root: PhysicalAddress,
        va: VirtualAddress,
        pa: PhysicalAddress,
        len: u64,
        flags: PageFlags,
    ) -> Result<()> {
        let mut off = 0;
        while off < len {
            self.map(arch, root, va + off, pa + off, size::PAGE_SIZE, flags)?;
            off += size::PAGE_SIZE;
        }
        Ok(())
    }
}

impl PhysicalMemory for DummyMemory {
    fn phys_read_raw_into(&mut self, addr: PhysicalAddress, out: &mut [u8]) -> Result<()> {
        let offset = self.offset(addr, out.len())?;
        out.copy_from_slice(&self.buf[offset..offset + out.len()]);
        Ok(())
    }

    fn metadata(&self) -> PhysicalMemoryMetadata {
        PhysicalMemoryMetadata {
            ram_base: self.ram_base,
            size: self.buf.len() as u64,
        }
    }
}
