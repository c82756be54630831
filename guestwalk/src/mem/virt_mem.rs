use crate::architecture::{PageTableWalker, TranslationFailure};
use crate::error::{Error, ErrorKind, ErrorOrigin, Result};
use crate::mem::PhysicalMemory;
use crate::types::{PhysicalAddress, VirtualAddress};

use dataview::{Pod, PodMethods};

/// A view into one guest virtual address space.
///
/// Combines a `PhysicalMemory` object with a [`PageTableWalker`]. Reads are split at page
/// boundaries and every page is translated on its own, so a read spanning an unmapped page
/// fails as a whole instead of returning partially garbage data.
pub struct VirtualView<T> {
    mem: T,
    walker: PageTableWalker,
}

impl<T: PhysicalMemory> VirtualView<T> {
    pub fn new(mem: T, walker: PageTableWalker) -> Self {
        Self { mem, walker }
    }

    pub fn walker(&self) -> &PageTableWalker {
        &self.walker
    }

    /// Returns the same physical memory viewed through another address space.
    pub fn with_walker(&mut self, walker: PageTableWalker) -> VirtualView<&mut T> {
        VirtualView {
            mem: &mut self.mem,
            walker,
        }
    }

    pub fn phys_mem(&mut self) -> &mut T {
        &mut self.mem
    }

    pub fn into_inner(self) -> T {
        self.mem
    }

    pub fn translate(
        &mut self,
        va: VirtualAddress,
    ) -> std::result::Result<PhysicalAddress, TranslationFailure> {
        self.walker.translate(&mut self.mem, va)
    }

    pub fn read_raw_into(&mut self, va: VirtualAddress, out: &mut [u8]) -> Result<()> {
        let mut done = 0usize;
        while done < out.len() {
            let cur = va
                .checked_add(done as u64)
                .ok_or(Error(ErrorOrigin::VirtualMemory, ErrorKind::OutOfBounds))?;
            let mapping = self.walker.walk(&mut self.mem, cur).map_err(Error::from)?;

            let in_page = (mapping.page_size - cur.page_offset_for(mapping.page_size)) as usize;
            let len = in_page.min(out.len() - done);
            self.mem
                .phys_read_raw_into(mapping.address, &mut out[done..done + len])?;
            done += len;
        }
        Ok(())
    }

    pub fn read_raw(&mut self, va: VirtualAddress, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_raw_into(va, &mut buf)?;
        Ok(buf)
    }

    pub fn read_into<U: Pod + ?Sized>(&mut self, va: VirtualAddress, out: &mut U) -> Result<()> {
        self.read_raw_into(va, out.as_bytes_mut())
    }

    pub fn read<U: Pod + Default>(&mut self, va: VirtualAddress) -> Result<U> {
        let mut obj = U::default();
        self.read_into(va, &mut obj)?;
        Ok(obj)
    }

    pub fn read_u64(&mut self, va: VirtualAddress) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_raw_into(va, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_u32(&mut self, va: VirtualAddress) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_raw_into(va, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Reads a 64 bit guest pointer.
    pub fn read_addr(&mut self, va: VirtualAddress) -> Result<VirtualAddress> {
        self.read_u64(va).map(VirtualAddress::from)
    }
}
