/*!
Connector working on a memory mapped snapshot file.
*/

use crate::error::{Error, ErrorKind, ErrorOrigin, Result};
use crate::mem::{PhysicalMemory, PhysicalMemoryMetadata};
use crate::types::PhysicalAddress;

use std::fs::File;
use std::path::Path;

use log::info;
use memmap::Mmap;

/// Serves physical reads from a read-only mapping of a snapshot file.
///
/// The byte at file offset `n` holds physical address `ram_base + n`.
pub struct MmapMemory {
    map: Mmap,
    ram_base: PhysicalAddress,
}

impl MmapMemory {
    pub fn open<P: AsRef<Path>>(path: P, ram_base: PhysicalAddress) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(|err| {
            Error(ErrorOrigin::Connector, ErrorKind::UnableToReadFile).log_error(err)
        })?;

        // Safety: the mapping is never written to. The hypervisor may rewrite the file
        // underneath, every value read from it gets validated before use.
        let map = unsafe { Mmap::map(&file) }.map_err(|err| {
            Error(ErrorOrigin::Connector, ErrorKind::UnableToMapFile).log_error(err)
        })?;

        info!(
            "mapped {} ({:#x} bytes) at physical {}",
            path.as_ref().display(),
            map.len(),
            ram_base
        );

        Ok(Self { map, ram_base })
    }
}

impl PhysicalMemory for MmapMemory {
    fn phys_read_raw_into(&mut self, addr: PhysicalAddress, out: &mut [u8]) -> Result<()> {
        if !self.metadata().contains(addr, out.len() as u64) {
            return Err(Error(ErrorOrigin::PhysicalMemory, ErrorKind::OutOfMemoryRange));
        }
        let start = (addr - self.ram_base) as usize;
        out.copy_from_slice(&self.map[start..start + out.len()]);
        Ok(())
    }

    fn metadata(&self) -> PhysicalMemoryMetadata {
        PhysicalMemoryMetadata {
            ram_base: self.ram_base,
            size: self.map.len() as u64,
        }
    }
}
