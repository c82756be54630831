/*!
Connector reading guest RAM from any seekable byte source, usually a raw snapshot file.
*/

use crate::error::{Error, ErrorKind, ErrorOrigin, Result};
use crate::mem::{PhysicalMemory, PhysicalMemoryMetadata};
use crate::types::PhysicalAddress;

use std::io::{Read, Seek, SeekFrom};

/// Serves physical reads from a `Read + Seek` source.
///
/// The byte at file offset `n` holds physical address `ram_base + n`.
pub struct FileIoMemory<T> {
    reader: T,
    ram_base: PhysicalAddress,
    size: u64,
}

impl<T: Read + Seek> FileIoMemory<T> {
    /// Wraps the reader, the size of guest RAM is taken from the length of the source.
    pub fn with_reader(mut reader: T, ram_base: PhysicalAddress) -> Result<Self> {
        let size = reader
            .seek(SeekFrom::End(0))
            .map_err(|err| Error(ErrorOrigin::Connector, ErrorKind::UnableToSeekFile).log_error(err))?;
        Ok(Self::with_size(reader, ram_base, size))
    }

    pub fn with_size(reader: T, ram_base: PhysicalAddress, size: u64) -> Self {
        Self {
            reader,
            ram_base,
            size,
        }
    }

    pub fn into_reader(self) -> T {
        self.reader
    }
}

impl<T: Read + Seek + Send> PhysicalMemory for FileIoMemory<T> {
    fn phys_read_raw_into(&mut self, addr: PhysicalAddress, out: &mut [u8]) -> Result<()> {
        if !self.metadata().contains(addr, out.len() as u64) {
            return Err(Error(ErrorOrigin::PhysicalMemory, ErrorKind::OutOfMemoryRange));
        }

        self.reader
            .seek(SeekFrom::Start(addr - self.ram_base))
            .map_err(|_| Error(ErrorOrigin::PhysicalMemory, ErrorKind::UnableToSeekFile))?;
        // the snapshot may get truncated while it is rewritten
        self.reader
            .read_exact(out)
            .map_err(|_| Error(ErrorOrigin::PhysicalMemory, ErrorKind::UnableToReadMemory))
    }

    fn metadata(&self) -> PhysicalMemoryMetadata {
        PhysicalMemoryMetadata {
            ram_base: self.ram_base,
            size: self.size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_ram_base_offset() {
        let mut buf = vec![0u8; 0x3000];
        buf[0x1008..0x1010].copy_from_slice(&0x1122_3344_5566_7788u64.to_le_bytes());

        let mut mem =
            FileIoMemory::with_reader(Cursor::new(buf), PhysicalAddress::from(0x4000_0000))
                .unwrap();
        assert_eq!(mem.metadata().size, 0x3000);
        assert_eq!(
            mem.phys_read_u64(PhysicalAddress::from(0x4000_1008)).unwrap(),
            0x1122_3344_5566_7788
        );
    }

    #[test]
    fn test_out_of_range() {
        let mut mem = FileIoMemory::with_reader(
            Cursor::new(vec![0u8; 0x1000]),
            PhysicalAddress::from(0x4000_0000),
        )
        .unwrap();
        assert_eq!(
            mem.phys_read_u64(PhysicalAddress::from(0x1000)),
            Err(Error(ErrorOrigin::PhysicalMemory, ErrorKind::OutOfMemoryRange))
        );
        assert!(mem
            .phys_read_u64(PhysicalAddress::from(0x4000_0ffc))
            .is_err());
    }
}
