use crate::error::Result;
use crate::types::PhysicalAddress;

use dataview::{Pod, PodMethods};

/// The `PhysicalMemory` trait is implemented by anything that can hand out bytes of guest
/// physical memory.
///
/// This is the only interface the engine requires from a backing store: bounded random reads.
/// Whether the bytes come from a snapshot file, a live mapping or a privileged query channel
/// is up to the implementor. Guest memory is never written.
///
/// Reads outside of the backing store fail with
/// `Error(ErrorOrigin::PhysicalMemory, ErrorKind::OutOfMemoryRange)`. Callers treat such a
/// failure as "unmapped", it never invalidates the session.
///
/// # Examples
///
/// Implementing `PhysicalMemory` for a plain buffer:
/// ```
/// use guestwalk::mem::{PhysicalMemory, PhysicalMemoryMetadata};
/// use guestwalk::types::PhysicalAddress;
/// use guestwalk::error::{Error, ErrorKind, ErrorOrigin, Result};
///
/// pub struct MemoryBackend {
///     mem: Box<[u8]>,
/// }
///
/// impl PhysicalMemory for MemoryBackend {
///     fn phys_read_raw_into(&mut self, addr: PhysicalAddress, out: &mut [u8]) -> Result<()> {
///         let start = addr.as_u64() as usize;
///         let data = start
///             .checked_add(out.len())
///             .and_then(|end| self.mem.get(start..end))
///             .ok_or(Error(ErrorOrigin::PhysicalMemory, ErrorKind::OutOfMemoryRange))?;
///         out.copy_from_slice(data);
///         Ok(())
///     }
///
///     fn metadata(&self) -> PhysicalMemoryMetadata {
///         PhysicalMemoryMetadata {
///             ram_base: PhysicalAddress::NULL,
///             size: self.mem.len() as u64,
///         }
///     }
/// }
///
/// let mut mem = MemoryBackend { mem: vec![0x41; 0x2000].into_boxed_slice() };
/// assert_eq!(mem.phys_read_u32(PhysicalAddress::from(0x10)).unwrap(), 0x4141_4141);
/// assert!(mem.phys_read_u64(PhysicalAddress::from(0x2000)).is_err());
/// ```
pub trait PhysicalMemory: Send {
    fn phys_read_raw_into(&mut self, addr: PhysicalAddress, out: &mut [u8]) -> Result<()>;

    /// Retrieve metadata about the physical memory
    fn metadata(&self) -> PhysicalMemoryMetadata;

    // read helpers
    fn phys_read_raw(&mut self, addr: PhysicalAddress, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.phys_read_raw_into(addr, &mut *buf)?;
        Ok(buf)
    }

    fn phys_read_into<T: Pod + ?Sized>(&mut self, addr: PhysicalAddress, out: &mut T) -> Result<()>
    where
        Self: Sized,
    {
        self.phys_read_raw_into(addr, out.as_bytes_mut())
    }

    fn phys_read<T: Pod + Default>(&mut self, addr: PhysicalAddress) -> Result<T>
    where
        Self: Sized,
    {
        let mut obj = T::default();
        self.phys_read_into(addr, &mut obj)?;
        Ok(obj)
    }

    /// Reads a little-endian `u64`, the format of every supported descriptor and pointer.
    fn phys_read_u64(&mut self, addr: PhysicalAddress) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.phys_read_raw_into(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn phys_read_u32(&mut self, addr: PhysicalAddress) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.phys_read_raw_into(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}

// forward impls
impl<T: PhysicalMemory + ?Sized, P: std::ops::DerefMut<Target = T> + Send> PhysicalMemory for P {
    #[inline]
    fn phys_read_raw_into(&mut self, addr: PhysicalAddress, out: &mut [u8]) -> Result<()> {
        (**self).phys_read_raw_into(addr, out)
    }

    #[inline]
    fn metadata(&self) -> PhysicalMemoryMetadata {
        (**self).metadata()
    }
}

/// Describes the physical address range a `PhysicalMemory` object is able to serve.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub struct PhysicalMemoryMetadata {
    /// physical address of the first byte of guest RAM
    pub ram_base: PhysicalAddress,
    /// number of bytes available starting at `ram_base`
    pub size: u64,
}

impl PhysicalMemoryMetadata {
    /// Returns the first physical address past the end of guest RAM.
    pub fn max_address(&self) -> PhysicalAddress {
        self.ram_base + self.size
    }

    /// Returns true if the whole range `[addr, addr + len)` is backed.
    pub fn contains(&self, addr: PhysicalAddress, len: u64) -> bool {
        addr >= self.ram_base
            && addr
                .checked_add(len)
                .map(|end| end <= self.max_address())
                .unwrap_or(false)
    }
}
