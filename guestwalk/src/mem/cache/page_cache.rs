use crate::error::{Error, ErrorKind, ErrorOrigin, Result};
use crate::mem::phys_mem::{PhysicalMemory, PhysicalMemoryMetadata};
use crate::types::{size, PhysicalAddress};

use std::collections::VecDeque;

use coarsetime::{Duration, Instant};
use hashbrown::HashMap;
use log::trace;

struct CachedPage {
    data: Box<[u8]>,
    fetched: Instant,
}

/// Hit and miss counters of a page cache.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// A bounded, read-only page cache in front of a `PhysicalMemory` object.
///
/// Whole 4 KiB pages are fetched on a miss. Once `capacity` pages are held the oldest page
/// is evicted. Entries are valid until [`invalidate`](Self::invalidate) is called, or, when a
/// validity duration is configured, until they are older than that duration. There is no
/// write-back since guest memory is never written.
///
/// # Examples
///
/// ```
/// # #[cfg(feature = "dummy_mem")]
/// # {
/// use guestwalk::mem::{CachedPhysicalMemory, DummyMemory, PhysicalMemory};
/// use guestwalk::types::{size, PhysicalAddress};
///
/// let mem = DummyMemory::new(size::mb(2));
/// let mut cached = CachedPhysicalMemory::builder(mem)
///     .cache_size(size::kb(64))
///     .build()
///     .unwrap();
///
/// cached.phys_read_u64(PhysicalAddress::from(0x1000)).unwrap();
/// cached.phys_read_u64(PhysicalAddress::from(0x1008)).unwrap();
/// assert_eq!(cached.stats().hits, 1);
/// # }
/// ```
pub struct CachedPhysicalMemory<T> {
    mem: T,
    pages: HashMap<u64, CachedPage>,
    order: VecDeque<u64>,
    capacity: usize,
    validity: Option<Duration>,
    stats: CacheStats,
}

impl<T: PhysicalMemory> CachedPhysicalMemory<T> {
    pub fn builder(mem: T) -> CachedPhysicalMemoryBuilder<T> {
        CachedPhysicalMemoryBuilder::new(mem)
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Drops all cached pages, starting a new scan pass.
    pub fn invalidate(&mut self) {
        trace!("invalidating {} cached pages", self.pages.len());
        self.pages.clear();
        self.order.clear();
    }

    pub fn into_inner(self) -> T {
        self.mem
    }

    fn is_valid(&self, page: &CachedPage) -> bool {
        match self.validity {
            Some(validity) => page.fetched.elapsed() < validity,
            None => true,
        }
    }

    fn fetch(&mut self, pfn: u64) -> Result<&[u8]> {
        let hit = match self.pages.get(&pfn) {
            Some(page) => self.is_valid(page),
            None => false,
        };

        if hit {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;

            let mut data = vec![0u8; size::PAGE_SIZE as usize].into_boxed_slice();
            self.mem
                .phys_read_raw_into(PhysicalAddress::from_page_number(pfn), &mut data)?;

            if self.pages.contains_key(&pfn) {
                self.order.retain(|&p| p != pfn);
            } else if self.pages.len() >= self.capacity {
                if let Some(old) = self.order.pop_front() {
                    self.pages.remove(&old);
                    self.stats.evictions += 1;
                }
            }

            self.order.push_back(pfn);
            self.pages.insert(
                pfn,
                CachedPage {
                    data,
                    fetched: Instant::now(),
                },
            );
        }

        self.pages
            .get(&pfn)
            .map(|page| &*page.data)
            .ok_or(Error(ErrorOrigin::PageCache, ErrorKind::NotFound))
    }
}

impl<T: PhysicalMemory> PhysicalMemory for CachedPhysicalMemory<T> {
    fn phys_read_raw_into(&mut self, addr: PhysicalAddress, out: &mut [u8]) -> Result<()> {
        let mut done = 0usize;
        while done < out.len() {
            let cur = addr + done as u64;
            let offset = cur.page_offset() as usize;
            let len = (size::PAGE_SIZE as usize - offset).min(out.len() - done);

            match self.fetch(cur.page_number()) {
                Ok(page) => out[done..done + len].copy_from_slice(&page[offset..offset + len]),
                // a page at the edge of the backing store may be readable only partially
                Err(_) => self
                    .mem
                    .phys_read_raw_into(cur, &mut out[done..done + len])?,
            }
            done += len;
        }
        Ok(())
    }

    fn metadata(&self) -> PhysicalMemoryMetadata {
        self.mem.metadata()
    }
}

pub struct CachedPhysicalMemoryBuilder<T> {
    mem: T,
    cache_size: u64,
    validity: Option<Duration>,
}

impl<T: PhysicalMemory> CachedPhysicalMemoryBuilder<T> {
    pub fn new(mem: T) -> Self {
        Self {
            mem,
            cache_size: size::mb(2),
            validity: None,
        }
    }

    pub fn build(self) -> Result<CachedPhysicalMemory<T>> {
        let capacity = (self.cache_size / size::PAGE_SIZE) as usize;
        if capacity == 0 {
            return Err(Error(ErrorOrigin::PageCache, ErrorKind::Configuration)
                .log_error("cache_size must hold at least a single page"));
        }

        Ok(CachedPhysicalMemory {
            mem: self.mem,
            pages: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
            validity: self.validity,
            stats: CacheStats::default(),
        })
    }

    /// Total size of the cache in bytes.
    pub fn cache_size(mut self, cache_size: u64) -> Self {
        self.cache_size = cache_size;
        self
    }

    /// Expire entries after the given duration, for memory that keeps changing.
    pub fn validity(mut self, validity: std::time::Duration) -> Self {
        self.validity = Some(Duration::from_millis(validity.as_millis() as u64));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::DummyMemory;

    #[test]
    fn test_hits_and_eviction() {
        let mut mem = DummyMemory::new(size::mb(1));
        mem.write_raw(PhysicalAddress::from(0x3000), &0xdead_beefu64.to_le_bytes())
            .unwrap();

        let mut cached = CachedPhysicalMemory::builder(mem)
            .cache_size(size::kb(8))
            .build()
            .unwrap();

        assert_eq!(cached.phys_read_u64(PhysicalAddress::from(0x3000)).unwrap(), 0xdead_beef);
        assert_eq!(cached.phys_read_u64(PhysicalAddress::from(0x3000)).unwrap(), 0xdead_beef);
        cached.phys_read_u64(PhysicalAddress::from(0x4000)).unwrap();
        cached.phys_read_u64(PhysicalAddress::from(0x5000)).unwrap();

        let stats = cached.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 3);
        assert_eq!(stats.evictions, 1);

        // 0x3000 got evicted
        cached.phys_read_u64(PhysicalAddress::from(0x3000)).unwrap();
        assert_eq!(cached.stats().misses, 4);
    }

    #[test]
    fn test_read_spanning_pages() {
        let mut mem = DummyMemory::new(size::mb(1));
        mem.write_raw(PhysicalAddress::from(0x1ffe), &[1, 2, 3, 4])
            .unwrap();
        let mut cached = CachedPhysicalMemory::builder(mem).build().unwrap();

        assert_eq!(
            cached.phys_read_raw(PhysicalAddress::from(0x1ffe), 4).unwrap(),
            vec![1, 2, 3, 4]
        );
        cached.invalidate();
        assert_eq!(cached.phys_read_u32(PhysicalAddress::from(0x1ffe)).unwrap(), 0x0403_0201);
        assert_eq!(cached.stats().misses, 4);
    }

    #[test]
    fn test_out_of_range() {
        let mem = DummyMemory::new(size::kb(8));
        let mut cached = CachedPhysicalMemory::builder(mem).build().unwrap();
        assert!(cached.phys_read_u64(PhysicalAddress::from(0x4000)).is_err());
    }

    #[test]
    fn test_zero_capacity() {
        let mem = DummyMemory::new(size::kb(8));
        assert!(CachedPhysicalMemory::builder(mem)
            .cache_size(16)
            .build()
            .is_err());
    }
}
