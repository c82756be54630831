/*!
This module covers all implementations and traits related to
reading physical and virtual memory.

The [`cache`] module contains the bounded page cache a scan pass reads through.

All volatile reads go through a [`PhysicalMemory`] object. [`VirtualView`] layers a page
table walker on top of it to read guest virtual memory.
*/

pub mod cache;
pub mod phys_mem;
pub mod virt_mem;

#[cfg(any(feature = "dummy_mem", test))]
pub mod dummy;

#[doc(hidden)]
pub use cache::{CacheStats, CachedPhysicalMemory, CachedPhysicalMemoryBuilder};
#[doc(hidden)]
pub use phys_mem::{PhysicalMemory, PhysicalMemoryMetadata};
#[doc(hidden)]
pub use virt_mem::VirtualView;

#[cfg(any(feature = "dummy_mem", test))]
#[doc(hidden)]
pub use dummy::DummyMemory;
