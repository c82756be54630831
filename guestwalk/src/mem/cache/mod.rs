pub mod page_cache;

#[doc(hidden)]
pub use page_cache::{CacheStats, CachedPhysicalMemory, CachedPhysicalMemoryBuilder};
