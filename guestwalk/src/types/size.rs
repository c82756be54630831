///! This module contains helper functions for creating various byte sizes.
///! All function are const and will be optimized by rustc.

/// Returns a u64 representing the length in bytes from the given number of kilobytes.
pub const fn kb(kb: u64) -> u64 {
    kb * 1024
}

/// Returns a u64 representing the length in bytes from the given number of megabytes.
pub const fn mb(mb: u64) -> u64 {
    kb(mb) * 1024
}

/// Returns a u64 representing the length in bytes from the given number of gigabytes.
pub const fn gb(gb: u64) -> u64 {
    mb(gb) * 1024
}

/// Size of the smallest translation granule supported by all architectures.
pub const PAGE_SIZE: u64 = kb(4);

/// log2 of `PAGE_SIZE`.
pub const PAGE_SHIFT: u32 = 12;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from() {
        assert_eq!(kb(20), 20480);
        assert_eq!(mb(20), 20_971_520);
        assert_eq!(gb(6), 6_442_450_944);
        assert_eq!(1 << PAGE_SHIFT, PAGE_SIZE);
    }
}
