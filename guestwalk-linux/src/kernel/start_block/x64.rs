use super::Descriptor;

use guestwalk::types::PhysicalAddress;

const PTE_PRESENT: u64 = 1 << 0;
const PTE_LARGE: u64 = 1 << 7;
const OUTPUT_MASK: u64 = 0x000f_ffff_ffff_f000;
// software available bits and protection keys, unused by the kernel above the last level
const UPPER_RESERVED: u64 = 0x7ff0_0000_0000_0000;
// PAT sits at bit 12 of large page entries
const LARGE_PAT: u64 = 1 << 12;

pub(super) fn classify(pte: u64, block_size: Option<u64>, ram_base: u64, max_ram: u64) -> Descriptor {
    if pte == 0 {
        return Descriptor::Empty;
    }
    if pte & PTE_PRESENT == 0 || pte & UPPER_RESERVED != 0 {
        return Descriptor::Implausible;
    }

    if pte & PTE_LARGE == 0 {
        return Descriptor::Table(PhysicalAddress::from(pte & OUTPUT_MASK));
    }

    let block_size = match block_size {
        Some(block_size) => block_size,
        None => return Descriptor::Implausible,
    };
    let addr = pte & OUTPUT_MASK & !LARGE_PAT;
    if addr % block_size != 0 {
        return Descriptor::Implausible;
    }
    if addr < ram_base || addr >= ram_base.saturating_add(max_ram) {
        return Descriptor::Implausible;
    }
    Descriptor::Block(PhysicalAddress::from(addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use guestwalk::architecture::x86::x64;
    use guestwalk::types::{size, PageFlags};

    #[test]
    fn test_classify() {
        let max = size::gb(512);
        assert_eq!(
            classify(x64::table_entry(0x7000), None, 0, max),
            Descriptor::Table(PhysicalAddress::from(0x7000))
        );
        let block = x64::leaf_entry(size::gb(3), false, PageFlags::default());
        assert_eq!(
            classify(block, Some(size::gb(1)), 0, max),
            Descriptor::Block(PhysicalAddress::from(size::gb(3)))
        );
        assert_eq!(classify(block, None, 0, max), Descriptor::Implausible);

        let misaligned = x64::leaf_entry(size::mb(2), false, PageFlags::default());
        assert_eq!(
            classify(misaligned, Some(size::gb(1)), 0, max),
            Descriptor::Implausible
        );
        assert_eq!(classify(0x6000, None, 0, max), Descriptor::Implausible);
    }
}
