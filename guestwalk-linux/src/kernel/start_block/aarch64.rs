use super::Descriptor;

use guestwalk::types::{size, PhysicalAddress};

/// Guest RAM starts at 1 GiB on the QEMU `virt` machine.
pub const PHYS_BASE: u64 = 0x4000_0000;

const OUTPUT_MASK: u64 = 0x0000_ffff_ffff_f000;

// bits 2..=11 are ignored in table descriptors and left clear by the kernel
const TABLE_LOW_IGNORED: u64 = 0x0000_0000_0000_0ffc;
// bits 48..=58 are res0 / ignored in table descriptors
const TABLE_HIGH_RES0: u64 = 0x07ff_0000_0000_0000;

const ATTR_AF: u64 = 1 << 10;

pub(super) fn classify(pte: u64, block_size: Option<u64>, ram_base: u64, max_ram: u64) -> Descriptor {
    if pte == 0 {
        return Descriptor::Empty;
    }
    // upper level tables never hold invalid entries with payload
    if pte & 1 == 0 {
        return Descriptor::Implausible;
    }

    if pte & 0b10 != 0 {
        if pte & (TABLE_LOW_IGNORED | TABLE_HIGH_RES0) != 0 {
            // most likely a last level page descriptor
            return Descriptor::Implausible;
        }
        return Descriptor::Table(PhysicalAddress::from(pte & OUTPUT_MASK));
    }

    let block_size = match block_size {
        Some(block_size) => block_size,
        None => return Descriptor::Implausible,
    };
    let addr = pte & OUTPUT_MASK;
    if addr % block_size != 0 || pte & ATTR_AF == 0 {
        return Descriptor::Implausible;
    }
    if addr < ram_base || addr >= ram_base.saturating_add(max_ram) {
        return Descriptor::Implausible;
    }
    Descriptor::Block(PhysicalAddress::from(addr))
}
