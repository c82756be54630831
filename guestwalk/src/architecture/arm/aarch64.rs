/*!
AArch64 with a 4 KiB translation granule.

Descriptor layout (stage 1, EL1&0 regime):

| bits  | meaning |
|-------|---------|
| 0     | valid |
| 1     | table (levels above the last) or page (last level), clear for a block |
| 6     | AP[1], accessible from EL0 |
| 7     | AP[2], read only |
| 10    | access flag |
| 53    | PXN |
| 54    | UXN |
*/

use super::super::ArchMmuDef;
use crate::types::PageFlags;

fn present_bit(pte: u64) -> bool {
    pte & 1 != 0
}

fn large_page_bit(pte: u64) -> bool {
    pte & 0b10 == 0
}

fn leaf_page_bit(pte: u64) -> bool {
    pte & 0b10 != 0
}

fn writeable_bit(pte: u64) -> bool {
    pte & ATTR_AP_RO == 0
}

fn user_bit(pte: u64) -> bool {
    pte & ATTR_AP_USER != 0
}

fn nx_bit(pte: u64, user: bool) -> bool {
    if user {
        pte & ATTR_UXN != 0
    } else {
        pte & ATTR_PXN != 0
    }
}

fn accessed_bit(pte: u64) -> bool {
    pte & ATTR_AF != 0
}

/// 48 bit virtual addresses, four levels, 1 GiB blocks at level 1 and 2 MiB blocks at level 2.
pub static MMU_48: ArchMmuDef = ArchMmuDef {
    name: "aarch64/48",
    virtual_address_splits: &[9, 9, 9, 9, 12],
    valid_final_page_steps: &[1, 2, 3],
    address_space_bits: 48,
    pte_size: 8,
    present_bit,
    large_page_bit,
    leaf_page_bit,
    writeable_bit,
    user_bit,
    nx_bit,
    accessed_bit,
};

/// 39 bit virtual addresses, three levels starting at level 1 which may hold 1 GiB blocks.
pub static MMU_39: ArchMmuDef = ArchMmuDef {
    name: "aarch64/39",
    virtual_address_splits: &[9, 9, 9, 12],
    valid_final_page_steps: &[0, 1, 2],
    address_space_bits: 48,
    pte_size: 8,
    present_bit,
    large_page_bit,
    leaf_page_bit,
    writeable_bit,
    user_bit,
    nx_bit,
    accessed_bit,
};

const ATTR_AF: u64 = 1 << 10;
const ATTR_SH_INNER: u64 = 0b11 << 8;
const ATTR_AP_USER: u64 = 1 << 6;
const ATTR_AP_RO: u64 = 1 << 7;
const ATTR_PXN: u64 = 1 << 53;
const ATTR_UXN: u64 = 1 << 54;

/// Encodes a descriptor pointing to a next level table.
pub const fn table_entry(table: u64) -> u64 {
    (table & 0x0000_ffff_ffff_f000) | 0b11
}

/// Encodes a block (`last == false`) or page (`last == true`) descriptor.
pub fn leaf_entry(base: u64, last: bool, flags: PageFlags) -> u64 {
    let mut pte = (base & 0x0000_ffff_ffff_f000) | ATTR_SH_INNER | 0b01;
    if last {
        pte |= 0b10;
    }
    if flags.contains(PageFlags::ACCESSED) {
        pte |= ATTR_AF;
    }
    if !flags.contains(PageFlags::WRITEABLE) {
        pte |= ATTR_AP_RO;
    }
    if flags.contains(PageFlags::USER) {
        pte |= ATTR_AP_USER | ATTR_PXN;
        if !flags.contains(PageFlags::EXECUTABLE) {
            pte |= ATTR_UXN;
        }
    } else {
        pte |= ATTR_UXN;
        if !flags.contains(PageFlags::EXECUTABLE) {
            pte |= ATTR_PXN;
        }
    }
    pte
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VirtualAddress;

    #[test]
    fn test_geometry() {
        assert_eq!(MMU_48.level_count(), 4);
        assert_eq!(MMU_48.va_bits(), 48);
        assert_eq!(MMU_48.page_size_level(1), 1 << 30);
        assert_eq!(MMU_48.page_size_level(2), 1 << 21);
        assert_eq!(MMU_48.page_size_level(3), 1 << 12);

        assert_eq!(MMU_39.level_count(), 3);
        assert_eq!(MMU_39.va_bits(), 39);
        assert_eq!(MMU_39.page_size_level(0), 1 << 30);
    }

    #[test]
    fn test_descriptor_bits() {
        let flags = PageFlags::default().write(true).accessed(true);
        let block = leaf_entry(0x4000_0000, false, flags);
        assert!((MMU_48.present_bit)(block));
        assert!((MMU_48.large_page_bit)(block));
        assert_eq!(MMU_48.page_flags(block), flags);

        let page = leaf_entry(0x4123_4000, true, PageFlags::default().user(true).exec(true));
        assert!((MMU_48.leaf_page_bit)(page));
        assert!(!(MMU_48.large_page_bit)(page));
        assert_eq!(
            MMU_48.page_flags(page),
            PageFlags::READABLE | PageFlags::USER | PageFlags::EXECUTABLE
        );
        assert_eq!(MMU_48.pte_addr(page, 0x1000), 0x4123_4000);

        let table = table_entry(0x4100_0000);
        assert!(!(MMU_48.large_page_bit)(table));
        assert_eq!(MMU_48.pte_addr(table, 0x1000), 0x4100_0000);
    }

    #[test]
    fn test_kernel_half() {
        assert!(MMU_48.is_kernel_address(VirtualAddress::from(0xffff_8000_11c1_0000)));
        assert!(!MMU_48.is_kernel_address(VirtualAddress::from(0x0000_ffff_8000_0000)));
        assert!(MMU_39.is_kernel_address(VirtualAddress::from(0xffff_ffc0_1000_0000)));
        assert!(!MMU_39.is_kernel_address(VirtualAddress::from(0xffff_8000_11c1_0000)));
    }
}
