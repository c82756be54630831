use super::super::ArchMmuDef;
use crate::types::PageFlags;

const PTE_PRESENT: u64 = 1 << 0;
const PTE_WRITEABLE: u64 = 1 << 1;
const PTE_USER: u64 = 1 << 2;
const PTE_ACCESSED: u64 = 1 << 5;
const PTE_LARGE: u64 = 1 << 7;
const PTE_NX: u64 = 1 << 63;

const PTE_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

fn present_bit(pte: u64) -> bool {
    pte & PTE_PRESENT != 0
}

fn large_page_bit(pte: u64) -> bool {
    pte & PTE_LARGE != 0
}

// bit 7 of a last level entry is PAT, every present entry maps a page
fn leaf_page_bit(_pte: u64) -> bool {
    true
}

fn writeable_bit(pte: u64) -> bool {
    pte & PTE_WRITEABLE != 0
}

fn user_bit(pte: u64) -> bool {
    pte & PTE_USER != 0
}

fn nx_bit(pte: u64, _user: bool) -> bool {
    pte & PTE_NX != 0
}

fn accessed_bit(pte: u64) -> bool {
    pte & PTE_ACCESSED != 0
}

/// Four level paging, 48 bit virtual addresses.
pub static MMU_4LEVEL: ArchMmuDef = ArchMmuDef {
    name: "x86_64",
    virtual_address_splits: &[9, 9, 9, 9, 12],
    valid_final_page_steps: &[1, 2, 3],
    address_space_bits: 52,
    pte_size: 8,
    present_bit,
    large_page_bit,
    leaf_page_bit,
    writeable_bit,
    user_bit,
    nx_bit,
    accessed_bit,
};

/// Five level paging (LA57), 57 bit virtual addresses.
pub static MMU_5LEVEL: ArchMmuDef = ArchMmuDef {
    name: "x86_64/la57",
    virtual_address_splits: &[9, 9, 9, 9, 9, 12],
    valid_final_page_steps: &[2, 3, 4],
    address_space_bits: 52,
    pte_size: 8,
    present_bit,
    large_page_bit,
    leaf_page_bit,
    writeable_bit,
    user_bit,
    nx_bit,
    accessed_bit,
};

/// Encodes an entry pointing to a next level table.
pub const fn table_entry(table: u64) -> u64 {
    (table & PTE_ADDR_MASK) | PTE_PRESENT | PTE_WRITEABLE | PTE_USER
}

/// Encodes a large page (`last == false`) or 4 KiB page (`last == true`) entry.
pub fn leaf_entry(base: u64, last: bool, flags: PageFlags) -> u64 {
    let mut pte = (base & PTE_ADDR_MASK) | PTE_PRESENT;
    if !last {
        pte |= PTE_LARGE;
    }
    if flags.contains(PageFlags::WRITEABLE) {
        pte |= PTE_WRITEABLE;
    }
    if flags.contains(PageFlags::USER) {
        pte |= PTE_USER;
    }
    if flags.contains(PageFlags::ACCESSED) {
        pte |= PTE_ACCESSED;
    }
    if !flags.contains(PageFlags::EXECUTABLE) {
        pte |= PTE_NX;
    }
    pte
}
