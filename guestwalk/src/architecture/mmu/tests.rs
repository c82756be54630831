use super::TranslationFailure;
use crate::architecture::ArchitectureIdent;
use crate::mem::{DummyMemory, PhysicalMemory};
use crate::types::{size, PageFlags, PhysicalAddress, VirtualAddress};

use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

const ALL_ARCHS: [ArchitectureIdent; 4] = [
    ArchitectureIdent::X86_64 { la57: false },
    ArchitectureIdent::X86_64 { la57: true },
    ArchitectureIdent::AArch64 { va_bits: 48 },
    ArchitectureIdent::AArch64 { va_bits: 39 },
];

fn kernel_va(arch: ArchitectureIdent, low: u64) -> VirtualAddress {
    VirtualAddress::from(low).canonicalize(arch.mmu().va_bits())
}

/// Walks the tables by hand, straight from the raw descriptor bits.
fn manual_translate(
    mem: &mut DummyMemory,
    arch: ArchitectureIdent,
    root: PhysicalAddress,
    va: VirtualAddress,
) -> PhysicalAddress {
    let (splits, addr_mask): (&[u32], u64) = match arch {
        ArchitectureIdent::X86_64 { la57: false } => (&[39, 30, 21, 12], 0x000f_ffff_ffff_f000),
        ArchitectureIdent::X86_64 { la57: true } => (&[48, 39, 30, 21, 12], 0x000f_ffff_ffff_f000),
        ArchitectureIdent::AArch64 { va_bits: 39 } => (&[30, 21, 12], 0x0000_ffff_ffff_f000),
        ArchitectureIdent::AArch64 { .. } => (&[39, 30, 21, 12], 0x0000_ffff_ffff_f000),
    };

    let mut table = root.as_u64();
    for (i, shift) in splits.iter().enumerate() {
        let index = (va.as_u64() >> shift) & 0x1ff;
        let pte = mem
            .phys_read_u64(PhysicalAddress::from(table + index * 8))
            .unwrap();
        assert_eq!(pte & 1, 1);

        let last = i == splits.len() - 1;
        let block = match arch {
            ArchitectureIdent::X86_64 { .. } => !last && pte & (1 << 7) != 0,
            ArchitectureIdent::AArch64 { .. } => !last && pte & 0b10 == 0,
        };
        if last || block {
            let offset_mask = (1u64 << shift) - 1;
            return PhysicalAddress::from((pte & addr_mask & !offset_mask) | (va.as_u64() & offset_mask));
        }
        table = pte & addr_mask;
    }
    unreachable!()
}

#[test]
fn test_translate_all_block_sizes() {
    for &arch in ALL_ARCHS.iter() {
        let mut mem = DummyMemory::new(size::mb(2));
        let root = mem.alloc_page();

        let mappings = [
            (kernel_va(arch, 0x40_0000_0000), 0x1_4000_0000u64, size::gb(1)),
            (kernel_va(arch, 0x40_8000_0000), 0x8060_0000u64, size::mb(2)),
            (VirtualAddress::from(0x15_5555_5000), 0x4123_4000u64, size::kb(4)),
        ];

        for &(va, pa, page_size) in mappings.iter() {
            mem.map(arch, root, va, pa.into(), page_size, PageFlags::default())
                .unwrap();
        }

        for &(va, pa, page_size) in mappings.iter() {
            let last_word = va + (page_size - 8);
            let mapping = arch.mmu().walk(&mut mem, root, last_word).unwrap();
            assert_eq!(mapping.page_size, page_size, "{}", arch);
            assert_eq!(mapping.address, PhysicalAddress::from(pa + page_size - 8));
            assert_eq!(
                arch.translate(&mut mem, root, last_word),
                Ok(manual_translate(&mut mem, arch, root, last_word)),
                "{} {}",
                arch,
                last_word
            );
        }
    }
}

#[test]
fn test_not_mapped() {
    for &arch in ALL_ARCHS.iter() {
        let mut mem = DummyMemory::new(size::mb(1));
        let root = mem.alloc_page();
        mem.map(
            arch,
            root,
            VirtualAddress::from(0x7000_0000),
            PhysicalAddress::from(0x5000),
            size::kb(4),
            PageFlags::default(),
        )
        .unwrap();

        assert_eq!(
            arch.translate(&mut mem, root, VirtualAddress::from(0x7000_1000)),
            Err(TranslationFailure::NotMapped)
        );
        assert_eq!(
            arch.translate(&mut mem, root, kernel_va(arch, 0x40_0000_0000)),
            Err(TranslationFailure::NotMapped)
        );
    }
}

#[test]
fn test_non_canonical() {
    let mut mem = DummyMemory::new(size::mb(1));
    let root = mem.alloc_page();
    let arch = ArchitectureIdent::X86_64 { la57: false };
    assert_eq!(
        arch.translate(&mut mem, root, VirtualAddress::from(0x0000_8000_0000_0000)),
        Err(TranslationFailure::NonCanonical)
    );
}

#[test]
fn test_malformed_aarch64_last_level() {
    let arch = ArchitectureIdent::AArch64 { va_bits: 48 };
    let mut mem = DummyMemory::new(size::mb(1));
    let root = mem.alloc_page();
    let va = VirtualAddress::from(0x7000_0000);
    mem.map(arch, root, va, PhysicalAddress::from(0x5000), size::kb(4), PageFlags::default())
        .unwrap();
    assert!(arch.translate(&mut mem, root, va).is_ok());

    // turn the last level page descriptor into a (reserved) block descriptor
    let mut table = root;
    let mmu = arch.mmu();
    for level in 0..3 {
        let pte = mem
            .phys_read_u64(table + mmu.index(va, level) * 8)
            .unwrap();
        table = PhysicalAddress::from(mmu.pte_addr(pte, size::PAGE_SIZE));
    }
    let pte_addr = table + mmu.index(va, 3) * 8;
    let pte = mem.phys_read_u64(pte_addr).unwrap();
    mem.write_u64(pte_addr, pte & !0b10).unwrap();

    assert_eq!(
        arch.translate(&mut mem, root, va),
        Err(TranslationFailure::MalformedTable)
    );
}

#[test]
fn test_malformed_root_block() {
    let arch = ArchitectureIdent::X86_64 { la57: false };
    let mut mem = DummyMemory::new(size::mb(1));
    let root = mem.alloc_page();
    // a large page bit in the PML4 is reserved
    mem.write_u64(root, 0x0000_0000_0000_0083).unwrap();
    assert_eq!(
        arch.translate(&mut mem, root, VirtualAddress::from(0x1234)),
        Err(TranslationFailure::MalformedTable)
    );
}

#[test]
fn test_out_of_range() {
    let arch = ArchitectureIdent::X86_64 { la57: false };
    let mut mem = DummyMemory::new(size::mb(1));
    let root = mem.alloc_page();
    // points to a table far outside of the backing memory
    mem.write_u64(root, 0x0000_0010_0000_0003).unwrap();
    assert_eq!(
        arch.translate(&mut mem, root, VirtualAddress::from(0x1234)),
        Err(TranslationFailure::OutOfRange)
    );
    assert_eq!(
        arch.translate(&mut mem, PhysicalAddress::from(size::gb(4)), VirtualAddress::from(0x1234)),
        Err(TranslationFailure::OutOfRange)
    );
}

#[test]
fn test_translate_range_partial() {
    let arch = ArchitectureIdent::AArch64 { va_bits: 48 };
    let mut mem = DummyMemory::new(size::mb(1));
    let root = mem.alloc_page();
    let va = VirtualAddress::from(0x40_0000);

    mem.map(arch, root, va, PhysicalAddress::from(0x8000), size::kb(4), PageFlags::default())
        .unwrap();
    mem.map(
        arch,
        root,
        va + 0x2000,
        PhysicalAddress::from(0x3000),
        size::kb(4),
        PageFlags::default(),
    )
    .unwrap();

    let results = arch.mmu().translate_range(&mut mem, root, va + 0x10, 3);
    assert_eq!(
        results,
        vec![
            Ok(PhysicalAddress::from(0x8000)),
            Err(TranslationFailure::NotMapped),
            Ok(PhysicalAddress::from(0x3000)),
        ]
    );
}

#[test]
fn test_translate_range_inside_block() {
    let arch = ArchitectureIdent::X86_64 { la57: false };
    let mut mem = DummyMemory::new(size::mb(1));
    let root = mem.alloc_page();
    let va = VirtualAddress::from(0x4000_0000);
    mem.map(arch, root, va, PhysicalAddress::from(0x20_0000), size::mb(2), PageFlags::default())
        .unwrap();

    let results = arch.mmu().translate_range(&mut mem, root, va + 0x1f_f000, 2);
    assert_eq!(results[0], Ok(PhysicalAddress::from(0x3f_f000)));
    assert_eq!(results[1], Err(TranslationFailure::NotMapped));
}

#[test]
fn test_translate_range_bounded() {
    let arch = ArchitectureIdent::X86_64 { la57: false };
    let mut mem = DummyMemory::new(size::mb(1));
    let root = mem.alloc_page();

    // only two pages are left before the end of the address space
    let top = VirtualAddress::from(0xffff_ffff_ffff_e000);
    let results = arch.mmu().translate_range(&mut mem, root, top, usize::MAX);
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.is_err()));

    let results = arch
        .mmu()
        .translate_range(&mut mem, root, VirtualAddress::NULL, usize::MAX);
    assert_eq!(results.len(), super::MAX_RANGE_PAGES);
}

#[test]
fn test_flags_reported() {
    for &arch in ALL_ARCHS.iter() {
        let mut mem = DummyMemory::new(size::mb(1));
        let root = mem.alloc_page();
        let va = VirtualAddress::from(0x1000_0000);
        let flags = PageFlags::default().write(true).user(true).accessed(true);
        mem.map(arch, root, va, PhysicalAddress::from(0x4000), size::kb(4), flags)
            .unwrap();
        let mapping = arch.mmu().walk(&mut mem, root, va).unwrap();
        assert_eq!(mapping.flags, flags, "{}", arch);
        assert_eq!(mapping.level, arch.mmu().level_count() - 1);
    }
}

#[test]
fn test_decompose_recompose() {
    let mut rng = XorShiftRng::seed_from_u64(0xdead_beef);
    for &arch in ALL_ARCHS.iter() {
        let mmu = arch.mmu();
        for _ in 0..2048 {
            let va = VirtualAddress::from(rng.gen::<u64>()).canonicalize(mmu.va_bits());
            let parts = mmu.decompose(va).unwrap();
            assert_eq!(parts.indices.len(), mmu.level_count());
            assert!(parts.indices.iter().all(|&i| i < 512));
            assert_eq!(mmu.recompose(&parts).unwrap(), va);
        }
    }
}

#[test]
fn test_decompose_rejects_non_canonical() {
    let mmu = ArchitectureIdent::AArch64 { va_bits: 48 }.mmu();
    assert!(mmu
        .decompose(VirtualAddress::from(0x00ff_0000_0000_0000))
        .is_err());
}
