//! A synthetic guest for tests.
//!
//! All of guest RAM behind the first MiB is mapped linearly into the kernel half, kernel
//! objects are bump allocated from it. Page tables of processes live in the same RAM.

use crate::kernel::{find_anchor, AnchorHint, KernelRoot, RootSource, WalkBudgets};
use crate::linux::vma::MapleType;
use crate::linux::LinuxKernel;
use crate::offsets::{
    FileOffsets, LinuxOffsetTable, LinuxOffsetsArchitecture, MmLayoutOffsets, MmOffsets,
    TaskOffsets, VmaCollection, VmaOffsets,
};

use std::collections::HashMap;

use guestwalk::architecture::{ArchitectureIdent, PageTableWalker, TranslationBase};
use guestwalk::mem::{DummyMemory, PhysicalMemory, VirtualView};
use guestwalk::types::{size, PageFlags, PhysicalAddress, VirtualAddress};

const RAM_BASE: u64 = 0x4000_0000;
const RAM_SIZE: u64 = size::mb(16);
/// page tables of the linear map live below this offset
const HEAP_OFFSET: u64 = size::mb(1);

const AARCH64_HEAP: u64 = 0xffff_0000_1000_0000;
const X86_64_HEAP: u64 = 0xffff_8880_0010_0000;

const TASK_SIZE: u64 = 0x1000;
const COMM_LEN: usize = 16;

pub struct FakeTask {
    pid: u32,
    name: Vec<u8>,
}

impl FakeTask {
    pub fn new(pid: u32, name: &str) -> Self {
        Self {
            pid,
            name: name.as_bytes().to_vec(),
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct FakeVma {
    start: u64,
    end: u64,
    flags: u64,
}

impl FakeVma {
    pub fn new(start: u64, end: u64, flags: u64) -> Self {
        Self { start, end, flags }
    }
}

/// The memory descriptor of a fake process.
#[derive(Debug, Copy, Clone)]
pub struct FakeMm {
    pub mm: VirtualAddress,
    pub pgd: PhysicalAddress,
    arch: ArchitectureIdent,
}

impl FakeMm {
    pub fn walker(&self, root: &KernelRoot) -> PageTableWalker {
        let base = match self.arch {
            ArchitectureIdent::AArch64 { .. } => TranslationBase::Split {
                low: self.pgd,
                high: root.root,
            },
            ArchitectureIdent::X86_64 { .. } => TranslationBase::Single(self.pgd),
        };
        PageTableWalker::new(self.arch, base)
    }
}

pub struct FakeKernel {
    pub mem: DummyMemory,
    pub arch: ArchitectureIdent,
    pub root: PhysicalAddress,
    pub offsets: LinuxOffsetTable,
    pub budgets: WalkBudgets,
    heap: VirtualAddress,
    init: Option<VirtualAddress>,
    mms: HashMap<VirtualAddress, FakeMm>,
}

impl FakeKernel {
    pub fn aarch64() -> Self {
        Self::aarch64_at(VirtualAddress::from(AARCH64_HEAP))
    }

    /// Places the first allocation at `heap`.
    pub fn aarch64_at(heap: VirtualAddress) -> Self {
        Self::new(
            ArchitectureIdent::AArch64 { va_bits: 48 },
            heap,
            aarch64_offsets(VmaCollection::LinkedList {
                mm_mmap: 0x0,
                vm_next: 0x10,
            }),
        )
    }

    pub fn aarch64_maple() -> Self {
        Self::new(
            ArchitectureIdent::AArch64 { va_bits: 48 },
            VirtualAddress::from(AARCH64_HEAP),
            aarch64_offsets(VmaCollection::MapleTree { mm_mt_root: 0x48 }),
        )
    }

    pub fn x86_64() -> Self {
        Self::new(
            ArchitectureIdent::X86_64 { la57: false },
            VirtualAddress::from(X86_64_HEAP),
            x86_64_offsets(VmaCollection::LinkedList {
                mm_mmap: 0x0,
                vm_next: 0x10,
            }),
        )
    }

    pub fn x86_64_maple() -> Self {
        Self::new(
            ArchitectureIdent::X86_64 { la57: false },
            VirtualAddress::from(X86_64_HEAP),
            x86_64_offsets(VmaCollection::MapleTree { mm_mt_root: 0x48 }),
        )
    }

    fn new(arch: ArchitectureIdent, heap: VirtualAddress, offsets: LinuxOffsetTable) -> Self {
        let mut mem = DummyMemory::with_base(RAM_SIZE, PhysicalAddress::from(RAM_BASE));
        let root = mem.alloc_page();
        mem.map_range(
            arch,
            root,
            heap,
            PhysicalAddress::from(RAM_BASE + HEAP_OFFSET),
            RAM_SIZE - HEAP_OFFSET,
            PageFlags::default().write(true).accessed(true),
        )
        .unwrap();
        // move the allocator to the start of the linear map
        let start = mem.alloc_aligned(0, HEAP_OFFSET);
        assert_eq!(start.as_u64(), RAM_BASE + HEAP_OFFSET);

        Self {
            mem,
            arch,
            root,
            offsets,
            budgets: WalkBudgets::default(),
            heap,
            init: None,
            mms: HashMap::new(),
        }
    }

    /// A table that does not validate against this guest.
    pub fn decoy_offsets(&self) -> LinuxOffsetTable {
        let mut table = self.offsets.clone();
        table.name = "fake-decoy".to_string();
        table.task.pid += 0x40;
        table.task.comm += 0x40;
        table
    }

    pub fn phys_of(&self, va: VirtualAddress) -> PhysicalAddress {
        PhysicalAddress::from(RAM_BASE + HEAP_OFFSET + (va - self.heap))
    }

    fn virt_of(&self, pa: PhysicalAddress) -> VirtualAddress {
        self.heap + (pa.as_u64() - RAM_BASE - HEAP_OFFSET)
    }

    fn alloc(&mut self, len: u64, align: u64) -> VirtualAddress {
        let pa = self.mem.alloc_aligned(len, align);
        self.virt_of(pa)
    }

    fn write_u64(&mut self, va: VirtualAddress, value: u64) {
        let pa = self.phys_of(va);
        self.mem.write_u64(pa, value).unwrap();
    }

    fn write_u32(&mut self, va: VirtualAddress, value: u32) {
        let pa = self.phys_of(va);
        self.mem.write_u32(pa, value).unwrap();
    }

    fn write_raw(&mut self, va: VirtualAddress, data: &[u8]) {
        let pa = self.phys_of(va);
        self.mem.write_raw(pa, data).unwrap();
    }

    pub fn add_task(&mut self, task: FakeTask) -> VirtualAddress {
        let addr = self.alloc(TASK_SIZE, TASK_SIZE);
        let offsets = self.offsets.task;
        self.write_u32(addr + offsets.pid, task.pid);
        self.set_name(addr, &task.name);
        self.write_u64(addr + offsets.real_parent, addr.as_u64());
        if task.pid == 0 && self.init.is_none() {
            self.init = Some(addr);
        }
        addr
    }

    /// Links the tasks into a circular list in the given order.
    pub fn link_list(&mut self, tasks: &[VirtualAddress]) {
        let offsets = self.offsets.task;
        let n = tasks.len();
        for (i, &task) in tasks.iter().enumerate() {
            let next = tasks[(i + 1) % n];
            let prev = tasks[(i + n - 1) % n];
            self.write_u64(task + offsets.tasks_next, (next + offsets.tasks_next).as_u64());
            self.write_u64(task + offsets.tasks_prev, (prev + offsets.tasks_next).as_u64());
        }
    }

    pub fn set_next(&mut self, task: VirtualAddress, next: VirtualAddress) {
        let offsets = self.offsets.task;
        self.write_u64(task + offsets.tasks_next, (next + offsets.tasks_next).as_u64());
    }

    pub fn set_name(&mut self, task: VirtualAddress, name: &[u8]) {
        let mut comm = [0u8; COMM_LEN];
        let len = name.len().min(COMM_LEN);
        comm[..len].copy_from_slice(&name[..len]);
        let offset = self.offsets.task.comm;
        self.write_raw(task + offset, &comm);
    }

    pub fn set_parent(&mut self, task: VirtualAddress, parent: VirtualAddress) {
        let offset = self.offsets.task.real_parent;
        self.write_u64(task + offset, parent.as_u64());
    }

    /// Gives the task a memory descriptor with its own top level table.
    pub fn add_mm(&mut self, task: VirtualAddress) -> FakeMm {
        let mm = self.alloc(0x400, 0x40);
        let pgd_va = self.alloc(size::PAGE_SIZE, size::PAGE_SIZE);
        let pgd = self.phys_of(pgd_va);

        if let ArchitectureIdent::X86_64 { .. } = self.arch {
            // the kernel half is shared by every address space
            for idx in 256..512u64 {
                let entry = self.mem.phys_read_u64(self.root + idx * 8).unwrap();
                self.mem.write_u64(pgd + idx * 8, entry).unwrap();
            }
        }

        let mm_offsets = self.offsets.mm;
        self.write_u64(mm + mm_offsets.pgd, pgd_va.as_u64());
        if let Some(layout) = mm_offsets.layout {
            self.write_u64(mm + layout.start_code, 0x40_0000);
            self.write_u64(mm + layout.end_code, 0x40_8000);
            self.write_u64(mm + layout.start_data, 0x60_0000);
            self.write_u64(mm + layout.end_data, 0x60_4000);
        }
        let task_mm = self.offsets.task.mm;
        self.write_u64(task + task_mm, mm.as_u64());

        let fake_mm = FakeMm {
            mm,
            pgd,
            arch: self.arch,
        };
        self.mms.insert(task, fake_mm);
        fake_mm
    }

    pub fn add_vmas(&mut self, mm: &FakeMm, vmas: &[FakeVma]) {
        let vo = self.offsets.vma.unwrap();
        let addrs = vmas
            .iter()
            .map(|vma| {
                let addr = self.alloc(0x100, 0x100);
                self.write_u64(addr + vo.vm_start, vma.start);
                self.write_u64(addr + vo.vm_end, vma.end);
                self.write_u64(addr + vo.vm_flags, vma.flags);
                addr
            })
            .collect::<Vec<_>>();

        match vo.collection {
            VmaCollection::LinkedList { mm_mmap, vm_next } => {
                let mut head = mm.mm + mm_mmap;
                for &addr in addrs.iter() {
                    self.write_u64(head, addr.as_u64());
                    head = addr + vm_next;
                }
            }
            VmaCollection::MapleTree { mm_mt_root } => {
                let root = if addrs.len() <= 16 {
                    let leaf = self.maple_node(0x80, &addrs);
                    MapleType::Leaf64.encode_root(leaf)
                } else {
                    let children = addrs
                        .chunks(10)
                        .map(|chunk| {
                            let leaf = self.maple_node(0x80, chunk);
                            VirtualAddress::from(MapleType::Leaf64.encode(leaf))
                        })
                        .collect::<Vec<_>>();
                    assert!(children.len() <= 10, "too many areas for a fake maple tree");
                    let node = self.maple_node(0x50, &children);
                    MapleType::Arange64.encode_root(node)
                };
                self.write_u64(mm.mm + mm_mt_root, root);
            }
        }
    }

    fn maple_node(&mut self, slots: u64, entries: &[VirtualAddress]) -> VirtualAddress {
        let node = self.alloc(0x100, 0x100);
        for (i, entry) in entries.iter().enumerate() {
            self.write_u64(node + slots + i as u64 * 8, entry.as_u64());
        }
        node
    }

    /// Maps a fresh user page holding `data` into the address space of the task.
    pub fn map_user_page(&mut self, task: VirtualAddress, va: VirtualAddress, data: &[u8]) {
        let pgd = self.mms[&task].pgd;
        let page = self.mem.alloc_page();
        self.mem.write_raw(page, data).unwrap();
        self.mem
            .map(
                self.arch,
                pgd,
                va,
                page,
                size::PAGE_SIZE,
                PageFlags::default().user(true).accessed(true),
            )
            .unwrap();
    }

    pub fn add_inode(&mut self, ino: u64, size: u64) -> VirtualAddress {
        let fo = self.offsets.files.unwrap();
        let inode = self.alloc(0x100, 0x40);
        self.write_u64(inode + fo.inode_ino, ino);
        self.write_u64(inode + fo.inode_size, size);
        inode
    }

    /// Installs a descriptor table with one `struct file` per given slot.
    pub fn add_files(&mut self, task: VirtualAddress, max_fds: u32, fds: &[(u32, VirtualAddress)]) {
        let fo = self.offsets.files.unwrap();
        let files = self.alloc(0x100, 0x40);
        let fdt = self.alloc(0x40, 0x40);
        let array = self.alloc(max_fds as u64 * 8, 8);

        for &(fd, inode) in fds.iter() {
            let file = self.alloc(0x100, 0x40);
            self.write_u64(file + fo.file_inode, inode.as_u64());
            self.write_u64(array + fd as u64 * 8, file.as_u64());
        }
        self.write_u32(fdt + fo.fdt_max_fds, max_fds);
        self.write_u64(fdt + fo.fdt_fd, array.as_u64());
        self.write_u64(files + fo.files_fdt, fdt.as_u64());
        let task_files = self.offsets.task.files.unwrap();
        self.write_u64(task + task_files, files.as_u64());
    }

    pub fn kernel_root(&self) -> KernelRoot {
        KernelRoot {
            arch: self.arch,
            root: self.root,
            user_root: None,
            source: RootSource::Explicit,
            registers: None,
            scan: None,
        }
    }

    pub fn into_view(self) -> VirtualView<DummyMemory> {
        let walker = self.kernel_root().walker();
        VirtualView::new(self.mem, walker)
    }

    pub fn into_kernel(self) -> LinuxKernel<DummyMemory> {
        let root = self.kernel_root();
        let offsets = self.offsets.clone();
        let budgets = self.budgets;
        let init = self.init.expect("fake guest without a pid 0 task");

        let mut view = self.into_view();
        let anchor = find_anchor(
            &mut view,
            &[&offsets],
            &[AnchorHint::Virtual(init)],
            &budgets.tasks,
        )
        .unwrap();
        LinuxKernel::new(view.into_inner(), root, anchor, budgets)
    }
}

fn aarch64_offsets(collection: VmaCollection) -> LinuxOffsetTable {
    LinuxOffsetTable {
        name: "fake-aarch64".to_string(),
        arch: LinuxOffsetsArchitecture::AArch64,
        task: TaskOffsets {
            pid: 0x200,
            comm: 0x400,
            tasks_next: 0x100,
            tasks_prev: 0x108,
            mm: 0x300,
            real_parent: 0x210,
            files: Some(0x308),
        },
        mm: MmOffsets {
            pgd: 0x40,
            layout: Some(MmLayoutOffsets {
                start_code: 0x100,
                end_code: 0x108,
                start_data: 0x110,
                end_data: 0x118,
            }),
        },
        vma: Some(VmaOffsets {
            collection,
            vm_start: 0x0,
            vm_end: 0x8,
            vm_flags: 0x50,
            vm_file: 0xa0,
        }),
        files: Some(FileOffsets {
            files_fdt: 0x20,
            fdt_max_fds: 0x0,
            fdt_fd: 0x8,
            file_inode: 0x20,
            inode_ino: 0x40,
            inode_size: 0x50,
        }),
    }
}

fn x86_64_offsets(collection: VmaCollection) -> LinuxOffsetTable {
    let mut table = aarch64_offsets(collection);
    table.name = "fake-x86_64".to_string();
    table.arch = LinuxOffsetsArchitecture::X86_64;
    table.task.pid = 0x220;
    table.task.real_parent = 0x230;
    table
}
