/*!
Discovery of the memory areas (`vm_area_struct`) of a process.

Kernels before 6.1 chain the areas in a list starting at `mm->mmap`, newer kernels keep them
in the maple tree at `mm->mm_mt`. Which one is used is part of the offset table.
*/

mod maple;

#[cfg(test)]
pub(crate) use maple::MapleType;

use maple::MapleWalk;

use crate::kernel::anchor::{read_kernel_ptr, Rejection};
use crate::kernel::budget::{BudgetTracker, WalkBudgets, WalkStatus};
use crate::offsets::{FileOffsets, LinuxOffsetTable, VmaCollection, VmaOffsets};

use guestwalk::architecture::ArchitectureIdent;
use guestwalk::mem::{PhysicalMemory, VirtualView};
use guestwalk::types::{size, PageFlags, VirtualAddress};

use bitflags::bitflags;
use hashbrown::HashSet;
use log::{debug, trace};
use serde::Serialize;

bitflags! {
    /// `vm_area_struct::vm_flags`
    #[derive(Serialize)]
    #[repr(transparent)]
    pub struct VmFlags: u64 {
        const READ = 0x0000_0001;
        const WRITE = 0x0000_0002;
        const EXEC = 0x0000_0004;
        const SHARED = 0x0000_0008;
        const MAYREAD = 0x0000_0010;
        const MAYWRITE = 0x0000_0020;
        const MAYEXEC = 0x0000_0040;
        const MAYSHARE = 0x0000_0080;
        const GROWSDOWN = 0x0000_0100;
        const PFNMAP = 0x0000_0400;
        const LOCKED = 0x0000_2000;
        const IO = 0x0000_4000;
        const DONTCOPY = 0x0002_0000;
        const DONTEXPAND = 0x0004_0000;
        const ACCOUNT = 0x0010_0000;
        const NORESERVE = 0x0020_0000;
        const HUGETLB = 0x0040_0000;
        const DONTDUMP = 0x0400_0000;
        const MIXEDMAP = 0x1000_0000;
        const HUGEPAGE = 0x2000_0000;
        const NOHUGEPAGE = 0x4000_0000;
        const MERGEABLE = 0x8000_0000;
    }
}

impl VmFlags {
    /// Converts the access bits into page flags of a user mapping.
    pub fn page_flags(self) -> PageFlags {
        let mut flags = PageFlags::NONE.user(true);
        flags.set(PageFlags::READABLE, self.contains(VmFlags::READ));
        flags
            .write(self.contains(VmFlags::WRITE))
            .exec(self.contains(VmFlags::EXEC))
    }
}

/// A single memory area of a process.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct MemoryRegion {
    /// the `vm_area_struct` itself
    pub address: VirtualAddress,
    pub start: VirtualAddress,
    /// exclusive
    pub end: VirtualAddress,
    pub flags: VmFlags,
    /// `vm_file`, `None` for anonymous memory
    pub file: Option<VirtualAddress>,
    /// inode number of `vm_file` if it could be resolved
    pub inode: Option<u64>,
}

impl MemoryRegion {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, va: VirtualAddress) -> bool {
        va >= self.start && va < self.end
    }

    /// Permissions in the format of `/proc/<pid>/maps`.
    pub fn perms(&self) -> String {
        let flag = |f: VmFlags, c: char| if self.flags.contains(f) { c } else { '-' };
        let mut perms = String::with_capacity(4);
        perms.push(flag(VmFlags::READ, 'r'));
        perms.push(flag(VmFlags::WRITE, 'w'));
        perms.push(flag(VmFlags::EXEC, 'x'));
        perms.push(if self.flags.contains(VmFlags::SHARED) {
            's'
        } else {
            'p'
        });
        perms
    }
}

/// The memory areas of one process sorted by address.
#[derive(Debug, Clone, Serialize)]
pub struct RegionList {
    pub regions: Vec<MemoryRegion>,
    pub status: WalkStatus,
}

/// Walks the memory areas of the `mm_struct` at `mm`.
///
/// Returns `None` if the offset table does not describe memory areas. `view` has to
/// translate through the page tables of the process owning `mm`.
pub fn memory_regions<T: PhysicalMemory>(
    view: &mut VirtualView<T>,
    offsets: &LinuxOffsetTable,
    mm: VirtualAddress,
    budgets: &WalkBudgets,
) -> Option<RegionList> {
    let vma_offsets = offsets.vma?;
    let mut tracker = budgets.vmas.start();

    let (vmas, status) = match vma_offsets.collection {
        VmaCollection::MapleTree { mm_mt_root } => match view.read_u64(mm + mm_mt_root) {
            Ok(root) => {
                MapleWalk::new(view, &mut tracker, budgets.vmas.start(), budgets.maple_depth)
                    .collect(root)
            }
            Err(err) => {
                trace!("unable to read maple root of mm {}: {}", mm, err);
                (Vec::new(), WalkStatus::Broken)
            }
        },
        VmaCollection::LinkedList { mm_mmap, vm_next } => {
            walk_list(view, &mut tracker, mm + mm_mmap, vm_next)
        }
    };

    let mut seen = HashSet::new();
    let regions = vmas
        .into_iter()
        .filter(|&vma| seen.insert(vma))
        .filter_map(
            |vma| match read_region(view, vma, &vma_offsets, offsets.files.as_ref()) {
                Ok(region) => Some(region),
                Err(rejection) => {
                    trace!("vma {} rejected: {}", vma, rejection);
                    None
                }
            },
        )
        .collect::<Vec<_>>();

    let regions = normalize(view.walker().arch(), regions);
    debug!("mm {}: {} regions ({:?})", mm, regions.len(), status);
    Some(RegionList { regions, status })
}

fn walk_list<T: PhysicalMemory>(
    view: &mut VirtualView<T>,
    tracker: &mut BudgetTracker,
    head: VirtualAddress,
    vm_next: u64,
) -> (Vec<VirtualAddress>, WalkStatus) {
    let arch = view.walker().arch();
    let mut out = Vec::new();
    let mut visited = HashSet::new();

    let mut vma = match view.read_addr(head) {
        Ok(vma) => vma,
        Err(_) => return (out, WalkStatus::Broken),
    };
    while !vma.is_null() {
        if !arch.is_kernel_address(vma) {
            return (out, WalkStatus::Broken);
        }
        if !visited.insert(vma) {
            return (out, WalkStatus::Cycle);
        }
        if !tracker.tick() {
            return (out, WalkStatus::Exhausted);
        }
        out.push(vma);
        vma = match view.read_addr(vma + vm_next) {
            Ok(next) => next,
            Err(_) => return (out, WalkStatus::Broken),
        };
    }
    (out, WalkStatus::Complete)
}

fn read_region<T: PhysicalMemory>(
    view: &mut VirtualView<T>,
    vma: VirtualAddress,
    offsets: &VmaOffsets,
    file_offsets: Option<&FileOffsets>,
) -> Result<MemoryRegion, Rejection> {
    let start = view
        .read_addr(vma + offsets.vm_start)
        .map_err(|_| Rejection::Unreadable)?;
    let end = view
        .read_addr(vma + offsets.vm_end)
        .map_err(|_| Rejection::Unreadable)?;
    let flags = view
        .read_u64(vma + offsets.vm_flags)
        .map(VmFlags::from_bits_truncate)
        .map_err(|_| Rejection::Unreadable)?;

    let file = view
        .read_addr(vma + offsets.vm_file)
        .ok()
        .and_then(VirtualAddress::non_null)
        .filter(|&file| view.walker().arch().is_kernel_address(file));
    let inode = match (file, file_offsets) {
        (Some(file), Some(fo)) => read_kernel_ptr(view, file + fo.file_inode)
            .ok()
            .and_then(|inode| view.read_u64(inode + fo.inode_ino).ok()),
        _ => None,
    };

    Ok(MemoryRegion {
        address: vma,
        start,
        end,
        flags,
        file,
        inode,
    })
}

/// Drops implausible and overlapping regions and sorts the rest by address.
///
/// A region has to be a non empty, page aligned range of user addresses. Of two
/// overlapping regions the one starting first is kept.
fn normalize(arch: ArchitectureIdent, mut regions: Vec<MemoryRegion>) -> Vec<MemoryRegion> {
    regions.retain(|r| {
        let ok = r.start < r.end
            && r.start.page_offset_for(size::PAGE_SIZE) == 0
            && r.end.page_offset_for(size::PAGE_SIZE) == 0
            && arch.is_user_address(r.start)
            && arch.is_user_address(r.end - 1);
        if !ok {
            trace!("dropping implausible region {}-{}", r.start, r.end);
        }
        ok
    });
    regions.sort_by_key(|r| r.start);

    let mut out: Vec<MemoryRegion> = Vec::with_capacity(regions.len());
    for region in regions.into_iter() {
        match out.last() {
            Some(last) if region.start < last.end => {
                trace!(
                    "dropping region {}-{} overlapping {}-{}",
                    region.start,
                    region.end,
                    last.start,
                    last.end
                );
            }
            _ => out.push(region),
        }
    }
    out
}
