use crate::kernel::anchor::{next_task, prev_task, read_kernel_ptr, validate_task, ValidTask};
use crate::kernel::budget::{BudgetTracker, WalkBudget, WalkStatus};
use crate::kernel::KernelRoot;
use crate::offsets::{LinuxOffsetTable, MmLayoutOffsets};

use guestwalk::architecture::{ArchitectureIdent, PageTableWalker, TranslationBase};
use guestwalk::mem::{PhysicalMemory, VirtualView};
use guestwalk::types::{size, PhysicalAddress, VirtualAddress};

use hashbrown::HashSet;
use log::trace;
use serde::Serialize;

/// Code and data boundaries of a process image, from `mm_struct`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub struct MemoryLayout {
    pub start_code: VirtualAddress,
    pub end_code: VirtualAddress,
    pub start_data: VirtualAddress,
    pub end_data: VirtualAddress,
}

/// A validated `task_struct` with the information resolved from it.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub name: String,
    /// virtual address of the `task_struct`
    pub address: VirtualAddress,
    /// physical address of the `task_struct`
    pub phys: PhysicalAddress,
    /// `tasks.next` and `tasks.prev` as read during the walk
    pub tasks_next: VirtualAddress,
    pub tasks_prev: VirtualAddress,
    /// `mm_struct`, `None` for kernel threads
    pub mm: Option<VirtualAddress>,
    /// physical address of the top level table of the process
    pub pgd: Option<PhysicalAddress>,
    pub parent: Option<VirtualAddress>,
    pub parent_pid: Option<u32>,
    pub layout: Option<MemoryLayout>,
}

impl ProcessRecord {
    pub fn is_kernel_thread(&self) -> bool {
        self.mm.is_none()
    }

    /// Returns the translation base of the process address space.
    ///
    /// On AArch64 the kernel half is always translated through the kernel root.
    pub fn translation_base(&self, kernel_root: &KernelRoot) -> Option<TranslationBase> {
        let pgd = self.pgd?;
        Some(match kernel_root.arch {
            ArchitectureIdent::AArch64 { .. } => TranslationBase::Split {
                low: pgd,
                high: kernel_root.root,
            },
            ArchitectureIdent::X86_64 { .. } => TranslationBase::Single(pgd),
        })
    }

    pub fn walker(&self, kernel_root: &KernelRoot) -> Option<PageTableWalker> {
        self.translation_base(kernel_root)
            .map(|base| PageTableWalker::new(kernel_root.arch, base))
    }
}

/// The result of a full walk over the task list.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessList {
    pub records: Vec<ProcessRecord>,
    pub status: WalkStatus,
}

/// Resolves the details of a validated task.
///
/// None of the lookups is fatal, a missing or invalid field just leaves the
/// corresponding entry empty.
pub fn enrich<T: PhysicalMemory>(
    view: &mut VirtualView<T>,
    offsets: &LinuxOffsetTable,
    task: ValidTask,
) -> ProcessRecord {
    let addr = task.address;
    let arch = view.walker().arch();

    let tasks_next = view
        .read_addr(addr + offsets.task.tasks_next)
        .unwrap_or(VirtualAddress::NULL);
    let tasks_prev = view
        .read_addr(addr + offsets.task.tasks_prev)
        .unwrap_or(VirtualAddress::NULL);

    let mm = match view.read_addr(addr + offsets.task.mm) {
        Ok(mm) if mm.is_null() => None,
        Ok(mm) if arch.is_kernel_address(mm) => Some(mm),
        Ok(mm) => {
            trace!("pid {}: mm {} is not a kernel address", task.pid, mm);
            None
        }
        Err(err) => {
            trace!("pid {}: unable to read mm: {}", task.pid, err);
            None
        }
    };

    let pgd = mm.and_then(|mm| {
        let pgd = read_kernel_ptr(view, mm + offsets.mm.pgd).ok()?;
        let phys = view.translate(pgd).ok()?;
        if phys.page_offset_for(size::PAGE_SIZE) != 0 {
            trace!("pid {}: pgd {} is not page aligned", task.pid, phys);
            return None;
        }
        Some(phys)
    });

    let parent = read_kernel_ptr(view, addr + offsets.task.real_parent).ok();
    let parent_pid = parent.and_then(|parent| match validate_task(view, &offsets.task, parent) {
        Ok(parent) => Some(parent.pid),
        Err(rejection) => {
            trace!("pid {}: parent {} rejected: {}", task.pid, parent, rejection);
            None
        }
    });

    let layout = match (mm, offsets.mm.layout) {
        (Some(mm), Some(layout)) => read_layout(view, mm, &layout),
        _ => None,
    };

    ProcessRecord {
        pid: task.pid,
        name: task.name,
        address: addr,
        phys: task.phys,
        tasks_next,
        tasks_prev,
        mm,
        pgd,
        parent,
        parent_pid,
        layout,
    }
}

fn read_layout<T: PhysicalMemory>(
    view: &mut VirtualView<T>,
    mm: VirtualAddress,
    offsets: &MmLayoutOffsets,
) -> Option<MemoryLayout> {
    Some(MemoryLayout {
        start_code: view.read_addr(mm + offsets.start_code).ok()?,
        end_code: view.read_addr(mm + offsets.end_code).ok()?,
        start_data: view.read_addr(mm + offsets.start_data).ok()?,
        end_data: view.read_addr(mm + offsets.end_data).ok()?,
    })
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum IterState {
    Anchor,
    Forward(VirtualAddress),
    /// walking `tasks.prev` after the forward walk broke
    Backward(Option<VirtualAddress>),
    Done,
}

/// Lazily walks the task list starting at `init_task`.
///
/// `init_task` is always yielded first. The walk follows `tasks.next` and ends when the
/// list returns to the anchor, an address repeats or the budget is used up. If a node on
/// the way can not be read or fails validation the walk continues backwards from the
/// anchor over `tasks.prev` to recover the tail of the list.
///
/// The iterator holds no state besides the walk itself, a new one restarts from the anchor.
pub struct ProcessIter<'a, T> {
    view: &'a mut VirtualView<T>,
    offsets: &'a LinuxOffsetTable,
    anchor: VirtualAddress,
    tracker: BudgetTracker,
    visited: HashSet<VirtualAddress>,
    state: IterState,
    status: WalkStatus,
}

impl<'a, T: PhysicalMemory> ProcessIter<'a, T> {
    pub fn new(
        view: &'a mut VirtualView<T>,
        offsets: &'a LinuxOffsetTable,
        anchor: VirtualAddress,
        budget: &WalkBudget,
    ) -> Self {
        Self {
            view,
            offsets,
            anchor,
            tracker: budget.start(),
            visited: HashSet::new(),
            state: IterState::Anchor,
            status: WalkStatus::Complete,
        }
    }

    /// How the walk ended so far. Only final once the iterator returned `None`.
    pub fn status(&self) -> WalkStatus {
        self.status
    }

    fn finish(&mut self, status: WalkStatus) {
        self.status = self.status.merge(status);
        self.state = IterState::Done;
    }

    fn broken(&mut self) {
        self.status = self.status.merge(WalkStatus::Broken);
        let prev = prev_task(self.view, &self.offsets.task, self.anchor).ok();
        self.state = IterState::Backward(prev);
    }

    fn accept(&mut self, task: ValidTask) -> ProcessRecord {
        self.visited.insert(task.address);
        enrich(self.view, self.offsets, task)
    }
}

impl<'a, T: PhysicalMemory> Iterator for ProcessIter<'a, T> {
    type Item = ProcessRecord;

    fn next(&mut self) -> Option<ProcessRecord> {
        loop {
            match self.state {
                IterState::Anchor => {
                    if !self.tracker.tick() {
                        self.finish(WalkStatus::Exhausted);
                        continue;
                    }
                    let task = match validate_task(self.view, &self.offsets.task, self.anchor) {
                        Ok(task) => task,
                        Err(rejection) => {
                            trace!("init_task {} rejected: {}", self.anchor, rejection);
                            self.finish(WalkStatus::Broken);
                            continue;
                        }
                    };
                    let record = self.accept(task);
                    match next_task(self.view, &self.offsets.task, self.anchor) {
                        Ok(next) => self.state = IterState::Forward(next),
                        Err(_) => self.broken(),
                    }
                    return Some(record);
                }
                IterState::Forward(addr) => {
                    if addr == self.anchor {
                        self.finish(WalkStatus::Complete);
                        continue;
                    }
                    if self.visited.contains(&addr) {
                        trace!("task list cycles at {}", addr);
                        self.finish(WalkStatus::Cycle);
                        continue;
                    }
                    if !self.tracker.tick() {
                        self.finish(WalkStatus::Exhausted);
                        continue;
                    }
                    let task = match validate_task(self.view, &self.offsets.task, addr) {
                        Ok(task) => task,
                        Err(rejection) => {
                            trace!("task {} rejected: {}", addr, rejection);
                            self.broken();
                            continue;
                        }
                    };
                    let record = self.accept(task);
                    match next_task(self.view, &self.offsets.task, addr) {
                        Ok(next) => self.state = IterState::Forward(next),
                        Err(_) => self.broken(),
                    }
                    return Some(record);
                }
                IterState::Backward(None) => self.finish(WalkStatus::Broken),
                IterState::Backward(Some(addr)) => {
                    // reaching an already walked task joins both halves
                    if self.visited.contains(&addr) {
                        self.state = IterState::Done;
                        continue;
                    }
                    if !self.tracker.tick() {
                        self.finish(WalkStatus::Exhausted);
                        continue;
                    }
                    let task = match validate_task(self.view, &self.offsets.task, addr) {
                        Ok(task) => task,
                        Err(rejection) => {
                            trace!("task {} rejected: {}", addr, rejection);
                            self.state = IterState::Done;
                            continue;
                        }
                    };
                    let record = self.accept(task);
                    let prev = prev_task(self.view, &self.offsets.task, addr).ok();
                    self.state = IterState::Backward(prev);
                    return Some(record);
                }
                IterState::Done => return None,
            }
        }
    }
}
