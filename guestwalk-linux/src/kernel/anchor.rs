/*!
Validation of candidate `task_struct`s and discovery of the `init_task` anchor.

Nothing read from guest memory is trusted. Every candidate address goes through
[`validate_task`] which either yields a [`ValidTask`] or a [`Rejection`]. Rejections are
the normal outcome while guessing offsets and only show up in trace logs.
*/

use super::budget::WalkBudget;
use crate::offsets::{LinuxOffsetTable, TaskOffsets};

use guestwalk::architecture::ArchitectureIdent;
use guestwalk::error::{Error, ErrorKind, ErrorOrigin, Result};
use guestwalk::mem::{PhysicalMemory, VirtualView};
use guestwalk::types::{PhysicalAddress, VirtualAddress};

use hashbrown::HashSet;
use log::{debug, info, trace};

/// Length of `task_struct::comm` including the terminator.
pub const TASK_COMM_LEN: usize = 16;

/// Highest pid accepted during validation.
pub const MAX_PID: u32 = 65535;

/// `init_task` addresses seen on arm64 kernels without KASLR.
const AARCH64_INIT_TASK_PROBES: [u64; 3] = [
    0xffff_8000_11c1_0000,
    0xffff_8000_11a1_0000,
    0xffff_8000_1181_0000,
];

/// `init_task` addresses seen on x86-64 kernels without KASLR.
const X86_64_INIT_TASK_PROBES: [u64; 2] = [0xffff_ffff_82a1_4940, 0xffff_ffff_8261_3940];

/// Returns the built-in `init_task` probe addresses for an architecture.
pub fn init_task_probes(arch: ArchitectureIdent) -> impl Iterator<Item = VirtualAddress> {
    let probes: &'static [u64] = match arch {
        ArchitectureIdent::AArch64 { .. } => &AARCH64_INIT_TASK_PROBES,
        ArchitectureIdent::X86_64 { .. } => &X86_64_INIT_TASK_PROBES,
    };
    probes.iter().copied().map(VirtualAddress::from)
}

/// Why a candidate task was not accepted.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Rejection {
    /// The address is not a canonical kernel address.
    NotKernelAddress,
    /// The address or one of its fields could not be translated or read.
    Unreadable,
    PidOutOfRange(u32),
    /// `comm` is empty or contains non printable characters.
    BadName,
}

impl Rejection {
    pub fn to_str(self) -> &'static str {
        match self {
            Rejection::NotKernelAddress => "not a kernel address",
            Rejection::Unreadable => "unreadable",
            Rejection::PidOutOfRange(_) => "pid out of range",
            Rejection::BadName => "bad name",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.to_str())
    }
}

/// A `task_struct` that passed validation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ValidTask {
    pub address: VirtualAddress,
    pub phys: PhysicalAddress,
    pub pid: u32,
    pub name: String,
}

/// Decodes `comm` up to its terminator, or the full width if there is none.
///
/// Only printable ASCII is accepted and at least one character is required.
pub fn decode_comm(bytes: &[u8]) -> std::result::Result<String, Rejection> {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let name = &bytes[..len];
    if name.is_empty() || !name.iter().all(|&b| (0x20..0x7f).contains(&b)) {
        return Err(Rejection::BadName);
    }
    Ok(name.iter().map(|&b| b as char).collect())
}

/// Reads a kernel pointer and checks that it points into the kernel half.
pub fn read_kernel_ptr<T: PhysicalMemory>(
    view: &mut VirtualView<T>,
    addr: VirtualAddress,
) -> std::result::Result<VirtualAddress, Rejection> {
    let ptr = view.read_addr(addr).map_err(|_| Rejection::Unreadable)?;
    if !view.walker().arch().is_kernel_address(ptr) {
        return Err(Rejection::NotKernelAddress);
    }
    Ok(ptr)
}

/// Validates the `task_struct` at `addr`.
pub fn validate_task<T: PhysicalMemory>(
    view: &mut VirtualView<T>,
    offsets: &TaskOffsets,
    addr: VirtualAddress,
) -> std::result::Result<ValidTask, Rejection> {
    if !view.walker().arch().is_kernel_address(addr) {
        return Err(Rejection::NotKernelAddress);
    }
    let phys = view.translate(addr).map_err(|_| Rejection::Unreadable)?;

    let pid = view
        .read_u32(addr + offsets.pid)
        .map_err(|_| Rejection::Unreadable)?;
    if pid > MAX_PID {
        return Err(Rejection::PidOutOfRange(pid));
    }

    let mut comm = [0u8; TASK_COMM_LEN];
    view.read_raw_into(addr + offsets.comm, &mut comm)
        .map_err(|_| Rejection::Unreadable)?;
    let name = decode_comm(&comm)?;

    Ok(ValidTask {
        address: addr,
        phys,
        pid,
        name,
    })
}

/// Follows `tasks.next` of a task to the next `task_struct`.
pub fn next_task<T: PhysicalMemory>(
    view: &mut VirtualView<T>,
    offsets: &TaskOffsets,
    task: VirtualAddress,
) -> std::result::Result<VirtualAddress, Rejection> {
    read_kernel_ptr(view, task + offsets.tasks_next).map(|entry| entry - offsets.tasks_next)
}

/// Follows `tasks.prev` of a task to the previous `task_struct`.
pub fn prev_task<T: PhysicalMemory>(
    view: &mut VirtualView<T>,
    offsets: &TaskOffsets,
    task: VirtualAddress,
) -> std::result::Result<VirtualAddress, Rejection> {
    read_kernel_ptr(view, task + offsets.tasks_prev).map(|entry| entry - offsets.tasks_next)
}

/// An externally supplied location of a task.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AnchorHint {
    /// Virtual address of `init_task`, e.g. from a symbol lookup.
    Virtual(VirtualAddress),
    /// Physical address of `init_task`.
    Physical(PhysicalAddress),
    /// Any task on the task list, e.g. the one currently running on a cpu.
    Task(VirtualAddress),
}

/// The validated `init_task` and the offsets it validated with.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Anchor {
    pub task: ValidTask,
    pub offsets: LinuxOffsetTable,
}

/// Resolves the virtual address of a task given by its physical address.
///
/// The `tasks.prev` field of the next task points back at the list entry of this one.
fn virtual_from_physical<T: PhysicalMemory>(
    view: &mut VirtualView<T>,
    offsets: &TaskOffsets,
    pa: PhysicalAddress,
) -> std::result::Result<VirtualAddress, Rejection> {
    let next_entry = view
        .phys_mem()
        .phys_read_u64(pa + offsets.tasks_next)
        .map(VirtualAddress::from)
        .map_err(|_| Rejection::Unreadable)?;
    if !view.walker().arch().is_kernel_address(next_entry) {
        return Err(Rejection::NotKernelAddress);
    }
    let next = next_entry - offsets.tasks_next;
    let entry = read_kernel_ptr(view, next + offsets.tasks_prev)?;
    let task = entry - offsets.tasks_next;
    if view.translate(task).ok() != Some(pa) {
        return Err(Rejection::Unreadable);
    }
    Ok(task)
}

/// Walks forward from any task until the task with pid 0 is reached.
fn anchor_from_task<T: PhysicalMemory>(
    view: &mut VirtualView<T>,
    offsets: &TaskOffsets,
    start: VirtualAddress,
    budget: &WalkBudget,
) -> std::result::Result<VirtualAddress, Rejection> {
    let mut tracker = budget.start();
    let mut visited = HashSet::new();
    let mut task = start;
    while tracker.tick() && visited.insert(task) {
        let valid = validate_task(view, offsets, task)?;
        if valid.pid == 0 {
            return Ok(task);
        }
        task = next_task(view, offsets, task)?;
    }
    Err(Rejection::Unreadable)
}

/// Checks that `addr` is a valid task with pid 0 and linked into a list.
fn validate_anchor<T: PhysicalMemory>(
    view: &mut VirtualView<T>,
    offsets: &TaskOffsets,
    addr: VirtualAddress,
) -> std::result::Result<ValidTask, Rejection> {
    let task = validate_task(view, offsets, addr)?;
    if task.pid != 0 {
        return Err(Rejection::PidOutOfRange(task.pid));
    }
    read_kernel_ptr(view, addr + offsets.tasks_next)?;
    read_kernel_ptr(view, addr + offsets.tasks_prev)?;
    Ok(task)
}

/// Finds `init_task` by trying every offset table against every hint and probe address.
///
/// Tables are tried in the given order. The first table that makes a candidate validate
/// as the pid 0 task is accepted.
pub fn find_anchor<T: PhysicalMemory>(
    view: &mut VirtualView<T>,
    tables: &[&LinuxOffsetTable],
    hints: &[AnchorHint],
    budget: &WalkBudget,
) -> Result<Anchor> {
    let arch = view.walker().arch();

    for &table in tables.iter() {
        debug!("trying offset table {}", table.name);
        let offsets = &table.task;

        let candidates = hints
            .iter()
            .map(|&hint| match hint {
                AnchorHint::Virtual(va) => Ok(va),
                AnchorHint::Physical(pa) => virtual_from_physical(view, offsets, pa),
                AnchorHint::Task(va) => anchor_from_task(view, offsets, va, budget),
            })
            .chain(init_task_probes(arch).map(Ok))
            .collect::<Vec<_>>();

        for candidate in candidates.into_iter() {
            let result = candidate.and_then(|addr| validate_anchor(view, offsets, addr));
            match result {
                Ok(task) => {
                    info!(
                        "found init_task at {} ({}) with offset table {}",
                        task.address, task.name, table.name
                    );
                    return Ok(Anchor {
                        task,
                        offsets: table.clone(),
                    });
                }
                Err(rejection) => trace!("{}: anchor candidate rejected: {}", table.name, rejection),
            }
        }
    }

    Err(Error(ErrorOrigin::OsLayer, ErrorKind::NotFound)
        .log_error("unable to find init_task with any offset table"))
}
