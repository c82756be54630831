use super::discovery::{
    merge_status, process_tree, Completeness, DiscoveryOptions, DiscoveryResult, ProcessDetails,
};
use super::files::{open_files, FileList, InodeMap};
use super::process::{ProcessIter, ProcessList, ProcessRecord};
use super::vma::{memory_regions, RegionList};
use super::LinuxKernelBuilder;
use crate::kernel::{Anchor, KernelRoot, WalkBudgets};
use crate::offsets::LinuxOffsetTable;

use guestwalk::architecture::PageTableWalker;
use guestwalk::error::{Error, ErrorKind, ErrorOrigin, Result};
use guestwalk::mem::{PhysicalMemory, VirtualView};
use guestwalk::types::VirtualAddress;

use log::{info, warn};

/// An initialized view into a running Linux guest.
///
/// Holds the validated kernel root, the offset table that made `init_task` validate and the
/// virtual memory view of the kernel. All walks start from here.
pub struct LinuxKernel<T> {
    pub virt_mem: VirtualView<T>,
    pub kernel_root: KernelRoot,
    pub offsets: LinuxOffsetTable,
    pub init_task: VirtualAddress,
    pub budgets: WalkBudgets,
}

impl<T: PhysicalMemory> LinuxKernel<T> {
    pub fn new(mem: T, kernel_root: KernelRoot, anchor: Anchor, budgets: WalkBudgets) -> Self {
        Self::with_view(VirtualView::new(mem, kernel_root.walker()), kernel_root, anchor, budgets)
    }

    pub(crate) fn with_view(
        virt_mem: VirtualView<T>,
        kernel_root: KernelRoot,
        anchor: Anchor,
        budgets: WalkBudgets,
    ) -> Self {
        Self {
            virt_mem,
            kernel_root,
            offsets: anchor.offsets,
            init_task: anchor.task.address,
            budgets,
        }
    }

    pub fn builder<'a>(connector: T) -> LinuxKernelBuilder<'a, T, T> {
        LinuxKernelBuilder::new(connector)
    }

    /// Consumes the kernel and returns the underlying memory.
    pub fn into_inner(self) -> T {
        self.virt_mem.into_inner()
    }

    /// Returns a lazy walk over the task list, starting at `init_task`.
    pub fn processes(&mut self) -> ProcessIter<'_, T> {
        ProcessIter::new(
            &mut self.virt_mem,
            &self.offsets,
            self.init_task,
            &self.budgets.tasks,
        )
    }

    pub fn process_list(&mut self) -> ProcessList {
        let mut iter = self.processes();
        let records = iter.by_ref().collect::<Vec<_>>();
        let status = iter.status();
        ProcessList { records, status }
    }

    pub fn process_by_pid(&mut self, pid: u32) -> Result<ProcessRecord> {
        self.processes().find(|p| p.pid == pid).ok_or_else(|| {
            Error(ErrorOrigin::OsLayer, ErrorKind::NotFound)
                .log_info(format!("pid {} not found", pid))
        })
    }

    pub fn processes_by_name(&mut self, name: &str) -> Vec<ProcessRecord> {
        self.processes().filter(|p| p.name == name).collect()
    }

    /// Returns a walker for the address space of the process, `None` for kernel threads.
    pub fn process_walker(&self, record: &ProcessRecord) -> Option<PageTableWalker> {
        record.walker(&self.kernel_root)
    }

    /// Returns a view into the address space of the process, `None` for kernel threads.
    pub fn process_view(&mut self, record: &ProcessRecord) -> Option<VirtualView<&mut T>> {
        let walker = self.process_walker(record)?;
        Some(self.virt_mem.with_walker(walker))
    }

    /// Walks the memory areas of a process. `None` for kernel threads or without
    /// memory area offsets.
    pub fn memory_regions(&mut self, record: &ProcessRecord) -> Option<RegionList> {
        let mm = record.mm?;
        let walker = self.process_walker(record)?;
        let mut view = self.virt_mem.with_walker(walker);
        memory_regions(&mut view, &self.offsets, mm, &self.budgets)
    }

    /// Walks the file descriptor table of a process.
    pub fn open_files(&mut self, record: &ProcessRecord) -> Option<FileList> {
        match self.process_walker(record) {
            Some(walker) => {
                let mut view = self.virt_mem.with_walker(walker);
                open_files(&mut view, &self.offsets, record.address, &self.budgets.fds)
            }
            // kernel threads share the files of init
            None => open_files(
                &mut self.virt_mem,
                &self.offsets,
                record.address,
                &self.budgets.fds,
            ),
        }
    }

    /// Walks the task list and, per the options, the memory areas and open files of
    /// every process.
    ///
    /// Fails only if not a single process could be validated.
    pub fn discover(&mut self, options: DiscoveryOptions) -> Result<DiscoveryResult> {
        let list = self.process_list();
        if list.records.is_empty() {
            return Err(Error(ErrorOrigin::OsLayer, ErrorKind::NotFound)
                .log_error(format!("init_task at {} no longer validates", self.init_task)));
        }
        if list.status.is_partial() {
            warn!("task list walk ended with {:?}", list.status);
        }

        let mut inodes = InodeMap::new();
        let mut processes = Vec::with_capacity(list.records.len());
        for record in list.records.into_iter() {
            let regions = if options.regions {
                self.memory_regions(&record)
            } else {
                None
            };
            let files = if options.files {
                self.open_files(&record)
            } else {
                None
            };
            if let Some(files) = &files {
                inodes.extend(record.pid, files);
            }
            processes.push(ProcessDetails {
                record,
                regions,
                files,
            });
        }

        let records = processes
            .iter()
            .map(|p| p.record.clone())
            .collect::<Vec<_>>();
        let completeness = Completeness {
            processes: list.status,
            regions: merge_status(
                processes
                    .iter()
                    .filter_map(|p| p.regions.as_ref().map(|r| r.status)),
            ),
            files: merge_status(
                processes
                    .iter()
                    .filter_map(|p| p.files.as_ref().map(|f| f.status)),
            ),
        };

        info!(
            "discovered {} processes, {} open inodes",
            processes.len(),
            inodes.len()
        );
        Ok(DiscoveryResult {
            kernel_root: self.kernel_root,
            offsets: self.offsets.name.clone(),
            init_task: self.init_task,
            processes,
            inodes,
            tree: process_tree(&records),
            completeness,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{FakeKernel, FakeTask, FakeVma};
    use crate::kernel::WalkStatus;

    fn sample_guest() -> FakeKernel {
        let mut fake = FakeKernel::aarch64();
        let init = fake.add_task(FakeTask::new(0, "swapper/0"));
        let systemd = fake.add_task(FakeTask::new(1, "systemd"));
        let kthreadd = fake.add_task(FakeTask::new(2, "kthreadd"));
        let sh = fake.add_task(FakeTask::new(300, "sh"));
        let sh2 = fake.add_task(FakeTask::new(301, "sh"));
        fake.link_list(&[init, systemd, kthreadd, sh, sh2]);
        fake.set_parent(systemd, init);
        fake.set_parent(kthreadd, init);
        fake.set_parent(sh, systemd);
        fake.set_parent(sh2, sh);

        let tty = fake.add_inode(3, 0);
        let log = fake.add_inode(4242, 8192);
        for &task in [systemd, sh, sh2].iter() {
            let mm = fake.add_mm(task);
            fake.add_vmas(
                &mm,
                &[
                    FakeVma::new(0x40_0000, 0x40_8000, 0x75),
                    FakeVma::new(0x7fff_0000_0000, 0x7fff_0002_0000, 0x173),
                ],
            );
        }
        fake.map_user_page(sh, VirtualAddress::from(0x40_0000), b"\x7fELF");
        fake.add_files(sh, 16, &[(0, tty), (1, tty), (3, log)]);
        fake.add_files(sh2, 16, &[(0, tty), (4, log)]);
        fake
    }

    #[test]
    fn test_process_lookup() {
        let mut kernel = sample_guest().into_kernel();

        assert_eq!(kernel.process_list().records.len(), 5);
        assert_eq!(kernel.process_by_pid(300).unwrap().name, "sh");
        assert_eq!(
            kernel.process_by_pid(12345),
            Err(Error(ErrorOrigin::OsLayer, ErrorKind::NotFound))
        );
        let shells = kernel.processes_by_name("sh");
        assert_eq!(
            shells.iter().map(|p| p.pid).collect::<Vec<_>>(),
            vec![300, 301]
        );
    }

    #[test]
    fn test_process_view() {
        let mut kernel = sample_guest().into_kernel();
        let sh = kernel.process_by_pid(300).unwrap();
        let kthreadd = kernel.process_by_pid(2).unwrap();

        assert!(kernel.process_view(&kthreadd).is_none());
        let mut view = kernel.process_view(&sh).unwrap();
        let mut magic = [0u8; 4];
        view.read_raw_into(VirtualAddress::from(0x40_0000), &mut magic)
            .unwrap();
        assert_eq!(&magic, b"\x7fELF");
        // the kernel half stays reachable
        assert!(view.read_u32(sh.address).is_ok());
    }

    #[test]
    fn test_discover() {
        let mut kernel = sample_guest().into_kernel();
        let result = kernel.discover(DiscoveryOptions::default()).unwrap();

        assert_eq!(result.processes.len(), 5);
        assert_eq!(result.offsets, "fake-aarch64");
        assert!(result.is_complete());

        let sh = result.process(300).unwrap();
        let regions = sh.regions.as_ref().unwrap();
        assert_eq!(regions.regions.len(), 2);
        assert_eq!(regions.regions[1].len(), 0x20000);
        assert!(result.process(2).unwrap().regions.is_none());

        let log = result.inodes.get(4242).unwrap();
        assert_eq!(log.size, 8192);
        assert_eq!(log.owners.len(), 2);
        assert_eq!(result.inodes.get(3).unwrap().owners.len(), 3);

        assert_eq!(result.tree.roots.len(), 1);
        let init = result.tree.roots().next().unwrap();
        let systemd = result.tree.children(init).next().unwrap();
        assert_eq!(systemd.pid, 1);
        let sh2 = result.tree.node(301).unwrap();
        assert_eq!(result.tree.parent(sh2).unwrap().pid, 300);
        assert_eq!(result.tree.depth(sh2), 3);
    }

    #[test]
    fn test_x86_64_guest() {
        let mut fake = FakeKernel::x86_64();
        let init = fake.add_task(FakeTask::new(0, "swapper/0"));
        let bash = fake.add_task(FakeTask::new(77, "bash"));
        fake.link_list(&[init, bash]);
        fake.set_parent(bash, init);
        let mm = fake.add_mm(bash);
        fake.add_vmas(&mm, &[FakeVma::new(0x55_0000, 0x56_0000, 0x75)]);
        fake.map_user_page(bash, VirtualAddress::from(0x55_0000), b"#!/bin");
        let mut kernel = fake.into_kernel();

        let bash = kernel.process_by_pid(77).unwrap();
        assert_eq!(bash.pgd, Some(mm.pgd));
        let regions = kernel.memory_regions(&bash).unwrap();
        assert_eq!(regions.regions.len(), 1);
        assert_eq!(regions.regions[0].perms(), "r-xp");

        let mut view = kernel.process_view(&bash).unwrap();
        assert_eq!(view.read_raw(VirtualAddress::from(0x55_0000), 6).unwrap(), b"#!/bin");
    }

    #[test]
    fn test_discover_partial() {
        let mut fake = sample_guest();
        let budgets = WalkBudgets {
            tasks: crate::kernel::WalkBudget::iterations(2),
            ..WalkBudgets::default()
        };
        fake.budgets = budgets;
        let mut kernel = fake.into_kernel();
        let result = kernel
            .discover(DiscoveryOptions::processes_only())
            .unwrap();
        assert_eq!(result.processes.len(), 2);
        assert_eq!(result.completeness.processes, WalkStatus::Exhausted);
        assert!(!result.is_complete());
        assert!(result.processes[1].files.is_none());
    }
}
