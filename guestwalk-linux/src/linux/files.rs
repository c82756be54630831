use crate::kernel::anchor::read_kernel_ptr;
use crate::kernel::budget::{WalkBudget, WalkStatus};
use crate::offsets::LinuxOffsetTable;

use std::collections::BTreeMap;

use guestwalk::mem::{PhysicalMemory, VirtualView};
use guestwalk::types::VirtualAddress;

use log::{debug, trace};
use serde::Serialize;

/// An occupied slot of a file descriptor table.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub struct FileDescriptor {
    pub fd: u32,
    /// `struct file`
    pub file: VirtualAddress,
    /// `struct inode`
    pub inode: VirtualAddress,
    pub ino: u64,
    pub size: u64,
}

/// The open files of one process.
#[derive(Debug, Clone, Serialize)]
pub struct FileList {
    pub files: Vec<FileDescriptor>,
    /// `fdt->max_fds` as read from the guest
    pub max_fds: u32,
    pub status: WalkStatus,
}

/// Walks `task->files->fdt` of the task at `task`.
///
/// Returns `None` if the offset table does not describe file tables or the table itself
/// can not be reached. Unreadable slots are skipped.
pub fn open_files<T: PhysicalMemory>(
    view: &mut VirtualView<T>,
    offsets: &LinuxOffsetTable,
    task: VirtualAddress,
    budget: &WalkBudget,
) -> Option<FileList> {
    let files_offset = offsets.task.files?;
    let fo = offsets.files?;

    let files = read_kernel_ptr(view, task + files_offset)
        .map_err(|rejection| trace!("task {}: files rejected: {}", task, rejection))
        .ok()?;
    let fdt = read_kernel_ptr(view, files + fo.files_fdt)
        .map_err(|rejection| trace!("task {}: fdt rejected: {}", task, rejection))
        .ok()?;
    let max_fds = view.read_u32(fdt + fo.fdt_max_fds).ok()?;
    let fd_array = read_kernel_ptr(view, fdt + fo.fdt_fd).ok()?;

    let mut tracker = budget.start();
    let mut status = WalkStatus::Complete;
    let mut out = Vec::new();

    for fd in 0..max_fds {
        if !tracker.tick() {
            status = WalkStatus::Exhausted;
            break;
        }

        let file = match view.read_addr(fd_array + fd as u64 * 8) {
            Ok(file) if file.is_null() => continue,
            Ok(file) => file,
            Err(err) => {
                trace!("task {}: unable to read fd {}: {}", task, fd, err);
                status = status.merge(WalkStatus::Broken);
                continue;
            }
        };
        if !view.walker().arch().is_kernel_address(file) {
            trace!("task {}: fd {} points to {}", task, fd, file);
            continue;
        }

        let inode = match read_kernel_ptr(view, file + fo.file_inode) {
            Ok(inode) => inode,
            Err(rejection) => {
                trace!("task {}: fd {} inode rejected: {}", task, fd, rejection);
                continue;
            }
        };
        let (ino, size) = match (
            view.read_u64(inode + fo.inode_ino),
            view.read_u64(inode + fo.inode_size),
        ) {
            (Ok(ino), Ok(size)) => (ino, size),
            _ => continue,
        };

        out.push(FileDescriptor {
            fd,
            file,
            inode,
            ino,
            size,
        });
    }

    debug!("task {}: {} open files of {} slots", task, out.len(), max_fds);
    Some(FileList {
        files: out,
        max_fds,
        status,
    })
}

/// A process holding an inode open through a descriptor.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize)]
pub struct FileOwner {
    pub pid: u32,
    pub fd: u32,
}

/// An inode with all descriptors referring to it.
///
/// `fd`, `file` and `size` are taken from the first observation.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct OpenFileEntry {
    pub ino: u64,
    pub inode: VirtualAddress,
    pub fd: u32,
    pub file: VirtualAddress,
    pub size: u64,
    pub owners: Vec<FileOwner>,
}

/// Open files of all processes keyed by inode number.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct InodeMap {
    entries: BTreeMap<u64, OpenFileEntry>,
}

impl InodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `pid` holds `desc` open.
    ///
    /// The first observation of an inode creates its entry, later ones only add an owner.
    pub fn insert(&mut self, pid: u32, desc: &FileDescriptor) {
        let owner = FileOwner { pid, fd: desc.fd };
        let entry = self.entries.entry(desc.ino).or_insert_with(|| OpenFileEntry {
            ino: desc.ino,
            inode: desc.inode,
            fd: desc.fd,
            file: desc.file,
            size: desc.size,
            owners: Vec::new(),
        });
        if !entry.owners.contains(&owner) {
            entry.owners.push(owner);
        }
    }

    pub fn extend(&mut self, pid: u32, files: &FileList) {
        files.files.iter().for_each(|desc| self.insert(pid, desc));
    }

    pub fn get(&self, ino: u64) -> Option<&OpenFileEntry> {
        self.entries.get(&ino)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OpenFileEntry> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{FakeKernel, FakeTask};

    #[test]
    fn test_open_files() {
        let mut fake = FakeKernel::aarch64();
        let task = fake.add_task(FakeTask::new(1, "cat"));
        fake.link_list(&[task]);
        let passwd = fake.add_inode(1234, 2048);
        let tty = fake.add_inode(7, 0);
        fake.add_files(task, 8, &[(0, tty), (1, tty), (3, passwd)]);
        let table = fake.offsets.clone();
        let mut view = fake.into_view();

        let list = open_files(&mut view, &table, task, &WalkBudget::iterations(64)).unwrap();
        assert_eq!(list.status, WalkStatus::Complete);
        assert_eq!(list.max_fds, 8);
        let fds = list.files.iter().map(|f| (f.fd, f.ino)).collect::<Vec<_>>();
        assert_eq!(fds, vec![(0, 7), (1, 7), (3, 1234)]);
        assert_eq!(list.files[2].size, 2048);
    }

    #[test]
    fn test_open_files_budget() {
        let mut fake = FakeKernel::aarch64();
        let task = fake.add_task(FakeTask::new(1, "cat"));
        fake.link_list(&[task]);
        let inode = fake.add_inode(99, 1);
        fake.add_files(task, 64, &[(0, inode), (10, inode)]);
        let table = fake.offsets.clone();
        let mut view = fake.into_view();

        let list = open_files(&mut view, &table, task, &WalkBudget::iterations(4)).unwrap();
        assert_eq!(list.status, WalkStatus::Exhausted);
        assert_eq!(list.files.len(), 1);
    }

    #[test]
    fn test_shared_inode() {
        let mut fake = FakeKernel::aarch64();
        let init = fake.add_task(FakeTask::new(0, "swapper/0"));
        let a = fake.add_task(FakeTask::new(100, "writer"));
        let b = fake.add_task(FakeTask::new(200, "reader"));
        fake.link_list(&[init, a, b]);
        let log = fake.add_inode(555, 4096);
        let other = fake.add_inode(556, 1);
        fake.add_files(a, 4, &[(3, log)]);
        fake.add_files(b, 8, &[(5, log), (6, other)]);
        let table = fake.offsets.clone();
        let mut view = fake.into_view();

        let mut map = InodeMap::new();
        for (pid, task) in [(100, a), (200, b)].iter() {
            let files = open_files(&mut view, &table, *task, &WalkBudget::iterations(64)).unwrap();
            map.extend(*pid, &files);
        }

        assert_eq!(map.len(), 2);
        let entry = map.get(555).unwrap();
        assert_eq!(entry.fd, 3);
        assert_eq!(
            entry.owners,
            vec![FileOwner { pid: 100, fd: 3 }, FileOwner { pid: 200, fd: 5 }]
        );
        assert_eq!(map.get(556).unwrap().owners.len(), 1);
    }
}
