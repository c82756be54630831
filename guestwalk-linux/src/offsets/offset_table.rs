//! Plain offset table definitions.
//!
//! This file is also compiled by the build script to validate the TOML files
//! in the `offsets/` folder, so it may only depend on `serde`.

use serde::{Deserialize, Serialize};

/// Contents of a single TOML offset file, one or more `[[offsets]]` tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinuxOffsetFile {
    #[serde(default)]
    pub offsets: Vec<LinuxOffsetTable>,
}

/// Byte offsets of the kernel structures walked for one kernel build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinuxOffsetTable {
    pub name: String,
    pub arch: LinuxOffsetsArchitecture,
    pub task: TaskOffsets,
    pub mm: MmOffsets,
    #[serde(default)]
    pub vma: Option<VmaOffsets>,
    #[serde(default)]
    pub files: Option<FileOffsets>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinuxOffsetsArchitecture {
    AArch64,
    X86_64,
}

impl std::fmt::Display for LinuxOffsetsArchitecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinuxOffsetsArchitecture::AArch64 => f.write_str("aarch64"),
            LinuxOffsetsArchitecture::X86_64 => f.write_str("x86_64"),
        }
    }
}

/// `struct task_struct`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOffsets {
    pub pid: u64,
    pub comm: u64,
    /// `tasks.next`
    pub tasks_next: u64,
    /// `tasks.prev`
    pub tasks_prev: u64,
    pub mm: u64,
    pub real_parent: u64,
    #[serde(default)]
    pub files: Option<u64>,
}

/// `struct mm_struct`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmOffsets {
    pub pgd: u64,
    #[serde(default)]
    pub layout: Option<MmLayoutOffsets>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmLayoutOffsets {
    pub start_code: u64,
    pub end_code: u64,
    pub start_data: u64,
    pub end_data: u64,
}

/// How the memory descriptor stores its areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VmaCollection {
    /// 6.1 and newer, `mm->mm_mt.ma_root`
    MapleTree { mm_mt_root: u64 },
    /// before 6.1, `mm->mmap` and `vma->vm_next`
    LinkedList { mm_mmap: u64, vm_next: u64 },
}

/// `struct vm_area_struct`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmaOffsets {
    pub collection: VmaCollection,
    pub vm_start: u64,
    pub vm_end: u64,
    pub vm_flags: u64,
    pub vm_file: u64,
}

/// `files_struct`, `fdtable`, `file` and `inode`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOffsets {
    pub files_fdt: u64,
    pub fdt_max_fds: u64,
    pub fdt_fd: u64,
    pub file_inode: u64,
    pub inode_ino: u64,
    pub inode_size: u64,
}
