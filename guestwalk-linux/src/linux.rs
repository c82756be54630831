pub mod discovery;
pub mod files;
pub mod kernel;
pub mod kernel_builder;
pub mod process;
pub mod vma;

pub use discovery::{
    process_tree, Completeness, DiscoveryOptions, DiscoveryResult, ProcessDetails, ProcessNode,
    ProcessTree,
};
pub use files::{open_files, FileDescriptor, FileList, FileOwner, InodeMap, OpenFileEntry};
pub use kernel::LinuxKernel;
pub use kernel_builder::LinuxKernelBuilder;
pub use process::{enrich, MemoryLayout, ProcessIter, ProcessList, ProcessRecord};
pub use vma::{memory_regions, MemoryRegion, RegionList, VmFlags};
