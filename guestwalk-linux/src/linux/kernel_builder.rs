use super::LinuxKernel;
use crate::kernel::{find_anchor, AnchorHint, KernelRootScanner, WalkBudgets};
use crate::offsets::LinuxOffsets;

use guestwalk::architecture::ArchitectureIdent;
use guestwalk::connector::CpuState;
use guestwalk::error::{Error, ErrorKind, ErrorOrigin, Result};
use guestwalk::mem::{CachedPhysicalMemory, PhysicalMemory, VirtualView};
use guestwalk::types::PhysicalAddress;

use log::{debug, warn};

/// Builder for a Linux kernel object.
///
/// This encapsulates the entire setup process for a Linux target
/// and makes sure the user gets a properly initialized object at the end:
/// - Locating the kernel's top level page table, from a ground truth source, an explicit
///   value or a scan of physical memory.
/// - Optionally wrapping the connector into a page cache.
/// - Finding `init_task` and the offset table it validates with.
///
/// # Examples
///
/// Using the builder with default values:
/// ```
/// use guestwalk::mem::PhysicalMemory;
/// use guestwalk_linux::linux::LinuxKernel;
///
/// fn test<T: PhysicalMemory>(connector: T) {
///     let _kernel = LinuxKernel::builder(connector)
///         .build()
///         .unwrap();
/// }
/// ```
///
/// Using the builder with a ground truth source and the default page cache:
/// ```
/// use guestwalk::connector::CpuState;
/// use guestwalk::mem::PhysicalMemory;
/// use guestwalk_linux::linux::LinuxKernel;
///
/// fn test<T: PhysicalMemory, C: CpuState>(connector: T, registers: C) {
///     let _kernel = LinuxKernel::builder(connector)
///         .cpu_state(registers, 0)
///         .build_default_caches()
///         .build()
///         .unwrap();
/// }
/// ```
///
/// # Remarks
///
/// Manual initialization of the above looks like the following:
/// ```
/// use guestwalk::prelude::v1::*;
/// use guestwalk_linux::prelude::*;
///
/// fn test<T: PhysicalMemory>(mut connector: T) {
///     let root = KernelRootScanner::new(&mut connector).find().unwrap();
///     let offsets = LinuxOffsets::new().unwrap();
///     let tables = offsets.candidates(root.arch).unwrap();
///
///     let mut virt_mem = VirtualView::new(connector, root.walker());
///     let budgets = WalkBudgets::default();
///     let anchor = find_anchor(&mut virt_mem, &tables, &[], &budgets.tasks).unwrap();
///
///     let _kernel = LinuxKernel::new(virt_mem.into_inner(), root, anchor, budgets);
/// }
/// ```
pub struct LinuxKernelBuilder<'a, T, TK> {
    connector: T,

    arch: Option<ArchitectureIdent>,
    cpu_state: Option<(Box<dyn CpuState + 'a>, usize)>,
    kernel_root: Option<PhysicalAddress>,
    scan: bool,
    scan_range: Option<(PhysicalAddress, PhysicalAddress)>,
    hints: Vec<AnchorHint>,
    offsets: Option<LinuxOffsets>,
    budgets: WalkBudgets,

    build_page_cache: Box<dyn FnOnce(T, ArchitectureIdent) -> Result<TK>>,
}

impl<'a, T> LinuxKernelBuilder<'a, T, T>
where
    T: PhysicalMemory,
{
    pub fn new(connector: T) -> LinuxKernelBuilder<'a, T, T> {
        LinuxKernelBuilder {
            connector,

            arch: None,
            cpu_state: None,
            kernel_root: None,
            scan: true,
            scan_range: None,
            hints: Vec::new(),
            offsets: None,
            budgets: WalkBudgets::default(),

            build_page_cache: Box::new(|connector, _| Ok(connector)),
        }
    }
}

impl<'a, T, TK> LinuxKernelBuilder<'a, T, TK>
where
    T: PhysicalMemory,
    TK: PhysicalMemory,
{
    pub fn build(mut self) -> Result<LinuxKernel<TK>> {
        // find the kernel root
        let mut scanner = KernelRootScanner::new(&mut self.connector).scan(self.scan);
        if let Some(arch) = self.arch {
            scanner = scanner.arch(arch);
        }
        if let Some((cpu_state, cpu_index)) = self.cpu_state.as_mut() {
            scanner = scanner.cpu_state(&mut **cpu_state, *cpu_index);
        }
        if let Some(root) = self.kernel_root {
            scanner = scanner.root(root);
        }
        if let Some((start, end)) = self.scan_range {
            scanner = scanner.scan_range(start, end);
        }
        let kernel_root = scanner.find()?;

        // the task currently running is always on the task list
        let mut hints = self.hints.clone();
        if let Some((cpu_state, cpu_index)) = self.cpu_state.as_mut() {
            match cpu_state.current_task(*cpu_index) {
                Ok(Some(task)) => {
                    debug!("current task of cpu {} is {}", cpu_index, task);
                    hints.push(AnchorHint::Task(task));
                }
                Ok(None) => (),
                Err(err) => warn!("unable to query the current task: {}", err),
            }
        }

        let offsets = match self.offsets.take() {
            Some(offsets) => offsets,
            None => LinuxOffsets::new()?,
        };
        let tables = offsets.candidates(kernel_root.arch)?;
        if tables.is_empty() {
            return Err(Error(ErrorOrigin::Offsets, ErrorKind::NotFound)
                .log_error(format!("no offset tables for {}", kernel_root.arch)));
        }

        // create caches
        let kernel_connector = (self.build_page_cache)(self.connector, kernel_root.arch)?;
        let mut virt_mem = VirtualView::new(kernel_connector, kernel_root.walker());

        let anchor = find_anchor(&mut virt_mem, &tables, &hints, &self.budgets.tasks)?;

        Ok(LinuxKernel::with_view(
            virt_mem,
            kernel_root,
            anchor,
            self.budgets,
        ))
    }

    /// Skips architecture detection.
    pub fn arch(mut self, arch: ArchitectureIdent) -> Self {
        self.arch = Some(arch);
        self
    }

    /// Uses the registers of the given cpu as ground truth for the kernel root.
    ///
    /// If the source also reports the task running on the cpu it is used to find `init_task`.
    pub fn cpu_state<C: CpuState + 'a>(mut self, cpu_state: C, cpu_index: usize) -> Self {
        self.cpu_state = Some((Box::new(cpu_state), cpu_index));
        self
    }

    /// Uses a known kernel root instead of scanning for one.
    ///
    /// If a [`cpu_state`](Self::cpu_state) source is configured the root is compared against
    /// its register state, a mismatch is only warned about.
    pub fn kernel_root(mut self, root: PhysicalAddress) -> Self {
        self.kernel_root = Some(root);
        self
    }

    /// Disables the signature scan of physical memory.
    pub fn no_scan(mut self) -> Self {
        self.scan = false;
        self
    }

    pub fn scan_range(mut self, start: PhysicalAddress, end: PhysicalAddress) -> Self {
        self.scan_range = Some((start, end));
        self
    }

    /// Adds a location to try before the built-in `init_task` probes.
    pub fn anchor_hint(mut self, hint: AnchorHint) -> Self {
        self.hints.push(hint);
        self
    }

    /// Replaces the embedded offset tables.
    ///
    /// # Examples
    ///
    /// ```
    /// use guestwalk::mem::PhysicalMemory;
    /// use guestwalk_linux::linux::LinuxKernel;
    /// use guestwalk_linux::offsets::LinuxOffsets;
    ///
    /// fn test<T: PhysicalMemory>(connector: T) {
    ///     let offsets = LinuxOffsets::new()
    ///         .unwrap()
    ///         .select("linux-5.15-arm64-a");
    ///     let _kernel = LinuxKernel::builder(connector)
    ///         .offsets(offsets)
    ///         .build()
    ///         .unwrap();
    /// }
    /// ```
    pub fn offsets(mut self, offsets: LinuxOffsets) -> Self {
        self.offsets = Some(offsets);
        self
    }

    pub fn budgets(mut self, budgets: WalkBudgets) -> Self {
        self.budgets = budgets;
        self
    }

    /// Creates the kernel with a page cache using default settings.
    pub fn build_default_caches(self) -> LinuxKernelBuilder<'a, T, CachedPhysicalMemory<T>> {
        self.build_page_cache(|connector, _| CachedPhysicalMemory::builder(connector).build())
    }

    /// Creates the kernel by constructing the page cache from the given closure.
    ///
    /// The closure is evaluated after the kernel root has been found.
    ///
    /// # Examples
    ///
    /// ```
    /// use guestwalk::mem::{PhysicalMemory, CachedPhysicalMemory};
    /// use guestwalk::types::size;
    /// use guestwalk_linux::linux::LinuxKernel;
    ///
    /// fn test<T: PhysicalMemory>(connector: T) {
    ///     let _kernel = LinuxKernel::builder(connector)
    ///         .build_page_cache(|connector, _arch| {
    ///             CachedPhysicalMemory::builder(connector)
    ///                 .cache_size(size::mb(4))
    ///                 .build()
    ///         })
    ///         .build()
    ///         .unwrap();
    /// }
    /// ```
    pub fn build_page_cache<TKN, F>(self, func: F) -> LinuxKernelBuilder<'a, T, TKN>
    where
        TKN: PhysicalMemory,
        F: FnOnce(T, ArchitectureIdent) -> Result<TKN> + 'static,
    {
        LinuxKernelBuilder {
            connector: self.connector,

            arch: self.arch,
            cpu_state: self.cpu_state,
            kernel_root: self.kernel_root,
            scan: self.scan,
            scan_range: self.scan_range,
            hints: self.hints,
            offsets: self.offsets,
            budgets: self.budgets,

            build_page_cache: Box::new(func),
        }
    }
}
