/*!
Discovery of the kernel's top level page table.

Two independent sources exist. A [`CpuState`] connected to the hypervisor reports the
translation registers of a virtual cpu directly. Without it, or to cross check it,
physical memory is scanned page by page for something that looks like a top level table
(see [`scan`]). When both are available and disagree the register state wins.
*/

mod aarch64;
mod x64;

pub use aarch64::PHYS_BASE as AARCH64_PHYS_BASE;

use guestwalk::architecture::{ArchitectureIdent, PageTableWalker, TranslationBase};
use guestwalk::connector::{CpuState, TranslationRegisters};
use guestwalk::error::{Error, ErrorKind, ErrorOrigin, Result};
use guestwalk::mem::PhysicalMemory;
use guestwalk::types::{size, PhysicalAddress};

use log::{debug, info, trace, warn};
use serde::Serialize;

/// Minimum score a scanned table needs to be accepted.
pub const MIN_SCAN_SCORE: usize = 4;

/// Upper bound of guest RAM considered when judging block descriptors.
const MAX_GUEST_RAM: u64 = size::gb(1024);

const ENTRIES_PER_TABLE: usize = 512;

/// Where the kernel root came from.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub enum RootSource {
    Explicit,
    GroundTruth,
    Scan,
}

/// The best table found by the signature scan.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub struct ScanCandidate {
    pub root: PhysicalAddress,
    /// number of plausible table and block descriptors
    pub score: usize,
    /// inferred from the longest run of contiguous 1 GiB blocks
    pub ram_size: u64,
}

/// The validated root of the kernel address space.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub struct KernelRoot {
    pub arch: ArchitectureIdent,
    pub root: PhysicalAddress,
    /// TTBR0 of the cpu the registers were queried from
    pub user_root: Option<PhysicalAddress>,
    pub source: RootSource,
    pub registers: Option<TranslationRegisters>,
    pub scan: Option<ScanCandidate>,
}

impl KernelRoot {
    pub fn translation_base(&self) -> TranslationBase {
        if self.arch.has_split_roots() {
            TranslationBase::Split {
                low: self.user_root.unwrap_or(self.root),
                high: self.root,
            }
        } else {
            TranslationBase::Single(self.root)
        }
    }

    pub fn walker(&self) -> PageTableWalker {
        PageTableWalker::new(self.arch, self.translation_base())
    }

    /// Returns whether two independent sources agree on the root, if two were available.
    ///
    /// An explicit root is compared against the register state, otherwise the register
    /// state is compared against the scan.
    pub fn cross_validated(&self) -> Option<bool> {
        match (self.source, self.registers, self.scan) {
            (RootSource::Explicit, Some(regs), _) => Some(regs.kernel_root() == self.root),
            (_, Some(regs), Some(scan)) => Some(regs.kernel_root() == scan.root),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Descriptor {
    Empty,
    Table(PhysicalAddress),
    Block(PhysicalAddress),
    Implausible,
}

fn classify(
    arch: ArchitectureIdent,
    pte: u64,
    block_size: Option<u64>,
    ram_base: u64,
) -> Descriptor {
    match arch {
        ArchitectureIdent::AArch64 { .. } => {
            aarch64::classify(pte, block_size, ram_base, MAX_GUEST_RAM)
        }
        ArchitectureIdent::X86_64 { .. } => x64::classify(pte, block_size, ram_base, MAX_GUEST_RAM),
    }
}

/// Reads an array of little endian descriptors.
fn read_descriptors<T: PhysicalMemory + ?Sized>(
    mem: &mut T,
    addr: PhysicalAddress,
    out: &mut [u64],
) -> Result<()> {
    <&mut T as PhysicalMemory>::phys_read_into(&mut &mut *mem, addr, out)?;
    out.iter_mut().for_each(|e| *e = u64::from_le(*e));
    Ok(())
}

/// Summary of a single table interpreted at a given level.
#[derive(Debug, Default)]
struct TableSummary {
    tables: Vec<(usize, PhysicalAddress)>,
    blocks: usize,
    longest_run: usize,
}

fn summarize_table(
    arch: ArchitectureIdent,
    page: &[u64],
    level: usize,
    ram_base: u64,
) -> Option<TableSummary> {
    let mmu = arch.mmu();
    let level_size = mmu.page_size_level(level);
    let block_size = if level_size == size::gb(1) && mmu.is_final_level(level) {
        Some(level_size)
    } else {
        None
    };

    let mut summary = TableSummary::default();
    let mut run = 0usize;
    let mut last_block: Option<(usize, PhysicalAddress)> = None;

    for (i, &pte) in page.iter().enumerate() {
        match classify(arch, pte, block_size, ram_base) {
            Descriptor::Empty => {}
            Descriptor::Implausible => return None,
            Descriptor::Table(addr) => summary.tables.push((i, addr)),
            Descriptor::Block(addr) => {
                summary.blocks += 1;
                run = match last_block {
                    Some((prev_i, prev)) if prev_i + 1 == i && prev + level_size == addr => run + 1,
                    _ => 1,
                };
                summary.longest_run = summary.longest_run.max(run);
                last_block = Some((i, addr));
            }
        }
    }

    Some(summary)
}

/// Scores a page as the top level table of `arch`.
///
/// Any implausible descriptor disqualifies the page. Table descriptors only count if the
/// table they point to is plausible itself. Block descriptors count where 1 GiB blocks
/// are permitted, either in the page itself or one level below it.
fn score_root<T: PhysicalMemory + ?Sized>(
    mem: &mut T,
    arch: ArchitectureIdent,
    addr: PhysicalAddress,
    page: &[u64],
    ram_base: u64,
) -> Option<ScanCandidate> {
    let root = summarize_table(arch, page, 0, ram_base)?;
    if root.tables.is_empty() && root.blocks == 0 {
        return None;
    }

    // the kernel half is always populated
    if let ArchitectureIdent::X86_64 { .. } = arch {
        if !root.tables.iter().any(|&(i, _)| i >= ENTRIES_PER_TABLE / 2) {
            return None;
        }
    }

    let mut score = root.blocks;
    let mut longest_run = root.longest_run;
    let mut child = [0u64; ENTRIES_PER_TABLE];

    for &(_, table) in root.tables.iter() {
        if table == addr || read_descriptors(mem, table, &mut child).is_err() {
            continue;
        }
        if let Some(summary) = summarize_table(arch, &child, 1, ram_base) {
            if summary.tables.is_empty() && summary.blocks == 0 {
                continue;
            }
            score += 1 + summary.blocks;
            longest_run = longest_run.max(summary.longest_run);
        }
    }

    Some(ScanCandidate {
        root: addr,
        score,
        ram_size: longest_run as u64 * size::gb(1),
    })
}

/// Scans physical memory in page strides for the most plausible top level table.
///
/// Returns the highest scoring candidate at or above `min_score`, the lowest address wins
/// a tie. Pages that can not be read are skipped.
pub fn scan<T: PhysicalMemory + ?Sized>(
    mem: &mut T,
    arch: ArchitectureIdent,
    start: PhysicalAddress,
    end: PhysicalAddress,
    min_score: usize,
) -> Result<ScanCandidate> {
    let ram_base = mem.metadata().ram_base.as_u64();
    let chunk_size = size::mb(2);
    let mut chunk = vec![0u64; (chunk_size / 8) as usize];
    let mut best: Option<ScanCandidate> = None;

    debug!("scanning {} to {} for a {} root table", start, end, arch);

    let mut chunk_start = start.as_page_aligned(size::PAGE_SIZE);
    while chunk_start < end {
        let len = chunk_size.min(end - chunk_start) as usize;
        let buf = &mut chunk[..len / 8];

        let readable = match read_descriptors(mem, chunk_start, buf) {
            Ok(_) => None,
            // fall back to single pages at the edge of the backing store
            Err(_) => Some(
                buf.chunks_exact_mut(ENTRIES_PER_TABLE)
                    .enumerate()
                    .map(|(i, page)| {
                        read_descriptors(mem, chunk_start + i as u64 * size::PAGE_SIZE, page)
                            .is_ok()
                    })
                    .collect::<Vec<_>>(),
            ),
        };

        for (i, page) in buf.chunks_exact(ENTRIES_PER_TABLE).enumerate() {
            if let Some(readable) = &readable {
                if !readable[i] {
                    continue;
                }
            }
            if page.iter().all(|&e| e == 0) {
                continue;
            }

            let addr = chunk_start + i as u64 * size::PAGE_SIZE;
            if let Some(candidate) = score_root(mem, arch, addr, page, ram_base) {
                trace!(
                    "root candidate at {}: score={} ram_size={:x}",
                    addr,
                    candidate.score,
                    candidate.ram_size
                );
                if candidate.score >= min_score
                    && best.map(|b| candidate.score > b.score).unwrap_or(true)
                {
                    best = Some(candidate);
                }
            }
        }

        chunk_start = chunk_start + len as u64;
    }

    best.ok_or_else(|| {
        Error(ErrorOrigin::OsLayer, ErrorKind::NotFound)
            .log_info(format!("no {} root table scored above {}", arch, min_score))
    })
}

/// Locates the kernel root with the sources configured on it.
///
/// # Examples
///
/// ```
/// use guestwalk::architecture::ArchitectureIdent;
/// use guestwalk::mem::PhysicalMemory;
/// use guestwalk_linux::kernel::KernelRootScanner;
///
/// fn find<T: PhysicalMemory>(mem: &mut T) {
///     let root = KernelRootScanner::new(mem)
///         .arch(ArchitectureIdent::AArch64 { va_bits: 48 })
///         .find()
///         .unwrap();
///     println!("kernel root at {}", root.root);
/// }
/// ```
pub struct KernelRootScanner<'a, T: ?Sized> {
    mem: &'a mut T,
    arch: Option<ArchitectureIdent>,
    cpu_state: Option<&'a mut dyn CpuState>,
    cpu_index: usize,
    explicit: Option<PhysicalAddress>,
    scan: bool,
    range: Option<(PhysicalAddress, PhysicalAddress)>,
    min_score: usize,
}

impl<'a, T: PhysicalMemory + ?Sized> KernelRootScanner<'a, T> {
    pub fn new(mem: &'a mut T) -> Self {
        Self {
            mem,
            arch: None,
            cpu_state: None,
            cpu_index: 0,
            explicit: None,
            scan: true,
            range: None,
            min_score: MIN_SCAN_SCORE,
        }
    }

    pub fn arch(mut self, arch: ArchitectureIdent) -> Self {
        self.arch = Some(arch);
        self
    }

    /// Queries the translation registers of the given cpu.
    pub fn cpu_state(mut self, cpu_state: &'a mut dyn CpuState, cpu_index: usize) -> Self {
        self.cpu_state = Some(cpu_state);
        self.cpu_index = cpu_index;
        self
    }

    /// Uses the given root as is, skipping both sources.
    pub fn root(mut self, root: PhysicalAddress) -> Self {
        self.explicit = Some(root);
        self
    }

    /// Enables or disables the signature scan. It is enabled by default.
    pub fn scan(mut self, scan: bool) -> Self {
        self.scan = scan;
        self
    }

    /// Limits the scan to the given physical range.
    pub fn scan_range(mut self, start: PhysicalAddress, end: PhysicalAddress) -> Self {
        self.range = Some((start, end));
        self
    }

    pub fn min_score(mut self, min_score: usize) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn find(self) -> Result<KernelRoot> {
        let KernelRootScanner {
            mem,
            arch,
            cpu_state,
            cpu_index,
            explicit,
            scan: do_scan,
            range,
            min_score,
        } = self;

        let registers = match cpu_state {
            Some(cpu_state) => match cpu_state.translation_registers(cpu_index) {
                Ok(regs) => Some(regs),
                Err(err) => {
                    warn!("unable to query translation registers: {}", err);
                    None
                }
            },
            None => None,
        };

        let arch = match (arch, registers) {
            (Some(arch), Some(regs)) => {
                if !registers_match(arch, regs) {
                    return Err(Error(ErrorOrigin::OsLayer, ErrorKind::InvalidArchitecture)
                        .log_error(format!("{:?} reported for a {} guest", regs, arch)));
                }
                arch
            }
            (Some(arch), None) => arch,
            (None, Some(TranslationRegisters::AArch64 { .. })) => {
                ArchitectureIdent::AArch64 { va_bits: 48 }
            }
            (None, Some(TranslationRegisters::X86_64 { .. })) => {
                ArchitectureIdent::X86_64 { la57: false }
            }
            (None, None) => {
                if explicit.is_some() {
                    return Err(Error(ErrorOrigin::OsLayer, ErrorKind::InvalidArchitecture)
                        .log_error("an explicit root requires an architecture"));
                }
                return find_any_arch(mem, range, min_score);
            }
        };

        // an explicit root is never scanned for, only compared to the register state
        if let Some(root) = explicit {
            info!("using explicit kernel root {}", root);
            if let Some(regs) = registers {
                if regs.kernel_root() != root {
                    warn!(
                        "explicit kernel root {} disagrees with register state {}, using the former",
                        root,
                        regs.kernel_root()
                    );
                }
            }
            return Ok(KernelRoot {
                arch,
                root,
                user_root: None,
                source: RootSource::Explicit,
                registers,
                scan: None,
            });
        }

        let scanned = if do_scan {
            let (start, end) = range.unwrap_or_else(|| default_range(mem, arch));
            match scan(mem, arch, start, end, min_score) {
                Ok(candidate) => Some(candidate),
                Err(err) => {
                    warn!("root table scan failed: {}", err);
                    None
                }
            }
        } else {
            None
        };

        resolve(arch, registers, scanned)
    }
}

fn registers_match(arch: ArchitectureIdent, regs: TranslationRegisters) -> bool {
    matches!(
        (arch, regs),
        (ArchitectureIdent::AArch64 { .. }, TranslationRegisters::AArch64 { .. })
            | (ArchitectureIdent::X86_64 { .. }, TranslationRegisters::X86_64 { .. })
    )
}

fn default_range<T: PhysicalMemory + ?Sized>(
    mem: &mut T,
    arch: ArchitectureIdent,
) -> (PhysicalAddress, PhysicalAddress) {
    let metadata = mem.metadata();
    let start = match arch {
        ArchitectureIdent::AArch64 { .. } if metadata.ram_base.is_null() => {
            PhysicalAddress::from(AARCH64_PHYS_BASE)
        }
        _ => metadata.ram_base,
    };
    (start, metadata.max_address())
}

fn find_any_arch<T: PhysicalMemory + ?Sized>(
    mem: &mut T,
    range: Option<(PhysicalAddress, PhysicalAddress)>,
    min_score: usize,
) -> Result<KernelRoot> {
    let archs = [
        ArchitectureIdent::AArch64 { va_bits: 48 },
        ArchitectureIdent::X86_64 { la57: false },
        ArchitectureIdent::AArch64 { va_bits: 39 },
        ArchitectureIdent::X86_64 { la57: true },
    ];

    for &arch in archs.iter() {
        let (start, end) = range.unwrap_or_else(|| default_range(mem, arch));
        match scan(mem, arch, start, end, min_score) {
            Ok(candidate) => return resolve(arch, None, Some(candidate)),
            Err(err) => debug!("{}: {}", arch, err),
        }
    }

    Err(Error(ErrorOrigin::OsLayer, ErrorKind::NotFound)
        .log_error("unable to find the kernel root for any architecture"))
}

fn resolve(
    arch: ArchitectureIdent,
    registers: Option<TranslationRegisters>,
    scanned: Option<ScanCandidate>,
) -> Result<KernelRoot> {
    match (registers, scanned) {
        (Some(regs), scan) => {
            let root = regs.kernel_root();
            if let Some(candidate) = scan {
                if candidate.root != root {
                    warn!(
                        "scanned root {} (score {}) disagrees with register state {}, using the latter",
                        candidate.root, candidate.score, root
                    );
                } else {
                    info!("scanned root agrees with register state");
                }
            }
            info!("kernel root {} from register state", root);
            Ok(KernelRoot {
                arch,
                root,
                user_root: match regs {
                    TranslationRegisters::AArch64 { .. } => Some(regs.user_root()),
                    TranslationRegisters::X86_64 { .. } => None,
                },
                source: RootSource::GroundTruth,
                registers: Some(regs),
                scan,
            })
        }
        (None, Some(candidate)) => {
            info!(
                "kernel root {} from scan (score {}, {} GiB RAM)",
                candidate.root,
                candidate.score,
                candidate.ram_size / size::gb(1)
            );
            Ok(KernelRoot {
                arch,
                root: candidate.root,
                user_root: None,
                source: RootSource::Scan,
                registers: None,
                scan: Some(candidate),
            })
        }
        (None, None) => Err(Error(ErrorOrigin::OsLayer, ErrorKind::NotFound)
            .log_error("unable to establish the kernel root")),
    }
}
