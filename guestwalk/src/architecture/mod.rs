/*!
Module for handling different architectures in guestwalk.

The set of supported architectures is small and fixed, so it is modeled as a closed enum,
[`ArchitectureIdent`], carrying the per-architecture parameters. Each variant resolves to a
static [`ArchMmuDef`] and all translation goes through the single table driven walker in
[`mmu`].

[`PageTableWalker`] bundles an architecture with its configured translation base and is the
object the OS layer uses to resolve guest virtual addresses.
*/

pub mod arm;
pub mod mmu;
pub mod x86;

pub use mmu::{ArchMmuDef, PageMapping, TranslationFailure, VirtualAddressParts};

use crate::error::{Error, ErrorKind, ErrorOrigin, Result};
use crate::mem::PhysicalMemory;
use crate::types::{PhysicalAddress, VirtualAddress};

use std::fmt;
use std::str::FromStr;

/// Identifies a supported architecture and its paging mode.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub enum ArchitectureIdent {
    /// AArch64 with a 4 KiB granule and either 39 or 48 bit virtual addresses.
    AArch64 { va_bits: u8 },
    /// x86-64 with four level paging or five level paging (LA57).
    X86_64 { la57: bool },
}

impl ArchitectureIdent {
    /// Constructs an AArch64 identifier, only 39 and 48 bit address spaces are supported.
    pub fn aarch64(va_bits: u8) -> Result<Self> {
        match va_bits {
            39 | 48 => Ok(ArchitectureIdent::AArch64 { va_bits }),
            _ => Err(Error(ErrorOrigin::Other, ErrorKind::InvalidArchitecture)
                .log_error(format!("unsupported aarch64 va_bits: {}", va_bits))),
        }
    }

    /// Returns the static MMU definition for this architecture.
    pub fn mmu(&self) -> &'static ArchMmuDef {
        match self {
            ArchitectureIdent::AArch64 { va_bits: 39 } => &arm::aarch64::MMU_39,
            ArchitectureIdent::AArch64 { .. } => &arm::aarch64::MMU_48,
            ArchitectureIdent::X86_64 { la57: false } => &x86::x64::MMU_4LEVEL,
            ArchitectureIdent::X86_64 { la57: true } => &x86::x64::MMU_5LEVEL,
        }
    }

    /// Returns true if the architecture selects between two roots by address half.
    pub fn has_split_roots(&self) -> bool {
        matches!(self, ArchitectureIdent::AArch64 { .. })
    }

    pub fn is_kernel_address(&self, va: VirtualAddress) -> bool {
        self.mmu().is_kernel_address(va)
    }

    pub fn is_user_address(&self, va: VirtualAddress) -> bool {
        self.mmu().is_user_address(va)
    }

    /// Translates `va` through the tables rooted at `root`.
    pub fn translate<T: PhysicalMemory + ?Sized>(
        &self,
        mem: &mut T,
        root: PhysicalAddress,
        va: VirtualAddress,
    ) -> std::result::Result<PhysicalAddress, TranslationFailure> {
        self.mmu().translate(mem, root, va)
    }
}

impl fmt::Display for ArchitectureIdent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ArchitectureIdent::AArch64 { va_bits } => write!(f, "aarch64 ({} bit va)", va_bits),
            ArchitectureIdent::X86_64 { la57: false } => f.write_str("x86_64"),
            ArchitectureIdent::X86_64 { la57: true } => f.write_str("x86_64 (la57)"),
        }
    }
}

impl FromStr for ArchitectureIdent {
    type Err = Error;

    /// Accepts `aarch64`, `arm64`, `aarch64-39`, `x86_64`, `x64` and `x86_64-la57`.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "aarch64" | "arm64" | "aarch64-48" => Ok(ArchitectureIdent::AArch64 { va_bits: 48 }),
            "aarch64-39" | "arm64-39" => Ok(ArchitectureIdent::AArch64 { va_bits: 39 }),
            "x86_64" | "x64" | "amd64" => Ok(ArchitectureIdent::X86_64 { la57: false }),
            "x86_64-la57" | "x64-la57" => Ok(ArchitectureIdent::X86_64 { la57: true }),
            _ => Err(Error(ErrorOrigin::Args, ErrorKind::InvalidArchitecture)
                .log_error(format!("unknown architecture: {}", s))),
        }
    }
}

/// Root table(s) a walk starts from.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub enum TranslationBase {
    /// One root for the whole address space (x86-64 CR3).
    Single(PhysicalAddress),
    /// Separate roots for the lower and upper half (AArch64 TTBR0 and TTBR1).
    Split {
        low: PhysicalAddress,
        high: PhysicalAddress,
    },
}

impl TranslationBase {
    /// Selects the root responsible for the given address.
    pub fn root_for(&self, va: VirtualAddress) -> PhysicalAddress {
        match *self {
            TranslationBase::Single(root) => root,
            TranslationBase::Split { low, high } => {
                if va.is_kernel() {
                    high
                } else {
                    low
                }
            }
        }
    }
}

/// Translates guest virtual addresses of one address space.
///
/// The walker only holds its configuration. Reads go to whatever `PhysicalMemory` is
/// passed in, so a cache, if any, lives in the memory object.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PageTableWalker {
    arch: ArchitectureIdent,
    base: TranslationBase,
}

impl PageTableWalker {
    pub fn new(arch: ArchitectureIdent, base: TranslationBase) -> Self {
        Self { arch, base }
    }

    pub fn arch(&self) -> ArchitectureIdent {
        self.arch
    }

    pub fn base(&self) -> TranslationBase {
        self.base
    }

    pub fn walk<T: PhysicalMemory + ?Sized>(
        &self,
        mem: &mut T,
        va: VirtualAddress,
    ) -> std::result::Result<PageMapping, TranslationFailure> {
        self.arch.mmu().walk(mem, self.base.root_for(va), va)
    }

    pub fn translate<T: PhysicalMemory + ?Sized>(
        &self,
        mem: &mut T,
        va: VirtualAddress,
    ) -> std::result::Result<PhysicalAddress, TranslationFailure> {
        self.walk(mem, va).map(|m| m.address)
    }

    /// Bulk variant of `translate` over `page_count` consecutive pages.
    pub fn translate_range<T: PhysicalMemory + ?Sized>(
        &self,
        mem: &mut T,
        start: VirtualAddress,
        page_count: usize,
    ) -> Vec<std::result::Result<PhysicalAddress, TranslationFailure>> {
        self.arch
            .mmu()
            .translate_range(mem, self.base.root_for(start), start, page_count)
    }
}
