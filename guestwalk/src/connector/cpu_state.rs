//! Describes the optional ground-truth cpu state of a connector

use crate::architecture::TranslationBase;
use crate::error::Result;
use crate::types::{PhysicalAddress, VirtualAddress};

const TTBR_BADDR_MASK: u64 = 0x0000_ffff_ffff_f000;
const CR3_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Raw translation control registers of a single virtual cpu.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
pub enum TranslationRegisters {
    AArch64 { ttbr0: u64, ttbr1: u64 },
    X86_64 { cr3: u64 },
}

impl TranslationRegisters {
    /// Root of the kernel half of the address space, ASID, CnP and PCID bits masked off.
    pub fn kernel_root(&self) -> PhysicalAddress {
        match *self {
            TranslationRegisters::AArch64 { ttbr1, .. } => {
                PhysicalAddress::from(ttbr1 & TTBR_BADDR_MASK)
            }
            TranslationRegisters::X86_64 { cr3 } => PhysicalAddress::from(cr3 & CR3_ADDR_MASK),
        }
    }

    /// Root of the user half of the currently scheduled task.
    pub fn user_root(&self) -> PhysicalAddress {
        match *self {
            TranslationRegisters::AArch64 { ttbr0, .. } => {
                PhysicalAddress::from(ttbr0 & TTBR_BADDR_MASK)
            }
            TranslationRegisters::X86_64 { cr3 } => PhysicalAddress::from(cr3 & CR3_ADDR_MASK),
        }
    }

    pub fn translation_base(&self) -> TranslationBase {
        match self {
            TranslationRegisters::AArch64 { .. } => TranslationBase::Split {
                low: self.user_root(),
                high: self.kernel_root(),
            },
            TranslationRegisters::X86_64 { .. } => TranslationBase::Single(self.kernel_root()),
        }
    }
}

/// A privileged, out-of-band source for the register state of the guest.
///
/// Implemented by connectors talking to the hypervisor. It is optional, the OS layer
/// falls back to scanning physical memory without it.
pub trait CpuState: Send {
    fn translation_registers(&mut self, cpu_index: usize) -> Result<TranslationRegisters>;

    /// Address of the task currently running on the cpu, if the channel reports it.
    fn current_task(&mut self, _cpu_index: usize) -> Result<Option<VirtualAddress>> {
        Ok(None)
    }
}

impl<T: CpuState + ?Sized, P: std::ops::DerefMut<Target = T> + Send> CpuState for P {
    fn translation_registers(&mut self, cpu_index: usize) -> Result<TranslationRegisters> {
        (**self).translation_registers(cpu_index)
    }

    fn current_task(&mut self, cpu_index: usize) -> Result<Option<VirtualAddress>> {
        (**self).current_task(cpu_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_aarch64() {
        let regs = TranslationRegisters::AArch64 {
            ttbr0: 0x0001_0000_4a3b_5000,
            ttbr1: 0x0000_0000_4171_d001,
        };
        assert_eq!(regs.kernel_root(), PhysicalAddress::from(0x4171_d000));
        assert_eq!(regs.user_root(), PhysicalAddress::from(0x4a3b_5000));
        assert_eq!(
            regs.translation_base(),
            TranslationBase::Split {
                low: PhysicalAddress::from(0x4a3b_5000),
                high: PhysicalAddress::from(0x4171_d000),
            }
        );
    }

    #[test]
    fn test_mask_x64() {
        let regs = TranslationRegisters::X86_64 {
            cr3: 0x8000_0001_0a2c_3005,
        };
        assert_eq!(regs.kernel_root(), PhysicalAddress::from(0x1_0a2c_3000));
    }
}
