/*!
This crate contains the foundation of guestwalk's virtual machine introspection.

It contains abstractions over [guest addresses](types/index.html),
[the paging architectures of the guest](architecture/index.html),
[abstractions for reading guest memory](mem/index.html) and
[connectors providing that memory](connector/index.html).

The operating system specific parts live in separate crates built on top of this one.
*/

#[macro_use]
extern crate bitflags;

pub mod error;

#[macro_use]
pub mod types;

pub mod architecture;

pub mod mem;

pub mod connector;

pub mod prelude {
    pub mod v1 {
        pub use crate::architecture::{
            ArchMmuDef, ArchitectureIdent, PageMapping, PageTableWalker, TranslationBase,
            TranslationFailure,
        };
        pub use crate::connector::{ConnectorArgs, CpuState, TranslationRegisters};
        pub use crate::error::{Error, ErrorKind, ErrorOrigin, Result};
        pub use crate::mem::{CachedPhysicalMemory, PhysicalMemory, VirtualView};
        pub use crate::types::{size, PageFlags, PhysicalAddress, VirtualAddress};
    }
    pub use v1::*;
}
