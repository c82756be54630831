/*!
Table driven page table walker shared by all supported architectures.
*/

pub mod def;
pub mod walker;

#[cfg(test)]
mod tests;

pub use def::{ArchMmuDef, VirtualAddressParts};
pub use walker::{PageMapping, TranslationFailure, MAX_RANGE_PAGES};
