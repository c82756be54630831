/*!
Module with basic types used in guestwalk.

Physical and virtual addresses are distinct types. There is no conversion
between them other than an explicit translation through a page table walker.
*/

#[macro_use]
mod address;

pub mod size;

pub mod physical_address;
#[doc(hidden)]
pub use physical_address::PhysicalAddress;

pub mod virtual_address;
#[doc(hidden)]
pub use virtual_address::VirtualAddress;

pub mod page;
#[doc(hidden)]
pub use page::PageFlags;
