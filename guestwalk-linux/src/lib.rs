/*!
This crate contains guestwalk's Linux implementation.
It is used to enumerate processes, memory areas and open files of Linux guests.

The bootstrap of a target happens in [`kernel`]: the kernel address space is located, then
`init_task` and a matching offset table. Everything after that lives in [`linux`].
*/

pub mod kernel;

pub mod offsets;

pub mod linux;

#[cfg(test)]
pub(crate) mod fixture;

pub mod prelude {
    pub mod v1 {
        pub use crate::kernel::*;
        pub use crate::linux::*;
        pub use crate::offsets::*;
    }
    pub use v1::*;
}
