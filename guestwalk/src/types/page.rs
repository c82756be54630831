/*!
This module contains data structures related to information about a page.
*/

bitflags! {
    /// Protection and attribute bits of a leaf mapping, decoded from a descriptor.
    #[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
    #[repr(transparent)]
    pub struct PageFlags: u8 {
        /// The page explicitly has no flags.
        const NONE = 0b0000_0000;
        const READABLE = 0b0000_0001;
        const WRITEABLE = 0b0000_0010;
        /// The page can be accessed from user mode.
        const USER = 0b0000_0100;
        const EXECUTABLE = 0b0000_1000;
        /// The hardware (or the kernel) marked the page as accessed.
        const ACCESSED = 0b0001_0000;
    }
}

impl PageFlags {
    pub fn write(mut self, flag: bool) -> Self {
        self.set(PageFlags::WRITEABLE, flag);
        self
    }

    pub fn user(mut self, flag: bool) -> Self {
        self.set(PageFlags::USER, flag);
        self
    }

    pub fn exec(mut self, flag: bool) -> Self {
        self.set(PageFlags::EXECUTABLE, flag);
        self
    }

    pub fn accessed(mut self, flag: bool) -> Self {
        self.set(PageFlags::ACCESSED, flag);
        self
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        PageFlags::READABLE
    }
}
