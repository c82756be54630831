/*!
Functionality shared by the physical and virtual address types.

Both types wrap a plain `u64` but never convert into each other.
Arithmetic with byte counts saturates at the ends of the 64 bit range
so an overflowing computation can not silently wrap around into a
different region of the address space.
*/

macro_rules! impl_address {
    ($name:ident) => {
        impl $name {
            /// An address with the value of zero.
            pub const NULL: $name = $name(0);

            /// An address with an invalid value.
            pub const INVALID: $name = $name(!0);

            #[inline]
            pub const fn from_u64(value: u64) -> Self {
                $name(value)
            }

            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Checks wether the address is zero or not.
            #[inline]
            pub const fn is_null(self) -> bool {
                self.0 == 0
            }

            /// Converts the address to an Option that is None when it is null.
            #[inline]
            pub fn non_null(self) -> Option<Self> {
                if self.is_null() {
                    None
                } else {
                    Some(self)
                }
            }

            /// Checks wether the address is valid or not.
            #[inline]
            pub const fn is_valid(self) -> bool {
                self.0 != !0
            }

            /// Aligns the address down to the given page size.
            #[inline]
            pub const fn as_page_aligned(self, page_size: u64) -> Self {
                $name(self.0 - self.page_offset_for(page_size))
            }

            /// Returns the offset of the address inside a page of the given size.
            ///
            /// A page size of zero has no offsets, the result is zero.
            #[inline]
            pub const fn page_offset_for(self, page_size: u64) -> u64 {
                match self.0.checked_rem(page_size) {
                    Some(offset) => offset,
                    None => 0,
                }
            }

            /// Returns true if the bit at the given index is set.
            #[inline]
            pub const fn bit_at(self, idx: u8) -> bool {
                (self.0 & (1u64 << idx)) != 0
            }

            /// Extracts the bits in the inclusive range `lo..=hi`, shifted down to bit zero.
            ///
            /// An empty range (`hi < lo`) or one starting past bit 63 yields zero.
            #[inline]
            pub const fn extract_bits(self, lo: u8, hi: u8) -> u64 {
                if hi < lo || lo > 63 {
                    return 0;
                }
                let width = (hi - lo) as u32 + 1;
                let mask = if width >= 64 { !0u64 } else { (1u64 << width) - 1 };
                (self.0 >> lo) & mask
            }

            #[inline]
            pub const fn checked_add(self, rhs: u64) -> Option<Self> {
                match self.0.checked_add(rhs) {
                    Some(v) => Some($name(v)),
                    None => None,
                }
            }

            #[inline]
            pub const fn checked_sub(self, rhs: u64) -> Option<Self> {
                match self.0.checked_sub(rhs) {
                    Some(v) => Some($name(v)),
                    None => None,
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::NULL
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(value: u64) -> Self {
                $name(value)
            }
        }

        impl ::std::ops::Add<u64> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: u64) -> Self {
                $name(self.0.saturating_add(rhs))
            }
        }

        impl ::std::ops::AddAssign<u64> for $name {
            #[inline]
            fn add_assign(&mut self, rhs: u64) {
                self.0 = self.0.saturating_add(rhs)
            }
        }

        impl ::std::ops::Sub<u64> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: u64) -> Self {
                $name(self.0.saturating_sub(rhs))
            }
        }

        impl ::std::ops::SubAssign<u64> for $name {
            #[inline]
            fn sub_assign(&mut self, rhs: u64) {
                self.0 = self.0.saturating_sub(rhs)
            }
        }

        /// Distance in bytes between two addresses of the same space.
        impl ::std::ops::Sub<$name> for $name {
            type Output = u64;

            #[inline]
            fn sub(self, rhs: $name) -> u64 {
                self.0.saturating_sub(rhs.0)
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{:x}", self.0)
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "0x{:016x}", self.0)
            }
        }

        impl ::std::fmt::LowerHex for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                ::std::fmt::LowerHex::fmt(&self.0, f)
            }
        }

        impl ::std::fmt::UpperHex for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                ::std::fmt::UpperHex::fmt(&self.0, f)
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = $crate::error::Error;

            /// Parses hex text with or without a `0x` prefix, `_` separators are ignored.
            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                let s = s.trim();
                let s = s
                    .strip_prefix("0x")
                    .or_else(|| s.strip_prefix("0X"))
                    .unwrap_or(s);
                let digits = s.replace('_', "");
                if digits.is_empty() {
                    return Err($crate::error::Error(
                        $crate::error::ErrorOrigin::Other,
                        $crate::error::ErrorKind::Encoding,
                    ));
                }
                u64::from_str_radix(&digits, 16).map($name).map_err(|_| {
                    $crate::error::Error(
                        $crate::error::ErrorOrigin::Other,
                        $crate::error::ErrorKind::Encoding,
                    )
                })
            }
        }
    };
}
