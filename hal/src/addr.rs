//! # Bus Addresses
//!
//! Addresses as seen by the DMA controller. On the BCM2835 these differ from
//! both CPU physical and virtual addresses, so they get their own type.

use core::fmt;
use core::ops::{Add, Sub};

/// Address on the peripheral/DMA bus
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct BusAddr(u32);

impl BusAddr {
    /// Create a new bus address
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// The null bus address (terminates a control-block chain)
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Get the raw u32 value
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check alignment
    #[inline]
    pub const fn is_aligned(self, alignment: u32) -> bool {
        self.0 & (alignment - 1) == 0
    }

    /// Address of the `index`-th 32-bit word starting here
    #[inline]
    pub const fn word(self, index: usize) -> Self {
        Self(self.0.wrapping_add(index as u32 * 4))
    }
}

impl Add<u32> for BusAddr {
    type Output = Self;

    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Sub<BusAddr> for BusAddr {
    type Output = u32;

    fn sub(self, rhs: BusAddr) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}

impl From<BusAddr> for u32 {
    fn from(addr: BusAddr) -> Self {
        addr.0
    }
}

impl fmt::Debug for BusAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BusAddr(0x{:08x})", self.0)
    }
}

impl fmt::Display for BusAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_offsets() {
        let base = BusAddr::new(0xC000_0100);
        assert_eq!(base.word(0), base);
        assert_eq!(base.word(5).raw(), 0xC000_0114);
        assert_eq!(base.word(5) - base, 20);
    }

    #[test]
    fn test_alignment_and_null() {
        assert!(BusAddr::null().is_null());
        assert!(BusAddr::new(0x7E00_7000).is_aligned(32));
        assert!(!BusAddr::new(0x7E00_7004).is_aligned(32));
    }
}
