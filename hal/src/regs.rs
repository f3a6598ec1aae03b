//! # DMA Channel Registers
//!
//! Register map of one BCM2835 DMA channel and the [`DmaChannel`] trait the
//! engine drives it through. Real hardware uses [`MmioChannel`]; host tests
//! use the simulator in [`crate::sim`].

use core::fmt;
use core::ptr::NonNull;

use crate::addr::BusAddr;

// =============================================================================
// REGISTER MAP
// =============================================================================

/// Registers of one DMA channel (byte offsets from the channel base)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DmaReg {
    /// Control and status
    Cs        = 0x00,
    /// Control block address
    ConblkAd  = 0x04,
    /// Transfer information of the loaded block
    Ti        = 0x08,
    /// Source address of the loaded block
    SourceAd  = 0x0c,
    /// Destination address of the loaded block
    DestAd    = 0x10,
    /// Remaining transfer length
    TxfrLen   = 0x14,
    /// 2D stride
    Stride    = 0x18,
    /// Next control block of the loaded block
    NextConbk = 0x1c,
    /// Debug
    Debug     = 0x20,
}

impl DmaReg {
    /// All registers, in address order
    pub const ALL: [DmaReg; 9] = [
        Self::Cs,
        Self::ConblkAd,
        Self::Ti,
        Self::SourceAd,
        Self::DestAd,
        Self::TxfrLen,
        Self::Stride,
        Self::NextConbk,
        Self::Debug,
    ];

    /// Byte offset from the channel base
    #[inline]
    pub const fn offset(self) -> u32 {
        self as u32
    }

    /// Register at a byte offset, if any
    pub fn from_offset(offset: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|reg| reg.offset() == offset)
    }

    /// Short name for dumps
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cs => "CS",
            Self::ConblkAd => "CONBLK_AD",
            Self::Ti => "TI",
            Self::SourceAd => "SOURCE_AD",
            Self::DestAd => "DEST_AD",
            Self::TxfrLen => "TXFR_LEN",
            Self::Stride => "STRIDE",
            Self::NextConbk => "NEXTCONBK",
            Self::Debug => "DEBUG",
        }
    }
}

/// Spacing between channel register windows
pub const CHANNEL_STRIDE: u32 = 0x100;

bitflags::bitflags! {
    /// DMA channel control and status register
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DmaCs: u32 {
        /// Channel is running (write 1 to start)
        const ACTIVE = 1 << 0;
        /// Chain finished (write 1 to clear)
        const END = 1 << 1;
        /// Interrupt pending (write 1 to clear)
        const INT = 1 << 2;
        /// DREQ line state
        const DREQ = 1 << 3;
        /// Channel is paused
        const PAUSED = 1 << 4;
        /// Paused by DREQ
        const DREQ_STOPS_DMA = 1 << 5;
        /// Waiting for outstanding writes
        const WAITING_FOR_OUTSTANDING_WRITES = 1 << 6;
        /// Error flag
        const ERROR = 1 << 8;
        /// Wait for outstanding writes before finishing a block
        const WAIT_FOR_OUTSTANDING_WRITES = 1 << 28;
        /// Do not pause when the debug pause signal is asserted
        const DISDEBUG = 1 << 29;
        /// Abort the current block
        const ABORT = 1 << 30;
        /// Reset the channel
        const RESET = 1 << 31;
    }
}

// =============================================================================
// CHANNEL TRAIT
// =============================================================================

/// One DMA channel as seen by the engine
pub trait DmaChannel: Send + Sync {
    /// Read a channel register
    fn read(&self, reg: DmaReg) -> u32;

    /// Write a channel register
    fn write(&self, reg: DmaReg, value: u32);

    /// Bus address of the channel's register window
    fn bus_base(&self) -> BusAddr;

    /// Name for logs and dumps
    fn name(&self) -> &str {
        "dma"
    }

    /// Control and status flags
    fn status(&self) -> DmaCs {
        DmaCs::from_bits_retain(self.read(DmaReg::Cs))
    }

    /// Whether the channel is currently executing a chain
    fn is_active(&self) -> bool {
        self.status().contains(DmaCs::ACTIVE)
    }

    /// Bus address of one of this channel's registers
    fn register_bus(&self, reg: DmaReg) -> BusAddr {
        self.bus_base() + reg.offset()
    }

    /// Point the channel at `head` and start it
    fn start(&self, head: BusAddr) {
        self.write(DmaReg::ConblkAd, head.raw());
        fence::dma_write_barrier();
        self.write(DmaReg::Cs, DmaCs::ACTIVE.bits());
    }

    /// Reset the channel and clear its control block address
    fn reset(&self) {
        self.write(DmaReg::Cs, DmaCs::RESET.bits());
        fence::dma_write_barrier();
        self.write(DmaReg::ConblkAd, 0);
    }

    /// Log every register at debug level
    fn dump(&self) {
        for reg in DmaReg::ALL {
            log::debug!("{}: {:<10} = 0x{:08x}", self.name(), reg.name(), self.read(reg));
        }
    }
}

// =============================================================================
// MMIO CHANNEL
// =============================================================================

/// Memory-mapped DMA channel
pub struct MmioChannel {
    base: NonNull<u32>,
    bus_base: BusAddr,
    name: &'static str,
}

// SAFETY: register accesses are single volatile word operations
unsafe impl Send for MmioChannel {}
// SAFETY: see above
unsafe impl Sync for MmioChannel {}

impl MmioChannel {
    /// Wrap a mapped channel register window.
    ///
    /// # Safety
    ///
    /// `base` must map the channel's registers for the lifetime of the value,
    /// and `bus_base` must be the same window's bus address.
    pub unsafe fn new(base: NonNull<u32>, bus_base: BusAddr, name: &'static str) -> Self {
        Self {
            base,
            bus_base,
            name,
        }
    }

    #[inline]
    fn reg_ptr(&self, reg: DmaReg) -> *mut u32 {
        // Offsets are word multiples inside the 0x100 window
        self.base.as_ptr().wrapping_add((reg.offset() / 4) as usize)
    }
}

impl DmaChannel for MmioChannel {
    #[inline]
    fn read(&self, reg: DmaReg) -> u32 {
        // SAFETY: guaranteed mapped by `MmioChannel::new`
        let value = unsafe { core::ptr::read_volatile(self.reg_ptr(reg)) };
        fence::dma_read_barrier();
        value
    }

    #[inline]
    fn write(&self, reg: DmaReg, value: u32) {
        fence::dma_write_barrier();
        // SAFETY: guaranteed mapped by `MmioChannel::new`
        unsafe { core::ptr::write_volatile(self.reg_ptr(reg), value) }
    }

    fn bus_base(&self) -> BusAddr {
        self.bus_base
    }

    fn name(&self) -> &str {
        self.name
    }
}

impl fmt::Debug for MmioChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmioChannel")
            .field("name", &self.name)
            .field("bus_base", &self.bus_base)
            .finish()
    }
}

// =============================================================================
// BARRIERS
// =============================================================================

/// Memory barriers between CPU writes and DMA-visible memory / registers
pub mod fence {
    /// Make prior writes to control blocks visible before the next write
    /// (link word update, register kick)
    #[inline(always)]
    pub fn dma_write_barrier() {
        #[cfg(target_arch = "aarch64")]
        {
            // SAFETY: This is a memory barrier instruction
            unsafe {
                core::arch::asm!("dsb st", options(nostack, preserves_flags));
            }
        }

        #[cfg(not(target_arch = "aarch64"))]
        {
            core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        }
    }

    /// Order a register read before later memory reads
    #[inline(always)]
    pub fn dma_read_barrier() {
        #[cfg(target_arch = "aarch64")]
        {
            // SAFETY: This is a memory barrier instruction
            unsafe {
                core::arch::asm!("dmb ld", options(nostack, preserves_flags));
            }
        }

        #[cfg(not(target_arch = "aarch64"))]
        {
            core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_offsets() {
        assert_eq!(DmaReg::ConblkAd.offset(), 0x04);
        assert_eq!(DmaReg::NextConbk.offset(), 0x1c);
        assert_eq!(DmaReg::from_offset(0x14), Some(DmaReg::TxfrLen));
        assert_eq!(DmaReg::from_offset(0x24), None);
    }

    #[test]
    fn test_cs_write_one_to_clear_bits() {
        let cs = DmaCs::ACTIVE | DmaCs::INT;
        assert_eq!(cs.bits(), 0b101);
        assert!(DmaCs::from_bits_retain(0x8000_0000).contains(DmaCs::RESET));
    }
}
