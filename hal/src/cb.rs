//! # BCM2835 DMA Control Blocks
//!
//! A control block is eight 32-bit words, 32-byte aligned. The controller
//! loads a whole block when it starts it, performs the transfer it describes
//! and then follows `NEXTCONBK` (0 ends the chain).
//!
//! The two trailing words are reserved by the hardware and unused; the engine
//! keeps small constants there (values to copy into registers) so a block can
//! carry its own payload.

use static_assertions::{const_assert, const_assert_eq};

use crate::addr::BusAddr;

/// Size of a control block in bytes
pub const CB_SIZE: u32 = 32;
/// Required alignment of a control block's bus address
pub const CB_ALIGN: u32 = 32;
/// Words per control block
pub const CB_WORDS: usize = 8;

/// Word indices inside a control block
pub mod word {
    /// Transfer information
    pub const TI: usize = 0;
    /// Source bus address
    pub const SOURCE_AD: usize = 1;
    /// Destination bus address
    pub const DEST_AD: usize = 2;
    /// Transfer length in bytes
    pub const TXFR_LEN: usize = 3;
    /// 2D stride
    pub const STRIDE: usize = 4;
    /// Bus address of the next control block
    pub const NEXTCONBK: usize = 5;
    /// First reserved word, free for payload
    pub const PAD0: usize = 6;
    /// Second reserved word, free for payload
    pub const PAD1: usize = 7;
}

/// DREQ peripheral numbers (TI.PERMAP)
pub mod permap {
    /// Always-on request line
    pub const NONE: u32 = 0;
    /// SPI0 transmit FIFO
    pub const SPI_TX: u32 = 6;
    /// SPI0 receive FIFO
    pub const SPI_RX: u32 = 7;
}

bitflags::bitflags! {
    /// Transfer information word (TI)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TransferInfo: u32 {
        /// Raise an interrupt when this block completes
        const INTEN = 1 << 0;
        /// 2D mode
        const TDMODE = 1 << 1;
        /// Wait for the AXI write response
        const WAIT_RESP = 1 << 3;
        /// Increment destination address
        const DEST_INC = 1 << 4;
        /// 128-bit destination writes
        const DEST_WIDTH = 1 << 5;
        /// Pace destination writes by DREQ
        const DEST_DREQ = 1 << 6;
        /// Do not perform destination writes
        const DEST_IGNORE = 1 << 7;
        /// Increment source address
        const SRC_INC = 1 << 8;
        /// 128-bit source reads
        const SRC_WIDTH = 1 << 9;
        /// Pace source reads by DREQ
        const SRC_DREQ = 1 << 10;
        /// Do not perform source reads (write zeros)
        const SRC_IGNORE = 1 << 11;
        /// Disable wide bursts
        const NO_WIDE_BURSTS = 1 << 26;
    }
}

impl TransferInfo {
    /// PERMAP field
    pub const fn permap(peripheral: u32) -> u32 {
        (peripheral & 0x1f) << 16
    }

    /// WAITS field (dummy cycles after each write)
    pub const fn waits(cycles: u32) -> u32 {
        (cycles & 0x1f) << 21
    }

    /// BURST_LENGTH field
    pub const fn burst_length(words: u32) -> u32 {
        (words & 0xf) << 12
    }

    /// Extract PERMAP from a raw TI word
    pub const fn peripheral(raw: u32) -> u32 {
        (raw >> 16) & 0x1f
    }
}

/// In-memory layout of one control block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C, align(32))]
pub struct ControlBlock {
    /// Transfer information
    pub ti: u32,
    /// Source bus address
    pub source_ad: u32,
    /// Destination bus address
    pub dest_ad: u32,
    /// Transfer length in bytes
    pub txfr_len: u32,
    /// 2D stride
    pub stride: u32,
    /// Next control block (0 = end)
    pub nextconbk: u32,
    /// Reserved words, used for payload
    pub pad: [u32; 2],
}

const_assert_eq!(core::mem::size_of::<ControlBlock>(), CB_SIZE as usize);
const_assert_eq!(core::mem::align_of::<ControlBlock>(), CB_ALIGN as usize);
const_assert!(word::NEXTCONBK < CB_WORDS);

impl ControlBlock {
    /// A block copying `len` bytes from `src` to `dst`
    pub const fn copy(ti: u32, src: BusAddr, dst: BusAddr, len: u32) -> Self {
        Self {
            ti,
            source_ad: src.raw(),
            dest_ad: dst.raw(),
            txfr_len: len,
            stride: 0,
            nextconbk: 0,
            pad: [0; 2],
        }
    }

    /// Set the payload words
    pub const fn with_pad(mut self, pad0: u32, pad1: u32) -> Self {
        self.pad = [pad0, pad1];
        self
    }

    /// Transfer information flags
    pub const fn info(&self) -> TransferInfo {
        TransferInfo::from_bits_retain(self.ti)
    }

    /// Raw words in hardware order
    pub const fn to_words(&self) -> [u32; CB_WORDS] {
        [
            self.ti,
            self.source_ad,
            self.dest_ad,
            self.txfr_len,
            self.stride,
            self.nextconbk,
            self.pad[0],
            self.pad[1],
        ]
    }

    /// Rebuild from raw words
    pub const fn from_words(words: &[u32; CB_WORDS]) -> Self {
        Self {
            ti: words[word::TI],
            source_ad: words[word::SOURCE_AD],
            dest_ad: words[word::DEST_AD],
            txfr_len: words[word::TXFR_LEN],
            stride: words[word::STRIDE],
            nextconbk: words[word::NEXTCONBK],
            pad: [words[word::PAD0], words[word::PAD1]],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_order_matches_hardware() {
        let cb = ControlBlock::copy(
            TransferInfo::WAIT_RESP.bits(),
            BusAddr::new(0x10),
            BusAddr::new(0x20),
            4,
        )
        .with_pad(0xAA, 0xBB);
        let words = cb.to_words();
        assert_eq!(words[word::TI], 1 << 3);
        assert_eq!(words[word::SOURCE_AD], 0x10);
        assert_eq!(words[word::DEST_AD], 0x20);
        assert_eq!(words[word::TXFR_LEN], 4);
        assert_eq!(words[word::NEXTCONBK], 0);
        assert_eq!(words[word::PAD1], 0xBB);
        assert_eq!(ControlBlock::from_words(&words), cb);
    }

    #[test]
    fn test_ti_fields() {
        let ti = TransferInfo::SRC_DREQ.bits() | TransferInfo::permap(permap::SPI_RX);
        assert_eq!(TransferInfo::peripheral(ti), permap::SPI_RX);
        assert_eq!(TransferInfo::waits(31), 0x1f << 21);
        assert!(ControlBlock::copy(ti, BusAddr::null(), BusAddr::null(), 0)
            .info()
            .contains(TransferInfo::SRC_DREQ));
    }
}
