//! # Transfer Descriptors
//!
//! The caller-facing description of work: a [`Message`] is an ordered list of
//! [`Transfer`] descriptors for one SPI device, plus an optional completion
//! callback.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use dmachain_hal::BusAddr;

use crate::error::Result;
use crate::types::OpId;

// =============================================================================
// DEVICE
// =============================================================================

/// Per-device register values the fragments copy into hardware.
///
/// Computed once when the device is configured; the engine only moves these
/// words around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpiDevice {
    /// Chip-select line number
    pub chip_select: u8,
    /// GPIO bit mask of the chip-select pin (0 = no GPIO chip select)
    pub cs_mask: u32,
    /// Register that asserts chip select when `cs_mask` is written
    pub cs_select_reg: BusAddr,
    /// Register that releases chip select when `cs_mask` is written
    pub cs_deselect_reg: BusAddr,
    /// SPI control/status word with DMA enabled
    pub spi_config: u32,
    /// SPI control/status word that clears both FIFOs
    pub spi_reset_fifo: u32,
}

// =============================================================================
// TRANSFER
// =============================================================================

/// One transfer descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    /// Length in bytes (0 = no data phase)
    pub len: u32,
    /// Clock speed in Hz
    pub speed_hz: u32,
    /// Word size
    pub bits_per_word: u8,
    /// Transmit lane count
    pub tx_nbits: u8,
    /// Receive lane count
    pub rx_nbits: u8,
    /// Release chip select after this transfer
    pub cs_change: bool,
    /// Delay after this transfer, in microseconds
    pub delay_usecs: u16,
    /// Transmit buffer (None = send zeros)
    pub tx: Option<BusAddr>,
    /// Receive buffer (None = discard)
    pub rx: Option<BusAddr>,
}

impl Transfer {
    /// A transfer of `len` bytes at `speed_hz`, 8 bits per word, single lane
    pub const fn new(len: u32, speed_hz: u32) -> Self {
        Self {
            len,
            speed_hz,
            bits_per_word: 8,
            tx_nbits: 1,
            rx_nbits: 1,
            cs_change: false,
            delay_usecs: 0,
            tx: None,
            rx: None,
        }
    }

    /// Set the transmit buffer
    pub const fn with_tx(mut self, tx: BusAddr) -> Self {
        self.tx = Some(tx);
        self
    }

    /// Set the receive buffer
    pub const fn with_rx(mut self, rx: BusAddr) -> Self {
        self.rx = Some(rx);
        self
    }

    /// Release chip select after this transfer
    pub const fn with_cs_change(mut self) -> Self {
        self.cs_change = true;
        self
    }

    /// Delay after this transfer
    pub const fn with_delay(mut self, usecs: u16) -> Self {
        self.delay_usecs = usecs;
        self
    }

    /// Set the word size
    pub const fn with_bits_per_word(mut self, bits: u8) -> Self {
        self.bits_per_word = bits;
        self
    }

    /// Whether the controller must be reprogrammed when this transfer follows
    /// `previous`
    pub fn needs_setup_after(&self, previous: &Transfer) -> bool {
        self.speed_hz != previous.speed_hz
            || self.bits_per_word != previous.bits_per_word
            || self.tx_nbits != previous.tx_nbits
            || self.rx_nbits != previous.rx_nbits
    }
}

// =============================================================================
// COMPLETION
// =============================================================================

/// Delivered to the completion callback, exactly once per release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Operation that finished
    pub id: OpId,
    /// Final status
    pub status: Result<()>,
    /// Bytes transferred
    pub actual_length: u32,
}

/// Completion callback
pub type CompletionFn = Box<dyn FnMut(Completion) + Send>;

// =============================================================================
// MESSAGE
// =============================================================================

/// Ordered transfers for one device, with an optional completion callback
pub struct Message {
    /// Target device
    pub device: SpiDevice,
    transfers: Vec<Transfer>,
    complete: Option<CompletionFn>,
}

impl Message {
    /// Create an empty message
    pub fn new(device: SpiDevice) -> Self {
        Self {
            device,
            transfers: Vec::new(),
            complete: None,
        }
    }

    /// Append a transfer
    pub fn with_transfer(mut self, transfer: Transfer) -> Self {
        self.push(transfer);
        self
    }

    /// Append a transfer in place
    pub fn push(&mut self, transfer: Transfer) {
        self.transfers.push(transfer);
    }

    /// Set the completion callback
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnMut(Completion) + Send + 'static,
    {
        self.complete = Some(Box::new(callback));
        self
    }

    /// Transfers in order
    pub fn transfers(&self) -> &[Transfer] {
        &self.transfers
    }

    /// Whether a completion callback is attached
    pub fn has_callback(&self) -> bool {
        self.complete.is_some()
    }

    /// Sum of all transfer lengths, saturating at `u32::MAX`
    pub fn total_len(&self) -> u32 {
        self.transfers
            .iter()
            .fold(0u32, |total, t| total.saturating_add(t.len))
    }

    /// Invoke the completion callback, if any
    pub fn notify(&mut self, completion: Completion) {
        if let Some(callback) = self.complete.as_mut() {
            callback(completion);
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("device", &self.device)
            .field("transfers", &self.transfers)
            .field("callback", &self.complete.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_needed_on_parameter_change() {
        let base = Transfer::new(4, 1_000_000);
        assert!(!Transfer::new(8, 1_000_000).needs_setup_after(&base));
        assert!(Transfer::new(4, 2_000_000).needs_setup_after(&base));
        assert!(base.with_bits_per_word(16).needs_setup_after(&base));
    }

    #[test]
    fn test_message_builder() {
        let msg = Message::new(SpiDevice::default())
            .with_transfer(Transfer::new(4, 1_000_000))
            .with_transfer(Transfer::new(0, 1_000_000).with_delay(10));
        assert_eq!(msg.transfers().len(), 2);
        assert_eq!(msg.total_len(), 4);
        assert!(!msg.has_callback());
    }

    #[test]
    fn test_total_len_saturates() {
        let msg = Message::new(SpiDevice::default())
            .with_transfer(Transfer::new(u32::MAX, 1_000_000))
            .with_transfer(Transfer::new(u32::MAX, 1_000_000));
        assert_eq!(msg.total_len(), u32::MAX);
    }
}
