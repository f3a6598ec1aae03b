//! # BCM2835 Register Map
//!
//! Bus addresses and register bits of the blocks the SPI fragments program.
//! All addresses are VideoCore bus addresses, as seen by the DMA controller.

use bitflags::bitflags;
use dmachain_hal::BusAddr;

/// Peripheral windows on the VideoCore bus
pub mod bus {
    use dmachain_hal::BusAddr;

    /// DMA controller, channel 0
    pub const DMA: BusAddr = BusAddr::new(0x7E00_7000);
    /// GPIO block
    pub const GPIO: BusAddr = BusAddr::new(0x7E20_0000);
    /// SPI0 master
    pub const SPI0: BusAddr = BusAddr::new(0x7E20_4000);
}

/// SPI0 register offsets
pub mod spi {
    /// Control and status
    pub const CS: u32 = 0x00;
    /// TX/RX FIFO
    pub const FIFO: u32 = 0x04;
    /// Clock divider
    pub const CLK: u32 = 0x08;
    /// Data length (DMA mode)
    pub const DLEN: u32 = 0x0c;
    /// LoSSI output hold delay
    pub const LTOH: u32 = 0x10;
    /// DMA DREQ thresholds
    pub const DC: u32 = 0x14;
    /// Size of the register window
    pub const WINDOW: u32 = 0x18;
}

/// GPIO register offsets
pub mod gpio {
    /// Output set, pins 0..31
    pub const GPSET0: u32 = 0x1c;
    /// Output clear, pins 0..31
    pub const GPCLR0: u32 = 0x28;
    /// Size of the register window
    pub const WINDOW: u32 = 0xb4;

    /// SPI0 MISO pin
    pub const SPI_MISO: u32 = 9;
    /// SPI0 MOSI pin
    pub const SPI_MOSI: u32 = 10;
    /// SPI0 SCLK pin
    pub const SPI_SCLK: u32 = 11;
}

bitflags! {
    /// SPI control and status register
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SpiCs: u32 {
        /// Chip select bit 0
        const CS_01    = 1 << 0;
        /// Chip select bit 1
        const CS_10    = 1 << 1;
        /// Clock phase
        const CPHA     = 1 << 2;
        /// Clock polarity
        const CPOL     = 1 << 3;
        /// Clear TX FIFO
        const CLEAR_TX = 1 << 4;
        /// Clear RX FIFO
        const CLEAR_RX = 1 << 5;
        /// Chip select polarity
        const CSPOL    = 1 << 6;
        /// Transfer active
        const TA       = 1 << 7;
        /// DMA enable
        const DMAEN    = 1 << 8;
        /// Interrupt on done
        const INTD     = 1 << 9;
        /// Interrupt on RXR
        const INTR     = 1 << 10;
        /// Automatically deassert chip select
        const ADCS     = 1 << 11;
        /// Read enable (bidirectional mode)
        const REN      = 1 << 12;
        /// LoSSI enable
        const LEN      = 1 << 13;
        /// Transfer done
        const DONE     = 1 << 16;
        /// RX FIFO contains data
        const RXD      = 1 << 17;
        /// TX FIFO can accept data
        const TXD      = 1 << 18;
        /// RX FIFO needs reading
        const RXR      = 1 << 19;
        /// RX FIFO full
        const RXF      = 1 << 20;
        /// Chip select 0 polarity
        const CSPOL0   = 1 << 21;
        /// Chip select 1 polarity
        const CSPOL1   = 1 << 22;
        /// Chip select 2 polarity
        const CSPOL2   = 1 << 23;
        /// DMA mode in LoSSI
        const DMA_LEN  = 1 << 24;
        /// Long data word in LoSSI DMA mode
        const LEN_LONG = 1 << 25;
    }
}

/// Bus address of an SPI register
pub const fn spi_reg(base: BusAddr, offset: u32) -> BusAddr {
    BusAddr::new(base.raw() + offset)
}

/// GPIO set or clear register covering `pin`
pub const fn gpio_bank_reg(offset: u32, pin: u32) -> BusAddr {
    BusAddr::new(bus::GPIO.raw() + offset + 4 * (pin >> 5))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_addresses() {
        assert_eq!(spi_reg(bus::SPI0, spi::FIFO).raw(), 0x7E20_4004);
        assert_eq!(gpio_bank_reg(gpio::GPSET0, 8).raw(), 0x7E20_001C);
        assert_eq!(gpio_bank_reg(gpio::GPCLR0, 40).raw(), 0x7E20_002C);
        assert_eq!(SpiCs::CS_01 | SpiCs::CS_10, SpiCs::from_bits_truncate(0x3));
    }
}
