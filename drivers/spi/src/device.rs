//! # SPI Devices
//!
//! Per-device register values are computed once, when a device is set up,
//! and stored in a [`SpiDevice`] the fragments copy from.

use bitflags::bitflags;
use dmachain_core::{Error, Result, SpiDevice};

use crate::regs::{gpio, gpio_bank_reg, SpiCs};

/// Number of chip selects the controller accepts
pub const MAX_CHIP_SELECT: u8 = 3;

bitflags! {
    /// SPI mode bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SpiMode: u32 {
        /// Clock phase
        const CPHA    = 1 << 0;
        /// Clock polarity
        const CPOL    = 1 << 1;
        /// Chip select is active high
        const CS_HIGH = 1 << 2;
        /// No chip select line
        const NO_CS   = 1 << 6;
    }
}

/// Device setup parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Logical chip select
    pub chip_select: u8,
    /// GPIO driving the chip select line
    pub cs_gpio: u32,
    /// Mode bits
    pub mode: SpiMode,
}

impl DeviceConfig {
    /// Chip select `chip_select` on its default GPIO (CE0 = 8, CE1 = 7)
    pub const fn new(chip_select: u8) -> Self {
        Self {
            chip_select,
            cs_gpio: 8u32.saturating_sub(chip_select as u32),
            mode: SpiMode::empty(),
        }
    }

    /// Use another GPIO for chip select
    pub const fn with_gpio(mut self, gpio: u32) -> Self {
        self.cs_gpio = gpio;
        self
    }

    /// Set the mode bits
    pub const fn with_mode(mut self, mode: SpiMode) -> Self {
        self.mode = mode;
        self
    }

    /// Compute the register values the fragments need
    pub fn build(&self) -> Result<SpiDevice> {
        if self.chip_select >= MAX_CHIP_SELECT {
            log::error!("chip select {} out of range", self.chip_select);
            return Err(Error::InvalidParameter);
        }
        if self.mode.contains(SpiMode::NO_CS)
            && matches!(self.cs_gpio, gpio::SPI_MISO | gpio::SPI_MOSI | gpio::SPI_SCLK)
        {
            log::error!("chip select GPIO {} conflicts with the SPI lines", self.cs_gpio);
            return Err(Error::InvalidParameter);
        }

        let set = gpio_bank_reg(gpio::GPSET0, self.cs_gpio);
        let clear = gpio_bank_reg(gpio::GPCLR0, self.cs_gpio);
        let (select, deselect) = if self.mode.contains(SpiMode::CS_HIGH) {
            (set, clear)
        } else {
            (clear, set)
        };

        // Native chip selects stay parked; the GPIO does the selecting
        let mut base = SpiCs::TA | SpiCs::CS_01 | SpiCs::CS_10;
        base.set(SpiCs::CPOL, self.mode.contains(SpiMode::CPOL));
        base.set(SpiCs::CPHA, self.mode.contains(SpiMode::CPHA));

        Ok(SpiDevice {
            chip_select: self.chip_select,
            cs_mask: 1 << (self.cs_gpio % 32),
            cs_select_reg: select,
            cs_deselect_reg: deselect,
            spi_config: (base | SpiCs::DMAEN).bits(),
            spi_reset_fifo: (base | SpiCs::CLEAR_RX | SpiCs::CLEAR_TX).bits(),
        })
    }
}

/// Clock divider for `speed_hz` from a core clock of `core_clock_hz`.
///
/// The divider is even; 2 is the fastest setting and 0 the slowest.
pub fn clock_divider(core_clock_hz: u32, speed_hz: u32) -> u32 {
    if speed_hz == 0 {
        return 0;
    }
    if speed_hz >= core_clock_hz / 2 {
        return 2;
    }
    let mut divider = core_clock_hz.div_ceil(speed_hz);
    divider += divider % 2;
    if divider >= 65536 {
        0
    } else {
        divider
    }
}
