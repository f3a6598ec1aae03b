//! # BCM2835 SPI over Chained DMA
//!
//! SPI master whose messages run entirely as DMA control-block chains:
//! clock and mode programming, chip-select toggling, data phases, delays and
//! the completion interrupt are all blocks in one merged operation.
//!
//! ## Usage
//!
//! ```ignore
//! let controller = Controller::new(ControllerConfig::new(), pool, channels)?;
//! let device = DeviceConfig::new(0).with_mode(SpiMode::CPOL).build()?;
//! let message = Message::new(device)
//!     .with_transfer(Transfer::new(4, 1_000_000).with_tx(tx).with_rx(rx))
//!     .on_complete(|done| log::info!("{} finished: {:?}", done.id, done.status));
//! controller.transfer(message, AllocContext::Blocking)?;
//! // from the irq channel's interrupt handler:
//! controller.handle_interrupt();
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod controller;
pub mod device;
pub mod fragments;
pub mod regs;

pub use controller::{CacheConfig, Channels, Controller, ControllerConfig, ControllerStats};
pub use device::{clock_divider, DeviceConfig, SpiMode, MAX_CHIP_SELECT};
pub use fragments::FragmentTargets;
pub use regs::SpiCs;
