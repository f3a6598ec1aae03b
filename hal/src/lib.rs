//! # DMA Chain HAL
//!
//! Hardware abstraction for the BCM2835 DMA controller as used by the chained
//! command-block engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        dmachain-hal                          │
//! │  ┌────────────┐  ┌────────────┐  ┌────────────────────────┐  │
//! │  │  DmaPool   │  │ Control    │  │  DmaChannel            │  │
//! │  │ (bus-addr  │  │ Block      │  │  (CS / CONBLK_AD ...)  │  │
//! │  │  blocks)   │  │ layout     │  │  MmioChannel / Sim     │  │
//! │  └────────────┘  └────────────┘  └────────────────────────┘  │
//! │  ┌──────────────────────────┐  ┌──────────────────────────┐  │
//! │  │ IrqMutex / InterruptGuard│  │ fence (DMA barriers)     │  │
//! │  └──────────────────────────┘  └──────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything the engine shares with hardware lives in a [`DmaPool`]: fixed
//! size blocks with a stable bus address, accessed word-wise.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod addr;
pub mod cb;
pub mod error;
pub mod irq;
pub mod pool;
pub mod regs;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use addr::BusAddr;
pub use cb::{ControlBlock, TransferInfo};
pub use error::{HalError, Result};
pub use irq::{InterruptGuard, IrqMutex, IrqMutexGuard};
pub use pool::{BlockHandle, DmaPool, PoolConfig, PoolStats};
pub use regs::{fence, DmaChannel, DmaCs, DmaReg, MmioChannel};
