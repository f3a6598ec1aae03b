//! # SPI Controller
//!
//! Glue between an SPI host and the chain engine: registers the SPI fragment
//! caches, validates messages, and forwards submission, interrupt and timeout
//! handling to the [`Scheduler`].
//!
//! Three DMA channels are used:
//!
//! - `data`: runs every merged operation (register writes and RX)
//! - `tx`: feeds the TX FIFO; loaded and started from the data chain
//! - `irq`: raises the completion interrupt when a message has a callback

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use dmachain_core::{
    compile, shell_factory, trigger_factory, AllocContext, CacheStats, DebugFlags, DebugObserver,
    Error, FragmentCaches, FragmentSet, IrqOutcome, MergedOp, Message, OpId, Result, Scheduler,
    StatsSnapshot,
};
use dmachain_hal::{BusAddr, DmaChannel, DmaPool};

use crate::fragments::{
    cs_deselect_factory, delay_factory, setup_factory, transfer_factory, FragmentTargets,
};
use crate::regs::bus;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Fragments created per cache when the controller starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Operation shells
    pub merged: usize,
    /// Controller setup
    pub setup: usize,
    /// Data phases
    pub transfer: usize,
    /// Chip-select release
    pub cs_deselect: usize,
    /// Delays
    pub delay: usize,
    /// Completion triggers
    pub trigger_irq: usize,
}

impl CacheConfig {
    /// Default prefill
    pub const fn new() -> Self {
        Self {
            merged: 4,
            setup: 4,
            transfer: 8,
            cs_deselect: 4,
            delay: 2,
            trigger_irq: 4,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Controller configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Core clock feeding the SPI divider
    pub core_clock_hz: u32,
    /// Allow messages to be compiled once and resubmitted
    pub optimize: bool,
    /// Log switches
    pub debug: DebugFlags,
    /// Cache prefill
    pub caches: CacheConfig,
    /// SPI register window
    pub spi_base: BusAddr,
}

impl ControllerConfig {
    /// Default configuration for SPI0 at a 250 MHz core clock
    pub const fn new() -> Self {
        Self {
            core_clock_hz: 250_000_000,
            optimize: true,
            debug: DebugFlags::empty(),
            caches: CacheConfig::new(),
            spi_base: bus::SPI0,
        }
    }

    /// Set the log switches
    pub const fn with_debug(mut self, debug: DebugFlags) -> Self {
        self.debug = debug;
        self
    }

    /// Enable or disable reusable operations
    pub const fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// DMA channels owned by one controller
#[derive(Clone)]
pub struct Channels {
    /// Runs merged operations
    pub data: Arc<dyn DmaChannel>,
    /// Feeds the TX FIFO
    pub tx: Arc<dyn DmaChannel>,
    /// Raises completion interrupts
    pub irq: Arc<dyn DmaChannel>,
}

impl fmt::Debug for Channels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channels")
            .field("data", &self.data.bus_base())
            .field("tx", &self.tx.bus_base())
            .field("irq", &self.irq.bus_base())
            .finish()
    }
}

/// Controller counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerStats {
    /// Engine counters
    pub engine: StatsSnapshot,
    /// Operations currently queued
    pub queued: usize,
}

// =============================================================================
// CONTROLLER
// =============================================================================

/// DMA-driven SPI controller
pub struct Controller {
    config: ControllerConfig,
    set: FragmentSet,
    tx: Arc<dyn DmaChannel>,
    observer: Arc<DebugObserver>,
    scheduler: Scheduler,
}

impl Controller {
    /// Set up the fragment caches and take over `channels`.
    ///
    /// Control blocks come from `pool`, which must be DMA-coherent.
    pub fn new(config: ControllerConfig, pool: Arc<DmaPool>, channels: Channels) -> Result<Self> {
        channels.data.reset();
        channels.tx.reset();
        channels.irq.reset();

        let targets = FragmentTargets {
            spi: config.spi_base,
            tx_channel: channels.tx.bus_base(),
            core_clock_hz: config.core_clock_hz,
        };
        let sizes = config.caches;
        let mut caches = FragmentCaches::new();
        let set = FragmentSet {
            merged: caches.register("merged", sizes.merged, shell_factory(Arc::clone(&pool)))?,
            setup: caches.register("setup", sizes.setup, setup_factory(Arc::clone(&pool), targets))?,
            transfer: caches.register(
                "transfer",
                sizes.transfer,
                transfer_factory(Arc::clone(&pool), targets),
            )?,
            cs_deselect: caches.register(
                "cs_deselect",
                sizes.cs_deselect,
                cs_deselect_factory(Arc::clone(&pool)),
            )?,
            delay: caches.register("delay", sizes.delay, delay_factory(Arc::clone(&pool)))?,
            trigger_irq: caches.register(
                "trigger_irq",
                sizes.trigger_irq,
                trigger_factory(Arc::clone(&pool), channels.irq.bus_base()),
            )?,
        };

        let observer = Arc::new(DebugObserver::new(config.debug));
        let scheduler = Scheduler::new(
            Arc::new(caches),
            Arc::clone(&channels.data),
            Arc::clone(&channels.irq),
            observer.clone(),
        );
        log::info!(
            "spi: controller at {} ready (data {}, tx {}, irq {})",
            config.spi_base,
            channels.data.bus_base(),
            channels.tx.bus_base(),
            channels.irq.bus_base()
        );

        Ok(Self {
            config,
            set,
            tx: channels.tx,
            observer,
            scheduler,
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Cache ids of the fragment kinds
    pub fn fragment_set(&self) -> &FragmentSet {
        &self.set
    }

    /// Compile a message without registering it
    pub fn compile(&self, message: Message, alloc: AllocContext) -> Result<MergedOp> {
        validate(&message)?;
        compile(self.scheduler.caches(), &self.set, message, alloc)
    }

    /// Compile, register and submit a one-shot message
    pub fn transfer(&self, message: Message, alloc: AllocContext) -> Result<OpId> {
        let op = self.compile(message, alloc)?;
        let id = self.scheduler.register(op)?;
        if let Err(err) = self.scheduler.submit(id) {
            if let Err(release_err) = self.scheduler.release(id) {
                log::warn!("spi: {} not released after failed submit: {}", id, release_err);
            }
            return Err(err);
        }
        Ok(id)
    }

    /// Compile a message once for repeated submission with [`Self::submit`]
    pub fn optimize(&self, message: Message) -> Result<OpId> {
        if !self.config.optimize {
            return Err(Error::NotSupported);
        }
        let op = self.compile(message, AllocContext::Blocking)?;
        let id = self.scheduler.register(op)?;
        self.scheduler.set_optimized(id, true)?;
        Ok(id)
    }

    /// Submit a previously optimized message
    pub fn submit(&self, id: OpId) -> Result<()> {
        self.scheduler.submit(id)
    }

    /// Drop an optimized message; it must not be queued
    pub fn unoptimize(&self, id: OpId) -> Result<()> {
        self.scheduler.release(id)
    }

    /// Completion interrupt handler
    pub fn handle_interrupt(&self) -> IrqOutcome {
        self.scheduler.handle_interrupt()
    }

    /// Start work whose start was deferred behind a busy engine
    pub fn poll(&self) -> bool {
        self.scheduler.poll()
    }

    /// Fail `id` after the host gave up waiting for it
    pub fn release_on_timeout(&self, id: OpId) -> Result<()> {
        log::warn!("spi: {} timed out", id);
        self.dump_state();
        self.tx.reset();
        self.scheduler.release_on_timeout(id)
    }

    /// Engine counters and queue depth
    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            engine: self.observer.stats().snapshot(),
            queued: self.scheduler.queued(),
        }
    }

    /// Counters of every fragment cache
    pub fn cache_stats(&self) -> Vec<CacheStats> {
        self.scheduler.caches().stats()
    }

    /// Log the queue, channels and caches at debug level
    pub fn dump_state(&self) {
        self.scheduler.dump();
        self.tx.dump();
        for cache in self.scheduler.caches().iter() {
            cache.dump();
        }
    }

    /// Stop all channels and fail queued messages
    pub fn shutdown(&self) {
        self.tx.reset();
        self.scheduler.shutdown();
        log::info!("spi: controller at {} shut down", self.config.spi_base);
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .field("set", &self.set)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

/// Reject transfers the DMA path cannot carry
fn validate(message: &Message) -> Result<()> {
    for transfer in message.transfers() {
        if transfer.bits_per_word != 8 {
            log::error!("spi: {} bits per word not supported", transfer.bits_per_word);
            return Err(Error::NotSupported);
        }
        if transfer.tx_nbits > 1 || transfer.rx_nbits > 1 {
            log::error!("spi: dual/quad transfers not supported");
            return Err(Error::NotSupported);
        }
    }
    Ok(())
}
