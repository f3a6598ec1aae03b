//! # SPI Fragment Kinds
//!
//! Factories for the fragments an SPI message is compiled from. Each factory
//! builds the control blocks once with everything that is fixed for the
//! controller; transforms patch in what depends on the message.
//!
//! | kind          | blocks (data channel unless noted)                        |
//! |---------------|-----------------------------------------------------------|
//! | `setup`       | clock divider, FIFO reset, DMA-enable config              |
//! | `transfer`    | select, length, load+start TX channel, RX; TX (tx channel)|
//! | `cs_deselect` | release chip select                                       |
//! | `delay`       | idle transfer of a length proportional to the delay       |
//!
//! The completion trigger comes from [`dmachain_core::trigger_factory`].

use alloc::boxed::Box;
use alloc::sync::Arc;

use dmachain_core::link::source_from_payload;
use dmachain_core::{
    AllocContext, DmaLink, Fragment, FragmentFactory, Operand, Result, Transform, TransformCtx,
};
use dmachain_hal::cb::{permap, word};
use dmachain_hal::{BusAddr, ControlBlock, DmaCs, DmaPool, DmaReg, TransferInfo};

use crate::device::clock_divider;
use crate::regs::{spi, spi_reg};

/// Idle bytes moved per microsecond of requested delay
pub const DELAY_BYTES_PER_USEC: u32 = 8;

/// Where the fragments find the hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentTargets {
    /// SPI register window
    pub spi: BusAddr,
    /// Register window of the DMA channel feeding the TX FIFO
    pub tx_channel: BusAddr,
    /// Core clock driving the SPI divider
    pub core_clock_hz: u32,
}

/// Register-write block: copies its first payload word to `dst`
fn register_write(
    pool: &Arc<DmaPool>,
    desc: &'static str,
    dst: BusAddr,
    value: u32,
) -> Result<DmaLink> {
    let block = ControlBlock::copy(TransferInfo::WAIT_RESP.bits(), BusAddr::null(), dst, 4)
        .with_pad(value, 0);
    let link = DmaLink::with_block(pool, desc, block)?;
    source_from_payload(&link)?;
    Ok(link)
}

// =============================================================================
// SETUP
// =============================================================================

const SETUP_CLOCK: usize = 0;
const SETUP_RESET: usize = 1;
const SETUP_CONFIG: usize = 2;

/// Clock divider, FIFO reset and DMA configuration
pub fn build_setup(pool: &Arc<DmaPool>, targets: &FragmentTargets) -> Result<Fragment> {
    let mut fragment = Fragment::new("setup");
    let clock = register_write(pool, "spi clock", spi_reg(targets.spi, spi::CLK), 0)?;
    // Core clock rides in the spare payload word for the divider transform
    clock.write(word::PAD1, targets.core_clock_hz)?;
    fragment.push_link(clock);
    fragment.push_link(register_write(pool, "spi reset fifo", spi_reg(targets.spi, spi::CS), 0)?);
    fragment.push_link(register_write(pool, "spi config", spi_reg(targets.spi, spi::CS), 0)?);
    fragment.chain_all()?;

    fragment.add_transform(
        Transform::pre("clock_divider", set_clock_divider)
            .with_src(Operand::word(SETUP_CLOCK, word::PAD1))
            .with_dst(Operand::word(SETUP_CLOCK, word::PAD0)),
    );
    fragment.add_transform(
        Transform::pre("reset_fifo", set_reset_fifo).with_dst(Operand::word(SETUP_RESET, word::PAD0)),
    );
    fragment.add_transform(
        Transform::pre("spi_config", set_spi_config).with_dst(Operand::word(SETUP_CONFIG, word::PAD0)),
    );
    Ok(fragment)
}

fn set_clock_divider(t: &Transform, ctx: &mut TransformCtx<'_>) -> Result<()> {
    let core_clock = t.src.load(ctx)?;
    let speed = ctx.require_transfer()?.speed_hz;
    t.dst.store(ctx, clock_divider(core_clock, speed))
}

fn set_reset_fifo(t: &Transform, ctx: &mut TransformCtx<'_>) -> Result<()> {
    t.dst.store(ctx, ctx.message.device.spi_reset_fifo)
}

fn set_spi_config(t: &Transform, ctx: &mut TransformCtx<'_>) -> Result<()> {
    t.dst.store(ctx, ctx.message.device.spi_config)
}

// =============================================================================
// TRANSFER
// =============================================================================

const XFER_SELECT: usize = 0;
const XFER_LENGTH: usize = 1;
const XFER_LOAD_TX: usize = 2;
const XFER_START_TX: usize = 3;
const XFER_RX: usize = 4;
const XFER_TX: usize = 5;

/// RX block flags when the received bytes are kept
const RX_KEEP: TransferInfo = TransferInfo::SRC_DREQ
    .union(TransferInfo::DEST_INC)
    .union(TransferInfo::WAIT_RESP)
    .union(TransferInfo::from_bits_retain(TransferInfo::permap(permap::SPI_RX)));
/// TX block flags when bytes come from memory
const TX_SEND: TransferInfo = TransferInfo::DEST_DREQ
    .union(TransferInfo::SRC_INC)
    .union(TransferInfo::WAIT_RESP)
    .union(TransferInfo::from_bits_retain(TransferInfo::permap(permap::SPI_TX)));

/// One data phase: select, program length, start TX, drain RX
pub fn build_transfer(pool: &Arc<DmaPool>, targets: &FragmentTargets) -> Result<Fragment> {
    let mut fragment = Fragment::new("transfer");
    let fifo = spi_reg(targets.spi, spi::FIFO);

    let tx = DmaLink::with_block(
        pool,
        "spi tx",
        ControlBlock::copy(TX_SEND.bits(), BusAddr::null(), fifo, 0),
    )?;
    let rx = DmaLink::with_block(
        pool,
        "spi rx",
        ControlBlock::copy(RX_KEEP.bits(), fifo, BusAddr::null(), 0),
    )?;

    fragment.push_link(register_write(pool, "cs select", BusAddr::null(), 0)?);
    fragment.push_link(register_write(pool, "spi dlen", spi_reg(targets.spi, spi::DLEN), 0)?);
    fragment.push_link(register_write(
        pool,
        "tx load",
        targets.tx_channel + DmaReg::ConblkAd.offset(),
        tx.bus().raw(),
    )?);
    fragment.push_link(register_write(
        pool,
        "tx start",
        targets.tx_channel + DmaReg::Cs.offset(),
        DmaCs::ACTIVE.bits(),
    )?);
    fragment.push_link(rx);
    fragment.push_link(tx);

    for index in XFER_SELECT..XFER_RX {
        fragment.chain(index, index + 1)?;
    }
    fragment.set_head(XFER_SELECT)?;
    fragment.set_tail(XFER_RX)?;

    fragment.add_transform(
        Transform::pre("chip_select", set_chip_select)
            .with_dst(Operand::word(XFER_SELECT, word::DEST_AD))
            .with_extra(Operand::word(XFER_SELECT, word::PAD0)),
    );
    fragment.add_transform(
        Transform::pre("length", set_length).with_dst(Operand::word(XFER_LENGTH, word::PAD0)),
    );
    fragment.add_transform(
        Transform::pre("length", set_length).with_dst(Operand::word(XFER_RX, word::TXFR_LEN)),
    );
    fragment.add_transform(
        Transform::pre("length", set_length).with_dst(Operand::word(XFER_TX, word::TXFR_LEN)),
    );
    fragment.add_transform(
        Transform::pre("rx_buffer", set_rx_buffer)
            .with_dst(Operand::word(XFER_RX, word::DEST_AD))
            .with_extra(Operand::word(XFER_RX, word::TI)),
    );
    fragment.add_transform(
        Transform::pre("tx_buffer", set_tx_buffer)
            .with_dst(Operand::word(XFER_TX, word::SOURCE_AD))
            .with_extra(Operand::word(XFER_TX, word::TI)),
    );
    fragment.add_transform(Transform::post("account", account_length));
    Ok(fragment)
}

fn set_chip_select(t: &Transform, ctx: &mut TransformCtx<'_>) -> Result<()> {
    let device = ctx.message.device;
    t.dst.store(ctx, device.cs_select_reg.raw())?;
    t.extra.store(ctx, device.cs_mask)
}

fn set_length(t: &Transform, ctx: &mut TransformCtx<'_>) -> Result<()> {
    t.dst.store(ctx, ctx.require_transfer()?.len)
}

fn set_rx_buffer(t: &Transform, ctx: &mut TransformCtx<'_>) -> Result<()> {
    let (flags, target) = match ctx.require_transfer()?.rx {
        Some(rx) => (RX_KEEP, rx),
        None => (RX_KEEP - TransferInfo::DEST_INC | TransferInfo::DEST_IGNORE, BusAddr::null()),
    };
    t.dst.store(ctx, target.raw())?;
    t.extra.store(ctx, flags.bits())
}

fn set_tx_buffer(t: &Transform, ctx: &mut TransformCtx<'_>) -> Result<()> {
    let (flags, source) = match ctx.require_transfer()?.tx {
        Some(tx) => (TX_SEND, tx),
        None => (TX_SEND - TransferInfo::SRC_INC | TransferInfo::SRC_IGNORE, BusAddr::null()),
    };
    t.dst.store(ctx, source.raw())?;
    t.extra.store(ctx, flags.bits())
}

fn account_length(_t: &Transform, ctx: &mut TransformCtx<'_>) -> Result<()> {
    let len = ctx.require_transfer()?.len;
    ctx.status.actual_length = ctx.status.actual_length.saturating_add(len);
    Ok(())
}

// =============================================================================
// CHIP SELECT RELEASE / DELAY
// =============================================================================

/// Release chip select
pub fn build_cs_deselect(pool: &Arc<DmaPool>) -> Result<Fragment> {
    let mut fragment = Fragment::new("cs_deselect");
    fragment.push_link(register_write(pool, "cs deselect", BusAddr::null(), 0)?);
    fragment.add_transform(
        Transform::pre("chip_deselect", set_chip_deselect)
            .with_dst(Operand::word(0, word::DEST_AD))
            .with_extra(Operand::word(0, word::PAD0)),
    );
    Ok(fragment)
}

fn set_chip_deselect(t: &Transform, ctx: &mut TransformCtx<'_>) -> Result<()> {
    let device = ctx.message.device;
    t.dst.store(ctx, device.cs_deselect_reg.raw())?;
    t.extra.store(ctx, device.cs_mask)
}

/// Burn time between transfers with a transfer that touches nothing
pub fn build_delay(pool: &Arc<DmaPool>) -> Result<Fragment> {
    let mut fragment = Fragment::new("delay");
    let flags = TransferInfo::SRC_IGNORE
        | TransferInfo::DEST_IGNORE
        | TransferInfo::from_bits_retain(TransferInfo::waits(31));
    fragment.push_link(DmaLink::with_block(
        pool,
        "delay",
        ControlBlock::copy(flags.bits(), BusAddr::null(), BusAddr::null(), 0),
    )?);
    fragment.add_transform(
        Transform::pre("delay_length", set_delay_length).with_dst(Operand::word(0, word::TXFR_LEN)),
    );
    Ok(fragment)
}

fn set_delay_length(t: &Transform, ctx: &mut TransformCtx<'_>) -> Result<()> {
    let usecs = u32::from(ctx.require_transfer()?.delay_usecs);
    t.dst.store(ctx, usecs * DELAY_BYTES_PER_USEC)
}

// =============================================================================
// FACTORIES
// =============================================================================

/// Factory for [`build_setup`]
pub fn setup_factory(pool: Arc<DmaPool>, targets: FragmentTargets) -> FragmentFactory {
    Box::new(move |_alloc: AllocContext| build_setup(&pool, &targets))
}

/// Factory for [`build_transfer`]
pub fn transfer_factory(pool: Arc<DmaPool>, targets: FragmentTargets) -> FragmentFactory {
    Box::new(move |_alloc: AllocContext| build_transfer(&pool, &targets))
}

/// Factory for [`build_cs_deselect`]
pub fn cs_deselect_factory(pool: Arc<DmaPool>) -> FragmentFactory {
    Box::new(move |_alloc: AllocContext| build_cs_deselect(&pool))
}

/// Factory for [`build_delay`]
pub fn delay_factory(pool: Arc<DmaPool>) -> FragmentFactory {
    Box::new(move |_alloc: AllocContext| build_delay(&pool))
}
