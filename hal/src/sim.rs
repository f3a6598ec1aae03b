//! # DMA Controller Simulator
//!
//! A software model of the BCM2835 DMA controller, good enough to run the
//! engine's control-block chains on a host.
//!
//! The model follows the hardware where the engine depends on it:
//!
//! - A channel loads a whole control block (including `NEXTCONBK`) when it
//!   starts it, so a link written after that point is not seen until the
//!   next pass. Live-splice races are reproducible.
//! - Writes into a channel's register window (from the CPU or from another
//!   channel's control block) start, clear and reset channels.
//! - `SRC_DREQ` reads from a mapped FIFO stall until enough words are queued.
//! - `INTEN` sets the channel's `INT` flag when the block completes.
//!
//! One call to [`SimDma::step`] executes at most one control block per active
//! channel, lowest channel number first.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::addr::BusAddr;
use crate::cb::{word, TransferInfo, CB_WORDS};
use crate::pool::DmaPool;
use crate::regs::{DmaChannel, DmaCs, DmaReg, CHANNEL_STRIDE};

// =============================================================================
// TRACE RECORDS
// =============================================================================

/// One executed control block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEntry {
    /// Channel that executed it
    pub channel: usize,
    /// Bus address of the control block
    pub block: BusAddr,
}

/// One word written into a mapped register region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWrite {
    /// Region name
    pub region: &'static str,
    /// Register bus address
    pub addr: BusAddr,
    /// Value written
    pub value: u32,
}

// =============================================================================
// INTERNAL STATE
// =============================================================================

#[derive(Debug, Default, Clone)]
struct ChannelState {
    conblk: u32,
    active: bool,
    end: bool,
    int: bool,
    error: bool,
    flags: u32,
    loaded: Option<[u32; CB_WORDS]>,
}

#[derive(Debug)]
struct SimFifo {
    bus: BusAddr,
    words: VecDeque<u32>,
}

#[derive(Debug)]
struct SimRegion {
    name: &'static str,
    base: BusAddr,
    len: u32,
    values: BTreeMap<u32, u32>,
}

struct SimState {
    dma_base: BusAddr,
    channels: Vec<ChannelState>,
    pools: Vec<Arc<DmaPool>>,
    fifos: Vec<SimFifo>,
    regions: Vec<SimRegion>,
    writes: Vec<RegisterWrite>,
    trace: Vec<TraceEntry>,
}

const STICKY_CS: u32 = DmaCs::WAIT_FOR_OUTSTANDING_WRITES.bits() | DmaCs::DISDEBUG.bits() | 0x00ff_0000;

impl SimState {
    fn channel_window(&self, addr: BusAddr) -> Option<(usize, DmaReg)> {
        if addr < self.dma_base {
            return None;
        }
        let offset = addr - self.dma_base;
        let channel = (offset / CHANNEL_STRIDE) as usize;
        if channel >= self.channels.len() {
            return None;
        }
        DmaReg::from_offset(offset % CHANNEL_STRIDE).map(|reg| (channel, reg))
    }

    fn read_reg(&self, channel: usize, reg: DmaReg) -> u32 {
        let Some(state) = self.channels.get(channel) else {
            return 0;
        };
        let loaded = |index: usize| state.loaded.map_or(0, |cb| cb[index]);
        match reg {
            DmaReg::Cs => {
                let mut cs = DmaCs::from_bits_retain(state.flags);
                cs.set(DmaCs::ACTIVE, state.active);
                cs.set(DmaCs::END, state.end);
                cs.set(DmaCs::INT, state.int);
                cs.set(DmaCs::ERROR, state.error);
                cs.set(DmaCs::PAUSED, !state.active && state.loaded.is_some());
                cs.bits()
            }
            DmaReg::ConblkAd => state.conblk,
            DmaReg::Ti => loaded(word::TI),
            DmaReg::SourceAd => loaded(word::SOURCE_AD),
            DmaReg::DestAd => loaded(word::DEST_AD),
            DmaReg::TxfrLen => loaded(word::TXFR_LEN),
            DmaReg::Stride => loaded(word::STRIDE),
            DmaReg::NextConbk => loaded(word::NEXTCONBK),
            DmaReg::Debug => 0,
        }
    }

    fn write_reg(&mut self, channel: usize, reg: DmaReg, value: u32) {
        if channel >= self.channels.len() {
            return;
        }
        match reg {
            DmaReg::Cs => {
                let cs = DmaCs::from_bits_retain(value);
                if cs.contains(DmaCs::RESET) {
                    self.channels[channel] = ChannelState::default();
                    return;
                }
                let state = &mut self.channels[channel];
                if cs.contains(DmaCs::END) {
                    state.end = false;
                }
                if cs.contains(DmaCs::INT) {
                    state.int = false;
                }
                if cs.contains(DmaCs::ABORT) {
                    state.loaded = None;
                    state.active = false;
                }
                state.flags = value & STICKY_CS;
                if cs.contains(DmaCs::ACTIVE) {
                    if !state.active {
                        self.activate(channel);
                    }
                } else {
                    state.active = false;
                }
            }
            DmaReg::ConblkAd => {
                let state = &mut self.channels[channel];
                state.conblk = value;
                if !state.active {
                    state.loaded = None;
                }
            }
            DmaReg::NextConbk => {
                // Only a paused channel accepts a new link
                let state = &mut self.channels[channel];
                if let (false, Some(cb)) = (state.active, state.loaded.as_mut()) {
                    cb[word::NEXTCONBK] = value;
                }
            }
            _ => {}
        }
    }

    fn activate(&mut self, channel: usize) {
        let conblk = self.channels[channel].conblk;
        if self.channels[channel].loaded.is_none() {
            if conblk == 0 {
                self.channels[channel].end = true;
                return;
            }
            match self.load(BusAddr::new(conblk)) {
                Some(cb) => self.channels[channel].loaded = Some(cb),
                None => {
                    log::warn!("sim: channel {} cannot load control block 0x{:08x}", channel, conblk);
                    self.channels[channel].error = true;
                    return;
                }
            }
        }
        self.channels[channel].active = true;
    }

    fn load(&self, addr: BusAddr) -> Option<[u32; CB_WORDS]> {
        let mut cb = [0u32; CB_WORDS];
        for (index, slot) in cb.iter_mut().enumerate() {
            *slot = self.pools.iter().find_map(|pool| pool.read_bus(addr.word(index)))?;
        }
        Some(cb)
    }

    fn fifo_mut(&mut self, addr: BusAddr) -> Option<&mut SimFifo> {
        self.fifos.iter_mut().find(|fifo| fifo.bus == addr)
    }

    fn read_bus(&mut self, addr: BusAddr) -> Option<u32> {
        if let Some((channel, reg)) = self.channel_window(addr) {
            return Some(self.read_reg(channel, reg));
        }
        if let Some(fifo) = self.fifo_mut(addr) {
            return Some(fifo.words.pop_front().unwrap_or(0));
        }
        if let Some(region) = self.regions.iter().find(|r| addr >= r.base && addr - r.base < r.len) {
            return Some(region.values.get(&addr.raw()).copied().unwrap_or(0));
        }
        self.pools.iter().find_map(|pool| pool.read_bus(addr))
    }

    fn write_bus(&mut self, addr: BusAddr, value: u32) -> bool {
        if let Some((channel, reg)) = self.channel_window(addr) {
            self.write_reg(channel, reg, value);
            return true;
        }
        if let Some(fifo) = self.fifo_mut(addr) {
            fifo.words.push_back(value);
            return true;
        }
        if let Some(region) = self
            .regions
            .iter_mut()
            .find(|r| addr >= r.base && addr - r.base < r.len)
        {
            region.values.insert(addr.raw(), value);
            self.writes.push(RegisterWrite {
                region: region.name,
                addr,
                value,
            });
            return true;
        }
        self.pools.iter().any(|pool| pool.write_bus(addr, value))
    }

    /// Execute the loaded block of `channel`. Returns false when stalled.
    fn execute(&mut self, channel: usize) -> bool {
        let conblk = self.channels[channel].conblk;
        let Some(cb) = self.channels[channel].loaded else {
            self.channels[channel].active = false;
            return false;
        };

        let ti = TransferInfo::from_bits_retain(cb[word::TI]);
        let src = BusAddr::new(cb[word::SOURCE_AD]);
        let dst = BusAddr::new(cb[word::DEST_AD]);
        let words = (cb[word::TXFR_LEN] as usize + 3) / 4;

        if ti.contains(TransferInfo::SRC_DREQ) && !ti.contains(TransferInfo::SRC_IGNORE) {
            if let Some(fifo) = self.fifo_mut(src) {
                if fifo.words.len() < words {
                    return false;
                }
            }
        }

        for index in 0..words {
            let value = if ti.contains(TransferInfo::SRC_IGNORE) {
                0
            } else {
                let from = if ti.contains(TransferInfo::SRC_INC) { src.word(index) } else { src };
                match self.read_bus(from) {
                    Some(value) => value,
                    None => return self.fail(channel, from),
                }
            };
            if !ti.contains(TransferInfo::DEST_IGNORE) {
                let to = if ti.contains(TransferInfo::DEST_INC) { dst.word(index) } else { dst };
                if !self.write_bus(to, value) {
                    return self.fail(channel, to);
                }
            }
        }

        self.trace.push(TraceEntry {
            channel,
            block: BusAddr::new(conblk),
        });

        // A block may have reset its own channel
        if self.channels[channel].loaded.is_none() {
            return true;
        }
        if ti.contains(TransferInfo::INTEN) {
            self.channels[channel].int = true;
        }

        let next = cb[word::NEXTCONBK];
        self.channels[channel].conblk = next;
        if next == 0 {
            let state = &mut self.channels[channel];
            state.active = false;
            state.end = true;
            state.loaded = None;
        } else {
            match self.load(BusAddr::new(next)) {
                Some(cb) => self.channels[channel].loaded = Some(cb),
                None => {
                    return self.fail(channel, BusAddr::new(next));
                }
            }
        }
        true
    }

    fn fail(&mut self, channel: usize, addr: BusAddr) -> bool {
        log::warn!("sim: channel {} bus error at {}", channel, addr);
        let state = &mut self.channels[channel];
        state.error = true;
        state.active = false;
        state.loaded = None;
        true
    }
}

// =============================================================================
// SIMULATOR
// =============================================================================

/// Simulated DMA controller with attached memory and peripherals
pub struct SimDma {
    dma_base: BusAddr,
    state: spin::Mutex<SimState>,
}

impl SimDma {
    /// Create a controller with `channels` channels whose register windows
    /// start at `dma_base`
    pub fn new(dma_base: BusAddr, channels: usize) -> Arc<Self> {
        Arc::new(Self {
            dma_base,
            state: spin::Mutex::new(SimState {
                dma_base,
                channels: alloc::vec![ChannelState::default(); channels],
                pools: Vec::new(),
                fifos: Vec::new(),
                regions: Vec::new(),
                writes: Vec::new(),
                trace: Vec::new(),
            }),
        })
    }

    /// Make a pool's blocks reachable on the simulated bus
    pub fn attach_pool(&self, pool: Arc<DmaPool>) {
        self.state.lock().pools.push(pool);
    }

    /// Map a loopback FIFO register (writes queue, reads dequeue)
    pub fn map_fifo(&self, bus: BusAddr) {
        self.state.lock().fifos.push(SimFifo {
            bus,
            words: VecDeque::new(),
        });
    }

    /// Map a plain register region whose writes are recorded
    pub fn map_registers(&self, name: &'static str, base: BusAddr, len: u32) {
        self.state.lock().regions.push(SimRegion {
            name,
            base,
            len,
            values: BTreeMap::new(),
        });
    }

    /// Handle for one channel
    pub fn channel(self: &Arc<Self>, index: usize, name: &'static str) -> SimChannel {
        SimChannel {
            dma: Arc::clone(self),
            index,
            name,
        }
    }

    /// Execute one control block on every active channel
    pub fn step(&self) -> bool {
        let mut state = self.state.lock();
        let mut progressed = false;
        for channel in 0..state.channels.len() {
            if state.channels[channel].active {
                progressed |= state.execute(channel);
            }
        }
        progressed
    }

    /// Step until no channel is active, nothing can progress, or `max_steps`
    /// is reached. Returns the number of steps taken.
    pub fn run_until_idle(&self, max_steps: usize) -> usize {
        let mut steps = 0;
        while steps < max_steps && self.any_active() {
            if !self.step() {
                break;
            }
            steps += 1;
        }
        steps
    }

    /// Whether any channel is running
    pub fn any_active(&self) -> bool {
        self.state.lock().channels.iter().any(|c| c.active)
    }

    /// Whether `channel` has its interrupt flag set
    pub fn irq_pending(&self, channel: usize) -> bool {
        self.state.lock().channels.get(channel).is_some_and(|c| c.int)
    }

    /// Whether `channel` hit a bus error
    pub fn has_error(&self, channel: usize) -> bool {
        self.state.lock().channels.get(channel).is_some_and(|c| c.error)
    }

    /// Bus address of the block `channel` has loaded, if any
    pub fn loaded_block(&self, channel: usize) -> Option<BusAddr> {
        let state = self.state.lock();
        let c = state.channels.get(channel)?;
        c.loaded.map(|_| BusAddr::new(c.conblk))
    }

    /// Blocks executed by `channel`, in order
    pub fn trace_for(&self, channel: usize) -> Vec<BusAddr> {
        self.state
            .lock()
            .trace
            .iter()
            .filter(|entry| entry.channel == channel)
            .map(|entry| entry.block)
            .collect()
    }

    /// All executed blocks, in order
    pub fn trace(&self) -> Vec<TraceEntry> {
        self.state.lock().trace.clone()
    }

    /// Forget the execution trace and recorded register writes
    pub fn clear_trace(&self) {
        let mut state = self.state.lock();
        state.trace.clear();
        state.writes.clear();
    }

    /// Recorded writes into the named register region
    pub fn register_writes(&self, region: &str) -> Vec<RegisterWrite> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|w| w.region == region)
            .copied()
            .collect()
    }

    /// Words currently queued in a mapped FIFO
    pub fn fifo_len(&self, bus: BusAddr) -> usize {
        self.state.lock().fifo_mut(bus).map_or(0, |fifo| fifo.words.len())
    }
}

impl fmt::Debug for SimDma {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimDma")
            .field("dma_base", &self.dma_base)
            .field("channels", &state.channels.len())
            .field("executed", &state.trace.len())
            .finish()
    }
}

/// One simulated channel, usable wherever a [`DmaChannel`] is expected
pub struct SimChannel {
    dma: Arc<SimDma>,
    index: usize,
    name: &'static str,
}

impl SimChannel {
    /// Channel number
    pub fn index(&self) -> usize {
        self.index
    }
}

impl DmaChannel for SimChannel {
    fn read(&self, reg: DmaReg) -> u32 {
        self.dma.state.lock().read_reg(self.index, reg)
    }

    fn write(&self, reg: DmaReg, value: u32) {
        self.dma.state.lock().write_reg(self.index, reg, value);
    }

    fn bus_base(&self) -> BusAddr {
        self.dma.dma_base + self.index as u32 * CHANNEL_STRIDE
    }

    fn name(&self) -> &str {
        self.name
    }
}

impl fmt::Debug for SimChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimChannel")
            .field("name", &self.name)
            .field("index", &self.index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cb::ControlBlock;
    use crate::pool::PoolConfig;

    const DMA_BASE: BusAddr = BusAddr::new(0x7E00_7000);
    const REGS: BusAddr = BusAddr::new(0x7E20_4000);

    fn setup() -> (Arc<SimDma>, Arc<DmaPool>) {
        let sim = SimDma::new(DMA_BASE, 4);
        let pool = Arc::new(
            DmaPool::new(PoolConfig::control_blocks(BusAddr::new(0xC000_0000), 8)).unwrap(),
        );
        sim.attach_pool(Arc::clone(&pool));
        sim.map_registers("periph", REGS, 0x20);
        (sim, pool)
    }

    fn write_cb(pool: &DmaPool, cb: ControlBlock) -> BusAddr {
        let handle = pool.allocate().unwrap();
        pool.write_block(handle, &cb.to_words()).unwrap();
        pool.bus_addr(handle)
    }

    #[test]
    fn test_chain_runs_and_raises_interrupt() {
        let (sim, pool) = setup();
        let second = write_cb(
            &pool,
            ControlBlock::copy(
                (TransferInfo::INTEN | TransferInfo::SRC_IGNORE).bits(),
                BusAddr::null(),
                REGS + 4,
                4,
            ),
        );
        let mut first = ControlBlock::copy(0, BusAddr::null(), REGS, 4);
        first.nextconbk = second.raw();
        let first_bus = write_cb(&pool, first.with_pad(0x55, 0));
        // Source is the block's own payload word
        pool.write_bus(first_bus.word(word::SOURCE_AD), first_bus.word(word::PAD0).raw());

        let channel = sim.channel(0, "test");
        channel.start(first_bus);
        assert!(channel.is_active());
        sim.run_until_idle(16);

        assert_eq!(sim.trace_for(0), alloc::vec![first_bus, second]);
        assert!(channel.status().contains(DmaCs::END | DmaCs::INT));
        assert_eq!(sim.register_writes("periph")[0].value, 0x55);

        channel.write(DmaReg::Cs, (DmaCs::INT | DmaCs::END).bits());
        assert!(!sim.irq_pending(0));
    }

    #[test]
    fn test_link_is_latched_at_load() {
        let (sim, pool) = setup();
        let a = write_cb(&pool, ControlBlock::copy(TransferInfo::SRC_IGNORE.bits(), BusAddr::null(), REGS, 4));
        let b = write_cb(&pool, ControlBlock::copy(TransferInfo::SRC_IGNORE.bits(), BusAddr::null(), REGS, 4));

        let channel = sim.channel(1, "test");
        channel.start(a);
        // Too late: `a` is already loaded with NEXTCONBK = 0
        pool.write_bus(a.word(word::NEXTCONBK), b.raw());
        sim.run_until_idle(16);
        assert_eq!(sim.trace_for(1), alloc::vec![a]);
        assert!(!channel.is_active());
    }

    #[test]
    fn test_paused_channel_accepts_new_link() {
        let (sim, pool) = setup();
        let a = write_cb(&pool, ControlBlock::copy(TransferInfo::SRC_IGNORE.bits(), BusAddr::null(), REGS, 4));
        let b = write_cb(&pool, ControlBlock::copy(TransferInfo::SRC_IGNORE.bits(), BusAddr::null(), REGS, 4));

        let channel = sim.channel(1, "test");
        channel.start(a);
        channel.write(DmaReg::NextConbk, b.raw());
        assert_eq!(channel.read(DmaReg::NextConbk), 0);

        channel.write(DmaReg::Cs, 0);
        assert!(channel.status().contains(DmaCs::PAUSED));
        channel.write(DmaReg::NextConbk, b.raw());
        channel.write(DmaReg::Cs, DmaCs::ACTIVE.bits());
        sim.run_until_idle(16);
        assert_eq!(sim.trace_for(1), alloc::vec![a, b]);
    }

    #[test]
    fn test_dreq_source_stalls_until_fifo_filled() {
        let (sim, pool) = setup();
        let fifo = REGS + 0x04;
        sim.map_fifo(fifo);
        let data = write_cb(&pool, ControlBlock::default());
        let rx = write_cb(
            &pool,
            ControlBlock::copy(
                (TransferInfo::SRC_DREQ | TransferInfo::DEST_INC).bits(),
                fifo,
                data,
                8,
            ),
        );

        let channel = sim.channel(2, "rx");
        channel.start(rx);
        assert_eq!(sim.run_until_idle(16), 0);
        assert!(channel.is_active());

        let tx = write_cb(
            &pool,
            ControlBlock::copy(TransferInfo::SRC_INC.bits(), data.word(6), fifo, 8).with_pad(1, 2),
        );
        pool.write_bus(tx.word(word::SOURCE_AD), tx.word(word::PAD0).raw());
        sim.channel(3, "tx").start(tx);
        sim.run_until_idle(16);

        assert_eq!(pool.read_bus(data), Some(1));
        assert_eq!(pool.read_bus(data.word(1)), Some(2));
        assert_eq!(sim.fifo_len(fifo), 0);
    }

    #[test]
    fn test_control_block_can_start_another_channel() {
        let (sim, pool) = setup();
        let target = write_cb(
            &pool,
            ControlBlock::copy(
                (TransferInfo::INTEN | TransferInfo::SRC_IGNORE).bits(),
                BusAddr::null(),
                REGS,
                4,
            ),
        );
        let irq = sim.channel(3, "irq");

        let kick_cs = write_cb(
            &pool,
            ControlBlock::copy(0, BusAddr::null(), irq.register_bus(DmaReg::Cs), 4)
                .with_pad(DmaCs::ACTIVE.bits(), 0),
        );
        let mut kick_addr = ControlBlock::copy(0, BusAddr::null(), irq.register_bus(DmaReg::ConblkAd), 4)
            .with_pad(target.raw(), 0);
        kick_addr.nextconbk = kick_cs.raw();
        let kick_addr = write_cb(&pool, kick_addr);
        for cb in [kick_addr, kick_cs] {
            pool.write_bus(cb.word(word::SOURCE_AD), cb.word(word::PAD0).raw());
        }

        sim.channel(0, "data").start(kick_addr);
        sim.run_until_idle(16);

        assert_eq!(sim.trace_for(3), alloc::vec![target]);
        assert!(sim.irq_pending(3));
        assert_eq!(irq.read(DmaReg::ConblkAd), 0);
    }
}
