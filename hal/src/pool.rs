//! # DMA Block Pool
//!
//! Fixed-size, bus-addressable blocks for control blocks and small data
//! buffers. A block's bus address never changes while it is allocated, which
//! is what lets other blocks link to it.
//!
//! Words are stored as `AtomicU32` so the CPU side can patch a block through a
//! shared reference while the DMA controller reads the same memory.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::addr::BusAddr;
use crate::cb;
use crate::error::{HalError, Result};
use crate::irq::IrqMutex;

// =============================================================================
// POOL CONFIGURATION
// =============================================================================

/// DMA pool configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Pool name for debugging
    pub name: &'static str,
    /// Bus address of block 0
    pub bus_base: BusAddr,
    /// Block size in bytes (multiple of 4)
    pub block_size: u32,
    /// Number of blocks
    pub num_blocks: u32,
    /// Alignment of every block's bus address
    pub alignment: u32,
    /// Word index holding the next-block link, if blocks are chainable
    pub link_word: Option<usize>,
}

impl PoolConfig {
    /// Pool of BCM2835 control blocks (32 bytes, 32-byte aligned)
    pub const fn control_blocks(bus_base: BusAddr, count: u32) -> Self {
        Self {
            name: "cb_pool",
            bus_base,
            block_size: cb::CB_SIZE,
            num_blocks: count,
            alignment: cb::CB_ALIGN,
            link_word: Some(cb::word::NEXTCONBK),
        }
    }

    /// Pool of word-aligned data buffers
    pub const fn data_buffers(bus_base: BusAddr, block_size: u32, count: u32) -> Self {
        Self {
            name: "data_pool",
            bus_base,
            block_size,
            num_blocks: count,
            alignment: 4,
            link_word: None,
        }
    }

    /// Override the pool name
    pub const fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Distance in bytes between consecutive blocks
    pub const fn stride(&self) -> u32 {
        (self.block_size + self.alignment - 1) & !(self.alignment - 1)
    }

    fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size % 4 != 0 || self.num_blocks == 0 {
            return Err(HalError::InvalidConfig);
        }
        if !self.alignment.is_power_of_two() || self.alignment < 4 {
            return Err(HalError::Misaligned);
        }
        if !self.bus_base.is_aligned(self.alignment) {
            return Err(HalError::Misaligned);
        }
        if let Some(word) = self.link_word {
            if word >= (self.block_size / 4) as usize {
                return Err(HalError::InvalidConfig);
            }
        }
        self.stride()
            .checked_mul(self.num_blocks)
            .and_then(|len| self.bus_base.raw().checked_add(len))
            .map(|_| ())
            .ok_or(HalError::InvalidConfig)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        // L2-uncached alias of SDRAM on the BCM2835
        Self::control_blocks(BusAddr::new(0xC000_0000), 256)
    }
}

// =============================================================================
// BLOCK HANDLE
// =============================================================================

/// Index of an allocated block inside its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct BlockHandle(u32);

impl BlockHandle {
    /// Block index within the pool
    #[inline]
    pub const fn index(self) -> u32 {
        self.0
    }
}

// =============================================================================
// STORAGE
// =============================================================================

enum Storage {
    /// Heap memory with synthetic bus addresses (simulation, tests)
    Owned(Box<[AtomicU32]>),
    /// Coherent memory the DMA controller sees at `bus_base`
    Mapped(&'static [AtomicU32]),
}

impl Storage {
    fn words(&self) -> &[AtomicU32] {
        match self {
            Self::Owned(words) => &words[..],
            Self::Mapped(words) => &words[..],
        }
    }
}

// =============================================================================
// DMA POOL
// =============================================================================

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total allocations
    pub allocs: u64,
    /// Total frees
    pub frees: u64,
    /// High water mark
    pub peak_used: u32,
}

struct PoolState {
    in_use: Vec<bool>,
    free_stack: Vec<u32>,
    stats: PoolStats,
}

/// Fixed-size pool of bus-addressable DMA blocks
pub struct DmaPool {
    config: PoolConfig,
    stride_words: usize,
    storage: Storage,
    state: IrqMutex<PoolState>,
}

impl DmaPool {
    /// Create a pool backed by heap memory.
    ///
    /// Bus addresses are synthetic: only a simulator resolving them through
    /// [`DmaPool::read_bus`] / [`DmaPool::write_bus`] can follow them.
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let total = (config.stride() / 4) as usize * config.num_blocks as usize;
        let words: Box<[AtomicU32]> = (0..total).map(|_| AtomicU32::new(0)).collect();
        Ok(Self::with_storage(config, Storage::Owned(words)))
    }

    /// Create a pool over coherent memory mapped at `config.bus_base`.
    ///
    /// # Safety
    ///
    /// `words` must be DMA-coherent memory that the controller sees at
    /// `config.bus_base`, used by nothing else for the program's lifetime.
    pub unsafe fn from_coherent(config: PoolConfig, words: &'static [AtomicU32]) -> Result<Self> {
        config.validate()?;
        let needed = (config.stride() / 4) as usize * config.num_blocks as usize;
        if words.len() < needed {
            return Err(HalError::InvalidConfig);
        }
        Ok(Self::with_storage(config, Storage::Mapped(words)))
    }

    fn with_storage(config: PoolConfig, storage: Storage) -> Self {
        let count = config.num_blocks as usize;
        Self {
            stride_words: (config.stride() / 4) as usize,
            storage,
            state: IrqMutex::new(PoolState {
                in_use: alloc::vec![false; count],
                // Reversed so block 0 is handed out first
                free_stack: (0..config.num_blocks).rev().collect(),
                stats: PoolStats::default(),
            }),
            config,
        }
    }

    /// Allocate a zeroed block
    pub fn allocate(&self) -> Result<BlockHandle> {
        let index = {
            let mut state = self.state.lock();
            let index = state.free_stack.pop().ok_or(HalError::PoolExhausted)?;
            state.in_use[index as usize] = true;
            state.stats.allocs += 1;
            let used = self.config.num_blocks - state.free_stack.len() as u32;
            state.stats.peak_used = state.stats.peak_used.max(used);
            index
        };

        let handle = BlockHandle(index);
        for word in self.block_words(handle)? {
            word.store(0, Ordering::Relaxed);
        }
        Ok(handle)
    }

    /// Free a block back to the pool
    pub fn free(&self, handle: BlockHandle) -> Result<()> {
        if handle.0 >= self.config.num_blocks {
            return Err(HalError::InvalidBlock);
        }

        let mut state = self.state.lock();
        if !state.in_use[handle.0 as usize] {
            return Err(HalError::DoubleFree);
        }
        state.in_use[handle.0 as usize] = false;
        state.free_stack.push(handle.0);
        state.stats.frees += 1;
        Ok(())
    }

    /// Bus address of a block
    #[inline]
    pub fn bus_addr(&self, handle: BlockHandle) -> BusAddr {
        self.config.bus_base + handle.0 * self.config.stride()
    }

    /// Read one word of a block
    pub fn read_word(&self, handle: BlockHandle, word: usize) -> Result<u32> {
        Ok(self.word_slot(handle, word)?.load(Ordering::Acquire))
    }

    /// Write one word of a block
    pub fn write_word(&self, handle: BlockHandle, word: usize, value: u32) -> Result<()> {
        self.word_slot(handle, word)?.store(value, Ordering::Release);
        Ok(())
    }

    /// Write consecutive words starting at word 0
    pub fn write_block(&self, handle: BlockHandle, words: &[u32]) -> Result<()> {
        let slots = self.block_words(handle)?;
        if words.len() > slots.len() {
            return Err(HalError::OutOfBounds);
        }
        for (slot, value) in slots.iter().zip(words) {
            slot.store(*value, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Read the whole block into `out`, returning the number of words copied
    pub fn read_block(&self, handle: BlockHandle, out: &mut [u32]) -> Result<usize> {
        let slots = self.block_words(handle)?;
        let count = slots.len().min(out.len());
        for (dst, slot) in out.iter_mut().zip(slots) {
            *dst = slot.load(Ordering::Relaxed);
        }
        Ok(count)
    }

    /// Check whether a bus address falls inside this pool
    pub fn contains(&self, bus: BusAddr) -> bool {
        self.locate(bus).is_some()
    }

    /// Read a word by bus address, as the DMA controller would
    pub fn read_bus(&self, bus: BusAddr) -> Option<u32> {
        let index = self.locate(bus)?;
        self.storage.words().get(index).map(|w| w.load(Ordering::Acquire))
    }

    /// Write a word by bus address, as the DMA controller would
    pub fn write_bus(&self, bus: BusAddr, value: u32) -> bool {
        match self.locate(bus).and_then(|index| self.storage.words().get(index)) {
            Some(word) => {
                word.store(value, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Block size in bytes
    pub fn block_size(&self) -> u32 {
        self.config.block_size
    }

    /// Words per block
    pub fn words_per_block(&self) -> usize {
        (self.config.block_size / 4) as usize
    }

    /// Word index of the next-block link, if blocks are chainable
    pub fn link_word(&self) -> Option<usize> {
        self.config.link_word
    }

    /// Get pool name
    pub fn name(&self) -> &'static str {
        self.config.name
    }

    /// Get pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        self.state.lock().stats
    }

    /// Get number of free blocks
    pub fn free_count(&self) -> u32 {
        self.state.lock().free_stack.len() as u32
    }

    /// Get number of used blocks
    pub fn used_count(&self) -> u32 {
        self.config.num_blocks - self.free_count()
    }

    fn block_words(&self, handle: BlockHandle) -> Result<&[AtomicU32]> {
        if handle.0 >= self.config.num_blocks {
            return Err(HalError::InvalidBlock);
        }
        let start = handle.0 as usize * self.stride_words;
        self.storage
            .words()
            .get(start..start + self.words_per_block())
            .ok_or(HalError::InvalidBlock)
    }

    fn word_slot(&self, handle: BlockHandle, word: usize) -> Result<&AtomicU32> {
        if word >= self.words_per_block() {
            return Err(HalError::OutOfBounds);
        }
        self.block_words(handle).map(|words| &words[word])
    }

    fn locate(&self, bus: BusAddr) -> Option<usize> {
        if bus < self.config.bus_base || !bus.is_aligned(4) {
            return None;
        }
        let offset = bus - self.config.bus_base;
        let stride = self.config.stride();
        let block = offset / stride;
        let within = offset % stride;
        if block >= self.config.num_blocks || within >= self.config.block_size {
            return None;
        }
        Some(block as usize * self.stride_words + (within / 4) as usize)
    }
}

impl fmt::Debug for DmaPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaPool")
            .field("name", &self.config.name)
            .field("bus_base", &self.config.bus_base)
            .field("block_size", &self.config.block_size)
            .field("num_blocks", &self.config.num_blocks)
            .field("used", &self.used_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cb_pool(count: u32) -> DmaPool {
        DmaPool::new(PoolConfig::control_blocks(BusAddr::new(0xC000_0000), count)).unwrap()
    }

    #[test]
    fn test_allocate_free_cycle() {
        let pool = cb_pool(2);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.allocate(), Err(HalError::PoolExhausted));

        pool.free(a).unwrap();
        assert_eq!(pool.free(a), Err(HalError::DoubleFree));
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.stats().peak_used, 2);
    }

    #[test]
    fn test_bus_addresses_are_stable_and_resolvable() {
        let pool = cb_pool(4);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_eq!(pool.bus_addr(a), BusAddr::new(0xC000_0000));
        assert_eq!(pool.bus_addr(b), BusAddr::new(0xC000_0020));

        pool.write_word(b, 5, 0xDEAD_BEEF).unwrap();
        assert_eq!(pool.read_bus(pool.bus_addr(b).word(5)), Some(0xDEAD_BEEF));
        assert!(pool.write_bus(pool.bus_addr(a).word(1), 7));
        assert_eq!(pool.read_word(a, 1), Ok(7));
        assert!(!pool.contains(BusAddr::new(0xC000_0080)));
    }

    #[test]
    fn test_allocate_zeroes_reused_block() {
        let pool = cb_pool(1);
        let a = pool.allocate().unwrap();
        pool.write_block(a, &[1, 2, 3]).unwrap();
        pool.free(a).unwrap();

        let again = pool.allocate().unwrap();
        let mut words = [0xFFFF_FFFF; 8];
        assert_eq!(pool.read_block(again, &mut words), Ok(8));
        assert_eq!(words, [0; 8]);
    }

    #[test]
    fn test_word_bounds() {
        let pool = cb_pool(1);
        let a = pool.allocate().unwrap();
        assert_eq!(pool.read_word(a, 8), Err(HalError::OutOfBounds));
        assert_eq!(pool.write_block(a, &[0; 9]), Err(HalError::OutOfBounds));
    }

    #[test]
    fn test_config_validation() {
        let unaligned = PoolConfig::control_blocks(BusAddr::new(0xC000_0010), 4);
        assert_eq!(DmaPool::new(unaligned).err(), Some(HalError::Misaligned));

        let odd = PoolConfig::data_buffers(BusAddr::new(0x1000), 6, 4);
        assert_eq!(DmaPool::new(odd).err(), Some(HalError::InvalidConfig));

        let padded = PoolConfig::data_buffers(BusAddr::new(0x1000), 20, 2);
        assert_eq!(padded.stride(), 20);
        let pool = DmaPool::new(padded.with_name("rx")).unwrap();
        assert_eq!(pool.name(), "rx");
        assert_eq!(pool.link_word(), None);
    }
}
