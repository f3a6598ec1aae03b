//! # Command Blocks
//!
//! A [`DmaLink`] owns one control block in a [`DmaPool`]. The block is freed
//! when the link is dropped; its bus address is fixed until then.

use alloc::sync::Arc;
use core::fmt;

use dmachain_hal::cb::{self, ControlBlock, CB_WORDS};
use dmachain_hal::{fence, BlockHandle, BusAddr, DmaPool};

use crate::error::{Error, Result};
use crate::types::FragmentId;

/// One pooled, hardware-visible control block
pub struct DmaLink {
    handle: BlockHandle,
    bus: BusAddr,
    desc: &'static str,
    pool: Arc<DmaPool>,
    fragment: FragmentId,
}

impl DmaLink {
    /// Allocate a zeroed block
    pub fn allocate(pool: &Arc<DmaPool>, desc: &'static str) -> Result<Self> {
        let handle = pool.allocate()?;
        Ok(Self {
            handle,
            bus: pool.bus_addr(handle),
            desc,
            pool: Arc::clone(pool),
            fragment: FragmentId::UNOWNED,
        })
    }

    /// Allocate a block and fill it with `block`
    pub fn with_block(pool: &Arc<DmaPool>, desc: &'static str, block: ControlBlock) -> Result<Self> {
        let link = Self::allocate(pool, desc)?;
        pool.write_block(link.handle, &block.to_words())?;
        Ok(link)
    }

    /// Bus address of the block
    #[inline]
    pub fn bus(&self) -> BusAddr {
        self.bus
    }

    /// Bus address of one word of the block
    #[inline]
    pub fn word_bus(&self, word: usize) -> BusAddr {
        self.bus.word(word)
    }

    /// Description used in dumps
    pub fn desc(&self) -> &'static str {
        self.desc
    }

    /// Block size in bytes
    pub fn size(&self) -> u32 {
        self.pool.block_size()
    }

    /// Owning fragment
    pub fn fragment(&self) -> FragmentId {
        self.fragment
    }

    pub(crate) fn set_fragment(&mut self, fragment: FragmentId) {
        self.fragment = fragment;
    }

    /// Read one word
    pub fn read(&self, word: usize) -> Result<u32> {
        Ok(self.pool.read_word(self.handle, word)?)
    }

    /// Write one word
    pub fn write(&self, word: usize, value: u32) -> Result<()> {
        Ok(self.pool.write_word(self.handle, word, value)?)
    }

    /// Current link target
    pub fn next(&self) -> Result<BusAddr> {
        let word = self.pool.link_word().ok_or(Error::MergeFailure)?;
        self.read(word).map(BusAddr::new)
    }

    /// Point this block at `next` and make the write visible to the DMA
    /// controller before returning
    pub fn link_to(&self, next: BusAddr) -> Result<()> {
        let word = self.pool.link_word().ok_or(Error::MergeFailure)?;
        self.write(word, next.raw())?;
        fence::dma_write_barrier();
        Ok(())
    }

    /// End the chain at this block
    pub fn terminate(&self) -> Result<()> {
        self.link_to(BusAddr::null())
    }

    /// Decode the block as a control block
    pub fn control_block(&self) -> Result<ControlBlock> {
        let mut words = [0u32; CB_WORDS];
        self.pool.read_block(self.handle, &mut words)?;
        Ok(ControlBlock::from_words(&words))
    }

    /// Log the block at debug level
    pub fn dump(&self, prefix: &str) {
        match self.control_block() {
            Ok(block) => log::debug!(
                "{}{} {}: ti=0x{:08x} src=0x{:08x} dst=0x{:08x} len={} next=0x{:08x} pad=[0x{:08x}, 0x{:08x}]",
                prefix,
                self.bus,
                self.desc,
                block.ti,
                block.source_ad,
                block.dest_ad,
                block.txfr_len,
                block.nextconbk,
                block.pad[0],
                block.pad[1],
            ),
            Err(err) => log::debug!("{}{} {}: unreadable ({})", prefix, self.bus, self.desc, err),
        }
    }
}

impl Drop for DmaLink {
    fn drop(&mut self) {
        if let Err(err) = self.pool.free(self.handle) {
            log::error!("dma link {} ({}): free failed: {}", self.bus, self.desc, err);
        }
    }
}

impl fmt::Debug for DmaLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaLink")
            .field("bus", &self.bus)
            .field("desc", &self.desc)
            .field("fragment", &self.fragment)
            .finish()
    }
}

/// Point a block's source at its own first payload word
pub fn source_from_payload(link: &DmaLink) -> Result<()> {
    link.write(cb::word::SOURCE_AD, link.word_bus(cb::word::PAD0).raw())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmachain_hal::PoolConfig;

    fn pool() -> Arc<DmaPool> {
        Arc::new(DmaPool::new(PoolConfig::control_blocks(BusAddr::new(0xC000_0000), 4)).unwrap())
    }

    #[test]
    fn test_drop_frees_block() {
        let pool = pool();
        {
            let _link = DmaLink::allocate(&pool, "scratch").unwrap();
            assert_eq!(pool.used_count(), 1);
        }
        assert_eq!(pool.used_count(), 0);
    }

    #[test]
    fn test_link_to_writes_next_word() {
        let pool = pool();
        let a = DmaLink::allocate(&pool, "a").unwrap();
        let b = DmaLink::allocate(&pool, "b").unwrap();
        a.link_to(b.bus()).unwrap();
        assert_eq!(a.next().unwrap(), b.bus());
        assert_eq!(a.read(cb::word::NEXTCONBK).unwrap(), b.bus().raw());
        a.terminate().unwrap();
        assert!(a.next().unwrap().is_null());
    }

    #[test]
    fn test_payload_source() {
        let pool = pool();
        let link = DmaLink::with_block(
            &pool,
            "payload",
            ControlBlock::copy(0, BusAddr::null(), BusAddr::new(0x7E20_0000), 4).with_pad(9, 0),
        )
        .unwrap();
        source_from_payload(&link).unwrap();
        let block = link.control_block().unwrap();
        assert_eq!(block.source_ad, link.bus().raw() + 24);
        assert_eq!(block.pad[0], 9);
    }
}
