//! # Fragments
//!
//! A fragment is a small, prebuilt chain of control blocks plus the
//! transforms that adapt it to one use. Fragments are built once by a cache
//! factory and reused many times; merging them into an operation only
//! rewrites link words.

use alloc::vec::Vec;
use core::fmt;

use dmachain_hal::BusAddr;

use crate::error::{Error, Result};
use crate::link::DmaLink;
use crate::transform::Transform;
use crate::types::{CacheId, FragmentId};

/// Prebuilt control-block chain with its transforms
pub struct Fragment {
    id: FragmentId,
    cache: Option<CacheId>,
    desc: &'static str,
    links: Vec<DmaLink>,
    transforms: Vec<Transform>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl Fragment {
    /// Create an empty, unowned fragment
    pub fn new(desc: &'static str) -> Self {
        Self {
            id: FragmentId::UNOWNED,
            cache: None,
            desc,
            links: Vec::new(),
            transforms: Vec::new(),
            head: None,
            tail: None,
        }
    }

    /// Append a block, returning its index
    pub fn push_link(&mut self, mut link: DmaLink) -> usize {
        link.set_fragment(self.id);
        self.links.push(link);
        self.links.len() - 1
    }

    /// Link block `from` to block `to`
    pub fn chain(&mut self, from: usize, to: usize) -> Result<()> {
        let target = self.link(to)?.bus();
        self.link(from)?.link_to(target)
    }

    /// Link every block to the next one, in order
    pub fn chain_all(&mut self) -> Result<()> {
        for index in 1..self.links.len() {
            self.chain(index - 1, index)?;
        }
        Ok(())
    }

    /// Attach a transform
    pub fn add_transform(&mut self, transform: Transform) {
        self.transforms.push(transform);
    }

    /// Choose the block the chain enters through
    pub fn set_head(&mut self, index: usize) -> Result<()> {
        self.link(index)?;
        self.head = Some(index);
        Ok(())
    }

    /// Choose the block whose link word continues the chain
    pub fn set_tail(&mut self, index: usize) -> Result<()> {
        self.link(index)?;
        self.tail = Some(index);
        Ok(())
    }

    /// Default head/tail to the first/last block when unset
    pub fn set_default_links(&mut self) {
        if self.links.is_empty() {
            return;
        }
        if self.head.is_none() {
            self.head = Some(0);
        }
        if self.tail.is_none() {
            self.tail = Some(self.links.len() - 1);
        }
    }

    /// Block by index
    pub fn link(&self, index: usize) -> Result<&DmaLink> {
        self.links.get(index).ok_or(Error::InvalidParameter)
    }

    /// All blocks
    pub fn links(&self) -> &[DmaLink] {
        &self.links
    }

    /// All transforms, in attachment order
    pub fn transforms(&self) -> &[Transform] {
        &self.transforms
    }

    /// Head block index
    pub fn head(&self) -> Option<usize> {
        self.head
    }

    /// Tail block index
    pub fn tail(&self) -> Option<usize> {
        self.tail
    }

    /// Head block
    pub fn head_link(&self) -> Option<&DmaLink> {
        self.head.and_then(|index| self.links.get(index))
    }

    /// Tail block
    pub fn tail_link(&self) -> Option<&DmaLink> {
        self.tail.and_then(|index| self.links.get(index))
    }

    /// Fragment id within its cache
    pub fn id(&self) -> FragmentId {
        self.id
    }

    /// Owning cache
    pub fn cache(&self) -> Option<CacheId> {
        self.cache
    }

    /// Description
    pub fn desc(&self) -> &'static str {
        self.desc
    }

    /// Total control-block bytes
    pub fn size(&self) -> u32 {
        self.links.iter().map(|link| link.size()).sum()
    }

    pub(crate) fn adopt(&mut self, cache: CacheId, id: FragmentId) {
        self.cache = Some(cache);
        self.id = id;
        for link in &mut self.links {
            link.set_fragment(id);
        }
    }

    /// Cut the tail's outgoing link so the next merge starts clean
    pub(crate) fn detach(&self) -> Result<()> {
        match self.tail_link() {
            Some(tail) => tail.terminate(),
            None => Ok(()),
        }
    }

    /// Bus addresses from head to tail, following the link words
    pub fn walk(&self) -> Result<Vec<BusAddr>> {
        let (Some(head), Some(tail)) = (self.head_link(), self.tail_link()) else {
            return Ok(Vec::new());
        };
        let mut chain = Vec::new();
        let mut current = head.bus();
        for _ in 0..self.links.len() {
            chain.push(current);
            if current == tail.bus() {
                return Ok(chain);
            }
            current = self
                .links
                .iter()
                .find(|link| link.bus() == current)
                .ok_or(Error::MergeFailure)?
                .next()?;
        }
        Err(Error::MergeFailure)
    }

    /// Log the fragment at debug level
    pub fn dump(&self) {
        log::debug!(
            "fragment {} ({:?} #{}): {} links, {} transforms, head={:?} tail={:?}",
            self.desc,
            self.cache,
            self.id.raw(),
            self.links.len(),
            self.transforms.len(),
            self.head,
            self.tail,
        );
        for link in &self.links {
            link.dump("  ");
        }
        for transform in &self.transforms {
            log::debug!(
                "  transform {} {:?}: src={:?} dst={:?} extra={:?}",
                transform.name,
                transform.stage,
                transform.src,
                transform.dst,
                transform.extra,
            );
        }
    }
}

impl fmt::Debug for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fragment")
            .field("desc", &self.desc)
            .field("id", &self.id)
            .field("cache", &self.cache)
            .field("links", &self.links.len())
            .field("transforms", &self.transforms.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{Operand, Stage};
    use alloc::sync::Arc;
    use dmachain_hal::{DmaPool, PoolConfig};

    fn pool() -> Arc<DmaPool> {
        Arc::new(DmaPool::new(PoolConfig::control_blocks(BusAddr::new(0xC000_0000), 8)).unwrap())
    }

    #[test]
    fn test_default_links() {
        let pool = pool();
        let mut fragment = Fragment::new("three");
        for _ in 0..3 {
            fragment.push_link(DmaLink::allocate(&pool, "cb").unwrap());
        }
        fragment.set_default_links();
        assert_eq!(fragment.head(), Some(0));
        assert_eq!(fragment.tail(), Some(2));

        let mut explicit = Fragment::new("explicit");
        explicit.push_link(DmaLink::allocate(&pool, "a").unwrap());
        explicit.push_link(DmaLink::allocate(&pool, "b").unwrap());
        explicit.set_tail(0).unwrap();
        explicit.set_default_links();
        assert_eq!(explicit.head(), Some(0));
        assert_eq!(explicit.tail(), Some(0));
        assert_eq!(explicit.set_head(5), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_walk_follows_links() {
        let pool = pool();
        let mut fragment = Fragment::new("walk");
        for _ in 0..3 {
            fragment.push_link(DmaLink::allocate(&pool, "cb").unwrap());
        }
        fragment.chain(0, 2).unwrap();
        fragment.set_head(0).unwrap();
        fragment.set_tail(2).unwrap();
        fragment.add_transform(Transform::write_u32(Stage::Pre, Operand::word(1, 0), 1));

        let buses = fragment.walk().unwrap();
        assert_eq!(buses, alloc::vec![fragment.links()[0].bus(), fragment.links()[2].bus()]);
        assert_eq!(fragment.size(), 96);
    }

    #[test]
    fn test_detach_clears_tail_link() {
        let pool = pool();
        let mut fragment = Fragment::new("tail");
        fragment.push_link(DmaLink::allocate(&pool, "cb").unwrap());
        fragment.set_default_links();
        fragment.links()[0].link_to(BusAddr::new(0xC000_1000)).unwrap();
        fragment.detach().unwrap();
        assert!(fragment.links()[0].next().unwrap().is_null());
    }
}
