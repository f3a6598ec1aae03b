//! # Fragment Caches
//!
//! A cache hands out prebuilt fragments of one kind and takes them back after
//! use. Fetch and return are O(1) under the cache lock; synthesis of new
//! fragments (which allocates control blocks) happens outside it.
//!
//! Invariant: `idle + active == allocated`, checked in tests and reported by
//! [`CacheStats`].

use alloc::boxed::Box;
use alloc::collections::{BTreeSet, VecDeque};
use alloc::vec::Vec;
use core::fmt;

use dmachain_hal::IrqMutex;

use crate::error::{Error, Fault, Result};
use crate::fragment::Fragment;
use crate::types::{AllocContext, CacheId, FragmentId};

/// Builds one fresh fragment of a cache's kind
pub type FragmentFactory = Box<dyn Fn(AllocContext) -> Result<Fragment> + Send + Sync>;

// =============================================================================
// STATISTICS
// =============================================================================

/// Snapshot of a cache's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Cache name
    pub name: &'static str,
    /// Fragments waiting in the idle list
    pub idle: usize,
    /// Fragments on loan
    pub active: usize,
    /// Live fragments (idle + active)
    pub allocated: usize,
    /// Fragments synthesized in blocking context
    pub allocated_blocking: u64,
    /// Total fetches
    pub fetched: u64,
    /// Fragments destroyed by shrinking
    pub removed: u64,
}

impl CacheStats {
    /// Whether the counters agree with each other
    pub fn is_consistent(&self) -> bool {
        self.idle + self.active == self.allocated
    }
}

// =============================================================================
// FRAGMENT CACHE
// =============================================================================

#[derive(Default)]
struct CacheInner {
    idle: VecDeque<Fragment>,
    active: BTreeSet<FragmentId>,
    allocated: usize,
    allocated_blocking: u64,
    fetched: u64,
    removed: u64,
    next_serial: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Idle,
    Active,
}

/// Pool of reusable fragments of one kind
pub struct FragmentCache {
    id: CacheId,
    name: &'static str,
    factory: FragmentFactory,
    inner: IrqMutex<CacheInner>,
}

impl FragmentCache {
    /// Create an empty cache
    pub fn new(id: CacheId, name: &'static str, factory: FragmentFactory) -> Self {
        Self {
            id,
            name,
            factory,
            inner: IrqMutex::new(CacheInner::default()),
        }
    }

    /// Cache id
    pub fn id(&self) -> CacheId {
        self.id
    }

    /// Cache name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Take an idle fragment, synthesizing one if none is idle.
    ///
    /// In blocking context, a fetch that empties the idle list also adds one
    /// spare idle fragment so the next atomic fetch finds one ready.
    pub fn fetch(&self, alloc: AllocContext) -> Result<Fragment> {
        let (fragment, now_empty) = {
            let mut inner = self.inner.lock();
            inner.fetched += 1;
            let fragment = inner.idle.pop_front();
            if let Some(fragment) = &fragment {
                let id = fragment.id();
                inner.active.insert(id);
            }
            (fragment, inner.idle.is_empty())
        };

        let fragment = match fragment {
            Some(fragment) => fragment,
            None => self
                .synthesize(alloc, Placement::Active)?
                .ok_or(Error::AllocationFailure)?,
        };

        if alloc.may_block() && now_empty {
            if let Err(err) = self.synthesize(alloc, Placement::Idle) {
                log::warn!("cache {}: spare fragment not added: {}", self.name, err);
            }
        }
        Ok(fragment)
    }

    /// Give a fragment back.
    ///
    /// Returning a fragment this cache did not lend out is a
    /// [`Error::ConsistencyFault`]; the fragment is then dropped.
    pub fn give_back(&self, fragment: Fragment) -> Result<()> {
        match fragment.cache() {
            Some(id) if id == self.id => {}
            Some(_) => return Err(self.fault(&fragment, Fault::ForeignCache)),
            None => return Err(self.fault(&fragment, Fault::UnownedFragment)),
        }

        if let Err(err) = fragment.detach() {
            log::warn!("cache {}: cannot reset tail of {}: {}", self.name, fragment.desc(), err);
        }

        let mut inner = self.inner.lock();
        if !inner.active.remove(&fragment.id()) {
            drop(inner);
            return Err(self.fault(&fragment, Fault::NotActive));
        }
        inner.idle.push_back(fragment);
        Ok(())
    }

    /// Grow (`delta > 0`) or shrink (`delta < 0`) the idle list. Returns the
    /// number of live fragments afterwards.
    pub fn resize(&self, delta: isize) -> Result<usize> {
        if delta >= 0 {
            for _ in 0..delta {
                self.synthesize(AllocContext::Blocking, Placement::Idle)?;
            }
        } else {
            let mut doomed = Vec::new();
            {
                let mut inner = self.inner.lock();
                for _ in 0..delta.unsigned_abs() {
                    let Some(fragment) = inner.idle.pop_back() else {
                        break;
                    };
                    inner.allocated -= 1;
                    inner.removed += 1;
                    doomed.push(fragment);
                }
            }
            // Control blocks are freed here, outside the lock
            drop(doomed);
        }
        Ok(self.inner.lock().allocated)
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            name: self.name,
            idle: inner.idle.len(),
            active: inner.active.len(),
            allocated: inner.allocated,
            allocated_blocking: inner.allocated_blocking,
            fetched: inner.fetched,
            removed: inner.removed,
        }
    }

    /// Log the idle fragments at debug level
    pub fn dump(&self) {
        let inner = self.inner.lock();
        log::debug!(
            "cache {}: idle={} active={} allocated={}",
            self.name,
            inner.idle.len(),
            inner.active.len(),
            inner.allocated
        );
        for fragment in &inner.idle {
            fragment.dump();
        }
    }

    fn synthesize(&self, alloc: AllocContext, placement: Placement) -> Result<Option<Fragment>> {
        let mut fragment = (self.factory)(alloc).map_err(|err| {
            log::warn!("cache {}: fragment synthesis failed: {}", self.name, err);
            err
        })?;
        fragment.set_default_links();

        let mut inner = self.inner.lock();
        inner.next_serial = inner.next_serial.wrapping_add(1).max(1);
        let id = FragmentId::new(inner.next_serial);
        fragment.adopt(self.id, id);
        inner.allocated += 1;
        if alloc.may_block() {
            inner.allocated_blocking += 1;
        }
        match placement {
            Placement::Idle => {
                inner.idle.push_back(fragment);
                Ok(None)
            }
            Placement::Active => {
                inner.active.insert(id);
                Ok(Some(fragment))
            }
        }
    }

    fn fault(&self, fragment: &Fragment, fault: Fault) -> Error {
        log::error!(
            "cache {}: fragment {} #{} rejected: {}",
            self.name,
            fragment.desc(),
            fragment.id().raw(),
            fault
        );
        Error::ConsistencyFault(fault)
    }
}

impl Drop for FragmentCache {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if !inner.active.is_empty() {
            log::warn!(
                "cache {}: released with {} fragments still active",
                self.name,
                inner.active.len()
            );
        }
    }
}

impl fmt::Debug for FragmentCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentCache")
            .field("id", &self.id)
            .field("stats", &self.stats())
            .finish()
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// All caches of an engine instance, addressed by [`CacheId`]
#[derive(Debug, Default)]
pub struct FragmentCaches {
    caches: Vec<FragmentCache>,
}

impl FragmentCaches {
    /// Create an empty registry
    pub fn new() -> Self {
        Self { caches: Vec::new() }
    }

    /// Register a cache and prefill it with `initial` idle fragments
    pub fn register(
        &mut self,
        name: &'static str,
        initial: usize,
        factory: FragmentFactory,
    ) -> Result<CacheId> {
        let index = u16::try_from(self.caches.len()).map_err(|_| Error::InvalidParameter)?;
        let id = CacheId::new(index);
        let cache = FragmentCache::new(id, name, factory);
        cache.resize(initial as isize)?;
        log::debug!("cache {} registered with {} fragments", name, initial);
        self.caches.push(cache);
        Ok(id)
    }

    /// Cache by id
    pub fn get(&self, id: CacheId) -> Result<&FragmentCache> {
        self.caches
            .get(id.index())
            .ok_or(Error::ConsistencyFault(Fault::UnknownCache))
    }

    /// Fetch from cache `id`
    pub fn fetch(&self, id: CacheId, alloc: AllocContext) -> Result<Fragment> {
        self.get(id)?.fetch(alloc)
    }

    /// Return a fragment to the cache that owns it
    pub fn give_back(&self, fragment: Fragment) -> Result<()> {
        match fragment.cache() {
            Some(id) => self.get(id)?.give_back(fragment),
            None => {
                log::error!("fragment {} returned without an owning cache", fragment.desc());
                Err(Error::ConsistencyFault(Fault::UnownedFragment))
            }
        }
    }

    /// Counters of every cache
    pub fn stats(&self) -> Vec<CacheStats> {
        self.caches.iter().map(FragmentCache::stats).collect()
    }

    /// Iterate over the caches
    pub fn iter(&self) -> impl Iterator<Item = &FragmentCache> {
        self.caches.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::DmaLink;
    use alloc::sync::Arc;
    use dmachain_hal::{BusAddr, DmaPool, PoolConfig};

    fn pool(count: u32) -> Arc<DmaPool> {
        Arc::new(DmaPool::new(PoolConfig::control_blocks(BusAddr::new(0xC000_0000), count)).unwrap())
    }

    fn two_block_factory(pool: &Arc<DmaPool>) -> FragmentFactory {
        let pool = Arc::clone(pool);
        Box::new(move |_alloc| {
            let mut fragment = Fragment::new("pair");
            fragment.push_link(DmaLink::allocate(&pool, "first")?);
            fragment.push_link(DmaLink::allocate(&pool, "second")?);
            fragment.chain_all()?;
            Ok(fragment)
        })
    }

    fn cache(pool: &Arc<DmaPool>) -> FragmentCache {
        FragmentCache::new(CacheId::new(0), "pair", two_block_factory(pool))
    }

    #[test]
    fn test_fetch_return_keeps_counts_consistent() {
        let pool = pool(32);
        let cache = cache(&pool);
        cache.resize(2).unwrap();

        let a = cache.fetch(AllocContext::Atomic).unwrap();
        let b = cache.fetch(AllocContext::Atomic).unwrap();
        let stats = cache.stats();
        assert_eq!((stats.idle, stats.active, stats.allocated), (0, 2, 2));
        assert!(stats.is_consistent());

        cache.give_back(a).unwrap();
        cache.give_back(b).unwrap();
        let stats = cache.stats();
        assert_eq!((stats.idle, stats.active), (2, 0));
        assert_eq!(stats.fetched, 2);
        assert!(stats.is_consistent());
    }

    #[test]
    fn test_atomic_fetch_on_empty_cache_synthesizes() {
        let pool = pool(32);
        let cache = cache(&pool);
        let fragment = cache.fetch(AllocContext::Atomic).unwrap();
        assert_eq!(fragment.cache(), Some(CacheId::new(0)));
        assert_eq!(fragment.head(), Some(0));
        assert_eq!(fragment.tail(), Some(1));
        let stats = cache.stats();
        assert_eq!((stats.idle, stats.active, stats.allocated), (0, 1, 1));
        assert_eq!(stats.allocated_blocking, 0);
    }

    #[test]
    fn test_blocking_fetch_grows_spare() {
        let pool = pool(32);
        let cache = cache(&pool);
        cache.resize(1).unwrap();

        let _fragment = cache.fetch(AllocContext::Blocking).unwrap();
        let stats = cache.stats();
        assert_eq!((stats.idle, stats.active, stats.allocated), (1, 1, 2));
        assert!(stats.is_consistent());
    }

    #[test]
    fn test_second_return_is_fault() {
        let pool = pool(32);
        let caches = {
            let mut caches = FragmentCaches::new();
            caches.register("pair", 1, two_block_factory(&pool)).unwrap();
            caches
        };
        let id = CacheId::new(0);
        let fragment = caches.fetch(id, AllocContext::Atomic).unwrap();
        let serial = fragment.id();
        caches.give_back(fragment).unwrap();

        // A fragment whose loan record is gone looks like a second return
        let mut forged = caches.fetch(id, AllocContext::Atomic).unwrap();
        assert_eq!(forged.id(), serial);
        forged.adopt(id, FragmentId::new(999));
        assert_eq!(
            caches.give_back(forged),
            Err(Error::ConsistencyFault(Fault::NotActive))
        );
        assert!(caches.get(id).unwrap().stats().is_consistent());
    }

    #[test]
    fn test_unowned_fragment_is_rejected() {
        let pool = pool(4);
        let caches = FragmentCaches::new();
        let mut loose = Fragment::new("loose");
        loose.push_link(DmaLink::allocate(&pool, "cb").unwrap());
        assert_eq!(
            caches.give_back(loose),
            Err(Error::ConsistencyFault(Fault::UnownedFragment))
        );
        // The rejected fragment's blocks were dropped, not leaked
        assert_eq!(pool.used_count(), 0);
    }

    #[test]
    fn test_shrink_removes_idle_only() {
        let pool = pool(32);
        let cache = cache(&pool);
        cache.resize(3).unwrap();
        let held = cache.fetch(AllocContext::Atomic).unwrap();
        assert_eq!(cache.resize(-5).unwrap(), 1);
        let stats = cache.stats();
        assert_eq!((stats.idle, stats.active, stats.removed), (0, 1, 2));
        cache.give_back(held).unwrap();
        assert_eq!(pool.used_count(), 2);
    }

    #[test]
    fn test_synthesis_failure_propagates() {
        let pool = pool(1);
        let cache = cache(&pool);
        assert_eq!(cache.fetch(AllocContext::Atomic).err(), Some(Error::AllocationFailure));
        assert!(cache.stats().is_consistent());
    }
}
