//! Per-context sector buffering.
//!
//! Every operation context owns exactly one sector-sized buffer tagged with
//! the absolute sector number it holds. Repeated accesses to the same
//! sector cost nothing; writes go straight through to the device. Higher
//! layers mutate the buffer in place between [`SectorCache::load`] and
//! [`SectorCache::commit`].

use alloc::vec;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};
use spin::Mutex;

use crate::device::BlockDevice;
use crate::{Error, Result};

/// Tag value meaning "buffer holds nothing".
pub(crate) const NO_SECTOR: u32 = u32::MAX;

pub struct SectorCache {
    data: Vec<u8>,
    tag: u32,
}

impl SectorCache {
    pub(crate) fn new(sector_size: usize) -> Self {
        Self {
            data: vec![0u8; sector_size],
            tag: NO_SECTOR,
        }
    }

    /// Make the buffer hold `sector`; no device access when the tag already
    /// matches. A failed read leaves the buffer invalidated.
    pub(crate) fn load(&mut self, device: &dyn BlockDevice, sector: u32) -> Result<()> {
        if self.tag == sector {
            return Ok(());
        }
        let size = self.data.len();
        match device.read_blocks(&mut self.data, sector as usize * size, 1) {
            Ok(()) => {
                self.tag = sector;
                Ok(())
            }
            Err(err) => {
                self.tag = NO_SECTOR;
                Err(Error::from(err))
            }
        }
    }

    /// Write the buffer through to the device as `sector` and retag.
    pub(crate) fn commit(&mut self, device: &dyn BlockDevice, sector: u32) -> Result<()> {
        let size = self.data.len();
        match device.write_blocks(&self.data, sector as usize * size, 1) {
            Ok(()) => {
                self.tag = sector;
                Ok(())
            }
            Err(err) => {
                self.tag = NO_SECTOR;
                Err(Error::from(err))
            }
        }
    }

    pub(crate) fn invalidate(&mut self) {
        self.tag = NO_SECTOR;
    }

    /// Drop the tag when a burst transfer touched the buffered sector
    /// behind the cache's back.
    pub(crate) fn note_burst(&mut self, first_sector: u32, count: u32) {
        if self.tag != NO_SECTOR && self.tag >= first_sector && self.tag < first_sector + count {
            self.tag = NO_SECTOR;
        }
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Fixed pool of operation contexts, one sector buffer each. Acquisition
/// blocks while the pool is drained; a pool of one serializes every
/// operation on the volume.
pub(crate) struct ContextPool {
    free: Mutex<Vec<SectorCache>>,
}

impl ContextPool {
    pub(crate) fn new(contexts: usize, sector_size: usize) -> Self {
        let contexts = contexts.max(1);
        let mut free = Vec::with_capacity(contexts);
        for _ in 0..contexts {
            free.push(SectorCache::new(sector_size));
        }
        Self {
            free: Mutex::new(free),
        }
    }

    pub(crate) fn acquire(&self) -> Context<'_> {
        loop {
            if let Some(mut cache) = self.free.lock().pop() {
                // The tag must not survive between operations: another
                // context may have rewritten the buffered sector since.
                cache.invalidate();
                return Context {
                    pool: self,
                    cache: Some(cache),
                };
            }
            core::hint::spin_loop();
        }
    }

    fn release(&self, cache: SectorCache) {
        self.free.lock().push(cache);
    }
}

/// Pool loan; the buffer returns to the pool on drop.
pub(crate) struct Context<'a> {
    pool: &'a ContextPool,
    cache: Option<SectorCache>,
}

impl Deref for Context<'_> {
    type Target = SectorCache;

    fn deref(&self) -> &SectorCache {
        self.cache.as_ref().unwrap()
    }
}

impl DerefMut for Context<'_> {
    fn deref_mut(&mut self) -> &mut SectorCache {
        self.cache.as_mut().unwrap()
    }
}

impl Drop for Context<'_> {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.take() {
            self.pool.release(cache);
        }
    }
}
