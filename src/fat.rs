//! The file allocation table.
//!
//! A FAT entry is a 28-bit value in a 32-bit cell; the reserved high 4 bits
//! are preserved on every write. Entry N lives at byte offset N * 4 of the
//! table, so with 2^S-byte sectors one FAT sector carries 2^(S-2) entries
//! and a FAT32 entry never straddles a sector boundary.
//!
//! Every mutation of a FAT sector is written to the primary table first,
//! then to each mirror copy in increasing order, before the operation
//! advances. A crash mid-mirror leaves at least one intact copy and stale
//! FSInfo hints, which is the strongest guarantee the format itself offers.

use log::{debug, warn};
use zerocopy::little_endian::U32;
use zerocopy::FromBytes;

use crate::bpb::InfoSectorImage;
use crate::fs::{AllocState, Volume};
use crate::sector::SectorCache;
use crate::{Error, Result, BAD_CLUSTER, CLUSTER_MASK, END_OF_CLUSTER, FREE_CLUSTER};

/// Decoded state of one FAT entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FatEntry {
    Free,
    /// Cluster is used; value is the next cluster of its chain.
    Next(u32),
    EndOfChain,
    /// Bad cluster, or a reserved value that must never appear in a chain.
    Bad,
}

pub(crate) fn classify(raw: u32) -> FatEntry {
    match raw & CLUSTER_MASK {
        FREE_CLUSTER => FatEntry::Free,
        BAD_CLUSTER => FatEntry::Bad,
        value if value >= 0x0FFF_FFF8 => FatEntry::EndOfChain,
        value if (2..=0x0FFF_FFEF).contains(&value) => FatEntry::Next(value),
        _ => FatEntry::Bad,
    }
}

impl Volume {
    /// Raw 32-bit cell for `cluster`, read through the context buffer.
    pub(crate) fn fat_raw(&self, ctx: &mut SectorCache, cluster: u32) -> Result<u32> {
        let sector = self.geo.fat_sector(cluster);
        ctx.load(&*self.device, sector)?;
        let off = self.geo.fat_offset(cluster);
        let bytes = ctx.bytes();
        Ok(u32::from_le_bytes([
            bytes[off],
            bytes[off + 1],
            bytes[off + 2],
            bytes[off + 3],
        ]))
    }

    pub(crate) fn fat_entry(&self, ctx: &mut SectorCache, cluster: u32) -> Result<FatEntry> {
        Ok(classify(self.fat_raw(ctx, cluster)?))
    }

    /// Follow the chain one step. `Ok(None)` at the end of the chain; a
    /// free or bad entry inside a chain is a broken volume.
    pub(crate) fn next_cluster(
        &self,
        ctx: &mut SectorCache,
        cluster: u32,
    ) -> Result<Option<u32>> {
        match self.fat_entry(ctx, cluster)? {
            FatEntry::Next(next) => Ok(Some(next)),
            FatEntry::EndOfChain => Ok(None),
            _ => Err(Error::Invalid),
        }
    }

    /// Store `value` in the entry for `cluster`, keeping the reserved high
    /// bits, and mirror the sector into every FAT copy.
    pub(crate) fn set_fat_entry(
        &self,
        ctx: &mut SectorCache,
        cluster: u32,
        value: u32,
    ) -> Result<()> {
        let sector = self.geo.fat_sector(cluster);
        ctx.load(&*self.device, sector)?;
        let off = self.geo.fat_offset(cluster);
        let bytes = ctx.bytes_mut();
        let old = u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]]);
        let merged = (old & !CLUSTER_MASK) | (value & CLUSTER_MASK);
        bytes[off..off + 4].copy_from_slice(&merged.to_le_bytes());
        self.update_table(ctx, sector)
    }

    /// Write the buffered FAT sector to the primary table and each mirror.
    fn update_table(&self, ctx: &mut SectorCache, primary: u32) -> Result<()> {
        let size = self.geo.sector_size;
        for copy in 0..self.geo.fat_copies {
            let sector = primary + copy * self.geo.fat_size;
            if let Err(err) = self
                .device
                .write_blocks(ctx.bytes(), sector as usize * size, 1)
            {
                ctx.invalidate();
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Claim one free cluster, link it after `prev` (0 starts a new chain)
    /// and refresh the FSInfo hints. The scan starts right after the last
    /// allocated cluster and wraps once; a full revolution without a free
    /// entry is `NoSpace`.
    pub(crate) fn allocate_cluster(
        &self,
        ctx: &mut SectorCache,
        alloc: &mut AllocState,
        prev: u32,
    ) -> Result<u32> {
        let count = self.geo.cluster_count;
        let mut current = alloc.last_allocated + 1;
        loop {
            if current >= count {
                debug!("allocator reached the end of the table, wrapping to cluster 2");
                current = 2;
            }
            if classify(self.fat_raw(ctx, current)?) == FatEntry::Free {
                self.set_fat_entry(ctx, current, END_OF_CLUSTER)?;
                if prev != 0 {
                    self.set_fat_entry(ctx, prev, current)?;
                }
                alloc.last_allocated = current;
                alloc.free_clusters = alloc.free_clusters.wrapping_sub(1);
                self.write_info_sector(ctx, alloc)?;
                return Ok(current);
            }
            if current == alloc.last_allocated {
                warn!("cluster allocation failed, volume is full");
                return Err(Error::NoSpace);
            }
            current += 1;
        }
    }

    /// Release a whole chain and credit the FSInfo free count. A head of 0
    /// (empty file) is a no-op; a free or bad entry encountered mid-chain
    /// stops the walk, freeing what was reached.
    pub(crate) fn free_chain(
        &self,
        ctx: &mut SectorCache,
        alloc: &mut AllocState,
        head: u32,
    ) -> Result<u32> {
        if head == 0 {
            return Ok(0);
        }
        let mut released = 0u32;
        let mut current = head;
        loop {
            let entry = classify(self.fat_raw(ctx, current)?);
            let next = match entry {
                FatEntry::Next(next) => Some(next),
                FatEntry::EndOfChain => None,
                FatEntry::Free | FatEntry::Bad => {
                    warn!("chain walk hit an unallocated entry at cluster {}", current);
                    break;
                }
            };
            self.set_fat_entry(ctx, current, FREE_CLUSTER)?;
            released += 1;
            match next {
                Some(next) => current = next,
                None => break,
            }
        }
        if released > 0 {
            alloc.free_clusters = alloc.free_clusters.wrapping_add(released);
            self.write_info_sector(ctx, alloc)?;
        }
        Ok(released)
    }

    /// Push the in-memory allocator hints back into the FSInfo sector.
    pub(crate) fn write_info_sector(
        &self,
        ctx: &mut SectorCache,
        alloc: &AllocState,
    ) -> Result<()> {
        let sector = self.geo.info_sector;
        ctx.load(&*self.device, sector)?;
        let (info, _) =
            InfoSectorImage::mut_from_prefix(ctx.bytes_mut()).map_err(|_| Error::Invalid)?;
        info.free_clusters = U32::new(alloc.free_clusters);
        info.last_allocated = U32::new(alloc.last_allocated);
        ctx.commit(&*self.device, sector)
    }
}
