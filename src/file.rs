//! File handles and the payload data path.
//!
//! A handle tracks `{position, current_cluster}` so sequential access never
//! re-walks the chain from the start. At an exact cluster boundary the
//! handle keeps the cluster of the last consumed byte and follows the chain
//! lazily on the next access; writing at end of file therefore extends the
//! chain only once data actually lands in the new cluster.
//!
//! Sector-aligned spans of a request bypass the sector cache and hit the
//! device in one burst per cluster; the unaligned edges go through
//! read-modify-write on the context buffer.

use alloc::sync::Arc;
use core::cmp;

use crate::dir::Node;
use crate::entry;
use crate::fs::Volume;
use crate::sector::SectorCache;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    /// Truncates an existing file on open, creates a missing one.
    Write,
    /// Creates a missing file, positions at end of file.
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

/// Open file produced by [`Volume::open_file`]. Closing a handle opened
/// for writing flushes the directory entry; dropping one does the same on
/// a best-effort basis.
pub struct File {
    pub(crate) vol: Arc<Volume>,
    pub(crate) node: Node,
    pub(crate) mode: Mode,
    pub(crate) first_cluster: u32,
    pub(crate) current_cluster: u32,
    pub(crate) position: u32,
    pub(crate) size: u32,
    pub(crate) dirty: bool,
}

impl core::fmt::Debug for File {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("File")
            .field("node", &self.node)
            .field("mode", &self.mode)
            .field("first_cluster", &self.first_cluster)
            .field("current_cluster", &self.current_cluster)
            .field("position", &self.position)
            .field("size", &self.size)
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl File {
    pub(crate) fn from_node(vol: Arc<Volume>, node: Node, mode: Mode) -> Self {
        let first_cluster = node.first_cluster;
        Self {
            vol,
            node,
            mode,
            first_cluster,
            current_cluster: first_cluster,
            position: 0,
            size: node.size,
            dirty: false,
        }
    }

    pub fn size(&self) -> u64 {
        self.size as u64
    }

    pub fn tell(&self) -> u64 {
        self.position as u64
    }

    pub fn eof(&self) -> bool {
        self.position >= self.size
    }

    /// Read into `buf`, clamped to the bytes left before end of file.
    /// Returns 0 at end of file and on handles not opened for reading.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.mode != Mode::Read {
            return Ok(0);
        }
        let vol = Arc::clone(&self.vol);
        let mut ctx = vol.pool.acquire();
        self.read_inner(&mut ctx, buf)
    }

    fn read_inner(&mut self, ctx: &mut SectorCache, buf: &mut [u8]) -> Result<usize> {
        let geo = self.vol.geo;
        let sector_size = geo.sector_size;
        let spc = geo.sectors_per_cluster();
        let left = (self.size - self.position) as usize;
        let mut remaining = cmp::min(buf.len(), left);
        if remaining == 0 {
            return Ok(0);
        }

        let mut sector_in_cluster = self.sector_in_cluster();
        let mut done = 0usize;
        while remaining > 0 {
            if sector_in_cluster >= spc {
                match self.vol.next_cluster(ctx, self.current_cluster)? {
                    Some(next) => {
                        self.current_cluster = next;
                        sector_in_cluster = 0;
                    }
                    // Chain shorter than the recorded size; hand back what
                    // was reachable.
                    None => break,
                }
            }
            let sector = geo.cluster_sector(self.current_cluster) + sector_in_cluster;
            let offset = self.position as usize & (sector_size - 1);
            if offset != 0 || remaining < sector_size {
                let chunk = cmp::min(sector_size - offset, remaining);
                ctx.load(&*self.vol.device, sector)?;
                buf[done..done + chunk].copy_from_slice(&ctx.bytes()[offset..offset + chunk]);
                if offset + chunk >= sector_size {
                    sector_in_cluster += 1;
                }
                done += chunk;
                remaining -= chunk;
                self.position += chunk as u32;
            } else {
                let sectors = cmp::min(
                    (spc - sector_in_cluster) as usize,
                    remaining >> geo.sector_exp,
                );
                let bytes = sectors << geo.sector_exp;
                self.vol.device.read_blocks(
                    &mut buf[done..done + bytes],
                    sector as usize * sector_size,
                    sectors,
                )?;
                sector_in_cluster += sectors as u32;
                done += bytes;
                remaining -= bytes;
                self.position += bytes as u32;
            }
        }
        Ok(done)
    }

    /// Write `buf` at the current position, allocating clusters as the
    /// chain runs out. Returns the number of bytes that landed; a full
    /// volume surfaces as `NoSpace` only when nothing could be written.
    /// Returns 0 on read-only handles.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.mode == Mode::Read || buf.is_empty() {
            return Ok(0);
        }
        let vol = Arc::clone(&self.vol);
        let mut ctx = vol.pool.acquire();
        self.write_inner(&mut ctx, buf)
    }

    fn write_inner(&mut self, ctx: &mut SectorCache, buf: &[u8]) -> Result<usize> {
        let geo = self.vol.geo;
        let sector_size = geo.sector_size;
        let spc = geo.sectors_per_cluster();
        // File size cap, 2^32 - 1 bytes.
        let mut remaining = cmp::min(buf.len(), (u32::MAX - self.position) as usize);
        if remaining == 0 {
            return Ok(0);
        }

        if self.first_cluster == 0 {
            let mut alloc = self.vol.consistency.lock();
            let cluster = self.vol.allocate_cluster(ctx, &mut alloc, 0)?;
            drop(alloc);
            self.first_cluster = cluster;
            self.current_cluster = cluster;
            self.dirty = true;
        }

        let mut sector_in_cluster = self.sector_in_cluster();
        let mut done = 0usize;
        while remaining > 0 {
            if sector_in_cluster >= spc {
                let next = match self.vol.next_cluster(ctx, self.current_cluster)? {
                    Some(next) => next,
                    None => {
                        let mut alloc = self.vol.consistency.lock();
                        match self.vol.allocate_cluster(ctx, &mut alloc, self.current_cluster) {
                            Ok(next) => next,
                            Err(Error::NoSpace) if done > 0 => break,
                            Err(err) => return Err(err),
                        }
                    }
                };
                self.current_cluster = next;
                sector_in_cluster = 0;
            }
            let sector = geo.cluster_sector(self.current_cluster) + sector_in_cluster;
            let offset = self.position as usize & (sector_size - 1);
            if offset != 0 || remaining < sector_size {
                let chunk = cmp::min(sector_size - offset, remaining);
                ctx.load(&*self.vol.device, sector)?;
                ctx.bytes_mut()[offset..offset + chunk].copy_from_slice(&buf[done..done + chunk]);
                ctx.commit(&*self.vol.device, sector)?;
                if offset + chunk >= sector_size {
                    sector_in_cluster += 1;
                }
                done += chunk;
                remaining -= chunk;
                self.position += chunk as u32;
            } else {
                let sectors = cmp::min(
                    (spc - sector_in_cluster) as usize,
                    remaining >> geo.sector_exp,
                );
                let bytes = sectors << geo.sector_exp;
                self.vol.device.write_blocks(
                    &buf[done..done + bytes],
                    sector as usize * sector_size,
                    sectors,
                )?;
                ctx.note_burst(sector, sectors as u32);
                sector_in_cluster += sectors as u32;
                done += bytes;
                remaining -= bytes;
                self.position += bytes as u32;
            }
            if self.position > self.size {
                self.size = self.position;
            }
            self.dirty = true;
        }
        Ok(done)
    }

    /// Sector index of the current position inside its cluster, saturated
    /// to sectors-per-cluster at an exact cluster boundary so the next
    /// access follows the chain first.
    fn sector_in_cluster(&self) -> u32 {
        let geo = &self.vol.geo;
        if self.position == 0 {
            return 0;
        }
        let spc = geo.sectors_per_cluster();
        let in_cluster = (self.position >> geo.sector_exp) & (spc - 1);
        if in_cluster == 0 && self.position as usize & (geo.sector_size - 1) == 0 {
            spc
        } else {
            in_cluster
        }
    }

    /// Reposition the handle. Seeking past end of file is an error; a file
    /// grows through writes only.
    pub fn seek(&mut self, from: SeekFrom) -> Result<u64> {
        let target = match from {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(offset) => self.position as i64 + offset,
            SeekFrom::End(offset) => self.size as i64 + offset,
        };
        if target < 0 || target > self.size as i64 {
            return Err(Error::Invalid);
        }
        let vol = Arc::clone(&self.vol);
        let mut ctx = vol.pool.acquire();
        self.seek_inner(&mut ctx, target as u32)?;
        Ok(self.position as u64)
    }

    /// Seek core: hop whole clusters, forward from the current cluster or
    /// from the chain head when moving backwards.
    pub(crate) fn seek_inner(&mut self, ctx: &mut SectorCache, target: u32) -> Result<()> {
        if self.first_cluster == 0 {
            self.position = 0;
            return Ok(());
        }
        let shift = self.vol.geo.sector_exp + self.vol.geo.cluster_exp;
        let target_index = if target == 0 { 0 } else { (target - 1) >> shift };
        let position_index = if self.position == 0 {
            0
        } else {
            (self.position - 1) >> shift
        };
        let (mut cluster, hops) = if target >= self.position {
            (self.current_cluster, target_index - position_index)
        } else {
            (self.first_cluster, target_index)
        };
        for _ in 0..hops {
            cluster = self
                .vol
                .next_cluster(ctx, cluster)?
                .ok_or(Error::Invalid)?;
        }
        self.current_cluster = cluster;
        self.position = target;
        Ok(())
    }

    /// Drop the payload chain and reset the handle to an empty file; the
    /// directory entry catches up on flush.
    pub(crate) fn truncate(&mut self, ctx: &mut SectorCache) -> Result<()> {
        let mut alloc = self.vol.consistency.lock();
        self.vol.free_chain(ctx, &mut alloc, self.first_cluster)?;
        drop(alloc);
        self.first_cluster = 0;
        self.current_cluster = 0;
        self.size = 0;
        self.position = 0;
        self.dirty = true;
        Ok(())
    }

    /// Write the handle's cluster, size and timestamp back into the
    /// directory entry.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let vol = Arc::clone(&self.vol);
        let mut ctx = vol.pool.acquire();
        self.flush_inner(&mut ctx)
    }

    fn flush_inner(&mut self, ctx: &mut SectorCache) -> Result<()> {
        // The entry rewrite is a directory mutation; concurrent flushes
        // into the same directory sector must not interleave.
        let _consistency = self.vol.consistency.lock();
        let geo = &self.vol.geo;
        let sector = geo.slot_sector(self.node.parent_cluster, self.node.parent_index);
        ctx.load(&*self.vol.device, sector)?;
        {
            let image = entry::slot_mut(ctx.bytes_mut(), geo.slot_offset(self.node.parent_index));
            image.set_first_cluster(self.first_cluster);
            image.set_size(self.size);
            let (time, date) = self.vol.timestamp();
            if (time, date) != (0, 0) {
                image.stamp_modified(time, date);
            }
        }
        ctx.commit(&*self.vol.device, sector)?;
        self.dirty = false;
        Ok(())
    }

    /// Flush (for writing modes) and release the handle.
    pub fn close(mut self) -> Result<()> {
        if self.mode != Mode::Read {
            self.flush()?;
        }
        Ok(())
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if self.dirty && self.mode != Mode::Read {
            let vol = Arc::clone(&self.vol);
            let mut ctx = vol.pool.acquire();
            let _ = self.flush_inner(&mut ctx);
        }
    }
}
