//! Directory iteration and mutation.
//!
//! On disk a directory is a sequence of 32-byte slots laid out as
//!
//! ```text
//! fileA lfn(n) .. fileA lfn(1), fileA short,
//! fileB lfn(m) .. fileB lfn(1), fileB short, ...
//! ```
//!
//! The iterator coalesces each long-name set with its short entry and hands
//! callers one logical record per file; raw slots never escape this module.
//! Iteration ends at the first never-used slot or at the end of the
//! directory's cluster chain, whichever comes first.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use log::warn;

use crate::clock;
use crate::entry;
use crate::fs::{AllocState, NodeKind, Volume};
use crate::sector::SectorCache;
use crate::{
    Error, Result, ATTR_DIRECTORY, ATTR_READ_ONLY, ATTR_SYSTEM, DIR_SLOT_CAP, LAST_LONG_ENTRY,
    LONG_NAME_CHUNK_CAP, LONG_NAME_LEN, SPACE,
};

const NAME_UNITS: usize = LONG_NAME_CHUNK_CAP * LONG_NAME_LEN;

/// Resolver output: where an entry lives and what it says. `name_cluster`
/// and `name_index` address the first long-name slot of the entry group
/// and equal the short slot position when the entry has no long name. The
/// root directory is the one node without a slot; it uses parent cluster 0
/// as a sentinel.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Node {
    pub parent_cluster: u32,
    pub parent_index: u16,
    pub name_cluster: u32,
    pub name_index: u16,
    pub first_cluster: u32,
    pub size: u32,
    pub attr: u8,
    pub mtime: u16,
    pub mdate: u16,
}

impl Node {
    pub(crate) fn root(root_cluster: u32) -> Self {
        Self {
            parent_cluster: 0,
            parent_index: 0,
            name_cluster: 0,
            name_index: 0,
            first_cluster: root_cluster,
            size: 0,
            attr: ATTR_DIRECTORY,
            mtime: 0,
            mdate: 0,
        }
    }

    pub(crate) fn is_root(&self) -> bool {
        self.parent_cluster == 0
    }

    pub(crate) fn is_dir(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }

    pub(crate) fn is_system(&self) -> bool {
        self.attr & ATTR_SYSTEM != 0
    }

    pub(crate) fn is_read_only(&self) -> bool {
        self.attr & ATTR_READ_ONLY != 0
    }
}

/// Walk state over a directory's slots.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DirCursor {
    pub cluster: u32,
    pub index: u16,
}

impl DirCursor {
    pub(crate) fn new(cluster: u32) -> Self {
        Self { cluster, index: 0 }
    }
}

/// Long-name chunks collected while walking towards their short entry.
struct LfnCollect {
    units: [u16; NAME_UNITS],
    expected: u8,
    count: u8,
    checksum: u8,
    cluster: u32,
    index: u16,
}

impl LfnCollect {
    fn store(&mut self, chunk_index: u8, chunk: &[u16; LONG_NAME_LEN]) {
        let start = (chunk_index as usize - 1) * LONG_NAME_LEN;
        self.units[start..start + LONG_NAME_LEN].copy_from_slice(chunk);
    }
}

/// Position of the first slot of a freshly reserved run.
pub(crate) struct SlotRun {
    pub cluster: u32,
    pub index: u16,
    /// The run extends into never-used slots; the terminator needs to be
    /// re-established after the last written slot.
    pub reached_end: bool,
}

impl Volume {
    /// Produce the next live entry of a directory, long-name set already
    /// coalesced. `Ok(None)` at the end marker or when the cluster chain is
    /// exhausted. Deleted slots and the volume label are skipped; an
    /// interrupted or mismatching long-name set is dropped and the short
    /// name wins.
    pub(crate) fn fetch_next(
        &self,
        ctx: &mut SectorCache,
        cursor: &mut DirCursor,
    ) -> Result<Option<(Node, String)>> {
        let epc = self.geo.entries_per_cluster();
        let mut lfn: Option<LfnCollect> = None;

        let (attr, first_cluster, size, mtime, mdate, short_name, cksum) = loop {
            if cursor.index as u32 >= epc {
                match self.next_cluster(ctx, cursor.cluster)? {
                    Some(next) => {
                        cursor.cluster = next;
                        cursor.index = 0;
                    }
                    None => return Ok(None),
                }
            }
            let sector = self.geo.slot_sector(cursor.cluster, cursor.index);
            ctx.load(&*self.device, sector)?;
            let off = self.geo.slot_offset(cursor.index);
            let image = entry::slot(ctx.bytes(), off);

            if image.is_end() {
                return Ok(None);
            }
            if image.is_lfn() {
                let chunk = entry::lfn_slot(ctx.bytes(), off);
                if chunk.is_deleted() {
                    lfn = None;
                } else if chunk.is_last() {
                    let index = chunk.chunk_index();
                    if index == 0 || index as usize > LONG_NAME_CHUNK_CAP {
                        lfn = None;
                    } else {
                        let mut collect = LfnCollect {
                            units: [0xFFFF; NAME_UNITS],
                            expected: index,
                            count: 1,
                            checksum: chunk.checksum(),
                            cluster: cursor.cluster,
                            index: cursor.index,
                        };
                        collect.store(index, &chunk.chunk());
                        lfn = Some(collect);
                    }
                } else if let Some(collect) = lfn.as_mut() {
                    let index = chunk.chunk_index();
                    if index == 0 || index > collect.expected || chunk.checksum() != collect.checksum
                    {
                        lfn = None;
                    } else {
                        collect.store(index, &chunk.chunk());
                        collect.count = collect.count.saturating_add(1);
                    }
                }
                cursor.index += 1;
                continue;
            }
            if image.is_deleted() {
                lfn = None;
                cursor.index += 1;
                continue;
            }
            if image.is_volume_label() {
                lfn = None;
                cursor.index += 1;
                continue;
            }
            break (
                image.attr(),
                image.first_cluster(),
                image.size(),
                image.modified().0,
                image.modified().1,
                image.short_name(),
                image.checksum(),
            );
        };

        let mut name = short_name;
        let mut name_cluster = cursor.cluster;
        let mut name_index = cursor.index;
        if let Some(collect) = lfn {
            if collect.count == collect.expected && collect.checksum == cksum {
                name = entry::long_name_from_units(
                    &collect.units[..collect.expected as usize * LONG_NAME_LEN],
                );
                name_cluster = collect.cluster;
                name_index = collect.index;
            } else {
                warn!("orphan long name set ignored ahead of {}", name);
            }
        }

        let node = Node {
            parent_cluster: cursor.cluster,
            parent_index: cursor.index,
            name_cluster,
            name_index,
            first_cluster,
            size,
            attr,
            mtime,
            mdate,
        };
        cursor.index += 1;
        Ok(Some((node, name)))
    }

    /// Case-insensitive lookup of one component inside a directory.
    pub(crate) fn find_entry(
        &self,
        ctx: &mut SectorCache,
        dir_cluster: u32,
        name: &str,
    ) -> Result<Option<Node>> {
        let mut cursor = DirCursor::new(dir_cluster);
        while let Some((node, entry_name)) = self.fetch_next(ctx, &mut cursor)? {
            if entry_name.eq_ignore_ascii_case(name) {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }

    /// Whether a directory holds anything beyond `.` and `..`.
    pub(crate) fn dir_has_entries(&self, ctx: &mut SectorCache, dir_cluster: u32) -> Result<bool> {
        let mut cursor = DirCursor {
            cluster: dir_cluster,
            index: 2,
        };
        Ok(self.fetch_next(ctx, &mut cursor)?.is_some())
    }

    /// Does any short entry of the directory carry this raw 11-byte name?
    /// Looks at the aliases behind long names too, which the coalescing
    /// iterator hides.
    fn short_name_exists(
        &self,
        ctx: &mut SectorCache,
        dir_cluster: u32,
        name: &[u8; 11],
    ) -> Result<bool> {
        let epc = self.geo.entries_per_cluster();
        let mut cursor = DirCursor::new(dir_cluster);
        loop {
            if cursor.index as u32 >= epc {
                match self.next_cluster(ctx, cursor.cluster)? {
                    Some(next) => {
                        cursor.cluster = next;
                        cursor.index = 0;
                    }
                    None => return Ok(false),
                }
            }
            let sector = self.geo.slot_sector(cursor.cluster, cursor.index);
            ctx.load(&*self.device, sector)?;
            let image = entry::slot(ctx.bytes(), self.geo.slot_offset(cursor.index));
            if image.is_end() {
                return Ok(false);
            }
            if !image.is_lfn() && !image.is_deleted() && image.raw_name() == name {
                return Ok(true);
            }
            cursor.index += 1;
        }
    }

    /// Reserve `needed` consecutive free slots, growing the directory with
    /// zero-filled clusters when the chain runs out. Directories are bounded
    /// at 65,535 slots.
    pub(crate) fn allocate_slots(
        &self,
        ctx: &mut SectorCache,
        alloc: &mut AllocState,
        dir_cluster: u32,
        needed: u16,
    ) -> Result<SlotRun> {
        let epc = self.geo.entries_per_cluster();
        let mut cluster = dir_cluster;
        let mut index: u16 = 0;
        let mut total: u32 = 0;
        let mut run_start: Option<(u32, u16)> = None;
        let mut run_len: u16 = 0;
        let mut past_end = false;

        loop {
            if index as u32 >= epc {
                match self.next_cluster(ctx, cluster)? {
                    Some(next) => cluster = next,
                    None => {
                        let fresh = self.allocate_cluster(ctx, alloc, cluster)?;
                        self.zero_cluster(ctx, fresh)?;
                        cluster = fresh;
                        past_end = true;
                    }
                }
                index = 0;
            }
            if total >= DIR_SLOT_CAP {
                return Err(Error::NoSpace);
            }

            let free = if past_end {
                true
            } else {
                let sector = self.geo.slot_sector(cluster, index);
                ctx.load(&*self.device, sector)?;
                let off = self.geo.slot_offset(index);
                let image = entry::slot(ctx.bytes(), off);
                if image.is_end() {
                    past_end = true;
                    true
                } else if image.is_deleted() {
                    true
                } else {
                    image.is_lfn() && entry::lfn_slot(ctx.bytes(), off).is_deleted()
                }
            };

            if free {
                let start = *run_start.get_or_insert((cluster, index));
                run_len += 1;
                if run_len == needed {
                    return Ok(SlotRun {
                        cluster: start.0,
                        index: start.1,
                        reached_end: past_end,
                    });
                }
            } else {
                run_start = None;
                run_len = 0;
            }
            index += 1;
            total += 1;
        }
    }

    /// Lay an entry group down into a reserved run: long-name chunks in
    /// reverse order, highest ordinal first, then the short entry.
    fn write_entry_group(
        &self,
        ctx: &mut SectorCache,
        run: SlotRun,
        short_name: &[u8; 11],
        attr: u8,
        first_cluster: u32,
        size: u32,
        chunks: &[[u16; LONG_NAME_LEN]],
    ) -> Result<Node> {
        let cksum = entry::checksum(short_name);
        let (time, date) = self.timestamp();
        let mut cluster = run.cluster;
        let mut index = run.index;

        for (slot, chunk) in chunks.iter().rev().enumerate() {
            let mut ordinal = (chunks.len() - slot) as u8;
            if slot == 0 {
                ordinal |= LAST_LONG_ENTRY;
            }
            let sector = self.geo.slot_sector(cluster, index);
            ctx.load(&*self.device, sector)?;
            entry::lfn_slot_mut(ctx.bytes_mut(), self.geo.slot_offset(index))
                .init(ordinal, cksum, chunk);
            ctx.commit(&*self.device, sector)?;
            if !self.advance_slot(ctx, &mut cluster, &mut index)? {
                return Err(Error::Invalid);
            }
        }

        let sector = self.geo.slot_sector(cluster, index);
        ctx.load(&*self.device, sector)?;
        {
            let image = entry::slot_mut(ctx.bytes_mut(), self.geo.slot_offset(index));
            image.init(short_name, attr, first_cluster, size);
            image.stamp_created(time, date);
        }
        ctx.commit(&*self.device, sector)?;

        let node = Node {
            parent_cluster: cluster,
            parent_index: index,
            name_cluster: run.cluster,
            name_index: run.index,
            first_cluster,
            size,
            attr,
            mtime: time,
            mdate: date,
        };

        // The run swallowed the old end marker; put one back after the
        // group unless the chain itself terminates there.
        if run.reached_end && self.advance_slot(ctx, &mut cluster, &mut index)? {
            let sector = self.geo.slot_sector(cluster, index);
            ctx.load(&*self.device, sector)?;
            let off = self.geo.slot_offset(index);
            if ctx.bytes()[off] != 0 {
                ctx.bytes_mut()[off..off + crate::DIRENT_SIZE].fill(0);
                ctx.commit(&*self.device, sector)?;
            }
        }
        Ok(node)
    }

    fn advance_slot(
        &self,
        ctx: &mut SectorCache,
        cluster: &mut u32,
        index: &mut u16,
    ) -> Result<bool> {
        *index += 1;
        if *index as u32 >= self.geo.entries_per_cluster() {
            match self.next_cluster(ctx, *cluster)? {
                Some(next) => {
                    *cluster = next;
                    *index = 0;
                }
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Create a directory entry for `name` inside `dir_cluster`. Names the
    /// short form cannot carry faithfully get a long-name set plus a unique
    /// `~N` alias.
    pub(crate) fn create_entry(
        &self,
        ctx: &mut SectorCache,
        alloc: &mut AllocState,
        dir_cluster: u32,
        name: &str,
        attr: u8,
        first_cluster: u32,
        size: u32,
    ) -> Result<Node> {
        if !entry::valid_long_name(name) {
            return Err(Error::Invalid);
        }
        let mut short = [SPACE; 11];
        let chunks: Vec<[u16; LONG_NAME_LEN]>;
        if entry::fill_short_name(&mut short, name) {
            // A name that is its own short form may still collide with the
            // alias of a long-named neighbour.
            if self.short_name_exists(ctx, dir_cluster, &short)? {
                return Err(Error::AlreadyExists);
            }
            chunks = Vec::new();
        } else {
            if self.short_name_exists(ctx, dir_cluster, &short)? {
                let mut tail = 1;
                loop {
                    let candidate = entry::short_name_with_tail(&short, tail);
                    if !self.short_name_exists(ctx, dir_cluster, &candidate)? {
                        short = candidate;
                        break;
                    }
                    tail += 1;
                    if tail > 99 {
                        return Err(Error::AlreadyExists);
                    }
                }
            }
            chunks = entry::lfn_chunks(name).ok_or(Error::Invalid)?;
        }

        let run = self.allocate_slots(ctx, alloc, dir_cluster, chunks.len() as u16 + 1)?;
        self.write_entry_group(ctx, run, &short, attr, first_cluster, size, &chunks)
    }

    /// Mark every slot of an entry group free, walking from the first
    /// long-name slot to the short slot across cluster boundaries.
    pub(crate) fn mark_entry_free(&self, ctx: &mut SectorCache, node: &Node) -> Result<()> {
        let epc = self.geo.entries_per_cluster();
        let mut cluster = node.name_cluster;
        let mut index = node.name_index;
        loop {
            if index as u32 >= epc {
                cluster = self.next_cluster(ctx, cluster)?.ok_or(Error::Invalid)?;
                index = 0;
            }
            let sector = self.geo.slot_sector(cluster, index);
            ctx.load(&*self.device, sector)?;
            entry::slot_mut(ctx.bytes_mut(), self.geo.slot_offset(index)).mark_deleted();
            ctx.commit(&*self.device, sector)?;
            if cluster == node.parent_cluster && index == node.parent_index {
                return Ok(());
            }
            index += 1;
        }
    }

    /// First two slots of a fresh directory cluster: `.` pointing at the
    /// directory itself and `..` at its parent, cluster 0 when the parent
    /// is the root.
    pub(crate) fn init_dot_entries(
        &self,
        ctx: &mut SectorCache,
        cluster: u32,
        parent_cluster: u32,
    ) -> Result<()> {
        let (time, date) = self.timestamp();
        let sector = self.geo.cluster_sector(cluster);
        ctx.load(&*self.device, sector)?;

        let mut name = [SPACE; 11];
        name[0] = b'.';
        {
            let dot = entry::slot_mut(ctx.bytes_mut(), 0);
            dot.init(&name, ATTR_DIRECTORY, cluster, 0);
            dot.stamp_created(time, date);
        }

        name[1] = b'.';
        let up = if parent_cluster == self.geo.root_cluster {
            0
        } else {
            parent_cluster
        };
        {
            let dotdot = entry::slot_mut(ctx.bytes_mut(), crate::DIRENT_SIZE);
            dotdot.init(&name, ATTR_DIRECTORY, up, 0);
            dotdot.stamp_created(time, date);
        }
        ctx.commit(&*self.device, sector)
    }
}

/// One coalesced entry as listed by [`Dir::read_entry`].
#[derive(Debug, Clone)]
pub struct DirRecord {
    pub name: String,
    pub kind: NodeKind,
    pub size: u64,
    /// Modification timestamp; FAT32 tracks nothing finer for access.
    pub atime: i64,
}

/// Stateful directory handle produced by [`Volume::open_dir`].
pub struct Dir {
    vol: Arc<Volume>,
    first_cluster: u32,
    cursor: DirCursor,
}

impl core::fmt::Debug for Dir {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dir")
            .field("first_cluster", &self.first_cluster)
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl Dir {
    pub(crate) fn new(vol: Arc<Volume>, first_cluster: u32) -> Self {
        Self {
            vol,
            first_cluster,
            cursor: DirCursor::new(first_cluster),
        }
    }

    /// Next entry in on-disk order, `Ok(None)` once exhausted. `.` and `..`
    /// are listed; the volume label is not.
    pub fn read_entry(&mut self) -> Result<Option<DirRecord>> {
        let vol = Arc::clone(&self.vol);
        let mut ctx = vol.pool.acquire();
        match vol.fetch_next(&mut ctx, &mut self.cursor)? {
            Some((node, name)) => Ok(Some(DirRecord {
                name,
                kind: if node.is_dir() {
                    NodeKind::Dir
                } else {
                    NodeKind::File
                },
                size: node.size as u64,
                atime: clock::to_unix(node.mtime, node.mdate),
            })),
            None => Ok(None),
        }
    }

    /// Restart iteration from the first slot.
    pub fn rewind(&mut self) {
        self.cursor = DirCursor::new(self.first_cluster);
    }
}
