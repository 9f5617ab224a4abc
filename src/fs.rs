//! The mounted volume.
//!
//! [`Volume`] owns every piece of mutable state: the geometry parsed from
//! the boot sector, the allocator hints captured from FSInfo, the context
//! pool and the injected clock. Handles share the volume through `Arc`, so
//! a volume cannot go away under an open file, and multiple volumes
//! coexist within one process.
//!
//! Two locks serialize what must be serialized: the consistency lock
//! guards the FAT, FSInfo and all directory mutations (its guard carries
//! the allocator cursor, so holding it is holding the allocator); the
//! context pool has its own short-lived lock for acquisition. Payload
//! reads take neither; only writes, truncation and removal reshape a
//! chain, and those always run under the consistency lock.

use alloc::sync::Arc;
use log::{debug, error};
use spin::Mutex;
use zerocopy::FromBytes;

use crate::bpb::{Geometry, InfoSectorImage};
use crate::clock::{self, Clock};
use crate::device::BlockDevice;
use crate::dir::Dir;
use crate::entry;
use crate::file::{File, Mode};
use crate::path::Walk;
use crate::sector::{ContextPool, SectorCache};
use crate::{Error, Result};

/// Allocator state living inside the consistency lock: the rolling scan
/// cursor and the free-cluster hint mirrored into FSInfo.
pub struct AllocState {
    pub(crate) last_allocated: u32,
    pub(crate) free_clusters: u32,
}

/// Mount-time knobs. `contexts` sizes the pool of per-operation sector
/// buffers: one context serializes all operations, more allow that many
/// concurrent operations. A clock makes entries carry real timestamps.
#[derive(Clone)]
pub struct MountOptions {
    pub contexts: usize,
    pub clock: Option<Arc<dyn Clock>>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            contexts: 1,
            clock: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    None,
    File,
    Dir,
    Link,
}

/// Shape returned by [`Volume::stat`].
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub kind: NodeKind,
    pub size: u64,
    /// FAT32 has no per-read access time; this is the modification
    /// timestamp, 0 when the entry was written without a clock.
    pub atime: i64,
}

pub struct Volume {
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) geo: Geometry,
    pub(crate) clock: Option<Arc<dyn Clock>>,
    pub(crate) consistency: Mutex<AllocState>,
    pub(crate) pool: ContextPool,
}

impl core::fmt::Debug for Volume {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Volume").field("geo", &self.geo).finish()
    }
}

impl Volume {
    /// Parse the boot sector and FSInfo and hand back a live volume.
    ///
    /// The boot sector must carry the 0xAA55 signature, a power-of-two
    /// sector size between 512 and 4096 and FAT32-shaped geometry; FSInfo
    /// must carry both of its signatures. The FSInfo cursor seeds the
    /// allocator; an out-of-range hint falls back to cluster 2.
    pub fn mount(device: Arc<dyn BlockDevice>, options: MountOptions) -> Result<Arc<Volume>> {
        let mut boot = [0u8; 512];
        device.read_blocks(&mut boot, 0, 1)?;
        let geo = Geometry::parse(&boot)?;

        let pool = ContextPool::new(options.contexts, geo.sector_size);
        let (free_clusters, cursor) = {
            let mut ctx = pool.acquire();
            ctx.load(&*device, geo.info_sector)?;
            let (info, _) =
                InfoSectorImage::ref_from_prefix(ctx.bytes()).map_err(|_| Error::Invalid)?;
            if !info.check_signatures() {
                error!("info sector signatures missing");
                return Err(Error::Invalid);
            }
            (info.free_clusters.get(), info.last_allocated.get())
        };
        let last_allocated = if (2..geo.cluster_count).contains(&cursor) {
            cursor
        } else {
            2
        };
        debug!(
            "info sector: {} free clusters, allocator cursor at {}",
            free_clusters, last_allocated
        );

        Ok(Arc::new(Volume {
            device,
            geo,
            clock: options.clock,
            consistency: Mutex::new(AllocState {
                last_allocated,
                free_clusters,
            }),
            pool,
        }))
    }

    /// Push the allocator hints back into FSInfo and release the volume.
    /// Data and directory mutations are written through as they happen, so
    /// this only refreshes the hints.
    pub fn unmount(self: Arc<Self>) -> Result<()> {
        let mut ctx = self.pool.acquire();
        let alloc = self.consistency.lock();
        self.write_info_sector(&mut ctx, &alloc)
    }

    /// Current free-cluster hint, as maintained in FSInfo.
    pub fn free_clusters(&self) -> u32 {
        self.consistency.lock().free_clusters
    }

    /// Entry time/date words from the injected clock; zeros without one.
    pub(crate) fn timestamp(&self) -> (u16, u16) {
        match &self.clock {
            Some(clock) => clock::encode(&clock.now()),
            None => (0, 0),
        }
    }

    /// Fill a whole data cluster with zeros.
    pub(crate) fn zero_cluster(&self, ctx: &mut SectorCache, cluster: u32) -> Result<()> {
        ctx.invalidate();
        ctx.bytes_mut().fill(0);
        let first = self.geo.cluster_sector(cluster);
        for i in 0..self.geo.sectors_per_cluster() {
            let sector = (first + i) as usize * self.geo.sector_size;
            self.device.write_blocks(ctx.bytes(), sector, 1)?;
        }
        Ok(())
    }

    pub fn stat(&self, path: &str) -> Result<Stat> {
        let mut ctx = self.pool.acquire();
        match self.resolve(&mut ctx, path)? {
            Walk::Found(node) => Ok(Stat {
                kind: if node.is_dir() {
                    NodeKind::Dir
                } else {
                    NodeKind::File
                },
                size: node.size as u64,
                atime: clock::to_unix(node.mtime, node.mdate),
            }),
            Walk::Missing { .. } => Err(Error::NotFound),
        }
    }

    /// Open a file. READ wants an existing plain file; WRITE truncates an
    /// existing file or creates a missing one; APPEND creates or positions
    /// at end of file.
    pub fn open_file(self: &Arc<Self>, path: &str, mode: Mode) -> Result<File> {
        let mut ctx = self.pool.acquire();
        let (node, existed) = match self.resolve(&mut ctx, path)? {
            Walk::Found(node) => {
                if node.is_dir() {
                    return Err(Error::IsDirectory);
                }
                if node.is_system() {
                    return Err(Error::AccessDenied);
                }
                if mode != Mode::Read && node.is_read_only() {
                    return Err(Error::AccessDenied);
                }
                (node, true)
            }
            Walk::Missing { parent, name } => {
                if mode == Mode::Read {
                    return Err(Error::NotFound);
                }
                let dir_cluster = self.dir_cluster_of(&parent);
                let mut alloc = self.consistency.lock();
                let node = self.create_entry(
                    &mut ctx,
                    &mut alloc,
                    dir_cluster,
                    name,
                    entry::attr_for(false),
                    0,
                    0,
                )?;
                (node, false)
            }
        };

        let mut file = File::from_node(Arc::clone(self), node, mode);
        if mode == Mode::Write && existed {
            file.truncate(&mut ctx)?;
        }
        if mode == Mode::Append {
            let end = file.size;
            file.seek_inner(&mut ctx, end)?;
        }
        Ok(file)
    }

    pub fn open_dir(self: &Arc<Self>, path: &str) -> Result<Dir> {
        let mut ctx = self.pool.acquire();
        match self.resolve(&mut ctx, path)? {
            Walk::Found(node) => {
                if !node.is_dir() {
                    return Err(Error::NotADirectory);
                }
                Ok(Dir::new(Arc::clone(self), self.dir_cluster_of(&node)))
            }
            Walk::Missing { .. } => Err(Error::NotFound),
        }
    }

    /// Unlink a plain file: release its chain, then free every slot of its
    /// entry group.
    pub fn remove(&self, path: &str) -> Result<()> {
        let mut ctx = self.pool.acquire();
        let node = match self.resolve(&mut ctx, path)? {
            Walk::Found(node) => node,
            Walk::Missing { .. } => return Err(Error::NotFound),
        };
        if node.is_dir() {
            return Err(Error::IsDirectory);
        }
        if node.is_system() {
            return Err(Error::AccessDenied);
        }
        let mut alloc = self.consistency.lock();
        self.free_chain(&mut ctx, &mut alloc, node.first_cluster)?;
        self.mark_entry_free(&mut ctx, &node)
    }

    /// Remove an empty directory. `.` and `..` do not count as content.
    pub fn remove_dir(&self, path: &str) -> Result<()> {
        let mut ctx = self.pool.acquire();
        let node = match self.resolve(&mut ctx, path)? {
            Walk::Found(node) => node,
            Walk::Missing { .. } => return Err(Error::NotFound),
        };
        if !node.is_dir() {
            return Err(Error::NotADirectory);
        }
        // The root has no entry to free; a dot entry resolving to cluster 0
        // aliases it.
        if node.is_root() || node.first_cluster == 0 {
            return Err(Error::AccessDenied);
        }
        if self.dir_has_entries(&mut ctx, node.first_cluster)? {
            return Err(Error::NotEmpty);
        }
        let mut alloc = self.consistency.lock();
        self.free_chain(&mut ctx, &mut alloc, node.first_cluster)?;
        self.mark_entry_free(&mut ctx, &node)
    }

    /// Create a directory: one zeroed cluster holding `.` and `..`, plus
    /// an entry in the parent.
    pub fn make_dir(&self, path: &str) -> Result<()> {
        let mut ctx = self.pool.acquire();
        match self.resolve(&mut ctx, path)? {
            Walk::Found(_) => Err(Error::AlreadyExists),
            Walk::Missing { parent, name } => {
                let dir_cluster = self.dir_cluster_of(&parent);
                let mut alloc = self.consistency.lock();
                let cluster = self.allocate_cluster(&mut ctx, &mut alloc, 0)?;
                self.zero_cluster(&mut ctx, cluster)?;
                self.init_dot_entries(&mut ctx, cluster, dir_cluster)?;
                if let Err(err) = self.create_entry(
                    &mut ctx,
                    &mut alloc,
                    dir_cluster,
                    name,
                    entry::attr_for(true),
                    cluster,
                    0,
                ) {
                    let _ = self.free_chain(&mut ctx, &mut alloc, cluster);
                    return Err(err);
                }
                Ok(())
            }
        }
    }

    /// Move `src` to `dst` on this volume: a new entry group pointing at
    /// the old chain, then the old group marked free. The payload is never
    /// copied.
    pub fn rename(&self, src: &str, dst: &str) -> Result<()> {
        if crate::path::components(src).last() == Some("..") {
            return Err(Error::AccessDenied);
        }
        let mut ctx = self.pool.acquire();
        let node = match self.resolve(&mut ctx, src)? {
            Walk::Found(node) => node,
            Walk::Missing { .. } => return Err(Error::NotFound),
        };
        if node.is_root() {
            return Err(Error::AccessDenied);
        }
        match self.resolve(&mut ctx, dst)? {
            Walk::Found(_) => Err(Error::AlreadyExists),
            Walk::Missing { parent, name } => {
                let dir_cluster = self.dir_cluster_of(&parent);
                let mut alloc = self.consistency.lock();
                self.create_entry(
                    &mut ctx,
                    &mut alloc,
                    dir_cluster,
                    name,
                    node.attr,
                    node.first_cluster,
                    node.size,
                )?;
                self.mark_entry_free(&mut ctx, &node)
            }
        }
    }
}
