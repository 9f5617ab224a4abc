//! Shared fixtures: an in-memory sector device and a minimal FAT32
//! formatter producing the fresh images the tests mount.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use vfat32::{BlockDevice, Clock, DateTime, DeviceError, MountOptions, Volume};

pub const SECTOR: usize = 512;
pub const RESERVED: u32 = 32;
pub const FAT_COPIES: u32 = 2;

pub struct RamDisk {
    data: Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(bytes: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; bytes]),
        }
    }

    pub fn peek(&self, offset: usize, len: usize) -> Vec<u8> {
        self.data.lock().unwrap()[offset..offset + len].to_vec()
    }
}

impl BlockDevice for RamDisk {
    fn read_blocks(
        &self,
        buf: &mut [u8],
        offset: usize,
        _block_cnt: usize,
    ) -> Result<(), DeviceError> {
        let data = self.data.lock().unwrap();
        let end = offset + buf.len();
        if end > data.len() {
            return Err(DeviceError::ReadError);
        }
        buf.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    fn write_blocks(&self, buf: &[u8], offset: usize, _block_cnt: usize) -> Result<(), DeviceError> {
        let mut data = self.data.lock().unwrap();
        let end = offset + buf.len();
        if end > data.len() {
            return Err(DeviceError::WriteError);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(())
    }
}

/// Where the formatter put things; lets tests inspect raw structures.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub total_sectors: u32,
    pub sectors_per_cluster: u32,
    pub fat_size: u32,
    pub data_sector: u32,
    pub cluster_count: u32,
    /// Free clusters right after format: everything except the root's.
    pub initial_free: u32,
}

impl Layout {
    pub fn fat_entry(&self, disk: &RamDisk, copy: u32, cluster: u32) -> u32 {
        let offset =
            (RESERVED + copy * self.fat_size) as usize * SECTOR + cluster as usize * 4;
        u32::from_le_bytes(disk.peek(offset, 4).try_into().unwrap())
    }

    pub fn fat_image(&self, disk: &RamDisk, copy: u32) -> Vec<u8> {
        disk.peek(
            (RESERVED + copy * self.fat_size) as usize * SECTOR,
            self.fat_size as usize * SECTOR,
        )
    }

    pub fn fsinfo_free(&self, disk: &RamDisk) -> u32 {
        u32::from_le_bytes(disk.peek(SECTOR + 488, 4).try_into().unwrap())
    }

    /// Follow a chain in FAT copy 0, returning every cluster of it.
    pub fn chain(&self, disk: &RamDisk, head: u32) -> Vec<u32> {
        let mut clusters = Vec::new();
        let mut current = head;
        loop {
            clusters.push(current);
            let next = self.fat_entry(disk, 0, current) & 0x0FFF_FFFF;
            if next >= 0x0FFF_FFF8 {
                return clusters;
            }
            current = next;
        }
    }

    /// Raw 32-byte slots of one cluster of a directory.
    pub fn dir_slots(&self, disk: &RamDisk, cluster: u32) -> Vec<Vec<u8>> {
        let first = self.data_sector + (cluster - 2) * self.sectors_per_cluster;
        let bytes = disk.peek(
            first as usize * SECTOR,
            (self.sectors_per_cluster as usize) * SECTOR,
        );
        bytes.chunks(32).map(|chunk| chunk.to_vec()).collect()
    }
}

/// Write a fresh FAT32 image onto a new RAM disk: boot sector, FSInfo, two
/// FAT copies with the reserved entries and the root's EOC, root cluster
/// zeroed.
pub fn format(total_sectors: u32, sectors_per_cluster: u32) -> (RamDisk, Layout) {
    let mut fat_size = 1u32;
    loop {
        let data_sector = RESERVED + FAT_COPIES * fat_size;
        let clusters = (total_sectors - data_sector) / sectors_per_cluster + 2;
        let needed = (clusters * 4).div_ceil(SECTOR as u32);
        if needed <= fat_size {
            break;
        }
        fat_size = needed;
    }
    let data_sector = RESERVED + FAT_COPIES * fat_size;
    let cluster_count = (total_sectors - data_sector) / sectors_per_cluster + 2;
    let layout = Layout {
        total_sectors,
        sectors_per_cluster,
        fat_size,
        data_sector,
        cluster_count,
        initial_free: cluster_count - 3,
    };

    let disk = RamDisk::new(total_sectors as usize * SECTOR);

    let mut boot = [0u8; SECTOR];
    boot[0..3].copy_from_slice(&[0xEB, 0x58, 0x90]);
    boot[3..11].copy_from_slice(b"MSWIN4.1");
    boot[11..13].copy_from_slice(&(SECTOR as u16).to_le_bytes());
    boot[13] = sectors_per_cluster as u8;
    boot[14..16].copy_from_slice(&(RESERVED as u16).to_le_bytes());
    boot[16] = FAT_COPIES as u8;
    boot[21] = 0xF8;
    boot[24..26].copy_from_slice(&63u16.to_le_bytes());
    boot[26..28].copy_from_slice(&255u16.to_le_bytes());
    boot[32..36].copy_from_slice(&total_sectors.to_le_bytes());
    boot[36..40].copy_from_slice(&fat_size.to_le_bytes());
    boot[44..48].copy_from_slice(&2u32.to_le_bytes());
    boot[48..50].copy_from_slice(&1u16.to_le_bytes());
    boot[50..52].copy_from_slice(&6u16.to_le_bytes());
    boot[64] = 0x80;
    boot[66] = 0x29;
    boot[67..71].copy_from_slice(&0x1234_5678u32.to_le_bytes());
    boot[71..82].copy_from_slice(b"NO NAME    ");
    boot[82..90].copy_from_slice(b"FAT32   ");
    boot[510] = 0x55;
    boot[511] = 0xAA;
    disk.write_blocks(&boot, 0, 1).unwrap();

    let mut info = [0u8; SECTOR];
    info[0..4].copy_from_slice(&0x41615252u32.to_le_bytes());
    info[484..488].copy_from_slice(&0x61417272u32.to_le_bytes());
    info[488..492].copy_from_slice(&layout.initial_free.to_le_bytes());
    info[492..496].copy_from_slice(&2u32.to_le_bytes());
    info[508..512].copy_from_slice(&0xAA550000u32.to_le_bytes());
    disk.write_blocks(&info, SECTOR, 1).unwrap();

    let mut fat_head = [0u8; SECTOR];
    fat_head[0..4].copy_from_slice(&0x0FFF_FFF8u32.to_le_bytes());
    fat_head[4..8].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
    // Root directory: single-cluster chain at cluster 2.
    fat_head[8..12].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
    for copy in 0..FAT_COPIES {
        disk.write_blocks(
            &fat_head,
            (RESERVED + copy * fat_size) as usize * SECTOR,
            1,
        )
        .unwrap();
    }

    (disk, layout)
}

pub fn mount(disk: RamDisk) -> (Arc<Volume>, Arc<RamDisk>) {
    mount_with(disk, MountOptions::default())
}

pub fn mount_with(disk: RamDisk, options: MountOptions) -> (Arc<Volume>, Arc<RamDisk>) {
    let disk = Arc::new(disk);
    let device: Arc<dyn BlockDevice> = Arc::clone(&disk) as Arc<dyn BlockDevice>;
    let volume = Volume::mount(device, options).expect("mount failed");
    (volume, disk)
}

/// 64 MiB, 512-byte sectors, one sector per cluster.
pub fn scenario_volume() -> (Arc<Volume>, Arc<RamDisk>, Layout) {
    let (disk, layout) = format(131072, 1);
    let (volume, disk) = mount(disk);
    (volume, disk, layout)
}

/// 1 MiB volume for exhaustion tests.
pub fn small_volume() -> (Arc<Volume>, Arc<RamDisk>, Layout) {
    let (disk, layout) = format(2048, 1);
    let (volume, disk) = mount(disk);
    (volume, disk, layout)
}

pub struct FixedClock(pub DateTime);

impl Clock for FixedClock {
    fn now(&self) -> DateTime {
        self.0
    }
}

/// Short-name checksum as specified for long-name chunks.
pub fn checksum(name: &[u8]) -> u8 {
    let mut sum: u8 = 0;
    for &b in name {
        sum = ((sum >> 1) | (sum << 7)).wrapping_add(b);
    }
    sum
}
