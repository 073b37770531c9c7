//! ext2 filesystem.
//!
//! Mounting validates the superblock (magic, feature masks, block-group
//! consistency) and cross-checks the superblock backups; allocation
//! walks block-group bitmaps and keeps the per-group and global free
//! counters in sync with every claim.

pub mod block_group;
pub mod dir;
pub mod inode;
pub mod superblock;

pub use block_group::{BlockLocation, Ext2BlockGroupDesc};
pub use dir::{DirEntry, DirReader};
pub use inode::{file_mode, Ext2InodeRaw, Inode};
pub use superblock::{Ext2Superblock, EXT2_ROOT_INO};

use alloc::sync::Arc;
use alloc::vec;
use spin::Mutex;

use crate::block::{BlockDevice, Partition};
use crate::error::{KernelError, Result};

use superblock::SUPERBLOCK_OFFSET;

struct FsState {
    superblock: Ext2Superblock,
}

/// The mounted root filesystem, installed at boot.
static ROOT_FS: Mutex<Option<Arc<Ext2Fs>>> = Mutex::new(None);

pub fn set_root(fs: Arc<Ext2Fs>) {
    *ROOT_FS.lock() = Some(fs);
}

pub fn root() -> Option<Arc<Ext2Fs>> {
    ROOT_FS.lock().clone()
}

/// A mounted ext2 filesystem.
pub struct Ext2Fs {
    partition: Partition,
    block_size: usize,
    inode_size: usize,
    inodes_per_group: u32,
    first_data_block: u32,
    rev0: bool,
    state: Mutex<FsState>,
}

impl Ext2Fs {
    /// Mount the filesystem on `partition`.
    pub fn mount(partition: Partition) -> Result<Arc<Ext2Fs>> {
        let sector_size = partition.sector_size();
        assert!(SUPERBLOCK_OFFSET % sector_size == 0);

        let mut superblock = {
            let lba = (SUPERBLOCK_OFFSET / sector_size) as u64;
            let sector_count = 1024usize.div_ceil(sector_size);
            let mut buf = vec![0u8; sector_count * sector_size];
            partition
                .read_sectors(lba, sector_count, &mut buf)
                .map_err(KernelError::from)?;
            Ext2Superblock::from_bytes(&buf).ok_or(KernelError::InvalidFormat)?
        };

        if !superblock.is_valid() {
            return Err(KernelError::InvalidFormat);
        }

        superblock.normalize_rev0();
        superblock.validate_features()?;

        let groups_by_inodes = superblock
            .s_inodes_count
            .div_ceil(superblock.s_inodes_per_group);
        let groups_by_blocks = superblock.block_group_count();
        if groups_by_inodes != groups_by_blocks {
            log::warn!(
                "ext2: inconsistent block group count ({} by inodes, {} by blocks)",
                groups_by_inodes,
                groups_by_blocks
            );
            return Err(KernelError::Corrupted);
        }

        let fs = Arc::new(Ext2Fs {
            block_size: superblock.block_size(),
            inode_size: superblock.inode_size(),
            inodes_per_group: superblock.s_inodes_per_group,
            first_data_block: superblock.s_first_data_block,
            rev0: superblock.s_rev_level == 0,
            partition,
            state: Mutex::new(FsState { superblock }),
        });

        fs.check_superblock_backups();

        {
            let state = fs.state.lock();
            log::info!(
                "ext2: mounted, {} blocks of {} bytes, {} inodes, rev {}",
                { state.superblock.s_blocks_count },
                fs.block_size,
                { state.superblock.s_inodes_count },
                { state.superblock.s_rev_level },
            );
        }

        Ok(fs)
    }

    /// Compare each backup superblock's magic against the primary.
    /// A mismatch is logged, not fatal.
    fn check_superblock_backups(&self) {
        let state = self.state.lock();
        let sb = &state.superblock;
        let mut buf = vec![0u8; self.block_size];

        for group in sb.backup_block_groups() {
            let block = sb.s_first_data_block + sb.s_blocks_per_group * group;
            if self.read_block_inner(block, &mut buf).is_err() {
                log::warn!("ext2: could not read superblock backup in group {}", group);
                continue;
            }
            match Ext2Superblock::from_bytes(&buf) {
                Some(backup) if backup.is_valid() => {}
                _ => log::warn!("ext2: superblock backup at block {} is invalid", block),
            }
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn inode_size(&self) -> usize {
        self.inode_size
    }

    pub fn inodes_per_group(&self) -> u32 {
        self.inodes_per_group
    }

    pub fn is_rev0(&self) -> bool {
        self.rev0
    }

    pub fn free_blocks_count(&self) -> u32 {
        self.state.lock().superblock.s_free_blocks_count
    }

    pub fn free_inodes_count(&self) -> u32 {
        self.state.lock().superblock.s_free_inodes_count
    }

    fn read_block_inner(&self, block: u32, buf: &mut [u8]) -> Result<()> {
        assert!(block != 0, "block 0 is never a data block");
        assert!(buf.len() >= self.block_size);
        let sector_size = self.partition.sector_size();
        let sectors_per_block = self.block_size / sector_size;
        let lba = block as u64 * sectors_per_block as u64;
        self.partition
            .read_sectors(lba, sectors_per_block, buf)
            .map_err(KernelError::from)
    }

    pub fn read_block(&self, block: u32, buf: &mut [u8]) -> Result<()> {
        self.read_block_inner(block, buf)
    }

    pub fn write_block(&self, block: u32, buf: &[u8]) -> Result<()> {
        assert!(block != 0, "block 0 is never a data block");
        assert!(buf.len() >= self.block_size);
        let sector_size = self.partition.sector_size();
        let sectors_per_block = self.block_size / sector_size;
        let lba = block as u64 * sectors_per_block as u64;
        self.partition
            .write_sectors(lba, sectors_per_block, buf)
            .map_err(KernelError::from)
    }

    pub fn zero_block(&self, block: u32) -> Result<()> {
        let buf = vec![0u8; self.block_size];
        self.write_block(block, &buf)
    }

    /// Write the in-memory superblock back if it changed. Rev 0 only
    /// writes the classic region.
    fn sync_superblock(&self, state: &FsState) -> Result<()> {
        let sector_size = self.partition.sector_size();
        let sync_len = state.superblock.sync_length();

        let lba = (SUPERBLOCK_OFFSET / sector_size) as u64;
        let sector_count = sync_len.div_ceil(sector_size);
        let mut buf = vec![0u8; sector_count * sector_size];

        self.partition
            .read_sectors(lba, sector_count, &mut buf)
            .map_err(KernelError::from)?;

        let image = state.superblock.as_bytes();
        if buf[..sync_len] != image[..sync_len] {
            buf[..sync_len].copy_from_slice(&image[..sync_len]);
            self.partition
                .write_sectors(lba, sector_count, &buf)
                .map_err(KernelError::from)?;
        }
        Ok(())
    }

    /// Byte position of a block group descriptor. The table starts in
    /// the block after the superblock.
    fn locate_block_group_descriptor(&self, group: u32) -> BlockLocation {
        let table_start = (self.first_data_block + 1) as usize * self.block_size;
        let byte_offset = table_start + core::mem::size_of::<Ext2BlockGroupDesc>() * group as usize;
        BlockLocation {
            block: (byte_offset / self.block_size) as u32,
            offset: byte_offset % self.block_size,
        }
    }

    /// Locate inode `ino` on disk, verifying it is marked allocated in
    /// its group's inode bitmap.
    pub fn locate_inode(&self, ino: u32) -> Result<BlockLocation> {
        let state = self.state.lock();
        if ino == 0 || ino > state.superblock.s_inodes_count {
            return Err(KernelError::NotFound);
        }
        drop(state);

        let inode_group = (ino - 1) / self.inodes_per_group;
        let inode_index = (ino - 1) % self.inodes_per_group;

        let bgd_location = self.locate_block_group_descriptor(inode_group);
        let mut buf = vec![0u8; self.block_size];
        self.read_block(bgd_location.block, &mut buf)?;
        let bgd = Ext2BlockGroupDesc::from_bytes(&buf[bgd_location.offset..])
            .ok_or(KernelError::Corrupted)?;

        let inode_byte_offset = inode_index as usize * self.inode_size;
        let location = BlockLocation {
            block: bgd.bg_inode_table + (inode_byte_offset / self.block_size) as u32,
            offset: inode_byte_offset % self.block_size,
        };

        // The bitmap must agree that this inode exists.
        self.read_block(bgd.bg_inode_bitmap, &mut buf)?;
        let byte = (inode_index / 8) as usize;
        let bit = inode_index % 8;
        if buf[byte] & (1 << bit) == 0 {
            log::warn!("ext2: inode {} not present in allocation bitmap", ino);
            return Err(KernelError::Corrupted);
        }

        Ok(location)
    }

    /// Claim one free block, preferring `primary_bgd`'s group and then
    /// scanning the rest, skipping exhausted groups. Updates the group
    /// descriptor, the global counter, and syncs the superblock.
    pub fn reserve_free_block(&self, primary_bgd: u32) -> Result<u32> {
        let mut state = self.state.lock();

        if state.superblock.s_r_blocks_count >= state.superblock.s_free_blocks_count {
            return Err(KernelError::NoSpace);
        }

        let group_count = state.superblock.block_group_count();
        if let Some(block) = self.try_reserve_in_group(&mut state, primary_bgd)? {
            return Ok(block);
        }
        for group in 0..group_count {
            if group == primary_bgd {
                continue;
            }
            if let Some(block) = self.try_reserve_in_group(&mut state, group)? {
                return Ok(block);
            }
        }

        log::error!("ext2: superblock claims free blocks but none were found");
        Err(KernelError::Corrupted)
    }

    fn try_reserve_in_group(&self, state: &mut FsState, group: u32) -> Result<Option<u32>> {
        let bgd_location = self.locate_block_group_descriptor(group);
        let mut bgd_buf = vec![0u8; self.block_size];
        self.read_block(bgd_location.block, &mut bgd_buf)?;
        let mut bgd = Ext2BlockGroupDesc::from_bytes(&bgd_buf[bgd_location.offset..])
            .ok_or(KernelError::Corrupted)?;

        if bgd.bg_free_blocks_count == 0 {
            return Ok(None);
        }

        let mut bitmap = vec![0u8; self.block_size];
        self.read_block(bgd.bg_block_bitmap, &mut bitmap)?;

        for block_offset in 0..state.superblock.s_blocks_per_group {
            let byte = (block_offset / 8) as usize;
            let bit = block_offset % 8;
            if bitmap[byte] & (1 << bit) != 0 {
                continue;
            }

            bitmap[byte] |= 1 << bit;
            self.write_block(bgd.bg_block_bitmap, &bitmap)?;

            bgd.bg_free_blocks_count -= 1;
            bgd.write_to(&mut bgd_buf[bgd_location.offset..]);
            self.write_block(bgd_location.block, &bgd_buf)?;

            state.superblock.s_free_blocks_count -= 1;
            self.sync_superblock(state)?;

            return Ok(Some(
                state.superblock.s_first_data_block
                    + state.superblock.s_blocks_per_group * group
                    + block_offset,
            ));
        }

        log::error!("ext2: group {} descriptor claims free blocks but bitmap is full", group);
        Ok(None)
    }

    /// Allocate an inode number and write `image` into the inode table.
    /// Linear scan from `first_ino`, group at a time, skipping groups
    /// with no free inodes.
    pub fn create_inode(&self, image: &Ext2InodeRaw) -> Result<u32> {
        assert!(image.i_size == 0);

        let mut state = self.state.lock();
        if state.superblock.s_free_inodes_count == 0 {
            return Err(KernelError::NoSpace);
        }

        let inodes_count = state.superblock.s_inodes_count;
        let first_ino = state.superblock.s_first_ino;

        let mut bgd_buf = vec![0u8; self.block_size];
        let mut bitmap = vec![0u8; self.block_size];

        let mut current_group = u32::MAX;
        let mut bgd_location = BlockLocation { block: 0, offset: 0 };
        let mut bgd = None;

        let mut ino = first_ino;
        while ino <= inodes_count {
            let ino_group = (ino - 1) / self.inodes_per_group;
            let ino_index = (ino - 1) % self.inodes_per_group;

            if ino_group != current_group {
                current_group = ino_group;
                bgd_location = self.locate_block_group_descriptor(current_group);
                self.read_block(bgd_location.block, &mut bgd_buf)?;
                let desc = Ext2BlockGroupDesc::from_bytes(&bgd_buf[bgd_location.offset..])
                    .ok_or(KernelError::Corrupted)?;

                if desc.bg_free_inodes_count == 0 {
                    // Jump to the first inode of the next group.
                    ino = (current_group + 1) * self.inodes_per_group + 1;
                    current_group = u32::MAX;
                    continue;
                }

                self.read_block(desc.bg_inode_bitmap, &mut bitmap)?;
                bgd = Some(desc);
            }

            let desc = bgd.as_mut().unwrap();
            let byte = (ino_index / 8) as usize;
            let bit = ino_index % 8;
            if bitmap[byte] & (1 << bit) != 0 {
                ino += 1;
                continue;
            }

            bitmap[byte] |= 1 << bit;
            self.write_block(desc.bg_inode_bitmap, &bitmap)?;

            desc.bg_free_inodes_count -= 1;
            desc.write_to(&mut bgd_buf[bgd_location.offset..]);
            self.write_block(bgd_location.block, &bgd_buf)?;

            // Write the inode image, zeroing any rev-1 extra space.
            let inode_byte_offset = ino_index as usize * self.inode_size;
            let location = BlockLocation {
                block: desc.bg_inode_table + (inode_byte_offset / self.block_size) as u32,
                offset: inode_byte_offset % self.block_size,
            };

            let mut inode_buf = vec![0u8; self.block_size];
            self.read_block(location.block, &mut inode_buf)?;
            image.write_to(&mut inode_buf[location.offset..]);
            if self.inode_size > core::mem::size_of::<Ext2InodeRaw>() {
                let extra_start = location.offset + core::mem::size_of::<Ext2InodeRaw>();
                inode_buf[extra_start..location.offset + self.inode_size].fill(0);
            }
            self.write_block(location.block, &inode_buf)?;

            state.superblock.s_free_inodes_count -= 1;
            self.sync_superblock(&state)?;

            return Ok(ino);
        }

        log::error!("ext2: superblock claims free inodes but none were found");
        Err(KernelError::Corrupted)
    }

    /// Read an inode into a handle.
    pub fn read_inode(self: &Arc<Self>, ino: u32) -> Result<Inode> {
        let location = self.locate_inode(ino)?;
        let mut buf = vec![0u8; self.block_size];
        self.read_block(location.block, &mut buf)?;
        let raw = Ext2InodeRaw::from_bytes(&buf[location.offset..]).ok_or(KernelError::Corrupted)?;
        Ok(Inode::new(self.clone(), ino, raw))
    }

    pub fn root_inode(self: &Arc<Self>) -> Result<Inode> {
        self.read_inode(EXT2_ROOT_INO)
    }

    /// Resolve an absolute path to an inode.
    pub fn resolve_path(self: &Arc<Self>, path: &str) -> Result<Inode> {
        if !path.starts_with('/') {
            return Err(KernelError::InvalidInput);
        }

        let mut current = self.root_inode()?;
        for component in path.split('/').filter(|s| !s.is_empty()) {
            if !current.is_dir() {
                return Err(KernelError::NotDirectory);
            }
            let entry = current
                .find_entry(component)?
                .ok_or(KernelError::NotFound)?;
            current = self.read_inode(entry.inode)?;
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockDevice, Partition, RamDisk};

    const BS: usize = 1024;
    const BLOCKS: u32 = 64;
    const INODES: u32 = 16;
    const INODE_SIZE: usize = 128;

    // Layout of the test image (block size 1024, first_data_block 1):
    //   block 1: superblock
    //   block 2: block group descriptor table
    //   block 3: block bitmap
    //   block 4: inode bitmap
    //   block 5-6: inode table (16 inodes x 128 bytes)
    //   block 7: root directory data
    //   block 8: file data (only when a file is premade)
    struct ImageBuilder {
        image: Vec<u8>,
        used_blocks: Vec<u32>,
        used_inodes: u32,
    }

    impl ImageBuilder {
        fn new() -> Self {
            Self {
                image: vec![0u8; BS * BLOCKS as usize],
                used_blocks: (1..=7).collect(),
                used_inodes: 10,
            }
        }

        fn block_mut(&mut self, block: u32) -> &mut [u8] {
            &mut self.image[block as usize * BS..(block as usize + 1) * BS]
        }

        fn write_superblock(&mut self) {
            let free_blocks = BLOCKS - 1 - self.used_blocks.len() as u32;
            let free_inodes = INODES - self.used_inodes;

            let sb = self.block_mut(1);
            sb[0..4].copy_from_slice(&INODES.to_le_bytes());
            sb[4..8].copy_from_slice(&BLOCKS.to_le_bytes());
            sb[12..16].copy_from_slice(&free_blocks.to_le_bytes());
            sb[16..20].copy_from_slice(&free_inodes.to_le_bytes());
            sb[20..24].copy_from_slice(&1u32.to_le_bytes()); // first_data_block
            sb[24..28].copy_from_slice(&0u32.to_le_bytes()); // log_block_size
            sb[32..36].copy_from_slice(&BLOCKS.to_le_bytes()); // blocks_per_group
            sb[40..44].copy_from_slice(&INODES.to_le_bytes()); // inodes_per_group
            sb[56..58].copy_from_slice(&superblock::EXT2_SUPER_MAGIC.to_le_bytes());
            sb[58..60].copy_from_slice(&1u16.to_le_bytes()); // state
            sb[76..80].copy_from_slice(&1u32.to_le_bytes()); // rev 1
            sb[84..88].copy_from_slice(&11u32.to_le_bytes()); // first_ino
            sb[88..90].copy_from_slice(&(INODE_SIZE as u16).to_le_bytes());
            sb[96..100].copy_from_slice(&superblock::FEATURE_INCOMPAT_FILETYPE.to_le_bytes());
        }

        fn write_bgd(&mut self) {
            let free_blocks = (BLOCKS - 1 - self.used_blocks.len() as u32) as u16;
            let free_inodes = (INODES - self.used_inodes) as u16;
            let bgd = self.block_mut(2);
            bgd[0..4].copy_from_slice(&3u32.to_le_bytes()); // block bitmap
            bgd[4..8].copy_from_slice(&4u32.to_le_bytes()); // inode bitmap
            bgd[8..12].copy_from_slice(&5u32.to_le_bytes()); // inode table
            bgd[12..14].copy_from_slice(&free_blocks.to_le_bytes());
            bgd[14..16].copy_from_slice(&free_inodes.to_le_bytes());
        }

        fn write_bitmaps(&mut self) {
            let used = self.used_blocks.clone();
            let bitmap = self.block_mut(3);
            // Bit i covers block first_data_block + i.
            for block in used {
                let bit = block - 1;
                bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
            }
            // Mark everything past the device end as used.
            for bit in (BLOCKS - 1)..(BS as u32 * 8) {
                bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
            }

            let used_inodes = self.used_inodes;
            let inode_bitmap = self.block_mut(4);
            for index in 0..used_inodes {
                inode_bitmap[(index / 8) as usize] |= 1 << (index % 8);
            }
        }

        fn write_inode(&mut self, ino: u32, mode: u16, size: u32, blocks_512: u32, block0: u32) {
            let offset = 5 * BS + (ino as usize - 1) * INODE_SIZE;
            let inode = &mut self.image[offset..offset + INODE_SIZE];
            inode[0..2].copy_from_slice(&mode.to_le_bytes()); // i_mode
            inode[4..8].copy_from_slice(&size.to_le_bytes()); // i_size
            inode[26..28].copy_from_slice(&1u16.to_le_bytes()); // links
            inode[28..32].copy_from_slice(&blocks_512.to_le_bytes()); // i_blocks
            inode[40..44].copy_from_slice(&block0.to_le_bytes()); // i_block[0]
        }

        fn write_root_dir(&mut self, extra: Option<(&str, u32)>) {
            let mut dir = vec![0u8; BS];
            dir[0..4].copy_from_slice(&2u32.to_le_bytes());
            dir[4..6].copy_from_slice(&12u16.to_le_bytes());
            dir[6] = 1;
            dir[7] = dir::EXT2_FT_DIR;
            dir[8] = b'.';

            dir[12..16].copy_from_slice(&2u32.to_le_bytes());
            dir[18] = 2;
            dir[19] = dir::EXT2_FT_DIR;
            dir[20] = b'.';
            dir[21] = b'.';

            match extra {
                Some((name, ino)) => {
                    dir[16..18].copy_from_slice(&12u16.to_le_bytes());
                    let offset = 24;
                    let rec_len = (BS - offset) as u16;
                    dir[offset..offset + 4].copy_from_slice(&ino.to_le_bytes());
                    dir[offset + 4..offset + 6].copy_from_slice(&rec_len.to_le_bytes());
                    dir[offset + 6] = name.len() as u8;
                    dir[offset + 7] = dir::EXT2_FT_REG_FILE;
                    dir[offset + 8..offset + 8 + name.len()].copy_from_slice(name.as_bytes());
                }
                None => {
                    // ".." spans the rest of the block.
                    dir[16..18].copy_from_slice(&((BS - 12) as u16).to_le_bytes());
                }
            }

            self.block_mut(7).copy_from_slice(&dir);
        }

        fn build(mut self) -> Arc<Ext2Fs> {
            self.write_superblock();
            self.write_bgd();
            self.write_bitmaps();
            let disk = Arc::new(RamDisk::from_image(512, self.image));
            Ext2Fs::mount(Partition::whole(disk)).expect("mount test image")
        }
    }

    /// An image with an empty root directory.
    fn empty_fs() -> Arc<Ext2Fs> {
        let mut builder = ImageBuilder::new();
        builder.write_inode(2, file_mode::IFDIR | 0o755, BS as u32, 2, 7);
        builder.write_root_dir(None);
        builder.build()
    }

    /// An image holding /hello.txt with "Hello, world!\n".
    fn hello_fs() -> Arc<Ext2Fs> {
        let mut builder = ImageBuilder::new();
        builder.used_blocks.push(8);
        builder.used_inodes = 11; // reserve inode 11 for the file
        builder.write_inode(2, file_mode::IFDIR | 0o755, BS as u32, 2, 7);
        builder.write_inode(11, file_mode::IFREG | 0o644, 14, 2, 8);
        builder.write_root_dir(Some(("hello.txt", 11)));
        builder.block_mut(8)[..14].copy_from_slice(b"Hello, world!\n");
        builder.build()
    }

    #[test]
    fn test_mount_and_read_hello() {
        let fs = hello_fs();
        let mut inode = fs.resolve_path("/hello.txt").expect("file exists");
        assert!(inode.is_file());
        assert_eq!(inode.size(), 14);

        let mut buf = [0u8; 32];
        let n = inode.read_at(0, &mut buf).unwrap();
        assert_eq!(n, 14);
        assert_eq!(&buf[..14], b"Hello, world!\n");
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let fs = hello_fs();
        assert!(matches!(
            fs.resolve_path("/nope.txt"),
            Err(KernelError::NotFound)
        ));
    }

    #[test]
    fn test_invalid_magic_fails_mount() {
        let mut builder = ImageBuilder::new();
        builder.write_inode(2, file_mode::IFDIR | 0o755, BS as u32, 2, 7);
        builder.write_root_dir(None);
        builder.write_superblock();
        builder.write_bgd();
        builder.write_bitmaps();
        builder.block_mut(1)[56..58].copy_from_slice(&0u16.to_le_bytes());
        let disk = Arc::new(RamDisk::from_image(512, builder.image));
        assert!(matches!(
            Ext2Fs::mount(Partition::whole(disk)),
            Err(KernelError::InvalidFormat)
        ));
    }

    #[test]
    fn test_write_read_round_trip() {
        let fs = empty_fs();
        let mut root = fs.root_inode().unwrap();
        let ino = root.create_file("data.bin", file_mode::IFREG | 0o644, 0, 0).unwrap();
        let mut file = fs.read_inode(ino).unwrap();

        // Straddle block boundaries: 3000 bytes at offset 500.
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(file.write_at(500, &data).unwrap(), 3000);
        assert_eq!(file.size(), 3500, "Size is max(old, offset+len)");

        let mut back = vec![0u8; 3000];
        assert_eq!(file.read_at(500, &mut back).unwrap(), 3000);
        assert_eq!(back, data);

        // The zero-extended head reads as zeros.
        let mut head = [0xFFu8; 500];
        assert_eq!(file.read_at(0, &mut head).unwrap(), 500);
        assert!(head.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_allocation_accounting() {
        let fs = empty_fs();
        let before = fs.free_blocks_count();

        let mut root = fs.root_inode().unwrap();
        let ino = root.create_file("acct", file_mode::IFREG | 0o644, 0, 0).unwrap();
        let mut file = fs.read_inode(ino).unwrap();

        // Two data blocks, no indirection.
        file.truncate(2 * BS as u64).unwrap();
        assert_eq!(
            fs.free_blocks_count(),
            before - 2,
            "Superblock free count drops by exactly the blocks allocated"
        );
        assert_eq!({ file.raw().i_blocks }, 2 * (BS as u32 / 512));
    }

    #[test]
    fn test_indirect_allocation_accounting() {
        let fs = empty_fs();
        let mut root = fs.root_inode().unwrap();
        let ino = root.create_file("big", file_mode::IFREG | 0o644, 0, 0).unwrap();
        let mut file = fs.read_inode(ino).unwrap();

        // 13 data blocks forces one singly-indirect table.
        let before = fs.free_blocks_count();
        file.truncate(13 * BS as u64).unwrap();
        assert_eq!(fs.free_blocks_count(), before - 14, "13 data + 1 indirect");
        assert_eq!({ file.raw().i_blocks }, 14 * (BS as u32 / 512));

        // Data written through the indirect path reads back.
        let payload = vec![0x5Au8; BS];
        file.write_at(12 * BS as u64, &payload).unwrap();
        let mut back = vec![0u8; BS];
        file.read_at(12 * BS as u64, &mut back).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_create_file_ordering_and_types() {
        let fs = empty_fs();
        let mut root = fs.root_inode().unwrap();

        root.create_file("a", file_mode::IFREG | 0o644, 0, 0).unwrap();
        root.create_file("b", file_mode::IFREG | 0o644, 0, 0).unwrap();

        let names: Vec<_> = root
            .list_dir()
            .unwrap()
            .into_iter()
            .filter(|e| !e.is_dot() && !e.is_dotdot())
            .collect();
        assert_eq!(names.len(), 2);
        assert_eq!(names[0].name, "a");
        assert_eq!(names[1].name, "b");
        assert!(names.iter().all(|e| e.file_type == dir::EXT2_FT_REG_FILE));
    }

    #[test]
    fn test_duplicate_create_fails() {
        let fs = empty_fs();
        let mut root = fs.root_inode().unwrap();
        root.create_file("dup", file_mode::IFREG | 0o644, 0, 0).unwrap();
        assert!(matches!(
            root.create_file("dup", file_mode::IFREG | 0o644, 0, 0),
            Err(KernelError::AlreadyExists)
        ));
    }

    #[test]
    fn test_created_file_is_resolvable() {
        let fs = empty_fs();
        let mut root = fs.root_inode().unwrap();
        let ino = root.create_file("x.txt", file_mode::IFREG | 0o644, 0, 0).unwrap();
        assert!(ino >= 11, "Allocated inodes start at first_ino");

        let mut file = fs.resolve_path("/x.txt").unwrap();
        assert_eq!(file.ino(), ino);
        file.write_at(0, b"abc").unwrap();

        let mut buf = [0u8; 3];
        let mut again = fs.resolve_path("/x.txt").unwrap();
        again.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abc");
    }
}
