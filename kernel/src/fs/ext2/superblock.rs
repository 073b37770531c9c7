//! ext2 superblock structures and parsing.
//!
//! The superblock is always located at byte offset 1024 from the start
//! of the partition and is 1024 bytes wide.

use alloc::vec::Vec;
use core::mem;

use crate::error::{KernelError, Result};

/// ext2 magic number.
pub const EXT2_SUPER_MAGIC: u16 = 0xEF53;

/// Byte offset of the superblock from the partition start.
pub const SUPERBLOCK_OFFSET: usize = 1024;

/// Reserved inode numbers.
pub const EXT2_ROOT_INO: u32 = 2;

/// Revision 0 constants.
pub const GOOD_OLD_FIRST_INO: u32 = 11;
pub const GOOD_OLD_INODE_SIZE: u16 = 128;

// Incompatible feature flags.
pub const FEATURE_INCOMPAT_COMPRESSION: u32 = 0x0001;
pub const FEATURE_INCOMPAT_FILETYPE: u32 = 0x0002;
pub const FEATURE_INCOMPAT_RECOVER: u32 = 0x0004;
pub const FEATURE_INCOMPAT_JOURNAL_DEV: u32 = 0x0008;
pub const FEATURE_INCOMPAT_META_BG: u32 = 0x0010;

/// Byte offset of the rev-1 extension region inside the superblock
/// (everything from `s_first_ino` on).
const EXTENSION_OFFSET: usize = 84;

/// ext2 superblock.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct Ext2Superblock {
    pub s_inodes_count: u32,
    pub s_blocks_count: u32,
    pub s_r_blocks_count: u32,
    pub s_free_blocks_count: u32,
    pub s_free_inodes_count: u32,
    pub s_first_data_block: u32,
    pub s_log_block_size: u32,
    pub s_log_frag_size: u32,
    pub s_blocks_per_group: u32,
    pub s_frags_per_group: u32,
    pub s_inodes_per_group: u32,
    pub s_mtime: u32,
    pub s_wtime: u32,
    pub s_mnt_count: u16,
    pub s_max_mnt_count: u16,
    pub s_magic: u16,
    pub s_state: u16,
    pub s_errors: u16,
    pub s_minor_rev_level: u16,
    pub s_lastcheck: u32,
    pub s_checkinterval: u32,
    pub s_creator_os: u32,
    pub s_rev_level: u32,
    pub s_def_resuid: u16,
    pub s_def_resgid: u16,
    // Extended superblock fields (rev 1+); the extension region starts
    // here.
    pub s_first_ino: u32,
    pub s_inode_size: u16,
    pub s_block_group_nr: u16,
    pub s_feature_compat: u32,
    pub s_feature_incompat: u32,
    pub s_feature_ro_compat: u32,
    pub s_uuid: [u8; 16],
    pub s_volume_name: [u8; 16],
    _reserved: [u8; 888],
}

const _: () = assert!(mem::size_of::<Ext2Superblock>() == 1024);

impl Ext2Superblock {
    /// Parse a superblock from at least 1024 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < mem::size_of::<Ext2Superblock>() {
            return None;
        }
        // SAFETY: the slice is large enough and the struct is packed,
        // so alignment is not a concern.
        Some(unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const Ext2Superblock) })
    }

    /// Serialize back to on-disk bytes.
    pub fn as_bytes(&self) -> [u8; 1024] {
        let mut bytes = [0u8; 1024];
        // SAFETY: the struct is exactly 1024 bytes and plain data.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self as *const Ext2Superblock as *const u8,
                bytes.as_mut_ptr(),
                1024,
            );
        }
        bytes
    }

    pub fn is_valid(&self) -> bool {
        self.s_magic == EXT2_SUPER_MAGIC
    }

    /// Block size in bytes: `1024 << s_log_block_size`.
    pub fn block_size(&self) -> usize {
        1024 << self.s_log_block_size
    }

    pub fn block_group_count(&self) -> u32 {
        self.s_blocks_count.div_ceil(self.s_blocks_per_group)
    }

    pub fn inode_size(&self) -> usize {
        if self.s_rev_level == 0 {
            GOOD_OLD_INODE_SIZE as usize
        } else {
            self.s_inode_size as usize
        }
    }

    pub fn first_ino(&self) -> u32 {
        if self.s_rev_level == 0 {
            GOOD_OLD_FIRST_INO
        } else {
            self.s_first_ino
        }
    }

    /// Revision 0 superblocks carry garbage in the extension region;
    /// zero it and pin the rev-0 constants so the rest of the code can
    /// read the fields uniformly.
    pub fn normalize_rev0(&mut self) {
        if self.s_rev_level != 0 {
            return;
        }
        let bytes = self as *mut Ext2Superblock as *mut u8;
        unsafe {
            core::ptr::write_bytes(bytes.add(EXTENSION_OFFSET), 0, 1024 - EXTENSION_OFFSET);
        }
        self.s_first_ino = GOOD_OLD_FIRST_INO;
        self.s_inode_size = GOOD_OLD_INODE_SIZE;
    }

    /// How many superblock bytes participate in a sync: rev 0 writes
    /// only the classic region.
    pub fn sync_length(&self) -> usize {
        if self.s_rev_level == 0 {
            EXTENSION_OFFSET
        } else {
            mem::size_of::<Ext2Superblock>()
        }
    }

    /// Reject filesystems we cannot drive. Directory entries without
    /// the filetype byte are the only hard requirement; the journal /
    /// compression / meta-bg families are refused outright.
    pub fn validate_features(&self) -> Result<()> {
        if self.s_rev_level == 0 {
            // Rev 0 predates the incompat mask entirely.
            return Ok(());
        }
        if self.s_feature_incompat & FEATURE_INCOMPAT_FILETYPE == 0 {
            log::warn!("ext2: directory entries without filetype not supported");
            return Err(KernelError::NotSupported);
        }
        for (flag, name) in [
            (FEATURE_INCOMPAT_COMPRESSION, "COMPRESSION"),
            (FEATURE_INCOMPAT_JOURNAL_DEV, "JOURNAL_DEV"),
            (FEATURE_INCOMPAT_META_BG, "META_BG"),
            (FEATURE_INCOMPAT_RECOVER, "RECOVER"),
        ] {
            if self.s_feature_incompat & flag != 0 {
                log::warn!("ext2: incompatible feature {} not supported", name);
                return Err(KernelError::NotSupported);
            }
        }
        Ok(())
    }

    /// Block groups holding a superblock backup: every group in rev 0,
    /// group 1 and the powers of 3, 5 and 7 otherwise.
    pub fn backup_block_groups(&self) -> Vec<u32> {
        let group_count = self.block_group_count();
        let mut backups = Vec::new();

        if self.s_rev_level == 0 {
            for group in 1..group_count {
                backups.push(group);
            }
            return backups;
        }

        if group_count > 1 {
            backups.push(1);
        }
        for base in [3u32, 5, 7] {
            let mut group = base;
            while group < group_count {
                backups.push(group);
                group = match group.checked_mul(base) {
                    Some(next) => next,
                    None => break,
                };
            }
        }
        backups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build superblock bytes with typical rev-1 values.
    pub(crate) fn mock_superblock_bytes() -> [u8; 1024] {
        let mut bytes = [0u8; 1024];
        bytes[0..4].copy_from_slice(&1024u32.to_le_bytes()); // inodes_count
        bytes[4..8].copy_from_slice(&8192u32.to_le_bytes()); // blocks_count
        bytes[12..16].copy_from_slice(&7000u32.to_le_bytes()); // free_blocks
        bytes[16..20].copy_from_slice(&1000u32.to_le_bytes()); // free_inodes
        bytes[20..24].copy_from_slice(&1u32.to_le_bytes()); // first_data_block
        bytes[24..28].copy_from_slice(&0u32.to_le_bytes()); // log_block_size
        bytes[32..36].copy_from_slice(&8192u32.to_le_bytes()); // blocks_per_group
        bytes[40..44].copy_from_slice(&1024u32.to_le_bytes()); // inodes_per_group
        bytes[56..58].copy_from_slice(&EXT2_SUPER_MAGIC.to_le_bytes());
        bytes[58..60].copy_from_slice(&1u16.to_le_bytes()); // state
        bytes[76..80].copy_from_slice(&1u32.to_le_bytes()); // rev_level
        bytes[84..88].copy_from_slice(&11u32.to_le_bytes()); // first_ino
        bytes[88..90].copy_from_slice(&128u16.to_le_bytes()); // inode_size
        bytes[96..100].copy_from_slice(&FEATURE_INCOMPAT_FILETYPE.to_le_bytes());
        bytes
    }

    #[test]
    fn test_magic_validation() {
        let bytes = mock_superblock_bytes();
        let sb = Ext2Superblock::from_bytes(&bytes).expect("parse");
        assert!(sb.is_valid());

        let mut bad = bytes;
        bad[56..58].copy_from_slice(&0x53EFu16.to_le_bytes());
        assert!(!Ext2Superblock::from_bytes(&bad).unwrap().is_valid(), "Swapped magic bytes must be rejected");
    }

    #[test]
    fn test_block_size_variants() {
        let mut bytes = mock_superblock_bytes();
        assert_eq!(Ext2Superblock::from_bytes(&bytes).unwrap().block_size(), 1024);
        bytes[24..28].copy_from_slice(&2u32.to_le_bytes());
        assert_eq!(Ext2Superblock::from_bytes(&bytes).unwrap().block_size(), 4096);
    }

    #[test]
    fn test_block_group_count_rounds_up() {
        let mut bytes = mock_superblock_bytes();
        assert_eq!(Ext2Superblock::from_bytes(&bytes).unwrap().block_group_count(), 1);
        bytes[4..8].copy_from_slice(&10000u32.to_le_bytes());
        assert_eq!(Ext2Superblock::from_bytes(&bytes).unwrap().block_group_count(), 2);
    }

    #[test]
    fn test_rev0_normalization() {
        let mut bytes = mock_superblock_bytes();
        bytes[76..80].copy_from_slice(&0u32.to_le_bytes()); // rev 0
        bytes[84..88].copy_from_slice(&999u32.to_le_bytes()); // garbage first_ino
        bytes[88..90].copy_from_slice(&64u16.to_le_bytes()); // garbage inode_size

        let mut sb = Ext2Superblock::from_bytes(&bytes).unwrap();
        sb.normalize_rev0();
        assert_eq!(sb.first_ino(), 11);
        assert_eq!(sb.inode_size(), 128);
        assert_eq!(sb.sync_length(), 84, "Rev 0 syncs only the classic region");
    }

    #[test]
    fn test_feature_rejection() {
        let mut bytes = mock_superblock_bytes();
        bytes[96..100]
            .copy_from_slice(&(FEATURE_INCOMPAT_FILETYPE | FEATURE_INCOMPAT_COMPRESSION).to_le_bytes());
        let sb = Ext2Superblock::from_bytes(&bytes).unwrap();
        assert_eq!(sb.validate_features(), Err(KernelError::NotSupported));

        let mut bytes = mock_superblock_bytes();
        bytes[96..100].copy_from_slice(&0u32.to_le_bytes());
        let sb = Ext2Superblock::from_bytes(&bytes).unwrap();
        assert_eq!(
            sb.validate_features(),
            Err(KernelError::NotSupported),
            "Missing FILETYPE must be rejected"
        );
    }

    #[test]
    fn test_backup_groups_powers() {
        let mut bytes = mock_superblock_bytes();
        // 100 groups: backups at 1, 3, 9, 27, 81, 5, 25, 7, 49.
        bytes[4..8].copy_from_slice(&(100u32 * 8192).to_le_bytes());
        let sb = Ext2Superblock::from_bytes(&bytes).unwrap();
        let mut backups = sb.backup_block_groups();
        backups.sort_unstable();
        assert_eq!(backups, vec![1, 3, 5, 7, 9, 25, 27, 49, 81]);
    }

    #[test]
    fn test_serialization_round_trip() {
        let bytes = mock_superblock_bytes();
        let sb = Ext2Superblock::from_bytes(&bytes).unwrap();
        assert_eq!(sb.as_bytes()[..], bytes[..]);
    }
}
