//! Partition window over a block device.

use alloc::sync::Arc;

use super::{BlockDevice, BlockError};

/// A contiguous sector range of an underlying device, exposed as a
/// device of its own.
pub struct Partition {
    device: Arc<dyn BlockDevice>,
    first_sector: u64,
    sector_count: u64,
}

impl Partition {
    pub fn new(device: Arc<dyn BlockDevice>, first_sector: u64, sector_count: u64) -> Self {
        Self {
            device,
            first_sector,
            sector_count,
        }
    }

    /// The whole device as one partition.
    pub fn whole(device: Arc<dyn BlockDevice>) -> Self {
        let sector_count = device.sector_count();
        Self::new(device, 0, sector_count)
    }

    pub fn device(&self) -> &dyn BlockDevice {
        self.device.as_ref()
    }

    fn check_range(&self, lba: u64, count: usize) -> Result<(), BlockError> {
        if lba + count as u64 > self.sector_count {
            return Err(BlockError::OutOfBounds);
        }
        Ok(())
    }
}

impl BlockDevice for Partition {
    fn sector_size(&self) -> usize {
        self.device.sector_size()
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    fn read_sectors(&self, lba: u64, count: usize, buf: &mut [u8]) -> Result<(), BlockError> {
        self.check_range(lba, count)?;
        self.device.read_sectors(self.first_sector + lba, count, buf)
    }

    fn write_sectors(&self, lba: u64, count: usize, buf: &[u8]) -> Result<(), BlockError> {
        self.check_range(lba, count)?;
        self.device.write_sectors(self.first_sector + lba, count, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::super::RamDisk;
    use super::*;

    #[test]
    fn test_partition_offsets_and_bounds() {
        let disk = Arc::new(RamDisk::new(512, 16));
        let mut sector = [0xAAu8; 512];
        disk.write_sectors(4, 1, &sector).unwrap();

        let part = Partition::new(disk.clone(), 4, 8);
        assert_eq!(part.sector_count(), 8);

        let mut buf = [0u8; 512];
        part.read_sectors(0, 1, &mut buf).unwrap();
        assert_eq!(buf[0], 0xAA, "Partition LBA 0 is device LBA 4");

        sector.fill(0x55);
        part.write_sectors(7, 1, &sector).unwrap();
        part.read_sectors(7, 1, &mut buf).unwrap();
        assert_eq!(buf[0], 0x55);

        assert_eq!(
            part.read_sectors(8, 1, &mut buf),
            Err(BlockError::OutOfBounds),
            "Reads past the partition end must fail"
        );
    }
}
