use vblk_storage::{BackendInfo, REQUEST_MAX_SECTORS};

use super::wire::VIRTIO_BLK_SECTOR_SHIFT;

/// Geometry used to vet guest-supplied sector ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorRange {
    total_sectors: u64,
    sector_mask: u64,
    logical_block_size: u64,
}

impl SectorRange {
    pub fn new(capacity_bytes: u64, logical_block_size: u32) -> Self {
        let lbs = u64::from(logical_block_size.max(512));
        Self {
            total_sectors: capacity_bytes >> VIRTIO_BLK_SECTOR_SHIFT,
            sector_mask: (lbs >> VIRTIO_BLK_SECTOR_SHIFT) - 1,
            logical_block_size: lbs,
        }
    }

    pub fn from_info(info: &BackendInfo) -> Self {
        Self::new(info.capacity_bytes, info.logical_block_size)
    }

    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    /// Whether `size` bytes starting at 512-byte `sector` form an acceptable request.
    pub fn valid(&self, sector: u64, size: u64) -> bool {
        let nb_sectors = size >> VIRTIO_BLK_SECTOR_SHIFT;
        if nb_sectors > REQUEST_MAX_SECTORS {
            return false;
        }
        if sector & self.sector_mask != 0 {
            return false;
        }
        if size % self.logical_block_size != 0 {
            return false;
        }
        sector <= self.total_sectors && nb_sectors <= self.total_sectors - sector
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const CAP_SECTORS: u64 = 2048;

    fn range() -> SectorRange {
        SectorRange::new(CAP_SECTORS * 512, 512)
    }

    #[test]
    fn last_sector_is_readable_but_not_past_it() {
        let r = range();
        assert!(r.valid(CAP_SECTORS - 1, 512));
        assert!(!r.valid(CAP_SECTORS - 1, 1024));
        assert!(!r.valid(CAP_SECTORS, 512));
        assert!(r.valid(CAP_SECTORS, 0));
        assert!(!r.valid(CAP_SECTORS + 1, 0));
    }

    #[test]
    fn overflowing_ranges_are_rejected() {
        let r = range();
        assert!(!r.valid(u64::MAX, 512));
        assert!(!r.valid(1, u64::MAX & !511));
    }

    #[test]
    fn logical_block_alignment_is_enforced() {
        let r = SectorRange::new(CAP_SECTORS * 512, 4096);
        assert!(r.valid(8, 4096));
        assert!(!r.valid(4, 4096));
        assert!(!r.valid(8, 512));
    }

    #[test]
    fn oversized_request_is_rejected_even_on_huge_disks() {
        let r = SectorRange::new(u64::MAX & !511, 512);
        assert!(r.valid(0, REQUEST_MAX_SECTORS << 9));
        assert!(!r.valid(0, (REQUEST_MAX_SECTORS + 1) << 9));
    }

    proptest! {
        #[test]
        fn accepted_ranges_fit_inside_the_disk(sector in 0u64..4096, sectors in 0u64..4096) {
            let r = range();
            let ok = r.valid(sector, sectors * 512);
            prop_assert_eq!(ok, sector + sectors <= CAP_SECTORS);
        }
    }
}
