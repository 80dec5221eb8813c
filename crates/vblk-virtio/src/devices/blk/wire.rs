//! Guest-visible virtio-blk layouts and constants.

pub const VIRTIO_DEVICE_TYPE_BLK: u16 = 2;

pub const VIRTIO_BLK_SECTOR_SIZE: u64 = 512;
pub const VIRTIO_BLK_SECTOR_SHIFT: u32 = 9;

pub const VIRTIO_BLK_F_SIZE_MAX: u64 = 1 << 1;
pub const VIRTIO_BLK_F_SEG_MAX: u64 = 1 << 2;
pub const VIRTIO_BLK_F_GEOMETRY: u64 = 1 << 4;
pub const VIRTIO_BLK_F_RO: u64 = 1 << 5;
pub const VIRTIO_BLK_F_BLK_SIZE: u64 = 1 << 6;
pub const VIRTIO_BLK_F_SCSI: u64 = 1 << 7;
pub const VIRTIO_BLK_F_FLUSH: u64 = 1 << 9;
pub const VIRTIO_BLK_F_TOPOLOGY: u64 = 1 << 10;
pub const VIRTIO_BLK_F_CONFIG_WCE: u64 = 1 << 11;
pub const VIRTIO_BLK_F_MQ: u64 = 1 << 12;
pub const VIRTIO_BLK_F_DISCARD: u64 = 1 << 13;
pub const VIRTIO_BLK_F_WRITE_ZEROES: u64 = 1 << 14;
pub const VIRTIO_BLK_F_ZONED: u64 = 1 << 17;

/// Legacy name of [`VIRTIO_BLK_F_FLUSH`].
pub const VIRTIO_BLK_F_WCE: u64 = VIRTIO_BLK_F_FLUSH;

pub const VIRTIO_F_RING_INDIRECT_DESC: u64 = 1 << 28;
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

pub const VIRTIO_BLK_T_IN: u32 = 0;
pub const VIRTIO_BLK_T_OUT: u32 = 1;
pub const VIRTIO_BLK_T_SCSI_CMD: u32 = 2;
pub const VIRTIO_BLK_T_FLUSH: u32 = 4;
pub const VIRTIO_BLK_T_GET_ID: u32 = 8;
pub const VIRTIO_BLK_T_DISCARD: u32 = 11;
pub const VIRTIO_BLK_T_WRITE_ZEROES: u32 = 13;
pub const VIRTIO_BLK_T_ZONE_APPEND: u32 = 15;
pub const VIRTIO_BLK_T_ZONE_REPORT: u32 = 16;
pub const VIRTIO_BLK_T_ZONE_OPEN: u32 = 18;
pub const VIRTIO_BLK_T_ZONE_CLOSE: u32 = 20;
pub const VIRTIO_BLK_T_ZONE_FINISH: u32 = 22;
pub const VIRTIO_BLK_T_ZONE_RESET: u32 = 24;
pub const VIRTIO_BLK_T_ZONE_RESET_ALL: u32 = 26;
pub const VIRTIO_BLK_T_BARRIER: u32 = 0x8000_0000;

pub const VIRTIO_BLK_S_OK: u8 = 0;
pub const VIRTIO_BLK_S_IOERR: u8 = 1;
pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;
pub const VIRTIO_BLK_S_ZONE_INVALID_CMD: u8 = 3;
pub const VIRTIO_BLK_S_ZONE_UNALIGNED_WP: u8 = 4;
pub const VIRTIO_BLK_S_ZONE_OPEN_RESOURCE: u8 = 5;
pub const VIRTIO_BLK_S_ZONE_ACTIVE_RESOURCE: u8 = 6;

pub const VIRTIO_BLK_ID_BYTES: usize = 20;

// `struct virtio_blk_discard_write_zeroes::flags`.
pub const VIRTIO_BLK_WRITE_ZEROES_FLAG_UNMAP: u32 = 1 << 0;

pub const VIRTIO_BLK_ZT_CONV: u8 = 1;
pub const VIRTIO_BLK_ZT_SWR: u8 = 2;
pub const VIRTIO_BLK_ZT_SWP: u8 = 3;

pub const VIRTIO_BLK_ZS_NOT_WP: u8 = 0;
pub const VIRTIO_BLK_ZS_EMPTY: u8 = 1;
pub const VIRTIO_BLK_ZS_IOPEN: u8 = 2;
pub const VIRTIO_BLK_ZS_EOPEN: u8 = 3;
pub const VIRTIO_BLK_ZS_CLOSED: u8 = 4;
pub const VIRTIO_BLK_ZS_RDONLY: u8 = 13;
pub const VIRTIO_BLK_ZS_FULL: u8 = 14;
pub const VIRTIO_BLK_ZS_OFFLINE: u8 = 15;

pub const VIRTIO_BLK_Z_NONE: u8 = 0;
pub const VIRTIO_BLK_Z_HM: u8 = 1;

pub const SCSI_CHECK_CONDITION: u8 = 2;

/// `struct virtio_blk_outhdr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub type_: u32,
    pub ioprio: u32,
    pub sector: u64,
}

impl RequestHeader {
    pub const SIZE: usize = 16;

    pub fn parse(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            type_: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            ioprio: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            sector: u64::from_le_bytes([
                bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14],
                bytes[15],
            ]),
        }
    }
}

/// `struct virtio_blk_discard_write_zeroes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscardWriteZeroesSegment {
    pub sector: u64,
    pub num_sectors: u32,
    pub flags: u32,
}

impl DiscardWriteZeroesSegment {
    pub const SIZE: usize = 16;

    pub fn parse(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            sector: u64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]),
            num_sectors: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            flags: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        }
    }
}

/// Size of `struct virtio_blk_zone_report` without its descriptor array.
pub const ZONE_REPORT_HEADER_SIZE: usize = 64;
/// Size of one `struct virtio_blk_zone_descriptor`.
pub const ZONE_DESCRIPTOR_SIZE: usize = 64;

/// `struct virtio_scsi_inhdr`.
pub const SCSI_INHDR_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VirtioBlkGeometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VirtioBlkZonedCharacteristics {
    pub zone_sectors: u32,
    pub max_open_zones: u32,
    pub max_active_zones: u32,
    pub max_append_sectors: u32,
    pub write_granularity: u32,
    pub model: u8,
}

/// `struct virtio_blk_config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VirtioBlkConfig {
    /// Capacity in 512-byte sectors.
    pub capacity: u64,
    pub size_max: u32,
    pub seg_max: u32,
    pub geometry: VirtioBlkGeometry,
    pub blk_size: u32,
    pub physical_block_exp: u8,
    pub alignment_offset: u8,
    pub min_io_size: u16,
    pub opt_io_size: u32,
    pub wce: u8,
    pub num_queues: u16,
    pub max_discard_sectors: u32,
    pub max_discard_seg: u32,
    pub discard_sector_alignment: u32,
    pub max_write_zeroes_sectors: u32,
    pub max_write_zeroes_seg: u32,
    pub write_zeroes_may_unmap: u8,
    pub zoned: VirtioBlkZonedCharacteristics,
}

impl VirtioBlkConfig {
    pub const SIZE: usize = 96;
    pub const WCE_OFFSET: usize = 32;

    /// Guest-visible config size for a device offering `host_features`.
    pub fn size_for_features(host_features: u64) -> usize {
        // Everything up to (and excluding) max_discard_sectors is always present.
        let mut size = 36;
        if host_features & VIRTIO_BLK_F_DISCARD != 0 {
            size = size.max(48);
        }
        if host_features & VIRTIO_BLK_F_WRITE_ZEROES != 0 {
            size = size.max(57);
        }
        if host_features & VIRTIO_BLK_F_ZONED != 0 {
            size = size.max(Self::SIZE);
        }
        size
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut cfg = [0u8; Self::SIZE];
        cfg[0..8].copy_from_slice(&self.capacity.to_le_bytes());
        cfg[8..12].copy_from_slice(&self.size_max.to_le_bytes());
        cfg[12..16].copy_from_slice(&self.seg_max.to_le_bytes());
        cfg[16..18].copy_from_slice(&self.geometry.cylinders.to_le_bytes());
        cfg[18] = self.geometry.heads;
        cfg[19] = self.geometry.sectors;
        cfg[20..24].copy_from_slice(&self.blk_size.to_le_bytes());
        cfg[24] = self.physical_block_exp;
        cfg[25] = self.alignment_offset;
        cfg[26..28].copy_from_slice(&self.min_io_size.to_le_bytes());
        cfg[28..32].copy_from_slice(&self.opt_io_size.to_le_bytes());
        cfg[Self::WCE_OFFSET] = self.wce;
        cfg[34..36].copy_from_slice(&self.num_queues.to_le_bytes());
        cfg[36..40].copy_from_slice(&self.max_discard_sectors.to_le_bytes());
        cfg[40..44].copy_from_slice(&self.max_discard_seg.to_le_bytes());
        cfg[44..48].copy_from_slice(&self.discard_sector_alignment.to_le_bytes());
        cfg[48..52].copy_from_slice(&self.max_write_zeroes_sectors.to_le_bytes());
        cfg[52..56].copy_from_slice(&self.max_write_zeroes_seg.to_le_bytes());
        cfg[56] = self.write_zeroes_may_unmap;
        // 60..72: secure erase limits, not offered.
        cfg[72..76].copy_from_slice(&self.zoned.zone_sectors.to_le_bytes());
        cfg[76..80].copy_from_slice(&self.zoned.max_open_zones.to_le_bytes());
        cfg[80..84].copy_from_slice(&self.zoned.max_active_zones.to_le_bytes());
        cfg[84..88].copy_from_slice(&self.zoned.max_append_sectors.to_le_bytes());
        cfg[88..92].copy_from_slice(&self.zoned.write_granularity.to_le_bytes());
        cfg[92] = self.zoned.model;
        cfg
    }

    /// Reads `data.len()` bytes at `offset` from the first `visible` bytes of the config space.
    /// Bytes past the visible window read as zero.
    pub fn read(&self, visible: usize, offset: u64, data: &mut [u8]) {
        let bytes = self.to_bytes();
        let cfg = &bytes[..visible.min(Self::SIZE)];

        // Guest offsets are `u64` but config space is a small fixed-size array.
        let start: usize = match offset.try_into() {
            Ok(v) => v,
            Err(_) => {
                data.fill(0);
                return;
            }
        };
        if start >= cfg.len() {
            data.fill(0);
            return;
        }
        let end = start
            .checked_add(data.len())
            .unwrap_or(cfg.len())
            .min(cfg.len());
        data[..end - start].copy_from_slice(&cfg[start..end]);
        if end - start < data.len() {
            data[end - start..].fill(0);
        }
    }
}
