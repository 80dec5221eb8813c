//! Zone report, zone management and zone append.

use std::sync::Arc;

use vblk_memory::SgList;
use vblk_storage::{
    BackendInfo, BackendOp, BackendReply, BackendResult, BlockZoneDescriptor, BlockZoneState,
    BlockZoneType, ZoneOp,
};

use super::accounting::AcctKind;
use super::completion::Token;
use super::decode::ZoneMgmtOp;
use super::request::{RequestId, RequestState};
use super::wire::*;
use super::{BlkInner, QueueState};

/// Zone geometry used to vet zoned commands. Sizes are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZonedLimits {
    pub capacity: u64,
    pub zone_size: u64,
    pub write_granularity: u32,
    pub max_append_sectors: u32,
}

impl ZonedLimits {
    /// `None` for backends without zones.
    pub fn from_info(info: &BackendInfo) -> Option<Self> {
        let zoned = info.zoned?;
        Some(Self {
            capacity: info.total_sectors() << VIRTIO_BLK_SECTOR_SHIFT,
            zone_size: zoned.zone_size,
            write_granularity: zoned.write_granularity,
            max_append_sectors: zoned.max_append_sectors,
        })
    }
}

/// Checks `[offset, offset + len)` for a zoned command, returning the failure status.
///
/// Appends must also start on a write-granularity boundary, target a sequential zone and fit
/// within the append limit.
pub fn check_zoned_request(
    limits: &ZonedLimits,
    offset: u64,
    len: u64,
    append: bool,
    is_conventional: impl Fn(u64) -> bool,
) -> Result<(), u8> {
    if len > limits.capacity || offset > limits.capacity - len {
        return Err(VIRTIO_BLK_S_ZONE_INVALID_CMD);
    }
    if append {
        let granularity = u64::from(limits.write_granularity);
        if granularity != 0 && offset % granularity != 0 {
            return Err(VIRTIO_BLK_S_ZONE_UNALIGNED_WP);
        }
        if limits.zone_size == 0 || is_conventional(offset / limits.zone_size) {
            return Err(VIRTIO_BLK_S_ZONE_INVALID_CMD);
        }
        if len >> VIRTIO_BLK_SECTOR_SHIFT > u64::from(limits.max_append_sectors) {
            return Err(if limits.max_append_sectors == 0 {
                VIRTIO_BLK_S_UNSUPP
            } else {
                VIRTIO_BLK_S_ZONE_INVALID_CMD
            });
        }
    }
    Ok(())
}

fn wire_zone_type(t: BlockZoneType) -> u8 {
    match t {
        BlockZoneType::Conventional => VIRTIO_BLK_ZT_CONV,
        BlockZoneType::SequentialWriteRequired => VIRTIO_BLK_ZT_SWR,
        BlockZoneType::SequentialWritePreferred => VIRTIO_BLK_ZT_SWP,
    }
}

fn wire_zone_state(s: BlockZoneState) -> u8 {
    match s {
        BlockZoneState::NotWritePointer => VIRTIO_BLK_ZS_NOT_WP,
        BlockZoneState::Empty => VIRTIO_BLK_ZS_EMPTY,
        BlockZoneState::ImplicitOpen => VIRTIO_BLK_ZS_IOPEN,
        BlockZoneState::ExplicitOpen => VIRTIO_BLK_ZS_EOPEN,
        BlockZoneState::Closed => VIRTIO_BLK_ZS_CLOSED,
        BlockZoneState::ReadOnly => VIRTIO_BLK_ZS_RDONLY,
        BlockZoneState::Full => VIRTIO_BLK_ZS_FULL,
        BlockZoneState::Offline => VIRTIO_BLK_ZS_OFFLINE,
    }
}

/// `struct virtio_blk_zone_descriptor`, offsets in sectors.
fn encode_zone(zone: &BlockZoneDescriptor) -> [u8; ZONE_DESCRIPTOR_SIZE] {
    let mut out = [0u8; ZONE_DESCRIPTOR_SIZE];
    out[0..8].copy_from_slice(&(zone.cap >> VIRTIO_BLK_SECTOR_SHIFT).to_le_bytes());
    out[8..16].copy_from_slice(&(zone.start >> VIRTIO_BLK_SECTOR_SHIFT).to_le_bytes());
    out[16..24].copy_from_slice(&(zone.wp >> VIRTIO_BLK_SECTOR_SHIFT).to_le_bytes());
    out[24] = wire_zone_type(zone.zone_type);
    out[25] = wire_zone_state(zone.state);
    out
}

impl BlkInner {
    /// Limits for zoned commands, or the status to fail them with.
    fn zoned_limits(&self) -> Result<ZonedLimits, u8> {
        if !self.has_feature(VIRTIO_BLK_F_ZONED) {
            return Err(VIRTIO_BLK_S_UNSUPP);
        }
        ZonedLimits::from_info(&self.backend.info()).ok_or(VIRTIO_BLK_S_UNSUPP)
    }

    fn check_zoned(&self, offset: u64, len: u64, append: bool) -> Result<ZonedLimits, u8> {
        let limits = self.zoned_limits()?;
        check_zoned_request(&limits, offset, len, append, |idx| {
            self.backend.zone_is_conventional(idx)
        })?;
        Ok(limits)
    }

    pub(super) fn handle_zone_report(self: &Arc<Self>, qs: &mut QueueState, q: u16, id: RequestId) {
        let Some(req) = qs.arena.get_mut(id) else {
            return;
        };
        let offset = req.sector << VIRTIO_BLK_SECTOR_SHIFT;
        if let Err(status) = self.check_zoned(offset, 0, false) {
            self.req_complete(qs, q, id, status);
            return;
        }
        // Room for the header and at least one descriptor.
        let room = req.in_sg.size().saturating_sub(ZONE_REPORT_HEADER_SIZE as u64);
        if room < ZONE_DESCRIPTOR_SIZE as u64 {
            self.req_complete(qs, q, id, VIRTIO_BLK_S_ZONE_INVALID_CMD);
            return;
        }
        let nr_zones = u32::try_from(room / ZONE_DESCRIPTOR_SIZE as u64).unwrap_or(u32::MAX);
        tracing::trace!(queue = q, offset, nr_zones, "virtio-blk zone report");
        req.state = RequestState::Submitted;
        self.submit(
            q,
            qs.generation,
            BackendOp::ZoneReport { offset, nr_zones },
            Token::ZoneReport(id),
        );
    }

    pub(super) fn complete_zone_report(
        &self,
        qs: &mut QueueState,
        q: u16,
        id: RequestId,
        result: BackendResult,
    ) {
        let status = match result {
            Ok(BackendReply::Zones(zones)) => qs
                .arena
                .get(id)
                .map_or(VIRTIO_BLK_S_ZONE_INVALID_CMD, |req| {
                    self.write_zone_report(&req.in_sg, &zones)
                }),
            Ok(_) | Err(_) => VIRTIO_BLK_S_ZONE_INVALID_CMD,
        };
        self.req_complete(qs, q, id, status);
    }

    fn write_zone_report(&self, in_sg: &SgList, zones: &[BlockZoneDescriptor]) -> u8 {
        let room = in_sg.size().saturating_sub(ZONE_REPORT_HEADER_SIZE as u64);
        let max = usize::try_from(room / ZONE_DESCRIPTOR_SIZE as u64).unwrap_or(usize::MAX);
        let zones = &zones[..zones.len().min(max)];

        let mut header = [0u8; ZONE_REPORT_HEADER_SIZE];
        header[0..8].copy_from_slice(&(zones.len() as u64).to_le_bytes());
        if in_sg.from_buf(self.mem.as_ref(), 0, &header) != Ok(header.len()) {
            return VIRTIO_BLK_S_ZONE_INVALID_CMD;
        }
        let mut offset = ZONE_REPORT_HEADER_SIZE as u64;
        for zone in zones {
            let desc = encode_zone(zone);
            if in_sg.from_buf(self.mem.as_ref(), offset, &desc) != Ok(desc.len()) {
                return VIRTIO_BLK_S_ZONE_INVALID_CMD;
            }
            offset += ZONE_DESCRIPTOR_SIZE as u64;
        }
        VIRTIO_BLK_S_OK
    }

    pub(super) fn handle_zone_mgmt(
        self: &Arc<Self>,
        qs: &mut QueueState,
        q: u16,
        id: RequestId,
        op: ZoneMgmtOp,
    ) {
        let Some(offset) = qs.arena.get(id).map(|req| req.sector << VIRTIO_BLK_SECTOR_SHIFT) else {
            return;
        };
        let limits = match self.zoned_limits() {
            Ok(limits) => limits,
            Err(status) => {
                self.req_complete(qs, q, id, status);
                return;
            }
        };
        // The last zone may be shorter than the rest.
        let one_zone = limits.zone_size.min(limits.capacity.saturating_sub(offset));
        let (zone_op, offset, len) = match op {
            ZoneMgmtOp::ResetAll => (ZoneOp::Reset, 0, limits.capacity),
            ZoneMgmtOp::Open => (ZoneOp::Open, offset, one_zone),
            ZoneMgmtOp::Close => (ZoneOp::Close, offset, one_zone),
            ZoneMgmtOp::Finish => (ZoneOp::Finish, offset, one_zone),
            ZoneMgmtOp::Reset => (ZoneOp::Reset, offset, one_zone),
        };
        let checked = if len == 0 {
            Err(VIRTIO_BLK_S_ZONE_INVALID_CMD)
        } else {
            check_zoned_request(&limits, offset, len, false, |idx| {
                self.backend.zone_is_conventional(idx)
            })
        };
        if let Err(status) = checked {
            self.req_complete(qs, q, id, status);
            return;
        }
        let Some(req) = qs.arena.get_mut(id) else {
            return;
        };
        tracing::trace!(queue = q, ?op, offset, len, "virtio-blk zone management");
        req.state = RequestState::Submitted;
        self.submit(
            q,
            qs.generation,
            BackendOp::ZoneMgmt {
                op: zone_op,
                offset,
                len,
            },
            Token::ZoneMgmt(id),
        );
    }

    pub(super) fn complete_zone_mgmt(
        &self,
        qs: &mut QueueState,
        q: u16,
        id: RequestId,
        result: &BackendResult,
    ) {
        let status = match result {
            Ok(_) => VIRTIO_BLK_S_OK,
            Err(err) => {
                tracing::debug!(queue = q, %err, "virtio-blk zone management failed");
                VIRTIO_BLK_S_ZONE_INVALID_CMD
            }
        };
        self.req_complete(qs, q, id, status);
    }

    pub(super) fn handle_zone_append(
        self: &Arc<Self>,
        qs: &mut QueueState,
        q: u16,
        id: RequestId,
        data: SgList,
    ) {
        let Some(req) = qs.arena.get_mut(id) else {
            return;
        };
        let offset = req.sector << VIRTIO_BLK_SECTOR_SHIFT;
        let len = data.size();
        if let Err(status) = self.check_zoned(offset, len, true) {
            self.req_complete(qs, q, id, status);
            return;
        }
        let sg = Arc::new(data);
        req.qiov = Arc::clone(&sg);
        req.is_write = true;
        req.acct = Some(self.stats.start(AcctKind::ZoneAppend, len));
        req.state = RequestState::Submitted;
        tracing::trace!(queue = q, offset, len, "virtio-blk zone append");
        self.submit(
            q,
            qs.generation,
            BackendOp::ZoneAppend { offset, sg },
            Token::ZoneAppend(id),
        );
    }

    pub(super) fn complete_zone_append(
        &self,
        qs: &mut QueueState,
        q: u16,
        id: RequestId,
        result: &BackendResult,
    ) {
        let status = match result {
            Ok(BackendReply::Appended { offset }) => {
                let sector = (offset >> VIRTIO_BLK_SECTOR_SHIFT).to_le_bytes();
                let written = qs
                    .arena
                    .get(id)
                    .map(|req| req.in_sg.from_buf(self.mem.as_ref(), 0, &sector));
                if written == Some(Ok(sector.len())) {
                    VIRTIO_BLK_S_OK
                } else {
                    VIRTIO_BLK_S_ZONE_INVALID_CMD
                }
            }
            Ok(_) | Err(_) => VIRTIO_BLK_S_ZONE_INVALID_CMD,
        };
        if status == VIRTIO_BLK_S_OK {
            self.acct_done(qs, id);
        } else {
            self.acct_failed(qs, id);
        }
        self.req_complete(qs, q, id, status);
    }
}
