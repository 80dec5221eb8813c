//! Request parsing and per-command routing.

use std::sync::Arc;

use vblk_memory::{GuestMemory, SgList};
use vblk_storage::BackendOp;

use super::accounting::AcctKind;
use super::completion::Token;
use super::error::ProtocolError;
use super::merge::MultiReqBuffer;
use super::request::{RequestId, RequestState};
use super::wire::*;
use super::{BlkInner, QueueState};
use crate::queue::DescriptorChain;

/// Zone management command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneMgmtOp {
    Open,
    Close,
    Finish,
    Reset,
    ResetAll,
}

/// Decoded request type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Read,
    Write,
    Flush,
    GetId,
    Scsi,
    Discard,
    WriteZeroes,
    ZoneReport,
    ZoneMgmt(ZoneMgmtOp),
    ZoneAppend,
    Unsupported(u32),
}

impl Command {
    /// Classifies a header `type` value. The barrier bit is ignored.
    pub fn decode(type_: u32) -> Self {
        let out = type_ & VIRTIO_BLK_T_OUT != 0;
        match type_ & !(VIRTIO_BLK_T_OUT | VIRTIO_BLK_T_BARRIER) {
            VIRTIO_BLK_T_IN if out => Command::Write,
            VIRTIO_BLK_T_IN => Command::Read,
            VIRTIO_BLK_T_FLUSH => Command::Flush,
            VIRTIO_BLK_T_GET_ID => Command::GetId,
            VIRTIO_BLK_T_SCSI_CMD => Command::Scsi,
            // Without the OUT bit these fall through to `Unsupported`, and the guest sees UNSUPP.
            t if out && t == VIRTIO_BLK_T_DISCARD & !VIRTIO_BLK_T_OUT => Command::Discard,
            t if out && t == VIRTIO_BLK_T_WRITE_ZEROES & !VIRTIO_BLK_T_OUT => {
                Command::WriteZeroes
            }
            t if out && t == VIRTIO_BLK_T_ZONE_APPEND & !VIRTIO_BLK_T_OUT => Command::ZoneAppend,
            VIRTIO_BLK_T_ZONE_REPORT => Command::ZoneReport,
            VIRTIO_BLK_T_ZONE_OPEN => Command::ZoneMgmt(ZoneMgmtOp::Open),
            VIRTIO_BLK_T_ZONE_CLOSE => Command::ZoneMgmt(ZoneMgmtOp::Close),
            VIRTIO_BLK_T_ZONE_FINISH => Command::ZoneMgmt(ZoneMgmtOp::Finish),
            VIRTIO_BLK_T_ZONE_RESET => Command::ZoneMgmt(ZoneMgmtOp::Reset),
            VIRTIO_BLK_T_ZONE_RESET_ALL => Command::ZoneMgmt(ZoneMgmtOp::ResetAll),
            _ => Command::Unsupported(type_),
        }
    }
}

/// A request split into header, payload and status footer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub header: RequestHeader,
    /// Device-readable payload after the header.
    pub out_sg: SgList,
    /// Device-writable payload before the status byte.
    pub in_sg: SgList,
    pub status_addr: u64,
    /// Total device-writable bytes, status byte included.
    pub in_len: u32,
}

/// Carves the request header off the front and the status byte off the back of `chain`.
pub fn parse_request(
    chain: &DescriptorChain,
    mem: &dyn GuestMemory,
) -> Result<ParsedRequest, ProtocolError> {
    let mut out_sg = chain.out_sg();
    let mut in_sg = chain.in_sg();
    if out_sg.is_empty() || in_sg.is_empty() {
        return Err(ProtocolError::MissingHeaders);
    }

    let header_sg = out_sg
        .split_front(RequestHeader::SIZE as u64)
        .ok_or(ProtocolError::HeaderTooShort)?;
    let mut raw = [0u8; RequestHeader::SIZE];
    if header_sg.to_buf(mem, 0, &mut raw)? != RequestHeader::SIZE {
        return Err(ProtocolError::HeaderTooShort);
    }

    // The status byte must sit entirely in the last writable descriptor.
    let status_addr = match in_sg.last() {
        Some(last) if last.len >= 1 => last.addr.wrapping_add(u64::from(last.len) - 1),
        _ => return Err(ProtocolError::StatusTooShort),
    };
    let in_len = u32::try_from(in_sg.size()).unwrap_or(u32::MAX);
    in_sg
        .split_back(1)
        .ok_or(ProtocolError::StatusTooShort)?;

    Ok(ParsedRequest {
        header: RequestHeader::parse(&raw),
        out_sg,
        in_sg,
        status_addr,
        in_len,
    })
}

impl BlkInner {
    /// Routes one freshly popped request.
    ///
    /// Reads and writes are parked in `mrb`; everything else first submits what `mrb` holds.
    /// An error means the request is malformed and the device must stop processing.
    pub(super) fn handle_request(
        self: &Arc<Self>,
        qs: &mut QueueState,
        q: u16,
        id: RequestId,
        mrb: &mut MultiReqBuffer,
    ) -> Result<(), ProtocolError> {
        let Some(req) = qs.arena.get_mut(id) else {
            return Ok(());
        };
        let parsed = parse_request(&req.chain, self.mem.as_ref())?;
        req.status_addr = parsed.status_addr;
        req.in_len = parsed.in_len;
        req.in_sg = parsed.in_sg;
        req.sector = parsed.header.sector;

        let command = Command::decode(parsed.header.type_);
        tracing::trace!(
            queue = q,
            head = req.chain.head_index(),
            ?command,
            sector = parsed.header.sector,
            "virtio-blk request"
        );

        match command {
            Command::Read | Command::Write => {
                let is_write = command == Command::Write;
                req.is_write = is_write;
                req.qiov = Arc::new(if is_write {
                    parsed.out_sg
                } else {
                    req.in_sg.clone()
                });
                let (sector, size) = (req.sector, req.qiov.size());
                if !self.sector_range().valid(sector, size) {
                    let kind = if is_write { AcctKind::Write } else { AcctKind::Read };
                    self.acct_invalid(qs, id, kind);
                    self.req_complete(qs, q, id, VIRTIO_BLK_S_IOERR);
                    return Ok(());
                }
                let kind = if is_write { AcctKind::Write } else { AcctKind::Read };
                req.acct = Some(self.stats.start(kind, size));

                if mrb.is_full()
                    || (!mrb.is_empty() && mrb.is_write() != is_write)
                    || !self.conf.request_merging
                {
                    self.submit_multireq(qs, q, mrb);
                }
                if let Some(req) = qs.arena.get_mut(id) {
                    req.state = RequestState::Merged;
                }
                mrb.push(id, is_write);
            }
            Command::Flush => {
                self.submit_multireq(qs, q, mrb);
                self.handle_flush(qs, q, id);
            }
            Command::GetId => {
                self.submit_multireq(qs, q, mrb);
                self.handle_get_id(qs, q, id);
            }
            Command::Scsi => {
                self.submit_multireq(qs, q, mrb);
                self.handle_scsi(qs, q, id);
            }
            Command::Discard | Command::WriteZeroes => {
                let is_write_zeroes = command == Command::WriteZeroes;
                // Only one segment per request is advertised.
                if parsed.out_sg.size() > DiscardWriteZeroesSegment::SIZE as u64 {
                    self.submit_multireq(qs, q, mrb);
                    self.req_complete(qs, q, id, VIRTIO_BLK_S_UNSUPP);
                    return Ok(());
                }
                let mut raw = [0u8; DiscardWriteZeroesSegment::SIZE];
                if parsed.out_sg.to_buf(self.mem.as_ref(), 0, &mut raw)? != raw.len() {
                    return Err(ProtocolError::DiscardHeaderTooShort);
                }
                self.submit_multireq(qs, q, mrb);
                let seg = DiscardWriteZeroesSegment::parse(&raw);
                self.handle_discard_write_zeroes(qs, q, id, seg, is_write_zeroes);
            }
            Command::ZoneReport => {
                self.submit_multireq(qs, q, mrb);
                self.handle_zone_report(qs, q, id);
            }
            Command::ZoneMgmt(op) => {
                self.submit_multireq(qs, q, mrb);
                self.handle_zone_mgmt(qs, q, id, op);
            }
            Command::ZoneAppend => {
                self.submit_multireq(qs, q, mrb);
                self.handle_zone_append(qs, q, id, parsed.out_sg);
            }
            Command::Unsupported(_) => {
                self.submit_multireq(qs, q, mrb);
                self.req_complete(qs, q, id, VIRTIO_BLK_S_UNSUPP);
            }
        }
        Ok(())
    }

    fn handle_get_id(&self, qs: &mut QueueState, q: u16, id: RequestId) {
        let Some(req) = qs.arena.get(id) else {
            return;
        };
        let serial = self.conf.serial.as_deref().unwrap_or("");
        let mut id_bytes = serial.as_bytes().to_vec();
        id_bytes.push(0);
        let len = id_bytes
            .len()
            .min(VIRTIO_BLK_ID_BYTES)
            .min(usize::try_from(req.in_sg.size()).unwrap_or(usize::MAX));
        if let Err(err) = req.in_sg.from_buf(self.mem.as_ref(), 0, &id_bytes[..len]) {
            tracing::warn!(queue = q, %err, "virtio-blk failed to write device id");
        }
        self.req_complete(qs, q, id, VIRTIO_BLK_S_OK);
    }

    fn handle_flush(self: &Arc<Self>, qs: &mut QueueState, q: u16, id: RequestId) {
        let Some(req) = qs.arena.get_mut(id) else {
            return;
        };
        req.acct = Some(self.stats.start(AcctKind::Flush, 0));
        req.state = RequestState::Submitted;
        self.submit(q, qs.generation, BackendOp::Flush, Token::Flush(id));
    }

    fn handle_discard_write_zeroes(
        self: &Arc<Self>,
        qs: &mut QueueState,
        q: u16,
        id: RequestId,
        seg: DiscardWriteZeroesSegment,
        is_write_zeroes: bool,
    ) {
        let status = self.check_discard_write_zeroes(&seg, is_write_zeroes);
        if status != VIRTIO_BLK_S_OK {
            if is_write_zeroes {
                self.acct_invalid(qs, id, AcctKind::Write);
            }
            self.req_complete(qs, q, id, status);
            return;
        }

        let Some(req) = qs.arena.get_mut(id) else {
            return;
        };
        let offset = seg.sector << VIRTIO_BLK_SECTOR_SHIFT;
        let len = u64::from(seg.num_sectors) << VIRTIO_BLK_SECTOR_SHIFT;
        let op = if is_write_zeroes {
            req.acct = Some(self.stats.start(AcctKind::Write, len));
            BackendOp::WriteZeroes {
                offset,
                len,
                may_unmap: seg.flags & VIRTIO_BLK_WRITE_ZEROES_FLAG_UNMAP != 0,
            }
        } else {
            req.acct = Some(self.stats.start(AcctKind::Unmap, len));
            BackendOp::Discard { offset, len }
        };
        req.state = RequestState::Submitted;
        self.submit(
            q,
            qs.generation,
            op,
            Token::DiscardWriteZeroes {
                id,
                is_write_zeroes,
            },
        );
    }

    /// Status for a discard/write-zeroes segment, `VIRTIO_BLK_S_OK` if it may be submitted.
    fn check_discard_write_zeroes(
        &self,
        seg: &DiscardWriteZeroesSegment,
        is_write_zeroes: bool,
    ) -> u8 {
        let (feature, max_sectors) = if is_write_zeroes {
            (VIRTIO_BLK_F_WRITE_ZEROES, self.conf.max_write_zeroes_sectors)
        } else {
            (VIRTIO_BLK_F_DISCARD, self.conf.max_discard_sectors)
        };
        if !self.has_feature(feature) {
            return VIRTIO_BLK_S_UNSUPP;
        }
        if seg.num_sectors > max_sectors {
            return VIRTIO_BLK_S_IOERR;
        }
        let bytes = u64::from(seg.num_sectors) << VIRTIO_BLK_SECTOR_SHIFT;
        if !self.sector_range().valid(seg.sector, bytes) {
            return VIRTIO_BLK_S_IOERR;
        }
        // UNMAP only means something for write-zeroes.
        if seg.flags & !VIRTIO_BLK_WRITE_ZEROES_FLAG_UNMAP != 0
            || (!is_write_zeroes && seg.flags & VIRTIO_BLK_WRITE_ZEROES_FLAG_UNMAP != 0)
        {
            return VIRTIO_BLK_S_UNSUPP;
        }
        VIRTIO_BLK_S_OK
    }
}
