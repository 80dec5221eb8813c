//! Legacy SCSI command passthrough (`VIRTIO_BLK_T_SCSI_CMD`).
//!
//! Chain layout: out = `[header][cdb][data-out...]`,
//! in = `[data-in...][sense][virtio_scsi_inhdr][status]`.

use std::sync::Arc;

use vblk_memory::{GuestMemory, SgList, SgSegment};
use vblk_storage::{BackendOp, BackendReply, BackendResult, ScsiReply, ScsiRequest};

use super::completion::Token;
use super::request::{RequestId, RequestState};
use super::wire::*;
use super::{BlkInner, QueueState};

/// Written to `errors` so the guest's ioctl fails.
const SCSI_ERRORS_FAILED: u32 = 255;

/// `struct virtio_scsi_inhdr` location, if the chain has room for it.
fn scsi_inhdr(in_segs: &[SgSegment]) -> Option<u64> {
    let idx = in_segs.len().checked_sub(2)?;
    let seg = in_segs[idx];
    (seg.len as usize >= SCSI_INHDR_SIZE).then_some(seg.addr)
}

fn write_inhdr(mem: &dyn GuestMemory, addr: u64, reply: &ScsiReply, sense_len: u32) {
    let mut status = reply.status;
    if status == 0 && sense_len > 0 {
        status = SCSI_CHECK_CONDITION;
    }
    let errors = u32::from(status)
        | u32::from(reply.msg_status) << 8
        | u32::from(reply.host_status) << 16
        | u32::from(reply.driver_status) << 24;
    let mut inhdr = [0u8; SCSI_INHDR_SIZE];
    inhdr[0..4].copy_from_slice(&errors.to_le_bytes());
    inhdr[4..8].copy_from_slice(&reply.data_len.to_le_bytes());
    inhdr[8..12].copy_from_slice(&sense_len.to_le_bytes());
    inhdr[12..16].copy_from_slice(&reply.residual.to_le_bytes());
    if let Err(err) = mem.write_from(addr, &inhdr) {
        tracing::warn!(%err, "virtio-blk failed to write scsi inhdr");
    }
}

fn fail_inhdr(mem: &dyn GuestMemory, addr: Option<u64>) {
    if let Some(addr) = addr {
        if let Err(err) = mem.write_u32_le(addr, SCSI_ERRORS_FAILED) {
            tracing::warn!(%err, "virtio-blk failed to write scsi errors");
        }
    }
}

impl BlkInner {
    pub(super) fn handle_scsi(self: &Arc<Self>, qs: &mut QueueState, q: u16, id: RequestId) {
        let Some(req) = qs.arena.get_mut(id) else {
            return;
        };
        let out = req.chain.out_sg();
        let ins = req.chain.in_sg();
        let (out_segs, in_segs) = (out.segments(), ins.segments());
        let inhdr = scsi_inhdr(in_segs);

        if !self.has_feature(VIRTIO_BLK_F_SCSI) {
            fail_inhdr(self.mem.as_ref(), inhdr);
            self.req_complete(qs, q, id, VIRTIO_BLK_S_UNSUPP);
            return;
        }
        if inhdr.is_none() || out_segs.len() < 2 || in_segs.len() < 3 {
            fail_inhdr(self.mem.as_ref(), inhdr);
            self.req_complete(qs, q, id, VIRTIO_BLK_S_IOERR);
            return;
        };
        // Bidirectional transfers cannot be expressed.
        if out_segs.len() > 2 && in_segs.len() > 3 {
            fail_inhdr(self.mem.as_ref(), inhdr);
            self.req_complete(qs, q, id, VIRTIO_BLK_S_UNSUPP);
            return;
        }

        let cdb_seg = SgList::from_segments(vec![out_segs[1]]);
        let cdb = match cdb_seg.gather(self.mem.as_ref()) {
            Ok(cdb) => cdb,
            Err(err) => {
                tracing::debug!(queue = q, %err, "virtio-blk unreadable scsi cdb");
                fail_inhdr(self.mem.as_ref(), inhdr);
                self.req_complete(qs, q, id, VIRTIO_BLK_S_IOERR);
                return;
            }
        };
        let sense = in_segs[in_segs.len() - 3];
        let (data, to_device) = if out_segs.len() > 2 {
            (SgList::from_segments(out_segs[2..].to_vec()), true)
        } else {
            (SgList::from_segments(in_segs[..in_segs.len() - 3].to_vec()), false)
        };

        let data = Arc::new(data);
        req.qiov = Arc::clone(&data);
        req.state = RequestState::Submitted;
        tracing::trace!(queue = q, cdb_len = cdb.len(), to_device, "virtio-blk scsi command");
        self.submit(
            q,
            qs.generation,
            BackendOp::Scsi(ScsiRequest {
                cdb,
                data,
                to_device,
                max_sense_len: sense.len,
            }),
            Token::Scsi(id),
        );
    }

    pub(super) fn complete_scsi(
        &self,
        qs: &mut QueueState,
        q: u16,
        id: RequestId,
        result: BackendResult,
    ) {
        let Some(req) = qs.arena.get(id) else {
            return;
        };
        let ins = req.chain.in_sg();
        let in_segs = ins.segments();
        let inhdr = scsi_inhdr(in_segs);

        let status = match (result, inhdr) {
            (Ok(BackendReply::Scsi(reply)), Some(addr)) if in_segs.len() >= 3 => {
                let sense = in_segs[in_segs.len() - 3];
                let sense_len = reply.sense.len().min(sense.len as usize);
                if let Err(err) = self
                    .mem
                    .write_from(sense.addr, &reply.sense[..sense_len])
                {
                    tracing::warn!(queue = q, %err, "virtio-blk failed to write scsi sense");
                }
                write_inhdr(self.mem.as_ref(), addr, &reply, sense_len as u32);
                VIRTIO_BLK_S_OK
            }
            (result, _) => {
                if let Err(err) = result {
                    tracing::debug!(queue = q, %err, "virtio-blk scsi command failed");
                }
                fail_inhdr(self.mem.as_ref(), inhdr);
                VIRTIO_BLK_S_UNSUPP
            }
        };
        self.req_complete(qs, q, id, status);
    }
}
