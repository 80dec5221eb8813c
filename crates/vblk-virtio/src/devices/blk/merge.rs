use std::sync::Arc;

use vblk_memory::SgList;
use vblk_storage::{BackendInfo, BackendOp};

use super::accounting::AcctKind;
use super::completion::Token;
use super::request::{RequestId, RequestState};
use super::wire::{VIRTIO_BLK_SECTOR_SHIFT, VIRTIO_BLK_SECTOR_SIZE};
use super::{BlkInner, QueueState};

/// Most reads or writes collected before a batch is forced out.
pub const MAX_MERGE_REQS: usize = 32;

/// Reads or writes of one queue pass waiting to be batched. All entries share one direction.
#[derive(Debug, Default)]
pub(crate) struct MultiReqBuffer {
    reqs: Vec<RequestId>,
    is_write: bool,
}

impl MultiReqBuffer {
    pub fn push(&mut self, id: RequestId, is_write: bool) {
        self.reqs.push(id);
        self.is_write = is_write;
    }

    pub fn is_empty(&self) -> bool {
        self.reqs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.reqs.len() >= MAX_MERGE_REQS
    }

    pub fn is_write(&self) -> bool {
        self.is_write
    }

    pub fn take(&mut self) -> Vec<RequestId> {
        std::mem::take(&mut self.reqs)
    }
}

/// Backend limits a batch must respect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeLimits {
    pub max_iov: usize,
    pub max_transfer: u64,
}

impl MergeLimits {
    pub fn from_info(info: &BackendInfo) -> Self {
        Self {
            max_iov: info.max_iov,
            max_transfer: info.max_transfer,
        }
    }
}

/// Shape of one request as seen by the batch planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeCandidate {
    pub sector: u64,
    pub bytes: u64,
    pub niov: usize,
    pub is_write: bool,
}

/// Sorts `reqs` by sector (stable) and groups them into batches.
///
/// Returns indices into `reqs`. A request joins the running batch only when it starts at the
/// batch's end sector, goes the same direction, and the grown batch stays within `limits`.
pub fn plan_batches(reqs: &[MergeCandidate], limits: MergeLimits) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..reqs.len()).collect();
    order.sort_by_key(|&i| reqs[i].sector);

    let mut batches: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let (mut sector, mut nb_sectors, mut niov, mut is_write) = (0u64, 0u64, 0usize, false);

    for i in order {
        let req = &reqs[i];
        if !current.is_empty() {
            let contiguous = sector.checked_add(nb_sectors) == Some(req.sector);
            let iov_ok = niov <= limits.max_iov.saturating_sub(req.niov);
            let transfer_ok = req.bytes <= limits.max_transfer
                && nb_sectors <= (limits.max_transfer - req.bytes) / VIRTIO_BLK_SECTOR_SIZE;
            if !contiguous || !iov_ok || !transfer_ok || req.is_write != is_write {
                batches.push(std::mem::take(&mut current));
            }
        }
        if current.is_empty() {
            sector = req.sector;
            nb_sectors = 0;
            niov = 0;
            is_write = req.is_write;
        }
        nb_sectors += req.bytes >> VIRTIO_BLK_SECTOR_SHIFT;
        niov += req.niov;
        current.push(i);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

impl BlkInner {
    /// Submits everything parked in `mrb`, merging where possible.
    pub(super) fn submit_multireq(
        self: &Arc<Self>,
        qs: &mut QueueState,
        q: u16,
        mrb: &mut MultiReqBuffer,
    ) {
        if mrb.is_empty() {
            return;
        }
        let is_write = mrb.is_write();
        let ids: Vec<(RequestId, MergeCandidate)> = mrb
            .take()
            .into_iter()
            .filter_map(|id| {
                let req = qs.arena.get(id)?;
                Some((
                    id,
                    MergeCandidate {
                        sector: req.sector,
                        bytes: req.qiov.size(),
                        niov: req.niov(),
                        is_write: req.is_write,
                    },
                ))
            })
            .collect();

        if ids.len() == 1 {
            self.submit_rw(qs, q, vec![ids[0].0], is_write);
            return;
        }

        let candidates: Vec<MergeCandidate> = ids.iter().map(|(_, c)| *c).collect();
        let limits = MergeLimits::from_info(&self.backend.info());
        for batch in plan_batches(&candidates, limits) {
            let members = batch.into_iter().map(|i| ids[i].0).collect();
            self.submit_rw(qs, q, members, is_write);
        }
    }

    fn submit_rw(
        self: &Arc<Self>,
        qs: &mut QueueState,
        q: u16,
        members: Vec<RequestId>,
        is_write: bool,
    ) {
        let Some(first) = members.first().and_then(|id| qs.arena.get(*id)) else {
            return;
        };
        let sector = first.sector;
        let sg = if members.len() == 1 {
            Arc::clone(&first.qiov)
        } else {
            let kind = if is_write { AcctKind::Write } else { AcctKind::Read };
            self.stats.merged(kind, members.len() as u64 - 1);
            Arc::new(SgList::concat(
                members
                    .iter()
                    .filter_map(|id| qs.arena.get(*id))
                    .map(|r| r.qiov.as_ref()),
            ))
        };
        for id in &members {
            if let Some(req) = qs.arena.get_mut(*id) {
                req.state = RequestState::Submitted;
            }
        }

        tracing::trace!(
            queue = q,
            is_write,
            sector,
            nreqs = members.len(),
            bytes = sg.size(),
            "virtio-blk submit batch"
        );
        let offset = sector << VIRTIO_BLK_SECTOR_SHIFT;
        let op = if is_write {
            BackendOp::Write { offset, sg }
        } else {
            BackendOp::Read { offset, sg }
        };
        self.submit(q, qs.generation, op, Token::Rw { members, is_write });
    }
}
