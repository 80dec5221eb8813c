//! Requests parked by the stop error policy, their resubmission on resume, and their migration
//! encoding.
//!
//! Encoding: each entry is a `1` marker, the queue index as `u32` when multi-queue was
//! negotiated, the head index, the descriptor count and the descriptors themselves. A `0` marker
//! ends the list.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use vblk_io_snapshot::io::state::codec::{Decoder, Encoder};
use vblk_io_snapshot::io::state::{SnapshotError, SnapshotResult};
use vblk_storage::PlugGuard;

use super::merge::MultiReqBuffer;
use super::request::{Request, RequestState};
use super::BlkInner;
use crate::queue::{Descriptor, DescriptorChain};

/// Upper bound on descriptors per restored chain.
const MAX_CHAIN_LEN: u32 = 1024;

/// One parked request as persisted across migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEntry {
    pub queue: u16,
    pub chain: DescriptorChain,
}

/// Device-wide list of requests waiting for the VM to resume. Order is failure order.
#[derive(Debug, Default)]
pub(crate) struct RetryList {
    reqs: Mutex<Vec<Request>>,
}

impl RetryList {
    fn lock(&self) -> MutexGuard<'_, Vec<Request>> {
        self.reqs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, req: Request) {
        self.lock().push(req);
    }

    pub fn take_all(&self) -> Vec<Request> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn entries(&self) -> Vec<RetryEntry> {
        self.lock()
            .iter()
            .map(|req| RetryEntry {
                queue: req.queue,
                chain: req.chain.clone(),
            })
            .collect()
    }
}

pub fn encode_retry_list(entries: &[RetryEntry], multiqueue: bool) -> Vec<u8> {
    let mut e = Encoder::new();
    for entry in entries {
        e = e.u8(1);
        if multiqueue {
            e = e.u32(u32::from(entry.queue));
        }
        let descs = entry.chain.descriptors();
        e = e.u16(entry.chain.head_index()).u32(descs.len() as u32);
        for d in descs {
            e = e.u64(d.addr).u32(d.len).bool(d.writable);
        }
    }
    e.u8(0).finish()
}

/// Decodes a retry list for a device with `num_queues` queues of `queue_size` entries.
pub fn decode_retry_list(
    bytes: &[u8],
    multiqueue: bool,
    num_queues: u16,
    queue_size: u16,
) -> SnapshotResult<Vec<RetryEntry>> {
    let max_entries = usize::from(num_queues) * usize::from(queue_size);
    let mut d = Decoder::new(bytes);
    let mut entries = Vec::new();
    loop {
        match d.u8()? {
            0 => break,
            1 => {}
            _ => {
                return Err(SnapshotError::InvalidFieldEncoding(
                    "virtio-blk retry list marker",
                ))
            }
        }
        if entries.len() >= max_entries {
            return Err(SnapshotError::InvalidFieldEncoding(
                "virtio-blk retry list too long",
            ));
        }
        let queue = if multiqueue { d.u32()? } else { 0 };
        let queue = u16::try_from(queue)
            .ok()
            .filter(|&q| q < num_queues)
            .ok_or(SnapshotError::InvalidFieldEncoding(
                "virtio-blk retry list queue index",
            ))?;
        let head = d.u16()?;
        if head >= queue_size {
            return Err(SnapshotError::InvalidFieldEncoding(
                "virtio-blk retry list head index",
            ));
        }
        let ndesc = d.u32()?;
        if ndesc == 0 || ndesc > MAX_CHAIN_LEN {
            return Err(SnapshotError::InvalidFieldEncoding(
                "virtio-blk retry list chain length",
            ));
        }
        let mut descs = Vec::with_capacity(ndesc as usize);
        for _ in 0..ndesc {
            descs.push(Descriptor {
                addr: d.u64()?,
                len: d.u32()?,
                writable: d.bool()?,
            });
        }
        entries.push(RetryEntry {
            queue,
            chain: DescriptorChain::new(head, descs),
        });
    }
    d.finish()?;
    Ok(entries)
}

impl BlkInner {
    /// Resubmits every parked request on the context of the queue it came from.
    pub(super) fn dma_restart(self: &Arc<Self>) {
        let reqs = self.retry.take_all();
        if reqs.is_empty() {
            return;
        }
        let mut per_queue: Vec<Vec<Request>> = (0..self.nvqs()).map(|_| Vec::new()).collect();
        for req in reqs {
            match per_queue.get_mut(req.queue as usize) {
                Some(list) => list.push(req),
                None => tracing::warn!(queue = req.queue, "virtio-blk retry for unknown queue"),
            }
        }

        for (q, reqs) in per_queue.into_iter().enumerate() {
            if reqs.is_empty() {
                continue;
            }
            let q = q as u16;
            let generation = self.lock_queue(q).generation;
            tracing::debug!(queue = q, count = reqs.len(), "virtio-blk restarting requests");
            self.inflight.inc();
            let ctx = self.context_for(q);
            let dev = Arc::clone(self);
            if !ctx.schedule(move || dev.restart_queue(q, generation, reqs)) {
                tracing::warn!(queue = q, context = ctx.name(), "virtio-blk context is gone, retries dropped");
                self.inflight.dec();
            }
        }
    }

    fn restart_queue(self: &Arc<Self>, q: u16, generation: u64, reqs: Vec<Request>) {
        {
            let _plug = PlugGuard::new(self.backend.as_ref());
            let mut qs = self.lock_queue(q);
            if qs.generation == generation {
                let mut mrb = MultiReqBuffer::default();
                let mut pending = reqs.into_iter();
                let mut failure = None;
                for mut req in pending.by_ref() {
                    req.state = RequestState::New;
                    let id = qs.arena.insert(req);
                    if let Err(err) = self.handle_request(&mut qs, q, id, &mut mrb) {
                        if let Some(req) = qs.arena.remove(id) {
                            let _ = qs.vq.detach(req.chain.head_index());
                        }
                        failure = Some(err);
                        break;
                    }
                }
                match failure {
                    None => self.submit_multireq(&mut qs, q, &mut mrb),
                    Some(err) => {
                        // The device is broken until reset; the rest will never run.
                        for req in pending {
                            let _ = qs.vq.detach(req.chain.head_index());
                        }
                        self.unwind(&mut qs, &mut mrb);
                        self.mark_broken(q, &err);
                    }
                }
                self.flush_notify(&mut qs, q);
            }
        }
        self.inflight.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(head: u16, n: u32) -> DescriptorChain {
        let mut descs = vec![Descriptor::readable(0x1000 + u64::from(head) * 0x100, 16)];
        for i in 1..n {
            descs.push(Descriptor::writable(0x8000 + u64::from(i) * 0x200, 512));
        }
        DescriptorChain::new(head, descs)
    }

    #[test]
    fn empty_list_is_a_single_terminator() {
        let bytes = encode_retry_list(&[], false);
        assert_eq!(bytes, vec![0]);
        assert!(decode_retry_list(&bytes, false, 1, 128).unwrap().is_empty());
    }

    #[test]
    fn single_queue_round_trip() {
        let entries = vec![RetryEntry {
            queue: 0,
            chain: chain(5, 3),
        }];
        let bytes = encode_retry_list(&entries, false);
        assert_eq!(decode_retry_list(&bytes, false, 1, 128).unwrap(), entries);
    }

    #[test]
    fn multi_queue_round_trip_keeps_order_and_queues() {
        let entries = vec![
            RetryEntry {
                queue: 2,
                chain: chain(7, 2),
            },
            RetryEntry {
                queue: 0,
                chain: chain(1, 4),
            },
            RetryEntry {
                queue: 2,
                chain: chain(3, 1),
            },
        ];
        let bytes = encode_retry_list(&entries, true);
        assert_eq!(decode_retry_list(&bytes, true, 4, 128).unwrap(), entries);
    }

    #[test]
    fn restore_rejects_bad_indices_and_garbage() {
        let entries = vec![RetryEntry {
            queue: 3,
            chain: chain(1, 2),
        }];
        let bytes = encode_retry_list(&entries, true);
        assert!(matches!(
            decode_retry_list(&bytes, true, 2, 128),
            Err(SnapshotError::InvalidFieldEncoding(_))
        ));

        let bytes = encode_retry_list(
            &[RetryEntry {
                queue: 0,
                chain: chain(200, 1),
            }],
            false,
        );
        assert!(decode_retry_list(&bytes, false, 1, 128).is_err());

        let mut bytes = encode_retry_list(&[], false);
        bytes.push(0xff);
        assert!(decode_retry_list(&bytes, false, 1, 128).is_err());

        let bytes = encode_retry_list(
            &[RetryEntry {
                queue: 0,
                chain: chain(1, 2),
            }],
            false,
        );
        assert_eq!(
            decode_retry_list(&bytes[..bytes.len() - 1], false, 1, 128),
            Err(SnapshotError::UnexpectedEof)
        );
    }
}
