use std::sync::Arc;

use vblk_memory::SgList;

use super::accounting::AcctCookie;
use crate::queue::DescriptorChain;

/// Lifecycle position of a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Popped from the ring, not yet routed.
    New,
    /// Parked in a merge buffer.
    Merged,
    /// Handed to the backend.
    Submitted,
    /// Failed with a stop action; owned by the retry list.
    AwaitingRetry,
}

/// One in-flight guest request.
#[derive(Debug)]
pub struct Request {
    pub(crate) queue: u16,
    pub(crate) chain: DescriptorChain,
    pub(crate) state: RequestState,
    pub(crate) sector: u64,
    pub(crate) is_write: bool,
    /// Data payload handed to the backend.
    pub(crate) qiov: Arc<SgList>,
    /// Device-writable payload with the status byte removed.
    pub(crate) in_sg: SgList,
    pub(crate) status_addr: u64,
    /// Bytes reported back through the used ring.
    pub(crate) in_len: u32,
    pub(crate) acct: Option<AcctCookie>,
}

impl Request {
    pub fn new(queue: u16, chain: DescriptorChain) -> Self {
        Self {
            queue,
            chain,
            state: RequestState::New,
            sector: 0,
            is_write: false,
            qiov: Arc::new(SgList::new()),
            in_sg: SgList::new(),
            status_addr: 0,
            in_len: 0,
            acct: None,
        }
    }

    pub fn queue(&self) -> u16 {
        self.queue
    }

    pub fn chain(&self) -> &DescriptorChain {
        &self.chain
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn sector(&self) -> u64 {
        self.sector
    }

    /// Number of scatter-gather segments in the data payload.
    pub fn niov(&self) -> usize {
        self.qiov.len()
    }

    pub fn size(&self) -> u64 {
        self.qiov.size()
    }
}

/// Stable handle to a request held in a [`RequestArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
enum Slot {
    Free { generation: u32 },
    Used { generation: u32, req: Request },
}

/// Per-queue request storage. Handles to freed slots never resolve again.
#[derive(Debug, Default)]
pub struct RequestArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl RequestArena {
    pub fn insert(&mut self, req: Request) -> RequestId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let generation = match slot {
                Slot::Free { generation } => generation.wrapping_add(1),
                Slot::Used { generation, .. } => generation.wrapping_add(1),
            };
            *slot = Slot::Used { generation, req };
            return RequestId { index, generation };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot::Used { generation: 0, req });
        RequestId {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, id: RequestId) -> Option<&Request> {
        match self.slots.get(id.index as usize)? {
            Slot::Used { generation, req } if *generation == id.generation => Some(req),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut Request> {
        match self.slots.get_mut(id.index as usize)? {
            Slot::Used { generation, req } if *generation == id.generation => Some(req),
            _ => None,
        }
    }

    pub fn remove(&mut self, id: RequestId) -> Option<Request> {
        let slot = self.slots.get_mut(id.index as usize)?;
        match slot {
            Slot::Used { generation, .. } if *generation == id.generation => {}
            _ => return None,
        }
        let old = std::mem::replace(
            slot,
            Slot::Free {
                generation: id.generation,
            },
        );
        self.free.push(id.index);
        self.live -= 1;
        match old {
            Slot::Used { req, .. } => Some(req),
            Slot::Free { .. } => None,
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Handles of every live request matching `pred`.
    pub fn ids_where(&self, mut pred: impl FnMut(&Request) -> bool) -> Vec<RequestId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Used { generation, req } if pred(req) => Some(RequestId {
                    index: index as u32,
                    generation: *generation,
                }),
                _ => None,
            })
            .collect()
    }
}
