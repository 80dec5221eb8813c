use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use vblk_memory::{GuestMemoryError, SgList};

/// One guest buffer of a descriptor chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub addr: u64,
    pub len: u32,
    /// Device-writable (guest "in") buffer.
    pub writable: bool,
}

impl Descriptor {
    pub fn readable(addr: u64, len: u32) -> Self {
        Self {
            addr,
            len,
            writable: false,
        }
    }

    pub fn writable(addr: u64, len: u32) -> Self {
        Self {
            addr,
            len,
            writable: true,
        }
    }

    pub fn is_write_only(&self) -> bool {
        self.writable
    }
}

/// A descriptor chain popped from the available ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorChain {
    head: u16,
    descs: Vec<Descriptor>,
}

impl DescriptorChain {
    pub fn new(head: u16, descs: Vec<Descriptor>) -> Self {
        Self { head, descs }
    }

    pub fn head_index(&self) -> u16 {
        self.head
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descs
    }

    /// Device-readable buffers in chain order.
    pub fn out_sg(&self) -> SgList {
        self.collect(false)
    }

    /// Device-writable buffers in chain order.
    pub fn in_sg(&self) -> SgList {
        self.collect(true)
    }

    fn collect(&self, writable: bool) -> SgList {
        let mut sg = SgList::new();
        for d in self.descs.iter().filter(|d| d.writable == writable) {
            sg.push(d.addr, d.len);
        }
        sg
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("descriptor chain {0} is not outstanding")]
    UnknownHead(u16),

    #[error("malformed descriptor chain: {0}")]
    Malformed(&'static str),

    #[error("guest memory: {0}")]
    Memory(#[from] GuestMemoryError),
}

/// Device-side view of one virtqueue.
pub trait VirtQueue: Send {
    fn size(&self) -> u16;

    /// Pops the next available chain, if any.
    fn pop(&mut self) -> Result<Option<DescriptorChain>, QueueError>;

    /// Publishes `head` to the used ring with `len` bytes written.
    fn push_used(&mut self, head: u16, len: u32) -> Result<(), QueueError>;

    /// Gives `head` back without marking it used.
    fn detach(&mut self, head: u16) -> Result<(), QueueError>;

    /// Marks `head` outstanding again after it was restored from a snapshot.
    fn restore_in_flight(&mut self, head: u16);

    fn is_empty(&self) -> bool;

    /// Enables or suppresses guest->device notifications.
    fn set_notification(&mut self, enabled: bool);

    fn notification_enabled(&self) -> bool;

    /// Forgets all ring state.
    fn reset(&mut self);
}

/// An entry of the used ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsedElem {
    pub head: u16,
    pub len: u32,
}

#[derive(Debug)]
struct MemQueueState {
    size: u16,
    next_head: u16,
    avail: VecDeque<DescriptorChain>,
    outstanding: BTreeSet<u16>,
    used: Vec<UsedElem>,
    detached: Vec<u16>,
    notification: bool,
}

/// In-memory virtqueue.
///
/// Clones share the same ring, so a test can keep a guest-side handle after handing one to the
/// device.
#[derive(Debug, Clone)]
pub struct MemQueue {
    inner: Arc<Mutex<MemQueueState>>,
}

impl MemQueue {
    pub fn new(size: u16) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemQueueState {
                size,
                next_head: 0,
                avail: VecDeque::new(),
                outstanding: BTreeSet::new(),
                used: Vec::new(),
                detached: Vec::new(),
                notification: true,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemQueueState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes a chain available and returns its head index.
    pub fn add(&self, descs: Vec<Descriptor>) -> u16 {
        let mut st = self.lock();
        let mut head = st.next_head;
        for _ in 0..st.size {
            if !st.outstanding.contains(&head) && !st.avail.iter().any(|c| c.head == head) {
                break;
            }
            head = (head + 1) % st.size;
        }
        st.next_head = (head + 1) % st.size;
        st.avail.push_back(DescriptorChain::new(head, descs));
        head
    }

    pub fn used(&self) -> Vec<UsedElem> {
        self.lock().used.clone()
    }

    pub fn take_used(&self) -> Vec<UsedElem> {
        std::mem::take(&mut self.lock().used)
    }

    pub fn detached(&self) -> Vec<u16> {
        self.lock().detached.clone()
    }

    /// Chains popped by the device but not yet returned.
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding.len()
    }

    pub fn avail_len(&self) -> usize {
        self.lock().avail.len()
    }
}

impl VirtQueue for MemQueue {
    fn size(&self) -> u16 {
        self.lock().size
    }

    fn pop(&mut self) -> Result<Option<DescriptorChain>, QueueError> {
        let mut st = self.lock();
        let Some(chain) = st.avail.pop_front() else {
            return Ok(None);
        };
        if chain.descs.is_empty() {
            return Err(QueueError::Malformed("empty descriptor chain"));
        }
        st.outstanding.insert(chain.head);
        Ok(Some(chain))
    }

    fn push_used(&mut self, head: u16, len: u32) -> Result<(), QueueError> {
        let mut st = self.lock();
        if !st.outstanding.remove(&head) {
            return Err(QueueError::UnknownHead(head));
        }
        st.used.push(UsedElem { head, len });
        Ok(())
    }

    fn detach(&mut self, head: u16) -> Result<(), QueueError> {
        let mut st = self.lock();
        if !st.outstanding.remove(&head) {
            return Err(QueueError::UnknownHead(head));
        }
        st.detached.push(head);
        Ok(())
    }

    fn restore_in_flight(&mut self, head: u16) {
        self.lock().outstanding.insert(head);
    }

    fn is_empty(&self) -> bool {
        self.lock().avail.is_empty()
    }

    fn set_notification(&mut self, enabled: bool) {
        self.lock().notification = enabled;
    }

    fn notification_enabled(&self) -> bool {
        self.lock().notification
    }

    fn reset(&mut self) {
        let mut st = self.lock();
        st.avail.clear();
        st.outstanding.clear();
        st.next_head = 0;
        st.notification = true;
    }
}
