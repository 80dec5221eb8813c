use std::fmt;
use std::sync::Arc;

use vblk_memory::{GuestMemory, SgList};

use crate::error::BackendError;
use crate::zone::{BlockZoneDescriptor, ZoneOp};
use crate::{REQUEST_MAX_SECTORS, SECTOR_SHIFT, SECTOR_SIZE};

/// Zoned-device characteristics of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZonedInfo {
    /// Zone size in bytes. Every zone has this size except possibly the last one.
    pub zone_size: u64,
    pub nr_zones: u32,
    pub max_open_zones: u32,
    pub max_active_zones: u32,
    pub max_append_sectors: u32,
    /// Write granularity in bytes.
    pub write_granularity: u32,
}

/// Static properties of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendInfo {
    pub capacity_bytes: u64,
    pub logical_block_size: u32,
    pub physical_block_size: u32,
    pub min_io_size: u32,
    pub opt_io_size: u32,
    /// Maximum number of scatter-gather segments in one submission.
    pub max_iov: usize,
    /// Maximum bytes in one submission.
    pub max_transfer: u64,
    pub read_only: bool,
    pub zoned: Option<ZonedInfo>,
}

impl BackendInfo {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity_bytes,
            logical_block_size: SECTOR_SIZE as u32,
            physical_block_size: SECTOR_SIZE as u32,
            min_io_size: 0,
            opt_io_size: 0,
            max_iov: 1024,
            max_transfer: REQUEST_MAX_SECTORS << SECTOR_SHIFT,
            read_only: false,
            zoned: None,
        }
    }

    /// Capacity in 512-byte sectors.
    pub fn total_sectors(&self) -> u64 {
        self.capacity_bytes >> SECTOR_SHIFT
    }
}

/// SCSI passthrough command.
#[derive(Debug, Clone)]
pub struct ScsiRequest {
    pub cdb: Vec<u8>,
    pub data: Arc<SgList>,
    /// `true` when `data` flows from the guest to the device.
    pub to_device: bool,
    pub max_sense_len: u32,
}

/// Completion data of a SCSI passthrough command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScsiReply {
    pub status: u8,
    pub msg_status: u8,
    pub host_status: u16,
    pub driver_status: u16,
    pub sense: Vec<u8>,
    pub data_len: u32,
    pub residual: u32,
}

/// One operation handed to a backend.
///
/// Offsets and lengths are in bytes. Data-carrying operations reference the guest buffers
/// directly through a shared scatter-gather list.
#[derive(Debug, Clone)]
pub enum BackendOp {
    Read { offset: u64, sg: Arc<SgList> },
    Write { offset: u64, sg: Arc<SgList> },
    Flush,
    Discard { offset: u64, len: u64 },
    WriteZeroes { offset: u64, len: u64, may_unmap: bool },
    ZoneReport { offset: u64, nr_zones: u32 },
    ZoneMgmt { op: ZoneOp, offset: u64, len: u64 },
    ZoneAppend { offset: u64, sg: Arc<SgList> },
    Scsi(ScsiRequest),
}

/// Coarse operation class, used for logs and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Read,
    Write,
    Flush,
    Discard,
    WriteZeroes,
    ZoneReport,
    ZoneMgmt,
    ZoneAppend,
    Scsi,
}

impl BackendOp {
    pub fn kind(&self) -> OpKind {
        match self {
            BackendOp::Read { .. } => OpKind::Read,
            BackendOp::Write { .. } => OpKind::Write,
            BackendOp::Flush => OpKind::Flush,
            BackendOp::Discard { .. } => OpKind::Discard,
            BackendOp::WriteZeroes { .. } => OpKind::WriteZeroes,
            BackendOp::ZoneReport { .. } => OpKind::ZoneReport,
            BackendOp::ZoneMgmt { .. } => OpKind::ZoneMgmt,
            BackendOp::ZoneAppend { .. } => OpKind::ZoneAppend,
            BackendOp::Scsi(_) => OpKind::Scsi,
        }
    }
}

/// A submitted operation together with the guest memory its buffers live in.
#[derive(Clone)]
pub struct BackendRequest {
    pub op: BackendOp,
    pub mem: Arc<dyn GuestMemory>,
}

impl fmt::Debug for BackendRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRequest")
            .field("op", &self.op)
            .finish_non_exhaustive()
    }
}

/// Successful result of a backend operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendReply {
    Done,
    Zones(Vec<BlockZoneDescriptor>),
    /// Byte offset the appended data landed at.
    Appended { offset: u64 },
    Scsi(ScsiReply),
}

pub type BackendResult = Result<BackendReply, BackendError>;

type Callback = Box<dyn FnOnce(BackendResult) + Send>;

/// One-shot completion handle for a submitted operation.
///
/// Backends must call [`Completion::complete`] exactly once. It may be called from any thread,
/// but never from inside [`BlockBackend::submit`] while the caller still holds locks it needs;
/// the device only ever reacts to completions on its own worker context.
pub struct Completion {
    callback: Option<Callback>,
}

impl Completion {
    pub fn new(f: impl FnOnce(BackendResult) + Send + 'static) -> Self {
        Self {
            callback: Some(Box::new(f)),
        }
    }

    pub fn complete(mut self, result: BackendResult) {
        if let Some(cb) = self.callback.take() {
            cb(result);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.callback.is_some() {
            tracing::warn!("block backend dropped a completion without delivering a result");
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

/// Asynchronous host-side block storage.
pub trait BlockBackend: Send + Sync {
    fn info(&self) -> BackendInfo;

    /// Starts `req`; the result is delivered through `done`.
    fn submit(&self, req: BackendRequest, done: Completion);

    /// Begins a submission batch. Calls nest.
    fn plug(&self) {}

    /// Ends a submission batch; the outermost call releases queued work.
    fn unplug(&self) {}

    /// Blocks until every submitted operation has delivered its completion.
    fn drain(&self);

    /// Moves the backend's completion processing to the named worker context.
    fn attach_context(&self, _name: &str) -> Result<(), BackendError> {
        Ok(())
    }

    fn write_cache(&self) -> bool {
        true
    }

    fn set_write_cache(&self, _enabled: bool) {}

    /// Whether the zone at `zone_index` is a conventional (non write-pointer) zone.
    fn zone_is_conventional(&self, _zone_index: u64) -> bool {
        false
    }
}

/// Keeps a backend plugged for the guard's lifetime.
pub struct PlugGuard<'a> {
    backend: &'a dyn BlockBackend,
}

impl<'a> PlugGuard<'a> {
    pub fn new(backend: &'a dyn BlockBackend) -> Self {
        backend.plug();
        Self { backend }
    }
}

impl Drop for PlugGuard<'_> {
    fn drop(&mut self) {
        self.backend.unplug();
    }
}
