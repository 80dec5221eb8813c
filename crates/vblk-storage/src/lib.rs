//! Host-side block storage as seen by the virtio-blk request core.
//!
//! - [`BlockBackend`]: asynchronous submit/complete contract with plug batching and drain.
//! - [`BackendOp`] / [`BackendReply`]: the operations a device can issue and their results.
//! - [`MemBackend`]: a RAM-backed backend with fault injection, deferred completion and an
//!   optional zoned layout.

mod backend;
mod error;
mod mem;
mod zone;

pub use backend::{
    BackendInfo, BackendOp, BackendReply, BackendRequest, BackendResult, BlockBackend, Completion,
    OpKind, PlugGuard, ScsiReply, ScsiRequest, ZonedInfo,
};
pub use error::{BackendError, Result};
pub use mem::{MemBackend, SubmittedOp, ZonedLayout};
pub use zone::{BlockZoneDescriptor, BlockZoneState, BlockZoneType, ZoneOp};

pub const SECTOR_SIZE: usize = 512;
pub const SECTOR_SHIFT: u32 = 9;

/// Largest number of 512-byte sectors a single request may cover.
pub const REQUEST_MAX_SECTORS: u64 = (i32::MAX as u64) >> SECTOR_SHIFT;
