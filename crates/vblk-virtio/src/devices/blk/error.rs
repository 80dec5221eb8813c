use thiserror::Error;
use vblk_memory::GuestMemoryError;

use crate::queue::QueueError;
use crate::transport::TransportError;

/// Malformed guest request that leaves the device unusable until reset.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("virtio-blk missing headers")]
    MissingHeaders,

    #[error("virtio-blk request outhdr too short")]
    HeaderTooShort,

    #[error("virtio-blk request inhdr too short")]
    StatusTooShort,

    #[error("virtio-blk discard/write_zeroes header too short")]
    DiscardHeaderTooShort,

    #[error("virtio-blk queue: {0}")]
    Queue(#[from] QueueError),

    #[error("virtio-blk guest memory: {0}")]
    Memory(#[from] GuestMemoryError),
}

/// Dataplane start failure. The device keeps working with in-line queue processing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartError {
    #[error("failed to set guest notifiers: {0}")]
    GuestNotifiers(#[source] TransportError),

    #[error("failed to set host notifier for queue {queue}: {source}")]
    HostNotifier {
        queue: u16,
        #[source]
        source: TransportError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FeatureError {
    #[error("scsi passthrough is incompatible with VIRTIO_F_VERSION_1")]
    ScsiWithVersion1,
}
