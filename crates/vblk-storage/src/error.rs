use thiserror::Error;

pub type Result<T> = std::result::Result<T, BackendError>;

/// Failure reported by a block backend for one submitted operation.
///
/// The variants are coarse on purpose: the device only needs to tell "out of space" apart from
/// everything else when it picks an error action, and zone commands only care that the
/// backend refused them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("I/O error")]
    Io,

    #[error("no space left on device")]
    NoSpace,

    #[error("operation not supported by backend")]
    NotSupported,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("out of bounds: offset={offset} len={len} capacity={capacity}")]
    OutOfBounds { offset: u64, len: u64, capacity: u64 },

    #[error("backend is read-only")]
    ReadOnly,

    #[error("guest memory access failed")]
    GuestMemory,

    #[error("backend error (errno {0})")]
    Errno(i32),
}

impl BackendError {
    /// Whether this failure means the backing store ran out of space.
    pub fn is_no_space(&self) -> bool {
        const ENOSPC: i32 = 28;
        matches!(self, BackendError::NoSpace | BackendError::Errno(ENOSPC))
    }
}

impl From<vblk_memory::GuestMemoryError> for BackendError {
    fn from(_: vblk_memory::GuestMemoryError) -> Self {
        BackendError::GuestMemory
    }
}
