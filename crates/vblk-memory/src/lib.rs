//! Guest physical memory access for device models.
//!
//! - [`GuestMemory`]: the byte-addressed view of guest RAM a device uses for DMA.
//! - [`GuestRam`]: a flat heap-backed implementation.
//! - [`SgList`]: scatter-gather lists of guest buffers.

mod phys;
mod sg;

pub use phys::{GuestMemory, GuestMemoryError, GuestMemoryResult, GuestRam};
pub use sg::{SgList, SgSegment};
