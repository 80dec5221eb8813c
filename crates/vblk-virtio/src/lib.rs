//! Virtio block request-processing core.
//!
//! The crate turns descriptor chains popped from a virtqueue into backend operations and back
//! into completed guest requests. It covers request decoding, sector validation, merging of
//! adjacent reads/writes, zoned commands, per-request error policy, multi-queue dispatch across
//! worker contexts, and the retry list that survives VM stops and migration.
//!
//! Guest rings, interrupt delivery and notifier plumbing are reached through the [`queue`] and
//! [`transport`] traits so the core can be driven by any virtio transport.

pub mod context;
pub mod devices;
pub mod queue;
pub mod transport;

pub use vblk_memory as memory;
