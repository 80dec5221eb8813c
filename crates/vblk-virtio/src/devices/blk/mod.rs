//! Virtio block device.
//!
//! Requests popped from a queue are decoded, validated and either answered immediately or
//! turned into backend operations. Reads and writes that arrive together are parked in a
//! per-pass merge buffer and submitted as sorted, coalesced batches. Every backend completion is
//! delivered as a task on the context the queue is bound to, where the error policy decides
//! whether the guest sees an error, a success, or whether the request moves to the retry list
//! and the VM is paused.

mod accounting;
mod completion;
mod config;
mod dataplane;
mod decode;
mod error;
mod merge;
mod request;
mod retry;
mod scsi;
mod validate;
pub mod wire;
mod zoned;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use vblk_io_snapshot::io::state::{
    IoSnapshot, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use vblk_memory::GuestMemory;
use vblk_storage::{BackendOp, BackendRequest, BlockBackend, Completion};

use crate::context::{IoContext, IoThreadRegistry};
use crate::queue::VirtQueue;
use crate::transport::Transport;

pub use accounting::{AcctKind, AcctSnapshot, BlockAcctStats};
pub use completion::{
    BlockdevOnError, ErrorAction, ErrorPolicy, RunState, StopRequest, VmRunState,
};
pub use config::{
    assign_vqs, BlkConf, ConfigError, IoThreadMapping, IoThreadVqMapping, VIRTIO_QUEUE_MAX,
};
pub use decode::{parse_request, Command, ParsedRequest, ZoneMgmtOp};
pub use error::{FeatureError, ProtocolError, StartError};
pub use merge::{plan_batches, MergeCandidate, MergeLimits, MAX_MERGE_REQS};
pub use request::{Request, RequestArena, RequestId, RequestState};
pub use retry::{decode_retry_list, encode_retry_list, RetryEntry};
pub use validate::SectorRange;
pub use wire::*;
pub use zoned::{check_zoned_request, ZonedLimits};

use completion::Token;
use dataplane::DataplaneState;
use retry::RetryList;

/// Host-side collaborators of a [`VirtioBlk`].
#[derive(Clone)]
pub struct BlkHost {
    pub backend: Arc<dyn BlockBackend>,
    pub mem: Arc<dyn GuestMemory>,
    pub transport: Arc<dyn Transport>,
    pub run_state: Arc<dyn RunState>,
}

/// Operations a virtio transport drives on a block device.
pub trait BlockFrontend: Send + Sync {
    fn device_features(&self) -> u64;
    fn set_features(&self, features: u64) -> Result<(), FeatureError>;
    fn read_config(&self, offset: u64, data: &mut [u8]);
    fn write_config(&self, offset: u64, data: &[u8]);
    /// Guest kicked `queue`.
    fn handle_output(&self, queue: u16);
    fn start(&self) -> Result<(), StartError>;
    fn stop(&self);
    fn drained_begin(&self);
    fn drained_end(&self);
    fn reset(&self);
    fn vm_state_change(&self, running: bool);
}

pub(crate) struct QueueState {
    vq: Box<dyn VirtQueue>,
    arena: RequestArena,
    /// Bumped on reset; completions carrying an older value are dropped.
    generation: u64,
    attached: bool,
    needs_notify: bool,
    pending_kick: bool,
}

#[derive(Debug, Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn inc(&self) {
        *self.lock() += 1;
    }

    fn dec(&self) {
        let mut count = self.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn is_idle(&self) -> bool {
        *self.lock() == 0
    }

    fn wait_timeout(&self, timeout: Duration) {
        let count = self.lock();
        if *count != 0 {
            let _ = self
                .idle
                .wait_timeout(count, timeout)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

pub(crate) struct BlkInner {
    conf: BlkConf,
    backend: Arc<dyn BlockBackend>,
    mem: Arc<dyn GuestMemory>,
    transport: Arc<dyn Transport>,
    run_state: Arc<dyn RunState>,
    policy: ErrorPolicy,
    stats: BlockAcctStats,
    queues: Vec<Mutex<QueueState>>,
    contexts: RwLock<Vec<IoContext>>,
    main_ctx: IoContext,
    retry: RetryList,
    dataplane: DataplaneState,
    inflight: InFlight,
    broken: AtomicBool,
    host_features: u64,
    guest_features: AtomicU64,
    original_wce: bool,
    vm_running: AtomicBool,
    resume_dataplane: AtomicBool,
}

impl BlkInner {
    fn nvqs(&self) -> u16 {
        self.queues.len() as u16
    }

    fn lock_queue(&self, q: u16) -> MutexGuard<'_, QueueState> {
        self.queues[q as usize]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn contexts(&self) -> Vec<IoContext> {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn bound_context(&self, q: u16) -> IoContext {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(q as usize)
            .cloned()
            .unwrap_or_else(|| self.main_ctx.clone())
    }

    /// Context that processes `q`'s completions right now.
    fn context_for(&self, q: u16) -> IoContext {
        if self.dataplane.started() {
            self.bound_context(q)
        } else {
            self.main_ctx.clone()
        }
    }

    fn has_feature(&self, bit: u64) -> bool {
        self.guest_features.load(Ordering::Acquire) & bit != 0
    }

    fn sector_range(&self) -> SectorRange {
        SectorRange::from_info(&self.backend.info())
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Hands `op` to the backend. The result comes back as a task on the queue's context.
    fn submit(self: &Arc<Self>, q: u16, generation: u64, op: BackendOp, token: Token) {
        self.inflight.inc();
        let ctx = self.context_for(q);
        let inner = Arc::clone(self);
        let done = Completion::new(move |result| {
            let dev = Arc::clone(&inner);
            if !ctx.schedule(move || dev.complete(q, generation, token, result)) {
                tracing::warn!(
                    queue = q,
                    context = ctx.name(),
                    "virtio-blk completion context is gone, dropping result"
                );
                inner.inflight.dec();
            }
        });
        self.backend.submit(
            BackendRequest {
                op,
                mem: Arc::clone(&self.mem),
            },
            done,
        );
    }

    /// Writes `status`, publishes the chain to the used ring and frees the request.
    fn req_complete(&self, qs: &mut QueueState, q: u16, id: RequestId, status: u8) {
        let Some(req) = qs.arena.remove(id) else {
            return;
        };
        if let Err(err) = self.mem.write_u8_le(req.status_addr, status) {
            tracing::warn!(queue = q, %err, "virtio-blk failed to write request status");
        }
        if let Err(err) = qs.vq.push_used(req.chain.head_index(), req.in_len) {
            tracing::warn!(queue = q, %err, "virtio-blk failed to push used element");
        }
        qs.needs_notify = true;
    }

    fn flush_notify(&self, qs: &mut QueueState, q: u16) {
        if std::mem::take(&mut qs.needs_notify) {
            self.transport.notify(q);
        }
    }

    /// Gives a request's ring slot back without completing it.
    fn abandon(&self, qs: &mut QueueState, id: RequestId) {
        if let Some(req) = qs.arena.remove(id) {
            let _ = qs.vq.detach(req.chain.head_index());
            if let Some(acct) = req.acct {
                self.stats.invalid(acct.kind);
            }
        }
    }

    fn mark_broken(&self, q: u16, err: &ProtocolError) {
        self.broken.store(true, Ordering::Release);
        tracing::error!(queue = q, %err, "virtio-blk device is broken");
        self.transport.device_broken(&err.to_string());
    }

    /// Blocks until every backend operation and restart task has finished, pumping cooperative
    /// contexts so their completions can run.
    fn wait_for_inflight(&self) {
        loop {
            if self.inflight.is_idle() {
                return;
            }
            let mut ran = self.main_ctx.run_until_idle();
            for ctx in self.contexts() {
                ran += ctx.run_until_idle();
            }
            if ran == 0 {
                self.inflight.wait_timeout(Duration::from_millis(5));
            }
        }
    }

    fn config(&self) -> VirtioBlkConfig {
        let info = self.backend.info();
        let blk_size = info.logical_block_size.max(512);
        let total_sectors = info.total_sectors();
        let phys_exp = (info.physical_block_size.max(blk_size) / blk_size).trailing_zeros();
        let seg_max = if self.conf.seg_max_adjust {
            u32::from(self.conf.queue_size) - 2
        } else {
            128 - 2
        };
        let zoned = info
            .zoned
            .map(|z| VirtioBlkZonedCharacteristics {
                zone_sectors: u32::try_from(z.zone_size >> VIRTIO_BLK_SECTOR_SHIFT)
                    .unwrap_or(u32::MAX),
                max_open_zones: z.max_open_zones,
                max_active_zones: z.max_active_zones,
                max_append_sectors: z.max_append_sectors,
                write_granularity: z.write_granularity,
                model: VIRTIO_BLK_Z_HM,
            })
            .unwrap_or_default();
        VirtioBlkConfig {
            capacity: total_sectors,
            size_max: 0,
            seg_max,
            geometry: VirtioBlkGeometry {
                cylinders: u16::try_from(total_sectors / (16 * 63)).unwrap_or(u16::MAX),
                heads: 16,
                sectors: 63,
            },
            blk_size,
            physical_block_exp: phys_exp as u8,
            alignment_offset: 0,
            min_io_size: u16::try_from(info.min_io_size / blk_size).unwrap_or(u16::MAX),
            opt_io_size: info.opt_io_size / blk_size,
            wce: self.backend.write_cache() as u8,
            num_queues: self.nvqs(),
            max_discard_sectors: self.conf.max_discard_sectors,
            max_discard_seg: 1,
            discard_sector_alignment: blk_size >> VIRTIO_BLK_SECTOR_SHIFT,
            max_write_zeroes_sectors: self.conf.max_write_zeroes_sectors,
            max_write_zeroes_seg: 1,
            write_zeroes_may_unmap: 1,
            zoned,
        }
    }

    fn reset(&self) {
        for q in 0..self.nvqs() {
            let mut qs = self.lock_queue(q);
            qs.generation += 1;
            let stale = qs.arena.ids_where(|r| r.state != RequestState::Submitted);
            for id in stale {
                self.abandon(&mut qs, id);
            }
            qs.vq.reset();
            qs.needs_notify = false;
            qs.pending_kick = false;
        }
        let dropped = self.retry.take_all();
        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "virtio-blk reset dropped retry list");
        }
        self.backend.set_write_cache(self.original_wce);
        self.guest_features.store(0, Ordering::Release);
        self.broken.store(false, Ordering::Release);
    }
}

/// A virtio-blk device instance.
pub struct VirtioBlk {
    inner: Arc<BlkInner>,
}

impl VirtioBlk {
    pub fn realize(
        conf: BlkConf,
        host: BlkHost,
        registry: &IoThreadRegistry,
        queues: Vec<Box<dyn VirtQueue>>,
    ) -> Result<Self, ConfigError> {
        conf.validate()?;
        if queues.len() != conf.num_queues as usize {
            return Err(ConfigError::QueueCountMismatch {
                expected: conf.num_queues,
                got: queues.len(),
            });
        }
        let contexts = conf.resolve_contexts(registry)?;

        if let Some(wce) = conf.write_cache {
            host.backend.set_write_cache(wce);
        }
        let original_wce = host.backend.write_cache();
        let info = host.backend.info();

        let mut features = VIRTIO_BLK_F_SEG_MAX
            | VIRTIO_BLK_F_GEOMETRY
            | VIRTIO_BLK_F_TOPOLOGY
            | VIRTIO_BLK_F_BLK_SIZE
            | VIRTIO_F_RING_INDIRECT_DESC;
        if conf.scsi {
            features |= VIRTIO_BLK_F_SCSI;
        } else {
            features |= VIRTIO_F_VERSION_1;
        }
        if original_wce || conf.config_wce {
            features |= VIRTIO_BLK_F_FLUSH;
        }
        if conf.config_wce {
            features |= VIRTIO_BLK_F_CONFIG_WCE;
        }
        if info.read_only {
            features |= VIRTIO_BLK_F_RO;
        }
        if conf.num_queues > 1 {
            features |= VIRTIO_BLK_F_MQ;
        }
        if conf.write_zeroes {
            features |= VIRTIO_BLK_F_WRITE_ZEROES;
        }
        if info.zoned.is_some() {
            // Host-managed zoned devices cannot discard.
            features |= VIRTIO_BLK_F_ZONED;
        } else if conf.discard {
            features |= VIRTIO_BLK_F_DISCARD;
        }

        let policy = conf.error_policy();
        let queues = queues
            .into_iter()
            .map(|vq| {
                Mutex::new(QueueState {
                    vq,
                    arena: RequestArena::default(),
                    generation: 0,
                    attached: false,
                    needs_notify: false,
                    pending_kick: false,
                })
            })
            .collect();

        tracing::debug!(
            num_queues = conf.num_queues,
            features = format_args!("{features:#x}"),
            "virtio-blk realized"
        );

        Ok(Self {
            inner: Arc::new(BlkInner {
                conf,
                backend: host.backend,
                mem: host.mem,
                transport: host.transport,
                run_state: host.run_state,
                policy,
                stats: BlockAcctStats::default(),
                queues,
                contexts: RwLock::new(contexts),
                main_ctx: registry.main_context().clone(),
                retry: RetryList::default(),
                dataplane: DataplaneState::default(),
                inflight: InFlight::default(),
                broken: AtomicBool::new(false),
                host_features: features,
                guest_features: AtomicU64::new(0),
                original_wce,
                vm_running: AtomicBool::new(true),
                resume_dataplane: AtomicBool::new(false),
            }),
        })
    }

    pub fn stats(&self) -> &BlockAcctStats {
        &self.inner.stats
    }

    pub fn conf(&self) -> &BlkConf {
        &self.inner.conf
    }

    pub fn guest_features(&self) -> u64 {
        self.inner.guest_features.load(Ordering::Acquire)
    }

    pub fn is_broken(&self) -> bool {
        self.inner.is_broken()
    }

    pub fn dataplane_started(&self) -> bool {
        self.inner.dataplane.started()
    }

    pub fn dataplane_disabled(&self) -> bool {
        self.inner.dataplane.disabled()
    }

    /// Requests parked on the retry list.
    pub fn retry_len(&self) -> usize {
        self.inner.retry.len()
    }

    /// Requests popped from `queue` that have not completed yet.
    pub fn requests_in_flight(&self, queue: u16) -> usize {
        self.inner.lock_queue(queue).arena.len()
    }

    /// Rebinds queues to new contexts. Only allowed while the dataplane is stopped and idle.
    pub fn set_iothread_mapping(
        &self,
        mapping: &IoThreadMapping,
        registry: &IoThreadRegistry,
    ) -> Result<(), ConfigError> {
        if self.inner.dataplane.started() || !self.inner.inflight.is_idle() {
            return Err(ConfigError::DeviceActive);
        }
        let contexts = config::resolve_contexts(mapping, self.inner.nvqs(), registry)?;
        *self
            .inner
            .contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner) = contexts;
        Ok(())
    }

    /// Capacity changed on the backend; tell the guest.
    pub fn resize(&self) {
        tracing::debug!(
            capacity = self.inner.backend.info().total_sectors(),
            "virtio-blk capacity changed"
        );
        self.inner.transport.config_changed();
    }
}

impl BlockFrontend for VirtioBlk {
    fn device_features(&self) -> u64 {
        self.inner.host_features
    }

    fn set_features(&self, features: u64) -> Result<(), FeatureError> {
        if features & VIRTIO_BLK_F_SCSI != 0 && features & VIRTIO_F_VERSION_1 != 0 {
            return Err(FeatureError::ScsiWithVersion1);
        }
        let features = features & self.inner.host_features;
        self.inner.guest_features.store(features, Ordering::Release);
        if features & VIRTIO_BLK_F_CONFIG_WCE == 0 {
            self.inner
                .backend
                .set_write_cache(features & VIRTIO_BLK_F_FLUSH != 0);
        }
        Ok(())
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        let visible = VirtioBlkConfig::size_for_features(self.inner.host_features);
        self.inner.config().read(visible, offset, data);
    }

    fn write_config(&self, offset: u64, data: &[u8]) {
        let wce = VirtioBlkConfig::WCE_OFFSET as u64;
        let Some(idx) = wce.checked_sub(offset) else {
            return;
        };
        let Some(&value) = data.get(idx as usize) else {
            return;
        };
        if !self.inner.has_feature(VIRTIO_BLK_F_CONFIG_WCE) {
            return;
        }
        let enable = value != 0;
        if enable != self.inner.backend.write_cache() {
            tracing::debug!(enable, "virtio-blk guest toggled write cache");
            self.inner.backend.set_write_cache(enable);
        }
    }

    fn handle_output(&self, queue: u16) {
        self.inner.handle_output(queue);
    }

    fn start(&self) -> Result<(), StartError> {
        self.inner.start_dataplane()
    }

    fn stop(&self) {
        self.inner.stop_dataplane();
    }

    fn drained_begin(&self) {
        self.inner.drained_begin();
    }

    fn drained_end(&self) {
        self.inner.drained_end();
    }

    fn reset(&self) {
        self.inner.stop_dataplane_quiet();
        self.inner.reset();
    }

    fn vm_state_change(&self, running: bool) {
        self.inner.vm_state_change(running);
    }
}

impl IoSnapshot for VirtioBlk {
    const DEVICE_ID: [u8; 4] = *b"VBLK";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        const TAG_GUEST_FEATURES: u16 = 1;
        const TAG_WRITE_CACHE: u16 = 2;
        const TAG_RETRY_LIST: u16 = 3;

        let features = self.guest_features();
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_u64(TAG_GUEST_FEATURES, features);
        w.field_bool(TAG_WRITE_CACHE, self.inner.backend.write_cache());
        w.field_bytes(
            TAG_RETRY_LIST,
            encode_retry_list(&self.inner.retry.entries(), features & VIRTIO_BLK_F_MQ != 0),
        );
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        const TAG_GUEST_FEATURES: u16 = 1;
        const TAG_WRITE_CACHE: u16 = 2;
        const TAG_RETRY_LIST: u16 = 3;

        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        let features = r.u64(TAG_GUEST_FEATURES)?.unwrap_or(0) & self.inner.host_features;
        let entries = match r.bytes(TAG_RETRY_LIST) {
            Some(buf) => decode_retry_list(
                buf,
                features & VIRTIO_BLK_F_MQ != 0,
                self.inner.nvqs(),
                self.inner.conf.queue_size,
            )?,
            None => Vec::new(),
        };

        self.inner.guest_features.store(features, Ordering::Release);
        if let Some(wce) = r.bool(TAG_WRITE_CACHE)? {
            self.inner.backend.set_write_cache(wce);
        }
        // The restored list replaces whatever was parked here.
        for stale in self.inner.retry.take_all() {
            let _ = self
                .inner
                .lock_queue(stale.queue)
                .vq
                .detach(stale.chain.head_index());
        }
        for entry in entries {
            self.inner
                .lock_queue(entry.queue)
                .vq
                .restore_in_flight(entry.chain.head_index());
            let mut req = Request::new(entry.queue, entry.chain);
            req.state = RequestState::AwaitingRetry;
            self.inner.retry.push(req);
        }
        Ok(())
    }
}
