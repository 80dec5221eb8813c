use std::collections::VecDeque;
use std::ops::Range;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::backend::{
    BackendInfo, BackendOp, BackendReply, BackendRequest, BackendResult, BlockBackend, Completion,
    OpKind, ScsiReply, ZonedInfo,
};
use crate::error::{BackendError, Result};
use crate::zone::{BlockZoneDescriptor, BlockZoneState, BlockZoneType, ZoneOp};

/// Record of one operation a [`MemBackend`] received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmittedOp {
    pub kind: OpKind,
    pub offset: u64,
    pub len: u64,
    pub segments: usize,
}

/// Zone layout for a zoned [`MemBackend`]. The first `nr_conventional` zones are conventional,
/// the rest are sequential-write-required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZonedLayout {
    pub zone_size: u64,
    pub nr_zones: u32,
    pub nr_conventional: u32,
    pub max_open_zones: u32,
    pub max_active_zones: u32,
    pub max_append_sectors: u32,
    pub write_granularity: u32,
}

#[derive(Debug)]
struct Fault {
    kind: OpKind,
    err: BackendError,
    remaining: u32,
}

struct State {
    data: Vec<u8>,
    info: BackendInfo,
    write_cache: bool,
    log: Vec<SubmittedOp>,
    faults: Vec<Fault>,
    deferred: bool,
    pending: VecDeque<(Completion, BackendResult)>,
    plug_depth: u32,
    max_plug_depth: u32,
    zones: Vec<BlockZoneDescriptor>,
    context: Option<String>,
    fail_attach: bool,
    scsi_reply: Option<ScsiReply>,
}

/// RAM-backed [`BlockBackend`] with an operation log and fault injection.
///
/// Operations execute at submission time. By default the completion is delivered before
/// `submit` returns; in deferred mode completions are held until [`MemBackend::complete_deferred`]
/// or [`BlockBackend::drain`] releases them, which lets callers observe requests while they are
/// in flight.
pub struct MemBackend {
    state: Mutex<State>,
}

impl MemBackend {
    pub fn new(capacity_bytes: u64) -> Self {
        Self::with_info(BackendInfo::new(capacity_bytes))
    }

    pub fn with_info(info: BackendInfo) -> Self {
        Self {
            state: Mutex::new(State {
                data: vec![0; info.capacity_bytes as usize],
                info,
                write_cache: true,
                log: Vec::new(),
                faults: Vec::new(),
                deferred: false,
                pending: VecDeque::new(),
                plug_depth: 0,
                max_plug_depth: 0,
                zones: Vec::new(),
                context: None,
                fail_attach: false,
                scsi_reply: None,
            }),
        }
    }

    pub fn new_zoned(layout: ZonedLayout) -> Self {
        let capacity = layout.zone_size * u64::from(layout.nr_zones);
        let mut info = BackendInfo::new(capacity);
        info.zoned = Some(ZonedInfo {
            zone_size: layout.zone_size,
            nr_zones: layout.nr_zones,
            max_open_zones: layout.max_open_zones,
            max_active_zones: layout.max_active_zones,
            max_append_sectors: layout.max_append_sectors,
            write_granularity: layout.write_granularity,
        });
        let backend = Self::with_info(info);
        {
            let mut st = backend.lock();
            st.zones = (0..layout.nr_zones)
                .map(|i| {
                    let start = u64::from(i) * layout.zone_size;
                    let conventional = i < layout.nr_conventional;
                    BlockZoneDescriptor {
                        start,
                        length: layout.zone_size,
                        cap: layout.zone_size,
                        wp: start,
                        zone_type: if conventional {
                            BlockZoneType::Conventional
                        } else {
                            BlockZoneType::SequentialWriteRequired
                        },
                        state: if conventional {
                            BlockZoneState::NotWritePointer
                        } else {
                            BlockZoneState::Empty
                        },
                    }
                })
                .collect();
        }
        backend
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_limits(&self, max_iov: usize, max_transfer: u64) {
        let mut st = self.lock();
        st.info.max_iov = max_iov;
        st.info.max_transfer = max_transfer;
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.lock().info.read_only = read_only;
    }

    pub fn set_logical_block_size(&self, size: u32) {
        let mut st = self.lock();
        st.info.logical_block_size = size;
        st.info.physical_block_size = st.info.physical_block_size.max(size);
    }

    /// Makes the next `count` operations of `kind` fail with `err`.
    pub fn fail_next(&self, kind: OpKind, err: BackendError, count: u32) {
        self.lock().faults.push(Fault {
            kind,
            err,
            remaining: count,
        });
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    pub fn set_deferred(&self, deferred: bool) {
        self.lock().deferred = deferred;
    }

    pub fn deferred_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Delivers held completions in submission order.
    pub fn complete_deferred(&self) -> usize {
        let pending: Vec<_> = self.lock().pending.drain(..).collect();
        let n = pending.len();
        for (done, result) in pending {
            done.complete(result);
        }
        n
    }

    /// Delivers held completions newest first.
    pub fn complete_deferred_reversed(&self) -> usize {
        let pending: Vec<_> = self.lock().pending.drain(..).collect();
        let n = pending.len();
        for (done, result) in pending.into_iter().rev() {
            done.complete(result);
        }
        n
    }

    pub fn submitted(&self) -> Vec<SubmittedOp> {
        self.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    pub fn plug_depth(&self) -> u32 {
        self.lock().plug_depth
    }

    pub fn max_plug_depth(&self) -> u32 {
        self.lock().max_plug_depth
    }

    pub fn read_bytes(&self, offset: u64, len: usize) -> Vec<u8> {
        let st = self.lock();
        let start = offset as usize;
        st.data[start..start + len].to_vec()
    }

    pub fn write_bytes(&self, offset: u64, src: &[u8]) {
        let mut st = self.lock();
        let start = offset as usize;
        st.data[start..start + src.len()].copy_from_slice(src);
    }

    pub fn attached_context(&self) -> Option<String> {
        self.lock().context.clone()
    }

    pub fn fail_attach(&self, fail: bool) {
        self.lock().fail_attach = fail;
    }

    pub fn set_scsi_reply(&self, reply: Option<ScsiReply>) {
        self.lock().scsi_reply = reply;
    }

    pub fn zone(&self, index: usize) -> Option<BlockZoneDescriptor> {
        self.lock().zones.get(index).copied()
    }
}

impl State {
    fn take_fault(&mut self, kind: OpKind) -> Option<BackendError> {
        let pos = self
            .faults
            .iter()
            .position(|f| f.kind == kind && f.remaining > 0)?;
        let fault = &mut self.faults[pos];
        fault.remaining -= 1;
        let err = fault.err;
        if fault.remaining == 0 {
            self.faults.remove(pos);
        }
        Some(err)
    }

    fn range(&self, offset: u64, len: u64) -> Result<Range<usize>> {
        let capacity = self.data.len() as u64;
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= capacity)
            .ok_or(BackendError::OutOfBounds {
                offset,
                len,
                capacity,
            })?;
        Ok(offset as usize..end as usize)
    }

    fn zone_size(&self) -> Result<u64> {
        self.info
            .zoned
            .map(|z| z.zone_size)
            .filter(|&size| size > 0)
            .ok_or(BackendError::NotSupported)
    }

    fn zone_index(&self, offset: u64) -> Result<usize> {
        let idx = (offset / self.zone_size()?) as usize;
        if idx >= self.zones.len() {
            return Err(BackendError::InvalidArgument);
        }
        Ok(idx)
    }

    /// Advances the write pointer for a regular write landing in a sequential zone.
    fn advance_write_pointer(&mut self, offset: u64, len: u64) -> Result<()> {
        if self.zones.is_empty() || len == 0 {
            return Ok(());
        }
        let idx = self.zone_index(offset)?;
        let zone = &mut self.zones[idx];
        if zone.zone_type == BlockZoneType::Conventional {
            return Ok(());
        }
        if offset != zone.wp || offset + len > zone.start + zone.cap {
            return Err(BackendError::InvalidArgument);
        }
        zone.wp += len;
        zone.state = if zone.wp == zone.start + zone.cap {
            BlockZoneState::Full
        } else if zone.state == BlockZoneState::ExplicitOpen {
            BlockZoneState::ExplicitOpen
        } else {
            BlockZoneState::ImplicitOpen
        };
        Ok(())
    }

    fn zone_mgmt(&mut self, op: ZoneOp, offset: u64, len: u64) -> Result<()> {
        let zone_size = self.zone_size()?;
        if offset % zone_size != 0 {
            return Err(BackendError::InvalidArgument);
        }
        let end = offset.saturating_add(len);
        let spans_many = len > zone_size;
        let mut touched = 0;
        for i in 0..self.zones.len() {
            let zone = self.zones[i];
            if zone.start + zone.length <= offset || zone.start >= end {
                continue;
            }
            if zone.zone_type == BlockZoneType::Conventional {
                if spans_many {
                    continue;
                }
                return Err(BackendError::InvalidArgument);
            }
            let z = &mut self.zones[i];
            match op {
                ZoneOp::Open => z.state = BlockZoneState::ExplicitOpen,
                ZoneOp::Close => {
                    z.state = if z.wp == z.start {
                        BlockZoneState::Empty
                    } else {
                        BlockZoneState::Closed
                    }
                }
                ZoneOp::Finish => {
                    z.wp = z.start + z.cap;
                    z.state = BlockZoneState::Full;
                }
                ZoneOp::Reset => {
                    z.wp = z.start;
                    z.state = BlockZoneState::Empty;
                    let (start, cap) = (z.start as usize, z.cap as usize);
                    self.data[start..start + cap].fill(0);
                }
            }
            touched += 1;
        }
        if touched == 0 && !spans_many {
            return Err(BackendError::InvalidArgument);
        }
        Ok(())
    }

    fn execute(&mut self, req: &BackendRequest) -> BackendResult {
        let mem = &*req.mem;
        match &req.op {
            BackendOp::Read { offset, sg } => {
                let range = self.range(*offset, sg.size())?;
                sg.from_buf(mem, 0, &self.data[range])?;
                Ok(BackendReply::Done)
            }
            BackendOp::Write { offset, sg } => {
                if self.info.read_only {
                    return Err(BackendError::ReadOnly);
                }
                let range = self.range(*offset, sg.size())?;
                let buf = sg.gather(mem)?;
                self.advance_write_pointer(*offset, sg.size())?;
                self.data[range].copy_from_slice(&buf);
                Ok(BackendReply::Done)
            }
            BackendOp::Flush => Ok(BackendReply::Done),
            BackendOp::Discard { offset, len } => {
                self.range(*offset, *len)?;
                Ok(BackendReply::Done)
            }
            BackendOp::WriteZeroes { offset, len, .. } => {
                if self.info.read_only {
                    return Err(BackendError::ReadOnly);
                }
                let range = self.range(*offset, *len)?;
                self.data[range].fill(0);
                Ok(BackendReply::Done)
            }
            BackendOp::ZoneReport { offset, nr_zones } => {
                let first = self.zone_index(*offset)?;
                Ok(BackendReply::Zones(
                    self.zones
                        .iter()
                        .skip(first)
                        .take(*nr_zones as usize)
                        .copied()
                        .collect(),
                ))
            }
            BackendOp::ZoneMgmt { op, offset, len } => {
                self.zone_mgmt(*op, *offset, *len)?;
                Ok(BackendReply::Done)
            }
            BackendOp::ZoneAppend { offset, sg } => {
                let idx = self.zone_index(*offset)?;
                let zone = self.zones[idx];
                if zone.zone_type == BlockZoneType::Conventional {
                    return Err(BackendError::InvalidArgument);
                }
                let wp = zone.wp;
                let len = sg.size();
                if wp + len > zone.start + zone.cap {
                    return Err(BackendError::NoSpace);
                }
                let range = self.range(wp, len)?;
                let buf = sg.gather(mem)?;
                self.advance_write_pointer(wp, len)?;
                self.data[range].copy_from_slice(&buf);
                Ok(BackendReply::Appended { offset: wp })
            }
            BackendOp::Scsi(_) => self
                .scsi_reply
                .clone()
                .map(BackendReply::Scsi)
                .ok_or(BackendError::NotSupported),
        }
    }
}

fn describe(op: &BackendOp) -> SubmittedOp {
    let (offset, len, segments) = match op {
        BackendOp::Read { offset, sg }
        | BackendOp::Write { offset, sg }
        | BackendOp::ZoneAppend { offset, sg } => (*offset, sg.size(), sg.len()),
        BackendOp::Discard { offset, len }
        | BackendOp::WriteZeroes { offset, len, .. }
        | BackendOp::ZoneMgmt { offset, len, .. } => (*offset, *len, 0),
        BackendOp::ZoneReport { offset, nr_zones } => (*offset, u64::from(*nr_zones), 0),
        BackendOp::Flush => (0, 0, 0),
        BackendOp::Scsi(req) => (0, req.data.size(), req.data.len()),
    };
    SubmittedOp {
        kind: op.kind(),
        offset,
        len,
        segments,
    }
}

impl BlockBackend for MemBackend {
    fn info(&self) -> BackendInfo {
        self.lock().info
    }

    fn submit(&self, req: BackendRequest, done: Completion) {
        let result = {
            let mut st = self.lock();
            st.log.push(describe(&req.op));
            let result = match st.take_fault(req.op.kind()) {
                Some(err) => Err(err),
                None => st.execute(&req),
            };
            if st.deferred {
                st.pending.push_back((done, result));
                return;
            }
            result
        };
        done.complete(result);
    }

    fn plug(&self) {
        let mut st = self.lock();
        st.plug_depth += 1;
        st.max_plug_depth = st.max_plug_depth.max(st.plug_depth);
    }

    fn unplug(&self) {
        let mut st = self.lock();
        st.plug_depth = st.plug_depth.saturating_sub(1);
    }

    fn drain(&self) {
        self.complete_deferred();
    }

    fn attach_context(&self, name: &str) -> Result<()> {
        let mut st = self.lock();
        if st.fail_attach {
            return Err(BackendError::Io);
        }
        st.context = Some(name.to_owned());
        Ok(())
    }

    fn write_cache(&self) -> bool {
        self.lock().write_cache
    }

    fn set_write_cache(&self, enabled: bool) {
        self.lock().write_cache = enabled;
    }

    fn zone_is_conventional(&self, zone_index: u64) -> bool {
        self.lock()
            .zones
            .get(zone_index as usize)
            .is_some_and(|z| z.zone_type == BlockZoneType::Conventional)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PlugGuard;
    use std::sync::Arc;
    use vblk_memory::{GuestMemory, GuestRam, SgList};

    fn run(backend: &MemBackend, mem: &Arc<GuestRam>, op: BackendOp) -> BackendResult {
        let slot = Arc::new(Mutex::new(None));
        let out = Arc::clone(&slot);
        backend.submit(
            BackendRequest {
                op,
                mem: Arc::clone(mem) as Arc<dyn GuestMemory>,
            },
            Completion::new(move |r| *out.lock().unwrap() = Some(r)),
        );
        let result = slot.lock().unwrap().take();
        result.expect("completion delivered")
    }

    fn sg(addr: u64, len: u32) -> Arc<SgList> {
        let mut sg = SgList::new();
        sg.push(addr, len);
        Arc::new(sg)
    }

    #[test]
    fn write_then_read_moves_bytes_through_guest_memory() {
        let backend = MemBackend::new(4096);
        let mem = Arc::new(GuestRam::new(0x4000));
        mem.write_from(0x1000, &[0xab; 512]).unwrap();
        run(&backend, &mem, BackendOp::Write { offset: 512, sg: sg(0x1000, 512) }).unwrap();
        run(&backend, &mem, BackendOp::Read { offset: 512, sg: sg(0x2000, 512) }).unwrap();
        let mut buf = [0u8; 512];
        mem.read_into(0x2000, &mut buf).unwrap();
        assert_eq!(buf, [0xab; 512]);
        assert_eq!(backend.submitted().len(), 2);
    }

    #[test]
    fn out_of_bounds_read_fails() {
        let backend = MemBackend::new(1024);
        let mem = Arc::new(GuestRam::new(0x4000));
        let err = run(&backend, &mem, BackendOp::Read { offset: 1024, sg: sg(0, 512) })
            .unwrap_err();
        assert!(matches!(err, BackendError::OutOfBounds { .. }));
    }

    #[test]
    fn injected_faults_are_consumed_in_order() {
        let backend = MemBackend::new(4096);
        let mem = Arc::new(GuestRam::new(0x4000));
        backend.fail_next(OpKind::Flush, BackendError::NoSpace, 2);
        assert_eq!(run(&backend, &mem, BackendOp::Flush), Err(BackendError::NoSpace));
        assert_eq!(run(&backend, &mem, BackendOp::Flush), Err(BackendError::NoSpace));
        assert_eq!(run(&backend, &mem, BackendOp::Flush), Ok(BackendReply::Done));
    }

    #[test]
    fn deferred_completions_wait_for_drain() {
        let backend = MemBackend::new(4096);
        backend.set_deferred(true);
        let mem = Arc::new(GuestRam::new(0x4000));
        let hits = Arc::new(Mutex::new(0));
        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            backend.submit(
                BackendRequest {
                    op: BackendOp::Flush,
                    mem: Arc::clone(&mem) as Arc<dyn GuestMemory>,
                },
                Completion::new(move |_| *hits.lock().unwrap() += 1),
            );
        }
        assert_eq!(backend.deferred_len(), 3);
        assert_eq!(*hits.lock().unwrap(), 0);
        backend.drain();
        assert_eq!(*hits.lock().unwrap(), 3);
    }

    #[test]
    fn plug_guards_nest() {
        let backend = MemBackend::new(512);
        {
            let _outer = PlugGuard::new(&backend);
            {
                let _inner = PlugGuard::new(&backend);
                assert_eq!(backend.plug_depth(), 2);
            }
            assert_eq!(backend.plug_depth(), 1);
        }
        assert_eq!(backend.plug_depth(), 0);
        assert_eq!(backend.max_plug_depth(), 2);
    }

    #[test]
    fn zone_append_lands_at_write_pointer() {
        let backend = MemBackend::new_zoned(ZonedLayout {
            zone_size: 4096,
            nr_zones: 4,
            nr_conventional: 1,
            max_open_zones: 2,
            max_active_zones: 2,
            max_append_sectors: 8,
            write_granularity: 512,
        });
        let mem = Arc::new(GuestRam::new(0x4000));
        let first = run(&backend, &mem, BackendOp::ZoneAppend { offset: 4096, sg: sg(0, 512) });
        assert_eq!(first, Ok(BackendReply::Appended { offset: 4096 }));
        let second = run(&backend, &mem, BackendOp::ZoneAppend { offset: 4096, sg: sg(0, 512) });
        assert_eq!(second, Ok(BackendReply::Appended { offset: 4608 }));
        assert_eq!(backend.zone(1).unwrap().state, BlockZoneState::ImplicitOpen);

        assert_eq!(
            run(&backend, &mem, BackendOp::ZoneAppend { offset: 0, sg: sg(0, 512) }),
            Err(BackendError::InvalidArgument)
        );
        assert!(backend.zone_is_conventional(0));

        run(
            &backend,
            &mem,
            BackendOp::ZoneMgmt {
                op: ZoneOp::Reset,
                offset: 0,
                len: 4096 * 4,
            },
        )
        .unwrap();
        let zone = backend.zone(1).unwrap();
        assert_eq!((zone.wp, zone.state), (4096, BlockZoneState::Empty));
    }

    #[test]
    fn sequential_zone_rejects_write_off_the_pointer() {
        let backend = MemBackend::new_zoned(ZonedLayout {
            zone_size: 4096,
            nr_zones: 2,
            nr_conventional: 0,
            max_open_zones: 0,
            max_active_zones: 0,
            max_append_sectors: 8,
            write_granularity: 512,
        });
        let mem = Arc::new(GuestRam::new(0x4000));
        assert_eq!(
            run(&backend, &mem, BackendOp::Write { offset: 512, sg: sg(0, 512) }),
            Err(BackendError::InvalidArgument)
        );
        run(&backend, &mem, BackendOp::Write { offset: 0, sg: sg(0, 512) }).unwrap();
        match run(&backend, &mem, BackendOp::ZoneReport { offset: 0, nr_zones: 8 }) {
            Ok(BackendReply::Zones(zones)) => {
                assert_eq!(zones.len(), 2);
                assert_eq!(zones[0].wp, 512);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }
}
