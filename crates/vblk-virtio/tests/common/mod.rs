#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use vblk_storage::MemBackend;
use vblk_virtio::context::IoThreadRegistry;
use vblk_virtio::devices::blk::{
    BlkConf, BlkHost, BlockFrontend, VirtioBlk, VmRunState, VIRTIO_BLK_T_IN, VIRTIO_BLK_T_OUT,
};
use vblk_virtio::memory::{GuestMemory, GuestRam};
use vblk_virtio::queue::{Descriptor, MemQueue, VirtQueue};
use vblk_virtio::transport::MockTransport;

pub const DISK_BYTES: u64 = 1 << 20;
const RAM_BYTES: usize = 4 << 20;
const FIRST_BUFFER: u64 = 0x1000;
/// Written into status bytes before submission so an untouched status is visible.
pub const STATUS_UNSET: u8 = 0xff;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

/// Guest-side view of one submitted request.
#[derive(Debug, Clone)]
pub struct GuestReq {
    pub head: u16,
    pub status: u64,
    /// Addresses of the device-writable data buffers, status byte excluded.
    pub data_in: Vec<u64>,
}

pub struct Harness {
    pub mem: Arc<GuestRam>,
    pub backend: Arc<MemBackend>,
    pub transport: Arc<MockTransport>,
    pub run_state: Arc<VmRunState>,
    pub queues: Vec<MemQueue>,
    pub dev: VirtioBlk,
    pub registry: IoThreadRegistry,
    next_addr: u64,
}

impl Harness {
    pub fn new(conf: BlkConf) -> Self {
        Self::with_backend(conf, MemBackend::new(DISK_BYTES))
    }

    pub fn with_backend(conf: BlkConf, backend: MemBackend) -> Self {
        Self::build(
            conf,
            Arc::new(GuestRam::new(RAM_BYTES)),
            Arc::new(backend),
            IoThreadRegistry::new(),
        )
    }

    pub fn with_registry(conf: BlkConf, registry: IoThreadRegistry) -> Self {
        Self::build(
            conf,
            Arc::new(GuestRam::new(RAM_BYTES)),
            Arc::new(MemBackend::new(DISK_BYTES)),
            registry,
        )
    }

    /// Realizes a device over existing guest memory and disk and accepts every offered feature.
    pub fn build(
        conf: BlkConf,
        mem: Arc<GuestRam>,
        backend: Arc<MemBackend>,
        registry: IoThreadRegistry,
    ) -> Self {
        init_tracing();
        let transport = Arc::new(MockTransport::new());
        let run_state = Arc::new(VmRunState::new());
        let queues: Vec<MemQueue> = (0..conf.num_queues)
            .map(|_| MemQueue::new(conf.queue_size))
            .collect();
        let host = BlkHost {
            backend: backend.clone(),
            mem: mem.clone(),
            transport: transport.clone(),
            run_state: run_state.clone(),
        };
        let vqs = queues
            .iter()
            .map(|q| Box::new(q.clone()) as Box<dyn VirtQueue>)
            .collect();
        let dev = VirtioBlk::realize(conf, host, &registry, vqs).expect("realize");
        dev.set_features(dev.device_features()).expect("negotiate");
        Self {
            mem,
            backend,
            transport,
            run_state,
            queues,
            dev,
            registry,
            next_addr: FIRST_BUFFER,
        }
    }

    pub fn alloc(&mut self, len: usize) -> u64 {
        let addr = self.next_addr;
        self.next_addr = (addr + len.max(1) as u64 + 15) & !15;
        assert!(self.next_addr <= RAM_BYTES as u64, "guest RAM exhausted");
        addr
    }

    /// Lays out a request and makes it available on `q`.
    ///
    /// `out` buffers follow the header as separate readable descriptors, `ins` are the lengths
    /// of the writable buffers placed before the one-byte status descriptor.
    pub fn add(&mut self, q: u16, type_: u32, sector: u64, out: &[&[u8]], ins: &[u32]) -> GuestReq {
        let hdr = self.alloc(16);
        self.mem.write_u32_le(hdr, type_).unwrap();
        self.mem.write_u32_le(hdr + 4, 0).unwrap();
        self.mem.write_u64_le(hdr + 8, sector).unwrap();
        let mut descs = vec![Descriptor::readable(hdr, 16)];
        for data in out {
            let addr = self.alloc(data.len());
            self.mem.write_from(addr, data).unwrap();
            descs.push(Descriptor::readable(addr, data.len() as u32));
        }
        let mut data_in = Vec::new();
        for &len in ins {
            let addr = self.alloc(len as usize);
            data_in.push(addr);
            descs.push(Descriptor::writable(addr, len));
        }
        let status = self.alloc(1);
        self.mem.write_u8_le(status, STATUS_UNSET).unwrap();
        descs.push(Descriptor::writable(status, 1));
        let head = self.queues[q as usize].add(descs);
        GuestReq {
            head,
            status,
            data_in,
        }
    }

    pub fn add_write(&mut self, q: u16, sector: u64, data: &[u8]) -> GuestReq {
        self.add(q, VIRTIO_BLK_T_OUT, sector, &[data], &[])
    }

    pub fn add_read(&mut self, q: u16, sector: u64, len: u32) -> GuestReq {
        self.add(q, VIRTIO_BLK_T_IN, sector, &[], &[len])
    }

    /// Notifies the device about `q` and runs every cooperative context until idle.
    pub fn kick(&self, q: u16) {
        self.dev.handle_output(q);
        self.pump();
    }

    pub fn pump(&self) -> usize {
        self.registry.run_until_idle()
    }

    pub fn status(&self, req: &GuestReq) -> u8 {
        self.mem.read_u8_le(req.status).unwrap()
    }

    pub fn guest_bytes(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.mem.read_into(addr, &mut buf).unwrap();
        buf
    }

    pub fn used_len(&self, q: u16, req: &GuestReq) -> Option<u32> {
        self.queues[q as usize]
            .used()
            .into_iter()
            .find(|u| u.head == req.head)
            .map(|u| u.len)
    }
}

pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

/// Polls `cond` until it holds, for requests finishing on worker threads.
pub fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}
