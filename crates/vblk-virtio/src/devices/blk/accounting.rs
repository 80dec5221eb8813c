use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Kind of accounted I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcctKind {
    Read,
    Write,
    Flush,
    ZoneAppend,
    Unmap,
}

impl AcctKind {
    const COUNT: usize = 5;

    fn index(self) -> usize {
        match self {
            AcctKind::Read => 0,
            AcctKind::Write => 1,
            AcctKind::Flush => 2,
            AcctKind::ZoneAppend => 3,
            AcctKind::Unmap => 4,
        }
    }
}

/// Start-of-request accounting record carried by a request until it finishes.
#[derive(Debug, Clone, Copy)]
pub struct AcctCookie {
    pub kind: AcctKind,
    pub bytes: u64,
    start: Instant,
}

#[derive(Debug, Default)]
struct Counters {
    bytes: AtomicU64,
    ops: AtomicU64,
    failed_ops: AtomicU64,
    invalid_ops: AtomicU64,
    merged: AtomicU64,
    total_time_ns: AtomicU64,
}

/// Point-in-time copy of one kind's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AcctSnapshot {
    pub bytes: u64,
    pub ops: u64,
    pub failed_ops: u64,
    pub invalid_ops: u64,
    pub merged: u64,
    pub total_time_ns: u64,
}

/// Per-device I/O statistics.
#[derive(Debug, Default)]
pub struct BlockAcctStats {
    kinds: [Counters; AcctKind::COUNT],
}

impl BlockAcctStats {
    pub fn start(&self, kind: AcctKind, bytes: u64) -> AcctCookie {
        AcctCookie {
            kind,
            bytes,
            start: Instant::now(),
        }
    }

    pub fn done(&self, cookie: &AcctCookie) {
        let c = &self.kinds[cookie.kind.index()];
        c.bytes.fetch_add(cookie.bytes, Ordering::Relaxed);
        c.ops.fetch_add(1, Ordering::Relaxed);
        c.total_time_ns
            .fetch_add(elapsed_ns(cookie), Ordering::Relaxed);
    }

    pub fn failed(&self, cookie: &AcctCookie) {
        let c = &self.kinds[cookie.kind.index()];
        c.failed_ops.fetch_add(1, Ordering::Relaxed);
        c.total_time_ns
            .fetch_add(elapsed_ns(cookie), Ordering::Relaxed);
    }

    /// Counts a request rejected before it reached the backend.
    pub fn invalid(&self, kind: AcctKind) {
        self.kinds[kind.index()]
            .invalid_ops
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn merged(&self, kind: AcctKind, count: u64) {
        self.kinds[kind.index()]
            .merged
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self, kind: AcctKind) -> AcctSnapshot {
        let c = &self.kinds[kind.index()];
        AcctSnapshot {
            bytes: c.bytes.load(Ordering::Relaxed),
            ops: c.ops.load(Ordering::Relaxed),
            failed_ops: c.failed_ops.load(Ordering::Relaxed),
            invalid_ops: c.invalid_ops.load(Ordering::Relaxed),
            merged: c.merged.load(Ordering::Relaxed),
            total_time_ns: c.total_time_ns.load(Ordering::Relaxed),
        }
    }
}

fn elapsed_ns(cookie: &AcctCookie) -> u64 {
    u64::try_from(cookie.start.elapsed().as_nanos()).unwrap_or(u64::MAX)
}
