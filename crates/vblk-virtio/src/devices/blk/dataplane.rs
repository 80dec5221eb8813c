//! Queue processing and the dataplane lifecycle.
//!
//! While the dataplane is started every queue is processed on its bound context, fed by kicks
//! scheduled there. Otherwise queues are processed inline by whoever delivers the guest
//! notification, and completions run on the main loop.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use vblk_storage::PlugGuard;

use super::error::{ProtocolError, StartError};
use super::merge::MultiReqBuffer;
use super::request::Request;
use super::{BlkInner, QueueState};

#[derive(Debug, Default)]
pub(crate) struct DataplaneState {
    started: AtomicBool,
    starting: AtomicBool,
    stopping: AtomicBool,
    /// Set when a start failed; the next stop only clears it.
    disabled: AtomicBool,
    drain_depth: AtomicU32,
    /// Serializes start, stop and drain transitions.
    control: Mutex<()>,
}

impl DataplaneState {
    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    fn stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    fn draining(&self) -> bool {
        self.drain_depth.load(Ordering::Acquire) > 0
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BlkInner {
    pub(super) fn start_dataplane(self: &Arc<Self>) -> Result<(), StartError> {
        let _control = self.dataplane.lock();
        let dp = &self.dataplane;
        if dp.started() || dp.starting.load(Ordering::Acquire) {
            return Ok(());
        }
        dp.starting.store(true, Ordering::Release);
        let nvqs = self.nvqs();

        if let Err(err) = self.transport.set_guest_notifiers(nvqs, true) {
            tracing::warn!(%err, "virtio-blk failed to set guest notifiers, dataplane disabled");
            dp.disabled.store(true, Ordering::Release);
            dp.starting.store(false, Ordering::Release);
            return Err(StartError::GuestNotifiers(err));
        }

        self.transport.begin_transaction();
        for queue in 0..nvqs {
            if let Err(source) = self.transport.set_host_notifier(queue, true) {
                tracing::warn!(
                    queue,
                    err = %source,
                    "virtio-blk failed to set host notifier, rolling back"
                );
                for assigned in (0..queue).rev() {
                    if let Err(err) = self.transport.set_host_notifier(assigned, false) {
                        tracing::warn!(queue = assigned, %err, "virtio-blk host notifier rollback failed");
                    }
                }
                self.transport.commit_transaction();
                if let Err(err) = self.transport.set_guest_notifiers(nvqs, false) {
                    tracing::warn!(%err, "virtio-blk failed to release guest notifiers");
                }
                dp.disabled.store(true, Ordering::Release);
                dp.starting.store(false, Ordering::Release);
                return Err(StartError::HostNotifier { queue, source });
            }
        }
        self.transport.commit_transaction();

        let first = self.bound_context(0);
        if let Err(err) = self.backend.attach_context(first.name()) {
            tracing::warn!(
                context = first.name(),
                %err,
                "virtio-blk failed to move backend context, continuing anyway"
            );
        }

        // Bound contexts may run as soon as `started` is visible.
        dp.starting.store(false, Ordering::Release);
        dp.started.store(true, Ordering::Release);
        tracing::debug!(nvqs, "virtio-blk dataplane started");

        if !dp.draining() {
            for q in 0..nvqs {
                self.attach_queue(q);
            }
        }
        Ok(())
    }

    /// Stops the dataplane and processes notifications that arrived meanwhile.
    pub(super) fn stop_dataplane(self: &Arc<Self>) {
        self.stop_dataplane_quiet();
        self.service_pending_kicks();
    }

    /// Stops the dataplane without looking at pending notifications.
    pub(super) fn stop_dataplane_quiet(self: &Arc<Self>) {
        let _control = self.dataplane.lock();
        let dp = &self.dataplane;
        if dp.stopping() {
            return;
        }
        if dp.disabled() {
            dp.disabled.store(false, Ordering::Release);
            dp.started.store(false, Ordering::Release);
            return;
        }
        if !dp.started() {
            return;
        }
        dp.stopping.store(true, Ordering::Release);
        let nvqs = self.nvqs();

        if !dp.draining() {
            for q in 0..nvqs {
                self.detach_queue(q);
            }
        }

        self.transport.begin_transaction();
        for q in 0..nvqs {
            if let Err(err) = self.transport.set_host_notifier(q, false) {
                tracing::warn!(queue = q, %err, "virtio-blk failed to release host notifier");
            }
        }
        self.transport.commit_transaction();

        self.backend.drain();
        self.wait_for_inflight();

        if let Err(err) = self.backend.attach_context(self.main_ctx.name()) {
            tracing::warn!(%err, "virtio-blk failed to move backend back to the main loop");
        }
        if let Err(err) = self.transport.set_guest_notifiers(nvqs, false) {
            tracing::warn!(%err, "virtio-blk failed to release guest notifiers");
        }
        dp.started.store(false, Ordering::Release);
        dp.stopping.store(false, Ordering::Release);
        tracing::debug!(nvqs, "virtio-blk dataplane stopped");
    }

    pub(super) fn drained_begin(self: &Arc<Self>) {
        let _control = self.dataplane.lock();
        let dp = &self.dataplane;
        if dp.drain_depth.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        tracing::debug!("virtio-blk drained begin");
        if dp.started() && !dp.stopping() {
            for q in 0..self.nvqs() {
                self.detach_queue(q);
            }
        }
        self.backend.drain();
        self.wait_for_inflight();
    }

    pub(super) fn drained_end(self: &Arc<Self>) {
        let resume = {
            let _control = self.dataplane.lock();
            let dp = &self.dataplane;
            let prev = dp
                .drain_depth
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1))
                .unwrap_or(0);
            if prev != 1 {
                return;
            }
            tracing::debug!("virtio-blk drained end");
            if dp.started() && !dp.stopping() {
                for q in 0..self.nvqs() {
                    self.attach_queue(q);
                }
                false
            } else {
                !dp.started()
            }
        };
        if resume {
            self.service_pending_kicks();
        }
    }

    /// Guest notification for `q`.
    pub(super) fn handle_output(self: &Arc<Self>, q: u16) {
        if q >= self.nvqs() {
            tracing::warn!(queue = q, "virtio-blk notification for unknown queue");
            return;
        }
        let dp = &self.dataplane;
        if self.conf.ioeventfd
            && !dp.started()
            && !dp.disabled()
            && !dp.draining()
            && self.vm_running.load(Ordering::Acquire)
        {
            match self.start_dataplane() {
                Ok(()) if dp.started() => return,
                Ok(()) => {}
                Err(err) => {
                    tracing::debug!(%err, "virtio-blk processing queues inline");
                }
            }
        }

        if dp.started() {
            if dp.draining() || dp.stopping() {
                self.lock_queue(q).pending_kick = true;
            } else {
                self.kick(q);
            }
            return;
        }
        if dp.draining() {
            self.lock_queue(q).pending_kick = true;
            return;
        }
        self.handle_queue(q);
    }

    /// Schedules processing of `q` on its bound context.
    fn kick(self: &Arc<Self>, q: u16) {
        let ctx = self.bound_context(q);
        let dev = Arc::clone(self);
        if !ctx.schedule(move || dev.notifier_read(q)) {
            tracing::warn!(queue = q, context = ctx.name(), "virtio-blk context is gone, kick dropped");
        }
    }

    /// Hands `q` to its bound context. The kick covers any notification held back meanwhile.
    fn attach_queue(self: &Arc<Self>, q: u16) {
        {
            let mut qs = self.lock_queue(q);
            qs.attached = true;
            qs.pending_kick = false;
        }
        self.kick(q);
    }

    fn notifier_read(self: &Arc<Self>, q: u16) {
        if self.lock_queue(q).attached {
            self.handle_queue(q);
        }
    }

    fn detach_queue(self: &Arc<Self>, q: u16) {
        let ctx = self.bound_context(q);
        let dev = Arc::clone(self);
        if ctx
            .run_sync(move || dev.lock_queue(q).attached = false)
            .is_none()
        {
            self.lock_queue(q).attached = false;
        }
    }

    fn service_pending_kicks(self: &Arc<Self>) {
        for q in 0..self.nvqs() {
            if std::mem::take(&mut self.lock_queue(q).pending_kick) {
                self.handle_output(q);
            }
        }
    }

    /// Pops and routes everything available on `q`.
    pub(super) fn handle_queue(self: &Arc<Self>, q: u16) {
        if self.is_broken() {
            return;
        }
        let _plug = PlugGuard::new(self.backend.as_ref());
        let mut qs = self.lock_queue(q);
        let mut mrb = MultiReqBuffer::default();
        match self.handle_vq(&mut qs, q, &mut mrb) {
            Ok(()) => self.submit_multireq(&mut qs, q, &mut mrb),
            Err(err) => {
                self.unwind(&mut qs, &mut mrb);
                self.mark_broken(q, &err);
            }
        }
        self.flush_notify(&mut qs, q);
    }

    fn handle_vq(
        self: &Arc<Self>,
        qs: &mut QueueState,
        q: u16,
        mrb: &mut MultiReqBuffer,
    ) -> Result<(), ProtocolError> {
        loop {
            qs.vq.set_notification(false);
            let drained = self.pop_all(qs, q, mrb);
            qs.vq.set_notification(true);
            drained?;
            if qs.vq.is_empty() {
                return Ok(());
            }
        }
    }

    fn pop_all(
        self: &Arc<Self>,
        qs: &mut QueueState,
        q: u16,
        mrb: &mut MultiReqBuffer,
    ) -> Result<(), ProtocolError> {
        while let Some(chain) = qs.vq.pop()? {
            let id = qs.arena.insert(Request::new(q, chain));
            if let Err(err) = self.handle_request(qs, q, id, mrb) {
                if let Some(req) = qs.arena.remove(id) {
                    let _ = qs.vq.detach(req.chain.head_index());
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Gives back every request still parked in `mrb`.
    pub(super) fn unwind(&self, qs: &mut QueueState, mrb: &mut MultiReqBuffer) {
        for id in mrb.take() {
            self.abandon(qs, id);
        }
    }

    pub(super) fn vm_state_change(self: &Arc<Self>, running: bool) {
        if running {
            self.vm_running.store(true, Ordering::Release);
            if self.resume_dataplane.swap(false, Ordering::AcqRel) {
                if let Err(err) = self.start_dataplane() {
                    tracing::warn!(%err, "virtio-blk dataplane restart failed");
                }
            }
            self.dma_restart();
            self.service_pending_kicks();
        } else {
            self.vm_running.store(false, Ordering::Release);
            self.resume_dataplane
                .store(self.dataplane.started(), Ordering::Release);
            self.stop_dataplane_quiet();
        }
    }
}
