use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use vblk_storage::{BackendError, BackendResult};

use super::accounting::AcctKind;
use super::request::{RequestId, RequestState};
use super::wire::{VIRTIO_BLK_S_IOERR, VIRTIO_BLK_S_OK};
use super::{BlkInner, QueueState};

/// Per-direction reaction to a backend error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockdevOnError {
    Report,
    Ignore,
    /// Stop on out-of-space, report everything else.
    Enospc,
    Stop,
    /// Report for reads, enospc for writes.
    #[default]
    Auto,
}

/// What the device does with one failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Complete with `VIRTIO_BLK_S_IOERR`.
    Report,
    /// Complete with `VIRTIO_BLK_S_OK`, but count the failure.
    Ignore,
    /// Park the request on the retry list and pause the VM.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorPolicy {
    pub rerror: BlockdevOnError,
    pub werror: BlockdevOnError,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            rerror: BlockdevOnError::Auto,
            werror: BlockdevOnError::Auto,
        }
    }
}

impl ErrorPolicy {
    pub fn action(&self, is_read: bool, error: BackendError) -> ErrorAction {
        let on_err = if is_read { self.rerror } else { self.werror };
        let on_err = match on_err {
            BlockdevOnError::Auto if is_read => BlockdevOnError::Report,
            BlockdevOnError::Auto => BlockdevOnError::Enospc,
            other => other,
        };
        match on_err {
            BlockdevOnError::Report | BlockdevOnError::Auto => ErrorAction::Report,
            BlockdevOnError::Ignore => ErrorAction::Ignore,
            BlockdevOnError::Stop => ErrorAction::Stop,
            BlockdevOnError::Enospc if error.is_no_space() => ErrorAction::Stop,
            BlockdevOnError::Enospc => ErrorAction::Report,
        }
    }
}

/// A request to pause the VM after a stop-policy error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopRequest {
    pub queue: u16,
    pub is_read: bool,
    pub error: BackendError,
}

/// Hook into the VM run state.
///
/// `request_stop` must only record the request: the actual pause arrives later through
/// [`super::BlockFrontend::vm_state_change`], never from inside the call.
pub trait RunState: Send + Sync {
    fn request_stop(&self, req: StopRequest);
}

/// [`RunState`] that records stop requests.
#[derive(Debug, Default)]
pub struct VmRunState {
    requests: Mutex<Vec<StopRequest>>,
}

impl VmRunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop_requested(&self) -> bool {
        !self
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    pub fn take_requests(&self) -> Vec<StopRequest> {
        std::mem::take(&mut *self.requests.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl RunState for VmRunState {
    fn request_stop(&self, req: StopRequest) {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(req);
    }
}

/// Identifies what a backend completion belongs to.
#[derive(Debug)]
pub(crate) enum Token {
    /// One read or write batch; members complete in this order.
    Rw {
        members: Vec<RequestId>,
        is_write: bool,
    },
    Flush(RequestId),
    DiscardWriteZeroes {
        id: RequestId,
        is_write_zeroes: bool,
    },
    ZoneReport(RequestId),
    ZoneMgmt(RequestId),
    ZoneAppend(RequestId),
    Scsi(RequestId),
}

impl Token {
    fn ids(&self) -> Vec<RequestId> {
        match self {
            Token::Rw { members, .. } => members.clone(),
            Token::Flush(id)
            | Token::DiscardWriteZeroes { id, .. }
            | Token::ZoneReport(id)
            | Token::ZoneMgmt(id)
            | Token::ZoneAppend(id)
            | Token::Scsi(id) => vec![*id],
        }
    }
}

/// Result of running the error policy on one request.
enum ErrorOutcome {
    Completed,
    Stopped(StopRequest),
    /// Continue as if the request succeeded.
    Ignored,
}

impl BlkInner {
    /// Handles one backend completion on the queue's context.
    pub(super) fn complete(
        self: &Arc<Self>,
        q: u16,
        generation: u64,
        token: Token,
        result: BackendResult,
    ) {
        let mut stops = Vec::new();
        {
            let mut qs = self.lock_queue(q);
            if qs.generation != generation {
                tracing::trace!(queue = q, "virtio-blk dropping completion from before reset");
                for id in token.ids() {
                    qs.arena.remove(id);
                }
            } else {
                match token {
                    Token::Rw { members, is_write } => {
                        self.complete_rw(&mut qs, q, &members, is_write, &result, &mut stops);
                    }
                    Token::Flush(id) => {
                        self.complete_flush(&mut qs, q, id, &result, &mut stops);
                    }
                    Token::DiscardWriteZeroes {
                        id,
                        is_write_zeroes,
                    } => self.complete_discard_write_zeroes(
                        &mut qs,
                        q,
                        id,
                        is_write_zeroes,
                        &result,
                        &mut stops,
                    ),
                    Token::ZoneReport(id) => self.complete_zone_report(&mut qs, q, id, result),
                    Token::ZoneMgmt(id) => self.complete_zone_mgmt(&mut qs, q, id, &result),
                    Token::ZoneAppend(id) => self.complete_zone_append(&mut qs, q, id, &result),
                    Token::Scsi(id) => self.complete_scsi(&mut qs, q, id, result),
                }
                self.flush_notify(&mut qs, q);
            }
        }
        for stop in stops {
            self.run_state.request_stop(stop);
        }
        self.inflight.dec();
    }

    fn complete_rw(
        &self,
        qs: &mut QueueState,
        q: u16,
        members: &[RequestId],
        is_write: bool,
        result: &BackendResult,
        stops: &mut Vec<StopRequest>,
    ) {
        for &id in members {
            let mut ignored = false;
            if let Err(err) = result {
                match self.handle_rw_error(qs, q, id, *err, !is_write, true) {
                    ErrorOutcome::Completed => continue,
                    ErrorOutcome::Stopped(stop) => {
                        stops.push(stop);
                        continue;
                    }
                    ErrorOutcome::Ignored => ignored = true,
                }
            }
            if !ignored {
                self.acct_done(qs, id);
            }
            tracing::trace!(queue = q, is_write, "virtio-blk rw complete");
            self.req_complete(qs, q, id, VIRTIO_BLK_S_OK);
        }
    }

    fn complete_flush(
        &self,
        qs: &mut QueueState,
        q: u16,
        id: RequestId,
        result: &BackendResult,
        stops: &mut Vec<StopRequest>,
    ) {
        if let Err(err) = result {
            match self.handle_rw_error(qs, q, id, *err, false, true) {
                ErrorOutcome::Completed => return,
                ErrorOutcome::Stopped(stop) => {
                    stops.push(stop);
                    return;
                }
                ErrorOutcome::Ignored => {}
            }
        } else {
            self.acct_done(qs, id);
        }
        self.req_complete(qs, q, id, VIRTIO_BLK_S_OK);
    }

    fn complete_discard_write_zeroes(
        &self,
        qs: &mut QueueState,
        q: u16,
        id: RequestId,
        is_write_zeroes: bool,
        result: &BackendResult,
        stops: &mut Vec<StopRequest>,
    ) {
        if let Err(err) = result {
            match self.handle_rw_error(qs, q, id, *err, false, is_write_zeroes) {
                ErrorOutcome::Completed => return,
                ErrorOutcome::Stopped(stop) => {
                    stops.push(stop);
                    return;
                }
                ErrorOutcome::Ignored => {}
            }
        } else {
            self.acct_done(qs, id);
        }
        self.req_complete(qs, q, id, VIRTIO_BLK_S_OK);
    }

    /// Applies the error policy to a failed request.
    fn handle_rw_error(
        &self,
        qs: &mut QueueState,
        q: u16,
        id: RequestId,
        error: BackendError,
        is_read: bool,
        acct_failed: bool,
    ) -> ErrorOutcome {
        let action = self.policy.action(is_read, error);
        tracing::trace!(queue = q, is_read, %error, ?action, "virtio-blk request failed");
        match action {
            ErrorAction::Stop => {
                let Some(mut req) = qs.arena.remove(id) else {
                    return ErrorOutcome::Completed;
                };
                req.state = RequestState::AwaitingRetry;
                req.acct = None;
                self.retry.push(req);
                tracing::warn!(
                    queue = q,
                    is_read,
                    %error,
                    "virtio-blk request failed, pausing VM for retry"
                );
                ErrorOutcome::Stopped(StopRequest {
                    queue: q,
                    is_read,
                    error,
                })
            }
            ErrorAction::Report => {
                if acct_failed {
                    self.acct_failed(qs, id);
                }
                self.req_complete(qs, q, id, VIRTIO_BLK_S_IOERR);
                ErrorOutcome::Completed
            }
            ErrorAction::Ignore => {
                if acct_failed {
                    self.acct_failed(qs, id);
                }
                ErrorOutcome::Ignored
            }
        }
    }

    pub(super) fn acct_done(&self, qs: &mut QueueState, id: RequestId) {
        if let Some(acct) = qs.arena.get_mut(id).and_then(|r| r.acct.take()) {
            self.stats.done(&acct);
        }
    }

    pub(super) fn acct_failed(&self, qs: &mut QueueState, id: RequestId) {
        if let Some(acct) = qs.arena.get_mut(id).and_then(|r| r.acct.take()) {
            self.stats.failed(&acct);
        }
    }

    /// Counts a request rejected before submission and drops its accounting record.
    pub(super) fn acct_invalid(&self, qs: &mut QueueState, id: RequestId, kind: AcctKind) {
        if let Some(req) = qs.arena.get_mut(id) {
            req.acct = None;
        }
        self.stats.invalid(kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_reports_reads_and_stops_writes_on_enospc() {
        let policy = ErrorPolicy::default();
        assert_eq!(policy.action(true, BackendError::NoSpace), ErrorAction::Report);
        assert_eq!(policy.action(false, BackendError::NoSpace), ErrorAction::Stop);
        assert_eq!(policy.action(false, BackendError::Errno(28)), ErrorAction::Stop);
        assert_eq!(policy.action(false, BackendError::Io), ErrorAction::Report);
    }

    #[test]
    fn explicit_policies_apply_per_direction() {
        let policy = ErrorPolicy {
            rerror: BlockdevOnError::Ignore,
            werror: BlockdevOnError::Stop,
        };
        assert_eq!(policy.action(true, BackendError::Io), ErrorAction::Ignore);
        assert_eq!(policy.action(false, BackendError::Io), ErrorAction::Stop);

        let policy = ErrorPolicy {
            rerror: BlockdevOnError::Enospc,
            werror: BlockdevOnError::Report,
        };
        assert_eq!(policy.action(true, BackendError::NoSpace), ErrorAction::Stop);
        assert_eq!(policy.action(false, BackendError::NoSpace), ErrorAction::Report);
    }

    #[test]
    fn recording_run_state_collects_requests() {
        let rs = VmRunState::new();
        assert!(!rs.stop_requested());
        rs.request_stop(StopRequest {
            queue: 1,
            is_read: false,
            error: BackendError::NoSpace,
        });
        assert!(rs.stop_requested());
        assert_eq!(rs.take_requests().len(), 1);
        assert!(!rs.stop_requested());
    }
}
