use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("guest notifiers unavailable")]
    GuestNotifiers,

    #[error("host notifier for queue {0} unavailable")]
    HostNotifier(u16),
}

/// Device-to-transport hooks: interrupt delivery and notifier plumbing.
pub trait Transport: Send + Sync {
    /// Binds (or unbinds) the device->guest interrupt channels for `nvqs` queues.
    fn set_guest_notifiers(&self, nvqs: u16, assign: bool) -> Result<(), TransportError>;

    /// Binds (or unbinds) the guest->device kick channel of `queue`.
    fn set_host_notifier(&self, queue: u16, assign: bool) -> Result<(), TransportError>;

    /// Batches notifier changes until the matching [`Transport::commit_transaction`].
    fn begin_transaction(&self) {}

    fn commit_transaction(&self) {}

    /// Raises the used-buffer interrupt of `queue`.
    fn notify(&self, queue: u16);

    /// The device hit an unrecoverable guest protocol violation.
    fn device_broken(&self, _reason: &str) {}

    /// Raises the configuration-change interrupt.
    fn config_changed(&self) {}
}

#[derive(Debug, Default)]
struct MockState {
    guest_assigned: bool,
    host_assigned: BTreeSet<u16>,
    fail_guest: bool,
    fail_host: Option<u16>,
    guest_calls: u32,
    host_calls: u32,
    depth: u32,
    commits: u32,
    interrupts: Vec<u16>,
    broken: Vec<String>,
    config_changes: u32,
}

/// Recording [`Transport`] with failure injection.
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail_guest_notifiers(&self, fail: bool) {
        self.lock().fail_guest = fail;
    }

    /// Makes assigning the host notifier of `queue` fail.
    pub fn fail_host_notifier(&self, queue: Option<u16>) {
        self.lock().fail_host = queue;
    }

    pub fn guest_notifiers_assigned(&self) -> bool {
        self.lock().guest_assigned
    }

    pub fn host_notifiers_assigned(&self) -> usize {
        self.lock().host_assigned.len()
    }

    /// Number of successful notifier set-up calls (guest + host).
    pub fn setup_calls(&self) -> u32 {
        let st = self.lock();
        st.guest_calls + st.host_calls
    }

    pub fn commits(&self) -> u32 {
        self.lock().commits
    }

    pub fn interrupts(&self) -> Vec<u16> {
        self.lock().interrupts.clone()
    }

    pub fn broken_reasons(&self) -> Vec<String> {
        self.lock().broken.clone()
    }

    pub fn config_changes(&self) -> u32 {
        self.lock().config_changes
    }
}

impl Transport for MockTransport {
    fn set_guest_notifiers(&self, _nvqs: u16, assign: bool) -> Result<(), TransportError> {
        let mut st = self.lock();
        if assign {
            if st.fail_guest {
                return Err(TransportError::GuestNotifiers);
            }
            st.guest_calls += 1;
        }
        st.guest_assigned = assign;
        Ok(())
    }

    fn set_host_notifier(&self, queue: u16, assign: bool) -> Result<(), TransportError> {
        let mut st = self.lock();
        if assign {
            if st.fail_host == Some(queue) {
                return Err(TransportError::HostNotifier(queue));
            }
            st.host_calls += 1;
            st.host_assigned.insert(queue);
        } else {
            st.host_assigned.remove(&queue);
        }
        Ok(())
    }

    fn begin_transaction(&self) {
        self.lock().depth += 1;
    }

    fn commit_transaction(&self) {
        let mut st = self.lock();
        st.depth = st.depth.saturating_sub(1);
        if st.depth == 0 {
            st.commits += 1;
        }
    }

    fn notify(&self, queue: u16) {
        self.lock().interrupts.push(queue);
    }

    fn device_broken(&self, reason: &str) {
        self.lock().broken.push(reason.to_owned());
    }

    fn config_changed(&self) {
        self.lock().config_changes += 1;
    }
}
