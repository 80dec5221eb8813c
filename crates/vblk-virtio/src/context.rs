//! Worker contexts that own queue processing and completion handling.
//!
//! An [`IoContext`] is a FIFO of tasks. It is either pumped cooperatively by whoever owns it
//! ([`IoContext::run_until_idle`]) or driven by a dedicated [`IoThread`]. Everything a queue does
//! (popping requests, reacting to backend completions) runs as a task on the queue's context, so
//! per-queue work never runs concurrently with itself.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::{self, JoinHandle, ThreadId};

use tokio::sync::{mpsc, oneshot};

type Task = Box<dyn FnOnce() + Send>;

enum Message {
    Run(Task),
    Shutdown,
}

struct ContextInner {
    name: String,
    tx: mpsc::UnboundedSender<Message>,
    rx: Mutex<mpsc::UnboundedReceiver<Message>>,
    closed: AtomicBool,
    driver: Mutex<Option<ThreadId>>,
}

#[derive(Clone)]
pub struct IoContext {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for IoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoContext")
            .field("name", &self.inner.name)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl IoContext {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ContextInner {
                name: name.into(),
                tx,
                rx: Mutex::new(rx),
                closed: AtomicBool::new(false),
                driver: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn same_as(&self, other: &IoContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Queues `f`. Returns `false` once the context has been shut down.
    pub fn schedule(&self, f: impl FnOnce() + Send + 'static) -> bool {
        if self.inner.closed.load(Ordering::Acquire) {
            return false;
        }
        self.inner.tx.send(Message::Run(Box::new(f))).is_ok()
    }

    fn driver(&self) -> MutexGuard<'_, Option<ThreadId>> {
        self.inner
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a thread other than the caller is running this context.
    pub fn is_driven_elsewhere(&self) -> bool {
        matches!(*self.driver(), Some(id) if id != thread::current().id())
    }

    /// Runs queued tasks, including ones they schedule, until the queue is empty.
    ///
    /// Returns the number of tasks run. Does nothing when a worker thread drives the context.
    pub fn run_until_idle(&self) -> usize {
        if self.is_driven_elsewhere() {
            return 0;
        }
        let mut ran = 0;
        loop {
            let msg = match self.inner.rx.try_lock() {
                Ok(mut rx) => rx.try_recv(),
                Err(TryLockError::Poisoned(p)) => p.into_inner().try_recv(),
                Err(TryLockError::WouldBlock) => return ran,
            };
            match msg {
                Ok(Message::Run(task)) => {
                    task();
                    ran += 1;
                }
                Ok(Message::Shutdown) | Err(_) => return ran,
            }
        }
    }

    /// Runs tasks on the calling thread until [`IoContext::shutdown`].
    pub fn run_blocking(&self) {
        *self.driver() = Some(thread::current().id());
        loop {
            let msg = {
                let mut rx = self.inner.rx.lock().unwrap_or_else(PoisonError::into_inner);
                rx.blocking_recv()
            };
            match msg {
                Some(Message::Run(task)) => task(),
                Some(Message::Shutdown) | None => break,
            }
        }
        *self.driver() = None;
    }

    /// Runs `f` inside this context and waits for its result.
    ///
    /// When no other thread drives the context, `f` runs directly on the caller.
    pub fn run_sync<R: Send + 'static>(
        &self,
        f: impl FnOnce() -> R + Send + 'static,
    ) -> Option<R> {
        if !self.is_driven_elsewhere() {
            return Some(f());
        }
        let (tx, rx) = oneshot::channel();
        if !self.schedule(move || {
            let _ = tx.send(f());
        }) {
            return None;
        }
        rx.blocking_recv().ok()
    }

    pub fn shutdown(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            let _ = self.inner.tx.send(Message::Shutdown);
        }
    }
}

/// A context with its own worker thread. Dropping it stops and joins the thread.
#[derive(Debug)]
pub struct IoThread {
    ctx: IoContext,
    handle: Option<JoinHandle<()>>,
}

impl IoThread {
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let ctx = IoContext::new(name);
        let worker = ctx.clone();
        let handle = thread::Builder::new()
            .name(format!("iothread-{name}"))
            .spawn(move || worker.run_blocking())?;
        *ctx.driver() = Some(handle.thread().id());
        Ok(Self {
            ctx,
            handle: Some(handle),
        })
    }

    pub fn context(&self) -> &IoContext {
        &self.ctx
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        self.ctx.shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!(iothread = self.ctx.name(), "iothread panicked");
            }
        }
    }
}

/// Named contexts a device may bind its queues to, plus the main loop.
#[derive(Debug)]
pub struct IoThreadRegistry {
    main: IoContext,
    contexts: BTreeMap<String, IoContext>,
    threads: Vec<IoThread>,
}

impl Default for IoThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IoThreadRegistry {
    pub fn new() -> Self {
        Self {
            main: IoContext::new("main-loop"),
            contexts: BTreeMap::new(),
            threads: Vec::new(),
        }
    }

    pub fn main_context(&self) -> &IoContext {
        &self.main
    }

    /// Registers a cooperatively pumped context.
    pub fn add_context(&mut self, name: &str) -> IoContext {
        let ctx = IoContext::new(name);
        self.contexts.insert(name.to_owned(), ctx.clone());
        ctx
    }

    /// Registers a context backed by its own thread.
    pub fn spawn_iothread(&mut self, name: &str) -> std::io::Result<IoContext> {
        let thread = IoThread::spawn(name)?;
        let ctx = thread.context().clone();
        self.contexts.insert(name.to_owned(), ctx.clone());
        self.threads.push(thread);
        Ok(ctx)
    }

    pub fn get(&self, name: &str) -> Option<IoContext> {
        self.contexts.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.contexts.contains_key(name)
    }

    /// Pumps the main loop and every cooperative context until none has work left.
    pub fn run_until_idle(&self) -> usize {
        let mut total = 0;
        loop {
            let mut ran = self.main.run_until_idle();
            for ctx in self.contexts.values() {
                ran += ctx.run_until_idle();
            }
            if ran == 0 {
                return total;
            }
            total += ran;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn tasks_scheduled_by_tasks_run_in_the_same_pump() {
        let ctx = IoContext::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));
        let (inner_ctx, inner_log) = (ctx.clone(), Arc::clone(&log));
        ctx.schedule(move || {
            inner_log.lock().unwrap().push(1);
            let again = Arc::clone(&inner_log);
            inner_ctx.schedule(move || again.lock().unwrap().push(3));
        });
        let second = Arc::clone(&log);
        ctx.schedule(move || second.lock().unwrap().push(2));
        assert_eq!(ctx.run_until_idle(), 3);
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(ctx.run_until_idle(), 0);
    }

    #[test]
    fn shut_down_context_refuses_work() {
        let ctx = IoContext::new("test");
        ctx.shutdown();
        assert!(!ctx.schedule(|| {}));
    }

    #[test]
    fn run_sync_executes_on_the_worker_thread() {
        let thread = IoThread::spawn("worker").unwrap();
        let name = thread
            .context()
            .run_sync(|| thread::current().name().map(str::to_owned))
            .unwrap();
        assert_eq!(name.as_deref(), Some("iothread-worker"));
        assert_eq!(thread.context().run_until_idle(), 0);
    }

    #[test]
    fn run_sync_is_inline_for_cooperative_contexts() {
        let ctx = IoContext::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        ctx.run_sync(move || h.fetch_add(1, Ordering::SeqCst));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registry_pumps_all_cooperative_contexts() {
        let mut reg = IoThreadRegistry::new();
        let a = reg.add_context("a");
        let hits = Arc::new(AtomicUsize::new(0));
        for ctx in [reg.main_context().clone(), a] {
            let h = Arc::clone(&hits);
            ctx.schedule(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(reg.run_until_idle(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(reg.contains("a"));
        assert!(reg.get("b").is_none());
    }
}
