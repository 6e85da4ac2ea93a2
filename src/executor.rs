//! Execution contexts for handler delivery
//!
//! Inbound messages and device-list notifications are never run on the
//! transport's thread directly: the dispatcher posts a [`Task`] to an
//! [`Executor`] and returns. Which thread eventually runs the task is the
//! consumer's choice.

use crossbeam::channel::{self, Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// A unit of work posted to an executor
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something that runs posted tasks, now or later, on some thread.
///
/// `execute` must not wait for the task to finish (except for
/// [`InlineExecutor`], which exists for deterministic tests).
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task);
}

fn run_guarded(task: Task, context: &str) {
    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
        error!("Handler panicked on execution context '{}'", context);
    }
}

/// Runs each task immediately on the posting thread
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Task) {
        run_guarded(task, "inline");
    }
}

/// A serial queue backed by one dedicated thread.
///
/// Tasks run one at a time in the order they were posted. Dropping the queue
/// lets the worker finish what is already queued, then joins it.
pub struct SerialQueue {
    label: String,
    tx: Option<Sender<Task>>,
    worker: Option<JoinHandle<()>>,
}

impl SerialQueue {
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        let (tx, rx) = channel::unbounded::<Task>();

        let thread_label = label.clone();
        let worker = thread::Builder::new()
            .name(label.clone())
            .spawn(move || {
                for task in rx.iter() {
                    run_guarded(task, &thread_label);
                }
                debug!("Serial queue '{}' drained", thread_label);
            });

        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("Failed to spawn serial queue '{}': {}", label, e);
                None
            }
        };

        Self {
            label,
            tx: worker.as_ref().map(|_| tx),
            worker,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Executor for SerialQueue {
    fn execute(&self, task: Task) {
        match &self.tx {
            Some(tx) => {
                if tx.send(task).is_err() {
                    debug!("Serial queue '{}' closed, task dropped", self.label);
                }
            }
            // No worker thread could be started; run in place rather than lose the task
            None => run_guarded(task, &self.label),
        }
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            // The last owner may be a task running on the worker itself
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

/// A queue drained by the application's own main/UI loop.
///
/// Post through [`MainQueue::executor`]; run tasks by calling
/// [`MainQueue::run_pending`] or [`MainQueue::run_for`] from the main thread.
pub struct MainQueue {
    tx: Sender<Task>,
    rx: Receiver<Task>,
}

/// Cloneable posting side of a [`MainQueue`]
#[derive(Clone)]
pub struct MainQueueExecutor {
    tx: Sender<Task>,
}

impl Default for MainQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MainQueue {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self { tx, rx }
    }

    pub fn executor(&self) -> MainQueueExecutor {
        MainQueueExecutor { tx: self.tx.clone() }
    }

    /// Run every task that is already queued. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            run_guarded(task, "main");
            ran += 1;
        }
        ran
    }

    /// Run tasks as they arrive until `duration` has elapsed. Returns how many ran.
    pub fn run_for(&self, duration: Duration) -> usize {
        let deadline = Instant::now() + duration;
        let mut ran = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.rx.recv_timeout(remaining) {
                Ok(task) => {
                    run_guarded(task, "main");
                    ran += 1;
                }
                Err(_) => break,
            }
        }
        ran
    }
}

impl Executor for MainQueueExecutor {
    fn execute(&self, task: Task) {
        // The receiving half lives in the MainQueue, which may be gone at shutdown
        let _ = self.tx.send(task);
    }
}

/// Runs tasks in posting order on a tokio runtime.
///
/// One consumer task drains an unbounded channel, so delivery order matches
/// the serial queue without a dedicated OS thread.
#[derive(Clone)]
pub struct TokioExecutor {
    tx: mpsc::UnboundedSender<Task>,
}

impl TokioExecutor {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        handle.spawn(async move {
            while let Some(task) = rx.recv().await {
                run_guarded(task, "tokio");
            }
            debug!("Tokio executor drained");
        });
        Self { tx }
    }

    /// Capture the runtime the caller is running in, if any
    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, task: Task) {
        if self.tx.send(task).is_err() {
            debug!("Tokio runtime gone, task dropped");
        }
    }
}
