//! Execution contexts for completion delivery and background work.
//!
//! Three contexts exist in this subsystem:
//!
//! - a **main** executor: a single serial worker where all user-visible
//!   completions are delivered;
//! - a **disk IO** executor: a single serial FIFO worker that owns the
//!   disk tier's filesystem access, giving deterministic ordering between
//!   a store and a subsequent read of the same key without per-path locks;
//! - a **transform** executor: a small concurrent pool for decoder and
//!   transform-delegate work.
//!
//! Each serial executor is one named OS thread fed by an unbounded mpsc
//! channel. Tests inject [`InlineExecutor`] to make delivery synchronous
//! and deterministic.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use tracing::debug;

/// A unit of work submitted to an executor.
pub type Job = Box<dyn FnOnce() + Send>;

/// An execution context that runs submitted jobs.
pub trait Executor: Send + Sync {
    /// Submit a job for execution.
    ///
    /// Serial executors guarantee FIFO ordering between submissions;
    /// pool executors make no ordering guarantee.
    fn execute(&self, job: Job);
}

enum Message {
    Run(Job),
    Shutdown,
}

/// A single named worker thread draining an unbounded FIFO queue.
pub struct SerialExecutor {
    tx: Sender<Message>,
    handle: Mutex<Option<JoinHandle<()>>>,
    name: String,
}

impl SerialExecutor {
    /// Spawn the worker thread.
    pub fn new(name: &str) -> Self {
        let (tx, rx) = mpsc::channel::<Message>();
        let thread_name = name.to_string();

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || Self::run_loop(rx))
            .expect("failed to spawn executor thread");

        Self {
            tx,
            handle: Mutex::new(Some(handle)),
            name: name.to_string(),
        }
    }

    fn run_loop(rx: Receiver<Message>) {
        while let Ok(message) = rx.recv() {
            match message {
                Message::Run(job) => job(),
                Message::Shutdown => break,
            }
        }
    }

    /// Executor name, used as the worker thread name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Executor for SerialExecutor {
    fn execute(&self, job: Job) {
        // Send fails only after shutdown; the job is dropped.
        let _ = self.tx.send(Message::Run(job));
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        let _ = self.tx.send(Message::Shutdown);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        debug!(executor = %self.name, "serial executor shut down");
    }
}

/// A fixed pool of named worker threads sharing one queue.
pub struct PoolExecutor {
    tx: Sender<Message>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    workers: usize,
}

impl PoolExecutor {
    /// Spawn `workers` threads named `<name>-<index>`.
    pub fn new(name: &str, workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<Message>();
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let rx = Arc::clone(&rx);
            let handle = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || loop {
                    let message = {
                        let rx = rx.lock().unwrap();
                        rx.recv()
                    };
                    match message {
                        Ok(Message::Run(job)) => job(),
                        Ok(Message::Shutdown) | Err(_) => break,
                    }
                })
                .expect("failed to spawn executor thread");
            handles.push(handle);
        }

        Self {
            tx,
            handles: Mutex::new(handles),
            workers,
        }
    }

    /// Number of worker threads in the pool.
    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl Executor for PoolExecutor {
    fn execute(&self, job: Job) {
        let _ = self.tx.send(Message::Run(job));
    }
}

impl Drop for PoolExecutor {
    fn drop(&mut self) {
        for _ in 0..self.workers {
            let _ = self.tx.send(Message::Shutdown);
        }
        for handle in self.handles.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

/// Runs every job synchronously on the submitting thread.
///
/// Used by tests to make completion delivery deterministic.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, job: Job) {
        job();
    }
}

/// Process-wide main executor for user-visible completion delivery.
///
/// Lazily initialised on first access; never torn down.
pub fn main_executor() -> Arc<dyn Executor> {
    static MAIN: OnceLock<Arc<dyn Executor>> = OnceLock::new();
    Arc::clone(MAIN.get_or_init(|| Arc::new(SerialExecutor::new("webimage-main")) as Arc<dyn Executor>))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn test_serial_executor_runs_jobs() {
        let executor = SerialExecutor::new("test-serial");
        let (tx, rx) = channel();

        executor.execute(Box::new(move || {
            tx.send(42).unwrap();
        }));

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 42);
    }

    #[test]
    fn test_serial_executor_is_fifo() {
        let executor = SerialExecutor::new("test-fifo");
        let (tx, rx) = channel();

        for i in 0..10 {
            let tx = tx.clone();
            executor.execute(Box::new(move || {
                tx.send(i).unwrap();
            }));
        }

        let received: Vec<i32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap())
            .collect();
        assert_eq!(received, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_serial_executor_drop_joins_worker() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let executor = SerialExecutor::new("test-drop");
            for _ in 0..5 {
                let counter = Arc::clone(&counter);
                executor.execute(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }));
            }
            // Drop waits for the queue to drain up to the shutdown marker.
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_pool_executor_runs_all_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = PoolExecutor::new("test-pool", 4);
            assert_eq!(pool.workers(), 4);
            for _ in 0..20 {
                let counter = Arc::clone(&counter);
                pool.execute(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }));
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_pool_executor_minimum_one_worker() {
        let pool = PoolExecutor::new("test-min", 0);
        assert_eq!(pool.workers(), 1);
    }

    #[test]
    fn test_inline_executor_is_synchronous() {
        let ran = Arc::new(AtomicUsize::new(0));
        let executor = InlineExecutor;

        let ran_clone = Arc::clone(&ran);
        executor.execute(Box::new(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        }));

        // Delivery happened on this thread before execute returned.
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_main_executor_is_shared() {
        let a = main_executor();
        let b = main_executor();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
