use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use anyhow::{Context, Result};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Host-provided background primitive. A refused task is handed back to the caller.
pub trait DeferredExecutor: Send + Sync {
    fn defer(&self, task: Task) -> Result<(), Task>;
}

/// Runs tasks on the calling thread before `defer` returns.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl DeferredExecutor for InlineExecutor {
    fn defer(&self, task: Task) -> Result<(), Task> {
        task();
        Ok(())
    }
}

/// Fixed set of named threads pulling tasks from a shared channel.
pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize, name: &str) -> Result<Self> {
        let size = size.max(1);
        let (tx, rx) = mpsc::channel::<Task>();
        let rx = Arc::new(Mutex::new(rx));
        let mut handles = Vec::with_capacity(size);
        for idx in 0..size {
            let rx = Arc::clone(&rx);
            let handle = thread::Builder::new()
                .name(format!("{name}-{idx}"))
                .spawn(move || worker_loop(rx))
                .with_context(|| format!("failed to spawn worker thread {name}-{idx}"))?;
            handles.push(handle);
        }
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Stops accepting tasks and waits for queued ones to finish.
    pub fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let handles = self
            .handles
            .lock()
            .map(|mut handles| std::mem::take(&mut *handles))
            .unwrap_or_default();
        let current = thread::current().id();
        for handle in handles {
            // the last owner may be a task running on this very pool
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl DeferredExecutor for WorkerPool {
    fn defer(&self, task: Task) -> Result<(), Task> {
        let Ok(sender) = self.sender.lock() else {
            return Err(task);
        };
        match sender.as_ref() {
            Some(tx) => tx.send(task).map_err(|err| err.0),
            None => Err(task),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: Arc<Mutex<mpsc::Receiver<Task>>>) {
    loop {
        let next = match rx.lock() {
            Ok(receiver) => receiver.recv(),
            Err(_) => return,
        };
        let Ok(task) = next else {
            return;
        };
        // Tasks own their error handling; a panic must not take the worker down with it.
        let _ = panic::catch_unwind(AssertUnwindSafe(task));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::{DeferredExecutor, InlineExecutor, WorkerPool};

    #[test]
    fn pool_runs_every_submitted_task() -> anyhow::Result<()> {
        let pool = WorkerPool::new(3, "test-worker")?;
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            let accepted = pool.defer(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
            assert!(accepted.is_ok());
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 20);
        Ok(())
    }

    #[test]
    fn panicking_task_does_not_kill_workers() -> anyhow::Result<()> {
        let pool = WorkerPool::new(1, "test-worker")?;
        let counter = Arc::new(AtomicUsize::new(0));
        assert!(pool.defer(Box::new(|| panic!("boom"))).is_ok());
        let after = Arc::clone(&counter);
        assert!(pool
            .defer(Box::new(move || {
                after.fetch_add(1, Ordering::SeqCst);
            }))
            .is_ok());
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn stopped_pool_hands_task_back() -> anyhow::Result<()> {
        let pool = WorkerPool::new(1, "test-worker")?;
        pool.shutdown();
        let refused = pool.defer(Box::new(|| {}));
        assert!(refused.is_err());
        Ok(())
    }

    #[test]
    fn inline_executor_runs_immediately() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        let accepted = InlineExecutor.defer(Box::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(accepted.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
