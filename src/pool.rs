use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
};

use crate::{error::TranscludeError, tasklist::TaskList};

/// Fixed set of named worker threads draining a [`TaskList`].
pub struct ThreadPool {
    scheduler: Arc<TaskList>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(size: usize, scheduler: Arc<TaskList>) -> Result<Self, TranscludeError> {
        Self::with_name(size, "transclude-worker", scheduler)
    }

    pub fn with_name(
        size: usize,
        name: &str,
        scheduler: Arc<TaskList>,
    ) -> Result<Self, TranscludeError> {
        if size == 0 {
            return Err(TranscludeError::Pool("pool size must be at least 1".to_string()));
        }
        let mut pool = ThreadPool {
            scheduler,
            workers: Vec::with_capacity(size),
        };
        for n in 0..size {
            let scheduler = pool.scheduler.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{n}"))
                .spawn(move || worker_loop(scheduler))
                .map_err(|e| TranscludeError::Pool(format!("failed to spawn worker {n}: {e}")))?;
            pool.workers.push(handle);
        }
        tracing::info!("[ThreadPool] started {size} workers");
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn scheduler(&self) -> &Arc<TaskList> {
        &self.scheduler
    }

    /// Stops the scheduler and waits for every worker to finish its current
    /// job.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.scheduler.kill();
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                tracing::error!("[ThreadPool] {name} exited abnormally");
            }
        }
        tracing::info!("[ThreadPool] stopped");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(scheduler: Arc<TaskList>) {
    while let Some(job) = scheduler.get() {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| job.run())) {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(
                "[ThreadPool] job panicked on {}: {reason}",
                thread::current().name().unwrap_or("worker")
            );
        }
    }
}
