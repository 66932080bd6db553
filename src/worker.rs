//! The shard-affine worker pool.
//!
//! A fixed set of workers, each draining its own queue sequentially. Work
//! for a given shard always lands on the same worker (`shard mod workers`),
//! which gives per-shard sequential consistency without locks: two
//! operations on one shard can never run concurrently.

use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Result, StrandError};
use crate::types::ShardIndex;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct Worker {
    tx: mpsc::UnboundedSender<Job>,
    handle: JoinHandle<()>,
}

/// A pool of shard-affine workers.
pub struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let workers = (0..size)
            .map(|index| {
                let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
                let handle = tokio::spawn(async move {
                    while let Some(job) = rx.recv().await {
                        job.await;
                    }
                    debug!(worker = index, "worker drained");
                });
                Worker { tx, handle }
            })
            .collect();
        Self { workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// The worker a shard's operations are routed to.
    pub fn worker_for(&self, shard: ShardIndex) -> usize {
        shard as usize % self.workers.len()
    }

    /// Queue work on the shard's worker.
    pub fn post<F>(&self, shard: ShardIndex, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let worker = &self.workers[self.worker_for(shard)];
        worker
            .tx
            .send(Box::pin(job))
            .map_err(|_| StrandError::ShuttingDown)
    }

    /// Stop accepting work and wait for queued jobs to finish.
    pub async fn shutdown(self) {
        let mut handles = Vec::with_capacity(self.workers.len());
        for worker in self.workers {
            drop(worker.tx);
            handles.push(worker.handle);
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}
