//! Stack Worker
//!
//! The single task that owns stack application on this node. Batches are
//! applied one after another in submission order; callers wait on a oneshot
//! reply.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::devmgr::handler::{DeviceHandler, DispatchOutcome};
use crate::error::{Error, Result};
use crate::tree::layer_tree::LayerTree;

/// Default queue depth, in batches
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

type Reply = oneshot::Sender<Result<DispatchOutcome>>;

struct Job {
    batch: Vec<LayerTree>,
    reply: Reply,
}

/// Handle to the running worker
pub struct StackWorker {
    tx: mpsc::Sender<Job>,
    cancel: CancellationToken,
    batches: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl StackWorker {
    /// Spawn the worker task
    pub fn spawn(handler: Arc<DeviceHandler>, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let cancel = CancellationToken::new();
        let batches = Arc::new(AtomicU64::new(0));
        let handle = tokio::spawn(run(handler, rx, cancel.clone(), batches.clone()));
        info!(queue_depth, "Stack worker started");
        Self {
            tx,
            cancel,
            batches,
            handle: Some(handle),
        }
    }

    /// Queue a batch and wait for its outcome
    pub async fn submit(&self, batch: Vec<LayerTree>) -> Result<DispatchOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Job { batch, reply })
            .await
            .map_err(|_| Error::WorkerStopped)?;
        rx.await.map_err(|_| Error::WorkerStopped)?
    }

    /// Batches applied so far, failed ones included
    pub fn batches_processed(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Stop accepting work and wait for the current batch to finish
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Stack worker task failed");
            }
        }
        info!("Stack worker stopped");
    }
}

impl Drop for StackWorker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    handler: Arc<DeviceHandler>,
    mut rx: mpsc::Receiver<Job>,
    cancel: CancellationToken,
    batches: Arc<AtomicU64>,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let trees = job.batch.len();
        debug!(trees, "Applying batch");
        let outcome = handler.dispatch(job.batch).await;
        if let Err(e) = &outcome {
            error!(error = %e, trees, "Batch failed");
        }
        handler.clear_caches();
        batches.fetch_add(1, Ordering::Relaxed);

        // the caller may have given up waiting
        let _ = job.reply.send(outcome);
    }
    rx.close();
    debug!("Stack worker loop exited");
}
