use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use visitflow_core::error::{Result, VisitflowError};
use visitflow_core::traits::JobSink;
use visitflow_core::types::Job;

use crate::worker::ExecutionWorker;

/// Bounded in-process job queue. Enqueueing waits when the queue is full.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
}

impl JobQueue {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<Job>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl JobSink for JobQueue {
    fn enqueue(&self, job: Job) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            debug!(job_id = %job.id, workflow_id = %job.workflow_id, node_id = %job.node_id, "Job queued");
            self.tx
                .send(job)
                .await
                .map_err(|_| VisitflowError::Queue("job queue is closed".into()))
        })
    }
}

/// Drains the job queue with at most `concurrency` jobs in flight.
pub struct WorkerPool {
    worker: Arc<ExecutionWorker>,
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(worker: Arc<ExecutionWorker>, concurrency: usize) -> Self {
        Self {
            worker,
            concurrency: concurrency.max(1),
        }
    }

    /// Process jobs until cancelled or the queue closes.
    ///
    /// Jobs already queued at shutdown still run to completion.
    pub async fn run(self, mut jobs: mpsc::Receiver<Job>, cancel: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut active: JoinSet<()> = JoinSet::new();
        info!(concurrency = self.concurrency, "Worker pool started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(done) = active.join_next(), if !active.is_empty() => {
                    if let Err(e) = done {
                        error!(error = %e, "Worker task panicked");
                    }
                }
                job = jobs.recv() => match job {
                    Some(job) => self.spawn(&mut active, &permits, job).await,
                    None => break,
                },
            }
        }

        jobs.close();
        let mut drained = 0usize;
        while let Some(job) = jobs.recv().await {
            self.spawn(&mut active, &permits, job).await;
            drained += 1;
        }
        while active.join_next().await.is_some() {}
        info!(drained, "Worker pool stopped");
    }

    async fn spawn(&self, active: &mut JoinSet<()>, permits: &Arc<Semaphore>, job: Job) {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            return;
        };
        let worker = self.worker.clone();
        active.spawn(async move {
            let _permit = permit;
            worker.handle(job).await;
        });
    }
}
