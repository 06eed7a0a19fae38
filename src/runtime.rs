use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use visitflow_core::config::AppConfig;
use visitflow_core::error::Result;
use visitflow_core::event::{EventBus, EventJournal};
use visitflow_core::traits::{DeadLetterQueue, EventRecorder, KeyValueStore, TagStore};
use visitflow_core::types::Job;
use visitflow_engine::{
    ActionDispatcher, ConditionEvaluator, FrequencyGovernor, GraphExecutor, LoggingActionHandler,
    TriggerDetector,
};
use visitflow_gateway::AppState;
use visitflow_store::MemoryCatalog;
use visitflow_worker::{email_provider, ExecutionWorker, JobQueue, ReqwestTransport, WorkerPool};

/// Everything one process needs to detect triggers, traverse runs and
/// execute authoritative actions against a single store.
pub struct Runtime {
    pub config: AppConfig,
    pub catalog: Arc<MemoryCatalog>,
    pub bus: Arc<EventBus>,
    pub journal: Arc<EventJournal>,
    pub detector: Arc<TriggerDetector>,
    pub worker: Arc<ExecutionWorker>,
    tags: Arc<dyn TagStore>,
    dlq: Arc<dyn DeadLetterQueue>,
    jobs: Option<mpsc::Receiver<Job>>,
}

impl Runtime {
    pub fn build<S>(config: AppConfig, store: Arc<S>) -> Result<Self>
    where
        S: EventRecorder + TagStore + KeyValueStore + DeadLetterQueue,
    {
        let catalog = Arc::new(MemoryCatalog::new());
        let bus = Arc::new(EventBus::default());
        let journal = Arc::new(EventJournal::new(store.clone(), bus.clone()));

        let (queue, jobs) = JobQueue::bounded(config.worker.queue_capacity);
        let governor = Arc::new(FrequencyGovernor::new(
            store.clone(),
            config.engine.default_cooldown_secs,
        ));
        let conditions = Arc::new(ConditionEvaluator::new(
            store.clone(),
            store.clone(),
            config.engine.tag_cache_ttl_secs,
        ));
        let dispatcher = Arc::new(ActionDispatcher::new(
            Arc::new(LoggingActionHandler),
            Arc::new(queue),
        ));
        let executor = GraphExecutor::new(journal.clone(), conditions, governor.clone(), dispatcher);
        let detector = Arc::new(TriggerDetector::new(catalog.clone(), governor, executor));

        let transport = Arc::new(ReqwestTransport::new(config.webhook.timeout_secs)?);
        let email = email_provider(&config.email, transport.clone(), config.worker.classify_errors);
        info!(provider = email.name(), "Email provider selected");
        let worker = Arc::new(ExecutionWorker::new(
            catalog.clone(),
            journal.clone(),
            store.clone(),
            store.clone(),
            transport,
            email,
            &config,
        ));

        Ok(Self {
            config,
            catalog,
            bus,
            journal,
            detector,
            worker,
            tags: store.clone(),
            dlq: store,
            jobs: Some(jobs),
        })
    }

    /// Load workflow definitions from `dir`, or the configured directory.
    pub async fn load_workflows(&self, dir: Option<&Path>) -> Result<usize> {
        match dir {
            Some(dir) => self.catalog.load_dir(dir).await,
            None => self.catalog.load_dir(&self.config.workflows_dir()).await,
        }
    }

    /// Start the worker pool. Only the first call starts anything.
    pub fn spawn_workers(&mut self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let jobs = self.jobs.take()?;
        let pool = WorkerPool::new(self.worker.clone(), self.config.worker.concurrency);
        Some(tokio::spawn(pool.run(jobs, cancel)))
    }

    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            catalog: self.catalog.clone(),
            journal: self.journal.clone(),
            tags: self.tags.clone(),
            dlq: self.dlq.clone(),
            detector: self.detector.clone(),
            worker: self.worker.clone(),
            top_paths: self.config.engine.top_paths,
        })
    }

    /// Cancel outstanding join timers.
    pub fn shutdown(&self) {
        self.detector.executor().shutdown();
    }
}
