//! Worker: pulls deliveries from the queue and runs them to completion.
//!
//! Each pool thread claims one delivery at a time, runs a fresh
//! [`TaskMachine`] for it and then acks or defers the delivery. A panicking
//! task is caught here only to record the generic failure text; its message
//! goes to the log, never to the task status.

mod disk;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub use disk::{DiskProbe, FixedDiskProbe, SysinfoDiskProbe};

use crate::models::{TaskPhase, TaskState, GENERIC_FAILURE};
use crate::registry::{Delivery, RegistryResult};
use crate::task::{Execution, TaskMachine, TaskServices};

/// Handle for stopping a worker between deliveries.
#[derive(Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Stop after the current delivery. Running tasks are not interrupted.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Runs deliveries from the configured queues.
pub struct Worker {
    services: TaskServices,
    queues: Vec<String>,
    poll_interval: Duration,
    stale_after: Duration,
    cancel: CancelHandle,
}

impl Worker {
    pub fn new(services: TaskServices) -> Self {
        let worker = &services.settings.worker;
        Self {
            queues: worker.queues.clone(),
            poll_interval: Duration::from_millis(worker.poll_interval_ms),
            stale_after: Duration::from_secs(worker.stale_claim_minutes * 60),
            services,
            cancel: CancelHandle::default(),
        }
    }

    /// Pull from these queues instead of the configured ones.
    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.queues = queues;
        self
    }

    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Claim and process one delivery; `None` if every queue is empty.
    pub fn run_once(&self) -> RegistryResult<Option<Execution>> {
        let Some(delivery) = self.services.registry.queue().pop(&self.queues)? else {
            return Ok(None);
        };
        self.process_delivery(delivery).map(Some)
    }

    /// Run a claimed delivery and settle it with the queue.
    pub fn process_delivery(&self, delivery: Delivery) -> RegistryResult<Execution> {
        let id = delivery.task_id.clone();
        tracing::info!(
            task = %id,
            queue = %delivery.queue,
            attempt = delivery.attempt,
            "Processing delivery"
        );

        let services = self.services.clone();
        let attempt = delivery.attempt;
        let task = id.clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
            TaskMachine::new(task, services).execute(attempt)
        }));

        let execution = match outcome {
            Ok(execution) => execution,
            Err(payload) => {
                tracing::error!(
                    task = %id,
                    panic = %panic_message(payload.as_ref()),
                    "Task panicked"
                );
                let failed = TaskState::Failed {
                    text: GENERIC_FAILURE.to_string(),
                };
                if let Err(e) = self.services.registry.record_outcome(&id, failed) {
                    tracing::error!(task = %id, error = %e, "Failed to record task outcome");
                }
                Execution::Finished(TaskPhase::Failed)
            }
        };

        let queue = self.services.registry.queue();
        match &execution {
            Execution::RetryLater { countdown } => {
                tracing::info!(task = %id, countdown_secs = countdown.as_secs(), "Deferred delivery");
                queue.retry_later(&delivery, *countdown)?;
            }
            Execution::AlreadyHandled => queue.ack(&delivery)?,
            Execution::Finished(phase) => {
                tracing::info!(task = %id, phase = phase.as_str(), "Delivery finished");
                queue.ack(&delivery)?;
            }
        }
        Ok(execution)
    }

    /// Put back claims abandoned by dead workers.
    pub fn requeue_stale(&self) -> RegistryResult<usize> {
        let count = self.services.registry.queue().requeue_stale(self.stale_after)?;
        if count > 0 {
            tracing::warn!(count, "Requeued stale deliveries");
        }
        Ok(count)
    }

    /// Process deliveries until cancelled, sleeping while the queues are empty.
    pub fn run(&self) {
        while !self.cancel.is_cancelled() {
            match self.run_once() {
                Ok(Some(_)) => {}
                Ok(None) => thread::sleep(self.poll_interval),
                Err(e) => {
                    tracing::error!(error = %e, "Queue error");
                    thread::sleep(self.poll_interval);
                }
            }
        }
        tracing::debug!("Worker loop stopped");
    }
}

/// Fixed set of threads sharing one [`Worker`].
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    cancel: CancelHandle,
}

impl WorkerPool {
    /// Requeue stale claims, then start `threads` worker threads.
    pub fn start(worker: Arc<Worker>, threads: usize) -> std::io::Result<Self> {
        if let Err(e) = worker.requeue_stale() {
            tracing::warn!(error = %e, "Failed to requeue stale deliveries");
        }

        let cancel = worker.cancel_handle();
        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads.max(1) {
            let worker = Arc::clone(&worker);
            let handle = thread::Builder::new()
                .name(format!("v2c-worker-{}", i))
                .spawn(move || worker.run())?;
            handles.push(handle);
        }

        tracing::info!(threads = handles.len(), queues = ?worker.queues(), "Worker pool started");
        Ok(Self { handles, cancel })
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Stop pulling new deliveries and wait for running tasks.
    pub fn shutdown(self) {
        self.cancel.cancel();
        self.join();
    }

    /// Wait for the threads to stop, which happens once the pool is
    /// cancelled through a [`CancelHandle`].
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                tracing::error!("Worker thread panicked");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use crate::config::{RegistrySettings, Settings};
    use crate::models::TaskStatusView;
    use crate::registry::{MemoryQueue, MemoryStore, TaskRegistry};
    use crate::stages::{LocalSite, StageSet, WikiSite};
    use crate::task::args::tests::sample_params;
    use crate::task::{
        AuthGate, DownloadArgs, DownloadOutput, EncodeArgs, EncodeOutput, StageContext,
        StageResult, SubtitleArgs, SubtitlesOutput, UploadArgs, UploadOutput,
    };

    fn download(ctx: &StageContext<'_>, _: &DownloadArgs) -> StageResult<DownloadOutput> {
        Ok(DownloadOutput {
            media_path: ctx.work_dir.join("dl.mp4"),
            subtitles: BTreeMap::new(),
            extractor: None,
        })
    }

    fn encode(_: &StageContext<'_>, _: &EncodeArgs, src: &DownloadOutput) -> StageResult<EncodeOutput> {
        Ok(EncodeOutput {
            encoded_path: src.media_path.with_extension("mp4.webm"),
        })
    }

    fn upload(
        _: &StageContext<'_>,
        site: &dyn WikiSite,
        args: &UploadArgs,
        _: &EncodeOutput,
    ) -> StageResult<UploadOutput> {
        let filename = format!("{}.webm", args.filename);
        Ok(UploadOutput::Uploaded {
            url: site.file_url(&filename),
            filename,
        })
    }

    fn upload_panics(
        _: &StageContext<'_>,
        _: &dyn WikiSite,
        _: &UploadArgs,
        _: &EncodeOutput,
    ) -> StageResult<UploadOutput> {
        panic!("secret internal detail")
    }

    fn subtitles(
        _: &StageContext<'_>,
        _: &dyn WikiSite,
        _: &SubtitleArgs,
        _: &BTreeMap<String, PathBuf>,
        _: &str,
    ) -> StageResult<SubtitlesOutput> {
        Ok(SubtitlesOutput::default())
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: Arc<TaskRegistry>,
        queue: Arc<MemoryQueue>,
        services: TaskServices,
    }

    fn fixture(stages: StageSet, free: u64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.paths.work_root = dir.path().join("work").display().to_string();
        settings.paths.logs_folder = dir.path().join("logs").display().to_string();
        settings.worker.poll_interval_ms = 5;

        let queue = Arc::new(MemoryQueue::new());
        let registry = Arc::new(TaskRegistry::new(
            Arc::new(MemoryStore::new()),
            queue.clone(),
            RegistrySettings::default(),
        ));
        let services = TaskServices {
            registry: registry.clone(),
            stages,
            site: Arc::new(LocalSite::new(dir.path().join("site"), "https://wiki.test/wiki", u64::MAX)),
            auth: Arc::new(AuthGate::new()),
            disk: Arc::new(FixedDiskProbe(free)),
            settings: Arc::new(settings),
        };
        Fixture {
            _dir: dir,
            registry,
            queue,
            services,
        }
    }

    #[test]
    fn run_once_processes_and_acks() {
        let fx = fixture(StageSet::new(download, encode, upload, subtitles), u64::MAX);
        let worker = Worker::new(fx.services.clone());
        let id = fx.registry.submit(sample_params()).unwrap();

        assert_eq!(
            worker.run_once().unwrap(),
            Some(Execution::Finished(TaskPhase::Succeeded))
        );
        assert!(matches!(
            fx.registry.status(&id).unwrap(),
            Some(TaskStatusView::Done { .. })
        ));
        assert_eq!(fx.queue.pending("celery"), 0);
        assert_eq!(fx.queue.claimed(), 0);
        assert_eq!(worker.run_once().unwrap(), None);
    }

    #[test]
    fn low_disk_defers_delivery() {
        let fx = fixture(StageSet::new(download, encode, upload, subtitles), 0);
        let worker = Worker::new(fx.services.clone());
        fx.registry.submit(sample_params()).unwrap();

        assert!(matches!(
            worker.run_once().unwrap(),
            Some(Execution::RetryLater { .. })
        ));
        assert_eq!(fx.queue.pending("celery"), 1);
        assert_eq!(fx.queue.claimed(), 0);
        // Not due for another five minutes.
        assert_eq!(worker.run_once().unwrap(), None);
    }

    #[test]
    fn panic_records_generic_failure() {
        let fx = fixture(StageSet::new(download, encode, upload_panics, subtitles), u64::MAX);
        let worker = Worker::new(fx.services.clone());
        let id = fx.registry.submit(sample_params()).unwrap();

        assert_eq!(
            worker.run_once().unwrap(),
            Some(Execution::Finished(TaskPhase::Failed))
        );
        match fx.registry.status(&id).unwrap() {
            Some(TaskStatusView::Fail { text, .. }) => {
                assert_eq!(text, GENERIC_FAILURE);
                assert!(!text.contains("secret"));
            }
            other => panic!("unexpected status: {:?}", other),
        }
        assert_eq!(fx.queue.claimed(), 0);
    }

    #[test]
    fn worker_ignores_other_queues() {
        let fx = fixture(StageSet::new(download, encode, upload, subtitles), u64::MAX);
        let worker = Worker::new(fx.services.clone()).with_queues(vec!["heavy".to_string()]);
        fx.registry.submit(sample_params()).unwrap();

        assert_eq!(worker.run_once().unwrap(), None);
        assert_eq!(fx.queue.pending("celery"), 1);
    }

    #[test]
    fn pool_drains_queue_and_shuts_down() {
        let fx = fixture(StageSet::new(download, encode, upload, subtitles), u64::MAX);
        let ids: Vec<_> = (0..3)
            .map(|_| fx.registry.submit(sample_params()).unwrap())
            .collect();

        let pool = WorkerPool::start(Arc::new(Worker::new(fx.services.clone())), 2).unwrap();
        assert_eq!(pool.size(), 2);

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while fx.queue.pending("celery") + fx.queue.claimed() > 0 {
            assert!(std::time::Instant::now() < deadline, "pool did not drain the queue");
            thread::sleep(Duration::from_millis(5));
        }
        pool.shutdown();

        for id in ids {
            assert!(matches!(
                fx.registry.status(&id).unwrap(),
                Some(TaskStatusView::Done { .. })
            ));
        }
    }

    #[test]
    fn cancel_handle_is_shared() {
        let handle = CancelHandle::default();
        let clone = handle.clone();
        assert!(!clone.is_cancelled());
        handle.cancel();
        assert!(clone.is_cancelled());
    }
}
