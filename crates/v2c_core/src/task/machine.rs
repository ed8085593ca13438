//! Task state machine.
//!
//! ```text
//! PreInit ──► Initializing ──► Running ──► Succeeded
//!                                     ├──► NeedsManualUpload
//!                                     ├──► Failed
//!                                     └──► Aborted
//! ```
//!
//! `preinit` decides whether this delivery may run at all (run lock, disk
//! headroom) and takes the run lock. `run` executes the four stages inside
//! the working directory scope, with the upload stages inside the
//! authentication scope. `execute` combines both and stores the terminal
//! state in the registry.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::args::{ArgGuard, DownloadArgs, EncodeArgs, StageArgs, SubtitleArgs, UploadArgs};
use super::cache::{DownloadOutput, EncodeOutput, StageCache, StageOutput, UploadOutput};
use super::context::StageContext;
use super::errors::{StageResult, TaskError, TaskResult};
use super::scope::{AuthGate, WorkDir};
use super::status::{StatusReporter, StatusSink};
use crate::config::Settings;
use crate::logging::{LogConfig, TaskLogger};
use crate::models::{TaskId, TaskPhase, TaskState};
use crate::registry::{RegistryError, TaskRegistry};
use crate::stages::{StageSet, WikiSite};
use crate::worker::DiskProbe;

/// Everything a task needs from the worker process.
#[derive(Clone)]
pub struct TaskServices {
    pub registry: Arc<TaskRegistry>,
    pub stages: StageSet,
    pub site: Arc<dyn WikiSite>,
    pub auth: Arc<AuthGate>,
    pub disk: Arc<dyn DiskProbe>,
    pub settings: Arc<Settings>,
}

/// Result of the pre-run checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreinitOutcome {
    /// The run lock is ours; go ahead.
    Ready,
    /// Another execution owns (or owned) this task.
    AlreadyHandled,
    /// Not enough disk space yet; redeliver after `countdown`.
    RetryLater { countdown: Duration },
}

/// Successful end of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Done { filename: String, url: String },
    NeedsManualUpload { url: String, hashsum: String },
}

/// What the worker should do with the delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    AlreadyHandled,
    RetryLater { countdown: Duration },
    Finished(TaskPhase),
}

/// Drives one delivery of one task.
pub struct TaskMachine {
    id: TaskId,
    services: TaskServices,
    phase: TaskPhase,
    status: StatusReporter,
    logger: Arc<TaskLogger>,
}

impl TaskMachine {
    pub fn new(id: TaskId, services: TaskServices) -> Self {
        let config = LogConfig::from(&services.settings.logging);
        let logger = match TaskLogger::new(
            id.as_str(),
            &services.settings.paths.logs_folder,
            config.clone(),
        ) {
            Ok(logger) => logger,
            Err(e) => {
                tracing::warn!(task = %id, error = %e, "Task log unavailable, logging to tail only");
                TaskLogger::detached(id.as_str(), config)
            }
        };
        let logger = Arc::new(logger);

        let sink: Arc<dyn StatusSink> = services.registry.clone();
        let status = StatusReporter::new(id.clone(), sink).with_logger(logger.clone());

        Self {
            id,
            services,
            phase: TaskPhase::PreInit,
            status,
            logger,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn phase(&self) -> TaskPhase {
        self.phase
    }

    pub fn status(&self) -> &StatusReporter {
        &self.status
    }

    /// Decide whether this delivery runs. `attempt` counts earlier
    /// deferrals of the same task.
    pub fn preinit(&mut self, attempt: u32) -> TaskResult<PreinitOutcome> {
        let registry = &self.services.registry;
        if registry.run_lock_held(&self.id)? {
            return Ok(PreinitOutcome::AlreadyHandled);
        }

        let worker = &self.services.settings.worker;
        let work_root = Path::new(&self.services.settings.paths.work_root);
        let required = worker.min_free_disk_bytes();
        match self.services.disk.available_bytes(work_root) {
            Some(available) if available < required => {
                if attempt >= worker.max_requirement_retries {
                    return Err(TaskError::ResourceExhausted { attempts: attempt });
                }
                tracing::info!(
                    task = %self.id,
                    available,
                    required,
                    attempt,
                    "Not enough free disk space, deferring"
                );
                return Ok(PreinitOutcome::RetryLater {
                    countdown: worker.retry_countdown(),
                });
            }
            Some(_) => {}
            None => tracing::warn!(
                task = %self.id,
                path = %work_root.display(),
                "Free disk space unknown, not deferring"
            ),
        }

        if !registry.acquire_run_lock(&self.id, worker.run_lock_ttl())? {
            return Ok(PreinitOutcome::AlreadyHandled);
        }

        self.phase = TaskPhase::Initializing;
        self.logger.phase("Initializing");
        self.status.update("Initializing...", None)?;
        Ok(PreinitOutcome::Ready)
    }

    /// Run all stages. Scopes are released on every exit path.
    pub fn run(&mut self) -> TaskResult<TaskOutcome> {
        self.phase = TaskPhase::Running;

        let record = self.services.registry.load_task(&self.id)?;
        let params = record.params.ok_or(RegistryError::ParamsUnavailable)?;
        let guard = ArgGuard::with_tainted(Arc::new(params), record.tainted);

        let mut results = record.results;
        let discarded = results.discard_missing_files();
        if !discarded.is_empty() {
            self.logger.warn(&format!(
                "Cached files from an earlier run are gone, repeating: {:?}",
                discarded
            ));
        }
        let mut cache = StageCache::new(results);

        let completed = cache.results().completed();
        if !completed.is_empty() {
            self.logger.info(&format!("Resuming with cached stages: {:?}", completed));
        }

        let work_dir = WorkDir::create(Path::new(&self.services.settings.paths.work_root))?;
        let result = self.run_stages(&guard, &mut cache, work_dir.path());

        if let Err(e) = self.status.set_text("Cleaning up...") {
            tracing::debug!(task = %self.id, error = %e, "Skipped cleanup status");
        }
        drop(work_dir);
        result
    }

    fn run_stages(
        &self,
        guard: &ArgGuard,
        cache: &mut StageCache,
        work_dir: &Path,
    ) -> TaskResult<TaskOutcome> {
        let stages = &self.services.stages;

        let downloaded: DownloadOutput =
            self.stage(guard, cache, work_dir, "Downloading...", |ctx, args: DownloadArgs| {
                stages.downloader.download(ctx, &args)
            })?;

        let encoded: EncodeOutput =
            self.stage(guard, cache, work_dir, "Converting...", |ctx, args: EncodeArgs| {
                stages.encoder.encode(ctx, &args, &downloaded)
            })?;

        let (username, oauth) = {
            let view = guard.view();
            (view.username().to_string(), view.oauth().clone())
        };
        let wants_subtitles = guard.view().subtitles().is_requested();

        let auth = self
            .services
            .auth
            .enter(self.services.site.as_ref(), &username, &oauth)
            .map_err(TaskError::Auth)?;
        let site = auth.site();

        let uploaded: UploadOutput =
            self.stage(guard, cache, work_dir, "Uploading...", |ctx, args: UploadArgs| {
                stages.uploader.upload(ctx, site, &args, &encoded)
            })?;

        let (filename, url) = match uploaded {
            UploadOutput::Uploaded { filename, url } => (filename, url),
            UploadOutput::ServerSide { url, hashsum } => {
                self.logger.warn("File too large for a direct upload; staged for server-side upload");
                return Ok(TaskOutcome::NeedsManualUpload { url, hashsum });
            }
        };

        if wants_subtitles && !downloaded.subtitles.is_empty() {
            let result = self.stage(
                guard,
                cache,
                work_dir,
                "Uploading subtitles...",
                |ctx, args: SubtitleArgs| {
                    stages
                        .subtitles
                        .upload_subtitles(ctx, site, &args, &downloaded.subtitles, &filename)
                },
            );
            match result {
                Ok(_) => {}
                Err(TaskError::Stage { source, .. }) if !source.is_cancelled() => {
                    tracing::warn!(task = %self.id, error = %source, "Subtitle upload failed");
                    self.logger.error(&format!("Subtitle upload failed: {}", source));
                    self.status.set_text(format!("Subtitle upload failed: {}", source))?;
                }
                Err(e) => return Err(e),
            }
        }

        drop(auth);

        self.status.update("Done!", Some(100))?;
        Ok(TaskOutcome::Done { filename, url })
    }

    /// Memoized stage execution; persists results after every executed stage.
    fn stage<A, T, F>(
        &self,
        guard: &ArgGuard,
        cache: &mut StageCache,
        work_dir: &Path,
        start_message: &str,
        f: F,
    ) -> TaskResult<T>
    where
        A: StageArgs,
        T: StageOutput,
        F: FnOnce(&StageContext<'_>, A) -> StageResult<T>,
    {
        let name = T::STAGE;
        let cached = cache.has_result(name);
        if cached {
            self.logger.info(&format!("{} skipping (cached)", name));
        } else {
            self.logger.phase(name.as_str());
        }

        let output = cache
            .execute_stage(guard, &self.status, start_message, |args: A, results| {
                let ctx = StageContext::new(
                    &self.id,
                    &self.status,
                    &self.logger,
                    work_dir,
                    results,
                    guard,
                );
                f(&ctx, args)
            })
            .map_err(|e| TaskError::stage(name, e))?;

        if !cached {
            self.services
                .registry
                .save_stage_results(&self.id, cache.results(), &guard.tainted())?;
            self.logger.success(&format!("{} completed", name));
        }
        Ok(output)
    }

    /// Pre-run checks, run, and the terminal state write.
    pub fn execute(&mut self, attempt: u32) -> Execution {
        let result = match self.preinit(attempt) {
            Ok(PreinitOutcome::Ready) => self.run(),
            Ok(PreinitOutcome::AlreadyHandled) => {
                tracing::info!(task = %self.id, "Task already handled by another execution");
                return Execution::AlreadyHandled;
            }
            Ok(PreinitOutcome::RetryLater { countdown }) => {
                return Execution::RetryLater { countdown };
            }
            Err(e) => Err(e),
        };
        self.finish(result)
    }

    fn finish(&mut self, result: TaskResult<TaskOutcome>) -> Execution {
        let (phase, state) = match result {
            Ok(TaskOutcome::Done { filename, url }) => {
                self.logger.success(&format!("Published {} at {}", filename, url));
                (TaskPhase::Succeeded, TaskState::Done { filename, url })
            }
            Ok(TaskOutcome::NeedsManualUpload { url, hashsum }) => (
                TaskPhase::NeedsManualUpload,
                TaskState::NeedsManualUpload { url, hashsum },
            ),
            Err(e) => {
                let failure = e.classify();
                if failure.phase == TaskPhase::Aborted {
                    tracing::info!(task = %self.id, "Task aborted");
                    self.logger.warn("Task aborted");
                    (TaskPhase::Aborted, TaskState::Aborted)
                } else {
                    tracing::error!(task = %self.id, error = %e, detail = ?e, "Task failed");
                    self.logger.error(&format!("Task failed: {}", e));
                    self.logger.show_tail("Last tool output");
                    (TaskPhase::Failed, TaskState::Failed { text: failure.text })
                }
            }
        };

        self.phase = phase;
        if let Err(e) = self.services.registry.record_outcome(&self.id, state) {
            tracing::error!(task = %self.id, error = %e, "Failed to record task outcome");
        }
        self.logger.close();
        Execution::Finished(phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;

    use crate::config::RegistrySettings;
    use crate::models::{SubtitleSelection, TaskStatusView, GENERIC_FAILURE};
    use crate::stages::LocalSite;
    use crate::task::args::tests::sample_params;
    use crate::task::errors::StageError;
    use crate::task::{SubtitlesOutput, StageResults};
    use crate::worker::FixedDiskProbe;

    const PLENTY: u64 = 1 << 40;

    struct Fixture {
        dir: TempDir,
        registry: Arc<TaskRegistry>,
        site: Arc<LocalSite>,
        auth: Arc<AuthGate>,
        settings: Arc<Settings>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_settings(|_| {})
        }

        fn with_settings(configure: impl FnOnce(&mut Settings)) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut settings = Settings::default();
            settings.paths.work_root = dir.path().join("work").display().to_string();
            settings.paths.logs_folder = dir.path().join("logs").display().to_string();
            settings.paths.ssu_root = dir.path().join("ssu").display().to_string();
            configure(&mut settings);
            Self {
                registry: Arc::new(TaskRegistry::in_memory(RegistrySettings::default())),
                site: Arc::new(LocalSite::new(
                    dir.path().join("site"),
                    "https://wiki.test/wiki",
                    u64::MAX,
                )),
                auth: Arc::new(AuthGate::new()),
                settings: Arc::new(settings),
                dir,
            }
        }

        fn services(&self, stages: StageSet, disk: u64) -> TaskServices {
            TaskServices {
                registry: self.registry.clone(),
                stages,
                site: self.site.clone(),
                auth: self.auth.clone(),
                disk: Arc::new(FixedDiskProbe(disk)),
                settings: self.settings.clone(),
            }
        }

        fn submit(&self) -> TaskId {
            self.registry.submit(sample_params()).unwrap()
        }

        fn machine(&self, id: &TaskId, stages: StageSet) -> TaskMachine {
            TaskMachine::new(id.clone(), self.services(stages, PLENTY))
        }

        fn work_root(&self) -> PathBuf {
            self.dir.path().join("work")
        }

        fn work_dirs_left(&self) -> usize {
            match fs::read_dir(self.work_root()) {
                Ok(entries) => entries.count(),
                Err(_) => 0,
            }
        }

        fn history(&self, id: &TaskId) -> Vec<String> {
            self.registry
                .load_task(id)
                .unwrap()
                .history
                .into_iter()
                .map(|e| e.text)
                .collect()
        }
    }

    fn media(ctx: &StageContext<'_>) -> DownloadOutput {
        let path = ctx.work_dir.join("dl.mp4");
        fs::write(&path, b"media").unwrap();
        DownloadOutput {
            media_path: path,
            subtitles: BTreeMap::new(),
            extractor: None,
        }
    }

    fn download_ok(ctx: &StageContext<'_>, _: &DownloadArgs) -> StageResult<DownloadOutput> {
        Ok(media(ctx))
    }

    fn encode_ok(
        _: &StageContext<'_>,
        args: &EncodeArgs,
        source: &DownloadOutput,
    ) -> StageResult<EncodeOutput> {
        Ok(EncodeOutput {
            encoded_path: PathBuf::from(format!(
                "{}.{}",
                source.media_path.display(),
                args.encode_key
            )),
        })
    }

    fn upload_ok(
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

    fn subtitles_unused(
        _: &StageContext<'_>,
        _: &dyn WikiSite,
        _: &SubtitleArgs,
        _: &BTreeMap<String, PathBuf>,
        _: &str,
    ) -> StageResult<SubtitlesOutput> {
        panic!("subtitle stage must not run")
    }

    fn happy_stages() -> StageSet {
        StageSet::new(
            download_ok,
            encode_ok,
            upload_ok,
            subtitles_unused,
        )
    }

    #[test]
    fn end_to_end_webm_without_subtitles() {
        let fx = Fixture::new();
        let id = fx.submit();
        let mut machine = fx.machine(&id, happy_stages());

        assert_eq!(machine.execute(0), Execution::Finished(TaskPhase::Succeeded));
        assert_eq!(machine.phase(), TaskPhase::Succeeded);

        assert_eq!(
            fx.registry.status(&id).unwrap(),
            Some(TaskStatusView::Done {
                filename: "Example.webm".into(),
                url: "https://wiki.test/wiki/File:Example.webm".into(),
            })
        );
        assert_eq!(fx.work_dirs_left(), 0);
        assert!(fx.registry.run_lock_held(&id).unwrap());
        assert!(fx.site.configured_user().is_none());

        let history = fx.history(&id);
        assert_eq!(history.first().map(String::as_str), Some("Initializing..."));
        assert!(history.contains(&"Done!".to_string()));
        assert_eq!(history.last().map(String::as_str), Some("Cleaning up..."));

        let results = fx.registry.load_task(&id).unwrap().results;
        assert_eq!(
            results.completed(),
            vec![
                crate::models::StageName::Download,
                crate::models::StageName::Encode,
                crate::models::StageName::Upload
            ]
        );
    }

    #[test]
    fn held_lock_means_no_stage_runs() {
        let fx = Fixture::new();
        let id = fx.submit();
        fx.registry
            .acquire_run_lock(&id, chrono::Duration::days(7))
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let stages = StageSet::new(
            move |ctx: &StageContext<'_>, _: &DownloadArgs| -> StageResult<DownloadOutput> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(media(ctx))
            },
            encode_ok,
            upload_ok,
            subtitles_unused,
        );

        let mut machine = fx.machine(&id, stages);
        assert_eq!(machine.execute(0), Execution::AlreadyHandled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(machine.phase(), TaskPhase::PreInit);
        assert_eq!(fx.registry.status(&id).unwrap(), Some(TaskStatusView::Pending));
    }

    #[test]
    fn second_delivery_is_quietly_dropped() {
        let fx = Fixture::new();
        let id = fx.submit();
        assert_eq!(
            fx.machine(&id, happy_stages()).execute(0),
            Execution::Finished(TaskPhase::Succeeded)
        );
        assert_eq!(fx.machine(&id, happy_stages()).execute(0), Execution::AlreadyHandled);
    }

    #[test]
    fn cached_download_is_not_repeated() {
        let fx = Fixture::new();
        let id = fx.submit();
        let previous = fx.dir.path().join("previous-dl.mp4");
        fs::write(&previous, b"media").unwrap();
        let cached = DownloadOutput {
            media_path: previous,
            subtitles: BTreeMap::new(),
            extractor: None,
        };
        fx.registry
            .save_stage_results(
                &id,
                &StageResults {
                    download: Some(cached.clone()),
                    ..StageResults::default()
                },
                &Default::default(),
            )
            .unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(None));
        let sink = seen.clone();
        let stages = StageSet::new(
            |_: &StageContext<'_>, _: &DownloadArgs| -> StageResult<DownloadOutput> {
                panic!("download must come from the cache")
            },
            move |ctx: &StageContext<'_>,
                  args: &EncodeArgs,
                  source: &DownloadOutput|
                  -> StageResult<EncodeOutput> {
                *sink.lock() = Some(source.clone());
                encode_ok(ctx, args, source)
            },
            upload_ok,
            subtitles_unused,
        );

        let mut machine = fx.machine(&id, stages);
        assert_eq!(machine.execute(0), Execution::Finished(TaskPhase::Succeeded));
        assert_eq!(seen.lock().clone(), Some(cached));
        assert!(!fx.history(&id).contains(&"Downloading...".to_string()));
    }

    #[test]
    fn redelivery_after_encode_failure_repeats_download_for_missing_media() {
        let fx = Fixture::with_settings(|s| s.worker.run_lock_ttl_hours = 0);
        let id = fx.submit();

        let failing = StageSet::new(
            download_ok,
            |_: &StageContext<'_>, _: &EncodeArgs, _: &DownloadOutput| -> StageResult<EncodeOutput> {
                Err(StageError::command_failed("ffmpeg", 1, "Killed"))
            },
            upload_ok,
            subtitles_unused,
        );
        assert_eq!(
            fx.machine(&id, failing).execute(0),
            Execution::Finished(TaskPhase::Failed)
        );
        let stale = fx.registry.load_task(&id).unwrap().results.download.unwrap();
        assert!(!stale.media_path.exists());

        let downloads = Arc::new(AtomicUsize::new(0));
        let counter = downloads.clone();
        let media_seen = Arc::new(parking_lot::Mutex::new(None));
        let sink = media_seen.clone();
        let stages = StageSet::new(
            move |ctx: &StageContext<'_>, _: &DownloadArgs| -> StageResult<DownloadOutput> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(media(ctx))
            },
            move |ctx: &StageContext<'_>,
                  args: &EncodeArgs,
                  source: &DownloadOutput|
                  -> StageResult<EncodeOutput> {
                *sink.lock() = Some(source.media_path.exists());
                encode_ok(ctx, args, source)
            },
            upload_ok,
            subtitles_unused,
        );

        assert_eq!(
            fx.machine(&id, stages).execute(0),
            Execution::Finished(TaskPhase::Succeeded)
        );
        assert_eq!(downloads.load(Ordering::SeqCst), 1);
        assert_eq!(*media_seen.lock(), Some(true));
        assert_eq!(
            fx.registry.status(&id).unwrap(),
            Some(TaskStatusView::Done {
                filename: "Example.webm".into(),
                url: "https://wiki.test/wiki/File:Example.webm".into(),
            })
        );
        assert_eq!(fx.work_dirs_left(), 0);
    }

    #[test]
    fn user_error_fails_with_verbatim_text_and_cleans_up() {
        let fx = Fixture::new();
        let id = fx.submit();
        let stages = StageSet::new(
            |_: &StageContext<'_>, _: &DownloadArgs| -> StageResult<DownloadOutput> {
                Err(StageError::user("Your downloading URL has been blacklisted."))
            },
            encode_ok,
            upload_ok,
            subtitles_unused,
        );

        let mut machine = fx.machine(&id, stages);
        assert_eq!(machine.execute(0), Execution::Finished(TaskPhase::Failed));
        assert_eq!(
            fx.registry.status(&id).unwrap(),
            Some(TaskStatusView::Fail {
                text: "Your downloading URL has been blacklisted.".into(),
                restartable: true,
            })
        );
        assert_eq!(fx.work_dirs_left(), 0);
        assert!(fx.registry.load_task(&id).unwrap().results.completed().is_empty());
    }

    #[test]
    fn unexpected_error_gets_generic_text() {
        let fx = Fixture::new();
        let id = fx.submit();
        let stages = StageSet::new(
            download_ok,
            |_: &StageContext<'_>, _: &EncodeArgs, _: &DownloadOutput| -> StageResult<EncodeOutput> {
                Err(StageError::command_failed("ffmpeg", 1, "Invalid data found"))
            },
            upload_ok,
            subtitles_unused,
        );

        fx.machine(&id, stages).execute(0);
        assert_eq!(
            fx.registry.status(&id).unwrap(),
            Some(TaskStatusView::Fail {
                text: GENERIC_FAILURE.into(),
                restartable: true,
            })
        );
        // A redelivery of this record finds the download result.
        assert!(fx.registry.load_task(&id).unwrap().results.download.is_some());
    }

    #[test]
    fn panic_in_upload_releases_all_scopes() {
        let fx = Fixture::new();
        let id = fx.submit();
        let stages = StageSet::new(
            download_ok,
            encode_ok,
            |_: &StageContext<'_>, _: &dyn WikiSite, _: &UploadArgs, _: &EncodeOutput| -> StageResult<UploadOutput> {
                panic!("uploader bug")
            },
            subtitles_unused,
        );

        let mut machine = fx.machine(&id, stages);
        let result = catch_unwind(AssertUnwindSafe(|| machine.execute(0)));
        assert!(result.is_err());
        assert_eq!(fx.work_dirs_left(), 0);
        assert!(fx.site.configured_user().is_none());
        assert!(!fx.auth.is_held());
    }

    #[test]
    fn abort_during_download_is_aborted() {
        let fx = Fixture::new();
        let id = fx.submit();
        let registry = fx.registry.clone();
        let task = id.clone();
        let stages = StageSet::new(
            move |ctx: &StageContext<'_>, _: &DownloadArgs| -> StageResult<DownloadOutput> {
                ctx.status.set_percent(Some(10))?;
                registry.abort(&task, "Alice").unwrap();
                ctx.status.set_percent(Some(20))?;
                Ok(media(ctx))
            },
            encode_ok,
            upload_ok,
            subtitles_unused,
        );

        let mut machine = fx.machine(&id, stages);
        assert_eq!(machine.execute(0), Execution::Finished(TaskPhase::Aborted));
        assert_eq!(fx.registry.status(&id).unwrap(), Some(TaskStatusView::Aborted));
        assert_eq!(fx.work_dirs_left(), 0);
        assert!(fx.registry.load_task(&id).unwrap().results.download.is_none());
    }

    #[test]
    fn abort_during_upload_releases_auth_and_work_dir() {
        let fx = Fixture::new();
        let id = fx.submit();
        let registry = fx.registry.clone();
        let task = id.clone();
        let auth = fx.auth.clone();
        let stages = StageSet::new(
            download_ok,
            encode_ok,
            move |ctx: &StageContext<'_>,
                  site: &dyn WikiSite,
                  _: &UploadArgs,
                  _: &EncodeOutput|
                  -> StageResult<UploadOutput> {
                assert_eq!(site.configured_user().as_deref(), Some("Alice"));
                assert!(auth.is_held());
                registry.abort(&task, "Alice").unwrap();
                ctx.status.set_percent(Some(50))?;
                panic!("upload continued past an abort")
            },
            subtitles_unused,
        );

        let mut machine = fx.machine(&id, stages);
        assert_eq!(machine.execute(0), Execution::Finished(TaskPhase::Aborted));
        assert_eq!(fx.registry.status(&id).unwrap(), Some(TaskStatusView::Aborted));
        assert!(fx.site.configured_user().is_none());
        assert!(!fx.auth.is_held());
        assert_eq!(fx.work_dirs_left(), 0);
    }

    #[test]
    fn server_side_upload_skips_subtitles_and_releases_auth() {
        let fx = Fixture::new();
        let mut params = sample_params();
        params.subtitles = SubtitleSelection::All;
        let id = fx.registry.submit(params).unwrap();

        let stages = StageSet::new(
            |ctx: &StageContext<'_>, _: &DownloadArgs| -> StageResult<DownloadOutput> {
                let mut out = media(ctx);
                out.subtitles.insert("en".into(), ctx.work_dir.join("dl.en.srt"));
                Ok(out)
            },
            encode_ok,
            |_: &StageContext<'_>,
             _: &dyn WikiSite,
             _: &UploadArgs,
             _: &EncodeOutput|
             -> StageResult<UploadOutput> {
                Ok(UploadOutput::ServerSide {
                    url: "https://ssu.test/Example.webm".into(),
                    hashsum: "0123456789abcdef0123456789abcdef".into(),
                })
            },
            subtitles_unused,
        );

        let mut machine = fx.machine(&id, stages);
        assert_eq!(
            machine.execute(0),
            Execution::Finished(TaskPhase::NeedsManualUpload)
        );
        assert_eq!(
            fx.registry.status(&id).unwrap(),
            Some(TaskStatusView::NeedsManualUpload {
                url: "https://ssu.test/Example.webm".into(),
                hashsum: "0123456789abcdef0123456789abcdef".into(),
            })
        );
        assert!(fx.site.configured_user().is_none());
        assert!(!fx.auth.is_held());
    }

    #[test]
    fn subtitle_failure_does_not_fail_the_task() {
        let fx = Fixture::new();
        let mut params = sample_params();
        params.subtitles = SubtitleSelection::All;
        let id = fx.registry.submit(params).unwrap();

        let stages = StageSet::new(
            |ctx: &StageContext<'_>, _: &DownloadArgs| -> StageResult<DownloadOutput> {
                let mut out = media(ctx);
                out.subtitles.insert("en".into(), ctx.work_dir.join("dl.en.srt"));
                Ok(out)
            },
            encode_ok,
            upload_ok,
            |_: &StageContext<'_>,
             _: &dyn WikiSite,
             args: &SubtitleArgs,
             _: &BTreeMap<String, PathBuf>,
             _: &str|
             -> StageResult<SubtitlesOutput> {
                assert_eq!(args.username, "Alice");
                Err(StageError::infrastructure("Saving TimedText page", "HTTP 500"))
            },
        );

        let mut machine = fx.machine(&id, stages);
        assert_eq!(machine.execute(0), Execution::Finished(TaskPhase::Succeeded));
        assert!(matches!(
            fx.registry.status(&id).unwrap(),
            Some(TaskStatusView::Done { .. })
        ));
        assert!(fx
            .history(&id)
            .contains(&"Subtitle upload failed: Saving TimedText page: HTTP 500".to_string()));
    }

    #[test]
    fn low_disk_defers_then_gives_up() {
        let fx = Fixture::new();
        let id = fx.submit();

        let mut machine = TaskMachine::new(id.clone(), fx.services(happy_stages(), 0));
        assert_eq!(
            machine.execute(0),
            Execution::RetryLater {
                countdown: Duration::from_secs(300)
            }
        );
        assert!(!fx.registry.run_lock_held(&id).unwrap());
        assert_eq!(fx.registry.status(&id).unwrap(), Some(TaskStatusView::Pending));

        let mut machine = TaskMachine::new(id.clone(), fx.services(happy_stages(), 0));
        assert_eq!(machine.execute(20), Execution::Finished(TaskPhase::Failed));
        assert_eq!(
            fx.registry.status(&id).unwrap(),
            Some(TaskStatusView::Fail {
                text: "The worker is out of disk space. Please try again later.".into(),
                restartable: true,
            })
        );
    }

    #[test]
    fn login_failure_is_reported_with_context() {
        let fx = Fixture::new();
        let id = fx.submit();
        fx.site.fail_next_login("invalid OAuth token");

        fx.machine(&id, happy_stages()).execute(0);
        match fx.registry.status(&id).unwrap() {
            Some(TaskStatusView::Fail { text, .. }) => {
                assert!(text.starts_with("Login failed: "), "{}", text);
                assert!(text.contains("invalid OAuth token"));
            }
            other => panic!("unexpected status: {:?}", other),
        }
        assert!(!fx.auth.is_held());
        assert!(fx.registry.load_task(&id).unwrap().results.encode.is_some());
    }

    #[test]
    fn task_log_is_written() {
        let fx = Fixture::new();
        let id = fx.submit();
        fx.machine(&id, happy_stages()).execute(0);

        let log = fs::read_to_string(fx.dir.path().join("logs").join(format!("{}.log", id))).unwrap();
        assert!(log.contains("Initializing"));
        assert!(log.contains("Done!"));
    }
}
