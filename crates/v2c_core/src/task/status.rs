//! Status reporter: coalesced progress writes and the abort checkpoint.
//!
//! Every write attempt first asks the sink whether the task was aborted and
//! returns [`Cancelled`] instead of writing. This is the only place the abort
//! signal enters a running task, so long-running stages must report progress
//! to stay cancellable.

use std::sync::Arc;

use parking_lot::Mutex;

use super::errors::Cancelled;
use crate::logging::TaskLogger;
use crate::models::TaskId;

/// Durable side of the status reporter.
pub trait StatusSink: Send + Sync {
    /// Whether an abort has been requested for the task.
    fn abort_requested(&self, id: &TaskId) -> bool;

    /// Persist the current status. Failures are logged by the reporter.
    fn write_status(
        &self,
        id: &TaskId,
        text: &str,
        percent: Option<u32>,
    ) -> Result<(), crate::registry::RegistryError>;
}

#[derive(Debug)]
struct ReporterState {
    text: String,
    percent: Option<u32>,
    /// Last value handed to the sink.
    written: Option<(String, Option<u32>)>,
    pause_depth: u32,
    dirty: bool,
}

/// Buffers and flushes human-readable progress for one task.
pub struct StatusReporter {
    task_id: TaskId,
    sink: Arc<dyn StatusSink>,
    logger: Option<Arc<TaskLogger>>,
    state: Mutex<ReporterState>,
}

impl StatusReporter {
    pub fn new(task_id: TaskId, sink: Arc<dyn StatusSink>) -> Self {
        Self {
            task_id,
            sink,
            logger: None,
            state: Mutex::new(ReporterState {
                text: "PREINIT".to_string(),
                percent: None,
                written: None,
                pause_depth: 0,
                dirty: false,
            }),
        }
    }

    /// Mirror every flush into the task log.
    pub fn with_logger(mut self, logger: Arc<TaskLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn text(&self) -> String {
        self.state.lock().text.clone()
    }

    /// `None` is indeterminate.
    pub fn percent(&self) -> Option<u32> {
        self.state.lock().percent
    }

    pub fn set_text(&self, text: impl Into<String>) -> Result<(), Cancelled> {
        let text = text.into();
        let changed = {
            let mut state = self.state.lock();
            if state.text == text {
                false
            } else {
                state.text = text;
                true
            }
        };
        if changed {
            self.write()
        } else {
            Ok(())
        }
    }

    pub fn set_percent(&self, percent: Option<u32>) -> Result<(), Cancelled> {
        let percent = percent.map(|p| p.min(100));
        let changed = {
            let mut state = self.state.lock();
            if state.percent == percent {
                false
            } else {
                state.percent = percent;
                true
            }
        };
        if changed {
            self.write()
        } else {
            Ok(())
        }
    }

    /// Set text and percent with at most one flush.
    pub fn update(&self, text: impl Into<String>, percent: Option<u32>) -> Result<(), Cancelled> {
        self.paused(|s| {
            s.set_text(text)?;
            s.set_percent(percent)
        })
    }

    /// Defer writes until the outermost paused scope exits.
    ///
    /// Reentrant. On exit a single flush happens if anything changed. The
    /// deferred flush is skipped when `f` fails, since the failure already
    /// decides the task's next status.
    pub fn paused<T, E>(&self, f: impl FnOnce(&Self) -> Result<T, E>) -> Result<T, E>
    where
        E: From<Cancelled>,
    {
        self.state.lock().pause_depth += 1;
        let _resume = PauseGuard(self);
        let value = f(self)?;
        drop(_resume);

        let needs_flush = {
            let state = self.state.lock();
            state.pause_depth == 0 && state.dirty
        };
        if needs_flush {
            self.write()?;
        }
        Ok(value)
    }

    fn write(&self) -> Result<(), Cancelled> {
        if self.sink.abort_requested(&self.task_id) {
            return Err(Cancelled);
        }

        let (text, percent) = {
            let mut state = self.state.lock();
            if state.pause_depth > 0 {
                state.dirty = true;
                return Ok(());
            }
            state.dirty = false;
            let current = (state.text.clone(), state.percent);
            if state.written.as_ref() == Some(&current) {
                return Ok(());
            }
            state.written = Some(current.clone());
            current
        };

        if let Err(e) = self.sink.write_status(&self.task_id, &text, percent) {
            tracing::warn!(task = %self.task_id, error = %e, "Failed to persist status");
        }
        if let Some(logger) = &self.logger {
            logger.status(&text, percent);
        }
        Ok(())
    }
}

/// Leaves one pause level, also when the scope unwinds.
struct PauseGuard<'a>(&'a StatusReporter);

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        assert!(state.pause_depth > 0, "unbalanced status pause scope");
        state.pause_depth -= 1;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::registry::RegistryError;

    /// Records every write; abort can be flipped at any time.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub writes: Mutex<Vec<(String, Option<u32>)>>,
        pub aborted: AtomicBool,
    }

    impl RecordingSink {
        pub fn writes(&self) -> Vec<(String, Option<u32>)> {
            self.writes.lock().clone()
        }
    }

    impl StatusSink for RecordingSink {
        fn abort_requested(&self, _id: &TaskId) -> bool {
            self.aborted.load(Ordering::SeqCst)
        }

        fn write_status(
            &self,
            _id: &TaskId,
            text: &str,
            percent: Option<u32>,
        ) -> Result<(), RegistryError> {
            self.writes.lock().push((text.to_string(), percent));
            Ok(())
        }
    }

    fn reporter() -> (StatusReporter, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let reporter = StatusReporter::new(TaskId::from("t1"), sink.clone());
        (reporter, sink)
    }

    #[test]
    fn repeated_percent_writes_once() {
        let (status, sink) = reporter();
        for _ in 0..10 {
            status.set_percent(Some(42)).unwrap();
        }
        assert_eq!(sink.writes().len(), 1);
        assert_eq!(sink.writes()[0].1, Some(42));
    }

    #[test]
    fn paused_scope_flushes_once_with_final_values() {
        let (status, sink) = reporter();
        status
            .paused(|s| -> Result<(), Cancelled> {
                s.set_text("Downloading...")?;
                s.set_text("Converting...")?;
                s.set_percent(Some(10))?;
                Ok(())
            })
            .unwrap();

        assert_eq!(sink.writes(), vec![("Converting...".to_string(), Some(10))]);
    }

    #[test]
    fn nested_pause_flushes_at_outermost_exit() {
        let (status, sink) = reporter();
        status
            .paused(|outer| -> Result<(), Cancelled> {
                outer.paused(|inner| inner.set_text("inner"))?;
                assert!(sink.writes().is_empty());
                outer.set_percent(Some(5))
            })
            .unwrap();
        assert_eq!(sink.writes(), vec![("inner".to_string(), Some(5))]);
    }

    #[test]
    fn pause_with_no_net_change_does_not_write() {
        let (status, sink) = reporter();
        status.update("Uploading...", None).unwrap();
        status
            .paused(|s| -> Result<(), Cancelled> {
                s.set_text("something else")?;
                s.set_text("Uploading...")
            })
            .unwrap();
        assert_eq!(sink.writes().len(), 1);
    }

    #[test]
    fn abort_replaces_write_with_cancelled() {
        let (status, sink) = reporter();
        status.set_text("Downloading...").unwrap();
        sink.aborted.store(true, Ordering::SeqCst);

        assert_eq!(status.set_percent(Some(50)), Err(Cancelled));
        assert_eq!(status.update("Converting...", None), Err(Cancelled));
        assert_eq!(sink.writes().len(), 1);
    }

    #[test]
    fn unchanged_value_does_not_check_abort() {
        let (status, sink) = reporter();
        status.set_percent(Some(7)).unwrap();
        sink.aborted.store(true, Ordering::SeqCst);
        assert_eq!(status.set_percent(Some(7)), Ok(()));
    }

    #[test]
    fn pause_depth_restored_after_error() {
        let (status, sink) = reporter();
        let result: Result<(), Cancelled> = status.paused(|s| {
            s.set_text("partial")?;
            Err(Cancelled)
        });
        assert!(result.is_err());
        assert!(sink.writes().is_empty());

        status.set_percent(Some(1)).unwrap();
        assert_eq!(sink.writes(), vec![("partial".to_string(), Some(1))]);
    }

    #[test]
    fn percent_is_clamped() {
        let (status, _sink) = reporter();
        status.set_percent(Some(250)).unwrap();
        assert_eq!(status.percent(), Some(100));
    }
}
