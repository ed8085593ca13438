//! What a stage collaborator gets to see of its task.

use std::path::Path;

use super::args::ArgGuard;
use super::cache::StageResults;
use super::status::StatusReporter;
use crate::logging::TaskLogger;
use crate::models::{ParamName, TaskId};

/// Per-invocation view of the running task.
///
/// Stages report progress through `status` (which is also where an abort
/// surfaces), put files under `work_dir`, and read earlier results from
/// `results`.
pub struct StageContext<'a> {
    pub task_id: &'a TaskId,
    pub status: &'a StatusReporter,
    pub logger: &'a TaskLogger,
    pub work_dir: &'a Path,
    pub results: &'a StageResults,
    guard: &'a ArgGuard,
}

impl<'a> StageContext<'a> {
    pub fn new(
        task_id: &'a TaskId,
        status: &'a StatusReporter,
        logger: &'a TaskLogger,
        work_dir: &'a Path,
        results: &'a StageResults,
        guard: &'a ArgGuard,
    ) -> Self {
        Self {
            task_id,
            status,
            logger,
            work_dir,
            results,
            guard,
        }
    }

    /// Mark parameters whose cached results no longer reflect their value.
    pub fn taint(&self, names: &[ParamName]) {
        self.guard.taint(names);
    }
}
