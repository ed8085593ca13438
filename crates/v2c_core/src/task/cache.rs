//! Stage memoization cache.
//!
//! Stage results are a struct of optionals, one typed slot per stage, filled
//! in as stages complete. The whole struct is persisted with the task record
//! after every executed stage so a redelivered task skips the work it
//! already did. Download and encode results point into the working
//! directory of the run that produced them; when a later delivery loads
//! them and the files are gone, those slots are discarded and the stages
//! run again.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::args::{ArgGuard, ParamView, StageArgs};
use super::errors::StageError;
use super::status::StatusReporter;
use crate::models::StageName;

/// Result of the download stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadOutput {
    /// Downloaded media file.
    pub media_path: PathBuf,
    /// Subtitle files by language code.
    #[serde(default)]
    pub subtitles: BTreeMap<String, PathBuf>,
    /// Extractor hint actually used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extractor: Option<String>,
}

/// Result of the encode stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodeOutput {
    pub encoded_path: PathBuf,
}

/// Result of the upload stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UploadOutput {
    /// Published on the wiki.
    Uploaded { filename: String, url: String },
    /// Too large for a direct upload; staged for a manual server-side upload.
    ServerSide { url: String, hashsum: String },
}

/// Result of the subtitle stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtitlesOutput {
    #[serde(default)]
    pub uploaded: Vec<String>,
    #[serde(default)]
    pub skipped: Vec<String>,
    #[serde(default)]
    pub failed: Vec<String>,
}

/// Per-task stage results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download: Option<DownloadOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encode: Option<EncodeOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<UploadOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitles: Option<SubtitlesOutput>,
}

impl StageResults {
    pub fn has(&self, stage: StageName) -> bool {
        match stage {
            StageName::Download => self.download.is_some(),
            StageName::Encode => self.encode.is_some(),
            StageName::Upload => self.upload.is_some(),
            StageName::Subtitles => self.subtitles.is_some(),
        }
    }

    pub fn get<T: StageOutput>(&self) -> Option<&T> {
        T::slot(self)
    }

    /// Discard download and encode results whose files no longer exist and
    /// that a stage still to run would read. Returns the discarded stages.
    pub fn discard_missing_files(&mut self) -> Vec<StageName> {
        let mut discarded = Vec::new();

        if self.upload.is_none() {
            if let Some(encode) = &self.encode {
                if !encode.encoded_path.exists() {
                    self.encode = None;
                    discarded.push(StageName::Encode);
                }
            }
        }

        if let Some(download) = &self.download {
            let media_gone = self.encode.is_none() && !download.media_path.exists();
            let subtitles_gone = self.subtitles.is_none()
                && download.subtitles.values().any(|path| !path.exists());
            if media_gone || subtitles_gone {
                self.download = None;
                discarded.insert(0, StageName::Download);
            }
        }

        discarded
    }

    /// Stages with a cached result, in execution order.
    pub fn completed(&self) -> Vec<StageName> {
        StageName::all().iter().copied().filter(|s| self.has(*s)).collect()
    }
}

/// A value that occupies one slot of [`StageResults`].
pub trait StageOutput: Clone {
    const STAGE: StageName;

    fn slot(results: &StageResults) -> Option<&Self>;

    fn store(self, results: &mut StageResults);
}

impl StageOutput for DownloadOutput {
    const STAGE: StageName = StageName::Download;

    fn slot(results: &StageResults) -> Option<&Self> {
        results.download.as_ref()
    }

    fn store(self, results: &mut StageResults) {
        results.download = Some(self);
    }
}

impl StageOutput for EncodeOutput {
    const STAGE: StageName = StageName::Encode;

    fn slot(results: &StageResults) -> Option<&Self> {
        results.encode.as_ref()
    }

    fn store(self, results: &mut StageResults) {
        results.encode = Some(self);
    }
}

impl StageOutput for UploadOutput {
    const STAGE: StageName = StageName::Upload;

    fn slot(results: &StageResults) -> Option<&Self> {
        results.upload.as_ref()
    }

    fn store(self, results: &mut StageResults) {
        results.upload = Some(self);
    }
}

impl StageOutput for SubtitlesOutput {
    const STAGE: StageName = StageName::Subtitles;

    fn slot(results: &StageResults) -> Option<&Self> {
        results.subtitles.as_ref()
    }

    fn store(self, results: &mut StageResults) {
        results.subtitles = Some(self);
    }
}

/// Memoizes stage results for one task.
#[derive(Debug, Default)]
pub struct StageCache {
    results: StageResults,
}

impl StageCache {
    pub fn new(results: StageResults) -> Self {
        Self { results }
    }

    pub fn results(&self) -> &StageResults {
        &self.results
    }

    pub fn has_result(&self, stage: StageName) -> bool {
        self.results.has(stage)
    }

    pub fn get<T: StageOutput>(&self) -> Option<&T> {
        self.results.get::<T>()
    }

    /// Slots are write-once; a second write is a programming error.
    pub fn set<T: StageOutput>(&mut self, value: T) {
        assert!(
            !self.results.has(T::STAGE),
            "stage '{}' already has a cached result",
            T::STAGE
        );
        value.store(&mut self.results);
    }

    /// Run a stage unless its result is cached.
    ///
    /// On a hit the stage's parameters must be untainted (panics otherwise)
    /// and `f` is not called. On a miss the start message is flushed as an
    /// indeterminate status, `f` runs with reads restricted to
    /// `A::PARAMS`, and the result is stored.
    pub fn execute_stage<A, T, F>(
        &mut self,
        guard: &ArgGuard,
        status: &StatusReporter,
        start_message: &str,
        f: F,
    ) -> Result<T, StageError>
    where
        A: StageArgs,
        T: StageOutput,
        F: FnOnce(A, &StageResults) -> Result<T, StageError>,
    {
        if let Some(cached) = T::slot(&self.results) {
            guard.assert_untainted(A::PARAMS);
            tracing::debug!(stage = %T::STAGE, "Skipping stage with cached result");
            return Ok(cached.clone());
        }

        status.update(start_message, None)?;

        let results = &self.results;
        let output = guard.with_whitelist(A::PARAMS, |view: ParamView<'_>| {
            f(A::project(view), results)
        })?;

        self.set(output.clone());
        Ok(output)
    }
}
