//! Enums shared across the pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Name of one field of the task parameter bundle.
///
/// Used by the argument guard to whitelist and taint parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamName {
    Url,
    Extractor,
    Subtitles,
    Filename,
    Description,
    DownloadKey,
    EncodeKey,
    Username,
    Oauth,
    Queue,
}

impl ParamName {
    /// Stable name used in logs and persisted taint sets.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Url => "url",
            Self::Extractor => "extractor",
            Self::Subtitles => "subtitles",
            Self::Filename => "filename",
            Self::Description => "description",
            Self::DownloadKey => "download_key",
            Self::EncodeKey => "encode_key",
            Self::Username => "username",
            Self::Oauth => "oauth",
            Self::Queue => "queue",
        }
    }
}

impl fmt::Display for ParamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the four ordered pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Download,
    Encode,
    Upload,
    Subtitles,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Encode => "encode",
            Self::Upload => "upload",
            Self::Subtitles => "subtitles",
        }
    }

    /// All stages in execution order.
    pub fn all() -> &'static [StageName] {
        &[Self::Download, Self::Encode, Self::Upload, Self::Subtitles]
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle phase of a task execution.
///
/// `PreInit -> Initializing -> Running -> {Succeeded, Failed, NeedsManualUpload, Aborted}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    #[default]
    PreInit,
    Initializing,
    Running,
    Succeeded,
    Failed,
    NeedsManualUpload,
    Aborted,
}

impl TaskPhase {
    /// Terminal phases never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::NeedsManualUpload | Self::Aborted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreInit => "PREINIT",
            Self::Initializing => "INITIALIZING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::NeedsManualUpload => "NEEDS_MANUAL_UPLOAD",
            Self::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
