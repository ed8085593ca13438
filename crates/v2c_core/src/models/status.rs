//! Durable task state and the views returned to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::params::TaskId;

/// Text shown for failures that have no user-facing explanation.
pub const GENERIC_FAILURE: &str = "Something went wrong. Please file an issue.";

/// State stored in the task record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    /// Submitted, no worker has reported progress yet.
    Queued,
    /// Running; last flushed status.
    Progress { text: String, percent: Option<u32> },
    /// Uploaded successfully.
    Done { filename: String, url: String },
    /// File staged for a manual server-side upload.
    NeedsManualUpload { url: String, hashsum: String },
    /// Failed with a user-visible explanation.
    Failed { text: String },
    /// Stopped by an abort request.
    Aborted,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done { .. } | Self::NeedsManualUpload { .. } | Self::Failed { .. } | Self::Aborted
        )
    }

    /// Short lowercase label used in listings.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Queued => "pending",
            Self::Progress { .. } => "progress",
            Self::Done { .. } => "done",
            Self::NeedsManualUpload { .. } => "needs-manual-upload",
            Self::Failed { .. } => "fail",
            Self::Aborted => "aborted",
        }
    }
}

/// One flushed status line, kept in the record's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub at: DateTime<Utc>,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<u32>,
}

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum TaskStatusView {
    Pending,
    Progress {
        text: String,
        /// `None` means indeterminate.
        percent: Option<u32>,
    },
    Done {
        filename: String,
        url: String,
    },
    NeedsManualUpload {
        url: String,
        hashsum: String,
    },
    Fail {
        text: String,
        restartable: bool,
    },
    Aborted,
}

/// Row of a task listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub title: String,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub status: TaskStatusView,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_view_serializes_with_kebab_tag() {
        let view = TaskStatusView::NeedsManualUpload {
            url: "https://host/File.webm".to_string(),
            hashsum: "abc".to_string(),
        };
        let json = serde_json::to_string(&view).unwrap();
        assert!(json.contains("\"status\":\"needs-manual-upload\""));
    }

    #[test]
    fn terminal_states() {
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Progress {
            text: "x".into(),
            percent: None
        }
        .is_terminal());
        assert!(TaskState::Aborted.is_terminal());
        assert_eq!(TaskState::Failed { text: "x".into() }.label(), "fail");
    }
}
