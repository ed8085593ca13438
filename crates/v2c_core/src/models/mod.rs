//! Data models for video2commons tasks.
//!
//! This module contains the plain data shared by every layer:
//! - Identifiers and enums (task ids, parameter names, stage names, phases)
//! - The frozen parameter bundle a task is submitted with
//! - Durable task state and the status view handed to callers

mod enums;
mod params;
mod status;

pub use enums::{ParamName, StageName, TaskPhase};
pub use params::{OauthCredentials, SubtitleSelection, TaskId, TaskParams};
pub use status::{StatusEntry, TaskState, TaskStatusView, TaskSummary, GENERIC_FAILURE};
