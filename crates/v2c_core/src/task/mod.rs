//! Task execution pipeline.
//!
//! One [`TaskMachine`] drives one task through
//! download → encode → upload → subtitle upload:
//!
//! - [`status`]: coalesced progress writes, and the only place an abort
//!   request turns into [`Cancelled`]
//! - [`args`]: whitelisted, typed access to the frozen parameter bundle
//! - [`cache`]: per-stage memoization persisted with the task record
//! - [`scope`]: working directory and authentication scopes
//! - [`machine`]: the state machine tying these together
//!
//! Stage collaborators live in [`crate::stages`] and only see a
//! [`StageContext`].

pub mod args;
pub mod cache;
pub mod context;
pub mod errors;
pub mod machine;
pub mod scope;
pub mod status;

pub use args::{ArgGuard, DownloadArgs, EncodeArgs, ParamView, StageArgs, SubtitleArgs, UploadArgs};
pub use cache::{
    DownloadOutput, EncodeOutput, StageCache, StageOutput, StageResults, SubtitlesOutput,
    UploadOutput,
};
pub use context::StageContext;
pub use errors::{Cancelled, Failure, ScopeError, StageError, StageResult, TaskError, TaskResult};
pub use machine::{Execution, PreinitOutcome, TaskMachine, TaskOutcome, TaskServices};
pub use scope::{AuthGate, AuthScope, WorkDir};
pub use status::{StatusReporter, StatusSink};
