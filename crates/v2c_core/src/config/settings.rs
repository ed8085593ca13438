//! Settings struct with TOML-based sections.
//!
//! Each section maps to one TOML table and can be rewritten on its own by
//! `ConfigManager::update_section`.

use serde::{Deserialize, Serialize};

use crate::logging::LogLevel;

/// Root settings structure containing all configuration sections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Working, staging and storage directories.
    #[serde(default)]
    pub paths: PathSettings,

    /// Worker pool and task execution limits.
    #[serde(default)]
    pub worker: WorkerSettings,

    /// Task record retention and access.
    #[serde(default)]
    pub registry: RegistrySettings,

    /// Upload target and size limits.
    #[serde(default)]
    pub upload: UploadSettings,

    /// External tool locations.
    #[serde(default)]
    pub tools: ToolSettings,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Directory layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    /// Parent of the per-task working directories.
    #[serde(default = "default_work_root")]
    pub work_root: String,

    /// Where files waiting for a manual server-side upload are staged.
    #[serde(default = "default_ssu_root")]
    pub ssu_root: String,

    /// Root of the durable task store and queue spool.
    #[serde(default = "default_store_root")]
    pub store_root: String,

    /// Folder for per-task log files.
    #[serde(default = "default_logs_folder")]
    pub logs_folder: String,
}

fn default_work_root() -> String {
    "/srv/v2c/output".to_string()
}

fn default_ssu_root() -> String {
    "/srv/v2c/ssu".to_string()
}

fn default_store_root() -> String {
    "/srv/v2c/store".to_string()
}

fn default_logs_folder() -> String {
    "/srv/v2c/logs".to_string()
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            work_root: default_work_root(),
            ssu_root: default_ssu_root(),
            store_root: default_store_root(),
            logs_folder: default_logs_folder(),
        }
    }
}

/// Worker pool and per-task execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Number of worker threads.
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Queues this worker pulls from, in priority order.
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,

    /// Free disk space required under `work_root` before a task starts.
    #[serde(default = "default_min_free_disk_gb")]
    pub min_free_disk_gb: u64,

    /// How often a task may be deferred for lack of disk space.
    #[serde(default = "default_max_requirement_retries")]
    pub max_requirement_retries: u32,

    /// Delay before a deferred task is delivered again.
    #[serde(default = "default_retry_countdown_secs")]
    pub retry_countdown_secs: u64,

    /// Expiry of the run lock.
    #[serde(default = "default_run_lock_ttl_hours")]
    pub run_lock_ttl_hours: u64,

    /// Claims older than this are assumed to belong to a dead worker.
    #[serde(default = "default_stale_claim_minutes")]
    pub stale_claim_minutes: u64,

    /// Sleep between empty queue polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_threads() -> usize {
    2
}

fn default_queues() -> Vec<String> {
    vec!["heavy".to_string(), "celery".to_string()]
}

fn default_min_free_disk_gb() -> u64 {
    10
}

fn default_max_requirement_retries() -> u32 {
    20
}

fn default_retry_countdown_secs() -> u64 {
    5 * 60
}

fn default_run_lock_ttl_hours() -> u64 {
    7 * 24
}

fn default_stale_claim_minutes() -> u64 {
    6 * 60
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            queues: default_queues(),
            min_free_disk_gb: default_min_free_disk_gb(),
            max_requirement_retries: default_max_requirement_retries(),
            retry_countdown_secs: default_retry_countdown_secs(),
            run_lock_ttl_hours: default_run_lock_ttl_hours(),
            stale_claim_minutes: default_stale_claim_minutes(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl WorkerSettings {
    pub fn min_free_disk_bytes(&self) -> u64 {
        self.min_free_disk_gb << 30
    }

    pub fn retry_countdown(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.retry_countdown_secs)
    }

    pub fn run_lock_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.run_lock_ttl_hours as i64)
    }
}

/// Task record retention and access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// Records older than this are forgotten.
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,

    /// Number of status lines kept per task.
    #[serde(default = "default_status_history")]
    pub status_history: usize,

    /// Users allowed to see and control every task.
    #[serde(default)]
    pub sudoers: Vec<String>,
}

fn default_retention_days() -> u64 {
    14
}

fn default_status_history() -> usize {
    50
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            status_history: default_status_history(),
            sudoers: Vec::new(),
        }
    }
}

impl RegistrySettings {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days as i64)
    }

    pub fn is_sudoer(&self, username: &str) -> bool {
        self.sudoers.iter().any(|s| s == username)
    }
}

/// Upload target and size limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSettings {
    /// Public host serving the server-side upload staging directory.
    #[serde(default = "default_http_host")]
    pub http_host: String,

    /// Replacement for the `uploads:` URL prefix.
    #[serde(default = "default_uploads_base_url")]
    pub uploads_base_url: String,

    /// Files below this size are always uploaded directly.
    #[serde(default = "default_direct_limit_bytes")]
    pub direct_limit_bytes: u64,

    /// Files at or above this size cannot be uploaded at all.
    #[serde(default = "default_server_side_limit_bytes")]
    pub server_side_limit_bytes: u64,

    /// Files at or above this size are uploaded in chunks.
    #[serde(default = "default_chunked_threshold_bytes")]
    pub chunked_threshold_bytes: u64,

    /// Chunk size for chunked uploads.
    #[serde(default = "default_chunk_size_bytes")]
    pub chunk_size_bytes: u64,

    /// Attempts for transient upload failures.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// First backoff delay; doubles on every retry.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Root of the directory-backed publishing target.
    #[serde(default = "default_site_root")]
    pub site_root: String,

    /// Public base URL of the publishing target.
    #[serde(default = "default_site_url")]
    pub site_url: String,

    /// Largest file the publishing target accepts directly.
    #[serde(default = "default_site_max_upload_bytes")]
    pub site_max_upload_bytes: u64,
}

fn default_http_host() -> String {
    "v2c.wmcloud.org/ssu".to_string()
}

fn default_uploads_base_url() -> String {
    "https://video2commons.toolforge.org/static/uploads/".to_string()
}

fn default_direct_limit_bytes() -> u64 {
    1_000_000_000
}

fn default_server_side_limit_bytes() -> u64 {
    4 << 30
}

fn default_chunked_threshold_bytes() -> u64 {
    100_000_000
}

fn default_chunk_size_bytes() -> u64 {
    16 << 20
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    2000
}

fn default_site_root() -> String {
    "/srv/v2c/site".to_string()
}

fn default_site_url() -> String {
    "https://commons.wikimedia.org/wiki".to_string()
}

fn default_site_max_upload_bytes() -> u64 {
    2 << 30
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            http_host: default_http_host(),
            uploads_base_url: default_uploads_base_url(),
            direct_limit_bytes: default_direct_limit_bytes(),
            server_side_limit_bytes: default_server_side_limit_bytes(),
            chunked_threshold_bytes: default_chunked_threshold_bytes(),
            chunk_size_bytes: default_chunk_size_bytes(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            site_root: default_site_root(),
            site_url: default_site_url(),
            site_max_upload_bytes: default_site_max_upload_bytes(),
        }
    }
}

/// External tool locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSettings {
    #[serde(default = "default_yt_dlp")]
    pub yt_dlp: String,

    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,

    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,
}

fn default_yt_dlp() -> String {
    "yt-dlp".to_string()
}

fn default_ffmpeg() -> String {
    "/usr/bin/ffmpeg".to_string()
}

fn default_ffprobe() -> String {
    "/usr/bin/ffprobe".to_string()
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            yt_dlp: default_yt_dlp(),
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default level when `RUST_LOG` is unset.
    #[serde(default)]
    pub level: LogLevel,

    /// Compact task logs (progress filtered, tool output only in the tail).
    #[serde(default = "default_true")]
    pub compact: bool,

    /// Progress step percentage for compact mode.
    #[serde(default = "default_progress_step")]
    pub progress_step: u32,

    /// Number of tool output lines kept for failure reports.
    #[serde(default = "default_error_tail")]
    pub error_tail: usize,

    /// Emit the process log as JSON lines.
    #[serde(default)]
    pub json: bool,

    /// Also write the process log to a daily rolling file in `logs_folder`.
    #[serde(default)]
    pub rolling_file: bool,
}

fn default_true() -> bool {
    true
}

fn default_progress_step() -> u32 {
    20
}

fn default_error_tail() -> usize {
    20
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            compact: true,
            progress_step: default_progress_step(),
            error_tail: default_error_tail(),
            json: false,
            rolling_file: false,
        }
    }
}

/// Enum for identifying config sections (for atomic section updates).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSection {
    Paths,
    Worker,
    Registry,
    Upload,
    Tools,
    Logging,
}

impl ConfigSection {
    /// Get the TOML table name for this section.
    pub fn table_name(&self) -> &'static str {
        match self {
            ConfigSection::Paths => "paths",
            ConfigSection::Worker => "worker",
            ConfigSection::Registry => "registry",
            ConfigSection::Upload => "upload",
            ConfigSection::Tools => "tools",
            ConfigSection::Logging => "logging",
        }
    }

    pub fn all() -> &'static [ConfigSection] {
        &[
            ConfigSection::Paths,
            ConfigSection::Worker,
            ConfigSection::Registry,
            ConfigSection::Upload,
            ConfigSection::Tools,
            ConfigSection::Logging,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_serializes() {
        let settings = Settings::default();
        let toml = toml::to_string_pretty(&settings).unwrap();
        assert!(toml.contains("[paths]"));
        assert!(toml.contains("[worker]"));
        assert!(toml.contains("work_root"));
    }

    #[test]
    fn missing_fields_use_defaults() {
        let minimal = "[worker]\nthreads = 8";
        let parsed: Settings = toml::from_str(minimal).unwrap();
        assert_eq!(parsed.worker.threads, 8);
        assert_eq!(parsed.worker.max_requirement_retries, 20);
        assert_eq!(parsed.registry.retention_days, 14);
        assert_eq!(parsed.paths.work_root, "/srv/v2c/output");
    }

    #[test]
    fn limits_have_expected_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.worker.min_free_disk_bytes(), 10 << 30);
        assert_eq!(settings.worker.run_lock_ttl(), chrono::Duration::days(7));
        assert_eq!(settings.upload.server_side_limit_bytes, 4 << 30);
        assert_eq!(settings.upload.chunk_size_bytes, 16 << 20);
    }

    #[test]
    fn sudoers_lookup() {
        let mut settings = RegistrySettings::default();
        settings.sudoers.push("Admin".to_string());
        assert!(settings.is_sudoer("Admin"));
        assert!(!settings.is_sudoer("admin"));
    }
}
