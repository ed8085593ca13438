//! Configuration management for video2commons workers.
//!
//! This module provides:
//! - TOML-based configuration with logical sections
//! - Atomic file writes (write to temp, then rename)
//! - Section-level updates (only changed section is modified)
//!
//! # Example
//!
//! ```no_run
//! use v2c_core::config::{ConfigManager, ConfigSection};
//!
//! let mut config = ConfigManager::new("/etc/v2c/settings.toml");
//! config.load_or_create().unwrap();
//!
//! println!("Working root: {}", config.settings().paths.work_root);
//!
//! config.settings_mut().worker.threads = 4;
//! config.update_section(ConfigSection::Worker).unwrap();
//! ```

mod manager;
mod settings;

pub use manager::{ConfigError, ConfigManager, ConfigResult};
pub use settings::{
    ConfigSection, LoggingSettings, PathSettings, RegistrySettings, Settings, ToolSettings,
    UploadSettings, WorkerSettings,
};
