//! Task identity and the frozen parameter bundle.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque task identifier assigned by the registry at submission.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Allocate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// OAuth access token pair of the task owner.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OauthCredentials {
    pub token: String,
    pub secret: String,
}

impl OauthCredentials {
    pub fn new(token: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            secret: secret.into(),
        }
    }
}

// Never print the secrets themselves.
impl fmt::Debug for OauthCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OauthCredentials")
            .field("token", &"<redacted>")
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Which subtitle languages the owner asked to import.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtitleSelection {
    /// Do not import subtitles.
    #[default]
    None,
    /// Import every language the source offers.
    All,
    /// Import only these language codes.
    Languages(Vec<String>),
}

impl SubtitleSelection {
    /// Whether any subtitles were requested at all.
    pub fn is_requested(&self) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::Languages(langs) => !langs.is_empty(),
        }
    }

    /// Whether the given language code is wanted.
    pub fn wants(&self, lang: &str) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::Languages(langs) => langs.iter().any(|l| l.eq_ignore_ascii_case(lang)),
        }
    }
}

/// Frozen input bundle of a task.
///
/// Stages never read this directly; they receive typed projections from the
/// argument guard (see `task::args`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskParams {
    /// Source URL (may use the `uploads:` scheme for user uploads).
    pub url: String,
    /// Extractor hint for the downloader.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extractor: Option<String>,
    /// Requested subtitle languages.
    #[serde(default)]
    pub subtitles: SubtitleSelection,
    /// Target filename on the wiki, without extension.
    pub filename: String,
    /// File description page text.
    pub description: String,
    /// Download format selector.
    pub download_key: String,
    /// Encode profile key.
    pub encode_key: String,
    /// Owning user.
    pub username: String,
    /// Owner credentials for the upload target.
    pub oauth: OauthCredentials,
    /// Queue the task is delivered on.
    #[serde(default = "default_queue")]
    pub queue: String,
}

fn default_queue() -> String {
    "celery".to_string()
}
