//! Publishing site boundary.
//!
//! The remote wiki client keeps process-wide credentials; [`WikiSite`]
//! exposes exactly the operations the upload stages need, and
//! [`LocalSite`] implements them on a directory tree.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;

use crate::models::OauthCredentials;

/// Errors reported by the publishing site.
#[derive(Error, Debug)]
pub enum SiteError {
    #[error("no credentials configured")]
    NotConfigured,

    #[error("not logged in")]
    NotLoggedIn,

    #[error("authentication failed: {0}")]
    Auth(String),

    /// Error code returned by the site API.
    #[error("{code}: {info}")]
    Api { code: String, info: String },

    /// Network-level failure worth retrying.
    #[error("temporary failure: {0}")]
    Transient(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SiteError {
    pub fn api(code: impl Into<String>, info: impl Into<String>) -> Self {
        Self::Api {
            code: code.into(),
            info: info.into(),
        }
    }

    /// The upload stash or storage backend refused the file, usually for its size.
    pub fn is_stash_failure(&self) -> bool {
        matches!(self, Self::Api { code, .. } if code.contains("stash") || code == "backend-fail-internal")
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// A published file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedFile {
    /// Title without namespace.
    pub title: String,
    pub url: String,
}

/// Operations on the publishing site used by the upload stages.
pub trait WikiSite: Send + Sync {
    /// Install credentials for the given user.
    fn configure(&self, username: &str, credentials: &OauthCredentials);

    /// Drop credentials and cached sessions.
    fn clear(&self);

    /// User whose credentials are installed, if any.
    fn configured_user(&self) -> Option<String>;

    fn login(&self) -> Result<(), SiteError>;

    fn logout(&self) -> Result<(), SiteError>;

    fn file_exists(&self, name: &str) -> Result<bool, SiteError>;

    /// Public URL of a file page.
    fn file_url(&self, name: &str) -> String;

    /// Upload `source` as `File:<name>`; chunked when `chunk_size` is set.
    fn upload_file(
        &self,
        name: &str,
        source: &Path,
        description: &str,
        comment: &str,
        chunk_size: Option<u64>,
    ) -> Result<PublishedFile, SiteError>;

    fn page_exists(&self, title: &str) -> Result<bool, SiteError>;

    fn save_page(&self, title: &str, text: &str, summary: &str) -> Result<(), SiteError>;
}

#[derive(Debug, Default)]
struct SessionState {
    user: Option<String>,
    credentials: Option<OauthCredentials>,
    logged_in: bool,
    login_failure: Option<String>,
    upload_failures: VecDeque<SiteError>,
}

/// Directory-backed publishing target.
///
/// Files land in `<root>/files/<name>` with their description page in
/// `<root>/pages/File:<name>.wiki`; other pages in `<root>/pages/<title>.wiki`.
/// Uploads larger than `max_upload_bytes` are refused with a stash error.
pub struct LocalSite {
    root: PathBuf,
    base_url: String,
    max_upload_bytes: u64,
    state: Mutex<SessionState>,
}

impl LocalSite {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>, max_upload_bytes: u64) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_upload_bytes,
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.state.lock().logged_in
    }

    /// Make the next login fail with the given reason.
    pub fn fail_next_login(&self, reason: impl Into<String>) {
        self.state.lock().login_failure = Some(reason.into());
    }

    /// Queue an error for the next upload attempt.
    pub fn fail_next_upload(&self, error: SiteError) {
        self.state.lock().upload_failures.push_back(error);
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.root.join("files").join(encode_title(name))
    }

    fn page_path(&self, title: &str) -> PathBuf {
        self.root.join("pages").join(format!("{}.wiki", encode_title(title)))
    }

    fn require_login(&self) -> Result<(), SiteError> {
        if self.state.lock().logged_in {
            Ok(())
        } else {
            Err(SiteError::NotLoggedIn)
        }
    }
}

impl WikiSite for LocalSite {
    fn configure(&self, username: &str, credentials: &OauthCredentials) {
        let mut state = self.state.lock();
        state.user = Some(username.to_string());
        state.credentials = Some(credentials.clone());
    }

    fn clear(&self) {
        let mut state = self.state.lock();
        state.user = None;
        state.credentials = None;
        state.logged_in = false;
    }

    fn configured_user(&self) -> Option<String> {
        self.state.lock().user.clone()
    }

    fn login(&self) -> Result<(), SiteError> {
        let mut state = self.state.lock();
        if let Some(reason) = state.login_failure.take() {
            return Err(SiteError::Auth(reason));
        }
        if state.user.is_none() || state.credentials.is_none() {
            return Err(SiteError::NotConfigured);
        }
        state.logged_in = true;
        Ok(())
    }

    fn logout(&self) -> Result<(), SiteError> {
        self.state.lock().logged_in = false;
        Ok(())
    }

    fn file_exists(&self, name: &str) -> Result<bool, SiteError> {
        Ok(self.file_path(name).exists())
    }

    fn file_url(&self, name: &str) -> String {
        format!("{}/File:{}", self.base_url, name.replace(' ', "_"))
    }

    fn upload_file(
        &self,
        name: &str,
        source: &Path,
        description: &str,
        comment: &str,
        _chunk_size: Option<u64>,
    ) -> Result<PublishedFile, SiteError> {
        self.require_login()?;
        if let Some(error) = self.state.lock().upload_failures.pop_front() {
            return Err(error);
        }

        let size = fs::metadata(source)?.len();
        if size > self.max_upload_bytes {
            return Err(SiteError::api(
                "stashfailed",
                format!("File exceeds the maximum upload size of {} bytes", self.max_upload_bytes),
            ));
        }

        let target = self.file_path(name);
        if target.exists() {
            return Err(SiteError::api("fileexists-no-change", "The file already exists"));
        }

        fs::create_dir_all(self.root.join("files"))?;
        fs::copy(source, &target)?;
        self.save_page(&format!("File:{}", name), description, comment)?;

        tracing::info!(file = name, size, "Published file");
        Ok(PublishedFile {
            title: name.to_string(),
            url: self.file_url(name),
        })
    }

    fn page_exists(&self, title: &str) -> Result<bool, SiteError> {
        Ok(self.page_path(title).exists())
    }

    fn save_page(&self, title: &str, text: &str, summary: &str) -> Result<(), SiteError> {
        self.require_login()?;
        fs::create_dir_all(self.root.join("pages"))?;
        fs::write(self.page_path(title), text)?;
        tracing::debug!(title, summary, "Saved page");
        Ok(())
    }
}

/// Page titles may contain `/`; keep them one path component.
fn encode_title(title: &str) -> String {
    title.replace('%', "%25").replace('/', "%2F")
}
