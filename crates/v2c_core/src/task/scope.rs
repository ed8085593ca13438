//! Resource scopes released on every exit path.
//!
//! - [`WorkDir`]: a private, randomly named working directory, removed on drop
//! - [`AuthGate`] / [`AuthScope`]: the process-wide exclusive login session on
//!   the publishing site, logged out and cleared on drop

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, MutexGuard};
use uuid::Uuid;

use super::errors::{ScopeError, StageError};
use crate::models::OauthCredentials;
use crate::stages::WikiSite;

/// Per-task working directory.
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    /// Name collisions tolerated before giving up.
    pub const MAX_ATTEMPTS: u32 = 10;

    /// Create a fresh directory with a random 16 hex digit name under `root`.
    pub fn create(root: &Path) -> Result<Self, ScopeError> {
        Self::create_with(root, || Uuid::new_v4().simple().to_string()[..16].to_string())
    }

    /// Like [`WorkDir::create`] with a custom name source.
    pub fn create_with(root: &Path, mut next_name: impl FnMut() -> String) -> Result<Self, ScopeError> {
        fs::create_dir_all(root).map_err(|e| ScopeError::io("creating working root", e))?;

        for _ in 0..Self::MAX_ATTEMPTS {
            let path = root.join(next_name());
            match fs::create_dir(&path) {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "Created working directory");
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(ScopeError::io("creating working directory", e)),
            }
        }

        Err(ScopeError::WorkDirExhausted {
            attempts: Self::MAX_ATTEMPTS,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Removed working directory"),
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove working directory"
            ),
        }
    }
}

/// Serializes logins on the shared publishing site within one process.
///
/// The site client keeps process-wide credentials, so only one task may be
/// logged in at a time.
#[derive(Debug, Default)]
pub struct AuthGate {
    lock: Mutex<()>,
}

impl AuthGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure the owner's credentials and log in.
    ///
    /// Blocks while another task holds the scope. A failed login clears the
    /// configuration before returning.
    ///
    /// # Panics
    /// If the site is already configured when the gate is acquired.
    pub fn enter<'a>(
        &'a self,
        site: &'a dyn WikiSite,
        username: &str,
        credentials: &OauthCredentials,
    ) -> Result<AuthScope<'a>, StageError> {
        let guard = self.lock.lock();

        assert!(
            site.configured_user().is_none(),
            "publishing site already has credentials configured"
        );

        site.configure(username, credentials);
        if let Err(e) = site.login() {
            site.clear();
            return Err(StageError::infrastructure("Login failed", e));
        }

        tracing::debug!(user = username, "Entered authentication scope");
        Ok(AuthScope {
            _guard: guard,
            site,
            username: username.to_string(),
        })
    }

    /// Whether a task currently holds the scope.
    pub fn is_held(&self) -> bool {
        self.lock.is_locked()
    }
}

/// Logged-in session; logs out and clears credentials on drop.
pub struct AuthScope<'a> {
    _guard: MutexGuard<'a, ()>,
    site: &'a dyn WikiSite,
    username: String,
}

impl AuthScope<'_> {
    pub fn site(&self) -> &dyn WikiSite {
        self.site
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl Drop for AuthScope<'_> {
    fn drop(&mut self) {
        let configured = self.site.configured_user();
        let expected = configured.as_deref() == Some(self.username.as_str());
        if std::thread::panicking() {
            if !expected {
                tracing::error!(
                    expected = %self.username,
                    found = ?configured,
                    "Authentication state changed while the scope was held"
                );
            }
        } else {
            assert!(
                expected,
                "authentication state changed while the scope was held: expected {:?}, found {:?}",
                self.username,
                configured
            );
        }

        if let Err(e) = self.site.logout() {
            tracing::warn!(error = %e, "Logout failed");
        }
        self.site.clear();
        tracing::debug!(user = %self.username, "Left authentication scope");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    use crate::stages::LocalSite;

    #[test]
    fn work_dir_is_removed_on_drop() {
        let root = tempdir().unwrap();
        let path = {
            let dir = WorkDir::create(root.path()).unwrap();
            fs::write(dir.path().join("dl.mp4"), b"data").unwrap();
            assert_eq!(dir.path().file_name().unwrap().len(), 16);
            dir.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn work_dir_is_removed_on_panic() {
        let root = tempdir().unwrap();
        let mut seen = None;
        let result = catch_unwind(AssertUnwindSafe(|| {
            let dir = WorkDir::create(root.path()).unwrap();
            seen = Some(dir.path().to_path_buf());
            panic!("stage blew up");
        }));
        assert!(result.is_err());
        assert!(!seen.unwrap().exists());
    }

    #[test]
    fn work_dir_retries_collisions() {
        let root = tempdir().unwrap();
        fs::create_dir(root.path().join("taken")).unwrap();

        let mut names = vec!["fresh".to_string(), "taken".to_string()];
        let dir = WorkDir::create_with(root.path(), || names.pop().unwrap()).unwrap();
        assert!(dir.path().ends_with("fresh"));
    }

    #[test]
    fn work_dir_gives_up_after_max_attempts() {
        let root = tempdir().unwrap();
        fs::create_dir(root.path().join("same")).unwrap();

        let mut calls = 0;
        let err = WorkDir::create_with(root.path(), || {
            calls += 1;
            "same".to_string()
        })
        .unwrap_err();

        assert!(matches!(err, ScopeError::WorkDirExhausted { attempts: 10 }));
        assert_eq!(calls, WorkDir::MAX_ATTEMPTS);
    }

    fn site() -> (tempfile::TempDir, LocalSite) {
        let dir = tempdir().unwrap();
        let site = LocalSite::new(dir.path(), "https://wiki.test/wiki", u64::MAX);
        (dir, site)
    }

    #[test]
    fn auth_scope_configures_and_clears() {
        let (_dir, site) = site();
        let gate = AuthGate::new();
        {
            let scope = gate
                .enter(&site, "Alice", &OauthCredentials::new("t", "s"))
                .unwrap();
            assert_eq!(scope.site().configured_user().as_deref(), Some("Alice"));
            assert!(site.is_logged_in());
            assert!(gate.is_held());
        }
        assert!(site.configured_user().is_none());
        assert!(!site.is_logged_in());
        assert!(!gate.is_held());
    }

    #[test]
    fn auth_scope_clears_on_panic() {
        let (_dir, site) = site();
        let gate = AuthGate::new();
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _scope = gate.enter(&site, "Alice", &OauthCredentials::new("t", "s")).unwrap();
            panic!("upload exploded");
        }));
        assert!(result.is_err());
        assert!(site.configured_user().is_none());
        assert!(!gate.is_held());
    }

    #[test]
    fn entering_with_leaked_credentials_panics() {
        let (_dir, site) = site();
        site.configure("Mallory", &OauthCredentials::new("x", "y"));
        let gate = AuthGate::new();

        let result = catch_unwind(AssertUnwindSafe(|| {
            let _ = gate.enter(&site, "Alice", &OauthCredentials::new("t", "s"));
        }));
        assert!(result.is_err());
    }

    #[test]
    fn login_failure_clears_configuration() {
        let (_dir, site) = site();
        site.fail_next_login("invalid OAuth token");
        let gate = AuthGate::new();

        let err = gate
            .enter(&site, "Alice", &OauthCredentials::new("t", "s"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("invalid OAuth token"));
        assert!(site.configured_user().is_none());
        assert!(!gate.is_held());
    }

    #[test]
    fn scopes_are_exclusive_across_threads() {
        let (_dir, site) = site();
        let site = Arc::new(site);
        let gate = Arc::new(AuthGate::new());

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let site = site.clone();
                let gate = gate.clone();
                thread::spawn(move || {
                    let user = format!("user{}", i);
                    let scope = gate
                        .enter(site.as_ref(), &user, &OauthCredentials::new("t", "s"))
                        .unwrap();
                    thread::sleep(Duration::from_millis(5));
                    assert_eq!(scope.site().configured_user(), Some(user));
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(site.configured_user().is_none());
    }
}
