//! Argument guard: per-stage read access to the frozen parameter bundle.
//!
//! A stage declares the parameters it reads as `StageArgs::PARAMS` and gets a
//! typed projection built inside a whitelist scope. Reading anything outside
//! the declared set while the scope is open panics, as does opening a second
//! scope. Parameters a stage consumed in a way that changes their meaning are
//! tainted; a later cache hit on a stage that declared a tainted parameter is
//! a resume bug and panics as well.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::{OauthCredentials, ParamName, SubtitleSelection, TaskParams};

/// Guards access to one task's parameters.
#[derive(Debug)]
pub struct ArgGuard {
    params: Arc<TaskParams>,
    whitelist: Mutex<Option<BTreeSet<ParamName>>>,
    tainted: Mutex<BTreeSet<ParamName>>,
}

impl ArgGuard {
    pub fn new(params: Arc<TaskParams>) -> Self {
        Self::with_tainted(params, BTreeSet::new())
    }

    /// Restore a guard with a taint set persisted by an earlier delivery.
    pub fn with_tainted(params: Arc<TaskParams>, tainted: BTreeSet<ParamName>) -> Self {
        Self {
            params,
            whitelist: Mutex::new(None),
            tainted: Mutex::new(tainted),
        }
    }

    /// Read access checked against the active whitelist, if any.
    pub fn view(&self) -> ParamView<'_> {
        ParamView { guard: self }
    }

    /// Run `f` with reads restricted to `names`.
    ///
    /// # Panics
    /// If a whitelist scope is already active.
    pub fn with_whitelist<T>(&self, names: &[ParamName], f: impl FnOnce(ParamView<'_>) -> T) -> T {
        {
            let mut whitelist = self.whitelist.lock();
            assert!(
                whitelist.is_none(),
                "whitelist scope opened while another one is active: {:?}",
                whitelist
            );
            *whitelist = Some(names.iter().copied().collect());
        }
        let _reset = WhitelistReset(self);
        f(self.view())
    }

    pub fn whitelist_active(&self) -> bool {
        self.whitelist.lock().is_some()
    }

    /// Record parameters whose cached results no longer match their value.
    pub fn taint(&self, names: &[ParamName]) {
        self.tainted.lock().extend(names.iter().copied());
    }

    pub fn tainted(&self) -> BTreeSet<ParamName> {
        self.tainted.lock().clone()
    }

    /// # Panics
    /// If any of `names` is tainted.
    pub fn assert_untainted(&self, names: &[ParamName]) {
        let tainted = self.tainted.lock();
        let overlap: Vec<ParamName> = names.iter().copied().filter(|n| tainted.contains(n)).collect();
        assert!(
            overlap.is_empty(),
            "cached stage result depends on tainted parameters: {:?}",
            overlap
        );
    }

    fn check(&self, name: ParamName) {
        if let Some(allowed) = self.whitelist.lock().as_ref() {
            assert!(
                allowed.contains(&name),
                "parameter '{}' read outside of the stage whitelist {:?}",
                name,
                allowed
            );
        }
    }
}

struct WhitelistReset<'a>(&'a ArgGuard);

impl Drop for WhitelistReset<'_> {
    fn drop(&mut self) {
        let previous = self.0.whitelist.lock().take();
        if !std::thread::panicking() {
            assert!(previous.is_some(), "whitelist scope closed twice");
        }
    }
}

/// Checked read access to the parameters.
#[derive(Clone, Copy)]
pub struct ParamView<'a> {
    guard: &'a ArgGuard,
}

impl<'a> ParamView<'a> {
    fn params(&self, name: ParamName) -> &'a TaskParams {
        self.guard.check(name);
        &self.guard.params
    }

    pub fn url(&self) -> &'a str {
        &self.params(ParamName::Url).url
    }

    pub fn extractor(&self) -> Option<&'a str> {
        self.params(ParamName::Extractor).extractor.as_deref()
    }

    pub fn subtitles(&self) -> &'a SubtitleSelection {
        &self.params(ParamName::Subtitles).subtitles
    }

    pub fn filename(&self) -> &'a str {
        &self.params(ParamName::Filename).filename
    }

    pub fn description(&self) -> &'a str {
        &self.params(ParamName::Description).description
    }

    pub fn download_key(&self) -> &'a str {
        &self.params(ParamName::DownloadKey).download_key
    }

    pub fn encode_key(&self) -> &'a str {
        &self.params(ParamName::EncodeKey).encode_key
    }

    pub fn username(&self) -> &'a str {
        &self.params(ParamName::Username).username
    }

    pub fn oauth(&self) -> &'a OauthCredentials {
        &self.params(ParamName::Oauth).oauth
    }

    pub fn queue(&self) -> &'a str {
        &self.params(ParamName::Queue).queue
    }
}

/// Typed projection of the parameters one stage may read.
pub trait StageArgs: Sized {
    /// Parameters the projection reads; also the stage's whitelist.
    const PARAMS: &'static [ParamName];

    fn project(view: ParamView<'_>) -> Self;
}

/// Parameters of the download stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadArgs {
    pub url: String,
    pub download_key: String,
    pub subtitles: SubtitleSelection,
    pub extractor: Option<String>,
}

impl StageArgs for DownloadArgs {
    const PARAMS: &'static [ParamName] = &[
        ParamName::Url,
        ParamName::DownloadKey,
        ParamName::Subtitles,
        ParamName::Extractor,
    ];

    fn project(view: ParamView<'_>) -> Self {
        Self {
            url: view.url().to_string(),
            download_key: view.download_key().to_string(),
            subtitles: view.subtitles().clone(),
            extractor: view.extractor().map(str::to_string),
        }
    }
}

/// Parameters of the encode stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeArgs {
    pub encode_key: String,
}

impl StageArgs for EncodeArgs {
    const PARAMS: &'static [ParamName] = &[ParamName::EncodeKey];

    fn project(view: ParamView<'_>) -> Self {
        Self {
            encode_key: view.encode_key().to_string(),
        }
    }
}

/// Parameters of the upload stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadArgs {
    pub filename: String,
    pub description: String,
    pub username: String,
    pub url: String,
}

impl StageArgs for UploadArgs {
    const PARAMS: &'static [ParamName] = &[
        ParamName::Filename,
        ParamName::Description,
        ParamName::Username,
        ParamName::Url,
    ];

    fn project(view: ParamView<'_>) -> Self {
        Self {
            filename: view.filename().to_string(),
            description: view.description().to_string(),
            username: view.username().to_string(),
            url: view.url().to_string(),
        }
    }
}

/// Parameters of the subtitle upload stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtitleArgs {
    pub username: String,
    pub subtitles: SubtitleSelection,
}

impl StageArgs for SubtitleArgs {
    const PARAMS: &'static [ParamName] = &[ParamName::Username, ParamName::Subtitles];

    fn project(view: ParamView<'_>) -> Self {
        Self {
            username: view.username().to_string(),
            subtitles: view.subtitles().clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    pub(crate) fn sample_params() -> TaskParams {
        TaskParams {
            url: "https://example.org/watch?v=1".to_string(),
            extractor: Some("Generic".to_string()),
            subtitles: SubtitleSelection::None,
            filename: "Example".to_string(),
            description: "== Summary ==\n[[Category:Uploaded with video2commons]]".to_string(),
            download_key: "bestvideo+bestaudio/best".to_string(),
            encode_key: "webm".to_string(),
            username: "Alice".to_string(),
            oauth: OauthCredentials::new("token", "secret"),
            queue: "celery".to_string(),
        }
    }

    fn guard() -> ArgGuard {
        ArgGuard::new(Arc::new(sample_params()))
    }

    #[test]
    fn unrestricted_outside_whitelist() {
        let guard = guard();
        assert_eq!(guard.view().username(), "Alice");
        assert_eq!(guard.view().encode_key(), "webm");
    }

    #[test]
    fn projection_reads_declared_params() {
        let guard = guard();
        let args = guard.with_whitelist(DownloadArgs::PARAMS, DownloadArgs::project);
        assert_eq!(args.download_key, "bestvideo+bestaudio/best");
        assert_eq!(args.extractor.as_deref(), Some("Generic"));
        assert!(!guard.whitelist_active());
    }

    #[test]
    fn reading_outside_whitelist_panics() {
        let guard = guard();
        let result = catch_unwind(AssertUnwindSafe(|| {
            guard.with_whitelist(EncodeArgs::PARAMS, |view| view.filename().to_string())
        }));
        assert!(result.is_err());
        // The scope is released even though it unwound.
        assert!(!guard.whitelist_active());
    }

    #[test]
    fn nested_whitelist_panics() {
        let guard = guard();
        let result = catch_unwind(AssertUnwindSafe(|| {
            guard.with_whitelist(EncodeArgs::PARAMS, |_| {
                guard.with_whitelist(UploadArgs::PARAMS, |_| ())
            })
        }));
        assert!(result.is_err());
        assert!(!guard.whitelist_active());
    }

    #[test]
    fn taint_overlap_panics() {
        let guard = guard();
        guard.taint(&[ParamName::Filename]);
        guard.assert_untainted(EncodeArgs::PARAMS);

        let result = catch_unwind(AssertUnwindSafe(|| {
            guard.assert_untainted(UploadArgs::PARAMS);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn restored_taint_is_kept() {
        let tainted: BTreeSet<ParamName> = [ParamName::Url].into_iter().collect();
        let guard = ArgGuard::with_tainted(Arc::new(sample_params()), tainted);
        assert!(guard.tainted().contains(&ParamName::Url));
    }

    #[test]
    fn every_projection_matches_its_whitelist() {
        let guard = guard();
        guard.with_whitelist(DownloadArgs::PARAMS, DownloadArgs::project);
        guard.with_whitelist(EncodeArgs::PARAMS, EncodeArgs::project);
        guard.with_whitelist(UploadArgs::PARAMS, UploadArgs::project);
        guard.with_whitelist(SubtitleArgs::PARAMS, SubtitleArgs::project);
    }
}
