//! Stage collaborators: download, encode, upload and subtitle upload.
//!
//! The task machine only knows the four traits below. Each receives the
//! running task's [`StageContext`] and its typed argument projection, and
//! returns a stage result or a [`StageError`](crate::task::StageError). Implementations must not
//! assume they run from scratch: a cached result skips them entirely.
//!
//! Closures with the matching signature implement the traits, which keeps
//! ad hoc collaborators short.

mod command;
mod download;
mod encode;
mod site;
mod subtitles;
mod upload;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

pub use download::YtDlpDownloader;
pub use encode::{EncodeProfile, FfmpegEncoder, PROFILES};
pub use site::{LocalSite, PublishedFile, SiteError, WikiSite};
pub use subtitles::WikiSubtitleUploader;
pub use upload::WikiUploader;

use crate::config::Settings;
pub use crate::task::StageResult;
use crate::task::{
    DownloadArgs, DownloadOutput, EncodeArgs, EncodeOutput, StageContext, SubtitleArgs,
    SubtitlesOutput, UploadArgs, UploadOutput,
};

/// Fetches the source media into the working directory.
pub trait Downloader: Send + Sync {
    fn download(&self, ctx: &StageContext<'_>, args: &DownloadArgs) -> StageResult<DownloadOutput>;
}

/// Converts the downloaded media into a free format.
pub trait Encoder: Send + Sync {
    fn encode(
        &self,
        ctx: &StageContext<'_>,
        args: &EncodeArgs,
        source: &DownloadOutput,
    ) -> StageResult<EncodeOutput>;
}

/// Publishes the encoded file.
pub trait Uploader: Send + Sync {
    fn upload(
        &self,
        ctx: &StageContext<'_>,
        site: &dyn WikiSite,
        args: &UploadArgs,
        encoded: &EncodeOutput,
    ) -> StageResult<UploadOutput>;
}

/// Publishes subtitle tracks for an uploaded file.
pub trait SubtitleUploader: Send + Sync {
    fn upload_subtitles(
        &self,
        ctx: &StageContext<'_>,
        site: &dyn WikiSite,
        args: &SubtitleArgs,
        subtitles: &BTreeMap<String, PathBuf>,
        wiki_filename: &str,
    ) -> StageResult<SubtitlesOutput>;
}

impl<F> Downloader for F
where
    F: Fn(&StageContext<'_>, &DownloadArgs) -> StageResult<DownloadOutput> + Send + Sync,
{
    fn download(&self, ctx: &StageContext<'_>, args: &DownloadArgs) -> StageResult<DownloadOutput> {
        self(ctx, args)
    }
}

impl<F> Encoder for F
where
    F: Fn(&StageContext<'_>, &EncodeArgs, &DownloadOutput) -> StageResult<EncodeOutput>
        + Send
        + Sync,
{
    fn encode(
        &self,
        ctx: &StageContext<'_>,
        args: &EncodeArgs,
        source: &DownloadOutput,
    ) -> StageResult<EncodeOutput> {
        self(ctx, args, source)
    }
}

impl<F> Uploader for F
where
    F: Fn(&StageContext<'_>, &dyn WikiSite, &UploadArgs, &EncodeOutput) -> StageResult<UploadOutput>
        + Send
        + Sync,
{
    fn upload(
        &self,
        ctx: &StageContext<'_>,
        site: &dyn WikiSite,
        args: &UploadArgs,
        encoded: &EncodeOutput,
    ) -> StageResult<UploadOutput> {
        self(ctx, site, args, encoded)
    }
}

impl<F> SubtitleUploader for F
where
    F: Fn(
            &StageContext<'_>,
            &dyn WikiSite,
            &SubtitleArgs,
            &BTreeMap<String, PathBuf>,
            &str,
        ) -> StageResult<SubtitlesOutput>
        + Send
        + Sync,
{
    fn upload_subtitles(
        &self,
        ctx: &StageContext<'_>,
        site: &dyn WikiSite,
        args: &SubtitleArgs,
        subtitles: &BTreeMap<String, PathBuf>,
        wiki_filename: &str,
    ) -> StageResult<SubtitlesOutput> {
        self(ctx, site, args, subtitles, wiki_filename)
    }
}

/// The four collaborators a worker runs tasks with.
#[derive(Clone)]
pub struct StageSet {
    pub downloader: Arc<dyn Downloader>,
    pub encoder: Arc<dyn Encoder>,
    pub uploader: Arc<dyn Uploader>,
    pub subtitles: Arc<dyn SubtitleUploader>,
}

impl StageSet {
    pub fn new(
        downloader: impl Downloader + 'static,
        encoder: impl Encoder + 'static,
        uploader: impl Uploader + 'static,
        subtitles: impl SubtitleUploader + 'static,
    ) -> Self {
        Self {
            downloader: Arc::new(downloader),
            encoder: Arc::new(encoder),
            uploader: Arc::new(uploader),
            subtitles: Arc::new(subtitles),
        }
    }

    /// yt-dlp, ffmpeg and the wiki uploaders, configured from settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            YtDlpDownloader::from_settings(settings),
            FfmpegEncoder::from_settings(settings),
            WikiUploader::from_settings(settings),
            WikiSubtitleUploader::new(),
        )
    }
}
