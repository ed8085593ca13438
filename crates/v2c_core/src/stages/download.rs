//! yt-dlp downloader.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use super::command::run_streaming;
use super::{Downloader, StageResult};
use crate::config::Settings;
use crate::models::SubtitleSelection;
use crate::task::{DownloadArgs, DownloadOutput, StageContext, StageError};

/// Output template, relative to the working directory.
const OUTPUT_TEMPLATE: &str = "dl.%(ext)s";
const INFO_FILE: &str = "dl.info.json";
const FALLBACK_MEDIA: &str = "dl.mkv";

/// Hosts we refuse to download from (matched as a suffix of the host).
const BLACKLISTED_HOST_SUFFIXES: &[&str] = &[".googlevideo.com"];

/// Downloads with an external `yt-dlp` binary run inside the working directory.
#[derive(Debug, Clone)]
pub struct YtDlpDownloader {
    program: String,
    uploads_base_url: String,
}

impl YtDlpDownloader {
    pub fn new(program: impl Into<String>, uploads_base_url: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            uploads_base_url: uploads_base_url.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.tools.yt_dlp, &settings.upload.uploads_base_url)
    }

    fn build_command(&self, work_dir: &Path, url: &str, extractor: Option<&str>, args: &DownloadArgs) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.current_dir(work_dir);
        cmd.args(downloader_args(url, extractor, &args.download_key, &args.subtitles));
        cmd
    }
}

impl Downloader for YtDlpDownloader {
    fn download(&self, ctx: &StageContext<'_>, args: &DownloadArgs) -> StageResult<DownloadOutput> {
        let (url, extractor) = resolve_source(&args.url, args.extractor.as_deref(), &self.uploads_base_url);
        check_blacklist(&url)?;

        ctx.status.set_text("Preprocessing...")?;

        let mut destination: Option<String> = None;
        let mut cmd = self.build_command(ctx.work_dir, &url, extractor.as_deref(), args);
        let run = run_streaming(ctx, "yt-dlp", &mut cmd, |line| {
            match parse_progress(line) {
                Some(Progress::Destination(name)) => destination = Some(name),
                Some(Progress::Downloading(percent)) => {
                    let target = destination.as_deref().unwrap_or("dl");
                    ctx.status.update(format!("Downloading to {}", target), Some(percent))?;
                }
                Some(Progress::Postprocessing) => ctx.status.update("Postprocessing...", None)?,
                None => {}
            }
            Ok(())
        });

        match run {
            Ok(()) => {}
            Err(StageError::CommandFailed { message, .. }) => {
                let reason = message.strip_prefix("ERROR: ").unwrap_or(&message);
                return Err(StageError::user(format!("Download failed: {}", reason)));
            }
            Err(e) => return Err(e),
        }

        let info = read_info(ctx.work_dir)?;
        if let Some(webpage_url) = info.as_ref().and_then(|i| i.webpage_url.as_deref()) {
            check_blacklist(webpage_url)?;
        }

        let ext = info.as_ref().and_then(|i| i.ext.as_deref());
        let media_path = locate_media(ctx.work_dir, ext).ok_or_else(|| {
            StageError::user("Failed to determine the path of the downloaded video. Is the video too large?")
        })?;

        let subtitles = if args.subtitles.is_requested() {
            collect_subtitles(ctx.work_dir, &args.subtitles)?
        } else {
            BTreeMap::new()
        };

        ctx.logger.success(&format!(
            "Downloaded {} ({} subtitle track(s))",
            media_path.display(),
            subtitles.len()
        ));

        Ok(DownloadOutput {
            media_path,
            subtitles,
            extractor,
        })
    }
}

/// Rewrite `uploads:` URLs to the uploads host.
///
/// Uploaded files are plain HTTP downloads, so the extractor hint is dropped.
fn resolve_source(url: &str, extractor: Option<&str>, uploads_base_url: &str) -> (String, Option<String>) {
    match url.strip_prefix("uploads:") {
        Some(rest) => (format!("{}{}", uploads_base_url, rest), None),
        None => (url.to_string(), extractor.map(str::to_string)),
    }
}

fn check_blacklist(url: &str) -> StageResult<()> {
    let Some((scheme, rest)) = url.split_once("://") else {
        return Ok(());
    };
    if !scheme.eq_ignore_ascii_case("http") && !scheme.eq_ignore_ascii_case("https") {
        return Ok(());
    }

    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host_port = authority.rsplit('@').next().unwrap_or_default();
    let host = host_port.split(':').next().unwrap_or_default().to_ascii_lowercase();

    if BLACKLISTED_HOST_SUFFIXES.iter().any(|suffix| host.ends_with(suffix)) {
        return Err(StageError::user("Your downloading URL has been blacklisted."));
    }
    Ok(())
}

fn downloader_args(
    url: &str,
    extractor: Option<&str>,
    download_key: &str,
    subtitles: &SubtitleSelection,
) -> Vec<String> {
    let mut args: Vec<String> = [
        "-f",
        download_key,
        "-o",
        OUTPUT_TEMPLATE,
        "--no-playlist",
        "--write-description",
        "--write-info-json",
        "--max-filesize",
        "5G",
        "--retries",
        "10",
        "--fragment-retries",
        "10",
        "--prefer-free-formats",
        "--newline",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    match subtitles {
        SubtitleSelection::None => {}
        selection => {
            let langs = match selection {
                SubtitleSelection::Languages(langs) => langs.join(","),
                _ => "all".to_string(),
            };
            args.extend(
                [
                    "--write-subs",
                    "--sub-format",
                    "srt/ass/vtt/best",
                    "--convert-subs",
                    "srt",
                    "--sub-langs",
                ]
                .iter()
                .map(|s| s.to_string()),
            );
            args.push(langs);
        }
    }

    if let Some(extractor) = extractor {
        args.push("--use-extractors".to_string());
        args.push(extractor.to_string());
    }

    args.push("--".to_string());
    args.push(url.to_string());
    args
}

#[derive(Debug, Clone, PartialEq)]
enum Progress {
    Destination(String),
    Downloading(u32),
    Postprocessing,
}

/// Postprocessor tags yt-dlp prints while merging or converting.
const POSTPROCESSOR_TAGS: &[&str] = &[
    "[Merger]",
    "[ExtractAudio]",
    "[VideoConvertor]",
    "[VideoRemuxer]",
    "[SubtitlesConvertor]",
    "[FixupM3u8]",
    "[FixupM4a]",
    "[FixupStretched]",
    "[FixupDuplicateMoov]",
    "[FixupTimestamp]",
];

fn parse_progress(line: &str) -> Option<Progress> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("[download]") {
        let rest = rest.trim_start();
        if let Some(name) = rest.strip_prefix("Destination:") {
            return Some(Progress::Destination(name.trim().to_string()));
        }
        let number = rest.split('%').next()?;
        if number.len() == rest.len() {
            return None;
        }
        let percent: f64 = number.trim().parse().ok()?;
        return Some(Progress::Downloading(percent.clamp(0.0, 100.0) as u32));
    }
    if POSTPROCESSOR_TAGS.iter().any(|tag| line.starts_with(tag)) {
        return Some(Progress::Postprocessing);
    }
    None
}

#[derive(Debug, Deserialize)]
struct InfoJson {
    ext: Option<String>,
    webpage_url: Option<String>,
}

fn read_info(work_dir: &Path) -> StageResult<Option<InfoJson>> {
    let path = work_dir.join(INFO_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read_to_string(&path).map_err(|e| StageError::io("reading download metadata", e))?;
    match serde_json::from_str(&data) {
        Ok(info) => Ok(Some(info)),
        Err(e) => {
            tracing::warn!(error = %e, "Unreadable download metadata");
            Ok(None)
        }
    }
}

/// `dl.<ext>` as reported by yt-dlp, or `dl.mkv` after a merge.
fn locate_media(work_dir: &Path, ext: Option<&str>) -> Option<PathBuf> {
    ext.map(|ext| work_dir.join(format!("dl.{}", ext)))
        .into_iter()
        .chain(std::iter::once(work_dir.join(FALLBACK_MEDIA)))
        .find(|p| p.is_file())
}

/// Converted subtitle files, `dl.<lang>.srt`, keyed by language.
fn collect_subtitles(work_dir: &Path, selection: &SubtitleSelection) -> StageResult<BTreeMap<String, PathBuf>> {
    let entries = fs::read_dir(work_dir).map_err(|e| StageError::io("listing downloaded files", e))?;

    let mut found = BTreeMap::new();
    for entry in entries {
        let entry = entry.map_err(|e| StageError::io("listing downloaded files", e))?;
        let name = entry.file_name();
        let Some(lang) = name
            .to_str()
            .and_then(|n| n.strip_prefix("dl."))
            .and_then(|n| n.strip_suffix(".srt"))
        else {
            continue;
        };
        if lang.is_empty() || lang.contains('.') || !selection.wants(lang) {
            continue;
        }
        found.insert(lang.to_string(), entry.path());
    }
    Ok(found)
}
