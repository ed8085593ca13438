//! Subtitle upload to TimedText pages.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::site::WikiSite;
use super::{StageResult, SubtitleUploader};
use crate::task::{StageContext, StageError, SubtitleArgs, SubtitlesOutput};

/// Saves each subtitle track as `TimedText:<file>.<lang>.srt`.
///
/// Existing pages are left alone. A failing language is reported in the
/// status and recorded; the remaining languages are still processed.
#[derive(Debug, Clone, Default)]
pub struct WikiSubtitleUploader;

impl WikiSubtitleUploader {
    pub fn new() -> Self {
        Self
    }

    fn upload_one(
        &self,
        site: &dyn WikiSite,
        lang: &str,
        path: &Path,
        wiki_filename: &str,
    ) -> StageResult<bool> {
        let bytes = fs::read(path).map_err(|e| StageError::io(format!("reading {} subtitles", lang), e))?;
        let text = String::from_utf8_lossy(&bytes);

        let title = format!("TimedText:{}.{}.srt", wiki_filename, lang.to_lowercase());
        let exists = site
            .page_exists(&title)
            .map_err(|e| StageError::infrastructure("Subtitle upload failed", e))?;
        if exists {
            return Ok(false);
        }

        let summary = format!("Import {} subtitles for [[:File:{}]]", lang, wiki_filename);
        site.save_page(&title, &text, &summary)
            .map_err(|e| StageError::infrastructure("Subtitle upload failed", e))?;
        Ok(true)
    }
}

impl SubtitleUploader for WikiSubtitleUploader {
    fn upload_subtitles(
        &self,
        ctx: &StageContext<'_>,
        site: &dyn WikiSite,
        args: &SubtitleArgs,
        subtitles: &BTreeMap<String, PathBuf>,
        wiki_filename: &str,
    ) -> StageResult<SubtitlesOutput> {
        if site.configured_user().as_deref() != Some(args.username.as_str()) {
            return Err(StageError::infrastructure(
                "Subtitle upload failed",
                format!("not logged in as {}", args.username),
            ));
        }

        let mut output = SubtitlesOutput::default();
        let total = subtitles.len().max(1) as u32;

        for (index, (lang, path)) in subtitles.iter().enumerate() {
            if !args.subtitles.wants(lang) {
                output.skipped.push(lang.clone());
                continue;
            }

            let percent = index as u32 * 100 / total;
            ctx.status
                .update(format!("Uploading subtitle in {}", lang), Some(percent))?;

            match self.upload_one(site, lang, path, wiki_filename) {
                Ok(true) => output.uploaded.push(lang.clone()),
                Ok(false) => {
                    ctx.logger.info(&format!("Subtitles in {} already exist", lang));
                    output.skipped.push(lang.clone());
                }
                Err(e) => {
                    ctx.logger.warn(&format!("Subtitles in {} failed: {}", lang, e));
                    ctx.status.update(e.to_string(), None)?;
                    output.failed.push(lang.clone());
                }
            }

            ctx.status.update(
                format!("Finished processing subtitle in {}", lang),
                Some((index as u32 + 1) * 100 / total),
            )?;
        }

        Ok(output)
    }
}
