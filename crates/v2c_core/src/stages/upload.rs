//! Upload to the publishing site, with server-side upload staging for
//! files the site refuses to take directly.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use super::site::{PublishedFile, SiteError, WikiSite};
use super::{StageResult, Uploader};
use crate::config::Settings;
use crate::task::{EncodeOutput, StageContext, StageError, UploadArgs, UploadOutput};

const UPLOAD_CATEGORY: &str = "[[Category:Uploaded with video2commons]]";
const SERVER_SIDE_CATEGORY: &str = "[[Category:Uploaded with video2commons/Server-side uploads]]";

/// Hash read size.
const HASH_BLOCK: usize = 64 * 1024;

/// Uploads the encoded file as `<filename>.<ext>`.
///
/// Size rules:
/// - below `direct_limit`: direct upload only
/// - below `server_side_limit`: direct upload, staged for a server-side
///   upload if the site's upload stash refuses it
/// - otherwise: refused
#[derive(Debug, Clone)]
pub struct WikiUploader {
    direct_limit: u64,
    server_side_limit: u64,
    chunked_threshold: u64,
    chunk_size: u64,
    retry_attempts: u32,
    retry_backoff: Duration,
    ssu_root: PathBuf,
    http_host: String,
}

impl WikiUploader {
    pub fn new(ssu_root: impl Into<PathBuf>, http_host: impl Into<String>) -> Self {
        Self {
            direct_limit: 1_000_000_000,
            server_side_limit: 4 << 30,
            chunked_threshold: 100_000_000,
            chunk_size: 16 << 20,
            retry_attempts: 3,
            retry_backoff: Duration::from_secs(2),
            ssu_root: ssu_root.into(),
            http_host: http_host.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let upload = &settings.upload;
        Self::new(&settings.paths.ssu_root, &upload.http_host)
            .with_limits(upload.direct_limit_bytes, upload.server_side_limit_bytes)
            .with_chunking(upload.chunked_threshold_bytes, upload.chunk_size_bytes)
            .with_retry(upload.retry_attempts, Duration::from_millis(upload.retry_backoff_ms))
    }

    pub fn with_limits(mut self, direct: u64, server_side: u64) -> Self {
        self.direct_limit = direct;
        self.server_side_limit = server_side;
        self
    }

    pub fn with_chunking(mut self, threshold: u64, chunk_size: u64) -> Self {
        self.chunked_threshold = threshold;
        self.chunk_size = chunk_size;
        self
    }

    /// Attempts for transient site errors; the delay doubles after each.
    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.retry_attempts = attempts.max(1);
        self.retry_backoff = backoff;
        self
    }

    /// Direct upload. The outer result carries stage failures (abort, name
    /// taken), the inner one the site's refusal.
    fn upload_direct(
        &self,
        ctx: &StageContext<'_>,
        site: &dyn WikiSite,
        args: &UploadArgs,
        source: &Path,
        wiki_filename: &str,
        size: u64,
    ) -> StageResult<Result<PublishedFile, SiteError>> {
        if site
            .file_exists(wiki_filename)
            .map_err(|e| StageError::infrastructure("Checking the file name failed", e))?
        {
            return Err(StageError::user("File already exists. Please choose another name."));
        }

        let comment = format!("Imported media from {}", args.url);
        let chunk_size = (size >= self.chunked_threshold).then_some(self.chunk_size);

        ctx.status.update("Uploading file...", None)?;

        let mut delay = self.retry_backoff;
        let mut attempt = 1;
        let result = loop {
            match site.upload_file(wiki_filename, source, &args.description, &comment, chunk_size) {
                Err(e) if e.is_transient() && attempt < self.retry_attempts => {
                    ctx.logger.warn(&format!("Upload attempt {} failed: {}", attempt, e));
                    ctx.status.set_text(format!(
                        "Upload failed temporarily, retrying ({}/{})...",
                        attempt, self.retry_attempts
                    ))?;
                    thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
                other => break other,
            }
        };

        match result {
            Ok(published) => Ok(Ok(published)),
            Err(e) => {
                // The upload may have gone through despite the error.
                if matches!(site.file_exists(wiki_filename), Ok(true)) {
                    ctx.logger.warn(&format!("Upload reported {} but the file exists", e));
                    Ok(Ok(PublishedFile {
                        title: wiki_filename.to_string(),
                        url: site.file_url(wiki_filename),
                    }))
                } else {
                    Ok(Err(e))
                }
            }
        }
    }

    /// Move the file to the server-side upload staging area.
    fn stage_server_side(
        &self,
        ctx: &StageContext<'_>,
        args: &UploadArgs,
        source: &Path,
        wiki_filename: &str,
    ) -> StageResult<UploadOutput> {
        ctx.status.update("Preparing for server-side upload...", None)?;

        let hashsum = md5_file(source).map_err(|e| StageError::io("hashing the encoded file", e))?;
        let name = sanitize_ssu_name(wiki_filename);

        fs::create_dir_all(&self.ssu_root)
            .map_err(|e| StageError::io("creating the server-side upload directory", e))?;
        let staged = self.ssu_root.join(&name);
        move_file(source, &staged).map_err(|e| StageError::io("staging the encoded file", e))?;

        let description = args.description.replace(UPLOAD_CATEGORY, SERVER_SIDE_CATEGORY);
        let mut description_path = staged.into_os_string();
        description_path.push(".txt");
        fs::write(&description_path, description)
            .map_err(|e| StageError::io("writing the file description", e))?;

        let url = format!("https://{}/{}", self.http_host, name);
        tracing::info!(task_id = %ctx.task_id, url = %url, "Staged file for server-side upload");
        ctx.logger.info(&format!("Staged for server-side upload: {}", url));

        Ok(UploadOutput::ServerSide { url, hashsum })
    }
}

impl Uploader for WikiUploader {
    fn upload(
        &self,
        ctx: &StageContext<'_>,
        site: &dyn WikiSite,
        args: &UploadArgs,
        encoded: &EncodeOutput,
    ) -> StageResult<UploadOutput> {
        let source = &encoded.encoded_path;
        let ext = source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let wiki_filename = format!("{}.{}", args.filename, ext);

        let size = fs::metadata(source)
            .map_err(|e| StageError::io("reading the encoded file size", e))?
            .len();

        if size >= self.server_side_limit {
            return Err(StageError::user(
                "Sorry, but files larger than 4GB can not be uploaded even with server-side \
                 uploading. This task may need manual intervention.",
            ));
        }

        match self.upload_direct(ctx, site, args, source, &wiki_filename, size)? {
            Ok(published) => {
                ctx.status.update("Upload success!", Some(100))?;
                Ok(UploadOutput::Uploaded {
                    filename: published.title,
                    url: published.url,
                })
            }
            Err(e) if size >= self.direct_limit && e.is_stash_failure() => {
                ctx.logger.warn(&format!("Direct upload refused ({}), staging server-side", e));
                self.stage_server_side(ctx, args, source, &wiki_filename)
            }
            Err(e) => Err(StageError::infrastructure("Upload failed", e)),
        }
    }
}

fn md5_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; HASH_BLOCK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }
    Ok(format!("{:x}", context.compute()))
}

/// One path component with no spaces or line breaks.
fn sanitize_ssu_name(name: &str) -> String {
    name.replace('/', "-")
        .replace(' ', "_")
        .replace("\r\n", "_")
        .replace(['\r', '\n'], "_")
}

fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        // Staging usually sits on another filesystem.
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}
