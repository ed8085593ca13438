//! ffmpeg encoder with a fixed profile table.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use super::command::{run_captured, run_streaming};
use super::{Encoder, StageResult};
use crate::config::Settings;
use crate::task::{DownloadOutput, EncodeArgs, EncodeOutput, StageContext, StageError};

/// One target format.
///
/// Codec names are as reported by ffprobe. A profile without a video codec
/// drops the video track; one without an audio codec drops the audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeProfile {
    pub key: &'static str,
    pub video_codec: Option<&'static str>,
    pub video_encoder: &'static str,
    pub video_options: &'static [&'static str],
    pub audio_codec: Option<&'static str>,
    pub audio_encoder: &'static str,
    pub audio_options: &'static [&'static str],
    /// Output container passed to `-f`.
    pub format: &'static str,
}

const VP8: (&str, &str, &[&str]) = ("vp8", "libvpx", &["-b:v", "2M", "-crf", "10", "-deadline", "good"]);
const VP9: (&str, &str, &[&str]) = ("vp9", "libvpx-vp9", &["-b:v", "0", "-crf", "32", "-row-mt", "1"]);
const AV1: (&str, &str, &[&str]) = ("av1", "libsvtav1", &["-crf", "35", "-preset", "8"]);
const THEORA: (&str, &str, &[&str]) = ("theora", "libtheora", &["-q:v", "7"]);
const VORBIS: (&str, &str, &[&str]) = ("vorbis", "libvorbis", &["-q:a", "5"]);
const OPUS: (&str, &str, &[&str]) = ("opus", "libopus", &["-b:a", "128k"]);

const fn profile(
    key: &'static str,
    video: Option<(&'static str, &'static str, &'static [&'static str])>,
    audio: Option<(&'static str, &'static str, &'static [&'static str])>,
    format: &'static str,
) -> EncodeProfile {
    let (video_codec, video_encoder, video_options) = match video {
        Some((codec, encoder, options)) => (Some(codec), encoder, options),
        None => (None, "", &[] as &[&str]),
    };
    let (audio_codec, audio_encoder, audio_options) = match audio {
        Some((codec, encoder, options)) => (Some(codec), encoder, options),
        None => (None, "", &[] as &[&str]),
    };
    EncodeProfile {
        key,
        video_codec,
        video_encoder,
        video_options,
        audio_codec,
        audio_encoder,
        audio_options,
        format,
    }
}

/// Supported encode keys, in lookup order for codec-preserving substitutes.
pub const PROFILES: &[EncodeProfile] = &[
    profile("webm", Some(VP8), Some(VORBIS), "webm"),
    profile("an.webm", Some(VP8), None, "webm"),
    profile("vp9.webm", Some(VP9), Some(OPUS), "webm"),
    profile("an.vp9.webm", Some(VP9), None, "webm"),
    profile("av1.webm", Some(AV1), Some(OPUS), "webm"),
    profile("an.av1.webm", Some(AV1), None, "webm"),
    profile("ogv", Some(THEORA), Some(VORBIS), "ogg"),
    profile("an.ogv", Some(THEORA), None, "ogg"),
    profile("ogg", None, Some(VORBIS), "ogg"),
    profile("opus", None, Some(OPUS), "ogg"),
];

impl EncodeProfile {
    pub fn lookup(key: &str) -> Option<&'static EncodeProfile> {
        PROFILES.iter().find(|p| p.key == key)
    }
}

/// Codecs and duration of a media file.
#[derive(Debug, Clone, Default, PartialEq)]
struct MediaInfo {
    video: Option<String>,
    audio: Option<String>,
    duration_secs: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// First video and first audio stream of ffprobe's JSON; `None` without streams.
fn parse_probe(data: &[u8]) -> Option<MediaInfo> {
    let probe: ProbeOutput = serde_json::from_slice(data).ok()?;
    if probe.streams.is_empty() {
        return None;
    }

    let mut info = MediaInfo {
        duration_secs: probe
            .format
            .and_then(|f| f.duration)
            .and_then(|d| d.parse().ok())
            .filter(|d: &f64| *d > 0.0),
        ..Default::default()
    };
    for stream in probe.streams {
        let slot = match stream.codec_type.as_deref() {
            Some("video") => &mut info.video,
            Some("audio") => &mut info.audio,
            _ => continue,
        };
        if slot.is_none() {
            *slot = stream.codec_name;
        }
    }
    Some(info)
}

/// Check the source against the requested profile and pick the profile to
/// encode with.
///
/// When another profile keeps the source codecs unchanged while giving the
/// same kind of output (audio and video, video only, audio only), that one
/// wins so the streams can be copied.
fn choose_profile(info: &MediaInfo, target: &'static EncodeProfile) -> StageResult<&'static EncodeProfile> {
    if info.video.is_none() && info.audio.is_none() {
        return Err(StageError::user("The file has no video or audio tracks."));
    }
    if target.video_codec.is_some() && info.video.is_none() {
        return Err(StageError::user(
            "Video is asked to be kept but the file has no video tracks.",
        ));
    }
    if target.audio_codec.is_some() && info.audio.is_none() {
        return Err(StageError::user(
            "Audio is asked to be kept but the file has no audio tracks.",
        ));
    }

    let same_codec = |wanted: Option<&str>, have: &Option<String>| {
        matches!((wanted, have.as_deref()), (Some(w), Some(h)) if w == h)
    };
    let substitute = match (target.video_codec, target.audio_codec) {
        (Some(_), Some(_)) => PROFILES.iter().find(|p| {
            same_codec(p.video_codec, &info.video) && same_codec(p.audio_codec, &info.audio)
        }),
        (Some(_), None) => PROFILES
            .iter()
            .find(|p| same_codec(p.video_codec, &info.video) && p.audio_codec.is_none()),
        (None, Some(_)) => PROFILES
            .iter()
            .find(|p| same_codec(p.audio_codec, &info.audio) && p.video_codec.is_none()),
        (None, None) => None,
    };
    Ok(substitute.unwrap_or(target))
}

fn ffmpeg_args(source: &Path, target: &Path, profile: &EncodeProfile, info: &MediaInfo) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-y", "-nostdin", "-hide_banner", "-i"]
        .iter()
        .map(OsString::from)
        .collect();
    args.push(source.as_os_str().to_owned());

    let mut push = |items: &[&str]| args.extend(items.iter().map(OsString::from));

    match profile.video_codec {
        None => push(&["-vn"]),
        Some(codec) if info.video.as_deref() == Some(codec) => push(&["-c:v", "copy"]),
        Some(_) => {
            push(&["-c:v", profile.video_encoder]);
            push(profile.video_options);
        }
    }
    match profile.audio_codec {
        None => push(&["-an"]),
        Some(codec) if info.audio.as_deref() == Some(codec) => push(&["-c:a", "copy"]),
        Some(_) => {
            push(&["-c:a", profile.audio_encoder]);
            push(profile.audio_options);
        }
    }
    push(&["-f", profile.format, "-progress", "pipe:1", "-nostats"]);

    args.push(target.as_os_str().to_owned());
    args
}

/// Percent done from an `out_time_ms=` progress line (microseconds despite the name).
fn parse_out_time(line: &str, duration_secs: f64) -> Option<u32> {
    let micros: i64 = line.strip_prefix("out_time_ms=")?.trim().parse().ok()?;
    if micros < 0 || duration_secs <= 0.0 {
        return None;
    }
    let percent = (micros as f64 / 1_000_000.0) / duration_secs * 100.0;
    Some(percent.clamp(0.0, 100.0) as u32)
}

/// Encodes with external `ffmpeg`, probing the source with `ffprobe`.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    ffmpeg: String,
    ffprobe: String,
}

impl FfmpegEncoder {
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.tools.ffmpeg, &settings.tools.ffprobe)
    }

    fn probe(&self, path: &Path) -> StageResult<MediaInfo> {
        let mut cmd = Command::new(&self.ffprobe);
        cmd.args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(path);

        let output = match run_captured("ffprobe", &mut cmd) {
            Ok(output) => output,
            Err(StageError::CommandFailed { .. }) => Vec::new(),
            Err(e) => return Err(e),
        };
        parse_probe(&output).ok_or_else(|| StageError::user("The file format could not be recognized"))
    }
}

impl Encoder for FfmpegEncoder {
    fn encode(
        &self,
        ctx: &StageContext<'_>,
        args: &EncodeArgs,
        source: &DownloadOutput,
    ) -> StageResult<EncodeOutput> {
        let requested = EncodeProfile::lookup(&args.encode_key)
            .ok_or_else(|| StageError::user("The target format is invalid."))?;

        let info = self.probe(&source.media_path)?;
        let profile = choose_profile(&info, requested)?;
        if profile.key != requested.key {
            ctx.logger.info(&format!(
                "Using profile '{}' instead of '{}' to keep the source codecs",
                profile.key, requested.key
            ));
        }

        let mut target = source.media_path.clone().into_os_string();
        target.push(".");
        target.push(profile.key);
        let target = PathBuf::from(target);

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.current_dir(ctx.work_dir)
            .args(ffmpeg_args(&source.media_path, &target, profile, &info));

        run_streaming(ctx, "ffmpeg", &mut cmd, |line| {
            if let Some(percent) = info.duration_secs.and_then(|d| parse_out_time(line, d)) {
                ctx.status.set_percent(Some(percent))?;
            }
            Ok(())
        })?;

        if !target.is_file() {
            return Err(StageError::command_failed(
                "ffmpeg",
                0,
                format!("no output written to {}", target.display()),
            ));
        }

        ctx.logger.success(&format!("Encoded {}", target.display()));
        Ok(EncodeOutput {
            encoded_path: target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs;

    use crate::task::context::testing::Harness;

    fn info(video: Option<&str>, audio: Option<&str>) -> MediaInfo {
        MediaInfo {
            video: video.map(str::to_string),
            audio: audio.map(str::to_string),
            duration_secs: Some(10.0),
        }
    }

    fn key(info: &MediaInfo, requested: &str) -> String {
        choose_profile(info, EncodeProfile::lookup(requested).unwrap())
            .unwrap()
            .key
            .to_string()
    }

    #[test]
    fn profile_keys_are_unique() {
        for (i, p) in PROFILES.iter().enumerate() {
            assert!(PROFILES[i + 1..].iter().all(|q| q.key != p.key), "{}", p.key);
        }
        assert!(EncodeProfile::lookup("mp4").is_none());
    }

    #[test]
    fn probe_output_is_parsed() {
        let json = br#"{
            "streams": [
                {"codec_type": "video", "codec_name": "h264"},
                {"codec_type": "audio", "codec_name": "aac"},
                {"codec_type": "audio", "codec_name": "mp3"},
                {"codec_type": "subtitle", "codec_name": "mov_text"}
            ],
            "format": {"duration": "12.500000"}
        }"#;
        let info = parse_probe(json).unwrap();
        assert_eq!(info.video.as_deref(), Some("h264"));
        assert_eq!(info.audio.as_deref(), Some("aac"));
        assert_eq!(info.duration_secs, Some(12.5));

        assert_eq!(parse_probe(br#"{"streams": []}"#), None);
        assert_eq!(parse_probe(b""), None);
    }

    #[test]
    fn codec_preserving_profile_is_preferred() {
        assert_eq!(key(&info(Some("vp9"), Some("opus")), "webm"), "vp9.webm");
        assert_eq!(key(&info(Some("vp9"), Some("opus")), "an.webm"), "an.vp9.webm");
        assert_eq!(key(&info(Some("h264"), Some("opus")), "ogg"), "opus");
        assert_eq!(key(&info(Some("h264"), Some("aac")), "vp9.webm"), "vp9.webm");
    }

    #[test]
    fn missing_tracks_are_user_errors() {
        let webm = EncodeProfile::lookup("webm").unwrap();
        let err = choose_profile(&info(None, Some("aac")), webm).unwrap_err();
        assert_eq!(err.to_string(), "Video is asked to be kept but the file has no video tracks.");

        let err = choose_profile(&info(Some("h264"), None), webm).unwrap_err();
        assert_eq!(err.to_string(), "Audio is asked to be kept but the file has no audio tracks.");

        let err = choose_profile(&info(None, None), webm).unwrap_err();
        assert_eq!(err.to_string(), "The file has no video or audio tracks.");

        let an = EncodeProfile::lookup("an.webm").unwrap();
        assert!(choose_profile(&info(Some("h264"), None), an).is_ok());
    }

    #[test]
    fn matching_streams_are_copied() {
        let profile = EncodeProfile::lookup("vp9.webm").unwrap();
        let args = ffmpeg_args(
            Path::new("dl.webm"),
            Path::new("dl.webm.vp9.webm"),
            profile,
            &info(Some("vp9"), Some("aac")),
        );
        let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        let joined = args.join(" ");
        assert!(joined.contains("-c:v copy"));
        assert!(joined.contains("-c:a libopus"));
        assert!(joined.contains("-f webm -progress pipe:1"));
        assert_eq!(args.last().map(String::as_str), Some("dl.webm.vp9.webm"));
    }

    #[test]
    fn dropped_tracks_use_vn_and_an() {
        let audio_only = ffmpeg_args(
            Path::new("a"),
            Path::new("b"),
            EncodeProfile::lookup("opus").unwrap(),
            &info(Some("h264"), Some("aac")),
        );
        assert!(audio_only.iter().any(|a| a == "-vn"));

        let video_only = ffmpeg_args(
            Path::new("a"),
            Path::new("b"),
            EncodeProfile::lookup("an.ogv").unwrap(),
            &info(Some("h264"), Some("aac")),
        );
        assert!(video_only.iter().any(|a| a == "-an"));
    }

    #[test]
    fn out_time_progress() {
        assert_eq!(parse_out_time("out_time_ms=5000000", 10.0), Some(50));
        assert_eq!(parse_out_time("out_time_ms=20000000", 10.0), Some(100));
        assert_eq!(parse_out_time("out_time_ms=-1", 10.0), None);
        assert_eq!(parse_out_time("frame=12", 10.0), None);
    }

    #[test]
    fn unknown_key_is_rejected_before_probing() {
        let harness = Harness::new();
        let encoder = FfmpegEncoder::new("/nonexistent/ffmpeg", "/nonexistent/ffprobe");
        let source = DownloadOutput {
            media_path: harness.dir.path().join("dl.mp4"),
            subtitles: BTreeMap::new(),
            extractor: None,
        };
        let err = encoder
            .encode(&harness.ctx(), &EncodeArgs { encode_key: "mp4".into() }, &source)
            .unwrap_err();
        assert_eq!(err.to_string(), "The target format is invalid.");
    }

    #[cfg(unix)]
    fn script(dir: &Path, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[test]
    fn encodes_with_external_tools() {
        let harness = Harness::new();
        let tools = tempfile::tempdir().unwrap();
        let ffprobe = script(
            tools.path(),
            "ffprobe",
            r#"echo '{"streams":[{"codec_type":"video","codec_name":"h264"},{"codec_type":"audio","codec_name":"aac"}],"format":{"duration":"4.0"}}'"#,
        );
        let ffmpeg = script(
            tools.path(),
            "ffmpeg",
            "for last; do :; done\nprintf encoded > \"$last\"\necho out_time_ms=2000000\necho progress=end\n",
        );

        let media = harness.dir.path().join("dl.mp4");
        fs::write(&media, b"source").unwrap();
        let source = DownloadOutput {
            media_path: media.clone(),
            subtitles: BTreeMap::new(),
            extractor: None,
        };

        let out = FfmpegEncoder::new(ffmpeg, ffprobe)
            .encode(&harness.ctx(), &EncodeArgs { encode_key: "webm".into() }, &source)
            .unwrap();

        assert_eq!(out.encoded_path, harness.dir.path().join("dl.mp4.webm"));
        assert_eq!(fs::read(&out.encoded_path).unwrap(), b"encoded");
        assert_eq!(harness.status.percent(), Some(50));
    }

    #[cfg(unix)]
    #[test]
    fn unrecognized_source_is_a_user_error() {
        let harness = Harness::new();
        let tools = tempfile::tempdir().unwrap();
        let ffprobe = script(tools.path(), "ffprobe", "exit 1\n");
        let source = DownloadOutput {
            media_path: harness.dir.path().join("dl.bin"),
            subtitles: BTreeMap::new(),
            extractor: None,
        };

        let err = FfmpegEncoder::new("ffmpeg", ffprobe)
            .encode(&harness.ctx(), &EncodeArgs { encode_key: "webm".into() }, &source)
            .unwrap_err();
        assert_eq!(err.to_string(), "The file format could not be recognized");
    }
}
