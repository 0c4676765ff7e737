//! Wrappers around the two external binaries RingPing drives: yt-dlp for
//! metadata and section extraction, ffmpeg for the optional precise cut.
//!
//! Both are treated as black boxes. We only look at the exit status, stdout
//! and whatever file they leave behind. Every invocation is bounded by a
//! timeout and the child is killed when the future is dropped.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::{ExitStatus, Output, Stdio},
    time::Duration,
};

use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;
use url::Url;

use crate::store::{AudioFormat, AudioQuality};

const STDERR_TAIL_BYTES: usize = 2048;
const UNKNOWN: &str = "Unknown";

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to launch {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} timed out after {}s", .timeout.as_secs())]
    Timeout {
        tool: &'static str,
        timeout: Duration,
    },
    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: &'static str,
        status: ExitStatus,
        stderr: String,
    },
    #[error("{tool} left no usable output at {}", .path.display())]
    EmptyOutput { tool: &'static str, path: PathBuf },
}

/// Metadata shown to the user before they pick a time range.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfo {
    pub title: String,
    pub duration: u64,
    pub uploader: String,
    pub thumbnail: Option<String>,
}

/// One section-extraction job for yt-dlp.
#[derive(Debug, Clone)]
pub struct SectionDownload<'a> {
    pub url: &'a Url,
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub format: AudioFormat,
    pub quality: AudioQuality,
    /// Output path without extension; yt-dlp appends the real one.
    pub output_stem: &'a Path,
}

#[derive(Debug, Clone)]
pub struct Downloader {
    binary: PathBuf,
    info_timeout: Duration,
    download_timeout: Duration,
}

impl Downloader {
    pub const NAME: &'static str = "yt-dlp";

    pub fn new(binary: impl Into<PathBuf>, info_timeout: Duration, download_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            info_timeout,
            download_timeout,
        }
    }

    /// Runs yt-dlp without downloading anything and reads back title,
    /// duration, uploader and thumbnail.
    pub async fn fetch_info(&self, url: &Url) -> Result<VideoInfo, ToolError> {
        let mut command = Command::new(&self.binary);
        command.args(info_args(url));
        let output = run_tool(Self::NAME, command, self.info_timeout).await?;
        Ok(parse_info_output(&String::from_utf8_lossy(&output.stdout)))
    }

    pub async fn download_section(&self, job: &SectionDownload<'_>) -> Result<(), ToolError> {
        let mut command = Command::new(&self.binary);
        command.args(section_args(job));
        run_tool(Self::NAME, command, self.download_timeout).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Transcoder {
    binary: PathBuf,
    timeout: Duration,
}

impl Transcoder {
    pub const NAME: &'static str = "ffmpeg";

    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Copies `duration` seconds of `input`, starting `offset` seconds in,
    /// into `output` without re-encoding.
    pub async fn trim(
        &self,
        input: &Path,
        output: &Path,
        offset: f64,
        duration: f64,
    ) -> Result<(), ToolError> {
        let mut command = Command::new(&self.binary);
        command.args(trim_args(input, output, offset, duration));
        run_tool(Self::NAME, command, self.timeout).await?;
        Ok(())
    }
}

fn info_args(url: &Url) -> Vec<OsString> {
    [
        "--skip-download",
        "--no-playlist",
        "--no-warnings",
        "--print",
        "title",
        "--print",
        "duration",
        "--print",
        "uploader",
        "--print",
        "thumbnail",
        "--",
        url.as_str(),
    ]
    .into_iter()
    .map(OsString::from)
    .collect()
}

pub fn section_args(job: &SectionDownload<'_>) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "--extract-audio",
        "--audio-format",
        job.format.as_str(),
        "--audio-quality",
        job.quality.bitrate(),
    ]
    .into_iter()
    .map(OsString::from)
    .collect();
    args.push("--download-sections".into());
    args.push(section_range(job.start_seconds, job.end_seconds).into());
    for flag in [
        "--force-keyframes-at-cuts",
        "--force-overwrites",
        "--no-playlist",
        "--no-warnings",
        "--no-progress",
        "--output",
    ] {
        args.push(flag.into());
    }
    args.push(output_template(job.output_stem));
    args.push("--".into());
    args.push(job.url.as_str().into());
    args
}

pub fn trim_args(input: &Path, output: &Path, offset: f64, duration: f64) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-y", "-loglevel", "error", "-ss"]
        .into_iter()
        .map(OsString::from)
        .collect();
    args.push(offset.to_string().into());
    args.push("-i".into());
    args.push(input.as_os_str().to_owned());
    args.push("-t".into());
    args.push(duration.to_string().into());
    args.push("-c".into());
    args.push("copy".into());
    args.push(output.as_os_str().to_owned());
    args
}

/// `*START-END` in seconds, the yt-dlp syntax for a time-range section.
fn section_range(start: f64, end: f64) -> String {
    format!("*{start}-{end}")
}

/// yt-dlp treats `%` in `--output` as a template marker, so user-chosen
/// names get theirs doubled before `.%(ext)s` is appended.
fn output_template(stem: &Path) -> OsString {
    let file_name = stem
        .file_name()
        .map(|name| name.to_string_lossy().replace('%', "%%"))
        .unwrap_or_default();
    let mut template = stem.with_file_name(file_name).into_os_string();
    template.push(".%(ext)s");
    template
}

/// Maps the four `--print` lines to a [`VideoInfo`]; yt-dlp prints `NA` for
/// fields the extractor could not provide.
pub fn parse_info_output(stdout: &str) -> VideoInfo {
    let mut lines = stdout.lines().map(|line| {
        let trimmed = line.trim();
        (!trimmed.is_empty() && trimmed != "NA").then(|| trimmed.to_string())
    });
    let title = lines.next().flatten();
    let duration = lines.next().flatten();
    let uploader = lines.next().flatten();
    let thumbnail = lines.next().flatten();

    VideoInfo {
        title: title.unwrap_or_else(|| UNKNOWN.to_string()),
        duration: duration
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(|secs| secs.floor() as u64)
            .unwrap_or(0),
        uploader: uploader.unwrap_or_else(|| UNKNOWN.to_string()),
        thumbnail,
    }
}

async fn run_tool(
    tool: &'static str,
    mut command: Command,
    timeout: Duration,
) -> Result<Output, ToolError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    debug!(tool, command = ?command.as_std(), "running external tool");

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| ToolError::Timeout { tool, timeout })?
        .map_err(|source| ToolError::Spawn { tool, source })?;

    if !output.status.success() {
        return Err(ToolError::Failed {
            tool,
            status: output.status,
            stderr: stderr_tail(&output.stderr),
        });
    }
    Ok(output)
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_TAIL_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
