use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::capability::{Downloader, FetchedMedia, SourceProbe};
use crate::capture;
use crate::error::CallError;
use crate::job::Source;

const UPLOAD_EXTENSIONS: [&str; 5] = ["mp4", "mov", "avi", "mkv", "webm"];

/// Source acquisition: local uploads are copied into scratch, URLs go
/// through the yt-dlp tool.
pub struct YtDlpDownloader {
    program: PathBuf,
}

impl YtDlpDownloader {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, CallError> {
        debug!(?args, "running yt-dlp");
        let output = tokio::process::Command::new(&self.program)
            .args(args)
            .output()
            .await
            .map_err(|err| CallError::Permanent(format!("spawn yt-dlp failed: {err}")))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(30).collect();
        let tail = tail.into_iter().rev().collect::<Vec<_>>().join("\n");
        Err(classify_failure(&tail))
    }
}

impl Default for YtDlpDownloader {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

#[async_trait]
impl Downloader for YtDlpDownloader {
    async fn probe(&self, source: &Source) -> Result<SourceProbe, CallError> {
        match source {
            Source::Upload(path) => {
                check_upload_extension(path)?;
                let meta = std::fs::metadata(path).map_err(|err| {
                    CallError::Permanent(format!("uploaded file unreadable: {err}"))
                })?;
                let duration = probe_duration(path.clone()).await?;
                Ok(SourceProbe {
                    size_bytes: Some(meta.len()),
                    duration_secs: Some(duration),
                })
            }
            Source::Url(url) => {
                let url = normalize_url(url);
                let stdout = self
                    .run(&[
                        "--no-playlist",
                        "--skip-download",
                        "--print",
                        "%(duration)s %(filesize,filesize_approx)s",
                        &url,
                    ])
                    .await?;
                Ok(parse_probe_line(&stdout))
            }
        }
    }

    async fn fetch(&self, source: &Source, dest: &Path) -> Result<FetchedMedia, CallError> {
        let title = match source {
            Source::Upload(path) => {
                check_upload_extension(path)?;
                tokio::fs::copy(path, dest).await.map_err(|err| {
                    CallError::Permanent(format!("copy upload failed: {err}"))
                })?;
                path.file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
            }
            Source::Url(url) => {
                let url = normalize_url(url);
                let dest_arg = dest.to_str().ok_or(CallError::Permanent(
                    "destination path is not valid UTF-8".into(),
                ))?;
                let stdout = self
                    .run(&[
                        "--no-playlist",
                        "--newline",
                        "--no-simulate",
                        "--print",
                        "%(title)s",
                        "-f",
                        "best",
                        "--merge-output-format",
                        "mp4",
                        "-o",
                        dest_arg,
                        &url,
                    ])
                    .await?;
                stdout
                    .lines()
                    .next()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && *line != "NA")
                    .map(str::to_owned)
            }
        };

        let size_bytes = std::fs::metadata(dest)
            .map_err(|err| {
                CallError::Transient(format!("downloaded file missing or unreadable: {err}"))
            })?
            .len();
        let duration_secs = probe_duration(dest.to_path_buf()).await?;
        Ok(FetchedMedia {
            size_bytes,
            duration_secs,
            title,
        })
    }
}

async fn probe_duration(path: PathBuf) -> Result<f64, CallError> {
    tokio::task::spawn_blocking(move || capture::media_duration_secs(&path))
        .await
        .map_err(|err| CallError::Permanent(format!("duration probe aborted: {err}")))?
        .map_err(|err| CallError::Unsupported(format!("not a readable video: {err}")))
}

fn check_upload_extension(path: &Path) -> Result<(), CallError> {
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase());
    match extension.as_deref() {
        Some(ext) if UPLOAD_EXTENSIONS.contains(&ext) => Ok(()),
        other => Err(CallError::Unsupported(format!(
            "upload extension {other:?} is not a supported video format"
        ))),
    }
}

/// Some hosts only resolve under their legacy domain.
fn normalize_url(url: &str) -> String {
    url.replace("https://x.com/", "https://twitter.com/")
        .replace("https://www.x.com/", "https://twitter.com/")
}

fn parse_probe_line(stdout: &str) -> SourceProbe {
    let mut probe = SourceProbe::default();
    let Some(line) = stdout.lines().next() else {
        return probe;
    };
    let mut fields = line.split_whitespace();
    probe.duration_secs = fields.next().and_then(|field| field.parse::<f64>().ok());
    probe.size_bytes = fields.next().and_then(|field| field.parse::<u64>().ok());
    if probe.duration_secs.is_none() && probe.size_bytes.is_none() {
        warn!(line, "probe output carried no usable metadata");
    }
    probe
}

fn classify_failure(stderr_tail: &str) -> CallError {
    let lowered = stderr_tail.to_lowercase();
    if lowered.contains("unsupported url")
        || lowered.contains("no video formats")
        || lowered.contains("requested format is not available")
    {
        return CallError::Unsupported(stderr_tail.to_owned());
    }
    let retryable = [
        "timed out",
        "timeout",
        "connection reset",
        "connection refused",
        "temporary failure",
        "network is unreachable",
        "http error 429",
        "http error 5",
        "unable to download",
    ];
    if retryable.iter().any(|needle| lowered.contains(needle)) {
        CallError::Transient(stderr_tail.to_owned())
    } else {
        CallError::Permanent(stderr_tail.to_owned())
    }
}
