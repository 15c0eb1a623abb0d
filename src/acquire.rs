use tracing::{info, warn};

use crate::capability::{call_with_retries, Downloader, SourceProbe};
use crate::config::{RetryPolicy, SourceLimits};
use crate::error::{CallError, PipelineError};
use crate::job::{JobId, Source};
use crate::store::{ArtifactHandle, ArtifactStore};

/// The locally acquired source video with its measured properties.
#[derive(Debug, Clone)]
pub struct SourceMedia {
    pub handle: ArtifactHandle,
    pub size_bytes: u64,
    pub duration_secs: f64,
    pub title: Option<String>,
}

/// Obtain a local source file, enforcing size/duration limits before the
/// transfer where the provider advertises metadata, and always after.
pub async fn acquire(
    job: JobId,
    source: &Source,
    downloader: &dyn Downloader,
    store: &ArtifactStore,
    limits: &SourceLimits,
    retry: &RetryPolicy,
) -> Result<SourceMedia, PipelineError> {
    match downloader.probe(source).await {
        Ok(probe) => check_probe(&probe, limits)?,
        Err(CallError::Unsupported(reason)) => {
            return Err(PipelineError::UnsupportedFormat(reason));
        }
        Err(error) => {
            // Advisory only; the post-fetch validation still applies.
            warn!(job = %job, %error, "source probe failed, proceeding to fetch");
        }
    }

    let handle = store.allocate(job, "acquiring", "source.mp4")?;
    let fetched = call_with_retries("fetch", retry, || {
        downloader.fetch(source, handle.path())
    })
    .await
    .map_err(|error| match error {
        CallError::Unsupported(reason) => PipelineError::UnsupportedFormat(reason),
        timeout @ CallError::Timeout(_) => PipelineError::Timeout(timeout.to_string()),
        other => PipelineError::AcquisitionFailed(other.to_string()),
    })?;

    // A URL's advertised metadata may be wrong; re-check what actually
    // landed on disk.
    if fetched.size_bytes > limits.max_bytes {
        return Err(PipelineError::SourceTooLarge {
            size: fetched.size_bytes,
            limit: limits.max_bytes,
        });
    }
    if fetched.duration_secs > limits.max_duration_secs {
        return Err(PipelineError::SourceTooLong {
            duration: fetched.duration_secs,
            limit: limits.max_duration_secs,
        });
    }

    info!(
        job = %job,
        size = fetched.size_bytes,
        duration = fetched.duration_secs,
        "source acquired"
    );
    Ok(SourceMedia {
        handle,
        size_bytes: fetched.size_bytes,
        duration_secs: fetched.duration_secs,
        title: fetched.title,
    })
}

fn check_probe(probe: &SourceProbe, limits: &SourceLimits) -> Result<(), PipelineError> {
    if let Some(size) = probe.size_bytes {
        if size > limits.max_bytes {
            return Err(PipelineError::SourceTooLarge {
                size,
                limit: limits.max_bytes,
            });
        }
    }
    if let Some(duration) = probe.duration_secs {
        if duration > limits.max_duration_secs {
            return Err(PipelineError::SourceTooLong {
                duration,
                limit: limits.max_duration_secs,
            });
        }
    }
    Ok(())
}
