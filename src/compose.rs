use std::path::PathBuf;

use tracing::info;

use crate::acquire::SourceMedia;
use crate::capability::{call_with_retries, VideoMuxer};
use crate::config::RetryPolicy;
use crate::error::{CallError, PipelineError};
use crate::job::JobId;
use crate::script::ScriptSegment;
use crate::store::{ArtifactHandle, ArtifactStore};

/// Mux the source video with the ordered narration clips into the final
/// output. The single irreversible external-tool invocation of the
/// pipeline: a couple of attempts for transient encoder errors, then fatal.
pub async fn compose(
    job: JobId,
    media: &SourceMedia,
    segments: &[ScriptSegment],
    muxer: &dyn VideoMuxer,
    store: &ArtifactStore,
    retry: &RetryPolicy,
) -> Result<ArtifactHandle, PipelineError> {
    let mut narration: Vec<(PathBuf, f64)> = Vec::with_capacity(segments.len());
    for (index, segment) in segments.iter().enumerate() {
        let audio = segment.audio.as_ref().ok_or_else(|| {
            PipelineError::CompositionFailed(format!("segment {index} has no narration clip"))
        })?;
        narration.push((audio.path().to_path_buf(), segment.start));
    }

    let output = store.allocate(job, "composing", "final.mp4")?;
    call_with_retries("compose", retry, || {
        muxer.compose(media.handle.path(), &narration, output.path())
    })
    .await
    .map_err(|error| match error {
        timeout @ CallError::Timeout(_) => PipelineError::Timeout(timeout.to_string()),
        other => PipelineError::CompositionFailed(other.to_string()),
    })?;

    info!(job = %job, output = %output.path().display(), "final video composed");
    Ok(output)
}
