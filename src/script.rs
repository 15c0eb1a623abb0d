use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::acquire::SourceMedia;
use crate::analyze::SceneDescription;
use crate::capability::{call_with_retries, CallPool, RawSegment, ScriptRequest, TextGenerator};
use crate::config::{JobConfig, RetryPolicy};
use crate::error::{CallError, PipelineError};
use crate::job::JobId;
use crate::store::ArtifactHandle;

/// One utterance of generated commentary, placed on the output timeline.
/// Segments are non-overlapping and chronologically ordered; `audio` is
/// filled in by the synthesis stage.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub audio: Option<ArtifactHandle>,
}

impl ScriptSegment {
    pub fn window_secs(&self) -> f64 {
        self.end - self.start
    }
}

/// Ask the text-generation service for a timed script, then normalize its
/// output. The service sees the frame timestamps, so segment times anchor to
/// real footage rather than being invented.
pub async fn generate(
    job: JobId,
    scenes: &[SceneDescription],
    media: &SourceMedia,
    config: JobConfig,
    text: Arc<dyn TextGenerator>,
    pool: &CallPool,
    retry: &RetryPolicy,
) -> Result<Vec<ScriptSegment>, PipelineError> {
    let request = ScriptRequest {
        scenes: scenes
            .iter()
            .map(|scene| (scene.timestamp, scene.text.clone()))
            .collect(),
        duration_secs: media.duration_secs,
        title: media.title.clone(),
        config,
    };

    let raw = call_with_retries("script", retry, || {
        let text = Arc::clone(&text);
        let request = &request;
        async move {
            let _permit = pool.acquire().await;
            text.script(request).await
        }
    })
    .await
    .map_err(|error| match error {
        timeout @ CallError::Timeout(_) => PipelineError::Timeout(timeout.to_string()),
        other => PipelineError::ScriptGenerationFailed(other.to_string()),
    })?;

    let received = raw.len();
    let segments = normalize(raw, media.duration_secs);
    if segments.is_empty() {
        return Err(PipelineError::ScriptGenerationFailed(format!(
            "no valid segment survived normalization of {received} returned"
        )));
    }
    if segments.len() < received {
        warn!(
            job = %job,
            received,
            kept = segments.len(),
            "dropped malformed script segments"
        );
    }
    info!(job = %job, segments = segments.len(), "script generated");
    Ok(segments)
}

/// Make the service's output safe to narrate: sort chronologically, clip to
/// the video duration, drop empties, and trim overlaps so every segment owns
/// a disjoint window.
pub fn normalize(raw: Vec<RawSegment>, duration_secs: f64) -> Vec<ScriptSegment> {
    let mut candidates: Vec<RawSegment> = raw
        .into_iter()
        .filter(|segment| {
            segment.start.is_finite()
                && segment.end.is_finite()
                && !segment.text.trim().is_empty()
        })
        .map(|mut segment| {
            segment.start = segment.start.clamp(0.0, duration_secs);
            segment.end = segment.end.clamp(0.0, duration_secs);
            segment
        })
        .filter(|segment| segment.end > segment.start)
        .collect();
    candidates.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut segments: Vec<ScriptSegment> = Vec::with_capacity(candidates.len());
    for mut candidate in candidates {
        if let Some(previous) = segments.last() {
            if candidate.start < previous.end {
                candidate.start = previous.end;
            }
        }
        if candidate.end > candidate.start {
            segments.push(ScriptSegment {
                start: candidate.start,
                end: candidate.end,
                text: candidate.text.trim().to_owned(),
                audio: None,
            });
        }
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(start: f64, end: f64, text: &str) -> RawSegment {
        RawSegment {
            start,
            end,
            text: text.into(),
        }
    }

    fn assert_disjoint_ordered(segments: &[ScriptSegment], duration: f64) {
        for window in segments.windows(2) {
            assert!(window[0].end <= window[1].start, "overlap: {window:?}");
        }
        for segment in segments {
            assert!(segment.start >= 0.0 && segment.end <= duration);
            assert!(segment.end > segment.start);
        }
    }

    #[test]
    fn unordered_output_is_sorted() {
        let segments = normalize(
            vec![raw(20.0, 30.0, "b"), raw(0.0, 10.0, "a"), raw(40.0, 50.0, "c")],
            60.0,
        );
        let texts: Vec<&str> = segments.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, ["a", "b", "c"]);
        assert_disjoint_ordered(&segments, 60.0);
    }

    #[test]
    fn overlaps_are_trimmed_not_dropped() {
        let segments = normalize(vec![raw(0.0, 12.0, "a"), raw(10.0, 20.0, "b")], 30.0);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].start, 12.0);
        assert_disjoint_ordered(&segments, 30.0);
    }

    #[test]
    fn fully_contained_overlap_is_dropped() {
        let segments = normalize(vec![raw(0.0, 20.0, "a"), raw(5.0, 15.0, "b")], 30.0);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "a");
    }

    #[test]
    fn segments_are_clipped_to_duration() {
        let segments = normalize(vec![raw(-5.0, 10.0, "a"), raw(50.0, 90.0, "b")], 60.0);
        assert_eq!(segments[0].start, 0.0);
        assert_eq!(segments[1].end, 60.0);
        assert_disjoint_ordered(&segments, 60.0);
    }

    #[test]
    fn garbage_segments_are_discarded() {
        let segments = normalize(
            vec![
                raw(0.0, 5.0, "   "),
                raw(f64::NAN, 5.0, "nan"),
                raw(10.0, 10.0, "zero width"),
                raw(70.0, 80.0, "out of range"),
                raw(2.0, 8.0, "keep"),
            ],
            60.0,
        );
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "keep");
    }

    #[test]
    fn empty_input_normalizes_to_empty() {
        assert!(normalize(Vec::new(), 60.0).is_empty());
    }
}
