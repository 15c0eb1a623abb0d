use tracing::{info, warn};

use crate::acquire::SourceMedia;
use crate::capability::FrameExtractor;
use crate::config::SamplingPolicy;
use crate::error::PipelineError;
use crate::job::JobId;
use crate::store::{ArtifactHandle, ArtifactStore};

/// One sampled still image. `sequence_index` is dense (no gaps) and
/// monotonic with `timestamp`, so downstream stages can reconstruct order
/// without re-sorting.
#[derive(Debug, Clone)]
pub struct Frame {
    pub timestamp: f64,
    pub sequence_index: usize,
    pub image: ArtifactHandle,
}

/// Evenly spaced timestamps, one per slice of the duration, centered so the
/// first and last frames do not land on the container edges. Count scales
/// with duration and is capped to bound downstream API cost.
pub fn plan_timestamps(duration_secs: f64, policy: &SamplingPolicy) -> Vec<f64> {
    let wanted = (duration_secs / policy.secs_per_frame).ceil() as usize;
    let count = wanted.clamp(policy.min_frames, policy.max_frames).max(1);
    (0..count)
        .map(|i| (i as f64 + 0.5) * duration_secs / count as f64)
        .collect()
}

/// Extract sampled frames in one batched extractor pass. Individual
/// timestamp failures are tolerated up to the coverage policy; survivors are
/// re-indexed densely in timestamp order.
pub async fn sample(
    job: JobId,
    media: &SourceMedia,
    extractor: &dyn FrameExtractor,
    store: &ArtifactStore,
    policy: &SamplingPolicy,
) -> Result<Vec<Frame>, PipelineError> {
    let timestamps = plan_timestamps(media.duration_secs, policy);
    let out_dir = store.stage_dir(job, "sampling")?;
    let results = extractor
        .sample(media.handle.path(), &timestamps, &out_dir)
        .await;

    let total = timestamps.len();
    let mut frames = Vec::with_capacity(total);
    for (i, timestamp) in timestamps.iter().enumerate() {
        match results.get(i) {
            Some(Ok(path)) => {
                let image = store.adopt(job, path.clone())?;
                frames.push(Frame {
                    timestamp: *timestamp,
                    // Densified below once the failures are known.
                    sequence_index: 0,
                    image,
                });
            }
            Some(Err(error)) => {
                warn!(job = %job, timestamp, %error, "frame extraction failed");
            }
            None => {
                warn!(job = %job, timestamp, "extractor returned no result for timestamp");
            }
        }
    }

    if (frames.len() as f32) < policy.min_coverage * total as f32 {
        return Err(PipelineError::CoverageBelowThreshold {
            succeeded: frames.len(),
            total,
            required: policy.min_coverage,
        });
    }

    for (index, frame) in frames.iter_mut().enumerate() {
        frame.sequence_index = index;
    }

    info!(job = %job, frames = frames.len(), total, "frames sampled");
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SamplingPolicy {
        SamplingPolicy {
            secs_per_frame: 10.0,
            min_frames: 3,
            max_frames: 16,
            min_coverage: 0.5,
        }
    }

    #[test]
    fn timestamp_count_scales_with_duration() {
        assert_eq!(plan_timestamps(5.0, &policy()).len(), 3);
        assert_eq!(plan_timestamps(60.0, &policy()).len(), 6);
        assert_eq!(plan_timestamps(240.0, &policy()).len(), 16);
        assert_eq!(plan_timestamps(3600.0, &policy()).len(), 16);
    }

    #[test]
    fn timestamps_are_evenly_spaced_and_in_range() {
        let duration = 120.0;
        let stamps = plan_timestamps(duration, &policy());
        let step = duration / stamps.len() as f64;
        for (i, window) in stamps.windows(2).enumerate() {
            let gap = window[1] - window[0];
            assert!((gap - step).abs() < 1e-9, "uneven gap at {i}: {gap}");
        }
        assert!(stamps.first().copied().unwrap() > 0.0);
        assert!(stamps.last().copied().unwrap() < duration);
    }

    #[test]
    fn timestamps_are_strictly_increasing() {
        let stamps = plan_timestamps(95.0, &policy());
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }

    use std::collections::HashSet;
    use std::path::{Path, PathBuf};

    use async_trait::async_trait;

    use crate::error::CallError;

    struct PartialExtractor {
        fail_indices: HashSet<usize>,
    }

    #[async_trait]
    impl FrameExtractor for PartialExtractor {
        async fn sample(
            &self,
            _video: &Path,
            timestamps: &[f64],
            out_dir: &Path,
        ) -> Vec<Result<PathBuf, CallError>> {
            timestamps
                .iter()
                .enumerate()
                .map(|(i, _)| {
                    if self.fail_indices.contains(&i) {
                        Err(CallError::Permanent("decode error".into()))
                    } else {
                        let path = out_dir.join(format!("frame-{i:04}.jpg"));
                        std::fs::write(&path, b"jpeg").unwrap();
                        Ok(path)
                    }
                })
                .collect()
        }
    }

    fn media(store: &ArtifactStore, job: JobId, duration_secs: f64) -> SourceMedia {
        let handle = store.allocate(job, "acquiring", "source.mp4").unwrap();
        SourceMedia {
            handle,
            size_bytes: 1024,
            duration_secs,
            title: None,
        }
    }

    #[tokio::test]
    async fn surviving_frames_are_dense_and_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), u64::MAX);
        let job = JobId::new();
        // 40s at 10s per frame: 4 timestamps, the second one fails.
        let extractor = PartialExtractor {
            fail_indices: [1].into_iter().collect(),
        };
        let frames = sample(job, &media(&store, job, 40.0), &extractor, &store, &policy())
            .await
            .unwrap();

        assert_eq!(frames.len(), 3);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.sequence_index, i);
        }
        assert!(frames.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn exactly_half_extraction_coverage_proceeds() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), u64::MAX);
        let job = JobId::new();
        let extractor = PartialExtractor {
            fail_indices: [0, 2].into_iter().collect(),
        };
        let frames = sample(job, &media(&store, job, 40.0), &extractor, &store, &policy())
            .await
            .unwrap();
        assert_eq!(frames.len(), 2);
    }

    #[tokio::test]
    async fn below_half_extraction_coverage_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), u64::MAX);
        let job = JobId::new();
        let extractor = PartialExtractor {
            fail_indices: [0, 1, 2].into_iter().collect(),
        };
        let error = sample(job, &media(&store, job, 40.0), &extractor, &store, &policy())
            .await
            .unwrap_err();
        assert!(
            matches!(
                error,
                PipelineError::CoverageBelowThreshold {
                    succeeded: 1,
                    total: 4,
                    ..
                }
            ),
            "{error:?}"
        );
    }
}
