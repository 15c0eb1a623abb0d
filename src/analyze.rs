use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::capability::{call_with_retries, CallPool, VisionAnalyzer};
use crate::config::AnalysisPolicy;
use crate::error::PipelineError;
use crate::job::{CancelFlag, JobId, StageProgress};
use crate::sample::Frame;

/// Natural-language description of one sampled frame. Carries the frame's
/// index and timestamp as a back-reference; the frame artifact itself stays
/// owned by the job record.
#[derive(Debug, Clone, Serialize)]
pub struct SceneDescription {
    pub sequence_index: usize,
    pub timestamp: f64,
    pub text: String,
}

/// A frame whose analysis did not survive its retry budget.
#[derive(Debug, Clone, Serialize)]
pub struct SceneFailure {
    pub sequence_index: usize,
    pub timestamp: f64,
    pub reason: String,
}

/// Everything the analyzer learned, successes and omissions both, so the
/// partial-coverage outcome stays diagnosable.
#[derive(Debug, Serialize)]
pub struct SceneAnalysis {
    pub described: Vec<SceneDescription>,
    pub failed: Vec<SceneFailure>,
}

/// Describe every frame concurrently, bounded by the stage's own limit and
/// the process-wide call pool, then fan back in by `sequence_index` —
/// completion order never leaks into the output order.
pub async fn analyze(
    job: JobId,
    frames: &[Frame],
    vision: Arc<dyn VisionAnalyzer>,
    pool: &CallPool,
    policy: &AnalysisPolicy,
    cancel: &CancelFlag,
    progress: &StageProgress,
) -> Result<SceneAnalysis, PipelineError> {
    let total = frames.len();
    let local = Arc::new(Semaphore::new(policy.max_concurrency.max(1)));
    let mut tasks: JoinSet<(usize, Option<Result<String, crate::error::CallError>>)> =
        JoinSet::new();

    for frame in frames {
        let index = frame.sequence_index;
        let image = frame.image.path().to_path_buf();
        let vision = Arc::clone(&vision);
        let local = Arc::clone(&local);
        let pool = pool.clone();
        let cancel = cancel.clone();
        let retry = policy.retry;
        tasks.spawn(async move {
            let _slot = local
                .acquire_owned()
                .await
                .expect("analysis semaphore closed");
            // Dispatch check: a unit that has not started its remote call
            // yet is dropped on cancellation; in-flight calls run on.
            if cancel.is_cancelled() {
                return (index, None);
            }
            let _permit = pool.acquire().await;
            if cancel.is_cancelled() {
                return (index, None);
            }
            let outcome =
                call_with_retries("describe", &retry, || vision.describe(&image)).await;
            (index, Some(outcome))
        });
    }

    let mut slots: Vec<Option<Result<String, String>>> = (0..total).map(|_| None).collect();
    let mut settled = 0usize;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, Some(Ok(text)))) => slots[index] = Some(Ok(text)),
            Ok((index, Some(Err(error)))) => {
                warn!(job = %job, index, %error, "scene analysis failed for frame");
                slots[index] = Some(Err(error.to_string()));
            }
            Ok((_, None)) => {}
            Err(join_error) => {
                warn!(job = %job, %join_error, "scene analysis task aborted");
            }
        }
        settled += 1;
        progress.completed(settled, total);
    }

    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }

    let mut analysis = SceneAnalysis {
        described: Vec::with_capacity(total),
        failed: Vec::new(),
    };
    for (frame, slot) in frames.iter().zip(slots) {
        match slot {
            Some(Ok(text)) => analysis.described.push(SceneDescription {
                sequence_index: frame.sequence_index,
                timestamp: frame.timestamp,
                text,
            }),
            Some(Err(reason)) => analysis.failed.push(SceneFailure {
                sequence_index: frame.sequence_index,
                timestamp: frame.timestamp,
                reason,
            }),
            None => analysis.failed.push(SceneFailure {
                sequence_index: frame.sequence_index,
                timestamp: frame.timestamp,
                reason: "no result".into(),
            }),
        }
    }

    let succeeded = analysis.described.len();
    if (succeeded as f32) < policy.min_coverage * total as f32 {
        return Err(PipelineError::CoverageBelowThreshold {
            succeeded,
            total,
            required: policy.min_coverage,
        });
    }
    if !analysis.failed.is_empty() {
        warn!(
            job = %job,
            failed = analysis.failed.len(),
            total,
            "proceeding with partial scene coverage"
        );
    }
    info!(job = %job, described = succeeded, total, "scene analysis complete");
    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::config::{JobConfig, RetryPolicy};
    use crate::error::CallError;
    use crate::job::{Job, Source, Stage};
    use crate::store::ArtifactStore;

    struct ScrambledVision;

    #[async_trait]
    impl VisionAnalyzer for ScrambledVision {
        async fn describe(&self, image: &Path) -> Result<String, CallError> {
            // Later frames finish first, inverting completion order.
            let index: usize = image
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.rsplit('-').next())
                .and_then(|s| s.parse().ok())
                .unwrap();
            tokio::time::sleep(Duration::from_millis(((9 - index) * 10) as u64)).await;
            Ok(format!("scene {index}"))
        }
    }

    struct FailEven {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl VisionAnalyzer for FailEven {
        async fn describe(&self, image: &Path) -> Result<String, CallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let index: usize = image
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.rsplit('-').next())
                .and_then(|s| s.parse().ok())
                .unwrap();
            if index % 2 == 0 {
                Err(CallError::Permanent("malformed image".into()))
            } else {
                Ok(format!("scene {index}"))
            }
        }
    }

    fn fixture(count: usize) -> (tempfile::TempDir, JobId, Vec<Frame>, StageProgress) {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path(), u64::MAX);
        let job = JobId::new();
        let frames = (0..count)
            .map(|i| {
                let handle = store.allocate(job, "sampling", &format!("{i}.jpg")).unwrap();
                // File stem ends in "-<i>": "<seq>-<i>.jpg" minus extension.
                Frame {
                    timestamp: i as f64 * 10.0,
                    sequence_index: i,
                    image: handle,
                }
            })
            .collect();
        let shared: crate::job::SharedJob = Arc::new(std::sync::RwLock::new(Job::new(
            Source::Upload(dir.path().join("v.mp4")),
            JobConfig::default(),
        )));
        let progress = StageProgress::new(shared, Stage::Analyzing);
        (dir, job, frames, progress)
    }

    fn quick_policy(min_coverage: f32) -> AnalysisPolicy {
        AnalysisPolicy {
            max_concurrency: 4,
            min_coverage,
            retry: RetryPolicy::new(1, Duration::from_millis(1), Duration::from_secs(5)),
        }
    }

    #[tokio::test]
    async fn output_order_survives_scrambled_completion() {
        let (_guard, job, frames, progress) = fixture(10);
        let analysis = analyze(
            job,
            &frames,
            Arc::new(ScrambledVision),
            &CallPool::new(16),
            &quick_policy(0.5),
            &CancelFlag::new(),
            &progress,
        )
        .await
        .unwrap();

        let indices: Vec<usize> = analysis
            .described
            .iter()
            .map(|d| d.sequence_index)
            .collect();
        assert_eq!(indices, (0..10).collect::<Vec<_>>());
        for description in &analysis.described {
            assert_eq!(description.text, format!("scene {}", description.sequence_index));
        }
    }

    #[tokio::test]
    async fn exactly_half_coverage_proceeds() {
        let (_guard, job, frames, progress) = fixture(4);
        let vision = Arc::new(FailEven {
            calls: AtomicUsize::new(0),
        });
        let analysis = analyze(
            job,
            &frames,
            vision.clone(),
            &CallPool::new(16),
            &quick_policy(0.5),
            &CancelFlag::new(),
            &progress,
        )
        .await
        .unwrap();
        assert_eq!(analysis.described.len(), 2);
        assert_eq!(analysis.failed.len(), 2);
        // Permanent failures burn exactly one attempt each.
        assert_eq!(vision.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn below_half_coverage_fails_with_fractions() {
        let (_guard, job, frames, progress) = fixture(3);
        let error = analyze(
            job,
            &frames,
            Arc::new(FailEven {
                calls: AtomicUsize::new(0),
            }),
            &CallPool::new(16),
            &quick_policy(0.5),
            &CancelFlag::new(),
            &progress,
        )
        .await
        .unwrap_err();
        assert!(
            matches!(
                error,
                PipelineError::CoverageBelowThreshold {
                    succeeded: 1,
                    total: 3,
                    ..
                }
            ),
            "{error:?}"
        );
    }

    #[tokio::test]
    async fn cancellation_stops_new_dispatches() {
        let (_guard, job, frames, progress) = fixture(8);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let vision = Arc::new(FailEven {
            calls: AtomicUsize::new(0),
        });
        let error = analyze(
            job,
            &frames,
            vision.clone(),
            &CallPool::new(16),
            &quick_policy(0.5),
            &cancel,
            &progress,
        )
        .await
        .unwrap_err();
        assert!(matches!(error, PipelineError::Cancelled));
        assert_eq!(vision.calls.load(Ordering::SeqCst), 0);
    }
}
