//! End-to-end pipeline runs against scripted stand-ins for the remote
//! services: download, frame extraction, vision, script generation, speech
//! and muxing are all observable and controllable from the test.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use commentai::capability::{
    Downloader, FetchedMedia, FrameExtractor, RawSegment, ScriptRequest, SourceProbe,
    SpeechSynthesizer, TextGenerator, VideoMuxer, VisionAnalyzer,
};
use commentai::config::{RetryPolicy, SamplingPolicy};
use commentai::error::CallError;
use commentai::{
    ArtifactStore, JobConfig, JobManager, JobResult, JobStatus, Language, Orchestrator,
    PipelineConfig, Services, Source, Stage,
};

struct MockDownloader {
    duration_secs: f64,
    size_bytes: u64,
    advertise: bool,
}

#[async_trait]
impl Downloader for MockDownloader {
    async fn probe(&self, _source: &Source) -> Result<SourceProbe, CallError> {
        if self.advertise {
            Ok(SourceProbe {
                size_bytes: Some(self.size_bytes),
                duration_secs: Some(self.duration_secs),
            })
        } else {
            Ok(SourceProbe::default())
        }
    }

    async fn fetch(&self, _source: &Source, dest: &Path) -> Result<FetchedMedia, CallError> {
        std::fs::write(dest, b"video").unwrap();
        Ok(FetchedMedia {
            size_bytes: self.size_bytes,
            duration_secs: self.duration_secs,
            title: Some("test clip".into()),
        })
    }
}

struct MockExtractor {
    calls: AtomicUsize,
}

#[async_trait]
impl FrameExtractor for MockExtractor {
    async fn sample(
        &self,
        _video: &Path,
        timestamps: &[f64],
        out_dir: &Path,
    ) -> Vec<Result<PathBuf, CallError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        timestamps
            .iter()
            .enumerate()
            .map(|(i, _)| {
                let path = out_dir.join(format!("frame-{i:04}.jpg"));
                std::fs::write(&path, b"jpeg").unwrap();
                Ok(path)
            })
            .collect()
    }
}

fn frame_index(image: &Path) -> usize {
    image
        .file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.rsplit('-').next())
        .and_then(|digits| digits.parse().ok())
        .unwrap()
}

struct MockVision {
    fail_indices: HashSet<usize>,
    started: AtomicUsize,
    completed: AtomicUsize,
    gate: Option<Arc<Notify>>,
}

impl MockVision {
    fn plain() -> Self {
        Self {
            fail_indices: HashSet::new(),
            started: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            gate: None,
        }
    }

    fn failing(indices: impl IntoIterator<Item = usize>) -> Self {
        Self {
            fail_indices: indices.into_iter().collect(),
            ..Self::plain()
        }
    }

    fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::plain()
        }
    }
}

#[async_trait]
impl VisionAnalyzer for MockVision {
    async fn describe(&self, image: &Path) -> Result<String, CallError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let index = frame_index(image);
        let result = if self.fail_indices.contains(&index) {
            Err(CallError::Permanent("unreadable frame".into()))
        } else {
            Ok(format!("scene {index}"))
        };
        self.completed.fetch_add(1, Ordering::SeqCst);
        result
    }
}

struct MockText {
    seen: Mutex<Option<ScriptRequest>>,
}

#[async_trait]
impl TextGenerator for MockText {
    async fn script(&self, request: &ScriptRequest) -> Result<Vec<RawSegment>, CallError> {
        *self.seen.lock().unwrap() = Some(request.clone());
        let count = request.scenes.len().max(1);
        let slice = request.duration_secs / count as f64;
        Ok(request
            .scenes
            .iter()
            .enumerate()
            .map(|(i, (_, text))| RawSegment {
                start: i as f64 * slice,
                end: i as f64 * slice + slice * 0.8,
                text: format!("say: {text}"),
            })
            .collect())
    }
}

struct MockSpeech {
    clip_secs: f64,
}

#[async_trait]
impl SpeechSynthesizer for MockSpeech {
    async fn synthesize(
        &self,
        _text: &str,
        _language: Language,
        rate: f64,
        dest: &Path,
    ) -> Result<f64, CallError> {
        std::fs::write(dest, b"mp3").unwrap();
        Ok(self.clip_secs / rate)
    }
}

struct MockMuxer {
    narration: Mutex<Vec<(PathBuf, f64)>>,
}

#[async_trait]
impl VideoMuxer for MockMuxer {
    async fn compose(
        &self,
        _video: &Path,
        narration: &[(PathBuf, f64)],
        dest: &Path,
    ) -> Result<(), CallError> {
        *self.narration.lock().unwrap() = narration.to_vec();
        std::fs::write(dest, b"mp4").unwrap();
        Ok(())
    }
}

struct Fixture {
    downloader: Arc<MockDownloader>,
    extractor: Arc<MockExtractor>,
    vision: Arc<MockVision>,
    text: Arc<MockText>,
    speech: Arc<MockSpeech>,
    muxer: Arc<MockMuxer>,
}

impl Fixture {
    fn new(duration_secs: f64, size_bytes: u64, vision: MockVision) -> Self {
        Self {
            downloader: Arc::new(MockDownloader {
                duration_secs,
                size_bytes,
                advertise: true,
            }),
            extractor: Arc::new(MockExtractor {
                calls: AtomicUsize::new(0),
            }),
            vision: Arc::new(vision),
            text: Arc::new(MockText {
                seen: Mutex::new(None),
            }),
            speech: Arc::new(MockSpeech { clip_secs: 2.0 }),
            muxer: Arc::new(MockMuxer {
                narration: Mutex::new(Vec::new()),
            }),
        }
    }

    fn services(&self) -> Services {
        Services {
            downloader: self.downloader.clone(),
            frames: self.extractor.clone(),
            vision: self.vision.clone(),
            text: self.text.clone(),
            speech: self.speech.clone(),
            muxer: self.muxer.clone(),
        }
    }
}

/// Fast retries, and one frame per minute of footage so the spec's
/// 4-minute/4-frame example maps directly.
fn test_config() -> PipelineConfig {
    let quick = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_secs(5));
    PipelineConfig {
        sampling: SamplingPolicy {
            secs_per_frame: 60.0,
            min_frames: 3,
            max_frames: 16,
            min_coverage: 0.5,
        },
        script_retry: quick,
        acquire_retry: quick,
        compose_retry: quick,
        ..PipelineConfig::default()
    }
}

fn manager_with(fixture: &Fixture, scratch: &Path, config: PipelineConfig) -> JobManager {
    let store = Arc::new(ArtifactStore::new(scratch, config.max_scratch_bytes));
    JobManager::new(Orchestrator::new(fixture.services(), store, config))
}

async fn wait_terminal(manager: &JobManager, id: commentai::JobId) -> JobStatus {
    for _ in 0..600 {
        let status = manager.status(id).expect("job registered");
        if status.stage.is_terminal() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job never reached a terminal state");
}

#[tokio::test]
async fn four_minute_video_with_one_failed_analysis_completes() {
    let scratch = tempfile::tempdir().unwrap();
    // 4 minutes, 30 MB, 4 frames; analysis of frame 2 fails: 75% >= 50%.
    let fixture = Fixture::new(240.0, 30 * 1024 * 1024, MockVision::failing([2]));
    let manager = manager_with(&fixture, scratch.path(), test_config());

    let id = manager.submit(Source::Url("https://example.com/clip".into()), JobConfig::default());
    let status = wait_terminal(&manager, id).await;

    assert_eq!(status.stage, Stage::Done);
    assert_eq!(status.error, None);
    assert_eq!(status.progress, 1.0);

    let artifact = match manager.result(id) {
        Some(JobResult::Ready(path)) => path,
        other => panic!("expected ready result, got {other:?}"),
    };
    assert_eq!(std::fs::read(&artifact).unwrap(), b"mp4");

    // The script stage saw exactly the three surviving descriptions, in order.
    let request = fixture.text.seen.lock().unwrap().clone().unwrap();
    let scenes: Vec<&str> = request.scenes.iter().map(|(_, text)| text.as_str()).collect();
    assert_eq!(scenes, ["scene 0", "scene 1", "scene 3"]);
    assert_eq!(request.duration_secs, 240.0);

    // Narration reached the muxer in segment order, inside the timeline.
    let narration = fixture.muxer.narration.lock().unwrap().clone();
    assert_eq!(narration.len(), 3);
    for window in narration.windows(2) {
        assert!(window[0].1 < window[1].1);
    }
    for (_, start) in &narration {
        assert!(*start >= 0.0 && *start < 240.0);
    }
}

#[tokio::test]
async fn six_minute_source_is_rejected_before_sampling() {
    let scratch = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(360.0, 10 * 1024 * 1024, MockVision::plain());
    let manager = manager_with(&fixture, scratch.path(), test_config());

    let id = manager.submit(Source::Url("https://example.com/long".into()), JobConfig::default());
    let status = wait_terminal(&manager, id).await;

    assert_eq!(status.stage, Stage::Failed);
    let error = status.error.unwrap();
    assert!(error.starts_with("acquiring:"), "{error}");
    assert!(error.contains("too long"), "{error}");
    assert_eq!(fixture.extractor.calls.load(Ordering::SeqCst), 0);
    assert!(matches!(manager.result(id), Some(JobResult::Failed { .. })));

    // Failed jobs purge their scratch immediately.
    assert!(!scratch.path().join(id.to_string()).exists());
}

#[tokio::test]
async fn below_threshold_coverage_fails_with_attribution() {
    let scratch = tempfile::tempdir().unwrap();
    // 3 of 4 analyses fail: 25% < 50%.
    let fixture = Fixture::new(240.0, 1024, MockVision::failing([0, 1, 2]));
    let manager = manager_with(&fixture, scratch.path(), test_config());

    let id = manager.submit(Source::Url("https://example.com/clip".into()), JobConfig::default());
    let status = wait_terminal(&manager, id).await;

    assert_eq!(status.stage, Stage::Failed);
    let error = status.error.unwrap();
    assert!(error.starts_with("analyzing:"), "{error}");
    assert!(error.contains("1 of 4"), "{error}");
    assert!(!scratch.path().join(id.to_string()).exists());
}

#[tokio::test]
async fn cancellation_mid_analysis_lets_in_flight_calls_finish() {
    let scratch = tempfile::tempdir().unwrap();
    let gate = Arc::new(Notify::new());
    let fixture = Fixture::new(240.0, 1024, MockVision::gated(gate.clone()));
    let mut config = test_config();
    // One analysis in flight at a time makes "no new dispatches" observable.
    config.analysis.max_concurrency = 1;
    let manager = manager_with(&fixture, scratch.path(), config);

    let id = manager.submit(Source::Url("https://example.com/clip".into()), JobConfig::default());

    // Wait for the first analysis call to be in flight.
    for _ in 0..600 {
        if fixture.vision.started.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(fixture.vision.started.load(Ordering::SeqCst), 1);

    assert!(manager.cancel(id));
    // Release the in-flight call; it completes rather than being aborted.
    // `notify_one` stores a permit, so the release cannot be lost even if
    // the call has not reached its await yet.
    gate.notify_one();

    let status = wait_terminal(&manager, id).await;
    assert_eq!(status.stage, Stage::Cancelled);
    assert_eq!(manager.result(id), Some(JobResult::Cancelled));

    // The unit that was in flight finished; nothing new was dispatched.
    assert_eq!(fixture.vision.started.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.vision.completed.load(Ordering::SeqCst), 1);

    // Cancelled jobs purge immediately.
    assert!(!scratch.path().join(id.to_string()).exists());

    // Cancelling a terminal job is a no-op.
    assert!(!manager.cancel(id));
}

#[tokio::test]
async fn done_timeline_is_ordered_disjoint_and_spans_the_video() {
    let scratch = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(120.0, 1024, MockVision::plain());
    let manager = manager_with(&fixture, scratch.path(), test_config());

    let id = manager.submit(Source::Url("https://example.com/clip".into()), JobConfig::default());
    let status = wait_terminal(&manager, id).await;
    assert_eq!(status.stage, Stage::Done);

    let request = fixture.text.seen.lock().unwrap().clone().unwrap();
    let count = request.scenes.len();
    let narration = fixture.muxer.narration.lock().unwrap().clone();
    assert_eq!(narration.len(), count);

    // Segment starts reconstruct the generator's even slicing: ordered,
    // disjoint, covering the duration within the mock's slack.
    let slice = 120.0 / count as f64;
    for (i, (_, start)) in narration.iter().enumerate() {
        assert!((start - i as f64 * slice).abs() < 1e-6);
    }
    let last_end = narration.last().unwrap().1 + slice * 0.8;
    assert!(last_end <= 120.0);
    assert!(last_end >= 120.0 * 0.75, "timeline covers most of the video");
}

#[tokio::test]
async fn unknown_job_ids_are_absent_not_errors() {
    let scratch = tempfile::tempdir().unwrap();
    let fixture = Fixture::new(60.0, 1024, MockVision::plain());
    let manager = manager_with(&fixture, scratch.path(), test_config());

    let ghost = commentai::JobId::new();
    assert!(manager.status(ghost).is_none());
    assert!(manager.result(ghost).is_none());
    assert!(!manager.cancel(ghost));
}
