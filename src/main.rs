use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use commentai::capture::{self, FfmpegFrameExtractor};
use commentai::mux::FfmpegMuxer;
use commentai::openai::{OpenAiSpeech, OpenAiText, OpenAiVision};
use commentai::ytdlp::YtDlpDownloader;
use commentai::{
    ArtifactStore, CommentaryStyle, JobConfig, JobManager, JobResult, Language, Orchestrator,
    PipelineConfig, ScriptModel, Services, Source,
};

#[derive(Parser)]
#[command(name = "commentai")]
#[command(about = "Add AI voice-over commentary to a video", long_about = None)]
struct Cli {
    /// Video file or URL to narrate.
    input: String,
    #[arg(short, long, value_enum, default_value_t = CommentaryStyle::Documentary)]
    style: CommentaryStyle,
    #[arg(short, long, value_enum, default_value_t = ScriptModel::Gpt4oMini)]
    model: ScriptModel,
    #[arg(short, long, value_enum, default_value_t = Language::English)]
    language: Language,
    /// Where to put the final video.
    #[arg(short, long, default_value = "commentary.mp4")]
    output: PathBuf,
    /// Root directory for per-job scratch files.
    #[arg(long, default_value = "scratch")]
    scratch_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    capture::init();

    let source = if cli.input.starts_with("http://") || cli.input.starts_with("https://") {
        Source::Url(cli.input.clone())
    } else {
        let path = PathBuf::from(&cli.input);
        if !path.is_file() {
            anyhow::bail!("{} is neither a file nor a URL", cli.input);
        }
        Source::Upload(path)
    };

    let services = Services {
        downloader: Arc::new(YtDlpDownloader::default()),
        frames: Arc::new(FfmpegFrameExtractor),
        vision: Arc::new(OpenAiVision::default()),
        text: Arc::new(OpenAiText),
        speech: Arc::new(OpenAiSpeech),
        muxer: Arc::new(FfmpegMuxer),
    };
    let config = PipelineConfig::default();
    let store = Arc::new(ArtifactStore::new(&cli.scratch_dir, config.max_scratch_bytes));
    let manager = Arc::new(JobManager::new(Orchestrator::new(services, store, config)));

    let id = manager.submit(
        source,
        JobConfig {
            style: cli.style,
            model: cli.model,
            language: cli.language,
        },
    );

    {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("cancelling...");
                manager.cancel(id);
            }
        });
    }

    let mut last_stage = None;
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let status = manager
            .status(id)
            .ok_or(anyhow::anyhow!("job record vanished"))?;
        if last_stage != Some(status.stage) {
            println!("[{:>3.0}%] {}", status.progress * 100.0, status.stage);
            last_stage = Some(status.stage);
        }
        if status.stage.is_terminal() {
            break;
        }
    }

    match manager.result(id) {
        Some(JobResult::Ready(artifact)) => {
            std::fs::copy(&artifact, &cli.output)?;
            println!("{}", cli.output.display());
            Ok(())
        }
        Some(JobResult::Failed { reason }) => anyhow::bail!("{reason}"),
        Some(JobResult::Cancelled) => anyhow::bail!("cancelled"),
        other => anyhow::bail!("unexpected terminal state: {other:?}"),
    }
}
