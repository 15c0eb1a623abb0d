use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;

use async_trait::async_trait;
use ffmpeg::util::frame::video::Video;
use ffmpeg::{codec, decoder, format, media, software, Rational};
use ffmpeg_next::{self as ffmpeg};
use image::codecs::jpeg;
use image::ImageBuffer;
use tracing::debug;

use crate::capability::FrameExtractor;
use crate::error::CallError;

static INIT: Once = Once::new();

pub fn init() {
    INIT.call_once(|| {
        ffmpeg::init().unwrap();
    });
}

/// Container duration in seconds, as reported by the demuxer.
pub fn media_duration_secs(path: &Path) -> anyhow::Result<f64> {
    init();
    let input = format::input(&path)?;
    let duration = input.duration();
    if duration <= 0 {
        anyhow::bail!("container reports no duration");
    }
    Ok(duration as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE))
}

struct DecodeSession {
    input: format::context::Input,
    stream_index: usize,
    decoder: decoder::Video,
    scaler: software::scaling::Context,
    time_base: Rational,
}

fn open_session(path: &Path) -> anyhow::Result<DecodeSession> {
    let input = format::input(&path)?;
    let stream = input
        .streams()
        .best(media::Type::Video)
        .ok_or(anyhow::anyhow!(ffmpeg::Error::StreamNotFound))?;
    let stream_index = stream.index();
    let time_base = stream.time_base();

    let decoder = codec::context::Context::from_parameters(stream.parameters())?
        .decoder()
        .video()?;

    let scaler = software::scaling::context::Context::get(
        decoder.format(),
        decoder.width(),
        decoder.height(),
        format::Pixel::RGB24,
        decoder.width(),
        decoder.height(),
        software::scaling::Flags::BILINEAR,
    )?;

    Ok(DecodeSession {
        input,
        stream_index,
        decoder,
        scaler,
        time_base,
    })
}

impl DecodeSession {
    /// Seek to `timestamp` and write the first decoded frame at or after it
    /// as a JPEG.
    fn grab(&mut self, timestamp: f64, dest: &Path) -> anyhow::Result<()> {
        let position = (timestamp * f64::from(ffmpeg::ffi::AV_TIME_BASE)) as i64;
        self.input.seek(position, ..position)?;
        self.decoder.flush();

        let target_pts = (timestamp / f64::from(self.time_base)) as i64;
        let mut decoded = Video::empty();
        for (stream, packet) in self.input.packets() {
            if stream.index() != self.stream_index {
                continue;
            }
            self.decoder.send_packet(&packet)?;
            while self.decoder.receive_frame(&mut decoded).is_ok() {
                let Some(pts) = decoded.pts() else { continue };
                if pts < target_pts {
                    continue;
                }

                let mut rgb_frame = Video::empty();
                self.scaler.run(&decoded, &mut rgb_frame)?;
                let image_buffer = ImageBuffer::<image::Rgb<u8>, _>::from_raw(
                    rgb_frame.width(),
                    rgb_frame.height(),
                    rgb_frame.data(0).to_vec(),
                )
                .ok_or(anyhow::anyhow!("Failed to create image buffer"))?;

                let mut jpeg_data = Vec::new();
                let mut encoder = jpeg::JpegEncoder::new_with_quality(&mut jpeg_data, 90);
                encoder.encode(
                    &image_buffer,
                    image_buffer.width(),
                    image_buffer.height(),
                    image::ExtendedColorType::Rgb8,
                )?;
                fs::write(dest, &jpeg_data)?;
                return Ok(());
            }
        }
        anyhow::bail!("no decodable frame at {timestamp:.2}s")
    }
}

/// One result per requested timestamp; a failed grab poisons only its own
/// entry.
fn extract_frames(
    video: &Path,
    timestamps: &[f64],
    out_dir: &Path,
) -> Vec<anyhow::Result<PathBuf>> {
    init();
    let mut session = match open_session(video) {
        Ok(session) => session,
        Err(err) => {
            return timestamps
                .iter()
                .map(|_| Err(anyhow::anyhow!("open source failed: {err}")))
                .collect();
        }
    };

    timestamps
        .iter()
        .enumerate()
        .map(|(index, &timestamp)| {
            let dest = out_dir.join(format!("frame-{index:04}.jpg"));
            session.grab(timestamp, &dest).map(|()| {
                debug!(timestamp, dest = %dest.display(), "frame captured");
                dest
            })
        })
        .collect()
}

/// In-process frame extraction via libav, moved off the async runtime.
pub struct FfmpegFrameExtractor;

#[async_trait]
impl FrameExtractor for FfmpegFrameExtractor {
    async fn sample(
        &self,
        video: &Path,
        timestamps: &[f64],
        out_dir: &Path,
    ) -> Vec<Result<PathBuf, CallError>> {
        let count = timestamps.len();
        let video = video.to_path_buf();
        let timestamps = timestamps.to_vec();
        let out_dir = out_dir.to_path_buf();
        let joined =
            tokio::task::spawn_blocking(move || extract_frames(&video, &timestamps, &out_dir))
                .await;

        match joined {
            Ok(results) => results
                .into_iter()
                .map(|result| result.map_err(|err| CallError::Permanent(err.to_string())))
                .collect(),
            Err(join_error) => (0..count)
                .map(|_| CallError::Permanent(format!("extraction task aborted: {join_error}")))
                .map(Err)
                .collect(),
        }
    }
}
