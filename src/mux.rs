use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ffmpeg::util::frame::{audio::Audio, video::Video};
use ffmpeg_next::{
    self as ffmpeg, channel_layout, codec, decoder, encoder, filter, format, media, picture,
    Dictionary, Error, Frame, Packet, Rational,
};
use tracing::debug;

use crate::capability::VideoMuxer;
use crate::capture;
use crate::error::CallError;

/// Build the narration overlay graph: every clip is delayed to its segment
/// start, the clips are mixed together, and when the source has its own
/// audio it is ducked underneath. Gaps between clips stay silent via the
/// per-clip delay.
fn narration_filter_spec(
    narration: &[(PathBuf, f64)],
    mix_with_source: bool,
) -> anyhow::Result<String> {
    if narration.is_empty() {
        if mix_with_source {
            return Ok("anull".to_owned());
        }
        anyhow::bail!("no narration clips and no source audio to carry");
    }

    let inputs = narration.len();
    let mut spec = String::new();
    let mut labels = String::new();
    for (i, (path, start)) in narration.iter().enumerate() {
        let path = path
            .to_str()
            .ok_or(anyhow::anyhow!("Invalid narration clip path"))?;
        let delay_ms = (start * 1000.0).round().max(0.0) as i64;
        let label = if !mix_with_source && inputs == 1 {
            "out".to_owned()
        } else {
            format!("nar{i}")
        };
        write!(
            spec,
            "amovie={path},adelay={delay_ms}:all=1,volume=1.2[{label}]; "
        )?;
        write!(labels, "[{label}]")?;
    }

    if mix_with_source {
        if inputs == 1 {
            write!(
                spec,
                "[in]volume=0.8[base]; [base][nar0]amix=inputs=2:duration=first[out]"
            )?;
        } else {
            write!(
                spec,
                "{labels}amix=inputs={inputs}:normalize=0[mix]; \
                 [in]volume=0.8[base]; [base][mix]amix=inputs=2:duration=first[out]"
            )?;
        }
    } else if inputs > 1 {
        write!(spec, "{labels}amix=inputs={inputs}:normalize=0[out]")?;
    } else {
        // Single clip, no source audio: the chain already ends at [out].
        spec.truncate(spec.trim_end().trim_end_matches(';').len());
    }
    Ok(spec)
}

enum FrameWrapper<'a> {
    Video(&'a Video),
    Audio(&'a Audio),
}

impl FrameWrapper<'_> {
    fn as_video(&self) -> anyhow::Result<&Video> {
        match self {
            &FrameWrapper::Video(frame) => Ok(frame),
            _ => Err(anyhow::anyhow!("Frame is not a video frame")),
        }
    }

    fn as_audio(&self) -> anyhow::Result<&Audio> {
        match self {
            &FrameWrapper::Audio(frame) => Ok(frame),
            _ => Err(anyhow::anyhow!("Frame is not an audio frame")),
        }
    }
}

trait Transcoder {
    fn output_stream_index(&self) -> usize;

    fn flush_filter_graph(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn receive_and_process_filtered_frames(
        &mut self,
        _output: &mut format::context::Output,
        _output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn send_packet_to_decoder(&mut self, packet: &Packet) -> anyhow::Result<()>;

    fn send_eof_to_decoder(&mut self) -> anyhow::Result<()>;

    fn receive_and_process_decoded_frames(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()>;

    fn send_frame_to_encoder(&mut self, frame_wrapper: FrameWrapper) -> anyhow::Result<()>;

    fn send_eof_to_encoder(&mut self) -> anyhow::Result<()>;

    fn receive_and_process_encoded_packets(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()>;
}

struct VideoTranscoder {
    output_stream_index: usize,
    decoder: decoder::Video,
    encoder: encoder::Video,
    input_time_base: Rational,
}

impl VideoTranscoder {
    fn new(
        input_stream: &format::stream::Stream,
        output: &mut format::context::Output,
        output_stream_index: usize,
    ) -> anyhow::Result<Self> {
        let global_header = output
            .format()
            .flags()
            .contains(format::Flags::GLOBAL_HEADER);
        let codec_params = input_stream.parameters();
        let decoder = codec::context::Context::from_parameters(codec_params)?
            .decoder()
            .video()?;

        let codec = encoder::find(codec::Id::H264);
        let mut output_stream = output.add_stream(codec)?;
        let mut encoder = codec::context::Context::new_with_codec(
            codec.ok_or(anyhow::anyhow!(Error::InvalidData))?,
        )
        .encoder()
        .video()?;
        encoder.set_height(decoder.height());
        encoder.set_width(decoder.width());
        encoder.set_aspect_ratio(decoder.aspect_ratio());
        encoder.set_format(decoder.format());
        encoder.set_frame_rate(decoder.frame_rate());
        encoder.set_time_base(input_stream.time_base());
        output_stream.set_parameters(&encoder);

        if global_header {
            encoder.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let mut opts = Dictionary::new();
        opts.set("preset", "medium");

        let opened_encoder = encoder.open_with(opts)?;
        output_stream.set_parameters(&opened_encoder);

        Ok(Self {
            output_stream_index,
            decoder,
            encoder: opened_encoder,
            input_time_base: input_stream.time_base(),
        })
    }
}

impl Transcoder for VideoTranscoder {
    fn output_stream_index(&self) -> usize {
        self.output_stream_index
    }

    fn send_packet_to_decoder(&mut self, packet: &Packet) -> anyhow::Result<()> {
        self.decoder
            .send_packet(packet)
            .map_err(anyhow::Error::from)
    }

    fn send_eof_to_decoder(&mut self) -> anyhow::Result<()> {
        self.decoder.send_eof().map_err(anyhow::Error::from)
    }

    fn receive_and_process_decoded_frames(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        let mut frame = Video::empty();
        while self.decoder.receive_frame(&mut frame).is_ok() {
            let timestamp = frame.timestamp().ok_or(anyhow::anyhow!("No timestamp"))?;
            frame.set_pts(Some(timestamp));
            frame.set_kind(picture::Type::None);
            self.send_frame_to_encoder(FrameWrapper::Video(&frame))?;
            self.receive_and_process_encoded_packets(output, output_stream_time_base)?;
        }
        Ok(())
    }

    fn send_frame_to_encoder(&mut self, frame_wrapper: FrameWrapper) -> anyhow::Result<()> {
        self.encoder
            .send_frame(frame_wrapper.as_video()?)
            .map_err(anyhow::Error::from)
    }

    fn send_eof_to_encoder(&mut self) -> anyhow::Result<()> {
        self.encoder.send_eof().map_err(anyhow::Error::from)
    }

    fn receive_and_process_encoded_packets(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        let mut packet = Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.output_stream_index);
            packet.rescale_ts(self.input_time_base, output_stream_time_base);
            packet.write_interleaved(output)?;
        }
        Ok(())
    }
}

struct AudioTranscoder {
    output_stream_index: usize,
    decoder: decoder::Audio,
    encoder: encoder::Audio,
    filter_graph: filter::Graph,
    input_time_base: Rational,
}

impl AudioTranscoder {
    fn new(
        input_stream: &format::stream::Stream,
        output: &mut format::context::Output,
        output_stream_index: usize,
        filter_spec: &str,
    ) -> anyhow::Result<Self> {
        let global_header = output
            .format()
            .flags()
            .contains(format::Flags::GLOBAL_HEADER);
        let codec_params = input_stream.parameters();
        let mut decoder = codec::context::Context::from_parameters(codec_params)?
            .decoder()
            .audio()?;

        if global_header {
            decoder.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let codec = encoder::find(codec::Id::AAC)
            .ok_or(anyhow::anyhow!(Error::EncoderNotFound))?
            .audio()?;
        let mut output_stream = output.add_stream(codec)?;
        let context = codec::context::Context::from_parameters(output_stream.parameters())?;
        let mut encoder = context.encoder().audio()?;

        if global_header {
            encoder.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let channel_layout = codec
            .channel_layouts()
            .map(|layouts| layouts.best(decoder.channel_layout().channels()))
            .unwrap_or(channel_layout::ChannelLayout::STEREO);

        encoder.set_channel_layout(channel_layout);
        encoder.set_rate(decoder.rate() as _);
        encoder.set_format(
            codec
                .formats()
                .ok_or(anyhow::anyhow!("Unknown supported formats"))?
                .next()
                .ok_or(anyhow::anyhow!("Failed to get sample format"))?,
        );
        encoder.set_bit_rate(decoder.bit_rate());
        encoder.set_max_bit_rate(decoder.max_bit_rate());
        encoder.set_time_base(decoder.time_base());
        output_stream.set_time_base(decoder.time_base());

        let opened_encoder = encoder.open_as(codec)?;
        output_stream.set_parameters(&opened_encoder);

        let filter_graph = Self::filter_graph(filter_spec, &decoder, &opened_encoder)?;

        Ok(Self {
            output_stream_index,
            decoder,
            encoder: opened_encoder,
            filter_graph,
            input_time_base: input_stream.time_base(),
        })
    }

    fn filter_graph(
        spec: &str,
        decoder: &codec::decoder::Audio,
        encoder: &codec::encoder::Audio,
    ) -> anyhow::Result<filter::Graph> {
        let mut filter_graph = filter::Graph::new();

        let args = format!(
            "time_base={}:sample_rate={}:sample_fmt={}:channel_layout=0x{:x}",
            decoder.time_base(),
            decoder.rate(),
            decoder.format().name(),
            decoder.channel_layout().bits()
        );

        filter_graph.add(
            &filter::find("abuffer").ok_or(anyhow::anyhow!("Failed to find filter"))?,
            "in",
            &args,
        )?;
        filter_graph.add(
            &filter::find("abuffersink").ok_or(anyhow::anyhow!("Failed to find filter"))?,
            "out",
            "",
        )?;

        {
            let mut out = filter_graph
                .get("out")
                .ok_or(anyhow::anyhow!("Failed to get filter"))?;
            out.set_sample_format(encoder.format());
            out.set_channel_layout(encoder.channel_layout());
            out.set_sample_rate(encoder.rate());
        }

        filter_graph.output("in", 0)?.input("out", 0)?.parse(spec)?;
        filter_graph.validate()?;

        debug!(graph = %filter_graph.dump(), "audio filter graph");

        if let Some(codec) = encoder.codec() {
            if !codec
                .capabilities()
                .contains(ffmpeg::codec::capabilities::Capabilities::VARIABLE_FRAME_SIZE)
            {
                filter_graph
                    .get("out")
                    .ok_or(anyhow::anyhow!("Failed to get filter"))?
                    .sink()
                    .set_frame_size(encoder.frame_size());
            }
        }

        Ok(filter_graph)
    }

    fn add_frame_to_filter_graph(&mut self, frame: &Frame) -> anyhow::Result<()> {
        self.filter_graph
            .get("in")
            .ok_or(anyhow::anyhow!("Failed to get filter"))?
            .source()
            .add(frame)
            .map_err(|e| anyhow::anyhow!(e))
    }
}

impl Transcoder for AudioTranscoder {
    fn output_stream_index(&self) -> usize {
        self.output_stream_index
    }

    fn flush_filter_graph(&mut self) -> anyhow::Result<()> {
        self.filter_graph
            .get("in")
            .ok_or(anyhow::anyhow!("Failed to get filter"))?
            .source()
            .flush()
            .map_err(|e| anyhow::anyhow!(e))
    }

    fn receive_and_process_filtered_frames(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        let mut frame = Audio::empty();
        while self
            .filter_graph
            .get("out")
            .ok_or(anyhow::anyhow!("Failed to get filter"))?
            .sink()
            .frame(&mut frame)
            .is_ok()
        {
            self.send_frame_to_encoder(FrameWrapper::Audio(&frame))?;
            self.receive_and_process_encoded_packets(output, output_stream_time_base)?;
        }
        Ok(())
    }

    fn send_packet_to_decoder(&mut self, packet: &Packet) -> anyhow::Result<()> {
        self.decoder
            .send_packet(packet)
            .map_err(anyhow::Error::from)
    }

    fn send_eof_to_decoder(&mut self) -> anyhow::Result<()> {
        self.decoder.send_eof().map_err(anyhow::Error::from)
    }

    fn receive_and_process_decoded_frames(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        let mut frame = Audio::empty();
        while self.decoder.receive_frame(&mut frame).is_ok() {
            let timestamp = frame.timestamp().ok_or(anyhow::anyhow!("No timestamp"))?;
            frame.set_pts(Some(timestamp));
            self.add_frame_to_filter_graph(&frame)?;
            self.receive_and_process_filtered_frames(output, output_stream_time_base)?;
        }
        Ok(())
    }

    fn send_frame_to_encoder(&mut self, frame_wrapper: FrameWrapper) -> anyhow::Result<()> {
        self.encoder
            .send_frame(frame_wrapper.as_audio()?)
            .map_err(anyhow::Error::from)
    }

    fn send_eof_to_encoder(&mut self) -> anyhow::Result<()> {
        self.encoder.send_eof().map_err(anyhow::Error::from)
    }

    fn receive_and_process_encoded_packets(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        let mut packet = Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.output_stream_index);
            packet.rescale_ts(self.input_time_base, output_stream_time_base);
            packet.write_interleaved(output)?;
        }
        Ok(())
    }
}

/// Synthesized narration as a brand-new audio stream, for sources that have
/// no audio track of their own. The amovie sources drive the graph, so the
/// sink is simply drained after the video packets are through.
struct NarrationTrack {
    output_stream_index: usize,
    encoder: encoder::Audio,
    filter_graph: filter::Graph,
    time_base: Rational,
}

impl NarrationTrack {
    fn new(
        output: &mut format::context::Output,
        output_stream_index: usize,
        filter_spec: &str,
    ) -> anyhow::Result<Self> {
        let global_header = output
            .format()
            .flags()
            .contains(format::Flags::GLOBAL_HEADER);
        let codec = encoder::find(codec::Id::AAC)
            .ok_or(anyhow::anyhow!(Error::EncoderNotFound))?
            .audio()?;
        let mut output_stream = output.add_stream(codec)?;
        let context = codec::context::Context::from_parameters(output_stream.parameters())?;
        let mut encoder = context.encoder().audio()?;

        if global_header {
            encoder.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let channel_layout = codec
            .channel_layouts()
            .map(|layouts| layouts.best(2))
            .unwrap_or(channel_layout::ChannelLayout::STEREO);
        let time_base = Rational(1, 44100);

        encoder.set_channel_layout(channel_layout);
        encoder.set_rate(44100);
        encoder.set_format(
            codec
                .formats()
                .ok_or(anyhow::anyhow!("Unknown supported formats"))?
                .next()
                .ok_or(anyhow::anyhow!("Failed to get sample format"))?,
        );
        encoder.set_bit_rate(128_000);
        encoder.set_time_base(time_base);
        output_stream.set_time_base(time_base);

        let opened_encoder = encoder.open_as(codec)?;
        output_stream.set_parameters(&opened_encoder);

        let mut filter_graph = filter::Graph::new();
        filter_graph.add(
            &filter::find("abuffersink").ok_or(anyhow::anyhow!("Failed to find filter"))?,
            "out",
            "",
        )?;
        {
            let mut out = filter_graph
                .get("out")
                .ok_or(anyhow::anyhow!("Failed to get filter"))?;
            out.set_sample_format(opened_encoder.format());
            out.set_channel_layout(opened_encoder.channel_layout());
            out.set_sample_rate(opened_encoder.rate());
        }
        filter_graph.input("out", 0)?.parse(filter_spec)?;
        filter_graph.validate()?;

        debug!(graph = %filter_graph.dump(), "narration filter graph");

        if let Some(codec) = opened_encoder.codec() {
            if !codec
                .capabilities()
                .contains(ffmpeg::codec::capabilities::Capabilities::VARIABLE_FRAME_SIZE)
            {
                filter_graph
                    .get("out")
                    .ok_or(anyhow::anyhow!("Failed to get filter"))?
                    .sink()
                    .set_frame_size(opened_encoder.frame_size());
            }
        }

        Ok(Self {
            output_stream_index,
            encoder: opened_encoder,
            filter_graph,
            time_base,
        })
    }

    fn drain(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        let mut frame = Audio::empty();
        loop {
            let pulled = self
                .filter_graph
                .get("out")
                .ok_or(anyhow::anyhow!("Failed to get filter"))?
                .sink()
                .frame(&mut frame);
            if pulled.is_err() {
                break;
            }
            self.encoder.send_frame(&frame)?;
            self.write_packets(output, output_stream_time_base)?;
        }
        self.encoder.send_eof()?;
        self.write_packets(output, output_stream_time_base)?;
        Ok(())
    }

    fn write_packets(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        let mut packet = Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.output_stream_index);
            packet.rescale_ts(self.time_base, output_stream_time_base);
            packet.write_interleaved(output)?;
        }
        Ok(())
    }
}

fn compose_sync(
    input_path: &Path,
    narration: &[(PathBuf, f64)],
    output_path: &Path,
) -> anyhow::Result<()> {
    capture::init();
    let mut input = format::input(&input_path)?;
    let mut output = format::output(&output_path)?;
    let mut transcoders: HashMap<i32, Box<dyn Transcoder>> = HashMap::new();

    let has_source_audio = input.streams().best(media::Type::Audio).is_some();
    let narration_spec = narration_filter_spec(narration, has_source_audio)?;
    debug!(spec = %narration_spec, "narration overlay spec");

    let stream_count = input.nb_streams() as usize;
    let mut stream_mapping = vec![0_i32; stream_count];
    let mut input_stream_time_base = vec![Rational(0, 0); stream_count];
    let mut output_stream_time_base = vec![Rational(0, 0); stream_count + 1];
    let mut output_stream_index = 0;
    for (ist_index, ist) in input.streams().enumerate() {
        let ist_medium = ist.parameters().medium();
        if ist_medium != media::Type::Audio
            && ist_medium != media::Type::Video
            && ist_medium != media::Type::Subtitle
        {
            stream_mapping[ist_index] = -1;
            continue;
        }
        stream_mapping[ist_index] = output_stream_index;
        input_stream_time_base[ist_index] = ist.time_base();
        if ist_medium == media::Type::Video {
            let transcoder = Box::new(VideoTranscoder::new(
                &ist,
                &mut output,
                output_stream_index as _,
            )?);
            transcoders.insert(ist_index as i32, transcoder);
        } else if ist_medium == media::Type::Audio {
            let transcoder = Box::new(AudioTranscoder::new(
                &ist,
                &mut output,
                output_stream_index as _,
                narration_spec.as_str(),
            )?);
            transcoders.insert(ist_index as i32, transcoder);
        }
        output_stream_index += 1;
    }

    let mut narration_track = if has_source_audio {
        None
    } else {
        let track = NarrationTrack::new(&mut output, output_stream_index as usize, &narration_spec)?;
        Some(track)
    };

    output.set_metadata(input.metadata().to_owned());
    output.write_header()?;

    for (ost_index, _) in output.streams().enumerate() {
        output_stream_time_base[ost_index] = output
            .stream(ost_index)
            .ok_or(anyhow::anyhow!(Error::StreamNotFound))?
            .time_base();
    }

    for (ist, mut packet) in input.packets() {
        let ist_index = ist.index();
        let ost_index = stream_mapping[ist_index];
        if ost_index < 0 {
            continue;
        }
        let ost_time_base = output_stream_time_base[ost_index as usize];
        match transcoders.get_mut(&(ist_index as i32)) {
            Some(transcoder) => {
                transcoder.send_packet_to_decoder(&packet)?;
                transcoder.receive_and_process_decoded_frames(&mut output, ost_time_base)?;
            }
            None => {
                packet.rescale_ts(input_stream_time_base[ist_index], ost_time_base);
                packet.write_interleaved(&mut output)?;
            }
        }
    }

    for transcoder in transcoders.values_mut() {
        let ost_time_base = output_stream_time_base[transcoder.output_stream_index()];
        transcoder.send_eof_to_decoder()?;
        transcoder.receive_and_process_decoded_frames(&mut output, ost_time_base)?;
        transcoder.flush_filter_graph()?;
        transcoder.receive_and_process_filtered_frames(&mut output, ost_time_base)?;
        transcoder.send_eof_to_encoder()?;
        transcoder.receive_and_process_encoded_packets(&mut output, ost_time_base)?;
    }

    if let Some(track) = narration_track.as_mut() {
        let ost_time_base = output_stream_time_base[track.output_stream_index];
        track.drain(&mut output, ost_time_base)?;
    }

    output.write_trailer()?;

    Ok(())
}

/// Final composition through libav, off the async runtime. Failures are
/// classified transient so the composer's small retry budget applies.
pub struct FfmpegMuxer;

#[async_trait]
impl VideoMuxer for FfmpegMuxer {
    async fn compose(
        &self,
        video: &Path,
        narration: &[(PathBuf, f64)],
        dest: &Path,
    ) -> Result<(), CallError> {
        let video = video.to_path_buf();
        let narration = narration.to_vec();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || compose_sync(&video, &narration, &dest))
            .await
            .map_err(|err| CallError::Permanent(format!("mux task aborted: {err}")))?
            .map_err(|err| CallError::Transient(err.to_string()))
    }
}
