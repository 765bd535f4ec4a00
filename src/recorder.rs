mod fifo;

use std::collections::BTreeMap;
use std::ffi::{CString, c_int};
use std::ptr;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use ffmpeg_next::codec::{self, Capabilities, encoder};
use ffmpeg_next::format::context::Output as OutputContext;
use ffmpeg_next::format::{Pixel, Sample};
use ffmpeg_next::software::resampling::Context as SamplerContext;
use ffmpeg_next::software::scaling::context::Context as Scaler;
use ffmpeg_next::software::scaling::flag::Flags;
use ffmpeg_next::util::error::EAGAIN;
use ffmpeg_next::{
    ChannelLayout, Dictionary, Packet, Rational, ffi, format, frame, picture, threading,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use self::fifo::SampleFifo;
use crate::error::{PushError, Result};
use crate::grabber::Frame;
use crate::interrupt::Interrupt;
use crate::negotiation::RecorderSettings;

const DEFAULT_SAMPLE_RATE: u32 = 44_100;
const DEFAULT_H264_PRESET: &str = "veryfast";
/// How long a cancelled recorder may keep blocking on output while it flushes.
const CLOSE_GRACE: Duration = Duration::from_secs(3);

static NUM_CPUS: LazyLock<usize> = LazyLock::new(|| {
    let n = num_cpus::get();
    let num = if n > 16 { 16 } else { n };
    debug!(num, "Detecting CPU cores");
    num
});

struct VideoTrack {
    stream_index: usize,
    encoder: encoder::Video,
    time_base: Rational,
    format: Pixel,
    width: u32,
    height: u32,
    scaler: Option<(Scaler, (Pixel, u32, u32))>,
    next_pts: i64,
}

struct AudioTrack {
    stream_index: usize,
    encoder: encoder::Audio,
    time_base: Rational,
    format: Sample,
    layout: ChannelLayout,
    rate: u32,
    // 0 when the encoder takes any frame size.
    frame_size: usize,
    small_last_frame: bool,
    resampler: Option<(SamplerContext, (Sample, ChannelLayout, u32))>,
    fifo: SampleFifo,
    next_pts: i64,
}

/// Encodes frames and muxes them into the push address.
pub struct Recorder {
    output: OutputContext,
    push_address: String,
    interleaved: bool,
    video: Option<VideoTrack>,
    audio: Option<AudioTrack>,
    closed: bool,
    // Dropped after `output`, which polls it.
    _interrupt: Box<Interrupt>,
}

impl Recorder {
    /// Connects to `push_address` and writes the header. Once `cancel` fires,
    /// output that stays blocked past a short grace period is abandoned.
    pub fn start(
        push_address: &str,
        settings: &RecorderSettings,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let started = Instant::now();
        info!(%push_address, format = settings.format, "Initializing frame recorder");

        let interrupt = Interrupt::new(cancel.clone(), CLOSE_GRACE);
        let mut output = open_output(push_address, settings.format, &interrupt)?;
        let global_header = output
            .format()
            .flags()
            .contains(format::Flags::GLOBAL_HEADER);

        let video = match settings.video_codec {
            Some(id) if settings.width > 0 && settings.height > 0 => Some(open_video_track(
                &mut output,
                settings,
                id,
                global_header,
            )?),
            Some(id) => {
                warn!(codec = ?id, "Source video has no dimensions, dropping video");
                None
            }
            None => None,
        };

        let audio = match settings.audio_codec {
            Some(id) if settings.audio_channels > 0 => Some(open_audio_track(
                &mut output,
                settings,
                id,
                global_header,
            )?),
            Some(id) => {
                warn!(codec = ?id, "Source audio has no channels, dropping audio");
                None
            }
            None => None,
        };

        info!(
            format = settings.format,
            width = settings.width,
            height = settings.height,
            video_codec = settings.video_codec.map(|id| id.name()).unwrap_or("none"),
            video_bitrate = settings.video_bitrate,
            audio_codec = settings.audio_codec.map(|id| id.name()).unwrap_or("none"),
            audio_bitrate = settings.audio_bitrate,
            audio_channels = settings.audio_channels,
            "Recorder parameters"
        );

        output.write_header_with(to_dictionary(&settings.muxer_options))?;

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Frame recorder initialized"
        );

        Ok(Self {
            output,
            push_address: push_address.to_string(),
            interleaved: settings.interleaved,
            video,
            audio,
            closed: false,
            _interrupt: interrupt,
        })
    }

    pub fn record(&mut self, frame: Frame) -> Result<()> {
        if self.closed {
            return Err(PushError::RecorderClosed);
        }
        match frame {
            Frame::Video(frame) => self.record_video(frame),
            Frame::Audio(frame) => self.record_audio(frame),
        }
    }

    /// Flushes the encoders and writes the trailer. Further calls do nothing.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let Recorder {
            output,
            interleaved,
            video,
            audio,
            ..
        } = self;

        if let Some(track) = audio.as_mut() {
            track.flush_resampler();
            while let Some(chunk) = track.next_chunk() {
                track.send(chunk)?;
                drain_packets(
                    &mut track.encoder,
                    track.stream_index,
                    track.time_base,
                    output,
                    *interleaved,
                )?;
            }
            if let Some(rest) = track.fifo.pop_remaining() {
                if track.small_last_frame {
                    track.send(rest)?;
                } else {
                    debug!(samples = rest.samples(), "Dropping trailing audio samples");
                }
            }
            track.encoder.send_eof()?;
            drain_packets(
                &mut track.encoder,
                track.stream_index,
                track.time_base,
                output,
                *interleaved,
            )?;
        }

        if let Some(track) = video.as_mut() {
            track.encoder.send_eof()?;
            drain_packets(
                &mut track.encoder,
                track.stream_index,
                track.time_base,
                output,
                *interleaved,
            )?;
        }

        output.write_trailer()?;
        info!(push_address = %self.push_address, "Frame recorder closed");
        Ok(())
    }

    fn record_video(&mut self, decoded: frame::Video) -> Result<()> {
        let Some(track) = self.video.as_mut() else {
            trace!("No video encoder, dropping frame");
            return Ok(());
        };

        let mut converted = track.convert(decoded)?;
        converted.set_pts(Some(track.next_pts));
        converted.set_kind(picture::Type::None);
        track.next_pts += 1;

        track.encoder.send_frame(&converted)?;
        drain_packets(
            &mut track.encoder,
            track.stream_index,
            track.time_base,
            &mut self.output,
            self.interleaved,
        )?;
        Ok(())
    }

    fn record_audio(&mut self, decoded: frame::Audio) -> Result<()> {
        let Some(track) = self.audio.as_mut() else {
            trace!("No audio encoder, dropping frame");
            return Ok(());
        };

        track.resample(&decoded)?;
        while let Some(chunk) = track.next_chunk() {
            track.send(chunk)?;
            drain_packets(
                &mut track.encoder,
                track.stream_index,
                track.time_base,
                &mut self.output,
                self.interleaved,
            )?;
        }
        Ok(())
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            warn!(push_address = %self.push_address, %error, "Failed to close recorder");
        }
    }
}

impl VideoTrack {
    fn convert(&mut self, decoded: frame::Video) -> Result<frame::Video> {
        let source = (decoded.format(), decoded.width(), decoded.height());
        if source == (self.format, self.width, self.height) {
            return Ok(decoded);
        }

        let rebuild = !matches!(&self.scaler, Some((_, key)) if *key == source);
        if rebuild {
            let target = (self.format, self.width, self.height);
            debug!(?source, ?target, "Creating video scaler");
            let scaler = Scaler::get(
                source.0,
                source.1,
                source.2,
                self.format,
                self.width,
                self.height,
                Flags::BILINEAR,
            )?;
            self.scaler = Some((scaler, source));
        }

        let mut scaled = frame::Video::empty();
        if let Some((scaler, _)) = self.scaler.as_mut() {
            scaler.run(&decoded, &mut scaled)?;
        }
        Ok(scaled)
    }
}

impl AudioTrack {
    fn resample(&mut self, decoded: &frame::Audio) -> Result<()> {
        let mut layout = decoded.channel_layout();
        if layout.is_empty() || layout.channels() != decoded.channels() as i32 {
            layout = ChannelLayout::default(decoded.channels().into());
        }
        let source = (decoded.format(), layout, decoded.rate());
        if source == (self.format, self.layout, self.rate) {
            self.fifo.push(decoded);
            return Ok(());
        }

        let rebuild = !matches!(&self.resampler, Some((_, key)) if *key == source);
        if rebuild {
            debug!(?source, "Creating audio resampler");
            let resampler = SamplerContext::get(
                source.0,
                source.1,
                source.2,
                self.format,
                self.layout,
                self.rate,
            )?;
            self.resampler = Some((resampler, source));
        }

        let capacity = decoded.samples() * self.rate as usize / source.2.max(1) as usize + 256;
        let mut resampled = frame::Audio::new(self.format, capacity, self.layout);
        if let Some((resampler, _)) = self.resampler.as_mut() {
            resampler.run(decoded, &mut resampled)?;
        }
        if resampled.samples() > 0 {
            self.fifo.push(&resampled);
        }
        Ok(())
    }

    fn flush_resampler(&mut self) {
        let Some((resampler, _)) = self.resampler.as_mut() else {
            return;
        };
        loop {
            let mut tail = frame::Audio::new(self.format, 4096, self.layout);
            match resampler.flush(&mut tail) {
                Ok(_) if tail.samples() > 0 => self.fifo.push(&tail),
                Ok(_) => break,
                Err(error) => {
                    warn!(%error, "Audio Resampler: Error during flush");
                    break;
                }
            }
        }
    }

    fn next_chunk(&mut self) -> Option<frame::Audio> {
        match self.frame_size {
            0 => self.fifo.pop_remaining(),
            size => self.fifo.pop(size),
        }
    }

    fn send(&mut self, mut chunk: frame::Audio) -> Result<()> {
        chunk.set_pts(Some(self.next_pts));
        self.next_pts += chunk.samples() as i64;
        self.encoder.send_frame(&chunk)?;
        Ok(())
    }
}

/// Allocates the muxer, opening file I/O only for formats that do their own.
fn open_output(
    push_address: &str,
    format_name: &str,
    interrupt: &Interrupt,
) -> Result<OutputContext> {
    let url = CString::new(push_address)
        .map_err(|_| PushError::UnsupportedSource("push address contains a NUL byte"))?;
    let format = CString::new(format_name)
        .map_err(|_| PushError::UnsupportedSource("format name contains a NUL byte"))?;

    unsafe {
        let mut ctx = ptr::null_mut();
        let ret = ffi::avformat_alloc_output_context2(
            &mut ctx,
            ptr::null(),
            format.as_ptr(),
            url.as_ptr(),
        );
        if ret < 0 || ctx.is_null() {
            return Err(ffmpeg_next::Error::from(ret).into());
        }
        let output = OutputContext::wrap(ctx);
        (*ctx).interrupt_callback = interrupt.callback();

        let no_file = (*(*ctx).oformat).flags as c_int & ffi::AVFMT_NOFILE as c_int != 0;
        if !no_file {
            let ret = ffi::avio_open2(
                &mut (*ctx).pb,
                url.as_ptr(),
                ffi::AVIO_FLAG_WRITE as c_int,
                &(*ctx).interrupt_callback,
                ptr::null_mut(),
            );
            if ret < 0 {
                return Err(ffmpeg_next::Error::from(ret).into());
            }
        }

        (*ctx).max_interleave_delta = 0;
        debug!(format = format_name, no_file, "Output context allocated");
        Ok(output)
    }
}

fn open_video_track(
    output: &mut OutputContext,
    settings: &RecorderSettings,
    id: codec::Id,
    global_header: bool,
) -> Result<VideoTrack> {
    let codec = encoder::find(id).ok_or(PushError::EncoderNotFound(id))?;
    let mut config = codec::Context::new_with_codec(codec).encoder().video()?;

    let pixel_format = choose_pixel_format(codec, settings.pixel_format)?;
    let frame_rate = Rational::new(settings.frame_rate as i32, 1);
    let time_base = frame_rate.invert();

    config.set_width(settings.width);
    config.set_height(settings.height);
    config.set_format(pixel_format);
    config.set_time_base(time_base);
    config.set_frame_rate(Some(frame_rate));
    config.set_gop(settings.gop_size);
    config.set_max_b_frames(0);
    if settings.video_bitrate > 0 {
        config.set_bit_rate(settings.video_bitrate);
    }
    if global_header {
        config.set_flags(codec::Flags::GLOBAL_HEADER);
    }

    let mut threading_config = threading::Config::default();
    threading_config.count = *NUM_CPUS;
    threading_config.kind = threading::Type::Slice;
    config.set_threading(threading_config);

    let mut opts = Dictionary::new();
    if id == codec::Id::H264 {
        opts.set(
            "preset",
            settings.encoder_preset.as_deref().unwrap_or(DEFAULT_H264_PRESET),
        );
        opts.set("tune", "zerolatency");
    }

    let encoder = config.open_with(opts)?;
    debug!(codec = codec.name(), ?pixel_format, "Video encoder opened");

    let mut stream = output.add_stream(codec)?;
    stream.set_parameters(&encoder);
    stream.set_time_base(time_base);

    Ok(VideoTrack {
        stream_index: stream.index(),
        encoder,
        time_base,
        format: pixel_format,
        width: settings.width,
        height: settings.height,
        scaler: None,
        next_pts: 0,
    })
}

fn open_audio_track(
    output: &mut OutputContext,
    settings: &RecorderSettings,
    id: codec::Id,
    global_header: bool,
) -> Result<AudioTrack> {
    let codec = encoder::find(id).ok_or(PushError::EncoderNotFound(id))?;
    let mut config = codec::Context::new_with_codec(codec).encoder().audio()?;

    let audio_codec = codec.audio()?;
    let format = audio_codec
        .formats()
        .and_then(|mut formats| formats.next())
        .unwrap_or(Sample::F32(format::sample::Type::Planar));
    let rate = choose_sample_rate(
        audio_codec.rates().map(|rates| rates.collect::<Vec<_>>()),
        settings.sample_rate,
    );
    let layout = ChannelLayout::default(settings.audio_channels.into());
    let time_base = Rational::new(1, rate as i32);

    config.set_format(format);
    config.set_rate(rate as i32);
    config.set_channel_layout(layout);
    config.set_time_base(time_base);
    if settings.audio_bitrate > 0 {
        config.set_bit_rate(settings.audio_bitrate);
    }
    if global_header {
        config.set_flags(codec::Flags::GLOBAL_HEADER);
    }

    let encoder = config.open_with(Dictionary::new())?;
    let capabilities = codec.capabilities();
    let frame_size = if capabilities.contains(Capabilities::VARIABLE_FRAME_SIZE) {
        0
    } else {
        encoder.frame_size() as usize
    };
    debug!(codec = codec.name(), ?format, rate, frame_size, "Audio encoder opened");

    let mut stream = output.add_stream(codec)?;
    stream.set_parameters(&encoder);
    stream.set_time_base(time_base);

    Ok(AudioTrack {
        stream_index: stream.index(),
        encoder,
        time_base,
        format,
        layout,
        rate,
        frame_size,
        small_last_frame: capabilities.contains(Capabilities::SMALL_LAST_FRAME),
        resampler: None,
        fifo: SampleFifo::new(format, layout, rate),
        next_pts: 0,
    })
}

fn choose_pixel_format(codec: ffmpeg_next::Codec, preferred: Option<Pixel>) -> Result<Pixel> {
    let supported: Vec<Pixel> = codec
        .video()?
        .formats()
        .map(|formats| formats.collect())
        .unwrap_or_default();

    let chosen = match preferred {
        Some(pixel) if supported.is_empty() || supported.contains(&pixel) => pixel,
        _ => supported.first().copied().unwrap_or(Pixel::YUV420P),
    };
    Ok(chosen)
}

/// Source rate when the encoder accepts it, otherwise the closest rate it supports.
fn choose_sample_rate(supported: Option<Vec<i32>>, source_rate: u32) -> u32 {
    let wanted = if source_rate == 0 {
        DEFAULT_SAMPLE_RATE
    } else {
        source_rate
    };
    match supported {
        Some(rates) if !rates.is_empty() && !rates.contains(&(wanted as i32)) => rates
            .into_iter()
            .filter(|rate| *rate > 0)
            .min_by_key(|rate| (i64::from(*rate) - i64::from(wanted)).abs())
            .map(|rate| rate as u32)
            .unwrap_or(wanted),
        _ => wanted,
    }
}

fn to_dictionary(options: &BTreeMap<String, String>) -> Dictionary<'static> {
    let mut dictionary = Dictionary::new();
    for (key, value) in options {
        dictionary.set(key, value);
    }
    dictionary
}

/// Moves every packet the encoder has ready into the muxer.
fn drain_packets(
    encoder: &mut encoder::Encoder,
    stream_index: usize,
    encoder_time_base: Rational,
    output: &mut OutputContext,
    interleaved: bool,
) -> Result<usize> {
    let stream_time_base = output
        .stream(stream_index)
        .map(|stream| stream.time_base())
        .unwrap_or(encoder_time_base);

    let mut written = 0;
    let mut packet = Packet::empty();
    loop {
        match encoder.receive_packet(&mut packet) {
            Ok(()) => {
                packet.set_stream(stream_index);
                packet.rescale_ts(encoder_time_base, stream_time_base);
                if interleaved {
                    packet.write_interleaved(output)?;
                } else {
                    packet.write(output)?;
                }
                written += 1;
            }
            Err(ffmpeg_next::Error::Eof) => return Ok(written),
            Err(ffmpeg_next::Error::Other { errno }) if errno == EAGAIN => return Ok(written),
            Err(error) => return Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_rate_prefers_source() {
        assert_eq!(choose_sample_rate(None, 48_000), 48_000);
        assert_eq!(
            choose_sample_rate(Some(vec![44_100, 48_000]), 48_000),
            48_000
        );
    }

    #[test]
    fn sample_rate_snaps_to_closest_supported() {
        assert_eq!(
            choose_sample_rate(Some(vec![11_025, 22_050, 44_100]), 48_000),
            44_100
        );
        assert_eq!(choose_sample_rate(Some(vec![8_000, 16_000]), 11_025), 8_000);
    }

    #[test]
    fn sample_rate_defaults_when_source_is_silent_about_it() {
        assert_eq!(choose_sample_rate(None, 0), DEFAULT_SAMPLE_RATE);
    }

    #[test]
    fn muxer_options_become_a_dictionary() {
        let mut options = BTreeMap::new();
        options.insert("rtsp_transport".to_string(), "tcp".to_string());
        let dictionary = to_dictionary(&options);
        assert_eq!(dictionary.get("rtsp_transport"), Some("tcp"));
    }
}
