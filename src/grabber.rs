use std::ffi::CString;
use std::io::PipeReader;
#[cfg(unix)]
use std::os::fd::AsRawFd;
use std::ptr;
use std::time::{Duration, Instant};

use ffmpeg_next::codec::{self, decoder};
use ffmpeg_next::format::Pixel;
use ffmpeg_next::format::context::Input as InputContext;
use ffmpeg_next::util::error::EAGAIN;
use ffmpeg_next::{Dictionary, Packet, Rational, ffi, frame, media, threading};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PushOptions;
#[cfg(not(unix))]
use crate::error::PushError;
use crate::error::Result;
use crate::interrupt::Interrupt;

/// Where the grabber reads from.
pub enum Source {
    /// File path or network URL.
    Address(String),
    /// Read end of an OS pipe, opened through FFmpeg's `pipe:<fd>` protocol.
    Pipe(PipeReader),
}

impl Source {
    fn url(&self) -> Result<String> {
        match self {
            Source::Address(address) => Ok(address.clone()),
            #[cfg(unix)]
            Source::Pipe(reader) => Ok(format!("pipe:{}", reader.as_raw_fd())),
            #[cfg(not(unix))]
            Source::Pipe(_) => Err(PushError::UnsupportedSource(
                "pipe sources need unix file descriptors",
            )),
        }
    }
}

/// A decoded frame handed from the grabber to the recorder.
pub enum Frame {
    Video(frame::Video),
    Audio(frame::Audio),
}

impl Frame {
    /// True for picture frames, false for audio samples.
    pub fn is_video(&self) -> bool {
        matches!(self, Frame::Video(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamSummary {
    pub index: usize,
    pub medium: media::Type,
    pub codec: codec::Id,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoSummary {
    pub codec: codec::Id,
    pub codec_name: String,
    pub width: u32,
    pub height: u32,
    pub pixel_format: Pixel,
    pub bit_rate: usize,
    /// Frames per second, 0.0 when the source does not tell.
    pub frame_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioSummary {
    pub codec: codec::Id,
    pub codec_name: String,
    pub bit_rate: usize,
    pub channels: u16,
    pub sample_rate: u32,
}

/// What the grabber learned about its source while opening it.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceInfo {
    pub format_name: String,
    /// Microseconds, not positive for live sources.
    pub duration_us: i64,
    pub streams: Vec<StreamSummary>,
    pub video: Option<VideoSummary>,
    pub audio: Option<AudioSummary>,
}

impl SourceInfo {
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Integer frame rate of the video stream, 0 when unknown.
    pub fn frame_rate(&self) -> u32 {
        self.video
            .as_ref()
            .map(|video| video.frame_rate.max(0.0) as u32)
            .unwrap_or(0)
    }
}

struct DecoderSlot<D> {
    stream_index: usize,
    decoder: D,
}

/// Demuxes and decodes a source into frames.
pub struct Grabber {
    input: InputContext,
    video: Option<DecoderSlot<decoder::Video>>,
    audio: Option<DecoderSlot<decoder::Audio>>,
    info: SourceInfo,
    eof_sent: bool,
    // Dropped after `input`: the context reads the descriptor and polls the interrupt.
    _interrupt: Box<Interrupt>,
    _pipe: Option<PipeReader>,
}

impl Grabber {
    /// Opens `source`. Blocking reads are abandoned once `cancel` fires.
    pub fn open(source: Source, options: &PushOptions, cancel: &CancellationToken) -> Result<Self> {
        let started = Instant::now();
        info!("Initializing frame grabber");

        let url = source.url()?;
        let pipe = match source {
            Source::Pipe(reader) => Some(reader),
            Source::Address(_) => None,
        };

        let interrupt = Interrupt::new(cancel.clone(), Duration::ZERO);
        let input = open_input(&url, input_options(&url, options), &interrupt)?;

        let video = match input.streams().best(media::Type::Video) {
            Some(stream) => {
                let mut context = codec::context::Context::from_parameters(stream.parameters())?;
                let mut threading_config = threading::Config::default();
                threading_config.count = options.decoder_threads;
                context.set_threading(threading_config);
                Some(DecoderSlot {
                    stream_index: stream.index(),
                    decoder: context.decoder().video()?,
                })
            }
            None => None,
        };

        let audio = match input.streams().best(media::Type::Audio) {
            Some(stream) => {
                let context = codec::context::Context::from_parameters(stream.parameters())?;
                Some(DecoderSlot {
                    stream_index: stream.index(),
                    decoder: context.decoder().audio()?,
                })
            }
            None => None,
        };

        let info = describe(&input, video.as_ref(), audio.as_ref());

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Frame grabber initialized"
        );

        Ok(Self {
            input,
            video,
            audio,
            info,
            eof_sent: false,
            _interrupt: interrupt,
            _pipe: pipe,
        })
    }

    pub fn info(&self) -> &SourceInfo {
        &self.info
    }

    /// Next decoded frame, or `None` once the input is exhausted and the decoders are drained.
    pub fn grab_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.receive_decoded() {
                return Ok(Some(frame));
            }
            if self.eof_sent {
                return Ok(None);
            }

            let mut packet = Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => self.decode(&packet),
                Err(ffmpeg_next::Error::Eof) => {
                    debug!("End of input, draining decoders");
                    self.send_eof();
                    self.eof_sent = true;
                }
                Err(ffmpeg_next::Error::Other { errno }) if errno == EAGAIN => continue,
                Err(error) => return Err(error.into()),
            }
        }
    }

    pub fn close(self) {
        debug!(format = %self.info.format_name, "Frame grabber closed");
    }

    fn decode(&mut self, packet: &Packet) {
        let index = packet.stream();
        if let Some(slot) = self.video.as_mut().filter(|slot| slot.stream_index == index) {
            if let Err(error) = slot.decoder.send_packet(packet) {
                warn!(%error, "Video Decoder: Error sending packet, skipping.");
            }
        } else if let Some(slot) = self.audio.as_mut().filter(|slot| slot.stream_index == index) {
            if let Err(error) = slot.decoder.send_packet(packet) {
                warn!(%error, "Audio Decoder: Error sending packet, skipping.");
            }
        }
    }

    fn receive_decoded(&mut self) -> Option<Frame> {
        if let Some(slot) = self.video.as_mut() {
            let mut decoded = frame::Video::empty();
            if received(slot.decoder.receive_frame(&mut decoded), "video") {
                return Some(Frame::Video(decoded));
            }
        }
        if let Some(slot) = self.audio.as_mut() {
            let mut decoded = frame::Audio::empty();
            if received(slot.decoder.receive_frame(&mut decoded), "audio") {
                return Some(Frame::Audio(decoded));
            }
        }
        None
    }

    fn send_eof(&mut self) {
        if let Some(slot) = self.video.as_mut() {
            if let Err(error) = slot.decoder.send_eof() {
                warn!(%error, "Video Decoder: Error sending EOF");
            }
        }
        if let Some(slot) = self.audio.as_mut() {
            if let Err(error) = slot.decoder.send_eof() {
                warn!(%error, "Audio Decoder: Error sending EOF");
            }
        }
    }
}

/// Input options: `stimeout` as configured, plus the same timeout in
/// microseconds for the generic and RTSP socket timeouts.
fn input_options(url: &str, options: &PushOptions) -> Dictionary<'static> {
    let mut dictionary = Dictionary::new();
    dictionary.set("stimeout", &options.socket_timeout);

    if let Ok(millis) = options.socket_timeout.trim().parse::<u64>() {
        let micros = (millis * 1000).to_string();
        dictionary.set("rw_timeout", &micros);
        if url.to_ascii_lowercase().starts_with("rtsp") {
            dictionary.set("timeout", &micros);
        }
    }

    for (key, value) in &options.open_options {
        dictionary.set(key, value);
    }
    dictionary
}

fn open_input(url: &str, options: Dictionary, interrupt: &Interrupt) -> Result<InputContext> {
    let url = CString::new(url).map_err(|_| ffmpeg_next::Error::InvalidData)?;

    unsafe {
        let mut ctx = ffi::avformat_alloc_context();
        if ctx.is_null() {
            return Err(ffmpeg_next::Error::Unknown.into());
        }
        (*ctx).interrupt_callback = interrupt.callback();

        let mut opts = options.disown();
        let ret = ffi::avformat_open_input(&mut ctx, url.as_ptr(), ptr::null(), &mut opts);
        let unused = Dictionary::own(opts);
        if ret < 0 {
            ffi::avformat_close_input(&mut ctx);
            return Err(ffmpeg_next::Error::from(ret).into());
        }
        for (key, _) in unused.iter() {
            debug!(option = key, "Input option not consumed");
        }

        let ret = ffi::avformat_find_stream_info(ctx, ptr::null_mut());
        if ret < 0 {
            ffi::avformat_close_input(&mut ctx);
            return Err(ffmpeg_next::Error::from(ret).into());
        }

        Ok(InputContext::wrap(ctx))
    }
}

/// Whether a frame was received; decode errors skip the frame like bad packets do.
fn received(result: std::result::Result<(), ffmpeg_next::Error>, medium: &str) -> bool {
    match result {
        Ok(()) => true,
        Err(ffmpeg_next::Error::Eof) => false,
        Err(ffmpeg_next::Error::Other { errno }) if errno == EAGAIN => false,
        Err(error) => {
            warn!(%error, medium, "Decoder: Error receiving frame, skipping.");
            false
        }
    }
}

fn is_rational_valid(r: Rational) -> bool {
    r.numerator() > 0 && r.denominator() > 0
}

fn stream_frame_rate(input: &InputContext, index: usize) -> f64 {
    let Some(stream) = input.stream(index) else {
        return 0.0;
    };
    [stream.avg_frame_rate(), stream.rate()]
        .into_iter()
        .find(|rate| is_rational_valid(*rate))
        .map(f64::from)
        .unwrap_or(0.0)
}

fn describe(
    input: &InputContext,
    video: Option<&DecoderSlot<decoder::Video>>,
    audio: Option<&DecoderSlot<decoder::Audio>>,
) -> SourceInfo {
    let streams = input
        .streams()
        .map(|stream| {
            let parameters = stream.parameters();
            StreamSummary {
                index: stream.index(),
                medium: parameters.medium(),
                codec: parameters.id(),
            }
        })
        .collect();

    let video = video.map(|slot| {
        let decoder = &slot.decoder;
        VideoSummary {
            codec: decoder.id(),
            codec_name: decoder.id().name().to_string(),
            width: decoder.width(),
            height: decoder.height(),
            pixel_format: decoder.format(),
            bit_rate: decoder.bit_rate(),
            frame_rate: stream_frame_rate(input, slot.stream_index),
        }
    });

    let audio = audio.map(|slot| {
        let decoder = &slot.decoder;
        AudioSummary {
            codec: decoder.id(),
            codec_name: decoder.id().name().to_string(),
            bit_rate: decoder.bit_rate(),
            channels: decoder.channels(),
            sample_rate: decoder.rate(),
        }
    });

    SourceInfo {
        format_name: input.format().name().to_string(),
        duration_us: input.duration(),
        streams,
        video,
        audio,
    }
}
