mod throughput;

pub use throughput::{ThroughputMeter, ThroughputSample};

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::PushOptions;
use crate::error::{PushError, Result};
use crate::grabber::{Grabber, SourceInfo};
use crate::negotiation::negotiate;
use crate::protocol::PushProtocol;
use crate::recorder::Recorder;

/// Outcome of one finished relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub video_frames: u64,
    pub audio_frames: u64,
    pub elapsed: Duration,
    pub cancelled: bool,
}

/// Re-encodes everything the grabber yields into `push_address` until the source
/// ends or `cancel` fires.
pub fn relay(
    mut grabber: Grabber,
    push_address: &str,
    protocol: PushProtocol,
    options: &PushOptions,
    cancel: &CancellationToken,
) -> Result<RelayReport> {
    let info = grabber.info().clone();
    if info.stream_count() < 1 {
        error!(%push_address, "No media streams found in source");
        return Err(PushError::NoMediaStreams);
    }

    log_source(&info, options);

    let settings = negotiate(&info, protocol, options);
    let mut recorder = Recorder::start(push_address, &settings, cancel)?;

    let started = Instant::now();
    info!(%push_address, %protocol, "Start pushing");

    let mut meter = ThroughputMeter::new(settings.frame_rate, started);
    let mut report = RelayReport {
        video_frames: 0,
        audio_frames: 0,
        elapsed: Duration::ZERO,
        cancelled: false,
    };

    loop {
        if cancel.is_cancelled() {
            info!(%push_address, "Relay cancelled");
            report.cancelled = true;
            break;
        }

        let frame = match grabber.grab_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            // The interrupt callback aborts blocked reads once cancelled.
            Err(error) if cancel.is_cancelled() => {
                info!(%push_address, %error, "Relay cancelled while reading");
                report.cancelled = true;
                break;
            }
            Err(error) => return Err(error),
        };

        let is_video = frame.is_video();
        recorder.record(frame)?;
        if is_video {
            report.video_frames += 1;
        } else {
            report.audio_frames += 1;
        }

        if let Some(sample) = meter.record(is_video, Instant::now()) {
            info!(
                frames = sample.frames,
                consumed_ms = sample.consumed.as_millis() as u64,
                second = sample.second,
                average_ms = sample.average.as_millis() as u64,
                "Recorded one second of video"
            );
        }
    }

    report.elapsed = started.elapsed();
    info!(
        %push_address,
        elapsed_secs = report.elapsed.as_secs(),
        video_frames = report.video_frames,
        audio_frames = report.audio_frames,
        "Push finished"
    );

    recorder.close()?;
    grabber.close();
    Ok(report)
}

fn log_source(info: &SourceInfo, options: &PushOptions) {
    let frame_rate = match info.frame_rate() {
        0 => {
            info!(
                default = options.default_frame_rate,
                "Grabber frame rate is 0, using default frame rate"
            );
            options.default_frame_rate
        }
        rate => rate,
    };

    info!(
        frame_rate,
        duration_secs = info.duration_us.max(0) / 1_000_000,
        streams = info.stream_count(),
        "Grabber source"
    );

    for stream in &info.streams {
        info!(
            index = stream.index,
            medium = ?stream.medium,
            codec = ?stream.codec,
            "Grabber stream"
        );
    }

    if let Some(video) = &info.video {
        info!(
            format = %info.format_name,
            width = video.width,
            height = video.height,
            codec = %video.codec_name,
            bit_rate = video.bit_rate,
            frame_rate = video.frame_rate,
            "Grabber video"
        );
    }

    if let Some(audio) = &info.audio {
        info!(
            codec = %audio.codec_name,
            bit_rate = audio.bit_rate,
            channels = audio.channels,
            sample_rate = audio.sample_rate,
            "Grabber audio"
        );
    }
}
