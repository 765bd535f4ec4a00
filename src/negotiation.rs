use std::collections::BTreeMap;

use ffmpeg_next::codec;
use ffmpeg_next::format::Pixel;

use crate::config::PushOptions;
use crate::grabber::SourceInfo;
use crate::protocol::PushProtocol;

/// Everything the recorder needs to know before it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct RecorderSettings {
    pub format: &'static str,
    pub width: u32,
    pub height: u32,
    /// Pixel format of the source, kept when the encoder accepts it.
    pub pixel_format: Option<Pixel>,
    pub audio_channels: u16,
    pub sample_rate: u32,
    pub video_codec: Option<codec::Id>,
    pub audio_codec: Option<codec::Id>,
    pub frame_rate: u32,
    pub video_bitrate: usize,
    pub audio_bitrate: usize,
    pub gop_size: u32,
    pub interleaved: bool,
    pub encoder_preset: Option<String>,
    /// Private muxer options applied when the header is written.
    pub muxer_options: BTreeMap<String, String>,
}

/// Audio codecs the FLV container can carry without re-encoding to AAC.
fn flv_accepts_audio(id: codec::Id) -> bool {
    matches!(id, codec::Id::AAC | codec::Id::MP3)
}

/// Picks the output parameters for pushing `info` over `protocol`.
pub fn negotiate(
    info: &SourceInfo,
    protocol: PushProtocol,
    options: &PushOptions,
) -> RecorderSettings {
    let frame_rate = match info.frame_rate() {
        0 => options.default_frame_rate,
        rate => rate,
    };

    let gop_size = match options.gop_size {
        0 => frame_rate * 2,
        size => size,
    };

    let source_video = info.video.as_ref().map(|video| video.codec);
    let source_audio = info.audio.as_ref().map(|audio| audio.codec);

    let (video_codec, audio_codec) = match protocol {
        PushProtocol::Rtsp => (source_video, source_audio.map(|_| codec::Id::AAC)),
        // FLV only carries H.264 here.
        PushProtocol::Rtmp => (
            source_video.map(|_| codec::Id::H264),
            source_audio.map(|id| if flv_accepts_audio(id) { id } else { codec::Id::AAC }),
        ),
    };

    let mut muxer_options = BTreeMap::new();
    if let (PushProtocol::Rtsp, Some(transport)) = (protocol, &options.rtsp_transport) {
        muxer_options.insert("rtsp_transport".to_string(), transport.clone());
    }

    RecorderSettings {
        format: protocol.format_name(),
        width: info.video.as_ref().map(|v| v.width).unwrap_or(0),
        height: info.video.as_ref().map(|v| v.height).unwrap_or(0),
        pixel_format: info.video.as_ref().map(|v| v.pixel_format),
        audio_channels: info.audio.as_ref().map(|a| a.channels).unwrap_or(0),
        sample_rate: info.audio.as_ref().map(|a| a.sample_rate).unwrap_or(0),
        video_codec,
        audio_codec,
        frame_rate,
        video_bitrate: info.video.as_ref().map(|v| v.bit_rate).unwrap_or(0),
        audio_bitrate: options.audio_bitrate,
        gop_size,
        interleaved: true,
        encoder_preset: options.encoder_preset.clone(),
        muxer_options,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grabber::{AudioSummary, VideoSummary};

    fn source(video: codec::Id, audio: Option<codec::Id>, frame_rate: f64) -> SourceInfo {
        SourceInfo {
            format_name: "mov,mp4,m4a,3gp,3g2,mj2".to_string(),
            duration_us: 10_000_000,
            streams: Vec::new(),
            video: Some(VideoSummary {
                codec: video,
                codec_name: video.name().to_string(),
                width: 1920,
                height: 1080,
                pixel_format: Pixel::YUV420P,
                bit_rate: 4_000_000,
                frame_rate,
            }),
            audio: audio.map(|codec| AudioSummary {
                codec,
                codec_name: codec.name().to_string(),
                bit_rate: 0,
                channels: 2,
                sample_rate: 48_000,
            }),
        }
    }

    #[test]
    fn rtsp_keeps_source_video_codec() {
        let info = source(codec::Id::HEVC, Some(codec::Id::OPUS), 25.0);
        let settings = negotiate(&info, PushProtocol::Rtsp, &PushOptions::default());

        assert_eq!(settings.format, "rtsp");
        assert_eq!(settings.video_codec, Some(codec::Id::HEVC));
        assert_eq!(settings.audio_codec, Some(codec::Id::AAC));
        assert_eq!(settings.frame_rate, 25);
        assert_eq!(settings.width, 1920);
        assert_eq!(settings.height, 1080);
        assert!(settings.interleaved);
    }

    #[test]
    fn rtmp_forces_h264_into_flv() {
        let info = source(codec::Id::HEVC, Some(codec::Id::AAC), 30.0);
        let settings = negotiate(&info, PushProtocol::Rtmp, &PushOptions::default());

        assert_eq!(settings.format, "flv");
        assert_eq!(settings.video_codec, Some(codec::Id::H264));
        assert_eq!(settings.audio_codec, Some(codec::Id::AAC));
    }

    #[test]
    fn rtmp_keeps_flv_compatible_audio_and_replaces_the_rest() {
        let info = source(codec::Id::H264, Some(codec::Id::MP3), 30.0);
        let settings = negotiate(&info, PushProtocol::Rtmp, &PushOptions::default());
        assert_eq!(settings.video_codec, Some(codec::Id::H264));
        assert_eq!(settings.audio_codec, Some(codec::Id::MP3));

        let info = source(codec::Id::H264, Some(codec::Id::OPUS), 30.0);
        let settings = negotiate(&info, PushProtocol::Rtmp, &PushOptions::default());
        assert_eq!(settings.audio_codec, Some(codec::Id::AAC));
    }

    #[test]
    fn unknown_frame_rate_falls_back_to_default() {
        let info = source(codec::Id::H264, None, 0.0);
        let options = PushOptions {
            default_frame_rate: 30,
            ..Default::default()
        };
        let settings = negotiate(&info, PushProtocol::Rtmp, &options);

        assert_eq!(settings.frame_rate, 30);
        assert_eq!(settings.audio_codec, None);
        assert_eq!(settings.audio_channels, 0);
    }

    #[test]
    fn gop_size_is_configured_or_two_seconds() {
        let info = source(codec::Id::H264, None, 25.0);

        let settings = negotiate(&info, PushProtocol::Rtsp, &PushOptions::default());
        assert_eq!(settings.gop_size, 3);

        let options = PushOptions {
            gop_size: 0,
            ..Default::default()
        };
        let settings = negotiate(&info, PushProtocol::Rtsp, &options);
        assert_eq!(settings.gop_size, 50);
    }

    #[test]
    fn bitrates_follow_source_video_and_configured_audio() {
        let info = source(codec::Id::H264, Some(codec::Id::AAC), 25.0);
        let settings = negotiate(&info, PushProtocol::Rtmp, &PushOptions::default());
        assert_eq!(settings.video_bitrate, 4_000_000);
        assert_eq!(settings.audio_bitrate, 0);

        let options = PushOptions {
            audio_bitrate: 128_000,
            ..Default::default()
        };
        let settings = negotiate(&info, PushProtocol::Rtmp, &options);
        assert_eq!(settings.audio_bitrate, 128_000);
        assert_eq!(settings.sample_rate, 48_000);
        assert_eq!(settings.audio_channels, 2);
    }

    #[test]
    fn rtsp_transport_only_applies_to_rtsp() {
        let info = source(codec::Id::H264, None, 25.0);
        let options = PushOptions {
            rtsp_transport: Some("tcp".to_string()),
            ..Default::default()
        };

        let settings = negotiate(&info, PushProtocol::Rtsp, &options);
        assert_eq!(
            settings.muxer_options.get("rtsp_transport").map(String::as_str),
            Some("tcp")
        );

        let settings = negotiate(&info, PushProtocol::Rtmp, &options);
        assert!(settings.muxer_options.is_empty());
    }
}
