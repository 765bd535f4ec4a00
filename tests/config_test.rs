use std::io::Write;

use clap::Parser;
use tempfile::NamedTempFile;
use video_push::{Config, PushProtocol};

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(content.as_bytes()).expect("write config");
    file
}

#[test]
fn file_config_fills_defaults() {
    let file = write_config(
        r#"
source = "/data/sample.mp4"
push_address = "rtmp://127.0.0.1/live/demo"
gop_size = 12
"#,
    );

    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.source.as_deref(), Some("/data/sample.mp4"));
    assert_eq!(config.gop_size, 12);
    assert_eq!(config.default_frame_rate, 30);
    assert_eq!(config.socket_timeout, "5000");
    assert_eq!(config.chunk_size, 4096);
    assert!(config.open_options.is_empty());
    config.validate().unwrap();
}

#[test]
fn cli_values_win_over_file_values() {
    let file = write_config(
        r#"
source = "/data/from-file.mp4"
push_address = "rtsp://127.0.0.1/file"
gop_size = 10
audio_bitrate = 96000
rtsp_transport = "tcp"

[open_options]
probesize = "32768"
"#,
    );

    let cli = Config::parse_from([
        "video-push",
        "--source",
        "/data/from-cli.mp4",
        "--gop-size",
        "25",
    ]);
    let config = cli.merge_with_file(Config::from_file(file.path()).unwrap());

    assert_eq!(config.source.as_deref(), Some("/data/from-cli.mp4"));
    assert_eq!(config.push_address.as_deref(), Some("rtsp://127.0.0.1/file"));
    assert_eq!(config.gop_size, 25);
    assert_eq!(config.audio_bitrate, 96000);
    assert_eq!(config.rtsp_transport.as_deref(), Some("tcp"));
    assert_eq!(config.open_options.get("probesize").map(String::as_str), Some("32768"));
}

#[test]
fn protocol_is_inferred_from_the_address() {
    let config = Config::parse_from(["video-push", "-s", "-", "-a", "rtsp://cam/stream"]);
    assert_eq!(config.push_protocol().unwrap(), PushProtocol::Rtsp);

    let config = Config::parse_from(["video-push", "-s", "-", "-a", "RTMP://host/app/key"]);
    assert_eq!(config.push_protocol().unwrap(), PushProtocol::Rtmp);
}

#[test]
fn explicit_protocol_overrides_the_scheme() {
    let config = Config::parse_from([
        "video-push",
        "-s",
        "in.mp4",
        "-a",
        "rtsp://host/path",
        "--protocol",
        "rtmp",
    ]);
    assert_eq!(config.push_protocol().unwrap(), PushProtocol::Rtmp);
}

#[test]
fn validation_rejects_incomplete_configs() {
    let missing_source = Config::parse_from(["video-push", "-a", "rtmp://host/app"]);
    assert!(missing_source.validate().is_err());

    let unknown_scheme =
        Config::parse_from(["video-push", "-s", "in.mp4", "-a", "srt://host:9000"]);
    assert!(unknown_scheme.validate().is_err());

    let bad_protocol = Config::parse_from([
        "video-push",
        "-s",
        "in.mp4",
        "-a",
        "rtmp://host/app",
        "--protocol",
        "hls",
    ]);
    assert!(bad_protocol.validate().is_err());

    let bad_level = Config::parse_from([
        "video-push",
        "-s",
        "in.mp4",
        "-a",
        "rtmp://host/app",
        "--ffmpeg-log-level",
        "loud",
    ]);
    assert!(bad_level.validate().is_err());
}

#[test]
fn push_options_carry_the_tuning_knobs() {
    let config = Config::parse_from([
        "video-push",
        "-s",
        "in.mp4",
        "-a",
        "rtsp://host/path",
        "--rtsp-transport",
        "udp",
        "--encoder-preset",
        "ultrafast",
        "--ffmpeg-log-level",
        "warning",
    ]);

    let options = config.push_options().unwrap();
    assert_eq!(options.gop_size, 3);
    assert_eq!(options.rtsp_transport.as_deref(), Some("udp"));
    assert_eq!(options.encoder_preset.as_deref(), Some("ultrafast"));
    assert_eq!(
        options.ffmpeg_log_level,
        ffmpeg_next::util::log::Level::Warning
    );
}
