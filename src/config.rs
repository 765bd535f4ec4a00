use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use clap::Parser;
use ffmpeg_next::util::log::Level as FfmpegLogLevel;
use serde::{Deserialize, Serialize};

use crate::protocol::PushProtocol;

/// Command line configuration, optionally merged with a TOML file.
///
/// Example configuration file content
/// # Video Push Configuration
///
/// source = "/data/sample.mp4"          # "-" reads the stream from stdin
/// push_address = "rtmp://127.0.0.1/live/demo"
/// protocol = "rtmp"                    # Optional: inferred from push_address
///
/// # Negotiation
/// gop_size = 3                         # 0 = two seconds of frames
/// default_frame_rate = 30
/// audio_bitrate = 0                    # 0 = encoder default
///
/// # Grabber
/// socket_timeout = "5000"
/// decoder_threads = 1
///
/// # Recorder (optional)
/// rtsp_transport = "tcp"
/// encoder_preset = "veryfast"
///
/// ffmpeg_log_level = "info"
/// chunk_size = 4096
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[command(version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// Source to relay: file path, network URL, or "-" for stdin
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Push address, e.g. rtsp://host/path or rtmp://host/app/key
    #[arg(short = 'a', long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_address: Option<String>,

    /// Push protocol: rtsp or rtmp (inferred from the address when omitted)
    #[arg(short, long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// Configuration file path
    #[arg(short, long)]
    #[serde(skip)]
    pub config: Option<String>,

    /// GOP size of the re-encoded video (0 = two seconds of frames)
    #[arg(short, long, default_value_t = 3)]
    #[serde(default = "default_gop_size")]
    pub gop_size: u32,

    /// Frame rate used when the source does not report one
    #[arg(long, default_value_t = 30)]
    #[serde(default = "default_frame_rate")]
    pub default_frame_rate: u32,

    /// Value of the grabber's `stimeout` option
    #[arg(long, default_value = "5000")]
    #[serde(default = "default_socket_timeout")]
    pub socket_timeout: String,

    /// Thread count of the video decoder
    #[arg(long, default_value_t = 1)]
    #[serde(default = "default_decoder_threads")]
    pub decoder_threads: usize,

    /// RTSP lower transport (tcp, udp, ...)
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtsp_transport: Option<String>,

    /// x264 preset for H.264 encoding
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoder_preset: Option<String>,

    /// Audio bitrate in bits per second (0 = encoder default)
    #[arg(long, default_value_t = 0)]
    #[serde(default)]
    pub audio_bitrate: usize,

    /// FFmpeg log level: quiet, panic, fatal, error, warning, info, verbose, debug, trace
    #[arg(long, default_value = "info")]
    #[serde(default = "default_ffmpeg_log_level")]
    pub ffmpeg_log_level: String,

    /// Read size when relaying stdin
    #[arg(long, default_value_t = 4096)]
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Extra input options handed to the demuxer (file only)
    #[arg(skip)]
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub open_options: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: None,
            push_address: None,
            protocol: None,
            config: None,
            gop_size: default_gop_size(),
            default_frame_rate: default_frame_rate(),
            socket_timeout: default_socket_timeout(),
            decoder_threads: default_decoder_threads(),
            rtsp_transport: None,
            encoder_preset: None,
            audio_bitrate: 0,
            ffmpeg_log_level: default_ffmpeg_log_level(),
            chunk_size: default_chunk_size(),
            open_options: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args, optionally merging with a config file
    pub fn load() -> Result<Self> {
        let mut config = Config::parse();

        if let Some(config_path) = &config.config {
            let file_config = Self::from_file(Path::new(config_path))?;
            config = config.merge_with_file(file_config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merge with file config, CLI args take precedence
    pub fn merge_with_file(mut self, file_config: Config) -> Self {
        if self.source.is_none() {
            self.source = file_config.source;
        }
        if self.push_address.is_none() {
            self.push_address = file_config.push_address;
        }
        if self.protocol.is_none() {
            self.protocol = file_config.protocol;
        }
        if self.rtsp_transport.is_none() {
            self.rtsp_transport = file_config.rtsp_transport;
        }
        if self.encoder_preset.is_none() {
            self.encoder_preset = file_config.encoder_preset;
        }

        // If CLI value is default, use file value
        if self.gop_size == default_gop_size() {
            self.gop_size = file_config.gop_size;
        }
        if self.default_frame_rate == default_frame_rate() {
            self.default_frame_rate = file_config.default_frame_rate;
        }
        if self.socket_timeout == default_socket_timeout() {
            self.socket_timeout = file_config.socket_timeout;
        }
        if self.decoder_threads == default_decoder_threads() {
            self.decoder_threads = file_config.decoder_threads;
        }
        if self.audio_bitrate == 0 {
            self.audio_bitrate = file_config.audio_bitrate;
        }
        if self.ffmpeg_log_level == default_ffmpeg_log_level() {
            self.ffmpeg_log_level = file_config.ffmpeg_log_level;
        }
        if self.chunk_size == default_chunk_size() {
            self.chunk_size = file_config.chunk_size;
        }
        if self.open_options.is_empty() {
            self.open_options = file_config.open_options;
        }

        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.as_deref().map(str::is_empty).unwrap_or(true) {
            return Err(anyhow!("A source is required (path, URL, or '-' for stdin)"));
        }
        let Some(push_address) = self.push_address.as_deref().filter(|a| !a.is_empty()) else {
            return Err(anyhow!("A push address is required"));
        };

        self.push_protocol_for(push_address)?;

        if self.default_frame_rate == 0 {
            return Err(anyhow!("default_frame_rate must be greater than zero"));
        }
        if self.decoder_threads == 0 {
            return Err(anyhow!("decoder_threads must be greater than zero"));
        }
        if self.chunk_size == 0 {
            return Err(anyhow!("chunk_size must be greater than zero"));
        }
        parse_ffmpeg_log_level(&self.ffmpeg_log_level)?;

        Ok(())
    }

    /// Explicit protocol if given, otherwise the one implied by the address scheme.
    pub fn push_protocol(&self) -> Result<PushProtocol> {
        let push_address = self.push_address.as_deref().unwrap_or_default();
        self.push_protocol_for(push_address)
    }

    fn push_protocol_for(&self, push_address: &str) -> Result<PushProtocol> {
        match &self.protocol {
            Some(protocol) => Ok(PushProtocol::from_str(protocol)?),
            None => PushProtocol::from_address(push_address).ok_or_else(|| {
                anyhow!("Cannot infer push protocol from '{push_address}', pass --protocol")
            }),
        }
    }

    pub fn push_options(&self) -> Result<PushOptions> {
        Ok(PushOptions {
            gop_size: self.gop_size,
            default_frame_rate: self.default_frame_rate,
            socket_timeout: self.socket_timeout.clone(),
            decoder_threads: self.decoder_threads,
            rtsp_transport: self.rtsp_transport.clone(),
            encoder_preset: self.encoder_preset.clone(),
            audio_bitrate: self.audio_bitrate,
            ffmpeg_log_level: parse_ffmpeg_log_level(&self.ffmpeg_log_level)?,
            open_options: self.open_options.clone(),
        })
    }
}

/// Tuning knobs of a single relay.
#[derive(Debug, Clone, PartialEq)]
pub struct PushOptions {
    pub gop_size: u32,
    pub default_frame_rate: u32,
    pub socket_timeout: String,
    pub decoder_threads: usize,
    pub rtsp_transport: Option<String>,
    pub encoder_preset: Option<String>,
    pub audio_bitrate: usize,
    pub ffmpeg_log_level: FfmpegLogLevel,
    pub open_options: BTreeMap<String, String>,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            gop_size: default_gop_size(),
            default_frame_rate: default_frame_rate(),
            socket_timeout: default_socket_timeout(),
            decoder_threads: default_decoder_threads(),
            rtsp_transport: None,
            encoder_preset: None,
            audio_bitrate: 0,
            ffmpeg_log_level: FfmpegLogLevel::Info,
            open_options: BTreeMap::new(),
        }
    }
}

pub fn parse_ffmpeg_log_level(level: &str) -> Result<FfmpegLogLevel> {
    let level = match level.to_ascii_lowercase().as_str() {
        "quiet" => FfmpegLogLevel::Quiet,
        "panic" => FfmpegLogLevel::Panic,
        "fatal" => FfmpegLogLevel::Fatal,
        "error" => FfmpegLogLevel::Error,
        "warning" | "warn" => FfmpegLogLevel::Warning,
        "info" => FfmpegLogLevel::Info,
        "verbose" => FfmpegLogLevel::Verbose,
        "debug" => FfmpegLogLevel::Debug,
        "trace" => FfmpegLogLevel::Trace,
        other => return Err(anyhow!("Unknown ffmpeg log level: {other}")),
    };
    Ok(level)
}

// Default value functions
fn default_gop_size() -> u32 {
    3
}

fn default_frame_rate() -> u32 {
    30
}

fn default_socket_timeout() -> String {
    "5000".to_string()
}

fn default_decoder_threads() -> usize {
    1
}

fn default_ffmpeg_log_level() -> String {
    "info".to_string()
}

fn default_chunk_size() -> usize {
    4096
}
