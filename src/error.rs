use ffmpeg_next::codec;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PushError {
    #[error("unsupported push protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("no media streams found in source")]
    NoMediaStreams,

    #[error("no encoder available for codec {0:?}")]
    EncoderNotFound(codec::Id),

    #[error("unsupported source: {0}")]
    UnsupportedSource(&'static str),

    #[error("recorder is already closed")]
    RecorderClosed,

    #[error("pusher is shut down")]
    ShutDown,

    #[error("ffmpeg: {0}")]
    Ffmpeg(#[from] ffmpeg_next::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PushError>;
