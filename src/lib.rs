pub mod config;
pub mod error;
mod ffmpeg_log;
pub mod grabber;
mod interrupt;
pub mod negotiation;
pub mod protocol;
pub mod pusher;
pub mod recorder;
pub mod registry;
pub mod relay;

//
// Re-export
//
pub use config::{Config, PushOptions};
pub use error::{PushError, Result};
pub use grabber::{Frame, Grabber, Source, SourceInfo};
pub use negotiation::{RecorderSettings, negotiate};
pub use protocol::PushProtocol;
pub use pusher::VideoPusher;
pub use recorder::Recorder;
pub use registry::{PipeFeed, PipeLease, PipeRegistry};
pub use relay::{RelayReport, ThroughputMeter, ThroughputSample, relay};
