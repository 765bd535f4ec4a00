use std::fmt;
use std::str::FromStr;

use crate::error::PushError;

/// Target protocol of a push address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushProtocol {
    Rtsp,
    /// RTMP, muxed as FLV.
    Rtmp,
}

impl PushProtocol {
    pub fn name(self) -> &'static str {
        match self {
            PushProtocol::Rtsp => "rtsp",
            PushProtocol::Rtmp => "rtmp",
        }
    }

    /// Muxer name handed to the recorder.
    pub fn format_name(self) -> &'static str {
        match self {
            PushProtocol::Rtsp => "rtsp",
            PushProtocol::Rtmp => "flv",
        }
    }

    /// Guesses the protocol from the scheme of a push address.
    pub fn from_address(address: &str) -> Option<Self> {
        let (scheme, _) = address.split_once("://")?;
        match scheme.to_ascii_lowercase().as_str() {
            "rtsp" | "rtsps" => Some(PushProtocol::Rtsp),
            "rtmp" | "rtmps" => Some(PushProtocol::Rtmp),
            _ => None,
        }
    }
}

impl FromStr for PushProtocol {
    type Err = PushError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rtsp" => Ok(PushProtocol::Rtsp),
            "rtmp" => Ok(PushProtocol::Rtmp),
            _ => Err(PushError::UnsupportedProtocol(s.to_string())),
        }
    }
}

impl fmt::Display for PushProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_protocol_names_case_insensitively() {
        assert_eq!("rtsp".parse::<PushProtocol>().unwrap(), PushProtocol::Rtsp);
        assert_eq!("RTMP".parse::<PushProtocol>().unwrap(), PushProtocol::Rtmp);
        assert_eq!(" rtmp ".parse::<PushProtocol>().unwrap(), PushProtocol::Rtmp);
    }

    #[test]
    fn rejects_unknown_protocol() {
        let err = "hls".parse::<PushProtocol>().unwrap_err();
        assert!(matches!(err, PushError::UnsupportedProtocol(name) if name == "hls"));
    }

    #[test]
    fn rtmp_is_muxed_as_flv() {
        assert_eq!(PushProtocol::Rtmp.format_name(), "flv");
        assert_eq!(PushProtocol::Rtsp.format_name(), "rtsp");
    }

    #[test]
    fn infers_protocol_from_scheme() {
        assert_eq!(
            PushProtocol::from_address("rtsp://127.0.0.1:8554/live"),
            Some(PushProtocol::Rtsp)
        );
        assert_eq!(
            PushProtocol::from_address("RTMPS://live.example.com/app/key"),
            Some(PushProtocol::Rtmp)
        );
        assert_eq!(PushProtocol::from_address("srt://host:9000"), None);
        assert_eq!(PushProtocol::from_address("/tmp/out.flv"), None);
    }

    #[test]
    fn displays_lower_case_name() {
        assert_eq!(PushProtocol::Rtmp.to_string(), "rtmp");
    }
}
