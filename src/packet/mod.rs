//! Typed views over the raw datagrams carried by the voice UDP transport.

pub mod rtcp;
pub mod rtp;
pub(crate) mod wrap;

pub use self::{
    rtcp::{ReceiverReport, ReportBlock, RtcpHeader, RtcpPacket, SenderInfo, SenderReport},
    rtp::{RtpExtension, RtpPacket},
};

use crate::constants::*;
use std::{error::Error, fmt};

/// Classifies a raw datagram as RTCP by its payload-type byte.
///
/// Anything in `[200, 204]` is control traffic; all other types are treated
/// as RTP audio.
#[inline]
#[must_use]
pub fn is_rtcp(data: &[u8]) -> bool {
    data.len() > 1 && rtcp::RTCP_TYPE_RANGE.contains(&data[1])
}

/// A synthetic packet standing in for one the jitter buffer never saw.
///
/// Carries only the stream identity; the decoder conceals the missing frame
/// via FEC or PLC.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FakePacket {
    /// Stream the frame was missing from.
    pub ssrc: u32,
    /// Sequence number the lost packet would have carried.
    pub sequence: u16,
    /// Timestamp the lost packet would have carried.
    pub timestamp: u32,
}

/// A synthetic silence frame.
///
/// Emitted in place of a lost packet when the sink consumes raw Opus, so
/// passthrough streams stay gap-free.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SilencePacket {
    /// Stream the frame belongs to.
    pub ssrc: u32,
    /// Synthetic sequence number.
    pub sequence: u16,
    /// Synthetic timestamp.
    pub timestamp: u32,
}

impl SilencePacket {
    /// The constant Opus silence payload.
    #[must_use]
    pub fn payload(&self) -> &'static [u8] {
        &SILENT_FRAME
    }
}

/// Any packet delivered to a sink: a real stream packet or one of the
/// synthetic stand-ins.
#[derive(Clone, Debug, PartialEq)]
pub enum AudioPacket {
    /// A packet that arrived over the wire.
    Rtp(RtpPacket),
    /// A synthetic silence frame covering a loss for Opus sinks.
    Silence(SilencePacket),
    /// A synthetic marker covering a loss for PCM sinks.
    Fake(FakePacket),
}

impl AudioPacket {
    /// Stream identifier.
    #[must_use]
    pub fn ssrc(&self) -> u32 {
        match self {
            Self::Rtp(p) => p.ssrc,
            Self::Silence(p) => p.ssrc,
            Self::Fake(p) => p.ssrc,
        }
    }

    /// Sequence number, synthetic or real.
    #[must_use]
    pub fn sequence(&self) -> u16 {
        match self {
            Self::Rtp(p) => p.sequence,
            Self::Silence(p) => p.sequence,
            Self::Fake(p) => p.sequence,
        }
    }

    /// Timestamp, synthetic or real.
    #[must_use]
    pub fn timestamp(&self) -> u32 {
        match self {
            Self::Rtp(p) => p.timestamp,
            Self::Silence(p) => p.timestamp,
            Self::Fake(p) => p.timestamp,
        }
    }

    /// Opus payload bytes, where the variant carries any.
    #[must_use]
    pub fn opus_payload(&self) -> Option<&[u8]> {
        match self {
            Self::Rtp(p) => p.payload.as_deref(),
            Self::Silence(p) => Some(p.payload()),
            Self::Fake(_) => None,
        }
    }

    /// Whether this frame was synthesised rather than received.
    #[must_use]
    pub fn is_synthetic(&self) -> bool {
        !matches!(self, Self::Rtp(_))
    }
}

/// Failures while interpreting a raw datagram.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum PacketError {
    /// The datagram was shorter than its framing requires.
    TooSmall,
    /// The leading byte did not announce RTP version 2.
    InvalidVersion(u8),
    /// The header extension did not match its declared layout.
    MalformedExtension,
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooSmall => write!(f, "packet too small for its framing"),
            Self::InvalidVersion(b) => write!(f, "illegal RTP version byte {b:#010b}"),
            Self::MalformedExtension => write!(f, "malformed RTP header extension"),
        }
    }
}

impl Error for PacketError {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rtcp_classification() {
        assert!(is_rtcp(&[0x80, 200]));
        assert!(is_rtcp(&[0x80, 204]));
        assert!(!is_rtcp(&[0x80, 120]));
        assert!(!is_rtcp(&[0x80, 205]));
        assert!(!is_rtcp(&[0x80]));
    }

    #[test]
    fn silence_carries_the_silent_frame() {
        let pkt = AudioPacket::Silence(SilencePacket {
            ssrc: 1,
            sequence: 2,
            timestamp: 960,
        });

        assert_eq!(pkt.opus_payload(), Some(&SILENT_FRAME[..]));
        assert!(pkt.is_synthetic());
    }
}
