//! RTCP report parsing.
//!
//! Voice servers emit sender reports alongside the audio stream; receiver
//! reports and any other control subtype are surfaced to listeners without
//! deep parsing.

use super::PacketError;
use crate::constants::*;
use byteorder::{ByteOrder, NetworkEndian};

/// Inclusive payload-type range reserved for RTCP within the voice stream.
pub(crate) const RTCP_TYPE_RANGE: std::ops::RangeInclusive<u8> = 200..=204;

const SENDER_INFO_SIZE: usize = 20;
const REPORT_BLOCK_SIZE: usize = 24;

/// Common RTCP preamble.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RtcpHeader {
    /// Protocol version; always 2.
    pub version: u8,
    /// Whether the packet carries trailing padding.
    pub padding: bool,
    /// Number of report blocks that follow the sender/receiver section.
    pub report_count: u8,
    /// RTCP packet type (200 = SR, 201 = RR).
    pub packet_type: u8,
    /// Packet length in 32-bit words, minus one.
    pub length: u16,
}

/// Sender timing/throughput section of a sender report.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SenderInfo {
    /// Seconds part of the NTP timestamp.
    pub ntp_seconds: u32,
    /// Fractional part of the NTP timestamp.
    pub ntp_fraction: u32,
    /// RTP timestamp corresponding to the NTP time.
    pub rtp_timestamp: u32,
    /// Packets sent since stream start.
    pub packet_count: u32,
    /// Payload octets sent since stream start.
    pub octet_count: u32,
}

impl SenderInfo {
    /// NTP timestamp as fractional seconds.
    #[must_use]
    pub fn ntp_timestamp(&self) -> f64 {
        f64::from(self.ntp_seconds) + f64::from(self.ntp_fraction) / 2f64.powi(32)
    }
}

/// Per-source reception statistics block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReportBlock {
    /// The stream this block reports on.
    pub ssrc: u32,
    /// Fraction of packets lost since the previous report, in 1/256 units.
    pub fraction_lost: u8,
    /// Cumulative packets lost (24-bit).
    pub packets_lost: u32,
    /// Extended highest sequence number received.
    pub last_sequence: u32,
    /// Interarrival jitter estimate.
    pub jitter: u32,
    /// Middle 32 bits of the last sender report's NTP timestamp.
    pub last_sr: u32,
    /// Delay since that sender report, in 1/65536 seconds.
    pub delay_since_last_sr: u32,
}

/// A sender report (`packet_type == 200`).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SenderReport {
    /// Common preamble.
    pub header: RtcpHeader,
    /// The reporting stream.
    pub ssrc: u32,
    /// Sender timing section.
    pub info: SenderInfo,
    /// Reception statistics for each reported stream.
    pub reports: Vec<ReportBlock>,
    /// Profile-specific trailing bytes, if present.
    pub extension: Vec<u8>,
}

/// A receiver report (`packet_type == 201`).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReceiverReport {
    /// Common preamble.
    pub header: RtcpHeader,
    /// The reporting stream.
    pub ssrc: u32,
    /// Reception statistics for each reported stream.
    pub reports: Vec<ReportBlock>,
    /// Profile-specific trailing bytes, if present.
    pub extension: Vec<u8>,
}

/// Any decrypted RTCP packet.
#[derive(Clone, Debug, PartialEq)]
pub enum RtcpPacket {
    /// Sender report.
    SenderReport(SenderReport),
    /// Receiver report.
    ReceiverReport(ReceiverReport),
    /// A control subtype the library does not parse further.
    Other {
        /// Common preamble.
        header: RtcpHeader,
        /// The raw packet, headers included.
        data: Vec<u8>,
    },
}

impl RtcpPacket {
    /// Parses a decrypted RTCP packet.
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < RTCP_HEADER_SIZE {
            return Err(PacketError::TooSmall);
        }

        let header = RtcpHeader {
            version: data[0] >> 6,
            padding: data[0] & 0b0010_0000 != 0,
            report_count: data[0] & 0b0001_1111,
            packet_type: data[1],
            length: NetworkEndian::read_u16(&data[2..4]),
        };

        if header.version != RTP_VERSION {
            return Err(PacketError::InvalidVersion(data[0]));
        }

        let ssrc = NetworkEndian::read_u32(&data[4..8]);

        match header.packet_type {
            200 => {
                let body = &data[8..];
                if body.len() < SENDER_INFO_SIZE {
                    return Err(PacketError::TooSmall);
                }

                let info = SenderInfo {
                    ntp_seconds: NetworkEndian::read_u32(&body[0..4]),
                    ntp_fraction: NetworkEndian::read_u32(&body[4..8]),
                    rtp_timestamp: NetworkEndian::read_u32(&body[8..12]),
                    packet_count: NetworkEndian::read_u32(&body[12..16]),
                    octet_count: NetworkEndian::read_u32(&body[16..20]),
                };

                let (reports, extension) =
                    read_report_blocks(&body[SENDER_INFO_SIZE..], header.report_count)?;

                Ok(Self::SenderReport(SenderReport {
                    header,
                    ssrc,
                    info,
                    reports,
                    extension,
                }))
            },
            201 => {
                let (reports, extension) = read_report_blocks(&data[8..], header.report_count)?;

                Ok(Self::ReceiverReport(ReceiverReport {
                    header,
                    ssrc,
                    reports,
                    extension,
                }))
            },
            _ => Ok(Self::Other {
                header,
                data: data.to_vec(),
            }),
        }
    }

    /// Common preamble of any subtype.
    #[must_use]
    pub fn header(&self) -> &RtcpHeader {
        match self {
            Self::SenderReport(sr) => &sr.header,
            Self::ReceiverReport(rr) => &rr.header,
            Self::Other { header, .. } => header,
        }
    }
}

fn read_report_blocks(
    body: &[u8],
    count: u8,
) -> Result<(Vec<ReportBlock>, Vec<u8>), PacketError> {
    let wanted = usize::from(count) * REPORT_BLOCK_SIZE;
    if body.len() < wanted {
        return Err(PacketError::TooSmall);
    }

    let reports = body[..wanted]
        .chunks_exact(REPORT_BLOCK_SIZE)
        .map(|block| ReportBlock {
            ssrc: NetworkEndian::read_u32(&block[0..4]),
            fraction_lost: block[4],
            packets_lost: NetworkEndian::read_u32(&block[4..8]) & 0x00ff_ffff,
            last_sequence: NetworkEndian::read_u32(&block[8..12]),
            jitter: NetworkEndian::read_u32(&block[12..16]),
            last_sr: NetworkEndian::read_u32(&block[16..20]),
            delay_since_last_sr: NetworkEndian::read_u32(&block[20..24]),
        })
        .collect();

    Ok((reports, body[wanted..].to_vec()))
}
