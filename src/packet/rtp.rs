//! RTP packet parsing, including the rtpsize layout adjustment and
//! RFC 5285 one-byte header extensions.

use super::PacketError;
use crate::constants::*;
use byteorder::{ByteOrder, NetworkEndian};
use std::{cmp::Ordering, collections::HashMap};

/// Magic profile marker for RFC 5285 one-byte header extensions.
const ONE_BYTE_EXT_PROFILE: [u8; 2] = [0xbe, 0xde];

/// Parsed header-extension descriptor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RtpExtension {
    /// Extension profile identifier (`0xBEDE` for one-byte headers).
    pub profile: [u8; 2],
    /// Length of the extension body in 32-bit words.
    pub length: u16,
}

/// A voice packet received over the UDP transport.
///
/// Immediately after [`parse`], only the header fields are meaningful and
/// `data` still holds ciphertext. The decryptor fills in [`payload`] and, for
/// extended packets, drives [`parse_extension`] over the plaintext.
///
/// [`parse`]: RtpPacket::parse
/// [`payload`]: RtpPacket::payload
/// [`parse_extension`]: RtpPacket::parse_extension
#[derive(Clone, Debug)]
pub struct RtpPacket {
    /// RTP version; always 2.
    pub version: u8,
    /// Whether the payload carries trailing padding.
    pub padding: bool,
    /// Whether a header extension follows the CSRC list.
    pub extended: bool,
    /// Marker bit.
    pub marker: bool,
    /// Payload type; Discord voice traffic typically uses 120, but any
    /// non-RTCP type is accepted.
    pub payload_type: u8,
    /// Stream sequence number, wrapping at 2^16.
    pub sequence: u16,
    /// Stream timestamp in samples, wrapping at 2^32.
    pub timestamp: u32,
    /// Synchronisation source: one speaker.
    pub ssrc: u32,
    /// Contributing sources, if any.
    pub csrcs: Vec<u32>,
    /// The fixed 12-byte header, extended by four bytes under the rtpsize
    /// layout when the packet carries an extension.
    pub header: Vec<u8>,
    /// Everything after the header and CSRC list; ciphertext until the
    /// decryptor has run, minus any nonce bytes it has claimed.
    pub data: Vec<u8>,
    /// Nonce bytes captured from the packet tail (4 bytes for the rtpsize
    /// and lite layouts, 24 for the suffix layout).
    pub nonce: Vec<u8>,
    /// Decrypted Opus payload, with any header extension stripped.
    pub payload: Option<Vec<u8>>,
    /// Header-extension descriptor, populated during extension parsing.
    pub extension: Option<RtpExtension>,
    /// One-byte-header extension elements, id → bytes.
    pub extension_data: HashMap<u8, Vec<u8>>,
    rtpsize: bool,
}

impl RtpPacket {
    /// Parses the RTP framing of a raw datagram.
    ///
    /// Fails on datagrams that are too short or not RTP version 2. The
    /// payload region is left untouched; decryption happens elsewhere.
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < RTP_HEADER_SIZE {
            return Err(PacketError::TooSmall);
        }

        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(PacketError::InvalidVersion(data[0]));
        }

        let csrc_count = data[0] & 0b0000_1111;
        let body_offset = RTP_HEADER_SIZE + usize::from(csrc_count) * 4;
        if data.len() < body_offset {
            return Err(PacketError::TooSmall);
        }

        let csrcs = data[RTP_HEADER_SIZE..body_offset]
            .chunks_exact(4)
            .map(NetworkEndian::read_u32)
            .collect();

        Ok(Self {
            version,
            padding: data[0] & 0b0010_0000 != 0,
            extended: data[0] & 0b0001_0000 != 0,
            marker: data[1] & 0b1000_0000 != 0,
            payload_type: data[1] & 0b0111_1111,
            sequence: NetworkEndian::read_u16(&data[2..4]),
            timestamp: NetworkEndian::read_u32(&data[4..8]),
            ssrc: NetworkEndian::read_u32(&data[8..12]),
            csrcs,
            header: data[..RTP_HEADER_SIZE].to_vec(),
            data: data[body_offset..].to_vec(),
            nonce: Vec::new(),
            payload: None,
            extension: None,
            extension_data: HashMap::new(),
            rtpsize: false,
        })
    }

    /// Rearranges the packet for the rtpsize layout: the last four data
    /// bytes become the nonce and, when an extension is present, the first
    /// four data bytes (the extension profile and length) join the header
    /// as part of the authenticated region.
    pub fn adjust_rtpsize(&mut self) -> Result<(), PacketError> {
        let tail = self
            .data
            .len()
            .checked_sub(4)
            .ok_or(PacketError::TooSmall)?;

        self.rtpsize = true;
        self.nonce = self.data.split_off(tail);

        if !self.extended {
            return Ok(());
        }

        if self.data.len() < 4 {
            return Err(PacketError::TooSmall);
        }

        let rest = self.data.split_off(4);
        self.header.extend_from_slice(&self.data);
        self.data = rest;
        Ok(())
    }

    /// Parses the header extension out of decrypted payload bytes,
    /// returning the offset at which Opus data begins.
    ///
    /// Under the rtpsize layout the four-byte extension preamble lives in
    /// the (authenticated) header rather than the plaintext, so the
    /// returned offset is relative to `plaintext` either way.
    pub fn parse_extension(&mut self, plaintext: &[u8]) -> Result<usize, PacketError> {
        if !self.extended {
            return Ok(0);
        }

        let mut preamble = [0u8; 4];
        let body_src: &[u8] = if self.rtpsize {
            preamble.copy_from_slice(&self.header[self.header.len() - 4..]);
            plaintext
        } else {
            if plaintext.len() < 4 {
                return Err(PacketError::MalformedExtension);
            }
            preamble.copy_from_slice(&plaintext[..4]);
            &plaintext[4..]
        };

        let profile = [preamble[0], preamble[1]];
        let length = NetworkEndian::read_u16(&preamble[2..4]);
        let body_len = usize::from(length) * 4;

        if body_src.len() < body_len {
            return Err(PacketError::MalformedExtension);
        }

        if profile == ONE_BYTE_EXT_PROFILE {
            self.parse_one_byte_elements(&body_src[..body_len]);
        }

        self.extension = Some(RtpExtension { profile, length });

        let offset = if self.rtpsize { body_len } else { 4 + body_len };
        Ok(offset)
    }

    fn parse_one_byte_elements(&mut self, body: &[u8]) {
        let mut offset = 0;

        while offset < body.len() {
            let head = body[offset];

            // Null bytes pad the extension out to a word boundary.
            if head == 0 {
                offset += 1;
                continue;
            }

            let id = head >> 4;
            let len = 1 + usize::from(head & 0b0000_1111);
            let start = offset + 1;
            let end = (start + len).min(body.len());

            self.extension_data.insert(id, body[start..end].to_vec());
            offset = start + len;
        }
    }

    /// Whether the decrypted payload is the Opus silence frame.
    #[must_use]
    pub fn is_silence(&self) -> bool {
        self.payload.as_deref() == Some(&SILENT_FRAME[..])
    }
}

impl PartialEq for RtpPacket {
    fn eq(&self, other: &Self) -> bool {
        self.ssrc == other.ssrc
            && self.sequence == other.sequence
            && self.timestamp == other.timestamp
    }
}

/// Packets order by `(sequence, timestamp)` *within one stream*; packets
/// from different SSRCs are incomparable.
impl PartialOrd for RtpPacket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.ssrc != other.ssrc {
            return None;
        }

        if self == other {
            Some(Ordering::Equal)
        } else if self.sequence < other.sequence && self.timestamp < other.timestamp {
            Some(Ordering::Less)
        } else if self.sequence > other.sequence && self.timestamp > other.timestamp {
            Some(Ordering::Greater)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn raw_packet(sequence: u16, timestamp: u32, ssrc: u32, body: &[u8]) -> Vec<u8> {
        let mut out = vec![0x80, 0x78];
        out.extend_from_slice(&sequence.to_be_bytes());
        out.extend_from_slice(&timestamp.to_be_bytes());
        out.extend_from_slice(&ssrc.to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn parses_fixed_header() {
        let raw = raw_packet(100, 48_000, 0xdead_beef, &[1, 2, 3, 4]);
        let pkt = RtpPacket::parse(&raw).unwrap();

        assert_eq!(pkt.version, 2);
        assert_eq!(pkt.payload_type, 120);
        assert_eq!(pkt.sequence, 100);
        assert_eq!(pkt.timestamp, 48_000);
        assert_eq!(pkt.ssrc, 0xdead_beef);
        assert_eq!(pkt.data, vec![1, 2, 3, 4]);
        assert_eq!(pkt.header.len(), RTP_HEADER_SIZE);
        assert!(!pkt.extended);
    }

    #[test]
    fn rejects_wrong_version() {
        let mut raw = raw_packet(1, 1, 1, &[0; 8]);
        raw[0] = 0x40;
        assert!(matches!(
            RtpPacket::parse(&raw),
            Err(PacketError::InvalidVersion(_))
        ));
    }

    #[test]
    fn consumes_csrc_list() {
        let mut raw = raw_packet(7, 960, 42, &[]);
        raw[0] |= 0x02;
        raw.extend_from_slice(&11u32.to_be_bytes());
        raw.extend_from_slice(&22u32.to_be_bytes());
        raw.extend_from_slice(&[0xaa, 0xbb]);

        let pkt = RtpPacket::parse(&raw).unwrap();
        assert_eq!(pkt.csrcs, vec![11, 22]);
        assert_eq!(pkt.data, vec![0xaa, 0xbb]);
    }

    #[test]
    fn rtpsize_moves_nonce_and_extension_preamble() {
        let mut raw = raw_packet(7, 960, 42, &[]);
        raw[0] |= 0x10;
        raw.extend_from_slice(&[0xbe, 0xde, 0x00, 0x01]);
        raw.extend_from_slice(&[9, 9, 9, 9]);
        raw.extend_from_slice(&[1, 2, 3, 4]);

        let mut pkt = RtpPacket::parse(&raw).unwrap();
        pkt.adjust_rtpsize().unwrap();

        assert_eq!(pkt.nonce, vec![1, 2, 3, 4]);
        assert_eq!(pkt.header.len(), RTP_HEADER_SIZE + 4);
        assert_eq!(&pkt.header[RTP_HEADER_SIZE..], &[0xbe, 0xde, 0x00, 0x01]);
        assert_eq!(pkt.data, vec![9, 9, 9, 9]);
    }

    #[test]
    fn one_byte_extension_elements() {
        let mut raw = raw_packet(7, 960, 42, &[]);
        raw[0] |= 0x10;
        let mut pkt = RtpPacket::parse(&raw).unwrap();

        let plaintext = [
            0xbe, 0xde, 0x00, 0x02, // profile + two words
            0x10, 0xaa, 0x21, 0xbb, 0xcc, 0x00, 0x00, 0x00, // elements + padding
            0xf8, 0xff, 0xfe, // opus data
        ];

        let offset = pkt.parse_extension(&plaintext).unwrap();

        assert_eq!(offset, 12);
        assert_eq!(pkt.extension_data.len(), 2);
        assert_eq!(pkt.extension_data[&1], vec![0xaa]);
        assert_eq!(pkt.extension_data[&2], vec![0xbb, 0xcc]);

        let ext = pkt.extension.unwrap();
        assert_eq!(ext.profile, [0xbe, 0xde]);
        assert_eq!(ext.length, 2);
    }

    #[test]
    fn cross_ssrc_comparison_is_undefined() {
        let a = RtpPacket::parse(&raw_packet(5, 10, 1, &[])).unwrap();
        let b = RtpPacket::parse(&raw_packet(6, 20, 2, &[])).unwrap();
        let c = RtpPacket::parse(&raw_packet(6, 20, 1, &[])).unwrap();

        assert_eq!(a.partial_cmp(&b), None);
        assert_eq!(a.partial_cmp(&c), Some(Ordering::Less));
        assert!(a != b);
    }
}
