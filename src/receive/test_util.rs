//! Shared fixtures for receive-path tests.

use crate::{
    constants::STEREO_FRAME_SIZE,
    opus::{EncoderConfig, OpusEncoder},
    packet::RtpPacket,
};

/// Builds a parsed, "already decrypted" RTP packet with a stub payload.
pub(crate) fn test_packet(ssrc: u32, sequence: u16, timestamp: u32) -> RtpPacket {
    opus_packet(ssrc, sequence, timestamp, vec![0x40, 0x01, 0x02, 0x03])
}

/// Builds a parsed RTP packet carrying `payload` as its decrypted body.
pub(crate) fn opus_packet(
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    payload: Vec<u8>,
) -> RtpPacket {
    let mut raw = vec![0x80, 0x78];
    raw.extend_from_slice(&sequence.to_be_bytes());
    raw.extend_from_slice(&timestamp.to_be_bytes());
    raw.extend_from_slice(&ssrc.to_be_bytes());

    let mut packet = RtpPacket::parse(&raw).expect("fixture header is valid");
    packet.payload = Some(payload);
    packet
}

/// Encodes `n` consecutive frames of test audio with FEC enabled, as a
/// real sender would.
pub(crate) fn encoded_frames(n: usize) -> Vec<Vec<u8>> {
    let mut encoder =
        OpusEncoder::new(&EncoderConfig::default()).expect("opus encoder must build");

    (0..n)
        .map(|i| {
            let pcm: Vec<i16> = (0..STEREO_FRAME_SIZE)
                .map(|s| (((s + i * 31) % 512) as i32 - 256) as i16)
                .collect();
            encoder.encode(&pcm).expect("encode must succeed")
        })
        .collect()
}
