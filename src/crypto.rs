//! Transport encryption schemes negotiated with the voice server.

use crate::{
    constants::*,
    dave::{DaveError, DaveSession, MediaType},
    id::UserId,
    packet::{PacketError, RtpPacket},
};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305,
};
use crypto_secretbox::XSalsa20Poly1305;
use parking_lot::RwLock;
use std::{error::Error as StdError, fmt, sync::Arc};

/// Length of the session key handed out in the session description.
pub const KEY_SIZE: usize = 32;

/// Nonce width shared by both cipher families.
pub const NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag length.
pub const TAG_SIZE: usize = 16;

/// Encryption modes the library can negotiate, ordered by preference.
///
/// Only [`Aead`] may be proposed to servers that offer it; the XSalsa20
/// variants are accepted for inbound traffic from older servers.
///
/// [`Aead`]: Self::Aead
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum CryptoMode {
    /// XChaCha20-Poly1305 under the rtpsize layout: a 4-byte counter
    /// trails the payload and the RTP header is authenticated as
    /// associated data.
    Aead,
    /// XSalsa20-Poly1305 with the RTP header as the nonce source.
    Normal,
    /// XSalsa20-Poly1305 with a random 24-byte nonce suffixed to each
    /// packet.
    Suffix,
    /// XSalsa20-Poly1305 with an incrementing 4-byte counter suffix.
    Lite,
}

impl CryptoMode {
    const PREFERENCE: [CryptoMode; 4] = [Self::Aead, Self::Normal, Self::Suffix, Self::Lite];

    /// Returns the name of a mode as it appears during negotiation.
    #[must_use]
    pub fn to_request_str(self) -> &'static str {
        match self {
            Self::Aead => "aead_xchacha20_poly1305_rtpsize",
            Self::Normal => "xsalsa20_poly1305",
            Self::Suffix => "xsalsa20_poly1305_suffix",
            Self::Lite => "xsalsa20_poly1305_lite",
        }
    }

    /// Parses a negotiation-protocol mode name.
    #[must_use]
    pub fn from_request_str(s: &str) -> Option<Self> {
        Self::PREFERENCE
            .into_iter()
            .find(|mode| mode.to_request_str() == s)
    }

    /// Picks the most preferred mode out of a server's offer.
    #[must_use]
    pub fn negotiate<S: AsRef<str>>(offered: &[S]) -> Option<Self> {
        Self::PREFERENCE
            .into_iter()
            .find(|mode| offered.iter().any(|s| s.as_ref() == mode.to_request_str()))
    }

    /// Number of nonce bytes stored within each RTP packet.
    #[must_use]
    pub fn nonce_size(self) -> usize {
        match self {
            Self::Normal => 0,
            Self::Aead | Self::Lite => 4,
            Self::Suffix => NONCE_SIZE,
        }
    }
}

enum Cipher {
    Aead(XChaCha20Poly1305),
    Secret(XSalsa20Poly1305),
}

impl Cipher {
    fn new(mode: CryptoMode, key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength(key.len()));
        }

        Ok(match mode {
            CryptoMode::Aead => Self::Aead(
                XChaCha20Poly1305::new_from_slice(key)
                    .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?,
            ),
            _ => Self::Secret(
                XSalsa20Poly1305::new_from_slice(key)
                    .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?,
            ),
        })
    }

    fn open(&self, nonce: &[u8; NONCE_SIZE], aad: &[u8], ct: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            Self::Aead(cipher) => cipher
                .decrypt(nonce.into(), Payload { msg: ct, aad })
                .map_err(|_| CryptoError::AuthenticationFailed),
            Self::Secret(cipher) => cipher
                .decrypt(nonce.into(), ct)
                .map_err(|_| CryptoError::AuthenticationFailed),
        }
    }
}

/// Turns received RT(C)P ciphertext into authenticated plaintext.
///
/// The key is replaced atomically on session resume; packets already in
/// flight decrypt under whichever key was current when they reached the
/// cipher.
pub struct Decryptor {
    mode: CryptoMode,
    cipher: RwLock<Cipher>,
    dave: Option<Arc<dyn DaveSession>>,
}

impl Decryptor {
    /// Builds a decryptor for a negotiated mode and session key.
    pub fn new(mode: CryptoMode, key: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            mode,
            cipher: RwLock::new(Cipher::new(mode, key)?),
            dave: None,
        })
    }

    /// Attaches an end-to-end group session applied after transport
    /// decryption.
    #[must_use]
    pub fn with_dave(mut self, dave: Option<Arc<dyn DaveSession>>) -> Self {
        self.dave = dave;
        self
    }

    /// The negotiated mode.
    #[must_use]
    pub fn mode(&self) -> CryptoMode {
        self.mode
    }

    /// Replaces the session key after a resume.
    pub fn rotate(&self, key: &[u8]) -> Result<(), CryptoError> {
        let next = Cipher::new(self.mode, key)?;
        *self.cipher.write() = next;
        Ok(())
    }

    /// Decrypts an RTP packet in place, filling `packet.payload` with the
    /// Opus data (header extension stripped).
    ///
    /// `user` is the stream's owner if known; required for end-to-end
    /// passthrough decryption when a group session is active.
    pub fn decrypt_rtp(
        &self,
        packet: &mut RtpPacket,
        user: Option<UserId>,
    ) -> Result<(), CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];

        let plaintext = match self.mode {
            CryptoMode::Aead => {
                packet.adjust_rtpsize()?;
                nonce[..4].copy_from_slice(&packet.nonce);
                self.cipher
                    .read()
                    .open(&nonce, &packet.header, &packet.data)?
            },
            CryptoMode::Normal => {
                nonce[..RTP_HEADER_SIZE].copy_from_slice(&packet.header[..RTP_HEADER_SIZE]);
                self.cipher.read().open(&nonce, &[], &packet.data)?
            },
            CryptoMode::Suffix => {
                let split = packet
                    .data
                    .len()
                    .checked_sub(NONCE_SIZE)
                    .ok_or(CryptoError::Packet(PacketError::TooSmall))?;
                nonce.copy_from_slice(&packet.data[split..]);
                self.cipher.read().open(&nonce, &[], &packet.data[..split])?
            },
            CryptoMode::Lite => {
                let split = packet
                    .data
                    .len()
                    .checked_sub(4)
                    .ok_or(CryptoError::Packet(PacketError::TooSmall))?;
                nonce[..4].copy_from_slice(&packet.data[split..]);
                self.cipher.read().open(&nonce, &[], &packet.data[..split])?
            },
        };

        let offset = packet.parse_extension(&plaintext)?;
        let mut payload = plaintext[offset..].to_vec();

        if let (Some(dave), Some(user)) = (self.dave.as_deref(), user) {
            if dave.is_ready() && dave.can_passthrough(user) {
                payload = dave.decrypt(user, MediaType::Audio, &payload)?;
            }
        }

        packet.payload = Some(payload);
        Ok(())
    }

    /// Decrypts an RTCP datagram, returning the cleartext header followed
    /// by the decrypted report body.
    pub fn decrypt_rtcp(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < RTCP_HEADER_SIZE {
            return Err(CryptoError::Packet(PacketError::TooSmall));
        }

        let mut nonce = [0u8; NONCE_SIZE];
        let header = &data[..RTCP_HEADER_SIZE];
        let body = &data[RTCP_HEADER_SIZE..];

        let plaintext = match self.mode {
            CryptoMode::Aead => {
                let split = body
                    .len()
                    .checked_sub(4)
                    .ok_or(CryptoError::Packet(PacketError::TooSmall))?;
                nonce[..4].copy_from_slice(&body[split..]);
                self.cipher.read().open(&nonce, header, &body[..split])?
            },
            CryptoMode::Normal => {
                nonce[..RTCP_HEADER_SIZE].copy_from_slice(header);
                self.cipher.read().open(&nonce, &[], body)?
            },
            CryptoMode::Suffix => {
                let split = body
                    .len()
                    .checked_sub(NONCE_SIZE)
                    .ok_or(CryptoError::Packet(PacketError::TooSmall))?;
                nonce.copy_from_slice(&body[split..]);
                self.cipher.read().open(&nonce, &[], &body[..split])?
            },
            CryptoMode::Lite => {
                let split = body
                    .len()
                    .checked_sub(4)
                    .ok_or(CryptoError::Packet(PacketError::TooSmall))?;
                nonce[..4].copy_from_slice(&body[split..]);
                self.cipher.read().open(&nonce, &[], &body[..split])?
            },
        };

        let mut out = header.to_vec();
        out.extend_from_slice(&plaintext);
        Ok(out)
    }
}

impl fmt::Debug for Decryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decryptor")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// Failures inside the decryption layer.
#[derive(Debug)]
#[non_exhaustive]
pub enum CryptoError {
    /// The ciphertext failed authentication; the packet is dropped.
    AuthenticationFailed,
    /// The supplied session key had the wrong size.
    InvalidKeyLength(usize),
    /// The server named a mode this library does not implement.
    UnsupportedMode(String),
    /// The packet's structure did not fit the negotiated layout.
    Packet(PacketError),
    /// The end-to-end group session rejected the frame.
    Dave(DaveError),
}

impl From<PacketError> for CryptoError {
    fn from(e: PacketError) -> Self {
        Self::Packet(e)
    }
}

impl From<DaveError> for CryptoError {
    fn from(e: DaveError) -> Self {
        Self::Dave(e)
    }
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthenticationFailed => write!(f, "packet failed authentication"),
            Self::InvalidKeyLength(n) => write!(f, "secret key had illegal length {n}"),
            Self::UnsupportedMode(mode) => write!(f, "unsupported encryption mode {mode:?}"),
            Self::Packet(e) => write!(f, "packet too mangled to decrypt: {e}"),
            Self::Dave(e) => write!(f, "group session decrypt failed: {e}"),
        }
    }
}

impl StdError for CryptoError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Packet(e) => Some(e),
            Self::Dave(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use byteorder::{ByteOrder, NetworkEndian};

    const KEY: [u8; KEY_SIZE] = [7u8; KEY_SIZE];
    const OPUS_BODY: &[u8] = &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];

    fn rtp_header(sequence: u16, ssrc: u32, extended: bool) -> Vec<u8> {
        let mut out = vec![if extended { 0x90 } else { 0x80 }, 0x78];
        out.extend_from_slice(&sequence.to_be_bytes());
        out.extend_from_slice(&9_600u32.to_be_bytes());
        out.extend_from_slice(&ssrc.to_be_bytes());
        out
    }

    fn secret_seal(nonce: &[u8; NONCE_SIZE], pt: &[u8]) -> Vec<u8> {
        XSalsa20Poly1305::new_from_slice(&KEY)
            .unwrap()
            .encrypt(nonce.into(), pt)
            .unwrap()
    }

    fn aead_seal(nonce: &[u8; NONCE_SIZE], aad: &[u8], pt: &[u8]) -> Vec<u8> {
        XChaCha20Poly1305::new_from_slice(&KEY)
            .unwrap()
            .encrypt(nonce.into(), Payload { msg: pt, aad })
            .unwrap()
    }

    fn encrypt_rtp(mode: CryptoMode, sequence: u16, ssrc: u32, pt: &[u8]) -> Vec<u8> {
        let mut raw = rtp_header(sequence, ssrc, false);
        let mut nonce = [0u8; NONCE_SIZE];

        match mode {
            CryptoMode::Normal => {
                nonce[..RTP_HEADER_SIZE].copy_from_slice(&raw);
                raw.extend_from_slice(&secret_seal(&nonce, pt));
            },
            CryptoMode::Suffix => {
                nonce.copy_from_slice(&[0xab; NONCE_SIZE]);
                raw.extend_from_slice(&secret_seal(&nonce, pt));
                raw.extend_from_slice(&nonce);
            },
            CryptoMode::Lite => {
                NetworkEndian::write_u32(&mut nonce[..4], 0x0102_0304);
                raw.extend_from_slice(&secret_seal(&nonce, pt));
                raw.extend_from_slice(&nonce[..4]);
            },
            CryptoMode::Aead => {
                NetworkEndian::write_u32(&mut nonce[..4], 0x0a0b_0c0d);
                let ct = aead_seal(&nonce, &raw, pt);
                raw.extend_from_slice(&ct);
                raw.extend_from_slice(&nonce[..4]);
            },
        }

        raw
    }

    #[test]
    fn rtp_round_trips_in_every_mode() {
        for mode in CryptoMode::PREFERENCE {
            let raw = encrypt_rtp(mode, 55, 0x1122_3344, OPUS_BODY);
            let mut pkt = RtpPacket::parse(&raw).unwrap();

            let decryptor = Decryptor::new(mode, &KEY).unwrap();
            decryptor.decrypt_rtp(&mut pkt, None).unwrap();

            assert_eq!(pkt.payload.as_deref(), Some(OPUS_BODY), "mode {mode:?}");
        }
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        for mode in CryptoMode::PREFERENCE {
            let mut raw = encrypt_rtp(mode, 55, 0x1122_3344, OPUS_BODY);
            let target = raw.len() - usize::from(mode != CryptoMode::Normal) * 4 - 1;
            raw[target] ^= 0x01;

            let mut pkt = RtpPacket::parse(&raw).unwrap();
            let decryptor = Decryptor::new(mode, &KEY).unwrap();

            assert!(
                matches!(
                    decryptor.decrypt_rtp(&mut pkt, None),
                    Err(CryptoError::AuthenticationFailed)
                ),
                "mode {mode:?}"
            );
        }
    }

    #[test]
    fn packet_from_other_mode_fails_authentication() {
        // Negotiating AEAD means a legacy-encrypted packet must not pass.
        let raw = encrypt_rtp(CryptoMode::Normal, 1, 2, OPUS_BODY);
        let mut pkt = RtpPacket::parse(&raw).unwrap();
        let decryptor = Decryptor::new(CryptoMode::Aead, &KEY).unwrap();

        assert!(decryptor.decrypt_rtp(&mut pkt, None).is_err());
    }

    #[test]
    fn aead_authenticates_extension_bytes() {
        let mut raw = rtp_header(9, 77, true);
        let mut aad = raw.clone();
        aad.extend_from_slice(&[0xbe, 0xde, 0x00, 0x01]);

        let mut pt = vec![0x10, 0xaa, 0x00, 0x00]; // one-byte ext, padded word
        pt.extend_from_slice(OPUS_BODY);

        let mut nonce = [0u8; NONCE_SIZE];
        NetworkEndian::write_u32(&mut nonce[..4], 42);

        raw.extend_from_slice(&[0xbe, 0xde, 0x00, 0x01]);
        raw.extend_from_slice(&aead_seal(&nonce, &aad, &pt));
        raw.extend_from_slice(&nonce[..4]);

        let mut pkt = RtpPacket::parse(&raw).unwrap();
        let decryptor = Decryptor::new(CryptoMode::Aead, &KEY).unwrap();
        decryptor.decrypt_rtp(&mut pkt, None).unwrap();

        assert_eq!(pkt.payload.as_deref(), Some(OPUS_BODY));
        assert_eq!(pkt.extension_data[&1], vec![0xaa]);
    }

    #[test]
    fn rtcp_round_trips_in_every_mode() {
        let mut header = vec![0x80, 201, 0x00, 0x01];
        header.extend_from_slice(&9u32.to_be_bytes());
        let body = [0xde, 0xad, 0xbe, 0xef];

        for mode in CryptoMode::PREFERENCE {
            let mut nonce = [0u8; NONCE_SIZE];
            let mut raw = header.clone();

            match mode {
                CryptoMode::Normal => {
                    nonce[..RTCP_HEADER_SIZE].copy_from_slice(&header);
                    raw.extend_from_slice(&secret_seal(&nonce, &body));
                },
                CryptoMode::Suffix => {
                    nonce.copy_from_slice(&[0x11; NONCE_SIZE]);
                    raw.extend_from_slice(&secret_seal(&nonce, &body));
                    raw.extend_from_slice(&nonce);
                },
                CryptoMode::Lite => {
                    NetworkEndian::write_u32(&mut nonce[..4], 99);
                    raw.extend_from_slice(&secret_seal(&nonce, &body));
                    raw.extend_from_slice(&nonce[..4]);
                },
                CryptoMode::Aead => {
                    NetworkEndian::write_u32(&mut nonce[..4], 99);
                    raw.extend_from_slice(&aead_seal(&nonce, &header, &body));
                    raw.extend_from_slice(&nonce[..4]);
                },
            }

            let decryptor = Decryptor::new(mode, &KEY).unwrap();
            let out = decryptor.decrypt_rtcp(&raw).unwrap();

            assert_eq!(&out[..RTCP_HEADER_SIZE], &header[..], "mode {mode:?}");
            assert_eq!(&out[RTCP_HEADER_SIZE..], &body[..], "mode {mode:?}");
        }
    }

    #[test]
    fn rotation_switches_keys() {
        let decryptor = Decryptor::new(CryptoMode::Lite, &KEY).unwrap();
        let raw = encrypt_rtp(CryptoMode::Lite, 1, 2, OPUS_BODY);

        decryptor.rotate(&[9u8; KEY_SIZE]).unwrap();
        let mut pkt = RtpPacket::parse(&raw).unwrap();
        assert!(decryptor.decrypt_rtp(&mut pkt, None).is_err());

        decryptor.rotate(&KEY).unwrap();
        let mut pkt = RtpPacket::parse(&raw).unwrap();
        decryptor.decrypt_rtp(&mut pkt, None).unwrap();
        assert_eq!(pkt.payload.as_deref(), Some(OPUS_BODY));
    }

    #[test]
    fn negotiation_prefers_aead() {
        let offered = vec![
            "xsalsa20_poly1305".to_string(),
            "aead_xchacha20_poly1305_rtpsize".to_string(),
        ];
        assert_eq!(CryptoMode::negotiate(&offered), Some(CryptoMode::Aead));

        let legacy_only = vec![
            "xsalsa20_poly1305_lite".to_string(),
            "xsalsa20_poly1305_suffix".to_string(),
        ];
        assert_eq!(CryptoMode::negotiate(&legacy_only), Some(CryptoMode::Suffix));

        let unknown = vec!["aead_aes256_gcm".to_string()];
        assert_eq!(CryptoMode::negotiate(&unknown), None);
    }

    #[test]
    fn short_keys_are_rejected() {
        assert!(matches!(
            Decryptor::new(CryptoMode::Normal, &[1u8; 16]),
            Err(CryptoError::InvalidKeyLength(16))
        ));
    }
}
