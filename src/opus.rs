//! Fixed-parameter Opus bindings shared by the receive pipeline and any
//! outbound encoder.
//!
//! Everything here runs at 48 kHz stereo with 20 ms frames; decoded audio
//! is interleaved `i16` PCM.

use crate::constants::*;
use audiopus::{
    coder::{Decoder as AudiopusDecoder, Encoder as AudiopusEncoder, GenericCtl},
    packet as opus_packet,
    Application,
    Bandwidth,
    Bitrate,
    Channels,
    Error as OpusError,
    Signal,
};

/// Maximum Opus frame length we will hand to the encoder's scratch buffer.
const MAX_OPUS_PACKET: usize = 1_500;

/// Tuning knobs for an outbound encoder.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EncoderConfig {
    /// Coding mode trade-off.
    pub application: Application,
    /// Target bitrate in kilobits per second; clamped into `[16, 512]`.
    pub bitrate_kbps: i32,
    /// Whether to embed low-bitrate redundancy of each frame into its
    /// successor.
    pub inband_fec: bool,
    /// Expected packet loss as a fraction in `(0, 1]`; drives how much
    /// redundancy FEC spends.
    pub expected_packet_loss: f32,
    /// Encoded audio bandwidth.
    pub bandwidth: Bandwidth,
    /// Signal hint for the encoder's mode decisions.
    pub signal: Signal,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            application: Application::Audio,
            bitrate_kbps: 128,
            inband_fec: true,
            expected_packet_loss: 0.15,
            bandwidth: Bandwidth::Fullband,
            signal: Signal::Auto,
        }
    }
}

/// A 48 kHz stereo Opus encoder.
pub struct OpusEncoder {
    inner: AudiopusEncoder,
}

impl OpusEncoder {
    /// Builds an encoder from the given configuration.
    pub fn new(config: &EncoderConfig) -> Result<Self, OpusError> {
        let mut inner = AudiopusEncoder::new(SAMPLE_RATE, Channels::Stereo, config.application)?;

        let kbps = config.bitrate_kbps.clamp(16, 512);
        inner.set_bitrate(Bitrate::BitsPerSecond(kbps * 1024))?;
        inner.set_inband_fec(config.inband_fec)?;

        let loss = (config.expected_packet_loss * 100.0).round().clamp(0.0, 100.0);
        inner.set_packet_loss_perc(loss as u8)?;
        inner.set_bandwidth(config.bandwidth)?;
        inner.set_signal(config.signal)?;

        Ok(Self { inner })
    }

    /// Encodes one frame of interleaved stereo PCM.
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, OpusError> {
        let mut out = vec![0u8; MAX_OPUS_PACKET];
        let len = self.inner.encode(pcm, &mut out)?;
        out.truncate(len);
        Ok(out)
    }

    /// Updates the target bitrate mid-stream, clamped into `[16, 512]` kbps.
    pub fn set_bitrate(&mut self, kbps: i32) -> Result<(), OpusError> {
        self.inner
            .set_bitrate(Bitrate::BitsPerSecond(kbps.clamp(16, 512) * 1024))
    }
}

/// A 48 kHz stereo Opus decoder with loss-concealment support.
pub struct OpusDecoder {
    inner: AudiopusDecoder,
}

impl OpusDecoder {
    /// Builds a fresh decoder.
    pub fn new() -> Result<Self, OpusError> {
        Ok(Self {
            inner: AudiopusDecoder::new(SAMPLE_RATE, Channels::Stereo)?,
        })
    }

    /// Decodes one packet into interleaved stereo PCM.
    ///
    /// With `data = None` the decoder conceals a missing frame (PLC). With
    /// `fec = true` and packet data, the in-band redundancy describing the
    /// *previous* frame is decoded instead of the packet's own audio.
    pub fn decode(&mut self, data: Option<&[u8]>, fec: bool) -> Result<Vec<i16>, OpusError> {
        let samples = match data {
            Some(bytes) => opus_packet::nb_samples(bytes.try_into()?, SAMPLE_RATE)?,
            None => MONO_FRAME_SIZE,
        };

        let mut out = vec![0i16; samples.max(MONO_FRAME_SIZE) * 2];
        let pkt = match data {
            Some(bytes) => Some(bytes.try_into()?),
            None => None,
        };

        let decoded = self.inner.decode(pkt, (&mut out[..]).try_into()?, fec)?;
        out.truncate(2 * decoded);
        Ok(out)
    }

    /// Discards all decoder state, as if freshly constructed.
    pub fn reset(&mut self) -> Result<(), OpusError> {
        self.inner.reset_state()
    }

    /// Sets the decoder output gain in dB, clamped to `[-128, 128]`.
    pub fn set_gain_db(&mut self, db: f32) -> Result<(), OpusError> {
        // Q8 fixed point per the libopus CTL contract.
        let q8 = (db * 256.0).round().clamp(-32_768.0, 32_767.0) as i32;
        self.inner.set_gain(q8)
    }

    /// Sets output volume as a linear multiplier (1.0 = unchanged).
    pub fn set_volume(&mut self, mult: f32) -> Result<(), OpusError> {
        self.set_gain_db(20.0 * mult.max(f32::MIN_POSITIVE).log10())
    }
}

/// Number of Opus frames in a packet.
pub fn nb_frames(packet: &[u8]) -> Result<usize, OpusError> {
    opus_packet::nb_frames(packet.try_into()?)
}

/// Number of channels encoded in a packet.
pub fn nb_channels(packet: &[u8]) -> Result<usize, OpusError> {
    Ok(opus_packet::nb_channels(packet.try_into()?)? as i32 as usize)
}

/// Samples per frame at the pipeline's 48 kHz rate.
pub fn samples_per_frame(packet: &[u8]) -> Result<usize, OpusError> {
    let frames = opus_packet::nb_frames(packet.try_into()?)?;
    let samples = opus_packet::nb_samples(packet.try_into()?, SAMPLE_RATE)?;
    Ok(samples / frames.max(1))
}
