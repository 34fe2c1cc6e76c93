//! Per-speaker decode state: one jitter buffer plus one Opus decoder.

use super::jitter::{JitterBuffer, Popped};
use crate::{
    config::Config,
    connection::SsrcTracker,
    constants::*,
    id::UserId,
    opus::OpusDecoder,
    packet::{
        wrap::{seq_add, ts_add},
        AudioPacket,
        FakePacket,
        RtpPacket,
        SilencePacket,
    },
    sink::VoiceData,
};
use audiopus::Error as OpusError;
use std::time::Duration;
use tracing::{debug, warn};

/// Owns the reorder and decode state for a single stream.
///
/// Created lazily by the router on the stream's first packet; destroyed
/// when its user leaves the call.
pub(crate) struct PacketDecoder {
    ssrc: u32,
    passthrough: bool,
    buffer: JitterBuffer,
    decoder: Option<OpusDecoder>,
    cached_user: Option<UserId>,
    last_seq: Option<u16>,
    last_ts: Option<u32>,
    /// A packet recovered by a tail flush that is not yet sequential;
    /// synthetic frames bridge up to it one `pop_data` at a time.
    pending: Option<RtpPacket>,
    strikes: u8,
}

impl PacketDecoder {
    pub(crate) fn new(ssrc: u32, passthrough: bool, config: &Config) -> Result<Self, OpusError> {
        Ok(Self {
            ssrc,
            passthrough,
            buffer: JitterBuffer::new(config),
            decoder: if passthrough {
                None
            } else {
                Some(OpusDecoder::new()?)
            },
            cached_user: None,
            last_seq: None,
            last_ts: None,
            pending: None,
            strikes: 0,
        })
    }

    /// Stores an arrived packet for later release.
    pub(crate) fn push_packet(&self, packet: RtpPacket) {
        self.buffer.push(packet);
    }

    /// Whether `pop_data` could currently produce a frame without waiting.
    pub(crate) fn has_frame(&self) -> bool {
        self.pending.is_some() || self.buffer.is_ready()
    }

    pub(crate) fn set_user(&mut self, user: UserId) {
        self.cached_user = Some(user);
    }

    /// Produces the next frame for this stream, if one is due.
    ///
    /// Losses surface as synthetic frames: FEC-decoded when the packet
    /// right after the hole is at hand, concealed otherwise.
    pub(crate) fn pop_data(
        &mut self,
        tracker: &SsrcTracker,
        timeout: Duration,
    ) -> Option<VoiceData> {
        if let Some(pending) = self.pending.take() {
            return Some(self.step_towards(pending, tracker));
        }

        match self.buffer.pop(timeout) {
            Some(Popped::Packet(packet)) => Some(self.process_packet(packet, tracker)),
            Some(Popped::Placeholder) => {
                let fec = self.buffer.peek_next().and_then(|next| next.payload);
                Some(self.synthesize(fec, tracker))
            },
            None if self.buffer.is_empty() => None,
            None => {
                debug!(
                    "Flushing {} stalled packets (forward gap {}) in decoder-{}",
                    self.buffer.len(),
                    self.buffer.gap(),
                    self.ssrc,
                );

                let mut flushed = self.buffer.flush();
                if flushed.len() > 1 {
                    warn!(
                        "{} packets were lost being flushed in decoder-{}",
                        flushed.len() - 1,
                        self.ssrc,
                    );
                }

                let head = flushed.drain(..).next()?;
                Some(self.step_towards(head, tracker))
            },
        }
    }

    /// Rebuilds the Opus decoder and forgets all reorder state.
    pub(crate) fn reset(&mut self) {
        self.buffer.reset();
        self.decoder = if self.passthrough {
            None
        } else {
            OpusDecoder::new()
                .map_err(|e| warn!("Could not rebuild Opus decoder: {e}."))
                .ok()
        };
        self.pending = None;
        self.last_seq = None;
        self.last_ts = None;
        self.strikes = 0;
    }

    /// Emits `target` if it is next in line, otherwise one synthetic frame
    /// bridging towards it.
    fn step_towards(&mut self, target: RtpPacket, tracker: &SsrcTracker) -> VoiceData {
        let sequential = match self.last_seq {
            None => true,
            Some(last) => seq_add(last, 1) == target.sequence,
        };

        if sequential {
            return self.process_packet(target, tracker);
        }

        let next_seq = self.last_seq.map(|last| seq_add(last, 1)).unwrap_or_default();
        let fec = (seq_add(next_seq, 1) == target.sequence)
            .then(|| target.payload.clone())
            .flatten();

        let out = self.synthesize(fec, tracker);
        self.pending = Some(target);
        out
    }

    fn process_packet(&mut self, packet: RtpPacket, tracker: &SsrcTracker) -> VoiceData {
        let user = self.resolve_user(tracker);

        let pcm = if self.passthrough {
            None
        } else {
            Some(self.decode_packet(&packet))
        };

        self.last_seq = Some(packet.sequence);
        self.last_ts = Some(packet.timestamp);

        VoiceData {
            packet: AudioPacket::Rtp(packet),
            user,
            pcm,
        }
    }

    fn decode_packet(&mut self, packet: &RtpPacket) -> Vec<i16> {
        let Some(decoder) = self.decoder.as_mut() else {
            return silence_frame();
        };

        let result = match packet.payload.as_deref() {
            Some(payload) => decoder.decode(Some(payload), false),
            None => decoder.decode(None, false),
        };

        match result {
            Ok(pcm) => {
                self.strikes = 0;
                pcm
            },
            Err(e) => {
                warn!("Opus decode failed for ssrc {}: {e}.", self.ssrc);
                self.strikes += 1;

                if self.strikes >= OPUS_DECODE_STRIKE_LIMIT {
                    debug!("Resetting decoder-{} after repeated failures.", self.ssrc);
                    self.reset();
                }

                silence_frame()
            },
        }
    }

    /// Builds one synthetic frame continuing the emitted sequence.
    fn synthesize(&mut self, fec: Option<Vec<u8>>, tracker: &SsrcTracker) -> VoiceData {
        let user = self.resolve_user(tracker);
        let sequence = self.last_seq.map(|last| seq_add(last, 1)).unwrap_or_default();
        let timestamp = self
            .last_ts
            .map(|last| ts_add(last, MONO_FRAME_SIZE as u32))
            .unwrap_or_default();

        let (packet, pcm) = if self.passthrough {
            (
                AudioPacket::Silence(SilencePacket {
                    ssrc: self.ssrc,
                    sequence,
                    timestamp,
                }),
                None,
            )
        } else {
            (
                AudioPacket::Fake(FakePacket {
                    ssrc: self.ssrc,
                    sequence,
                    timestamp,
                }),
                Some(self.conceal(fec)),
            )
        };

        self.last_seq = Some(sequence);
        self.last_ts = Some(timestamp);

        VoiceData { packet, user, pcm }
    }

    fn conceal(&mut self, fec: Option<Vec<u8>>) -> Vec<i16> {
        let Some(decoder) = self.decoder.as_mut() else {
            return silence_frame();
        };

        let result = match fec.as_deref() {
            Some(next) => {
                debug!("Recovering lost frame via FEC in decoder-{}.", self.ssrc);
                decoder.decode(Some(next), true)
            },
            None => decoder.decode(None, false),
        };

        result.unwrap_or_else(|e| {
            warn!("Loss concealment failed for ssrc {}: {e}.", self.ssrc);
            silence_frame()
        })
    }

    fn resolve_user(&mut self, tracker: &SsrcTracker) -> Option<UserId> {
        if self.cached_user.is_none() {
            self.cached_user = tracker.user(self.ssrc);
        }
        self.cached_user
    }

    #[cfg(test)]
    pub(crate) fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

fn silence_frame() -> Vec<i16> {
    vec![0i16; STEREO_FRAME_SIZE]
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::receive::test_util::{encoded_frames, opus_packet, test_packet};

    fn decoder(config: &Config) -> PacketDecoder {
        PacketDecoder::new(1, false, config).unwrap()
    }

    fn drain(dec: &mut PacketDecoder, tracker: &SsrcTracker) -> Vec<VoiceData> {
        let mut out = Vec::new();
        while let Some(data) = dec.pop_data(tracker, Duration::ZERO) {
            out.push(data);
        }
        out
    }

    fn sequences(frames: &[VoiceData]) -> Vec<u16> {
        frames.iter().map(|f| f.packet.sequence()).collect()
    }

    #[test]
    fn clean_stream_delivers_every_frame() {
        // S1: ten packets in, ten PCM frames out, in order.
        let config = Config::default();
        let tracker = SsrcTracker::default();
        let mut dec = decoder(&config);

        let payloads = encoded_frames(10);
        for (i, payload) in payloads.into_iter().enumerate() {
            let seq = 100 + i as u16;
            dec.push_packet(opus_packet(1, seq, 48_000 * i as u32, payload));
        }

        let frames = drain(&mut dec, &tracker);
        assert_eq!(
            sequences(&frames),
            (100..110).collect::<Vec<u16>>()
        );
        for frame in &frames {
            assert!(!frame.packet.is_synthetic());
            assert_eq!(frame.pcm.as_ref().unwrap().len(), STEREO_FRAME_SIZE);
        }
    }

    #[test]
    fn reorder_within_window_is_corrected() {
        // S2: 100, 101, 103, 102, 104 in; 100..=104 out.
        let config = Config::default();
        let tracker = SsrcTracker::default();
        let mut dec = decoder(&config);

        let payloads = encoded_frames(5);
        for (payload, seq) in payloads.into_iter().zip([100u16, 101, 103, 102, 104]) {
            dec.push_packet(opus_packet(1, seq, u32::from(seq) * 960, payload));
        }

        let frames = drain(&mut dec, &tracker);
        assert_eq!(sequences(&frames), vec![100, 101, 102, 103, 104]);
        assert!(frames.iter().all(|f| !f.packet.is_synthetic()));
    }

    #[test]
    fn single_loss_synthesises_one_fec_frame() {
        // S3: 100, 101, 103 in; the hole at 102 is bridged by exactly one
        // synthetic frame, recovered from packet 103's redundancy.
        let config = Config::default();
        let tracker = SsrcTracker::default();
        let mut dec = decoder(&config);

        let payloads = encoded_frames(3);
        for (payload, seq) in payloads.into_iter().zip([100u16, 101, 103]) {
            dec.push_packet(opus_packet(1, seq, u32::from(seq) * 960, payload));
        }

        let frames = drain(&mut dec, &tracker);
        assert_eq!(sequences(&frames), vec![100, 101, 102, 103]);

        assert!(frames[2].packet.is_synthetic());
        assert_eq!(frames[2].packet.timestamp(), 101 * 960 + 960);
        assert_eq!(frames[2].pcm.as_ref().unwrap().len(), STEREO_FRAME_SIZE);
        assert!(!frames[3].packet.is_synthetic());
    }

    #[test]
    fn prolonged_loss_bridges_every_missing_frame() {
        // S4: 100 then 110; nine synthetic frames bridge the hole.
        let config = Config::default();
        let tracker = SsrcTracker::default();
        let mut dec = decoder(&config);

        let mut payloads = encoded_frames(2).into_iter();
        dec.push_packet(opus_packet(1, 100, 96_000, payloads.next().unwrap()));
        dec.push_packet(opus_packet(1, 110, 96_000 + 10 * 960, payloads.next().unwrap()));

        let frames = drain(&mut dec, &tracker);
        assert_eq!(
            sequences(&frames),
            (100..=110).collect::<Vec<u16>>()
        );

        for frame in &frames[1..10] {
            assert!(frame.packet.is_synthetic());
            assert_eq!(frame.pcm.as_ref().unwrap().len(), STEREO_FRAME_SIZE);
        }
        assert!(!frames[10].packet.is_synthetic());
    }

    #[test]
    fn sequence_wrap_passes_straight_through() {
        // S5: 65534, 65535, 0, 1 — no drops, no synthesis.
        let config = Config::default();
        let tracker = SsrcTracker::default();
        let mut dec = decoder(&config);

        let payloads = encoded_frames(4);
        for (payload, seq) in payloads.into_iter().zip([65_534u16, 65_535, 0, 1]) {
            dec.push_packet(opus_packet(1, seq, u32::from(seq) * 960, payload));
        }

        let frames = drain(&mut dec, &tracker);
        assert_eq!(sequences(&frames), vec![65_534, 65_535, 0, 1]);
        assert!(frames.iter().all(|f| !f.packet.is_synthetic()));
    }

    #[test]
    fn stale_packet_never_reaches_the_sink() {
        // S6: after releasing 200, a late 199 is rejected outright.
        let config = Config::default();
        let tracker = SsrcTracker::default();
        let mut dec = decoder(&config);

        let payloads = encoded_frames(2);
        dec.push_packet(opus_packet(1, 200, 0, payloads[0].clone()));
        let first = drain(&mut dec, &tracker);
        assert_eq!(sequences(&first), vec![200]);

        dec.push_packet(opus_packet(1, 199, 0, payloads[1].clone()));
        assert_eq!(dec.buffered(), 0);
        assert!(drain(&mut dec, &tracker).is_empty());
    }

    #[test]
    fn repeated_decode_failures_reset_the_decoder() {
        let config = Config::default().jitter_prefill(0).jitter_pref_size(0);
        let tracker = SsrcTracker::default();
        let mut dec = decoder(&config);

        for seq in 0..u16::from(OPUS_DECODE_STRIKE_LIMIT) {
            // Zero-length packets cannot be legal Opus.
            dec.push_packet(opus_packet(1, seq, 0, Vec::new()));
            let frame = dec.pop_data(&tracker, Duration::ZERO).unwrap();
            let pcm = frame.pcm.unwrap();
            assert_eq!(pcm.len(), STEREO_FRAME_SIZE);
            assert!(pcm.iter().all(|&s| s == 0), "silence substituted");
        }

        // The third failure rebuilt the decoder and cleared all state.
        assert_eq!(dec.buffered(), 0);
        assert_eq!(dec.strikes, 0);
    }

    #[test]
    fn passthrough_skips_decode_and_emits_silence_packets() {
        let config = Config::default();
        let tracker = SsrcTracker::default();
        let mut dec = PacketDecoder::new(1, true, &config).unwrap();

        dec.push_packet(test_packet(1, 10, 9_600));
        dec.push_packet(test_packet(1, 12, 9_600 + 1_920));

        let frames = drain(&mut dec, &tracker);
        assert_eq!(sequences(&frames), vec![10, 11, 12]);

        assert!(frames.iter().all(|f| f.pcm.is_none()));
        assert!(matches!(frames[1].packet, AudioPacket::Silence(_)));
        assert_eq!(frames[1].opus(), Some(&SILENT_FRAME[..]));
    }

    #[test]
    fn users_resolve_through_the_tracker() {
        let config = Config::default();
        let tracker = SsrcTracker::default();
        let mut dec = decoder(&config);

        let payloads = encoded_frames(2);
        dec.push_packet(opus_packet(1, 5, 0, payloads[0].clone()));
        dec.push_packet(opus_packet(1, 6, 960, payloads[1].clone()));

        let alice = UserId::new(99).unwrap();
        tracker.insert(1, alice);

        let frames = drain(&mut dec, &tracker);
        assert!(frames.iter().all(|f| f.user == Some(alice)));
    }
}
