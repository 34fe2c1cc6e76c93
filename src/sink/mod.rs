//! The sink contract: user-composable consumers of decoded voice.
//!
//! Sinks form a tree — wrappers such as [`FilterSink`] hold one child,
//! [`MultiSink`] fans out to several — and the packet router writes each
//! decoded frame into the root. Exclusive ownership (`Box<dyn Sink>`) makes
//! the at-most-once registration rule structural: a sink cannot appear in
//! two places of a tree.

pub mod ffmpeg;
pub mod filter;
pub mod multi;

pub use self::{
    ffmpeg::FfmpegSink,
    filter::{FilterSink, FilteringMode},
    multi::MultiSink,
};

use crate::{
    id::{GuildId, UserId},
    packet::{AudioPacket, RtcpPacket},
};
use byteorder::{ByteOrder, LittleEndian};

/// One frame of per-speaker audio, as delivered to [`Sink::write`].
#[derive(Clone, Debug, PartialEq)]
pub struct VoiceData {
    /// The packet behind this frame; synthetic for concealed losses.
    pub packet: AudioPacket,
    /// The speaking user, when the SSRC has been announced.
    pub user: Option<UserId>,
    /// Decoded 48 kHz interleaved stereo PCM; `None` when the sink asked
    /// for Opus passthrough.
    pub pcm: Option<Vec<i16>>,
}

impl VoiceData {
    /// The frame's Opus bytes, where the packet carries any.
    #[must_use]
    pub fn opus(&self) -> Option<&[u8]> {
        self.packet.opus_payload()
    }

    /// The PCM frame serialised as little-endian signed 16-bit bytes.
    #[must_use]
    pub fn pcm_bytes(&self) -> Option<Vec<u8>> {
        self.pcm.as_ref().map(|pcm| {
            let mut out = vec![0u8; pcm.len() * 2];
            LittleEndian::write_i16_into(pcm, &mut out);
            out
        })
    }
}

/// Lifecycle event classes a sink can subscribe to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum SinkEventKind {
    /// Telemetry packet received.
    RtcpPacket,
    /// A member began speaking.
    SpeakingStart,
    /// A member fell silent.
    SpeakingStop,
    /// A member joined the call (legacy notification).
    ClientConnect,
    /// A member left the call.
    ClientDisconnect,
}

/// A lifecycle event delivered through the sink event router.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum SinkEvent {
    /// Telemetry packet received on the voice transport.
    RtcpPacket {
        /// The parsed report.
        packet: RtcpPacket,
        /// The call's guild.
        guild_id: GuildId,
    },
    /// Packets started arriving for a member's stream.
    SpeakingStart {
        /// The stream in question.
        ssrc: u32,
        /// Its owner.
        user: UserId,
    },
    /// A member's stream went quiet for the speaking timeout.
    SpeakingStop {
        /// The stream in question.
        ssrc: u32,
        /// Its owner.
        user: UserId,
    },
    /// A member joined the call.
    ClientConnect {
        /// The joining member.
        user: UserId,
    },
    /// A member left the call.
    ClientDisconnect {
        /// The departing member.
        user: UserId,
    },
}

impl SinkEvent {
    /// The event's class, for listener filtering.
    #[must_use]
    pub fn kind(&self) -> SinkEventKind {
        match self {
            Self::RtcpPacket { .. } => SinkEventKind::RtcpPacket,
            Self::SpeakingStart { .. } => SinkEventKind::SpeakingStart,
            Self::SpeakingStop { .. } => SinkEventKind::SpeakingStop,
            Self::ClientConnect { .. } => SinkEventKind::ClientConnect,
            Self::ClientDisconnect { .. } => SinkEventKind::ClientDisconnect,
        }
    }
}

/// A consumer of per-speaker voice frames.
///
/// Implementations must tolerate `cleanup` running more than once; the
/// reader guarantees to invoke it exactly once per teardown, but a sink
/// may also be cleaned up by its own drop logic.
pub trait Sink: Send {
    /// Whether this sink wants undecoded Opus instead of PCM.
    ///
    /// Queried when a stream's decoder is created; flipping the answer
    /// mid-stream has no effect on existing decoders.
    fn is_opus(&self) -> bool {
        false
    }

    /// Consumes one frame for one speaker.
    fn write(&mut self, user: Option<UserId>, data: &VoiceData);

    /// Releases held resources. Idempotent.
    fn cleanup(&mut self);

    /// Visits each direct child. Leaves need not implement this.
    fn for_each_child(&mut self, _f: &mut dyn FnMut(&mut dyn Sink)) {}

    /// The event classes this sink's [`on_event`] cares about.
    ///
    /// [`on_event`]: Sink::on_event
    fn listens_to(&self) -> &'static [SinkEventKind] {
        &[]
    }

    /// Receives a subscribed lifecycle event.
    fn on_event(&mut self, _event: &SinkEvent) {}
}

/// Depth-first traversal over a sink tree.
pub fn walk(sink: &mut dyn Sink, with_self: bool, f: &mut dyn FnMut(&mut dyn Sink)) {
    if with_self {
        f(sink);
    }

    sink.for_each_child(&mut |child| walk(child, true, f));
}
