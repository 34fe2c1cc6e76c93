//! Constants governing the voice receive pipeline and protocol handling.

use audiopus::SampleRate;
use std::time::Duration;

/// The voice gateway version spoken by the library.
pub const VOICE_GATEWAY_VERSION: u8 = 8;

/// Sample rate of all audio moving through the pipeline.
pub const SAMPLE_RATE: SampleRate = SampleRate::Hz48000;

/// Sample rate of all audio moving through the pipeline.
pub const SAMPLE_RATE_RAW: usize = 48_000;

/// Number of audio frames/packets received per second per stream.
pub const AUDIO_FRAME_RATE: usize = 50;

/// Length (in milliseconds) of any audio frame.
pub const FRAME_LEN_MS: usize = 1000 / AUDIO_FRAME_RATE;

/// Number of samples in one complete frame of audio per channel.
///
/// This is equally the number of stereo (joint) samples in an audio frame.
pub const MONO_FRAME_SIZE: usize = SAMPLE_RATE_RAW / AUDIO_FRAME_RATE;

/// Number of individual samples in one complete frame of stereo audio.
pub const STEREO_FRAME_SIZE: usize = 2 * MONO_FRAME_SIZE;

/// Number of bytes in one complete frame of s16-le stereo PCM.
pub const PCM_FRAME_BYTE_SIZE: usize = STEREO_FRAME_SIZE * std::mem::size_of::<i16>();

/// Opus silent frame, sent to signal speech start and end.
pub const SILENT_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];

/// The one (and only) RTP version.
pub const RTP_VERSION: u8 = 2;

/// Size of an RTP header before any CSRCs or extensions.
pub const RTP_HEADER_SIZE: usize = 12;

/// Size of the RTCP header treated as associated data during decryption.
pub const RTCP_HEADER_SIZE: usize = 8;

/// Receive buffer size for datagrams read off the voice socket.
pub const UDP_RECV_BUFFER_SIZE: usize = 2048;

/// Exact length of an IP discovery request/response datagram.
pub const DISCOVERY_PACKET_SIZE: usize = 74;

/// Poll timeout used by the socket event reader between wakeups.
pub const SOCKET_POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay between sends of UDP keepalive frames.
///
/// A receive-only client generates no outgoing media, so the NAT mapping
/// stays warm only through this fixed 5-second cadence.
pub const UDP_KEEPALIVE_GAP: Duration = Duration::from_millis(5_000);

/// Quiet period after which a stream is deemed to have stopped speaking.
pub const SPEAKING_TIMEOUT_DELAY: Duration = Duration::from_millis(200);

/// Blocking interval of the sink event router's queue reads.
pub const EVENT_QUEUE_TIMEOUT: Duration = Duration::from_millis(500);

/// Forward sequence distance beyond which a packet is considered stale
/// and silently discarded by the jitter buffer.
pub const JITTER_DROP_THRESHOLD: u16 = 10_000;

/// Number of recently destroyed SSRCs remembered so that their in-flight
/// packets are dropped rather than resurrecting a decoder.
pub const DROPPED_SSRC_RING_SIZE: usize = 16;

/// Consecutive Opus decode failures tolerated for one stream before its
/// decoder state is rebuilt.
pub const OPUS_DECODE_STRIKE_LIMIT: u8 = 3;

/// Grace period for transcoder child processes to exit during sink cleanup.
pub const CHILD_KILL_GRACE: Duration = Duration::from_secs(5);
