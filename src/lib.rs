#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
//! Lyrebird is a voice *receive* system for Discord, written in Rust.
//!
//! The library ingests a real-time RTP/RTCP stream from a voice server,
//! decrypts it under the negotiated AEAD or stream-cipher mode, reorders
//! and gap-fills packets per speaker, decodes Opus to PCM, and delivers
//! per-speaker audio frames into user-supplied [`Sink`] trees — alongside
//! speaking-state and telemetry events.
//!
//! The building blocks:
//!  * [`ConnectionFlow`] assembles credentials from your main-gateway
//!    events, and [`Connection`] runs the voice websocket handshake —
//!    encryption-mode negotiation, IP discovery, keying, resume and
//!    rekey — on your async runtime.
//!  * [`AudioReader`] owns the synchronous data plane: a socket reader
//!    thread, per-speaker jitter buffers and Opus decoders behind a
//!    packet router, a speaking timer, a sink event bus, and a UDP
//!    keep-alive.
//!  * [`Sink`] is the extension point: compose the bundled filter,
//!    fan-out, and ffmpeg sinks, or implement your own.
//!
//! ```no_run
//! use lyrebird::{AudioReader, Config, Connection, ConnectionFlow};
//! # async fn example(mut flow: ConnectionFlow, sink: Box<dyn lyrebird::Sink>) -> Result<(), Box<dyn std::error::Error>> {
//! // Feed both halves of the gateway's voice updates into the flow...
//! let info = flow
//!     .apply_voice_server_update("token".into(), "eu-west1.example.gg".into())
//!     .ok_or("still waiting on the state half")?;
//!
//! // ...then connect and start listening.
//! let conn = Connection::connect(info, Config::default()).await?;
//! let reader = AudioReader::new(&conn, sink)
//!     .after(|err| println!("recording finished: {err:?}"));
//! reader.start()?;
//! # Ok(())
//! # }
//! ```
//!
//! Opus support is provided by [audiopus] (an FFI wrapper for libopus).
//!
//! [audiopus]: https://github.com/lakelezz/audiopus

#![warn(clippy::pedantic, rust_2018_idioms)]
#![allow(
    // Allowed as they are too pedantic
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::too_many_lines,
    clippy::cast_lossless,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

mod config;
pub mod connection;
pub mod constants;
pub mod crypto;
pub mod dave;
pub mod error;
pub mod id;
mod info;
pub mod model;
pub mod opus;
pub mod packet;
pub mod receive;
pub mod sink;
mod ws;

pub use crate::{
    config::Config,
    connection::{Connection, SsrcTracker},
    crypto::CryptoMode,
    error::{ConnectionError, ReadError},
    info::{ConnectionFlow, ConnectionInfo, FlowState},
    receive::AudioReader,
    sink::{Sink, SinkEvent, SinkEventKind, VoiceData},
};
