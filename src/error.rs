//! Receive-pipeline and connection error handling.

pub use crate::connection::error::{Error as ConnectionError, Result as ConnectionResult};

use crate::{crypto::CryptoError, packet::PacketError};
use audiopus::Error as OpusError;
use std::{error::Error as StdError, fmt, io::Error as IoError};

/// Errors raised while a reader ingests and decodes voice traffic.
#[derive(Debug)]
#[non_exhaustive]
pub enum ReadError {
    /// `start` was called on a reader that is already listening.
    AlreadyListening,
    /// The underlying voice session failed fatally.
    Connection(ConnectionError),
    /// Packet decryption failed in a way that indicates a broken session
    /// rather than one bad packet.
    Crypto(CryptoError),
    /// Miscellaneous I/O error.
    Io(IoError),
    /// The Opus codec refused to build or decode.
    Opus(OpusError),
    /// A packet's framing could not be interpreted.
    Packet(PacketError),
}

impl From<ConnectionError> for ReadError {
    fn from(e: ConnectionError) -> Self {
        Self::Connection(e)
    }
}

impl From<CryptoError> for ReadError {
    fn from(e: CryptoError) -> Self {
        Self::Crypto(e)
    }
}

impl From<IoError> for ReadError {
    fn from(e: IoError) -> Self {
        Self::Io(e)
    }
}

impl From<OpusError> for ReadError {
    fn from(e: OpusError) -> Self {
        Self::Opus(e)
    }
}

impl From<PacketError> for ReadError {
    fn from(e: PacketError) -> Self {
        Self::Packet(e)
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyListening => write!(f, "the audio reader is already listening"),
            Self::Connection(e) => e.fmt(f),
            Self::Crypto(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Opus(e) => write!(f, "opus codec failure: {e}"),
            Self::Packet(e) => e.fmt(f),
        }
    }
}

impl StdError for ReadError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::AlreadyListening => None,
            Self::Connection(e) => Some(e),
            Self::Crypto(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::Opus(e) => Some(e),
            Self::Packet(e) => Some(e),
        }
    }
}

/// Convenience type for reader error handling.
pub type ReadResult<T> = Result<T, ReadError>;
