//! Voice connection errors and convenience types.

use crate::{crypto::CryptoError, ws::Error as WsError};
use serde_json::Error as JsonError;
use std::{error::Error as StdError, fmt, io::Error as IoError};
use tokio::time::error::Elapsed;

/// Errors encountered while connecting to, or holding a session with, a
/// voice server.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The websocket was closed with a code that forbids resumption.
    Closed(Option<u16>),
    /// An error occurred inside the packet decryption layer.
    Crypto(CryptoError),
    /// Server did not return the negotiated crypto mode.
    CryptoModeInvalid,
    /// No mutually supported crypto mode was offered by the server.
    CryptoModeUnavailable,
    /// An indicator that an endpoint URL was invalid.
    EndpointUrl,
    /// The server's reply to IP discovery did not follow the protocol.
    IllegalDiscoveryResponse,
    /// Could not parse the server's view of our IP.
    IllegalIp,
    /// Miscellaneous I/O error.
    Io(IoError),
    /// JSON (de)serialization error.
    Json(JsonError),
    /// Error communicating with the voice server over websocket.
    Ws(WsError),
    /// Connection attempt timed out.
    TimedOut,
}

impl From<CryptoError> for Error {
    fn from(e: CryptoError) -> Self {
        Error::Crypto(e)
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Error {
        Error::Io(e)
    }
}

impl From<JsonError> for Error {
    fn from(e: JsonError) -> Error {
        Error::Json(e)
    }
}

impl From<WsError> for Error {
    fn from(e: WsError) -> Error {
        Error::Ws(e)
    }
}

impl From<Elapsed> for Error {
    fn from(_e: Elapsed) -> Error {
        Error::TimedOut
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to connect to voice server: ")?;
        match self {
            Self::Closed(Some(code)) => write!(f, "websocket closed fatally with code {code}"),
            Self::Closed(None) => write!(f, "websocket closed fatally"),
            Self::Crypto(e) => e.fmt(f),
            Self::CryptoModeInvalid => write!(f, "server changed negotiated encryption mode"),
            Self::CryptoModeUnavailable => {
                write!(f, "server offered no supported encryption mode")
            },
            Self::EndpointUrl => write!(f, "endpoint URL received from gateway was invalid"),
            Self::IllegalDiscoveryResponse => {
                write!(f, "IP discovery/NAT punching response was invalid")
            },
            Self::IllegalIp => write!(f, "IP discovery/NAT punching response had bad IP value"),
            Self::Io(e) => e.fmt(f),
            Self::Json(e) => e.fmt(f),
            Self::Ws(e) => write!(f, "websocket issue ({e:?})."),
            Self::TimedOut => write!(f, "connection attempt timed out"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Closed(_)
            | Error::CryptoModeInvalid
            | Error::CryptoModeUnavailable
            | Error::EndpointUrl
            | Error::IllegalDiscoveryResponse
            | Error::IllegalIp
            | Error::Ws(_)
            | Error::TimedOut => None,
            Error::Crypto(e) => Some(e),
            Error::Io(e) => Some(e),
            Error::Json(e) => Some(e),
        }
    }
}

/// Convenience type for voice connection error handling.
pub type Result<T> = std::result::Result<T, Error>;
