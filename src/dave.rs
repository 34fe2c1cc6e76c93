//! Hook for the end-to-end group encryption protocol ("DAVE").
//!
//! The MLS machinery itself lives outside this crate; implementors plug a
//! session in through [`DaveSession`] and the pipeline applies its
//! passthrough decryption to frames from eligible users after transport
//! decryption. Gateway opcodes 21..=31 are forwarded verbatim.

use crate::id::UserId;
use serde_json::Value;
use std::{error::Error as StdError, fmt};

/// Media classes a group session can decrypt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum MediaType {
    /// Voice frames.
    Audio,
}

/// An externally managed end-to-end encryption session.
pub trait DaveSession: Send + Sync {
    /// Whether the session has completed its welcome/commit handshake and
    /// may be applied to media.
    fn is_ready(&self) -> bool;

    /// Whether frames from `user` can be passed through this session.
    fn can_passthrough(&self, user: UserId) -> bool;

    /// Decrypts one frame from `user`.
    fn decrypt(&self, user: UserId, media: MediaType, frame: &[u8]) -> Result<Vec<u8>, DaveError>;

    /// Receives one of the opaque group-protocol transition frames
    /// (opcodes 21..=31) from the voice gateway.
    fn handle_frame(&self, _opcode: u8, _payload: &Value) {}
}

/// Failure inside a group session.
#[derive(Clone, Debug)]
pub struct DaveError(pub String);

impl fmt::Display for DaveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl StdError for DaveError {}
