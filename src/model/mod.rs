//! Message model for the voice gateway websocket.
//!
//! Messages are JSON envelopes `{"op": <u8>, "d": <body>, "seq": <u64>?}`;
//! [`Event`] gives them types. Opcodes 21..=31 belong to the end-to-end
//! group protocol and pass through opaquely.

pub mod payload;
pub(crate) mod util;

use payload::*;
use serde::{
    de::{Deserializer, Error as DeError},
    ser::{SerializeStruct, Serializer},
    Deserialize,
    Serialize,
};
use serde_json::Value;

/// A typed voice gateway message.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Event {
    /// 0 — client authentication for a new session.
    Identify(Identify),
    /// 1 — client transport/mode selection.
    SelectProtocol(SelectProtocol),
    /// 2 — server handshake data.
    Ready(Ready),
    /// 3 — client liveness ping.
    Heartbeat(Heartbeat),
    /// 4 — server-issued session key.
    SessionDescription(SessionDescription),
    /// 5 — speaking state update.
    Speaking(Speaking),
    /// 6 — server acknowledgement of a heartbeat.
    HeartbeatAck(HeartbeatAck),
    /// 7 — client re-authentication after an interruption.
    Resume(Resume),
    /// 8 — server liveness parameters.
    Hello(Hello),
    /// 9 — server acknowledgement of a resume.
    Resumed,
    /// 10 — legacy user-join notification.
    ClientConnect(ClientConnect),
    /// 11 — user-leave notification.
    ClientDisconnect(ClientDisconnect),
    /// 21..=31 — opaque group-protocol transition.
    Dave {
        /// The raw opcode.
        opcode: u8,
        /// The untouched message body.
        data: Value,
    },
}

impl Event {
    /// The message's numeric opcode.
    #[must_use]
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Identify(_) => 0,
            Self::SelectProtocol(_) => 1,
            Self::Ready(_) => 2,
            Self::Heartbeat(_) => 3,
            Self::SessionDescription(_) => 4,
            Self::Speaking(_) => 5,
            Self::HeartbeatAck(_) => 6,
            Self::Resume(_) => 7,
            Self::Hello(_) => 8,
            Self::Resumed => 9,
            Self::ClientConnect(_) => 10,
            Self::ClientDisconnect(_) => 11,
            Self::Dave { opcode, .. } => *opcode,
        }
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::Error as SerError;

        let body = match self {
            Self::Identify(d) => serde_json::to_value(d),
            Self::SelectProtocol(d) => serde_json::to_value(d),
            Self::Ready(d) => serde_json::to_value(d),
            Self::Heartbeat(d) => serde_json::to_value(d),
            Self::SessionDescription(d) => serde_json::to_value(d),
            Self::Speaking(d) => serde_json::to_value(d),
            Self::HeartbeatAck(d) => serde_json::to_value(d),
            Self::Resume(d) => serde_json::to_value(d),
            Self::Hello(d) => serde_json::to_value(d),
            Self::Resumed => Ok(Value::Null),
            Self::ClientConnect(d) => serde_json::to_value(d),
            Self::ClientDisconnect(d) => serde_json::to_value(d),
            Self::Dave { data, .. } => Ok(data.clone()),
        }
        .map_err(S::Error::custom)?;

        let mut s = serializer.serialize_struct("Event", 2)?;
        s.serialize_field("op", &self.opcode())?;
        s.serialize_field("d", &body)?;
        s.end()
    }
}

/// An inbound gateway message plus its server sequence number, where the
/// v8 gateway attached one.
#[derive(Clone, Debug, PartialEq)]
pub struct GatewayMsg {
    /// Server sequence number, echoed in heartbeats and resumes.
    pub seq: Option<u64>,
    /// The decoded message.
    pub event: Event,
}

impl<'de> Deserialize<'de> for GatewayMsg {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            op: u8,
            #[serde(default)]
            d: Value,
            #[serde(default)]
            seq: Option<u64>,
        }

        fn body<'de, D: Deserializer<'de>, T: serde::de::DeserializeOwned>(
            d: Value,
        ) -> Result<T, D::Error> {
            serde_json::from_value(d).map_err(D::Error::custom)
        }

        let raw = Raw::deserialize(deserializer)?;
        let event = match raw.op {
            0 => Event::Identify(body::<D, _>(raw.d)?),
            1 => Event::SelectProtocol(body::<D, _>(raw.d)?),
            2 => Event::Ready(body::<D, _>(raw.d)?),
            3 => Event::Heartbeat(body::<D, _>(raw.d)?),
            4 => Event::SessionDescription(body::<D, _>(raw.d)?),
            5 => Event::Speaking(body::<D, _>(raw.d)?),
            6 => Event::HeartbeatAck(body::<D, _>(raw.d)?),
            7 => Event::Resume(body::<D, _>(raw.d)?),
            8 => Event::Hello(body::<D, _>(raw.d)?),
            9 => Event::Resumed,
            10 => Event::ClientConnect(body::<D, _>(raw.d)?),
            11 => Event::ClientDisconnect(body::<D, _>(raw.d)?),
            op @ 21..=31 => Event::Dave {
                opcode: op,
                data: raw.d,
            },
            other => return Err(D::Error::custom(format!("unknown voice opcode {other}"))),
        };

        Ok(Self {
            seq: raw.seq,
            event,
        })
    }
}

/// Whether a websocket close code ends the session for good.
///
/// Fatal closures must surface to the caller rather than trigger a
/// reconnect attempt.
#[must_use]
pub fn is_fatal_close(code: u16) -> bool {
    matches!(code, 4004 | 4010..=4014)
}

/// Named voice gateway close codes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum CloseCode {
    /// 4001.
    UnknownOpcode,
    /// 4002.
    FailedToDecodePayload,
    /// 4003.
    NotAuthenticated,
    /// 4004.
    AuthenticationFailed,
    /// 4005.
    AlreadyAuthenticated,
    /// 4006.
    SessionNoLongerValid,
    /// 4009.
    SessionTimeout,
    /// 4011.
    ServerNotFound,
    /// 4012.
    UnknownProtocol,
    /// 4014.
    Disconnected,
    /// 4015.
    VoiceServerCrashed,
    /// 4016.
    UnknownEncryptionMode,
}

impl CloseCode {
    /// Maps a numeric close code to its name, where one is assigned.
    #[must_use]
    pub fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            4001 => Self::UnknownOpcode,
            4002 => Self::FailedToDecodePayload,
            4003 => Self::NotAuthenticated,
            4004 => Self::AuthenticationFailed,
            4005 => Self::AlreadyAuthenticated,
            4006 => Self::SessionNoLongerValid,
            4009 => Self::SessionTimeout,
            4011 => Self::ServerNotFound,
            4012 => Self::UnknownProtocol,
            4014 => Self::Disconnected,
            4015 => Self::VoiceServerCrashed,
            4016 => Self::UnknownEncryptionMode,
            _ => return None,
        })
    }
}
