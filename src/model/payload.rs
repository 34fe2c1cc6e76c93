//! Bodies of the voice gateway messages the library sends and receives.

use super::util::{snowflake, snowflake_opt};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Opening authentication message for a fresh session.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Identify {
    /// The guild whose voice server we are joining.
    #[serde(with = "snowflake")]
    pub server_id: u64,
    /// Our own user.
    #[serde(with = "snowflake")]
    pub user_id: u64,
    /// Session identifier issued over the main gateway.
    pub session_id: String,
    /// Ephemeral voice token issued over the main gateway.
    pub token: String,
}

/// Re-authentication message for an interrupted session.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Resume {
    /// The guild whose voice server we are rejoining.
    #[serde(with = "snowflake")]
    pub server_id: u64,
    /// Session identifier issued over the main gateway.
    pub session_id: String,
    /// Ephemeral voice token issued over the main gateway.
    pub token: String,
    /// Last gateway sequence number we processed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq_ack: Option<u64>,
}

/// Server handshake response carrying our stream identity and transport
/// candidates.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Ready {
    /// SSRC assigned to our own outbound stream.
    pub ssrc: u32,
    /// UDP endpoint address.
    pub ip: IpAddr,
    /// UDP endpoint port.
    pub port: u16,
    /// Encryption modes the server supports, most favoured first.
    pub modes: Vec<String>,
    /// Legacy field; the authoritative interval arrives in `hello`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<f64>,
}

/// Server liveness parameters.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Hello {
    /// Interval between heartbeats, in milliseconds.
    pub heartbeat_interval: f64,
}

/// Client liveness ping.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Heartbeat {
    /// Client-chosen nonce, echoed in the acknowledgement.
    pub t: u64,
    /// Last gateway sequence number we processed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq_ack: Option<u64>,
}

/// Server acknowledgement of a [`Heartbeat`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct HeartbeatAck {
    /// Nonce of the heartbeat being acknowledged.
    pub t: u64,
}

/// Client transport and encryption selection.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SelectProtocol {
    /// Always `"udp"`.
    pub protocol: String,
    /// Discovered external endpoint plus chosen mode.
    pub data: ProtocolData,
}

/// Body of [`SelectProtocol`].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProtocolData {
    /// Our externally visible address, from IP discovery.
    pub address: IpAddr,
    /// Our externally visible port, from IP discovery.
    pub port: u16,
    /// The negotiated encryption mode's protocol name.
    pub mode: String,
}

/// Final handshake message carrying the session's symmetric key.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SessionDescription {
    /// The mode the server settled on; must equal our request.
    pub mode: String,
    /// 32-byte transport key.
    pub secret_key: Vec<u8>,
}

/// A user's transmission state changed; also the SSRC↔user binding source.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Speaking {
    /// Bitflags; bit 0 is the microphone.
    pub speaking: u8,
    /// Optional client-declared latency figure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u32>,
    /// The stream this update describes.
    pub ssrc: u32,
    /// The owning user; present on server-sent updates.
    #[serde(default, with = "snowflake_opt", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,
}

/// Legacy notification that a user joined the call.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct ClientConnect {
    /// The joining user.
    #[serde(with = "snowflake")]
    pub user_id: u64,
    /// The stream they will transmit on, when announced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_ssrc: Option<u32>,
}

/// Notification that a user left the call.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct ClientDisconnect {
    /// The departing user.
    #[serde(with = "snowflake")]
    pub user_id: u64,
}
