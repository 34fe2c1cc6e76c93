//! Assembly of voice connection credentials from main-gateway events.

use crate::id::{ChannelId, GuildId, UserId};
use std::fmt;

/// Everything needed to open a voice websocket session.
///
/// The host's main gateway delivers this in two halves — a voice *state*
/// update (session) and a voice *server* update (endpoint + token) — in
/// either order; [`ConnectionFlow`] stitches them together.
#[derive(Clone, Eq, PartialEq)]
pub struct ConnectionInfo {
    /// The voice channel being joined, when known.
    pub channel_id: Option<ChannelId>,
    /// Hostname of the allocated voice server.
    pub endpoint: String,
    /// Guild owning the voice channel.
    pub guild_id: GuildId,
    /// Session identifier from the voice state update.
    pub session_id: String,
    /// Ephemeral token from the voice server update.
    pub token: String,
    /// The connecting user.
    pub user_id: UserId,
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("channel_id", &self.channel_id)
            .field("endpoint", &self.endpoint)
            .field("guild_id", &self.guild_id)
            .field("session_id", &self.session_id)
            .field("token", &"<hidden>")
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Progress of a voice connection, from the gateway request through the
/// completed handshake.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[non_exhaustive]
pub enum FlowState {
    /// No connection requested or in progress.
    Disconnected,
    /// The host asked its gateway to move us into a voice channel.
    SetGuildVoiceState,
    /// The session half of the credentials has arrived.
    GotVoiceStateUpdate,
    /// The endpoint half of the credentials has arrived.
    GotVoiceServerUpdate,
    /// Both halves are present; the websocket may open.
    GotBothVoiceUpdates,
    /// The websocket handshake has begun.
    WebsocketConnected,
    /// The server's `ready` has been seen.
    GotWebsocketReady,
    /// Our external address is known.
    GotIpDiscovery,
    /// Media may flow.
    Connected,
}

/// Accumulates main-gateway updates until a [`ConnectionInfo`] can be built.
#[derive(Clone, Debug)]
pub struct ConnectionFlow {
    state: FlowState,
    guild_id: GuildId,
    user_id: UserId,
    channel_id: Option<ChannelId>,
    session_id: Option<String>,
    endpoint: Option<String>,
    token: Option<String>,
}

impl ConnectionFlow {
    /// Starts tracking a connection for one guild.
    #[must_use]
    pub fn new(guild_id: GuildId, user_id: UserId) -> Self {
        Self {
            state: FlowState::Disconnected,
            guild_id,
            user_id,
            channel_id: None,
            session_id: None,
            endpoint: None,
            token: None,
        }
    }

    /// Current position in the connection ladder.
    #[must_use]
    pub fn state(&self) -> FlowState {
        self.state
    }

    /// Records that the host has requested a voice-state change towards
    /// `channel_id`, discarding any stale credentials.
    pub fn start(&mut self, channel_id: ChannelId) {
        self.state = FlowState::SetGuildVoiceState;
        self.channel_id = Some(channel_id);
        self.session_id = None;
        self.endpoint = None;
        self.token = None;
    }

    /// Feeds in the session half of the credentials.
    ///
    /// A `None` channel means the user was removed from voice; the flow
    /// resets. Returns complete credentials once both halves are present.
    pub fn apply_voice_state_update(
        &mut self,
        session_id: String,
        channel_id: Option<ChannelId>,
    ) -> Option<ConnectionInfo> {
        let Some(channel_id) = channel_id else {
            self.reset();
            return None;
        };

        if self.channel_id != Some(channel_id) {
            // Moved by an admin: endpoint data for the old channel's server
            // may no longer hold.
            self.start(channel_id);
        }

        self.channel_id = Some(channel_id);
        self.session_id = Some(session_id);
        self.state = if self.token.is_some() {
            FlowState::GotBothVoiceUpdates
        } else {
            FlowState::GotVoiceStateUpdate
        };

        self.try_complete()
    }

    /// Feeds in the endpoint half of the credentials.
    ///
    /// Returns complete credentials once both halves are present.
    pub fn apply_voice_server_update(
        &mut self,
        token: String,
        endpoint: String,
    ) -> Option<ConnectionInfo> {
        self.token = Some(token);
        self.endpoint = Some(endpoint);
        self.state = if self.session_id.is_some() {
            FlowState::GotBothVoiceUpdates
        } else {
            FlowState::GotVoiceServerUpdate
        };

        self.try_complete()
    }

    /// Moves the ladder forward; later stages never regress to earlier
    /// ones except through [`reset`].
    ///
    /// [`reset`]: Self::reset
    pub fn advance(&mut self, state: FlowState) {
        if state > self.state {
            self.state = state;
        }
    }

    /// Forgets all credentials and returns to [`FlowState::Disconnected`].
    pub fn reset(&mut self) {
        *self = Self::new(self.guild_id, self.user_id);
    }

    fn try_complete(&self) -> Option<ConnectionInfo> {
        if self.state != FlowState::GotBothVoiceUpdates {
            return None;
        }

        Some(ConnectionInfo {
            channel_id: self.channel_id,
            endpoint: self.endpoint.clone()?,
            guild_id: self.guild_id,
            session_id: self.session_id.clone()?,
            token: self.token.clone()?,
            user_id: self.user_id,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn flow() -> ConnectionFlow {
        ConnectionFlow::new(GuildId::new(1).unwrap(), UserId::new(2).unwrap())
    }

    #[test]
    fn updates_complete_in_either_order() {
        let channel = ChannelId::new(3).unwrap();

        let mut state_first = flow();
        state_first.start(channel);
        assert!(state_first
            .apply_voice_state_update("sess".into(), Some(channel))
            .is_none());
        assert_eq!(state_first.state(), FlowState::GotVoiceStateUpdate);
        let info = state_first
            .apply_voice_server_update("tok".into(), "eu-west1.example.gg".into())
            .expect("both updates applied");
        assert_eq!(info.session_id, "sess");
        assert_eq!(info.token, "tok");

        let mut server_first = flow();
        server_first.start(channel);
        assert!(server_first
            .apply_voice_server_update("tok".into(), "eu-west1.example.gg".into())
            .is_none());
        assert_eq!(server_first.state(), FlowState::GotVoiceServerUpdate);
        assert!(server_first
            .apply_voice_state_update("sess".into(), Some(channel))
            .is_some());
    }

    #[test]
    fn leaving_voice_resets_the_flow() {
        let mut f = flow();
        f.start(ChannelId::new(3).unwrap());
        f.apply_voice_server_update("tok".into(), "host".into());
        f.apply_voice_state_update("sess".into(), None);

        assert_eq!(f.state(), FlowState::Disconnected);
    }

    #[test]
    fn channel_move_discards_stale_endpoint() {
        let mut f = flow();
        f.start(ChannelId::new(3).unwrap());
        f.apply_voice_server_update("tok".into(), "host".into());

        // Moved to a different channel before completing.
        let info = f.apply_voice_state_update("sess".into(), ChannelId::new(4));
        assert!(info.is_none());
        assert_eq!(f.state(), FlowState::GotVoiceStateUpdate);
    }

    #[test]
    fn advance_never_regresses() {
        let mut f = flow();
        f.advance(FlowState::Connected);
        f.advance(FlowState::WebsocketConnected);
        assert_eq!(f.state(), FlowState::Connected);
    }
}
