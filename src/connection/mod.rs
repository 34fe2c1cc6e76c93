//! Establishment and upkeep of a session with a voice server.
//!
//! The handshake runs on the host's async runtime: `identify` (or `resume`),
//! `hello`/`ready`, UDP IP discovery, `select_protocol`, and finally the
//! `session_description` that seeds the decryptor. Once media flows, a
//! background task keeps heartbeats going, maintains the SSRC↔user map, and
//! rides out recoverable websocket closures.

pub mod error;
pub(crate) mod task;

use crate::{
    config::Config,
    constants::*,
    crypto::{CryptoMode, Decryptor},
    id::UserId,
    info::ConnectionInfo,
    model::{payload::*, Event},
    receive::socket::SocketEventReader,
    ws::WsStream,
};
use byteorder::{ByteOrder, NetworkEndian};
use dashmap::DashMap;
use error::{Error, Result};
use flume::{Receiver, Sender};
use parking_lot::Mutex;
use std::{
    net::{IpAddr, UdpSocket},
    str::FromStr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::timeout;
use tracing::{debug, info};
use url::Url;

/// Bidirectional SSRC↔user bookkeeping.
///
/// Written by the connection's websocket task on `speaking` and
/// client-connect/disconnect traffic; read per-packet by the receive path.
#[derive(Debug, Default)]
pub struct SsrcTracker {
    user_to_ssrc: DashMap<UserId, u32>,
    ssrc_to_user: DashMap<u32, UserId>,
}

impl SsrcTracker {
    /// Binds a stream to its owning user, dropping any stale pairings
    /// either key held.
    pub fn insert(&self, ssrc: u32, user: UserId) {
        if let Some((_, old_ssrc)) = self.user_to_ssrc.remove(&user) {
            if old_ssrc != ssrc {
                self.ssrc_to_user.remove(&old_ssrc);
            }
        }

        self.user_to_ssrc.insert(user, ssrc);
        self.ssrc_to_user.insert(ssrc, user);
    }

    /// The user behind a stream, if announced.
    #[must_use]
    pub fn user(&self, ssrc: u32) -> Option<UserId> {
        self.ssrc_to_user.get(&ssrc).map(|entry| *entry.value())
    }

    /// The stream a user transmits on, if announced.
    #[must_use]
    pub fn ssrc(&self, user: UserId) -> Option<u32> {
        self.user_to_ssrc.get(&user).map(|entry| *entry.value())
    }

    /// Unbinds a departing user, returning their stream.
    pub fn remove_user(&self, user: UserId) -> Option<u32> {
        let (_, ssrc) = self.user_to_ssrc.remove(&user)?;
        self.ssrc_to_user.remove(&ssrc);
        Some(ssrc)
    }

    /// Forgets every binding; used on channel moves.
    pub fn clear(&self) {
        self.user_to_ssrc.clear();
        self.ssrc_to_user.clear();
    }
}

/// Out-of-band notices the websocket task sends towards an attached
/// audio reader.
#[derive(Debug)]
pub(crate) enum ConnEvent {
    SpeakingUpdate {
        ssrc: u32,
        user: Option<UserId>,
    },
    ClientConnect {
        user: UserId,
    },
    ClientDisconnect {
        user: UserId,
    },
    /// The session is gone for good; carries the terminal error.
    Fatal(Error),
}

pub(crate) struct ConnShared {
    pub(crate) config: Config,
    pub(crate) info: Mutex<ConnectionInfo>,
    pub(crate) ssrc: AtomicU32,
    pub(crate) mode: CryptoMode,
    pub(crate) socket: Arc<UdpSocket>,
    pub(crate) tracker: Arc<SsrcTracker>,
    pub(crate) decryptor: Arc<Decryptor>,
    pub(crate) socket_reader: Arc<SocketEventReader>,
    pub(crate) events_tx: Sender<ConnEvent>,
    pub(crate) events_rx: Receiver<ConnEvent>,
}

/// A live session with a voice server.
///
/// Dropping the connection tears down its websocket task and socket
/// reader thread.
pub struct Connection {
    pub(crate) shared: Arc<ConnShared>,
    cmd_tx: Sender<task::WsCommand>,
}

impl Connection {
    /// Performs the full voice handshake described by `info`.
    pub async fn connect(info: ConnectionInfo, config: Config) -> Result<Self> {
        if let Some(t) = config.connection_timeout {
            timeout(t, Self::connect_inner(info, config)).await?
        } else {
            Self::connect_inner(info, config).await
        }
    }

    async fn connect_inner(mut info: ConnectionInfo, config: Config) -> Result<Self> {
        let outcome = session_handshake(&mut info, None).await?;

        let decryptor = Arc::new(
            Decryptor::new(outcome.mode, &outcome.secret_key)?
                .with_dave(config.dave_session.clone()),
        );

        info!("Connected to: {}", info.endpoint);
        info!("WS heartbeat duration {}ms.", outcome.heartbeat_interval);

        let socket_reader = SocketEventReader::spawn(Arc::clone(&outcome.socket));
        let (events_tx, events_rx) = flume::bounded(64);
        let (cmd_tx, cmd_rx) = flume::unbounded();

        let shared = Arc::new(ConnShared {
            config,
            info: Mutex::new(info),
            ssrc: AtomicU32::new(outcome.ssrc),
            mode: outcome.mode,
            socket: outcome.socket,
            tracker: Arc::new(SsrcTracker::default()),
            decryptor,
            socket_reader,
            events_tx,
            events_rx,
        });

        tokio::spawn(task::runner(
            Arc::clone(&shared),
            outcome.ws,
            outcome.heartbeat_interval,
            outcome.last_seq,
            cmd_rx,
        ));

        Ok(Self { shared, cmd_tx })
    }

    /// The SSRC assigned to our own outbound stream.
    #[must_use]
    pub fn ssrc(&self) -> u32 {
        self.shared.ssrc.load(Ordering::Acquire)
    }

    /// The encryption mode this session negotiated.
    #[must_use]
    pub fn mode(&self) -> CryptoMode {
        self.shared.mode
    }

    /// The live SSRC↔user map for this call.
    #[must_use]
    pub fn tracker(&self) -> Arc<SsrcTracker> {
        Arc::clone(&self.shared.tracker)
    }

    /// Shuts the session down without waiting for in-flight work.
    pub fn disconnect(&self) {
        drop(self.cmd_tx.send(task::WsCommand::Stop));
        self.shared.socket_reader.stop();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
        info!("Disconnected");
    }
}

/// Everything a completed identify handshake yields.
pub(crate) struct HandshakeOutcome {
    pub(crate) ws: WsStream,
    pub(crate) socket: Arc<UdpSocket>,
    pub(crate) ssrc: u32,
    pub(crate) mode: CryptoMode,
    pub(crate) secret_key: Vec<u8>,
    pub(crate) heartbeat_interval: f64,
    pub(crate) last_seq: Option<u64>,
}

/// Runs the identify handshake, reusing `socket` when re-authenticating an
/// existing session (the server may hand out a fresh media endpoint).
pub(crate) async fn session_handshake(
    info: &mut ConnectionInfo,
    socket: Option<Arc<UdpSocket>>,
) -> Result<HandshakeOutcome> {
    let url = endpoint_url(&mut info.endpoint)?;
    let mut ws = WsStream::connect(url).await?;
    let mut last_seq = None;

    ws.send_json(&Event::Identify(Identify {
        server_id: info.guild_id.get(),
        user_id: info.user_id.get(),
        session_id: info.session_id.clone(),
        token: info.token.clone(),
    }))
    .await?;

    let mut hello = None;
    let mut ready = None;

    while hello.is_none() || ready.is_none() {
        let Some(msg) = ws.recv_json_no_timeout().await? else {
            continue;
        };

        last_seq = msg.seq.or(last_seq);

        match msg.event {
            Event::Ready(r) => ready = Some(r),
            Event::Hello(h) => hello = Some(h),
            other => {
                debug!("Expected ready/hello; got: {:?}", other);
            },
        }
    }

    let hello = hello.expect("loop exits only once hello is seen");
    let ready = ready.expect("loop exits only once ready is seen");

    let mode = CryptoMode::negotiate(&ready.modes).ok_or(Error::CryptoModeUnavailable)?;

    // Discovery blocks on the socket, so it runs off the async runtime.
    let target = (ready.ip, ready.port);
    let ssrc = ready.ssrc;
    let (socket, address, port) = tokio::task::spawn_blocking(move || {
        let socket = match socket {
            Some(s) => {
                s.connect(target)?;
                s
            },
            None => {
                let s = UdpSocket::bind("0.0.0.0:0")?;
                s.connect(target)?;
                Arc::new(s)
            },
        };

        socket.set_read_timeout(Some(Duration::from_secs(5)))?;
        let (address, port) = discover_external_addr(&socket, ssrc)?;
        socket.set_read_timeout(Some(SOCKET_POLL_TIMEOUT))?;

        Ok::<_, Error>((socket, address, port))
    })
    .await
    .map_err(|e| Error::Io(std::io::Error::other(e)))??;

    ws.send_json(&Event::SelectProtocol(SelectProtocol {
        protocol: "udp".into(),
        data: ProtocolData {
            address,
            port,
            mode: mode.to_request_str().into(),
        },
    }))
    .await?;

    let desc = loop {
        let Some(msg) = ws.recv_json_no_timeout().await? else {
            continue;
        };

        last_seq = msg.seq.or(last_seq);

        match msg.event {
            Event::SessionDescription(desc) => break desc,
            other => {
                debug!("Expected session description; got: op{}", other.opcode());
            },
        }
    };

    if desc.mode != mode.to_request_str() {
        return Err(Error::CryptoModeInvalid);
    }

    Ok(HandshakeOutcome {
        ws,
        socket,
        ssrc,
        mode,
        secret_key: desc.secret_key,
        heartbeat_interval: hello.heartbeat_interval,
        last_seq,
    })
}

/// Builds the websocket URL for a gateway-supplied endpoint, shedding the
/// legacy `:80` port suffix some servers still advertise.
pub(crate) fn endpoint_url(endpoint: &mut String) -> Result<Url> {
    let keep = endpoint.strip_suffix(":80").map(str::len);
    if let Some(keep) = keep {
        endpoint.truncate(keep);
    }

    let raw = format!("wss://{endpoint}/?v={VOICE_GATEWAY_VERSION}");
    Url::parse(&raw).map_err(|_| Error::EndpointUrl)
}

/// Sends the 74-byte IP discovery probe and parses the server's view of
/// our external endpoint out of the reply.
pub(crate) fn discover_external_addr(socket: &UdpSocket, ssrc: u32) -> Result<(IpAddr, u16)> {
    let mut buf = [0u8; DISCOVERY_PACKET_SIZE];
    NetworkEndian::write_u16(&mut buf[0..2], 2);
    NetworkEndian::write_u16(&mut buf[2..4], 70);
    NetworkEndian::write_u32(&mut buf[4..8], ssrc);

    socket.send(&buf)?;

    let len = socket.recv(&mut buf)?;
    if len != DISCOVERY_PACKET_SIZE || NetworkEndian::read_u16(&buf[0..2]) != 2 {
        return Err(Error::IllegalDiscoveryResponse);
    }

    // UDP spoofing precludes assuming a clean left edge of NULs; find the
    // first terminator and take everything before it.
    let address_raw = &buf[8..72];
    let nul_index = address_raw
        .iter()
        .position(|&b| b == 0)
        .ok_or(Error::IllegalIp)?;

    let address = std::str::from_utf8(&address_raw[..nul_index])
        .ok()
        .and_then(|s| IpAddr::from_str(s).ok())
        .ok_or(Error::IllegalIp)?;

    Ok((address, NetworkEndian::read_u16(&buf[72..74])))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::num::NonZeroU64;

    #[test]
    fn tracker_keeps_maps_bijective() {
        let tracker = SsrcTracker::default();
        let alice = UserId(NonZeroU64::new(1).unwrap());
        let bob = UserId(NonZeroU64::new(2).unwrap());

        tracker.insert(100, alice);
        tracker.insert(200, bob);
        assert_eq!(tracker.user(100), Some(alice));
        assert_eq!(tracker.ssrc(bob), Some(200));

        // Rejoining assigns a fresh SSRC; the old one must unmap.
        tracker.insert(300, alice);
        assert_eq!(tracker.user(300), Some(alice));
        assert_eq!(tracker.user(100), None);

        assert_eq!(tracker.remove_user(bob), Some(200));
        assert_eq!(tracker.user(200), None);
    }

    #[test]
    fn discovery_round_trip_over_loopback() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.connect(server.local_addr().unwrap()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; DISCOVERY_PACKET_SIZE];
            let (len, from) = server.recv_from(&mut buf).unwrap();
            assert_eq!(len, DISCOVERY_PACKET_SIZE);
            assert_eq!(NetworkEndian::read_u16(&buf[0..2]), 2);
            assert_eq!(NetworkEndian::read_u16(&buf[2..4]), 70);
            assert_eq!(NetworkEndian::read_u32(&buf[4..8]), 0xcafe);

            buf[8..8 + 9].copy_from_slice(b"192.0.2.7");
            buf[8 + 9..72].fill(0);
            NetworkEndian::write_u16(&mut buf[72..74], 50_004);
            server.send_to(&buf, from).unwrap();
        });

        let (addr, port) = discover_external_addr(&client, 0xcafe).unwrap();
        handle.join().unwrap();

        assert_eq!(addr, IpAddr::from_str("192.0.2.7").unwrap());
        assert_eq!(port, 50_004);
    }

    #[test]
    fn endpoint_url_strips_port_80() {
        let mut endpoint = "eu-west1.example.gg:80".to_string();
        let url = endpoint_url(&mut endpoint).unwrap();
        assert_eq!(endpoint, "eu-west1.example.gg");
        assert_eq!(url.as_str(), "wss://eu-west1.example.gg/?v=8");
    }
}
