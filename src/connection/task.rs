//! Long-lived websocket task: heartbeats, SSRC bookkeeping, and recovery
//! from non-fatal closures.

use super::{
    endpoint_url,
    error::{Error, Result},
    session_handshake,
    ConnEvent,
    ConnShared,
};
use crate::{
    id::UserId,
    model::{is_fatal_close, payload::Heartbeat, payload::Resume, Event, GatewayMsg},
    ws::{Error as WsError, WsStream},
};
use flume::Receiver;
use rand::random;
use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};
use tokio::{
    select,
    time::{sleep_until, timeout, Instant},
};
use tracing::{debug, info, instrument, trace, warn};

/// Heartbeats allowed to go unacknowledged before the link is declared
/// dead and recovery begins.
const MAX_MISSED_ACKS: u8 = 2;

/// Control messages for the websocket task.
pub(crate) enum WsCommand {
    /// Tear the session down.
    Stop,
}

struct WsTask {
    shared: Arc<ConnShared>,
    ws: WsStream,
    heartbeat_interval: Duration,
    last_seq: Option<u64>,
    last_heartbeat_nonce: Option<u64>,
    missed_acks: u8,
    rx: Receiver<WsCommand>,
}

#[instrument(skip_all)]
pub(crate) async fn runner(
    shared: Arc<ConnShared>,
    ws: WsStream,
    heartbeat_interval_ms: f64,
    last_seq: Option<u64>,
    rx: Receiver<WsCommand>,
) {
    trace!("Voice WS task started.");

    let mut task = WsTask {
        shared,
        ws,
        heartbeat_interval: Duration::from_secs_f64(heartbeat_interval_ms / 1000.0),
        last_seq,
        last_heartbeat_nonce: None,
        missed_acks: 0,
        rx,
    };

    task.run().await;

    trace!("Voice WS task finished.");
}

impl WsTask {
    async fn run(&mut self) {
        let mut next_heartbeat = Instant::now() + self.heartbeat_interval;

        loop {
            let mut ws_error = None;

            select! {
                () = sleep_until(next_heartbeat) => {
                    if self.missed_acks >= MAX_MISSED_ACKS {
                        warn!("Voice heartbeat went unacknowledged; closing link.");
                        ws_error = Some(WsError::WsClosed(None));
                    } else if let Err(e) = self.send_heartbeat().await {
                        ws_error = Some(e);
                    }
                    next_heartbeat = Instant::now() + self.heartbeat_interval;
                },
                msg = self.ws.recv_json_no_timeout() => {
                    match msg {
                        Ok(Some(msg)) => self.process(msg),
                        Ok(None) => {},
                        Err(e) => ws_error = Some(e),
                    }
                },
                cmd = self.rx.recv_async() => {
                    match cmd {
                        Ok(WsCommand::Stop) | Err(flume::RecvError::Disconnected) => break,
                    }
                },
            }

            if let Some(e) = ws_error {
                if let WsError::WsClosed(Some(frame)) = &e {
                    let code = u16::from(frame.code);
                    if is_fatal_close(code) {
                        self.fail(Error::Closed(Some(code)));
                        break;
                    }
                }

                debug!("Voice WS error, beginning recovery: {e:?}.");
                if !self.recover().await {
                    break;
                }

                self.missed_acks = 0;
                self.last_heartbeat_nonce = None;
                next_heartbeat = Instant::now() + self.heartbeat_interval;
            }
        }
    }

    fn process(&mut self, msg: GatewayMsg) {
        self.last_seq = msg.seq.or(self.last_seq);
        let shared = &self.shared;

        match msg.event {
            Event::Speaking(ev) => {
                let user = ev.user_id.and_then(UserId::new);
                if let Some(user) = user {
                    shared.tracker.insert(ev.ssrc, user);
                }

                drop(
                    shared
                        .events_tx
                        .try_send(ConnEvent::SpeakingUpdate { ssrc: ev.ssrc, user }),
                );
            },
            Event::ClientConnect(ev) => {
                debug!("Received legacy client connect: {ev:?}");
                if let Some(user) = UserId::new(ev.user_id) {
                    if let Some(ssrc) = ev.audio_ssrc {
                        shared.tracker.insert(ssrc, user);
                    }
                    drop(shared.events_tx.try_send(ConnEvent::ClientConnect { user }));
                }
            },
            Event::ClientDisconnect(ev) => {
                if let Some(user) = UserId::new(ev.user_id) {
                    drop(
                        shared
                            .events_tx
                            .try_send(ConnEvent::ClientDisconnect { user }),
                    );
                }
            },
            Event::HeartbeatAck(ack) => match self.last_heartbeat_nonce.take() {
                Some(nonce) if nonce == ack.t => {
                    trace!("Heartbeat ACK received.");
                    self.missed_acks = 0;
                },
                Some(nonce) => {
                    warn!("Heartbeat nonce mismatch! Expected {nonce}, saw {}.", ack.t);
                },
                None => {},
            },
            Event::SessionDescription(desc) => {
                // The server rekeys the transport after a resume.
                if let Err(e) = shared.decryptor.rotate(&desc.secret_key) {
                    warn!("Post-resume rekey failed: {e}.");
                } else {
                    info!("Transport key rotated.");
                }
            },
            Event::Hello(h) => {
                self.heartbeat_interval = Duration::from_secs_f64(h.heartbeat_interval / 1000.0);
            },
            Event::Resumed => {
                info!("Voice session resumed.");
            },
            Event::Dave { opcode, data } => {
                if let Some(dave) = &shared.config.dave_session {
                    dave.handle_frame(opcode, &data);
                } else {
                    trace!("Ignoring group-protocol frame op{opcode}.");
                }
            },
            other => {
                trace!("Received other websocket data: {other:?}");
            },
        }
    }

    async fn send_heartbeat(&mut self) -> std::result::Result<(), WsError> {
        if self.last_heartbeat_nonce.take().is_some() {
            self.missed_acks += 1;
        }

        let nonce = random::<u64>();
        self.last_heartbeat_nonce = Some(nonce);

        self.ws
            .send_json(&Event::Heartbeat(Heartbeat {
                t: nonce,
                seq_ack: self.last_seq,
            }))
            .await
    }

    /// Tries to resume the interrupted session, falling back to a full
    /// re-identify. Returns `false` once the session is beyond saving.
    async fn recover(&mut self) -> bool {
        self.shared.socket_reader.pause();

        let budget = self
            .shared
            .config
            .connection_timeout
            .unwrap_or(Duration::from_secs(10));

        match timeout(budget, self.resume()).await {
            Ok(Ok(())) => {
                info!("Voice session resumed after network error.");
                self.shared.socket_reader.resume(false);
                return true;
            },
            Ok(Err(e)) => debug!("Resume failed ({e}); re-identifying."),
            Err(_) => debug!("Resume timed out; re-identifying."),
        }

        match timeout(budget, self.reidentify()).await {
            Ok(Ok(())) => {
                info!("Voice session re-established.");
                self.shared.socket_reader.resume(false);
                true
            },
            Ok(Err(e)) => {
                self.fail(e);
                false
            },
            Err(_) => {
                self.fail(Error::TimedOut);
                false
            },
        }
    }

    async fn resume(&mut self) -> Result<()> {
        let mut info = self.shared.info.lock().clone();
        let url = endpoint_url(&mut info.endpoint)?;

        let mut ws = WsStream::connect(url).await?;
        ws.send_json(&Event::Resume(Resume {
            server_id: info.guild_id.get(),
            session_id: info.session_id.clone(),
            token: info.token.clone(),
            seq_ack: self.last_seq,
        }))
        .await?;

        let mut hello = None;
        let mut resumed = false;

        while hello.is_none() || !resumed {
            let Some(msg) = ws.recv_json_no_timeout().await? else {
                continue;
            };

            self.last_seq = msg.seq.or(self.last_seq);

            match msg.event {
                Event::Hello(h) => hello = Some(h),
                Event::Resumed => resumed = true,
                other => {
                    debug!("Expected resumed/hello; got: {other:?}");
                },
            }
        }

        if let Some(hello) = hello {
            self.heartbeat_interval = Duration::from_secs_f64(hello.heartbeat_interval / 1000.0);
        }

        self.ws = ws;
        Ok(())
    }

    async fn reidentify(&mut self) -> Result<()> {
        let mut info = self.shared.info.lock().clone();
        let socket = Arc::clone(&self.shared.socket);

        let outcome = session_handshake(&mut info, Some(socket)).await?;

        if outcome.mode != self.shared.mode {
            return Err(Error::CryptoModeInvalid);
        }

        self.shared.decryptor.rotate(&outcome.secret_key)?;
        self.shared.ssrc.store(outcome.ssrc, Ordering::Release);
        *self.shared.info.lock() = info;

        self.heartbeat_interval =
            Duration::from_secs_f64(outcome.heartbeat_interval / 1000.0);
        self.last_seq = outcome.last_seq;
        self.ws = outcome.ws;
        Ok(())
    }

    fn fail(&self, e: Error) {
        warn!("Voice connection lost for good: {e}.");
        self.shared.socket_reader.pause();
        drop(self.shared.events_tx.try_send(ConnEvent::Fatal(e)));
    }
}
