//! The voice receive pipeline.
//!
//! [`AudioReader`] composes the whole ingest path: the socket reader
//! thread hands datagrams to a classify/decrypt callback, RTP flows
//! through per-speaker jitter buffers and Opus decoders inside the packet
//! router, RTCP and speaking transitions fan out through the sink event
//! router, and a UDP keep-alive keeps the NAT mapping warm.

pub(crate) mod decoder;
pub(crate) mod events;
pub(crate) mod jitter;
pub(crate) mod keepalive;
pub(crate) mod router;
pub mod socket;
pub(crate) mod speaking;
#[cfg(test)]
pub(crate) mod test_util;

use self::{
    events::SinkEventRouter,
    keepalive::UdpKeepAlive,
    router::PacketRouter,
    socket::{CallbackId, SocketEventReader},
    speaking::SpeakingTimer,
};
use crate::{
    config::Config,
    connection::{ConnEvent, Connection, SsrcTracker},
    constants::*,
    crypto::{CryptoError, Decryptor},
    error::{ReadError, ReadResult},
    id::GuildId,
    packet::{is_rtcp, RtcpPacket, RtpPacket},
    sink::{walk, Sink, SinkEvent},
};
use flume::Receiver;
use parking_lot::Mutex;
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    thread,
};
use tracing::{debug, error, info, warn};

/// Callback observing the reader's shutdown; receives the first error the
/// pipeline hit, or `None` for a clean stop.
pub type AfterFn = Box<dyn FnOnce(Option<ReadError>) + Send>;

/// Consecutive malformed datagrams tolerated before the reader assumes
/// the transport is broken and stops itself.
const MALFORMED_STRIKE_LIMIT: u32 = 64;

pub(crate) struct ReaderShared {
    active: AtomicBool,
    error: Mutex<Option<ReadError>>,
    malformed_strikes: AtomicU32,
    router: Arc<PacketRouter>,
    events: Arc<SinkEventRouter>,
    timer: SpeakingTimer,
    keepalive: UdpKeepAlive,
    decryptor: Arc<Decryptor>,
    tracker: Arc<SsrcTracker>,
    socket_reader: Arc<SocketEventReader>,
    conn_rx: Receiver<ConnEvent>,
    guild_id: GuildId,
    after: Mutex<Option<AfterFn>>,
    callback_id: Mutex<Option<CallbackId>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

/// Orchestrates the receive pipeline over one voice connection.
///
/// The reader owns the router, event router, speaking timer, and
/// keep-alive; the sink tree lives behind the router's lock and every
/// sink is guaranteed exactly one `cleanup` call per teardown.
pub struct AudioReader {
    shared: Arc<ReaderShared>,
}

impl AudioReader {
    /// Builds a reader feeding `sink` from `connection`'s media stream.
    #[must_use]
    pub fn new(connection: &Connection, sink: Box<dyn Sink>) -> Self {
        let conn = &connection.shared;

        Self::assemble(
            sink,
            conn.config.clone(),
            Arc::clone(&conn.tracker),
            Arc::clone(&conn.decryptor),
            Arc::clone(&conn.socket_reader),
            UdpKeepAlive::new(Arc::clone(&conn.socket)),
            conn.events_rx.clone(),
            conn.info.lock().guild_id,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        sink: Box<dyn Sink>,
        config: Config,
        tracker: Arc<SsrcTracker>,
        decryptor: Arc<Decryptor>,
        socket_reader: Arc<SocketEventReader>,
        keepalive: UdpKeepAlive,
        conn_rx: Receiver<ConnEvent>,
        guild_id: GuildId,
    ) -> Self {
        let events = SinkEventRouter::new();
        let router = PacketRouter::new(
            sink,
            config.clone(),
            Arc::clone(&tracker),
            Arc::clone(&events),
        );
        events.bind(&router);

        let timer = SpeakingTimer::new(
            config.speaking_timeout,
            Arc::clone(&tracker),
            Arc::clone(&events),
        );

        Self {
            shared: Arc::new(ReaderShared {
                active: AtomicBool::new(false),
                error: Mutex::new(None),
                malformed_strikes: AtomicU32::new(0),
                router,
                events,
                timer,
                keepalive,
                decryptor,
                tracker,
                socket_reader,
                conn_rx,
                guild_id,
                after: Mutex::new(None),
                callback_id: Mutex::new(None),
                threads: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Installs a callback observing teardown; it runs exactly once per
    /// `start`/`stop` cycle, even when several errors occurred.
    #[must_use]
    pub fn after(self, after: impl FnOnce(Option<ReadError>) + Send + 'static) -> Self {
        *self.shared.after.lock() = Some(Box::new(after));
        self
    }

    /// Spins up the pipeline threads and begins consuming the socket.
    ///
    /// Fails with [`ReadError::AlreadyListening`] on a double start.
    pub fn start(&self) -> ReadResult<()> {
        if self.shared.active.swap(true, Ordering::SeqCst) {
            debug!("Reader is already running.");
            return Err(ReadError::AlreadyListening);
        }

        start(&self.shared);
        Ok(())
    }

    /// Stops the pipeline.
    ///
    /// Idempotent and non-blocking: component shutdown, the `after`
    /// callback, and sink cleanup run on a short-lived teardown thread.
    pub fn stop(&self) {
        stop(&self.shared);
    }

    /// Whether the reader is currently consuming the socket.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Swaps the sink tree on a live reader, returning the old tree.
    pub fn set_sink(&self, sink: Box<dyn Sink>) -> Box<dyn Sink> {
        let old = self.shared.router.set_sink(sink);
        self.shared.events.rebuild();
        old
    }

    /// Tears down every per-speaker decoder, e.g. after moving channels.
    pub fn reset_streams(&self) {
        self.shared.router.destroy_all_decoders();
    }

    /// Whether a stream is currently mid-speech, if the reader has heard
    /// from it at all.
    #[must_use]
    pub fn is_speaking(&self, ssrc: u32) -> Option<bool> {
        self.shared.timer.get_speaking(ssrc)
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<ReaderShared> {
        &self.shared
    }
}

fn start(shared: &Arc<ReaderShared>) {
    // Stale notices from before this reader attached are meaningless.
    while shared.conn_rx.try_recv().is_ok() {}

    shared.events.restart();
    shared.router.restart();
    shared.timer.start();

    let mut threads = shared.threads.lock();

    let router = Arc::clone(&shared.router);
    threads.push(
        thread::Builder::new()
            .name("voice-packet-router".into())
            .spawn(move || router.run())
            .expect("spawning the packet router thread cannot fail"),
    );

    let event_shared = Arc::clone(shared);
    threads.push(
        thread::Builder::new()
            .name("voice-sink-events".into())
            .spawn(move || event_loop(&event_shared))
            .expect("spawning the event router thread cannot fail"),
    );
    drop(threads);

    shared.keepalive.start();

    let cb_shared = Arc::clone(shared);
    let id = shared
        .socket_reader
        .register(Box::new(move |data| handle_datagram(&cb_shared, data)));
    *shared.callback_id.lock() = Some(id);
}

fn stop(shared: &Arc<ReaderShared>) {
    if !shared.active.swap(false, Ordering::SeqCst) {
        debug!("Reader is not active.");
        return;
    }

    if let Some(id) = shared.callback_id.lock().take() {
        shared.socket_reader.unregister(id);
    }

    let teardown = Arc::clone(shared);
    drop(
        thread::Builder::new()
            .name("voice-reader-stop".into())
            .spawn(move || finish_stop(&teardown)),
    );
}

fn finish_stop(shared: &Arc<ReaderShared>) {
    shared.router.stop();
    shared.events.stop();

    for handle in shared.threads.lock().drain(..) {
        drop(handle.join());
    }

    shared.timer.stop();
    shared.keepalive.stop();

    let first_error = shared.error.lock().take();
    if let Some(after) = shared.after.lock().take() {
        if catch_unwind(AssertUnwindSafe(move || after(first_error))).is_err() {
            error!("The reader's after callback panicked.");
        }
    }

    let mut inner = shared.router.inner.lock();
    walk(inner.sink.as_mut(), true, &mut |sink| {
        if catch_unwind(AssertUnwindSafe(|| sink.cleanup())).is_err() {
            error!("Error while cleaning up a sink; continuing teardown.");
        }
    });

    info!("Audio reader stopped.");
}

/// Records the pipeline's first error and shuts the reader down.
fn fail(shared: &Arc<ReaderShared>, e: ReadError) {
    {
        let mut slot = shared.error.lock();
        if slot.is_none() {
            *slot = Some(e);
        }
    }

    stop(shared);
}

/// Consumer loop shared by sink events and connection notices.
fn event_loop(shared: &Arc<ReaderShared>) {
    while !shared.events.stopped() {
        while let Ok(notice) = shared.conn_rx.try_recv() {
            handle_conn_event(shared, notice);
        }

        shared.events.run_once(EVENT_QUEUE_TIMEOUT);
    }
}

fn handle_conn_event(shared: &Arc<ReaderShared>, notice: ConnEvent) {
    match notice {
        ConnEvent::SpeakingUpdate { ssrc, user } => {
            if let Some(user) = user {
                shared.router.set_user(ssrc, user);
            }
        },
        ConnEvent::ClientConnect { user } => {
            shared.events.dispatch(SinkEvent::ClientConnect { user });
        },
        ConnEvent::ClientDisconnect { user } => {
            if let Some(ssrc) = shared.tracker.remove_user(user) {
                shared.router.destroy_decoder(ssrc);
                shared.timer.drop_ssrc(ssrc);
            }
            shared.events.dispatch(SinkEvent::ClientDisconnect { user });
        },
        ConnEvent::Fatal(e) => {
            fail(shared, ReadError::Connection(e));
        },
    }
}

/// Classify → decrypt → route one datagram off the socket.
pub(crate) fn handle_datagram(shared: &Arc<ReaderShared>, data: &[u8]) {
    if !shared.active.load(Ordering::SeqCst) {
        return;
    }

    if is_rtcp(data) {
        handle_rtcp(shared, data);
        return;
    }

    let mut packet = match RtpPacket::parse(data) {
        Ok(packet) => packet,
        Err(e) => {
            if is_discovery_datagram(data) {
                debug!("Received an IP discovery packet; ignoring.");
                return;
            }

            warn!("Malformed voice packet: {e}.");
            let strikes = shared.malformed_strikes.fetch_add(1, Ordering::AcqRel) + 1;
            if strikes >= MALFORMED_STRIKE_LIMIT {
                fail(shared, ReadError::Packet(e));
            }
            return;
        },
    };

    shared.malformed_strikes.store(0, Ordering::Release);

    let ssrc = packet.ssrc;
    let user = shared.tracker.user(ssrc);

    if let Err(e) = shared.decryptor.decrypt_rtp(&mut packet, user) {
        match e {
            CryptoError::AuthenticationFailed => {
                info!("Dropping voice packet that failed authentication.");
            },
            other => warn!("Error while decrypting a voice packet: {other}."),
        }
        return;
    }

    if user.is_none() {
        if packet.is_silence() {
            return;
        }
        info!("Received a packet for unknown SSRC {ssrc}.");
    }

    shared.timer.notify(ssrc);

    if let Err(e) = shared.router.feed_rtp(packet) {
        error!("An error occurred while processing an RTP packet: {e}.");
        fail(shared, e);
    }
}

fn handle_rtcp(shared: &Arc<ReaderShared>, data: &[u8]) {
    let plaintext = match shared.decryptor.decrypt_rtcp(data) {
        Ok(plaintext) => plaintext,
        Err(e) => {
            info!("Dropping RTCP packet that failed decryption: {e}.");
            return;
        },
    };

    match RtcpPacket::parse(&plaintext) {
        Ok(packet) => {
            if matches!(packet, RtcpPacket::Other { .. }) {
                info!(
                    "Received unexpected RTCP packet type {}.",
                    packet.header().packet_type
                );
            }

            shared.router.feed_rtcp(packet, shared.guild_id);
        },
        Err(e) => {
            debug!("Undecodable RTCP packet: {e}.");
        },
    }
}

#[inline]
fn is_discovery_datagram(data: &[u8]) -> bool {
    data.len() == DISCOVERY_PACKET_SIZE && data.get(1) == Some(&0x02)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        crypto::{CryptoMode, KEY_SIZE, NONCE_SIZE},
        id::UserId,
        receive::test_util::encoded_frames,
        sink::test::{Probe, ProbeSink},
    };
    use crypto_secretbox::{
        aead::{Aead, KeyInit},
        XSalsa20Poly1305,
    };
    use std::{
        net::UdpSocket,
        time::{Duration, Instant},
    };

    const KEY: [u8; KEY_SIZE] = [3u8; KEY_SIZE];

    struct Rig {
        reader: AudioReader,
        probe: Probe,
        tracker: Arc<SsrcTracker>,
        after_calls: Arc<Mutex<Vec<bool>>>,
    }

    fn rig(config: Config) -> Rig {
        let probe = Probe::default();
        let sink = Box::new(ProbeSink {
            probe: probe.clone(),
            opus: false,
        });

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        // Keep-alive traffic goes to a sibling loopback socket.
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.connect(peer.local_addr().unwrap()).unwrap();

        let socket_reader = SocketEventReader::spawn(Arc::clone(&socket));
        let tracker = Arc::new(SsrcTracker::default());
        let decryptor = Arc::new(Decryptor::new(CryptoMode::Normal, &KEY).unwrap());
        let (_conn_tx, conn_rx) = flume::bounded(16);

        let after_calls = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&after_calls);

        let reader = AudioReader::assemble(
            sink,
            config,
            Arc::clone(&tracker),
            decryptor,
            socket_reader,
            UdpKeepAlive::new(Arc::clone(&socket)),
            conn_rx,
            GuildId::new(1).unwrap(),
        )
        .after(move |err| record.lock().push(err.is_some()));

        // The keep-alive target must outlive the rig; tests are short.
        std::mem::forget(peer);

        Rig {
            reader,
            probe,
            tracker,
            after_calls,
        }
    }

    fn sealed_datagram(sequence: u16, ssrc: u32, payload: &[u8]) -> Vec<u8> {
        let mut raw = vec![0x80, 0x78];
        raw.extend_from_slice(&sequence.to_be_bytes());
        raw.extend_from_slice(&(u32::from(sequence) * 960).to_be_bytes());
        raw.extend_from_slice(&ssrc.to_be_bytes());

        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..RTP_HEADER_SIZE].copy_from_slice(&raw);

        let cipher = XSalsa20Poly1305::new_from_slice(&KEY).unwrap();
        raw.extend_from_slice(&cipher.encrypt((&nonce).into(), payload).unwrap());
        raw
    }

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        check()
    }

    #[test]
    fn full_pipeline_and_exactly_once_teardown() {
        let rig = rig(Config::default());
        rig.tracker.insert(9, UserId::new(77).unwrap());

        rig.reader.start().unwrap();
        assert!(rig.reader.is_listening());

        // A second start must be signalled to the caller.
        assert!(matches!(
            rig.reader.start(),
            Err(ReadError::AlreadyListening)
        ));

        for (i, frame) in encoded_frames(4).into_iter().enumerate() {
            handle_datagram(rig.reader.shared(), &sealed_datagram(i as u16, 9, &frame));
        }

        assert!(wait_until(Duration::from_secs(5), || {
            rig.probe.frames.lock().unwrap().len() >= 3
        }));

        rig.reader.stop();
        rig.reader.stop(); // no-op

        assert!(wait_until(Duration::from_secs(5), || {
            rig.after_calls.lock().len() == 1
        }));

        // Clean stop: after saw no error, every sink cleaned exactly once,
        // and the teardown drain flushed the held-back tail frame.
        assert_eq!(rig.after_calls.lock().as_slice(), &[false]);
        assert_eq!(
            rig.probe
                .cleanups
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );

        let seen: Vec<u16> = rig.probe.frames.lock().unwrap().iter().map(|f| f.0).collect();
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert!(!rig.reader.is_listening());
    }

    #[test]
    fn tampered_packets_are_dropped_without_stopping() {
        let rig = rig(Config::default());
        rig.tracker.insert(9, UserId::new(77).unwrap());
        rig.reader.start().unwrap();

        let frames = encoded_frames(1);
        let mut datagram = sealed_datagram(0, 9, &frames[0]);
        let tail = datagram.len() - 1;
        datagram[tail] ^= 0x01;

        handle_datagram(rig.reader.shared(), &datagram);

        thread::sleep(Duration::from_millis(100));
        assert!(rig.probe.frames.lock().unwrap().is_empty());
        assert!(rig.reader.is_listening());

        rig.reader.stop();
    }

    #[test]
    fn silence_for_unknown_ssrc_is_ignored() {
        let rig = rig(Config::default());
        rig.reader.start().unwrap();

        handle_datagram(
            rig.reader.shared(),
            &sealed_datagram(0, 1234, &SILENT_FRAME),
        );

        thread::sleep(Duration::from_millis(50));
        assert!(rig
            .reader
            .shared()
            .router
            .inner
            .lock()
            .decoder_count()
            == 0);

        rig.reader.stop();
    }

    #[test]
    fn client_disconnect_tears_down_the_stream() {
        let rig = rig(Config::default());
        let user = UserId::new(77).unwrap();
        rig.tracker.insert(9, user);
        rig.reader.start().unwrap();

        let frames = encoded_frames(1);
        handle_datagram(rig.reader.shared(), &sealed_datagram(0, 9, &frames[0]));

        handle_conn_event(rig.reader.shared(), ConnEvent::ClientDisconnect { user });

        assert_eq!(rig.tracker.user(9), None);
        assert_eq!(rig.reader.shared().router.inner.lock().decoder_count(), 0);

        // In-flight packets for the dropped stream are swallowed.
        handle_datagram(rig.reader.shared(), &sealed_datagram(1, 9, &frames[0]));
        assert_eq!(rig.reader.shared().router.inner.lock().decoder_count(), 0);

        rig.reader.stop();
    }
}
