//! Fan-out of decrypted packets to per-speaker decoders, and the consumer
//! loop that moves decoded frames into the sink tree.

use super::{decoder::PacketDecoder, events::SinkEventRouter};
use crate::{
    config::Config,
    connection::SsrcTracker,
    constants::DROPPED_SSRC_RING_SIZE,
    error::ReadError,
    id::{GuildId, UserId},
    packet::{RtcpPacket, RtpPacket},
    sink::{Sink, SinkEvent},
};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::debug;

/// The inverse of a condition variable: one consumer waiting on N
/// producers, with the set of ready producers carried alongside.
struct DataEvent {
    items: Mutex<HashSet<u32>>,
    cond: Condvar,
}

impl DataEvent {
    fn new() -> Self {
        Self {
            items: Mutex::new(HashSet::new()),
            cond: Condvar::new(),
        }
    }

    fn register(&self, ssrc: u32) {
        self.items.lock().insert(ssrc);
        self.cond.notify_all();
    }

    fn unregister(&self, ssrc: u32) {
        self.items.lock().remove(&ssrc);
    }

    fn wake(&self) {
        self.cond.notify_all();
    }

    /// Waits until at least one producer is ready (or `timeout` passes)
    /// and snapshots the ready set.
    fn wait_snapshot(&self, timeout: Duration) -> Vec<u32> {
        let mut items = self.items.lock();
        if items.is_empty() {
            drop(self.cond.wait_for(&mut items, timeout));
        }

        items.iter().copied().collect()
    }
}

pub(crate) struct RouterInner {
    pub(crate) sink: Box<dyn Sink>,
    decoders: HashMap<u32, PacketDecoder>,
    dropped: VecDeque<u32>,
}

impl RouterInner {
    #[cfg(test)]
    pub(crate) fn decoder_count(&self) -> usize {
        self.decoders.len()
    }
}

/// Routes packets to decoders and decoded frames to the sink.
///
/// All decoder mutation happens under one lock, so sink writes can never
/// race decoder teardown.
pub(crate) struct PacketRouter {
    pub(crate) inner: Mutex<RouterInner>,
    waiter: DataEvent,
    end: AtomicBool,
    config: Config,
    tracker: Arc<SsrcTracker>,
    events: Arc<SinkEventRouter>,
}

impl PacketRouter {
    pub(crate) fn new(
        sink: Box<dyn Sink>,
        config: Config,
        tracker: Arc<SsrcTracker>,
        events: Arc<SinkEventRouter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RouterInner {
                sink,
                decoders: HashMap::new(),
                dropped: VecDeque::with_capacity(DROPPED_SSRC_RING_SIZE),
            }),
            waiter: DataEvent::new(),
            end: AtomicBool::new(false),
            config,
            tracker,
            events,
        })
    }

    /// Hands a decrypted RTP packet to its stream's decoder, creating one
    /// on first contact.
    ///
    /// Packets from recently destroyed streams are dropped until the
    /// stream ages out of the ring.
    pub(crate) fn feed_rtp(&self, packet: RtpPacket) -> Result<(), ReadError> {
        let ssrc = packet.ssrc;
        let mut inner = self.inner.lock();

        if inner.dropped.contains(&ssrc) {
            debug!("Ignoring packet from dropped ssrc {ssrc}");
            return Ok(());
        }

        let passthrough = inner.sink.is_opus();
        let decoder = match inner.decoders.entry(ssrc) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(PacketDecoder::new(ssrc, passthrough, &self.config)?)
            },
        };

        decoder.push_packet(packet);
        if decoder.has_frame() {
            self.waiter.register(ssrc);
        }

        Ok(())
    }

    /// Forwards a telemetry packet to sink listeners.
    pub(crate) fn feed_rtcp(&self, packet: RtcpPacket, guild_id: GuildId) {
        self.events.dispatch(SinkEvent::RtcpPacket { packet, guild_id });
    }

    /// Binds a stream to its user, reviving it if recently dropped.
    pub(crate) fn set_user(&self, ssrc: u32, user: UserId) {
        let mut inner = self.inner.lock();
        inner.dropped.retain(|&s| s != ssrc);

        if let Some(decoder) = inner.decoders.get_mut(&ssrc) {
            decoder.set_user(user);
        }
    }

    /// Replaces the sink tree, returning the old one.
    pub(crate) fn set_sink(&self, sink: Box<dyn Sink>) -> Box<dyn Sink> {
        std::mem::replace(&mut self.inner.lock().sink, sink)
    }

    /// Tears down one stream's decoder; its in-flight packets are dropped
    /// while the SSRC sits in the ring.
    pub(crate) fn destroy_decoder(&self, ssrc: u32) {
        let mut inner = self.inner.lock();

        if inner.decoders.remove(&ssrc).is_some() {
            while inner.dropped.len() >= DROPPED_SSRC_RING_SIZE {
                inner.dropped.pop_front();
            }
            inner.dropped.push_back(ssrc);
        }

        self.waiter.unregister(ssrc);
    }

    /// Tears down every decoder; used on channel moves.
    pub(crate) fn destroy_all_decoders(&self) {
        let ssrcs: Vec<u32> = self.inner.lock().decoders.keys().copied().collect();
        for ssrc in ssrcs {
            self.destroy_decoder(ssrc);
        }
    }

    pub(crate) fn stop(&self) {
        self.end.store(true, Ordering::Release);
        self.waiter.wake();
    }

    /// Rearms the consumer loop for another `start`/`stop` cycle.
    pub(crate) fn restart(&self) {
        self.end.store(false, Ordering::Release);
    }

    /// Consumer loop: waits for decoders with releasable frames and moves
    /// them into the sink, then drains the stragglers at shutdown.
    pub(crate) fn run(&self) {
        while !self.end.load(Ordering::Acquire) {
            let ready = self.waiter.wait_snapshot(Duration::from_millis(500));

            let mut inner = self.inner.lock();
            let RouterInner { sink, decoders, .. } = &mut *inner;

            for ssrc in ready {
                if let Some(decoder) = decoders.get_mut(&ssrc) {
                    if let Some(data) = decoder.pop_data(&self.tracker, Duration::ZERO) {
                        sink.write(data.user, &data);
                    }
                    if !decoder.has_frame() {
                        self.waiter.unregister(ssrc);
                    }
                } else {
                    self.waiter.unregister(ssrc);
                }
            }
        }

        // Final drain so buffered tail packets still reach the sink.
        let mut inner = self.inner.lock();
        let RouterInner { sink, decoders, .. } = &mut *inner;
        for decoder in decoders.values_mut() {
            while let Some(data) = decoder.pop_data(&self.tracker, Duration::ZERO) {
                sink.write(data.user, &data);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        receive::test_util::{encoded_frames, opus_packet},
        sink::test::{Probe, ProbeSink},
    };

    fn rig(config: Config) -> (Arc<PacketRouter>, Probe, Arc<SsrcTracker>) {
        let probe = Probe::default();
        let sink = Box::new(ProbeSink {
            probe: probe.clone(),
            opus: false,
        });

        let tracker = Arc::new(SsrcTracker::default());
        let events = SinkEventRouter::new();
        let router = PacketRouter::new(sink, config, Arc::clone(&tracker), Arc::clone(&events));
        events.bind(&router);

        (router, probe, tracker)
    }

    #[test]
    fn dropped_ring_swallows_packets_until_eviction() {
        let (router, _probe, _tracker) = rig(Config::default());

        let payloads = encoded_frames(1);
        router
            .feed_rtp(opus_packet(77, 0, 0, payloads[0].clone()))
            .unwrap();
        assert_eq!(router.inner.lock().decoders.len(), 1);

        router.destroy_decoder(77);
        assert_eq!(router.inner.lock().decoders.len(), 0);

        // While in the ring, packets for the SSRC do not revive a decoder.
        for seq in 0..DROPPED_SSRC_RING_SIZE as u16 {
            router
                .feed_rtp(opus_packet(77, seq + 1, 0, payloads[0].clone()))
                .unwrap();
            assert!(router.inner.lock().decoders.is_empty());

            // Other streams churning through the ring eventually evict 77.
            router
                .feed_rtp(opus_packet(1_000 + u32::from(seq), 0, 0, payloads[0].clone()))
                .unwrap();
            router.destroy_decoder(1_000 + u32::from(seq));
        }

        // 16 destructions later, 77 has aged out and gets a fresh decoder.
        router
            .feed_rtp(opus_packet(77, 50, 0, payloads[0].clone()))
            .unwrap();
        assert_eq!(router.inner.lock().decoders.len(), 1);
    }

    #[test]
    fn speaking_announcement_revives_a_dropped_stream() {
        let (router, _probe, _tracker) = rig(Config::default());
        let payloads = encoded_frames(1);

        router
            .feed_rtp(opus_packet(5, 0, 0, payloads[0].clone()))
            .unwrap();
        router.destroy_decoder(5);

        router.set_user(5, UserId::new(9).unwrap());
        router
            .feed_rtp(opus_packet(5, 1, 0, payloads[0].clone()))
            .unwrap();

        assert_eq!(router.inner.lock().decoders.len(), 1);
    }

    #[test]
    fn consumer_loop_delivers_frames_and_drains_on_stop() {
        let (router, probe, _tracker) = rig(Config::default());

        let worker = {
            let router = Arc::clone(&router);
            std::thread::spawn(move || router.run())
        };

        for (i, payload) in encoded_frames(5).into_iter().enumerate() {
            router
                .feed_rtp(opus_packet(3, 100 + i as u16, 960 * i as u32, payload))
                .unwrap();
        }

        // The loop should push out everything releasable on its own...
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while probe.frames.lock().unwrap().len() < 4 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(probe.frames.lock().unwrap().len() >= 4);

        // ...and the stop-time drain delivers the held-back tail.
        router.stop();
        worker.join().unwrap();

        let seen: Vec<u16> = probe.frames.lock().unwrap().iter().map(|f| f.0).collect();
        assert_eq!(seen, vec![100, 101, 102, 103, 104]);
    }
}
