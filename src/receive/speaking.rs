//! Derives speaking start/stop transitions from packet arrival times.
//!
//! There is no explicit protocol frame for "stopped speaking"; a stream
//! is considered silent once no packet has arrived for the configured
//! timeout.

use super::events::SinkEventRouter;
use crate::{connection::SsrcTracker, sink::SinkEvent};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::trace;

struct TimerState {
    speaking: HashMap<u32, bool>,
    last_arrival: HashMap<u32, Instant>,
}

struct Shared {
    delay: Duration,
    state: Mutex<TimerState>,
    cond: Condvar,
    end: AtomicBool,
    tracker: Arc<SsrcTracker>,
    events: Arc<SinkEventRouter>,
}

/// Watches per-stream arrival times and emits speaking events.
pub(crate) struct SpeakingTimer {
    shared: Arc<Shared>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SpeakingTimer {
    pub(crate) fn new(
        delay: Duration,
        tracker: Arc<SsrcTracker>,
        events: Arc<SinkEventRouter>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                delay,
                state: Mutex::new(TimerState {
                    speaking: HashMap::new(),
                    last_arrival: HashMap::new(),
                }),
                cond: Condvar::new(),
                end: AtomicBool::new(false),
                tracker,
                events,
            }),
            handle: Mutex::new(None),
        }
    }

    /// Spawns the expiry worker.
    pub(crate) fn start(&self) {
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("voice-speaking-timer".into())
            .spawn(move || run(&shared))
            .expect("spawning the speaking timer thread cannot fail");

        *self.handle.lock() = Some(handle);
    }

    /// Records a packet arrival for `ssrc`, firing `SpeakingStart` on a
    /// silent-to-speaking transition.
    pub(crate) fn notify(&self, ssrc: u32) {
        let now = Instant::now();
        let mut state = self.shared.state.lock();

        let stale = state
            .last_arrival
            .get(&ssrc)
            .map_or(true, |&last| last + self.shared.delay < now);
        if stale {
            self.shared.dispatch_start(ssrc);
        }

        state.speaking.insert(ssrc, true);
        state.last_arrival.insert(ssrc, now);
        drop(state);

        self.shared.cond.notify_all();
    }

    /// Forgets a departing stream, firing an immediate stop if it was
    /// mid-speech.
    pub(crate) fn drop_ssrc(&self, ssrc: u32) {
        let mut state = self.shared.state.lock();
        state.last_arrival.remove(&ssrc);
        let was_speaking = state.speaking.remove(&ssrc) == Some(true);
        drop(state);

        if was_speaking {
            self.shared.dispatch_stop(ssrc);
        }

        self.shared.cond.notify_all();
    }

    /// Whether a stream is currently mid-speech, if it is known at all.
    pub(crate) fn get_speaking(&self, ssrc: u32) -> Option<bool> {
        self.shared.state.lock().speaking.get(&ssrc).copied()
    }

    pub(crate) fn stop(&self) {
        self.shared.end.store(true, Ordering::Release);
        self.shared.cond.notify_all();

        if let Some(handle) = self.handle.lock().take() {
            drop(handle.join());
        }
    }
}

impl Shared {
    fn dispatch_start(&self, ssrc: u32) {
        let Some(user) = self.tracker.user(ssrc) else {
            trace!("No user known for speaking ssrc {ssrc}; not dispatching.");
            return;
        };
        self.events.dispatch(SinkEvent::SpeakingStart { ssrc, user });
    }

    fn dispatch_stop(&self, ssrc: u32) {
        let Some(user) = self.tracker.user(ssrc) else {
            return;
        };
        self.events.dispatch(SinkEvent::SpeakingStop { ssrc, user });
    }
}

fn run(shared: &Shared) {
    while !shared.end.load(Ordering::Acquire) {
        let mut state = shared.state.lock();

        // The next stream to expire is the speaking one heard from least
        // recently.
        let next = state
            .last_arrival
            .iter()
            .filter(|(ssrc, _)| state.speaking.get(ssrc) == Some(&true))
            .min_by_key(|(_, &at)| at)
            .map(|(&ssrc, &at)| (ssrc, at));

        match next {
            None => {
                shared.cond.wait(&mut state);
            },
            Some((ssrc, last)) => {
                let deadline = last + shared.delay;

                if Instant::now() < deadline {
                    drop(shared.cond.wait_until(&mut state, deadline));
                    continue;
                }

                // Still unrefreshed past the deadline: the stream is quiet.
                state.speaking.insert(ssrc, false);
                drop(state);
                shared.dispatch_stop(ssrc);
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::Config,
        id::UserId,
        receive::router::PacketRouter,
        sink::{
            test::{Probe, ProbeSink},
            SinkEventKind,
        },
    };

    struct Rig {
        timer: SpeakingTimer,
        events: Arc<SinkEventRouter>,
        probe: Probe,
        // The event bus only holds a weak edge to the router.
        _router: Arc<PacketRouter>,
    }

    fn rig(delay: Duration) -> Rig {
        let probe = Probe::default();
        let sink = Box::new(ProbeSink {
            probe: probe.clone(),
            opus: false,
        });

        let tracker = Arc::new(SsrcTracker::default());
        tracker.insert(1, UserId::new(42).unwrap());

        let events = SinkEventRouter::new();
        let router = PacketRouter::new(
            sink,
            Config::default(),
            Arc::clone(&tracker),
            Arc::clone(&events),
        );
        events.bind(&router);

        let timer = SpeakingTimer::new(delay, tracker, Arc::clone(&events));
        Rig {
            timer,
            events,
            probe,
            _router: router,
        }
    }

    #[test]
    fn start_and_stop_fire_around_the_timeout() {
        let delay = Duration::from_millis(50);
        let rig = rig(delay);
        rig.timer.start();

        // First arrival: one start event, no matter how many packets.
        rig.timer.notify(1);
        rig.timer.notify(1);
        rig.events.drain();
        assert_eq!(
            rig.probe.events.lock().unwrap().as_slice(),
            &[SinkEventKind::SpeakingStart]
        );
        assert_eq!(rig.timer.get_speaking(1), Some(true));

        // Silence past the timeout: exactly one stop event.
        thread::sleep(delay * 4);
        rig.events.drain();
        assert_eq!(
            rig.probe.events.lock().unwrap().as_slice(),
            &[SinkEventKind::SpeakingStart, SinkEventKind::SpeakingStop]
        );
        assert_eq!(rig.timer.get_speaking(1), Some(false));

        // A fresh arrival starts a new burst.
        rig.timer.notify(1);
        rig.events.drain();
        assert_eq!(
            rig.probe.events.lock().unwrap().as_slice(),
            &[
                SinkEventKind::SpeakingStart,
                SinkEventKind::SpeakingStop,
                SinkEventKind::SpeakingStart,
            ]
        );

        rig.timer.stop();
    }

    #[test]
    fn sustained_arrivals_defer_the_stop() {
        let delay = Duration::from_millis(60);
        let rig = rig(delay);
        rig.timer.start();

        for _ in 0..5 {
            rig.timer.notify(1);
            thread::sleep(delay / 3);
        }

        rig.events.drain();
        assert_eq!(
            rig.probe.events.lock().unwrap().as_slice(),
            &[SinkEventKind::SpeakingStart]
        );

        rig.timer.stop();
    }

    #[test]
    fn dropping_a_speaking_stream_stops_it_immediately() {
        let delay = Duration::from_secs(60);
        let rig = rig(delay);
        rig.timer.start();

        rig.timer.notify(1);
        rig.timer.drop_ssrc(1);
        rig.events.drain();

        assert_eq!(
            rig.probe.events.lock().unwrap().as_slice(),
            &[SinkEventKind::SpeakingStart, SinkEventKind::SpeakingStop]
        );
        assert_eq!(rig.timer.get_speaking(1), None);

        rig.timer.stop();
    }
}
