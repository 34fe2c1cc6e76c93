use crate::{constants::*, dave::DaveSession};
use derivative::Derivative;
use std::{sync::Arc, time::Duration};

/// Configuration for voice connections and their audio readers.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
#[non_exhaustive]
pub struct Config {
    /// Maximum time to wait for an attempted voice connection to complete
    /// its handshake.
    ///
    /// Defaults to 10 seconds. If set to `None`, connection attempts never
    /// time out.
    pub connection_timeout: Option<Duration>,
    /// Upper bound on per-speaker jitter buffer occupancy; the oldest packet
    /// is evicted beyond this.
    ///
    /// Defaults to 10 packets (200 ms of audio).
    pub jitter_max_size: usize,
    /// Number of packets held back for reordering; a packet is only
    /// released while more than this many are buffered.
    ///
    /// Defaults to 1.
    pub jitter_pref_size: usize,
    /// Packets that must arrive on a fresh (or reset) stream before the
    /// first release.
    ///
    /// Defaults to 1.
    pub jitter_prefill: usize,
    /// Quiet period after which a speaking stream is deemed to have
    /// stopped, firing the corresponding sink event.
    ///
    /// Defaults to 200 ms.
    pub speaking_timeout: Duration,
    #[derivative(Debug = "ignore")]
    /// End-to-end group encryption session, applied to eligible streams
    /// after transport decryption.
    ///
    /// Defaults to `None`.
    pub dave_session: Option<Arc<dyn DaveSession>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection_timeout: Some(Duration::from_secs(10)),
            jitter_max_size: 10,
            jitter_pref_size: 1,
            jitter_prefill: 1,
            speaking_timeout: SPEAKING_TIMEOUT_DELAY,
            dave_session: None,
        }
    }
}

impl Config {
    /// Sets this `Config`'s connection handshake timeout.
    #[must_use]
    pub fn connection_timeout(mut self, connection_timeout: Option<Duration>) -> Self {
        self.connection_timeout = connection_timeout;
        self
    }

    /// Sets this `Config`'s jitter buffer capacity.
    #[must_use]
    pub fn jitter_max_size(mut self, jitter_max_size: usize) -> Self {
        self.jitter_max_size = jitter_max_size.max(1);
        self
    }

    /// Sets this `Config`'s reorder holdback depth.
    #[must_use]
    pub fn jitter_pref_size(mut self, jitter_pref_size: usize) -> Self {
        self.jitter_pref_size = jitter_pref_size;
        self
    }

    /// Sets this `Config`'s stream prefill requirement.
    #[must_use]
    pub fn jitter_prefill(mut self, jitter_prefill: usize) -> Self {
        self.jitter_prefill = jitter_prefill;
        self
    }

    /// Sets this `Config`'s speaking-stop detection delay.
    #[must_use]
    pub fn speaking_timeout(mut self, speaking_timeout: Duration) -> Self {
        self.speaking_timeout = speaking_timeout;
        self
    }

    /// Sets this `Config`'s end-to-end group session.
    #[must_use]
    pub fn dave_session(mut self, dave_session: Option<Arc<dyn DaveSession>>) -> Self {
        self.dave_session = dave_session;
        self
    }
}
