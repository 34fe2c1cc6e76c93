//! UDP hole-punch keep-alive.
//!
//! The voice server expects a small counter datagram on a fixed cadence,
//! independent of any media traffic, to keep NAT mappings warm.

use crate::constants::UDP_KEEPALIVE_GAP;
use parking_lot::{Condvar, Mutex};
use std::{net::UdpSocket, sync::Arc, thread};
use tracing::{debug, trace};

struct Shared {
    socket: Arc<UdpSocket>,
    stopped: Mutex<bool>,
    cond: Condvar,
}

/// Sends an incrementing 8-byte big-endian counter every five seconds.
pub(crate) struct UdpKeepAlive {
    shared: Arc<Shared>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl UdpKeepAlive {
    pub(crate) fn new(socket: Arc<UdpSocket>) -> Self {
        Self {
            shared: Arc::new(Shared {
                socket,
                stopped: Mutex::new(false),
                cond: Condvar::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    pub(crate) fn start(&self) {
        *self.shared.stopped.lock() = false;

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("voice-udp-keepalive".into())
            .spawn(move || run(&shared))
            .expect("spawning the keepalive thread cannot fail");

        *self.handle.lock() = Some(handle);
    }

    pub(crate) fn stop(&self) {
        *self.shared.stopped.lock() = true;
        self.shared.cond.notify_all();

        if let Some(handle) = self.handle.lock().take() {
            drop(handle.join());
        }
    }
}

fn run(shared: &Shared) {
    trace!("UDP keepalive started.");
    let mut counter: u64 = 0;

    loop {
        let mut stopped = shared.stopped.lock();
        if *stopped {
            break;
        }

        if let Err(e) = shared.socket.send(&counter.to_be_bytes()) {
            debug!("Error while sending UDP keepalive: {e}.");
        } else {
            counter = counter.wrapping_add(1);
        }

        drop(shared.cond.wait_for(&mut stopped, UDP_KEEPALIVE_GAP));
        if *stopped {
            break;
        }
    }

    trace!("UDP keepalive stopped.");
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn sends_counter_datagrams_and_stops_cleanly() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.connect(receiver.local_addr().unwrap()).unwrap();

        let keepalive = UdpKeepAlive::new(Arc::new(sender));
        keepalive.start();

        let mut buf = [0u8; 16];
        let len = receiver.recv(&mut buf).unwrap();
        assert_eq!(len, 8);
        assert_eq!(u64::from_be_bytes(buf[..8].try_into().unwrap()), 0);

        keepalive.stop();
    }
}
