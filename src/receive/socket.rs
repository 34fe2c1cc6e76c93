//! Dedicated thread reading raw datagrams off the voice UDP socket.

use crate::constants::*;
use parking_lot::{Condvar, Mutex};
use std::{
    io::ErrorKind,
    net::UdpSocket,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
};
use tracing::{debug, error, trace};

/// Handle for unregistering a previously registered callback.
pub type CallbackId = usize;

type Callback = Arc<dyn Fn(&[u8]) + Send + Sync>;

struct Shared {
    socket: Arc<UdpSocket>,
    callbacks: Mutex<Vec<(CallbackId, Callback)>>,
    next_id: AtomicUsize,
    running: Mutex<bool>,
    running_cond: Condvar,
    idle_paused: AtomicBool,
    end: AtomicBool,
}

/// Polls the voice socket and fans raw datagrams out to registered
/// callbacks.
///
/// The reader idles (parked on a condition) while nobody is registered,
/// wakes when the first callback appears, and can also be paused
/// explicitly during connection recovery. Callback panics are contained
/// and logged; they never tear the reader down.
pub struct SocketEventReader {
    shared: Arc<Shared>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SocketEventReader {
    /// Spawns the reader thread over `socket`, initially idle-paused.
    pub(crate) fn spawn(socket: Arc<UdpSocket>) -> Arc<Self> {
        drop(socket.set_read_timeout(Some(SOCKET_POLL_TIMEOUT)));

        let shared = Arc::new(Shared {
            socket,
            callbacks: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            running: Mutex::new(false),
            running_cond: Condvar::new(),
            idle_paused: AtomicBool::new(true),
            end: AtomicBool::new(false),
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("voice-socket-reader".into())
            .spawn(move || run(&worker))
            .expect("spawning the socket reader thread cannot fail");

        Arc::new(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Registers a datagram callback, waking the reader if it was idle.
    pub(crate) fn register(&self, callback: Box<dyn Fn(&[u8]) + Send + Sync>) -> CallbackId {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.callbacks.lock().push((id, Arc::from(callback)));

        if self.shared.idle_paused.swap(false, Ordering::AcqRel) {
            self.set_running(true);
        }

        id
    }

    /// Removes a callback; the reader idles again once none remain.
    pub(crate) fn unregister(&self, id: CallbackId) {
        let mut callbacks = self.shared.callbacks.lock();
        callbacks.retain(|(cb_id, _)| *cb_id != id);

        if callbacks.is_empty() {
            drop(callbacks);
            self.shared.idle_paused.store(true, Ordering::Release);
            self.set_running(false);
        }
    }

    /// Explicitly parks the reader, e.g. while a session reconnects.
    pub fn pause(&self) {
        self.shared.idle_paused.store(false, Ordering::Release);
        self.set_running(false);
    }

    /// Unparks the reader. Without `force`, a reader with no callbacks
    /// stays idle.
    pub fn resume(&self, force: bool) {
        if *self.shared.running.lock() {
            return;
        }

        if !force && self.shared.callbacks.lock().is_empty() {
            self.shared.idle_paused.store(true, Ordering::Release);
            return;
        }

        self.shared.idle_paused.store(false, Ordering::Release);
        self.set_running(true);
    }

    /// Permanently stops the reader thread.
    pub fn stop(&self) {
        self.shared.end.store(true, Ordering::Release);
        self.set_running(true);

        if let Some(handle) = self.handle.lock().take() {
            drop(handle.join());
        }
    }

    fn set_running(&self, value: bool) {
        *self.shared.running.lock() = value;
        self.shared.running_cond.notify_all();
    }
}

fn run(shared: &Shared) {
    trace!("Socket reader thread started.");
    let mut buf = [0u8; UDP_RECV_BUFFER_SIZE];

    while !shared.end.load(Ordering::Acquire) {
        {
            let mut running = shared.running.lock();
            while !*running && !shared.end.load(Ordering::Acquire) {
                shared.running_cond.wait(&mut running);
            }
        }

        if shared.end.load(Ordering::Acquire) {
            break;
        }

        let len = match shared.socket.recv(&mut buf) {
            Ok(len) => len,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                continue;
            },
            Err(e) => {
                debug!("Error reading from voice socket, should be safe to ignore: {e}.");
                continue;
            },
        };

        // Snapshot so a callback may (un)register listeners or stop the
        // reader without deadlocking against this dispatch.
        let callbacks = shared.callbacks.lock().clone();
        for (id, callback) in &callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&buf[..len]))).is_err() {
                error!("Socket callback {id} panicked on a datagram.");
            }
        }
    }

    trace!("Socket reader thread stopped.");
}

impl Drop for SocketEventReader {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{sync::mpsc, time::Duration};

    fn loopback_pair() -> (Arc<UdpSocket>, UdpSocket) {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.connect(receiver.local_addr().unwrap()).unwrap();
        (Arc::new(receiver), sender)
    }

    #[test]
    fn dispatches_datagrams_to_registered_callbacks() {
        let (receiver, sender) = loopback_pair();
        let reader = SocketEventReader::spawn(receiver);

        let (tx, rx) = mpsc::channel();
        let id = reader.register(Box::new(move |data| {
            drop(tx.send(data.to_vec()));
        }));

        sender.send(b"hello voice").unwrap();
        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, b"hello voice");

        // After unregistering, traffic no longer reaches the callback.
        reader.unregister(id);
        sender.send(b"more").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        reader.stop();
    }

    #[test]
    fn panicking_callback_does_not_kill_the_reader() {
        let (receiver, sender) = loopback_pair();
        let reader = SocketEventReader::spawn(receiver);

        reader.register(Box::new(|_| panic!("listener bug")));
        let (tx, rx) = mpsc::channel();
        reader.register(Box::new(move |data| {
            drop(tx.send(data.len()));
        }));

        sender.send(&[0u8; 4]).unwrap();
        sender.send(&[0u8; 8]).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 4);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 8);

        reader.stop();
    }

    #[test]
    fn pause_and_resume_gate_dispatch() {
        let (receiver, sender) = loopback_pair();
        let reader = SocketEventReader::spawn(receiver);

        let (tx, rx) = mpsc::channel();
        reader.register(Box::new(move |data| {
            drop(tx.send(data.to_vec()));
        }));

        reader.pause();
        // Give the reader a moment to park before traffic arrives.
        std::thread::sleep(Duration::from_millis(50));
        sender.send(b"while paused").unwrap();

        reader.resume(false);
        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got, b"while paused");

        reader.stop();
    }
}
