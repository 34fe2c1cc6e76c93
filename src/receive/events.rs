//! Typed event bus delivering lifecycle events into the sink tree.
//!
//! Producers enqueue from any thread; a single consumer drains the queue
//! and invokes subscribed sinks. Dispatch holds the event-router lock and
//! then the packet-router lock, so listeners always observe a consistent
//! decoder graph.

use super::router::PacketRouter;
use crate::sink::{walk, SinkEvent, SinkEventKind};
use flume::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Weak,
    },
    time::Duration,
};
use tracing::{debug, trace};

pub(crate) struct SinkEventRouter {
    tx: Sender<SinkEvent>,
    rx: Receiver<SinkEvent>,
    router: Mutex<Weak<PacketRouter>>,
    interested: Mutex<HashSet<SinkEventKind>>,
    end: AtomicBool,
}

impl SinkEventRouter {
    pub(crate) fn new() -> Arc<Self> {
        let (tx, rx) = flume::unbounded();

        Arc::new(Self {
            tx,
            rx,
            router: Mutex::new(Weak::new()),
            interested: Mutex::new(HashSet::new()),
            end: AtomicBool::new(false),
        })
    }

    /// Points the bus at the packet router whose sink tree receives
    /// events, then records that tree's subscriptions.
    pub(crate) fn bind(&self, router: &Arc<PacketRouter>) {
        *self.router.lock() = Arc::downgrade(router);
        self.rebuild();
    }

    /// Re-walks the sink tree and records which event classes any sink
    /// subscribes to. Call after the tree changes.
    pub(crate) fn rebuild(&self) {
        let Some(router) = self.router.lock().upgrade() else {
            return;
        };

        let mut kinds = HashSet::new();
        {
            let mut inner = router.inner.lock();
            walk(inner.sink.as_mut(), true, &mut |sink| {
                kinds.extend(sink.listens_to().iter().copied());
            });
        }

        debug!("Sink tree listens to: {kinds:?}");
        *self.interested.lock() = kinds;
    }

    /// Enqueues an event for delivery on the consumer thread.
    pub(crate) fn dispatch(&self, event: SinkEvent) {
        trace!("Dispatch voice event {:?}", event.kind());
        drop(self.tx.send(event));
    }

    /// Drains at most one event, blocking up to `timeout` for it.
    pub(crate) fn run_once(&self, timeout: Duration) {
        let event = match self.rx.recv_timeout(timeout) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return,
        };

        let interested = self.interested.lock();
        if !interested.contains(&event.kind()) {
            return;
        }

        let Some(router) = self.router.lock().upgrade() else {
            return;
        };

        let mut inner = router.inner.lock();
        let kind = event.kind();
        walk(inner.sink.as_mut(), true, &mut |sink| {
            if sink.listens_to().contains(&kind) {
                sink.on_event(&event);
            }
        });
    }

    /// Drains everything currently queued without blocking.
    #[cfg(test)]
    pub(crate) fn drain(&self) {
        while !self.rx.is_empty() {
            self.run_once(Duration::ZERO);
        }
    }

    pub(crate) fn stop(&self) {
        self.end.store(true, Ordering::Release);
    }

    pub(crate) fn stopped(&self) -> bool {
        self.end.load(Ordering::Acquire)
    }

    /// Rearms the bus for another `start`/`stop` cycle.
    pub(crate) fn restart(&self) {
        self.end.store(false, Ordering::Release);
    }
}
