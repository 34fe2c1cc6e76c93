//! Per-speaker reorder buffer.
//!
//! Packets are keyed on an *extended* 64-bit sequence number, which gives
//! min-ordering, one-entry-per-sequence, and wrap safety in a single
//! structure. A release ("pop") hands out the next sequential packet; when
//! the buffer has filled up behind a hole, it instead hands out a
//! [`Popped::Placeholder`] per missing frame so the consumer can conceal
//! the loss without stalling.

use crate::{
    config::Config,
    constants::*,
    packet::{
        wrap::{seq_add, seq_extend, seq_gap},
        RtpPacket,
    },
};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};
use tracing::debug;

/// Base value for extended sequence numbers, leaving room below for
/// packets that arrive out of order around the anchor.
const EXT_BASE: u64 = 1 << 32;

/// Result of a successful release.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Popped {
    /// The next packet in sequence order.
    Packet(RtpPacket),
    /// A frame is missing ahead of the buffered head; the consumer should
    /// synthesise it. The buffer's release cursor has already advanced.
    Placeholder,
}

struct Inner {
    max_size: usize,
    pref_size: usize,
    prefill: usize,
    prefill_left: usize,
    threshold: u16,
    /// Extended/raw sequence of the last released packet.
    last_tx: Option<(u64, u16)>,
    /// Reference point for unwrapping incoming sequence numbers; follows
    /// the most recent insert or release.
    ref_point: Option<(u64, u16)>,
    packets: BTreeMap<u64, RtpPacket>,
    ready: bool,
}

impl Inner {
    fn extend(&self, seq: u16) -> u64 {
        match self.ref_point {
            Some((ref_ext, ref_seq)) => seq_extend(ref_ext, ref_seq, seq),
            None => EXT_BASE + u64::from(seq),
        }
    }

    fn is_full(&self) -> bool {
        self.packets.len() >= self.max_size
    }

    fn head_sequential(&self) -> bool {
        match (self.packets.keys().next(), self.last_tx) {
            (Some(&head_ext), Some((last_ext, _))) => head_ext == last_ext + 1,
            _ => false,
        }
    }

    /// Ready ⇔ prefill exhausted, occupancy above `pref_size`, and the
    /// head is releasable (sequential, first ever, or forced by fullness).
    fn recompute_ready(&mut self) {
        let prefilled = self.prefill_left == 0;
        let occupancy = self.packets.len() > self.pref_size;
        let releasable = self.last_tx.is_none() || self.head_sequential() || self.is_full();

        self.ready = prefilled && occupancy && releasable;
    }

    fn release(&mut self) -> Option<Popped> {
        let (&head_ext, _) = self.packets.first_key_value()?;

        let out = match self.last_tx {
            Some((last_ext, last_seq)) if head_ext != last_ext + 1 => {
                // Forced release over a hole: advance one step and let the
                // consumer fill it in.
                let seq = seq_add(last_seq, 1);
                self.last_tx = Some((last_ext + 1, seq));
                Popped::Placeholder
            },
            _ => {
                let (ext, pkt) = self.packets.pop_first()?;
                self.last_tx = Some((ext, pkt.sequence));
                self.ref_point = Some((ext, pkt.sequence));
                Popped::Packet(pkt)
            },
        };

        self.recompute_ready();
        Some(out)
    }
}

/// A bounded, wrap-safe reorder buffer with a readiness signal.
pub(crate) struct JitterBuffer {
    inner: Mutex<Inner>,
    ready: Condvar,
}

impl JitterBuffer {
    pub(crate) fn new(config: &Config) -> Self {
        let max_size = config.jitter_max_size.max(1);

        Self {
            inner: Mutex::new(Inner {
                max_size,
                pref_size: config.jitter_pref_size.min(max_size),
                prefill: config.jitter_prefill,
                prefill_left: config.jitter_prefill,
                threshold: JITTER_DROP_THRESHOLD,
                last_tx: None,
                ref_point: None,
                packets: BTreeMap::new(),
                ready: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Inserts a packet, unless it is stale (released already, or beyond
    /// the drop threshold) or a duplicate of a buffered sequence.
    pub(crate) fn push(&self, packet: RtpPacket) -> bool {
        let mut inner = self.inner.lock();

        if let Some((_, last_seq)) = inner.last_tx {
            let gap = seq_gap(last_seq, packet.sequence);
            if gap == 0 || gap > inner.threshold {
                debug!(
                    "Dropping stale packet seq {} (last released {last_seq})",
                    packet.sequence
                );
                return false;
            }
        }

        let ext = inner.extend(packet.sequence);
        if let Some((last_ext, _)) = inner.last_tx {
            if ext <= last_ext {
                debug!("Dropping already-released packet seq {}", packet.sequence);
                return false;
            }
        }
        if inner.packets.contains_key(&ext) {
            debug!("Dropping duplicate packet seq {}", packet.sequence);
            return false;
        }

        inner.ref_point = Some((ext, packet.sequence));
        inner.packets.insert(ext, packet);

        if inner.prefill_left > 0 {
            inner.prefill_left -= 1;
        }

        while inner.packets.len() > inner.max_size {
            inner.packets.pop_first();
        }

        inner.recompute_ready();
        if inner.ready {
            self.ready.notify_all();
        }

        true
    }

    /// Waits up to `timeout` for the buffer to become ready, then releases
    /// the next packet or placeholder.
    pub(crate) fn pop(&self, timeout: Duration) -> Option<Popped> {
        let mut inner = self.inner.lock();

        if !inner.ready && !timeout.is_zero() {
            let deadline = Instant::now() + timeout;
            while !inner.ready {
                if self.ready.wait_until(&mut inner, deadline).timed_out() {
                    break;
                }
            }
        }

        if !inner.ready || inner.prefill_left > 0 {
            return None;
        }

        inner.release()
    }

    /// The buffered head, iff it directly continues the release cursor
    /// (or nothing has been released yet) — the FEC source for a frame
    /// being concealed.
    pub(crate) fn peek_next(&self) -> Option<RtpPacket> {
        let inner = self.inner.lock();
        let (_, head) = inner.packets.first_key_value()?;

        if inner.last_tx.is_none() || inner.head_sequential() {
            Some(head.clone())
        } else {
            None
        }
    }

    /// Forward distance from the release cursor to the buffered head.
    pub(crate) fn gap(&self) -> u16 {
        let inner = self.inner.lock();
        match (inner.last_tx, inner.packets.values().next()) {
            (Some((_, last_seq)), Some(head)) => seq_gap(last_seq, head.sequence),
            _ => 0,
        }
    }

    /// Drains the buffer in order, moving the release cursor past the
    /// largest drained sequence and restoring the prefill debt.
    pub(crate) fn flush(&self) -> Vec<RtpPacket> {
        let mut inner = self.inner.lock();
        let drained = std::mem::take(&mut inner.packets);

        if let Some((&ext, pkt)) = drained.last_key_value() {
            inner.last_tx = Some((ext, pkt.sequence));
            inner.ref_point = Some((ext, pkt.sequence));
        }

        inner.prefill_left = inner.prefill;
        inner.ready = false;

        drained.into_values().collect()
    }

    /// Clears all state, as if freshly constructed.
    pub(crate) fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.packets.clear();
        inner.last_tx = None;
        inner.ref_point = None;
        inner.prefill_left = inner.prefill;
        inner.ready = false;
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.inner.lock().ready
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().packets.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().packets.len()
    }
}
