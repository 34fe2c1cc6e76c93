//! Wrap-safe sequence/timestamp arithmetic.
//!
//! RTP sequence numbers live in `u16` and timestamps in `u32`; both wrap.
//! All distance reasoning in the receive path goes through these helpers so
//! that values straddling the wrap boundary are treated as small forward
//! steps rather than enormous backward ones.

/// Half of the `u16` sequence space; distances at or beyond this are
/// interpreted as backwards.
const SEQ_HALF: u16 = 1 << 15;

/// Adds `n` to a sequence number, modulo 2^16.
#[inline]
#[must_use]
pub fn seq_add(a: u16, n: u16) -> u16 {
    a.wrapping_add(n)
}

/// Forward distance from `a` to `b`, modulo 2^16.
///
/// `seq_gap(65535, 1) == 2`, while `seq_gap(1, 65535) == 65534` — an
/// old packet shows up as a huge "forward" gap and trips drop thresholds.
#[inline]
#[must_use]
pub fn seq_gap(a: u16, b: u16) -> u16 {
    b.wrapping_sub(a)
}

/// Adds `n` to an RTP timestamp, modulo 2^32.
#[inline]
#[must_use]
pub fn ts_add(a: u32, n: u32) -> u32 {
    a.wrapping_add(n)
}

/// Extends a wrapped sequence number into an unwrapped 64-bit index,
/// relative to a reference point `(ref_ext, ref_seq)`.
///
/// The shortest signed distance decides direction: anything within 2^15
/// ahead of the reference is forward, everything else is behind it.
#[inline]
#[must_use]
pub fn seq_extend(ref_ext: u64, ref_seq: u16, seq: u16) -> u64 {
    let fwd = seq_gap(ref_seq, seq);
    if fwd < SEQ_HALF {
        ref_ext + u64::from(fwd)
    } else {
        ref_ext.saturating_sub(u64::from(seq_gap(seq, ref_seq)))
    }
}
