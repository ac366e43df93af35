//! Wrap-tolerant comparison for sequence and frame counters
//!
//! Every counter on the wire (packet sequences, reliable command sequences,
//! snapshot frame numbers) is a `u32` that is allowed to wrap. Two values are
//! compared through their signed distance, so `a` is newer than `b` when
//! `a.wrapping_sub(b)` interpreted as `i32` is positive. The rule holds as long
//! as the two values being compared are less than 2^31 apart, which every
//! bounded history window in this crate guarantees.

/// Counter type used for sequences and frame numbers.
pub type Seq = u32;

/// Signed distance from `b` to `a`.
#[inline]
pub fn seq_diff(a: Seq, b: Seq) -> i32 {
    a.wrapping_sub(b) as i32
}

/// `a` is strictly newer than `b`.
#[inline]
pub fn seq_greater_than(a: Seq, b: Seq) -> bool {
    seq_diff(a, b) > 0
}

/// `a` is strictly older than `b`.
#[inline]
pub fn seq_less_than(a: Seq, b: Seq) -> bool {
    seq_diff(a, b) < 0
}

/// The newer of two counters.
#[inline]
pub fn seq_max(a: Seq, b: Seq) -> Seq {
    if seq_greater_than(b, a) {
        b
    } else {
        a
    }
}

/// Number of steps from `older` forward to `newer`, or `None` when `newer`
/// is actually behind `older`.
#[inline]
pub fn seq_span(older: Seq, newer: Seq) -> Option<u32> {
    let d = seq_diff(newer, older);
    if d < 0 {
        None
    } else {
        Some(d as u32)
    }
}
