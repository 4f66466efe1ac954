//! Modular arithmetic over the 16-bit RTP sequence-number ring, and the
//! reconstruction of 32-bit extended sequence numbers per SSRC.
#[cfg(test)]
mod sequence_test;

use std::collections::HashMap;

pub(crate) const UINT16SIZE_HALF: u16 = 1 << 15;

/// A sequence number at or above this value, seen after the stream wrapped,
/// belongs to the previous cycle.
const SEQ_HIGH_BAND: u16 = 0xc000;
/// A sequence number at or below this value, seen while the highest number is in
/// the high band, starts a new cycle.
const SEQ_LOW_BAND: u16 = 0x3fff;
/// Highest number still considered "just wrapped" when a late high packet arrives.
const SEQ_JUST_WRAPPED: u16 = 0x00ff;

/// Lower edge of the late-arrival wrap window: a packet numbered at or below
/// `WRAP_WINDOW_LOW` while `expected` is at or above `WRAP_WINDOW_HIGH` is ahead, not stale.
pub const WRAP_WINDOW_LOW: u16 = 0x00ff;
pub const WRAP_WINDOW_HIGH: u16 = 0xff00;

/// Extended sequence numbers start one cycle in so that zero stays reserved.
const INITIAL_CYCLE: u32 = 0x1_0000;

/// forward_distance returns how many steps `to` is after `from` going forward around the ring.
pub fn forward_distance(from: u16, to: u16) -> u16 {
    to.wrapping_sub(from)
}

/// seq_distance returns the shortest distance between two sequence numbers in either direction.
pub fn seq_distance(x: u16, y: u16) -> u16 {
    let diff = x.wrapping_sub(y);
    if diff > UINT16SIZE_HALF {
        (!diff).wrapping_add(1)
    } else {
        diff
    }
}

/// is_ahead reports whether `a` comes strictly after `b` in ring order.
pub fn is_ahead(a: u16, b: u16) -> bool {
    let d = forward_distance(b, a);
    d != 0 && d < UINT16SIZE_HALF
}

/// in_wrap_window reports whether `sn` only looks behind `expected` because the
/// 16-bit counter wrapped between them.
pub fn in_wrap_window(sn: u16, expected: u16) -> bool {
    sn <= WRAP_WINDOW_LOW && expected >= WRAP_WINDOW_HIGH
}

/// packets_skipped counts the sequence numbers from `expected` up to, but not including,
/// `found`, walking forward around the ring.
pub fn packets_skipped(expected: u16, found: u16) -> u32 {
    forward_distance(expected, found) as u32
}

/// packets_received_span is the number of packets between two sequence numbers inclusive
/// of the last, allowing for a single rollover of the 16-bit counter.
pub fn packets_received_span(first: u16, last: u16) -> u32 {
    if last >= first {
        (last - first) as u32
    } else {
        (0xFFFF - first as u32) + last as u32 + 1
    }
}

#[derive(Debug, Clone, Copy)]
struct SsrcSequence {
    cycles: u32,
    max: u16,
}

/// ExtendedSequenceTracker turns 16-bit RTP sequence numbers into 32-bit monotonic ones.
///
/// Each SSRC keeps its own cycle count and highest sequence number seen. A number in the low
/// quarter of the ring arriving while the highest number sits in the top quarter is taken as
/// a wrap. A number in the top quarter arriving just after a wrap is a late packet of the
/// previous cycle.
#[derive(Debug, Default)]
pub struct ExtendedSequenceTracker {
    streams: HashMap<u32, SsrcSequence>,
}

impl ExtendedSequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// extend returns the extended sequence number for `sn` on stream `ssrc`,
    /// updating the stream's wrap state.
    pub fn extend(&mut self, ssrc: u32, sn: u16) -> u32 {
        let state = self.streams.entry(ssrc).or_insert(SsrcSequence {
            cycles: INITIAL_CYCLE,
            max: sn,
        });

        if sn >= state.max {
            if state.max <= SEQ_JUST_WRAPPED && sn >= SEQ_HIGH_BAND {
                // straggler from before the wrap
                return (state.cycles - INITIAL_CYCLE) | sn as u32;
            }
            state.max = sn;
        } else if state.max >= SEQ_HIGH_BAND && sn <= SEQ_LOW_BAND {
            state.cycles += INITIAL_CYCLE;
            state.max = sn;
        }

        state.cycles | sn as u32
    }

    /// forget drops the wrap state kept for `ssrc`.
    pub fn forget(&mut self, ssrc: u32) {
        self.streams.remove(&ssrc);
    }

    pub fn clear(&mut self) {
        self.streams.clear();
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
