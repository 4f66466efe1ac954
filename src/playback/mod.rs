//! State shared by the audio and video playback tasks.
#[cfg(test)]
mod playback_test;

pub mod keepalive;
pub mod nack;

use std::fmt;

pub use keepalive::KeepAlive;
pub use nack::{pack_nacks, NackTracker};

/// MuteReason is one of the independent reasons a playback stream is muted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MuteReason {
    /// the remote side put the call on hold
    Held,
    /// the call was put on hold locally
    Hold,
    /// the remote side turned its media off
    Privacy,
    Dhv,
}

impl MuteReason {
    fn bit(self) -> u8 {
        match self {
            MuteReason::Held => 0x01,
            MuteReason::Hold => 0x02,
            MuteReason::Privacy => 0x04,
            MuteReason::Dhv => 0x08,
        }
    }
}

impl fmt::Display for MuteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MuteReason::Held => "held",
            MuteReason::Hold => "hold",
            MuteReason::Privacy => "privacy",
            MuteReason::Dhv => "dhv",
        };
        f.write_str(s)
    }
}

/// HoldLocation is the side that put a call on hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HoldLocation {
    Local,
    Remote,
    Dhv,
}

impl HoldLocation {
    pub fn mute_reason(self) -> MuteReason {
        match self {
            HoldLocation::Local => MuteReason::Hold,
            HoldLocation::Remote => MuteReason::Held,
            HoldLocation::Dhv => MuteReason::Dhv,
        }
    }
}

/// MuteState is the set of mute reasons currently in effect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MuteState(u8);

impl MuteState {
    pub fn is_muted(&self) -> bool {
        self.0 != 0
    }

    pub fn contains(&self, reason: MuteReason) -> bool {
        self.0 & reason.bit() != 0
    }

    /// is_only reports whether `reason` is the sole reason in effect.
    pub fn is_only(&self, reason: MuteReason) -> bool {
        self.0 == reason.bit()
    }

    /// set adds `reason` and reports whether it was newly set.
    pub fn set(&mut self, reason: MuteReason) -> bool {
        let newly = !self.contains(reason);
        self.0 |= reason.bit();
        newly
    }

    /// clear removes `reason` and reports whether it had been set.
    pub fn clear(&mut self, reason: MuteReason) -> bool {
        let was = self.contains(reason);
        self.0 &= !reason.bit();
        was
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

/// LossCounter accumulates packets reported lost.
///
/// A later correction may take packets back off the count, but never below zero. The
/// actual count only grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LossCounter {
    lost: u32,
    actual: u32,
    written_off: Option<WrittenOff>,
}

/// WrittenOff is the most recent run of sequence numbers given up on. The first 64 of them
/// can each be taken back once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct WrittenOff {
    start: u16,
    count: u16,
    returned: u64,
}

impl LossCounter {
    pub fn add(&mut self, n: u32) {
        self.lost = self.lost.saturating_add(n);
        self.actual = self.actual.saturating_add(n);
    }

    pub fn subtract(&mut self, n: u32) {
        self.lost = self.lost.saturating_sub(n);
    }

    /// write_off counts the `count` sequence numbers starting at `start` as lost and
    /// remembers them in case they turn up late.
    pub fn write_off(&mut self, start: u16, count: u32) {
        if count == 0 {
            return;
        }
        self.add(count);
        self.written_off = Some(WrittenOff {
            start,
            count: count.min(u16::MAX as u32) as u16,
            returned: 0,
        });
    }

    /// late_arrival takes a packet back off the lost count when it belongs to the run last
    /// written off. Returns whether it did.
    pub fn late_arrival(&mut self, sequence_number: u16) -> bool {
        let run = match self.written_off.as_mut() {
            Some(run) => run,
            None => return false,
        };
        let offset = sequence_number.wrapping_sub(run.start);
        if offset >= run.count || offset >= 64 {
            return false;
        }
        let bit = 1u64 << offset;
        if run.returned & bit != 0 {
            return false;
        }
        run.returned |= bit;
        self.subtract(1);
        true
    }

    pub fn lost(&self) -> u32 {
        self.lost
    }

    pub fn actual(&self) -> u32 {
        self.actual
    }

    /// take returns the counts of the period and clears them. The written-off run is kept.
    pub fn take(&mut self) -> LossCounter {
        let taken = LossCounter {
            lost: self.lost,
            actual: self.actual,
            written_off: None,
        };
        self.lost = 0;
        self.actual = 0;
        taken
    }
}

/// ReceivedSpan tracks the first and last sequence numbers played to count packets received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceivedSpan {
    first: Option<u16>,
    last: Option<u16>,
}

impl ReceivedSpan {
    pub fn add(&mut self, sequence_number: u16) {
        if self.first.is_none() {
            self.first = Some(sequence_number);
        } else {
            self.last = Some(sequence_number);
        }
    }

    /// packets is the distance from the first to the last sequence number seen.
    pub fn packets(&self) -> u32 {
        match (self.first, self.last) {
            (Some(first), Some(last)) => crate::sequence::packets_received_span(first, last),
            _ => 0,
        }
    }

    pub fn take(&mut self) -> ReceivedSpan {
        std::mem::take(self)
    }
}
