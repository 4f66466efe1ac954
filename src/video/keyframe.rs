use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::payload::FeedbackCapabilities;
use crate::task::Timer;

/// KeyframeMethod is how a keyframe gets asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyframeMethod {
    /// RTCP picture loss indication
    Pli,
    /// RTCP full intra request with its command sequence number
    Fir(u8),
    /// neither is negotiated; the application asks out of band
    Callback,
}

/// KeyframeStats are the keyframe request counters of one stats period, with running
/// totals and wait times kept across periods.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyframeStats {
    pub requests: u32,
    pub total_requests: u32,
    pub received: u32,
    pub total_received: u32,
    pub min_wait_ms: u64,
    pub max_wait_ms: u64,
    pub avg_wait_ms: u64,
    pub total_wait_ms: u64,
}

/// KeyframeTracker keeps a keyframe request outstanding until one arrives that is new
/// enough, repeating it every interval.
#[derive(Debug)]
pub struct KeyframeTracker {
    requested: bool,
    needed_for_timestamp: u32,
    fir_sequence_number: u8,
    timer: Timer,
    request_began: Option<SystemTime>,
    waits: u64,
    stats: KeyframeStats,
}

impl KeyframeTracker {
    pub fn new(interval: Duration) -> Self {
        KeyframeTracker {
            requested: false,
            needed_for_timestamp: 0,
            fir_sequence_number: 0,
            timer: Timer::new(interval),
            request_began: None,
            waits: 0,
            stats: KeyframeStats::default(),
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested
    }

    pub fn needed_for_timestamp(&self) -> u32 {
        self.needed_for_timestamp
    }

    /// request notes that a keyframe newer than `timestamp` is needed. Returns whether a
    /// request has to go out, which is when none is outstanding.
    pub fn request(&mut self, timestamp: u32) -> bool {
        if timestamp > self.needed_for_timestamp {
            self.needed_for_timestamp = timestamp;
        }
        !self.requested
    }

    /// issue records a request going out now and picks how to send it.
    pub fn issue(&mut self, capabilities: FeedbackCapabilities, now: SystemTime) -> KeyframeMethod {
        self.requested = true;
        self.timer.restart(now);
        if self.request_began.is_none() {
            self.request_began = Some(now);
        }
        self.stats.requests += 1;
        self.stats.total_requests += 1;

        if capabilities.pli {
            KeyframeMethod::Pli
        } else if capabilities.fir {
            let seq = self.fir_sequence_number;
            self.fir_sequence_number = seq.wrapping_add(1);
            KeyframeMethod::Fir(seq)
        } else {
            KeyframeMethod::Callback
        }
    }

    /// received takes note of a keyframe at `timestamp`. Returns the timestamp to ask again
    /// for when the request was for a later frame than this one.
    pub fn received(&mut self, timestamp: u32, now: SystemTime) -> Option<u32> {
        self.stats.received += 1;
        self.stats.total_received += 1;
        if !self.requested {
            return None;
        }

        self.requested = false;
        self.timer.stop();
        if let Some(began) = self.request_began.take() {
            let wait = now.duration_since(began).unwrap_or_default().as_millis() as u64;
            if self.stats.min_wait_ms == 0 || wait < self.stats.min_wait_ms {
                self.stats.min_wait_ms = wait;
            }
            self.stats.max_wait_ms = self.stats.max_wait_ms.max(wait);
            self.stats.total_wait_ms += wait;
            self.waits += 1;
        }

        if timestamp != 0 && timestamp < self.needed_for_timestamp {
            log::debug!(
                "video keyframe {} older than the one needed at {}",
                timestamp,
                self.needed_for_timestamp
            );
            Some(self.needed_for_timestamp)
        } else {
            None
        }
    }

    /// on_timer reports whether an outstanding request is due to be sent again.
    pub fn on_timer(&mut self, now: SystemTime) -> bool {
        self.timer.fire(now) && self.requested
    }

    pub fn deadline(&self) -> Option<SystemTime> {
        self.timer.deadline()
    }

    /// reset forgets the timestamp asked for, as for a new stream.
    pub fn reset(&mut self) {
        self.needed_for_timestamp = 0;
    }

    /// stop drops an outstanding request.
    pub fn stop(&mut self) {
        self.requested = false;
        self.request_began = None;
        self.timer.stop();
    }

    pub fn stats_take(&mut self) -> KeyframeStats {
        let mut stats = self.stats.clone();
        if self.waits > 0 {
            stats.avg_wait_ms = stats.total_wait_ms / self.waits;
        }
        self.stats.requests = 0;
        self.stats.received = 0;
        stats
    }
}
