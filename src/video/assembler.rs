use std::collections::{BTreeMap, VecDeque};

use crate::error::Result;
use crate::packet::SharedPacket;
use crate::queue::FramePacketQueue;

/// JitterFrame is a frame whose packets are final, waiting for its time to play.
#[derive(Debug)]
pub struct JitterFrame {
    pub timestamp: u32,
    pub packets: FramePacketQueue,
    /// every packet from the frame start to its marker was received
    pub complete: bool,
}

/// FrameAssembler groups video packets into frames by RTP timestamp.
///
/// Groups that are still receiving packets are "processed". A group moves on to the jitter
/// buffer once it is complete and follows the last group moved without a gap, or when
/// playback can't wait for it any longer. Groups in the jitter buffer are final and play in
/// the order they were moved.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    processed: BTreeMap<u32, FramePacketQueue>,
    jitter: VecDeque<JitterFrame>,
    /// last extended sequence number moved to the jitter buffer, 0 when none was
    last_seq_in_buffer: u32,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// insert adds `packet` to the group of its timestamp.
    pub fn insert(&mut self, packet: SharedPacket) -> Result<()> {
        self.processed
            .entry(packet.timestamp())
            .or_default()
            .insert(packet)
    }

    pub fn contains_timestamp(&self, timestamp: u32) -> bool {
        self.processed.contains_key(&timestamp)
    }

    /// processed_len is the number of frames still collecting packets.
    pub fn processed_len(&self) -> usize {
        self.processed.len()
    }

    pub fn jitter_len(&self) -> usize {
        self.jitter.len()
    }

    pub fn jitter_is_empty(&self) -> bool {
        self.jitter.is_empty()
    }

    pub fn jitter_front_timestamp(&self) -> Option<u32> {
        self.jitter.front().map(|f| f.timestamp)
    }

    pub fn last_seq_in_buffer(&self) -> Option<u32> {
        if self.last_seq_in_buffer == 0 {
            None
        } else {
            Some(self.last_seq_in_buffer)
        }
    }

    /// reset_last_seq lets the next group in regardless of what was moved before.
    pub fn reset_last_seq(&mut self) {
        self.last_seq_in_buffer = 0;
    }

    pub fn clear(&mut self) {
        self.processed.clear();
        self.jitter.clear();
        self.last_seq_in_buffer = 0;
    }

    /// oldest_processed_packet is the first packet of the group that plays next.
    pub fn oldest_processed_packet(&self) -> Option<&SharedPacket> {
        self.next_time_to_send()
            .and_then(|ts| self.processed.get(&ts))
            .and_then(|group| group.front())
    }

    /// oldest_bounds is the timestamp of the oldest group and the last sequence number in it.
    pub fn oldest_bounds(&self) -> Option<(u32, u32)> {
        let timestamp = self.next_time_to_send()?;
        self.processed
            .get(&timestamp)
            .and_then(|group| group.first_and_last_sequence_number())
            .map(|(_, last)| (timestamp, last))
    }

    /// next_time_to_send is the timestamp of the oldest group. Groups are ordered by sequence
    /// number rather than timestamp so a timestamp wrap doesn't reorder them.
    pub fn next_time_to_send(&self) -> Option<u32> {
        self.processed
            .iter()
            .filter_map(|(ts, group)| group.first_and_last_sequence_number().map(|(f, _)| (f, *ts)))
            .min()
            .map(|(_, ts)| ts)
    }

    /// next_group_first is the first sequence number of the group that follows `last`.
    fn next_group_first(&self, last: u32) -> Option<u32> {
        self.processed
            .values()
            .filter_map(|group| group.first_and_last_sequence_number())
            .map(|(first, _)| first)
            .filter(|first| *first > last)
            .min()
    }

    /// packets_complete_frame reports whether the group at `timestamp` holds a whole frame
    /// that continues the last group moved.
    ///
    /// Without a marker the frame is taken as ended when the next group starts right after it.
    pub fn packets_complete_frame(&self, timestamp: u32) -> bool {
        let group = match self.processed.get(&timestamp) {
            Some(group) => group,
            None => return false,
        };
        let (first, last) = match group.first_and_last_sequence_number() {
            Some(bounds) => bounds,
            None => return false,
        };

        if group.missing_count() != 0 {
            return false;
        }
        if self.last_seq_in_buffer != 0 && first != self.last_seq_in_buffer.wrapping_add(1) {
            return false;
        }
        group.marker_received() || self.next_group_first(last) == Some(last + 1)
    }

    /// oldest_to_jitter moves the oldest group to the jitter buffer. A group behind what was
    /// already moved is dropped instead.
    ///
    /// Returns whether the jitter buffer went from empty to holding a frame.
    pub fn oldest_to_jitter(&mut self, complete: bool) -> bool {
        let timestamp = match self.next_time_to_send() {
            Some(ts) => ts,
            None => return false,
        };
        let packets = match self.processed.remove(&timestamp) {
            Some(group) => group,
            None => return false,
        };
        let last = match packets.first_and_last_sequence_number() {
            Some((_, last)) => last,
            None => return false,
        };

        if self.last_seq_in_buffer != 0 && last <= self.last_seq_in_buffer {
            log::debug!(
                "video dropping frame {} behind the jitter buffer, last sequence {}",
                timestamp,
                self.last_seq_in_buffer
            );
            return false;
        }

        self.last_seq_in_buffer = last;
        let was_empty = self.jitter.is_empty();
        self.jitter.push_back(JitterFrame {
            timestamp,
            packets,
            complete,
        });
        was_empty
    }

    /// check_oldest_complete moves groups to the jitter buffer for as long as the oldest is a
    /// complete frame. Returns whether the jitter buffer went from empty to holding a frame.
    pub fn check_oldest_complete(&mut self) -> bool {
        let mut started = false;
        while let Some(ts) = self.next_time_to_send() {
            if !self.packets_complete_frame(ts) {
                break;
            }
            started |= self.oldest_to_jitter(true);
        }
        started
    }

    /// force_oldest moves the oldest group on whether or not it is complete, then keeps
    /// going with the complete groups behind it.
    pub fn force_oldest(&mut self) -> bool {
        let complete = self
            .next_time_to_send()
            .map(|ts| self.packets_complete_frame(ts))
            .unwrap_or(false);
        let started = self.oldest_to_jitter(complete);
        started | self.check_oldest_complete()
    }

    pub fn take_next_jitter(&mut self) -> Option<JitterFrame> {
        self.jitter.pop_front()
    }

    /// dump_jitter throws away every frame in the jitter buffer. Returns the timestamp of the
    /// newest one and the number of sequence numbers the dropped frames spanned.
    pub fn dump_jitter(&mut self) -> Option<(u32, u32)> {
        let first = self
            .jitter
            .front()
            .and_then(|f| f.packets.first_and_last_sequence_number())
            .map(|(first, _)| first)?;
        let (timestamp, last) = self.jitter.back().and_then(|f| {
            f.packets
                .first_and_last_sequence_number()
                .map(|(_, last)| (f.timestamp, last))
        })?;
        self.jitter.clear();
        Some((timestamp, last.saturating_sub(first) + 1))
    }
}
