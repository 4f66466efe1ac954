use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::packet::SharedPacket;

/// FramePacketQueue keeps the packets of one frame sorted by extended sequence number and
/// tracks whether the frame is complete.
///
/// `missing` counts the holes between the lowest and highest packet inserted so far. A frame
/// is complete once the marker packet is in and there are no holes.
#[derive(Debug, Default)]
pub struct FramePacketQueue {
    packets: VecDeque<SharedPacket>,
    missing: u32,
    marker_received: bool,
}

impl FramePacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// insert places `packet` in extended-sequence order.
    ///
    /// A duplicate is rejected with `ErrDuplicateSequenceNumber` and leaves the queue as it was.
    pub fn insert(&mut self, packet: SharedPacket) -> Result<()> {
        let ext = packet.ext_sequence_number;
        if ext == 0 {
            return Err(Error::ErrZeroExtendedSequenceNumber);
        }

        let (first, last) = match self.first_and_last_sequence_number() {
            Some(bounds) => bounds,
            None => {
                self.missing = 0;
                self.marker_received = packet.marker();
                self.packets.push_back(packet);
                return Ok(());
            }
        };
        let marker = packet.marker();

        if ext > last {
            self.missing += ext - (last + 1);
            self.packets.push_back(packet);
        } else if ext < first {
            self.missing += first - (ext + 1);
            self.packets.push_front(packet);
        } else {
            match self
                .packets
                .binary_search_by_key(&ext, |p| p.ext_sequence_number)
            {
                Ok(_) => return Err(Error::ErrDuplicateSequenceNumber),
                Err(pos) => {
                    self.packets.insert(pos, packet);
                    self.missing = self.missing.saturating_sub(1);
                }
            }
        }

        if marker {
            self.marker_received = true;
        }
        Ok(())
    }

    pub fn is_frame_complete(&self) -> bool {
        self.marker_received && self.missing == 0
    }

    pub fn marker_received(&self) -> bool {
        self.marker_received
    }

    pub fn missing_count(&self) -> u32 {
        self.missing
    }

    pub fn first_and_last_sequence_number(&self) -> Option<(u32, u32)> {
        match (self.packets.front(), self.packets.back()) {
            (Some(f), Some(l)) => Some((f.ext_sequence_number, l.ext_sequence_number)),
            _ => None,
        }
    }

    pub fn contains(&self, ext: u32) -> bool {
        self.packets
            .binary_search_by_key(&ext, |p| p.ext_sequence_number)
            .is_ok()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn front(&self) -> Option<&SharedPacket> {
        self.packets.front()
    }

    pub fn back(&self) -> Option<&SharedPacket> {
        self.packets.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SharedPacket> {
        self.packets.iter()
    }

    pub fn clear(&mut self) {
        self.packets.clear();
        self.missing = 0;
        self.marker_received = false;
    }

    /// drain hands back the packets in order and leaves the queue empty.
    pub fn drain(&mut self) -> Vec<SharedPacket> {
        self.missing = 0;
        self.marker_received = false;
        self.packets.drain(..).collect()
    }
}
