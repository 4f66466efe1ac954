
pub mod frame_queue;

use std::collections::VecDeque;
use std::sync::Arc;

use util::sync::Mutex;

use crate::packet::SharedPacket;
use crate::sequence::{forward_distance, UINT16SIZE_HALF};

pub use frame_queue::FramePacketQueue;

/// SeqSearch is the outcome of a search that may settle for the next packet after a gap.
#[derive(Debug, Default)]
pub struct SeqSearch<N> {
    pub packet: Option<SharedPacket>,
    /// set when `packet` is not the one asked for
    pub next_available: Option<N>,
}

impl<N> SeqSearch<N> {
    fn exact(packet: SharedPacket) -> Self {
        SeqSearch {
            packet: Some(packet),
            next_available: None,
        }
    }

    pub fn is_exact(&self) -> bool {
        self.packet.is_some() && self.next_available.is_none()
    }
}

/// PacketQueue is an arrival-ordered queue of packets shared between the socket thread and
/// the playback task.
///
/// It never blocks and never bounds itself; depth is bounded by the packet pool feeding it.
#[derive(Default)]
pub struct PacketQueue {
    packets: Mutex<VecDeque<SharedPacket>>,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, packet: SharedPacket) {
        self.packets.lock().push_back(packet);
    }

    /// add_and_count appends a packet and returns the resulting depth, so a producer can
    /// tell an empty-to-non-empty transition without a second lock.
    pub fn add_and_count(&self, packet: SharedPacket) -> usize {
        let mut packets = self.packets.lock();
        packets.push_back(packet);
        packets.len()
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.lock().is_empty()
    }

    pub fn clear(&self) {
        // drop outside the lock; releasing returns slots to the pool
        let drained: Vec<SharedPacket> = self.packets.lock().drain(..).collect();
        drop(drained);
    }

    pub fn peek_oldest(&self) -> Option<SharedPacket> {
        self.packets.lock().front().cloned()
    }

    pub fn remove_oldest(&self) -> Option<SharedPacket> {
        self.packets.lock().pop_front()
    }

    /// remove takes a packet out by identity.
    pub fn remove(&self, packet: &SharedPacket) -> bool {
        let mut packets = self.packets.lock();
        if let Some(pos) = packets.iter().position(|p| Arc::ptr_eq(p, packet)) {
            packets.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn find_by_sequence_number(&self, sn: u16) -> Option<SharedPacket> {
        self.packets
            .lock()
            .iter()
            .find(|p| p.sequence_number() == sn)
            .cloned()
    }

    /// find_by_sequence_number_or_next looks for `sn`; failing that it settles for the
    /// nearest packet after `sn` on the 16-bit ring, and only when nothing is ahead, for the
    /// packet furthest behind.
    pub fn find_by_sequence_number_or_next(&self, sn: u16) -> SeqSearch<u16> {
        let packets = self.packets.lock();
        Self::search_ring(&packets, sn)
    }

    /// take_by_sequence_number_or_next is `find_by_sequence_number_or_next` followed by
    /// removal of the packet found, under one lock.
    pub fn take_by_sequence_number_or_next(&self, sn: u16) -> SeqSearch<u16> {
        let mut packets = self.packets.lock();
        let found = Self::search_ring(&packets, sn);
        if let Some(packet) = &found.packet {
            if let Some(pos) = packets.iter().position(|p| Arc::ptr_eq(p, packet)) {
                packets.remove(pos);
            }
        }
        found
    }

    fn search_ring(packets: &VecDeque<SharedPacket>, sn: u16) -> SeqSearch<u16> {
        // closest candidate ahead of sn, and furthest candidate behind it
        let mut ahead: Option<(u16, &SharedPacket)> = None;
        let mut behind: Option<(u16, &SharedPacket)> = None;

        for p in packets.iter() {
            let d = forward_distance(sn, p.sequence_number());
            if d == 0 {
                return SeqSearch::exact(Arc::clone(p));
            } else if d < UINT16SIZE_HALF {
                if ahead.map_or(true, |(best, _)| d < best) {
                    ahead = Some((d, p));
                }
            } else if behind.map_or(true, |(best, _)| d < best) {
                behind = Some((d, p));
            }
        }

        match ahead.or(behind) {
            Some((_, p)) => SeqSearch {
                packet: Some(Arc::clone(p)),
                next_available: Some(p.sequence_number()),
            },
            None => SeqSearch::default(),
        }
    }
}
