use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use rtcp::transport_feedbacks::transport_layer_nack::{NackPair, TransportLayerNack};

/// Offsets after a packet id one NACK entry can carry.
const NACK_BITMASK_SIZE: u32 = 16;

#[derive(Debug, Clone, Copy)]
struct NackInfo {
    created: SystemTime,
    sent: Option<SystemTime>,
    retries: u32,
}

/// NackTracker remembers the missing extended sequence numbers of a stream and decides
/// which to ask for again.
#[derive(Debug)]
pub struct NackTracker {
    missing: BTreeMap<u32, NackInfo>,
    max_retries: u32,
    rtt: Duration,
}

impl NackTracker {
    pub fn new(max_retries: u32, rtt: Duration) -> Self {
        NackTracker {
            missing: BTreeMap::new(),
            max_retries,
            rtt,
        }
    }

    /// store records `ext` as missing since `now`.
    pub fn store(&mut self, ext: u32, now: SystemTime) {
        self.missing.insert(
            ext,
            NackInfo {
                created: now,
                sent: None,
                retries: 0,
            },
        );
    }

    pub fn contains(&self, ext: u32) -> bool {
        self.missing.contains_key(&ext)
    }

    /// remove forgets `ext`, returning whether it was missing.
    pub fn remove(&mut self, ext: u32) -> bool {
        self.missing.remove(&ext).is_some()
    }

    /// age returns how long `ext` has been missing.
    pub fn age(&self, ext: u32, now: SystemTime) -> Option<Duration> {
        self.missing
            .get(&ext)
            .map(|info| now.duration_since(info.created).unwrap_or_default())
    }

    pub fn clear(&mut self) {
        self.missing.clear();
    }

    pub fn len(&self) -> usize {
        self.missing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.missing.is_empty()
    }

    /// due returns the sequence numbers to NACK now, ascending.
    ///
    /// Numbers below `last_received` have been played past and are dropped. A number is asked
    /// for at most once per round trip and is forgotten after its last retry.
    pub fn due(&mut self, last_received: Option<u32>, now: SystemTime) -> Vec<u32> {
        if let Some(last) = last_received {
            self.missing = self.missing.split_off(&last);
        }

        let mut due = vec![];
        let (rtt, max_retries) = (self.rtt, self.max_retries);
        self.missing.retain(|ext, info| {
            let ready = match info.sent {
                None => true,
                Some(sent) => now.duration_since(sent).unwrap_or_default() > rtt,
            };
            if !ready {
                return true;
            }
            due.push(*ext);
            info.sent = Some(now);
            info.retries += 1;
            info.retries < max_retries
        });
        due
    }
}

/// pack_nacks packs ascending extended sequence numbers into NACK entries. Each entry names
/// a packet id and a bitmask of the 16 numbers after it.
pub fn pack_nacks(missing: &[u32]) -> Vec<NackPair> {
    let mut pairs = vec![];
    let mut current: Option<(u32, u16)> = None;

    for &ext in missing {
        match current {
            None => current = Some((ext, 0)),
            Some((start, mask)) => {
                let offset = ext.wrapping_sub(start).wrapping_sub(1);
                if offset < NACK_BITMASK_SIZE {
                    current = Some((start, mask | 1 << offset));
                } else {
                    pairs.push(NackPair {
                        packet_id: start as u16,
                        lost_packets: mask,
                    });
                    current = Some((ext, 0));
                }
            }
        }
    }

    if let Some((start, mask)) = current {
        pairs.push(NackPair {
            packet_id: start as u16,
            lost_packets: mask,
        });
    }
    pairs
}

/// nack_packets builds one transport layer NACK per entry.
pub fn nack_packets(sender_ssrc: u32, media_ssrc: u32, missing: &[u32]) -> Vec<TransportLayerNack> {
    pack_nacks(missing)
        .into_iter()
        .map(|pair| TransportLayerNack {
            sender_ssrc,
            media_ssrc,
            nacks: vec![pair],
        })
        .collect()
}
