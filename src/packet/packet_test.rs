use std::sync::Arc;

use bytes::Bytes;
use util::marshal::Marshal;

use super::*;

fn raw_rtp(seq: u16, ts: u32, marker: bool, payload: &[u8]) -> Bytes {
    rtp::packet::Packet {
        header: rtp::header::Header {
            version: 2,
            payload_type: 96,
            sequence_number: seq,
            timestamp: ts,
            marker,
            ssrc: 0x1234_5678,
            ..Default::default()
        },
        payload: Bytes::copy_from_slice(payload),
    }
    .marshal()
    .unwrap()
}

#[test]
fn test_rtp_param_parse() {
    let raw = raw_rtp(4660, 90000, true, &[1, 2, 3, 4]);
    let param = RtpParam::parse(&raw).unwrap();
    assert_eq!(param.header.sequence_number, 4660);
    assert_eq!(param.header.timestamp, 90000);
    assert!(param.header.marker);
    assert_eq!(param.payload_offset, 12);
    assert_eq!(param.payload_len(), 4);
}

#[test]
fn test_rtp_param_parse_short() {
    assert!(RtpParam::parse(&[0x80, 0x60]).is_err());
}

#[test]
fn test_packet_fill_and_accessors() {
    let mut packet = Packet::new(1500);
    packet
        .fill(&raw_rtp(7, 160, false, &[9, 8, 7]))
        .unwrap();
    assert_eq!(packet.sequence_number(), 7);
    assert_eq!(packet.timestamp(), 160);
    assert_eq!(packet.payload_type(), 96);
    assert_eq!(packet.ssrc(), 0x1234_5678);
    assert_eq!(packet.payload(), &[9, 8, 7]);
    assert_eq!(packet.len(), 15);
}

#[test]
fn test_packet_fill_too_large() {
    let mut packet = Packet::new(16);
    let result = packet.fill(&raw_rtp(1, 1, false, &[0u8; 32]));
    assert_eq!(result, Err(Error::ErrPacketTooLarge));
}

#[test]
fn test_packet_strip_payload_prefix() {
    let mut packet = Packet::new(1500);
    packet
        .fill(&raw_rtp(7, 160, false, &[0x01, 0x02, 0xaa, 0xbb]))
        .unwrap();
    packet.strip_payload_prefix(2).unwrap();
    assert_eq!(packet.payload(), &[0xaa, 0xbb]);
    assert_eq!(packet.len(), 14);
    assert_eq!(
        packet.strip_payload_prefix(3),
        Err(Error::ErrPayloadHeader)
    );
}

#[test]
fn test_pool_create_twice() {
    let pool = PacketPool::new(1500);
    pool.create(4).unwrap();
    assert_eq!(pool.create(4), Err(Error::ErrPoolAlreadyCreated));
}

#[test]
fn test_pool_conservation() {
    let pool = PacketPool::new(256);
    pool.create(3).unwrap();
    assert_eq!(pool.count(), 3);

    let a = pool.acquire().unwrap();
    let b = pool.acquire().unwrap().share();
    let b2 = Arc::clone(&b);
    assert_eq!(pool.count() + pool.outstanding(), pool.capacity());
    assert_eq!(pool.outstanding(), 2);

    drop(b);
    assert_eq!(pool.outstanding(), 2, "one clone is still alive");
    drop(b2);
    assert_eq!(pool.outstanding(), 1);
    drop(a);
    assert_eq!(pool.count(), 3);
    assert_eq!(pool.outstanding(), 0);

    pool.destroy().unwrap();
    assert_eq!(pool.count(), 0);
}

#[test]
fn test_pool_exhaustion() {
    let pool = PacketPool::new(64);
    pool.create(2).unwrap();
    let _a = pool.acquire().unwrap();
    let _b = pool.acquire().unwrap();
    assert!(pool.acquire().is_none());
    assert_eq!(pool.count(), 0);
}

#[test]
fn test_pool_release_resets_packet() {
    let pool = PacketPool::new(1500);
    pool.create(1).unwrap();
    {
        let mut p = pool.acquire().unwrap();
        p.fill(&raw_rtp(99, 1, true, &[1])).unwrap();
        p.ext_sequence_number = 0x1_0063;
    }
    let p = pool.acquire().unwrap();
    assert_eq!(p.ext_sequence_number, 0);
    assert_eq!(p.len(), 0);
}

#[test]
fn test_pool_destroy_with_outstanding() {
    let pool = PacketPool::new(64);
    pool.create(2).unwrap();
    let held = pool.acquire().unwrap();
    assert_eq!(pool.destroy(), Err(Error::ErrPoolPacketsOutstanding(1)));
    drop(held);
    assert!(!pool.is_created());
}

#[test]
fn test_pool_concurrent_acquire_release() {
    let pool = Arc::new(PacketPool::new(64));
    pool.create(8).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    if let Some(p) = pool.acquire() {
                        let shared = p.share();
                        let clone = Arc::clone(&shared);
                        drop(shared);
                        drop(clone);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(pool.count(), 8);
}

#[test]
fn test_packet_parse_received_in_place() {
    let raw = raw_rtp(300, 4800, true, &[5, 6]);
    let mut packet = Packet::new(1500);
    packet.buffer_mut()[..raw.len()].copy_from_slice(&raw);
    packet.parse_received(raw.len()).unwrap();
    assert_eq!(packet.sequence_number(), 300);
    assert!(packet.marker());
    assert_eq!(packet.payload(), &[5, 6]);

    assert_eq!(packet.parse_received(1501), Err(Error::ErrPacketTooLarge));
}
