use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use rtp::header::Header;
use util::marshal::Marshal;

use crate::packet::{PacketPool, SharedPacket};

pub const MOCK_SSRC: u32 = 0x1234_5678;

/// rtp_datagram builds a raw RTP datagram.
pub fn rtp_datagram(
    payload_type: u8,
    sequence_number: u16,
    timestamp: u32,
    ssrc: u32,
    marker: bool,
    payload: &[u8],
) -> Bytes {
    let header = Header {
        version: 2,
        marker,
        payload_type,
        sequence_number,
        timestamp,
        ssrc,
        ..Default::default()
    };
    let mut raw = BytesMut::new();
    raw.extend_from_slice(&header.marshal().unwrap());
    raw.extend_from_slice(payload);
    raw.freeze()
}

/// PacketFactory hands out pooled packets with chosen header fields.
pub struct PacketFactory {
    pool: Arc<PacketPool>,
    payload_type: u8,
    payload: Vec<u8>,
}

impl PacketFactory {
    pub fn new(capacity: usize) -> Self {
        let pool = Arc::new(PacketPool::new(1500));
        pool.create(capacity).unwrap();
        PacketFactory {
            pool,
            payload_type: 0,
            payload: vec![0xd5; 160],
        }
    }

    pub fn with_payload(mut self, payload_type: u8, payload: &[u8]) -> Self {
        self.payload_type = payload_type;
        self.payload = payload.to_vec();
        self
    }

    pub fn pool(&self) -> &Arc<PacketPool> {
        &self.pool
    }

    /// packet builds a packet in the first extended cycle.
    pub fn packet(&self, sequence_number: u16, timestamp: u32, marker: bool) -> SharedPacket {
        self.packet_ext(
            sequence_number,
            0x1_0000 | sequence_number as u32,
            timestamp,
            marker,
        )
    }

    pub fn packet_ext(
        &self,
        sequence_number: u16,
        ext_sequence_number: u32,
        timestamp: u32,
        marker: bool,
    ) -> SharedPacket {
        let raw = rtp_datagram(
            self.payload_type,
            sequence_number,
            timestamp,
            MOCK_SSRC,
            marker,
            &self.payload,
        );
        let mut packet = self.pool.acquire().expect("mock pool exhausted");
        packet.fill(&raw).unwrap();
        packet.ext_sequence_number = ext_sequence_number;
        packet.share()
    }
}
