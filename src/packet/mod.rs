#[cfg(test)]
mod packet_test;
pub mod pool;

use std::fmt;
use std::time::SystemTime;

use bytes::BytesMut;
use rtp::header::Header;
use util::marshal::{MarshalSize, Unmarshal};

use crate::error::{Error, Result};

pub use pool::{PacketPool, PooledPacket, SharedPacket};

/// RtpParam describes one datagram as the RTP stack unpacked it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtpParam {
    pub header: Header,
    /// total bytes in the datagram, header included
    pub len: usize,
    /// offset of the first payload byte
    pub payload_offset: usize,
    /// trailing padding bytes excluded from the payload
    pub padding: usize,
}

impl RtpParam {
    /// parse unpacks the RTP header at the start of `raw`.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let mut reader = raw;
        let header = Header::unmarshal(&mut reader)?;
        let payload_offset = header.marshal_size();
        if payload_offset > raw.len() {
            return Err(Error::ErrShortPacket);
        }

        let padding = if header.padding && raw.len() > payload_offset {
            raw[raw.len() - 1] as usize
        } else {
            0
        };
        if payload_offset + padding > raw.len() {
            return Err(Error::ErrShortPacket);
        }

        Ok(RtpParam {
            header,
            len: raw.len(),
            payload_offset,
            padding,
        })
    }

    pub fn payload_len(&self) -> usize {
        self.len.saturating_sub(self.payload_offset + self.padding)
    }
}

/// FrameInfo is the per-packet decode descriptor filled in by the codec unpack step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameInfo {
    /// number of codec frames carried in the payload
    pub frames: u32,
    /// bytes per codec frame
    pub frame_size: usize,
    /// RTP clock ticks per codec frame
    pub frame_duration: u32,
    pub keyframe: bool,
}

/// Packet is one received datagram held in a fixed-capacity buffer.
pub struct Packet {
    buffer: BytesMut,
    param: RtpParam,
    pub ext_sequence_number: u32,
    pub arrival: Option<SystemTime>,
    pub frame: FrameInfo,
}

impl Packet {
    pub fn new(capacity: usize) -> Self {
        let mut buffer = BytesMut::with_capacity(capacity);
        buffer.resize(capacity, 0);
        Packet {
            buffer,
            param: RtpParam::default(),
            ext_sequence_number: 0,
            arrival: None,
            frame: FrameInfo::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// buffer_mut exposes the whole backing buffer for the transport to read into.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[..]
    }

    /// fill copies a raw datagram into the buffer and unpacks its RTP header.
    pub fn fill(&mut self, raw: &[u8]) -> Result<()> {
        if raw.len() > self.buffer.len() {
            return Err(Error::ErrPacketTooLarge);
        }
        self.buffer[..raw.len()].copy_from_slice(raw);
        self.param = RtpParam::parse(raw)?;
        Ok(())
    }

    /// parse_received unpacks the RTP header of `len` bytes the transport already wrote
    /// into the buffer.
    pub fn parse_received(&mut self, len: usize) -> Result<()> {
        if len > self.buffer.len() {
            return Err(Error::ErrPacketTooLarge);
        }
        self.param = RtpParam::parse(&self.buffer[..len])?;
        Ok(())
    }

    pub fn set_param(&mut self, param: RtpParam) -> Result<()> {
        if param.len > self.buffer.len() {
            return Err(Error::ErrPacketTooLarge);
        }
        self.param = param;
        Ok(())
    }

    pub fn param(&self) -> &RtpParam {
        &self.param
    }

    pub fn header(&self) -> &Header {
        &self.param.header
    }

    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.param.header
    }

    pub fn len(&self) -> usize {
        self.param.len
    }

    pub fn is_empty(&self) -> bool {
        self.param.len == 0
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.param.len]
    }

    pub fn payload(&self) -> &[u8] {
        let start = self.param.payload_offset;
        let end = start + self.param.payload_len();
        &self.buffer[start..end]
    }

    pub fn payload_len(&self) -> usize {
        self.param.payload_len()
    }

    /// header_len is the number of bytes in front of the payload.
    pub fn header_len(&self) -> usize {
        self.param.payload_offset
    }

    pub fn sequence_number(&self) -> u16 {
        self.param.header.sequence_number
    }

    pub fn timestamp(&self) -> u32 {
        self.param.header.timestamp
    }

    pub fn marker(&self) -> bool {
        self.param.header.marker
    }

    pub fn payload_type(&self) -> u8 {
        self.param.header.payload_type
    }

    pub fn ssrc(&self) -> u32 {
        self.param.header.ssrc
    }

    /// strip_payload_prefix removes the first `n` payload bytes, shifting the rest down.
    pub fn strip_payload_prefix(&mut self, n: usize) -> Result<()> {
        if n > self.payload_len() {
            return Err(Error::ErrPayloadHeader);
        }
        let start = self.param.payload_offset;
        let end = self.param.len;
        self.buffer.copy_within(start + n..end, start);
        self.param.len -= n;
        Ok(())
    }

    /// reset clears per-datagram state before the slot goes back to the pool.
    pub fn reset(&mut self) {
        self.param = RtpParam::default();
        self.ext_sequence_number = 0;
        self.arrival = None;
        self.frame = FrameInfo::default();
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("sequence_number", &self.sequence_number())
            .field("ext_sequence_number", &self.ext_sequence_number)
            .field("timestamp", &self.timestamp())
            .field("marker", &self.marker())
            .field("payload_type", &self.payload_type())
            .field("ssrc", &self.ssrc())
            .field("len", &self.param.len)
            .finish()
    }
}
