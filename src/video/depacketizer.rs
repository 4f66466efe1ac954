use bytes::{BufMut, Bytes, BytesMut};
use rtp::codecs::h264::H264Packet;
use rtp::codecs::h265::{H265FragmentationUnitHeader, H265NALUHeader};
use rtp::packetizer::Depacketizer;

use super::unpack::h263_header_len;
use crate::error::{Error, Result};
use crate::payload::{Packetization, VideoCodec};

const ANNEXB_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];
const H265_NALU_HEADER_SIZE: usize = 2;
const H265_FU_HEADER_SIZE: usize = 1;
const H265_AP_LENGTH_SIZE: usize = 2;

/// FrameBuilder turns the payloads of one frame, in sequence order, into the byte stream the
/// decoder takes.
///
/// H.264 and H.265 come out as Annex B. H.263 payload headers are stripped and the partial
/// bytes at packet boundaries are merged back together.
pub struct FrameBuilder {
    codec: VideoCodec,
    packetization: Packetization,
    data: BytesMut,
    h264: H264Packet,
    h265_fu: Option<BytesMut>,
    /// a packet went missing inside a fragmented unit; skip to the next unit
    resync: bool,
    /// bits at the end of the last byte written that belong to the next packet
    h263_ebit: u8,
}

impl FrameBuilder {
    pub fn new(codec: VideoCodec, packetization: Packetization) -> Self {
        FrameBuilder {
            codec,
            packetization,
            data: BytesMut::new(),
            h264: H264Packet::default(),
            h265_fu: None,
            resync: false,
            h263_ebit: 0,
        }
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// push adds one payload. `contiguous` is false when the packet before it in the frame
    /// was never received.
    pub fn push(&mut self, payload: &[u8], contiguous: bool) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        match self.codec {
            VideoCodec::H264 => self.push_h264(payload, contiguous),
            VideoCodec::H265 => self.push_h265(payload, contiguous),
            VideoCodec::H263 => self.push_h263(payload, contiguous),
            _ => {
                self.data.extend_from_slice(payload);
                Ok(())
            }
        }
    }

    /// finish hands back the frame built so far. A unit still waiting for its last fragment
    /// is left out.
    pub fn finish(&mut self) -> Bytes {
        self.h264 = H264Packet::default();
        self.h265_fu = None;
        self.resync = false;
        self.h263_ebit = 0;
        self.data.split().freeze()
    }

    fn push_h264(&mut self, payload: &[u8], contiguous: bool) -> Result<()> {
        let payload = Bytes::copy_from_slice(payload);
        if !contiguous {
            self.h264 = H264Packet::default();
            self.resync = true;
        }
        if self.resync {
            if !self.h264.is_partition_head(&payload) {
                return Ok(());
            }
            self.resync = false;
        }

        let nalus = self.h264.depacketize(&payload)?;
        self.data.extend_from_slice(&nalus);
        Ok(())
    }

    fn push_h265(&mut self, payload: &[u8], contiguous: bool) -> Result<()> {
        if payload.len() < H265_NALU_HEADER_SIZE {
            return Err(Error::ErrShortPacket);
        }
        if !contiguous {
            self.h265_fu = None;
        }

        let header = H265NALUHeader(u16::from_be_bytes([payload[0], payload[1]]));
        if header.is_aggregation_packet() {
            let mut offset = H265_NALU_HEADER_SIZE;
            while offset + H265_AP_LENGTH_SIZE <= payload.len() {
                let size =
                    u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
                offset += H265_AP_LENGTH_SIZE;
                let end = offset + size;
                if end > payload.len() {
                    return Err(Error::ErrShortPacket);
                }
                self.data.extend_from_slice(&ANNEXB_START_CODE);
                self.data.extend_from_slice(&payload[offset..end]);
                offset = end;
            }
            return Ok(());
        }

        if header.is_fragmentation_unit() {
            let body = H265_NALU_HEADER_SIZE + H265_FU_HEADER_SIZE;
            if payload.len() <= body {
                return Err(Error::ErrShortPacket);
            }
            let fu = H265FragmentationUnitHeader(payload[H265_NALU_HEADER_SIZE]);
            if fu.s() {
                let mut unit = BytesMut::with_capacity(payload.len() * 4);
                unit.extend_from_slice(&ANNEXB_START_CODE);
                // the unit header is the payload header with the type taken from the FU header
                unit.put_u8((payload[0] & 0x81) | (fu.fu_type() << 1));
                unit.put_u8(payload[1]);
                self.h265_fu = Some(unit);
            }
            if let Some(unit) = self.h265_fu.as_mut() {
                unit.extend_from_slice(&payload[body..]);
                if fu.e() {
                    self.data.extend_from_slice(&unit[..]);
                    self.h265_fu = None;
                }
            }
            return Ok(());
        }

        self.data.extend_from_slice(&ANNEXB_START_CODE);
        self.data.extend_from_slice(payload);
        Ok(())
    }

    fn push_h263(&mut self, payload: &[u8], contiguous: bool) -> Result<()> {
        let header_len = h263_header_len(self.packetization, payload)?;
        let body = &payload[header_len..];

        match self.packetization {
            Packetization::H263Rfc2429 => {
                if payload[0] & 0x04 != 0 {
                    self.data.extend_from_slice(&[0x00, 0x00]);
                }
                self.data.extend_from_slice(body);
                self.h263_ebit = 0;
            }
            Packetization::H263Rfc2190 => {
                let sbit = (payload[0] >> 3) & 0x07;
                let ebit = payload[0] & 0x07;
                let mut body = body;
                if sbit != 0 && contiguous && self.h263_ebit + sbit == 8 {
                    if let (Some(last), Some(&first)) = (self.data.last_mut(), body.first()) {
                        *last = (*last & (0xff << self.h263_ebit)) | (first & (0xff >> sbit));
                        body = &body[1..];
                    }
                }
                self.data.extend_from_slice(body);
                self.h263_ebit = ebit;
            }
            _ => self.data.extend_from_slice(body),
        }
        Ok(())
    }
}
