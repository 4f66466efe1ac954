use crate::error::{Error, Result};
use crate::packet::{FrameInfo, Packet};
use crate::payload::{Packetization, PayloadAttributes, VideoCodec};
use crate::read::{Unpack, Unpacked};

const H264_NALU_TYPE_MASK: u8 = 0x1f;
const H264_IDR: u8 = 5;
const H264_SPS: u8 = 7;
const H264_STAP_A: u8 = 24;
const H264_FU_A: u8 = 28;
const H264_FU_START: u8 = 0x80;

const H265_AGGREGATION: u8 = 48;
const H265_FRAGMENTATION: u8 = 49;
const H265_FU_START: u8 = 0x80;

/// VideoUnpack is the video codec step of the read path. It marks packets that start a
/// keyframe; reassembly happens on the playback side.
#[derive(Debug, Default)]
pub struct VideoUnpack;

impl VideoUnpack {
    pub fn new() -> Self {
        VideoUnpack
    }
}

impl Unpack for VideoUnpack {
    type Codec = VideoCodec;

    fn unpack(
        &mut self,
        packet: &mut Packet,
        attributes: &PayloadAttributes<VideoCodec>,
    ) -> Result<Unpacked> {
        let payload = packet.payload();
        let keyframe = match attributes.codec {
            VideoCodec::H263 => h263_keyframe(attributes.packetization, payload)?,
            VideoCodec::H264 => h264_keyframe(payload)?,
            VideoCodec::H265 => h265_keyframe(payload)?,
            _ => return Err(Error::ErrUnknownPayloadType(packet.payload_type())),
        };

        packet.frame = FrameInfo {
            frames: 1,
            frame_size: packet.payload_len(),
            frame_duration: 0,
            keyframe,
        };
        Ok(Unpacked::Queue)
    }
}

fn h264_is_key_nalu(nalu_type: u8) -> bool {
    nalu_type == H264_IDR || nalu_type == H264_SPS
}

/// h264_keyframe reports whether an RFC 6184 payload carries an IDR slice or a sequence
/// parameter set, or starts a fragment of one.
pub(crate) fn h264_keyframe(payload: &[u8]) -> Result<bool> {
    let b0 = *payload.first().ok_or(Error::ErrPayloadHeader)?;
    match b0 & H264_NALU_TYPE_MASK {
        H264_STAP_A => {
            let mut offset = 1;
            while offset + 2 < payload.len() {
                let size = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
                offset += 2;
                if offset >= payload.len() {
                    break;
                }
                if h264_is_key_nalu(payload[offset] & H264_NALU_TYPE_MASK) {
                    return Ok(true);
                }
                offset += size;
            }
            Ok(false)
        }
        H264_FU_A => {
            let fu_header = *payload.get(1).ok_or(Error::ErrPayloadHeader)?;
            Ok(fu_header & H264_FU_START != 0
                && h264_is_key_nalu(fu_header & H264_NALU_TYPE_MASK))
        }
        t => Ok(h264_is_key_nalu(t)),
    }
}

fn h265_nalu_type(b0: u8) -> u8 {
    (b0 >> 1) & 0x3f
}

/// IRAP pictures (16..=21) and the VPS/SPS/PPS that precede them.
fn h265_is_key_nalu(nalu_type: u8) -> bool {
    (16..=21).contains(&nalu_type) || (32..=34).contains(&nalu_type)
}

/// h265_keyframe reports whether an RFC 7798 payload carries or starts an IRAP picture.
pub(crate) fn h265_keyframe(payload: &[u8]) -> Result<bool> {
    if payload.len() < 2 {
        return Err(Error::ErrPayloadHeader);
    }
    match h265_nalu_type(payload[0]) {
        H265_AGGREGATION => {
            let mut offset = 2;
            while offset + 2 < payload.len() {
                let size = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
                offset += 2;
                if offset >= payload.len() {
                    break;
                }
                if h265_is_key_nalu(h265_nalu_type(payload[offset])) {
                    return Ok(true);
                }
                offset += size;
            }
            Ok(false)
        }
        H265_FRAGMENTATION => {
            let fu_header = *payload.get(2).ok_or(Error::ErrPayloadHeader)?;
            Ok(fu_header & H265_FU_START != 0 && h265_is_key_nalu(fu_header & 0x3f))
        }
        t => Ok(h265_is_key_nalu(t)),
    }
}

/// h263_header_len returns the size of the payload header in front of the bitstream.
pub(crate) fn h263_header_len(packetization: Packetization, payload: &[u8]) -> Result<usize> {
    let b0 = *payload.first().ok_or(Error::ErrPayloadHeader)?;
    let len = match packetization {
        Packetization::H263Rfc2429 => {
            let b1 = *payload.get(1).ok_or(Error::ErrPayloadHeader)?;
            let vrc = (b0 & 0x02 != 0) as usize;
            let plen = (((b0 & 0x01) << 5) | (b1 >> 3)) as usize;
            2 + vrc + plen
        }
        Packetization::H263Rfc2190 => match (b0 & 0x80 != 0, b0 & 0x40 != 0) {
            (false, _) => 4,
            (true, false) => 8,
            (true, true) => 12,
        },
        _ => 0,
    };
    if len > payload.len() {
        return Err(Error::ErrPayloadHeader);
    }
    Ok(len)
}

/// h263_keyframe reports whether a payload starts an intra-coded picture.
///
/// RFC 2190 carries the picture coding type in its header. An RFC 2429 packet with the P bit
/// set starts with the picture header, the first two zero bytes of the start code left out.
pub(crate) fn h263_keyframe(packetization: Packetization, payload: &[u8]) -> Result<bool> {
    let header_len = h263_header_len(packetization, payload)?;
    match packetization {
        Packetization::H263Rfc2190 => {
            // only mode A packets start at a picture boundary; a set I bit marks an
            // inter-coded picture
            Ok(header_len == 4
                && payload[1] & 0x10 == 0
                && h263_picture_start(&payload[header_len..], 0))
        }
        Packetization::H263Rfc2429 => {
            if payload[0] & 0x04 == 0 {
                return Ok(false);
            }
            // six start code bits and the temporal reference come first
            Ok(h263_picture_is_intra(&payload[header_len..], 6 + 8))
        }
        _ => Ok(h263_picture_start(payload, 0)
            && h263_picture_is_intra(&payload[2..], 6 + 8)),
    }
}

/// h263_picture_start checks for the 22-bit picture start code at a byte boundary.
fn h263_picture_start(data: &[u8], offset: usize) -> bool {
    data.len() >= offset + 3
        && data[offset] == 0
        && data[offset + 1] == 0
        && data[offset + 2] & 0xfc == 0x80
}

fn bit_at(data: &[u8], bit: usize) -> Option<bool> {
    data.get(bit / 8).map(|b| b & (0x80 >> (bit % 8)) != 0)
}

fn bits_at(data: &[u8], bit: usize, count: usize) -> Option<u32> {
    let mut v = 0u32;
    for i in 0..count {
        v = (v << 1) | bit_at(data, bit + i)? as u32;
    }
    Some(v)
}

/// h263_picture_is_intra reads the picture coding type from PTYPE, which starts at bit
/// `ptype` of `data`, following PLUSPTYPE when the source format says it is there.
fn h263_picture_is_intra(data: &[u8], ptype: usize) -> bool {
    let source_format = match bits_at(data, ptype + 5, 3) {
        Some(v) => v,
        None => return false,
    };
    if source_format != 7 {
        return bit_at(data, ptype + 8) == Some(false);
    }

    // UFEP follows the eight bits PTYPE is cut down to
    let plus = ptype + 8;
    let mpptype = match bits_at(data, plus, 3) {
        Some(1) => plus + 3 + 18,
        Some(_) => plus + 3,
        None => return false,
    };
    bits_at(data, mpptype, 3) == Some(0)
}
