use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::payload::{Codec, PayloadMap};

/// unwrap_rtx turns an RFC 4588 retransmission into the packet it repairs.
///
/// The first two payload bytes carry the original sequence number in network order. They are
/// stripped, and the payload type and SSRC are mapped back to the protected stream.
pub(crate) fn unwrap_rtx<C: Codec>(
    packet: &mut Packet,
    payloads: &PayloadMap<C>,
    playback_ssrc: Option<u32>,
) -> Result<()> {
    let rtx_payload_type = packet.payload_type();
    let media_payload_type = payloads
        .media_payload_type(rtx_payload_type)
        .ok_or(Error::ErrUnknownPayloadType(rtx_payload_type))?;

    let payload = packet.payload();
    if payload.len() < 2 {
        return Err(Error::ErrPayloadHeader);
    }
    let original_sequence_number = u16::from_be_bytes([payload[0], payload[1]]);
    packet.strip_payload_prefix(2)?;

    let header = packet.header_mut();
    header.sequence_number = original_sequence_number;
    header.payload_type = media_payload_type;
    if let Some(ssrc) = playback_ssrc {
        header.ssrc = ssrc;
    }

    Ok(())
}
