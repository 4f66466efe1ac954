use std::sync::Arc;

use crate::error::{Error, Result};
use crate::output::DtmfEvent;
use crate::packet::{FrameInfo, Packet};
use crate::payload::{AudioCodec, PayloadAttributes};
use crate::read::{Unpack, Unpacked};

/// Bytes in 20 ms of G.711 or G.722 at the 8 kHz RTP clock.
pub const AUDIO_FRAME_BYTES: usize = 160;

const DTMF_PAYLOAD_LEN: usize = 4;

/// OnDtmfFn receives telephone-events as they arrive.
pub type OnDtmfFn = Arc<dyn Fn(DtmfEvent) + Send + Sync>;

/// AudioUnpack is the audio codec step of the read path.
///
/// Speech payloads get their frame layout and are queued for playback. Telephone-events are
/// consumed here; the redundant copies RFC 4733 senders repeat for one key press share a
/// timestamp and are reported once.
#[derive(Default)]
pub struct AudioUnpack {
    dtmf_timestamp: Option<u32>,
    on_dtmf: Option<OnDtmfFn>,
}

impl AudioUnpack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_on_dtmf(&mut self, f: OnDtmfFn) {
        self.on_dtmf = Some(f);
    }

    fn process_dtmf(&mut self, packet: &Packet) -> Result<()> {
        let payload = packet.payload();
        if payload.len() < DTMF_PAYLOAD_LEN {
            return Err(Error::ErrPayloadHeader);
        }

        let timestamp = packet.timestamp();
        if self.dtmf_timestamp == Some(timestamp) {
            return Ok(());
        }
        self.dtmf_timestamp = Some(timestamp);

        let event = DtmfEvent {
            event: payload[0],
            end: payload[1] & 0x80 != 0,
            volume: payload[1] & 0x3f,
            duration: u16::from_be_bytes([payload[2], payload[3]]),
            timestamp,
        };
        log::debug!("dtmf event {} received", event.event);
        if let Some(f) = &self.on_dtmf {
            f(event);
        }
        Ok(())
    }
}

/// frame_info lays out a speech payload. Payloads that are a whole number of 20 ms frames
/// longer than one frame are played one frame at a time.
pub(crate) fn frame_info(payload_len: usize) -> FrameInfo {
    let (frames, frame_size) =
        if payload_len > AUDIO_FRAME_BYTES && payload_len % AUDIO_FRAME_BYTES == 0 {
            (payload_len / AUDIO_FRAME_BYTES, AUDIO_FRAME_BYTES)
        } else {
            (1, payload_len)
        };
    FrameInfo {
        frames: frames as u32,
        frame_size,
        // one byte per 8 kHz tick for both G.711 and G.722
        frame_duration: frame_size as u32,
        keyframe: false,
    }
}

impl Unpack for AudioUnpack {
    type Codec = AudioCodec;

    fn unpack(
        &mut self,
        packet: &mut Packet,
        attributes: &PayloadAttributes<AudioCodec>,
    ) -> Result<Unpacked> {
        match attributes.codec {
            AudioCodec::G711Alaw | AudioCodec::G711Mulaw | AudioCodec::G722 => {
                packet.frame = frame_info(packet.payload_len());
                Ok(Unpacked::Queue)
            }
            AudioCodec::TelephoneEvent => {
                self.process_dtmf(packet)?;
                Ok(Unpacked::Consumed)
            }
            _ => Err(Error::ErrUnknownPayloadType(packet.payload_type())),
        }
    }

    fn reset(&mut self) {
        self.dtmf_timestamp = None;
    }
}
