use bytes::Bytes;

use crate::error::Result;
use crate::payload::{AudioCodec, VideoCodec};

/// AudioFrame is one codec frame handed to the audio device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub codec: AudioCodec,
    pub data: Bytes,
    pub timestamp: u32,
    pub sequence_number: u16,
    /// RTP clock ticks covered by `data`
    pub duration: u32,
}

/// DtmfEvent is a telephone-event (RFC 4733) received on the audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtmfEvent {
    /// event code, 0-9 for digits, 10 for '*', 11 for '#', 12-15 for A-D
    pub event: u8,
    pub end: bool,
    pub volume: u8,
    pub duration: u16,
    pub timestamp: u32,
}

impl DtmfEvent {
    /// digit returns the keypad character of the event, if it is one.
    pub fn digit(&self) -> Option<char> {
        match self.event {
            0..=9 => Some((b'0' + self.event) as char),
            10 => Some('*'),
            11 => Some('#'),
            12..=15 => Some((b'A' + self.event - 12) as char),
            _ => None,
        }
    }
}

/// AudioOutput is the audio playout device.
pub trait AudioOutput {
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn codec_set(&self, codec: AudioCodec) -> Result<()>;
    fn packet_put(&self, frame: &AudioFrame) -> Result<()>;

    fn dtmf_received(&self, _event: DtmfEvent) {}
}

/// VideoFrame is one reassembled access unit handed to the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub codec: VideoCodec,
    /// Annex B byte stream for H.264/H.265, raw payloads for H.263
    pub data: Bytes,
    pub timestamp: u32,
    pub keyframe: bool,
    /// false when the frame was forced out with packets missing
    pub complete: bool,
}

/// VideoOutput is the video decoder and display.
pub trait VideoOutput {
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn codec_set(&self, codec: VideoCodec) -> Result<()>;
    fn frame_put(&self, frame: VideoFrame) -> Result<()>;

    fn remote_view_hold_set(&self, _held: bool) {}
    fn remote_view_privacy_set(&self, _privacy: bool) {}
}
