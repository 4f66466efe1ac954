#[cfg(test)]
mod payload_test;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Codec is implemented by the per-media codec enums carried in a [`PayloadMap`].
pub trait Codec: Copy + fmt::Debug + Default + PartialEq + Eq + Send + Sync + 'static {
    /// is_rtx reports whether the entry describes an RFC 4588 retransmission stream.
    fn is_rtx(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioCodec {
    #[default]
    None,
    G711Alaw,
    G711Mulaw,
    G722,
    TelephoneEvent,
    Rtx,
}

impl Codec for AudioCodec {
    fn is_rtx(&self) -> bool {
        *self == AudioCodec::Rtx
    }
}

impl fmt::Display for AudioCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AudioCodec::None => "none",
            AudioCodec::G711Alaw => "PCMA",
            AudioCodec::G711Mulaw => "PCMU",
            AudioCodec::G722 => "G722",
            AudioCodec::TelephoneEvent => "telephone-event",
            AudioCodec::Rtx => "rtx",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    #[default]
    None,
    H263,
    H264,
    H265,
    Rtx,
}

impl Codec for VideoCodec {
    fn is_rtx(&self) -> bool {
        *self == VideoCodec::Rtx
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VideoCodec::None => "none",
            VideoCodec::H263 => "H263",
            VideoCodec::H264 => "H264",
            VideoCodec::H265 => "H265",
            VideoCodec::Rtx => "rtx",
        };
        f.write_str(s)
    }
}

/// Packetization is the payload format a codec is carried in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Packetization {
    #[default]
    Unknown,
    /// one or more whole codec frames per packet
    Frames,
    H263Rfc2190,
    H263Rfc2429,
    H264SingleNal,
    H264NonInterleaved,
    H265NonInterleaved,
}

/// FeedbackCapabilities lists the RTCP feedback messages a payload was negotiated with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackCapabilities {
    pub nack: bool,
    pub pli: bool,
    pub fir: bool,
    pub tmmbr: bool,
}

impl FeedbackCapabilities {
    pub fn all() -> Self {
        FeedbackCapabilities {
            nack: true,
            pli: true,
            fir: true,
            tmmbr: true,
        }
    }

    /// intersect keeps the messages both sides enable.
    pub fn intersect(&self, other: &FeedbackCapabilities) -> Self {
        FeedbackCapabilities {
            nack: self.nack && other.nack,
            pli: self.pli && other.pli,
            fir: self.fir && other.fir,
            tmmbr: self.tmmbr && other.tmmbr,
        }
    }
}

/// PayloadAttributes describes one negotiated RTP payload type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadAttributes<C> {
    pub codec: C,
    pub packetization: Packetization,
    pub clock_rate: u32,
    /// payload type of the retransmission stream protecting this payload
    pub rtx_payload_type: Option<u8>,
    pub feedback: FeedbackCapabilities,
}

impl<C: Codec> PayloadAttributes<C> {
    pub fn new(codec: C, clock_rate: u32) -> Self {
        PayloadAttributes {
            codec,
            packetization: Packetization::Unknown,
            clock_rate,
            rtx_payload_type: None,
            feedback: FeedbackCapabilities::default(),
        }
    }

    pub fn with_packetization(mut self, packetization: Packetization) -> Self {
        self.packetization = packetization;
        self
    }

    pub fn with_rtx_payload_type(mut self, payload_type: u8) -> Self {
        self.rtx_payload_type = Some(payload_type);
        self
    }

    pub fn with_feedback(mut self, feedback: FeedbackCapabilities) -> Self {
        self.feedback = feedback;
        self
    }
}

/// PayloadMap maps RTP payload type numbers to their negotiated attributes. It is written by
/// signaling and read by both halves of a playback pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadMap<C> {
    entries: BTreeMap<u8, PayloadAttributes<C>>,
}

impl<C: Codec> Default for PayloadMap<C> {
    fn default() -> Self {
        PayloadMap {
            entries: BTreeMap::new(),
        }
    }
}

impl<C: Codec> PayloadMap<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// with adds an entry, builder style.
    pub fn with(mut self, payload_type: u8, attributes: PayloadAttributes<C>) -> Self {
        self.insert(payload_type, attributes);
        self
    }

    pub fn insert(&mut self, payload_type: u8, attributes: PayloadAttributes<C>) {
        self.entries.insert(payload_type, attributes);
    }

    pub fn remove(&mut self, payload_type: u8) -> Option<PayloadAttributes<C>> {
        self.entries.remove(&payload_type)
    }

    pub fn get(&self, payload_type: u8) -> Option<&PayloadAttributes<C>> {
        self.entries.get(&payload_type)
    }

    /// lookup returns the codec and packetization of `payload_type`, or the defaults when
    /// the payload type is unknown.
    pub fn lookup(&self, payload_type: u8) -> (C, Packetization) {
        self.entries
            .get(&payload_type)
            .map(|a| (a.codec, a.packetization))
            .unwrap_or_default()
    }

    pub fn codec(&self, payload_type: u8) -> C {
        self.lookup(payload_type).0
    }

    /// media_payload_type finds the media payload protected by the retransmission payload
    /// type `rtx_payload_type`.
    pub fn media_payload_type(&self, rtx_payload_type: u8) -> Option<u8> {
        self.entries
            .iter()
            .find(|(_, a)| a.rtx_payload_type == Some(rtx_payload_type))
            .map(|(pt, _)| *pt)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &PayloadAttributes<C>)> {
        self.entries.iter().map(|(pt, a)| (*pt, a))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub type AudioPayloadMap = PayloadMap<AudioCodec>;
pub type VideoPayloadMap = PayloadMap<VideoCodec>;
