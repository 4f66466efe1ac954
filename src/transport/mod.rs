use async_trait::async_trait;

use crate::error::Result;
use crate::payload::FeedbackCapabilities;

/// RtcpPackets is a batch of outgoing RTCP feedback.
pub type RtcpPackets = Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>;

/// RtpSource is the receive side of an RTP session.
///
/// It follows the readiness model of a non-blocking socket: `readable` waits until at least
/// one datagram is queued and `try_read` takes datagrams without waiting.
#[async_trait]
pub trait RtpSource {
    /// readable resolves once a datagram can be read.
    async fn readable(&self) -> Result<()>;

    /// try_read copies one datagram into `buf` and returns its length, or None when nothing
    /// is queued.
    fn try_read(&self, buf: &mut [u8]) -> Result<Option<usize>>;

    /// send_keepalive sends an empty RTP packet of `payload_type` toward the remote sender.
    async fn send_keepalive(&self, payload_type: u8) -> Result<()>;
}

/// RtcpSession is the RTCP half of the session the playback pair reports into.
#[async_trait]
pub trait RtcpSession {
    /// packet_received feeds the receiver report statistics. `arrival` is the arrival time
    /// in media clock units since the channel opened.
    fn packet_received(&self, ssrc: u32, arrival: u32, timestamp: u32, sequence_number: u16);

    /// write_feedback sends a batch of feedback packets.
    async fn write_feedback(&self, pkts: &[Box<dyn rtcp::packet::Packet + Send + Sync>]) -> Result<usize>;

    /// capabilities returns the feedback the session enables; it is combined with what each
    /// payload negotiated.
    fn capabilities(&self) -> FeedbackCapabilities;
}
