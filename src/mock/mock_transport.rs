use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use util::sync::Mutex;

use crate::error::{Error, Result};
use crate::payload::FeedbackCapabilities;
use crate::transport::{RtcpPackets, RtcpSession, RtpSource};

/// MockRtpSource is a scripted datagram source.
#[derive(Default)]
pub struct MockRtpSource {
    datagrams: Mutex<VecDeque<Bytes>>,
    notify: Notify,
    keepalives: Mutex<Vec<u8>>,
}

impl MockRtpSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// push queues a datagram and wakes a pending `readable`.
    pub fn push(&self, datagram: Bytes) {
        self.datagrams.lock().push_back(datagram);
        self.notify.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.datagrams.lock().len()
    }

    /// keepalives returns the payload types of the keepalives sent so far.
    pub fn keepalives(&self) -> Vec<u8> {
        self.keepalives.lock().clone()
    }
}

#[async_trait]
impl RtpSource for MockRtpSource {
    async fn readable(&self) -> Result<()> {
        loop {
            if !self.datagrams.lock().is_empty() {
                return Ok(());
            }
            self.notify.notified().await;
        }
    }

    fn try_read(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        let datagram = match self.datagrams.lock().pop_front() {
            Some(d) => d,
            None => return Ok(None),
        };
        if datagram.len() > buf.len() {
            return Err(Error::ErrPacketTooLarge);
        }
        buf[..datagram.len()].copy_from_slice(&datagram);
        Ok(Some(datagram.len()))
    }

    async fn send_keepalive(&self, payload_type: u8) -> Result<()> {
        self.keepalives.lock().push(payload_type);
        Ok(())
    }
}

/// ReceivedNotice is one packet_received call seen by [`MockRtcpSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceivedNotice {
    pub ssrc: u32,
    pub arrival: u32,
    pub timestamp: u32,
    pub sequence_number: u16,
}

/// MockRtcpSession records what the playback pair reports and sends.
pub struct MockRtcpSession {
    capabilities: FeedbackCapabilities,
    received: Mutex<Vec<ReceivedNotice>>,
    feedback: Mutex<RtcpPackets>,
    notify: Notify,
}

impl Default for MockRtcpSession {
    fn default() -> Self {
        Self::new(FeedbackCapabilities::all())
    }
}

impl MockRtcpSession {
    pub fn new(capabilities: FeedbackCapabilities) -> Self {
        MockRtcpSession {
            capabilities,
            received: Mutex::new(vec![]),
            feedback: Mutex::new(vec![]),
            notify: Notify::new(),
        }
    }

    pub fn received(&self) -> Vec<ReceivedNotice> {
        self.received.lock().clone()
    }

    pub fn feedback(&self) -> RtcpPackets {
        self.feedback.lock().clone()
    }

    /// wait_feedback waits until at least `n` feedback packets were written.
    pub async fn wait_feedback(&self, n: usize) -> RtcpPackets {
        loop {
            let notified = self.notify.notified();
            {
                let feedback = self.feedback.lock();
                if feedback.len() >= n {
                    return feedback.clone();
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl RtcpSession for MockRtcpSession {
    fn packet_received(&self, ssrc: u32, arrival: u32, timestamp: u32, sequence_number: u16) {
        self.received.lock().push(ReceivedNotice {
            ssrc,
            arrival,
            timestamp,
            sequence_number,
        });
    }

    async fn write_feedback(
        &self,
        pkts: &[Box<dyn rtcp::packet::Packet + Send + Sync>],
    ) -> Result<usize> {
        self.feedback.lock().extend(pkts.iter().cloned());
        self.notify.notify_waiters();
        Ok(pkts.len())
    }

    fn capabilities(&self) -> FeedbackCapabilities {
        self.capabilities
    }
}
