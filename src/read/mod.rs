mod rtx;

use std::sync::Arc;
use std::time::SystemTime;

use rtcp::sender_report::SenderReport;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use util::sync::Mutex;
use waitgroup::WaitGroup;

use crate::config::{AudioPlaybackConfig, VideoPlaybackConfig};
use crate::error::{Error, Result};
use crate::packet::{Packet, PacketPool, PooledPacket};
use crate::payload::{Codec, PayloadAttributes, PayloadMap};
use crate::queue::{PacketQueue, SeqSearch};
use crate::sequence::ExtendedSequenceTracker;
use crate::sync_manager::{MediaKind, SenderReportSync, SyncManager};
use crate::task::{system_time, FnTimeGen};
use crate::transport::{RtcpSession, RtpSource};

/// Packets taken from the socket per readiness notification.
pub const MAX_READS_PER_CALLBACK: usize = 10;
/// Free pool slots needed before a discarding reader accepts packets again.
pub const DISCARD_RECOVERY_FREE: usize = 3;

/// Unpacked is what a codec unpack step decided about a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unpacked {
    /// the packet goes to the full queue for playback
    Queue,
    /// the packet was fully handled by the unpack step
    Consumed,
}

/// Unpack is the codec-specific step of a [`PlaybackRead`].
///
/// It runs on the socket thread with the read state locked, after the packet has its
/// extended sequence number. It may fill in [`Packet::frame`].
pub trait Unpack: Send + 'static {
    type Codec: Codec;

    fn unpack(
        &mut self,
        packet: &mut Packet,
        attributes: &PayloadAttributes<Self::Codec>,
    ) -> Result<Unpacked>;

    /// reset drops state kept across packets.
    fn reset(&mut self) {}
}

/// ReadState is the state of the read side of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    Closed,
    /// pool created, channel not open
    Initialized,
    ChannelOpen,
    /// packets are read and thrown away
    Halted,
}

/// ReadOutcome is what happened to one received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Queued,
    Consumed,
    KeepAlive,
    /// read while halted
    Halted,
    /// thrown away because the pool is close to exhausted
    Saturated,
    /// malformed or of an unknown payload type
    Dropped,
    NotOpen,
}

/// ReadOptions are the per-media settings of a [`PlaybackRead`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOptions {
    pub kind: MediaKind,
    pub clock_rate: u32,
    pub pool_size: usize,
    pub max_packet_size: usize,
    /// keep discarding after saturation until enough slots are free again
    pub discard_hysteresis: bool,
    /// packets held back at the start of a call before playback is signalled
    pub jitter_packets: usize,
    pub detect_ntp_order: bool,
}

impl ReadOptions {
    pub fn audio(config: &AudioPlaybackConfig) -> Self {
        ReadOptions {
            kind: MediaKind::Audio,
            clock_rate: crate::sync_manager::AUDIO_CLOCK_RATE,
            pool_size: config.pool_size,
            max_packet_size: config.max_packet_size,
            discard_hysteresis: true,
            jitter_packets: config.jitter_packets,
            detect_ntp_order: config.detect_ntp_order,
        }
    }

    pub fn video(config: &VideoPlaybackConfig) -> Self {
        ReadOptions {
            kind: MediaKind::Video,
            clock_rate: crate::sync_manager::VIDEO_CLOCK_RATE,
            pool_size: config.pool_size,
            max_packet_size: config.max_packet_size,
            discard_hysteresis: false,
            jitter_packets: 0,
            detect_ntp_order: config.detect_ntp_order,
        }
    }
}

/// ReadStats are the read side counters. They are cleared by [`PlaybackRead::stats_collect`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadStats {
    pub packets_read: u64,
    /// datagrams read while the pool was empty
    pub packet_queue_empty_errors: u64,
    pub keep_alive_packets: u64,
    pub unknown_payload_type_errors: u64,
    pub payload_header_errors: u64,
    pub packets_discarded_muted: u64,
    pub rtx_packets_received: u64,
    pub discarded_packets: u64,
}

/// OnDataAvailableFn is called when the full queue gains packets to play.
pub type OnDataAvailableFn = Arc<dyn Fn() + Send + Sync>;

struct ReadInner<U: Unpack> {
    state: ReadState,
    tracker: ExtendedSequenceTracker,
    payloads: PayloadMap<U::Codec>,
    stats: ReadStats,
    discarding: bool,
    set_jitter: bool,
    packets_to_hold: usize,
    packets_held: usize,
    playback_ssrc: Option<u32>,
    channel_opened: SystemTime,
    report_sync: SenderReportSync,
    unpack: U,
}

/// PlaybackRead is the socket side of a playback pair.
///
/// Datagrams are read into pool packets, stamped with an extended sequence number, unpacked
/// by the codec step `U` and queued on the full queue the playback task drains. All of it
/// runs on whichever thread delivers socket readiness; the state is behind a mutex.
pub struct PlaybackRead<U: Unpack> {
    options: ReadOptions,
    pool: Arc<PacketPool>,
    full: PacketQueue,
    inner: Mutex<ReadInner<U>>,
    sync: Arc<SyncManager>,
    rtcp: Option<Arc<dyn RtcpSession + Send + Sync>>,
    on_data_available: Mutex<Option<OnDataAvailableFn>>,
    /// drain target for datagrams that arrive while the pool is empty
    scratch: Mutex<Vec<u8>>,
    now: FnTimeGen,
}

impl<U: Unpack> PlaybackRead<U> {
    pub fn new(unpack: U, options: ReadOptions, sync: Arc<SyncManager>) -> Self {
        let report_sync = SenderReportSync::new(options.kind, options.detect_ntp_order);
        let scratch = vec![0u8; options.max_packet_size];
        PlaybackRead {
            pool: Arc::new(PacketPool::new(options.max_packet_size)),
            full: PacketQueue::new(),
            inner: Mutex::new(ReadInner {
                state: ReadState::Closed,
                tracker: ExtendedSequenceTracker::new(),
                payloads: PayloadMap::new(),
                stats: ReadStats::default(),
                discarding: false,
                set_jitter: false,
                packets_to_hold: 0,
                packets_held: 0,
                playback_ssrc: None,
                channel_opened: SystemTime::UNIX_EPOCH,
                report_sync,
                unpack,
            }),
            options,
            sync,
            rtcp: None,
            on_data_available: Mutex::new(None),
            scratch: Mutex::new(scratch),
            now: system_time(),
        }
    }

    pub fn with_time_gen(mut self, now: FnTimeGen) -> Self {
        self.now = now;
        self
    }

    pub fn with_rtcp_session(mut self, rtcp: Arc<dyn RtcpSession + Send + Sync>) -> Self {
        self.rtcp = Some(rtcp);
        self
    }

    pub fn options(&self) -> &ReadOptions {
        &self.options
    }

    pub fn pool(&self) -> &Arc<PacketPool> {
        &self.pool
    }

    pub fn set_on_data_available(&self, f: OnDataAvailableFn) {
        *self.on_data_available.lock() = Some(f);
    }

    pub fn state(&self) -> ReadState {
        self.inner.lock().state
    }

    /// initialize creates the packet pool.
    pub fn initialize(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != ReadState::Closed {
            return Err(Error::ErrPoolAlreadyCreated);
        }
        self.pool.create(self.options.pool_size)?;
        inner.state = ReadState::Initialized;
        Ok(())
    }

    /// channel_open starts accepting packets with the given payload map.
    pub fn channel_open(&self, payloads: PayloadMap<U::Codec>) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            ReadState::Closed => return Err(Error::ErrPoolNotCreated),
            ReadState::ChannelOpen | ReadState::Halted => return Ok(()),
            ReadState::Initialized => {}
        }

        self.full.clear();
        inner.payloads = payloads;
        inner.tracker.clear();
        inner.discarding = false;
        inner.set_jitter = self.options.jitter_packets > 0;
        inner.packets_to_hold = 0;
        inner.packets_held = 0;
        inner.channel_opened = (self.now)();
        inner.report_sync.reset();
        inner.unpack.reset();
        inner.state = ReadState::ChannelOpen;
        log::debug!("{} read channel open", self.options.kind);
        Ok(())
    }

    /// channel_close stops accepting packets and empties the full queue.
    pub fn channel_close(&self) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, ReadState::ChannelOpen | ReadState::Halted) {
            inner.state = ReadState::Initialized;
        }
        self.full.clear();
    }

    /// close tears the read side down and destroys the pool. Every packet taken from the
    /// full queue must have been dropped first.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.full.clear();
        inner.state = ReadState::Closed;
        inner.tracker.clear();
        if self.pool.is_created() {
            self.pool.destroy()?;
        }
        Ok(())
    }

    pub fn payload_map_set(&self, payloads: PayloadMap<U::Codec>) {
        self.inner.lock().payloads = payloads;
    }

    /// halted_set switches between reading normally and reading to discard.
    pub fn halted_set(&self, halted: bool) {
        let mut inner = self.inner.lock();
        match (inner.state, halted) {
            (ReadState::ChannelOpen, true) => {
                inner.state = ReadState::Halted;
                self.full.clear();
            }
            (ReadState::Halted, false) => inner.state = ReadState::ChannelOpen,
            _ => {}
        }
    }

    /// resync_jitter_buffer makes the next packets be held back again to rebuild the margin.
    pub fn resync_jitter_buffer(&self) {
        let mut inner = self.inner.lock();
        inner.set_jitter = self.options.jitter_packets > 0;
    }

    pub fn playback_ssrc_set(&self, ssrc: u32) {
        self.inner.lock().playback_ssrc = Some(ssrc);
    }

    pub fn num_packet_available(&self) -> usize {
        self.full.len()
    }

    pub fn num_empty_buffer_available(&self) -> usize {
        self.pool.count()
    }

    /// media_packet_full_get takes the packet numbered `expected`, or the next one after it.
    pub fn media_packet_full_get(&self, expected: u16) -> SeqSearch<u16> {
        self.full.take_by_sequence_number_or_next(expected)
    }

    /// media_packet_oldest_get takes the packet that arrived first.
    pub fn media_packet_oldest_get(&self) -> Option<crate::packet::SharedPacket> {
        self.full.remove_oldest()
    }

    pub fn full_queue(&self) -> &PacketQueue {
        &self.full
    }

    pub fn stats_collect(&self) -> ReadStats {
        std::mem::take(&mut self.inner.lock().stats)
    }

    /// sender_report feeds an RTCP sender report of the played stream to the sync manager.
    pub fn sender_report(&self, report: &SenderReport) -> bool {
        let mut inner = self.inner.lock();
        if matches!(inner.playback_ssrc, Some(ssrc) if ssrc != report.ssrc) {
            return false;
        }
        inner.report_sync.sender_report(&self.sync, report)
    }

    /// with_unpack gives access to the codec unpack step.
    pub fn with_unpack<R>(&self, f: impl FnOnce(&mut U) -> R) -> R {
        f(&mut self.inner.lock().unpack)
    }

    /// on_socket_data_available drains up to [`MAX_READS_PER_CALLBACK`] datagrams from
    /// `source` and returns how many were read.
    pub fn on_socket_data_available(&self, source: &(dyn RtpSource + Send + Sync)) -> Result<usize> {
        let mut read = 0;
        while read < MAX_READS_PER_CALLBACK {
            let mut packet = match self.pool.acquire() {
                Some(packet) => packet,
                None => {
                    // the datagram still has to leave the socket
                    let drained = source.try_read(&mut self.scratch.lock())?;
                    match drained {
                        Some(_) => {
                            read += 1;
                            let mut inner = self.inner.lock();
                            inner.stats.packets_read += 1;
                            inner.stats.packet_queue_empty_errors += 1;
                            continue;
                        }
                        None => break,
                    }
                }
            };

            let len = match source.try_read(packet.buffer_mut())? {
                Some(len) => len,
                None => break,
            };
            read += 1;

            if let Err(err) = packet.parse_received(len) {
                log::debug!("{} dropping malformed datagram: {}", self.options.kind, err);
                let mut inner = self.inner.lock();
                inner.stats.packets_read += 1;
                inner.stats.payload_header_errors += 1;
                continue;
            }
            self.process(packet);
        }
        Ok(read)
    }

    /// ingest processes one datagram handed over by a push-style transport.
    pub fn ingest(&self, raw: &[u8]) -> ReadOutcome {
        let mut packet = match self.pool.acquire() {
            Some(packet) => packet,
            None => {
                let mut inner = self.inner.lock();
                inner.stats.packets_read += 1;
                inner.stats.packet_queue_empty_errors += 1;
                return ReadOutcome::Saturated;
            }
        };
        if let Err(err) = packet.fill(raw) {
            log::debug!("{} dropping malformed datagram: {}", self.options.kind, err);
            let mut inner = self.inner.lock();
            inner.stats.packets_read += 1;
            inner.stats.payload_header_errors += 1;
            return ReadOutcome::Dropped;
        }
        self.process(packet)
    }

    fn process(&self, packet: PooledPacket) -> ReadOutcome {
        let now = (self.now)();
        let mut notify = false;
        let mut notice = None;

        let outcome = {
            let mut inner = self.inner.lock();
            self.admit(&mut inner, packet, now, &mut notice, &mut notify)
        };

        if let (Some(rtcp), Some((ssrc, arrival, timestamp, sequence_number))) =
            (&self.rtcp, notice)
        {
            rtcp.packet_received(ssrc, arrival, timestamp, sequence_number);
        }

        if notify {
            let callback = self.on_data_available.lock().clone();
            if let Some(f) = callback {
                f();
            }
        }

        outcome
    }

    fn admit(
        &self,
        inner: &mut ReadInner<U>,
        mut packet: PooledPacket,
        now: SystemTime,
        notice: &mut Option<(u32, u32, u32, u16)>,
        notify: &mut bool,
    ) -> ReadOutcome {
        inner.stats.packets_read += 1;

        match inner.state {
            ReadState::ChannelOpen => {}
            ReadState::Halted => {
                inner.stats.packets_discarded_muted += 1;
                return ReadOutcome::Halted;
            }
            _ => return ReadOutcome::NotOpen,
        }

        if inner.payloads.codec(packet.payload_type()).is_rtx() {
            if let Err(err) = rtx::unwrap_rtx(&mut packet, &inner.payloads, inner.playback_ssrc) {
                log::debug!("{} bad retransmission: {}", self.options.kind, err);
                inner.stats.payload_header_errors += 1;
                return ReadOutcome::Dropped;
            }
            inner.stats.rtx_packets_received += 1;
        }

        let attributes = match inner.payloads.get(packet.payload_type()) {
            Some(a) if a.codec != U::Codec::default() => *a,
            _ => {
                if packet.payload_len() == 0 {
                    inner.stats.keep_alive_packets += 1;
                    return ReadOutcome::KeepAlive;
                }
                log::warn!(
                    "{} unknown payload type {}",
                    self.options.kind,
                    packet.payload_type()
                );
                inner.stats.unknown_payload_type_errors += 1;
                return ReadOutcome::Dropped;
            }
        };

        packet.ext_sequence_number = inner.tracker.extend(packet.ssrc(), packet.sequence_number());
        packet.arrival = Some(now);

        if self.rtcp.is_some() {
            let elapsed = now.duration_since(inner.channel_opened).unwrap_or_default();
            let arrival =
                (elapsed.as_micros() * self.options.clock_rate as u128 / 1_000_000) as u32;
            *notice = Some((
                packet.ssrc(),
                arrival,
                packet.timestamp(),
                packet.sequence_number(),
            ));
        }

        match inner.unpack.unpack(&mut packet, &attributes) {
            Ok(Unpacked::Queue) => self.enqueue(inner, packet, notify),
            Ok(Unpacked::Consumed) => ReadOutcome::Consumed,
            Err(Error::ErrUnknownPayloadType(pt)) => {
                log::warn!("{} cannot play payload type {}", self.options.kind, pt);
                inner.stats.unknown_payload_type_errors += 1;
                ReadOutcome::Dropped
            }
            Err(err) => {
                log::debug!("{} unpack failed: {}", self.options.kind, err);
                inner.stats.payload_header_errors += 1;
                ReadOutcome::Dropped
            }
        }
    }

    fn enqueue(
        &self,
        inner: &mut ReadInner<U>,
        packet: PooledPacket,
        notify: &mut bool,
    ) -> ReadOutcome {
        if inner.set_jitter {
            inner.set_jitter = false;
            let available = self.full.len();
            let target = self.options.jitter_packets;
            inner.packets_to_hold = if available < target {
                target - available
            } else {
                target
            };
            inner.packets_held = 0;
        }

        if self.options.discard_hysteresis {
            let free = self.pool.count();
            if (!inner.discarding && free == 0)
                || (inner.discarding && free < DISCARD_RECOVERY_FREE)
            {
                if !inner.discarding {
                    log::debug!(
                        "{} discarding packets from sequence number {}",
                        self.options.kind,
                        packet.sequence_number()
                    );
                }
                inner.discarding = true;
                inner.stats.discarded_packets += 1;
                return ReadOutcome::Saturated;
            }
            if inner.discarding {
                log::debug!("{} stopped discarding packets", self.options.kind);
            }
            inner.discarding = false;
        }

        let count = self.full.add_and_count(packet.share());
        if inner.packets_to_hold > 0 {
            inner.packets_to_hold -= 1;
            inner.packets_held += 1;
        } else if inner.packets_held > 0 {
            inner.packets_held = 0;
            *notify = true;
        } else if count == 1 {
            *notify = true;
        }

        ReadOutcome::Queued
    }
}

/// ReadTask runs the socket loop of a [`PlaybackRead`] on the tokio runtime.
pub struct ReadTask {
    close_tx: AsyncMutex<Option<mpsc::Sender<()>>>,
    wg: AsyncMutex<Option<WaitGroup>>,
}

impl ReadTask {
    /// spawn reads `source` into `read` until closed. Must be called from within a tokio
    /// runtime.
    pub fn spawn<U: Unpack>(
        read: Arc<PlaybackRead<U>>,
        source: Arc<dyn RtpSource + Send + Sync>,
    ) -> Self {
        let (close_tx, mut close_rx) = mpsc::channel::<()>(1);
        let wg = WaitGroup::new();
        let mut w = Some(wg.worker());

        tokio::spawn(async move {
            let _d = w.take();
            loop {
                tokio::select! {
                    ready = source.readable() => {
                        if let Err(err) = ready {
                            log::warn!("{} rtp source failed: {}", read.options().kind, err);
                            return;
                        }
                        if let Err(err) = read.on_socket_data_available(&*source) {
                            log::warn!("{} read failed: {}", read.options().kind, err);
                        }
                    }
                    _ = close_rx.recv() => return,
                }
            }
        });

        ReadTask {
            close_tx: AsyncMutex::new(Some(close_tx)),
            wg: AsyncMutex::new(Some(wg)),
        }
    }

    pub async fn close(&self) -> Result<()> {
        {
            let mut close_tx = self.close_tx.lock().await;
            if close_tx.take().is_none() {
                return Err(Error::ErrTaskClosed);
            }
        }
        let mut wait_group = self.wg.lock().await;
        if let Some(wg) = wait_group.take() {
            wg.wait().await;
        }
        Ok(())
    }
}
