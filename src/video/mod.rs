//! Video playback: frame assembly, loss repair and paced delivery to the decoder.

pub mod assembler;
pub mod depacketizer;
pub mod flow_control;
pub mod keyframe;
pub mod unpack;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rtcp::payload_feedbacks::full_intra_request::{FirEntry, FullIntraRequest};
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use rtcp::sender_report::SenderReport;
use serde::{Deserialize, Serialize};

use crate::config::VideoPlaybackConfig;
use crate::error::{flatten_errs, Error, Result};
use crate::output::{VideoFrame, VideoOutput};
use crate::packet::SharedPacket;
use crate::payload::{FeedbackCapabilities, Packetization, VideoCodec, VideoPayloadMap};
use crate::playback::nack::nack_packets;
use crate::playback::{HoldLocation, KeepAlive, MuteReason, MuteState, NackTracker};
use crate::read::{PlaybackRead, ReadOptions, ReadStats, ReadTask};
use crate::sync_manager::SyncManager;
use crate::task::{
    earliest, system_time, EventSender, FnTimeGen, Outbox, PlaybackTask, TaskHandler, TaskIo,
    Timer,
};

pub use assembler::{FrameAssembler, JitterFrame};
pub use depacketizer::FrameBuilder;
pub use flow_control::{FlowControlStats, PlaybackFlowControl};
pub use keyframe::{KeyframeMethod, KeyframeStats, KeyframeTracker};
pub use unpack::VideoUnpack;

/// More frames than this waiting to play means playback fell behind; they are dropped.
const MAX_JITTER_FRAMES: usize = 40;
/// Frames still collecting packets before the oldest is pushed out.
const MIN_FRAMES_BEFORE_FORCING: usize = 2;
const MAX_FRAMES_BEFORE_FORCING: usize = 36;
/// Longest gap between frames honoured while the buffer is at or below target, 15 fps.
const MAX_FRAME_GAP_MS: i64 = 1000 / 15;
const TICKS_PER_MS: i64 = 90;

const JITTER_START: Duration = Duration::from_millis(5);
const JITTER_AFTER_SEND: Duration = Duration::from_millis(15);

const RATE_BELOW_TARGET: f64 = 1.15;
const RATE_ABOVE_TARGET: f64 = 0.90;

pub type VideoPlaybackRead = PlaybackRead<VideoUnpack>;

/// video_read builds the read side that feeds a [`VideoPlayback`].
pub fn video_read(config: &VideoPlaybackConfig, sync: Arc<SyncManager>) -> VideoPlaybackRead {
    PlaybackRead::new(VideoUnpack::new(), ReadOptions::video(config), sync)
}

/// OnKeyframeRequestFn asks for a keyframe by other means when the session has no RTCP
/// feedback to do it with.
pub type OnKeyframeRequestFn = Arc<dyn Fn() + Send + Sync>;

/// VideoPlaybackStats are collected, and reset, by [`VideoPlayback::stats_collect`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoPlaybackStats {
    pub frames: u32,
    pub frames_sent_to_platform: u32,
    pub partial_key_frames: u32,
    pub partial_non_key_frames: u32,
    pub whole_key_frames: u32,
    pub whole_non_key_frames: u32,
    pub keyframes: KeyframeStats,
    pub nack_requests_sent: u32,
    pub duplicate_packets: u32,
    pub packets_discarded_muted: u32,
    pub packets_discarded_empty: u32,
    pub packets_using_previous_ssrc: u32,
    pub burst_packets_dropped: u32,
    pub packets_received: u32,
    pub packets_lost: u32,
    /// lost packets plus those that only arrived through a retransmission
    pub actual_packet_loss: u32,
    /// sum over played frames of the frames waiting behind them
    pub playback_delay: u64,
    /// last receive rate asked of the sender; kept across collections
    pub target_receive_rate: u32,
    pub bytes_received: u64,
    pub read: ReadStats,
}

/// VideoEvent is posted to the video playback task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoEvent {
    DataAvailable,
    /// the decoder lost its reference and needs a keyframe
    KeyframeNeeded,
}

/// VideoPlayback takes packets from the read side, groups them into frames, asks for what
/// went missing and plays the frames out at the pace of their timestamps.
pub struct VideoPlayback {
    config: VideoPlaybackConfig,
    read: Arc<VideoPlaybackRead>,
    output: Arc<dyn VideoOutput + Send + Sync>,
    sync: Arc<SyncManager>,
    payloads: VideoPayloadMap,
    now: FnTimeGen,

    session_capabilities: FeedbackCapabilities,
    /// what the current payload lets us send
    feedback: FeedbackCapabilities,
    sender_ssrc: u32,
    on_keyframe_request: Option<OnKeyframeRequestFn>,

    channel_open: bool,
    channel_closed: bool,
    channel_resumed: bool,
    video_started: bool,
    first_packet: bool,

    ssrc: u32,
    previous_ssrc: u32,
    expected: u32,
    last_processed: u32,
    last_received: Option<u32>,

    current_payload_type: Option<u8>,
    current_codec: VideoCodec,
    current_packetization: Packetization,
    keyframe_sent_to_platform: bool,
    last_played: SystemTime,
    last_assembled_timestamp: u32,

    assembler: FrameAssembler,
    retransmits: BTreeSet<u32>,
    nack: NackTracker,
    keyframe: KeyframeTracker,
    flow: PlaybackFlowControl,
    flow_stats: FlowControlStats,

    nack_timer: Timer,
    jitter_timer: Timer,
    flow_timer: Timer,

    muted: MuteState,
    stats: VideoPlaybackStats,
    keepalive: KeepAlive,
    outbox: Outbox,
}

impl VideoPlayback {
    pub fn new(
        config: VideoPlaybackConfig,
        read: Arc<VideoPlaybackRead>,
        output: Arc<dyn VideoOutput + Send + Sync>,
        sync: Arc<SyncManager>,
    ) -> Self {
        let now = system_time();
        let start = now();
        VideoPlayback {
            nack: NackTracker::new(config.max_nack_retries, config.nack_rtt()),
            keyframe: KeyframeTracker::new(config.keyframe_interval()),
            flow: PlaybackFlowControl::new(config.max_receive_rate, start),
            flow_stats: FlowControlStats::new(start),
            nack_timer: Timer::new(config.nack_interval()),
            jitter_timer: Timer::new(JITTER_START),
            flow_timer: Timer::new(config.tmmbr_interval()),
            keepalive: KeepAlive::new(config.keepalive.clone()),
            config,
            read,
            output,
            sync,
            payloads: VideoPayloadMap::new(),
            now,
            session_capabilities: FeedbackCapabilities::all(),
            feedback: FeedbackCapabilities::default(),
            sender_ssrc: rand::random::<u32>(),
            on_keyframe_request: None,
            channel_open: false,
            channel_closed: true,
            channel_resumed: false,
            video_started: false,
            first_packet: true,
            ssrc: 0,
            previous_ssrc: 0,
            expected: 0,
            last_processed: 0,
            last_received: None,
            current_payload_type: None,
            current_codec: VideoCodec::None,
            current_packetization: Packetization::Unknown,
            keyframe_sent_to_platform: false,
            last_played: start,
            last_assembled_timestamp: 0,
            assembler: FrameAssembler::new(),
            retransmits: BTreeSet::new(),
            muted: MuteState::default(),
            stats: VideoPlaybackStats::default(),
            outbox: Outbox::default(),
        }
    }

    pub fn with_time_gen(mut self, now: FnTimeGen) -> Self {
        let start = now();
        self.flow = PlaybackFlowControl::new(self.config.max_receive_rate, start);
        self.flow_stats = FlowControlStats::new(start);
        self.last_played = start;
        self.now = now;
        self
    }

    /// with_sender_ssrc sets the SSRC our feedback goes out under.
    pub fn with_sender_ssrc(mut self, ssrc: u32) -> Self {
        self.sender_ssrc = ssrc;
        self
    }

    /// with_session_capabilities limits feedback to what the RTCP session negotiated.
    pub fn with_session_capabilities(mut self, capabilities: FeedbackCapabilities) -> Self {
        self.session_capabilities = capabilities;
        self
    }

    pub fn with_on_keyframe_request(mut self, f: OnKeyframeRequestFn) -> Self {
        self.on_keyframe_request = Some(f);
        self
    }

    pub fn read(&self) -> &Arc<VideoPlaybackRead> {
        &self.read
    }

    pub fn config(&self) -> &VideoPlaybackConfig {
        &self.config
    }

    fn now(&self) -> SystemTime {
        (self.now)()
    }

    fn nack_enabled(&self) -> bool {
        self.config.nack_enabled && self.session_capabilities.nack
    }

    fn tmmbr_enabled(&self) -> bool {
        self.config.tmmbr_enabled && self.session_capabilities.tmmbr
    }

    /// initialize creates the read pool and loads the payload map.
    pub fn initialize(&mut self, payloads: VideoPayloadMap) -> Result<()> {
        self.assembler.clear();
        self.read.initialize()?;
        self.payload_map_set(payloads);
        Ok(())
    }

    pub fn payload_map_set(&mut self, payloads: VideoPayloadMap) {
        self.read.payload_map_set(payloads.clone());
        self.payloads = payloads;
    }

    /// data_channel_initialize opens the channel for a newly negotiated stream.
    pub fn data_channel_initialize(&mut self, start_keepalives: bool) -> Result<()> {
        let now = self.now();
        self.feedback = FeedbackCapabilities::default();
        self.keyframe.stop();
        self.first_packet = true;
        self.current_codec = VideoCodec::None;
        self.current_payload_type = None;
        self.assembler.clear();
        self.retransmits.clear();
        self.nack.clear();
        self.sync.initialize();

        self.read.channel_open(self.payloads.clone())?;
        self.channel_open = true;
        self.flow_control_reset(now);

        self.output
            .remote_view_hold_set(self.muted.contains(MuteReason::Held));
        self.output
            .remote_view_privacy_set(self.muted.contains(MuteReason::Privacy));
        self.channel_closed = false;

        if start_keepalives {
            self.keepalive.start(now, &mut self.outbox);
        }
        Ok(())
    }

    pub fn data_channel_close(&mut self) {
        if !self.channel_closed {
            self.read.channel_close();
        }
        self.keyframe.stop();
        self.flow_timer.stop();
        self.nack_timer.stop();
        self.jitter_timer.stop();
        self.keepalive.stop();
        self.assembler.clear();
        self.channel_open = false;

        if self.muted.contains(MuteReason::Held) || self.muted.contains(MuteReason::Hold) {
            self.output.remote_view_hold_set(false);
        }
        self.output_stop();
        self.current_payload_type = None;
        self.channel_closed = true;
    }

    /// close shuts the channel and destroys the read pool.
    pub fn close(&mut self) -> Result<()> {
        self.data_channel_close();
        self.assembler.clear();
        self.read.close()
    }

    fn data_channel_hold(&mut self) {
        if self.muted.contains(MuteReason::Held) || self.muted.contains(MuteReason::Hold) {
            self.output.remote_view_hold_set(false);
        }
        self.output_stop();
        self.keepalive.stop();
        self.read.halted_set(true);
        self.current_payload_type = None;
        self.channel_open = false;
    }

    fn data_channel_resume(&mut self) {
        // forces the codec to be set on the decoder again
        self.channel_resumed = true;
        self.sync.initialize();
        self.channel_open = true;
        self.output
            .remote_view_hold_set(self.muted.contains(MuteReason::Held));
        self.output
            .remote_view_privacy_set(self.muted.contains(MuteReason::Privacy));
        self.channel_closed = false;
    }

    fn output_start(&self) -> Result<()> {
        self.output.start().map_err(|err| {
            log::debug!("video decoder start: {}", err);
            Error::ErrDeviceStart
        })
    }

    fn output_stop(&mut self) {
        if self.video_started {
            if let Err(err) = self.output.stop() {
                log::warn!("video decoder stop failed: {}", err);
            }
            self.video_started = false;
        }
    }

    pub fn hold(&mut self, location: HoldLocation) {
        self.muted(location.mute_reason());
    }

    pub fn resume(&mut self, location: HoldLocation) {
        self.unmuted(location.mute_reason());
    }

    /// muted stops playback for `reason`. Video stays stopped until every reason is lifted.
    pub fn muted(&mut self, reason: MuteReason) {
        match reason {
            MuteReason::Privacy => {
                if !self.muted.contains(MuteReason::Privacy) {
                    if !self.muted.is_muted() {
                        self.video_stream_stop();
                    }
                    self.muted.set(MuteReason::Privacy);
                }
                if !self.muted.contains(MuteReason::Hold) {
                    self.output.remote_view_privacy_set(true);
                }
            }
            MuteReason::Held => {
                if !self.muted.contains(MuteReason::Held) {
                    if !self.muted.is_muted() {
                        self.video_stream_stop();
                    }
                    if !self.muted.contains(MuteReason::Hold) {
                        self.output.remote_view_hold_set(true);
                    }
                    self.muted.set(MuteReason::Held);
                }
            }
            MuteReason::Hold | MuteReason::Dhv => {
                if !self.muted.contains(reason) {
                    if !self.muted.is_muted() {
                        self.video_stream_stop();
                    }
                    self.data_channel_hold();
                    self.muted.set(reason);
                }
            }
        }
        log::debug!("video muted by {}, mute bits {:#x}", reason, self.muted.bits());
    }

    pub fn unmuted(&mut self, reason: MuteReason) {
        match reason {
            MuteReason::Privacy => {
                if self.muted.clear(MuteReason::Privacy) {
                    if !self.muted.is_muted() {
                        self.video_stream_start();
                    }
                    self.output.remote_view_privacy_set(false);
                }
            }
            MuteReason::Held => {
                if self.muted.clear(MuteReason::Held) {
                    if !self.muted.is_muted() {
                        self.video_stream_start();
                        self.output.remote_view_hold_set(false);
                    } else if self.muted.is_only(MuteReason::Privacy) {
                        self.output.remote_view_hold_set(false);
                    }
                }
            }
            MuteReason::Hold | MuteReason::Dhv => {
                if self.muted.clear(reason)
                    && !self.muted.contains(MuteReason::Hold)
                    && !self.muted.contains(MuteReason::Dhv)
                {
                    self.data_channel_resume();
                    if !self.muted.is_muted() {
                        self.video_stream_start();
                    }
                }
            }
        }
        log::debug!("video unmuted by {}, mute bits {:#x}", reason, self.muted.bits());
    }

    fn video_stream_stop(&mut self) {
        self.sync.set_remote_video_mute(true);
        self.assembler.clear();
        self.flow_timer.stop();
        self.keyframe.stop();
        self.read.halted_set(true);
        self.first_packet = true;
    }

    fn video_stream_start(&mut self) {
        let now = self.now();
        self.sync.set_remote_video_mute(false);
        self.assembler.clear();
        self.flow_control_reset(now);
        self.read.halted_set(false);
        self.keyframe.stop();
        self.first_packet = true;
        self.keyframe_sent_to_platform = false;
    }

    pub fn mute_state(&self) -> MuteState {
        self.muted
    }

    pub fn is_channel_open(&self) -> bool {
        self.channel_open
    }

    pub fn codec(&self) -> VideoCodec {
        self.current_codec
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn is_keyframe_requested(&self) -> bool {
        self.keyframe.is_requested()
    }

    pub fn max_receive_rate(&self) -> u32 {
        self.flow.max_rate()
    }

    pub fn resync_jitter_buffer(&self) {
        self.read.resync_jitter_buffer();
    }

    pub fn bytes_sent(&mut self, n: u64) {
        self.keepalive.bytes_sent(n);
    }

    pub fn sender_report(&self, report: &SenderReport) -> bool {
        self.read.sender_report(report)
    }

    /// stats_collect returns the counters since the last collection and starts new ones.
    pub fn stats_collect(&mut self) -> VideoPlaybackStats {
        let mut stats = std::mem::take(&mut self.stats);
        self.stats.target_receive_rate = stats.target_receive_rate;
        stats.keyframes = self.keyframe.stats_take();
        stats.read = self.read.stats_collect();
        stats
    }

    /// keyframe_needed is the decoder asking for a keyframe.
    pub fn keyframe_needed(&mut self) {
        let now = self.now();
        self.keyframe_request(0, now);
    }

    /// data_available processes one packet from the read side. Returns whether more are
    /// waiting.
    pub fn data_available(&mut self) -> bool {
        let now = self.now();
        self.process_available_data(now);
        self.channel_open && self.read.num_packet_available() > 0
    }

    fn process_available_data(&mut self, now: SystemTime) {
        if !self.channel_open {
            return;
        }

        if self.read.num_packet_available() == 0 {
            if self.assembler.processed_len() > 0 && self.read.num_empty_buffer_available() == 0 {
                log::debug!("video out of packet buffers, pushing the oldest frame out");
                self.force_oldest(now);
            }
            return;
        }

        let packet = match self.read.media_packet_full_get(self.expected as u16).packet {
            Some(packet) => packet,
            None => return,
        };

        if self.muted.is_muted() {
            self.stats.packets_discarded_muted += 1;
            return;
        }
        if packet.payload_len() == 0 {
            self.stats.packets_discarded_empty += 1;
            return;
        }

        self.stats.bytes_received += packet.payload_len() as u64;
        self.flow_stats.payload_size_sum += packet.payload_len() as u64;
        self.flow_stats.overhead_size_sum += packet.header_len() as u64;

        let ext = packet.ext_sequence_number;
        if self.first_packet {
            self.first_packet = false;
            // frames still collecting from before may be older than this packet
            let oldest = self
                .assembler
                .oldest_processed_packet()
                .filter(|p| p.ext_sequence_number < ext)
                .cloned();
            self.first_packet_setup(oldest.as_ref().unwrap_or(&packet), now);
        } else if packet.ssrc() != self.ssrc {
            if packet.ssrc() == self.previous_ssrc {
                log::trace!("video dropping packet {} from the previous ssrc", packet.sequence_number());
                self.stats.packets_using_previous_ssrc += 1;
                return;
            }
            log::info!("video ssrc changed from {:#x} to {:#x}", self.ssrc, packet.ssrc());
            self.assembler.clear();
            self.previous_ssrc = self.ssrc;
            self.ssrc = packet.ssrc();
            self.expected = ext;
            self.last_processed = ext;
            self.last_received = None;
            self.nack.clear();
            self.retransmits.clear();
            self.keyframe.reset();
            self.first_packet = true;
        }

        if self.last_processed.wrapping_add(1) < ext {
            if self.nack_enabled() {
                for missing in self.last_processed + 1..ext {
                    self.nack.store(missing, now);
                }
                self.send_nacks(now);
            }
            self.last_processed = ext;
        } else if self.last_processed > ext {
            if self.nack.remove(ext) {
                self.retransmits.insert(ext);
            }
            if matches!(self.last_received, Some(last) if last > ext) {
                log::trace!("video packet {} arrived after its frame played", ext);
                return;
            }
        } else {
            self.last_processed = ext;
        }

        let timestamp = packet.timestamp();
        if !self.assembler.contains_timestamp(timestamp) {
            let frames = self.assembler.processed_len();
            if frames > MIN_FRAMES_BEFORE_FORCING
                && (!self.nack_enabled()
                    || self.assembler.jitter_is_empty()
                    || frames > MAX_FRAMES_BEFORE_FORCING)
            {
                self.force_oldest(now);
            }
        }

        if let Err(err) = self.assembler.insert(packet) {
            match err {
                Error::ErrDuplicateSequenceNumber => self.stats.duplicate_packets += 1,
                err => log::warn!("video packet {} not queued: {}", ext, err),
            }
            return;
        }

        match self.assembler.oldest_bounds() {
            Some((oldest_timestamp, oldest_last))
                if timestamp == oldest_timestamp || ext == oldest_last + 1 =>
            {
                self.check_oldest_complete(now);
            }
            Some(_) if self.read.num_empty_buffer_available() == 0 => {
                log::debug!("video out of packet buffers, pushing the oldest frame out");
                self.force_oldest(now);
            }
            _ => {}
        }
    }

    fn first_packet_setup(&mut self, packet: &SharedPacket, now: SystemTime) {
        let ssrc = packet.ssrc();
        if ssrc != self.ssrc {
            self.previous_ssrc = ssrc;
        }
        self.ssrc = ssrc;
        self.expected = packet.ext_sequence_number;
        self.last_processed = packet.ext_sequence_number;
        self.last_received = None;
        self.last_played = now;
        self.last_assembled_timestamp = packet.timestamp();
        self.keyframe.reset();
        self.read.playback_ssrc_set(ssrc);
        self.assembler.reset_last_seq();
        if !self.nack_timer.is_active() {
            self.nack_timer.restart(now);
        }
        log::debug!(
            "video stream {:#x} starts at sequence {}",
            ssrc,
            packet.sequence_number()
        );
    }

    fn jitter_start(&mut self, now: SystemTime) {
        self.jitter_timer.set_timeout(JITTER_START);
        self.jitter_timer.restart(now);
    }

    fn force_oldest(&mut self, now: SystemTime) {
        if self.assembler.force_oldest() {
            self.jitter_start(now);
        }
    }

    fn check_oldest_complete(&mut self, now: SystemTime) {
        if self.assembler.check_oldest_complete() {
            self.jitter_start(now);
        }
    }

    fn send_nacks(&mut self, now: SystemTime) {
        let due = self.nack.due(self.last_received, now);
        if due.is_empty() {
            return;
        }
        let packets = nack_packets(self.sender_ssrc, self.ssrc, &due);
        self.stats.nack_requests_sent += packets.len() as u32;
        for packet in packets {
            self.outbox.push_feedback(packet);
        }
    }

    /// jitter_calculate plays the next frame once its time has come, aiming to keep
    /// `frames_to_buffer` frames waiting.
    fn jitter_calculate(&mut self, now: SystemTime) {
        let size = self.assembler.jitter_len();
        if size > MAX_JITTER_FRAMES {
            if let Some((timestamp, dropped)) = self.assembler.dump_jitter() {
                log::info!("video dropping {} frames, {} packets", size, dropped);
                self.stats.burst_packets_dropped += dropped;
                self.keyframe_request(timestamp, now);
            }
            return;
        }

        let timestamp = match self.assembler.jitter_front_timestamp() {
            Some(ts) => ts,
            None => return,
        };

        let target = self.config.frames_to_buffer;
        let mut gap_ms =
            (timestamp.wrapping_sub(self.last_assembled_timestamp) as i32 as i64 / TICKS_PER_MS).max(0);
        if size <= target {
            gap_ms = gap_ms.min(MAX_FRAME_GAP_MS);
        }
        let wait_ms = match size.cmp(&target) {
            std::cmp::Ordering::Less => (gap_ms as f64 * RATE_BELOW_TARGET) as u64,
            std::cmp::Ordering::Equal => gap_ms as u64,
            std::cmp::Ordering::Greater => (gap_ms as f64 * RATE_ABOVE_TARGET) as u64,
        };
        let play_at = self.last_played + Duration::from_millis(wait_ms);

        if now >= play_at || self.read.num_empty_buffer_available() == 0 {
            self.stats.playback_delay += size as u64;
            self.assemble_and_send(now);
            if !self.assembler.jitter_is_empty() {
                self.jitter_timer.set_timeout(JITTER_AFTER_SEND);
                self.jitter_timer.restart(now);
            }
        } else {
            self.jitter_timer
                .set_timeout(play_at.duration_since(now).unwrap_or_default());
            self.jitter_timer.restart(now);
        }
    }

    fn assemble_and_send(&mut self, now: SystemTime) {
        if !self.channel_open {
            return;
        }
        if let Some(frame) = self.assembler.take_next_jitter() {
            let timestamp = frame.timestamp;
            self.video_packets_to_frame(frame, now);
            self.last_played = now;
            self.last_assembled_timestamp = timestamp;
        }
    }

    /// video_packets_to_frame builds the frame from its packets, accounting for loss on the
    /// way, and hands it to the decoder.
    fn video_packets_to_frame(&mut self, mut frame: JitterFrame, now: SystemTime) {
        let packets = frame.packets.drain();
        let first = match packets.first() {
            Some(p) => p.ext_sequence_number,
            None => return,
        };
        if self.last_received.is_none() {
            self.last_received = Some(first - 1);
        }
        self.stats.packets_received += packets.len() as u32;
        self.flow_stats.packets_received += packets.len() as u32;

        let mut builder: Option<FrameBuilder> = None;
        let mut keyframe = false;
        let mut lost = 0u32;
        let mut retransmitted = 0u32;
        for (i, packet) in packets.iter().enumerate() {
            let ext = packet.ext_sequence_number;
            if ext > self.expected {
                self.expected = ext;
            }
            if self.retransmits.remove(&ext) {
                retransmitted += 1;
            }

            let last = self.last_received.unwrap_or(first - 1);
            let contiguous = i > 0 && ext == last + 1;
            self.packet_process(packet, contiguous, &mut builder, now);
            keyframe |= packet.frame.keyframe;

            if ext > last + 1 {
                lost += ext - last - 1;
            }
            self.last_received = Some(ext);
        }

        let data = builder.map(|mut b| b.finish()).unwrap_or_default();
        let timestamp = frame.timestamp;
        if !frame.complete || lost > 0 {
            self.keyframe_request(timestamp, now);
        }
        self.stats.actual_packet_loss += lost + retransmitted;
        self.flow_stats.actual_packets_lost += lost + retransmitted;
        self.stats.packets_lost += lost;
        self.flow_stats.packets_lost += lost;
        self.stats.frames += 1;

        if data.is_empty() {
            self.keyframe_request(timestamp, now);
            return;
        }

        self.frame_put(
            VideoFrame {
                codec: self.current_codec,
                data,
                timestamp,
                keyframe,
                complete: frame.complete,
            },
            now,
        );
    }

    fn packet_process(
        &mut self,
        packet: &SharedPacket,
        contiguous: bool,
        builder: &mut Option<FrameBuilder>,
        now: SystemTime,
    ) {
        let payload_type = packet.payload_type();
        if self.current_payload_type != Some(payload_type) && !self.payload_change(payload_type, now)
        {
            return;
        }

        if builder.as_ref().map(|b| b.codec()) != Some(self.current_codec) {
            *builder = Some(FrameBuilder::new(
                self.current_codec,
                self.current_packetization,
            ));
        }
        if let Some(builder) = builder.as_mut() {
            if let Err(err) = builder.push(packet.payload(), contiguous) {
                log::debug!("video packet {} not depacketized: {}", packet.sequence_number(), err);
            }
        }
    }

    /// payload_change switches the decoder over to the payload type of the packet being
    /// played. Returns false when the payload type isn't known.
    fn payload_change(&mut self, payload_type: u8, now: SystemTime) -> bool {
        let attributes = match self.payloads.get(payload_type) {
            Some(attributes) => *attributes,
            None => {
                log::warn!("video payload type {} not in the payload map", payload_type);
                return false;
            }
        };

        let mut feedback = attributes.feedback.intersect(&self.session_capabilities);
        feedback.nack &= self.config.nack_enabled;
        feedback.tmmbr &= self.config.tmmbr_enabled;
        self.feedback = feedback;

        let restart = attributes.codec != self.current_codec
            || attributes.packetization != self.current_packetization;
        self.current_payload_type = Some(payload_type);
        self.current_packetization = attributes.packetization;
        if restart {
            self.output_stop();
        }

        let set = self.device_codec_set(attributes.codec);
        if !self.video_started {
            match self.output_start() {
                Ok(()) => {
                    self.video_started = true;
                    self.keyframe_sent_to_platform = false;
                }
                Err(err) => log::warn!("video {}", err),
            }
        }
        self.flow_control_reset(now);

        match set {
            Ok(()) => true,
            Err(err) => {
                log::warn!("video decoder codec set failed: {}", err);
                false
            }
        }
    }

    fn device_codec_set(&mut self, codec: VideoCodec) -> Result<()> {
        let codec = match codec {
            VideoCodec::H263 | VideoCodec::H264 | VideoCodec::H265 => codec,
            other => {
                log::warn!("video codec {} can't be decoded, trying {}", other, VideoCodec::H264);
                VideoCodec::H264
            }
        };
        if codec != self.current_codec || self.channel_resumed {
            self.channel_resumed = false;
            if let Err(err) = self.output.codec_set(codec) {
                log::debug!("video decoder codec_set({}): {}", codec, err);
                return Err(Error::ErrDeviceCodecSet);
            }
            log::info!("video decoder codec {}", codec);
            self.current_codec = codec;
        }
        Ok(())
    }

    fn frame_put(&mut self, frame: VideoFrame, now: SystemTime) {
        let (timestamp, keyframe, complete) = (frame.timestamp, frame.keyframe, frame.complete);
        match self.output.frame_put(frame) {
            Ok(()) => {
                self.frame_count_add(complete, keyframe);
                if !self.keyframe_sent_to_platform {
                    if keyframe && complete {
                        self.keyframe_sent_to_platform = true;
                    } else {
                        // nothing decodes until a whole keyframe has gone in
                        self.keyframe_request(timestamp, now);
                    }
                }
                if keyframe && complete {
                    if let Some(needed) = self.keyframe.received(timestamp, now) {
                        self.keyframe_request(needed, now);
                    }
                }
            }
            Err(err) => {
                log::warn!("video frame {} rejected by the decoder: {}", timestamp, err);
                self.keyframe_request(timestamp, now);
            }
        }
        self.sync.set_current_video_timestamp(timestamp, 0);
    }

    fn frame_count_add(&mut self, complete: bool, keyframe: bool) {
        self.stats.frames_sent_to_platform += 1;
        match (complete, keyframe) {
            (true, true) => self.stats.whole_key_frames += 1,
            (true, false) => self.stats.whole_non_key_frames += 1,
            (false, true) => self.stats.partial_key_frames += 1,
            (false, false) => self.stats.partial_non_key_frames += 1,
        }
    }

    fn keyframe_request(&mut self, timestamp: u32, now: SystemTime) {
        if self.keyframe.request(timestamp) {
            self.keyframe_issue(now);
        }
    }

    fn keyframe_issue(&mut self, now: SystemTime) {
        if !self.channel_open || self.muted.is_muted() {
            return;
        }
        match self.keyframe.issue(self.feedback, now) {
            KeyframeMethod::Pli => {
                log::debug!("video requesting a keyframe with PLI");
                self.outbox.push_feedback(PictureLossIndication {
                    sender_ssrc: self.sender_ssrc,
                    media_ssrc: self.ssrc,
                });
            }
            KeyframeMethod::Fir(sequence_number) => {
                log::debug!("video requesting a keyframe with FIR {}", sequence_number);
                self.outbox.push_feedback(FullIntraRequest {
                    sender_ssrc: self.sender_ssrc,
                    media_ssrc: self.ssrc,
                    fir: vec![FirEntry {
                        ssrc: self.ssrc,
                        sequence_number,
                    }],
                });
            }
            KeyframeMethod::Callback => {
                log::debug!("video requesting a keyframe out of band");
                if let Some(f) = &self.on_keyframe_request {
                    f();
                }
            }
        }
    }

    fn flow_control_reset(&mut self, now: SystemTime) {
        self.flow_stats = FlowControlStats::new(now);
        if self.tmmbr_enabled() {
            self.flow_timer.restart(now);
        }
    }

    fn flow_control_timer(&mut self, now: SystemTime) {
        if !self.tmmbr_enabled() || self.channel_closed {
            return;
        }

        let stats = self.flow_stats;
        let duration_ms = now
            .duration_since(stats.start)
            .unwrap_or_default()
            .as_millis() as u32;
        let current = self.flow.max_rate();
        let rate = self.flow.max_rate_calculate(
            now,
            duration_ms,
            stats.packets_received,
            stats.packets_lost,
            stats.avg_packet_size(),
            stats.actual_packets_lost,
        );
        if rate != current {
            log::debug!(
                "video asking for {} bps, {} bytes overhead per packet",
                rate,
                stats.avg_overhead()
            );
            self.outbox.push_feedback(ReceiverEstimatedMaximumBitrate {
                sender_ssrc: self.sender_ssrc,
                bitrate: rate as f32,
                ssrcs: vec![self.ssrc],
            });
            self.stats.target_receive_rate = rate;
        }
        self.flow_control_reset(now);
    }
}

impl TaskHandler for VideoPlayback {
    type Event = VideoEvent;

    fn handle_event(&mut self, event: VideoEvent, _now: SystemTime, tx: &EventSender<VideoEvent>) {
        match event {
            VideoEvent::DataAvailable => {
                if self.data_available() {
                    tx.post(VideoEvent::DataAvailable);
                }
            }
            VideoEvent::KeyframeNeeded => self.keyframe_needed(),
        }
    }

    fn handle_timers(&mut self, now: SystemTime) {
        if self.nack_timer.fire(now) {
            self.send_nacks(now);
            if self.channel_open {
                self.nack_timer.restart(now);
            }
        }
        if self.jitter_timer.fire(now) {
            self.jitter_calculate(now);
        }
        if self.keyframe.on_timer(now) {
            self.keyframe_issue(now);
        }
        if self.flow_timer.fire(now) {
            self.flow_control_timer(now);
        }
        self.keepalive
            .on_timer(now, self.channel_open, &mut self.outbox);
    }

    fn next_deadline(&self) -> Option<SystemTime> {
        earliest([
            self.nack_timer.deadline(),
            self.jitter_timer.deadline(),
            self.keyframe.deadline(),
            self.flow_timer.deadline(),
            self.keepalive.deadline(),
        ])
    }

    fn take_outbox(&mut self) -> Outbox {
        self.outbox.take()
    }
}

/// VideoPlaybackTask runs a [`VideoPlayback`] and the socket loop feeding it.
pub struct VideoPlaybackTask {
    task: PlaybackTask<VideoPlayback>,
    read: Arc<VideoPlaybackRead>,
    read_task: Option<ReadTask>,
}

impl VideoPlaybackTask {
    /// spawn starts the playback task, and the socket loop when `io` has an RTP source.
    /// Feedback is limited to what the RTCP session in `io` supports.
    /// Must be called from within a tokio runtime.
    pub fn spawn(playback: VideoPlayback, io: TaskIo, now: FnTimeGen) -> Self {
        let mut playback = playback.with_time_gen(Arc::clone(&now));
        if let Some(rtcp) = &io.rtcp {
            playback = playback.with_session_capabilities(rtcp.capabilities());
        }
        let read = Arc::clone(playback.read());
        let task = PlaybackTask::spawn(playback, io.clone(), now);

        let sender = task.sender();
        read.set_on_data_available(Arc::new(move || {
            sender.post(VideoEvent::DataAvailable);
        }));
        let read_task = io.rtp.map(|rtp| ReadTask::spawn(Arc::clone(&read), rtp));

        VideoPlaybackTask {
            task,
            read,
            read_task,
        }
    }

    pub fn read(&self) -> &Arc<VideoPlaybackRead> {
        &self.read
    }

    /// with_playback runs `f` on the playback state between events.
    pub fn with_playback<R>(&self, f: impl FnOnce(&mut VideoPlayback) -> R) -> R {
        self.task.with_handler(f)
    }

    /// request_keyframe is for the decoder to ask for a keyframe from any thread.
    pub fn request_keyframe(&self) -> bool {
        self.task.post(VideoEvent::KeyframeNeeded)
    }

    pub fn data_channel_initialize(&self, start_keepalives: bool) -> Result<()> {
        self.with_playback(|playback| playback.data_channel_initialize(start_keepalives))
    }

    pub fn hold(&self, location: HoldLocation) {
        self.with_playback(|playback| playback.hold(location))
    }

    pub fn resume(&self, location: HoldLocation) {
        self.with_playback(|playback| playback.resume(location))
    }

    pub fn muted(&self, reason: MuteReason) {
        self.with_playback(|playback| playback.muted(reason))
    }

    pub fn unmuted(&self, reason: MuteReason) {
        self.with_playback(|playback| playback.unmuted(reason))
    }

    pub fn stats_collect(&self) -> VideoPlaybackStats {
        self.with_playback(|playback| playback.stats_collect())
    }

    /// close stops both loops and tears the playback down.
    pub async fn close(&self) -> Result<()> {
        self.task.close().await?;

        let mut close_errs = vec![];
        if let Some(read_task) = &self.read_task {
            if let Err(err) = read_task.close().await {
                close_errs.push(err);
            }
        }
        if let Err(err) = self.task.with_handler(|playback| playback.close()) {
            close_errs.push(err);
        }
        flatten_errs(close_errs)
    }
}
