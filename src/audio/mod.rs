//! Audio playback: reordering, loss accounting and paced delivery to the audio device.
#[cfg(test)]
mod audio_test;
pub mod unpack;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use rtcp::sender_report::SenderReport;
use serde::{Deserialize, Serialize};

use crate::config::AudioPlaybackConfig;
use crate::error::{flatten_errs, Error, Result};
use crate::output::{AudioFrame, AudioOutput};
use crate::packet::SharedPacket;
use crate::payload::{AudioCodec, AudioPayloadMap};
use crate::playback::{HoldLocation, KeepAlive, LossCounter, MuteReason, MuteState, ReceivedSpan};
use crate::queue::PacketQueue;
use crate::read::{PlaybackRead, ReadOptions, ReadStats, ReadTask};
use crate::sequence::{in_wrap_window, is_ahead, packets_skipped};
use crate::sync_manager::SyncManager;
use crate::task::{EventSender, FnTimeGen, Outbox, PlaybackTask, TaskHandler, TaskIo};

pub use unpack::{AudioUnpack, OnDtmfFn, AUDIO_FRAME_BYTES};

/// G.711 payloads outside 10 ms to 60 ms are not played.
const G711_MIN_BYTES: usize = 80;
const G711_MAX_BYTES: usize = 480;

pub type AudioPlaybackRead = PlaybackRead<AudioUnpack>;

/// audio_read builds the read side that feeds an [`AudioPlayback`].
pub fn audio_read(config: &AudioPlaybackConfig, sync: Arc<SyncManager>) -> AudioPlaybackRead {
    PlaybackRead::new(AudioUnpack::new(), ReadOptions::audio(config), sync)
}

/// AudioPlaybackStats are collected, and reset, by [`AudioPlayback::stats_collect`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioPlaybackStats {
    pub packets_received: u32,
    pub packets_lost: u32,
    pub actual_packets_lost: u32,
    pub bytes_received: u64,
    pub read: ReadStats,
}

/// AudioEvent is posted to the audio playback task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEvent {
    DataAvailable,
    OutputReadyChanged(bool),
}

/// PlayingFrame is the packet being fed to the device, one codec frame at a time.
struct PlayingFrame {
    packet: SharedPacket,
    codec: AudioCodec,
    offset: usize,
    frames_left: u32,
    timestamp: u32,
    sequence_number: u16,
}

impl PlayingFrame {
    fn new((packet, codec): (SharedPacket, AudioCodec)) -> Self {
        PlayingFrame {
            codec,
            offset: 0,
            frames_left: packet.frame.frames.max(1),
            timestamp: packet.timestamp(),
            sequence_number: packet.sequence_number(),
            packet,
        }
    }

    fn data(&self) -> Bytes {
        let payload = self.packet.payload();
        let end = (self.offset + self.packet.frame.frame_size).min(payload.len());
        let start = self.offset.min(end);
        Bytes::copy_from_slice(&payload[start..end])
    }

    /// advance steps to the next codec frame and reports whether the packet is used up.
    fn advance(&mut self) -> bool {
        self.frames_left = self.frames_left.saturating_sub(1);
        self.offset += self.packet.frame.frame_size;
        self.timestamp = self
            .timestamp
            .wrapping_add(self.packet.frame.frame_duration);
        self.sequence_number = self.sequence_number.wrapping_add(1);
        self.frames_left == 0
    }
}

/// AudioPlayback puts received audio back in sequence order and plays it.
///
/// Packets come off the read side's full queue in arrival order. The one numbered `expected`
/// is played at once; later ones wait in a small out-of-order queue. When that queue fills
/// up the gap in front of it is written off as lost and playback jumps over it. Played
/// packets go through a display queue to the device one codec frame per wakeup, and each
/// frame's timestamp is handed to the sync manager.
pub struct AudioPlayback {
    config: AudioPlaybackConfig,
    read: Arc<AudioPlaybackRead>,
    output: Arc<dyn AudioOutput + Send + Sync>,
    sync: Arc<SyncManager>,
    payloads: AudioPayloadMap,

    channel_open: bool,
    channel_closed: bool,
    channel_resumed: bool,
    output_ready: bool,
    first_packet: bool,
    expected: u16,
    throw_count: u32,
    current_payload_type: Option<u8>,
    current_codec: AudioCodec,

    out_of_order: PacketQueue,
    display: VecDeque<(SharedPacket, AudioCodec)>,
    playing: Option<PlayingFrame>,

    muted: MuteState,
    loss: LossCounter,
    received: ReceivedSpan,
    bytes_received: u64,

    keepalive: KeepAlive,
    outbox: Outbox,
}

impl AudioPlayback {
    pub fn new(
        config: AudioPlaybackConfig,
        read: Arc<AudioPlaybackRead>,
        output: Arc<dyn AudioOutput + Send + Sync>,
        sync: Arc<SyncManager>,
    ) -> Self {
        let dtmf_output = Arc::clone(&output);
        read.with_unpack(|unpack| {
            unpack.set_on_dtmf(Arc::new(move |event| dtmf_output.dtmf_received(event)))
        });

        let keepalive = KeepAlive::new(config.keepalive.clone());
        AudioPlayback {
            config,
            read,
            output,
            sync,
            payloads: AudioPayloadMap::new(),
            channel_open: false,
            channel_closed: true,
            channel_resumed: false,
            output_ready: false,
            first_packet: true,
            expected: 0,
            throw_count: 0,
            current_payload_type: None,
            current_codec: AudioCodec::None,
            out_of_order: PacketQueue::new(),
            display: VecDeque::new(),
            playing: None,
            muted: MuteState::default(),
            loss: LossCounter::default(),
            received: ReceivedSpan::default(),
            bytes_received: 0,
            keepalive,
            outbox: Outbox::default(),
        }
    }

    pub fn read(&self) -> &Arc<AudioPlaybackRead> {
        &self.read
    }

    pub fn config(&self) -> &AudioPlaybackConfig {
        &self.config
    }

    /// initialize creates the read pool and loads the payload map.
    pub fn initialize(&mut self, payloads: AudioPayloadMap) -> Result<()> {
        self.out_of_order.clear();
        self.display.clear();
        self.playing = None;
        self.read.initialize()?;
        self.payload_map_set(payloads);
        Ok(())
    }

    pub fn payload_map_set(&mut self, payloads: AudioPayloadMap) {
        self.read.payload_map_set(payloads.clone());
        self.payloads = payloads;
    }

    /// data_channel_initialize opens the channel for a newly negotiated stream.
    pub fn data_channel_initialize(&mut self, start_keepalives: bool, now: SystemTime) -> Result<()> {
        self.data_channel_resume();
        self.read.channel_open(self.payloads.clone())?;
        self.channel_closed = false;
        if start_keepalives {
            self.keepalive.start(now, &mut self.outbox);
        }
        Ok(())
    }

    pub fn data_channel_close(&mut self) {
        if !self.channel_closed {
            self.data_channel_hold();
            self.read.channel_close();
            self.channel_closed = true;
        }
    }

    /// close shuts the channel and destroys the read pool.
    pub fn close(&mut self) -> Result<()> {
        self.data_channel_close();
        self.keepalive.stop();
        self.out_of_order.clear();
        self.display.clear();
        self.playing = None;
        self.read.close()
    }

    fn data_channel_hold(&mut self) {
        self.output_ready = false;
        self.keepalive.stop();
        self.read.halted_set(true);
        self.current_payload_type = None;
        self.channel_open = false;
        self.display.clear();
        self.playing = None;
        if let Err(err) = self.output.stop() {
            log::warn!("audio device stop failed: {}", err);
        }
    }

    fn data_channel_resume(&mut self) {
        self.first_packet = true;
        // forces the codec to be set on the device again
        self.channel_resumed = true;
        self.out_of_order.clear();
        self.sync.initialize();
        self.display.clear();
        self.playing = None;
        if !self.muted.contains(MuteReason::Held) {
            self.read.halted_set(false);
        }
        // the device restarts with the first packet played
        self.channel_open = true;
    }

    pub fn hold(&mut self, location: HoldLocation) {
        self.muted(location.mute_reason());
    }

    pub fn resume(&mut self, location: HoldLocation) {
        self.unmuted(location.mute_reason());
    }

    /// muted stops playback for `reason`. Each reason is set and cleared on its own.
    pub fn muted(&mut self, reason: MuteReason) {
        if reason == MuteReason::Dhv || self.muted.contains(reason) {
            return;
        }

        match reason {
            MuteReason::Privacy => self.sync.audio_sync_reset(),
            MuteReason::Held => {
                self.sync.audio_sync_reset();
                self.read.halted_set(true);
            }
            MuteReason::Hold => self.data_channel_hold(),
            MuteReason::Dhv => {}
        }

        log::debug!("audio playback muted: {}", reason);
        self.muted.set(reason);
        self.first_packet = true;
        self.out_of_order.clear();
        self.display.clear();
    }

    pub fn unmuted(&mut self, reason: MuteReason) {
        if !self.muted.clear(reason) {
            return;
        }

        log::debug!("audio playback unmuted: {}", reason);
        match reason {
            MuteReason::Privacy => self.sync.audio_sync_reset(),
            MuteReason::Held => {
                self.sync.audio_sync_reset();
                if self.channel_open {
                    self.read.halted_set(false);
                }
            }
            MuteReason::Hold => self.data_channel_resume(),
            MuteReason::Dhv => {}
        }
    }

    pub fn mute_state(&self) -> MuteState {
        self.muted
    }

    pub fn is_channel_open(&self) -> bool {
        self.channel_open
    }

    /// codec returns the codec being played.
    pub fn codec(&self) -> AudioCodec {
        self.current_codec
    }

    pub fn expected_sequence_number(&self) -> Option<u16> {
        if self.first_packet {
            None
        } else {
            Some(self.expected)
        }
    }

    pub fn out_of_order_len(&self) -> usize {
        self.out_of_order.len()
    }

    pub fn resync_jitter_buffer(&self) {
        self.read.resync_jitter_buffer();
    }

    /// bytes_sent notes media sent to the remote side, which makes the next keepalive
    /// unnecessary.
    pub fn bytes_sent(&mut self, n: u64) {
        self.keepalive.bytes_sent(n);
    }

    pub fn sender_report(&self, report: &SenderReport) -> bool {
        self.read.sender_report(report)
    }

    pub fn stats_collect(&mut self) -> AudioPlaybackStats {
        let loss = self.loss.take();
        AudioPlaybackStats {
            packets_received: self.received.take().packets(),
            packets_lost: loss.lost(),
            actual_packets_lost: loss.actual(),
            bytes_received: std::mem::take(&mut self.bytes_received),
            read: self.read.stats_collect(),
        }
    }

    /// output_ready_set records whether the device takes packets. A device that becomes
    /// ready starts from fresh data, so everything already waiting is thrown away. Returns
    /// whether more work is pending.
    pub fn output_ready_set(&mut self, ready: bool) -> bool {
        if self.output_ready == ready {
            return false;
        }
        self.output_ready = ready;
        if !ready {
            return false;
        }
        self.out_of_order.clear();
        self.display.clear();
        self.data_available()
    }

    /// data_available takes one packet from the read side, and plays one codec frame if the
    /// device is ready. Returns whether more work is pending.
    pub fn data_available(&mut self) -> bool {
        self.process_available_data();

        if self.output_ready && self.channel_open {
            if let Err(err) = self.sync_playback() {
                log::warn!("audio device rejected packet: {}", err);
            }
        }

        self.output_ready
            && self.channel_open
            && (self.read.num_packet_available() > 0
                || !self.display.is_empty()
                || self.playing.is_some())
    }

    /// on_no_more_data plays whatever is left in the out-of-order queue, in order, counting
    /// the gaps between as lost.
    pub fn on_no_more_data(&mut self) {
        loop {
            let found = self
                .out_of_order
                .take_by_sequence_number_or_next(self.expected);
            let packet = match found.packet {
                Some(packet) => packet,
                None => break,
            };

            let sn = packet.sequence_number();
            if sn != self.expected {
                if !is_ahead(sn, self.expected) {
                    continue;
                }
                self.loss
                    .write_off(self.expected, packets_skipped(self.expected, sn));
            }
            self.play(packet);
            self.expected = sn.wrapping_add(1);
        }
    }

    fn process_available_data(&mut self) {
        if !self.channel_open {
            return;
        }

        if self.read.num_packet_available() == 0 {
            self.packet_queue_process(None);
            return;
        }

        let packet = match self.read.media_packet_oldest_get() {
            Some(packet) => packet,
            None => {
                log::warn!("audio full queue emptied under us");
                return;
            }
        };
        if self.muted.is_muted() {
            return;
        }

        let sn = packet.sequence_number();
        self.received.add(sn);
        self.bytes_received += packet.payload_len() as u64;

        if self.first_packet {
            self.expected = sn;
            self.first_packet = false;
            log::debug!("audio first packet, sequence number {}", sn);
        }

        self.packet_queue_process(Some(&packet));
        self.read_packet_process(packet);
        self.packet_queue_process(None);
    }

    fn read_packet_process(&mut self, packet: SharedPacket) {
        let sn = packet.sequence_number();
        if sn == self.expected {
            if let Some(duplicate) = self.out_of_order.find_by_sequence_number(sn) {
                self.out_of_order.remove(&duplicate);
            }
            self.play(packet);
            self.expected = self.expected.wrapping_add(1);
            self.throw_count = 0;
        } else {
            self.put_packet_into_queue(packet);
        }
    }

    fn put_packet_into_queue(&mut self, packet: SharedPacket) {
        let sn = packet.sequence_number();
        if is_ahead(sn, self.expected) || in_wrap_window(sn, self.expected) {
            if self.out_of_order.find_by_sequence_number(sn).is_some() {
                log::trace!("audio duplicate of queued packet {}", sn);
            } else {
                self.out_of_order.add(packet);
            }
            self.throw_count = 0;
            return;
        }

        self.throw_count += 1;
        if self.loss.late_arrival(sn) {
            log::trace!("audio late packet {} was already counted lost", sn);
        }
        log::trace!(
            "audio throwing away late packet {}, expecting {}",
            sn,
            self.expected
        );
        if self.throw_count > self.config.max_throw_count {
            log::info!(
                "audio threw away {} packets in a row, restarting at the next packet",
                self.throw_count
            );
            self.out_of_order.clear();
            self.first_packet = true;
            self.throw_count = 0;
        }
    }

    /// packet_queue_process plays queued packets while the expected one is there. With the
    /// queue at its bound it jumps `expected` to the nearest packet ahead, which may be the
    /// packet just read.
    fn packet_queue_process(&mut self, read_packet: Option<&SharedPacket>) {
        while !self.out_of_order.is_empty() {
            let found = self
                .out_of_order
                .find_by_sequence_number_or_next(self.expected);
            if found.is_exact() {
                if let Some(packet) = found.packet {
                    self.out_of_order.remove(&packet);
                    self.play(packet);
                    self.expected = self.expected.wrapping_add(1);
                }
                continue;
            }

            let read_sn = match read_packet {
                Some(packet) => packet.sequence_number(),
                None => break,
            };
            if self.out_of_order.len() < self.config.out_of_order_buffers
                || read_sn == self.expected
            {
                break;
            }

            let mut next = match found.next_available {
                Some(next) => next,
                None => {
                    log::error!("audio out-of-order queue has packets but none was found");
                    self.out_of_order.clear();
                    self.first_packet = true;
                    break;
                }
            };

            if !is_ahead(next, self.expected) {
                // left behind by an earlier jump
                if let Some(stale) = found.packet {
                    self.out_of_order.remove(&stale);
                }
                continue;
            }

            let mut stop = false;
            if is_ahead(read_sn, self.expected) && is_ahead(next, read_sn) {
                next = read_sn;
                stop = true;
            }

            let lost = packets_skipped(self.expected, next);
            log::debug!(
                "audio out-of-order queue full, {} packets lost before {}",
                lost,
                next
            );
            self.loss.write_off(self.expected, lost);
            self.expected = next;
            if stop {
                break;
            }
        }
    }

    fn play(&mut self, packet: SharedPacket) {
        if let Some(packet) = self.packet_process(packet) {
            self.display.push_back((packet, self.current_codec));
        }
    }

    /// packet_process follows payload type changes on the device and keeps only payloads it
    /// can play.
    fn packet_process(&mut self, packet: SharedPacket) -> Option<SharedPacket> {
        let payload_type = packet.payload_type();
        if self.current_payload_type != Some(payload_type) {
            let codec = match self.payloads.get(payload_type) {
                Some(attributes) => attributes.codec,
                None => {
                    log::warn!("audio payload type {} is not in the payload map", payload_type);
                    return None;
                }
            };
            self.current_payload_type = Some(payload_type);

            if let Err(err) = self.output.stop() {
                log::warn!("audio device stop failed: {}", err);
            }
            if let Err(err) = self.device_codec_set(codec) {
                log::warn!("audio device rejected codec {}: {}", codec, err);
            }
            if let Err(err) = self.output_start() {
                log::warn!("audio {}", err);
            }
        }

        match self.payloads.codec(payload_type) {
            AudioCodec::G722 => Some(packet),
            AudioCodec::G711Alaw | AudioCodec::G711Mulaw => {
                let len = packet.payload_len();
                if (G711_MIN_BYTES..=G711_MAX_BYTES).contains(&len) {
                    Some(packet)
                } else {
                    log::debug!("audio dropping packet: {}", Error::ErrInvalidAudioPacketSize(len));
                    None
                }
            }
            _ => None,
        }
    }

    fn device_codec_set(&mut self, codec: AudioCodec) -> Result<()> {
        if codec != self.current_codec || self.channel_resumed {
            self.channel_resumed = false;
            if let Err(err) = self.output.codec_set(codec) {
                log::debug!("audio device codec_set({}): {}", codec, err);
                return Err(Error::ErrDeviceCodecSet);
            }
            log::info!("audio playback codec set to {}", codec);
            self.current_codec = codec;
        }
        Ok(())
    }

    fn output_start(&self) -> Result<()> {
        self.output.start().map_err(|err| {
            log::debug!("audio device start: {}", err);
            Error::ErrDeviceStart
        })
    }

    /// sync_playback hands the device the next codec frame, registering its timestamp with
    /// the sync manager.
    fn sync_playback(&mut self) -> Result<()> {
        if self.playing.is_none() {
            self.playing = self.display.pop_front().map(PlayingFrame::new);
        }

        let playing = match self.playing.as_mut() {
            Some(playing) => playing,
            None => {
                log::trace!("audio has no packet ready for the device");
                return Ok(());
            }
        };

        let duration = playing.packet.frame.frame_duration;
        self.sync
            .set_current_audio_timestamp(playing.timestamp, duration);

        let mut result = Ok(());
        if playing.packet.frame.frame_size != 0 {
            let frame = AudioFrame {
                codec: playing.codec,
                data: playing.data(),
                timestamp: playing.timestamp,
                sequence_number: playing.sequence_number,
                duration,
            };
            result = self.output.packet_put(&frame);
        }

        if playing.advance() {
            self.playing = None;
        }
        result
    }
}

impl TaskHandler for AudioPlayback {
    type Event = AudioEvent;

    fn handle_event(&mut self, event: AudioEvent, _now: SystemTime, tx: &EventSender<AudioEvent>) {
        let more = match event {
            AudioEvent::DataAvailable => self.data_available(),
            AudioEvent::OutputReadyChanged(ready) => self.output_ready_set(ready),
        };
        if more {
            tx.post(AudioEvent::DataAvailable);
        }
    }

    fn handle_timers(&mut self, now: SystemTime) {
        self.keepalive
            .on_timer(now, self.channel_open, &mut self.outbox);
    }

    fn next_deadline(&self) -> Option<SystemTime> {
        self.keepalive.deadline()
    }

    fn take_outbox(&mut self) -> Outbox {
        self.outbox.take()
    }
}

/// AudioPlaybackTask runs an [`AudioPlayback`] and the socket loop feeding it.
pub struct AudioPlaybackTask {
    task: PlaybackTask<AudioPlayback>,
    read: Arc<AudioPlaybackRead>,
    read_task: Option<ReadTask>,
    now: FnTimeGen,
}

impl AudioPlaybackTask {
    /// spawn starts the playback task, and the socket loop when `io` has an RTP source.
    /// Must be called from within a tokio runtime.
    pub fn spawn(playback: AudioPlayback, io: TaskIo, now: FnTimeGen) -> Self {
        let read = Arc::clone(playback.read());
        let task = PlaybackTask::spawn(playback, io.clone(), Arc::clone(&now));

        let sender = task.sender();
        read.set_on_data_available(Arc::new(move || {
            sender.post(AudioEvent::DataAvailable);
        }));
        let read_task = io.rtp.map(|rtp| ReadTask::spawn(Arc::clone(&read), rtp));

        AudioPlaybackTask {
            task,
            read,
            read_task,
            now,
        }
    }

    pub fn read(&self) -> &Arc<AudioPlaybackRead> {
        &self.read
    }

    /// with_playback runs `f` on the playback state between events.
    pub fn with_playback<R>(&self, f: impl FnOnce(&mut AudioPlayback) -> R) -> R {
        self.task.with_handler(f)
    }

    pub fn output_ready(&self, ready: bool) -> bool {
        self.task.post(AudioEvent::OutputReadyChanged(ready))
    }

    pub fn data_channel_initialize(&self, start_keepalives: bool) -> Result<()> {
        let now = (self.now)();
        self.with_playback(|playback| playback.data_channel_initialize(start_keepalives, now))
    }

    pub fn hold(&self, location: HoldLocation) {
        self.with_playback(|playback| playback.hold(location))
    }

    pub fn resume(&self, location: HoldLocation) {
        self.with_playback(|playback| playback.resume(location))
    }

    pub fn stats_collect(&self) -> AudioPlaybackStats {
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
