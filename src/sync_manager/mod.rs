
pub mod ntp;

use rtcp::sender_report::SenderReport;
use util::sync::Mutex;

pub use ntp::{ntp64to32, usec_to_frac, NtpOrder, NtpOrderDetector};

pub const AUDIO_CLOCK_RATE: u32 = 8000;
pub const VIDEO_CLOCK_RATE: u32 = 90000;

/// MediaKind selects which of the two synchronized streams an operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone)]
struct StreamClock {
    clock_rate: u32,
    /// 16.16 NTP time of the last sync point
    sync_ntp: u32,
    /// RTP timestamp of the last sync point; 0 means no sync point yet
    sync_timestamp: u32,
    current_ntp: u32,
    remote_muted: bool,
    syncs_since_unmute: u32,
}

impl StreamClock {
    fn new(clock_rate: u32) -> Self {
        StreamClock {
            clock_rate,
            sync_ntp: 0,
            sync_timestamp: 0,
            current_ntp: 0,
            remote_muted: false,
            syncs_since_unmute: 0,
        }
    }

    fn timestamp_to_ntp(&self, timestamp: u32, duration: u32) -> u32 {
        if self.sync_timestamp == 0 {
            return 0;
        }

        let timestamp = timestamp.wrapping_add(duration);
        if timestamp >= self.sync_timestamp {
            let elapsed = ntp::elapsed_to_ntp32(timestamp - self.sync_timestamp, self.clock_rate);
            self.sync_ntp.wrapping_add(elapsed)
        } else {
            let elapsed = ntp::elapsed_to_ntp32(self.sync_timestamp - timestamp, self.clock_rate);
            self.sync_ntp.wrapping_sub(elapsed)
        }
    }

    fn set_sync_info(&mut self, kind: MediaKind, ntp_sec: u32, ntp_frac: u32, timestamp: u32) {
        if !self.remote_muted {
            self.syncs_since_unmute += 1;
        }
        if self.syncs_since_unmute == 0 {
            return;
        }

        let ntp = ntp64to32(ntp_sec, ntp_frac);
        if ntp < self.sync_ntp {
            log::debug!("{} sync point ntp timestamp has wrapped", kind);
            self.syncs_since_unmute = 0;
        }
        self.sync_ntp = ntp;
        self.sync_timestamp = timestamp;
        log::trace!(
            "{} sync point ntp={:#010x} timestamp={}",
            kind,
            self.sync_ntp,
            self.sync_timestamp
        );
    }

    fn set_remote_mute(&mut self, kind: MediaKind, muted: bool) {
        self.remote_muted = muted;
        if !muted {
            self.syncs_since_unmute = 0;
        }
        log::debug!(
            "{} remote {}",
            kind,
            if muted { "muted" } else { "unmuted" }
        );
    }
}

#[derive(Debug)]
struct SyncState {
    audio: StreamClock,
    video: StreamClock,
}

impl SyncState {
    fn new() -> Self {
        SyncState {
            audio: StreamClock::new(AUDIO_CLOCK_RATE),
            video: StreamClock::new(VIDEO_CLOCK_RATE),
        }
    }

    fn stream(&self, kind: MediaKind) -> &StreamClock {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        }
    }

    fn stream_mut(&mut self, kind: MediaKind) -> &mut StreamClock {
        match kind {
            MediaKind::Audio => &mut self.audio,
            MediaKind::Video => &mut self.video,
        }
    }
}

/// SyncManager keeps the RTP timestamp to NTP mapping of the audio and video streams so the
/// two can be lined up at playout.
///
/// One instance is shared, behind an `Arc`, by every playback task of the device. Calls reset
/// it through the mute and reset operations rather than replacing it. All operations take an
/// internal lock and may be called from any thread.
#[derive(Debug)]
pub struct SyncManager {
    state: Mutex<SyncState>,
}

impl Default for SyncManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncManager {
    pub fn new() -> Self {
        SyncManager {
            state: Mutex::new(SyncState::new()),
        }
    }

    /// initialize forgets every sync point and restores the default clock rates. Remote
    /// audio mute is left alone; the audio read path owns it.
    pub fn initialize(&self) {
        let mut state = self.state.lock();
        let audio_muted = state.audio.remote_muted;
        *state = SyncState::new();
        state.audio.remote_muted = audio_muted;
    }

    pub fn set_clock_rate(&self, kind: MediaKind, clock_rate: u32) {
        self.state.lock().stream_mut(kind).clock_rate = clock_rate;
    }

    pub fn clock_rate(&self, kind: MediaKind) -> u32 {
        self.state.lock().stream(kind).clock_rate
    }

    /// timestamp_to_ntp maps `timestamp + duration` onto the stream's NTP timeline. Returns 0
    /// while no sync point is established.
    pub fn timestamp_to_ntp(&self, kind: MediaKind, timestamp: u32, duration: u32) -> u32 {
        self.state.lock().stream(kind).timestamp_to_ntp(timestamp, duration)
    }

    pub fn audio_timestamp_to_ntp(&self, timestamp: u32, duration: u32) -> u32 {
        self.timestamp_to_ntp(MediaKind::Audio, timestamp, duration)
    }

    pub fn video_timestamp_to_ntp(&self, timestamp: u32, duration: u32) -> u32 {
        self.timestamp_to_ntp(MediaKind::Video, timestamp, duration)
    }

    /// set_current_timestamp records the NTP time of the frame now being played.
    pub fn set_current_timestamp(&self, kind: MediaKind, timestamp: u32, duration: u32) {
        let mut state = self.state.lock();
        let stream = state.stream_mut(kind);
        stream.current_ntp = stream.timestamp_to_ntp(timestamp, duration);
    }

    pub fn set_current_audio_timestamp(&self, timestamp: u32, duration: u32) {
        self.set_current_timestamp(MediaKind::Audio, timestamp, duration)
    }

    pub fn set_current_video_timestamp(&self, timestamp: u32, duration: u32) {
        self.set_current_timestamp(MediaKind::Video, timestamp, duration)
    }

    pub fn current_ntp(&self, kind: MediaKind) -> u32 {
        self.state.lock().stream(kind).current_ntp
    }

    pub fn current_audio_ntp(&self) -> u32 {
        self.current_ntp(MediaKind::Audio)
    }

    pub fn current_video_ntp(&self) -> u32 {
        self.current_ntp(MediaKind::Video)
    }

    /// set_sync_info records a new sync point from a sender report. The point is taken only
    /// once the stream has counted a sync point since it was unmuted; a point whose NTP time
    /// went backwards is stored but drops the confidence count back to zero.
    pub fn set_sync_info(&self, kind: MediaKind, ntp_sec: u32, ntp_frac: u32, timestamp: u32) {
        self.state
            .lock()
            .stream_mut(kind)
            .set_sync_info(kind, ntp_sec, ntp_frac, timestamp);
    }

    pub fn set_audio_sync_info(&self, ntp_sec: u32, ntp_frac: u32, timestamp: u32) {
        self.set_sync_info(MediaKind::Audio, ntp_sec, ntp_frac, timestamp)
    }

    pub fn set_video_sync_info(&self, ntp_sec: u32, ntp_frac: u32, timestamp: u32) {
        self.set_sync_info(MediaKind::Video, ntp_sec, ntp_frac, timestamp)
    }

    /// set_sync_info_from_report is `set_sync_info` fed straight from an RTCP sender report.
    pub fn set_sync_info_from_report(&self, kind: MediaKind, report: &SenderReport) {
        let ntp_sec = (report.ntp_time >> 32) as u32;
        let ntp_frac = report.ntp_time as u32;
        self.set_sync_info(kind, ntp_sec, ntp_frac, report.rtp_time)
    }

    /// set_remote_mute records the remote mute state. Unmuting forces a fresh sync point
    /// before the stream is trusted again.
    pub fn set_remote_mute(&self, kind: MediaKind, muted: bool) {
        self.state.lock().stream_mut(kind).set_remote_mute(kind, muted)
    }

    pub fn set_remote_audio_mute(&self, muted: bool) {
        self.set_remote_mute(MediaKind::Audio, muted)
    }

    pub fn set_remote_video_mute(&self, muted: bool) {
        self.set_remote_mute(MediaKind::Video, muted)
    }

    pub fn remote_muted(&self, kind: MediaKind) -> bool {
        self.state.lock().stream(kind).remote_muted
    }

    pub fn remote_audio_muted(&self) -> bool {
        self.remote_muted(MediaKind::Audio)
    }

    /// sync_reset drops the stream's confidence count; the next sync point re-establishes it.
    pub fn sync_reset(&self, kind: MediaKind) {
        self.state.lock().stream_mut(kind).syncs_since_unmute = 0;
    }

    pub fn audio_sync_reset(&self) {
        self.sync_reset(MediaKind::Audio)
    }

    pub fn video_sync_reset(&self) {
        self.sync_reset(MediaKind::Video)
    }

    pub fn syncs_since_unmute(&self, kind: MediaKind) -> u32 {
        self.state.lock().stream(kind).syncs_since_unmute
    }

    /// valid_to_sync reports whether both streams are unmuted and each has a sync point
    /// since it was last unmuted.
    pub fn valid_to_sync(&self) -> bool {
        let state = self.state.lock();
        !state.audio.remote_muted
            && !state.video.remote_muted
            && state.audio.syncs_since_unmute > 0
            && state.video.syncs_since_unmute > 0
    }
}

/// SenderReportSync turns the sender reports of one stream into sync points.
///
/// Reports that do not advance the sender packet count are ignored. With byte-order
/// detection enabled, sync points are held back until an [`NtpOrderDetector`] is confident
/// and then fed with the words in the detected order.
#[derive(Debug)]
pub struct SenderReportSync {
    kind: MediaKind,
    last_packet_count: u32,
    detector: Option<NtpOrderDetector>,
}

impl SenderReportSync {
    pub fn new(kind: MediaKind, detect_ntp_order: bool) -> Self {
        SenderReportSync {
            kind,
            last_packet_count: 0,
            detector: if detect_ntp_order {
                Some(NtpOrderDetector::new())
            } else {
                None
            },
        }
    }

    /// sender_report processes one report and returns whether a sync point was recorded.
    pub fn sender_report(&mut self, sync: &SyncManager, report: &SenderReport) -> bool {
        if report.packet_count == 0 || report.packet_count <= self.last_packet_count {
            self.last_packet_count = report.packet_count;
            return false;
        }
        self.last_packet_count = report.packet_count;

        let most = (report.ntp_time >> 32) as u32;
        let least = report.ntp_time as u32;
        let (sec, frac) = match self.detector.as_mut() {
            None => (most, least),
            Some(detector) => match detector.observe(most, least) {
                Some(NtpOrder::SecondsFirst) => (most, least),
                Some(NtpOrder::Swapped) => (least, most),
                None => return false,
            },
        };
        sync.set_sync_info(self.kind, sec, frac, report.rtp_time);
        true
    }

    pub fn reset(&mut self) {
        self.last_packet_count = 0;
        if let Some(detector) = self.detector.as_mut() {
            detector.reset();
        }
    }
}
