use std::time::Duration;

use serde::{Deserialize, Serialize};

/// KeepAliveConfig controls the RTP keepalives that hold a NAT pinhole open toward the remote
/// sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    /// payload type of the keepalive packets; 0 disables keepalives
    pub payload_type: u8,
    /// steady state interval in seconds
    pub interval_secs: u32,
    /// number of quick keepalives sent after the channel opens
    pub burst_count: u32,
    pub burst_interval_ms: u64,
    /// delay between the first keepalive and the burst
    pub initial_delay_ms: u64,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        KeepAliveConfig {
            payload_type: 63,
            interval_secs: 28,
            burst_count: 6,
            burst_interval_ms: 500,
            initial_delay_ms: 100,
        }
    }
}

impl KeepAliveConfig {
    pub fn disabled() -> Self {
        KeepAliveConfig {
            payload_type: 0,
            ..Default::default()
        }
    }

    pub fn with_payload_type(mut self, payload_type: u8) -> Self {
        self.payload_type = payload_type;
        self
    }

    pub fn with_interval_secs(mut self, interval_secs: u32) -> Self {
        self.interval_secs = interval_secs;
        self
    }

    pub fn with_burst(mut self, count: u32, interval: Duration) -> Self {
        self.burst_count = count;
        self.burst_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn enabled(&self) -> bool {
        self.payload_type != 0
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs as u64)
    }

    pub fn burst_interval(&self) -> Duration {
        Duration::from_millis(self.burst_interval_ms)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }
}

/// AudioPlaybackConfig configures an audio read and playback pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioPlaybackConfig {
    /// packets in the read pool
    pub pool_size: usize,
    /// bytes per pooled packet
    pub max_packet_size: usize,
    /// bound of the out-of-order holding queue; reaching it forces the reassembler forward
    pub out_of_order_buffers: usize,
    /// consecutive stale packets tolerated before the stream is treated as restarted
    pub max_throw_count: u32,
    /// packets held at call start before playback is signalled
    pub jitter_packets: usize,
    pub detect_ntp_order: bool,
    pub keepalive: KeepAliveConfig,
}

impl Default for AudioPlaybackConfig {
    fn default() -> Self {
        AudioPlaybackConfig {
            pool_size: 30,
            max_packet_size: 1500,
            out_of_order_buffers: 4,
            max_throw_count: 10,
            jitter_packets: 3,
            detect_ntp_order: false,
            keepalive: KeepAliveConfig::default(),
        }
    }
}

impl AudioPlaybackConfig {
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    pub fn with_out_of_order_buffers(mut self, n: usize) -> Self {
        self.out_of_order_buffers = n;
        self
    }

    pub fn with_max_throw_count(mut self, n: u32) -> Self {
        self.max_throw_count = n;
        self
    }

    pub fn with_jitter_packets(mut self, n: usize) -> Self {
        self.jitter_packets = n;
        self
    }

    pub fn with_detect_ntp_order(mut self, detect: bool) -> Self {
        self.detect_ntp_order = detect;
        self
    }

    pub fn with_keepalive(mut self, keepalive: KeepAliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }
}

/// VideoPlaybackConfig configures a video read and playback pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoPlaybackConfig {
    pub pool_size: usize,
    pub max_packet_size: usize,
    /// frames the jitter buffer aims to hold
    pub frames_to_buffer: usize,
    pub nack_enabled: bool,
    pub max_nack_retries: u32,
    /// period of the missing packet sweep
    pub nack_interval_ms: u64,
    /// minimum spacing between two NACKs for the same packet
    pub nack_rtt_ms: u64,
    /// keyframe re-request period while one is outstanding
    pub keyframe_interval_ms: u64,
    pub tmmbr_enabled: bool,
    pub tmmbr_interval_ms: u64,
    /// upper bound for the requested receive rate in bits per second
    pub max_receive_rate: u32,
    pub detect_ntp_order: bool,
    pub keepalive: KeepAliveConfig,
}

impl Default for VideoPlaybackConfig {
    fn default() -> Self {
        VideoPlaybackConfig {
            pool_size: 600,
            max_packet_size: 1500,
            frames_to_buffer: 4,
            nack_enabled: true,
            max_nack_retries: 2,
            nack_interval_ms: 20,
            nack_rtt_ms: 120,
            keyframe_interval_ms: 3000,
            tmmbr_enabled: true,
            tmmbr_interval_ms: 5000,
            max_receive_rate: 2_048_000,
            detect_ntp_order: false,
            keepalive: KeepAliveConfig::default(),
        }
    }
}

impl VideoPlaybackConfig {
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_frames_to_buffer(mut self, n: usize) -> Self {
        self.frames_to_buffer = n;
        self
    }

    pub fn with_nack(mut self, enabled: bool) -> Self {
        self.nack_enabled = enabled;
        self
    }

    pub fn with_max_nack_retries(mut self, n: u32) -> Self {
        self.max_nack_retries = n;
        self
    }

    pub fn with_nack_rtt(mut self, rtt: Duration) -> Self {
        self.nack_rtt_ms = rtt.as_millis() as u64;
        self
    }

    pub fn with_keyframe_interval(mut self, interval: Duration) -> Self {
        self.keyframe_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_tmmbr(mut self, enabled: bool) -> Self {
        self.tmmbr_enabled = enabled;
        self
    }

    pub fn with_max_receive_rate(mut self, rate: u32) -> Self {
        self.max_receive_rate = rate;
        self
    }

    pub fn with_detect_ntp_order(mut self, detect: bool) -> Self {
        self.detect_ntp_order = detect;
        self
    }

    pub fn with_keepalive(mut self, keepalive: KeepAliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn nack_interval(&self) -> Duration {
        Duration::from_millis(self.nack_interval_ms)
    }

    pub fn nack_rtt(&self) -> Duration {
        Duration::from_millis(self.nack_rtt_ms)
    }

    pub fn keyframe_interval(&self) -> Duration {
        Duration::from_millis(self.keyframe_interval_ms)
    }

    pub fn tmmbr_interval(&self) -> Duration {
        Duration::from_millis(self.tmmbr_interval_ms)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_audio_defaults() {
        let config = AudioPlaybackConfig::default();
        assert_eq!(config.pool_size, 30);
        assert_eq!(config.out_of_order_buffers, 4);
        assert_eq!(config.max_throw_count, 10);
        assert!(config.keepalive.enabled());
    }

    #[test]
    fn test_video_from_partial_json() {
        let config: VideoPlaybackConfig =
            serde_json::from_str(r#"{"frames_to_buffer": 6, "keepalive": {"payload_type": 0}}"#)
                .unwrap();
        assert_eq!(config.frames_to_buffer, 6);
        assert_eq!(config.pool_size, 600);
        assert_eq!(config.nack_rtt(), Duration::from_millis(120));
        assert!(!config.keepalive.enabled());
        assert_eq!(config.keepalive.interval_secs, 28);
    }

    #[test]
    fn test_round_trip_json() {
        let config = AudioPlaybackConfig::default()
            .with_jitter_packets(5)
            .with_keepalive(KeepAliveConfig::default().with_interval_secs(10));
        let json = serde_json::to_string(&config).unwrap();
        let back: AudioPlaybackConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
