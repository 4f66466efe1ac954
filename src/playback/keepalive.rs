use std::time::SystemTime;

use crate::config::KeepAliveConfig;
use crate::task::{Outbox, Timer};

/// KeepAlive schedules the empty RTP packets that keep a NAT pinhole open toward the remote
/// sender.
///
/// One is sent when the channel opens, the next after a short delay, then a quick burst,
/// then one per interval. A due keepalive is skipped when media went out since the last one.
#[derive(Debug)]
pub struct KeepAlive {
    config: KeepAliveConfig,
    timer: Timer,
    burst_remaining: u32,
    bytes_recently_sent: u64,
}

impl KeepAlive {
    pub fn new(config: KeepAliveConfig) -> Self {
        let timer = Timer::new(config.initial_delay());
        KeepAlive {
            config,
            timer,
            burst_remaining: 0,
            bytes_recently_sent: 0,
        }
    }

    pub fn config(&self) -> &KeepAliveConfig {
        &self.config
    }

    pub fn start(&mut self, now: SystemTime, outbox: &mut Outbox) {
        if !self.config.enabled() {
            self.timer.stop();
            return;
        }
        self.burst_remaining = self.config.burst_count;
        outbox.keepalives.push(self.config.payload_type);
        self.timer.set_timeout(self.config.initial_delay());
        self.timer.restart(now);
    }

    pub fn stop(&mut self) {
        self.timer.stop();
    }

    /// bytes_sent notes media sent toward the remote side.
    pub fn bytes_sent(&mut self, n: u64) {
        self.bytes_recently_sent += n;
    }

    pub fn deadline(&self) -> Option<SystemTime> {
        self.timer.deadline()
    }

    pub fn is_active(&self) -> bool {
        self.timer.is_active()
    }

    /// on_timer sends a keepalive if one is due and re-arms the timer.
    pub fn on_timer(&mut self, now: SystemTime, channel_open: bool, outbox: &mut Outbox) {
        if !self.timer.fire(now) || !channel_open {
            return;
        }

        let sent = std::mem::take(&mut self.bytes_recently_sent);
        if sent == 0 {
            outbox.keepalives.push(self.config.payload_type);
        }

        if self.burst_remaining > 0 {
            self.burst_remaining -= 1;
            self.timer.set_timeout(self.config.burst_interval());
        } else {
            self.timer.set_timeout(self.config.interval());
        }
        self.timer.restart(now);
    }
}
