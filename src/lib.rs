#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub use rtcp;
pub use rtp;
pub use util;

pub mod audio;
pub mod config;
pub mod error;
pub mod mock;
pub mod output;
pub mod packet;
pub mod payload;
pub mod playback;
pub mod queue;
pub mod read;
pub mod sequence;
pub mod sync_manager;
pub mod task;
pub mod transport;
pub mod video;

pub use audio::{audio_read, AudioPlayback, AudioPlaybackStats, AudioPlaybackTask};
pub use config::{AudioPlaybackConfig, KeepAliveConfig, VideoPlaybackConfig};
pub use error::Error;
pub use sync_manager::SyncManager;
pub use video::{video_read, VideoPlayback, VideoPlaybackStats, VideoPlaybackTask};
