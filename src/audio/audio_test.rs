use std::sync::Arc;
use std::time::{Duration, SystemTime};

use super::*;
use crate::config::KeepAliveConfig;
use crate::mock::mock_output::MockAudioOutput;
use crate::mock::mock_packet::{rtp_datagram, MOCK_SSRC};
use crate::mock::mock_transport::MockRtpSource;
use crate::payload::PayloadAttributes;
use crate::read::{ReadOutcome, ReadState};
use crate::transport::RtpSource;

const PCMU: u8 = 0;
const G722: u8 = 9;
const DTMF: u8 = 101;

fn payloads() -> AudioPayloadMap {
    AudioPayloadMap::new()
        .with(PCMU, PayloadAttributes::new(AudioCodec::G711Mulaw, 8000))
        .with(G722, PayloadAttributes::new(AudioCodec::G722, 8000))
        .with(
            DTMF,
            PayloadAttributes::new(AudioCodec::TelephoneEvent, 8000),
        )
}

fn test_config() -> AudioPlaybackConfig {
    AudioPlaybackConfig::default()
        .with_jitter_packets(0)
        .with_keepalive(KeepAliveConfig::disabled())
}

struct Harness {
    playback: AudioPlayback,
    read: Arc<AudioPlaybackRead>,
    output: Arc<MockAudioOutput>,
}

impl Harness {
    fn new(config: AudioPlaybackConfig) -> Self {
        let sync = Arc::new(SyncManager::new());
        let read = Arc::new(audio_read(&config, Arc::clone(&sync)));
        let output = Arc::new(MockAudioOutput::new());
        let mut playback =
            AudioPlayback::new(config, Arc::clone(&read), output.clone(), sync);
        playback.initialize(payloads()).unwrap();
        playback
            .data_channel_initialize(false, SystemTime::UNIX_EPOCH)
            .unwrap();
        assert!(!playback.output_ready_set(true));
        Harness {
            playback,
            read,
            output,
        }
    }

    fn ingest(&self, payload_type: u8, sn: u16, timestamp: u32, payload: &[u8]) -> ReadOutcome {
        self.read.ingest(&rtp_datagram(
            payload_type,
            sn,
            timestamp,
            MOCK_SSRC,
            false,
            payload,
        ))
    }

    fn speech(&self, sn: u16) -> ReadOutcome {
        self.ingest(PCMU, sn, sn as u32 * 160, &[0xd5; 160])
    }

    fn drain(&mut self) {
        let mut rounds = 0;
        while self.playback.data_available() {
            rounds += 1;
            assert!(rounds < 10_000, "playback never ran dry");
        }
    }
}

#[test]
fn test_reordered_packets_play_in_order() {
    let mut h = Harness::new(test_config());
    for sn in [100, 101, 103, 102, 104] {
        assert_eq!(h.speech(sn), ReadOutcome::Queued);
    }
    h.drain();

    assert_eq!(h.output.sequence_numbers(), vec![100, 101, 102, 103, 104]);
    let stats = h.playback.stats_collect();
    assert_eq!(stats.packets_lost, 0);
}

#[test]
fn test_gap_waits_until_no_more_data() {
    let mut h = Harness::new(test_config());
    h.speech(100);
    h.speech(105);
    h.drain();

    assert_eq!(h.output.sequence_numbers(), vec![100]);
    assert_eq!(h.playback.out_of_order_len(), 1);
    assert_eq!(h.playback.stats_collect().packets_lost, 0);

    h.playback.on_no_more_data();
    h.drain();
    assert_eq!(h.output.sequence_numbers(), vec![100, 105]);
    assert_eq!(h.playback.stats_collect().packets_lost, 4);
    assert_eq!(h.playback.expected_sequence_number(), Some(106));
}

#[test]
fn test_full_queue_forces_advance() {
    let mut h = Harness::new(test_config());
    for sn in [100, 102, 103, 104, 105] {
        h.speech(sn);
    }
    h.drain();
    assert_eq!(h.output.sequence_numbers(), vec![100]);
    assert_eq!(h.playback.out_of_order_len(), 4);

    h.speech(106);
    h.drain();
    assert_eq!(
        h.output.sequence_numbers(),
        vec![100, 102, 103, 104, 105, 106]
    );
    let stats = h.playback.stats_collect();
    assert_eq!(stats.packets_lost, 1);
    assert_eq!(stats.actual_packets_lost, 1);
}

#[test]
fn test_forced_advance_stops_at_read_packet() {
    let mut h = Harness::new(test_config());
    for sn in [100, 110, 111, 112, 113] {
        h.speech(sn);
    }
    h.drain();

    // 105 lies between expected and the queue, so it is played before the queued run
    h.speech(105);
    h.drain();
    assert_eq!(h.output.sequence_numbers(), vec![100, 105]);
    assert_eq!(h.playback.stats_collect().packets_lost, 4);
    assert_eq!(h.playback.out_of_order_len(), 4);
}

#[test]
fn test_duplicates_are_dropped() {
    let mut h = Harness::new(test_config());
    for sn in [100, 102, 102, 101, 101] {
        h.speech(sn);
    }
    h.drain();
    assert_eq!(h.output.sequence_numbers(), vec![100, 101, 102]);
}

#[test]
fn test_sequence_wraparound() {
    let mut h = Harness::new(test_config());
    for sn in [65533, 2, 65534, 65535, 1, 0] {
        h.speech(sn);
    }
    h.drain();
    assert_eq!(
        h.output.sequence_numbers(),
        vec![65533, 65534, 65535, 0, 1, 2]
    );
    assert_eq!(h.playback.stats_collect().packets_lost, 0);
}

#[test]
fn test_previous_cycle_packets_discarded_after_wrap() {
    let mut h = Harness::new(test_config());
    for sn in (65533..=65535).chain(0..=5) {
        h.speech(sn);
    }
    h.drain();

    // late copies from before the wrap are behind expected, not ahead of it
    for sn in [65533, 65534, 65535, 9, 7, 6, 8] {
        h.speech(sn);
    }
    h.drain();

    let played = h.output.sequence_numbers();
    assert_eq!(&played[played.len() - 4..], &[6, 7, 8, 9]);
    assert_eq!(played.len(), 13);
    assert_eq!(h.playback.out_of_order_len(), 0);
    assert_eq!(h.playback.expected_sequence_number(), Some(10));
    assert_eq!(h.playback.stats_collect().packets_lost, 0);
}

#[test]
fn test_late_packet_takes_back_counted_loss() {
    let mut h = Harness::new(test_config());
    for sn in [100, 102, 103, 104, 105, 106] {
        h.speech(sn);
    }
    h.drain();
    assert_eq!(h.output.sequence_numbers(), vec![100, 102, 103, 104, 105, 106]);

    h.speech(101);
    h.speech(101);
    h.drain();
    assert_eq!(h.output.sequence_numbers().len(), 6);
    let stats = h.playback.stats_collect();
    assert_eq!(stats.packets_lost, 0);
    assert_eq!(stats.actual_packets_lost, 1);
}

#[test]
fn test_stale_packets_restart_stream() {
    let mut h = Harness::new(test_config());
    for sn in 100..=104 {
        h.speech(sn);
    }
    h.drain();

    for sn in 50..=60 {
        h.speech(sn);
    }
    h.drain();
    assert_eq!(h.playback.expected_sequence_number(), None);

    h.speech(500);
    h.drain();
    assert_eq!(
        h.output.sequence_numbers(),
        vec![100, 101, 102, 103, 104, 500]
    );
}

#[test]
fn test_codec_change_restarts_device() {
    let mut h = Harness::new(test_config());
    h.speech(1);
    h.speech(2);
    h.ingest(G722, 3, 480, &[0x11; 160]);
    h.drain();

    assert_eq!(
        h.output.codecs(),
        vec![AudioCodec::G711Mulaw, AudioCodec::G722]
    );
    assert_eq!(h.output.start_stop_counts(), (2, 2));
    let frames = h.output.frames();
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[2].codec, AudioCodec::G722);
    assert_eq!(h.playback.codec(), AudioCodec::G722);
}

#[test]
fn test_g711_bad_size_dropped() {
    let mut h = Harness::new(test_config());
    h.ingest(PCMU, 1, 160, &[0xd5; 40]);
    h.ingest(PCMU, 2, 320, &[0xd5; 160]);
    h.drain();
    assert_eq!(h.output.sequence_numbers(), vec![2]);
}

#[test]
fn test_multi_frame_packet_plays_sub_frames() {
    let mut h = Harness::new(test_config());
    h.ingest(PCMU, 10, 1600, &[0xd5; 320]);
    h.drain();

    let frames = h.output.frames();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].sequence_number, 10);
    assert_eq!(frames[0].timestamp, 1600);
    assert_eq!(frames[1].sequence_number, 11);
    assert_eq!(frames[1].timestamp, 1760);
    assert!(frames.iter().all(|f| f.data.len() == 160 && f.duration == 160));
}

#[test]
fn test_unpack_frame_info() {
    let info = unpack::frame_info(160);
    assert_eq!((info.frames, info.frame_size, info.frame_duration), (1, 160, 160));
    let info = unpack::frame_info(480);
    assert_eq!((info.frames, info.frame_size), (3, 160));
    let info = unpack::frame_info(200);
    assert_eq!((info.frames, info.frame_size), (1, 200));
}

#[test]
fn test_dtmf_reported_once_per_event() {
    let mut h = Harness::new(test_config());
    for sn in 1..=3 {
        assert_eq!(
            h.ingest(DTMF, sn, 8000, &[5, 0x0a, 0x00, 0xa0]),
            ReadOutcome::Consumed
        );
    }
    h.ingest(DTMF, 4, 8000, &[5, 0x8a, 0x03, 0x20]);
    h.ingest(DTMF, 5, 9600, &[11, 0x0a, 0x00, 0xa0]);
    h.drain();

    let events = h.output.dtmf_events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].digit(), Some('5'));
    assert_eq!(events[0].duration, 160);
    assert_eq!(events[1].digit(), Some('#'));
    assert!(h.output.frames().is_empty());
}

#[test]
fn test_privacy_mute_drops_packets() {
    let mut h = Harness::new(test_config());
    h.speech(1);
    h.drain();

    h.playback.muted(MuteReason::Privacy);
    assert!(h.playback.mute_state().contains(MuteReason::Privacy));
    h.speech(2);
    h.speech(3);
    h.drain();
    assert_eq!(h.output.sequence_numbers(), vec![1]);

    h.playback.unmuted(MuteReason::Privacy);
    h.speech(10);
    h.drain();
    assert_eq!(h.output.sequence_numbers(), vec![1, 10]);
}

#[test]
fn test_dhv_is_ignored() {
    let mut h = Harness::new(test_config());
    h.playback.hold(HoldLocation::Dhv);
    assert!(!h.playback.mute_state().is_muted());
    h.speech(1);
    h.drain();
    assert_eq!(h.output.sequence_numbers(), vec![1]);
}

#[test]
fn test_remote_hold_halts_read() {
    let mut h = Harness::new(test_config());
    h.playback.hold(HoldLocation::Remote);
    assert_eq!(h.read.state(), ReadState::Halted);
    assert_eq!(h.speech(1), ReadOutcome::Halted);

    h.playback.resume(HoldLocation::Remote);
    assert_eq!(h.speech(2), ReadOutcome::Queued);
    h.drain();
    assert_eq!(h.output.sequence_numbers(), vec![2]);
}

#[test]
fn test_local_hold_and_resume() {
    let mut h = Harness::new(test_config());
    h.speech(1);
    h.drain();
    assert!(h.output.is_started());

    h.playback.hold(HoldLocation::Local);
    assert!(!h.output.is_started());
    assert!(!h.playback.is_channel_open());
    assert_eq!(h.speech(2), ReadOutcome::Halted);

    h.playback.resume(HoldLocation::Local);
    assert!(h.playback.is_channel_open());
    assert_eq!(h.speech(3), ReadOutcome::Queued);
    // the device reports ready again once restarted
    h.playback.output_ready_set(true);
    h.drain();

    assert_eq!(h.output.sequence_numbers(), vec![1, 3]);
    // a resumed channel sets the codec again even though it did not change
    assert_eq!(
        h.output.codecs(),
        vec![AudioCodec::G711Mulaw, AudioCodec::G711Mulaw]
    );
}

#[test]
fn test_stats_collect_resets() {
    let mut h = Harness::new(test_config());
    for sn in 1..=3 {
        h.speech(sn);
    }
    h.drain();

    let stats = h.playback.stats_collect();
    assert_eq!(stats.packets_received, 2);
    assert_eq!(stats.bytes_received, 480);
    assert_eq!(stats.read.packets_read, 3);

    let stats = h.playback.stats_collect();
    assert_eq!(stats, AudioPlaybackStats::default());
}

#[test]
fn test_close_destroys_pool() {
    let mut h = Harness::new(test_config());
    h.speech(1);
    h.speech(3);
    h.drain();
    assert_eq!(h.playback.close(), Ok(()));
    assert_eq!(h.read.state(), ReadState::Closed);
}

#[test]
fn test_keepalives_from_handler() {
    let config = test_config().with_keepalive(KeepAliveConfig::default());
    let sync = Arc::new(SyncManager::new());
    let read = Arc::new(audio_read(&config, Arc::clone(&sync)));
    let mut playback =
        AudioPlayback::new(config, read, Arc::new(MockAudioOutput::new()), sync);
    playback.initialize(payloads()).unwrap();

    let t0 = SystemTime::UNIX_EPOCH;
    playback.data_channel_initialize(true, t0).unwrap();
    assert_eq!(playback.take_outbox().keepalives, vec![63]);
    assert_eq!(
        playback.next_deadline(),
        Some(t0 + Duration::from_millis(100))
    );

    playback.handle_timers(t0 + Duration::from_millis(100));
    assert_eq!(playback.take_outbox().keepalives, vec![63]);

    playback.hold(HoldLocation::Local);
    assert_eq!(playback.next_deadline(), None);
}

#[tokio::test]
async fn test_audio_task_plays_from_socket() -> Result<()> {
    let config = test_config();
    let sync = Arc::new(SyncManager::new());
    let read = Arc::new(audio_read(&config, Arc::clone(&sync)));
    let output = Arc::new(MockAudioOutput::new());
    let mut playback = AudioPlayback::new(config, read, output.clone(), sync);
    playback.initialize(payloads())?;
    playback.data_channel_initialize(false, SystemTime::now())?;

    let source = Arc::new(MockRtpSource::new());
    let io = TaskIo {
        rtp: Some(source.clone() as Arc<dyn RtpSource + Send + Sync>),
        rtcp: None,
    };
    let task = AudioPlaybackTask::spawn(playback, io, Arc::new(SystemTime::now));
    assert!(task.output_ready(true));

    for sn in [1u16, 2, 4, 3] {
        source.push(rtp_datagram(
            PCMU,
            sn,
            sn as u32 * 160,
            MOCK_SSRC,
            false,
            &[0xd5; 160],
        ));
    }

    let mut tries = 0;
    while output.sequence_numbers().len() < 4 && tries < 200 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        tries += 1;
    }
    assert_eq!(output.sequence_numbers(), vec![1, 2, 3, 4]);
    assert_eq!(task.stats_collect().read.packets_read, 4);

    task.close().await?;
    assert_eq!(task.read().state(), ReadState::Closed);
    assert_eq!(task.close().await, Err(Error::ErrTaskClosed));

    Ok(())
}

#[test]
fn test_device_failures_map_to_device_errors() {
    let mut h = Harness::new(test_config());
    h.output.set_failing(true);
    assert_eq!(
        h.playback.device_codec_set(AudioCodec::G722),
        Err(Error::ErrDeviceCodecSet)
    );
    assert_eq!(h.playback.output_start(), Err(Error::ErrDeviceStart));

    h.output.set_failing(false);
    assert_eq!(h.playback.device_codec_set(AudioCodec::G722), Ok(()));
    assert_eq!(h.output.codecs(), vec![AudioCodec::G722]);
}

#[tokio::test]
async fn test_audio_task_close_reports_every_failure() -> Result<()> {
    let config = test_config();
    let sync = Arc::new(SyncManager::new());
    let read = Arc::new(audio_read(&config, Arc::clone(&sync)));
    let output = Arc::new(MockAudioOutput::new());
    let mut playback = AudioPlayback::new(config, Arc::clone(&read), output, sync);
    playback.initialize(payloads())?;
    playback.data_channel_initialize(false, SystemTime::now())?;

    let datagram = rtp_datagram(PCMU, 1, 160, MOCK_SSRC, false, &[0xd5; 160]);
    assert_eq!(read.ingest(&datagram), ReadOutcome::Queued);
    let held = read.media_packet_oldest_get();
    assert!(held.is_some());

    let io = TaskIo {
        rtp: None,
        rtcp: None,
    };
    let task = AudioPlaybackTask::spawn(playback, io, Arc::new(SystemTime::now));
    assert_eq!(
        task.close().await,
        Err(Error::Other(Error::ErrPoolPacketsOutstanding(1).to_string()))
    );
    assert_eq!(task.read().state(), ReadState::Closed);

    drop(held);
    assert_eq!(task.close().await, Err(Error::ErrTaskClosed));
    Ok(())
}
