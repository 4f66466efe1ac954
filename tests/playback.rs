use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use rtp_playback::mock::mock_output::{MockAudioOutput, MockVideoOutput};
use rtp_playback::mock::mock_packet::{rtp_datagram, MOCK_SSRC};
use rtp_playback::mock::mock_transport::{MockRtcpSession, MockRtpSource};
use rtp_playback::payload::{
    AudioCodec, AudioPayloadMap, FeedbackCapabilities, Packetization, PayloadAttributes,
    VideoCodec, VideoPayloadMap,
};
use rtp_playback::rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use rtp_playback::task::TaskIo;
use rtp_playback::transport::{RtcpSession, RtpSource};
use rtp_playback::{
    audio_read, video_read, AudioPlayback, AudioPlaybackConfig, AudioPlaybackTask,
    KeepAliveConfig, SyncManager, VideoPlayback, VideoPlaybackConfig, VideoPlaybackTask,
};

const PCMU: u8 = 0;
const H264: u8 = 96;

async fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    done()
}

fn audio_task(source: &Arc<MockRtpSource>) -> Result<(AudioPlaybackTask, Arc<MockAudioOutput>)> {
    let config = AudioPlaybackConfig::default()
        .with_jitter_packets(0)
        .with_keepalive(KeepAliveConfig::disabled());
    let sync = Arc::new(SyncManager::new());
    let read = Arc::new(audio_read(&config, Arc::clone(&sync)));
    let output = Arc::new(MockAudioOutput::new());
    let mut playback = AudioPlayback::new(config, read, output.clone(), sync);
    playback.initialize(
        AudioPayloadMap::new().with(PCMU, PayloadAttributes::new(AudioCodec::G711Mulaw, 8000)),
    )?;
    playback.data_channel_initialize(false, SystemTime::now())?;

    let io = TaskIo {
        rtp: Some(source.clone() as Arc<dyn RtpSource + Send + Sync>),
        rtcp: None,
    };
    let task = AudioPlaybackTask::spawn(playback, io, Arc::new(SystemTime::now));
    task.output_ready(true);
    Ok((task, output))
}

fn speech(sn: u16) -> bytes::Bytes {
    rtp_datagram(PCMU, sn, sn as u32 * 160, MOCK_SSRC, false, &[0xd5; 160])
}

#[tokio::test]
async fn test_audio_reordering_corrected_without_loss() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    let source = Arc::new(MockRtpSource::new());
    let (task, output) = audio_task(&source)?;
    for sn in [100u16, 101, 103, 102, 104] {
        source.push(speech(sn));
    }

    assert!(wait_for(|| output.sequence_numbers().len() >= 5).await);
    assert_eq!(output.sequence_numbers(), vec![100, 101, 102, 103, 104]);
    let stats = task.stats_collect();
    assert_eq!(stats.packets_lost, 0);
    assert_eq!(stats.actual_packets_lost, 0);

    task.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_audio_gap_reported_only_when_data_runs_out() -> Result<()> {
    let source = Arc::new(MockRtpSource::new());
    let (task, output) = audio_task(&source)?;
    source.push(speech(100));
    source.push(speech(105));

    assert!(wait_for(|| source.pending() == 0 && !output.sequence_numbers().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(output.sequence_numbers(), vec![100]);
    assert_eq!(task.stats_collect().packets_lost, 0);

    task.with_playback(|playback| {
        playback.on_no_more_data();
        while playback.data_available() {}
    });
    assert_eq!(output.sequence_numbers(), vec![100, 105]);
    assert_eq!(task.stats_collect().packets_lost, 4);

    task.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_video_fragmented_frame_repaired_by_nack() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    let config = VideoPlaybackConfig::default().with_keepalive(KeepAliveConfig::disabled());
    let sync = Arc::new(SyncManager::new());
    let read = Arc::new(video_read(&config, Arc::clone(&sync)));
    let output = Arc::new(MockVideoOutput::new());
    let mut playback = VideoPlayback::new(config, read, output.clone(), sync);
    playback.initialize(
        VideoPayloadMap::new().with(
            H264,
            PayloadAttributes::new(VideoCodec::H264, 90000)
                .with_packetization(Packetization::H264NonInterleaved)
                .with_feedback(FeedbackCapabilities::all()),
        ),
    )?;
    playback.data_channel_initialize(false)?;

    let source = Arc::new(MockRtpSource::new());
    let rtcp = Arc::new(MockRtcpSession::default());
    let io = TaskIo {
        rtp: Some(source.clone() as Arc<dyn RtpSource + Send + Sync>),
        rtcp: Some(rtcp.clone() as Arc<dyn RtcpSession + Send + Sync>),
    };
    let task = VideoPlaybackTask::spawn(playback, io, Arc::new(SystemTime::now));

    source.push(rtp_datagram(H264, 100, 3000, MOCK_SSRC, true, &[0x65, 0x88, 0x84, 0x00]));
    assert!(wait_for(|| output.frames().len() == 1).await);

    // FU-A start and end of the next frame; the middle goes missing
    source.push(rtp_datagram(H264, 101, 6000, MOCK_SSRC, false, &[0x7c, 0x81, 0xaa]));
    source.push(rtp_datagram(H264, 103, 6000, MOCK_SSRC, true, &[0x7c, 0x41, 0xcc]));

    let feedback = tokio::time::timeout(Duration::from_secs(3), rtcp.wait_feedback(1)).await?;
    let nack = feedback
        .iter()
        .find_map(|p| p.as_any().downcast_ref::<TransportLayerNack>())
        .expect("no NACK sent");
    assert_eq!(nack.media_ssrc, MOCK_SSRC);
    assert_eq!(nack.nacks[0].packet_id, 102);

    source.push(rtp_datagram(H264, 102, 6000, MOCK_SSRC, false, &[0x7c, 0x01, 0xbb]));
    assert!(wait_for(|| output.frames().len() == 2).await);

    let frame = &output.frames()[1];
    assert!(frame.complete);
    assert!(!frame.keyframe);
    assert_eq!(&frame.data[..], &[0, 0, 0, 1, 0x61, 0xaa, 0xbb, 0xcc]);

    let stats = task.stats_collect();
    assert_eq!(stats.packets_lost, 0);
    assert_eq!(stats.actual_packet_loss, 1);
    assert!(stats.nack_requests_sent >= 1);

    task.close().await?;
    Ok(())
}
