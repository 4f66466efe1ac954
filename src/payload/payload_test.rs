use super::*;

fn video_map() -> VideoPayloadMap {
    PayloadMap::new()
        .with(
            96,
            PayloadAttributes::new(VideoCodec::H264, 90000)
                .with_packetization(Packetization::H264NonInterleaved)
                .with_rtx_payload_type(97)
                .with_feedback(FeedbackCapabilities::all()),
        )
        .with(97, PayloadAttributes::new(VideoCodec::Rtx, 90000))
        .with(
            34,
            PayloadAttributes::new(VideoCodec::H263, 90000)
                .with_packetization(Packetization::H263Rfc2190),
        )
}

#[test]
fn test_lookup() {
    let map = video_map();
    assert_eq!(
        map.lookup(96),
        (VideoCodec::H264, Packetization::H264NonInterleaved)
    );
    assert_eq!(map.codec(34), VideoCodec::H263);
    assert!(map.codec(97).is_rtx());
    assert_eq!(map.lookup(100), (VideoCodec::None, Packetization::Unknown));
}

#[test]
fn test_media_payload_type_for_rtx() {
    let map = video_map();
    assert_eq!(map.media_payload_type(97), Some(96));
    assert_eq!(map.media_payload_type(98), None);
}

#[test]
fn test_feedback_intersect() {
    let negotiated = FeedbackCapabilities {
        nack: true,
        pli: true,
        ..Default::default()
    };
    let session = FeedbackCapabilities {
        pli: true,
        fir: true,
        ..Default::default()
    };
    let both = negotiated.intersect(&session);
    assert!(both.pli);
    assert!(!both.nack);
    assert!(!both.fir);
}

#[test]
fn test_attributes_serde() {
    let attrs = PayloadAttributes::new(AudioCodec::G711Mulaw, 8000)
        .with_packetization(Packetization::Frames);
    let json = serde_json::to_string(&attrs).unwrap();
    let back: PayloadAttributes<AudioCodec> = serde_json::from_str(&json).unwrap();
    assert_eq!(back, attrs);
}
