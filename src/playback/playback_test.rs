use std::time::{Duration, SystemTime};

use super::*;
use crate::config::KeepAliveConfig;
use crate::task::Outbox;

#[test]
fn test_mute_state_reasons_are_independent() {
    let mut muted = MuteState::default();
    assert!(!muted.is_muted());

    assert!(muted.set(MuteReason::Privacy));
    assert!(!muted.set(MuteReason::Privacy));
    assert!(muted.set(MuteReason::Held));
    assert!(muted.contains(MuteReason::Held));
    assert!(!muted.is_only(MuteReason::Privacy));

    assert!(muted.clear(MuteReason::Held));
    assert!(!muted.clear(MuteReason::Held));
    assert!(muted.is_only(MuteReason::Privacy));
    assert!(muted.clear(MuteReason::Privacy));
    assert!(!muted.is_muted());
}

#[test]
fn test_loss_counter_never_negative() {
    let mut loss = LossCounter::default();
    loss.subtract(3);
    assert_eq!(loss.lost(), 0);

    loss.add(4);
    loss.subtract(1);
    assert_eq!(loss.lost(), 3);
    loss.subtract(10);
    assert_eq!(loss.lost(), 0);
    assert_eq!(loss.actual(), 4);

    let taken = loss.take();
    assert_eq!(taken.actual(), 4);
    assert_eq!(loss, LossCounter::default());
}

#[test]
fn test_loss_counter_takes_back_late_packets_once() {
    let mut loss = LossCounter::default();
    loss.write_off(65534, 4);
    assert_eq!(loss.lost(), 4);

    assert!(loss.late_arrival(0));
    assert!(!loss.late_arrival(0));
    assert!(loss.late_arrival(65534));
    assert!(!loss.late_arrival(2));
    assert!(!loss.late_arrival(65533));
    assert_eq!(loss.lost(), 2);
    assert_eq!(loss.actual(), 4);

    // the run outlives a stats period, the count does not go negative
    loss.take();
    assert!(loss.late_arrival(1));
    assert_eq!(loss.lost(), 0);

    loss.write_off(10, 0);
    assert!(!loss.late_arrival(10));
}

#[test]
fn test_received_span() {
    let mut span = ReceivedSpan::default();
    assert_eq!(span.packets(), 0);
    span.add(100);
    assert_eq!(span.packets(), 0);
    span.add(110);
    assert_eq!(span.packets(), 10);
    span.take();

    span.add(65530);
    span.add(4);
    assert_eq!(span.packets(), 10);
}

#[test]
fn test_pack_nacks() {
    assert!(pack_nacks(&[]).is_empty());

    let pairs = pack_nacks(&[0x1_0005, 0x1_0006, 0x1_0015, 0x1_0016]);
    assert_eq!(pairs.len(), 2);
    assert_eq!(pairs[0].packet_id, 5);
    // 6 is offset 0, 21 is offset 15
    assert_eq!(pairs[0].lost_packets, 0b1000_0000_0000_0001);
    assert_eq!(pairs[1].packet_id, 0x16);
    assert_eq!(pairs[1].lost_packets, 0);
}

#[test]
fn test_pack_nacks_across_wrap() {
    let pairs = pack_nacks(&[0x1_fffe, 0x2_0000]);
    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0].packet_id, 0xfffe);
    assert_eq!(pairs[0].lost_packets, 0b10);
}

#[test]
fn test_nack_retries_and_spacing() {
    let t0 = SystemTime::UNIX_EPOCH;
    let mut nacks = NackTracker::new(2, Duration::from_millis(120));
    nacks.store(10, t0);
    nacks.store(11, t0);
    nacks.store(20, t0);

    assert_eq!(nacks.due(None, t0), vec![10, 11, 20]);
    // inside one round trip nothing is repeated
    assert!(nacks
        .due(None, t0 + Duration::from_millis(100))
        .is_empty());

    // 10 has been played past
    let t1 = t0 + Duration::from_millis(130);
    assert_eq!(nacks.due(Some(11), t1), vec![11, 20]);
    // both reached their retry limit
    assert!(nacks.is_empty());
}

#[test]
fn test_nack_tracker_remove() {
    let t0 = SystemTime::UNIX_EPOCH;
    let mut nacks = NackTracker::new(2, Duration::from_millis(120));
    nacks.store(7, t0);
    assert!(nacks.contains(7));
    assert_eq!(
        nacks.age(7, t0 + Duration::from_millis(40)),
        Some(Duration::from_millis(40))
    );
    assert!(nacks.remove(7));
    assert!(!nacks.remove(7));
}

#[test]
fn test_nack_packets() {
    let pkts = nack::nack_packets(1, 2, &[0x1_0001, 0x1_0030]);
    assert_eq!(pkts.len(), 2);
    assert_eq!(pkts[0].media_ssrc, 2);
    assert_eq!(pkts[1].nacks[0].packet_id, 0x30);
}

#[test]
fn test_keepalive_schedule() {
    let t0 = SystemTime::UNIX_EPOCH;
    let config = KeepAliveConfig::default().with_burst(2, Duration::from_millis(500));
    let mut keepalive = KeepAlive::new(config);
    let mut outbox = Outbox::default();

    keepalive.start(t0, &mut outbox);
    assert_eq!(outbox.keepalives, vec![63]);
    assert_eq!(keepalive.deadline(), Some(t0 + Duration::from_millis(100)));

    let mut now = t0 + Duration::from_millis(100);
    keepalive.on_timer(now, true, &mut outbox);
    assert_eq!(outbox.keepalives.len(), 2);
    assert_eq!(keepalive.deadline(), Some(now + Duration::from_millis(500)));

    // media went out, so this one is skipped but the burst goes on
    keepalive.bytes_sent(1200);
    now += Duration::from_millis(500);
    keepalive.on_timer(now, true, &mut outbox);
    assert_eq!(outbox.keepalives.len(), 2);
    assert_eq!(keepalive.deadline(), Some(now + Duration::from_millis(500)));

    now += Duration::from_millis(500);
    keepalive.on_timer(now, true, &mut outbox);
    assert_eq!(outbox.keepalives.len(), 3);
    assert_eq!(keepalive.deadline(), Some(now + Duration::from_secs(28)));
}

#[test]
fn test_keepalive_disabled() {
    let mut keepalive = KeepAlive::new(KeepAliveConfig::disabled());
    let mut outbox = Outbox::default();
    keepalive.start(SystemTime::UNIX_EPOCH, &mut outbox);
    assert!(outbox.is_empty());
    assert!(!keepalive.is_active());
}

#[test]
fn test_hold_location_mute_reason() {
    assert_eq!(HoldLocation::Local.mute_reason(), MuteReason::Hold);
    assert_eq!(HoldLocation::Remote.mute_reason(), MuteReason::Held);
    assert_eq!(HoldLocation::Dhv.mute_reason(), MuteReason::Dhv);
}
