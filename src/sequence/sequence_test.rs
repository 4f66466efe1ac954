use super::*;

#[test]
fn test_is_ahead_across_wrap() {
    assert!(is_ahead(3, 65534), "3 follows 65534 after the wrap");
    assert!(!is_ahead(65534, 3));
    assert!(is_ahead(101, 100));
    assert!(!is_ahead(100, 100));
    assert!(!is_ahead(100, 101));
}

#[test]
fn test_forward_distance() {
    assert_eq!(forward_distance(65534, 3), 5);
    assert_eq!(forward_distance(10, 12), 2);
    assert_eq!(forward_distance(12, 10), 65534);
}

#[test]
fn test_seq_distance() {
    let tests = vec![(0u16, 0u16, 0u16), (1, 0, 1), (0, 1, 1), (65535, 0, 1), (0, 65535, 1), (100, 65500, 136)];
    for (x, y, want) in tests {
        assert_eq!(seq_distance(x, y), want, "distance({x}, {y})");
    }
}

#[test]
fn test_in_wrap_window() {
    assert!(in_wrap_window(0x0003, 0xfffe));
    assert!(in_wrap_window(0x00ff, 0xff00));
    assert!(!in_wrap_window(0x0100, 0xfffe));
    assert!(!in_wrap_window(0x0003, 0xfeff));
}

#[test]
fn test_packets_skipped() {
    assert_eq!(packets_skipped(100, 105), 5);
    assert_eq!(packets_skipped(65534, 1), 3);
    assert_eq!(packets_skipped(7, 7), 0);
}

#[test]
fn test_packets_received_span() {
    assert_eq!(packets_received_span(10, 20), 10);
    assert_eq!(packets_received_span(65530, 4), 10);
}

#[test]
fn test_counts_at_the_rollover_match_the_unwrapped_distance() {
    // 65535 is skipped when 0 is found next
    assert_eq!(packets_skipped(65535, 0), 1);
    assert_eq!(packets_skipped(65535, 0), packets_skipped(65534, 65535));
    assert_eq!(packets_received_span(65535, 0), 1);
    assert_eq!(packets_received_span(65535, 0), packets_received_span(65534, 65535));
    assert_eq!(packets_received_span(0, 65535), 65535);
}

#[test]
fn test_extended_sequence_monotonic_through_wrap() {
    let mut tracker = ExtendedSequenceTracker::new();
    let mut last = 0u32;
    let mut sn = 65000u16;
    for _ in 0..2000 {
        let ext = tracker.extend(1, sn);
        assert!(ext > last, "ext {ext} after {last} for sn {sn}");
        last = ext;
        sn = sn.wrapping_add(1);
    }
    assert_eq!(last, 0x2_0000 | sn.wrapping_sub(1) as u32);
}

#[test]
fn test_extended_sequence_late_packet_before_wrap() {
    let mut tracker = ExtendedSequenceTracker::new();
    assert_eq!(tracker.extend(7, 65534), 0x1_fffe);
    assert_eq!(tracker.extend(7, 1), 0x2_0001);
    // 65535 shows up after the wrap was detected
    assert_eq!(tracker.extend(7, 65535), 0x1_ffff);
    assert_eq!(tracker.extend(7, 0), 0x2_0000);
    assert_eq!(tracker.extend(7, 2), 0x2_0002);
}

#[test]
fn test_extended_sequence_reordered_within_cycle() {
    let mut tracker = ExtendedSequenceTracker::new();
    assert_eq!(tracker.extend(1, 100), 0x1_0064);
    assert_eq!(tracker.extend(1, 102), 0x1_0066);
    assert_eq!(tracker.extend(1, 101), 0x1_0065);
}

#[test]
fn test_extended_sequence_per_ssrc() {
    let mut tracker = ExtendedSequenceTracker::new();
    tracker.extend(1, 65535);
    tracker.extend(1, 0);
    assert_eq!(tracker.extend(2, 5), 0x1_0005);
    assert_eq!(tracker.extend(1, 5), 0x2_0005);
    assert_eq!(tracker.len(), 2);

    tracker.forget(1);
    assert_eq!(tracker.extend(1, 5), 0x1_0005);
}

#[test]
fn test_extended_sequence_never_zero() {
    let mut tracker = ExtendedSequenceTracker::new();
    assert_ne!(tracker.extend(9, 0), 0);
    assert_ne!(tracker.extend(9, 0xfff0), 0);
}
