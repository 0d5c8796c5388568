//! Rate limiting tests
//!
//! Run with: cargo test --test rate_limit_test

use std::time::{Duration, Instant};
use tradenet::net::rate_limit::{InboundThrottle, LogThrottle, OutboundThrottle};

// =============================================================================
// OUTBOUND THROTTLE TESTS
// =============================================================================

#[test]
fn test_outbound_burst_spaced_by_sleep() {
    let trigger = Duration::from_millis(20);
    let sleep = Duration::from_millis(50);
    let mut throttle = OutboundThrottle::new(trigger, sleep);
    let start = Instant::now();

    // Sends requested 5 ms apart
    let mut total = Duration::ZERO;
    for i in 0..3u64 {
        let requested = start + Duration::from_millis(5 * i);
        let now = requested.max(start + total);
        let delay = throttle.reserve_at(now);
        if i == 0 {
            assert_eq!(delay, Duration::ZERO);
        } else {
            assert_eq!(delay, sleep);
        }
        total = now.saturating_duration_since(start) + delay;
    }

    // Every send after the first waited 50 ms
    assert!(total >= Duration::from_millis(100));
}

#[test]
fn test_outbound_spaced_sends_not_delayed() {
    let mut throttle = OutboundThrottle::new(Duration::from_millis(20), Duration::from_millis(50));
    let start = Instant::now();
    assert_eq!(throttle.reserve_at(start), Duration::ZERO);
    assert_eq!(
        throttle.reserve_at(start + Duration::from_millis(25)),
        Duration::ZERO
    );
    assert_eq!(
        throttle.reserve_at(start + Duration::from_millis(30)),
        Duration::from_millis(50)
    );
}

// =============================================================================
// INBOUND THROTTLE TESTS
// =============================================================================

#[test]
fn test_inbound_per_second_one_report_per_batch() {
    let mut throttle = InboundThrottle::new(200, 1000);
    let start = Instant::now();

    // 250 messages inside one second: exactly one breach
    let breaches = (0..250u64)
        .filter(|i| throttle.record_at(start + Duration::from_micros(i * 100)))
        .count();
    assert_eq!(breaches, 1);
}

#[test]
fn test_inbound_per_second_two_batches() {
    let mut throttle = InboundThrottle::new(10, 1000);
    let start = Instant::now();

    // 11th message breaches, window restarts, 22nd breaches again
    let breaching: Vec<u64> = (0..25u64)
        .filter(|i| throttle.record_at(start + Duration::from_millis(*i)))
        .collect();
    assert_eq!(breaching, vec![10, 21]);
}

#[test]
fn test_inbound_per_ten_seconds() {
    let mut throttle = InboundThrottle::new(200, 1000);
    let start = Instant::now();

    // 150 per second stays under the 1 s ceiling but crosses 1000 in 10 s
    let mut first_breach = None;
    for i in 0..1500u64 {
        let at = start + Duration::from_micros(i * 1_000_000 / 150);
        if throttle.record_at(at) {
            first_breach = Some(i);
            break;
        }
    }
    assert_eq!(first_breach, Some(1000));
}

#[test]
fn test_inbound_under_limits() {
    let mut throttle = InboundThrottle::new(200, 1000);
    let start = Instant::now();
    // 50 per second for 20 seconds
    for i in 0..1000u64 {
        assert!(!throttle.record_at(start + Duration::from_millis(i * 20)));
    }
}

// =============================================================================
// LOG THROTTLE TESTS
// =============================================================================

#[test]
fn test_log_throttle_counts_suppressed() {
    let throttle = LogThrottle::new(Duration::from_secs(30));
    let start = Instant::now();

    assert_eq!(throttle.permit_at(start), Some(0));
    for i in 1..=5 {
        assert_eq!(throttle.permit_at(start + Duration::from_secs(i)), None);
    }
    assert_eq!(throttle.permit_at(start + Duration::from_secs(31)), Some(5));
    assert_eq!(throttle.permit_at(start + Duration::from_secs(32)), None);
}
