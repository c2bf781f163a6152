use crate::drift::{DriftTracker, SharedRate};

const FRAMES: u32 = 512;

/// Feed `count` callbacks at an exact `rate`, starting at `start_s` seconds.
/// Returns the time of the next tick so runs can be chained.
fn feed(dll: &mut DriftTracker, rate: f64, count: usize, start_s: f64) -> f64 {
    let mut t = start_s;
    for _ in 0..count {
        dll.update((t * 1e9) as u64, FRAMES);
        t += f64::from(FRAMES) / rate;
    }
    t
}

fn relative_error(dll: &DriftTracker, rate: f64) -> f64 {
    (dll.rate() - rate).abs() / rate
}

#[test]
fn converges_to_exact_nominal_rate() {
    let mut dll = DriftTracker::new(48000.0);
    feed(&mut dll, 48000.0, 60, 1.0);
    assert!(dll.is_stable());
    assert!(
        relative_error(&dll, 48000.0) < 1e-3,
        "rate {} after stabilization",
        dll.rate()
    );

    let mut dll = DriftTracker::new(48000.0);
    feed(&mut dll, 48000.0, 300, 1.0);
    assert!(relative_error(&dll, 48000.0) < 1e-5, "rate {}", dll.rate());
}

#[test]
fn converges_to_off_nominal_rate() {
    // 1% fast: the worst drift the pipeline is expected to absorb.
    let mut dll = DriftTracker::new(48000.0);
    feed(&mut dll, 48480.0, 500, 1.0);
    assert!(
        relative_error(&dll, 48480.0) < 1e-3,
        "rate {} tracking 48480",
        dll.rate()
    );
}

#[test]
fn reconverges_after_rate_step() {
    let mut dll = DriftTracker::new(48000.0);
    let t = feed(&mut dll, 48000.0, 500, 1.0);
    assert!(relative_error(&dll, 48000.0) < 1e-3);

    feed(&mut dll, 48100.0, 500, t);
    assert!(
        relative_error(&dll, 48100.0) < 1e-3,
        "rate {} after step to 48100",
        dll.rate()
    );
}

#[test]
fn stability_gate_holds_through_warmup() {
    let mut dll = DriftTracker::new(48000.0);
    assert!(!dll.is_stable());

    // First update seeds; the next fifty only count toward stability.
    let t = feed(&mut dll, 48000.0, 51, 1.0);
    assert!(!dll.is_stable(), "must not report stable within 50 updates");

    feed(&mut dll, 48000.0, 1, t);
    assert!(dll.is_stable());
}

#[test]
fn reset_returns_to_uninitialized() {
    let mut dll = DriftTracker::new(48000.0);
    feed(&mut dll, 48123.0, 200, 1.0);
    assert!(dll.is_stable());

    dll.reset();
    assert!(!dll.is_stable());
    assert_eq!(dll.rate(), 48000.0);

    // Reconvergence after reset behaves like a fresh tracker.
    feed(&mut dll, 48000.0, 60, 99.0);
    assert!(dll.is_stable());
    assert!(relative_error(&dll, 48000.0) < 1e-3);
}

#[test]
fn outlier_does_not_require_reset() {
    let mut dll = DriftTracker::new(48000.0);
    let t = feed(&mut dll, 48000.0, 200, 1.0);

    // One wildly late timestamp (5 ms of scheduling noise).
    dll.update(((t + 0.005) * 1e9) as u64, FRAMES);

    let t = t + f64::from(FRAMES) / 48000.0;
    feed(&mut dll, 48000.0, 300, t);
    assert!(relative_error(&dll, 48000.0) < 1e-3, "rate {}", dll.rate());
}

#[test]
fn shared_rate_mirrors_publisher() {
    let shared = SharedRate::new(48000.0);
    assert_eq!(shared.rate(), 48000.0);
    assert!(!shared.is_stable());

    shared.publish(48123.5, true);
    assert_eq!(shared.rate(), 48123.5);
    assert!(shared.is_stable());
}
