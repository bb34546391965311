use rill_utils::{Smoother, SmootherConfig};

#[test]
fn clock_is_frozen_while_paused() {
    let mut s = Smoother::new(SmootherConfig::default());
    s.put(0, 0);

    assert_eq!(s.get(1_000), 1_000);

    s.pause(2_000);
    assert!(s.is_paused());
    assert_eq!(s.get(5_000), 2_000);

    // continues from where it stopped, not from the wall clock
    s.resume(5_000);
    assert_eq!(s.get(6_000), 3_000);
}

#[test]
fn monotonic_clock_holds_still_on_a_regressing_sample() {
    let mut s = Smoother::new(SmootherConfig::default());
    s.put(0, 0);
    assert_eq!(s.get(10_000), 10_000);

    s.put(10_000, 0);

    let mut last = 10_000;
    for x in [10_000, 20_000, 500_000, 2_000_000] {
        let y = s.get(x);
        assert!(y >= last, "went back from {last} to {y} at {x}");
        last = y;
    }
    assert_eq!(s.get(20_000), 10_000);
}

#[test]
fn unconstrained_clock_follows_the_samples_down() {
    let mut s = Smoother::new(SmootherConfig {
        monotonic: false,
        ..SmootherConfig::default()
    });
    s.put(0, 0);
    s.put(10_000, 0);

    assert_eq!(s.get(2_000_000), 0);
}

#[test]
fn time_offset_shifts_local_time() {
    let mut s = Smoother::new(SmootherConfig::default());
    s.set_time_offset(1_000_000);
    s.put(1_000_000, 0);

    assert_eq!(s.get(1_250_000), 250_000);

    s.reset(2_000_000, true);
    assert_eq!(s.get(3_000_000), 0);
    assert!(s.is_paused());
}
