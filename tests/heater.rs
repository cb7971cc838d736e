// Integration tests for the time-proportioning heater actuator

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{RecordingRelay, SlowRelay};
use sousvide_rs::control::{HeaterActuator, HeaterSettings, SharedValue};
use sousvide_rs::scheduler::{ManualClock, Worker};

const PERIOD: Duration = Duration::from_millis(200);

fn actuator(
    duty: f64,
    relay: &RecordingRelay,
    clock: &ManualClock,
) -> (HeaterActuator<RecordingRelay>, SharedValue) {
    let output = SharedValue::new(duty);
    let settings = HeaterSettings {
        period: PERIOD,
        half_cycle: Duration::from_millis(10),
    };
    let heater =
        HeaterActuator::new(relay.clone(), settings, output.clone(), Arc::new(clock.clone()))
            .unwrap();
    (heater, output)
}

#[test]
fn test_relay_forced_off_on_construction() {
    let relay = RecordingRelay::default();
    let clock = ManualClock::new();
    let (heater, _) = actuator(0.0, &relay, &clock);
    assert_eq!(relay.writes(), vec![false]);
    assert!(!heater.relay_on());
}

#[test]
fn test_half_duty_splits_period() {
    let relay = RecordingRelay::default();
    let clock = ManualClock::new();
    let (mut heater, _) = actuator(0.5, &relay, &clock);

    let budget = heater.run_period().unwrap();
    assert_eq!(budget.on, Duration::from_millis(100));
    assert_eq!(budget.off, Duration::from_millis(100));
    assert_eq!(relay.writes(), vec![false, true, false]);
    assert_eq!(clock.elapsed(), PERIOD);
    assert_eq!(heater.telemetry().total_on_time(), Duration::from_millis(100));
}

#[test]
fn test_full_duty_does_not_rewrite_relay() {
    let relay = RecordingRelay::default();
    let clock = ManualClock::new();
    let (mut heater, _) = actuator(1.0, &relay, &clock);

    heater.run_period().unwrap();
    heater.run_period().unwrap();
    assert_eq!(relay.writes(), vec![false, true]);
    let telemetry = heater.telemetry();
    assert!(telemetry.relay_on());
    assert_eq!(telemetry.periods(), 2);
    assert_eq!(telemetry.total_on_time(), 2 * PERIOD);
    assert_eq!(clock.elapsed(), 2 * PERIOD);
}

#[test]
fn test_duty_below_half_cycle_keeps_relay_off() {
    let relay = RecordingRelay::default();
    let clock = ManualClock::new();
    let (mut heater, _) = actuator(0.04, &relay, &clock);

    let budget = heater.run_period().unwrap();
    assert_eq!(budget.on, Duration::ZERO);
    assert_eq!(relay.writes(), vec![false]);
    assert_eq!(clock.elapsed(), PERIOD);
}

#[test]
fn test_out_of_range_duty_is_clamped() {
    let relay = RecordingRelay::default();
    let clock = ManualClock::new();
    let (mut heater, output) = actuator(-3.0, &relay, &clock);
    assert_eq!(heater.run_period().unwrap().on, Duration::ZERO);

    output.store(f64::NAN);
    assert_eq!(heater.run_period().unwrap().on, Duration::ZERO);

    output.store(12.0);
    assert_eq!(heater.run_period().unwrap().on, PERIOD);
}

#[test]
fn test_published_output_changes_next_period() {
    let relay = RecordingRelay::default();
    let clock = ManualClock::new();
    let (mut heater, output) = actuator(0.25, &relay, &clock);

    assert_eq!(heater.run_period().unwrap().on, Duration::from_millis(50));
    output.store(0.75);
    assert_eq!(heater.run_period().unwrap().on, Duration::from_millis(150));
    assert_eq!(heater.telemetry().last_on_time(), Duration::from_millis(150));
}

#[test]
fn test_shutdown_forces_off_even_when_already_off() {
    let relay = RecordingRelay::default();
    let clock = ManualClock::new();
    let (mut heater, _) = actuator(0.0, &relay, &clock);
    heater.shutdown().unwrap();
    assert_eq!(relay.writes(), vec![false, false]);
}

#[test]
fn test_run_loop_leaves_relay_off() {
    let relay = RecordingRelay::default();
    let clock = ManualClock::new();
    let (heater, _) = actuator(1.0, &relay, &clock);
    let telemetry = heater.telemetry();

    let mut worker = Worker::spawn("heater-test", move |stop| heater.run(stop)).unwrap();
    while telemetry.periods() < 3 {
        thread::sleep(Duration::from_millis(1));
    }
    worker.stop_and_join();

    assert_eq!(relay.writes().last(), Some(&false));
    assert!(!telemetry.relay_on());
}

#[test]
fn test_relay_write_latency_is_taken_out_of_the_sleep() {
    let clock = ManualClock::new();
    let relay = SlowRelay {
        inner: RecordingRelay::default(),
        clock: clock.clone(),
        latency: Duration::from_millis(3),
    };
    let output = SharedValue::new(0.5);
    let settings = HeaterSettings {
        period: PERIOD,
        half_cycle: Duration::from_millis(10),
    };
    let mut heater =
        HeaterActuator::new(relay.clone(), settings, output.clone(), Arc::new(clock.clone()))
            .unwrap();

    let start = clock.elapsed();
    let budget = heater.run_period().unwrap();
    assert_eq!(budget.on, Duration::from_millis(100));
    assert_eq!(relay.writes(), vec![false, true, false]);
    assert_eq!(clock.elapsed() - start, PERIOD);

    // Unchanged state: no write, no latency, the period is still exact
    output.store(0.0);
    let start = clock.elapsed();
    heater.run_period().unwrap();
    assert_eq!(relay.writes(), vec![false, true, false]);
    assert_eq!(clock.elapsed() - start, PERIOD);
}
