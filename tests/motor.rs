// Integration tests for the stirring motor duty-cycle sink

mod common;

use common::{PwmWrite, RecordingPwm};
use sousvide_rs::control::{ControlError, Motor};

fn motor(range: u32) -> (Motor<RecordingPwm>, RecordingPwm) {
    let pwm = RecordingPwm::default();
    let motor = Motor::new(pwm.clone(), range).unwrap();
    pwm.clear();
    (motor, pwm)
}

#[test]
fn test_new_motor_is_stopped_and_zeroed() {
    let pwm = RecordingPwm::default();
    let motor = Motor::new(pwm.clone(), 1000).unwrap();
    assert!(!motor.is_running());
    assert_eq!(motor.duty_cycle(), 0);
    assert_eq!(
        pwm.writes(),
        vec![PwmWrite::Enabled(false), PwmWrite::Range(1000), PwmWrite::Data(0)]
    );
}

#[test]
fn test_range_must_exceed_ten() {
    assert!(matches!(
        Motor::new(RecordingPwm::default(), 10),
        Err(ControlError::InvalidRange(10))
    ));
    let (mut motor, _) = motor(100);
    assert!(motor.set_range(5).is_err());
    assert_eq!(motor.range(), 100);
}

#[test]
fn test_duty_cycle_is_clamped_and_only_written_while_running() {
    let (mut motor, pwm) = motor(100);
    assert_eq!(motor.set_duty_cycle(250).unwrap(), 100);
    assert!(pwm.writes().is_empty());

    motor.start().unwrap();
    assert_eq!(pwm.writes(), vec![PwmWrite::Data(100), PwmWrite::Enabled(true)]);

    pwm.clear();
    motor.decrease_duty_cycle(30).unwrap();
    motor.decrease_duty_cycle(500).unwrap();
    assert_eq!(pwm.writes(), vec![PwmWrite::Data(70), PwmWrite::Data(0)]);
    assert_eq!(motor.percentage(), 0.0);
}

#[test]
fn test_shrinking_range_writes_data_first() {
    let (mut motor, pwm) = motor(1000);
    motor.set_duty_cycle(500).unwrap();
    motor.start().unwrap();
    pwm.clear();

    motor.set_range(100).unwrap();
    assert_eq!(pwm.writes(), vec![PwmWrite::Data(50), PwmWrite::Range(100)]);
    assert_eq!(motor.duty_cycle(), 50);
    assert!((motor.percentage() - 0.5).abs() < 1e-12);
}

#[test]
fn test_growing_range_writes_range_first() {
    let (mut motor, pwm) = motor(100);
    motor.set_duty_cycle(25).unwrap();
    motor.start().unwrap();
    pwm.clear();

    motor.set_range(400).unwrap();
    assert_eq!(pwm.writes(), vec![PwmWrite::Range(400), PwmWrite::Data(100)]);
}

#[test]
fn test_stopped_motor_defers_range_until_start() {
    let (mut motor, pwm) = motor(100);
    motor.set_duty_cycle(60).unwrap();
    motor.set_range(200).unwrap();
    assert!(pwm.writes().is_empty());
    assert_eq!(motor.duty_cycle(), 120);

    motor.start().unwrap();
    assert_eq!(
        pwm.writes(),
        vec![PwmWrite::Range(200), PwmWrite::Data(120), PwmWrite::Enabled(true)]
    );

    pwm.clear();
    motor.stop().unwrap();
    motor.stop().unwrap();
    assert_eq!(pwm.writes(), vec![PwmWrite::Enabled(false)]);
}

#[test]
fn test_shutdown_zeroes_disables_and_releases_once() {
    let (mut motor, pwm) = motor(100);
    motor.set_duty_cycle(80).unwrap();
    motor.start().unwrap();
    pwm.clear();

    motor.shutdown().unwrap();
    motor.shutdown().unwrap();
    assert_eq!(
        pwm.writes(),
        vec![PwmWrite::Data(0), PwmWrite::Enabled(false), PwmWrite::Release]
    );
    assert!(!motor.is_running());
    assert_eq!(motor.duty_cycle(), 0);

    drop(motor);
    assert_eq!(pwm.writes().len(), 3);
}

#[test]
fn test_drop_releases_pwm() {
    let (motor, pwm) = motor(100);
    drop(motor);
    assert_eq!(pwm.writes().last(), Some(&PwmWrite::Release));
}
