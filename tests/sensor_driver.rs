// Integration tests for the MAX31865 driver against a fake register file

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{FakeBus, FakeReady};
use sousvide_rs::calibration::{CalibrationTable, RtdParameters};
use sousvide_rs::hardware::{
    AcquisitionMode, ConversionMode, FaultThresholds, HardwareError, Max31865, NoiseFilter,
    ReadySignal, SensorConfig, SensorError, Wiring,
};
use sousvide_rs::scheduler::{Clock, ManualClock};

fn table() -> Arc<CalibrationTable> {
    Arc::new(
        CalibrationTable::build(&RtdParameters {
            r0: 1000.0,
            reference_resistance: 3600.0,
            temperature_min: 0.0,
            temperature_max: 100.0,
        })
        .unwrap(),
    )
}

fn polled_sensor(bus: &FakeBus, clock: &ManualClock) -> Max31865 {
    Max31865::new(
        Box::new(bus.clone()),
        AcquisitionMode::TimedPoll,
        SensorConfig::continuous(Wiring::FourWire, NoiseFilter::Hz50),
        table(),
        Arc::new(clock.clone()) as Arc<dyn Clock>,
    )
    .unwrap()
}

#[test]
fn test_bring_up_reads_thresholds_then_writes_and_verifies_config() {
    let bus = FakeBus::new();
    bus.set_register(3, 0xFF);
    bus.set_register(4, 0xFF);
    let clock = ManualClock::new();
    let sensor = polled_sensor(&bus, &clock);

    let frames = bus.frames();
    assert_eq!(frames[0], vec![0x03, 0, 0, 0, 0]);
    assert_eq!(frames[1], vec![0x80, 0xC2]);
    assert_eq!(frames[2], vec![0x00, 0]);
    assert_eq!(frames.len(), 3);

    // Fault-clear is self-clearing and not part of the cached value
    assert_eq!(sensor.configuration().unwrap(), 0xC0);
    assert_eq!(
        sensor.cached_fault_thresholds().unwrap(),
        FaultThresholds {
            high: 0xFFFF,
            low: 0
        }
    );
}

#[test]
fn test_verification_failure_disables_and_releases() {
    let bus = FakeBus::new();
    bus.state.lock().unwrap().stuck_config = Some(0x00);
    let clock = ManualClock::new();

    let result = Max31865::new(
        Box::new(bus.clone()),
        AcquisitionMode::TimedPoll,
        SensorConfig::continuous(Wiring::ThreeWire, NoiseFilter::Hz60),
        table(),
        Arc::new(clock),
    );
    match result {
        Err(SensorError::Verification { expected, actual }) => {
            assert_eq!(expected, 0xD1);
            assert_eq!(actual, 0x00);
        }
        other => panic!("expected a verification error, got {:?}", other),
    }
    assert!(bus.released());
}

#[test]
fn test_failed_bus_during_bring_up_is_released() {
    let bus = FakeBus::new();
    bus.state.lock().unwrap().fail_transfers = true;
    let ready = FakeReady::default();

    let result = Max31865::new(
        Box::new(bus.clone()),
        AcquisitionMode::DataReady(Box::new(ready.clone())),
        SensorConfig::continuous(Wiring::FourWire, NoiseFilter::Hz50),
        table(),
        Arc::new(ManualClock::new()),
    );
    assert!(matches!(result, Err(SensorError::Hardware(_))));
    assert!(bus.released());
    assert!(ready.released.load(std::sync::atomic::Ordering::SeqCst));
}

#[test]
fn test_timed_poll_reads_once_per_conversion_period() {
    let bus = FakeBus::new();
    let clock = ManualClock::new();
    let sensor = polled_sensor(&bus, &clock);

    bus.set_rtd(10377, false);
    let first = sensor.read_rtd().unwrap();
    assert!(first.fresh);
    assert_eq!(first.code, 10377);

    bus.set_rtd(10400, false);
    clock.advance(Duration::from_millis(20));
    let cached = sensor.read_rtd().unwrap();
    assert!(!cached.fresh);
    assert_eq!(cached.code, 10377);
    assert_eq!(bus.rtd_reads(), 1);

    clock.advance(Duration::from_millis(30));
    let second = sensor.read_rtd().unwrap();
    assert!(second.fresh);
    assert_eq!(second.code, 10400);
    assert_eq!(bus.rtd_reads(), 2);
}

#[test]
fn test_data_ready_gates_reads_and_is_cleared() {
    let bus = FakeBus::new();
    let ready = FakeReady::default();
    let sensor = Max31865::new(
        Box::new(bus.clone()),
        AcquisitionMode::DataReady(Box::new(ready.clone())),
        SensorConfig::continuous(Wiring::FourWire, NoiseFilter::Hz50),
        table(),
        Arc::new(ManualClock::new()),
    )
    .unwrap();

    bus.set_rtd(11000, false);
    let idle = sensor.read_rtd().unwrap();
    assert!(!idle.fresh);
    assert_eq!(idle.code, 0);
    assert_eq!(bus.rtd_reads(), 0);

    ready.raise();
    let reading = sensor.read_rtd().unwrap();
    assert!(reading.fresh);
    assert_eq!(reading.code, 11000);
    assert!(!ready.is_raised());
}

#[test]
fn test_fault_bit_and_status_decoding() {
    let bus = FakeBus::new();
    let clock = ManualClock::new();
    let sensor = polled_sensor(&bus, &clock);

    bus.set_rtd(10377, true);
    bus.set_register(7, 0b1000_0100);
    let reading = sensor.read_temperature().unwrap();
    assert!(reading.fault);
    assert!((reading.celsius - 36.03).abs() < 0.05);

    let status = sensor.fault_status().unwrap();
    assert!(status.rtd_high_threshold());
    assert!(status.overvoltage());
    assert!(!status.refin_low());
    assert!(!status.is_clear());
    assert_eq!(status.to_string(), "rtd-high,overvoltage");

    // A cached reading never repeats the fault flag
    let cached = sensor.read_temperature().unwrap();
    assert!(!cached.fault);
}

#[test]
fn test_threshold_writes_use_expected_frames() {
    let bus = FakeBus::new();
    let clock = ManualClock::new();
    let sensor = polled_sensor(&bus, &clock);
    bus.clear_frames();

    sensor
        .set_fault_thresholds(FaultThresholds {
            high: 0x1234,
            low: 0x5678,
        })
        .unwrap();
    sensor.set_fault_high_threshold(0xABCD).unwrap();
    sensor.set_fault_low_threshold(0x0102).unwrap();

    let frames = bus.frames();
    assert_eq!(frames[0], vec![0x83, 0x12, 0x34, 0x56, 0x78]);
    assert_eq!(frames[1], vec![0x83, 0xAB, 0xCD]);
    assert_eq!(frames[2], vec![0x85, 0x01, 0x02]);
    assert_eq!(
        sensor.fault_thresholds().unwrap(),
        FaultThresholds {
            high: 0xABCD,
            low: 0x0102
        }
    );
}

#[test]
fn test_conflicting_conversion_modes_rejected_before_bus_traffic() {
    let bus = FakeBus::new();
    let clock = ManualClock::new();
    let sensor = polled_sensor(&bus, &clock);
    bus.clear_frames();

    let mut config = SensorConfig::continuous(Wiring::FourWire, NoiseFilter::Hz50);
    config.one_shot = true;
    assert!(matches!(
        sensor.set_configuration(&config),
        Err(SensorError::ConflictingConversionModes)
    ));
    assert!(bus.frames().is_empty());
    assert_eq!(sensor.configuration().unwrap(), 0xC0);

    // One-shot from normally-off is fine
    config.conversion = ConversionMode::NormallyOff;
    sensor.set_configuration(&config).unwrap();
    assert_eq!(bus.frames()[0], vec![0x80, 0xA2]);
}

#[test]
fn test_read_configuration_returns_register() {
    let bus = FakeBus::new();
    let clock = ManualClock::new();
    let sensor = polled_sensor(&bus, &clock);
    assert_eq!(sensor.read_configuration().unwrap(), 0xC2);
}

#[test]
fn test_shutdown_is_idempotent_and_closes() {
    let bus = FakeBus::new();
    let clock = ManualClock::new();
    let sensor = polled_sensor(&bus, &clock);

    sensor.shutdown().unwrap();
    assert!(sensor.is_closed());
    assert!(bus.released());
    // Bias and conversions off
    assert_eq!(bus.register(0), 0x02);

    let frames_after_first = bus.frames().len();
    sensor.shutdown().unwrap();
    assert_eq!(bus.frames().len(), frames_after_first);
    assert!(matches!(sensor.read_rtd(), Err(SensorError::Closed)));
}

#[test]
fn test_convert_code_uses_table() {
    let bus = FakeBus::new();
    let clock = ManualClock::new();
    let sensor = polled_sensor(&bus, &clock);
    assert_eq!(sensor.convert_code(0), 0.0);
    assert_eq!(sensor.convert_code(0x7FFF), 100.0);
    assert_eq!(sensor.table().base(), 9103);
}

fn data_ready_sensor(bus: &FakeBus, ready: Box<dyn ReadySignal>, clock: &ManualClock) -> Max31865 {
    Max31865::new(
        Box::new(bus.clone()),
        AcquisitionMode::DataReady(ready),
        SensorConfig::continuous(Wiring::FourWire, NoiseFilter::Hz50),
        table(),
        Arc::new(clock.clone()),
    )
    .unwrap()
}

/// Ready line that fires after a fixed number of polls.
struct DelayedReady {
    polls_left: usize,
}

impl ReadySignal for DelayedReady {
    fn is_ready(&mut self) -> Result<bool, HardwareError> {
        if self.polls_left == 0 {
            return Ok(true);
        }
        self.polls_left -= 1;
        Ok(false)
    }

    fn clear(&mut self) -> Result<(), HardwareError> {
        Ok(())
    }

    fn release(&mut self) -> Result<(), HardwareError> {
        Ok(())
    }
}

#[test]
fn test_wait_for_reading_returns_first_conversion() {
    let bus = FakeBus::new();
    bus.set_rtd(10377, false);
    let clock = ManualClock::new();
    let sensor = data_ready_sensor(&bus, Box::new(DelayedReady { polls_left: 3 }), &clock);
    let before = clock.elapsed();

    let reading = sensor.wait_for_reading(Duration::from_millis(500)).unwrap();
    assert_eq!(reading.code, 10377);
    assert!((reading.celsius - 36.03).abs() < 0.05);
    assert_eq!(bus.rtd_reads(), 1);
    assert_eq!(clock.elapsed() - before, Duration::from_millis(15));

    // The cache now holds the real code
    assert_eq!(sensor.read_temperature().unwrap().code, 10377);
}

#[test]
fn test_wait_for_reading_times_out() {
    let bus = FakeBus::new();
    let clock = ManualClock::new();
    let sensor = data_ready_sensor(&bus, Box::new(FakeReady::default()), &clock);
    let before = clock.elapsed();

    let result = sensor.wait_for_reading(Duration::from_millis(100));
    assert!(matches!(result, Err(SensorError::NoConversion(_))));
    assert_eq!(clock.elapsed() - before, Duration::from_millis(100));
    assert_eq!(bus.rtd_reads(), 0);
}

#[test]
fn test_concurrent_readers_consume_each_conversion_once() {
    const CONVERSIONS: u16 = 200;
    let bus = FakeBus::new();
    let ready = FakeReady::default();
    let clock = ManualClock::new();
    let sensor = Arc::new(data_ready_sensor(&bus, Box::new(ready.clone()), &clock));
    bus.clear_frames();

    // Codes whose two bytes differ, so a mixed word would show up
    let codes: Vec<u16> = (1..=CONVERSIONS).map(|k| 0x2000 + k * 0x41).collect();
    let valid: HashSet<u16> = codes.iter().copied().chain([0]).collect();
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|i| {
            let sensor = sensor.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                let mut fresh = Vec::new();
                while !done.load(Ordering::SeqCst) {
                    let reading = if i % 2 == 0 {
                        let r = sensor.read_rtd().unwrap();
                        (r.code, r.fresh)
                    } else {
                        let t = sensor.read_temperature().unwrap();
                        (t.code, false)
                    };
                    seen.push(reading.0);
                    if reading.1 {
                        fresh.push(reading.0);
                    }
                }
                (seen, fresh)
            })
        })
        .collect();

    let deadline = Instant::now() + Duration::from_secs(10);
    for &code in &codes {
        bus.set_rtd(code, false);
        ready.raise();
        while ready.is_raised() {
            assert!(Instant::now() < deadline, "conversion {} never consumed", code);
            thread::yield_now();
        }
    }
    done.store(true, Ordering::SeqCst);

    let mut fresh_codes = Vec::new();
    for reader in readers {
        let (seen, fresh) = reader.join().unwrap();
        for code in seen {
            assert!(valid.contains(&code), "torn code {:#06x}", code);
        }
        fresh_codes.extend(fresh);
    }

    assert_eq!(bus.rtd_reads(), usize::from(CONVERSIONS));
    // Odd readers go through read_temperature and do not report freshness,
    // so only even readers' fresh codes are counted; none may repeat
    let unique: HashSet<u16> = fresh_codes.iter().copied().collect();
    assert_eq!(unique.len(), fresh_codes.len());
    assert_eq!(sensor.read_rtd().unwrap().code, *codes.last().unwrap());
}
