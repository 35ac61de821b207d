mod common;

use std::time::{Duration, Instant};

use common::{assert_stream_shape, init_logging, logic_samples, record, Seen};
use labfeed_rs::drivers::fx2lafw::{Fx2Config, Fx2lafw, SAMPLERATES};
use labfeed_rs::usb::sim::{SimDevice, SimUsb};
use labfeed_rs::{
    ConfigKey, ConfigValue, DeviceInstance, DeviceStatus, DriverHandle, LabError, Session,
};

const SALEAE: (u16, u16) = (0x0925, 0x3881);

fn fast_config() -> Fx2Config {
    Fx2Config::default().with_renumeration(
        Duration::from_millis(300),
        Duration::from_millis(5),
        Duration::from_millis(20),
    )
}

fn driver(usb: &SimUsb, config: Fx2Config) -> DriverHandle {
    let handle = DriverHandle::new(Fx2lafw::new(Box::new(usb.clone()), config));
    handle.init().unwrap();
    handle
}

fn open_one(fx: &DriverHandle) -> DeviceInstance {
    let dev = fx.scan(&[]).unwrap().remove(0);
    fx.dev_open(&dev).unwrap();
    dev
}

fn set_limit(fx: &DriverHandle, dev: &DeviceInstance, limit: u64) {
    fx.config_set(ConfigKey::LimitSamples, &ConfigValue::UInt64(limit), dev)
        .unwrap();
}

#[test]
fn test_untriggered_run_delivers_exactly_the_limit() {
    init_logging();
    let usb = SimUsb::new();
    let slot = usb.plug(SimDevice::fx2lafw(SALEAE.0, SALEAE.1).with_endless(vec![0x55, 0xaa]));
    let fx = driver(&usb, fast_config());
    let dev = open_one(&fx);
    fx.config_set(ConfigKey::Samplerate, &ConfigValue::UInt64(1_000_000), &dev)
        .unwrap();
    set_limit(&fx, &dev, 100);

    let mut session = Session::new();
    session.dev_add(&dev).unwrap();
    let log = record(&mut session, &dev);
    session.start().unwrap();
    session.run().unwrap();

    let log = log.borrow();
    assert_stream_shape(&log);
    assert!(!log.contains(&Seen::Trigger));
    assert_eq!(
        log[0],
        Seen::Header {
            samplerate: 1_000_000,
            num_logic: 8
        }
    );
    assert_eq!(logic_samples(&log), 100);
    // 1 MHz on the 48 MHz clock: divider 47.
    assert_eq!(usb.start_commands(slot), vec![vec![0x40, 0x00, 47]]);
}

#[test]
fn test_single_stage_trigger_skips_pre_trigger_data() {
    init_logging();
    let mut stream = vec![0x00; 20];
    stream.push(0xff);
    stream.extend([0xaa; 10]);
    let usb = SimUsb::new();
    usb.plug(SimDevice::fx2lafw(SALEAE.0, SALEAE.1).with_chunks([stream]));
    let fx = driver(&usb, fast_config());
    let dev = open_one(&fx);
    dev.probe_set_trigger(0, Some("1")).unwrap();
    set_limit(&fx, &dev, 11);

    let mut session = Session::new();
    session.dev_add(&dev).unwrap();
    let log = record(&mut session, &dev);
    session.start().unwrap();
    session.run().unwrap();

    let log = log.borrow();
    assert_stream_shape(&log);
    assert_eq!(
        log[2..],
        [
            Seen::Trigger,
            Seen::Logic {
                unitsize: 1,
                data: vec![0xff]
            },
            Seen::Logic {
                unitsize: 1,
                data: vec![0xaa; 10]
            },
            Seen::End,
        ]
    );
}

#[test]
fn test_stop_drains_in_flight_transfers_and_ends_once() {
    init_logging();
    let usb = SimUsb::new();
    let slot = usb.plug(SimDevice::fx2lafw(SALEAE.0, SALEAE.1).with_endless(vec![1, 2, 3, 4]));
    let fx = driver(&usb, fast_config().with_num_transfers(4));
    let dev = open_one(&fx);

    let mut session = Session::new();
    session.dev_add(&dev).unwrap();
    let log = record(&mut session, &dev);
    session.start().unwrap();

    while logic_samples(&log.borrow()) == 0 {
        assert!(!session.run_once(Some(Duration::from_millis(100))).unwrap());
    }
    session.halt();
    session.halt();
    let delivered = logic_samples(&log.borrow());

    let deadline = Instant::now() + Duration::from_secs(5);
    while !session.run_once(Some(Duration::from_millis(100))).unwrap() {
        assert!(Instant::now() < deadline, "acquisition never ended");
    }
    session.halt();
    session.stop().unwrap();

    let log = log.borrow();
    assert_stream_shape(&log);
    assert_eq!(logic_samples(&log), delivered);
    assert_eq!(usb.in_flight(slot), 0);
    assert!(!session.is_running());
}

#[test]
fn test_close_mid_run_still_ends_the_stream() {
    init_logging();
    let usb = SimUsb::new();
    let slot = usb.plug(SimDevice::fx2lafw(SALEAE.0, SALEAE.1).with_endless(vec![0x3c]));
    let fx = driver(&usb, fast_config().with_num_transfers(4));
    let dev = open_one(&fx);

    let mut session = Session::new();
    session.dev_add(&dev).unwrap();
    let log = record(&mut session, &dev);
    session.start().unwrap();
    while logic_samples(&log.borrow()) == 0 {
        assert!(!session.run_once(Some(Duration::from_millis(100))).unwrap());
    }

    fx.dev_close(&dev).unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while !session.run_once(Some(Duration::from_millis(100))).unwrap() {
        assert!(Instant::now() < deadline, "no End after closing the device");
    }
    session.stop().unwrap();
    assert_stream_shape(&log.borrow());
    assert_eq!(usb.in_flight(slot), 0);
    assert_eq!(dev.status(), DeviceStatus::Inactive);

    // The finished run does not block the next one.
    fx.dev_open(&dev).unwrap();
    set_limit(&fx, &dev, 10);
    let mut session = Session::new();
    session.dev_add(&dev).unwrap();
    let log = record(&mut session, &dev);
    session.start().unwrap();
    session.run().unwrap();
    assert_stream_shape(&log.borrow());
    assert_eq!(logic_samples(&log.borrow()), 10);
}

#[test]
fn test_rejected_resubmission_shrinks_the_pool() {
    init_logging();
    let usb = SimUsb::new();
    // Two of the first four replacements are refused.
    let slot = usb.plug(
        SimDevice::fx2lafw(SALEAE.0, SALEAE.1)
            .with_endless(vec![0x81])
            .reject_submissions_after(6, 2),
    );
    let fx = driver(
        &usb,
        fast_config()
            .with_num_transfers(4)
            .with_transfer_sizes(16, 16),
    );
    let dev = open_one(&fx);
    set_limit(&fx, &dev, 200);

    let mut session = Session::new();
    session.dev_add(&dev).unwrap();
    let log = record(&mut session, &dev);
    session.start().unwrap();
    session.run().unwrap();

    let log = log.borrow();
    assert_stream_shape(&log);
    assert_eq!(logic_samples(&log), 200);
    assert!(usb.submissions(slot) > 6);
    assert_eq!(usb.in_flight(slot), 0);
}

#[test]
fn test_device_giving_up_ends_the_run_short() {
    init_logging();
    let usb = SimUsb::new();
    usb.plug(SimDevice::fx2lafw(SALEAE.0, SALEAE.1).with_chunks([vec![0x0f; 100]]));
    let fx = driver(
        &usb,
        fast_config()
            .with_num_transfers(4)
            .with_max_empty_transfers(6),
    );
    let dev = open_one(&fx);
    set_limit(&fx, &dev, 1000);

    let mut session = Session::new();
    session.dev_add(&dev).unwrap();
    let log = record(&mut session, &dev);
    session.start().unwrap();
    session.run().unwrap();

    let log = log.borrow();
    assert_stream_shape(&log);
    assert_eq!(logic_samples(&log), 100);
}

#[test]
fn test_sixteen_probes_use_wide_samples() {
    init_logging();
    let usb = SimUsb::new();
    let slot = usb.plug(SimDevice::fx2lafw(0x04b4, 0x8613).with_endless(vec![0x01, 0x80]));
    let fx = driver(&usb, fast_config().with_num_transfers(4));
    let dev = open_one(&fx);
    set_limit(&fx, &dev, 50);

    let mut session = Session::new();
    session.dev_add(&dev).unwrap();
    let log = record(&mut session, &dev);
    session.start().unwrap();
    session.run().unwrap();

    let log = log.borrow();
    assert_stream_shape(&log);
    assert_eq!(logic_samples(&log), 50);
    assert!(log.iter().all(|s| match s {
        Seen::Logic { unitsize, data } => *unitsize == 2 && data.starts_with(&[0x01, 0x80]),
        _ => true,
    }));
    // 20 kHz needs the 30 MHz clock.
    assert_eq!(usb.start_commands(slot), vec![vec![0x20, 0x05, 0xdb]]);
}

#[test]
fn test_odd_length_transfers_keep_wide_samples_aligned() {
    init_logging();
    let usb = SimUsb::new();
    usb.plug(
        SimDevice::fx2lafw(0x04b4, 0x8613)
            .with_chunks([vec![0x01, 0x80, 0x02], vec![0x80, 0x03, 0x80]]),
    );
    let fx = driver(&usb, fast_config().with_num_transfers(4));
    let dev = open_one(&fx);
    set_limit(&fx, &dev, 3);

    let mut session = Session::new();
    session.dev_add(&dev).unwrap();
    let log = record(&mut session, &dev);
    session.start().unwrap();
    session.run().unwrap();

    let log = log.borrow();
    assert_stream_shape(&log);
    let bytes: Vec<u8> = log
        .iter()
        .filter_map(|s| match s {
            Seen::Logic { data, .. } => Some(data.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(bytes, [0x01, 0x80, 0x02, 0x80, 0x03, 0x80]);
}

#[test]
fn test_rejected_initial_submission_fails_start() {
    init_logging();
    let usb = SimUsb::new();
    let slot = usb.plug(
        SimDevice::fx2lafw(SALEAE.0, SALEAE.1)
            .reject_submissions(1)
            .with_endless(vec![0]),
    );
    let fx = driver(&usb, fast_config());
    let dev = open_one(&fx);

    let mut session = Session::new();
    session.dev_add(&dev).unwrap();
    assert!(session.start().is_err());
    assert!(!session.is_running());
    assert_eq!(usb.in_flight(slot), 0);
}

#[test]
fn test_unplug_mid_run_still_ends() {
    init_logging();
    let usb = SimUsb::new();
    let slot = usb.plug(SimDevice::fx2lafw(SALEAE.0, SALEAE.1).with_endless(vec![9]));
    let fx = driver(&usb, fast_config().with_num_transfers(2));
    let dev = open_one(&fx);

    let mut session = Session::new();
    session.dev_add(&dev).unwrap();
    let log = record(&mut session, &dev);
    session.start().unwrap();
    session.run_once(Some(Duration::from_millis(100))).unwrap();
    usb.unplug(slot);
    session.run().unwrap();
    assert_stream_shape(&log.borrow());
}

#[test]
fn test_open_waits_for_renumeration() {
    init_logging();
    let firmware_dir = tempfile::tempdir().unwrap();
    let image = vec![0x02, 0x00, 0x06, 0x12, 0x34];
    std::fs::write(firmware_dir.path().join("fx2lafw-saleae-logic.fw"), &image).unwrap();

    let usb = SimUsb::new();
    let slot = usb.plug(SimDevice::new(SALEAE.0, SALEAE.1).renumerate_after(4));
    let fx = driver(&usb, fast_config().with_firmware_dir(firmware_dir.path()));
    let dev = fx.scan(&[]).unwrap().remove(0);
    assert_eq!(dev.status(), DeviceStatus::Inactive);
    assert_eq!(usb.firmware(slot), image);

    let started = Instant::now();
    fx.dev_open(&dev).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(20));
    assert!(dev.is_active());
    assert!(usb.is_claimed(slot));
}

#[test]
fn test_open_times_out_when_device_never_returns() {
    init_logging();
    let firmware_dir = tempfile::tempdir().unwrap();
    std::fs::write(firmware_dir.path().join("fx2lafw-saleae-logic.fw"), [0x02]).unwrap();

    let usb = SimUsb::new();
    usb.plug(SimDevice::new(SALEAE.0, SALEAE.1).never_renumerate());
    let config = fast_config()
        .with_firmware_dir(firmware_dir.path())
        .with_renumeration(
            Duration::from_millis(60),
            Duration::from_millis(5),
            Duration::from_millis(1),
        );
    let fx = driver(&usb, config);
    let dev = fx.scan(&[]).unwrap().remove(0);

    assert!(matches!(
        fx.dev_open(&dev),
        Err(LabError::Timeout { duration_ms: 60 })
    ));
    assert_eq!(dev.status(), DeviceStatus::Inactive);
}

#[test]
fn test_close_twice_is_fine() {
    let usb = SimUsb::new();
    usb.plug(SimDevice::fx2lafw(SALEAE.0, SALEAE.1));
    let fx = driver(&usb, fast_config());
    let dev = open_one(&fx);
    fx.dev_close(&dev).unwrap();
    fx.dev_close(&dev).unwrap();
    assert_eq!(dev.status(), DeviceStatus::Inactive);
}

#[test]
fn test_every_listed_samplerate_reads_back() {
    let usb = SimUsb::new();
    usb.plug(SimDevice::fx2lafw(SALEAE.0, SALEAE.1));
    let fx = driver(&usb, fast_config());
    let dev = open_one(&fx);
    let ConfigValue::UInt64List(rates) = fx.config_list(ConfigKey::Samplerate, Some(&dev)).unwrap()
    else {
        unreachable!("samplerates are a list");
    };
    assert_eq!(rates, SAMPLERATES);
    for rate in rates {
        fx.config_set(ConfigKey::Samplerate, &ConfigValue::UInt64(rate), &dev)
            .unwrap();
        assert_eq!(
            fx.config_get(ConfigKey::Samplerate, Some(&dev)).unwrap(),
            ConfigValue::UInt64(rate)
        );
    }
}
