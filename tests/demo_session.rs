mod common;

use common::{assert_stream_shape, init_logging, logic_samples, record, Seen};
use labfeed_rs::capture::TIME_COLUMN_NAME;
use labfeed_rs::{
    ConfigKey, ConfigOption, ConfigValue, DeviceInstance, DeviceStatus, DriverHandle,
    DriverRegistry, LabError, LogicCapture, ProbeKind, Session,
};

fn demo() -> DriverHandle {
    let demo = DriverRegistry::with_defaults().create("demo").unwrap();
    demo.init().unwrap();
    demo
}

fn open(demo: &DriverHandle, options: &[ConfigOption]) -> DeviceInstance {
    let dev = demo.scan(options).unwrap().remove(0);
    demo.dev_open(&dev).unwrap();
    demo.config_set(ConfigKey::Samplerate, &ConfigValue::UInt64(1_000_000), &dev)
        .unwrap();
    dev
}

#[test]
fn test_two_probe_run_stops_at_the_limit() {
    init_logging();
    let demo = demo();
    let dev = open(&demo, &[ConfigOption::new(ConfigKey::NumLogicProbes, 2u64)]);
    assert_eq!(dev.num_probes(ProbeKind::Logic), 2);
    demo.config_set(ConfigKey::LimitSamples, &ConfigValue::UInt64(100), &dev)
        .unwrap();

    let mut session = Session::new();
    session.dev_add(&dev).unwrap();
    let log = record(&mut session, &dev);
    session.start().unwrap();
    session.run().unwrap();

    let log = log.borrow();
    assert_stream_shape(&log);
    assert_eq!(
        log[0],
        Seen::Header {
            samplerate: 1_000_000,
            num_logic: 2
        }
    );
    assert_eq!(log[1], Seen::Meta);
    assert!(!log.contains(&Seen::Trigger));
    assert_eq!(logic_samples(&log), 100);
}

#[test]
fn test_capture_to_dataframe() {
    init_logging();
    let demo = demo();
    let dev = open(&demo, &[]);
    demo.config_set(ConfigKey::PatternMode, &ConfigValue::from("incremental"), &dev)
        .unwrap();
    demo.config_set(ConfigKey::LimitSamples, &ConfigValue::UInt64(500), &dev)
        .unwrap();

    let mut session = Session::new();
    session.dev_add(&dev).unwrap();
    let capture = LogicCapture::attach(&mut session, &dev);
    session.start().unwrap();
    session.run().unwrap();

    let capture = capture.borrow();
    assert!(capture.is_complete());
    assert_eq!(capture.num_samples(), 500);
    assert_eq!(capture.sample(3), Some(3));
    assert_eq!(capture.sample(256), Some(0));

    let df = capture.to_dataframe().unwrap();
    assert_eq!(df.height(), 500);
    assert_eq!(df.width(), 2 + 8);
    let time = df.column(TIME_COLUMN_NAME).unwrap().f64().unwrap();
    assert_eq!(time.get(0), Some(0.0));
    let bit1 = df.column("bit_1").unwrap().bool().unwrap();
    assert_eq!(bit1.get(2), Some(true));
    assert_eq!(bit1.get(4), Some(false));
}

#[test]
fn test_trigger_discards_samples_before_it() {
    init_logging();
    let demo = demo();
    let dev = open(&demo, &[]);
    demo.config_set(ConfigKey::PatternMode, &ConfigValue::from("incremental"), &dev)
        .unwrap();
    demo.config_set(ConfigKey::LimitSamples, &ConfigValue::UInt64(16), &dev)
        .unwrap();
    // Bits 0-2 low, then bit 3 high: first matches at sample 7, fires on 8.
    for bit in 0..3 {
        dev.probe_set_trigger(bit, Some("1")).unwrap();
    }
    dev.probe_set_trigger(3, Some("01")).unwrap();

    let mut session = Session::new();
    session.dev_add(&dev).unwrap();
    let log = record(&mut session, &dev);
    session.start().unwrap();
    session.run().unwrap();

    let log = log.borrow();
    assert_stream_shape(&log);
    assert_eq!(log[2], Seen::Trigger);
    let Seen::Logic { data, .. } = &log[3] else {
        unreachable!("trigger is followed by logic");
    };
    assert_eq!(data[0], 8);
    assert_eq!(logic_samples(&log), 16);
}

#[test]
fn test_analog_probes_follow_each_logic_packet() {
    init_logging();
    let demo = demo();
    let dev = open(
        &demo,
        &[
            ConfigOption::new(ConfigKey::NumLogicProbes, 4u64),
            ConfigOption::new(ConfigKey::NumAnalogProbes, 2u64),
        ],
    );
    demo.config_set(ConfigKey::LimitSamples, &ConfigValue::UInt64(64), &dev)
        .unwrap();

    let mut session = Session::new();
    session.dev_add(&dev).unwrap();
    let capture = LogicCapture::attach(&mut session, &dev);
    session.start().unwrap();
    session.run().unwrap();

    let capture = capture.borrow();
    assert_eq!(capture.num_samples(), 64);
    assert_eq!(capture.analog.len(), 2);
    assert!(capture.analog.iter().all(|a| a.len() == 64));
    let df = capture.to_dataframe().unwrap();
    assert!(df.column("analog_1").is_ok());
}

#[test]
fn test_two_devices_in_one_session() {
    init_logging();
    let demo = demo();
    let a = open(&demo, &[]);
    let b = open(&demo, &[]);
    for (dev, limit) in [(&a, 300u64), (&b, 40u64)] {
        demo.config_set(ConfigKey::LimitSamples, &ConfigValue::UInt64(limit), dev)
            .unwrap();
    }

    let mut session = Session::new();
    session.dev_add(&a).unwrap();
    session.dev_add(&b).unwrap();
    assert!(session.dev_add(&a).is_err());
    let log_a = record(&mut session, &a);
    let log_b = record(&mut session, &b);
    session.start().unwrap();
    session.run().unwrap();

    assert_stream_shape(&log_a.borrow());
    assert_stream_shape(&log_b.borrow());
    assert_eq!(logic_samples(&log_a.borrow()), 300);
    assert_eq!(logic_samples(&log_b.borrow()), 40);
}

#[test]
fn test_halt_ends_a_continuous_run() {
    init_logging();
    let demo = demo();
    let dev = open(&demo, &[]);

    let mut session = Session::new();
    session.dev_add(&dev).unwrap();
    let log = record(&mut session, &dev);
    let stop = session.stop_handle();
    session.datafeed_callback_add(move |_, packet| {
        if packet.is_data() {
            stop.request();
        }
    });
    session.start().unwrap();
    session.run().unwrap();

    assert_stream_shape(&log.borrow());
    assert!(logic_samples(&log.borrow()) > 0);
    assert!(!session.is_running());

    // The same devices run again after a finished run.
    session.datafeed_callback_remove_all();
    demo.config_set(ConfigKey::LimitSamples, &ConfigValue::UInt64(10), &dev)
        .unwrap();
    let again = record(&mut session, &dev);
    session.start().unwrap();
    session.run().unwrap();
    assert_eq!(logic_samples(&again.borrow()), 10);
}

#[test]
fn test_closed_device_does_not_start() {
    init_logging();
    let demo = demo();
    let dev = open(&demo, &[]);
    demo.dev_close(&dev).unwrap();
    demo.dev_close(&dev).unwrap();
    assert_eq!(dev.status(), DeviceStatus::Inactive);

    let mut session = Session::new();
    session.dev_add(&dev).unwrap();
    assert!(matches!(session.start(), Err(LabError::DeviceClosed)));
}

#[test]
fn test_samplerate_round_trip() {
    let demo = demo();
    let dev = open(&demo, &[]);
    for rate in [1u64, 1_000, 20_000_000, 1_000_000_000] {
        demo.config_set(ConfigKey::Samplerate, &ConfigValue::UInt64(rate), &dev)
            .unwrap();
        assert_eq!(
            demo.config_get(ConfigKey::Samplerate, Some(&dev)).unwrap(),
            ConfigValue::UInt64(rate)
        );
    }
}

#[test]
fn test_registry_lists_the_shipped_drivers() {
    let registry = DriverRegistry::with_defaults();
    let names: Vec<&str> = registry.names().collect();
    assert!(names.contains(&"demo"));
    assert!(names.contains(&"virtual-session"));
    assert!(names.contains(&"ols"));
    assert!(matches!(registry.create("nope"), Err(LabError::NotFound(_))));
}
