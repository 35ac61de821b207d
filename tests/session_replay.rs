mod common;

use std::fs;
use std::io::Write;
use std::path::Path;

use common::{assert_stream_shape, init_logging, logic_samples, record, Seen};
use labfeed_rs::drivers::session_file::CHUNK_SIZE;
use labfeed_rs::{
    ConfigKey, ConfigOption, ConfigValue, DeviceInstance, DriverHandle, DriverRegistry, LabError,
    LogicCapture, Session,
};

fn write_session(dir: &Path, metadata: &str) {
    fs::write(dir.join("version"), "2\n").unwrap();
    fs::write(dir.join("metadata"), metadata).unwrap();
}

/// Pack `entries` into a session archive at `path`.
fn write_archive(path: &Path, entries: &[(&str, &[u8])]) {
    let mut writer = zip::ZipWriter::new(fs::File::create(path).unwrap());
    for (i, (name, data)) in entries.iter().enumerate() {
        let method = if i % 2 == 0 {
            zip::CompressionMethod::Deflated
        } else {
            zip::CompressionMethod::Stored
        };
        let options = zip::write::SimpleFileOptions::default().compression_method(method);
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap();
}

fn scan(dir: &Path) -> (DriverHandle, Vec<DeviceInstance>) {
    let driver = DriverRegistry::with_defaults()
        .create("virtual-session")
        .unwrap();
    driver.init().unwrap();
    let found = driver
        .scan(&[ConfigOption::new(
            ConfigKey::SessionFile,
            dir.display().to_string(),
        )])
        .unwrap();
    (driver, found)
}

fn replay(driver: &DriverHandle, dev: &DeviceInstance) -> common::Log {
    driver.dev_open(dev).unwrap();
    let mut session = Session::new();
    session.dev_add(dev).unwrap();
    let log = record(&mut session, dev);
    session.start().unwrap();
    session.run().unwrap();
    log
}

#[test]
fn test_replays_a_single_capture_file() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    write_session(
        dir.path(),
        "[global]\nsigrok version = 0.2.0\n\n\
         [device 1]\ncapturefile = logic-1\nunitsize = 1\ntotal probes = 8\n\
         samplerate = 1 MHz\nprobe1 = CLK\nprobe2 = DATA\ntrigger1 = 1\n",
    );
    let data: Vec<u8> = (0..=255).collect();
    fs::write(dir.path().join("logic-1"), &data).unwrap();

    let (driver, mut found) = scan(dir.path());
    assert_eq!(found.len(), 1);
    let dev = found.remove(0);
    assert_eq!(dev.model(), "Virtual session");
    {
        let probes = dev.probes();
        assert_eq!(probes.len(), 8);
        assert_eq!(probes[0].name, "CLK");
        assert!(probes[1].enabled);
        assert!(!probes[2].enabled);
        assert_eq!(probes[0].trigger.as_deref(), Some("1"));
    }
    assert_eq!(
        driver.config_get(ConfigKey::Samplerate, Some(&dev)).unwrap(),
        ConfigValue::UInt64(1_000_000)
    );

    let log = replay(&driver, &dev);
    let log = log.borrow();
    assert_stream_shape(&log);
    assert_eq!(
        log[0],
        Seen::Header {
            samplerate: 1_000_000,
            num_logic: 8
        }
    );
    assert_eq!(
        log[2],
        Seen::Logic {
            unitsize: 1,
            data
        }
    );
}

#[test]
fn test_replays_chunked_captures_in_order() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    write_session(
        dir.path(),
        "[device 1]\ncapturefile = logic-1\nunitsize = 2\ntotal probes = 16\nsamplerate = 200k\n",
    );
    fs::write(dir.path().join("logic-1-1"), [1, 0, 2, 0]).unwrap();
    fs::write(dir.path().join("logic-1-2"), [3, 0]).unwrap();
    fs::write(dir.path().join("logic-1-4"), [9, 9]).unwrap();

    let (driver, mut found) = scan(dir.path());
    let dev = found.remove(0);
    driver.dev_open(&dev).unwrap();

    let mut session = Session::new();
    session.dev_add(&dev).unwrap();
    let capture = LogicCapture::attach(&mut session, &dev);
    session.start().unwrap();
    session.run().unwrap();

    let capture = capture.borrow();
    assert!(capture.is_complete());
    assert_eq!(capture.samplerate, 200_000);
    assert_eq!(capture.unitsize, 2);
    // Stops at the first missing chunk.
    assert_eq!(capture.samples().collect::<Vec<_>>(), [1, 2, 3]);
}

#[test]
fn test_large_files_are_split_into_packets() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    write_session(
        dir.path(),
        "[device 1]\ncapturefile = logic-1\nunitsize = 1\ntotal probes = 8\nsamplerate = 1000\n",
    );
    fs::write(dir.path().join("logic-1"), vec![0x5a; CHUNK_SIZE + 10]).unwrap();

    let (driver, mut found) = scan(dir.path());
    let log = replay(&driver, &found.remove(0));
    let log = log.borrow();
    assert_stream_shape(&log);
    let sizes: Vec<usize> = log
        .iter()
        .filter_map(|s| match s {
            Seen::Logic { data, .. } => Some(data.len()),
            _ => None,
        })
        .collect();
    assert_eq!(sizes, [CHUNK_SIZE, 10]);
}

#[test]
fn test_stray_bytes_are_dropped() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    write_session(
        dir.path(),
        "[device 1]\ncapturefile = logic-1\nunitsize = 4\ntotal probes = 32\nsamplerate = 1000\n",
    );
    fs::write(dir.path().join("logic-1"), [1, 2, 3, 4, 5, 6]).unwrap();

    let (driver, mut found) = scan(dir.path());
    let log = replay(&driver, &found.remove(0));
    assert_eq!(logic_samples(&log.borrow()), 1);
}

#[test]
fn test_sections_without_capture_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    write_session(
        dir.path(),
        "[device 1]\nsamplerate = 1000\n\n\
         [device 2]\ncapturefile = logic-2\ntotal probes = 4\n",
    );
    let (driver, found) = scan(dir.path());
    assert_eq!(found.len(), 1);
    assert_eq!(
        driver.config_get(ConfigKey::CaptureFile, Some(&found[0])).unwrap(),
        ConfigValue::String("logic-2".into())
    );
}

#[test]
fn test_missing_capture_data_fails_start() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    write_session(
        dir.path(),
        "[device 1]\ncapturefile = logic-1\ntotal probes = 8\n",
    );
    let (driver, mut found) = scan(dir.path());
    let dev = found.remove(0);
    driver.dev_open(&dev).unwrap();
    let mut session = Session::new();
    session.dev_add(&dev).unwrap();
    assert!(matches!(session.start(), Err(LabError::NotFound(_))));
}

#[test]
fn test_unsupported_version_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("version"), "3").unwrap();
    fs::write(dir.path().join("metadata"), "").unwrap();
    let driver = DriverRegistry::with_defaults()
        .create("virtual-session")
        .unwrap();
    driver.init().unwrap();
    let option = ConfigOption::new(ConfigKey::SessionFile, dir.path().display().to_string());
    assert!(driver.scan(&[option]).is_err());
    assert!(driver.scan(&[]).unwrap().is_empty());
}

#[test]
fn test_replays_a_session_archive() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("capture.sr");
    let metadata = "[device 1]\ncapturefile = logic-1\nunitsize = 1\n\
                    total probes = 4\nsamplerate = 200 kHz\nprobe1 = A\n";
    write_archive(
        &archive,
        &[
            ("version", &b"2"[..]),
            ("metadata", metadata.as_bytes()),
            ("logic-1-1", &[1u8, 2, 3][..]),
            ("logic-1-2", &[4u8, 5][..]),
        ],
    );

    let (driver, mut found) = scan(&archive);
    assert_eq!(found.len(), 1);
    let dev = found.remove(0);
    assert_eq!(
        driver.config_get(ConfigKey::SessionFile, Some(&dev)).unwrap(),
        ConfigValue::String(archive.display().to_string())
    );

    let log = replay(&driver, &dev);
    let log = log.borrow();
    assert_stream_shape(&log);
    assert_eq!(
        log[2..],
        [
            Seen::Logic {
                unitsize: 1,
                data: vec![1, 2, 3]
            },
            Seen::Logic {
                unitsize: 1,
                data: vec![4, 5]
            },
            Seen::End,
        ]
    );
}

#[test]
fn test_archive_without_version_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("broken.sr");
    write_archive(&archive, &[("metadata", &b"[device 1]\ncapturefile = logic-1\n"[..])]);

    let driver = DriverRegistry::with_defaults()
        .create("virtual-session")
        .unwrap();
    driver.init().unwrap();
    let scanned = driver.scan(&[ConfigOption::new(
        ConfigKey::SessionFile,
        archive.display().to_string(),
    )]);
    assert!(scanned.is_err());
}
