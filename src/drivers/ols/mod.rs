//! Openbench Logic Sniffer and other SUMP-compatible analyzers on a serial
//! port.
//!
//! The device captures into its own memory and dumps the whole buffer once
//! the capture completes, so a run is: configure, `RUN`, then collect bytes
//! until the expected sample count arrives or the line goes quiet.

pub mod protocol;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::capability::{ConfigKey, ConfigOption, ConfigValue};
use crate::datafeed::{Header, Logic, Packet};
use crate::device::{DeviceInstance, DeviceList, DeviceStatus, Probe};
use crate::driver::{Driver, DriverInfo};
use crate::error::{LabError, Result};
use crate::event_loop::{handler_fn, Events, SourceFd};
use crate::serial::{SerialLink, SerialOpener, SerialParams};
use crate::session::{AcquisitionContext, Feed};

use protocol::{
    Metadata, ProbeSetup, SampleCollector, CMD_CAPTURE_SIZE, CMD_ID, CMD_METADATA, CMD_RESET,
    CMD_RUN, CMD_SET_DIVIDER, CMD_SET_FLAGS, FLAG_DEMUX, FLAG_FILTER, FLAG_GROUPS_DISABLED,
    FLAG_RLE, ID_REPLIES, MAX_NUM_SAMPLES, MIN_NUM_SAMPLES, NUM_PROBES,
};

pub static DRIVER_INFO: DriverInfo = DriverInfo {
    name: "ols",
    longname: "Openbench Logic Sniffer & SUMP compatibles",
    api_version: 1,
};

const DEFAULT_SAMPLERATE: u64 = 200_000;
const DEFAULT_LIMIT_SAMPLES: u64 = 1024;
const ID_TIMEOUT: Duration = Duration::from_millis(50);
const METADATA_TIMEOUT: Duration = Duration::from_millis(10);
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Once data flows, this much silence means the dump is complete.
const IDLE_TIMEOUT: Duration = Duration::from_millis(30);

static SCAN_OPTIONS: &[ConfigKey] = &[ConfigKey::Conn, ConfigKey::SerialComm];

static CAPABILITIES: &[ConfigKey] = &[
    ConfigKey::LogicAnalyzer,
    ConfigKey::Samplerate,
    ConfigKey::TriggerType,
    ConfigKey::CaptureRatio,
    ConfigKey::LimitSamples,
    ConfigKey::Rle,
];

type SharedLink = Rc<RefCell<Box<dyn SerialLink>>>;

struct OlsDevice {
    port: String,
    params: SerialParams,
    link: Option<SharedLink>,
    max_samples: Option<u32>,
    max_samplerate: Option<u64>,
    samplerate: u64,
    divider: u32,
    flags: u16,
    limit_samples: u64,
    capture_ratio: u64,
    run: Option<Rc<RefCell<OlsRun>>>,
}

impl OlsDevice {
    fn new(port: &str, params: SerialParams, meta: &Metadata) -> Self {
        Self {
            port: port.to_string(),
            params,
            link: None,
            max_samples: meta.max_samples,
            max_samplerate: meta.max_samplerate,
            samplerate: DEFAULT_SAMPLERATE,
            divider: (protocol::CLOCK_RATE / DEFAULT_SAMPLERATE - 1) as u32,
            flags: 0,
            limit_samples: DEFAULT_LIMIT_SAMPLES,
            capture_ratio: 0,
            run: None,
        }
    }

    fn set_samplerate(&mut self, samplerate: u64) -> Result<()> {
        if self.max_samplerate.is_some_and(|max| samplerate > max) {
            return Err(LabError::Samplerate(samplerate));
        }
        let (divider, demux, actual) = protocol::samplerate_divider(samplerate)?;
        if actual != samplerate {
            log::info!("ols: cannot match samplerate {samplerate} Hz, using {actual} Hz");
        }
        self.divider = divider;
        if demux {
            self.flags |= FLAG_DEMUX;
        } else {
            self.flags &= !FLAG_DEMUX;
        }
        self.samplerate = actual;
        Ok(())
    }

    /// Groups of four samples to read, bounded by the device memory.
    fn readcount(&self, channel_groups: u8) -> u64 {
        let mut limit = self.limit_samples;
        if let Some(max) = self.max_samples {
            let groups = u64::from(channel_groups.count_ones().max(1));
            limit = limit.min(u64::from(max) / groups);
        }
        limit.min(MAX_NUM_SAMPLES).div_ceil(4).max(1)
    }
}

/// Reset five times (the device may sit anywhere in a five-byte command),
/// then ask for the ID.
fn identify(link: &mut dyn SerialLink) -> Result<bool> {
    for _ in 0..5 {
        link.write_all(&[CMD_RESET])?;
    }
    link.write_all(&[CMD_ID])?;
    let mut reply = [0u8; 4];
    let n = link.read_timeout(&mut reply, ID_TIMEOUT)?;
    Ok(n == reply.len() && ID_REPLIES.contains(&&reply))
}

fn read_metadata(link: &mut dyn SerialLink) -> Result<Option<Metadata>> {
    link.write_all(&[CMD_METADATA])?;
    let mut first = [0u8; 1];
    if link.read_timeout(&mut first, METADATA_TIMEOUT)? == 0 {
        return Ok(None);
    }
    let rest = std::iter::from_fn(|| {
        let mut byte = [0u8; 1];
        match link.read_timeout(&mut byte, METADATA_TIMEOUT) {
            Ok(1) => Some(byte[0]),
            _ => None,
        }
    });
    let mut bytes = std::iter::once(first[0]).chain(rest);
    Ok(Some(protocol::parse_metadata(&mut bytes)))
}

/// State of one capture, shared with its event-loop source.
struct OlsRun {
    dev: DeviceInstance,
    fd: SourceFd,
    link: SharedLink,
    collector: SampleCollector,
    limit_samples: usize,
    /// Sample index of the trigger within a full buffer.
    trigger_at: Option<usize>,
    rx: Vec<u8>,
    last_data: Option<Instant>,
    stop_requested: bool,
    finished: bool,
}

impl OlsRun {
    fn send(&self, cx: &mut AcquisitionContext<'_>, packet: &Packet<'_>) {
        if let Err(e) = cx.send(&self.dev, packet) {
            log::error!("ols: {e}");
        }
    }

    fn poll(&mut self, cx: &mut AcquisitionContext<'_>) -> bool {
        if self.finished {
            return false;
        }
        if self.stop_requested {
            self.finish(cx, false);
            return false;
        }

        self.rx.clear();
        let read = self.link.borrow_mut().read_available(&mut self.rx);
        match read {
            Ok(0) => {}
            Ok(_) => {
                self.collector.push(&self.rx);
                self.last_data = Some(Instant::now());
            }
            Err(e) => {
                log::error!("ols: read failed: {e}");
                self.finish(cx, true);
                return false;
            }
        }

        let quiet = self.last_data.is_some_and(|t| t.elapsed() >= IDLE_TIMEOUT);
        if self.collector.is_full() || quiet {
            self.finish(cx, true);
            return false;
        }
        true
    }

    fn finish(&mut self, cx: &mut AcquisitionContext<'_>, emit: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        if emit {
            self.emit_samples(cx);
        }
        if let Err(e) = self.link.borrow_mut().clear() {
            log::warn!("ols: flushing the port failed: {e}");
        }
        self.send(cx, &Packet::End);
        cx.sources.remove(self.fd);
        log::info!("ols: capture finished with {} samples", self.collector.num_samples());
    }

    fn emit_samples(&self, cx: &mut AcquisitionContext<'_>) {
        let received = self.collector.num_samples();
        let all = self.collector.samples();
        let data = &all[..self.limit_samples.min(received) * 4];
        // Missing samples are the oldest ones, so the trigger moves left.
        let missing = self.collector.capacity() - received;
        match self.trigger_at.map(|t| t.saturating_sub(missing).min(data.len() / 4)) {
            Some(at) => {
                if at > 0 {
                    self.send(cx, &Packet::Logic(Logic::new(4, &data[..at * 4])));
                }
                self.send(cx, &Packet::Trigger);
                if at * 4 < data.len() {
                    self.send(cx, &Packet::Logic(Logic::new(4, &data[at * 4..])));
                }
            }
            None if !data.is_empty() => self.send(cx, &Packet::Logic(Logic::new(4, data))),
            None => log::warn!("ols: no samples received"),
        }
    }
}

pub struct OlsDriver {
    opener: Box<dyn SerialOpener>,
    devices: DeviceList<OlsDevice>,
    initialized: bool,
}

impl OlsDriver {
    pub fn new(opener: Box<dyn SerialOpener>) -> Self {
        Self {
            opener,
            devices: DeviceList::new(),
            initialized: false,
        }
    }

    fn close_device(dev: &DeviceInstance, state: &mut OlsDevice) -> Result<()> {
        if let Some(run) = &state.run {
            run.borrow_mut().stop_requested = true;
        }
        state.link = None;
        dev.set_status(DeviceStatus::Inactive)
    }

    fn probe_port(&mut self, port: &str, params: SerialParams) -> Result<Option<DeviceInstance>> {
        log::info!("ols: probing {port}");
        let mut link = self.opener.open(port, params)?;
        if !identify(link.as_mut())? {
            log::debug!("ols: no SUMP device answered on {port}");
            return Ok(None);
        }

        let index = self.devices.next_index();
        let (dev, meta) = match read_metadata(link.as_mut())? {
            Some(meta) => {
                let num_probes = meta.num_probes.unwrap_or(NUM_PROBES).min(NUM_PROBES);
                let dev = DeviceInstance::new(index, DeviceStatus::Inactive, "", &meta.name, &meta.version)
                    .with_probes(Probe::logic_set(num_probes));
                (dev, meta)
            }
            None => {
                // SUMP-compatible, but not an OLS
                let dev = DeviceInstance::new(index, DeviceStatus::Inactive, "Sump", "Logic Analyzer", "v1.0")
                    .with_probes(Probe::logic_set(NUM_PROBES));
                (dev, Metadata::default())
            }
        };
        log::info!("ols: found {dev} on {port}");
        self.devices.push(dev.clone(), OlsDevice::new(port, params, &meta));
        Ok(Some(dev))
    }
}

impl Driver for OlsDriver {
    fn info(&self) -> &'static DriverInfo {
        &DRIVER_INFO
    }

    fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Err(LabError::bug("ols: init called twice"));
        }
        self.initialized = true;
        Ok(())
    }

    fn cleanup(&mut self) -> Result<()> {
        let cleared = self.dev_clear();
        self.initialized = false;
        cleared
    }

    fn scan(&mut self, options: &[ConfigOption]) -> Result<Vec<DeviceInstance>> {
        if !self.initialized {
            return Err(LabError::bug("ols: driver used before init"));
        }
        let Some(conn) = ConfigOption::find(options, ConfigKey::Conn) else {
            log::debug!("ols: scan needs a serial port (conn)");
            return Ok(Vec::new());
        };
        let port = conn.as_str()?.to_string();
        let params = match ConfigOption::find(options, ConfigKey::SerialComm) {
            Some(v) => v.as_str()?.parse()?,
            None => SerialParams::default(),
        };
        Ok(self.probe_port(&port, params)?.into_iter().collect())
    }

    fn dev_list(&self) -> Vec<DeviceInstance> {
        self.devices.instances()
    }

    fn dev_clear(&mut self) -> Result<()> {
        self.devices.clear(DRIVER_INFO.name, Self::close_device)
    }

    fn dev_open(&mut self, dev: &DeviceInstance) -> Result<()> {
        if dev.is_active() {
            return Err(LabError::DeviceBusy);
        }
        let state = self.devices.get_mut(dev)?;
        let link = self.opener.open(&state.port, state.params)?;
        state.link = Some(Rc::new(RefCell::new(link)));
        dev.set_status(DeviceStatus::Active)
    }

    fn dev_close(&mut self, dev: &DeviceInstance) -> Result<()> {
        let state = self.devices.get_mut(dev)?;
        if !dev.is_active() {
            return Ok(());
        }
        Self::close_device(dev, state)
    }

    fn capabilities(&self) -> &'static [ConfigKey] {
        CAPABILITIES
    }

    fn config_get(&self, key: ConfigKey, dev: Option<&DeviceInstance>) -> Result<ConfigValue> {
        let dev = dev.ok_or_else(|| LabError::argument(format!("ols: {key} needs a device")))?;
        let state = self.devices.get(dev)?;
        match key {
            ConfigKey::Samplerate => Ok(ConfigValue::UInt64(state.samplerate)),
            ConfigKey::LimitSamples => Ok(ConfigValue::UInt64(state.limit_samples)),
            ConfigKey::CaptureRatio => Ok(ConfigValue::UInt64(state.capture_ratio)),
            ConfigKey::Rle => Ok(ConfigValue::Bool(state.flags & FLAG_RLE != 0)),
            ConfigKey::Conn => Ok(ConfigValue::String(state.port.clone())),
            ConfigKey::SerialComm => Ok(ConfigValue::String(state.params.to_string())),
            _ => Err(LabError::not_applicable(format!("ols: cannot read {key}"))),
        }
    }

    fn config_set(&mut self, key: ConfigKey, value: &ConfigValue, dev: &DeviceInstance) -> Result<()> {
        if !dev.is_active() {
            return Err(LabError::DeviceClosed);
        }
        let state = self.devices.get_mut(dev)?;
        match key {
            ConfigKey::Samplerate => state.set_samplerate(value.as_u64()?)?,
            ConfigKey::LimitSamples => {
                let limit = value.as_u64()?;
                if !(MIN_NUM_SAMPLES..=MAX_NUM_SAMPLES).contains(&limit) {
                    return Err(LabError::argument(format!(
                        "ols: sample limit must be {MIN_NUM_SAMPLES}..={MAX_NUM_SAMPLES}"
                    )));
                }
                state.limit_samples = limit;
            }
            ConfigKey::CaptureRatio => {
                let ratio = value.as_u64()?;
                if ratio > 100 {
                    return Err(LabError::argument("ols: capture ratio is a percentage"));
                }
                state.capture_ratio = ratio;
            }
            ConfigKey::Rle => {
                if value.as_bool()? {
                    state.flags |= FLAG_RLE;
                } else {
                    state.flags &= !FLAG_RLE;
                }
            }
            _ => return Err(LabError::not_applicable(format!("ols: cannot set {key}"))),
        }
        log::debug!("ols: {key} set on {dev}");
        Ok(())
    }

    fn config_list(&self, key: ConfigKey, _dev: Option<&DeviceInstance>) -> Result<ConfigValue> {
        match key {
            ConfigKey::ScanOptions => Ok(ConfigValue::Keys(SCAN_OPTIONS.to_vec())),
            ConfigKey::DeviceOptions => Ok(ConfigValue::Keys(CAPABILITIES.to_vec())),
            // min, max, step
            ConfigKey::Samplerate => Ok(ConfigValue::UInt64List(vec![
                protocol::MIN_SAMPLERATE,
                protocol::MAX_SAMPLERATE,
                1,
            ])),
            ConfigKey::TriggerType => Ok(ConfigValue::String("01".to_string())),
            _ => Err(LabError::not_applicable(format!("ols: no list for {key}"))),
        }
    }

    fn acquisition_start(&mut self, dev: &DeviceInstance, cx: &mut AcquisitionContext<'_>) -> Result<()> {
        if !dev.is_active() {
            return Err(LabError::DeviceClosed);
        }
        let state = self.devices.get_mut(dev)?;
        if state.run.as_ref().is_some_and(|r| !r.borrow().finished) {
            return Err(LabError::generic(format!("ols: {dev} is already acquiring")));
        }
        let link = state.link.clone().ok_or(LabError::DeviceClosed)?;

        let setup = ProbeSetup::from_probes(&dev.probes())?;
        let groups = setup.channel_groups();
        let readcount = state.readcount(groups);
        let (delaycount, trigger_at) = if setup.has_trigger() {
            let delay = (readcount * (100 - state.capture_ratio) / 100).max(1);
            let at = ((readcount - delay) * 4).saturating_sub(setup.num_stages as u64);
            (delay, Some(at as usize))
        } else {
            (readcount, None)
        };

        let mut flags = state.flags & (FLAG_DEMUX | FLAG_RLE);
        flags |= !(u16::from(groups) << 2) & FLAG_GROUPS_DISABLED;
        flags |= FLAG_FILTER;

        let mut commands = setup.trigger_commands();
        commands.extend(protocol::long_command(CMD_SET_DIVIDER, state.divider));
        commands.extend(protocol::long_command(
            CMD_CAPTURE_SIZE,
            protocol::capture_size(readcount as u32, delaycount as u32),
        ));
        commands.extend(protocol::long_command(CMD_SET_FLAGS, u32::from(flags)));
        commands.push(CMD_RUN);
        log::info!(
            "ols: starting {dev} at {} Hz (divider {}, demux {}), {} samples",
            state.samplerate,
            state.divider,
            if flags & FLAG_DEMUX != 0 { "on" } else { "off" },
            readcount * 4
        );
        link.borrow_mut().write_all(&commands)?;

        let fd = cx.sources.allocate_fd();
        let run = Rc::new(RefCell::new(OlsRun {
            dev: dev.clone(),
            fd,
            link,
            collector: SampleCollector::new(readcount as usize * 4, flags),
            limit_samples: state.limit_samples as usize,
            trigger_at,
            rx: Vec::new(),
            last_data: None,
            stop_requested: false,
            finished: false,
        }));
        state.run = Some(Rc::clone(&run));

        run.borrow().send(cx, &Packet::Header(Header::new(state.samplerate, NUM_PROBES, 0)));
        let meta = [ConfigOption::new(ConfigKey::Samplerate, state.samplerate)];
        run.borrow().send(cx, &Packet::Meta(&meta));

        cx.sources.add(
            fd,
            Events::IN,
            Some(POLL_INTERVAL),
            handler_fn::<Feed, _>(move |_fd, _revents, cx| run.borrow_mut().poll(cx)),
        );
        Ok(())
    }

    fn acquisition_stop(&mut self, dev: &DeviceInstance, _cx: &mut AcquisitionContext<'_>) -> Result<()> {
        let state = self.devices.get(dev)?;
        if let Some(run) = &state.run {
            run.borrow_mut().stop_requested = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::device::ProbeKind;
    use crate::driver::DriverHandle;
    use crate::session::Session;

    /// Both directions of a fake serial line, shared by every link opened.
    #[derive(Clone, Default)]
    struct Wire {
        tx: Rc<RefCell<Vec<u8>>>,
        rx: Rc<RefCell<VecDeque<u8>>>,
    }

    impl Wire {
        fn reply(&self, bytes: &[u8]) {
            self.rx.borrow_mut().extend(bytes);
        }
    }

    struct WireLink(Wire);

    impl SerialLink for WireLink {
        fn write_all(&mut self, data: &[u8]) -> Result<()> {
            self.0.tx.borrow_mut().extend_from_slice(data);
            Ok(())
        }

        fn read_available(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
            let mut rx = self.0.rx.borrow_mut();
            let n = rx.len();
            buf.extend(rx.drain(..));
            Ok(n)
        }

        fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            let mut rx = self.0.rx.borrow_mut();
            let n = buf.len().min(rx.len());
            for (slot, byte) in buf.iter_mut().zip(rx.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }

        fn clear(&mut self) -> Result<()> {
            self.0.rx.borrow_mut().clear();
            Ok(())
        }
    }

    struct WireOpener(Wire);

    impl SerialOpener for WireOpener {
        fn open(&self, _port: &str, _params: SerialParams) -> Result<Box<dyn SerialLink>> {
            Ok(Box::new(WireLink(self.0.clone())))
        }
    }

    fn conn() -> Vec<ConfigOption> {
        vec![ConfigOption::new(ConfigKey::Conn, "/dev/ttyACM0")]
    }

    fn scanned(wire: &Wire) -> (OlsDriver, DeviceInstance) {
        wire.reply(b"1ALS");
        let mut meta = vec![0x01];
        meta.extend(b"BPv4\0");
        meta.extend([0x40, 16, 0x00]);
        wire.reply(&meta);
        let mut ols = OlsDriver::new(Box::new(WireOpener(wire.clone())));
        ols.init().unwrap();
        let dev = ols.scan(&conn()).unwrap().remove(0);
        (ols, dev)
    }

    #[test]
    fn test_scan_needs_a_port() {
        let mut ols = OlsDriver::new(Box::new(WireOpener(Wire::default())));
        ols.init().unwrap();
        assert!(ols.scan(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_scan_with_metadata() {
        let wire = Wire::default();
        let (ols, dev) = scanned(&wire);
        assert_eq!(wire.tx.borrow().as_slice(), &[0, 0, 0, 0, 0, CMD_ID, CMD_METADATA]);
        assert_eq!(dev.model(), "BPv4");
        assert_eq!(dev.num_probes(ProbeKind::Logic), 16);
        assert_eq!(ols.dev_list().len(), 1);
    }

    #[test]
    fn test_scan_plain_sump() {
        let wire = Wire::default();
        wire.reply(b"1SLO");
        let mut ols = OlsDriver::new(Box::new(WireOpener(wire.clone())));
        ols.init().unwrap();
        let dev = ols.scan(&conn()).unwrap().remove(0);
        assert_eq!(dev.vendor(), "Sump");
        assert_eq!(dev.version(), "v1.0");
        assert_eq!(dev.num_probes(ProbeKind::Logic), NUM_PROBES);
    }

    #[test]
    fn test_scan_ignores_other_devices() {
        let wire = Wire::default();
        wire.reply(b"OK\r\n");
        let mut ols = OlsDriver::new(Box::new(WireOpener(wire)));
        ols.init().unwrap();
        assert!(ols.scan(&conn()).unwrap().is_empty());

        let mut options = conn();
        options.push(ConfigOption::new(ConfigKey::SerialComm, "fast"));
        assert!(ols.scan(&options).is_err());
    }

    #[test]
    fn test_config() {
        let wire = Wire::default();
        let (mut ols, dev) = scanned(&wire);
        assert!(matches!(
            ols.config_set(ConfigKey::LimitSamples, &ConfigValue::UInt64(64), &dev),
            Err(LabError::DeviceClosed)
        ));
        ols.dev_open(&dev).unwrap();
        assert!(ols
            .config_set(ConfigKey::LimitSamples, &ConfigValue::UInt64(2), &dev)
            .is_err());
        assert!(ols
            .config_set(ConfigKey::CaptureRatio, &ConfigValue::UInt64(101), &dev)
            .is_err());
        ols.config_set(ConfigKey::Samplerate, &ConfigValue::UInt64(200_000_000), &dev)
            .unwrap();
        assert_ne!(ols.devices.get(&dev).unwrap().flags & FLAG_DEMUX, 0);
        ols.config_set(ConfigKey::Rle, &ConfigValue::Bool(true), &dev)
            .unwrap();
        assert_eq!(
            ols.config_get(ConfigKey::Rle, Some(&dev)).unwrap(),
            ConfigValue::Bool(true)
        );
    }

    #[test]
    fn test_capture_with_trigger() {
        let wire = Wire::default();
        wire.reply(b"1ALS");
        wire.reply(&[0x00]);
        let driver = DriverHandle::new(OlsDriver::new(Box::new(WireOpener(wire.clone()))));
        driver.init().unwrap();
        let dev = driver.scan(&conn()).unwrap().remove(0);
        driver.dev_open(&dev).unwrap();
        driver
            .config_set(ConfigKey::LimitSamples, &ConfigValue::UInt64(8), &dev)
            .unwrap();
        driver
            .config_set(ConfigKey::CaptureRatio, &ConfigValue::UInt64(50), &dev)
            .unwrap();
        dev.probe_set_trigger(0, Some("1")).unwrap();

        let packets = Rc::new(RefCell::new(Vec::new()));
        let mut session = Session::new();
        session.dev_add(&dev).unwrap();
        let sink = Rc::clone(&packets);
        session.datafeed_callback_add(move |_dev, packet| {
            let entry = match packet {
                Packet::Logic(l) => format!("logic {}", l.num_samples()),
                other => format!("{:?}", other.packet_type()),
            };
            sink.borrow_mut().push(entry);
        });
        wire.tx.borrow_mut().clear();
        session.start().unwrap();

        let tx = wire.tx.borrow().clone();
        assert_eq!(tx.last(), Some(&CMD_RUN));
        // capture size: 2 groups of four, half of them after the trigger
        let size = protocol::long_command(CMD_CAPTURE_SIZE, protocol::capture_size(2, 1));
        assert!(tx.windows(5).any(|w| w == size));

        // newest sample first
        for sample in (0u8..8).rev() {
            wire.reply(&[sample, 0, 0, 0]);
        }
        session.run().unwrap();
        assert_eq!(
            *packets.borrow(),
            ["Header", "Meta", "logic 3", "Trigger", "logic 5", "End"]
        );
    }
}
