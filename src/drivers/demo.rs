//! Demo driver: a virtual logic analyzer (with optional analog probes)
//! that generates test patterns. Needs no hardware, which makes it the
//! default device of the demos and most integration tests.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;
use std::time::{Duration, Instant};

use rand::RngCore;

use crate::capability::{ConfigKey, ConfigOption, ConfigValue};
use crate::datafeed::{Analog, Header, Logic, MeasuredQuantity, Packet, Unit};
use crate::device::{DeviceInstance, DeviceList, DeviceStatus, Probe, ProbeKind};
use crate::driver::{Driver, DriverInfo};
use crate::error::{LabError, Result};
use crate::event_loop::{handler_fn, Events, SourceFd};
use crate::session::{AcquisitionContext, Feed};
use crate::trigger::{Trigger, TriggerMatcher, TRIGGER_TYPES};

pub static DRIVER_INFO: DriverInfo = DriverInfo {
    name: "demo",
    longname: "Demo driver and pattern generator",
    api_version: 1,
};

const DEFAULT_NUM_LOGIC_PROBES: u64 = 8;
const DEFAULT_NUM_ANALOG_PROBES: u64 = 0;
const MAX_LOGIC_PROBES: u64 = 64;
const DEFAULT_SAMPLERATE: u64 = 200_000;
const MAX_SAMPLERATE: u64 = 1_000_000_000;
const NUM_TRIGGER_STAGES: usize = 4;
/// Upper bound on samples generated per pass, so one pass stays short.
const MAX_SAMPLES_PER_PASS: u64 = 8192;
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const ANALOG_AMPLITUDE: f32 = 10.0;
const ANALOG_PERIOD: u64 = 20;

static CAPABILITIES: &[ConfigKey] = &[
    ConfigKey::DemoDevice,
    ConfigKey::LogicAnalyzer,
    ConfigKey::Samplerate,
    ConfigKey::PatternMode,
    ConfigKey::TriggerType,
    ConfigKey::LimitSamples,
    ConfigKey::LimitMsec,
    ConfigKey::Continuous,
];

static SCAN_OPTIONS: &[ConfigKey] = &[ConfigKey::NumLogicProbes, ConfigKey::NumAnalogProbes];

/// "sigrok" in a 8x8 font, one column per sample.
static SIGROK_PATTERN: [u8; 64] = [
    0x4c, 0x92, 0x92, 0x92, 0x64, 0x00, 0x00, 0x00, //
    0x82, 0xfe, 0xfe, 0x82, 0x00, 0x00, 0x00, 0x00, //
    0x7c, 0x82, 0x82, 0x92, 0x74, 0x00, 0x00, 0x00, //
    0xfe, 0x12, 0x12, 0x32, 0xcc, 0x00, 0x00, 0x00, //
    0x7c, 0x82, 0x82, 0x82, 0x7c, 0x00, 0x00, 0x00, //
    0xfe, 0x10, 0x28, 0x44, 0x82, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0xbe, 0xbe, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicPattern {
    Sigrok,
    Random,
    Incremental,
    AllLow,
    AllHigh,
}

impl LogicPattern {
    pub const ALL: &'static [Self] = &[
        Self::Sigrok,
        Self::Random,
        Self::Incremental,
        Self::AllLow,
        Self::AllHigh,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sigrok => "sigrok",
            Self::Random => "random",
            Self::Incremental => "incremental",
            Self::AllLow => "all-low",
            Self::AllHigh => "all-high",
        }
    }
}

/// Shape of the signal on analog probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    Sine,
    Square,
    Triangle,
    Sawtooth,
}

impl Waveform {
    pub const ALL: &'static [Self] = &[Self::Sine, Self::Square, Self::Triangle, Self::Sawtooth];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sine => "sine",
            Self::Square => "square",
            Self::Triangle => "triangle",
            Self::Sawtooth => "sawtooth",
        }
    }

    /// Value in `[-1, 1]` at `phase` (fraction of a period).
    pub fn value(&self, phase: f32) -> f32 {
        let phase = phase.rem_euclid(1.0);
        match self {
            Self::Sine => (phase * std::f32::consts::TAU).sin(),
            Self::Square => {
                if phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            Self::Triangle => 1.0 - 4.0 * (phase - 0.5).abs(),
            Self::Sawtooth => 2.0 * phase - 1.0,
        }
    }
}

/// Either kind of pattern, as set through `PatternMode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatternName {
    Logic(LogicPattern),
    Analog(Waveform),
}

impl FromStr for PatternName {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(p) = LogicPattern::ALL.iter().find(|p| p.as_str() == s) {
            return Ok(Self::Logic(*p));
        }
        if let Some(w) = Waveform::ALL.iter().find(|w| w.as_str() == s) {
            return Ok(Self::Analog(*w));
        }
        Err(LabError::argument(format!("demo: unknown pattern '{s}'")))
    }
}

impl fmt::Display for LogicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Waveform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct DemoDevice {
    samplerate: u64,
    limit_samples: u64,
    limit_msec: u64,
    logic_pattern: LogicPattern,
    waveform: Waveform,
    run: Option<Rc<RefCell<DemoRun>>>,
}

impl Default for DemoDevice {
    fn default() -> Self {
        Self {
            samplerate: DEFAULT_SAMPLERATE,
            limit_samples: 0,
            limit_msec: 0,
            logic_pattern: LogicPattern::Sigrok,
            waveform: Waveform::Sine,
            run: None,
        }
    }
}

/// State of one acquisition, shared with its event-loop source.
struct DemoRun {
    dev: DeviceInstance,
    fd: SourceFd,
    unitsize: usize,
    num_analog: usize,
    samplerate: u64,
    limit_samples: u64,
    limit_msec: u64,
    pattern: LogicPattern,
    waveform: Waveform,
    matcher: TriggerMatcher,
    started: Instant,
    /// Samples generated, including discarded pre-trigger ones.
    generated: u64,
    /// Samples sent after the trigger.
    sent: u64,
    step: u64,
    stop_requested: bool,
    finished: bool,
}

impl DemoRun {
    fn send(&self, cx: &mut AcquisitionContext<'_>, packet: &Packet<'_>) {
        if let Err(e) = cx.send(&self.dev, packet) {
            log::error!("demo: {e}");
        }
    }

    fn fill_logic(&mut self, buf: &mut [u8]) {
        match self.pattern {
            LogicPattern::Sigrok => {
                for sample in buf.chunks_mut(self.unitsize) {
                    sample.fill(SIGROK_PATTERN[(self.step % 64) as usize]);
                    self.step += 1;
                }
            }
            LogicPattern::Random => rand::thread_rng().fill_bytes(buf),
            LogicPattern::Incremental => {
                for sample in buf.chunks_mut(self.unitsize) {
                    sample.fill(self.step as u8);
                    self.step += 1;
                }
            }
            LogicPattern::AllLow => buf.fill(0x00),
            LogicPattern::AllHigh => buf.fill(0xff),
        }
    }

    /// Samples due now, given the elapsed time and the limits.
    fn samples_due(&self) -> u64 {
        let elapsed = self.started.elapsed();
        let mut due_total = (elapsed.as_secs_f64() * self.samplerate as f64) as u64;
        if self.limit_msec > 0 {
            due_total = due_total.min(self.limit_msec * self.samplerate / 1000);
        }
        let mut due = due_total.saturating_sub(self.generated).min(MAX_SAMPLES_PER_PASS);
        if self.limit_samples > 0 && self.matcher.is_fired() {
            due = due.min(self.limit_samples.saturating_sub(self.sent));
        }
        due
    }

    fn limits_reached(&self) -> bool {
        (self.limit_samples > 0 && self.sent >= self.limit_samples)
            || (self.limit_msec > 0
                && self.started.elapsed() >= Duration::from_millis(self.limit_msec))
    }

    fn pass(&mut self, cx: &mut AcquisitionContext<'_>) -> bool {
        if self.finished {
            return false;
        }
        if self.stop_requested || self.limits_reached() {
            self.finish(cx);
            return false;
        }

        let due = self.samples_due();
        if due == 0 {
            return true;
        }
        let mut logic = vec![0u8; due as usize * self.unitsize];
        self.fill_logic(&mut logic);
        let first_sample = self.generated;
        self.generated += due;

        let mut offset = 0;
        if !self.matcher.is_fired() {
            let samples: Vec<u16> = logic
                .chunks(self.unitsize)
                .map(|s| u16::from_le_bytes([s[0], s.get(1).copied().unwrap_or(0)]))
                .collect();
            let Some(trigger_offset) = self.matcher.scan(&samples) else {
                return true;
            };
            // The sample that completed the chain is the first one sent.
            offset = trigger_offset - 1;
            log::debug!("demo: trigger fired at sample {}", first_sample + offset as u64);
            self.send(cx, &Packet::Trigger);
        }

        let mut count = due - offset as u64;
        if self.limit_samples > 0 {
            count = count.min(self.limit_samples.saturating_sub(self.sent));
        }
        if count > 0 {
            let start = offset * self.unitsize;
            let end = start + count as usize * self.unitsize;
            self.send(cx, &Packet::Logic(Logic::new(self.unitsize as u16, &logic[start..end])));
            self.send_analog(first_sample + offset as u64, count, cx);
            self.sent += count;
        }

        if self.limits_reached() {
            self.finish(cx);
            return false;
        }
        true
    }

    fn send_analog(&self, first_sample: u64, count: u64, cx: &mut AcquisitionContext<'_>) {
        if self.num_analog == 0 {
            return;
        }
        let values: Vec<f32> = (first_sample..first_sample + count)
            .map(|i| {
                let phase = (i % ANALOG_PERIOD) as f32 / ANALOG_PERIOD as f32;
                ANALOG_AMPLITUDE * self.waveform.value(phase)
            })
            .collect();
        for _ in 0..self.num_analog {
            self.send(
                cx,
                &Packet::Analog(Analog::new(MeasuredQuantity::Voltage, Unit::Volt, &values)),
            );
        }
    }

    fn finish(&mut self, cx: &mut AcquisitionContext<'_>) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.send(cx, &Packet::End);
        cx.sources.remove(self.fd);
        log::info!("demo: acquisition finished after {} samples", self.sent);
    }
}

pub struct DemoDriver {
    devices: DeviceList<DemoDevice>,
    initialized: bool,
}

impl DemoDriver {
    pub fn new() -> Self {
        Self {
            devices: DeviceList::new(),
            initialized: false,
        }
    }

    fn close_device(dev: &DeviceInstance, state: &mut DemoDevice) -> Result<()> {
        if let Some(run) = &state.run {
            run.borrow_mut().stop_requested = true;
        }
        dev.set_status(DeviceStatus::Inactive)
    }
}

impl Default for DemoDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for DemoDriver {
    fn info(&self) -> &'static DriverInfo {
        &DRIVER_INFO
    }

    fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Err(LabError::bug("demo: init called twice"));
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
            return Err(LabError::bug("demo: driver used before init"));
        }
        let num_logic = match ConfigOption::find(options, ConfigKey::NumLogicProbes) {
            Some(v) => v.as_u64()?,
            None => DEFAULT_NUM_LOGIC_PROBES,
        };
        let num_analog = match ConfigOption::find(options, ConfigKey::NumAnalogProbes) {
            Some(v) => v.as_u64()?,
            None => DEFAULT_NUM_ANALOG_PROBES,
        };
        if num_logic > MAX_LOGIC_PROBES {
            return Err(LabError::argument(format!(
                "demo: at most {MAX_LOGIC_PROBES} logic probes"
            )));
        }

        let mut probes: Vec<Probe> = (0..num_logic as usize)
            .map(|i| Probe::new(i, ProbeKind::Logic, true, format!("D{i}")))
            .collect();
        probes.extend((0..num_analog as usize).map(|i| {
            Probe::new(num_logic as usize + i, ProbeKind::Analog, true, format!("A{i}"))
        }));

        let index = self.devices.next_index();
        let dev = DeviceInstance::new(index, DeviceStatus::Inactive, "Demo", "Demo device", "")
            .with_probes(probes);
        log::debug!("demo: created {dev} with {num_logic} logic and {num_analog} analog probes");
        self.devices.push(dev.clone(), DemoDevice::default());
        Ok(vec![dev])
    }

    fn dev_list(&self) -> Vec<DeviceInstance> {
        self.devices.instances()
    }

    fn dev_clear(&mut self) -> Result<()> {
        self.devices.clear(DRIVER_INFO.name, Self::close_device)
    }

    fn dev_open(&mut self, dev: &DeviceInstance) -> Result<()> {
        self.devices.get(dev)?;
        if dev.is_active() {
            return Err(LabError::DeviceBusy);
        }
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
        let dev = dev.ok_or_else(|| LabError::argument(format!("demo: {key} needs a device")))?;
        let state = self.devices.get(dev)?;
        match key {
            ConfigKey::Samplerate => Ok(ConfigValue::UInt64(state.samplerate)),
            ConfigKey::LimitSamples => Ok(ConfigValue::UInt64(state.limit_samples)),
            ConfigKey::LimitMsec => Ok(ConfigValue::UInt64(state.limit_msec)),
            ConfigKey::Continuous => Ok(ConfigValue::Bool(
                state.limit_samples == 0 && state.limit_msec == 0,
            )),
            ConfigKey::PatternMode => Ok(ConfigValue::String(state.logic_pattern.to_string())),
            _ => Err(LabError::not_applicable(format!("demo: cannot read {key}"))),
        }
    }

    fn config_set(&mut self, key: ConfigKey, value: &ConfigValue, dev: &DeviceInstance) -> Result<()> {
        if !dev.is_active() {
            return Err(LabError::DeviceClosed);
        }
        let state = self.devices.get_mut(dev)?;
        match key {
            ConfigKey::Samplerate => {
                let rate = value.as_u64()?;
                if rate == 0 || rate > MAX_SAMPLERATE {
                    return Err(LabError::Samplerate(rate));
                }
                state.samplerate = rate;
            }
            ConfigKey::LimitSamples => {
                state.limit_samples = value.as_u64()?;
                state.limit_msec = 0;
            }
            ConfigKey::LimitMsec => {
                state.limit_msec = value.as_u64()?;
                state.limit_samples = 0;
            }
            ConfigKey::Continuous => {
                if value.as_bool()? {
                    state.limit_samples = 0;
                    state.limit_msec = 0;
                }
            }
            ConfigKey::PatternMode => match value.as_str()?.parse::<PatternName>()? {
                PatternName::Logic(p) => state.logic_pattern = p,
                PatternName::Analog(w) => state.waveform = w,
            },
            _ => return Err(LabError::not_applicable(format!("demo: cannot set {key}"))),
        }
        log::debug!("demo: {key} set on {dev}");
        Ok(())
    }

    fn config_list(&self, key: ConfigKey, _dev: Option<&DeviceInstance>) -> Result<ConfigValue> {
        match key {
            ConfigKey::ScanOptions => Ok(ConfigValue::Keys(SCAN_OPTIONS.to_vec())),
            ConfigKey::DeviceOptions => Ok(ConfigValue::Keys(CAPABILITIES.to_vec())),
            ConfigKey::PatternMode => Ok(ConfigValue::StringList(
                LogicPattern::ALL
                    .iter()
                    .map(LogicPattern::as_str)
                    .chain(Waveform::ALL.iter().map(Waveform::as_str))
                    .map(str::to_string)
                    .collect(),
            )),
            ConfigKey::TriggerType => Ok(ConfigValue::String(TRIGGER_TYPES.to_string())),
            _ => Err(LabError::not_applicable(format!("demo: no list for {key}"))),
        }
    }

    fn acquisition_start(&mut self, dev: &DeviceInstance, cx: &mut AcquisitionContext<'_>) -> Result<()> {
        if !dev.is_active() {
            return Err(LabError::DeviceClosed);
        }
        let state = self.devices.get_mut(dev)?;
        if state.run.as_ref().is_some_and(|r| !r.borrow().finished) {
            return Err(LabError::generic(format!("demo: {dev} is already acquiring")));
        }

        let (num_logic, num_analog, trigger) = {
            let probes = dev.probes();
            (
                dev.num_probes(ProbeKind::Logic),
                dev.num_probes(ProbeKind::Analog),
                Trigger::from_probes(&probes, NUM_TRIGGER_STAGES)?,
            )
        };
        let unitsize = num_logic.div_ceil(8).max(1);

        let fd = cx.sources.allocate_fd();
        let run = Rc::new(RefCell::new(DemoRun {
            dev: dev.clone(),
            fd,
            unitsize,
            num_analog,
            samplerate: state.samplerate,
            limit_samples: state.limit_samples,
            limit_msec: state.limit_msec,
            pattern: state.logic_pattern,
            waveform: state.waveform,
            matcher: TriggerMatcher::new(trigger.as_ref()),
            started: Instant::now(),
            generated: 0,
            sent: 0,
            step: 0,
            stop_requested: false,
            finished: false,
        }));
        state.run = Some(Rc::clone(&run));

        {
            let run = run.borrow();
            run.send(
                cx,
                &Packet::Header(Header::new(state.samplerate, num_logic, num_analog)),
            );
            let meta = [
                ConfigOption::new(ConfigKey::Samplerate, state.samplerate),
                ConfigOption::new(ConfigKey::PatternMode, state.logic_pattern.as_str()),
            ];
            run.send(cx, &Packet::Meta(&meta));
        }

        let source = Rc::clone(&run);
        cx.sources.add(
            fd,
            Events::IN,
            Some(POLL_INTERVAL),
            handler_fn::<Feed, _>(move |_fd, _revents, cx| source.borrow_mut().pass(cx)),
        );
        log::info!(
            "demo: started {dev} at {} Hz, pattern {}",
            state.samplerate,
            state.logic_pattern
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
