//! Replays a saved session as if an instrument were producing it live.
//!
//! A session is a zip archive holding `version`, the `metadata` key file,
//! and the raw logic data of every device, either whole (`logic-1`) or split
//! into numbered chunks (`logic-1-1`, `logic-1-2`, ...). A directory with
//! the extracted entries works too.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use zip::result::ZipError;
use zip::ZipArchive;

use crate::capability::{ConfigKey, ConfigOption, ConfigValue};
use crate::datafeed::{Header, Logic, Packet};
use crate::device::{DeviceInstance, DeviceList, DeviceStatus, Probe, ProbeKind};
use crate::driver::{Driver, DriverInfo};
use crate::error::{LabError, Result};
use crate::event_loop::{handler_fn, Events, SourceFd};
use crate::session::{AcquisitionContext, Feed};

pub static DRIVER_INFO: DriverInfo = DriverInfo {
    name: "virtual-session",
    longname: "Session-emulating driver",
    api_version: 1,
};

/// Most bytes sent in one Logic packet.
pub const CHUNK_SIZE: usize = 512 * 1024;

const SUPPORTED_VERSIONS: std::ops::RangeInclusive<u64> = 1..=2;

static CAPABILITIES: &[ConfigKey] = &[
    ConfigKey::SessionFile,
    ConfigKey::CaptureFile,
    ConfigKey::CaptureUnitsize,
    ConfigKey::Samplerate,
    ConfigKey::NumLogicProbes,
];

static SCAN_OPTIONS: &[ConfigKey] = &[ConfigKey::SessionFile];

/// Parse a size string such as `1 MHz`, `200k` or `12000`.
pub fn parse_size_string(s: &str) -> Result<u64> {
    let bad = || LabError::argument(format!("invalid size '{s}'"));
    let s = s.trim();
    let s = s.strip_suffix("Hz").unwrap_or(s).trim_end();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let multiplier: f64 = match suffix.trim() {
        "" => 1.0,
        "k" | "K" => 1e3,
        "m" | "M" => 1e6,
        "g" | "G" => 1e9,
        _ => return Err(bad()),
    };
    let number: f64 = number.parse().map_err(|_| bad())?;
    Ok((number * multiplier).round() as u64)
}

/// Minimal key file reader: `[section]` headers and `key = value` lines.
fn parse_key_file(text: &str) -> Result<Vec<(String, BTreeMap<String, String>)>> {
    let mut sections: Vec<(String, BTreeMap<String, String>)> = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            sections.push((name.trim().to_string(), BTreeMap::new()));
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            LabError::generic(format!("metadata line {}: expected key = value", lineno + 1))
        })?;
        let (_, entries) = sections.last_mut().ok_or_else(|| {
            LabError::generic(format!("metadata line {}: key outside a section", lineno + 1))
        })?;
        entries.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(sections)
}

/// Where the entries of a session live.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionStore {
    Archive(PathBuf),
    /// Entries already extracted into a directory.
    Dir(PathBuf),
}

impl SessionStore {
    fn at(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if path.is_dir() {
            Self::Dir(path)
        } else {
            Self::Archive(path)
        }
    }

    fn path(&self) -> &Path {
        match self {
            Self::Archive(path) | Self::Dir(path) => path,
        }
    }

    /// Open entry `name`, `None` when the session has no such entry.
    fn open_entry(&self, name: &str) -> Result<Option<Box<dyn Read>>> {
        match self {
            Self::Dir(dir) => {
                let path = dir.join(name);
                if !path.is_file() {
                    return Ok(None);
                }
                Ok(Some(Box::new(File::open(path)?)))
            }
            Self::Archive(path) => {
                let mut archive = ZipArchive::new(File::open(path)?)?;
                let mut entry = match archive.by_name(name) {
                    Ok(entry) => entry,
                    Err(ZipError::FileNotFound) => return Ok(None),
                    Err(e) => return Err(e.into()),
                };
                // Entries borrow the archive, so the data is read up front.
                let mut data = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut data)?;
                Ok(Some(Box::new(Cursor::new(data))))
            }
        }
    }

    fn read_to_string(&self, name: &str) -> Result<String> {
        let mut entry = self.open_entry(name)?.ok_or_else(|| {
            LabError::generic(format!("{} has no {name} entry", self.path().display()))
        })?;
        let mut text = String::new();
        entry.read_to_string(&mut text)?;
        Ok(text)
    }
}

fn read_version(store: &SessionStore) -> Result<u64> {
    let text = store.read_to_string("version").map_err(|e| {
        LabError::generic(format!("{} is not a session: {e}", store.path().display()))
    })?;
    let version: u64 = text
        .trim()
        .parse()
        .map_err(|_| LabError::generic(format!("bad session version '{}'", text.trim())))?;
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(LabError::generic(format!(
            "cannot handle session file version {version}"
        )));
    }
    log::trace!("virtual-session: detected session file version {version}");
    Ok(version)
}

#[derive(Clone)]
struct SessionDevice {
    store: SessionStore,
    capture_file: Option<String>,
    unitsize: usize,
    samplerate: u64,
    num_logic: usize,
    replay: Option<Rc<RefCell<Replay>>>,
}

impl SessionDevice {
    fn from_section(
        store: &SessionStore,
        entries: &BTreeMap<String, String>,
    ) -> Result<(Self, Vec<Probe>)> {
        let bad = |key: &str, value: &str| {
            LabError::generic(format!("metadata: bad value '{value}' for '{key}'"))
        };
        let mut dev = Self {
            store: store.clone(),
            capture_file: entries.get("capturefile").cloned(),
            unitsize: 1,
            samplerate: 0,
            num_logic: 0,
            replay: None,
        };
        if let Some(v) = entries.get("samplerate") {
            dev.samplerate = parse_size_string(v).map_err(|_| bad("samplerate", v))?;
        }
        if let Some(v) = entries.get("unitsize") {
            dev.unitsize = v.parse().ok().filter(|u| *u > 0).ok_or_else(|| bad("unitsize", v))?;
        }
        if let Some(v) = entries.get("total probes") {
            dev.num_logic = v.parse().map_err(|_| bad("total probes", v))?;
        }

        // Probes not named in the file stay disabled.
        let mut probes: Vec<Probe> = (0..dev.num_logic)
            .map(|i| Probe::new(i, ProbeKind::Logic, false, i.to_string()))
            .collect();
        for (key, value) in entries {
            let (number, is_trigger) = if let Some(n) = key.strip_prefix("probe") {
                (n, false)
            } else if let Some(n) = key.strip_prefix("trigger") {
                (n, true)
            } else {
                continue;
            };
            let probe = number
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .and_then(|n| probes.get_mut(n - 1))
                .ok_or_else(|| bad(key, value))?;
            if is_trigger {
                probe.trigger = Some(value.clone());
            } else {
                probe.name = value.clone();
                probe.enabled = true;
            }
        }
        Ok((dev, probes))
    }
}

/// Reads the capture data of one replay, entry by entry.
struct Replay {
    dev: DeviceInstance,
    fd: SourceFd,
    store: SessionStore,
    base: String,
    chunked: bool,
    chunk_no: usize,
    file: Option<Box<dyn Read>>,
    unitsize: usize,
    bytes_sent: u64,
    stop_requested: bool,
    finished: bool,
}

impl Replay {
    fn send(&self, cx: &mut AcquisitionContext<'_>, packet: &Packet<'_>) {
        if let Err(e) = cx.send(&self.dev, packet) {
            log::error!("virtual-session: {e}");
        }
    }

    /// Move on to the next chunk entry, if there is one.
    fn open_next(&mut self) -> Result<bool> {
        if !self.chunked {
            return Ok(false);
        }
        let name = format!("{}-{}", self.base, self.chunk_no + 1);
        let Some(entry) = self.store.open_entry(&name)? else {
            return Ok(false);
        };
        self.file = Some(entry);
        self.chunk_no += 1;
        log::debug!("virtual-session: opened {name}");
        Ok(true)
    }

    fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let max = CHUNK_SIZE / self.unitsize * self.unitsize;
        loop {
            if let Some(file) = &mut self.file {
                let mut buf = Vec::with_capacity(max);
                file.take(max as u64).read_to_end(&mut buf)?;
                if !buf.is_empty() {
                    return Ok(Some(buf));
                }
            }
            self.file = None;
            if !self.open_next()? {
                return Ok(None);
            }
        }
    }

    fn pass(&mut self, cx: &mut AcquisitionContext<'_>) -> bool {
        if self.finished {
            return false;
        }
        if !self.stop_requested {
            match self.read_chunk() {
                Ok(Some(mut data)) => {
                    let stray = data.len() % self.unitsize;
                    if stray != 0 {
                        log::warn!(
                            "virtual-session: read {} bytes, not a multiple of unit size {}",
                            data.len(),
                            self.unitsize
                        );
                        data.truncate(data.len() - stray);
                    }
                    self.bytes_sent += data.len() as u64;
                    self.send(cx, &Packet::Logic(Logic::new(self.unitsize as u16, &data)));
                    return true;
                }
                Ok(None) => {}
                Err(e) => log::error!("virtual-session: read failed: {e}"),
            }
        }
        self.finished = true;
        self.send(cx, &Packet::End);
        cx.sources.remove(self.fd);
        log::info!("virtual-session: replayed {} bytes", self.bytes_sent);
        false
    }
}

pub struct SessionFileDriver {
    devices: DeviceList<SessionDevice>,
    initialized: bool,
}

impl SessionFileDriver {
    pub fn new() -> Self {
        Self {
            devices: DeviceList::new(),
            initialized: false,
        }
    }

    fn close_device(dev: &DeviceInstance, state: &mut SessionDevice) -> Result<()> {
        if let Some(replay) = &state.replay {
            replay.borrow_mut().stop_requested = true;
        }
        dev.set_status(DeviceStatus::Inactive)
    }
}

impl Default for SessionFileDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for SessionFileDriver {
    fn info(&self) -> &'static DriverInfo {
        &DRIVER_INFO
    }

    fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Err(LabError::bug("virtual-session: init called twice"));
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
            return Err(LabError::bug("virtual-session: driver used before init"));
        }
        let Some(path) = ConfigOption::find(options, ConfigKey::SessionFile) else {
            log::debug!("virtual-session: no session file given, nothing to scan");
            return Ok(Vec::new());
        };
        let store = SessionStore::at(path.as_str()?);
        read_version(&store)?;
        let text = store
            .read_to_string("metadata")
            .map_err(|e| LabError::generic(format!("cannot read session metadata: {e}")))?;

        let mut found = Vec::new();
        for (name, entries) in parse_key_file(&text)? {
            if !name.starts_with("device ") {
                continue;
            }
            if !entries.contains_key("capturefile") {
                log::debug!("virtual-session: [{name}] has no logic data, skipped");
                continue;
            }
            let (state, probes) = SessionDevice::from_section(&store, &entries)?;
            let index = self.devices.next_index();
            let dev = DeviceInstance::new(index, DeviceStatus::Inactive, "", "Virtual session", "")
                .with_probes(probes);
            log::debug!(
                "virtual-session: {dev} replays {} at {} Hz",
                state.capture_file.as_deref().unwrap_or_default(),
                state.samplerate
            );
            self.devices.push(dev.clone(), state);
            found.push(dev);
        }
        Ok(found)
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
        let dev = dev.ok_or_else(|| {
            LabError::argument(format!("virtual-session: {key} needs a device"))
        })?;
        let state = self.devices.get(dev)?;
        match key {
            ConfigKey::Samplerate => Ok(ConfigValue::UInt64(state.samplerate)),
            ConfigKey::CaptureUnitsize => Ok(ConfigValue::UInt64(state.unitsize as u64)),
            ConfigKey::NumLogicProbes => Ok(ConfigValue::UInt64(state.num_logic as u64)),
            ConfigKey::SessionFile => {
                Ok(ConfigValue::String(state.store.path().display().to_string()))
            }
            ConfigKey::CaptureFile => state
                .capture_file
                .clone()
                .map(ConfigValue::String)
                .ok_or_else(|| LabError::not_applicable("virtual-session: no capture file")),
            _ => Err(LabError::not_applicable(format!("virtual-session: cannot read {key}"))),
        }
    }

    fn config_set(&mut self, key: ConfigKey, value: &ConfigValue, dev: &DeviceInstance) -> Result<()> {
        let state = self.devices.get_mut(dev)?;
        match key {
            ConfigKey::Samplerate => state.samplerate = value.as_u64()?,
            ConfigKey::SessionFile => state.store = SessionStore::at(value.as_str()?),
            ConfigKey::CaptureFile => state.capture_file = Some(value.as_str()?.to_string()),
            ConfigKey::CaptureUnitsize => {
                let unitsize = value.as_u64()?;
                if unitsize == 0 {
                    return Err(LabError::argument("virtual-session: unit size must not be 0"));
                }
                state.unitsize = unitsize as usize;
            }
            ConfigKey::NumLogicProbes => state.num_logic = value.as_u64()? as usize,
            _ => {
                return Err(LabError::not_applicable(format!(
                    "virtual-session: cannot set {key}"
                )))
            }
        }
        Ok(())
    }

    fn config_list(&self, key: ConfigKey, _dev: Option<&DeviceInstance>) -> Result<ConfigValue> {
        match key {
            ConfigKey::ScanOptions => Ok(ConfigValue::Keys(SCAN_OPTIONS.to_vec())),
            ConfigKey::DeviceOptions => Ok(ConfigValue::Keys(CAPABILITIES.to_vec())),
            _ => Err(LabError::not_applicable(format!("virtual-session: no list for {key}"))),
        }
    }

    fn acquisition_start(&mut self, dev: &DeviceInstance, cx: &mut AcquisitionContext<'_>) -> Result<()> {
        if !dev.is_active() {
            return Err(LabError::DeviceClosed);
        }
        let state = self.devices.get_mut(dev)?;
        let capture_file = state
            .capture_file
            .as_deref()
            .ok_or_else(|| LabError::argument(format!("virtual-session: {dev} has no capture file")))?;

        let fd = cx.sources.allocate_virtual_fd();
        let mut replay = Replay {
            dev: dev.clone(),
            fd,
            store: state.store.clone(),
            base: capture_file.to_string(),
            chunked: false,
            chunk_no: 0,
            file: None,
            unitsize: state.unitsize,
            bytes_sent: 0,
            stop_requested: false,
            finished: false,
        };
        if let Some(entry) = state.store.open_entry(capture_file)? {
            replay.file = Some(entry);
        } else {
            replay.chunked = true;
            if !replay.open_next()? {
                return Err(LabError::not_found(format!(
                    "virtual-session: no capture data {} in {}",
                    capture_file,
                    state.store.path().display()
                )));
            }
        }

        replay.send(
            cx,
            &Packet::Header(Header::new(state.samplerate, state.num_logic, 0)),
        );
        replay.send(
            cx,
            &Packet::Meta(&[ConfigOption::new(ConfigKey::Samplerate, state.samplerate)]),
        );
        let replay = Rc::new(RefCell::new(replay));
        state.replay = Some(Rc::clone(&replay));
        cx.sources.add(
            fd,
            Events::IN,
            None,
            handler_fn::<Feed, _>(move |_fd, _revents, cx| replay.borrow_mut().pass(cx)),
        );
        Ok(())
    }

    fn acquisition_stop(&mut self, dev: &DeviceInstance, _cx: &mut AcquisitionContext<'_>) -> Result<()> {
        let state = self.devices.get(dev)?;
        if let Some(replay) = &state.replay {
            replay.borrow_mut().stop_requested = true;
        }
        Ok(())
    }
}
