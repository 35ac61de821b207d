//! Driver for Cypress FX2 based logic analyzers running the open fx2lafw
//! firmware.
//!
//! Devices without the firmware get it uploaded during [`Driver::scan`];
//! they drop off the bus and come back at a new address, which
//! [`Driver::dev_open`] waits for.

mod acquisition;
pub mod protocol;

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use crate::capability::{ConfigKey, ConfigOption, ConfigValue};
use crate::device::{DeviceInstance, DeviceList, DeviceStatus, Probe, ProbeKind};
use crate::driver::{Driver, DriverInfo};
use crate::error::{LabError, Result};
use crate::session::AcquisitionContext;
use crate::trigger::{Trigger, TRIGGER_TYPES};
use crate::usb::{ezusb, UsbContext, UsbDeviceInfo, UsbError, UsbHandle};

use acquisition::{Acquisition, AcquisitionParams, SharedAcquisition};
use protocol::{USB_CONFIGURATION, USB_INTERFACE};

pub static DRIVER_INFO: DriverInfo = DriverInfo {
    name: "fx2lafw",
    longname: "fx2lafw (generic driver for FX2 based LAs)",
    api_version: 1,
};

/// Where firmware images are looked up unless [`Fx2Config::firmware_dir`]
/// says otherwise. Set `LABFEED_FIRMWARE_DIR` at build time to change it.
pub const FIRMWARE_DIR: &str = match option_env!("LABFEED_FIRMWARE_DIR") {
    Some(dir) => dir,
    None => "/usr/local/share/sigrok-firmware",
};

pub(crate) type SharedUsbHandle = Rc<RefCell<Box<dyn UsbHandle>>>;

const NUM_TRIGGER_STAGES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fx2Profile {
    pub vid: u16,
    pub pid: u16,
    pub vendor: &'static str,
    pub model: &'static str,
    pub model_version: &'static str,
    pub firmware: &'static str,
    /// Sixteen probes instead of eight.
    pub sample_wide: bool,
}

pub static PROFILES: &[Fx2Profile] = &[
    Fx2Profile {
        vid: 0x08a9,
        pid: 0x0014,
        vendor: "CWAV",
        model: "USBee AX",
        model_version: "",
        firmware: "fx2lafw-cwav-usbeeax.fw",
        sample_wide: false,
    },
    Fx2Profile {
        vid: 0x08a9,
        pid: 0x0015,
        vendor: "CWAV",
        model: "USBee DX",
        model_version: "",
        firmware: "fx2lafw-cwav-usbeedx.fw",
        sample_wide: true,
    },
    Fx2Profile {
        vid: 0x08a9,
        pid: 0x0009,
        vendor: "CWAV",
        model: "USBee SX",
        model_version: "",
        firmware: "fx2lafw-cwav-usbeesx.fw",
        sample_wide: false,
    },
    Fx2Profile {
        vid: 0x0925,
        pid: 0x3881,
        vendor: "Saleae",
        model: "Logic",
        model_version: "",
        firmware: "fx2lafw-saleae-logic.fw",
        sample_wide: false,
    },
    Fx2Profile {
        vid: 0x04b4,
        pid: 0x8613,
        vendor: "Cypress",
        model: "FX2",
        model_version: "",
        firmware: "fx2lafw-cypress-fx2.fw",
        sample_wide: true,
    },
    Fx2Profile {
        vid: 0x16d0,
        pid: 0x0498,
        vendor: "Braintechnology",
        model: "USB-LPS",
        model_version: "",
        firmware: "fx2lafw-braintechnology-usb-lps.fw",
        sample_wide: true,
    },
];

pub const SAMPLERATES: &[u64] = &[
    20_000, 25_000, 50_000, 100_000, 200_000, 250_000, 500_000, 1_000_000, 2_000_000,
    3_000_000, 4_000_000, 6_000_000, 8_000_000, 12_000_000, 16_000_000, 24_000_000,
];

static CAPABILITIES: &[ConfigKey] = &[
    ConfigKey::LogicAnalyzer,
    ConfigKey::Samplerate,
    ConfigKey::TriggerType,
    ConfigKey::LimitSamples,
    ConfigKey::Continuous,
];

/// Tuning knobs. The defaults suit real hardware; tests shrink the delays.
#[derive(Debug, Clone)]
pub struct Fx2Config {
    pub num_transfers: usize,
    /// Size of the first transfer of a run, small so data starts flowing.
    pub first_transfer_size: usize,
    pub transfer_size: usize,
    /// Consecutive empty transfers tolerated before the run ends.
    /// `None` means twice the pool size.
    pub max_empty_transfers: Option<usize>,
    /// How long a renumerating device may take to come back.
    pub renum_delay: Duration,
    pub renum_poll: Duration,
    /// Wait before the first attempt to find a renumerated device.
    pub renum_settle: Duration,
    pub firmware_dir: PathBuf,
}

impl Default for Fx2Config {
    fn default() -> Self {
        Self {
            num_transfers: 32,
            first_transfer_size: 2048,
            transfer_size: 4096,
            max_empty_transfers: None,
            renum_delay: Duration::from_millis(3000),
            renum_poll: Duration::from_millis(100),
            renum_settle: Duration::from_millis(300),
            firmware_dir: PathBuf::from(FIRMWARE_DIR),
        }
    }
}

impl Fx2Config {
    pub fn with_num_transfers(mut self, n: usize) -> Self {
        self.num_transfers = n;
        self
    }

    pub fn with_transfer_sizes(mut self, first: usize, rest: usize) -> Self {
        self.first_transfer_size = first;
        self.transfer_size = rest;
        self
    }

    pub fn with_max_empty_transfers(mut self, n: usize) -> Self {
        self.max_empty_transfers = Some(n);
        self
    }

    pub fn with_renumeration(mut self, delay: Duration, poll: Duration, settle: Duration) -> Self {
        self.renum_delay = delay;
        self.renum_poll = poll;
        self.renum_settle = settle;
        self
    }

    pub fn with_firmware_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.firmware_dir = dir.into();
        self
    }

    pub fn max_empty(&self) -> usize {
        self.max_empty_transfers
            .unwrap_or(2 * self.num_transfers)
    }
}

struct Fx2Device {
    profile: &'static Fx2Profile,
    bus: u8,
    /// Unknown while the device is renumerating.
    address: Option<u8>,
    /// When the firmware was uploaded, until the device is next opened.
    fw_updated: Option<Instant>,
    handle: Option<SharedUsbHandle>,
    samplerate: u64,
    limit_samples: u64,
    acquisition: Option<SharedAcquisition>,
}

impl Fx2Device {
    fn new(profile: &'static Fx2Profile, bus: u8) -> Self {
        Self {
            profile,
            bus,
            address: None,
            fw_updated: None,
            handle: None,
            samplerate: 0,
            limit_samples: 0,
            acquisition: None,
        }
    }

    fn num_probes(&self) -> usize {
        if self.profile.sample_wide {
            16
        } else {
            8
        }
    }
}

pub struct Fx2lafw {
    usb: Box<dyn UsbContext>,
    config: Fx2Config,
    devices: DeviceList<Fx2Device>,
    initialized: bool,
}

impl Fx2lafw {
    pub fn new(usb: Box<dyn UsbContext>, config: Fx2Config) -> Self {
        Self {
            usb,
            config,
            devices: DeviceList::new(),
            initialized: false,
        }
    }

    pub fn config(&self) -> &Fx2Config {
        &self.config
    }

    /// When firmware was uploaded to `dev`, if it has not been opened since.
    pub fn fw_updated(&self, dev: &DeviceInstance) -> Option<Instant> {
        self.devices.get(dev).ok().and_then(|s| s.fw_updated)
    }

    /// Bus address of `dev`, `None` while it renumerates.
    pub fn usb_address(&self, dev: &DeviceInstance) -> Option<u8> {
        self.devices.get(dev).ok().and_then(|s| s.address)
    }

    /// Samples delivered in the last (or current) run of `dev`.
    pub fn samples_acquired(&self, dev: &DeviceInstance) -> u64 {
        self.devices
            .get(dev)
            .ok()
            .and_then(|s| s.acquisition.as_ref())
            .map_or(0, |acq| acq.borrow().num_samples())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(LabError::bug("fx2lafw: driver used before init"))
        }
    }

    fn has_fx2lafw_firmware(info: &UsbDeviceInfo) -> bool {
        info.manufacturer
            .as_deref()
            .is_some_and(|m| m.starts_with("sigrok"))
            && info.product.as_deref().is_some_and(|p| p.starts_with("fx2lafw"))
    }

    fn profile_for(info: &UsbDeviceInfo) -> Option<&'static Fx2Profile> {
        PROFILES
            .iter()
            .find(|p| p.vid == info.vendor_id && p.pid == info.product_id)
    }

    /// Whether `info` is a device some instance already stands for.
    fn is_owned(&self, info: &UsbDeviceInfo, profile: &Fx2Profile) -> bool {
        self.devices.iter().any(|(_, state)| {
            if state.address.is_some() {
                state.bus == info.bus && state.address == Some(info.address)
            } else {
                // Renumerating devices come back with fresh addresses.
                state.fw_updated.is_some() && std::ptr::eq(state.profile, profile)
            }
        })
    }

    /// Locate `dev` on the bus, open it and check the firmware.
    fn try_open(&mut self, dev: &DeviceInstance) -> Result<(Box<dyn UsbHandle>, UsbDeviceInfo)> {
        let state = self.devices.get(dev)?;
        let (profile, bus, address) = (state.profile, state.bus, state.address);
        // Position among the instances sharing this profile, used while the
        // address is unknown.
        let ordinal = self
            .devices
            .iter()
            .take_while(|(d, _)| !d.ptr_eq(dev))
            .filter(|(_, s)| std::ptr::eq(s.profile, profile))
            .count();

        let listing = self.usb.devices()?;
        let info = match address {
            Some(address) => listing
                .into_iter()
                .find(|i| i.bus == bus && i.address == address),
            None => listing
                .into_iter()
                .filter(|i| {
                    i.vendor_id == profile.vid
                        && i.product_id == profile.pid
                        && Self::has_fx2lafw_firmware(i)
                })
                .nth(ordinal),
        }
        .ok_or_else(|| LabError::not_found(format!("{dev} is not on the bus")))?;

        let mut handle = self.usb.open(&info)?;
        let version = protocol::get_fw_version(handle.as_mut()).map_err(|e| {
            log::error!("fx2lafw: failed to get firmware version: {e}");
            e
        })?;
        let revid = protocol::get_revid_version(handle.as_mut()).map_err(|e| {
            log::error!("fx2lafw: failed to get REVID: {e}");
            e
        })?;
        if version.major != protocol::REQUIRED_VERSION_MAJOR {
            return Err(LabError::generic(format!(
                "fx2lafw: expected firmware version {}.x, got {}.{}",
                protocol::REQUIRED_VERSION_MAJOR,
                version.major,
                version.minor
            )));
        }
        log::info!(
            "fx2lafw: {info} runs firmware {}.{}, REVID {revid}",
            version.major,
            version.minor
        );
        Ok((handle, info))
    }

    fn close_device(dev: &DeviceInstance, state: &mut Fx2Device) -> Result<()> {
        let Some(handle) = state.handle.take() else {
            return Ok(());
        };
        if let Some(acq) = &state.acquisition {
            let mut acq = acq.borrow_mut();
            if !acq.is_finished() {
                acq.abort();
                // Cancelled transfers come back through the pump, which
                // sends End once the last one is reaped.
                handle.borrow_mut().cancel_transfers();
            }
        }
        log::info!(
            "fx2lafw: closing {dev} on {}.{} interface {USB_INTERFACE}",
            state.bus,
            state.address.unwrap_or_default()
        );
        let released = handle.borrow_mut().release_interface(USB_INTERFACE);
        if let Err(e) = released {
            log::warn!("fx2lafw: failed to release interface: {e}");
        }
        dev.set_status(DeviceStatus::Inactive)
    }
}

impl Driver for Fx2lafw {
    fn info(&self) -> &'static DriverInfo {
        &DRIVER_INFO
    }

    fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Err(LabError::bug("fx2lafw: init called twice"));
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
        self.ensure_initialized()?;
        for opt in options {
            log::debug!("fx2lafw: ignoring scan option {}", opt.key);
        }

        let listing = self.usb.devices()?;
        let mut found = Vec::new();
        for info in listing {
            let Some(profile) = Self::profile_for(&info) else {
                continue;
            };
            if self.is_owned(&info, profile) {
                log::trace!("fx2lafw: {info} is already known");
                continue;
            }

            let index = self.devices.next_index();
            let dev = DeviceInstance::new(
                index,
                DeviceStatus::Initializing,
                profile.vendor,
                profile.model,
                profile.model_version,
            );
            let mut state = Fx2Device::new(profile, info.bus);
            dev.set_probes(Probe::logic_set(state.num_probes()));

            if Self::has_fx2lafw_firmware(&info) {
                log::debug!("fx2lafw: found an fx2lafw device at {info}");
                state.address = Some(info.address);
                dev.set_status(DeviceStatus::Inactive)?;
            } else {
                let path = self.config.firmware_dir.join(profile.firmware);
                match ezusb::upload_firmware(self.usb.as_mut(), &info, USB_CONFIGURATION, &path) {
                    Ok(()) => {
                        state.fw_updated = Some(Instant::now());
                        dev.set_status(DeviceStatus::Inactive)?;
                    }
                    Err(e) => log::error!("fx2lafw: firmware upload to {info} failed: {e}"),
                }
            }
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
        let fw_updated = self.devices.get(dev)?.fw_updated;
        match dev.status() {
            DeviceStatus::Active => return Err(LabError::DeviceBusy),
            DeviceStatus::Initializing => {
                return Err(LabError::generic(format!(
                    "fx2lafw: {dev} has no firmware running, rescan"
                )))
            }
            _ => {}
        }

        let (handle, info) = match fw_updated {
            Some(updated) => {
                log::info!("fx2lafw: waiting for {dev} to renumerate");
                thread::sleep(self.config.renum_settle);
                loop {
                    match self.try_open(dev) {
                        Ok(opened) => {
                            log::info!(
                                "fx2lafw: device came back after {} ms",
                                updated.elapsed().as_millis()
                            );
                            break opened;
                        }
                        Err(e) if updated.elapsed() >= self.config.renum_delay => {
                            log::error!("fx2lafw: device failed to renumerate: {e}");
                            return Err(LabError::Timeout {
                                duration_ms: self.config.renum_delay.as_millis() as u64,
                            });
                        }
                        Err(e) => {
                            log::trace!("fx2lafw: not back yet: {e}");
                            thread::sleep(self.config.renum_poll);
                        }
                    }
                }
            }
            None => self.try_open(dev)?,
        };

        let mut handle = handle;
        handle.claim_interface(USB_INTERFACE).map_err(|e| {
            match &e {
                UsbError::Busy => log::error!(
                    "fx2lafw: unable to claim USB interface, another program or driver has \
                     already claimed it"
                ),
                UsbError::Disconnected => log::error!("fx2lafw: device has been disconnected"),
                other => log::error!("fx2lafw: unable to claim interface: {other}"),
            }
            LabError::from(e)
        })?;

        let state = self.devices.get_mut(dev)?;
        state.address = Some(info.address);
        state.fw_updated = None;
        state.handle = Some(Rc::new(RefCell::new(handle)));
        if state.samplerate == 0 {
            state.samplerate = SAMPLERATES[0];
        }
        dev.set_status(DeviceStatus::Active)?;
        log::info!(
            "fx2lafw: opened {dev} on {}.{} interface {USB_INTERFACE}",
            info.bus,
            info.address
        );
        Ok(())
    }

    fn dev_close(&mut self, dev: &DeviceInstance) -> Result<()> {
        let state = self.devices.get_mut(dev)?;
        Self::close_device(dev, state)
    }

    fn capabilities(&self) -> &'static [ConfigKey] {
        CAPABILITIES
    }

    fn config_get(&self, key: ConfigKey, dev: Option<&DeviceInstance>) -> Result<ConfigValue> {
        let dev = dev.ok_or_else(|| LabError::argument(format!("fx2lafw: {key} needs a device")))?;
        let state = self.devices.get(dev)?;
        match key {
            ConfigKey::Samplerate => Ok(ConfigValue::UInt64(state.samplerate)),
            ConfigKey::LimitSamples => Ok(ConfigValue::UInt64(state.limit_samples)),
            ConfigKey::Continuous => Ok(ConfigValue::Bool(state.limit_samples == 0)),
            _ => Err(LabError::not_applicable(format!("fx2lafw: cannot read {key}"))),
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
                if !SAMPLERATES.contains(&rate) {
                    return Err(LabError::Samplerate(rate));
                }
                state.samplerate = rate;
            }
            ConfigKey::LimitSamples => state.limit_samples = value.as_u64()?,
            ConfigKey::Continuous if value.as_bool()? => state.limit_samples = 0,
            ConfigKey::Continuous => {}
            _ => return Err(LabError::not_applicable(format!("fx2lafw: cannot set {key}"))),
        }
        log::debug!("fx2lafw: {key} set on {dev}");
        Ok(())
    }

    fn config_list(&self, key: ConfigKey, _dev: Option<&DeviceInstance>) -> Result<ConfigValue> {
        match key {
            ConfigKey::DeviceOptions => Ok(ConfigValue::Keys(CAPABILITIES.to_vec())),
            ConfigKey::ScanOptions => Ok(ConfigValue::Keys(Vec::new())),
            ConfigKey::Samplerate => Ok(ConfigValue::UInt64List(SAMPLERATES.to_vec())),
            ConfigKey::TriggerType => Ok(ConfigValue::String(TRIGGER_TYPES.to_string())),
            _ => Err(LabError::not_applicable(format!("fx2lafw: no list for {key}"))),
        }
    }

    fn acquisition_start(&mut self, dev: &DeviceInstance, cx: &mut AcquisitionContext<'_>) -> Result<()> {
        if !dev.is_active() {
            return Err(LabError::DeviceClosed);
        }
        let state = self.devices.get_mut(dev)?;
        if let Some(acq) = &state.acquisition {
            if !acq.borrow().is_finished() {
                return Err(LabError::generic(format!(
                    "fx2lafw: {dev} is already acquiring"
                )));
            }
        }
        let handle = state
            .handle
            .clone()
            .ok_or_else(|| LabError::bug(format!("fx2lafw: {dev} is active without a handle")))?;

        let (sample_wide, trigger) = {
            let probes = dev.probes();
            let wide = probes
                .iter()
                .any(|p| p.enabled && p.kind == ProbeKind::Logic && p.index >= 8);
            (wide, Trigger::from_probes(&probes, NUM_TRIGGER_STAGES)?)
        };
        if sample_wide && !state.profile.sample_wide {
            return Err(LabError::argument(format!(
                "fx2lafw: {dev} has only 8 probes"
            )));
        }
        // Fail on an unreachable rate before anything is queued.
        protocol::start_command(state.samplerate, sample_wide)?;

        let params = AcquisitionParams {
            samplerate: state.samplerate,
            sample_wide,
            limit_samples: state.limit_samples,
            num_transfers: self.config.num_transfers,
            first_transfer_size: self.config.first_transfer_size,
            transfer_size: self.config.transfer_size,
            max_empty_transfers: self.config.max_empty(),
        };
        let acq = Acquisition::start(dev.clone(), Rc::clone(&handle), params, trigger.as_ref(), cx)?;
        state.acquisition = Some(Rc::clone(&acq));

        let mut h = handle.borrow_mut();
        if let Err(e) = protocol::start_acquisition(&mut **h, params.samplerate, sample_wide) {
            // In-flight transfers come back cancelled and the run ends.
            acq.borrow_mut().abort();
            h.cancel_transfers();
            return Err(e);
        }
        Ok(())
    }

    fn acquisition_stop(&mut self, dev: &DeviceInstance, cx: &mut AcquisitionContext<'_>) -> Result<()> {
        let state = self.devices.get(dev)?;
        if let Some(acq) = &state.acquisition {
            acq.borrow_mut().stop(cx);
        }
        Ok(())
    }
}
