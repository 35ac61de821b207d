//! The driver contract and the registry front-ends build drivers from.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::capability::{ConfigKey, ConfigOption, ConfigValue};
use crate::device::{DeviceInstance, DeviceStatus};
use crate::error::{LabError, Result};
use crate::session::AcquisitionContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverInfo {
    pub name: &'static str,
    pub longname: &'static str,
    pub api_version: u32,
}

/// Lifecycle and configuration contract every instrument family implements.
///
/// Operations a backend has no use for return [`LabError::NotApplicable`]
/// rather than being left out. Every method runs on the session thread.
pub trait Driver {
    fn info(&self) -> &'static DriverInfo;

    /// One-time setup. Calling it again before [`Driver::cleanup`] fails.
    fn init(&mut self) -> Result<()>;

    /// Tear down every owned instance and the driver context.
    fn cleanup(&mut self) -> Result<()>;

    /// Probe the transport and return instances not already owned.
    fn scan(&mut self, options: &[ConfigOption]) -> Result<Vec<DeviceInstance>>;

    fn dev_list(&self) -> Vec<DeviceInstance>;

    fn dev_clear(&mut self) -> Result<()>;

    fn dev_open(&mut self, dev: &DeviceInstance) -> Result<()>;

    /// Release the transport. Closing a closed instance is a no-op.
    fn dev_close(&mut self, dev: &DeviceInstance) -> Result<()>;

    fn capabilities(&self) -> &'static [ConfigKey];

    fn config_get(&self, key: ConfigKey, _dev: Option<&DeviceInstance>) -> Result<ConfigValue> {
        Err(LabError::not_applicable(format!("{}: cannot read {key}", self.info().name)))
    }

    fn config_set(&mut self, key: ConfigKey, value: &ConfigValue, dev: &DeviceInstance)
        -> Result<()>;

    fn config_list(&self, key: ConfigKey, _dev: Option<&DeviceInstance>) -> Result<ConfigValue> {
        match key {
            ConfigKey::DeviceOptions => Ok(ConfigValue::Keys(self.capabilities().to_vec())),
            _ => Err(LabError::not_applicable(format!(
                "{}: no list for {key}",
                self.info().name
            ))),
        }
    }

    /// Begin streaming. Registers sources and emits the header before
    /// returning; never blocks on the device.
    fn acquisition_start(&mut self, dev: &DeviceInstance, cx: &mut AcquisitionContext<'_>)
        -> Result<()>;

    /// Request the end of the run. The End packet follows asynchronously.
    fn acquisition_stop(&mut self, dev: &DeviceInstance, cx: &mut AcquisitionContext<'_>)
        -> Result<()>;

    /// Status of the instance with `index`, `NotFound` if there is none.
    fn dev_status(&self, index: usize) -> DeviceStatus {
        self.dev_list()
            .iter()
            .find(|dev| dev.index() == index)
            .map_or(DeviceStatus::NotFound, DeviceInstance::status)
    }
}

pub type DriverCell = RefCell<Box<dyn Driver>>;

/// Shared handle to a driver. Instances returned by [`DriverHandle::scan`]
/// keep a non-owning reference back to it.
#[derive(Clone)]
pub struct DriverHandle(Rc<DriverCell>);

impl DriverHandle {
    pub fn new(driver: impl Driver + 'static) -> Self {
        Self::from_box(Box::new(driver))
    }

    pub fn from_box(driver: Box<dyn Driver>) -> Self {
        Self(Rc::new(RefCell::new(driver)))
    }

    pub(crate) fn from_rc(rc: Rc<DriverCell>) -> Self {
        Self(rc)
    }

    pub fn info(&self) -> &'static DriverInfo {
        self.0.borrow().info()
    }

    pub fn name(&self) -> &'static str {
        self.info().name
    }

    pub fn borrow(&self) -> Ref<'_, Box<dyn Driver>> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, Box<dyn Driver>> {
        self.0.borrow_mut()
    }

    pub fn init(&self) -> Result<()> {
        self.0.borrow_mut().init()
    }

    pub fn cleanup(&self) -> Result<()> {
        self.0.borrow_mut().cleanup()
    }

    pub fn scan(&self, options: &[ConfigOption]) -> Result<Vec<DeviceInstance>> {
        let found = self.0.borrow_mut().scan(options)?;
        for dev in &found {
            dev.attach_driver(Rc::downgrade(&self.0));
        }
        log::debug!("{}: scan found {} device(s)", self.name(), found.len());
        Ok(found)
    }

    pub fn dev_list(&self) -> Vec<DeviceInstance> {
        self.0.borrow().dev_list()
    }

    pub fn dev_clear(&self) -> Result<()> {
        self.0.borrow_mut().dev_clear()
    }

    pub fn dev_open(&self, dev: &DeviceInstance) -> Result<()> {
        self.0.borrow_mut().dev_open(dev)
    }

    pub fn dev_close(&self, dev: &DeviceInstance) -> Result<()> {
        self.0.borrow_mut().dev_close(dev)
    }

    pub fn capabilities(&self) -> &'static [ConfigKey] {
        self.0.borrow().capabilities()
    }

    pub fn config_get(&self, key: ConfigKey, dev: Option<&DeviceInstance>) -> Result<ConfigValue> {
        self.0.borrow().config_get(key, dev)
    }

    pub fn config_set(&self, key: ConfigKey, value: &ConfigValue, dev: &DeviceInstance) -> Result<()> {
        self.0.borrow_mut().config_set(key, value, dev)
    }

    pub fn config_list(&self, key: ConfigKey, dev: Option<&DeviceInstance>) -> Result<ConfigValue> {
        self.0.borrow().config_list(key, dev)
    }

    pub fn dev_status(&self, index: usize) -> DeviceStatus {
        self.0.borrow().dev_status(index)
    }
}

impl fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DriverHandle").field(&self.name()).finish()
    }
}

pub type DriverFactory = Box<dyn Fn() -> Box<dyn Driver>>;

/// Name -> factory map. Built by the caller and handed to whatever needs to
/// instantiate drivers.
pub struct DriverRegistry {
    factories: BTreeMap<&'static str, DriverFactory>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with every driver this crate ships.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(crate::drivers::demo::DRIVER_INFO.name, || {
            Box::new(crate::drivers::demo::DemoDriver::new())
        });
        registry.register(crate::drivers::session_file::DRIVER_INFO.name, || {
            Box::new(crate::drivers::session_file::SessionFileDriver::new())
        });
        registry.register(crate::drivers::ols::DRIVER_INFO.name, || {
            Box::new(crate::drivers::ols::OlsDriver::new(Box::new(
                crate::serial::SerialPortOpener,
            )))
        });
        #[cfg(feature = "nusb")]
        registry.register(crate::drivers::fx2lafw::DRIVER_INFO.name, || {
            Box::new(crate::drivers::fx2lafw::Fx2lafw::new(
                Box::new(crate::usb::nusb_backend::NusbContext::new()),
                crate::drivers::fx2lafw::Fx2Config::default(),
            ))
        });
        registry
    }

    /// Register `factory` under `name`, replacing any earlier entry.
    pub fn register<F>(&mut self, name: &'static str, factory: F)
    where
        F: Fn() -> Box<dyn Driver> + 'static,
    {
        if self.factories.insert(name, Box::new(factory)).is_some() {
            log::warn!("driver registry: replaced factory for {name}");
        }
    }

    pub fn create(&self, name: &str) -> Result<DriverHandle> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| LabError::not_found(format!("no driver named {name}")))?;
        Ok(DriverHandle::from_box(factory()))
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}
