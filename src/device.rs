//! Device instances and the per-driver list that owns them.

use std::cell::{Cell, Ref, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::driver::{DriverCell, DriverHandle};
use crate::error::{LabError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Query result only. Never stored on an instance.
    NotFound,
    /// Found, but the firmware is not confirmed running yet.
    Initializing,
    Inactive,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Logic,
    Analog,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub index: usize,
    pub kind: ProbeKind,
    pub enabled: bool,
    pub name: String,
    /// Per-stage trigger characters, one per stage (`'0'` or `'1'`).
    pub trigger: Option<String>,
}

impl Probe {
    pub fn new(index: usize, kind: ProbeKind, enabled: bool, name: impl Into<String>) -> Self {
        Self {
            index,
            kind,
            enabled,
            name: name.into(),
            trigger: None,
        }
    }

    /// `count` enabled logic probes named `0`, `1`, ...
    pub fn logic_set(count: usize) -> Vec<Self> {
        (0..count)
            .map(|i| Self::new(i, ProbeKind::Logic, true, i.to_string()))
            .collect()
    }
}

struct DeviceInner {
    index: usize,
    vendor: String,
    model: String,
    version: String,
    status: Cell<DeviceStatus>,
    retired: Cell<bool>,
    probes: RefCell<Vec<Probe>>,
    driver: RefCell<Weak<DriverCell>>,
}

/// Handle to one physical or virtual instrument.
///
/// Cloning yields another handle to the same instance. The instance's
/// private state lives in its driver, keyed by this handle.
#[derive(Clone)]
pub struct DeviceInstance(Rc<DeviceInner>);

impl DeviceInstance {
    pub fn new(
        index: usize,
        status: DeviceStatus,
        vendor: impl Into<String>,
        model: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self(Rc::new(DeviceInner {
            index,
            vendor: vendor.into(),
            model: model.into(),
            version: version.into(),
            status: Cell::new(status),
            retired: Cell::new(false),
            probes: RefCell::new(Vec::new()),
            driver: RefCell::new(Weak::new()),
        }))
    }

    pub fn with_probes(self, probes: Vec<Probe>) -> Self {
        *self.0.probes.borrow_mut() = probes;
        self
    }

    pub fn index(&self) -> usize {
        self.0.index
    }

    pub fn vendor(&self) -> &str {
        &self.0.vendor
    }

    pub fn model(&self) -> &str {
        &self.0.model
    }

    pub fn version(&self) -> &str {
        &self.0.version
    }

    pub fn status(&self) -> DeviceStatus {
        self.0.status.get()
    }

    pub fn is_active(&self) -> bool {
        self.status() == DeviceStatus::Active
    }

    /// Move to `next`. Only Initializing -> Inactive -> Active and
    /// Active -> Inactive are allowed, and a retired instance never moves.
    pub fn set_status(&self, next: DeviceStatus) -> Result<()> {
        if self.0.retired.get() {
            return Err(LabError::bug(format!("{self} was already cleaned up")));
        }
        let current = self.status();
        let allowed = current == next
            || matches!(
                (current, next),
                (DeviceStatus::Initializing, DeviceStatus::Inactive)
                    | (DeviceStatus::Inactive, DeviceStatus::Active)
                    | (DeviceStatus::Active, DeviceStatus::Inactive)
            );
        if !allowed || next == DeviceStatus::NotFound {
            return Err(LabError::bug(format!(
                "illegal status change {current:?} -> {next:?} on {self}"
            )));
        }
        self.0.status.set(next);
        Ok(())
    }

    pub fn is_retired(&self) -> bool {
        self.0.retired.get()
    }

    pub(crate) fn retire(&self) {
        if self.is_active() {
            self.0.status.set(DeviceStatus::Inactive);
        }
        self.0.retired.set(true);
    }

    pub fn probes(&self) -> Ref<'_, Vec<Probe>> {
        self.0.probes.borrow()
    }

    pub fn num_probes(&self, kind: ProbeKind) -> usize {
        self.probes().iter().filter(|p| p.kind == kind).count()
    }

    pub fn set_probes(&self, probes: Vec<Probe>) {
        *self.0.probes.borrow_mut() = probes;
    }

    pub fn probe_enable(&self, index: usize, enabled: bool) -> Result<()> {
        self.with_probe(index, |p| p.enabled = enabled)
    }

    pub fn probe_set_name(&self, index: usize, name: &str) -> Result<()> {
        self.with_probe(index, |p| p.name = name.to_string())
    }

    /// Set the trigger characters of probe `index`; `None` clears it.
    pub fn probe_set_trigger(&self, index: usize, trigger: Option<&str>) -> Result<()> {
        self.with_probe(index, |p| p.trigger = trigger.map(str::to_string))
    }

    fn with_probe(&self, index: usize, f: impl FnOnce(&mut Probe)) -> Result<()> {
        let mut probes = self.0.probes.borrow_mut();
        let probe = probes
            .iter_mut()
            .find(|p| p.index == index)
            .ok_or_else(|| LabError::argument(format!("no probe {index} on {self}")))?;
        f(probe);
        Ok(())
    }

    /// The driver managing this instance, if it is still alive.
    pub fn driver(&self) -> Option<DriverHandle> {
        self.0.driver.borrow().upgrade().map(DriverHandle::from_rc)
    }

    pub(crate) fn attach_driver(&self, driver: Weak<DriverCell>) {
        *self.0.driver.borrow_mut() = driver;
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Display for DeviceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device {} ({} {}", self.index(), self.vendor(), self.model())?;
        if !self.version().is_empty() {
            write!(f, " {}", self.version())?;
        }
        f.write_str(")")
    }
}

impl fmt::Debug for DeviceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceInstance")
            .field("index", &self.index())
            .field("vendor", &self.vendor())
            .field("model", &self.model())
            .field("status", &self.status())
            .finish()
    }
}

/// The instances a driver owns, each paired with its private state `P`.
/// This list is the only record of which devices exist for the driver.
pub struct DeviceList<P> {
    entries: Vec<(DeviceInstance, P)>,
}

impl<P> DeviceList<P> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Index for the next instance added.
    pub fn next_index(&self) -> usize {
        self.entries
            .iter()
            .map(|(dev, _)| dev.index() + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn push(&mut self, dev: DeviceInstance, state: P) {
        self.entries.push((dev, state));
    }

    pub fn instances(&self) -> Vec<DeviceInstance> {
        self.entries.iter().map(|(dev, _)| dev.clone()).collect()
    }

    pub fn get(&self, dev: &DeviceInstance) -> Result<&P> {
        self.entries
            .iter()
            .find(|(d, _)| d.ptr_eq(dev))
            .map(|(_, p)| p)
            .ok_or_else(|| LabError::bug(format!("{dev} has no private state")))
    }

    pub fn get_mut(&mut self, dev: &DeviceInstance) -> Result<&mut P> {
        self.entries
            .iter_mut()
            .find(|(d, _)| d.ptr_eq(dev))
            .map(|(_, p)| p)
            .ok_or_else(|| LabError::bug(format!("{dev} has no private state")))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DeviceInstance, &P)> {
        self.entries.iter().map(|(d, p)| (d, p))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Close every active instance with `close`, retire them all and empty
    /// the list. A failing instance is logged and skipped so the rest are
    /// still released; the first failure is returned.
    pub fn clear<F>(&mut self, driver: &str, mut close: F) -> Result<()>
    where
        F: FnMut(&DeviceInstance, &mut P) -> Result<()>,
    {
        let mut first_err = None;
        for (dev, state) in &mut self.entries {
            if dev.is_active() {
                if let Err(e) = close(dev, state) {
                    log::error!("{driver}: failed to close {dev}: {e}, continuing");
                    first_err.get_or_insert(e);
                }
            }
            dev.retire();
        }
        self.entries.clear();
        first_err.map_or(Ok(()), Err)
    }
}

impl<P> Default for DeviceList<P> {
    fn default() -> Self {
        Self::new()
    }
}
