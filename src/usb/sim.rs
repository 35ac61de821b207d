//! In-process USB bus for tests and demos.
//!
//! Devices are scripted with [`SimDevice`]: what they report on the bus,
//! whether they already run the fx2lafw firmware, how long they stay away
//! after a firmware upload, and what bulk data they stream once started.
//! Transfers complete when the driver reaps them, one scripted chunk per
//! transfer, and empty once the script runs out.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use super::ezusb;
use super::{Transfer, TransferStatus, UsbContext, UsbDeviceInfo, UsbError, UsbHandle};
use crate::event_loop::{Events, SourceFd, Waker};

const CMD_GET_FW_VERSION: u8 = 0xb0;
const CMD_START: u8 = 0xb1;
const CMD_GET_REVID_VERSION: u8 = 0xb2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Renumeration {
    /// Back on the bus after this many listings.
    After(usize),
    Never,
}

#[derive(Debug, Clone)]
pub struct SimDevice {
    vendor_id: u16,
    product_id: u16,
    manufacturer: String,
    product: String,
    firmware_running: bool,
    fw_version: (u8, u8),
    revid: u8,
    renumeration: Renumeration,
    chunks: VecDeque<Vec<u8>>,
    endless: Option<Vec<u8>>,
    reject_submissions: usize,
    /// Accepted submissions before `reject_submissions` kicks in.
    reject_after: usize,
}

impl SimDevice {
    /// A bare FX2 waiting for firmware.
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            manufacturer: "Cypress".to_string(),
            product: "EZ-USB FX2".to_string(),
            firmware_running: false,
            fw_version: (1, 0),
            revid: 1,
            renumeration: Renumeration::After(2),
            chunks: VecDeque::new(),
            endless: None,
            reject_submissions: 0,
            reject_after: 0,
        }
    }

    /// An FX2 already running fx2lafw.
    pub fn fx2lafw(vendor_id: u16, product_id: u16) -> Self {
        let mut dev = Self::new(vendor_id, product_id);
        dev.boot();
        dev
    }

    /// Bulk data, one chunk per completed transfer (split if a chunk is
    /// larger than the transfer).
    pub fn with_chunks(mut self, chunks: impl IntoIterator<Item = Vec<u8>>) -> Self {
        self.chunks.extend(chunks);
        self
    }

    /// After the scripted chunks, fill every transfer with `pattern` forever.
    pub fn with_endless(mut self, pattern: Vec<u8>) -> Self {
        self.endless = Some(pattern);
        self
    }

    /// Stay off the bus for `listings` device listings after a firmware upload.
    pub fn renumerate_after(mut self, listings: usize) -> Self {
        self.renumeration = Renumeration::After(listings);
        self
    }

    pub fn never_renumerate(mut self) -> Self {
        self.renumeration = Renumeration::Never;
        self
    }

    /// Fail the next `count` bulk submissions.
    pub fn reject_submissions(mut self, count: usize) -> Self {
        self.reject_submissions = count;
        self
    }

    /// Accept `accepted` bulk submissions, then fail the next `count`.
    pub fn reject_submissions_after(mut self, accepted: usize, count: usize) -> Self {
        self.reject_after = accepted;
        self.reject_submissions = count;
        self
    }

    pub fn with_fw_version(mut self, major: u8, minor: u8) -> Self {
        self.fw_version = (major, minor);
        self
    }

    fn boot(&mut self) {
        self.firmware_running = true;
        self.manufacturer = "sigrok".to_string();
        self.product = "fx2lafw".to_string();
    }
}

struct SimState {
    dev: SimDevice,
    address: u8,
    hidden_for: Option<Renumeration>,
    cpu_held: bool,
    firmware: Vec<u8>,
    claimed: bool,
    started: bool,
    gone: bool,
    start_commands: Vec<Vec<u8>>,
    pending: Vec<Transfer>,
    completed: Vec<Transfer>,
    waker: Option<(SourceFd, Waker)>,
    submissions: usize,
}

impl SimState {
    fn info(&self) -> UsbDeviceInfo {
        UsbDeviceInfo {
            bus: 1,
            address: self.address,
            vendor_id: self.dev.vendor_id,
            product_id: self.dev.product_id,
            manufacturer: Some(self.dev.manufacturer.clone()),
            product: Some(self.dev.product.clone()),
        }
    }

    fn wake(&self) {
        if let Some((fd, waker)) = &self.waker {
            waker.wake(*fd, Events::IN);
        }
    }

    fn next_chunk(&mut self, length: usize) -> Vec<u8> {
        if let Some(chunk) = self.dev.chunks.front_mut() {
            let n = chunk.len().min(length);
            let head: Vec<u8> = chunk.drain(..n).collect();
            if chunk.is_empty() {
                self.dev.chunks.pop_front();
            }
            return head;
        }
        match &self.dev.endless {
            Some(pattern) if !pattern.is_empty() => {
                pattern.iter().copied().cycle().take(length).collect()
            }
            _ => Vec::new(),
        }
    }
}

#[derive(Default)]
struct SimBus {
    devices: Vec<SimState>,
    next_address: u8,
}

/// The simulated bus. Clones share the same devices.
#[derive(Clone)]
pub struct SimUsb {
    bus: Rc<RefCell<SimBus>>,
}

impl SimUsb {
    pub fn new() -> Self {
        let bus = SimBus {
            devices: Vec::new(),
            next_address: 2,
        };
        Self {
            bus: Rc::new(RefCell::new(bus)),
        }
    }

    /// Plug in a device. Returns its slot for later inspection.
    pub fn plug(&self, dev: SimDevice) -> usize {
        let mut bus = self.bus.borrow_mut();
        let address = bus.next_address;
        bus.next_address = bus.next_address.wrapping_add(1);
        bus.devices.push(SimState {
            dev,
            address,
            hidden_for: None,
            cpu_held: false,
            firmware: Vec::new(),
            claimed: false,
            started: false,
            gone: false,
            start_commands: Vec::new(),
            pending: Vec::new(),
            completed: Vec::new(),
            waker: None,
            submissions: 0,
        });
        bus.devices.len() - 1
    }

    /// Yank the device: in-flight transfers complete with `NoDevice`.
    pub fn unplug(&self, slot: usize) {
        let mut bus = self.bus.borrow_mut();
        if let Some(state) = bus.devices.get_mut(slot) {
            state.gone = true;
            state.wake();
        }
    }

    /// Payloads of every start command the device received.
    pub fn start_commands(&self, slot: usize) -> Vec<Vec<u8>> {
        self.with_slot(slot, |s| s.start_commands.clone())
            .unwrap_or_default()
    }

    /// Firmware image written to the device's RAM.
    pub fn firmware(&self, slot: usize) -> Vec<u8> {
        self.with_slot(slot, |s| s.firmware.clone()).unwrap_or_default()
    }

    pub fn is_claimed(&self, slot: usize) -> bool {
        self.with_slot(slot, |s| s.claimed).unwrap_or(false)
    }

    /// Transfers submitted and not yet reaped.
    pub fn in_flight(&self, slot: usize) -> usize {
        self.with_slot(slot, |s| s.pending.len() + s.completed.len())
            .unwrap_or(0)
    }

    /// Bulk submissions accepted so far.
    pub fn submissions(&self, slot: usize) -> usize {
        self.with_slot(slot, |s| s.submissions).unwrap_or(0)
    }

    pub fn address(&self, slot: usize) -> Option<u8> {
        self.with_slot(slot, |s| s.address)
    }

    fn with_slot<T>(&self, slot: usize, f: impl FnOnce(&SimState) -> T) -> Option<T> {
        self.bus.borrow().devices.get(slot).map(f)
    }
}

impl Default for SimUsb {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbContext for SimUsb {
    fn devices(&mut self) -> Result<Vec<UsbDeviceInfo>, UsbError> {
        let mut bus = self.bus.borrow_mut();
        let mut visible = Vec::new();
        for state in &mut bus.devices {
            if state.gone {
                continue;
            }
            match state.hidden_for {
                Some(Renumeration::Never) => continue,
                Some(Renumeration::After(n)) if n > 0 => {
                    state.hidden_for = Some(Renumeration::After(n - 1));
                    continue;
                }
                _ => state.hidden_for = None,
            }
            visible.push(state.info());
        }
        Ok(visible)
    }

    fn open(&mut self, info: &UsbDeviceInfo) -> Result<Box<dyn UsbHandle>, UsbError> {
        let bus = self.bus.borrow();
        let slot = bus
            .devices
            .iter()
            .position(|s| !s.gone && s.hidden_for.is_none() && s.address == info.address)
            .ok_or(UsbError::NotFound)?;
        Ok(Box::new(SimHandle {
            bus: Rc::clone(&self.bus),
            slot,
        }))
    }
}

struct SimHandle {
    bus: Rc<RefCell<SimBus>>,
    slot: usize,
}

impl SimHandle {
    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut SimState) -> Result<T, UsbError>,
    ) -> Result<T, UsbError> {
        let mut bus = self.bus.borrow_mut();
        let next_address = bus.next_address;
        let state = bus.devices.get_mut(self.slot).ok_or(UsbError::NotFound)?;
        if state.gone {
            return Err(UsbError::Disconnected);
        }
        let booted_before = state.dev.firmware_running;
        let result = f(state);
        if !booted_before && state.dev.firmware_running {
            // Re-enumerates at a new address.
            state.address = next_address;
            bus.next_address = next_address.wrapping_add(1);
        }
        result
    }
}

impl UsbHandle for SimHandle {
    fn set_configuration(&mut self, _configuration: u8) -> Result<(), UsbError> {
        self.with_state(|_| Ok(()))
    }

    fn claim_interface(&mut self, _interface: u8) -> Result<(), UsbError> {
        self.with_state(|s| {
            if s.claimed {
                return Err(UsbError::Busy);
            }
            s.claimed = true;
            Ok(())
        })
    }

    fn release_interface(&mut self, _interface: u8) -> Result<(), UsbError> {
        self.with_state(|s| {
            s.claimed = false;
            s.started = false;
            Ok(())
        })
    }

    fn control_in(
        &mut self,
        request: u8,
        _value: u16,
        _index: u16,
        buf: &mut [u8],
    ) -> Result<usize, UsbError> {
        self.with_state(|s| {
            if !s.dev.firmware_running {
                return Err(UsbError::Stall);
            }
            let reply: Vec<u8> = match request {
                CMD_GET_FW_VERSION => vec![s.dev.fw_version.0, s.dev.fw_version.1],
                CMD_GET_REVID_VERSION => vec![s.dev.revid],
                _ => return Err(UsbError::Stall),
            };
            let n = reply.len().min(buf.len());
            buf[..n].copy_from_slice(&reply[..n]);
            Ok(n)
        })
    }

    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        _index: u16,
        data: &[u8],
    ) -> Result<usize, UsbError> {
        self.with_state(|s| match request {
            ezusb::FIRMWARE_LOAD if value == ezusb::CPUCS => {
                let hold = data.first().copied().unwrap_or(0) != 0;
                if s.cpu_held && !hold && !s.firmware.is_empty() {
                    s.dev.boot();
                    s.hidden_for = Some(s.dev.renumeration);
                }
                s.cpu_held = hold;
                Ok(data.len())
            }
            ezusb::FIRMWARE_LOAD if s.cpu_held => {
                let offset = usize::from(value);
                if s.firmware.len() < offset + data.len() {
                    s.firmware.resize(offset + data.len(), 0);
                }
                s.firmware[offset..offset + data.len()].copy_from_slice(data);
                Ok(data.len())
            }
            CMD_START if s.dev.firmware_running => {
                s.start_commands.push(data.to_vec());
                s.started = true;
                s.wake();
                Ok(data.len())
            }
            _ => Err(UsbError::Stall),
        })
    }

    fn set_completion_waker(&mut self, fd: SourceFd, waker: Waker) {
        let mut bus = self.bus.borrow_mut();
        if let Some(state) = bus.devices.get_mut(self.slot) {
            state.waker = Some((fd, waker));
        }
    }

    fn submit_bulk_in(&mut self, _endpoint: u8, transfer: Transfer) -> Result<(), (Transfer, UsbError)> {
        let mut bus = self.bus.borrow_mut();
        let Some(state) = bus.devices.get_mut(self.slot) else {
            return Err((transfer, UsbError::NotFound));
        };
        if state.gone {
            return Err((transfer, UsbError::Disconnected));
        }
        if state.dev.reject_submissions > 0 && state.submissions >= state.dev.reject_after {
            state.dev.reject_submissions -= 1;
            return Err((transfer, UsbError::Other("submission rejected".to_string())));
        }
        state.submissions += 1;
        state.pending.push(transfer);
        if state.started {
            state.wake();
        }
        Ok(())
    }

    fn reap_completed(&mut self) -> Vec<Transfer> {
        let mut bus = self.bus.borrow_mut();
        let Some(state) = bus.devices.get_mut(self.slot) else {
            return Vec::new();
        };
        let mut done = std::mem::take(&mut state.completed);
        if state.gone {
            for mut t in std::mem::take(&mut state.pending) {
                t.complete(TransferStatus::NoDevice, &[]);
                done.push(t);
            }
        } else if state.started {
            for mut t in std::mem::take(&mut state.pending) {
                let data = state.next_chunk(t.length());
                t.complete(TransferStatus::Completed, &data);
                done.push(t);
            }
        }
        done
    }

    fn cancel_transfers(&mut self) {
        let mut bus = self.bus.borrow_mut();
        if let Some(state) = bus.devices.get_mut(self.slot) {
            for mut t in std::mem::take(&mut state.pending) {
                t.complete(TransferStatus::Cancelled, &[]);
                state.completed.push(t);
            }
            state.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_firmware_upload_renumerates() {
        let mut usb = SimUsb::new();
        let slot = usb.plug(SimDevice::new(0x0925, 0x3881).renumerate_after(1));
        let info = usb.devices().unwrap().remove(0);
        let old_address = info.address;
        let mut handle = usb.open(&info).unwrap();
        ezusb::reset(handle.as_mut(), true).unwrap();
        ezusb::install_firmware(handle.as_mut(), &[0x02, 0x00, 0x06]).unwrap();
        ezusb::reset(handle.as_mut(), false).unwrap();

        assert!(usb.devices().unwrap().is_empty());
        let back = usb.devices().unwrap().remove(0);
        assert_ne!(back.address, old_address);
        assert_eq!(back.manufacturer.as_deref(), Some("sigrok"));
        assert_eq!(usb.firmware(slot), vec![0x02, 0x00, 0x06]);
    }

    #[test]
    fn test_transfers_complete_after_start() {
        let mut usb = SimUsb::new();
        let slot = usb.plug(SimDevice::fx2lafw(0x0925, 0x3881).with_chunks([vec![1, 2, 3]]));
        let info = usb.devices().unwrap().remove(0);
        let mut handle = usb.open(&info).unwrap();
        handle
            .submit_bulk_in(0x82, Transfer::with_length(2).unwrap())
            .unwrap();
        assert!(handle.reap_completed().is_empty());

        handle.control_out(CMD_START, 0, 0, &[0, 0, 1]).unwrap();
        handle
            .submit_bulk_in(0x82, Transfer::with_length(2).unwrap())
            .unwrap();
        let done = handle.reap_completed();
        assert_eq!(done.len(), 2);
        assert_eq!(done[0].data(), &[1, 2]);
        assert_eq!(done[1].data(), &[3]);
        assert_eq!(usb.start_commands(slot), vec![vec![0, 0, 1]]);
        assert_eq!(usb.in_flight(slot), 0);
    }

    #[test]
    fn test_claim_twice_is_busy() {
        let mut usb = SimUsb::new();
        usb.plug(SimDevice::fx2lafw(0x0925, 0x3881));
        let info = usb.devices().unwrap().remove(0);
        let mut handle = usb.open(&info).unwrap();
        handle.claim_interface(0).unwrap();
        assert!(matches!(handle.claim_interface(0), Err(UsbError::Busy)));
    }
}
