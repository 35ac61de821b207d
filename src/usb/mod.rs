//! USB transport seam.
//!
//! Drivers talk to [`UsbContext`] and [`UsbHandle`] only. Bulk-in transfers
//! are asynchronous: a backend reports completions through the [`Waker`]
//! given to it, and the driver collects them with
//! [`UsbHandle::reap_completed`] from inside its event-loop source.

use std::fmt;
use std::path::Path;

use crate::error::{LabError, Result};
use crate::event_loop::{SourceFd, Waker};

pub mod sim;

#[cfg(feature = "nusb")]
pub mod nusb_backend;

#[derive(Debug, thiserror::Error)]
pub enum UsbError {
    #[error("Device disconnected")]
    Disconnected,

    #[error("Device not found")]
    NotFound,

    #[error("Resource busy, another program or driver has claimed it")]
    Busy,

    #[error("Access denied")]
    Access,

    #[error("Endpoint stalled")]
    Stall,

    #[error("Transfer timed out")]
    Timeout,

    #[error("Short transfer: expected {expected} bytes, got {actual}")]
    Short { expected: usize, actual: usize },

    #[error("USB failure: {0}")]
    Other(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceInfo {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl fmt::Display for UsbDeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} on {}.{}",
            self.vendor_id, self.product_id, self.bus, self.address
        )
    }
}

pub trait UsbContext {
    /// Snapshot of the devices currently on the bus.
    fn devices(&mut self) -> std::result::Result<Vec<UsbDeviceInfo>, UsbError>;

    fn open(&mut self, info: &UsbDeviceInfo) -> std::result::Result<Box<dyn UsbHandle>, UsbError>;
}

/// An open device. Control requests are vendor requests addressed to the
/// device.
pub trait UsbHandle {
    fn set_configuration(&mut self, configuration: u8) -> std::result::Result<(), UsbError>;

    fn claim_interface(&mut self, interface: u8) -> std::result::Result<(), UsbError>;

    fn release_interface(&mut self, interface: u8) -> std::result::Result<(), UsbError>;

    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> std::result::Result<usize, UsbError>;

    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> std::result::Result<usize, UsbError>;

    /// Where to report bulk completions.
    fn set_completion_waker(&mut self, fd: SourceFd, waker: Waker);

    /// Queue `transfer` on `endpoint`. On failure the transfer is handed
    /// back so the caller can free or retry it.
    fn submit_bulk_in(
        &mut self,
        endpoint: u8,
        transfer: Transfer,
    ) -> std::result::Result<(), (Transfer, UsbError)>;

    /// Every transfer that completed since the last call.
    fn reap_completed(&mut self) -> Vec<Transfer>;

    /// Ask every in-flight transfer to complete as cancelled.
    fn cancel_transfers(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Completed,
    TimedOut,
    Stall,
    Error,
    NoDevice,
    Cancelled,
}

/// A bulk transfer buffer. Owned by the backend while in flight and by the
/// driver once reaped, never both.
pub struct Transfer {
    buffer: Vec<u8>,
    actual_length: usize,
    status: TransferStatus,
}

impl Transfer {
    /// Allocate a transfer of `length` bytes, reporting allocation failure
    /// instead of aborting.
    pub fn with_length(length: usize) -> Result<Self> {
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(length)
            .map_err(|e| LabError::malloc(format!("transfer buffer of {length} bytes: {e}")))?;
        buffer.resize(length, 0);
        Ok(Self {
            buffer,
            actual_length: 0,
            status: TransferStatus::Pending,
        })
    }

    /// Requested length.
    pub fn length(&self) -> usize {
        self.buffer.len()
    }

    pub fn actual_length(&self) -> usize {
        self.actual_length
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    /// The bytes the device delivered.
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual_length]
    }

    /// Complete with `data` (truncated to the buffer length). Returns the
    /// number of bytes taken.
    pub fn complete(&mut self, status: TransferStatus, data: &[u8]) -> usize {
        let n = data.len().min(self.buffer.len());
        self.buffer[..n].copy_from_slice(&data[..n]);
        self.actual_length = n;
        self.status = status;
        n
    }

    /// Back to pending, ready for resubmission.
    pub fn reset(&mut self) {
        self.actual_length = 0;
        self.status = TransferStatus::Pending;
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("length", &self.buffer.len())
            .field("actual_length", &self.actual_length)
            .field("status", &self.status)
            .finish()
    }
}

/// Cypress EZ-USB firmware loading through the 0xA0 vendor request.
pub mod ezusb {
    use super::{Path, UsbContext, UsbDeviceInfo, UsbError, UsbHandle};
    use crate::error::{LabError, Result};

    pub const FIRMWARE_LOAD: u8 = 0xa0;
    /// CPU control and status register of the FX2.
    pub const CPUCS: u16 = 0xe600;
    const CHUNK_SIZE: usize = 4096;

    /// Hold (`true`) or release the 8051 core from reset.
    pub fn reset(handle: &mut dyn UsbHandle, hold: bool) -> std::result::Result<(), UsbError> {
        log::debug!("ezusb: setting CPU reset mode to {}", if hold { "on" } else { "off" });
        handle.control_out(FIRMWARE_LOAD, CPUCS, 0, &[u8::from(hold)])?;
        Ok(())
    }

    pub fn install_firmware(
        handle: &mut dyn UsbHandle,
        image: &[u8],
    ) -> std::result::Result<(), UsbError> {
        for (i, chunk) in image.chunks(CHUNK_SIZE).enumerate() {
            let offset = i * CHUNK_SIZE;
            let written = handle.control_out(FIRMWARE_LOAD, offset as u16, 0, chunk)?;
            if written != chunk.len() {
                return Err(UsbError::Short {
                    expected: chunk.len(),
                    actual: written,
                });
            }
            log::trace!("ezusb: uploaded {} bytes at 0x{offset:04x}", chunk.len());
        }
        log::info!("ezusb: firmware upload done, {} bytes", image.len());
        Ok(())
    }

    /// Upload the firmware image at `path` and start it. The device drops
    /// off the bus and re-enumerates afterwards.
    pub fn upload_firmware(
        ctx: &mut dyn UsbContext,
        info: &UsbDeviceInfo,
        configuration: u8,
        path: &Path,
    ) -> Result<()> {
        log::info!("ezusb: uploading firmware {} to {info}", path.display());
        let image = std::fs::read(path).map_err(|e| {
            LabError::generic(format!("cannot read firmware {}: {e}", path.display()))
        })?;
        let mut handle = ctx.open(info)?;
        handle.set_configuration(configuration)?;
        reset(handle.as_mut(), true)?;
        install_firmware(handle.as_mut(), &image)?;
        reset(handle.as_mut(), false)?;
        Ok(())
    }
}
