//! [`UsbContext`] over real hardware, through `nusb`.
//!
//! Bulk completions arrive from `nusb`'s own event thread. The queue is
//! polled with a waker that forwards to the event loop, so the driver's
//! source fires as soon as a transfer finishes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::task::{Context, Poll, Wake};
use std::time::Duration;

use nusb::transfer::{Control, ControlType, Queue, Recipient, RequestBuffer, TransferError};

use super::{Transfer, TransferStatus, UsbContext, UsbDeviceInfo, UsbError, UsbHandle};
use crate::event_loop::{Events, SourceFd, Waker};

const CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);

impl From<TransferError> for UsbError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Stall => Self::Stall,
            TransferError::Disconnected => Self::Disconnected,
            other => Self::Other(other.to_string()),
        }
    }
}

fn transfer_status(result: &std::result::Result<(), TransferError>) -> TransferStatus {
    match result {
        Ok(()) => TransferStatus::Completed,
        Err(TransferError::Cancelled) => TransferStatus::Cancelled,
        Err(TransferError::Stall) => TransferStatus::Stall,
        Err(TransferError::Disconnected) => TransferStatus::NoDevice,
        Err(_) => TransferStatus::Error,
    }
}

#[derive(Debug, Default)]
pub struct NusbContext;

impl NusbContext {
    pub fn new() -> Self {
        Self
    }
}

impl UsbContext for NusbContext {
    fn devices(&mut self) -> std::result::Result<Vec<UsbDeviceInfo>, UsbError> {
        Ok(nusb::list_devices()?
            .map(|d| UsbDeviceInfo {
                bus: d.bus_number(),
                address: d.device_address(),
                vendor_id: d.vendor_id(),
                product_id: d.product_id(),
                manufacturer: d.manufacturer_string().map(str::to_string),
                product: d.product_string().map(str::to_string),
            })
            .collect())
    }

    fn open(&mut self, info: &UsbDeviceInfo) -> std::result::Result<Box<dyn UsbHandle>, UsbError> {
        let found = nusb::list_devices()?
            .find(|d| d.bus_number() == info.bus && d.device_address() == info.address)
            .ok_or(UsbError::NotFound)?;
        let device = found.open()?;
        log::debug!("nusb: opened {info}");
        Ok(Box::new(NusbHandle {
            device,
            interface: None,
            queue: None,
            in_flight: VecDeque::new(),
            waker: None,
        }))
    }
}

/// Forwards `nusb` task wakeups to the event loop.
struct LoopWake {
    fd: SourceFd,
    waker: Waker,
}

impl Wake for LoopWake {
    fn wake(self: Arc<Self>) {
        self.waker.wake(self.fd, Events::IN);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.waker.wake(self.fd, Events::IN);
    }
}

pub struct NusbHandle {
    device: nusb::Device,
    interface: Option<nusb::Interface>,
    queue: Option<(u8, Queue<RequestBuffer>)>,
    /// Transfers in submission order; `nusb` completes them in the same
    /// order.
    in_flight: VecDeque<Transfer>,
    waker: Option<std::task::Waker>,
}

impl NusbHandle {
    fn vendor_control(request: u8, value: u16, index: u16) -> Control {
        Control {
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request,
            value,
            index,
        }
    }
}

impl UsbHandle for NusbHandle {
    fn set_configuration(&mut self, configuration: u8) -> std::result::Result<(), UsbError> {
        self.device.set_configuration(configuration)?;
        Ok(())
    }

    fn claim_interface(&mut self, interface: u8) -> std::result::Result<(), UsbError> {
        self.interface = Some(self.device.claim_interface(interface)?);
        Ok(())
    }

    fn release_interface(&mut self, _interface: u8) -> std::result::Result<(), UsbError> {
        self.queue = None;
        self.in_flight.clear();
        self.interface = None;
        Ok(())
    }

    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> std::result::Result<usize, UsbError> {
        let control = Self::vendor_control(request, value, index);
        Ok(self.device.control_in_blocking(control, buf, CONTROL_TIMEOUT)?)
    }

    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> std::result::Result<usize, UsbError> {
        let control = Self::vendor_control(request, value, index);
        Ok(self.device.control_out_blocking(control, data, CONTROL_TIMEOUT)?)
    }

    fn set_completion_waker(&mut self, fd: SourceFd, waker: Waker) {
        self.waker = Some(std::task::Waker::from(Arc::new(LoopWake { fd, waker })));
    }

    fn submit_bulk_in(
        &mut self,
        endpoint: u8,
        transfer: Transfer,
    ) -> std::result::Result<(), (Transfer, UsbError)> {
        let Some(interface) = &self.interface else {
            return Err((transfer, UsbError::Other("interface not claimed".to_string())));
        };
        if self.queue.as_ref().is_none_or(|(ep, _)| *ep != endpoint) {
            self.queue = Some((endpoint, interface.bulk_in_queue(endpoint)));
        }
        if let Some((_, queue)) = &mut self.queue {
            queue.submit(RequestBuffer::new(transfer.length()));
        }
        self.in_flight.push_back(transfer);
        Ok(())
    }

    fn reap_completed(&mut self) -> Vec<Transfer> {
        let mut done = Vec::new();
        let (Some((_, queue)), Some(waker)) = (&mut self.queue, &self.waker) else {
            return done;
        };
        let mut cx = Context::from_waker(waker);
        while queue.pending() > 0 {
            let Poll::Ready(completion) = queue.poll_next(&mut cx) else {
                break;
            };
            let Some(mut transfer) = self.in_flight.pop_front() else {
                log::warn!("nusb: completion without a matching transfer");
                continue;
            };
            transfer.complete(transfer_status(&completion.status), &completion.data);
            done.push(transfer);
        }
        done
    }

    fn cancel_transfers(&mut self) {
        if let Some((_, queue)) = &mut self.queue {
            queue.cancel_all();
        }
    }
}
