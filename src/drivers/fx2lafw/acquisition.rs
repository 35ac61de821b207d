//! Streaming engine: keeps a pool of bulk transfers in flight, runs the
//! trigger matcher over what comes back and turns it into Logic packets.

use std::cell::RefCell;
use std::rc::Rc;

use super::protocol::BULK_ENDPOINT;
use super::SharedUsbHandle;
use crate::capability::{ConfigKey, ConfigOption};
use crate::datafeed::{Header, Logic, Packet};
use crate::device::DeviceInstance;
use crate::error::Result;
use crate::event_loop::{Dispatch, Events, SourceFd, SourceHandler};
use crate::session::{AcquisitionContext, Feed};
use crate::trigger::{Trigger, TriggerMatcher};
use crate::usb::{Transfer, TransferStatus};

pub(crate) type SharedAcquisition = Rc<RefCell<Acquisition>>;

#[derive(Debug, Clone, Copy)]
pub(crate) struct AcquisitionParams {
    pub samplerate: u64,
    pub sample_wide: bool,
    /// 0 means no limit.
    pub limit_samples: u64,
    pub num_transfers: usize,
    pub first_transfer_size: usize,
    pub transfer_size: usize,
    pub max_empty_transfers: usize,
}

pub(crate) struct Acquisition {
    dev: DeviceInstance,
    handle: SharedUsbHandle,
    fd: SourceFd,
    matcher: TriggerMatcher,
    sample_width: usize,
    limit_samples: u64,
    num_samples: u64,
    empty_transfers: usize,
    max_empty_transfers: usize,
    transfer_size: usize,
    outstanding: usize,
    /// Odd trailing byte of a 16-bit stream, first half of the next sample.
    carry: Option<u8>,
    aborted: bool,
    finished: bool,
}

impl Acquisition {
    /// Fill the transfer pool, register the completion source and send the
    /// header. The caller sends the start command afterwards.
    pub(crate) fn start(
        dev: DeviceInstance,
        handle: SharedUsbHandle,
        params: AcquisitionParams,
        trigger: Option<&Trigger>,
        cx: &mut AcquisitionContext<'_>,
    ) -> Result<SharedAcquisition> {
        let fd = cx.sources.allocate_fd();
        handle.borrow_mut().set_completion_waker(fd, cx.sources.waker());

        let matcher = TriggerMatcher::new(trigger);
        log::debug!(
            "fx2lafw: starting acquisition, {} trigger stage(s), limit {} samples",
            trigger.map_or(0, Trigger::num_stages),
            params.limit_samples
        );

        let mut acq = Self {
            dev,
            handle,
            fd,
            matcher,
            sample_width: if params.sample_wide { 2 } else { 1 },
            limit_samples: params.limit_samples,
            num_samples: 0,
            empty_transfers: 0,
            max_empty_transfers: params.max_empty_transfers,
            transfer_size: params.transfer_size,
            outstanding: 0,
            carry: None,
            aborted: false,
            finished: false,
        };

        for i in 0..params.num_transfers {
            let size = if i == 0 {
                params.first_transfer_size
            } else {
                params.transfer_size
            };
            let submitted = Transfer::with_length(size).and_then(|t| {
                acq.submit(t)
                    .map_err(|e| crate::error::LabError::generic(format!("bulk submission: {e}")))
            });
            if let Err(e) = submitted {
                log::error!("fx2lafw: failed to set up transfer {i}: {e}");
                let mut handle = acq.handle.borrow_mut();
                handle.cancel_transfers();
                drop(handle.reap_completed());
                return Err(e);
            }
        }

        let shared = Rc::new(RefCell::new(acq));
        cx.sources.add(
            fd,
            Events::IN,
            None,
            Rc::new(RefCell::new(TransferPump(Rc::clone(&shared)))),
        );

        {
            let acq = shared.borrow();
            let num_probes = if params.sample_wide { 16 } else { 8 };
            acq.send(cx, &Packet::Header(Header::new(params.samplerate, num_probes, 0)));
            let meta = [
                ConfigOption::new(ConfigKey::Samplerate, params.samplerate),
                ConfigOption::new(ConfigKey::NumLogicProbes, num_probes as u64),
            ];
            acq.send(cx, &Packet::Meta(&meta));
        }
        Ok(shared)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn num_samples(&self) -> u64 {
        self.num_samples
    }

    /// Stop taking data. Transfers still in flight drain; End follows
    /// once the last one is back. Repeated calls are harmless.
    pub(crate) fn abort(&mut self) {
        if !self.aborted {
            log::debug!(
                "fx2lafw: aborting acquisition with {} transfer(s) in flight",
                self.outstanding
            );
            self.aborted = true;
        }
    }

    pub(crate) fn stop(&mut self, cx: &mut AcquisitionContext<'_>) {
        self.abort();
        self.finish_if_drained(cx);
    }

    fn send(&self, cx: &mut AcquisitionContext<'_>, packet: &Packet<'_>) {
        if let Err(e) = cx.send(&self.dev, packet) {
            log::error!("fx2lafw: {e}");
        }
    }

    fn submit(&mut self, transfer: Transfer) -> std::result::Result<(), crate::usb::UsbError> {
        let result = self.handle.borrow_mut().submit_bulk_in(BULK_ENDPOINT, transfer);
        match result {
            Ok(()) => {
                self.outstanding += 1;
                Ok(())
            }
            Err((_transfer, e)) => Err(e),
        }
    }

    /// Put a buffer back in flight. A failed submission shrinks the pool;
    /// the run carries on with the rest.
    fn resubmit(&mut self, transfer: Transfer) {
        if let Err(e) = self.submit(transfer) {
            log::error!("fx2lafw: failed to resubmit transfer: {e}");
        }
    }

    fn receive_transfer(&mut self, mut transfer: Transfer, cx: &mut AcquisitionContext<'_>) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.aborted {
            drop(transfer);
            self.finish_if_drained(cx);
            return;
        }

        log::trace!(
            "fx2lafw: receive_transfer(): status {:?} received {} bytes",
            transfer.status(),
            transfer.actual_length()
        );

        let has_error = match transfer.status() {
            TransferStatus::NoDevice => {
                log::error!("fx2lafw: device disconnected during acquisition");
                self.abort();
                self.finish_if_drained(cx);
                return;
            }
            // A timed-out transfer may still carry data.
            TransferStatus::Completed | TransferStatus::TimedOut => false,
            _ => true,
        };

        if transfer.actual_length() == 0 || has_error {
            self.empty_transfers += 1;
            if self.empty_transfers > self.max_empty_transfers {
                // The FX2 gave up. End the run; the short sample count
                // tells the front-end.
                log::warn!(
                    "fx2lafw: {} empty transfers in a row, ending acquisition",
                    self.empty_transfers
                );
                self.abort();
            } else {
                transfer.reset();
                self.resubmit(transfer);
            }
            self.finish_if_drained(cx);
            return;
        }
        self.empty_transfers = 0;

        match Transfer::with_length(self.transfer_size) {
            Ok(replacement) => self.resubmit(replacement),
            Err(e) => log::error!("fx2lafw: no replacement transfer: {e}"),
        }

        self.process(transfer.data(), cx);
        self.finish_if_drained(cx);
    }

    fn process(&mut self, data: &[u8], cx: &mut AcquisitionContext<'_>) {
        let width = self.sample_width;
        let joined;
        let data = match self.carry.take() {
            Some(byte) => {
                joined = [&[byte][..], data].concat();
                joined.as_slice()
            }
            None => data,
        };
        let whole = data.len() - data.len() % width;
        if whole < data.len() {
            self.carry = Some(data[whole]);
        }
        let data = &data[..whole];

        let mut offset = 0;
        if !self.matcher.is_fired() {
            let samples = decode_samples(data, width);
            let Some(trigger_offset) = self.matcher.scan(&samples) else {
                // Pre-trigger data is not kept.
                return;
            };
            self.send(cx, &Packet::Trigger);
            let matched = encode_samples(self.matcher.matched(), width);
            self.emit_logic(&matched, cx);
            offset = trigger_offset * width;
        }
        if !self.aborted {
            self.emit_logic(&data[offset..], cx);
        }
    }

    /// Send `bytes` as one Logic packet, cut at the sample limit.
    fn emit_logic(&mut self, bytes: &[u8], cx: &mut AcquisitionContext<'_>) {
        let width = self.sample_width;
        let mut samples = (bytes.len() / width) as u64;
        if self.limit_samples > 0 {
            samples = samples.min(self.limit_samples.saturating_sub(self.num_samples));
        }
        if samples > 0 {
            let len = samples as usize * width;
            self.send(cx, &Packet::Logic(Logic::new(width as u16, &bytes[..len])));
            self.num_samples += samples;
        }
        if self.limit_samples > 0 && self.num_samples >= self.limit_samples {
            log::debug!("fx2lafw: sample limit of {} reached", self.limit_samples);
            self.abort();
        }
    }

    fn finish_if_drained(&mut self, cx: &mut AcquisitionContext<'_>) {
        if self.outstanding > 0 || self.finished {
            return;
        }
        self.finished = true;
        self.send(cx, &Packet::End);
        cx.sources.remove(self.fd);
        log::info!(
            "fx2lafw: acquisition finished after {} samples",
            self.num_samples
        );
    }
}

fn decode_samples(data: &[u8], width: usize) -> Vec<u16> {
    if width == 2 {
        data.chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    } else {
        data.iter().map(|b| u16::from(*b)).collect()
    }
}

fn encode_samples(samples: &[u16], width: usize) -> Vec<u8> {
    if width == 2 {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    } else {
        samples.iter().map(|s| *s as u8).collect()
    }
}

/// Event-loop source servicing completed transfers.
struct TransferPump(SharedAcquisition);

impl SourceHandler<Feed> for TransferPump {
    fn on_ready(&mut self, _fd: SourceFd, _revents: Events, cx: &mut Dispatch<'_, Feed>) -> bool {
        let mut acq = self.0.borrow_mut();
        let completed = acq.handle.borrow_mut().reap_completed();
        for transfer in completed {
            acq.receive_transfer(transfer, cx);
        }
        !acq.finished
    }
}
