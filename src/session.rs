//! Session: the devices being acquired from, the consumers of their data,
//! and the loop that drives both.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::datafeed::Packet;
use crate::device::DeviceInstance;
use crate::error::{LabError, Result};
use crate::event_loop::{Dispatch, EventLoop, Poller};

/// How long one `run` pass waits before re-checking the stop request.
const RUN_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub type DatafeedCallback = Box<dyn FnMut(&DeviceInstance, &Packet<'_>)>;

/// Handed to drivers while they run: sources to (de)register and the feed
/// to send packets into.
pub type AcquisitionContext<'a> = Dispatch<'a, Feed>;

impl Dispatch<'_, Feed> {
    pub fn send(&mut self, dev: &DeviceInstance, packet: &Packet<'_>) -> Result<()> {
        self.data.send(dev, packet)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct StreamState {
    header_seen: bool,
    ended: bool,
}

/// Packet dispatch. Checks per-device ordering and fans every packet out to
/// the consumers in registration order.
#[derive(Default)]
pub struct Feed {
    consumers: Vec<DatafeedCallback>,
    streams: Vec<(DeviceInstance, StreamState)>,
}

impl Feed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_consumer(&mut self, consumer: DatafeedCallback) {
        self.consumers.push(consumer);
    }

    pub fn num_consumers(&self) -> usize {
        self.consumers.len()
    }

    /// Forward `packet` from `dev` to every consumer.
    ///
    /// A packet that would break the `Header (Meta)* data* End` shape of
    /// the device's stream is dropped and reported as a bug.
    pub fn send(&mut self, dev: &DeviceInstance, packet: &Packet<'_>) -> Result<()> {
        let state = self.stream_mut(dev);
        if state.ended {
            log::error!("bus: {packet} from {dev} after END, dropped");
            return Err(LabError::bug(format!("{dev} sent a packet after END")));
        }
        match packet {
            Packet::Header(_) if state.header_seen => {
                log::error!("bus: second HEADER from {dev}, dropped");
                return Err(LabError::bug(format!("{dev} sent a second HEADER")));
            }
            Packet::Header(_) | Packet::Meta(_) => state.header_seen = true,
            _ if !state.header_seen => {
                log::error!("bus: {packet} from {dev} before HEADER, dropped");
                return Err(LabError::bug(format!("{dev} sent data before HEADER")));
            }
            Packet::End => state.ended = true,
            _ => {}
        }

        if log::log_enabled!(log::Level::Debug) {
            log::debug!("bus: received {packet} from {dev}");
        }
        for consumer in &mut self.consumers {
            consumer(dev, packet);
        }
        Ok(())
    }

    /// Whether `dev` has sent its End packet in the current run.
    pub fn is_finished(&self, dev: &DeviceInstance) -> bool {
        self.stream(dev).is_some_and(|s| s.ended)
    }

    /// Whether `dev` has started a stream that has not ended yet.
    pub fn is_streaming(&self, dev: &DeviceInstance) -> bool {
        self.stream(dev).is_some_and(|s| s.header_seen && !s.ended)
    }

    fn begin(&mut self, dev: &DeviceInstance) {
        *self.stream_mut(dev) = StreamState::default();
    }

    fn stream(&self, dev: &DeviceInstance) -> Option<&StreamState> {
        self.streams
            .iter()
            .find(|(d, _)| d.ptr_eq(dev))
            .map(|(_, s)| s)
    }

    fn stream_mut(&mut self, dev: &DeviceInstance) -> &mut StreamState {
        let pos = match self.streams.iter().position(|(d, _)| d.ptr_eq(dev)) {
            Some(pos) => pos,
            None => {
                self.streams.push((dev.clone(), StreamState::default()));
                self.streams.len() - 1
            }
        };
        &mut self.streams[pos].1
    }
}

/// Cross-thread stop request for a running session.
#[derive(Clone, Debug, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Session {
    event_loop: EventLoop<Feed>,
    feed: Feed,
    devices: Vec<DeviceInstance>,
    started: Vec<DeviceInstance>,
    stop: StopHandle,
    stop_sent: bool,
}

impl Session {
    pub fn new() -> Self {
        Self::with_event_loop(EventLoop::new())
    }

    pub fn with_poller(poller: Box<dyn Poller>) -> Self {
        Self::with_event_loop(EventLoop::with_poller(poller))
    }

    fn with_event_loop(event_loop: EventLoop<Feed>) -> Self {
        Self {
            event_loop,
            feed: Feed::new(),
            devices: Vec::new(),
            started: Vec::new(),
            stop: StopHandle::default(),
            stop_sent: false,
        }
    }

    /// Add a scanned device. A device can be added once.
    pub fn dev_add(&mut self, dev: &DeviceInstance) -> Result<()> {
        if self.devices.iter().any(|d| d.ptr_eq(dev)) {
            return Err(LabError::argument(format!("{dev} is already in the session")));
        }
        if dev.driver().is_none() {
            return Err(LabError::argument(format!("{dev} has no driver")));
        }
        log::debug!("session: added {dev}");
        self.devices.push(dev.clone());
        Ok(())
    }

    pub fn dev_remove_all(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(LabError::bug("cannot remove devices from a running session"));
        }
        self.devices.clear();
        Ok(())
    }

    pub fn devices(&self) -> &[DeviceInstance] {
        &self.devices
    }

    /// Register a consumer. It receives every packet of every device, with
    /// the device that produced it.
    pub fn datafeed_callback_add<F>(&mut self, callback: F)
    where
        F: FnMut(&DeviceInstance, &Packet<'_>) + 'static,
    {
        self.feed.add_consumer(Box::new(callback));
    }

    pub fn datafeed_callback_remove_all(&mut self) {
        self.feed.consumers.clear();
    }

    /// Start acquisition on every device. If one fails, the ones already
    /// started are stopped and drained before the error is returned.
    pub fn start(&mut self) -> Result<()> {
        let _span = tracing::info_span!("session.start", devices = self.devices.len()).entered();
        if self.devices.is_empty() {
            return Err(LabError::argument("cannot start a session without devices"));
        }
        if self.is_running() {
            return Err(LabError::bug("session is already running"));
        }
        self.started.clear();
        self.stop.reset();
        self.stop_sent = false;

        let devices = self.devices.clone();
        for dev in &devices {
            self.feed.begin(dev);
            let result = match dev.driver() {
                Some(driver) => {
                    let mut cx = self.event_loop.context(&mut self.feed);
                    let started = driver.borrow_mut().acquisition_start(dev, &mut cx);
                    started
                }
                None => Err(LabError::bug(format!("driver of {dev} is gone"))),
            };
            match result {
                Ok(()) => self.started.push(dev.clone()),
                Err(e) => {
                    log::error!("session: failed to start {dev}: {e}");
                    if let Err(stop_err) = self.request_stop() {
                        log::warn!("session: stopping after failed start: {stop_err}");
                    }
                    self.drain()?;
                    self.event_loop.sources().clear();
                    self.started.clear();
                    return Err(e);
                }
            }
        }
        log::info!("session: started {} device(s)", self.started.len());
        Ok(())
    }

    /// Drive the event loop until every started device has sent End.
    /// A [`Session::halt`] request is forwarded to the drivers and the run
    /// continues until their End packets arrive.
    pub fn run(&mut self) -> Result<()> {
        let _span = tracing::info_span!("session.run").entered();
        if self.started.is_empty() {
            return Err(LabError::argument("session was not started"));
        }
        loop {
            if self.stop.is_requested() && !self.stop_sent {
                self.request_stop()?;
            }
            if self.all_finished() {
                break;
            }
            if self.event_loop.sources().is_empty() {
                return Err(LabError::bug(
                    "no sources left but not every device has ended",
                ));
            }
            self.event_loop.run_once(Some(RUN_POLL_INTERVAL), &mut self.feed)?;
        }
        log::info!("session: run finished");
        Ok(())
    }

    /// One event-loop pass, for front-ends that interleave their own work.
    /// Returns whether every started device has ended.
    pub fn run_once(&mut self, max_wait: Option<Duration>) -> Result<bool> {
        if self.stop.is_requested() && !self.stop_sent {
            self.request_stop()?;
        }
        if !self.all_finished() {
            self.event_loop.run_once(max_wait, &mut self.feed)?;
        }
        Ok(self.all_finished())
    }

    /// Ask every driver to stop. Takes effect on the next pass of `run`.
    pub fn halt(&self) {
        self.stop.request();
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Synchronous teardown: stop what is still running, wait for the End
    /// packets, then drop any sources left behind.
    pub fn stop(&mut self) -> Result<()> {
        let _span = tracing::info_span!("session.stop").entered();
        let stopped = if self.stop_sent {
            Ok(())
        } else {
            self.request_stop()
        };
        self.drain()?;
        self.event_loop.sources().clear();
        self.started.clear();
        stopped
    }

    pub fn is_running(&self) -> bool {
        !self.started.is_empty() && !self.all_finished()
    }

    fn all_finished(&self) -> bool {
        self.started.iter().all(|dev| self.feed.is_finished(dev))
    }

    fn request_stop(&mut self) -> Result<()> {
        self.stop_sent = true;
        let mut first_err = None;
        let devices = self.started.clone();
        for dev in &devices {
            if self.feed.is_finished(dev) {
                continue;
            }
            let Some(driver) = dev.driver() else {
                first_err.get_or_insert(LabError::bug(format!("driver of {dev} is gone")));
                continue;
            };
            let mut cx = self.event_loop.context(&mut self.feed);
            let stopped = driver.borrow_mut().acquisition_stop(dev, &mut cx);
            if let Err(e) = stopped {
                log::error!("session: failed to stop {dev}: {e}");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn drain(&mut self) -> Result<()> {
        while !self.event_loop.sources().is_empty()
            && self.devices.iter().any(|dev| self.feed.is_streaming(dev))
        {
            self.event_loop.run_once(Some(RUN_POLL_INTERVAL), &mut self.feed)?;
        }
        Ok(())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("devices", &self.devices)
            .field("consumers", &self.feed.num_consumers())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datafeed::{Header, Logic};
    use crate::device::DeviceStatus;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn dev() -> DeviceInstance {
        DeviceInstance::new(0, DeviceStatus::Active, "Acme", "LA8", "")
    }

    #[test]
    fn test_feed_fans_out_in_registration_order() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut feed = Feed::new();
        for tag in ["a", "b"] {
            let seen = Rc::clone(&seen);
            feed.add_consumer(Box::new(move |_, p| seen.borrow_mut().push((tag, p.packet_type()))));
        }
        let d = dev();
        feed.send(&d, &Packet::Header(Header::new(1000, 8, 0))).unwrap();
        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "a");
        assert_eq!(seen[1].0, "b");
    }

    #[test]
    fn test_feed_rejects_out_of_order_packets() {
        let mut feed = Feed::new();
        let d = dev();
        let data = [0u8; 4];
        assert!(feed.send(&d, &Packet::Logic(Logic::new(1, &data))).is_err());
        feed.send(&d, &Packet::Header(Header::new(1000, 8, 0))).unwrap();
        assert!(feed.send(&d, &Packet::Header(Header::new(1000, 8, 0))).is_err());
        feed.send(&d, &Packet::Logic(Logic::new(1, &data))).unwrap();
        feed.send(&d, &Packet::End).unwrap();
        assert!(feed.is_finished(&d));
        assert!(matches!(feed.send(&d, &Packet::Trigger), Err(LabError::Bug(_))));
        assert!(feed.send(&d, &Packet::End).is_err());
    }

    #[test]
    fn test_streams_are_tracked_per_device() {
        let mut feed = Feed::new();
        let a = dev();
        let b = dev();
        feed.send(&a, &Packet::Header(Header::new(1000, 8, 0))).unwrap();
        feed.send(&a, &Packet::End).unwrap();
        feed.send(&b, &Packet::Header(Header::new(1000, 8, 0))).unwrap();
        assert!(feed.is_finished(&a));
        assert!(feed.is_streaming(&b));
    }

    #[test]
    fn test_session_refuses_to_start_empty() {
        let mut session = Session::new();
        assert!(matches!(session.start(), Err(LabError::Argument(_))));
        assert!(session.run().is_err());
    }

    #[test]
    fn test_device_without_driver_cannot_be_added() {
        let mut session = Session::new();
        assert!(session.dev_add(&dev()).is_err());
    }

    #[test]
    fn test_stop_handle_is_shared() {
        let session = Session::new();
        let handle = session.stop_handle();
        session.halt();
        assert!(handle.is_requested());
    }
}
