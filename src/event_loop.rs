//! Source multiplexer.
//!
//! Sources are `(fd, interest, timeout, handler)` registrations. Readiness is
//! reported through a [`Waker`] by whatever completes I/O (a USB backend, a
//! test script), and [`EventLoop::run_once`] blocks on the [`Poller`] until a
//! source is ready or its timeout elapses, then calls exactly the handlers
//! whose source fired. Everything runs on the calling thread.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::ops::BitOr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::error::Result;

pub type SourceFd = i32;

/// Caller-injected event. Negative fds never wait on the poller; they fire
/// on every pass.
pub const VIRTUAL_FD: SourceFd = -1;

pub fn is_virtual(fd: SourceFd) -> bool {
    fd < 0
}

#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Events(u8);

impl Events {
    pub const NONE: Self = Self(0);
    pub const IN: Self = Self(0x01);
    pub const OUT: Self = Self(0x04);
    pub const ERR: Self = Self(0x08);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for Events {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::IN) {
            names.push("IN");
        }
        if self.contains(Self::OUT) {
            names.push("OUT");
        }
        if self.contains(Self::ERR) {
            names.push("ERR");
        }
        write!(f, "Events({})", names.join("|"))
    }
}

/// Handle for reporting readiness from wherever I/O completes. Cheap to
/// clone and usable from other threads.
#[derive(Clone, Debug)]
pub struct Waker {
    tx: Sender<(SourceFd, Events)>,
}

impl Waker {
    pub fn wake(&self, fd: SourceFd, events: Events) {
        // The poller keeps its own sender, so the channel never disconnects.
        let _ = self.tx.send((fd, events));
    }
}

/// Readiness primitive the loop blocks on.
pub trait Poller {
    fn waker(&self) -> Waker;

    /// Wait up to `timeout` (forever on `None`) for at least one readiness
    /// report, and return every report available at that point.
    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(SourceFd, Events)>>;
}

pub struct ChannelPoller {
    tx: Sender<(SourceFd, Events)>,
    rx: Receiver<(SourceFd, Events)>,
}

impl ChannelPoller {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }
}

impl Default for ChannelPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl Poller for ChannelPoller {
    fn waker(&self) -> Waker {
        Waker {
            tx: self.tx.clone(),
        }
    }

    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(SourceFd, Events)>> {
        let first = match timeout {
            Some(t) if t.is_zero() => self.rx.try_recv().ok(),
            Some(t) => match self.rx.recv_timeout(t) {
                Ok(ready) => Some(ready),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "poller disconnected"))
                }
            },
            None => Some(self.rx.recv().map_err(|_| {
                io::Error::new(io::ErrorKind::BrokenPipe, "poller disconnected")
            })?),
        };

        let mut ready: Vec<(SourceFd, Events)> = first.into_iter().collect();
        ready.extend(self.rx.try_iter());
        Ok(ready)
    }
}

/// Callback invoked when a source fires. Returning `false` removes the
/// source that fired.
pub trait SourceHandler<C> {
    fn on_ready(&mut self, fd: SourceFd, revents: Events, cx: &mut Dispatch<'_, C>) -> bool;
}

pub type SharedHandler<C> = Rc<RefCell<dyn SourceHandler<C>>>;

struct FnHandler<F>(F);

impl<C, F> SourceHandler<C> for FnHandler<F>
where
    F: FnMut(SourceFd, Events, &mut Dispatch<'_, C>) -> bool,
{
    fn on_ready(&mut self, fd: SourceFd, revents: Events, cx: &mut Dispatch<'_, C>) -> bool {
        (self.0)(fd, revents, cx)
    }
}

/// Wrap a closure as a shareable source handler.
pub fn handler_fn<C, F>(f: F) -> SharedHandler<C>
where
    C: 'static,
    F: FnMut(SourceFd, Events, &mut Dispatch<'_, C>) -> bool + 'static,
{
    Rc::new(RefCell::new(FnHandler(f)))
}

struct Registration<C> {
    id: u64,
    fd: SourceFd,
    interest: Events,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    handler: SharedHandler<C>,
}

/// The registration table.
pub struct Sources<C> {
    regs: Vec<Registration<C>>,
    next_id: u64,
    next_fd: SourceFd,
    next_virtual_fd: SourceFd,
    waker: Waker,
}

impl<C> Sources<C> {
    fn new(waker: Waker) -> Self {
        Self {
            regs: Vec::new(),
            next_id: 0,
            next_fd: 3,
            next_virtual_fd: VIRTUAL_FD - 1,
            waker,
        }
    }

    /// Register a source. Re-registering an fd replaces the previous
    /// registration in place.
    pub fn add(
        &mut self,
        fd: SourceFd,
        interest: Events,
        timeout: Option<Duration>,
        handler: SharedHandler<C>,
    ) {
        let id = self.next_id;
        self.next_id += 1;
        let reg = Registration {
            id,
            fd,
            interest,
            timeout,
            deadline: timeout.map(|t| Instant::now() + t),
            handler,
        };
        match self.regs.iter_mut().find(|r| r.fd == fd) {
            Some(existing) => {
                log::trace!("event loop: replacing source {fd}");
                *existing = reg;
            }
            None => self.regs.push(reg),
        }
    }

    /// Deregister `fd`. Returns whether it was registered.
    pub fn remove(&mut self, fd: SourceFd) -> bool {
        let before = self.regs.len();
        self.regs.retain(|r| r.fd != fd);
        before != self.regs.len()
    }

    fn remove_id(&mut self, id: u64) {
        self.regs.retain(|r| r.id != id);
    }

    fn contains_id(&self, id: u64) -> bool {
        self.regs.iter().any(|r| r.id == id)
    }

    pub fn contains(&self, fd: SourceFd) -> bool {
        self.regs.iter().any(|r| r.fd == fd)
    }

    pub fn len(&self) -> usize {
        self.regs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }

    pub fn clear(&mut self) {
        self.regs.clear();
    }

    /// A fresh fd for a source that is woken through [`Waker`].
    pub fn allocate_fd(&mut self) -> SourceFd {
        let fd = self.next_fd;
        self.next_fd += 1;
        fd
    }

    /// A fresh virtual fd, distinct from [`VIRTUAL_FD`].
    pub fn allocate_virtual_fd(&mut self) -> SourceFd {
        let fd = self.next_virtual_fd;
        self.next_virtual_fd -= 1;
        fd
    }

    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }
}

/// What a handler gets to work with while it runs: the registration table
/// and the loop's user context.
pub struct Dispatch<'a, C> {
    pub sources: &'a mut Sources<C>,
    pub data: &'a mut C,
}

pub struct EventLoop<C> {
    sources: Sources<C>,
    poller: Box<dyn Poller>,
}

impl<C: 'static> EventLoop<C> {
    pub fn new() -> Self {
        Self::with_poller(Box::new(ChannelPoller::new()))
    }

    pub fn with_poller(poller: Box<dyn Poller>) -> Self {
        Self {
            sources: Sources::new(poller.waker()),
            poller,
        }
    }

    pub fn sources(&mut self) -> &mut Sources<C> {
        &mut self.sources
    }

    pub fn waker(&self) -> Waker {
        self.sources.waker()
    }

    pub fn context<'a>(&'a mut self, data: &'a mut C) -> Dispatch<'a, C> {
        Dispatch {
            sources: &mut self.sources,
            data,
        }
    }

    /// Wait for readiness and dispatch every source that fired, in
    /// registration order. Returns the number of handlers invoked.
    ///
    /// Sources removed by an earlier handler in the same pass are skipped.
    pub fn run_once(&mut self, max_wait: Option<Duration>, data: &mut C) -> Result<usize> {
        if self.sources.is_empty() {
            return Ok(0);
        }

        let now = Instant::now();
        let mut wait = max_wait;
        for reg in &self.sources.regs {
            let remaining = if is_virtual(reg.fd) {
                Some(Duration::ZERO)
            } else {
                reg.deadline.map(|d| d.saturating_duration_since(now))
            };
            if let Some(r) = remaining {
                wait = Some(wait.map_or(r, |w| w.min(r)));
            }
        }

        let ready = loop {
            match self.poller.poll(wait) {
                Ok(ready) => break ready,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    log::trace!("event loop: poll interrupted, retrying");
                }
                Err(e) => {
                    log::error!("event loop: poll failed: {e}");
                    return Err(e.into());
                }
            }
        };

        let mut revents: HashMap<SourceFd, Events> = HashMap::new();
        for (fd, ev) in ready {
            let entry = revents.entry(fd).or_default();
            *entry = *entry | ev;
        }

        let now = Instant::now();
        let mut fired = Vec::new();
        for reg in &mut self.sources.regs {
            let ev = revents
                .get(&reg.fd)
                .map_or(Events::NONE, |ev| Events(ev.0 & (reg.interest.0 | Events::ERR.0)));
            let timed_out = reg.deadline.is_some_and(|d| d <= now);
            if is_virtual(reg.fd) || !ev.is_empty() || timed_out {
                if let Some(t) = reg.timeout {
                    reg.deadline = Some(now + t);
                }
                let ev = if is_virtual(reg.fd) && ev.is_empty() {
                    reg.interest
                } else {
                    ev
                };
                fired.push((reg.id, reg.fd, ev, Rc::clone(&reg.handler)));
            }
        }

        let mut dispatched = 0;
        for (id, fd, ev, handler) in fired {
            if !self.sources.contains_id(id) {
                continue;
            }
            let keep = {
                let mut cx = Dispatch {
                    sources: &mut self.sources,
                    data: &mut *data,
                };
                handler.borrow_mut().on_ready(fd, ev, &mut cx)
            };
            dispatched += 1;
            if !keep {
                self.sources.remove_id(id);
            }
        }
        Ok(dispatched)
    }
}

impl<C: 'static> Default for EventLoop<C> {
    fn default() -> Self {
        Self::new()
    }
}
