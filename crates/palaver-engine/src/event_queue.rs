//! Cooperative, single-threaded I/O event loop.
//!
//! Objects implementing [`IdleObject`] are plugged in by file descriptor.
//! Each call to [`EventQueue::process`] polls every descriptor once with a
//! zero timeout, dispatches readiness to the objects, then fires due read
//! timeouts and alarms. It never blocks, so the embedder decides the cadence
//! (see [`crate::driver::drive`]).
//!
//! Callbacks receive `&mut EventQueue` and may plug, unplug, re-arm interest
//! or set alarms from inside the loop. An object's own `RefCell` is borrowed
//! while its callback runs, so it must change its own registration through
//! [`EventQueue::update_interest`] rather than [`EventQueue::plug`].

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use palaver_core::{SharedClock, SystemClock};
use tracing::{debug, trace, warn};

use crate::error::{EngineError, EngineResult};

/// Something the event queue can watch.
///
/// All callbacks default to doing nothing.
pub trait IdleObject {
    /// The descriptor to watch, or -1 if there is none.
    fn fd(&self) -> RawFd;

    /// The descriptor is readable.
    fn pollin(&mut self, _queue: &mut EventQueue) {}

    /// The descriptor is writable.
    fn pollout(&mut self, _queue: &mut EventQueue) {}

    /// The descriptor hung up or errored. The object has already been
    /// unplugged when this runs.
    fn pollend(&mut self, _queue: &mut EventQueue) {}

    /// The read timeout set with [`EventQueue::set_read_timeout`] expired.
    /// The object stays plugged.
    fn read_timeout(&mut self, _queue: &mut EventQueue) {}
}

/// Shared handle to a plugged object.
pub type SharedObject = Rc<RefCell<dyn IdleObject>>;

type AlarmFn = Box<dyn FnOnce(&mut EventQueue)>;

/// Which readiness an fd is watched for. Neither flag set means the fd is
/// only watched for hangup and errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub fn new(want_write: bool, want_read: bool) -> Self {
        Self {
            read: want_read,
            write: want_write,
        }
    }
}

/// Readiness reported for one fd by a poll pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub closed: bool,
}

/// The OS multiplexer.
pub trait Poller {
    /// Starts watching `fd`, replacing any previous interest.
    fn register(&mut self, fd: RawFd, interest: Interest);

    fn deregister(&mut self, fd: RawFd);

    fn is_registered(&self, fd: RawFd) -> bool;

    /// Polls every registered fd without blocking.
    fn poll(&mut self) -> io::Result<Vec<(RawFd, Readiness)>>;
}

/// [`Poller`] backed by `poll(2)`.
#[derive(Debug, Default)]
pub struct PollPoller {
    interests: BTreeMap<RawFd, Interest>,
}

impl PollPoller {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Poller for PollPoller {
    fn register(&mut self, fd: RawFd, interest: Interest) {
        self.interests.insert(fd, interest);
    }

    fn deregister(&mut self, fd: RawFd) {
        self.interests.remove(&fd);
    }

    fn is_registered(&self, fd: RawFd) -> bool {
        self.interests.contains_key(&fd)
    }

    fn poll(&mut self) -> io::Result<Vec<(RawFd, Readiness)>> {
        let mut fds: Vec<libc::pollfd> = self
            .interests
            .iter()
            .map(|(&fd, interest)| {
                let mut events = 0;
                if interest.read {
                    events |= libc::POLLIN | libc::POLLPRI;
                }
                if interest.write {
                    events |= libc::POLLOUT;
                }
                libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                }
            })
            .collect();

        // SAFETY: `fds` is a valid, initialised slice for the duration of the call.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(fds
            .iter()
            .filter(|p| p.revents != 0)
            .map(|p| {
                (
                    p.fd,
                    Readiness {
                        readable: p.revents & (libc::POLLIN | libc::POLLPRI) != 0,
                        writable: p.revents & libc::POLLOUT != 0,
                        closed: p.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0,
                    },
                )
            })
            .collect())
    }
}

/// Handle for cancelling an alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AlarmHandle {
    deadline: Instant,
    seq: u64,
}

impl AlarmHandle {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// The event loop.
pub struct EventQueue {
    objects: HashMap<RawFd, SharedObject>,
    poller: Box<dyn Poller>,
    clock: SharedClock,
    read_timeouts: HashMap<RawFd, Instant>,
    alarms: BTreeMap<AlarmHandle, AlarmFn>,
    next_alarm: u64,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    /// Creates a queue using `poll(2)` and the system clock.
    pub fn new() -> Self {
        Self::with_parts(Box::new(PollPoller::new()), Rc::new(SystemClock))
    }

    pub fn with_parts(poller: Box<dyn Poller>, clock: SharedClock) -> Self {
        Self {
            objects: HashMap::new(),
            poller,
            clock,
            read_timeouts: HashMap::new(),
            alarms: BTreeMap::new(),
            next_alarm: 0,
        }
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Starts watching an object. Plugging an fd that is already plugged
    /// replaces the previous registration. An fd of -1 is ignored.
    pub fn plug(&mut self, object: SharedObject, want_write: bool, want_read: bool) {
        let fd = match object.try_borrow() {
            Ok(obj) => obj.fd(),
            Err(_) => {
                warn!("cannot plug an object from inside its own callback");
                return;
            }
        };
        if fd == -1 {
            return;
        }
        if self.objects.contains_key(&fd) {
            self.unplug(fd);
        }
        trace!(fd = fd, want_read = want_read, want_write = want_write, "plug");
        self.objects.insert(fd, object);
        self.poller.register(fd, Interest::new(want_write, want_read));
    }

    /// Stops watching an fd and drops its read timeout.
    pub fn unplug(&mut self, fd: RawFd) {
        trace!(fd = fd, "unplug");
        self.objects.remove(&fd);
        self.poller.deregister(fd);
        self.read_timeouts.remove(&fd);
    }

    /// Changes what an already plugged fd is watched for. Returns false if
    /// the fd is not plugged.
    pub fn update_interest(&mut self, fd: RawFd, want_write: bool, want_read: bool) -> bool {
        if !self.objects.contains_key(&fd) {
            return false;
        }
        self.poller.register(fd, Interest::new(want_write, want_read));
        true
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.objects.contains_key(&fd) && self.poller.is_registered(fd)
    }

    /// Number of plugged objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Arms (or re-arms) the read timeout of an fd.
    pub fn set_read_timeout(&mut self, fd: RawFd, after: Duration) {
        self.read_timeouts.insert(fd, self.clock.now() + after);
    }

    pub fn remove_timeout(&mut self, fd: RawFd) {
        self.read_timeouts.remove(&fd);
    }

    pub fn has_timeout(&self, fd: RawFd) -> bool {
        self.read_timeouts.contains_key(&fd)
    }

    /// Schedules a one-shot callback. Alarms with the same deadline fire in
    /// the order they were set.
    pub fn set_alarm<F>(&mut self, callback: F, after: Duration) -> AlarmHandle
    where
        F: FnOnce(&mut EventQueue) + 'static,
    {
        let handle = AlarmHandle {
            deadline: self.clock.now() + after,
            seq: self.next_alarm,
        };
        self.next_alarm += 1;
        self.alarms.insert(handle, Box::new(callback));
        handle
    }

    /// Cancels an alarm. Returns false if it already fired or was removed.
    pub fn remove_alarm(&mut self, handle: AlarmHandle) -> bool {
        self.alarms.remove(&handle).is_some()
    }

    /// Runs one non-blocking pass: readiness first, then timeouts and alarms.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Poll`] if the multiplexer fails for any reason
    /// other than an interrupted system call.
    pub fn process(&mut self) -> EngineResult<()> {
        if !self.objects.is_empty() {
            let ready = match self.poller.poll() {
                Ok(ready) => ready,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    debug!("poll interrupted");
                    Vec::new()
                }
                Err(e) => return Err(EngineError::Poll(e)),
            };
            for (fd, readiness) in ready {
                self.dispatch(fd, readiness);
            }
        }
        self.check_time_events();
        Ok(())
    }

    fn dispatch(&mut self, fd: RawFd, readiness: Readiness) {
        let Some(object) = self.objects.get(&fd).cloned() else {
            debug!(fd = fd, "readiness for an fd with no object");
            self.unplug(fd);
            return;
        };
        let Ok(mut obj) = object.try_borrow_mut() else {
            warn!(fd = fd, "object busy, skipping event");
            return;
        };
        if readiness.readable {
            obj.pollin(self);
        } else if readiness.writable {
            obj.pollout(self);
        } else if readiness.closed {
            debug!(fd = fd, "descriptor closed");
            self.unplug(fd);
            obj.pollend(self);
        }
    }

    fn check_time_events(&mut self) {
        let now = self.clock.now();

        let mut due: Vec<(Instant, RawFd)> = self
            .read_timeouts
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(&fd, &deadline)| (deadline, fd))
            .collect();
        due.sort();
        for (_, fd) in due {
            self.read_timeouts.remove(&fd);
            let Some(object) = self.objects.get(&fd).cloned() else {
                continue;
            };
            trace!(fd = fd, "read timeout");
            match object.try_borrow_mut() {
                Ok(mut obj) => obj.read_timeout(self),
                Err(_) => warn!(fd = fd, "object busy, dropping read timeout"),
            };
        }

        let fired: Vec<AlarmHandle> = self
            .alarms
            .keys()
            .take_while(|handle| handle.deadline <= now)
            .copied()
            .collect();
        for handle in fired {
            if let Some(callback) = self.alarms.remove(&handle) {
                callback(self);
            }
        }
    }
}
