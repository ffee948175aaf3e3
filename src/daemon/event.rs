//! Sniffer event loop
//!
//! A single-threaded reactor: descriptors are watched with `poll(2)` and
//! one-shot deadline timers are kept in a min-heap. Each turn polls once,
//! bounded by the soonest timer, runs at most one due timer callback and then
//! the callbacks of every descriptor the poll reported ready.
//!
//! Callbacks receive the loop itself and the application context `S`, so
//! they may register, modify or cancel anything, including themselves.

use crate::{Result, SnifferError};

use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::fmt;
use std::io;
use std::ops::{BitAnd, BitOr};
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

/// Readiness interest of a registered descriptor
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(0x01);
    pub const WRITE: Interest = Interest(0x02);

    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_readable(self) -> bool {
        self.contains(Interest::READ)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Interest::WRITE)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Same interest with `other` removed
    pub fn without(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    fn to_poll_events(self) -> libc::c_short {
        let mut events = 0;
        if self.is_readable() {
            events |= libc::POLLIN;
        }
        if self.is_writable() {
            events |= libc::POLLOUT;
        }
        events
    }

    fn from_poll_events(revents: libc::c_short) -> Interest {
        let mut ready = Interest::NONE;
        if revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
            ready = ready | Interest::READ;
        }
        if revents & (libc::POLLOUT | libc::POLLERR) != 0 {
            ready = ready | Interest::WRITE;
        }
        ready
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitAnd for Interest {
    type Output = Interest;

    fn bitand(self, rhs: Interest) -> Interest {
        Interest(self.0 & rhs.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => write!(f, "READ|WRITE"),
            (true, false) => write!(f, "READ"),
            (false, true) => write!(f, "WRITE"),
            (false, false) => write!(f, "NONE"),
        }
    }
}

/// Cancellation token of a registered timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Descriptor readiness callback
pub type IoCallback<S> = Box<dyn FnMut(&mut EventLoop<S>, &mut S, RawFd, Interest)>;

/// One-shot timer callback
pub type TimerCallback<S> = Box<dyn FnOnce(&mut EventLoop<S>, &mut S)>;

/// Event loop statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoopStats {
    /// Completed turns
    pub turns: u64,
    pub timers_fired: u64,
    pub timers_cancelled: u64,
    /// Descriptor callbacks run
    pub io_dispatches: u64,
    /// Polls cut short by a signal
    pub interrupted_polls: u64,
}

struct Source<S> {
    interest: Interest,
    /// Taken out while the callback runs
    callback: Option<IoCallback<S>>,
    /// Distinguishes a re-registration made from inside the callback
    token: u64,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Deadline {
    when: Instant,
    seq: u64,
}

/// Single-threaded readiness and timer loop
pub struct EventLoop<S> {
    sources: BTreeMap<RawFd, Source<S>>,
    deadlines: BinaryHeap<Reverse<Deadline>>,
    timers: HashMap<u64, TimerCallback<S>>,
    next_seq: u64,
    running: bool,
    stats: LoopStats,
}

impl<S> fmt::Debug for EventLoop<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .field("timers", &self.timers.len())
            .field("running", &self.running)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<S> Default for EventLoop<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> EventLoop<S> {
    pub fn new() -> Self {
        Self {
            sources: BTreeMap::new(),
            deadlines: BinaryHeap::new(),
            timers: HashMap::new(),
            next_seq: 0,
            running: true,
            stats: LoopStats::default(),
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Watch `fd` for `interest`
    pub fn register<F>(&mut self, fd: RawFd, interest: Interest, callback: F) -> Result<()>
    where
        F: FnMut(&mut EventLoop<S>, &mut S, RawFd, Interest) + 'static,
    {
        if fd < 0 {
            return Err(SnifferError::InvalidParameter(format!("invalid descriptor {}", fd)));
        }
        if self.sources.contains_key(&fd) {
            return Err(SnifferError::Event(format!("descriptor {} already registered", fd)));
        }

        let token = self.next_seq();
        self.sources.insert(
            fd,
            Source {
                interest,
                callback: Some(Box::new(callback)),
                token,
            },
        );
        log::debug!("registered fd {} for {:?}", fd, interest);
        Ok(())
    }

    /// Change the interest set of a registered descriptor
    pub fn modify(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        let source = self
            .sources
            .get_mut(&fd)
            .ok_or_else(|| SnifferError::Event(format!("descriptor {} not registered", fd)))?;
        source.interest = interest;
        Ok(())
    }

    pub fn unregister(&mut self, fd: RawFd) -> Result<()> {
        if self.sources.remove(&fd).is_none() {
            return Err(SnifferError::Event(format!("descriptor {} not registered", fd)));
        }
        log::debug!("unregistered fd {}", fd);
        Ok(())
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.sources.contains_key(&fd)
    }

    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.sources.get(&fd).map(|s| s.interest)
    }

    /// Run `callback` once, `delay` from now
    pub fn register_timeout<F>(&mut self, delay: Duration, callback: F) -> TimerId
    where
        F: FnOnce(&mut EventLoop<S>, &mut S) + 'static,
    {
        let seq = self.next_seq();
        self.deadlines.push(Reverse(Deadline {
            when: Instant::now() + delay,
            seq,
        }));
        self.timers.insert(seq, Box::new(callback));
        TimerId(seq)
    }

    /// Drop a pending timer. Returns false if it already fired or was
    /// cancelled.
    pub fn cancel_timeout(&mut self, id: TimerId) -> bool {
        let cancelled = self.timers.remove(&id.0).is_some();
        if cancelled {
            self.stats.timers_cancelled += 1;
        }
        cancelled
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Deadline of the soonest live timer
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(top)) = self.deadlines.peek() {
            if self.timers.contains_key(&top.seq) {
                return Some(top.when);
            }
            self.deadlines.pop();
        }
        None
    }

    fn pop_due(&mut self, now: Instant) -> Option<TimerCallback<S>> {
        let when = self.next_deadline()?;
        if when > now {
            return None;
        }
        let Reverse(due) = self.deadlines.pop()?;
        self.timers.remove(&due.seq)
    }

    /// Poll every source once. Each ready descriptor comes back with the
    /// registration token it was polled under.
    fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<(RawFd, u64, Interest)>> {
        let tokens: Vec<u64> = self.sources.values().map(|s| s.token).collect();
        let mut fds: Vec<libc::pollfd> = self
            .sources
            .iter()
            .map(|(fd, source)| libc::pollfd {
                fd: *fd,
                events: source.interest.to_poll_events(),
                revents: 0,
            })
            .collect();

        let timeout_ms = match timeout {
            None => -1,
            Some(t) => {
                // round up so a timer is never woken for early
                let ms = t.as_nanos().div_ceil(1_000_000);
                ms.min(libc::c_int::MAX as u128) as libc::c_int
            }
        };

        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                self.stats.interrupted_polls += 1;
                return Ok(Vec::new());
            }
            return Err(SnifferError::Io(err));
        }

        Ok(fds
            .iter()
            .zip(tokens)
            .filter(|(p, _)| p.revents != 0)
            .map(|(p, token)| (p.fd, token, Interest::from_poll_events(p.revents)))
            .collect())
    }

    /// Poll once, then run at most one due timer and every ready descriptor
    pub fn turn(&mut self, state: &mut S) -> Result<()> {
        let timeout = self
            .next_deadline()
            .map(|when| when.saturating_duration_since(Instant::now()));

        let ready = self.poll(timeout)?;

        if let Some(callback) = self.pop_due(Instant::now()) {
            self.stats.timers_fired += 1;
            callback(self, state);
        }

        for (fd, token, events) in ready {
            // readiness belongs to the registration that was polled
            let (mut callback, interest) = match self.sources.get_mut(&fd) {
                Some(source) if source.token == token => match source.callback.take() {
                    Some(callback) => (callback, source.interest),
                    None => continue,
                },
                _ => continue,
            };

            let events = match events & interest {
                e if e.is_empty() => events,
                e => e,
            };
            self.stats.io_dispatches += 1;
            callback(self, state, fd, events);

            if let Some(source) = self.sources.get_mut(&fd) {
                if source.token == token && source.callback.is_none() {
                    source.callback = Some(callback);
                }
            }
        }

        self.stats.turns += 1;
        Ok(())
    }

    /// Turn until stopped or until nothing is left to wait on
    pub fn run(&mut self, state: &mut S) -> Result<()> {
        log::info!("Event loop started with {} descriptors", self.sources.len());

        while self.running {
            if self.sources.is_empty() && self.timers.is_empty() {
                log::info!("Event loop has nothing left to wait on");
                break;
            }
            self.turn(state)?;
        }

        log::info!("Event loop stopped after {} turns", self.stats.turns);
        Ok(())
    }

    /// Make `run` return after the current turn
    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }
}
