//! What an external event loop has to watch for a connection.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

bitflags::bitflags! {
    /// poll(2) readiness bits.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct Events: i16 {
        const IN = libc::POLLIN;
        const PRI = libc::POLLPRI;
        const OUT = libc::POLLOUT;
        const ERR = libc::POLLERR;
        const HUP = libc::POLLHUP;
    }
}

/// How long the loop may sleep before calling `iterate()` again.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Timeout {
    /// No deadline pending; wait for the descriptor only.
    Unbounded,
    Millis(u64),
}

impl Timeout {
    /// Rounds up, so the caller never wakes before the bus deadline.
    pub fn from_micros(usec: Option<u64>) -> Self {
        match usec {
            None | Some(u64::MAX) => Timeout::Unbounded,
            Some(usec) => Timeout::Millis(usec / 1000 + u64::from(usec % 1000 != 0)),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        matches!(self, Timeout::Unbounded)
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match *self {
            Timeout::Unbounded => None,
            Timeout::Millis(ms) => Some(Duration::from_millis(ms)),
        }
    }

    /// The `timeout` argument of poll(2): `-1` when unbounded.
    pub fn as_poll_millis(&self) -> libc::c_int {
        match *self {
            Timeout::Unbounded => -1,
            Timeout::Millis(ms) => ms.min(libc::c_int::MAX as u64) as libc::c_int,
        }
    }
}

/// A fresh snapshot of `{descriptor, interest mask, timeout}`.
///
/// Never cache one across iterations; the bus state it was computed from
/// changes with every `iterate()`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PollRequest {
    pub fd: RawFd,
    pub events: Events,
    pub timeout: Timeout,
}

impl PollRequest {
    /// Block in poll(2) until the descriptor is ready or the timeout elapses.
    ///
    /// `cap` shortens the wait further. Returns the ready events, empty on
    /// timeout. This is a convenience for hosts without their own reactor;
    /// the connection itself never calls it.
    pub fn wait(&self, cap: Option<Duration>) -> io::Result<Events> {
        let mut timeout = self.timeout.as_poll_millis();
        if let Some(cap) = cap {
            let usec = cap.as_micros();
            let ms = usec / 1000 + u128::from(usec % 1000 != 0);
            let cap = ms.min(libc::c_int::MAX as u128) as libc::c_int;
            if timeout < 0 || cap < timeout {
                timeout = cap;
            }
        }

        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: self.events.bits(),
            revents: 0,
        };

        loop {
            let ret = unsafe { libc::poll(&mut pfd, 1, timeout) };
            if ret >= 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }

        Ok(Events::from_bits_truncate(pfd.revents))
    }
}
