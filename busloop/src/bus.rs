//! The boundary to the underlying bus library.
//!
//! Message marshaling, authentication and the daemon protocol live behind
//! these traits. A [`Connection`](crate::Connection) only ever talks to a
//! `Box<dyn Bus>` obtained from a [`BusOpener`].

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::str::FromStr;

use crate::match_rule::MatchRule;
use crate::message::Message;
use crate::poll::Events;
use crate::queue::ReplyQueue;
use crate::vtable::{ReplyHandler, SignalHandler, VTable};

/// Which bus a connection is opened on. Immutable once a connection exists.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[serde(rename_all = "lowercase")]
pub enum BusScope {
    System,
    #[default]
    #[serde(alias = "user")]
    Session,
}

impl fmt::Display for BusScope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BusScope::System => write!(f, "system"),
            BusScope::Session => write!(f, "session"),
        }
    }
}

impl FromStr for BusScope {
    type Err = Errno;

    fn from_str(s: &str) -> std::result::Result<Self, Errno> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(BusScope::System),
            "session" | "user" => Ok(BusScope::Session),
            _ => Err(Errno::EINVAL),
        }
    }
}

/// A positive OS error number reported by the bus library.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Errno(i32);

impl Errno {
    pub const EINVAL: Errno = Errno(libc::EINVAL);
    pub const EEXIST: Errno = Errno(libc::EEXIST);
    pub const ESRCH: Errno = Errno(libc::ESRCH);
    pub const EADDRINUSE: Errno = Errno(libc::EADDRINUSE);
    pub const ENOTCONN: Errno = Errno(libc::ENOTCONN);
    pub const ECONNRESET: Errno = Errno(libc::ECONNRESET);
    pub const ECONNREFUSED: Errno = Errno(libc::ECONNREFUSED);
    pub const ENOBUFS: Errno = Errno(libc::ENOBUFS);
    pub const EIO: Errno = Errno(libc::EIO);

    /// Accepts both the positive and the negative-return convention.
    pub fn new(code: i32) -> Self {
        Errno(code.abs())
    }

    pub fn code(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", io::Error::from_raw_os_error(self.0))
    }
}

impl From<io::Error> for Errno {
    fn from(e: io::Error) -> Self {
        Errno(e.raw_os_error().unwrap_or(libc::EIO))
    }
}

pub type BusResult<T> = std::result::Result<T, Errno>;

/// Identifies a registration inside one bus resource.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct SlotId(pub u64);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// One raw, exclusively owned bus resource.
///
/// Implementations must never block outside of [`Bus::flush`].
pub trait Bus: Send {
    /// The unique name the bus assigned to this peer.
    fn unique_name(&self) -> Option<&str>;

    /// Write out everything buffered, blocking until done.
    fn flush(&mut self) -> BusResult<()>;

    /// Perform at most one unit of work. Returns `true` if work was done.
    ///
    /// Method handlers dispatched from here may push onto `deferred`.
    fn process(&mut self, deferred: &mut ReplyQueue) -> BusResult<bool>;

    fn fd(&self) -> BusResult<RawFd>;

    fn events(&self) -> BusResult<Events>;

    /// Microseconds until the next internal deadline, `None` if there is none.
    fn timeout(&self) -> BusResult<Option<u64>>;

    fn request_name(&mut self, name: &str) -> BusResult<()>;

    fn release_name(&mut self, name: &str) -> BusResult<()>;

    fn add_object(&mut self, path: &str, interface: &str, vtable: VTable) -> BusResult<SlotId>;

    fn add_match(&mut self, rule: MatchRule, handler: SignalHandler) -> BusResult<SlotId>;

    /// Detach a registration. No dispatch happens for it after this returns.
    fn remove_slot(&mut self, slot: SlotId);

    fn new_method_call(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
        member: &str,
    ) -> BusResult<Message>;

    fn new_signal(&self, path: &str, interface: &str, member: &str) -> BusResult<Message>;

    /// Queue a message for transmission and return its serial.
    fn send(&mut self, message: Message) -> BusResult<u32>;

    /// Send a method call and arrange for `handler` to see its reply.
    fn call_async(
        &mut self,
        message: Message,
        timeout_usec: u64,
        handler: ReplyHandler,
    ) -> BusResult<u32>;

    /// Unregister from the bus. Called once, after the final `flush`.
    fn close(&mut self);
}

/// Opens raw bus resources. Shared between a connection and its clones.
pub trait BusOpener: Send + Sync {
    fn open(&self, scope: BusScope) -> BusResult<Box<dyn Bus>>;
}
