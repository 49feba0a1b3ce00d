use std::io;

use crate::bus::Errno;

/// The operation that failed.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum ErrorKind {
    OpenBus,
    Handshake,
    Flush,
    RequestName,
    ReleaseName,
    GetDescriptor,
    GetEvents,
    GetTimeout,
    Process,
    Send,
    AddObject,
    AddMatch,
    CreateMessage,
    ReplyQueueFull,
    Config,
}

impl ::std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        match self {
            ErrorKind::OpenBus => write!(f, "Failed to open bus"),
            ErrorKind::Handshake => write!(f, "Failed to flush bus on opening"),
            ErrorKind::Flush => write!(f, "Failed to flush bus on closing"),
            ErrorKind::RequestName => write!(f, "Failed to request bus name"),
            ErrorKind::ReleaseName => write!(f, "Failed to release bus name"),
            ErrorKind::GetDescriptor => write!(f, "Failed to get bus descriptor"),
            ErrorKind::GetEvents => write!(f, "Failed to get bus events"),
            ErrorKind::GetTimeout => write!(f, "Failed to get bus timeout"),
            ErrorKind::Process => write!(f, "Failed to process bus requests"),
            ErrorKind::Send => write!(f, "Failed to send message"),
            ErrorKind::AddObject => write!(f, "Failed to register object vtable"),
            ErrorKind::AddMatch => write!(f, "Failed to register signal handler"),
            ErrorKind::CreateMessage => write!(f, "Failed to create message"),
            ErrorKind::ReplyQueueFull => write!(f, "Deferred reply queue is full"),
            ErrorKind::Config => write!(f, "Invalid connection settings"),
        }
    }
}

/// A failure surfaced from the underlying bus resource.
///
/// `code` is the positive OS error number reported by the bus library and
/// `message` its human readable description.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    code: i32,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, code: i32) -> Self {
        Error {
            kind,
            code,
            message: io::Error::from_raw_os_error(code).to_string(),
        }
    }

    pub fn with_message<S: Into<String>>(kind: ErrorKind, code: i32, message: S) -> Self {
        Error {
            kind,
            code,
            message: message.into(),
        }
    }

    pub fn from_errno(kind: ErrorKind, errno: Errno) -> Self {
        Error::new(kind, errno.code())
    }

    pub fn from_io(kind: ErrorKind, e: &io::Error) -> Self {
        match e.raw_os_error() {
            Some(code) => Error::new(kind, code),
            None => Error::with_message(kind, libc::EIO, e.to_string()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Attach an [`ErrorKind`] to a bus-level [`Errno`].
///
/// ```
/// use busloop::{Errno, ErrorKind, ResultExt};
///
/// let r: Result<(), Errno> = Err(Errno::EEXIST);
/// let e = r.context(ErrorKind::RequestName).unwrap_err();
/// assert_eq!(e.kind(), ErrorKind::RequestName);
/// assert_eq!(e.code(), libc::EEXIST);
/// ```
pub trait ResultExt<T> {
    fn context(self, kind: ErrorKind) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, Errno> {
    #[inline]
    fn context(self, kind: ErrorKind) -> Result<T> {
        self.map_err(|e| Error::from_errno(kind, e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
