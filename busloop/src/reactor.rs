//! Driving a [`Connection`] from a tokio runtime.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use busloop::{AsyncConnection, BusScope, Connection, LoopbackDaemon};
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> busloop::Result<()> {
//! let daemon = Arc::new(LoopbackDaemon::new());
//! let conn = Connection::open(daemon, BusScope::Session, "org.example.Service")?;
//! let mut conn = AsyncConnection::new(conn)?;
//! loop {
//!     conn.turn().await?;
//! }
//! # }
//! ```

use std::os::unix::io::{AsRawFd, RawFd};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::connection::{Connection, QueryAction};
use crate::error::{Error, ErrorKind, Result};
use crate::poll::{Events, Timeout};

struct BusFd(RawFd);

impl AsRawFd for BusFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// A connection whose descriptor is registered with the tokio reactor.
pub struct AsyncConnection {
    // Deregistered before the connection closes the descriptor.
    fd: AsyncFd<BusFd>,
    conn: Connection,
}

impl AsyncConnection {
    pub fn new(conn: Connection) -> Result<Self> {
        let request = conn.request_poll()?;
        let fd = AsyncFd::new(BusFd(request.fd))
            .map_err(|e| Error::from_io(ErrorKind::GetDescriptor, &e))?;
        Ok(AsyncConnection { fd, conn })
    }

    pub fn get_ref(&self) -> &Connection {
        &self.conn
    }

    pub fn get_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn into_inner(self) -> Connection {
        let AsyncConnection { fd, conn } = self;
        drop(fd);
        conn
    }

    /// Wait for the descriptor or the bus deadline, whichever comes first,
    /// then run the connection until it has nothing left to do.
    ///
    /// Does not wait at all while the bus reports work it can do right away.
    /// Other tasks get a chance to run between units of work.
    pub async fn turn(&mut self) -> Result<()> {
        let request = self.conn.request_poll()?;
        if request.timeout != Timeout::Millis(0) {
            self.wait(request.events, request.timeout).await?;
        }

        while self.conn.iterate()? == QueryAction::HasWorkToDo {
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    async fn wait(&mut self, events: Events, timeout: Timeout) -> Result<()> {
        let id = self.conn.id();
        let interest = if events.contains(Events::OUT) {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };

        let ready = self.fd.ready(interest);
        let guard = match timeout.as_duration() {
            None => ready.await,
            Some(limit) => match tokio::time::timeout(limit, ready).await {
                Ok(guard) => guard,
                Err(_elapsed) => {
                    tracing::trace!(connection = id, "bus deadline reached");
                    return Ok(());
                }
            },
        };

        // Readiness is re-armed before iterating, so nothing arriving from
        // here on is missed.
        let mut guard = guard.map_err(|e| Error::from_io(ErrorKind::Process, &e))?;
        guard.clear_ready();
        Ok(())
    }
}
