//! One logical bus connection driven by an external event loop.
//!
//! The loop asks [`Connection::request_poll`] what to wait for, waits, and
//! then calls [`Connection::iterate`] until it reports
//! [`QueryAction::WaitForEvent`]. Nothing here blocks except the handshake
//! performed while opening.
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use busloop::{BusScope, Connection, LoopbackDaemon, QueryAction};
//!
//! let daemon = Arc::new(LoopbackDaemon::new());
//! let mut conn = Connection::open(daemon, BusScope::Session, "org.example.Service")?;
//!
//! for _ in 0..3 {
//!     while conn.iterate()? == QueryAction::HasWorkToDo {}
//!     let request = conn.request_poll()?;
//!     request.wait(Some(Duration::from_millis(1)))?;
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::bus::{BusOpener, BusScope, SlotId};
use crate::config::Settings;
use crate::error::{Error, ErrorKind, Result, ResultExt};
use crate::handle::BusHandle;
use crate::match_rule::MatchRule;
use crate::message::Message;
use crate::poll::{PollRequest, Timeout};
use crate::queue::ReplyQueue;
use crate::vtable::{SignalHandler, VTable};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// What the event loop should do after an `iterate()` call.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum QueryAction {
    /// Call `iterate()` again right away.
    HasWorkToDo,
    /// Re-poll the descriptor before calling `iterate()` again.
    WaitForEvent,
}

/// Revocation token for an object vtable registration.
///
/// Valid only while the connection that issued it is alive. A slot handed
/// to another connection is ignored there with a warning.
#[must_use = "the registration stays active until the slot is passed back for removal"]
#[derive(PartialEq, Eq, Hash, Debug)]
pub struct ObjectSlot {
    owner: u64,
    id: SlotId,
}

impl ObjectSlot {
    pub fn id(&self) -> SlotId {
        self.id
    }
}

/// Revocation token for a signal match registration. Same rules as
/// [`ObjectSlot`].
#[must_use = "the match stays active until the slot is passed back for removal"]
#[derive(PartialEq, Eq, Hash, Debug)]
pub struct MatchSlot {
    owner: u64,
    id: SlotId,
}

impl MatchSlot {
    pub fn id(&self) -> SlotId {
        self.id
    }
}

enum Registration {
    Object { path: String, interface: String },
    Match(MatchRule),
}

/// The narrow, public-facing contract: name management plus the
/// poll/iterate cycle.
pub trait EventConnection: Send {
    fn request_name(&mut self, name: &str) -> Result<()>;
    fn release_name(&mut self, name: &str) -> Result<()>;
    fn iterate(&mut self) -> Result<QueryAction>;
    fn request_poll(&self) -> Result<PollRequest>;
}

/// The richer contract object-implementation glue composes against.
pub trait ObjectConnection: EventConnection {
    fn add_object_vtable(
        &mut self,
        path: &str,
        interface: &str,
        vtable: VTable,
    ) -> Result<ObjectSlot>;
    fn remove_object_vtable(&mut self, slot: ObjectSlot);
    fn create_method_call(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
        member: &str,
    ) -> Result<Message>;
    fn create_signal(&self, path: &str, interface: &str, member: &str) -> Result<Message>;
    fn register_signal_handler(
        &mut self,
        path: &str,
        interface: &str,
        member: &str,
        handler: SignalHandler,
    ) -> Result<MatchSlot>;
    fn unregister_signal_handler(&mut self, slot: MatchSlot);
    fn send(&mut self, message: Message) -> Result<u32>;
    fn send_reply_async(&mut self, reply: Message) -> Result<()>;
    fn clone_connection(&self) -> Result<Box<dyn ObjectConnection>>;
}

pub struct Connection {
    id: u64,
    settings: Settings,
    opener: Arc<dyn BusOpener>,
    registrations: HashMap<SlotId, Registration>,
    replies: ReplyQueue,
    bus: BusHandle,
}

/// Open a connection on `scope`, claiming `name` unless it is empty.
pub fn open(opener: Arc<dyn BusOpener>, scope: BusScope, name: &str) -> Result<Connection> {
    Connection::open(opener, scope, name)
}

pub fn open_system(opener: Arc<dyn BusOpener>, name: &str) -> Result<Box<dyn EventConnection>> {
    Ok(Box::new(Connection::open(opener, BusScope::System, name)?))
}

pub fn open_session(opener: Arc<dyn BusOpener>, name: &str) -> Result<Box<dyn EventConnection>> {
    Ok(Box::new(Connection::open(opener, BusScope::Session, name)?))
}

impl Connection {
    pub fn open(opener: Arc<dyn BusOpener>, scope: BusScope, name: &str) -> Result<Self> {
        let settings = Settings {
            scope,
            name: Some(name.to_string()),
            ..Settings::default()
        };
        Connection::open_with(opener, &settings)
    }

    /// Open the resource, finish the handshake, then claim the configured
    /// name. Any failure releases what was opened so far.
    pub fn open_with(opener: Arc<dyn BusOpener>, settings: &Settings) -> Result<Self> {
        let bus = opener.open(settings.scope).context(ErrorKind::OpenBus)?;
        let mut bus = BusHandle::new(bus);

        // Process Hello, authentication etc. now, before the daemon's
        // authentication timeout can hit us.
        bus.get_mut()
            .and_then(|b| b.flush())
            .context(ErrorKind::Handshake)?;

        let mut conn = Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            settings: settings.clone(),
            opener,
            registrations: HashMap::new(),
            replies: ReplyQueue::with_limit(settings.reply_queue_limit),
            bus,
        };

        tracing::debug!(
            connection = conn.id,
            scope = %conn.settings.scope,
            unique_name = conn.unique_name().unwrap_or("-"),
            "bus connection opened"
        );

        if let Some(name) = settings.name.as_deref().filter(|n| !n.is_empty()) {
            conn.request_name(name)?;
        }

        Ok(conn)
    }

    /// A new, independent connection on the same scope.
    ///
    /// Nothing is shared with `self`: the clone has its own resource, no
    /// registrations, an empty reply queue and does not own `self`'s name.
    pub fn try_clone(&self) -> Result<Connection> {
        let settings = Settings {
            name: None,
            ..self.settings.clone()
        };
        let conn = Connection::open_with(self.opener.clone(), &settings)?;
        tracing::debug!(connection = self.id, clone = conn.id, "bus connection cloned");
        Ok(conn)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn scope(&self) -> BusScope {
        self.settings.scope
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn unique_name(&self) -> Option<&str> {
        self.bus.get().ok()?.unique_name()
    }

    pub fn pending_replies(&self) -> usize {
        self.replies.len()
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.len()
    }

    pub fn request_name(&mut self, name: &str) -> Result<()> {
        self.bus
            .get_mut()
            .and_then(|b| b.request_name(name))
            .context(ErrorKind::RequestName)?;
        tracing::debug!(connection = self.id, name, "bus name acquired");
        Ok(())
    }

    pub fn release_name(&mut self, name: &str) -> Result<()> {
        self.bus
            .get_mut()
            .and_then(|b| b.release_name(name))
            .context(ErrorKind::ReleaseName)?;
        tracing::debug!(connection = self.id, name, "bus name released");
        Ok(())
    }

    /// Do at most one unit of work.
    ///
    /// Inbound processing goes first; only when the bus had nothing to do is
    /// the head of the deferred reply queue transmitted. An error here is
    /// fatal for the connection.
    pub fn iterate(&mut self) -> Result<QueryAction> {
        let bus = self.bus.get_mut().context(ErrorKind::Process)?;

        match bus.process(&mut self.replies) {
            Ok(true) => {
                tracing::trace!(connection = self.id, "processed inbound work");
                return Ok(QueryAction::HasWorkToDo);
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(connection = self.id, error = %e, "bus processing failed");
                return Err(Error::from_errno(ErrorKind::Process, e));
            }
        }

        if let Some(reply) = self.replies.pop_front() {
            let serial = bus.send(reply).context(ErrorKind::Send)?;
            tracing::trace!(connection = self.id, serial, "sent deferred reply");
            return Ok(QueryAction::HasWorkToDo);
        }

        Ok(QueryAction::WaitForEvent)
    }

    /// Snapshot of what the event loop has to wait for. Has no side effects.
    pub fn request_poll(&self) -> Result<PollRequest> {
        let bus = self.bus.get().context(ErrorKind::GetDescriptor)?;
        let fd = bus.fd().context(ErrorKind::GetDescriptor)?;
        let events = bus.events().context(ErrorKind::GetEvents)?;
        let timeout = Timeout::from_micros(bus.timeout().context(ErrorKind::GetTimeout)?);

        Ok(PollRequest {
            fd,
            events,
            timeout,
        })
    }

    pub fn add_object_vtable(
        &mut self,
        path: &str,
        interface: &str,
        vtable: VTable,
    ) -> Result<ObjectSlot> {
        let taken = self.registrations.values().any(|r| match r {
            Registration::Object {
                path: p,
                interface: i,
            } => p == path && i == interface,
            Registration::Match(_) => false,
        });
        if taken {
            return Err(Error::new(ErrorKind::AddObject, libc::EEXIST));
        }

        let id = self
            .bus
            .get_mut()
            .and_then(|b| b.add_object(path, interface, vtable))
            .context(ErrorKind::AddObject)?;

        self.registrations.insert(
            id,
            Registration::Object {
                path: path.into(),
                interface: interface.into(),
            },
        );
        tracing::debug!(connection = self.id, slot = %id, path, interface, "object vtable added");

        Ok(ObjectSlot { owner: self.id, id })
    }

    /// Detach a vtable. No dispatch reaches it once this returns, even for
    /// calls that had already arrived.
    pub fn remove_object_vtable(&mut self, slot: ObjectSlot) {
        self.remove_slot(slot.owner, slot.id);
    }

    pub fn register_signal_handler<F>(
        &mut self,
        path: &str,
        interface: &str,
        member: &str,
        handler: F,
    ) -> Result<MatchSlot>
    where
        F: FnMut(&Message) + Send + 'static,
    {
        let rule = MatchRule::new(path, interface, member);
        if !rule.is_well_formed() {
            return Err(Error::new(ErrorKind::AddMatch, libc::EINVAL));
        }

        let id = self
            .bus
            .get_mut()
            .and_then(|b| b.add_match(rule.clone(), Box::new(handler)))
            .context(ErrorKind::AddMatch)?;

        tracing::debug!(connection = self.id, slot = %id, rule = %rule, "signal match added");
        self.registrations.insert(id, Registration::Match(rule));

        Ok(MatchSlot { owner: self.id, id })
    }

    pub fn unregister_signal_handler(&mut self, slot: MatchSlot) {
        self.remove_slot(slot.owner, slot.id);
    }

    fn remove_slot(&mut self, owner: u64, id: SlotId) {
        // Slot ids are only unique per bus.
        if owner != self.id {
            tracing::warn!(
                connection = self.id,
                owner,
                slot = %id,
                "ignoring slot of another connection"
            );
            return;
        }

        let registration = match self.registrations.remove(&id) {
            Some(r) => r,
            None => return,
        };
        if let Ok(bus) = self.bus.get_mut() {
            bus.remove_slot(id);
        }
        match registration {
            Registration::Object { path, interface } => tracing::debug!(
                connection = self.id,
                slot = %id,
                path = %path,
                interface = %interface,
                "object vtable removed"
            ),
            Registration::Match(rule) => tracing::debug!(
                connection = self.id,
                slot = %id,
                rule = %rule,
                "signal match removed"
            ),
        }
    }

    pub fn create_method_call(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
        member: &str,
    ) -> Result<Message> {
        self.bus
            .get()
            .and_then(|b| b.new_method_call(destination, path, interface, member))
            .context(ErrorKind::CreateMessage)
    }

    pub fn create_signal(&self, path: &str, interface: &str, member: &str) -> Result<Message> {
        self.bus
            .get()
            .and_then(|b| b.new_signal(path, interface, member))
            .context(ErrorKind::CreateMessage)
    }

    /// Hand a message to the bus. It goes out during later iterations.
    pub fn send(&mut self, message: Message) -> Result<u32> {
        self.bus
            .get_mut()
            .and_then(|b| b.send(message))
            .context(ErrorKind::Send)
    }

    /// Send a method call; `handler` later sees the reply, or a
    /// `NoReply` error once the configured call timeout passes.
    pub fn call_async<F>(&mut self, message: Message, handler: F) -> Result<u32>
    where
        F: FnOnce(&Message) + Send + 'static,
    {
        let timeout = self.settings.call_timeout_usec();
        self.bus
            .get_mut()
            .and_then(|b| b.call_async(message, timeout, Box::new(handler)))
            .context(ErrorKind::Send)
    }

    /// Queue a reply behind all previously deferred ones.
    pub fn send_reply_async(&mut self, reply: Message) -> Result<()> {
        self.replies.enqueue(reply)
    }

    /// Tear down now and report what went wrong on the way.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.bus.is_released() {
            return Ok(());
        }

        let mut failure = None;

        if let Ok(bus) = self.bus.get_mut() {
            while let Some(reply) = self.replies.pop_front() {
                if let Err(e) = bus.send(reply) {
                    failure = Some(Error::from_errno(ErrorKind::Send, e));
                    break;
                }
            }
        }
        if !self.replies.is_empty() {
            tracing::warn!(
                connection = self.id,
                dropped = self.replies.len(),
                "deferred replies dropped on close"
            );
            while self.replies.pop_front().is_some() {}
        }

        self.registrations.clear();

        if let Err(e) = self.bus.release() {
            if failure.is_none() {
                failure = Some(Error::from_errno(ErrorKind::Flush, e));
            }
        }
        tracing::debug!(connection = self.id, "bus connection released");

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(connection = self.id, error = %e, "bus connection closed uncleanly");
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("scope", &self.settings.scope)
            .field("unique_name", &self.unique_name())
            .field("registrations", &self.registrations.len())
            .field("pending_replies", &self.replies.len())
            .field("released", &self.bus.is_released())
            .finish()
    }
}

impl EventConnection for Connection {
    fn request_name(&mut self, name: &str) -> Result<()> {
        Connection::request_name(self, name)
    }

    fn release_name(&mut self, name: &str) -> Result<()> {
        Connection::release_name(self, name)
    }

    fn iterate(&mut self) -> Result<QueryAction> {
        Connection::iterate(self)
    }

    fn request_poll(&self) -> Result<PollRequest> {
        Connection::request_poll(self)
    }
}

impl ObjectConnection for Connection {
    fn add_object_vtable(
        &mut self,
        path: &str,
        interface: &str,
        vtable: VTable,
    ) -> Result<ObjectSlot> {
        Connection::add_object_vtable(self, path, interface, vtable)
    }

    fn remove_object_vtable(&mut self, slot: ObjectSlot) {
        Connection::remove_object_vtable(self, slot)
    }

    fn create_method_call(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
        member: &str,
    ) -> Result<Message> {
        Connection::create_method_call(self, destination, path, interface, member)
    }

    fn create_signal(&self, path: &str, interface: &str, member: &str) -> Result<Message> {
        Connection::create_signal(self, path, interface, member)
    }

    fn register_signal_handler(
        &mut self,
        path: &str,
        interface: &str,
        member: &str,
        handler: SignalHandler,
    ) -> Result<MatchSlot> {
        Connection::register_signal_handler(self, path, interface, member, handler)
    }

    fn unregister_signal_handler(&mut self, slot: MatchSlot) {
        Connection::unregister_signal_handler(self, slot)
    }

    fn send(&mut self, message: Message) -> Result<u32> {
        Connection::send(self, message)
    }

    fn send_reply_async(&mut self, reply: Message) -> Result<()> {
        Connection::send_reply_async(self, reply)
    }

    fn clone_connection(&self) -> Result<Box<dyn ObjectConnection>> {
        Ok(Box::new(self.try_clone()?))
    }
}
