//! An in-process bus.
//!
//! `LoopbackDaemon` plays the role of the bus daemon for any number of
//! peers living in the same process. It routes messages between them, owns
//! well-known names, and gives every peer a real socket descriptor that is
//! readable while the peer has undispatched inbound messages, so event
//! loops can poll it like any other bus descriptor.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::bus::{Bus, BusOpener, BusResult, BusScope, Errno, SlotId};
use crate::match_rule::MatchRule;
use crate::message::{
    Message, MessageType, ERROR_NO_REPLY, ERROR_SERVICE_UNKNOWN, ERROR_UNKNOWN_METHOD,
    ERROR_UNKNOWN_OBJECT,
};
use crate::poll::Events;
use crate::queue::ReplyQueue;
use crate::vtable::{Call, ReplyHandler, SignalHandler, VTable};

const DAEMON_NAME: &str = "org.freedesktop.DBus";

struct Peer {
    inbox: VecDeque<Message>,
    wake: UnixStream,
    broken: bool,
}

impl Peer {
    fn push(&mut self, message: Message) {
        if self.inbox.is_empty() {
            // A full socket buffer is already readable.
            let _ = self.wake.write(&[1]);
        }
        self.inbox.push_back(message);
    }
}

#[derive(Default)]
struct BusState {
    next_peer: u64,
    peers: HashMap<String, Peer>,
    names: HashMap<String, String>,
}

impl BusState {
    fn resolve(&self, name: &str) -> Option<String> {
        if name.starts_with(':') {
            self.peers.contains_key(name).then(|| name.to_string())
        } else {
            self.names.get(name).cloned()
        }
    }

    fn route(&mut self, message: Message) {
        if message.kind == MessageType::Signal && message.destination.is_none() {
            for peer in self.peers.values_mut() {
                peer.push(message.clone());
            }
            return;
        }

        let target = match message.destination.as_deref() {
            Some(destination) => self.resolve(destination),
            None => None,
        };
        let peer = match target {
            Some(target) => self.peers.get_mut(&target),
            None => None,
        };
        match peer {
            Some(peer) => peer.push(message),
            None if message.is_method_call() => {
                let text = format!(
                    "The name {} was not provided by any peer",
                    message.destination.as_deref().unwrap_or("")
                );
                let mut error = message.error_reply(ERROR_SERVICE_UNKNOWN, &text);
                error.sender = Some(DAEMON_NAME.into());
                let caller = match message.sender.as_deref() {
                    Some(sender) => self.peers.get_mut(sender),
                    None => None,
                };
                if let Some(caller) = caller {
                    caller.push(error);
                }
            }
            None => {
                tracing::trace!(serial = message.serial, "dropping message for vanished peer");
            }
        }
    }
}

#[derive(Default)]
struct DaemonState {
    buses: HashMap<BusScope, BusState>,
    refuse_open: Option<Errno>,
}

fn lock(state: &Mutex<DaemonState>) -> MutexGuard<'_, DaemonState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The in-process stand-in for a bus daemon. Serves both scopes, each as a
/// separate bus.
#[derive(Clone, Default)]
pub struct LoopbackDaemon {
    state: Arc<Mutex<DaemonState>>,
}

impl LoopbackDaemon {
    pub fn new() -> Self {
        LoopbackDaemon::default()
    }

    /// Make every following `open` fail with `errno`, or succeed again with `None`.
    pub fn refuse_open(&self, errno: Option<Errno>) {
        lock(&self.state).refuse_open = errno;
    }

    /// Sever a peer; its next flush or processing step fails with `ECONNRESET`.
    pub fn break_peer(&self, scope: BusScope, unique_name: &str) {
        if let Some(peer) = lock(&self.state)
            .buses
            .get_mut(&scope)
            .and_then(|b| b.peers.get_mut(unique_name))
        {
            peer.broken = true;
        }
    }

    pub fn name_owner(&self, scope: BusScope, name: &str) -> Option<String> {
        lock(&self.state).buses.get(&scope)?.resolve(name)
    }

    pub fn peer_count(&self, scope: BusScope) -> usize {
        lock(&self.state)
            .buses
            .get(&scope)
            .map_or(0, |b| b.peers.len())
    }
}

impl BusOpener for LoopbackDaemon {
    fn open(&self, scope: BusScope) -> BusResult<Box<dyn Bus>> {
        let mut state = lock(&self.state);
        if let Some(errno) = state.refuse_open {
            return Err(errno);
        }

        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;

        let bus = state.buses.entry(scope).or_default();
        bus.next_peer += 1;
        let unique_name = format!(":1.{}", bus.next_peer);
        bus.peers.insert(
            unique_name.clone(),
            Peer {
                inbox: VecDeque::new(),
                wake: writer,
                broken: false,
            },
        );
        tracing::debug!(%scope, unique_name = %unique_name, "loopback peer connected");

        Ok(Box::new(LoopbackBus {
            daemon: self.state.clone(),
            scope,
            unique_name,
            wake: reader,
            outbox: VecDeque::new(),
            next_serial: 0,
            next_slot: 0,
            objects: BTreeMap::new(),
            matches: BTreeMap::new(),
            pending: HashMap::new(),
            closed: false,
        }))
    }
}

struct ObjectEntry {
    path: String,
    interface: String,
    vtable: VTable,
}

struct MatchEntry {
    rule: MatchRule,
    handler: SignalHandler,
}

struct PendingCall {
    deadline: Instant,
    handler: ReplyHandler,
}

/// One peer of a [`LoopbackDaemon`].
pub struct LoopbackBus {
    daemon: Arc<Mutex<DaemonState>>,
    scope: BusScope,
    unique_name: String,
    wake: UnixStream,
    outbox: VecDeque<Message>,
    next_serial: u32,
    next_slot: u64,
    objects: BTreeMap<SlotId, ObjectEntry>,
    matches: BTreeMap<SlotId, MatchEntry>,
    pending: HashMap<u32, PendingCall>,
    closed: bool,
}

impl LoopbackBus {
    fn check_alive(&self) -> BusResult<()> {
        if self.closed {
            return Err(Errno::ENOTCONN);
        }
        let state = lock(&self.daemon);
        match state
            .buses
            .get(&self.scope)
            .and_then(|b| b.peers.get(&self.unique_name))
        {
            Some(peer) if !peer.broken => Ok(()),
            _ => Err(Errno::ECONNRESET),
        }
    }

    fn stamp(&mut self, mut message: Message) -> Message {
        self.next_serial = self.next_serial.wrapping_add(1).max(1);
        message.serial = self.next_serial;
        message.sender = Some(self.unique_name.clone());
        message
    }

    fn deliver(&mut self, message: Message) {
        let mut state = lock(&self.daemon);
        if let Some(bus) = state.buses.get_mut(&self.scope) {
            bus.route(message);
        }
    }

    fn next_inbound(&mut self) -> Option<Message> {
        let mut state = lock(&self.daemon);
        let peer = state
            .buses
            .get_mut(&self.scope)?
            .peers
            .get_mut(&self.unique_name)?;
        let message = peer.inbox.pop_front()?;
        if peer.inbox.is_empty() {
            drain(&self.wake);
        }
        Some(message)
    }

    fn has_inbound(&self) -> bool {
        lock(&self.daemon)
            .buses
            .get(&self.scope)
            .and_then(|b| b.peers.get(&self.unique_name))
            .map_or(false, |p| !p.inbox.is_empty())
    }

    fn expired_call(&self) -> Option<u32> {
        let now = Instant::now();
        self.pending
            .iter()
            .filter(|(_, call)| call.deadline <= now)
            .min_by_key(|(_, call)| call.deadline)
            .map(|(serial, _)| *serial)
    }

    fn dispatch(&mut self, message: Message, deferred: &mut ReplyQueue) {
        match message.kind {
            MessageType::MethodReturn | MessageType::Error => {
                let call = message.reply_serial.and_then(|s| self.pending.remove(&s));
                match call {
                    Some(call) => (call.handler)(&message),
                    None => tracing::trace!(serial = message.serial, "unexpected reply"),
                }
            }
            MessageType::Signal => {
                for entry in self.matches.values_mut() {
                    if entry.rule.matches(&message) {
                        (entry.handler)(&message);
                    }
                }
            }
            MessageType::MethodCall => self.dispatch_call(message, deferred),
        }
    }

    fn dispatch_call(&mut self, message: Message, deferred: &mut ReplyQueue) {
        let path = message.path().unwrap_or("");
        let member = message.member().unwrap_or("");
        let mut outgoing = Vec::new();

        let known_path = self.objects.values().any(|o| o.path == path);
        let entry = self.objects.values_mut().find(|o| {
            o.path == path
                && match message.interface() {
                    Some(interface) => o.interface == interface,
                    None => o.vtable.contains(member),
                }
        });

        match entry.and_then(|o| o.vtable.handler_mut(member)) {
            Some(handler) => {
                let mut call = Call::new(&message, &mut outgoing, deferred);
                let result = handler(&mut call);
                if let Err(e) = result {
                    outgoing.push(message.error_reply(&e.name, &e.message));
                }
            }
            None if !known_path => {
                let text = format!("Unknown object '{}'.", path);
                outgoing.push(message.error_reply(ERROR_UNKNOWN_OBJECT, &text));
            }
            None => {
                let text = format!(
                    "Unknown method '{}' or interface '{}'.",
                    member,
                    message.interface().unwrap_or("")
                );
                outgoing.push(message.error_reply(ERROR_UNKNOWN_METHOD, &text));
            }
        }

        for reply in outgoing {
            let reply = self.stamp(reply);
            self.outbox.push_back(reply);
        }
    }
}

fn drain(stream: &UnixStream) {
    let mut buf = [0u8; 64];
    let mut reader = stream;
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

impl Bus for LoopbackBus {
    fn unique_name(&self) -> Option<&str> {
        Some(self.unique_name.as_str())
    }

    fn flush(&mut self) -> BusResult<()> {
        self.check_alive()?;
        while let Some(message) = self.outbox.pop_front() {
            self.deliver(message);
        }
        Ok(())
    }

    fn process(&mut self, deferred: &mut ReplyQueue) -> BusResult<bool> {
        self.check_alive()?;

        if let Some(message) = self.outbox.pop_front() {
            self.deliver(message);
            return Ok(true);
        }

        if let Some(serial) = self.expired_call() {
            if let Some(call) = self.pending.remove(&serial) {
                let error = Message::error(
                    serial,
                    Some(self.unique_name.clone()),
                    ERROR_NO_REPLY,
                    "Method call timed out",
                );
                (call.handler)(&error);
            }
            return Ok(true);
        }

        if let Some(message) = self.next_inbound() {
            self.dispatch(message, deferred);
            return Ok(true);
        }

        Ok(false)
    }

    fn fd(&self) -> BusResult<RawFd> {
        if self.closed {
            return Err(Errno::ENOTCONN);
        }
        Ok(self.wake.as_raw_fd())
    }

    fn events(&self) -> BusResult<Events> {
        if self.closed {
            return Err(Errno::ENOTCONN);
        }
        if !self.outbox.is_empty() {
            Ok(Events::IN | Events::OUT)
        } else {
            Ok(Events::IN)
        }
    }

    fn timeout(&self) -> BusResult<Option<u64>> {
        if self.closed {
            return Err(Errno::ENOTCONN);
        }
        if !self.outbox.is_empty() || self.has_inbound() {
            return Ok(Some(0));
        }
        let now = Instant::now();
        Ok(self
            .pending
            .values()
            .map(|call| call.deadline.saturating_duration_since(now))
            .min()
            .map(|d| d.as_micros().min(u128::from(u64::MAX - 1)) as u64))
    }

    fn request_name(&mut self, name: &str) -> BusResult<()> {
        self.check_alive()?;
        if name.is_empty() || name.starts_with(':') {
            return Err(Errno::EINVAL);
        }
        let mut state = lock(&self.daemon);
        let bus = state.buses.entry(self.scope).or_default();
        match bus.names.get(name) {
            Some(owner) if *owner == self.unique_name => Ok(()),
            Some(_) => Err(Errno::EEXIST),
            None => {
                bus.names.insert(name.into(), self.unique_name.clone());
                Ok(())
            }
        }
    }

    fn release_name(&mut self, name: &str) -> BusResult<()> {
        self.check_alive()?;
        let mut state = lock(&self.daemon);
        let bus = state.buses.entry(self.scope).or_default();
        match bus.names.get(name) {
            None => Err(Errno::ESRCH),
            Some(owner) if *owner != self.unique_name => Err(Errno::EADDRINUSE),
            Some(_) => {
                bus.names.remove(name);
                Ok(())
            }
        }
    }

    fn add_object(&mut self, path: &str, interface: &str, vtable: VTable) -> BusResult<SlotId> {
        if self.closed {
            return Err(Errno::ENOTCONN);
        }
        if !path.starts_with('/') || interface.is_empty() {
            return Err(Errno::EINVAL);
        }
        if self
            .objects
            .values()
            .any(|o| o.path == path && o.interface == interface)
        {
            return Err(Errno::EEXIST);
        }

        self.next_slot += 1;
        let id = SlotId(self.next_slot);
        self.objects.insert(
            id,
            ObjectEntry {
                path: path.into(),
                interface: interface.into(),
                vtable,
            },
        );
        Ok(id)
    }

    fn add_match(&mut self, rule: MatchRule, handler: SignalHandler) -> BusResult<SlotId> {
        if self.closed {
            return Err(Errno::ENOTCONN);
        }
        // The daemon only ever sees the rule text.
        if !rule.is_well_formed() || rule.to_string().parse::<MatchRule>()? != rule {
            return Err(Errno::EINVAL);
        }

        self.next_slot += 1;
        let id = SlotId(self.next_slot);
        self.matches.insert(id, MatchEntry { rule, handler });
        Ok(id)
    }

    fn remove_slot(&mut self, slot: SlotId) {
        if self.objects.remove(&slot).is_none() {
            self.matches.remove(&slot);
        }
    }

    fn new_method_call(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
        member: &str,
    ) -> BusResult<Message> {
        if self.closed {
            return Err(Errno::ENOTCONN);
        }
        Ok(Message::method_call(destination, path, interface, member))
    }

    fn new_signal(&self, path: &str, interface: &str, member: &str) -> BusResult<Message> {
        if self.closed {
            return Err(Errno::ENOTCONN);
        }
        Ok(Message::signal(path, interface, member))
    }

    fn send(&mut self, message: Message) -> BusResult<u32> {
        if self.closed {
            return Err(Errno::ENOTCONN);
        }
        let message = self.stamp(message);
        let serial = message.serial;
        self.outbox.push_back(message);
        Ok(serial)
    }

    fn call_async(
        &mut self,
        message: Message,
        timeout_usec: u64,
        handler: ReplyHandler,
    ) -> BusResult<u32> {
        if !message.is_method_call() {
            return Err(Errno::EINVAL);
        }
        let serial = self.send(message)?;
        let deadline = Instant::now()
            .checked_add(Duration::from_micros(timeout_usec))
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400 * 365));
        self.pending.insert(serial, PendingCall { deadline, handler });
        Ok(serial)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        {
            let mut state = lock(&self.daemon);
            if let Some(bus) = state.buses.get_mut(&self.scope) {
                bus.peers.remove(&self.unique_name);
                let unique_name = &self.unique_name;
                bus.names.retain(|_, owner| *owner != *unique_name);
            }
        }

        self.outbox.clear();
        self.objects.clear();
        self.matches.clear();
        self.pending.clear();
        tracing::debug!(scope = %self.scope, unique_name = %self.unique_name, "loopback peer disconnected");
    }
}

impl Drop for LoopbackBus {
    fn drop(&mut self) {
        self.close();
    }
}
