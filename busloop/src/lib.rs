//!Bus connections for programs that run their own event loop.
//!
//!A [`Connection`] wraps exactly one opened bus resource and never blocks
//!after it is opened. The host loop drives it in two steps:
//!
//!1. [`Connection::request_poll`] says which descriptor to watch, for which
//!   events, and how long at most to wait.
//!2. After waiting, [`Connection::iterate`] is called until it answers
//!   [`QueryAction::WaitForEvent`].
//!
//!Method handlers may answer later through the deferred reply queue; those
//!replies go out in submission order from `iterate`, after inbound work.
//!
//!```rust
//!use std::sync::{Arc, Mutex};
//!use busloop::{BusScope, Connection, LoopbackDaemon, QueryAction, VTable};
//!
//!# fn main() -> busloop::Result<()> {
//!let daemon = Arc::new(LoopbackDaemon::new());
//!
//!let mut server = Connection::open(daemon.clone(), BusScope::Session, "org.example.Ping")?;
//!let _slot = server.add_object_vtable(
//!    "/org/example/ping",
//!    "org.example.Ping",
//!    VTable::new().method("Ping", |call| {
//!        let body = call.message().body.clone();
//!        call.defer(body).map_err(|e| busloop::MethodError::failed(e.to_string()))
//!    }),
//!)?;
//!
//!let mut client = Connection::open(daemon, BusScope::Session, "")?;
//!let call = client
//!    .create_method_call("org.example.Ping", "/org/example/ping", "org.example.Ping", "Ping")?
//!    .with_body(&"hello")
//!    .expect("serializable body");
//!let answer = Arc::new(Mutex::new(None));
//!let sink = answer.clone();
//!client.call_async(call, move |reply| *sink.lock().unwrap() = reply.body.clone())?;
//!
//!for _ in 0..4 {
//!    while client.iterate()? == QueryAction::HasWorkToDo {}
//!    while server.iterate()? == QueryAction::HasWorkToDo {}
//!}
//!assert_eq!(*answer.lock().unwrap(), Some(serde_json::json!("hello")));
//!# Ok(())
//!# }
//!```
//!
//!The library behind a connection is reached through the [`Bus`] and
//![`BusOpener`] traits. [`LoopbackDaemon`] is an in-process implementation
//!with real pollable descriptors.

#[macro_use]
extern crate serde_derive;

pub use crate::bus::{Bus, BusOpener, BusResult, BusScope, Errno, SlotId};
pub use crate::config::{Settings, DEFAULT_CALL_TIMEOUT_MS};
pub use crate::connection::{
    open, open_session, open_system, Connection, EventConnection, MatchSlot, ObjectConnection,
    ObjectSlot, QueryAction,
};
pub use crate::error::{Error, ErrorKind, Result, ResultExt};
pub use crate::handle::BusHandle;
pub use crate::loopback::{LoopbackBus, LoopbackDaemon};
pub use crate::match_rule::MatchRule;
pub use crate::message::{
    Message, MessageType, ERROR_FAILED, ERROR_INVALID_ARGS, ERROR_NO_REPLY, ERROR_SERVICE_UNKNOWN,
    ERROR_UNKNOWN_METHOD, ERROR_UNKNOWN_OBJECT,
};
pub use crate::poll::{Events, PollRequest, Timeout};
pub use crate::queue::ReplyQueue;
#[cfg(feature = "tokio")]
pub use crate::reactor::AsyncConnection;
pub use crate::vtable::{
    Call, MethodError, MethodHandler, MethodResult, ReplyHandler, SignalHandler, VTable,
};

mod bus;
mod config;
mod connection;
mod error;
mod handle;
mod loopback;
mod match_rule;
mod message;
mod poll;
mod queue;
#[cfg(feature = "tokio")]
mod reactor;
mod vtable;

#[cfg(test)]
mod test;
