use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use static_assertions::{assert_impl_all, assert_not_impl_any};

use crate::*;

#[derive(Default)]
struct Script {
    log: Vec<String>,
    inbound: usize,
    timeout: Option<u64>,
    fail_open: Option<Errno>,
    fail_flush: Option<Errno>,
    fail_name: Option<Errno>,
    fail_process: Option<Errno>,
    fail_fd: Option<Errno>,
    fail_events: Option<Errno>,
    fail_timeout: Option<Errno>,
}

type Shared = Arc<Mutex<Script>>;

struct ScriptedOpener(Shared);

impl BusOpener for ScriptedOpener {
    fn open(&self, scope: BusScope) -> BusResult<Box<dyn Bus>> {
        let mut script = self.0.lock().unwrap();
        script.log.push(format!("open {}", scope));
        if let Some(e) = script.fail_open {
            return Err(e);
        }
        Ok(Box::new(ScriptedBus {
            script: self.0.clone(),
            next_slot: 0,
            next_serial: 0,
        }))
    }
}

struct ScriptedBus {
    script: Shared,
    next_slot: u64,
    next_serial: u32,
}

impl ScriptedBus {
    fn record(&self, entry: String) {
        self.script.lock().unwrap().log.push(entry);
    }

    fn check(&self, f: impl Fn(&Script) -> Option<Errno>) -> BusResult<()> {
        let script = self.script.lock().unwrap();
        match f(&*script) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Bus for ScriptedBus {
    fn unique_name(&self) -> Option<&str> {
        Some(":1.42")
    }

    fn flush(&mut self) -> BusResult<()> {
        self.record("flush".into());
        self.check(|s| s.fail_flush)
    }

    fn process(&mut self, _deferred: &mut ReplyQueue) -> BusResult<bool> {
        self.record("process".into());
        let mut script = self.script.lock().unwrap();
        if let Some(e) = script.fail_process {
            return Err(e);
        }
        if script.inbound > 0 {
            script.inbound -= 1;
            return Ok(true);
        }
        Ok(false)
    }

    fn fd(&self) -> BusResult<RawFd> {
        self.check(|s| s.fail_fd).map(|_| 7)
    }

    fn events(&self) -> BusResult<Events> {
        self.check(|s| s.fail_events).map(|_| Events::IN)
    }

    fn timeout(&self) -> BusResult<Option<u64>> {
        self.check(|s| s.fail_timeout)?;
        Ok(self.script.lock().unwrap().timeout)
    }

    fn request_name(&mut self, name: &str) -> BusResult<()> {
        self.record(format!("request_name {}", name));
        self.check(|s| s.fail_name)
    }

    fn release_name(&mut self, name: &str) -> BusResult<()> {
        self.record(format!("release_name {}", name));
        self.check(|s| s.fail_name)
    }

    fn add_object(&mut self, path: &str, interface: &str, _vtable: VTable) -> BusResult<SlotId> {
        self.record(format!("add_object {} {}", path, interface));
        self.next_slot += 1;
        Ok(SlotId(self.next_slot))
    }

    fn add_match(&mut self, rule: MatchRule, _handler: SignalHandler) -> BusResult<SlotId> {
        self.record(format!("add_match {}", rule));
        self.next_slot += 1;
        Ok(SlotId(self.next_slot))
    }

    fn remove_slot(&mut self, slot: SlotId) {
        self.record(format!("remove {}", slot));
    }

    fn new_method_call(
        &self,
        destination: &str,
        path: &str,
        interface: &str,
        member: &str,
    ) -> BusResult<Message> {
        Ok(Message::method_call(destination, path, interface, member))
    }

    fn new_signal(&self, path: &str, interface: &str, member: &str) -> BusResult<Message> {
        Ok(Message::signal(path, interface, member))
    }

    fn send(&mut self, message: Message) -> BusResult<u32> {
        self.record(format!("send {}", message.reply_serial.unwrap_or(0)));
        self.next_serial += 1;
        Ok(self.next_serial)
    }

    fn call_async(
        &mut self,
        message: Message,
        timeout_usec: u64,
        _handler: ReplyHandler,
    ) -> BusResult<u32> {
        self.record(format!("call_async {}", timeout_usec));
        self.send(message)
    }

    fn close(&mut self) {
        self.record("close".into());
    }
}

fn scripted() -> (Shared, Arc<dyn BusOpener>) {
    let script = Shared::default();
    let opener: Arc<dyn BusOpener> = Arc::new(ScriptedOpener(script.clone()));
    (script, opener)
}

fn log(script: &Shared) -> Vec<String> {
    script.lock().unwrap().log.clone()
}

fn clear(script: &Shared) {
    script.lock().unwrap().log.clear();
}

fn reply(serial: u32) -> Message {
    let mut call = Message::method_call("org.example", "/", "org.example.X", "Y");
    call.serial = serial;
    call.sender = Some(":1.7".into());
    call.method_return(None)
}

#[test]
fn test_connection_is_send_not_shared() {
    assert_impl_all!(Connection: Send, EventConnection, ObjectConnection);
    assert_not_impl_any!(Connection: Clone, Sync);
    assert_not_impl_any!(ObjectSlot: Clone, Copy);
    assert_not_impl_any!(MatchSlot: Clone, Copy);
    assert_impl_all!(Error: Send, Sync, std::error::Error);
}

#[test]
fn test_open_requests_name_once() {
    let (script, opener) = scripted();
    let conn = Connection::open(opener, BusScope::System, "org.example.Test").unwrap();
    assert_eq!(
        log(&script),
        ["open system", "flush", "request_name org.example.Test"]
    );
    assert_eq!(conn.scope(), BusScope::System);
    assert_eq!(conn.unique_name(), Some(":1.42"));
}

#[test]
fn test_open_without_name() {
    let (script, opener) = scripted();
    let _conn = Connection::open(opener, BusScope::Session, "").unwrap();
    assert_eq!(log(&script), ["open session", "flush"]);
}

#[test]
fn test_open_failure() {
    let (script, opener) = scripted();
    script.lock().unwrap().fail_open = Some(Errno::ECONNREFUSED);

    let e = Connection::open(opener, BusScope::Session, "org.example.Test").unwrap_err();
    assert_eq!(e.kind(), ErrorKind::OpenBus);
    assert_eq!(e.code(), libc::ECONNREFUSED);
    assert!(e.to_string().starts_with("Failed to open bus: "));
    assert_eq!(log(&script), ["open session"]);
}

#[test]
fn test_handshake_failure_releases_bus() {
    let (script, opener) = scripted();
    script.lock().unwrap().fail_flush = Some(Errno::ECONNRESET);

    let e = Connection::open(opener, BusScope::Session, "org.example.Test").unwrap_err();
    assert_eq!(e.kind(), ErrorKind::Handshake);
    assert_eq!(e.code(), libc::ECONNRESET);

    let log = log(&script);
    assert!(!log.iter().any(|l| l.starts_with("request_name")));
    assert_eq!(log.iter().filter(|l| *l == "close").count(), 1);
    assert_eq!(log.last().map(String::as_str), Some("close"));
}

#[test]
fn test_name_failure_releases_bus() {
    let (script, opener) = scripted();
    script.lock().unwrap().fail_name = Some(Errno::EEXIST);

    let e = Connection::open(opener, BusScope::Session, "org.example.Taken").unwrap_err();
    assert_eq!(e.kind(), ErrorKind::RequestName);
    assert_eq!(e.code(), libc::EEXIST);
    assert_eq!(
        log(&script),
        [
            "open session",
            "flush",
            "request_name org.example.Taken",
            "flush",
            "close"
        ]
    );
}

#[test]
fn test_deferred_replies_leave_in_order() {
    let (script, opener) = scripted();
    let mut conn = Connection::open(opener, BusScope::Session, "").unwrap();
    clear(&script);

    for serial in 1..=3 {
        conn.send_reply_async(reply(serial)).unwrap();
    }
    assert_eq!(conn.pending_replies(), 3);

    for _ in 0..3 {
        assert_eq!(conn.iterate().unwrap(), QueryAction::HasWorkToDo);
    }
    assert_eq!(conn.pending_replies(), 0);
    assert_eq!(
        log(&script),
        ["process", "send 1", "process", "send 2", "process", "send 3"]
    );

    clear(&script);
    assert_eq!(conn.iterate().unwrap(), QueryAction::WaitForEvent);
    assert_eq!(conn.iterate().unwrap(), QueryAction::WaitForEvent);
    assert_eq!(log(&script), ["process", "process"]);
}

#[test]
fn test_inbound_work_goes_first() {
    let (script, opener) = scripted();
    let mut conn = Connection::open(opener, BusScope::Session, "").unwrap();
    conn.send_reply_async(reply(9)).unwrap();
    script.lock().unwrap().inbound = 2;
    clear(&script);

    let actions: Vec<_> = (0..4).map(|_| conn.iterate().unwrap()).collect();
    assert_eq!(
        actions,
        [
            QueryAction::HasWorkToDo,
            QueryAction::HasWorkToDo,
            QueryAction::HasWorkToDo,
            QueryAction::WaitForEvent
        ]
    );
    assert_eq!(
        log(&script),
        ["process", "process", "process", "send 9", "process"]
    );
}

#[test]
fn test_request_poll_timeout() {
    let (script, opener) = scripted();
    let conn = Connection::open(opener, BusScope::Session, "").unwrap();

    let cases = [
        (None, Timeout::Unbounded),
        (Some(u64::MAX), Timeout::Unbounded),
        (Some(0), Timeout::Millis(0)),
        (Some(1), Timeout::Millis(1)),
        (Some(1000), Timeout::Millis(1)),
        (Some(1001), Timeout::Millis(2)),
        (Some(2_500_000), Timeout::Millis(2500)),
    ];
    for (usec, expected) in cases {
        script.lock().unwrap().timeout = usec;
        let request = conn.request_poll().unwrap();
        assert_eq!(request.fd, 7);
        assert_eq!(request.events, Events::IN);
        assert_eq!(request.timeout, expected, "{:?}", usec);
    }
}

#[test]
fn test_errors_carry_operation() {
    let (script, opener) = scripted();
    let mut conn = Connection::open(opener, BusScope::Session, "").unwrap();

    script.lock().unwrap().fail_fd = Some(Errno::EIO);
    assert_eq!(conn.request_poll().unwrap_err().kind(), ErrorKind::GetDescriptor);
    script.lock().unwrap().fail_fd = None;

    script.lock().unwrap().fail_events = Some(Errno::EIO);
    assert_eq!(conn.request_poll().unwrap_err().kind(), ErrorKind::GetEvents);
    script.lock().unwrap().fail_events = None;

    script.lock().unwrap().fail_timeout = Some(Errno::EIO);
    assert_eq!(conn.request_poll().unwrap_err().kind(), ErrorKind::GetTimeout);
    script.lock().unwrap().fail_timeout = None;

    script.lock().unwrap().fail_name = Some(Errno::ESRCH);
    let e = conn.release_name("org.example.Unknown").unwrap_err();
    assert_eq!(e.kind(), ErrorKind::ReleaseName);
    assert_eq!(e.code(), libc::ESRCH);

    script.lock().unwrap().fail_process = Some(Errno::ECONNRESET);
    let e = conn.iterate().unwrap_err();
    assert_eq!(e.kind(), ErrorKind::Process);
    assert_eq!(e.code(), libc::ECONNRESET);
}

#[test]
fn test_handle_releases_once() {
    let (script, opener) = scripted();
    let mut handle = BusHandle::new(opener.open(BusScope::Session).unwrap());
    clear(&script);

    assert!(!handle.is_released());
    handle.release().unwrap();
    assert!(handle.is_released());
    assert_eq!(handle.get().err(), Some(Errno::ENOTCONN));
    handle.release().unwrap();
    drop(handle);
    assert_eq!(log(&script), ["flush", "close"]);
}

#[test]
fn test_handle_drop_releases() {
    let (script, opener) = scripted();
    let handle = BusHandle::new(opener.open(BusScope::Session).unwrap());
    clear(&script);
    drop(handle);
    assert_eq!(log(&script), ["flush", "close"]);
}

#[test]
fn test_handle_reports_flush_failure() {
    let (script, opener) = scripted();
    let mut handle = BusHandle::new(opener.open(BusScope::Session).unwrap());
    script.lock().unwrap().fail_flush = Some(Errno::ECONNRESET);
    clear(&script);

    assert_eq!(handle.release(), Err(Errno::ECONNRESET));
    assert!(handle.is_released());
    assert_eq!(log(&script), ["flush", "close"]);
}

#[test]
fn test_close_sends_queued_replies_first() {
    let (script, opener) = scripted();
    let mut conn = Connection::open(opener, BusScope::Session, "").unwrap();
    conn.send_reply_async(reply(1)).unwrap();
    conn.send_reply_async(reply(2)).unwrap();
    clear(&script);

    conn.close().unwrap();
    assert_eq!(log(&script), ["send 1", "send 2", "flush", "close"]);
}

#[test]
fn test_close_reports_flush_failure() {
    let (script, opener) = scripted();
    let conn = Connection::open(opener, BusScope::Session, "").unwrap();
    script.lock().unwrap().fail_flush = Some(Errno::ECONNRESET);
    clear(&script);

    let e = conn.close().unwrap_err();
    assert_eq!(e.kind(), ErrorKind::Flush);
    assert_eq!(log(&script), ["flush", "close"]);
}

#[test]
fn test_drop_tears_down() {
    let (script, opener) = scripted();
    let mut conn = Connection::open(opener, BusScope::Session, "").unwrap();
    conn.send_reply_async(reply(5)).unwrap();
    clear(&script);
    drop(conn);
    assert_eq!(log(&script), ["send 5", "flush", "close"]);
}

#[test]
fn test_duplicate_object_rejected() {
    let (script, opener) = scripted();
    let mut conn = Connection::open(opener, BusScope::Session, "").unwrap();
    clear(&script);

    let slot = conn
        .add_object_vtable("/org/example", "org.example.X", VTable::new())
        .unwrap();
    let e = conn
        .add_object_vtable("/org/example", "org.example.X", VTable::new())
        .unwrap_err();
    assert_eq!(e.kind(), ErrorKind::AddObject);
    assert_eq!(e.code(), libc::EEXIST);

    let other = conn
        .add_object_vtable("/org/example", "org.example.Y", VTable::new())
        .unwrap();
    assert_eq!(conn.registration_count(), 2);

    let id = slot.id();
    conn.remove_object_vtable(slot);
    conn.remove_object_vtable(other);
    assert_eq!(conn.registration_count(), 0);
    assert_eq!(
        log(&script),
        [
            "add_object /org/example org.example.X".to_string(),
            "add_object /org/example org.example.Y".to_string(),
            format!("remove {}", id),
            "remove slot#2".to_string(),
        ]
    );

    let again = conn
        .add_object_vtable("/org/example", "org.example.X", VTable::new())
        .unwrap();
    conn.remove_object_vtable(again);
}

#[test]
fn test_foreign_slot_is_ignored() {
    let (script, opener) = scripted();
    let mut a = Connection::open(opener.clone(), BusScope::Session, "").unwrap();
    let mut b = Connection::open(opener, BusScope::Session, "").unwrap();

    // Both buses hand out slot#1 first.
    let a_object = a
        .add_object_vtable("/a", "org.example.X", VTable::new())
        .unwrap();
    let b_object = b
        .add_object_vtable("/b", "org.example.X", VTable::new())
        .unwrap();
    assert_eq!(a_object.id(), b_object.id());
    let a_match = a.register_signal_handler("/a", "b.c", "D", |_| {}).unwrap();
    let _b_match = b.register_signal_handler("/b", "b.c", "D", |_| {}).unwrap();
    clear(&script);

    b.remove_object_vtable(a_object);
    b.unregister_signal_handler(a_match);
    assert_eq!(b.registration_count(), 2);
    assert_eq!(a.registration_count(), 2);
    assert!(log(&script).is_empty());

    b.remove_object_vtable(b_object);
    assert_eq!(b.registration_count(), 1);
    assert_eq!(log(&script), ["remove slot#1"]);
}

#[test]
fn test_signal_handler_registration() {
    let (script, opener) = scripted();
    let mut conn = Connection::open(opener, BusScope::Session, "").unwrap();
    clear(&script);

    let e = conn
        .register_signal_handler("/a", "b'c", "D", |_| {})
        .unwrap_err();
    assert_eq!(e.kind(), ErrorKind::AddMatch);
    assert_eq!(e.code(), libc::EINVAL);
    assert!(log(&script).is_empty());

    let slot = conn.register_signal_handler("/a", "b.c", "D", |_| {}).unwrap();
    assert_eq!(conn.registration_count(), 1);
    conn.unregister_signal_handler(slot);
    assert_eq!(conn.registration_count(), 0);
    assert_eq!(
        log(&script),
        [
            "add_match type='signal',interface='b.c',member='D',path='/a'",
            "remove slot#1"
        ]
    );
}

#[test]
fn test_reply_queue_limit() {
    let (_script, opener) = scripted();
    let settings = Settings {
        reply_queue_limit: Some(1),
        ..Settings::default()
    };
    let mut conn = Connection::open_with(opener, &settings).unwrap();
    conn.send_reply_async(reply(1)).unwrap();
    let e = conn.send_reply_async(reply(2)).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::ReplyQueueFull);
    assert_eq!(e.code(), libc::ENOBUFS);
    assert_eq!(conn.pending_replies(), 1);
}

#[test]
fn test_call_async_uses_configured_timeout() {
    let (script, opener) = scripted();
    let settings = Settings {
        call_timeout_ms: 1500,
        ..Settings::default()
    };
    let mut conn = Connection::open_with(opener, &settings).unwrap();
    clear(&script);

    let call = conn
        .create_method_call("org.example", "/", "org.example.X", "Y")
        .unwrap();
    conn.call_async(call, |_| {}).unwrap();
    assert_eq!(log(&script), ["call_async 1500000", "send 0"]);
}

#[test]
fn test_clone_is_independent() {
    let (script, opener) = scripted();
    let mut conn = Connection::open(opener, BusScope::System, "org.example.Test").unwrap();
    let _slot = conn
        .add_object_vtable("/org/example", "org.example.X", VTable::new())
        .unwrap();
    conn.send_reply_async(reply(3)).unwrap();
    clear(&script);

    let clone = conn.try_clone().unwrap();
    assert_ne!(clone.id(), conn.id());
    assert_eq!(clone.scope(), BusScope::System);
    assert_eq!(clone.registration_count(), 0);
    assert_eq!(clone.pending_replies(), 0);
    assert_eq!(log(&script), ["open system", "flush"]);

    clear(&script);
    drop(clone);
    assert_eq!(log(&script), ["flush", "close"]);
    assert_eq!(conn.pending_replies(), 1);
}

#[test]
fn test_boxed_entry_points() {
    let (script, opener) = scripted();
    let mut conn = open_system(opener.clone(), "").unwrap();
    assert_eq!(conn.iterate().unwrap(), QueryAction::WaitForEvent);
    drop(conn);

    let mut conn = open_session(opener, "org.example.Test").unwrap();
    conn.release_name("org.example.Test").unwrap();
    drop(conn);

    assert_eq!(
        log(&script),
        [
            "open system",
            "flush",
            "process",
            "flush",
            "close",
            "open session",
            "flush",
            "request_name org.example.Test",
            "release_name org.example.Test",
            "flush",
            "close"
        ]
    );
}
