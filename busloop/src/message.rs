//! Message envelopes exchanged with the bus.
//!
//! The body is carried as an opaque JSON value; turning it into wire
//! format is the bus library's job.

use serde::de::DeserializeOwned;
use serde::ser::Serialize;
use serde_json::Value;

pub const ERROR_UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
pub const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
pub const ERROR_SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
pub const ERROR_NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
pub const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";
pub const ERROR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct Message {
    pub kind: MessageType,
    /// Zero until the bus assigns one on send.
    pub serial: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_serial: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Message {
    fn empty(kind: MessageType) -> Self {
        Message {
            kind,
            serial: 0,
            reply_serial: None,
            sender: None,
            destination: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            body: None,
        }
    }

    pub fn method_call(destination: &str, path: &str, interface: &str, member: &str) -> Self {
        Message {
            destination: Some(destination.into()),
            path: Some(path.into()),
            interface: Some(interface.into()),
            member: Some(member.into()),
            ..Message::empty(MessageType::MethodCall)
        }
    }

    pub fn signal(path: &str, interface: &str, member: &str) -> Self {
        Message {
            path: Some(path.into()),
            interface: Some(interface.into()),
            member: Some(member.into()),
            ..Message::empty(MessageType::Signal)
        }
    }

    /// A successful reply addressed back to the sender of `self`.
    pub fn method_return(&self, body: Option<Value>) -> Self {
        Message {
            reply_serial: Some(self.serial),
            destination: self.sender.clone(),
            body,
            ..Message::empty(MessageType::MethodReturn)
        }
    }

    /// An error reply addressed back to the sender of `self`.
    pub fn error_reply(&self, name: &str, text: &str) -> Self {
        Message::error(self.serial, self.sender.clone(), name, text)
    }

    pub fn error(reply_serial: u32, destination: Option<String>, name: &str, text: &str) -> Self {
        Message {
            reply_serial: Some(reply_serial),
            destination,
            error_name: Some(name.into()),
            body: Some(Value::String(text.into())),
            ..Message::empty(MessageType::Error)
        }
    }

    pub fn with_body<T: Serialize>(mut self, body: &T) -> serde_json::Result<Self> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn body_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.body.clone().unwrap_or(Value::Null))
    }

    pub fn is_method_call(&self) -> bool {
        self.kind == MessageType::MethodCall
    }

    pub fn is_reply(&self) -> bool {
        matches!(self.kind, MessageType::MethodReturn | MessageType::Error)
    }

    pub fn is_error(&self) -> bool {
        self.kind == MessageType::Error
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn member(&self) -> Option<&str> {
        self.member.as_deref()
    }
}
