//! Method dispatch tables and the context handlers run in.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::ser::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::message::{Message, ERROR_FAILED, ERROR_INVALID_ARGS};
use crate::queue::ReplyQueue;

pub type MethodResult = std::result::Result<(), MethodError>;
pub type MethodHandler = Box<dyn FnMut(&mut Call<'_>) -> MethodResult + Send>;
pub type SignalHandler = Box<dyn FnMut(&Message) + Send>;
pub type ReplyHandler = Box<dyn FnOnce(&Message) + Send>;

/// A bus error a method handler answers with.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name}: {message}")]
pub struct MethodError {
    pub name: String,
    pub message: String,
}

impl MethodError {
    pub fn new<N: Into<String>, M: Into<String>>(name: N, message: M) -> Self {
        MethodError {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn failed<M: Into<String>>(message: M) -> Self {
        MethodError::new(ERROR_FAILED, message)
    }

    pub fn invalid_args<M: Into<String>>(message: M) -> Self {
        MethodError::new(ERROR_INVALID_ARGS, message)
    }
}

/// Method name to handler, bound to one object path and interface.
///
/// ```
/// use busloop::{MethodError, VTable};
///
/// let vtable = VTable::new()
///     .method("Ping", |call| {
///         call.reply(None);
///         Ok(())
///     })
///     .method("Fail", |_call| Err(MethodError::failed("always")));
/// assert!(vtable.contains("Ping"));
/// assert_eq!(vtable.len(), 2);
/// ```
#[derive(Default)]
pub struct VTable {
    methods: BTreeMap<String, MethodHandler>,
}

impl VTable {
    pub fn new() -> Self {
        VTable::default()
    }

    pub fn method<F>(mut self, name: &str, handler: F) -> Self
    where
        F: FnMut(&mut Call<'_>) -> MethodResult + Send + 'static,
    {
        self.methods.insert(name.into(), Box::new(handler));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn handler_mut(&mut self, name: &str) -> Option<&mut MethodHandler> {
        self.methods.get_mut(name)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl fmt::Debug for VTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.methods.keys()).finish()
    }
}

/// Passed to a method handler for the duration of one dispatch.
///
/// A handler either answers right away with [`Call::reply`] /
/// [`Call::reply_error`], or defers with [`Call::defer`], which puts the
/// reply on the connection's deferred reply queue behind earlier ones.
pub struct Call<'a> {
    message: &'a Message,
    outgoing: &'a mut Vec<Message>,
    deferred: &'a mut ReplyQueue,
    answered: bool,
}

impl<'a> Call<'a> {
    /// Bus implementations build one of these per dispatched method call and
    /// transmit whatever lands in `outgoing` once the handler returns.
    pub fn new(
        message: &'a Message,
        outgoing: &'a mut Vec<Message>,
        deferred: &'a mut ReplyQueue,
    ) -> Self {
        Call {
            message,
            outgoing,
            deferred,
            answered: false,
        }
    }

    pub fn message(&self) -> &Message {
        self.message
    }

    pub fn args<T: DeserializeOwned>(&self) -> std::result::Result<T, MethodError> {
        self.message
            .body_as()
            .map_err(|e| MethodError::invalid_args(e.to_string()))
    }

    pub fn reply(&mut self, body: Option<Value>) {
        self.outgoing.push(self.message.method_return(body));
        self.answered = true;
    }

    pub fn reply_with<T: Serialize>(&mut self, body: &T) -> MethodResult {
        let body = serde_json::to_value(body).map_err(|e| MethodError::failed(e.to_string()))?;
        self.reply(Some(body));
        Ok(())
    }

    pub fn reply_error(&mut self, name: &str, text: &str) {
        self.outgoing.push(self.message.error_reply(name, text));
        self.answered = true;
    }

    /// Queue the reply instead of sending it now.
    pub fn defer(&mut self, body: Option<Value>) -> Result<()> {
        self.deferred.enqueue(self.message.method_return(body))?;
        self.answered = true;
        Ok(())
    }

    pub fn is_answered(&self) -> bool {
        self.answered
    }
}
