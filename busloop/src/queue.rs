//! Replies a handler chose not to send right away.

use std::collections::VecDeque;

use crate::error::{Error, ErrorKind, Result};
use crate::message::Message;

/// Strict FIFO of deferred replies.
///
/// The queue is unbounded unless a limit is configured; with a limit,
/// [`ReplyQueue::enqueue`] rejects instead of growing. There is no way to
/// look at or reorder the interior.
#[derive(Debug, Default)]
pub struct ReplyQueue {
    replies: VecDeque<Message>,
    limit: Option<usize>,
}

impl ReplyQueue {
    pub fn new() -> Self {
        ReplyQueue::default()
    }

    pub fn with_limit(limit: Option<usize>) -> Self {
        ReplyQueue {
            replies: VecDeque::new(),
            limit,
        }
    }

    pub fn enqueue(&mut self, reply: Message) -> Result<()> {
        if let Some(limit) = self.limit {
            if self.replies.len() >= limit {
                return Err(Error::new(ErrorKind::ReplyQueueFull, libc::ENOBUFS));
            }
        }
        self.replies.push_back(reply);
        Ok(())
    }

    pub(crate) fn pop_front(&mut self) -> Option<Message> {
        self.replies.pop_front()
    }

    pub fn len(&self) -> usize {
        self.replies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }
}
