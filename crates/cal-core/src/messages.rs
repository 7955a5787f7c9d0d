//! Bounded in-memory message queue for operator-facing notices.
//!
//! Whatever UI is attached polls [`MessageLog::drain`]. Nothing is persisted
//! and the oldest entries are dropped once the log is full.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

const MAX_MESSAGES: usize = 1000;

/// Severity of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    /// Routine progress
    Info,
    /// Something looked wrong but the run continues
    Warning,
    /// The machine stopped
    Error,
}

impl fmt::Display for MessageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARNING"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// One entry in the log.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    /// Local time the message was pushed
    pub timestamp: DateTime<Local>,
    /// Severity
    pub level: MessageLevel,
    /// Text
    pub text: String,
}

/// A thread-safe, fixed-capacity message buffer.
#[derive(Debug, Clone)]
pub struct MessageLog {
    inner: Arc<Mutex<VecDeque<Message>>>,
    capacity: usize,
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageLog {
    /// Log with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(MAX_MESSAGES)
    }

    /// Log holding at most `capacity` messages.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Append a message, evicting the oldest one when full.
    pub fn push(&self, level: MessageLevel, text: impl Into<String>) {
        let mut queue = self.inner.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(Message {
            timestamp: Local::now(),
            level,
            text: text.into(),
        });
    }

    /// Remove and return every queued message.
    pub fn drain(&self) -> Vec<Message> {
        self.inner.lock().drain(..).collect()
    }

    /// Copy of the queued messages, leaving them in place.
    pub fn snapshot(&self) -> Vec<Message> {
        self.inner.lock().iter().cloned().collect()
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_message_is_evicted() {
        let log = MessageLog::with_capacity(2);
        log.push(MessageLevel::Info, "a");
        log.push(MessageLevel::Warning, "b");
        log.push(MessageLevel::Error, "c");

        let texts: Vec<_> = log.snapshot().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["b", "c"]);
    }

    #[test]
    fn drain_empties_the_log() {
        let log = MessageLog::new();
        log.push(MessageLevel::Info, "started");
        assert_eq!(log.drain().len(), 1);
        assert!(log.is_empty());
    }
}
