use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Amount of work a long-running operation expects to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Total {
    Finite(u64),
    Unbounded,
}

impl Total {
    pub fn is_unbounded(self) -> bool {
        matches!(self, Total::Unbounded)
    }

    pub fn finite(self) -> Option<u64> {
        match self {
            Total::Finite(n) => Some(n),
            Total::Unbounded => None,
        }
    }
}

impl fmt::Display for Total {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Total::Finite(n) => write!(f, "{n}"),
            Total::Unbounded => write!(f, "infinite"),
        }
    }
}

/// Snapshot of completed work units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub done: u64,
    pub total: Total,
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.done, self.total)
    }
}

/// Sending half of an event stream handed to a long-running operation.
///
/// A sink without a receiver silently drops events, and so does one whose
/// receiver has gone away.
#[derive(Debug)]
pub struct EventSink<E> {
    tx: Option<mpsc::UnboundedSender<E>>,
}

impl<E> EventSink<E> {
    pub fn new(tx: mpsc::UnboundedSender<E>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: E) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

impl<E> Clone for EventSink<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E> Default for EventSink<E> {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Creates a connected sink and receiver.
pub fn channel<E>() -> (EventSink<E>, mpsc::UnboundedReceiver<E>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink::new(tx), rx)
}
