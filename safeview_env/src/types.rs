//! Common types for the SafeView environment abstraction.

use tokio::task::AbortHandle;

/// A single inbound frame from the live socket.
///
/// Control frames (ping/pong) never surface here; closing is signalled by
/// `StreamConnection::recv` returning `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl InboundFrame {
    /// Returns the frame as UTF-8 text if possible.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            InboundFrame::Text(text) => Some(text),
            InboundFrame::Binary(bytes) => std::str::from_utf8(bytes).ok(),
        }
    }

    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        match self {
            InboundFrame::Text(text) => text.len(),
            InboundFrame::Binary(bytes) => bytes.len(),
        }
    }
}

/// Handle to a spawned background task.
#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    inner: AbortHandle,
}

impl TaskHandle {
    /// Wraps a tokio abort handle.
    pub fn new(name: impl Into<String>, inner: AbortHandle) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }

    /// Cancels the task at its next await point.
    pub fn abort(&self) {
        self.inner.abort();
    }

    /// Returns true once the task has completed or been aborted.
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
