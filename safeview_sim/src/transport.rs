//! Simulated stream transport with fault injection.
//!
//! `SimTransport` is handed to the stream client; `SimLink` stays with the
//! harness and plays the robot's side of the socket.

use crate::context::SimContext;
use async_trait::async_trait;
use safeview_env::{EnvError, InboundFrame, StreamConnection, StreamTransport, ViewerContext};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

type FrameSender = mpsc::UnboundedSender<Result<InboundFrame, EnvError>>;
type FrameReceiver = mpsc::UnboundedReceiver<Result<InboundFrame, EnvError>>;

#[derive(Debug)]
struct LinkState {
    /// Connection attempts still to be refused
    refuse_next: u32,
    /// Virtual time of every connection attempt
    attempts: Vec<Duration>,
    /// Robot side of the open connection
    current: Option<FrameSender>,
}

struct Shared {
    state: Mutex<LinkState>,
    connections: watch::Sender<usize>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Client half: implements `StreamTransport`.
pub struct SimTransport {
    ctx: Arc<SimContext>,
    shared: Arc<Shared>,
}

/// Harness half: scripts what the robot sends.
#[derive(Clone)]
pub struct SimLink {
    shared: Arc<Shared>,
    connections: watch::Receiver<usize>,
}

impl SimTransport {
    pub fn new(ctx: Arc<SimContext>) -> (Self, SimLink) {
        let (connections, connections_rx) = watch::channel(0);
        let shared = Arc::new(Shared {
            state: Mutex::new(LinkState {
                refuse_next: 0,
                attempts: Vec::new(),
                current: None,
            }),
            connections,
        });

        let link = SimLink {
            shared: Arc::clone(&shared),
            connections: connections_rx,
        };
        (Self { ctx, shared }, link)
    }
}

#[async_trait]
impl StreamTransport for SimTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn StreamConnection>, EnvError> {
        let mut state = self.shared.lock();
        state.attempts.push(self.ctx.now());
        if state.refuse_next > 0 {
            state.refuse_next -= 1;
            tracing::debug!(url, remaining = state.refuse_next, "sim: refusing connection");
            return Err(EnvError::connect_failed(url, "refused by simulation"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.current = Some(tx);
        drop(state);

        self.shared.connections.send_modify(|n| *n += 1);
        Ok(Box::new(SimConnection {
            frames: rx,
            peer: url.to_string(),
        }))
    }
}

struct SimConnection {
    frames: FrameReceiver,
    peer: String,
}

#[async_trait]
impl StreamConnection for SimConnection {
    async fn recv(&mut self) -> Option<Result<InboundFrame, EnvError>> {
        self.frames.recv().await
    }

    async fn close(&mut self) {
        self.frames.close();
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}

impl SimLink {
    /// Sends a frame on the open connection. False if none is open.
    pub fn push_frame(&self, frame: InboundFrame) -> bool {
        self.push(Ok(frame))
    }

    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.push_frame(InboundFrame::Text(text.into()))
    }

    /// Delivers a socket error event without closing the connection.
    pub fn push_socket_error(&self, message: &str) -> bool {
        self.push(Err(EnvError::network(message)))
    }

    fn push(&self, item: Result<InboundFrame, EnvError>) -> bool {
        self.shared
            .lock()
            .current
            .as_ref()
            .map(|tx| tx.send(item).is_ok())
            .unwrap_or(false)
    }

    /// Closes the open connection from the robot side.
    pub fn drop_connection(&self) -> bool {
        self.shared.lock().current.take().is_some()
    }

    /// Refuses the next `n` connection attempts.
    pub fn refuse_next(&self, n: u32) {
        self.shared.lock().refuse_next = n;
    }

    pub fn is_connected(&self) -> bool {
        self.shared
            .lock()
            .current
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Virtual times of all connection attempts, in order.
    pub fn attempts(&self) -> Vec<Duration> {
        self.shared.lock().attempts.clone()
    }

    pub fn connection_count(&self) -> usize {
        *self.connections.borrow()
    }

    /// Waits until at least `n` connections have been accepted.
    pub async fn wait_for_connections(&self, n: usize) {
        let mut rx = self.connections.clone();
        // The sender lives as long as any link or transport half
        let _ = rx.wait_for(|count| *count >= n).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_push() {
        let ctx = SimContext::shared(1);
        let (transport, link) = SimTransport::new(Arc::clone(&ctx));
        assert!(!link.push_text("early"));

        let mut conn = transport.connect("sim://robot").await.unwrap();
        assert_eq!(link.connection_count(), 1);
        assert!(link.push_text("hello"));
        assert!(link.push_socket_error("glitch"));

        assert_eq!(conn.recv().await.unwrap().unwrap(), InboundFrame::Text("hello".into()));
        assert!(conn.recv().await.unwrap().is_err());

        assert!(link.drop_connection());
        assert!(conn.recv().await.is_none());
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn test_refuse_next_records_attempts() {
        let ctx = SimContext::shared(1);
        let (transport, link) = SimTransport::new(Arc::clone(&ctx));
        link.refuse_next(2);

        assert!(transport.connect("sim://robot").await.is_err());
        ctx.advance_time(Duration::from_secs(10));
        assert!(transport.connect("sim://robot").await.is_err());
        ctx.advance_time(Duration::from_secs(10));
        assert!(transport.connect("sim://robot").await.is_ok());

        assert_eq!(
            link.attempts(),
            vec![Duration::ZERO, Duration::from_secs(10), Duration::from_secs(20)]
        );
    }

    #[tokio::test]
    async fn test_client_close_is_visible() {
        let ctx = SimContext::shared(1);
        let (transport, link) = SimTransport::new(ctx);
        let mut conn = transport.connect("sim://robot").await.unwrap();
        assert!(link.is_connected());
        conn.close().await;
        assert!(!link.is_connected());
    }
}
