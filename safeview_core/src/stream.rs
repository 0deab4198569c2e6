//! Live stream client - connection lifecycle, frame decoding, reconnect.
//!
//! # State Machine
//!
//! ```text
//!              on_open                on_closed (unexpected)
//! Connecting ──────────► Open ──────────────────────► Closed
//!     ▲                                                 │
//!     └──────────── on_reconnect_due (now >= deadline) ─┘
//! ```
//!
//! The machine is pure; the driver task feeds it transport outcomes and
//! clock readings from a `ViewerContext`. There is exactly one pending
//! reconnect at a time, `delay` after the close, with no backoff and no cap.

use crate::config::VisualizerConfig;
use crate::messages::{decode_frame, StreamEvent};
use safeview_env::{StreamConnection, StreamTransport, TaskHandle, ViewerContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Snapshot published on the status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Consecutive unexpected closes since the last successful open
    pub attempts: u32,
}

// =============================================================================
// CONNECTION MACHINE
// =============================================================================

#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    attempts: u32,
    delay: Duration,
    reconnect_at: Option<Duration>,
    disposed: bool,
}

impl ConnectionMachine {
    pub fn new(delay: Duration) -> Self {
        Self {
            state: ConnectionState::Connecting,
            attempts: 0,
            delay,
            reconnect_at: None,
            disposed: false,
        }
    }

    pub fn on_open(&mut self) {
        if self.disposed {
            return;
        }
        self.state = ConnectionState::Open;
        self.attempts = 0;
        self.reconnect_at = None;
    }

    /// Records an unexpected close (or a failed connect).
    ///
    /// Returns the reconnect deadline. A second close while one is already
    /// pending returns the same deadline and does not count again.
    pub fn on_closed(&mut self, now: Duration) -> Option<Duration> {
        if self.disposed {
            return None;
        }
        self.state = ConnectionState::Closed;
        if let Some(deadline) = self.reconnect_at {
            return Some(deadline);
        }

        self.attempts = self.attempts.saturating_add(1);
        let deadline = now + self.delay;
        self.reconnect_at = Some(deadline);
        Some(deadline)
    }

    /// Moves to Connecting if the reconnect deadline has passed.
    pub fn on_reconnect_due(&mut self, now: Duration) -> bool {
        match self.reconnect_at {
            Some(deadline) if !self.disposed && now >= deadline => {
                self.reconnect_at = None;
                self.state = ConnectionState::Connecting;
                true
            }
            _ => false,
        }
    }

    /// Cancels any pending reconnect. Terminal.
    pub fn dispose(&mut self) {
        self.disposed = true;
        self.reconnect_at = None;
        self.state = ConnectionState::Closed;
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn pending_reconnect(&self) -> Option<Duration> {
        self.reconnect_at
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            attempts: self.attempts,
        }
    }
}

// =============================================================================
// STREAM CLIENT
// =============================================================================

/// Handle to the stream driver task.
///
/// Decoded events arrive on the receiver returned by [`StreamClient::spawn`].
pub struct StreamClient {
    url: String,
    status: watch::Receiver<ConnectionStatus>,
    shutdown: watch::Sender<bool>,
    task: Option<TaskHandle>,
}

impl StreamClient {
    pub fn spawn<C, T>(
        ctx: Arc<C>,
        transport: Arc<T>,
        config: &VisualizerConfig,
    ) -> (Self, mpsc::Receiver<StreamEvent>)
    where
        C: ViewerContext,
        T: StreamTransport,
    {
        let machine = ConnectionMachine::new(config.reconnect_delay());
        let (status_tx, status_rx) = watch::channel(machine.status());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));

        let driver = Driver {
            ctx: Arc::clone(&ctx),
            transport,
            url: config.stream_url.clone(),
            machine,
            events: events_tx,
            status: status_tx,
            shutdown: shutdown_rx,
        };
        let task = ctx.spawn("stream-driver", driver.run());

        tracing::info!(url = %config.stream_url, "stream client started");
        let client = Self {
            url: config.stream_url.clone(),
            status: status_rx,
            shutdown: shutdown_tx,
            task: Some(task),
        };
        (client, events_rx)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_disposed(&self) -> bool {
        self.task.is_none()
    }

    /// Stops the driver and cancels a pending reconnect. Idempotent.
    ///
    /// The driver observes the signal at its next await point, closes the
    /// socket and publishes a final `Closed` status.
    pub fn dispose(&mut self) {
        if self.task.take().is_none() {
            return;
        }
        self.shutdown.send_replace(true);
        tracing::info!(url = %self.url, "stream client disposed");
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            self.shutdown.send_replace(true);
            task.abort();
        }
    }
}

enum PumpExit {
    Closed,
    Shutdown,
}

struct Driver<C, T> {
    ctx: Arc<C>,
    transport: Arc<T>,
    url: String,
    machine: ConnectionMachine,
    events: mpsc::Sender<StreamEvent>,
    status: watch::Sender<ConnectionStatus>,
    shutdown: watch::Receiver<bool>,
}

impl<C: ViewerContext, T: StreamTransport> Driver<C, T> {
    async fn run(mut self) {
        loop {
            self.publish();

            let connected = tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                result = self.transport.connect(&self.url) => result,
            };

            match connected {
                Ok(mut conn) => {
                    self.machine.on_open();
                    self.publish();
                    tracing::info!(peer = conn.peer(), "stream connected");

                    let exit = self.pump(conn.as_mut()).await;
                    conn.close().await;
                    if let PumpExit::Shutdown = exit {
                        break;
                    }
                    tracing::warn!(peer = conn.peer(), "stream closed unexpectedly");
                }
                Err(e) => tracing::warn!(url = %self.url, "stream connect failed: {e}"),
            }

            let Some(deadline) = self.machine.on_closed(self.ctx.now()) else {
                break;
            };
            self.publish();
            tracing::info!(
                attempts = self.machine.attempts(),
                delay_ms = deadline.saturating_sub(self.ctx.now()).as_millis() as u64,
                "reconnect scheduled"
            );

            if !self.wait_until(deadline).await {
                break;
            }
        }

        self.machine.dispose();
        self.publish();
        tracing::debug!(url = %self.url, "stream driver stopped");
    }

    /// Forwards decoded frames until the connection ends or shutdown.
    async fn pump(&mut self, conn: &mut dyn StreamConnection) -> PumpExit {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.changed() => return PumpExit::Shutdown,
                next = conn.recv() => next,
            };

            let frame = match next {
                None => return PumpExit::Closed,
                Some(Err(e)) => {
                    tracing::warn!(peer = conn.peer(), "socket error: {e}");
                    continue;
                }
                Some(Ok(frame)) => frame,
            };

            match decode_frame(&frame) {
                Ok(Some(event)) => {
                    let sent = tokio::select! {
                        biased;
                        _ = self.shutdown.changed() => return PumpExit::Shutdown,
                        sent = self.events.send(event) => sent,
                    };
                    if sent.is_err() {
                        tracing::debug!("event receiver dropped");
                        return PumpExit::Shutdown;
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(bytes = frame.size(), "dropping frame: {e}"),
            }
        }
    }

    /// Sleeps until the reconnect is due. False if shut down first.
    async fn wait_until(&mut self, deadline: Duration) -> bool {
        loop {
            let remaining = deadline.saturating_sub(self.ctx.now());
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => return false,
                _ = self.ctx.sleep(remaining) => {}
            }
            if self.machine.on_reconnect_due(self.ctx.now()) {
                return true;
            }
        }
    }

    fn publish(&self) {
        self.status.send_replace(self.machine.status());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::encode_brake;
    use async_trait::async_trait;
    use safeview_env::{EnvError, InboundFrame, TokioContext};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    const DELAY: Duration = Duration::from_secs(10);

    type Script = mpsc::UnboundedSender<Result<InboundFrame, EnvError>>;

    /// Transport whose connections are fed by the test.
    #[derive(Default)]
    struct ScriptedTransport {
        pending: Mutex<VecDeque<mpsc::UnboundedReceiver<Result<InboundFrame, EnvError>>>>,
        attempts: Mutex<Vec<Instant>>,
    }

    impl ScriptedTransport {
        /// Queues a connection for the next connect call.
        fn accept_next(&self) -> Script {
            let (tx, rx) = mpsc::unbounded_channel();
            self.pending.lock().unwrap().push_back(rx);
            tx
        }

        fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }
    }

    struct ScriptedConnection {
        frames: mpsc::UnboundedReceiver<Result<InboundFrame, EnvError>>,
    }

    #[async_trait]
    impl StreamTransport for ScriptedTransport {
        async fn connect(&self, url: &str) -> Result<Box<dyn StreamConnection>, EnvError> {
            self.attempts.lock().unwrap().push(Instant::now());
            match self.pending.lock().unwrap().pop_front() {
                Some(frames) => Ok(Box::new(ScriptedConnection { frames })),
                None => Err(EnvError::connect_failed(url, "refused")),
            }
        }
    }

    #[async_trait]
    impl StreamConnection for ScriptedConnection {
        async fn recv(&mut self) -> Option<Result<InboundFrame, EnvError>> {
            self.frames.recv().await
        }

        async fn close(&mut self) {
            self.frames.close();
        }

        fn peer(&self) -> &str {
            "scripted"
        }
    }

    fn config() -> VisualizerConfig {
        VisualizerConfig::default()
            .with_stream_url("ws://test/ws")
            .with_reconnect_delay(DELAY)
    }

    async fn wait_for_state(client: &StreamClient, state: ConnectionState) -> ConnectionStatus {
        let mut rx = client.subscribe_status();
        let status = *rx.wait_for(|s| s.state == state).await.unwrap();
        status
    }

    #[test]
    fn test_machine_open_resets_attempts() {
        let mut machine = ConnectionMachine::new(DELAY);
        assert_eq!(machine.state(), ConnectionState::Connecting);

        let deadline = machine.on_closed(Duration::from_secs(3)).unwrap();
        assert_eq!(deadline, Duration::from_secs(13));
        assert_eq!(machine.attempts(), 1);

        assert!(!machine.on_reconnect_due(Duration::from_secs(12)));
        assert!(machine.on_reconnect_due(Duration::from_secs(13)));
        assert_eq!(machine.state(), ConnectionState::Connecting);

        machine.on_closed(Duration::from_secs(14));
        assert_eq!(machine.attempts(), 2);

        machine.on_reconnect_due(Duration::from_secs(24));
        machine.on_open();
        assert_eq!(machine.status(), ConnectionStatus {
            state: ConnectionState::Open,
            attempts: 0,
        });
    }

    #[test]
    fn test_machine_single_pending_reconnect() {
        let mut machine = ConnectionMachine::new(DELAY);
        let first = machine.on_closed(Duration::ZERO);
        let second = machine.on_closed(Duration::from_secs(5));
        assert_eq!(first, second);
        assert_eq!(machine.attempts(), 1);
    }

    #[test]
    fn test_machine_dispose_cancels() {
        let mut machine = ConnectionMachine::new(DELAY);
        machine.on_closed(Duration::ZERO);
        machine.dispose();
        assert!(machine.pending_reconnect().is_none());
        assert!(!machine.on_reconnect_due(Duration::from_secs(100)));
        assert!(machine.on_closed(Duration::from_secs(100)).is_none());

        machine.on_open();
        assert_eq!(machine.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frames_do_not_close() {
        let transport = Arc::new(ScriptedTransport::default());
        let script = transport.accept_next();
        let (mut client, mut events) = StreamClient::spawn(TokioContext::shared(), Arc::clone(&transport), &config());

        script.send(Ok(InboundFrame::Text("{not json".into()))).unwrap();
        script.send(Ok(InboundFrame::Text(r#"{"type":"scan_update","data":{"ranges":"x"}}"#.into()))).unwrap();
        script.send(Err(EnvError::network("reset by peer"))).unwrap();
        script.send(Ok(InboundFrame::Text(r#"{"type":"battery","data":1}"#.into()))).unwrap();
        script
            .send(Ok(InboundFrame::Text(
                r#"{"type":"scan_update","data":{"ranges":[1.0],"angle_min":0,"angle_increment":0}}"#.into(),
            )))
            .unwrap();
        script.send(Ok(InboundFrame::Binary(br#"{"type":"brake_update","data":"true"}"#.to_vec()))).unwrap();

        assert!(matches!(events.recv().await, Some(StreamEvent::Scan(_))));
        assert_eq!(events.recv().await, Some(StreamEvent::Brake(true)));

        let status = client.status();
        assert_eq!(status.state, ConnectionState::Open);
        assert_eq!(transport.attempts().len(), 1);
        client.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_schedules_one_reconnect_after_delay() {
        let transport = Arc::new(ScriptedTransport::default());
        let first = transport.accept_next();
        let _second = transport.accept_next();
        let (mut client, _events) = StreamClient::spawn(TokioContext::shared(), Arc::clone(&transport), &config());

        wait_for_state(&client, ConnectionState::Open).await;
        drop(first);

        let closed = wait_for_state(&client, ConnectionState::Closed).await;
        assert_eq!(closed.attempts, 1);

        tokio::time::sleep(DELAY - Duration::from_secs(1)).await;
        assert_eq!(transport.attempts().len(), 1, "no reconnect before the delay");

        let reopened = wait_for_state(&client, ConnectionState::Open).await;
        assert_eq!(reopened.attempts, 0);

        let attempts = transport.attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1] - attempts[0], DELAY);
        client.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connects_keep_fixed_delay() {
        let transport = Arc::new(ScriptedTransport::default());
        let (mut client, _events) = StreamClient::spawn(TokioContext::shared(), Arc::clone(&transport), &config());

        let mut rx = client.subscribe_status();
        rx.wait_for(|s| s.attempts == 3).await.unwrap();

        let attempts = transport.attempts();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[1] - attempts[0], DELAY);
        assert_eq!(attempts[2] - attempts[1], DELAY);
        client.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_cancels_pending_reconnect() {
        let transport = Arc::new(ScriptedTransport::default());
        let first = transport.accept_next();
        let _never_used = transport.accept_next();
        let (mut client, mut events) = StreamClient::spawn(TokioContext::shared(), Arc::clone(&transport), &config());

        wait_for_state(&client, ConnectionState::Open).await;
        drop(first);
        wait_for_state(&client, ConnectionState::Closed).await;

        client.dispose();
        client.dispose();
        assert!(client.is_disposed());

        tokio::time::sleep(DELAY * 6).await;
        assert_eq!(transport.attempts().len(), 1);
        assert_eq!(client.status().state, ConnectionState::Closed);

        // driver is gone, so the event channel is closed
        assert!(events.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_while_open_closes_socket() {
        let transport = Arc::new(ScriptedTransport::default());
        let script = transport.accept_next();
        let (mut client, mut events) = StreamClient::spawn(TokioContext::shared(), Arc::clone(&transport), &config());

        wait_for_state(&client, ConnectionState::Open).await;
        client.dispose();
        assert!(events.recv().await.is_none());
        assert!(script.is_closed());
        assert_eq!(transport.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_with_full_event_buffer() {
        let transport = Arc::new(ScriptedTransport::default());
        let script = transport.accept_next();
        let config = VisualizerConfig {
            event_buffer: 4,
            ..config()
        };
        let (mut client, _events) = StreamClient::spawn(TokioContext::shared(), Arc::clone(&transport), &config);

        wait_for_state(&client, ConnectionState::Open).await;
        for _ in 0..10 {
            script.send(Ok(InboundFrame::Text(encode_brake(true)))).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        // receiver held but never read, driver blocked on a full buffer
        client.dispose();
        let closed = wait_for_state(&client, ConnectionState::Closed).await;
        assert_eq!(closed.attempts, 0);
        assert!(script.is_closed());
        assert_eq!(transport.attempts().len(), 1);
    }
}
