//! Live-socket transport abstraction.

use crate::error::EnvError;
use crate::types::InboundFrame;
use async_trait::async_trait;

/// Opens connections to the robot's stream endpoint.
///
/// # Implementations
///
/// - **Production**: `WebSocketTransport` (tokio-tungstenite)
/// - **Simulation**: `SimTransport` with scripted frames and injected faults
///
/// # Connection Flow
///
/// ```text
/// StreamClient               Transport                 Robot
///   |-- connect(url) --------->|-- handshake ------------>|
///   |<-- Box<dyn Connection> --|                          |
///   |-- recv() --------------->|<-------- text frame -----|
///   |<-- Some(Ok(frame)) ------|                          |
///   |-- recv() --------------->|<-------- close ----------|
///   |<-- None -----------------|                          |
/// ```
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    /// Opens a new connection.
    ///
    /// # Returns
    /// * `Ok(conn)` - The connection is open
    /// * `Err(EnvError::ConnectFailed)` - Handshake failed; treated as a close
    async fn connect(&self, url: &str) -> Result<Box<dyn StreamConnection>, EnvError>;
}

/// One open connection.
#[async_trait]
pub trait StreamConnection: Send {
    /// Receives the next data frame.
    ///
    /// # Returns
    /// * `Some(Ok(frame))` - A data frame arrived
    /// * `Some(Err(e))` - A socket error event; the connection stays up
    ///   until `None` is returned
    /// * `None` - The connection closed
    async fn recv(&mut self) -> Option<Result<InboundFrame, EnvError>>;

    /// Closes the connection from our side. Safe to call more than once.
    async fn close(&mut self);

    /// Human-readable peer description for logs.
    fn peer(&self) -> &str;
}
